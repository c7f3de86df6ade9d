//! Engine facade
//!
//! The command surface the UI shell talks to: single-host execution, batch
//! execution with pushed events, and cancellation of the active run. The
//! engine owns the collaborators (command validator, audit sink) and mints
//! one cancellation token per run; starting a new batch supersedes and
//! trips any run still holding the slot.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditSink, TracingAuditSink};
use crate::batch::cancel::CancellationToken;
use crate::batch::classify::{classify, ErrorDescriptor, ErrorKind};
use crate::batch::events::{EventPublisher, EventSender};
use crate::batch::retry::{run_with_retries, BatchDeps};
use crate::batch::types::{BatchOutcome, BatchRequest, CommandResult, MAX_CONCURRENT_LIMIT};
use crate::ssh::client::{RusshRunner, SessionRunner};
use crate::ssh::config::{ConfigError, SessionConfig};
use crate::ssh::keys::KeyCache;
use crate::validate::{sanitize_command_for_logging, CommandValidator, DenyListValidator};

/// Errors that abort a whole batch before any host is attempted.
///
/// Everything past this validation gate surfaces as per-host outcomes.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("host list is empty; load hosts before executing")]
    EmptyHostList,

    #[error("host at index {0} has an empty address")]
    EmptyHostAddress(usize),

    #[error("max_concurrent must be between 1 and {limit}, got {0}", limit = MAX_CONCURRENT_LIMIT)]
    InvalidConcurrency(usize),

    #[error("invalid session template: {0}")]
    InvalidTemplate(#[from] ConfigError),
}

/// The batch SSH execution engine.
pub struct BatchEngine {
    validator: Arc<dyn CommandValidator>,
    audit: Arc<dyn AuditSink>,
    runner_override: Option<Arc<dyn SessionRunner>>,
    active: Mutex<Option<CancellationToken>>,
}

impl BatchEngine {
    pub fn new(validator: Arc<dyn CommandValidator>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            validator,
            audit,
            runner_override: None,
            active: Mutex::new(None),
        }
    }

    /// Replace the production session layer. This is the seam batch and
    /// integration tests inject stub sessions through.
    pub fn with_session_runner(mut self, runner: Arc<dyn SessionRunner>) -> Self {
        self.runner_override = Some(runner);
        self
    }

    /// Execute one command on every host of the request.
    ///
    /// Per-host outcomes stream through `events` as they complete; the
    /// returned vector is ordered by host index in the request.
    pub async fn execute_batch_commands(
        &self,
        request: BatchRequest,
        events: EventSender,
    ) -> Result<Vec<BatchOutcome>, EngineError> {
        validate_request(&request)?;

        let batch_id = Uuid::new_v4();
        let started = Instant::now();
        let sanitized_command = sanitize_command_for_logging(&request.command);

        info!(
            "batch {}: executing on {} hosts ({} concurrent max)",
            batch_id,
            request.hosts.len(),
            request.max_concurrent
        );
        self.audit.record(
            "INFO",
            "batch_start",
            &format!(
                "Batch {} started on {} hosts. Command: {}",
                batch_id,
                request.hosts.len(),
                sanitized_command
            ),
            None,
        );

        let cancel = self.begin_run();
        let runner = self.runner();
        let deps = BatchDeps {
            runner,
            validator: self.validator.clone(),
            audit: self.audit.clone(),
        };

        let outcomes =
            run_with_retries(&request, &deps, EventPublisher::new(events), cancel.clone()).await;

        self.end_run(&cancel);

        let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
        let failed = outcomes.len() - succeeded;
        let duration = started.elapsed();
        info!(
            "batch {}: finished, {} succeeded, {} failed in {:.2}s",
            batch_id,
            succeeded,
            failed,
            duration.as_secs_f64()
        );
        self.audit.record(
            "INFO",
            if cancel.is_tripped() {
                "batch_cancelled"
            } else {
                "batch_complete"
            },
            &format!(
                "Batch {} finished: {} succeeded, {} failed out of {}",
                batch_id,
                succeeded,
                failed,
                outcomes.len()
            ),
            None,
        );

        Ok(outcomes)
    }

    /// Execute one command on a single, fully specified target.
    pub async fn execute_ssh_command(
        &self,
        config: SessionConfig,
        command: &str,
        skip_validation: bool,
    ) -> Result<CommandResult, ErrorDescriptor> {
        if let Err(err) = config.validate() {
            return Err(config_error_descriptor(err));
        }
        if !skip_validation {
            if let Err(reason) = self.validator.validate(command) {
                return Err(ErrorDescriptor::new(
                    ErrorKind::CommandValidation,
                    format!("Command rejected: {}", reason),
                ));
            }
        }

        self.audit.record(
            "INFO",
            "execute_command",
            &format!(
                "Executing on {}: {}",
                config.host,
                sanitize_command_for_logging(command)
            ),
            None,
        );

        let cancel = self.begin_run();
        let runner = self.runner();
        let host = config.host.clone();

        let outcome = match runner.run(&config, command, &cancel).await {
            Ok(raw) => Ok(CommandResult {
                host,
                stdout: String::from_utf8_lossy(&raw.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&raw.stderr).into_owned(),
                exit_status: raw.exit_status,
                vehicle_id: None,
                timestamp: Utc::now().to_rfc3339(),
            }),
            Err(err) => {
                if cancel.is_tripped() {
                    Err(ErrorDescriptor::cancelled())
                } else {
                    Err(classify(&err))
                }
            }
        };

        self.end_run(&cancel);
        outcome
    }

    /// Probe connectivity and authentication for one target.
    pub async fn test_ssh_connection(
        &self,
        config: SessionConfig,
    ) -> Result<CommandResult, ErrorDescriptor> {
        self.audit.record(
            "INFO",
            "test_connection",
            &format!("Connection test for {}", config.host),
            None,
        );
        // The probe command is our own; it bypasses the validator
        self.execute_ssh_command(config, "echo 'Connection test successful'", true)
            .await
    }

    /// Trip the active run's cancellation token. Idempotent; a no-op when
    /// nothing is running.
    pub fn cancel_command_execution(&self) {
        if let Some(token) = self.active.lock().as_ref() {
            token.trip();
            self.audit.record(
                "INFO",
                "cancel_command",
                "Execution cancelled by operator",
                None,
            );
        } else {
            warn!("cancel requested with no active run");
        }
    }

    fn runner(&self) -> Arc<dyn SessionRunner> {
        self.runner_override
            .clone()
            .unwrap_or_else(|| Arc::new(RusshRunner::new(Arc::new(KeyCache::new()))))
    }

    fn begin_run(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self.active.lock().replace(token.clone()) {
            // A newer run supersedes any run still holding the slot
            previous.trip();
        }
        token
    }

    fn end_run(&self, token: &CancellationToken) {
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|current| current.same_token(token)) {
            *active = None;
        }
    }
}

impl Default for BatchEngine {
    fn default() -> Self {
        Self::new(Arc::new(DenyListValidator), Arc::new(TracingAuditSink))
    }
}

fn validate_request(request: &BatchRequest) -> Result<(), EngineError> {
    if request.hosts.is_empty() {
        return Err(EngineError::EmptyHostList);
    }
    if let Some(index) = request
        .hosts
        .iter()
        .position(|host| host.ip.trim().is_empty())
    {
        return Err(EngineError::EmptyHostAddress(index));
    }
    if request.max_concurrent == 0 || request.max_concurrent > MAX_CONCURRENT_LIMIT {
        return Err(EngineError::InvalidConcurrency(request.max_concurrent));
    }
    request.config_template.validate_template()?;
    Ok(())
}

fn config_error_descriptor(err: ConfigError) -> ErrorDescriptor {
    let kind = match err {
        ConfigError::EmptyKeyPath => ErrorKind::KeyMaterial,
        ConfigError::EmptyPassword => ErrorKind::AuthDenied,
        _ => ErrorKind::CommandValidation,
    };
    ErrorDescriptor::new(kind, format!("Invalid session configuration: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditRecord;
    use crate::batch::events::{self, BatchEvent};
    use crate::batch::types::HostEntry;
    use crate::ssh::client::RawOutput;
    use crate::ssh::config::{template_with_auth, AuthMethod};
    use crate::ssh::error::SshError;
    use crate::validate::AcceptAllValidator;
    use async_trait::async_trait;
    use std::time::Duration;

    struct SleepyRunner {
        delay: Duration,
    }

    #[async_trait]
    impl SessionRunner for SleepyRunner {
        async fn run(
            &self,
            _config: &SessionConfig,
            _command: &str,
            cancel: &CancellationToken,
        ) -> Result<RawOutput, SshError> {
            tokio::select! {
                _ = cancel.cancelled() => Err(SshError::Cancelled),
                _ = tokio::time::sleep(self.delay) => Ok(RawOutput {
                    stdout: b"hi\n".to_vec(),
                    stderr: Vec::new(),
                    exit_status: 0,
                }),
            }
        }
    }

    struct RecordingSink(parking_lot::Mutex<Vec<AuditRecord>>);

    impl crate::audit::AuditSink for RecordingSink {
        fn record(&self, level: &str, action: &str, details: &str, user: Option<&str>) {
            self.0.lock().push(AuditRecord {
                timestamp: Utc::now().to_rfc3339(),
                level: level.to_string(),
                action: action.to_string(),
                details: details.to_string(),
                user: user.map(str::to_string),
            });
        }
    }

    fn request(count: usize, max_concurrent: usize) -> BatchRequest {
        BatchRequest {
            hosts: (0..count)
                .map(|i| HostEntry::new(format!("10.1.{}.{}", i / 256, i % 256)))
                .collect(),
            config_template: template_with_auth("root", AuthMethod::password("pw")),
            command: "echo hi".to_string(),
            max_concurrent,
            retry_failed_hosts: false,
            retry_interval: 30,
            retry_max_attempts: 0,
            skip_validation: false,
        }
    }

    fn engine_with(runner: Arc<dyn SessionRunner>) -> BatchEngine {
        BatchEngine::new(Arc::new(AcceptAllValidator), Arc::new(crate::audit::NoopAuditSink))
            .with_session_runner(runner)
    }

    #[tokio::test]
    async fn test_empty_host_list_fails_fast() {
        let engine = engine_with(Arc::new(SleepyRunner {
            delay: Duration::ZERO,
        }));
        let (tx, _rx) = events::channel();
        let err = engine
            .execute_batch_commands(request(0, 10), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::EmptyHostList));
    }

    #[tokio::test]
    async fn test_oversized_pool_fails_fast() {
        let engine = engine_with(Arc::new(SleepyRunner {
            delay: Duration::ZERO,
        }));
        let (tx, _rx) = events::channel();
        let err = engine
            .execute_batch_commands(request(3, 501), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidConcurrency(501)));
    }

    #[tokio::test]
    async fn test_bad_template_fails_fast() {
        let engine = engine_with(Arc::new(SleepyRunner {
            delay: Duration::ZERO,
        }));
        let mut bad = request(3, 10);
        bad.config_template.auth = AuthMethod::openssh_key("", None);
        let (tx, _rx) = events::channel();
        let err = engine.execute_batch_commands(bad, tx).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTemplate(ConfigError::EmptyKeyPath)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_mid_flight_accounts_for_every_host() {
        let engine = Arc::new(engine_with(Arc::new(SleepyRunner {
            delay: Duration::from_secs(10),
        })));
        let (tx, mut rx) = events::channel();

        let canceller = engine.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel_command_execution();
        });

        let collector = tokio::spawn(async move {
            let mut last_progress = None;
            let mut result_count = 0usize;
            while let Some(event) = rx.recv().await {
                match event {
                    BatchEvent::Result(_) => result_count += 1,
                    BatchEvent::Progress(p) => last_progress = Some(p),
                }
            }
            (result_count, last_progress)
        });

        let outcomes = engine
            .execute_batch_commands(request(100, 10), tx)
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 100);
        for outcome in &outcomes {
            assert_eq!(outcome.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
        }

        let (result_count, last_progress) = collector.await.unwrap();
        assert_eq!(result_count, 100);
        let last_progress = last_progress.unwrap();
        assert_eq!(last_progress.completed, 100);
        assert_eq!(last_progress.total, 100);
    }

    #[tokio::test]
    async fn test_bad_key_fails_all_hosts_with_one_parse() {
        // Production runner, nonexistent key: every host fails on the
        // cached key error without a session ever being attempted.
        let keys = Arc::new(KeyCache::new());
        let engine = BatchEngine::new(
            Arc::new(AcceptAllValidator),
            Arc::new(crate::audit::NoopAuditSink),
        )
        .with_session_runner(Arc::new(RusshRunner::new(keys.clone())));

        let mut req = request(5, 5);
        req.config_template.auth = AuthMethod::openssh_key("/does/not/exist", None);

        let (tx, _rx) = events::channel();
        let outcomes = engine.execute_batch_commands(req, tx).await.unwrap();

        assert_eq!(outcomes.len(), 5);
        let first_message = outcomes[0].error.as_ref().unwrap().message.clone();
        for outcome in &outcomes {
            let error = outcome.error.as_ref().unwrap();
            assert_eq!(error.kind, ErrorKind::KeyMaterial);
            assert_eq!(error.message, first_message);
        }
        assert_eq!(keys.parse_attempts(), 1);
    }

    #[tokio::test]
    async fn test_single_host_happy_path() {
        let engine = engine_with(Arc::new(SleepyRunner {
            delay: Duration::ZERO,
        }));
        let mut config = template_with_auth("root", AuthMethod::password("pw"));
        config.host = "10.0.0.1".to_string();

        let result = engine
            .execute_ssh_command(config, "echo hi", false)
            .await
            .unwrap();
        assert_eq!(result.host, "10.0.0.1");
        assert_eq!(result.stdout, "hi\n");
        assert_eq!(result.exit_status, 0);
    }

    #[tokio::test]
    async fn test_single_host_validation_rejection() {
        let engine = BatchEngine::new(
            Arc::new(DenyListValidator),
            Arc::new(crate::audit::NoopAuditSink),
        )
        .with_session_runner(Arc::new(SleepyRunner {
            delay: Duration::ZERO,
        }));
        let mut config = template_with_auth("root", AuthMethod::password("pw"));
        config.host = "10.0.0.1".to_string();

        let err = engine
            .execute_ssh_command(config, "ls; rm -rf /", false)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::CommandValidation);
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn test_audit_records_cover_batch_lifecycle() {
        let sink = Arc::new(RecordingSink(parking_lot::Mutex::new(Vec::new())));
        let engine = BatchEngine::new(Arc::new(AcceptAllValidator), sink.clone())
            .with_session_runner(Arc::new(SleepyRunner {
                delay: Duration::ZERO,
            }));

        let (tx, _rx) = events::channel();
        engine
            .execute_batch_commands(request(2, 2), tx)
            .await
            .unwrap();

        let records = sink.0.lock();
        assert!(records.iter().any(|r| r.action == "batch_start"));
        assert_eq!(
            records
                .iter()
                .filter(|r| r.action == "batch_host_success")
                .count(),
            2
        );
        assert!(records.iter().any(|r| r.action == "batch_complete"));
    }

    #[tokio::test]
    async fn test_audit_never_sees_secrets() {
        let sink = Arc::new(RecordingSink(parking_lot::Mutex::new(Vec::new())));
        let engine = BatchEngine::new(Arc::new(AcceptAllValidator), sink.clone())
            .with_session_runner(Arc::new(SleepyRunner {
                delay: Duration::ZERO,
            }));

        let mut req = request(1, 1);
        req.config_template.auth = AuthMethod::password("hunter2-secret");
        req.command = "connect password=hunter2-secret".to_string();

        let (tx, _rx) = events::channel();
        engine.execute_batch_commands(req, tx).await.unwrap();

        for record in sink.0.lock().iter() {
            assert!(
                !record.details.contains("hunter2-secret"),
                "secret leaked into audit record: {}",
                record.details
            );
        }
    }
}
