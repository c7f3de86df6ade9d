//! Batch scheduler
//!
//! Bounded-parallelism dispatcher for one attempt round. A fixed pool of
//! `max_concurrent` worker tasks pulls hosts off a shared queue in input
//! order; a single pump task assigns the monotonic progress counter and
//! forwards result/progress events while collecting the outcomes.
//!
//! Completion order is whatever the network gives; callers correlate by
//! the host index carried next to every outcome. A panic inside one host's
//! execution is converted to an `Unknown` failure for that host and never
//! aborts the round. Once the shared token trips, queued hosts drain as
//! `Cancelled` outcomes so the round still accounts for every host.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::audit::AuditSink;
use crate::ssh::client::SessionRunner;
use crate::ssh::config::SessionConfig;
use crate::validate::CommandValidator;

use super::cancel::CancellationToken;
use super::classify::{classify, ErrorDescriptor, ErrorKind};
use super::events::{BatchEvent, EventPublisher};
use super::types::{BatchOutcome, CommandResult, HostEntry, ProgressRecord};

/// Immutable inputs shared by every worker in a round.
pub(crate) struct RoundParams {
    pub command: String,
    pub template: SessionConfig,
    pub skip_validation: bool,
    pub max_concurrent: usize,
}

/// Run one attempt round over `hosts`.
///
/// Each element carries the host's index in the original request, which is
/// preserved next to its outcome so callers can reassemble input order.
pub(crate) async fn run_round(
    hosts: Vec<(usize, HostEntry)>,
    params: Arc<RoundParams>,
    runner: Arc<dyn SessionRunner>,
    validator: Arc<dyn CommandValidator>,
    audit: Arc<dyn AuditSink>,
    events: EventPublisher,
    cancel: CancellationToken,
) -> Vec<(usize, BatchOutcome)> {
    let total = hosts.len();
    if total == 0 {
        return Vec::new();
    }

    let workers = params.max_concurrent.min(total).max(1);
    debug!("dispatching {} hosts across {} workers", total, workers);

    let queue = Arc::new(Mutex::new(
        hosts.into_iter().collect::<VecDeque<(usize, HostEntry)>>(),
    ));
    let (tx, mut rx) = mpsc::channel::<(usize, BatchOutcome)>(workers);

    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let queue = queue.clone();
        let tx = tx.clone();
        let params = params.clone();
        let runner = runner.clone();
        let validator = validator.clone();
        let cancel = cancel.clone();

        handles.push(tokio::spawn(async move {
            loop {
                let next = queue.lock().pop_front();
                let Some((index, host)) = next else { break };

                let outcome = if cancel.is_tripped() {
                    // Never started; still accounted for at drain
                    BatchOutcome::cancelled(&host.ip)
                } else {
                    run_host_contained(
                        params.clone(),
                        runner.clone(),
                        validator.clone(),
                        cancel.clone(),
                        host,
                    )
                    .await
                };

                if tx.send((index, outcome)).await.is_err() {
                    break;
                }
            }
        }));
    }
    drop(tx);

    // Pump: the single place where the progress counter advances, which is
    // what keeps it strictly monotonic across parallel producers.
    let mut outcomes = Vec::with_capacity(total);
    let mut completed = 0usize;
    while let Some((index, outcome)) = rx.recv().await {
        completed += 1;
        audit_host_completion(audit.as_ref(), &outcome);
        events.publish(BatchEvent::Result(outcome.clone())).await;
        events
            .publish(BatchEvent::Progress(ProgressRecord {
                completed,
                total,
                host: outcome.host.clone(),
            }))
            .await;
        outcomes.push((index, outcome));
    }

    for handle in handles {
        let _ = handle.await;
    }

    outcomes
}

/// Execute one host with panic containment.
async fn run_host_contained(
    params: Arc<RoundParams>,
    runner: Arc<dyn SessionRunner>,
    validator: Arc<dyn CommandValidator>,
    cancel: CancellationToken,
    host: HostEntry,
) -> BatchOutcome {
    let ip = host.ip.clone();
    let task = tokio::spawn(execute_host(params, runner, validator, cancel, host));
    match task.await {
        Ok(outcome) => outcome,
        Err(join_err) => {
            error!("host task for {} aborted: {}", ip, join_err);
            BatchOutcome::failure(
                &ip,
                ErrorDescriptor::new(
                    ErrorKind::Unknown,
                    format!("Worker failed unexpectedly: {}", join_err),
                ),
            )
        }
    }
}

async fn execute_host(
    params: Arc<RoundParams>,
    runner: Arc<dyn SessionRunner>,
    validator: Arc<dyn CommandValidator>,
    cancel: CancellationToken,
    host: HostEntry,
) -> BatchOutcome {
    if !params.skip_validation {
        if let Err(reason) = validator.validate(&params.command) {
            return BatchOutcome::failure(
                &host.ip,
                ErrorDescriptor::new(
                    ErrorKind::CommandValidation,
                    format!("Command rejected: {}", reason),
                ),
            );
        }
    }

    let config = params.template.for_host(&host);
    match runner.run(&config, &params.command, &cancel).await {
        Ok(raw) => BatchOutcome::success(CommandResult {
            host: host.ip.clone(),
            stdout: String::from_utf8_lossy(&raw.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&raw.stderr).into_owned(),
            exit_status: raw.exit_status,
            vehicle_id: host.vehicle_id().map(str::to_string),
            timestamp: Utc::now().to_rfc3339(),
        }),
        Err(err) => {
            // A failure observed after the token tripped is reported as
            // cancellation, whatever the session was doing at the time
            if cancel.is_tripped() {
                BatchOutcome::cancelled(&host.ip)
            } else {
                BatchOutcome::failure(&host.ip, classify(&err))
            }
        }
    }
}

fn audit_host_completion(audit: &dyn AuditSink, outcome: &BatchOutcome) {
    match (&outcome.result, &outcome.error) {
        (Some(result), _) if result.exit_status == 0 => audit.record(
            "INFO",
            "batch_host_success",
            &format!("Command succeeded on {} (exit 0)", outcome.host),
            None,
        ),
        (Some(result), _) => audit.record(
            "WARN",
            "batch_host_warning",
            &format!(
                "Command finished on {} with exit code {}",
                outcome.host, result.exit_status
            ),
            None,
        ),
        (_, Some(error)) if error.kind == ErrorKind::Cancelled => audit.record(
            "INFO",
            "batch_host_cancelled",
            &format!("Execution cancelled on {}", outcome.host),
            None,
        ),
        (_, Some(error)) => audit.record(
            "ERROR",
            "batch_host_error",
            &format!("Command failed on {}: {}", outcome.host, error.message),
            None,
        ),
        _ => {}
    }
}
