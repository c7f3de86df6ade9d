//! Batch-level host retry
//!
//! Composes scheduler rounds: after a round returns, hosts whose latest
//! failure is classified retryable are re-submitted as a fresh round until
//! none remain, the per-host re-submission cap is reached, or cancellation
//! fires. Each round works on a filtered copy of the host list; this module
//! owns the accumulated outcome per host, and the latest outcome always
//! wins.
//!
//! The connection-level reconnects inside a session are a separate layer;
//! the two compose.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::audit::AuditSink;
use crate::ssh::client::SessionRunner;
use crate::validate::CommandValidator;

use super::cancel::CancellationToken;
use super::events::EventPublisher;
use super::scheduler::{run_round, RoundParams};
use super::types::{BatchOutcome, BatchRequest, HostEntry};

/// Collaborators threaded through every round of a batch.
pub(crate) struct BatchDeps {
    pub runner: Arc<dyn SessionRunner>,
    pub validator: Arc<dyn CommandValidator>,
    pub audit: Arc<dyn AuditSink>,
}

/// Run the full batch: one round over every host, then retry rounds over
/// the retryable subset while the request allows.
///
/// The returned vector is keyed by host index in the original request.
pub(crate) async fn run_with_retries(
    request: &BatchRequest,
    deps: &BatchDeps,
    events: EventPublisher,
    cancel: CancellationToken,
) -> Vec<BatchOutcome> {
    let total = request.hosts.len();
    let params = Arc::new(RoundParams {
        command: request.command.clone(),
        template: request.config_template.clone(),
        skip_validation: request.skip_validation,
        max_concurrent: request.max_concurrent,
    });

    let mut slots: Vec<Option<BatchOutcome>> = vec![None; total];
    let first_round: Vec<(usize, HostEntry)> =
        request.hosts.iter().cloned().enumerate().collect();

    for (index, outcome) in run_round(
        first_round,
        params.clone(),
        deps.runner.clone(),
        deps.validator.clone(),
        deps.audit.clone(),
        events.clone(),
        cancel.clone(),
    )
    .await
    {
        slots[index] = Some(outcome);
    }

    if request.retry_failed_hosts {
        if request.retry_max_attempts == 0 {
            warn!(
                "retry_failed_hosts is on with an unbounded attempt cap; \
                 retryable hosts will be re-queued until cancelled"
            );
        }

        let mut resubmissions = vec![0u32; total];
        let mut round_number = 0u32;

        loop {
            if cancel.is_tripped() {
                break;
            }

            let pending: Vec<(usize, HostEntry)> = slots
                .iter()
                .enumerate()
                .filter(|(index, outcome)| {
                    outcome
                        .as_ref()
                        .map(BatchOutcome::is_retryable)
                        .unwrap_or(false)
                        && (request.retry_max_attempts == 0
                            || resubmissions[*index] < request.retry_max_attempts)
                })
                .map(|(index, _)| (index, request.hosts[index].clone()))
                .collect();

            if pending.is_empty() {
                break;
            }

            round_number += 1;
            info!(
                "retry round {}: re-queueing {} of {} hosts",
                round_number,
                pending.len(),
                total
            );
            deps.audit.record(
                "INFO",
                "batch_retry",
                &format!(
                    "Retry round {} for {} hosts",
                    round_number,
                    pending.len()
                ),
                None,
            );

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(request.retry_interval)) => {}
            }
            if cancel.is_tripped() {
                break;
            }

            for (index, _) in &pending {
                resubmissions[*index] += 1;
            }

            for (index, outcome) in run_round(
                pending,
                params.clone(),
                deps.runner.clone(),
                deps.validator.clone(),
                deps.audit.clone(),
                events.clone(),
                cancel.clone(),
            )
            .await
            {
                slots[index] = Some(outcome);
            }
        }
    }

    slots
        .into_iter()
        .map(|outcome| outcome.expect("first round produces an outcome for every host"))
        .collect()
}
