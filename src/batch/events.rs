//! Batch event channel
//!
//! Workers publish per-host results and progress through a bounded
//! multi-producer pipe; the single consumer is the UI layer. A consumer
//! that has gone away (window closed mid-run) is not an error: once a send
//! fails, further events are discarded silently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use super::types::{BatchOutcome, ProgressRecord};

/// UI event name for per-host outcomes.
pub const EVENT_BATCH_RESULT: &str = "batch-result";
/// UI event name for progress counter updates.
pub const EVENT_BATCH_PROGRESS: &str = "batch-progress";

/// Default capacity for [`channel`]. Small enough that a stalled consumer
/// throttles the workers instead of buffering a whole fleet's output.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchEvent {
    Result(BatchOutcome),
    Progress(ProgressRecord),
}

pub type EventSender = mpsc::Sender<BatchEvent>;
pub type EventReceiver = mpsc::Receiver<BatchEvent>;

/// Create an event pipe with the default capacity.
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::channel(DEFAULT_EVENT_CAPACITY)
}

/// Sending half used inside the scheduler.
///
/// Wraps the raw sender with the discard-on-closed behavior so workers
/// never treat a dropped consumer as a failure.
#[derive(Clone)]
pub(crate) struct EventPublisher {
    tx: EventSender,
    closed: Arc<AtomicBool>,
}

impl EventPublisher {
    pub fn new(tx: EventSender) -> Self {
        Self {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Deliver one event, blocking on a full pipe (backpressure) and
    /// silently dropping everything once the consumer is gone.
    pub async fn publish(&self, event: BatchEvent) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        if self.tx.send(event).await.is_err() {
            debug!("event consumer dropped, discarding further batch events");
            self.closed.store(true, Ordering::Relaxed);
        }
    }
}
