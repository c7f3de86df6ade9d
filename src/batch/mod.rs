//! Batch execution - scheduling, retry, events and cancellation
//!
//! The scheduler fans one command out over a host list with bounded
//! parallelism; the retry layer re-queues transient failures; events
//! stream per-host outcomes and progress to the consumer while the run is
//! in flight.

pub mod cancel;
pub mod classify;
pub mod events;
pub mod retry;
pub mod scheduler;
pub mod types;

pub use cancel::CancellationToken;
pub use classify::{classify, classify_message, ErrorDescriptor, ErrorKind};
pub use events::{
    channel, BatchEvent, EventReceiver, EventSender, EVENT_BATCH_PROGRESS, EVENT_BATCH_RESULT,
};
pub use types::{
    BatchOutcome, BatchRequest, CommandResult, HostEntry, ProgressRecord, VEHICLE_ID_KEY,
};
