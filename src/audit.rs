//! Audit sink contract
//!
//! The engine emits one record per batch start, one per host completion and
//! one per batch end. Where those records go (file, database, nothing) is
//! the embedding application's business; the sink is fire-and-forget and a
//! failing sink must never slow a batch down, so the trait is synchronous
//! and infallible.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// One audit record as the UI presents it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: String,
    pub level: String,
    pub action: String,
    pub details: String,
    pub user: Option<String>,
}

/// Destination for engine audit records.
pub trait AuditSink: Send + Sync {
    fn record(&self, level: &str, action: &str, details: &str, user: Option<&str>);
}

/// Sink that forwards records to the `tracing` subscriber at the matching
/// level. The default when the embedding application has no audit store.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, level: &str, action: &str, details: &str, user: Option<&str>) {
        let user = user.unwrap_or("-");
        match level {
            "ERROR" => error!(action, user, "{}", details),
            "WARN" => warn!(action, user, "{}", details),
            "DEBUG" => debug!(action, user, "{}", details),
            _ => info!(action, user, "{}", details),
        }
    }
}

/// Sink that drops everything.
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn record(&self, _level: &str, _action: &str, _details: &str, _user: Option<&str>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// In-memory sink for asserting on emitted records.
    pub(crate) struct RecordingSink(pub Mutex<Vec<AuditRecord>>);

    impl RecordingSink {
        pub fn new() -> Self {
            Self(Mutex::new(Vec::new()))
        }
    }

    impl AuditSink for RecordingSink {
        fn record(&self, level: &str, action: &str, details: &str, user: Option<&str>) {
            self.0.lock().push(AuditRecord {
                timestamp: chrono::Utc::now().to_rfc3339(),
                level: level.to_string(),
                action: action.to_string(),
                details: details.to_string(),
                user: user.map(str::to_string),
            });
        }
    }

    #[test]
    fn test_recording_sink_captures_fields() {
        let sink = RecordingSink::new();
        sink.record("INFO", "batch_start", "3 hosts", None);
        let records = sink.0.lock();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, "batch_start");
        assert_eq!(records[0].user, None);
    }

    #[test]
    fn test_tracing_sink_never_panics() {
        let sink = TracingAuditSink;
        sink.record("ERROR", "a", "b", Some("op"));
        sink.record("WARN", "a", "b", None);
        sink.record("UNKNOWN", "a", "b", None);
    }
}
