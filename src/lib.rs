//! sshfleet - batch SSH command execution for fleet administration
//!
//! Connects to many remote Unix hosts in parallel, runs one shell command
//! per host over a fresh SSH session, and streams per-host results and
//! progress back to the embedding application. Password, OpenSSH-key and
//! PuTTY-PPK authentication are supported; transient failures are retried
//! with exponential backoff at the connection level and re-queued at the
//! batch level; the whole run is cooperatively cancellable.
//!
//! The entry point is [`BatchEngine`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use sshfleet::{AuthMethod, BatchEngine, BatchRequest, HostEntry, SessionConfig};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = BatchEngine::default();
//! let (events, mut rx) = sshfleet::batch::channel();
//!
//! let request = BatchRequest {
//!     hosts: vec![HostEntry::new("10.0.0.1"), HostEntry::new("10.0.0.2")],
//!     config_template: SessionConfig {
//!         username: "admin".into(),
//!         auth: AuthMethod::password("swordfish"),
//!         ..Default::default()
//!     },
//!     command: "uptime".into(),
//!     max_concurrent: 50,
//!     retry_failed_hosts: true,
//!     retry_interval: 30,
//!     retry_max_attempts: 3,
//!     skip_validation: false,
//! };
//!
//! tokio::spawn(async move { while rx.recv().await.is_some() {} });
//! let outcomes = engine.execute_batch_commands(request, events).await?;
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod batch;
pub mod engine;
pub mod ssh;
pub mod validate;

pub use audit::{AuditRecord, AuditSink, NoopAuditSink, TracingAuditSink};
pub use batch::{
    BatchEvent, BatchOutcome, BatchRequest, CancellationToken, CommandResult, ErrorDescriptor,
    ErrorKind, HostEntry, ProgressRecord,
};
pub use engine::{BatchEngine, EngineError};
pub use ssh::{AuthMethod, ConfigError, Secret, SessionConfig, SshError};
pub use validate::{AcceptAllValidator, CommandValidator, DenyListValidator};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging for binaries embedding the engine.
///
/// Respects `RUST_LOG`, defaulting to `info`.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
