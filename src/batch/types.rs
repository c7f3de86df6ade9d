//! Batch data model
//!
//! The records that cross the engine boundary: target hosts in, per-host
//! outcomes and progress out. All of them serialize cleanly for the UI;
//! none of them ever carries credential material.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::classify::ErrorDescriptor;
use crate::ssh::config::SessionConfig;

/// Metadata key whose value is copied into [`CommandResult::vehicle_id`].
pub const VEHICLE_ID_KEY: &str = "vehicle_id";

/// One target machine.
///
/// Constructed by the host-file loader or the UI; immutable once handed to
/// the engine. `metadata` is opaque here and is passed through to results
/// for downstream correlation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostEntry {
    /// IPv4/IPv6 literal or DNS name
    pub ip: String,

    /// Per-host port override; the batch template port applies when absent
    #[serde(default)]
    pub port: Option<u16>,

    /// Display label
    #[serde(default)]
    pub hostname: Option<String>,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl HostEntry {
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            port: None,
            hostname: None,
            metadata: HashMap::new(),
        }
    }

    pub fn vehicle_id(&self) -> Option<&str> {
        self.metadata.get(VEHICLE_ID_KEY).map(String::as_str)
    }
}

/// The outcome of one successful command execution.
///
/// A populated result with a non-zero `exit_status` is a remote-side
/// failure, which is distinct from a connection failure and is never
/// retried at the batch level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub host: String,
    pub stdout: String,
    pub stderr: String,
    /// Remote shell exit code; 128 + signal number when killed by a signal
    pub exit_status: i32,
    /// Copied from host metadata for UI convenience
    #[serde(default)]
    pub vehicle_id: Option<String>,
    /// ISO-8601 completion time
    pub timestamp: String,
}

/// Terminal per-host record: exactly one of `result` / `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub host: String,
    pub result: Option<CommandResult>,
    pub error: Option<ErrorDescriptor>,
    /// ISO-8601 time the outcome was produced
    pub timestamp: String,
}

impl BatchOutcome {
    pub fn success(result: CommandResult) -> Self {
        Self {
            host: result.host.clone(),
            timestamp: Utc::now().to_rfc3339(),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(host: impl Into<String>, error: ErrorDescriptor) -> Self {
        Self {
            host: host.into(),
            result: None,
            error: Some(error),
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn cancelled(host: impl Into<String>) -> Self {
        Self::failure(host, ErrorDescriptor::cancelled())
    }

    pub fn is_success(&self) -> bool {
        self.result.is_some()
    }

    /// Whether the batch retry layer may re-queue this host.
    pub fn is_retryable(&self) -> bool {
        self.error.as_ref().is_some_and(|e| e.retryable)
    }
}

/// Per-batch completion counter snapshot. `completed` is monotonically
/// non-decreasing within one attempt round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub completed: usize,
    pub total: usize,
    /// The host whose completion produced this record
    pub host: String,
}

/// Immutable input to one batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchRequest {
    /// Dispatch order follows this sequence; duplicates are permitted
    pub hosts: Vec<HostEntry>,

    /// Session parameters applied to every host (host/port resolved per target)
    pub config_template: SessionConfig,

    /// The shell command to run on every host
    pub command: String,

    /// Worker pool size (1..=500)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Re-queue hosts whose final failure is classified retryable
    #[serde(default)]
    pub retry_failed_hosts: bool,

    /// Wall-clock pause between retry rounds, in seconds
    #[serde(default = "default_retry_interval")]
    pub retry_interval: u64,

    /// Cap on re-submissions per host; 0 means unbounded until cancelled
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    /// Bypass the external command validator
    #[serde(default)]
    pub skip_validation: bool,
}

fn default_max_concurrent() -> usize {
    50
}

fn default_retry_interval() -> u64 {
    30
}

fn default_retry_max_attempts() -> u32 {
    10
}

/// Upper bound on the worker pool; the call fails fast above this.
pub const MAX_CONCURRENT_LIMIT: usize = 500;
