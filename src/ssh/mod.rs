//! SSH module - sessions, authentication and key material
//!
//! One command execution = one SSH session. This module covers the whole
//! session lifecycle: configuration, key loading (OpenSSH and PuTTY PPK),
//! connect with reconnect backoff, exec, and teardown.

pub mod client;
pub mod config;
pub mod error;
pub mod keys;
mod ppk;
pub mod retry;

pub use client::{ClientHandler, RawOutput, RusshRunner, SessionRunner, SshClient};
pub use config::{AuthMethod, ConfigError, Secret, SessionConfig};
pub use error::SshError;
pub use keys::KeyCache;
pub use retry::RetryPolicy;
