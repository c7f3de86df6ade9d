//! Failure classification
//!
//! Every per-host failure is reduced to an [`ErrorDescriptor`]: a closed
//! [`ErrorKind`], a display message with a remediation hint, and the
//! retryable flag. The flag is a total function of the kind and is decided
//! exactly once; the batch retry layer never re-derives it.
//!
//! Typed error variants are matched first; free-form messages (library
//! errors, stderr lines) fall back to ordered substring tables. The tables
//! carry both English and Russian phrasings because remote fleets in the
//! field report either.

use serde::{Deserialize, Serialize};

use crate::ssh::error::SshError;

/// Closed set of failure causes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Pre-flight rejected the command; no network activity happened
    CommandValidation,
    /// Key missing, unreadable, malformed, or wrong passphrase
    KeyMaterial,
    /// Server rejected the credentials
    AuthDenied,
    /// Refused / reset / no route / DNS failure
    NetworkTransient,
    /// Connect, read, or keep-alive timeout
    Timeout,
    /// Local cancellation tripped
    Cancelled,
    /// Anything else; retried conservatively
    Unknown,
}

impl ErrorKind {
    /// Whether a fresh attempt may plausibly succeed.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkTransient | ErrorKind::Timeout | ErrorKind::Unknown
        )
    }
}

/// A classified per-host failure, ready for display and retry decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl ErrorDescriptor {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.is_retryable(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "Execution cancelled")
    }
}

/// Validation / safety rejections of the command itself.
const VALIDATION_PHRASES: &[&str] = &[
    "command rejected",
    "command validation",
    "rejected by policy",
    "dangerous command",
    "валидаци",
    "запрещен",
];

/// Key file problems: missing, unreadable, malformed, wrong passphrase.
/// Kept specific so that server-side "key auth failed" messages fall
/// through to the auth table below.
const KEY_PHRASES: &[&str] = &[
    "key error",
    "key file not found",
    "failed to load private key",
    "failed to read key",
    "invalid key format",
    "bad key",
    "wrong passphrase",
    "bad passphrase",
    "invalid passphrase",
    "failed to decrypt key",
    "no key data",
    "ppk",
    "unsupported key",
    "файл ключа не найден",
    "путь к ключу не указан",
    "неверная passphrase",
];

/// Credentials rejected by the server.
const AUTH_PHRASES: &[&str] = &[
    "authentication failed",
    "authentication rejected",
    "permission denied",
    "access denied",
    "auth fail",
    "publickey",
    "password authentication",
    "all authentication methods failed",
    "аутентификация",
    "доступ запрещен",
    "неверный пароль",
];

/// Transient network conditions.
const NETWORK_PHRASES: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection closed",
    "no route to host",
    "network is unreachable",
    "host is down",
    "failed to resolve",
    "dns",
    "name resolution",
    "failed to connect",
    "connection failed",
    "broken pipe",
    "temporary failure",
    "resource temporarily unavailable",
    "не удалось установить соединение",
    "соединение сброшено",
    "хост недоступен",
];

/// Timeouts at any stage.
const TIMEOUT_PHRASES: &[&str] = &[
    "timed out",
    "timeout",
    "keep-alive",
    "keepalive",
    "превышено время ожидания",
    "таймаут",
];

/// Local cancellation.
const CANCEL_PHRASES: &[&str] = &["cancelled", "canceled", "отменено", "отмена"];

/// Classify a bare message into a kind.
///
/// Rules are evaluated in order and the first matching table wins;
/// anything unmatched is `Unknown` (and therefore retryable).
pub fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    let matches = |phrases: &[&str]| phrases.iter().any(|p| lower.contains(p));

    if matches(VALIDATION_PHRASES) {
        ErrorKind::CommandValidation
    } else if matches(KEY_PHRASES) {
        ErrorKind::KeyMaterial
    } else if matches(AUTH_PHRASES) {
        ErrorKind::AuthDenied
    } else if matches(NETWORK_PHRASES) {
        ErrorKind::NetworkTransient
    } else if matches(TIMEOUT_PHRASES) {
        ErrorKind::Timeout
    } else if matches(CANCEL_PHRASES) {
        ErrorKind::Cancelled
    } else {
        ErrorKind::Unknown
    }
}

/// Classify an SSH-layer failure into a full descriptor.
///
/// Typed variants decide the kind directly; `ConnectionFailed`, `IoError`
/// and protocol errors go through the message tables, with connection-stage
/// failures defaulting to `NetworkTransient` when nothing matches.
pub fn classify(err: &SshError) -> ErrorDescriptor {
    match err {
        SshError::Cancelled => ErrorDescriptor::cancelled(),
        SshError::ValidationRejected(reason) => {
            ErrorDescriptor::new(ErrorKind::CommandValidation, reason.clone())
        }
        SshError::KeyError(_) => ErrorDescriptor::new(
            ErrorKind::KeyMaterial,
            format!("{}. Check the key path and passphrase", err),
        ),
        SshError::AuthenticationFailed(_) => ErrorDescriptor::new(
            ErrorKind::AuthDenied,
            format!(
                "{}. Verify the username and credentials match the server",
                err
            ),
        ),
        SshError::Timeout(_) => ErrorDescriptor::new(
            ErrorKind::Timeout,
            format!("{}. Check host availability and the timeout settings", err),
        ),
        SshError::ConnectionFailed(_) | SshError::IoError(_) => {
            let message = err.to_string();
            let kind = match classify_message(&message) {
                // A connect-stage failure that matches nothing specific is
                // still a transient network condition, not a mystery.
                ErrorKind::Unknown => ErrorKind::NetworkTransient,
                kind => kind,
            };
            match kind {
                ErrorKind::NetworkTransient => ErrorDescriptor::new(
                    kind,
                    format!("{}. Check host availability and the port", message),
                ),
                ErrorKind::Timeout => ErrorDescriptor::new(
                    kind,
                    format!("{}. Check host availability and the timeout settings", message),
                ),
                _ => ErrorDescriptor::new(kind, message),
            }
        }
        SshError::ChannelError(_) | SshError::ProtocolError(_) => {
            let message = err.to_string();
            ErrorDescriptor::new(classify_message(&message), message)
        }
    }
}
