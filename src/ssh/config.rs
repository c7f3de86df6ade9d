//! SSH session configuration
//!
//! `SessionConfig` is the closed set of per-session parameters. A batch run
//! uses one config as a template and resolves it against each target host
//! with [`SessionConfig::for_host`]; the host's own port wins when present.
//!
//! Credential bytes live in [`Secret`], which is wiped on drop and is never
//! serialized back out.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::batch::types::HostEntry;

/// A credential string that is zeroed on drop.
///
/// `Debug` and `Serialize` never reveal the contents.
#[derive(Clone)]
pub struct Secret(Zeroizing<String>);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        String::deserialize(deserializer).map(Secret::new)
    }
}

/// Authentication material for one batch.
///
/// Key material is loaded lazily by the key cache on first use; this enum
/// only carries the paths and the (wiped-on-drop) secrets.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication
    Password { password: Secret },

    /// OpenSSH private key file
    OpensshKey {
        key_path: String,
        #[serde(default)]
        passphrase: Option<Secret>,
    },

    /// PuTTY PPK private key file
    PpkKey {
        ppk_path: String,
        #[serde(default)]
        passphrase: Option<Secret>,
    },
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: Secret::new(password),
        }
    }

    pub fn openssh_key(key_path: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::OpensshKey {
            key_path: key_path.into(),
            passphrase: passphrase.map(Secret::new),
        }
    }

    pub fn ppk_key(ppk_path: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::PpkKey {
            ppk_path: ppk_path.into(),
            passphrase: passphrase.map(Secret::new),
        }
    }

    /// Key file path for the key-based variants.
    pub fn key_path(&self) -> Option<&str> {
        match self {
            Self::Password { .. } => None,
            Self::OpensshKey { key_path, .. } => Some(key_path),
            Self::PpkKey { ppk_path, .. } => Some(ppk_path),
        }
    }

    pub fn passphrase(&self) -> Option<&Secret> {
        match self {
            Self::Password { .. } => None,
            Self::OpensshKey { passphrase, .. } | Self::PpkKey { passphrase, .. } => {
                passphrase.as_ref()
            }
        }
    }
}

// Secrets never leave the process: only the variant tag and key paths are
// written out, matching what the result tables need to display.
impl Serialize for AuthMethod {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        match self {
            AuthMethod::Password { .. } => serializer.serialize_str("password"),
            AuthMethod::OpensshKey { key_path, .. } => {
                let mut state = serializer.serialize_struct("OpensshKey", 2)?;
                state.serialize_field("type", "openssh_key")?;
                state.serialize_field("key_path", key_path)?;
                state.end()
            }
            AuthMethod::PpkKey { ppk_path, .. } => {
                let mut state = serializer.serialize_struct("PpkKey", 2)?;
                state.serialize_field("type", "ppk_key")?;
                state.serialize_field("ppk_path", ppk_path)?;
                state.end()
            }
        }
    }
}

/// SSH session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Remote host address (IP literal or DNS name)
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Authentication material
    pub auth: AuthMethod,

    /// Connection establishment timeout in seconds (1..=300)
    #[serde(default = "default_timeout")]
    pub connect_timeout: u64,

    /// Keep-alive ping interval in seconds; `None` disables keep-alive
    #[serde(default)]
    pub keep_alive_interval: Option<u64>,

    /// Connection-level retries before giving up on one session (0..=10)
    #[serde(default)]
    pub reconnect_attempts: u32,

    /// Base delay in seconds for the reconnect backoff (0.1..=10)
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_base: f64,

    /// Whether to negotiate transport compression
    #[serde(default)]
    pub compression_enabled: bool,

    /// zlib level (1..=9) when compression is enabled
    #[serde(default)]
    pub compression_level: Option<u32>,
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    30
}

fn default_reconnect_delay() -> f64 {
    1.0
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("host must not be empty")]
    EmptyHost,

    #[error("username must not be empty")]
    EmptyUsername,

    #[error("password is required for password authentication")]
    EmptyPassword,

    #[error("key path is required for key authentication")]
    EmptyKeyPath,

    #[error("connect_timeout must be between 1 and 300 seconds, got {0}")]
    InvalidConnectTimeout(u64),

    #[error("reconnect_attempts must be at most 10, got {0}")]
    InvalidReconnectAttempts(u32),

    #[error("reconnect_delay_base must be between 0.1 and 10 seconds")]
    InvalidReconnectDelay,

    #[error("compression_level must be between 1 and 9, got {0}")]
    InvalidCompressionLevel(u32),
}

impl SessionConfig {
    /// Validate every field range and the auth invariants.
    ///
    /// A template (host not yet resolved) passes `allow_empty_host = true`.
    pub(crate) fn validate_inner(&self, allow_empty_host: bool) -> Result<(), ConfigError> {
        if !allow_empty_host && self.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.username.trim().is_empty() {
            return Err(ConfigError::EmptyUsername);
        }
        match &self.auth {
            AuthMethod::Password { password } => {
                if password.is_empty() {
                    return Err(ConfigError::EmptyPassword);
                }
            }
            AuthMethod::OpensshKey { key_path, .. } => {
                if key_path.trim().is_empty() {
                    return Err(ConfigError::EmptyKeyPath);
                }
            }
            AuthMethod::PpkKey { ppk_path, .. } => {
                if ppk_path.trim().is_empty() {
                    return Err(ConfigError::EmptyKeyPath);
                }
            }
        }
        if !(1..=300).contains(&self.connect_timeout) {
            return Err(ConfigError::InvalidConnectTimeout(self.connect_timeout));
        }
        if self.reconnect_attempts > 10 {
            return Err(ConfigError::InvalidReconnectAttempts(
                self.reconnect_attempts,
            ));
        }
        if !(0.1..=10.0).contains(&self.reconnect_delay_base) {
            return Err(ConfigError::InvalidReconnectDelay);
        }
        if self.compression_enabled {
            if let Some(level) = self.compression_level {
                if !(1..=9).contains(&level) {
                    return Err(ConfigError::InvalidCompressionLevel(level));
                }
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_inner(false)
    }

    /// Validate as a batch template, where the host is filled in per target.
    pub fn validate_template(&self) -> Result<(), ConfigError> {
        self.validate_inner(true)
    }

    /// Resolve this template against a concrete target host.
    ///
    /// The entry's own port overrides the template port when present.
    pub fn for_host(&self, entry: &HostEntry) -> SessionConfig {
        let mut config = self.clone();
        config.host = entry.ip.clone();
        if let Some(port) = entry.port {
            config.port = port;
        }
        config
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: String::new(),
            auth: AuthMethod::Password {
                password: Secret::new(""),
            },
            connect_timeout: 30,
            keep_alive_interval: Some(30),
            reconnect_attempts: 0,
            reconnect_delay_base: 1.0,
            compression_enabled: false,
            compression_level: None,
        }
    }
}

/// Convenience for tests and the single-host path: a template with the
/// given credentials and everything else defaulted.
pub fn template_with_auth(username: impl Into<String>, auth: AuthMethod) -> SessionConfig {
    SessionConfig {
        username: username.into(),
        auth,
        ..Default::default()
    }
}
