//! SSH session executor
//!
//! One command = one session. [`SshClient`] opens a TCP connection,
//! authenticates, runs a single exec channel to completion and tears the
//! session down. Transient connect-stage failures go through the reconnect
//! policy; the shared cancellation token is observed at every suspension
//! point.
//!
//! The [`SessionRunner`] trait is the seam the batch scheduler works
//! against, so schedulers can be exercised with stub sessions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::keys::{PrivateKeyWithHashAlg, PublicKey};
use russh::{ChannelMsg, Disconnect, Sig};
use tokio::net::lookup_host;
use tracing::{debug, warn};

use crate::batch::cancel::CancellationToken;

use super::config::{AuthMethod, SessionConfig};
use super::error::SshError;
use super::keys::KeyCache;
use super::retry::{is_reconnectable, RetryPolicy};

/// Raw output of one remote command, before UI-facing conversion.
#[derive(Debug, Clone)]
pub struct RawOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Remote exit code; 128 + signal number when terminated by a signal
    pub exit_status: i32,
}

/// Executes one command per invocation against one host.
///
/// Implemented by [`RusshRunner`] for real sessions and by stubs in tests.
#[async_trait]
pub trait SessionRunner: Send + Sync {
    async fn run(
        &self,
        config: &SessionConfig,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<RawOutput, SshError>;
}

/// The production [`SessionRunner`], backed by russh.
pub struct RusshRunner {
    keys: Arc<KeyCache>,
}

impl RusshRunner {
    pub fn new(keys: Arc<KeyCache>) -> Self {
        Self { keys }
    }
}

#[async_trait]
impl SessionRunner for RusshRunner {
    async fn run(
        &self,
        config: &SessionConfig,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<RawOutput, SshError> {
        let client = SshClient::new(config.clone(), self.keys.clone());
        client.run_command(command, cancel).await
    }
}

/// One SSH session against one target.
pub struct SshClient {
    config: SessionConfig,
    keys: Arc<KeyCache>,
}

impl SshClient {
    pub fn new(config: SessionConfig, keys: Arc<KeyCache>) -> Self {
        Self { config, keys }
    }

    /// Connect and authenticate, retrying transient connect-stage failures
    /// per the reconnect policy. Non-transient failures (auth rejections,
    /// key problems) short-circuit without a retry.
    pub async fn connect(
        &self,
        cancel: &CancellationToken,
    ) -> Result<client::Handle<ClientHandler>, SshError> {
        let policy = RetryPolicy::new(
            self.config.reconnect_attempts,
            self.config.reconnect_delay_base,
        );

        let mut retry = 0u32;
        loop {
            if cancel.is_tripped() {
                return Err(SshError::Cancelled);
            }

            let attempt = tokio::select! {
                _ = cancel.cancelled() => return Err(SshError::Cancelled),
                result = self.connect_once() => result,
            };

            match attempt {
                Ok(handle) => {
                    if retry > 0 {
                        debug!(
                            "connected to {}@{}:{} after {} reconnect attempts",
                            self.config.username, self.config.host, self.config.port, retry
                        );
                    }
                    return Ok(handle);
                }
                Err(err) => {
                    if retry >= policy.max_retries || !is_reconnectable(&err) {
                        return Err(err);
                    }
                    retry += 1;
                    let delay = policy.backoff_delay_jittered(retry);
                    warn!(
                        "connection attempt {} to {}:{} failed ({}), retrying in {:?}",
                        retry, self.config.host, self.config.port, err, delay
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(SshError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn connect_once(&self) -> Result<client::Handle<ClientHandler>, SshError> {
        // Key material is resolved before any network activity so a broken
        // key fails the host without opening a connection.
        let key = self.keys.load(&self.config.auth)?;

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let socket_addr = lookup_host(&addr)
            .await
            .map_err(|e| SshError::ConnectionFailed(format!("Failed to resolve address: {}", e)))?
            .next()
            .ok_or_else(|| {
                SshError::ConnectionFailed(format!("No address found for {}", addr))
            })?;

        if self.config.compression_enabled {
            // The transport negotiates zlib on its own when the server
            // offers it; the configured level is advisory.
            debug!(
                "compression requested for {}@{} (level {:?})",
                self.config.username, self.config.host, self.config.compression_level
            );
        }

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: self.config.keep_alive_interval.map(Duration::from_secs),
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = ClientHandler::new(self.config.host.clone(), self.config.port);

        let mut handle = tokio::time::timeout(
            Duration::from_secs(self.config.connect_timeout),
            client::connect(Arc::new(ssh_config), socket_addr, handler),
        )
        .await
        .map_err(|_| {
            SshError::Timeout(format!(
                "Connection to {} timed out after {}s",
                addr, self.config.connect_timeout
            ))
        })?
        .map_err(|e| SshError::ConnectionFailed(e.to_string()))?;

        debug!("SSH handshake completed for {}", addr);

        // Transport failures during the auth round-trip stay classifiable
        // as transient via `?`; only a real server rejection below becomes
        // an authentication failure.
        let authenticated = match &self.config.auth {
            AuthMethod::Password { password } => {
                handle
                    .authenticate_password(&self.config.username, password.as_str())
                    .await?
            }
            AuthMethod::OpensshKey { .. } | AuthMethod::PpkKey { .. } => {
                let key = key.expect("key auth resolved key material above");
                let hash_alg = handle
                    .best_supported_rsa_hash()
                    .await
                    .ok()
                    .flatten()
                    .flatten();
                let key_with_hash = PrivateKeyWithHashAlg::new(key, hash_alg);
                handle
                    .authenticate_publickey(&self.config.username, key_with_hash)
                    .await?
            }
        };

        if !authenticated.success() {
            return Err(SshError::AuthenticationFailed(
                "Authentication rejected by server".to_string(),
            ));
        }

        debug!(
            "authenticated as {} on {}",
            self.config.username, self.config.host
        );

        Ok(handle)
    }

    /// Run one command over a fresh session and tear the session down.
    pub async fn run_command(
        &self,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<RawOutput, SshError> {
        let handle = self.connect(cancel).await?;

        let result = self.exec_on(&handle, command, cancel).await;

        let _ = handle
            .disconnect(Disconnect::ByApplication, "Session closed", "en")
            .await;

        result
    }

    async fn exec_on(
        &self,
        handle: &client::Handle<ClientHandler>,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<RawOutput, SshError> {
        let mut channel = tokio::select! {
            _ = cancel.cancelled() => return Err(SshError::Cancelled),
            opened = handle.channel_open_session() => opened
                .map_err(|e| SshError::ChannelError(format!("Failed to open channel: {}", e)))?,
        };

        tokio::select! {
            _ = cancel.cancelled() => return Err(SshError::Cancelled),
            sent = channel.exec(true, command) => sent
                .map_err(|e| SshError::ChannelError(format!("Failed to execute command: {}", e)))?,
        }

        // Nothing is ever written to stdin; close it right away.
        let _ = channel.eof().await;

        let mut stdout = Vec::with_capacity(4096);
        let mut stderr = Vec::with_capacity(1024);
        let mut exit_status: Option<i32> = None;
        let mut exit_signal: Option<Sig> = None;

        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = channel.close().await;
                    return Err(SshError::Cancelled);
                }
                msg = channel.wait() => msg,
            };

            match msg {
                Some(ChannelMsg::Data { data }) => {
                    stdout.extend_from_slice(&data);
                }
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    // ext == 1 is stderr in the SSH protocol
                    if ext == 1 {
                        stderr.extend_from_slice(&data);
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status: code }) => {
                    exit_status = Some(code as i32);
                }
                Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                    exit_signal = Some(signal_name);
                }
                Some(ChannelMsg::Eof) => {
                    // Keep draining until the exit status arrives
                    if exit_status.is_some() || exit_signal.is_some() {
                        break;
                    }
                }
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }

        let _ = channel.close().await;

        let exit_status = exit_status
            .or_else(|| exit_signal.map(|sig| 128 + sig_number(&sig)))
            .unwrap_or(-1);

        Ok(RawOutput {
            stdout,
            stderr,
            exit_status,
        })
    }
}

/// Map an SSH exit-signal name to the conventional signal number.
fn sig_number(sig: &Sig) -> i32 {
    match sig {
        Sig::HUP => 1,
        Sig::INT => 2,
        Sig::QUIT => 3,
        Sig::ILL => 4,
        Sig::ABRT => 6,
        Sig::FPE => 8,
        Sig::KILL => 9,
        Sig::SEGV => 11,
        Sig::PIPE => 13,
        Sig::ALRM => 14,
        Sig::TERM => 15,
        Sig::USR1 => 10,
        Sig::Custom(name) => match name.as_str() {
            "USR2" => 12,
            _ => 0,
        },
    }
}

/// Client-side handler for russh callbacks.
///
/// Host keys are accepted for the lifetime of the session with the
/// fingerprint logged; there is no known-hosts persistence across runs.
pub struct ClientHandler {
    host: String,
    port: u16,
}

impl ClientHandler {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(
            "accepting host key for {}:{} (fingerprint: {})",
            self.host,
            self.port,
            server_public_key.fingerprint(Default::default())
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_numbers_follow_convention() {
        assert_eq!(sig_number(&Sig::HUP), 1);
        assert_eq!(sig_number(&Sig::INT), 2);
        assert_eq!(sig_number(&Sig::KILL), 9);
        assert_eq!(sig_number(&Sig::SEGV), 11);
        assert_eq!(sig_number(&Sig::TERM), 15);
        assert_eq!(sig_number(&Sig::Custom("USR2".to_string())), 12);
        assert_eq!(sig_number(&Sig::Custom("NOPE".to_string())), 0);
    }

    #[tokio::test]
    async fn test_connect_refuses_quickly_on_closed_port() {
        // Port 1 on localhost is essentially never listening; the failure
        // must classify as a connection error, not a timeout.
        let mut config = crate::ssh::config::template_with_auth(
            "root",
            AuthMethod::password("pw"),
        );
        config.host = "127.0.0.1".to_string();
        config.port = 1;
        config.connect_timeout = 5;

        let client = SshClient::new(config, Arc::new(KeyCache::new()));
        let cancel = CancellationToken::new();
        let err = match client.connect(&cancel).await {
            Ok(_) => panic!("expected connect() to fail"),
            Err(e) => e,
        };
        assert!(matches!(
            err,
            SshError::ConnectionFailed(_) | SshError::Timeout(_)
        ));
    }

    #[tokio::test]
    async fn test_bad_key_fails_before_any_connection() {
        // Unroutable address: if the key were loaded after connecting this
        // would hang until the connect timeout.
        let mut config = crate::ssh::config::template_with_auth(
            "root",
            AuthMethod::openssh_key("/does/not/exist", None),
        );
        config.host = "127.0.0.1".to_string();
        config.port = 1;
        config.connect_timeout = 300;

        let keys = Arc::new(KeyCache::new());
        let client = SshClient::new(config, keys.clone());
        let cancel = CancellationToken::new();

        let started = std::time::Instant::now();
        let err = match client.connect(&cancel).await {
            Ok(_) => panic!("expected connect() to fail"),
            Err(e) => e,
        };
        assert!(matches!(err, SshError::KeyError(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(keys.parse_attempts(), 1);
    }

    #[tokio::test]
    async fn test_tripped_token_short_circuits_connect() {
        let mut config = crate::ssh::config::template_with_auth(
            "root",
            AuthMethod::password("pw"),
        );
        config.host = "10.255.255.1".to_string();
        config.connect_timeout = 300;

        let client = SshClient::new(config, Arc::new(KeyCache::new()));
        let cancel = CancellationToken::new();
        cancel.trip();
        let err = match client.connect(&cancel).await {
            Ok(_) => panic!("expected connect() to fail"),
            Err(e) => e,
        };
        assert!(matches!(err, SshError::Cancelled));
    }
}
