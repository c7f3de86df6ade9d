//! Connection-level retry policy
//!
//! Exponential backoff for reconnect attempts inside a single session,
//! distinct from the batch-level host retry. Only transient failures
//! (network conditions and timeouts) are retried here; everything else
//! propagates immediately.

use std::time::Duration;

use rand::Rng;

use crate::batch::classify::{classify, ErrorKind};
use crate::ssh::error::SshError;

/// Ceiling on a single backoff delay, in seconds.
const MAX_BACKOFF_SECS: f64 = 32.0;

/// Jitter band applied to each delay: uniform in ±20 %.
const JITTER_FRACTION: f64 = 0.2;

/// Reconnect policy for one session.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Number of reconnect attempts after the initial failure
    pub max_retries: u32,

    /// Base delay in seconds; the i-th retry waits `base * 2^(i-1)`
    pub base_delay_secs: f64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_secs: f64) -> Self {
        Self {
            max_retries,
            base_delay_secs,
        }
    }

    /// Deterministic backoff before the i-th retry (i starting at 1),
    /// capped at [`MAX_BACKOFF_SECS`].
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(5);
        let delay = (self.base_delay_secs * f64::from(1u32 << exponent)).min(MAX_BACKOFF_SECS);
        Duration::from_secs_f64(delay)
    }

    /// Backoff with uniform ±20 % jitter, to spread reconnect storms
    /// against a shared target.
    pub fn backoff_delay_jittered(&self, retry: u32) -> Duration {
        let base = self.backoff_delay(retry);
        let factor = rand::thread_rng()
            .gen_range((1.0 - JITTER_FRACTION)..=(1.0 + JITTER_FRACTION));
        base.mul_f64(factor)
    }
}

/// Whether the reconnect loop should try again after this failure.
pub fn is_reconnectable(err: &SshError) -> bool {
    matches!(
        classify(err).kind,
        ErrorKind::NetworkTransient | ErrorKind::Timeout
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_from_base() {
        let policy = RetryPolicy::new(5, 1.0);
        assert_eq!(policy.backoff_delay(1).as_secs_f64(), 1.0);
        assert_eq!(policy.backoff_delay(2).as_secs_f64(), 2.0);
        assert_eq!(policy.backoff_delay(3).as_secs_f64(), 4.0);
        assert_eq!(policy.backoff_delay(4).as_secs_f64(), 8.0);
    }

    #[test]
    fn test_backoff_respects_fractional_base() {
        let policy = RetryPolicy::new(3, 0.5);
        assert_eq!(policy.backoff_delay(1).as_secs_f64(), 0.5);
        assert_eq!(policy.backoff_delay(2).as_secs_f64(), 1.0);
        assert_eq!(policy.backoff_delay(3).as_secs_f64(), 2.0);
    }

    #[test]
    fn test_backoff_caps_out() {
        let policy = RetryPolicy::new(10, 10.0);
        assert_eq!(policy.backoff_delay(9).as_secs_f64(), MAX_BACKOFF_SECS);
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = RetryPolicy::new(3, 2.0);
        for _ in 0..100 {
            let jittered = policy.backoff_delay_jittered(2).as_secs_f64();
            assert!((3.2..=4.8).contains(&jittered), "out of band: {}", jittered);
        }
    }

    #[test]
    fn test_only_transient_failures_reconnect() {
        assert!(is_reconnectable(&SshError::ConnectionFailed(
            "Connection refused".to_string()
        )));
        assert!(is_reconnectable(&SshError::Timeout(
            "Connection timed out".to_string()
        )));
        assert!(!is_reconnectable(&SshError::AuthenticationFailed(
            "rejected".to_string()
        )));
        assert!(!is_reconnectable(&SshError::KeyError(
            "key file not found".to_string()
        )));
        assert!(!is_reconnectable(&SshError::Cancelled));
    }
}
