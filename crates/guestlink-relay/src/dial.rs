//! Bounded-retry dialing.
//!
//! The host-side listener (a container engine's control socket, typically)
//! may come up after the guest-side forwarder, so every dial tolerates a
//! short startup-ordering race: fixed-interval retries up to a bounded
//! budget. No attempt is made to distinguish retryable from fatal dial
//! errors; exhaustion is connection-scoped, never daemon-fatal.

use crate::error::{RelayError, Result};
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::time::sleep;

/// Default number of dial attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 200;

/// Default pause between attempts.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(50);

/// Fixed-backoff retry policy for connection establishment.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of dial attempts.
    pub max_attempts: u32,
    /// Pause after each failed attempt.
    pub interval: Duration,
}

impl Default for RetryPolicy {
    /// 200 attempts x 50 ms, a ~10 s total budget.
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            interval: DEFAULT_INTERVAL,
        }
    }
}

/// Dials until `dial` succeeds or the policy's budget is exhausted.
///
/// Each failed attempt sleeps `policy.interval` before the next; the last
/// error is returned on exhaustion.
///
/// # Errors
///
/// Returns [`RelayError::DialExhausted`] wrapping the final attempt's error.
pub async fn dial_with_retry<T, F, Fut>(policy: &RetryPolicy, mut dial: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    let mut last_err = None;
    for attempt in 0..policy.max_attempts {
        match dial().await {
            Ok(conn) => {
                if attempt > 0 {
                    tracing::debug!(attempt, "dial succeeded after retries");
                }
                return Ok(conn);
            }
            Err(e) => {
                tracing::trace!(attempt, error = %e, "dial attempt failed");
                last_err = Some(e);
            }
        }
        sleep(policy.interval).await;
    }

    Err(RelayError::DialExhausted {
        attempts: policy.max_attempts,
        source: last_err
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "no dial attempts made")),
    })
}
