//! Backoff and timeout utilities.
//!
//! The helpers in this module are transport-agnostic. The gateway engine uses
//! them to pace reconnect attempts and to bound socket handshakes.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Policy controlling reconnect pacing and optional exponential growth.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of consecutive attempts, `None` for unlimited.
    pub max_attempts: Option<usize>,
    /// Delay used before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth.
    ///
    /// Setting this equal to `initial_backoff` yields a constant delay.
    pub max_backoff: Duration,
    /// Maximum random jitter added to each retry delay.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Returns a constant-delay policy with unlimited attempts and no jitter.
    pub fn constant(delay: Duration) -> Self {
        Self {
            max_attempts: None,
            initial_backoff: delay,
            max_backoff: delay,
            jitter: Duration::ZERO,
        }
    }

    /// Computes the delay to apply before the given retry attempt.
    ///
    /// `attempt` is 1-based and should correspond to the current attempt index.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let mut delay = self.initial_backoff;
        for _ in 1..attempt {
            delay = std::cmp::min(delay.saturating_mul(2), self.max_backoff);
        }
        delay + jitter_duration(self.jitter, attempt)
    }

    /// Returns `true` while `attempt` (1-based) is within the attempt budget.
    pub fn allows_attempt(&self, attempt: usize) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::constant(Duration::from_secs(5))
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

fn jitter_duration(max_jitter: Duration, attempt: usize) -> Duration {
    if max_jitter.is_zero() {
        return Duration::ZERO;
    }

    let limit_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    if limit_nanos == 0 {
        return Duration::ZERO;
    }

    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = now_nanos ^ ((attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    Duration::from_nanos(mixed % (limit_nanos + 1))
}
