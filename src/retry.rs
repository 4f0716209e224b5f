//! Retry and backoff utilities.
//!
//! Both retry loops in the SDK are deterministic: the stream side grows
//! exponentially and saturates at a cap, the API side grows linearly with a
//! steeper quadratic curve reserved for explicit throttling responses.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Backoff policy for stream reconnection attempts.
#[derive(Clone, Debug)]
pub struct StreamBackoff {
    /// Delay unit; the wait before attempt `n` is `base * 2^(n-1)`.
    pub base: Duration,
    /// Upper bound for delay growth.
    pub max: Duration,
}

impl StreamBackoff {
    /// Doubling steps after which the delay saturates.
    const MAX_SHIFT: u32 = 4;

    /// Computes the delay to apply before the given attempt.
    ///
    /// `attempt` is 1-based. The exponent is clamped so the delay reaches
    /// `max` at attempt 5 and stays there.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let shift = (attempt.saturating_sub(1) as u32).min(Self::MAX_SHIFT);
        self.base.saturating_mul(1 << shift).min(self.max)
    }
}

impl Default for StreamBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            max: Duration::from_secs(30),
        }
    }
}

/// Backoff policy for single request/response calls.
#[derive(Clone, Debug)]
pub struct RequestBackoff {
    /// Maximum number of attempts including the first attempt.
    pub max_attempts: usize,
    /// Delay unit multiplied per attempt.
    pub base: Duration,
}

impl RequestBackoff {
    /// Linear delay for generic retryable failures.
    pub fn linear(&self, attempt: usize) -> Duration {
        self.base.saturating_mul(attempt as u32)
    }

    /// Quadratic delay for explicit throttling responses.
    pub fn quadratic(&self, attempt: usize) -> Duration {
        self.base.saturating_mul((attempt * attempt) as u32)
    }
}

impl Default for RequestBackoff {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_secs(1),
        }
    }
}

/// Executes an async operation with per-error retry delays.
///
/// `op` receives the 1-based attempt number and must return a future that
/// resolves to the operation result. `delay_for` inspects each error together
/// with the attempt that produced it: `None` marks the error fatal and ends
/// the loop immediately, `Some(delay)` schedules another attempt after the
/// delay until `max_attempts` is exhausted.
pub async fn retry_async<T, E, Op, Fut, DelayFor>(
    max_attempts: usize,
    mut op: Op,
    mut delay_for: DelayFor,
) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    DelayFor: FnMut(&E, usize) -> Option<Duration>,
{
    let max_attempts = max_attempts.max(1);

    for attempt in 1..=max_attempts {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let Some(delay) = delay_for(&error, attempt) else {
                    return Err(error);
                };
                if attempt >= max_attempts {
                    return Err(error);
                }

                debug!(
                    event = "retry_attempt_failed",
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    unreachable!("max_attempts is always at least 1")
}
