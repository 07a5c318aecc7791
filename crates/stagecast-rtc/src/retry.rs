use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Bounded exponential backoff shared by both handshake roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub const fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// `base × 2^attempt`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether another attempt may start after `failures` failed ones.
    pub fn allows(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }
}

/// Runs `op` until it succeeds or the policy is spent, sleeping
/// `delay_for(n)` after the n-th failure. Returns the last error.
pub async fn retry_with_backoff<T, E, F, Fut>(policy: &BackoffPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut failures = 0;
    loop {
        match op(failures).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                failures += 1;
                if !policy.allows(failures) {
                    return Err(err);
                }
                let delay = policy.delay_for(failures - 1);
                tracing::debug!(
                    target = "webrtc",
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after backoff"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
