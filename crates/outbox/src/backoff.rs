use std::{future::Future, time::Duration};

use rand::Rng;
use tracing::debug;

pub const MAX_JITTER: Duration = Duration::from_millis(1000);

/// `base * 2^attempt + jitter`, saturating instead of overflowing.
pub fn backoff_delay(base: Duration, attempt: u32, jitter: Duration) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor).saturating_add(jitter)
}

pub fn random_jitter() -> Duration {
    let millis = rand::thread_rng().gen_range(0..MAX_JITTER.as_millis() as u64);
    Duration::from_millis(millis)
}

/// Sleeps for the backoff delay of `attempt`, then runs `action`.
///
/// Callers own the retry ceiling; this only spaces attempts out.
pub async fn retry_with_backoff<F, Fut, T>(base: Duration, attempt: u32, action: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let delay = backoff_delay(base, attempt, random_jitter());
    debug!(attempt, delay_ms = delay.as_millis() as u64, "backing off");
    tokio::time::sleep(delay).await;
    action().await
}

#[cfg(test)]
#[path = "tests/backoff_tests.rs"]
mod tests;
