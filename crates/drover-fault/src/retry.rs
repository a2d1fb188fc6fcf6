use std::future::Future;
use std::time::Duration;
use tracing::warn;

use drover_core::Result;

/// Run `f` up to `max_retries` times, sleeping `base_delay × attempt`
/// between attempts. Returns the last error if every attempt fails.
///
/// The sleeps are timer-based and cancellation-safe: dropping the future
/// (e.g. on shutdown) aborts any in-flight backoff wait.
pub async fn with_retry<T, F, Fut>(mut f: F, max_retries: u32, base_delay: Duration) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = max_retries.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= attempts {
                    warn!(attempts, error = %e, "all retries exhausted");
                    return Err(e);
                }
                warn!(
                    attempt,
                    max_retries = attempts,
                    error = %e,
                    "retryable call failed, backing off"
                );
                tokio::time::sleep(base_delay * attempt).await;
            }
        }
    }
}
