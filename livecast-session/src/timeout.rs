//! Bounded-time operations for the teardown path
//!
//! Teardown must never hang a UI surface on an unreachable relay. Every
//! network call on that path runs through [`with_timeout`]: the operation
//! races a fixed deadline, and local cleanup proceeds with the fallback
//! value if the deadline wins. Relay-side cleanup is then eventually
//! consistent rather than synchronously confirmed.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Run `fut` against a deadline, returning `fallback` if it elapses.
pub async fn with_timeout<T, F>(label: &str, duration: Duration, fut: F, fallback: T) -> T
where
    F: Future<Output = T>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(value) => value,
        Err(_) => {
            warn!(
                op = label,
                timeout_ms = duration.as_millis() as u64,
                "operation timed out, proceeding with fallback"
            );
            fallback
        }
    }
}
