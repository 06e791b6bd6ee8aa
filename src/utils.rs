//! Shared helpers: cooperative delays, bounded retry, quantity rounding

use std::future::Future;
use std::time::Duration;
use tokio::sync::Notify;

use crate::logger::{self, LogTag};

/// Waits for a delay or shutdown signal, whichever comes first.
/// Returns true if shutdown was signaled.
pub async fn check_shutdown_or_delay(shutdown: &Notify, duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.notified() => true,
    }
}

/// Run an async operation with bounded retries and exponential backoff.
///
/// The operation owns its idempotency: callers on the order path must reuse
/// the same deduplication key across attempts so a retry can never
/// double-execute.
pub async fn with_retries<T, E, F, Fut>(
    label: &str,
    max_retries: u32,
    base_delay: Duration,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if attempt > max_retries {
                    return Err(e);
                }
                let delay = base_delay * 2u32.pow(attempt - 1);
                logger::warning(
                    LogTag::System,
                    &format!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        label, attempt, max_retries, delay, e
                    ),
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Round a quantity DOWN to the venue's step size.
///
/// Always floors: rounding up could spend more than the caller authorized.
/// A zero or negative step disables rounding.
pub fn floor_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    let steps = (value / step).floor();
    // Re-quantize through the step's decimal places to shed float residue
    // (0.1 + 0.2 style artifacts would otherwise leak into order sizes).
    let places = decimal_places(step);
    round_to_places(steps * step, places)
}

/// Number of decimal places in a step size like 0.00001
fn decimal_places(step: f64) -> u32 {
    let mut places = 0u32;
    let mut s = step;
    while s.fract().abs() > 1e-9 && places < 12 {
        s *= 10.0;
        places += 1;
    }
    places
}

/// Round to a fixed number of decimal places
pub fn round_to_places(value: f64, places: u32) -> f64 {
    let factor = 10f64.powi(places as i32);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_to_step_rounds_down() {
        assert_eq!(floor_to_step(0.123456789, 0.00001), 0.12345);
        assert_eq!(floor_to_step(1.999, 0.5), 1.5);
        assert_eq!(floor_to_step(0.00001234, 0.0001), 0.0);
    }

    #[test]
    fn test_floor_to_step_exact_multiple() {
        assert_eq!(floor_to_step(0.055, 0.001), 0.055);
    }

    #[test]
    fn test_floor_to_step_zero_step_passthrough() {
        assert_eq!(floor_to_step(0.123, 0.0), 0.123);
    }

    #[tokio::test]
    async fn test_with_retries_eventually_succeeds() {
        let mut calls = 0;
        let result: Result<u32, String> = with_retries(
            "test-op",
            3,
            Duration::from_millis(1),
            || {
                calls += 1;
                let n = calls;
                async move {
                    if n < 3 {
                        Err("not yet".to_string())
                    } else {
                        Ok(n)
                    }
                }
            },
        )
        .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn test_with_retries_bounded() {
        let result: Result<u32, String> = with_retries(
            "test-op",
            2,
            Duration::from_millis(1),
            || async { Err("always".to_string()) },
        )
        .await;
        assert_eq!(result, Err("always".to_string()));
    }

    #[tokio::test]
    async fn test_shutdown_wins_over_delay() {
        let shutdown = Notify::new();
        shutdown.notify_waiters();
        // notify_waiters only wakes current waiters; use notify_one for the
        // permit-style wakeup the scheduler relies on
        shutdown.notify_one();
        let was_shutdown = check_shutdown_or_delay(&shutdown, Duration::from_secs(30)).await;
        assert!(was_shutdown);
    }
}
