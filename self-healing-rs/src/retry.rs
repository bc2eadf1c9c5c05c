//! # Backoff Policy
//!
//! Exponential backoff with symmetric jitter for the healing retry loop.
//! Waits are cancellable: a cancelled token ends the wait early and the
//! caller stops retrying.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Backoff parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound of the un-jittered delay
    pub max_delay: Duration,
    /// Relative jitter applied in both directions (0.0 - 1.0)
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.3,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, jitter_factor: f64) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
        }
    }

    /// Un-jittered delay for the given zero-based attempt
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exp_backoff = base_ms * 2.0_f64.powi(attempt.min(32) as i32);
        Duration::from_millis(exp_backoff.min(max_ms) as u64)
    }

    /// Delay for the given zero-based attempt, jittered by ±`jitter_factor`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let capped_ms = self.nominal_delay(attempt).as_millis() as f64;

        let jitter_range = capped_ms * self.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        let final_ms = (capped_ms + jitter).max(0.0);
        Duration::from_millis(final_ms as u64)
    }

    /// Largest delay `delay_for` can ever return
    pub fn ceiling(&self) -> Duration {
        self.max_delay.mul_f64(1.0 + self.jitter_factor)
    }
}

/// Sleeps for `delay` unless `cancel` fires first.
///
/// Returns `false` when the wait was interrupted by cancellation.
pub async fn wait(delay: Duration, cancel: Option<&CancellationToken>) -> bool {
    trace!(delay_ms = delay.as_millis() as u64, "Backing off");
    match cancel {
        Some(token) => {
            tokio::select! {
                _ = token.cancelled() => false,
                _ = tokio::time::sleep(delay) => true,
            }
        }
        None => {
            tokio::time::sleep(delay).await;
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_never_exceeds_jittered_cap() {
        let policy = BackoffPolicy::default();
        let ceiling = policy.ceiling();
        for attempt in 0..20 {
            for _ in 0..50 {
                assert!(policy.delay_for(attempt) <= ceiling);
            }
        }
    }

    #[test]
    fn nominal_delay_doubles_until_capped() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1), 0.3);
        assert_eq!(policy.nominal_delay(0), Duration::from_millis(100));
        assert_eq!(policy.nominal_delay(1), Duration::from_millis(200));
        assert_eq!(policy.nominal_delay(3), Duration::from_millis(800));
        assert_eq!(policy.nominal_delay(4), Duration::from_secs(1));
        assert_eq!(policy.nominal_delay(60), Duration::from_secs(1));
    }

    #[test]
    fn mean_delay_increases_with_attempt() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(60), 0.3);
        let mean = |attempt: u32| -> f64 {
            (0..200)
                .map(|_| policy.delay_for(attempt).as_millis() as f64)
                .sum::<f64>()
                / 200.0
        };
        let (a0, a1, a2) = (mean(0), mean(1), mean(2));
        assert!(a0 < a1 && a1 < a2, "{a0} {a1} {a2}");
    }

    #[test]
    fn jitter_stays_within_thirty_percent() {
        let policy = BackoffPolicy::new(Duration::from_millis(1_000), Duration::from_secs(30), 0.3);
        for _ in 0..100 {
            let ms = policy.delay_for(0).as_millis();
            assert!((700..=1_300).contains(&ms), "{ms}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_wait_returns_early() {
        let token = CancellationToken::new();
        token.cancel();
        let started = tokio::time::Instant::now();
        assert!(!wait(Duration::from_secs(30), Some(&token)).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn uncancelled_wait_completes() {
        assert!(wait(Duration::from_millis(500), None).await);
    }
}
