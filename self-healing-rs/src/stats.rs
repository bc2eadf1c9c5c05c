//! Healing statistics.
//!
//! Kept in-process for `HealingEngine::metrics()` snapshots and mirrored to
//! the `metrics` facade so whichever recorder the host installs sees them.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};

use crate::types::{ConnectionErrorType, HealingStrategy};

/// Per-strategy counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyStats {
    pub attempts: u64,
    pub successes: u64,
}

/// Snapshot of healing activity since creation or the last reset
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealingMetrics {
    pub total_requests: u64,
    pub total_attempts: u64,
    pub successful_healings: u64,
    pub escalations: u64,
    pub circuit_rejections: u64,
    pub by_strategy: BTreeMap<String, StrategyStats>,
    pub transient_errors: u64,
    pub transient_resolved: u64,
}

impl HealingMetrics {
    /// Share of transient-classified errors resolved without escalation
    pub fn transient_resolution_rate(&self) -> f64 {
        if self.transient_errors == 0 {
            1.0
        } else {
            self.transient_resolved as f64 / self.transient_errors as f64
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.successful_healings as f64 / self.total_requests as f64
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct MetricsRecorder {
    inner: Mutex<HealingMetrics>,
}

impl MetricsRecorder {
    fn with<F: FnOnce(&mut HealingMetrics)>(&self, f: F) {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard);
    }

    pub(crate) fn attempt(&self, strategy: HealingStrategy) {
        self.with(|m| {
            m.total_attempts += 1;
            m.by_strategy
                .entry(strategy.as_str().to_string())
                .or_default()
                .attempts += 1;
        });
        counter!("healing.attempts", 1, "strategy" => strategy.as_str());
    }

    pub(crate) fn circuit_rejected(&self, tool_id: &str) {
        self.with(|m| m.circuit_rejections += 1);
        counter!("healing.circuit_rejections", 1, "tool" => tool_id.to_string());
    }

    /// Records how a healing request ended
    pub(crate) fn outcome(
        &self,
        error_type: ConnectionErrorType,
        strategy: Option<HealingStrategy>,
        success: bool,
        escalated: bool,
        elapsed: Duration,
    ) {
        self.with(|m| {
            m.total_requests += 1;
            if success {
                m.successful_healings += 1;
                if let Some(strategy) = strategy {
                    m.by_strategy
                        .entry(strategy.as_str().to_string())
                        .or_default()
                        .successes += 1;
                }
            }
            if escalated {
                m.escalations += 1;
            }
            if error_type.is_transient() {
                m.transient_errors += 1;
                if !escalated {
                    m.transient_resolved += 1;
                }
            }
        });

        if success {
            counter!("healing.successes", 1, "error_type" => error_type.as_str());
        }
        if escalated {
            counter!("healing.escalations", 1, "error_type" => error_type.as_str());
        }
        histogram!("healing.duration_ms", elapsed.as_millis() as f64);
    }

    pub(crate) fn snapshot(&self) -> HealingMetrics {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn reset(&self) {
        self.with(|m| *m = HealingMetrics::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_rate_counts_only_transient_errors() {
        let recorder = MetricsRecorder::default();
        recorder.attempt(HealingStrategy::Retry);
        recorder.outcome(
            ConnectionErrorType::Timeout,
            Some(HealingStrategy::Retry),
            true,
            false,
            Duration::from_millis(5),
        );
        recorder.outcome(
            ConnectionErrorType::ServiceDown,
            Some(HealingStrategy::Retry),
            false,
            true,
            Duration::from_millis(5),
        );
        recorder.outcome(
            ConnectionErrorType::AuthInvalid,
            None,
            false,
            true,
            Duration::ZERO,
        );

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.total_requests, 3);
        assert_eq!(snapshot.escalations, 2);
        assert_eq!(snapshot.transient_errors, 2);
        assert!((snapshot.transient_resolution_rate() - 0.5).abs() < f64::EPSILON);
        assert_eq!(snapshot.by_strategy["retry"], StrategyStats { attempts: 1, successes: 1 });

        recorder.reset();
        assert_eq!(recorder.snapshot(), HealingMetrics::default());
    }
}
