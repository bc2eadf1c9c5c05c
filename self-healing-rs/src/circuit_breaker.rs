//! # Circuit Breaker Registry
//!
//! Per-integration fast-fail gate shared by every execution in the
//! process.
//!
//! - `Closed` until `failure_threshold` consecutive failures land within
//!   `failure_window`
//! - `Open` fast-fails until `cool_down` has elapsed
//! - `HalfOpen` lets the next call through as a trial: success closes the
//!   circuit, failure reopens it
//!
//! All counter updates for a tool happen under one write lock.

use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls allowed
    Closed,
    /// Failing, calls blocked
    Open,
    /// Cool-down elapsed, next call is a trial
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF-OPEN"),
        }
    }
}

/// Configuration for the circuit breaker registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the circuit
    pub failure_threshold: usize,
    /// Time to keep the circuit open before allowing a trial call
    pub cool_down: Duration,
    /// Failures further apart than this do not count as consecutive
    pub failure_window: Duration,
    /// Number of state transitions kept for diagnostics
    pub history_limit: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(30),
            failure_window: Duration::from_secs(60),
            history_limit: 256,
        }
    }
}

/// Snapshot of one integration's breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerState {
    pub tool_id: String,
    pub state: CircuitState,
    pub consecutive_failures: usize,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub total_failures: u64,
    pub total_successes: u64,
}

/// A recorded state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitTransition {
    pub tool_id: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
}

/// Breaker statistics for a single integration
#[derive(Debug)]
struct CircuitStats {
    state: CircuitState,
    /// Timestamps of the current run of consecutive failures
    recent_failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    last_failure_wall: Option<DateTime<Utc>>,
    total_failures: u64,
    total_successes: u64,
}

impl CircuitStats {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            recent_failures: VecDeque::new(),
            opened_at: None,
            opened_at_wall: None,
            last_failure_wall: None,
            total_failures: 0,
            total_successes: 0,
        }
    }

    fn snapshot(&self, tool_id: &str) -> CircuitBreakerState {
        CircuitBreakerState {
            tool_id: tool_id.to_string(),
            state: self.state,
            consecutive_failures: self.recent_failures.len(),
            opened_at: self.opened_at_wall,
            last_failure_at: self.last_failure_wall,
            total_failures: self.total_failures,
            total_successes: self.total_successes,
        }
    }
}

/// Process-wide registry of per-integration circuit breakers
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    circuits: RwLock<HashMap<String, CircuitStats>>,
    transitions: RwLock<VecDeque<CircuitTransition>>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerRegistry {
    /// Creates a registry with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: RwLock::new(HashMap::new()),
            transitions: RwLock::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Returns true if calls to `tool_id` must fast-fail.
    ///
    /// An open circuit whose cool-down has elapsed moves to half-open and
    /// admits the caller as the trial call.
    pub fn is_open(&self, tool_id: &str) -> bool {
        {
            let circuits = self.circuits.read().unwrap_or_else(PoisonError::into_inner);
            match circuits.get(tool_id) {
                None => return false,
                Some(stats) if stats.state != CircuitState::Open => return false,
                Some(stats) => {
                    let cooling = stats
                        .opened_at
                        .map_or(false, |opened| opened.elapsed() < self.config.cool_down);
                    if cooling {
                        debug!(tool_id = %tool_id, "Circuit open, call rejected");
                        return true;
                    }
                }
            }
        }

        let mut circuits = self.circuits.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(stats) = circuits.get_mut(tool_id) {
            let still_cooling = stats
                .opened_at
                .map_or(false, |opened| opened.elapsed() < self.config.cool_down);
            if stats.state == CircuitState::Open {
                if still_cooling {
                    return true;
                }
                stats.state = CircuitState::HalfOpen;
                info!(tool_id = %tool_id, "Circuit HALF-OPEN: testing integration recovery");
                self.push_transition(tool_id, CircuitState::Open, CircuitState::HalfOpen);
            }
        }
        false
    }

    /// Current state of a circuit; unknown tools are closed
    pub fn state(&self, tool_id: &str) -> CircuitState {
        let circuits = self.circuits.read().unwrap_or_else(PoisonError::into_inner);
        circuits.get(tool_id).map_or(CircuitState::Closed, |stats| stats.state)
    }

    /// Snapshot of one circuit
    pub fn snapshot(&self, tool_id: &str) -> CircuitBreakerState {
        let circuits = self.circuits.read().unwrap_or_else(PoisonError::into_inner);
        circuits
            .get(tool_id)
            .map(|stats| stats.snapshot(tool_id))
            .unwrap_or_else(|| CircuitStats::new().snapshot(tool_id))
    }

    /// Snapshots of every known circuit
    pub fn states(&self) -> Vec<CircuitBreakerState> {
        let circuits = self.circuits.read().unwrap_or_else(PoisonError::into_inner);
        let mut states: Vec<_> = circuits
            .iter()
            .map(|(tool_id, stats)| stats.snapshot(tool_id))
            .collect();
        states.sort_by(|a, b| a.tool_id.cmp(&b.tool_id));
        states
    }

    /// Records a successful call
    pub fn record_success(&self, tool_id: &str) {
        let mut circuits = self.circuits.write().unwrap_or_else(PoisonError::into_inner);
        let stats = circuits
            .entry(tool_id.to_string())
            .or_insert_with(CircuitStats::new);

        stats.total_successes += 1;
        stats.recent_failures.clear();

        if stats.state != CircuitState::Closed {
            let from = stats.state;
            stats.state = CircuitState::Closed;
            stats.opened_at = None;
            stats.opened_at_wall = None;
            info!(tool_id = %tool_id, previous = %from, "Circuit CLOSED: integration recovered");
            self.push_transition(tool_id, from, CircuitState::Closed);
        }
    }

    /// Records a failed call; returns the state after the update
    pub fn record_failure(&self, tool_id: &str) -> CircuitState {
        let mut circuits = self.circuits.write().unwrap_or_else(PoisonError::into_inner);
        let stats = circuits
            .entry(tool_id.to_string())
            .or_insert_with(CircuitStats::new);

        let now = Instant::now();
        stats.total_failures += 1;
        stats.last_failure_wall = Some(Utc::now());

        // A stale failure breaks the run of consecutive failures
        if let Some(last) = stats.recent_failures.back() {
            if now.duration_since(*last) > self.config.failure_window {
                stats.recent_failures.clear();
            }
        }
        stats.recent_failures.push_back(now);
        while stats.recent_failures.len() > self.config.failure_threshold.max(1) {
            stats.recent_failures.pop_front();
        }

        match stats.state {
            CircuitState::Closed => {
                if stats.recent_failures.len() >= self.config.failure_threshold {
                    stats.state = CircuitState::Open;
                    stats.opened_at = Some(now);
                    stats.opened_at_wall = Some(Utc::now());
                    warn!(
                        tool_id = %tool_id,
                        consecutive_failures = stats.recent_failures.len(),
                        threshold = self.config.failure_threshold,
                        "Circuit OPEN: failure threshold reached"
                    );
                    counter!("circuit_breaker.opened", 1, "tool" => tool_id.to_string());
                    self.push_transition(tool_id, CircuitState::Closed, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                stats.state = CircuitState::Open;
                stats.opened_at = Some(now);
                stats.opened_at_wall = Some(Utc::now());
                warn!(tool_id = %tool_id, "Circuit REOPENED: trial call failed");
                counter!("circuit_breaker.opened", 1, "tool" => tool_id.to_string());
                self.push_transition(tool_id, CircuitState::HalfOpen, CircuitState::Open);
            }
            CircuitState::Open => {}
        }

        stats.state
    }

    /// Administrative reset of one circuit to closed
    pub fn reset(&self, tool_id: &str) {
        let mut circuits = self.circuits.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(stats) = circuits.get_mut(tool_id) {
            let from = stats.state;
            stats.state = CircuitState::Closed;
            stats.recent_failures.clear();
            stats.opened_at = None;
            stats.opened_at_wall = None;
            info!(tool_id = %tool_id, previous = %from, "Circuit manually reset to CLOSED state");
            if from != CircuitState::Closed {
                self.push_transition(tool_id, from, CircuitState::Closed);
            }
        }
    }

    /// Forgets every circuit and the transition history
    pub fn reset_all(&self) {
        self.circuits
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.transitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!("All circuits reset");
    }

    /// Recorded state transitions, oldest first
    pub fn transitions(&self) -> Vec<CircuitTransition> {
        self.transitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    fn push_transition(&self, tool_id: &str, from: CircuitState, to: CircuitState) {
        let mut transitions = self.transitions.write().unwrap_or_else(PoisonError::into_inner);
        transitions.push_back(CircuitTransition {
            tool_id: tool_id.to_string(),
            from,
            to,
            at: Utc::now(),
        });
        while transitions.len() > self.config.history_limit {
            transitions.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn registry(cool_down_ms: u64) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 5,
            cool_down: Duration::from_millis(cool_down_ms),
            failure_window: Duration::from_secs(60),
            history_limit: 16,
        })
    }

    #[test]
    fn opens_exactly_at_threshold() {
        let cb = registry(1_000);
        for _ in 0..4 {
            assert_eq!(cb.record_failure("slack"), CircuitState::Closed);
        }
        assert!(!cb.is_open("slack"));
        assert_eq!(cb.record_failure("slack"), CircuitState::Open);
        assert!(cb.is_open("slack"));
        assert_eq!(cb.snapshot("slack").consecutive_failures, 5);
        assert!(cb.snapshot("slack").opened_at.is_some());
    }

    #[test]
    fn success_resets_consecutive_count() {
        let cb = registry(1_000);
        for _ in 0..4 {
            cb.record_failure("gmail");
        }
        cb.record_success("gmail");
        for _ in 0..4 {
            cb.record_failure("gmail");
        }
        assert_eq!(cb.state("gmail"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_after_cool_down() {
        let cb = registry(100);
        for _ in 0..5 {
            cb.record_failure("sheets");
        }
        assert!(cb.is_open("sheets"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!cb.is_open("sheets"));
        assert_eq!(cb.state("sheets"), CircuitState::HalfOpen);

        cb.record_success("sheets");
        assert_eq!(cb.state("sheets"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let cb = registry(100);
        for _ in 0..5 {
            cb.record_failure("crm");
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!cb.is_open("crm"));

        assert_eq!(cb.record_failure("crm"), CircuitState::Open);
        assert!(cb.is_open("crm"));

        let transitions: Vec<_> = cb.transitions().into_iter().map(|t| t.to).collect();
        assert_eq!(
            transitions,
            vec![CircuitState::Open, CircuitState::HalfOpen, CircuitState::Open]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stale_failures_are_not_consecutive() {
        let cb = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_window: Duration::from_millis(50),
            ..CircuitBreakerConfig::default()
        });
        for _ in 0..4 {
            cb.record_failure("drive");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        cb.record_failure("drive");
        assert_eq!(cb.state("drive"), CircuitState::Closed);
        assert_eq!(cb.snapshot("drive").consecutive_failures, 1);
    }

    #[test]
    fn manual_reset_closes_circuit() {
        let cb = registry(60_000);
        for _ in 0..5 {
            cb.record_failure("hubspot");
        }
        assert!(cb.is_open("hubspot"));
        cb.reset("hubspot");
        assert!(!cb.is_open("hubspot"));
        assert_eq!(cb.state("hubspot"), CircuitState::Closed);
    }

    #[test]
    fn concurrent_failures_are_serialized() {
        let cb = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1_000,
            ..CircuitBreakerConfig::default()
        }));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cb = cb.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        cb.record_failure("notion");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cb.snapshot("notion").total_failures, 400);
    }
}
