//! # Pattern Learner
//!
//! Tracks how well each healing strategy works for a given
//! (integration, error type) pair. Shared by every execution in the
//! process; the store is bounded and evicts the least-confident pattern
//! (oldest first on ties) when full.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::types::{ConnectionErrorType, HealingStrategy};

const SNAPSHOT_VERSION: u32 = 1;

/// Learning parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternLearnerConfig {
    pub initial_confidence: f64,
    /// Fraction of the remaining headroom gained on success
    pub learning_rate: f64,
    /// Fraction of the current confidence lost on failure
    pub decay_rate: f64,
    pub max_patterns: usize,
}

impl Default for PatternLearnerConfig {
    fn default() -> Self {
        Self {
            initial_confidence: 0.5,
            learning_rate: 0.2,
            decay_rate: 0.3,
            max_patterns: 1000,
        }
    }
}

/// Observed outcome history of one strategy for one error on one tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearnedPattern {
    pub tool_id: String,
    pub error_type: ConnectionErrorType,
    pub strategy: HealingStrategy,
    pub confidence: f64,
    pub sample_count: u64,
    pub success_count: u64,
    pub last_updated: DateTime<Utc>,
}

impl LearnedPattern {
    pub fn success_rate(&self) -> f64 {
        if self.sample_count == 0 {
            0.0
        } else {
            self.success_count as f64 / self.sample_count as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PatternKey {
    tool_id: String,
    error_type: ConnectionErrorType,
    strategy: HealingStrategy,
}

#[derive(Debug, Serialize, Deserialize)]
struct PatternSnapshot {
    version: u32,
    patterns: Vec<LearnedPattern>,
}

/// Bounded, thread-safe pattern store
#[derive(Debug, Default)]
pub struct PatternLearner {
    config: PatternLearnerConfig,
    patterns: RwLock<HashMap<PatternKey, LearnedPattern>>,
}

impl PatternLearner {
    pub fn new(config: PatternLearnerConfig) -> Self {
        Self {
            config,
            patterns: RwLock::new(HashMap::new()),
        }
    }

    /// Records one strategy outcome and returns the updated pattern
    pub fn record(
        &self,
        tool_id: &str,
        error_type: ConnectionErrorType,
        strategy: HealingStrategy,
        success: bool,
    ) -> LearnedPattern {
        let key = PatternKey {
            tool_id: tool_id.to_string(),
            error_type,
            strategy,
        };

        let mut patterns = self.patterns.write().unwrap_or_else(PoisonError::into_inner);
        if !patterns.contains_key(&key) && patterns.len() >= self.config.max_patterns.max(1) {
            Self::evict_one(&mut patterns);
        }

        let pattern = patterns.entry(key).or_insert_with(|| LearnedPattern {
            tool_id: tool_id.to_string(),
            error_type,
            strategy,
            confidence: self.config.initial_confidence,
            sample_count: 0,
            success_count: 0,
            last_updated: Utc::now(),
        });

        pattern.sample_count += 1;
        if success {
            pattern.success_count += 1;
            pattern.confidence += (1.0 - pattern.confidence) * self.config.learning_rate;
        } else {
            pattern.confidence -= pattern.confidence * self.config.decay_rate;
        }
        pattern.confidence = pattern.confidence.clamp(0.0, 1.0);
        pattern.last_updated = Utc::now();

        debug!(
            tool_id = %tool_id,
            error_type = %error_type,
            strategy = strategy.as_str(),
            success,
            confidence = pattern.confidence,
            "Pattern updated"
        );

        pattern.clone()
    }

    fn evict_one(patterns: &mut HashMap<PatternKey, LearnedPattern>) {
        let victim = patterns
            .iter()
            .min_by(|(_, a), (_, b)| {
                a.confidence
                    .total_cmp(&b.confidence)
                    .then_with(|| a.last_updated.cmp(&b.last_updated))
            })
            .map(|(key, _)| key.clone());

        if let Some(key) = victim {
            debug!(tool_id = %key.tool_id, error_type = %key.error_type, "Evicting pattern");
            patterns.remove(&key);
        }
    }

    /// Pattern for an exact (tool, error, strategy) triple
    pub fn get(
        &self,
        tool_id: &str,
        error_type: ConnectionErrorType,
        strategy: HealingStrategy,
    ) -> Option<LearnedPattern> {
        let key = PatternKey {
            tool_id: tool_id.to_string(),
            error_type,
            strategy,
        };
        self.patterns
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
    }

    /// Most confident strategy seen at least `min_samples` times
    pub fn best_strategy(
        &self,
        tool_id: &str,
        error_type: ConnectionErrorType,
        min_samples: u64,
    ) -> Option<LearnedPattern> {
        self.patterns
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|p| p.tool_id == tool_id && p.error_type == error_type)
            .filter(|p| p.sample_count >= min_samples)
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
            .cloned()
    }

    /// All patterns for one tool, most confident first
    pub fn patterns_for(&self, tool_id: &str) -> Vec<LearnedPattern> {
        let mut found: Vec<_> = self
            .patterns
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|p| p.tool_id == tool_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        found
    }

    pub fn len(&self) -> usize {
        self.patterns.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.patterns
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Serializes every pattern to a JSON snapshot
    pub fn export(&self) -> Result<String> {
        let mut patterns: Vec<_> = self
            .patterns
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        patterns.sort_by(|a, b| a.last_updated.cmp(&b.last_updated));
        let snapshot = PatternSnapshot {
            version: SNAPSHOT_VERSION,
            patterns,
        };
        Ok(serde_json::to_string(&snapshot)?)
    }

    /// Merges a JSON snapshot into the store; imported patterns replace
    /// existing ones with the same key. Returns the number imported.
    pub fn import(&self, json: &str) -> Result<usize> {
        let snapshot: PatternSnapshot = serde_json::from_str(json)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StoreError::UnsupportedVersion(snapshot.version));
        }

        let count = snapshot.patterns.len();
        let mut patterns = self.patterns.write().unwrap_or_else(PoisonError::into_inner);
        for pattern in snapshot.patterns {
            let key = PatternKey {
                tool_id: pattern.tool_id.clone(),
                error_type: pattern.error_type,
                strategy: pattern.strategy,
            };
            if !patterns.contains_key(&key) && patterns.len() >= self.config.max_patterns.max(1) {
                Self::evict_one(&mut patterns);
            }
            patterns.insert(key, pattern);
        }
        info!(count, "Imported learned patterns");
        Ok(count)
    }
}
