//! # Self-Healing
//!
//! Error classification and automatic recovery for calls to unreliable
//! third-party integrations.
//!
//! ## Features
//!
//! - Normalization of arbitrary failure shapes into a closed set of error types
//! - Per-integration circuit breakers shared across executions
//! - Retry with exponential backoff and jitter, credential refresh,
//!   rate-limit waits and schema adaptation
//! - Escalation to injected decision handlers with bounded user options
//! - Pattern learning of strategy outcomes per integration and error type
//! - Structured logging bootstrap and healing metrics
//!

pub mod circuit_breaker;
pub mod classifier;
pub mod engine;
pub mod error;
pub mod escalation;
pub mod logging;
pub mod pattern_learner;
pub mod retry;
pub mod schema;
pub mod stats;
pub mod types;

// Re-export commonly used types
pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerState, CircuitState,
    CircuitTransition,
};
pub use classifier::{
    classify_error, detect_error, parse_retry_after, ClassificationContext, ExpectedShape,
    RawError,
};
pub use engine::{
    ActiveSession, AttemptContext, HealingAttempt, HealingConfig, HealingEngine, HealingRequest,
    HealingResult, ResilienceStores, RetryableOperation,
};
pub use error::{LoggingError, StoreError};
pub use escalation::{
    ConnectionInfo, CredentialRefresher, EscalationContext, EscalationHandler, FixedDecision,
};
pub use logging::{init_logging, LoggingConfig};
pub use pattern_learner::{LearnedPattern, PatternLearner, PatternLearnerConfig};
pub use retry::BackoffPolicy;
pub use schema::adapt_to_shape;
pub use stats::{HealingMetrics, StrategyStats};
pub use types::{
    ConnectionErrorType, ErrorClassification, EscalationDecision, HealingStrategy, UserOption,
};
