//! Layered settings: defaults, an optional file, then `AUTOPILOT__*`
//! environment variables.
//!
//! Durations are given in milliseconds (`healing.base_delay_ms`,
//! `circuit_breaker.cool_down_ms`, `execution.task_timeout_ms`, ...).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config, Environment, File};
use self_healing::{
    CircuitBreakerConfig, HealingConfig, HealingEngine, LoggingConfig, PatternLearnerConfig,
    ResilienceStores,
};
use tracing::debug;

use crate::config::ExecutionConfig;
use crate::error::Result;

pub const ENV_PREFIX: &str = "AUTOPILOT";

#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    pub healing: HealingConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub patterns: PatternLearnerConfig,
    pub execution: ExecutionConfig,
    pub logging: LoggingConfig,
}

impl EngineSettings {
    /// Loads `.env` when present, then layers `path` (if any) and the
    /// environment over the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let mut builder = Config::builder();
        if let Some(path) = path {
            debug!(path = %path.display(), "Loading settings file");
            builder = builder.add_source(File::from(path).required(true));
        }
        let cfg = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;
        Self::from_config(&cfg)
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let mut settings = Self::default();

        let healing = &mut settings.healing;
        set(cfg, "healing.max_attempts", &mut healing.max_attempts)?;
        set_ms(cfg, "healing.base_delay_ms", &mut healing.base_delay)?;
        set_ms(cfg, "healing.max_delay_ms", &mut healing.max_delay)?;
        set(cfg, "healing.jitter_factor", &mut healing.jitter_factor)?;
        set_ms(cfg, "healing.max_rate_limit_wait_ms", &mut healing.max_rate_limit_wait)?;
        set_ms(cfg, "healing.max_duration_ms", &mut healing.max_duration)?;
        set_ms(cfg, "healing.callback_timeout_ms", &mut healing.callback_timeout)?;

        let breaker = &mut settings.circuit_breaker;
        set(cfg, "circuit_breaker.failure_threshold", &mut breaker.failure_threshold)?;
        set_ms(cfg, "circuit_breaker.cool_down_ms", &mut breaker.cool_down)?;
        set_ms(cfg, "circuit_breaker.failure_window_ms", &mut breaker.failure_window)?;
        set(cfg, "circuit_breaker.history_limit", &mut breaker.history_limit)?;

        let patterns = &mut settings.patterns;
        set(cfg, "patterns.initial_confidence", &mut patterns.initial_confidence)?;
        set(cfg, "patterns.learning_rate", &mut patterns.learning_rate)?;
        set(cfg, "patterns.decay_rate", &mut patterns.decay_rate)?;
        set(cfg, "patterns.max_patterns", &mut patterns.max_patterns)?;

        let execution = &mut settings.execution;
        set(cfg, "execution.max_budget", &mut execution.max_budget)?;
        set(cfg, "execution.enable_tool_research", &mut execution.enable_tool_research)?;
        set(cfg, "execution.enable_integration_setup", &mut execution.enable_integration_setup)?;
        set(cfg, "execution.max_retries", &mut execution.max_retries)?;
        set(cfg, "execution.max_concurrent_tasks", &mut execution.max_concurrent_tasks)?;
        set_ms(cfg, "execution.task_timeout_ms", &mut execution.task_timeout)?;
        set_ms(cfg, "execution.observer_timeout_ms", &mut execution.observer_timeout)?;

        settings.logging = LoggingConfig::try_from(cfg.clone())?;
        Ok(settings)
    }

    /// Healing engine with fresh shared stores built from these settings
    pub fn healing_engine(&self) -> Arc<HealingEngine> {
        let stores = ResilienceStores::new(self.circuit_breaker.clone(), self.patterns.clone());
        Arc::new(HealingEngine::new(self.healing.clone(), stores))
    }
}

/// Overwrites `target` when `key` is present; a present but malformed value
/// is an error.
fn set<T: serde::de::DeserializeOwned>(cfg: &Config, key: &str, target: &mut T) -> Result<()> {
    match cfg.get::<T>(key) {
        Ok(value) => {
            *target = value;
            Ok(())
        }
        Err(config::ConfigError::NotFound(_)) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn set_ms(cfg: &Config, key: &str, target: &mut Duration) -> Result<()> {
    let mut millis = target.as_millis() as u64;
    set(cfg, key, &mut millis)?;
    *target = Duration::from_millis(millis);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_without_sources() {
        let settings = EngineSettings::from_config(&Config::builder().build().unwrap()).unwrap();
        assert_eq!(settings.healing.max_attempts, 3);
        assert_eq!(settings.circuit_breaker.failure_threshold, 5);
        assert_eq!(settings.execution.max_concurrent_tasks, 4);
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autopilot.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[healing]
max_attempts = 5
base_delay_ms = 250

[circuit_breaker]
cool_down_ms = 10000

[execution]
max_budget = 50.0
enable_tool_research = false

[logging]
level = "debug"
"#
        )
        .unwrap();

        let settings = EngineSettings::load(Some(&path)).unwrap();
        assert_eq!(settings.healing.max_attempts, 5);
        assert_eq!(settings.healing.base_delay, Duration::from_millis(250));
        assert_eq!(settings.circuit_breaker.cool_down, Duration::from_secs(10));
        assert_eq!(settings.execution.max_budget, 50.0);
        assert!(!settings.execution.enable_tool_research);
        assert_eq!(settings.logging.level, "debug");
        assert_eq!(settings.healing_engine().config().max_attempts, 5);
    }

    #[test]
    fn malformed_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[healing]\nmax_attempts = \"many\"\n").unwrap();
        assert!(EngineSettings::load(Some(&path)).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(EngineSettings::load(Some(&dir.path().join("absent.toml"))).is_err());
    }
}
