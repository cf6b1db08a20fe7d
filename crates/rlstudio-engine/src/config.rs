//! Engine configuration.
//!
//! Configuration precedence:
//! 1. Environment variables (`RLSTUDIO_*`)
//! 2. TOML config file
//! 3. Defaults

use crate::job::HyperParams;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "RLSTUDIO_";

/// Local config file picked up when no explicit path is given.
pub const LOCAL_CONFIG_FILE: &str = "rlstudio.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    #[error("Failed to read configuration file: {0}")]
    ReadError(String),

    #[error("Failed to parse configuration file: {0}")]
    ParseError(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Steps added per loop iteration.
    pub step_increment: u64,
    /// Pause between increments, in milliseconds.
    pub step_delay_ms: u64,
    /// `total_steps` for jobs that don't specify one.
    pub default_total_steps: u64,
    /// Simulated latency of dataset/evaluation/synthesis work, in milliseconds.
    pub processing_delay_ms: u64,
    /// Upper bound on generated examples per synthesis request.
    pub synthesis_batch_cap: u64,
    /// Upper bound on judged examples kept per evaluation.
    pub evaluation_example_cap: usize,
    /// Metrics points retained per job.
    pub metrics_history_limit: usize,
    /// Live observers allowed per job.
    pub max_subscribers_per_job: usize,
    pub default_hyperparams: HyperParams,
    /// When set, state is persisted to this JSON file.
    pub store_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_increment: 100,
            step_delay_ms: 100,
            default_total_steps: 1000,
            processing_delay_ms: 2000,
            synthesis_batch_cap: 50,
            evaluation_example_cap: 3,
            metrics_history_limit: 500,
            max_subscribers_per_job: 8,
            default_hyperparams: HyperParams::default(),
            store_path: None,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }

    #[must_use]
    pub fn processing_delay(&self) -> Duration {
        Duration::from_millis(self.processing_delay_ms)
    }

    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;

        toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))
    }

    /// Discover and load configuration.
    ///
    /// Reads `explicit` if given (it must exist), otherwise `./rlstudio.toml` if
    /// present, then applies environment overrides and validates the result.
    pub fn discover_and_load(explicit: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match explicit {
            Some(path) => Self::load_from_file(path)?,
            None => {
                let local = PathBuf::from(LOCAL_CONFIG_FILE);
                if local.exists() { Self::load_from_file(&local)? } else { Self::default() }
            }
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `RLSTUDIO_*` overrides read through `lookup`.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> ConfigResult<()> {
        fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> ConfigResult<T> {
            raw.trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(format!("{key}={raw}")))
        }

        let var = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key).map(|raw| (key, raw))
        };

        if let Some((key, raw)) = var("STEP_INCREMENT") {
            self.step_increment = parse(&key, &raw)?;
        }
        if let Some((key, raw)) = var("STEP_DELAY_MS") {
            self.step_delay_ms = parse(&key, &raw)?;
        }
        if let Some((key, raw)) = var("DEFAULT_TOTAL_STEPS") {
            self.default_total_steps = parse(&key, &raw)?;
        }
        if let Some((key, raw)) = var("PROCESSING_DELAY_MS") {
            self.processing_delay_ms = parse(&key, &raw)?;
        }
        if let Some((key, raw)) = var("SYNTHESIS_BATCH_CAP") {
            self.synthesis_batch_cap = parse(&key, &raw)?;
        }
        if let Some((key, raw)) = var("METRICS_HISTORY_LIMIT") {
            self.metrics_history_limit = parse(&key, &raw)?;
        }
        if let Some((key, raw)) = var("EVALUATION_EXAMPLE_CAP") {
            self.evaluation_example_cap = parse(&key, &raw)?;
        }
        if let Some((key, raw)) = var("MAX_SUBSCRIBERS_PER_JOB") {
            self.max_subscribers_per_job = parse(&key, &raw)?;
        }
        if let Some((_, raw)) = var("STORE_PATH") {
            self.store_path = Some(PathBuf::from(raw));
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.step_increment == 0 {
            return Err(ConfigError::InvalidValue("step_increment must be >= 1".to_string()));
        }
        if self.default_total_steps == 0 {
            return Err(ConfigError::InvalidValue("default_total_steps must be >= 1".to_string()));
        }
        if self.synthesis_batch_cap == 0 {
            return Err(ConfigError::InvalidValue("synthesis_batch_cap must be >= 1".to_string()));
        }
        if self.evaluation_example_cap == 0 {
            return Err(ConfigError::InvalidValue("evaluation_example_cap must be >= 1".to_string()));
        }
        if self.metrics_history_limit == 0 {
            return Err(ConfigError::InvalidValue("metrics_history_limit must be >= 1".to_string()));
        }
        if self.max_subscribers_per_job == 0 {
            return Err(ConfigError::InvalidValue(
                "max_subscribers_per_job must be >= 1".to_string(),
            ));
        }
        self.default_hyperparams
            .validate()
            .map_err(|e| ConfigError::InvalidValue(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_reference_behaviour() {
        let config = EngineConfig::default();
        assert_eq!(config.step_increment, 100);
        assert_eq!(config.default_total_steps, 1000);
        assert_eq!(config.synthesis_batch_cap, 50);
        assert_eq!(config.step_delay(), Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rlstudio.toml");
        std::fs::write(
            &path,
            "step_increment = 25\nstep_delay_ms = 5\n\n[default_hyperparams]\nbatch_size = 8\nuse_grpo = false\n",
        )
        .unwrap();

        let config = EngineConfig::load_from_file(&path).unwrap();
        assert_eq!(config.step_increment, 25);
        assert_eq!(config.step_delay_ms, 5);
        assert_eq!(config.default_total_steps, 1000);
        assert_eq!(config.default_hyperparams.batch_size, 8);
        assert!(!config.default_hyperparams.use_grpo);
        assert_eq!(config.default_hyperparams.epochs, HyperParams::default().epochs);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_hyperparams_table_accepts_camel_case() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rlstudio.toml");
        std::fs::write(&path, "[default_hyperparams]\nlearningRate = 0.001\nuseGRPO = false\n").unwrap();

        let config = EngineConfig::load_from_file(&path).unwrap();
        assert!((config.default_hyperparams.learning_rate - 0.001).abs() < f64::EPSILON);
        assert!(!config.default_hyperparams.use_grpo);
    }

    #[test]
    fn test_missing_and_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(EngineConfig::load_from_file(&missing), Err(ConfigError::NotFound(_))));

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "step_increment = \"lots\"").unwrap();
        assert!(matches!(EngineConfig::load_from_file(&bad), Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("RLSTUDIO_STEP_DELAY_MS", "1"),
            ("RLSTUDIO_SYNTHESIS_BATCH_CAP", "20"),
            ("RLSTUDIO_STORE_PATH", "/tmp/rlstudio.json"),
            ("RLSTUDIO_EVALUATION_EXAMPLE_CAP", "5"),
            ("RLSTUDIO_MAX_SUBSCRIBERS_PER_JOB", "2"),
        ]);
        let mut config = EngineConfig::default();
        config.apply_env_overrides(|k| vars.get(k).map(|v| (*v).to_string())).unwrap();

        assert_eq!(config.step_delay_ms, 1);
        assert_eq!(config.synthesis_batch_cap, 20);
        assert_eq!(config.store_path, Some(PathBuf::from("/tmp/rlstudio.json")));
        assert_eq!(config.evaluation_example_cap, 5);
        assert_eq!(config.max_subscribers_per_job, 2);

        let err = config
            .apply_env_overrides(|k| (k == "RLSTUDIO_STEP_INCREMENT").then(|| "x".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn test_validate_rejects_zero_increment() {
        let config = EngineConfig { step_increment: 0, ..EngineConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_caps() {
        let zeroed = [
            EngineConfig { synthesis_batch_cap: 0, ..EngineConfig::default() },
            EngineConfig { evaluation_example_cap: 0, ..EngineConfig::default() },
            EngineConfig { metrics_history_limit: 0, ..EngineConfig::default() },
            EngineConfig { max_subscribers_per_job: 0, ..EngineConfig::default() },
        ];
        for config in zeroed {
            assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))), "{config:?}");
        }
    }
}
