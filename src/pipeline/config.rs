//! Process-level engine configuration.
//!
//! Holds the knobs that apply to every run handled by this process: per-call
//! timeouts, retry bounds, Elo constants, default concurrency limits, storage
//! location and progress logging cadence. The value is built once at startup
//! and handed to the orchestrator and its collaborators by reference.

use std::time::Duration;
use thiserror::Error;

use crate::evaluation::elo::EloCalculator;
use crate::evaluation::retry::RetryPolicy;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A run configuration file could not be parsed.
    #[error("Invalid run configuration file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Configuration shared by every run executed in this process.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // Call timeouts
    /// Timeout for a single Generator call.
    pub generation_timeout: Duration,
    /// Timeout for a single Judge call.
    pub judge_timeout: Duration,

    // Retry settings
    /// Maximum attempts for a generation call on transient errors.
    pub generation_max_attempts: u32,
    /// Maximum attempts for a judge call on transient errors.
    pub judge_max_attempts: u32,
    /// Maximum attempts when a judge response fails to parse.
    pub judge_parse_attempts: u32,
    /// Initial backoff between retries.
    pub backoff_base: Duration,
    /// Upper bound on the backoff between retries.
    pub backoff_max: Duration,

    // Ranking
    /// Elo K-factor.
    pub elo_k_factor: f64,
    /// Rating every candidate starts a pairwise phase with.
    pub elo_baseline: f64,

    // Concurrency defaults, used when a run does not set its own limits
    pub default_generation_concurrency: usize,
    pub default_evaluation_concurrency: usize,

    // Storage
    /// SQLite connection URL.
    pub database_url: String,

    // Observability
    /// Interval of the background progress log.
    pub progress_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            generation_timeout: Duration::from_secs(600),
            judge_timeout: Duration::from_secs(180),

            generation_max_attempts: 2,
            judge_max_attempts: 3,
            judge_parse_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),

            elo_k_factor: 32.0,
            elo_baseline: 1000.0,

            default_generation_concurrency: 4,
            default_evaluation_concurrency: 8,

            database_url: "sqlite://evalforge.db".to_string(),

            progress_interval: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `EVALFORGE_GENERATION_TIMEOUT_SECS` (default: 600)
    /// - `EVALFORGE_JUDGE_TIMEOUT_SECS` (default: 180)
    /// - `EVALFORGE_GENERATION_MAX_ATTEMPTS` (default: 2)
    /// - `EVALFORGE_JUDGE_MAX_ATTEMPTS` (default: 3)
    /// - `EVALFORGE_JUDGE_PARSE_ATTEMPTS` (default: 3)
    /// - `EVALFORGE_BACKOFF_BASE_MS` (default: 1000)
    /// - `EVALFORGE_BACKOFF_MAX_MS` (default: 30000)
    /// - `EVALFORGE_ELO_K_FACTOR` (default: 32)
    /// - `EVALFORGE_ELO_BASELINE` (default: 1000)
    /// - `EVALFORGE_GENERATION_CONCURRENCY` (default: 4)
    /// - `EVALFORGE_EVALUATION_CONCURRENCY` (default: 8)
    /// - `EVALFORGE_DATABASE_URL`, falling back to `DATABASE_URL`
    /// - `EVALFORGE_PROGRESS_INTERVAL_SECS` (default: 30)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the result
    /// does not validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("EVALFORGE_GENERATION_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "EVALFORGE_GENERATION_TIMEOUT_SECS")?;
            config.generation_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("EVALFORGE_JUDGE_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "EVALFORGE_JUDGE_TIMEOUT_SECS")?;
            config.judge_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("EVALFORGE_GENERATION_MAX_ATTEMPTS") {
            config.generation_max_attempts =
                parse_env_value(&val, "EVALFORGE_GENERATION_MAX_ATTEMPTS")?;
        }

        if let Ok(val) = std::env::var("EVALFORGE_JUDGE_MAX_ATTEMPTS") {
            config.judge_max_attempts = parse_env_value(&val, "EVALFORGE_JUDGE_MAX_ATTEMPTS")?;
        }

        if let Ok(val) = std::env::var("EVALFORGE_JUDGE_PARSE_ATTEMPTS") {
            config.judge_parse_attempts = parse_env_value(&val, "EVALFORGE_JUDGE_PARSE_ATTEMPTS")?;
        }

        if let Ok(val) = std::env::var("EVALFORGE_BACKOFF_BASE_MS") {
            let ms: u64 = parse_env_value(&val, "EVALFORGE_BACKOFF_BASE_MS")?;
            config.backoff_base = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("EVALFORGE_BACKOFF_MAX_MS") {
            let ms: u64 = parse_env_value(&val, "EVALFORGE_BACKOFF_MAX_MS")?;
            config.backoff_max = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("EVALFORGE_ELO_K_FACTOR") {
            config.elo_k_factor = parse_env_value(&val, "EVALFORGE_ELO_K_FACTOR")?;
        }

        if let Ok(val) = std::env::var("EVALFORGE_ELO_BASELINE") {
            config.elo_baseline = parse_env_value(&val, "EVALFORGE_ELO_BASELINE")?;
        }

        if let Ok(val) = std::env::var("EVALFORGE_GENERATION_CONCURRENCY") {
            config.default_generation_concurrency =
                parse_env_value(&val, "EVALFORGE_GENERATION_CONCURRENCY")?;
        }

        if let Ok(val) = std::env::var("EVALFORGE_EVALUATION_CONCURRENCY") {
            config.default_evaluation_concurrency =
                parse_env_value(&val, "EVALFORGE_EVALUATION_CONCURRENCY")?;
        }

        if let Ok(val) =
            std::env::var("EVALFORGE_DATABASE_URL").or_else(|_| std::env::var("DATABASE_URL"))
        {
            config.database_url = val;
        }

        if let Ok(val) = std::env::var("EVALFORGE_PROGRESS_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "EVALFORGE_PROGRESS_INTERVAL_SECS")?;
            config.progress_interval = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.generation_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "generation_timeout must be greater than 0".to_string(),
            ));
        }

        if self.judge_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "judge_timeout must be greater than 0".to_string(),
            ));
        }

        if self.generation_max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "generation_max_attempts must be at least 1".to_string(),
            ));
        }

        if self.judge_max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "judge_max_attempts must be at least 1".to_string(),
            ));
        }

        if self.judge_parse_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "judge_parse_attempts must be at least 1".to_string(),
            ));
        }

        if self.backoff_base > self.backoff_max {
            return Err(ConfigError::ValidationFailed(
                "backoff_base cannot exceed backoff_max".to_string(),
            ));
        }

        if !(self.elo_k_factor > 0.0) {
            return Err(ConfigError::ValidationFailed(
                "elo_k_factor must be greater than 0".to_string(),
            ));
        }

        if !self.elo_baseline.is_finite() || self.elo_baseline <= 0.0 {
            return Err(ConfigError::ValidationFailed(
                "elo_baseline must be a positive number".to_string(),
            ));
        }

        if self.default_generation_concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "default_generation_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.default_evaluation_concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "default_evaluation_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url cannot be empty".to_string(),
            ));
        }

        if self.progress_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "progress_interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Retry policy applied to generation calls.
    pub fn generation_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.generation_max_attempts, self.backoff_base, self.backoff_max)
    }

    /// Retry policy applied to judge calls.
    pub fn judge_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.judge_max_attempts, self.backoff_base, self.backoff_max)
    }

    /// Elo calculator seeded with the configured constants.
    pub fn elo(&self) -> EloCalculator {
        EloCalculator::new(self.elo_k_factor, self.elo_baseline)
    }

    /// Builder method to set the generation call timeout.
    pub fn with_generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout = timeout;
        self
    }

    /// Builder method to set the judge call timeout.
    pub fn with_judge_timeout(mut self, timeout: Duration) -> Self {
        self.judge_timeout = timeout;
        self
    }

    /// Builder method to set generation retry attempts.
    pub fn with_generation_max_attempts(mut self, attempts: u32) -> Self {
        self.generation_max_attempts = attempts;
        self
    }

    /// Builder method to set judge retry attempts.
    pub fn with_judge_max_attempts(mut self, attempts: u32) -> Self {
        self.judge_max_attempts = attempts;
        self
    }

    /// Builder method to set judge parse attempts.
    pub fn with_judge_parse_attempts(mut self, attempts: u32) -> Self {
        self.judge_parse_attempts = attempts;
        self
    }

    /// Builder method to set retry backoff bounds.
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    /// Builder method to set the Elo K-factor.
    pub fn with_elo_k_factor(mut self, k: f64) -> Self {
        self.elo_k_factor = k;
        self
    }

    /// Builder method to set the Elo baseline rating.
    pub fn with_elo_baseline(mut self, baseline: f64) -> Self {
        self.elo_baseline = baseline;
        self
    }

    /// Builder method to set default concurrency limits.
    pub fn with_default_concurrency(mut self, generation: usize, evaluation: usize) -> Self {
        self.default_generation_concurrency = generation;
        self.default_evaluation_concurrency = evaluation;
        self
    }

    /// Builder method to set database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Builder method to set the progress log interval.
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.generation_timeout, Duration::from_secs(600));
        assert_eq!(config.judge_timeout, Duration::from_secs(180));
        assert_eq!(config.generation_max_attempts, 2);
        assert_eq!(config.judge_max_attempts, 3);
        assert_eq!(config.judge_parse_attempts, 3);
        assert!((config.elo_k_factor - 32.0).abs() < f64::EPSILON);
        assert!((config.elo_baseline - 1000.0).abs() < f64::EPSILON);
        assert_eq!(config.default_generation_concurrency, 4);
        assert_eq!(config.default_evaluation_concurrency, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new()
            .with_generation_timeout(Duration::from_secs(60))
            .with_judge_timeout(Duration::from_secs(30))
            .with_generation_max_attempts(1)
            .with_judge_parse_attempts(5)
            .with_backoff(Duration::from_millis(10), Duration::from_millis(100))
            .with_elo_k_factor(16.0)
            .with_elo_baseline(1500.0)
            .with_default_concurrency(2, 3)
            .with_database_url("sqlite::memory:");

        assert_eq!(config.generation_timeout, Duration::from_secs(60));
        assert_eq!(config.judge_timeout, Duration::from_secs(30));
        assert_eq!(config.generation_max_attempts, 1);
        assert_eq!(config.judge_parse_attempts, 5);
        assert_eq!(config.backoff_max, Duration::from_millis(100));
        assert!((config.elo_baseline - 1500.0).abs() < f64::EPSILON);
        assert_eq!(config.default_generation_concurrency, 2);
        assert_eq!(config.default_evaluation_concurrency, 3);
        assert_eq!(config.database_url, "sqlite::memory:");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_zero_timeout() {
        let config = EngineConfig::default().with_generation_timeout(Duration::ZERO);
        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("generation_timeout"));
    }

    #[test]
    fn test_validation_zero_attempts() {
        let config = EngineConfig::default().with_judge_parse_attempts(0);
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("judge_parse_attempts"));
    }

    #[test]
    fn test_validation_backoff_order() {
        let config =
            EngineConfig::default().with_backoff(Duration::from_secs(10), Duration::from_secs(1));
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("backoff_base"));
    }

    #[test]
    fn test_validation_invalid_elo() {
        let config = EngineConfig::default().with_elo_k_factor(0.0);
        assert!(config.validate().is_err());

        let config = EngineConfig::default().with_elo_k_factor(f64::NAN);
        assert!(config.validate().is_err());

        let config = EngineConfig::default().with_elo_baseline(-1.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_zero_concurrency() {
        let config = EngineConfig::default().with_default_concurrency(0, 1);
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("default_generation_concurrency"));
    }

    #[test]
    fn test_retry_policies_follow_config() {
        let config = EngineConfig::default().with_generation_max_attempts(4);
        assert_eq!(config.generation_retry().max_attempts(), 4);
        assert_eq!(config.judge_retry().max_attempts(), 3);
    }

    #[test]
    fn test_parse_env_value() {
        let value: u64 = parse_env_value("42", "KEY").unwrap();
        assert_eq!(value, 42);

        let err = parse_env_value::<u64>("forty", "KEY").unwrap_err();
        assert!(err.to_string().contains("KEY"));
        assert!(err.to_string().contains("forty"));
    }
}
