//! Engine configuration.
//!
//! Provides configuration for staleness thresholds, retry bounds, provider
//! endpoints, storage, and the watchdog cycle. Values come from defaults,
//! environment variables, or builder-style setters.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::store::PipelineType;

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
}

/// Policy for a completeness-check analysis failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletenessFailurePolicy {
    /// Record the error in metadata and continue (default).
    Skip,
    /// Fail the job.
    Fail,
}

/// Configuration for the orchestration engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // Storage
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Root directory for blob storage.
    pub blob_root: PathBuf,

    // Retry bounds
    /// Maximum quality-check retry passes before select is forced.
    pub max_quality_retries: u32,
    /// Maximum transient-error retries for a single provider call.
    pub provider_max_retries: u32,
    /// Fixed delay between transient retries.
    pub provider_retry_delay: Duration,
    /// Maximum planner-call retries on transient errors.
    pub planner_max_retries: u32,
    /// Fixed delay between planner retries.
    pub planner_retry_delay: Duration,

    // Providers
    /// Base URL of the primary generation provider.
    pub primary_provider_url: String,
    /// Base URL of the fallback generation provider.
    pub fallback_provider_url: String,
    /// Base URL of the planner provider.
    pub planner_provider_url: String,
    /// Bounded timeout for every provider call.
    pub provider_timeout: Duration,

    // Watchdog
    /// Period between watchdog cycles.
    pub watchdog_period: Duration,
    /// Staleness threshold for the try-on composite pipeline.
    pub composite_staleness: Duration,
    /// Staleness threshold for the agent conversation loop.
    pub conversation_staleness: Duration,
    /// Staleness threshold for batch refinement.
    pub refine_staleness: Duration,
    /// Staleness threshold for reframe jobs.
    pub reframe_staleness: Duration,
    /// Pipeline types capped at one concurrently-active job.
    pub slot_limited: Vec<PipelineType>,

    // Policies
    /// What to do when the completeness-check analysis itself fails.
    pub completeness_failure_policy: CompletenessFailurePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/styleforge".to_string(),
            blob_root: PathBuf::from("./blobs"),

            max_quality_retries: 3,
            provider_max_retries: 3,
            provider_retry_delay: Duration::from_secs(2),
            planner_max_retries: 3,
            planner_retry_delay: Duration::from_secs(2),

            primary_provider_url: "http://localhost:8801".to_string(),
            fallback_provider_url: "http://localhost:8802".to_string(),
            planner_provider_url: "http://localhost:8803".to_string(),
            provider_timeout: Duration::from_secs(120),

            watchdog_period: Duration::from_secs(10),
            // Tight loop: single planner call per invocation.
            conversation_staleness: Duration::from_secs(30),
            reframe_staleness: Duration::from_secs(30),
            refine_staleness: Duration::from_secs(45),
            // Multi-provider stages run longer per step.
            composite_staleness: Duration::from_secs(60),
            slot_limited: vec![PipelineType::BatchRefine],

            completeness_failure_policy: CompletenessFailurePolicy::Skip,
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DATABASE_URL`: PostgreSQL connection URL
    /// - `ENGINE_BLOB_ROOT`: Blob storage root (default: ./blobs)
    /// - `ENGINE_MAX_QUALITY_RETRIES`: Quality retry bound (default: 3)
    /// - `ENGINE_PROVIDER_MAX_RETRIES`: Transient retry bound (default: 3)
    /// - `ENGINE_PROVIDER_RETRY_DELAY_SECS`: Retry delay (default: 2)
    /// - `ENGINE_PLANNER_MAX_RETRIES`: Planner retry bound (default: 3)
    /// - `ENGINE_PRIMARY_PROVIDER_URL` / `ENGINE_FALLBACK_PROVIDER_URL` /
    ///   `ENGINE_PLANNER_PROVIDER_URL`: Provider endpoints
    /// - `ENGINE_PROVIDER_TIMEOUT_SECS`: Provider call timeout (default: 120)
    /// - `ENGINE_WATCHDOG_PERIOD_SECS`: Watchdog period (default: 10)
    /// - `ENGINE_COMPLETENESS_POLICY`: "skip" or "fail" (default: skip)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("DATABASE_URL") {
            config.database_url = val;
        }
        if let Ok(val) = std::env::var("ENGINE_BLOB_ROOT") {
            config.blob_root = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("ENGINE_MAX_QUALITY_RETRIES") {
            config.max_quality_retries = parse_env_value(&val, "ENGINE_MAX_QUALITY_RETRIES")?;
        }
        if let Ok(val) = std::env::var("ENGINE_PROVIDER_MAX_RETRIES") {
            config.provider_max_retries = parse_env_value(&val, "ENGINE_PROVIDER_MAX_RETRIES")?;
        }
        if let Ok(val) = std::env::var("ENGINE_PROVIDER_RETRY_DELAY_SECS") {
            let secs: u64 = parse_env_value(&val, "ENGINE_PROVIDER_RETRY_DELAY_SECS")?;
            config.provider_retry_delay = Duration::from_secs(secs);
        }
        if let Ok(val) = std::env::var("ENGINE_PLANNER_MAX_RETRIES") {
            config.planner_max_retries = parse_env_value(&val, "ENGINE_PLANNER_MAX_RETRIES")?;
        }
        if let Ok(val) = std::env::var("ENGINE_PRIMARY_PROVIDER_URL") {
            config.primary_provider_url = val;
        }
        if let Ok(val) = std::env::var("ENGINE_FALLBACK_PROVIDER_URL") {
            config.fallback_provider_url = val;
        }
        if let Ok(val) = std::env::var("ENGINE_PLANNER_PROVIDER_URL") {
            config.planner_provider_url = val;
        }
        if let Ok(val) = std::env::var("ENGINE_PROVIDER_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "ENGINE_PROVIDER_TIMEOUT_SECS")?;
            config.provider_timeout = Duration::from_secs(secs);
        }
        if let Ok(val) = std::env::var("ENGINE_WATCHDOG_PERIOD_SECS") {
            let secs: u64 = parse_env_value(&val, "ENGINE_WATCHDOG_PERIOD_SECS")?;
            config.watchdog_period = Duration::from_secs(secs);
        }
        if let Ok(val) = std::env::var("ENGINE_COMPLETENESS_POLICY") {
            config.completeness_failure_policy = match val.as_str() {
                "skip" => CompletenessFailurePolicy::Skip,
                "fail" => CompletenessFailurePolicy::Fail,
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: "ENGINE_COMPLETENESS_POLICY".to_string(),
                        message: format!("expected 'skip' or 'fail', got '{}'", other),
                    })
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Sets the database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Sets the blob storage root.
    pub fn with_blob_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.blob_root = root.into();
        self
    }

    /// Sets the quality retry bound.
    pub fn with_max_quality_retries(mut self, retries: u32) -> Self {
        self.max_quality_retries = retries;
        self
    }

    /// Sets the transient provider retry bound.
    pub fn with_provider_max_retries(mut self, retries: u32) -> Self {
        self.provider_max_retries = retries;
        self
    }

    /// Sets the transient retry delay.
    pub fn with_provider_retry_delay(mut self, delay: Duration) -> Self {
        self.provider_retry_delay = delay;
        self
    }

    /// Sets the planner retry delay.
    pub fn with_planner_retry_delay(mut self, delay: Duration) -> Self {
        self.planner_retry_delay = delay;
        self
    }

    /// Sets the completeness-check failure policy.
    pub fn with_completeness_policy(mut self, policy: CompletenessFailurePolicy) -> Self {
        self.completeness_failure_policy = policy;
        self
    }

    /// Returns the staleness threshold for a pipeline type.
    pub fn staleness_for(&self, pipeline_type: PipelineType) -> Duration {
        match pipeline_type {
            PipelineType::TryOnComposite => self.composite_staleness,
            PipelineType::AgentConversation => self.conversation_staleness,
            PipelineType::BatchRefine => self.refine_staleness,
            PipelineType::Reframe => self.reframe_staleness,
        }
    }

    /// Returns whether intake for this type is capped at one active job.
    pub fn is_slot_limited(&self, pipeline_type: PipelineType) -> bool {
        self.slot_limited.contains(&pipeline_type)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url must not be empty".to_string(),
            ));
        }
        if self.watchdog_period.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "watchdog_period must be positive".to_string(),
            ));
        }
        if self.provider_max_retries == 0 || self.planner_max_retries == 0 {
            return Err(ConfigError::ValidationFailed(
                "retry bounds must be at least 1".to_string(),
            ));
        }
        for pipeline_type in PipelineType::ALL {
            if self.staleness_for(pipeline_type).is_zero() {
                return Err(ConfigError::ValidationFailed(format!(
                    "staleness threshold for {} must be positive",
                    pipeline_type
                )));
            }
        }
        Ok(())
    }
}

fn parse_env_value<T: std::str::FromStr>(val: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    val.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}
