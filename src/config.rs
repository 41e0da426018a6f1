//! Broker configuration.
//!
//! Defaults cover a single-instance deployment; every value can be
//! overridden from `BROKER_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::broker::BrokerSettings;
use crate::liveness::LivenessSettings;
use crate::scheduler::WorkerPoolConfig;
use crate::storage::{PriorityScope, StoreTimeouts};

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

/// Configuration for a broker instance.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    // Store
    /// PostgreSQL connection URL.
    pub database_url: String,
    pub max_connections: u32,
    pub query_timeout: Duration,
    /// Bound on the claim statement, which may wait on row locks.
    pub claim_timeout: Duration,

    // Command handling
    pub workers: usize,
    pub command_queue_capacity: usize,

    // Liveness
    pub liveness_interval: Duration,
    pub zombie_after: Duration,
    /// Counted from the zombie threshold.
    pub expire_after: Duration,

    // Priorities
    pub priority_interval: Duration,
    pub priority_active_only: bool,

    // Matching
    /// Remote timeout for aggregates that do not carry their own.
    pub remote_timeout_secs: i64,
    pub token_validity: Duration,
    /// Principal the token service issues job tokens under.
    pub token_principal: String,
    pub token_service_url: Option<String>,
    /// YAML site directory; an empty directory is used when unset.
    pub site_directory: Option<PathBuf>,

    /// Label used as the owner of shared periodic-task markers.
    pub instance: String,
    /// Prometheus textfile written periodically while serving.
    pub metrics_file: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let timeouts = StoreTimeouts::default();
        let liveness = LivenessSettings::default();
        let broker = BrokerSettings::default();

        Self {
            database_url: "postgres://localhost/grid_broker".to_string(),
            max_connections: 16,
            query_timeout: timeouts.query_timeout,
            claim_timeout: timeouts.claim_timeout,

            workers: 8,
            command_queue_capacity: 256,

            liveness_interval: liveness.interval,
            zombie_after: liveness.zombie_after,
            expire_after: liveness.expire_after,

            priority_interval: Duration::from_secs(300),
            priority_active_only: true,

            remote_timeout_secs: broker.remote_timeout_secs,
            token_validity: broker.token_validity,
            token_principal: broker.principal,
            token_service_url: None,
            site_directory: None,

            instance: default_instance(),
            metrics_file: None,
        }
    }
}

impl SchedulerConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DATABASE_URL`: PostgreSQL connection URL (required)
    /// - `BROKER_DB_MAX_CONNECTIONS`: Connection pool size (default: 16)
    /// - `BROKER_QUERY_TIMEOUT_SECS`: Statement timeout (default: 30)
    /// - `BROKER_CLAIM_TIMEOUT_SECS`: Claim statement timeout (default: 120)
    /// - `BROKER_WORKERS`: Command workers (default: 8)
    /// - `BROKER_COMMAND_QUEUE_CAPACITY`: Queued commands before back-pressure (default: 256)
    /// - `BROKER_LIVENESS_INTERVAL_SECS`: Liveness sweep interval (default: 300)
    /// - `BROKER_ZOMBIE_AFTER_SECS`: Heartbeat silence before ZOMBIE (default: 3600)
    /// - `BROKER_EXPIRE_AFTER_SECS`: Further silence before EXPIRED (default: 7200)
    /// - `BROKER_PRIORITY_INTERVAL_SECS`: Priority batch interval (default: 300)
    /// - `BROKER_PRIORITY_ACTIVE_ONLY`: Only recompute active users (default: true)
    /// - `BROKER_REMOTE_TIMEOUT_SECS`: Default remote timeout (default: 43200)
    /// - `BROKER_TOKEN_VALIDITY_SECS`: Job token validity (default: 86400)
    /// - `BROKER_TOKEN_PRINCIPAL`: Token principal (default: grid-broker)
    /// - `BROKER_TOKEN_SERVICE_URL`: Token service base URL
    /// - `BROKER_SITE_DIRECTORY`: Site directory YAML file
    /// - `BROKER_INSTANCE`: Instance label (default: host name)
    /// - `BROKER_METRICS_FILE`: Prometheus textfile output path
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or have invalid values.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?;

        if let Ok(val) = std::env::var("BROKER_DB_MAX_CONNECTIONS") {
            config.max_connections = parse_env_value(&val, "BROKER_DB_MAX_CONNECTIONS")?;
        }

        if let Ok(val) = std::env::var("BROKER_QUERY_TIMEOUT_SECS") {
            config.query_timeout = parse_env_secs(&val, "BROKER_QUERY_TIMEOUT_SECS")?;
        }

        if let Ok(val) = std::env::var("BROKER_CLAIM_TIMEOUT_SECS") {
            config.claim_timeout = parse_env_secs(&val, "BROKER_CLAIM_TIMEOUT_SECS")?;
        }

        if let Ok(val) = std::env::var("BROKER_WORKERS") {
            config.workers = parse_env_value(&val, "BROKER_WORKERS")?;
        }

        if let Ok(val) = std::env::var("BROKER_COMMAND_QUEUE_CAPACITY") {
            config.command_queue_capacity = parse_env_value(&val, "BROKER_COMMAND_QUEUE_CAPACITY")?;
        }

        if let Ok(val) = std::env::var("BROKER_LIVENESS_INTERVAL_SECS") {
            config.liveness_interval = parse_env_secs(&val, "BROKER_LIVENESS_INTERVAL_SECS")?;
        }

        if let Ok(val) = std::env::var("BROKER_ZOMBIE_AFTER_SECS") {
            config.zombie_after = parse_env_secs(&val, "BROKER_ZOMBIE_AFTER_SECS")?;
        }

        if let Ok(val) = std::env::var("BROKER_EXPIRE_AFTER_SECS") {
            config.expire_after = parse_env_secs(&val, "BROKER_EXPIRE_AFTER_SECS")?;
        }

        if let Ok(val) = std::env::var("BROKER_PRIORITY_INTERVAL_SECS") {
            config.priority_interval = parse_env_secs(&val, "BROKER_PRIORITY_INTERVAL_SECS")?;
        }

        if let Ok(val) = std::env::var("BROKER_PRIORITY_ACTIVE_ONLY") {
            config.priority_active_only = parse_env_bool(&val, "BROKER_PRIORITY_ACTIVE_ONLY")?;
        }

        if let Ok(val) = std::env::var("BROKER_REMOTE_TIMEOUT_SECS") {
            config.remote_timeout_secs = parse_env_value(&val, "BROKER_REMOTE_TIMEOUT_SECS")?;
        }

        if let Ok(val) = std::env::var("BROKER_TOKEN_VALIDITY_SECS") {
            config.token_validity = parse_env_secs(&val, "BROKER_TOKEN_VALIDITY_SECS")?;
        }

        if let Ok(val) = std::env::var("BROKER_TOKEN_PRINCIPAL") {
            config.token_principal = val;
        }

        if let Ok(val) = std::env::var("BROKER_TOKEN_SERVICE_URL") {
            config.token_service_url = Some(val);
        }

        if let Ok(val) = std::env::var("BROKER_SITE_DIRECTORY") {
            config.site_directory = Some(PathBuf::from(val));
        }

        if let Ok(val) = std::env::var("BROKER_INSTANCE") {
            config.instance = val;
        }

        if let Ok(val) = std::env::var("BROKER_METRICS_FILE") {
            config.metrics_file = Some(PathBuf::from(val));
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
        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url cannot be empty".to_string(),
            ));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_connections must be greater than 0".to_string(),
            ));
        }

        if self.query_timeout.is_zero() || self.claim_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "query_timeout and claim_timeout must be greater than 0".to_string(),
            ));
        }

        if self.workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "workers must be greater than 0".to_string(),
            ));
        }

        if self.command_queue_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "command_queue_capacity must be greater than 0".to_string(),
            ));
        }

        if self.liveness_interval.is_zero() || self.priority_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "liveness_interval and priority_interval must be greater than 0".to_string(),
            ));
        }

        if self.zombie_after.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "zombie_after must be greater than 0".to_string(),
            ));
        }

        // A sweep must not run less often than the thresholds it enforces.
        if self.liveness_interval > self.zombie_after {
            return Err(ConfigError::ValidationFailed(
                "liveness_interval cannot exceed zombie_after".to_string(),
            ));
        }

        if self.remote_timeout_secs < 0 {
            return Err(ConfigError::ValidationFailed(
                "remote_timeout_secs cannot be negative".to_string(),
            ));
        }

        if self.token_validity.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "token_validity must be greater than 0".to_string(),
            ));
        }

        if self.token_principal.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "token_principal cannot be empty".to_string(),
            ));
        }

        if self.instance.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "instance cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_command_queue_capacity(mut self, capacity: usize) -> Self {
        self.command_queue_capacity = capacity;
        self
    }

    pub fn with_liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval = interval;
        self
    }

    /// Sets both liveness thresholds.
    pub fn with_liveness_thresholds(mut self, zombie_after: Duration, expire_after: Duration) -> Self {
        self.zombie_after = zombie_after;
        self.expire_after = expire_after;
        self
    }

    pub fn with_priority_interval(mut self, interval: Duration) -> Self {
        self.priority_interval = interval;
        self
    }

    pub fn with_priority_active_only(mut self, active_only: bool) -> Self {
        self.priority_active_only = active_only;
        self
    }

    pub fn with_remote_timeout_secs(mut self, secs: i64) -> Self {
        self.remote_timeout_secs = secs;
        self
    }

    pub fn with_token_service_url(mut self, url: impl Into<String>) -> Self {
        self.token_service_url = Some(url.into());
        self
    }

    pub fn with_site_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.site_directory = Some(path.into());
        self
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = instance.into();
        self
    }

    pub fn with_metrics_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.metrics_file = Some(path.into());
        self
    }

    pub fn store_timeouts(&self) -> StoreTimeouts {
        StoreTimeouts {
            query_timeout: self.query_timeout,
            claim_timeout: self.claim_timeout,
        }
    }

    pub fn liveness_settings(&self) -> LivenessSettings {
        LivenessSettings {
            interval: self.liveness_interval,
            zombie_after: self.zombie_after,
            expire_after: self.expire_after,
        }
    }

    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            principal: self.token_principal.clone(),
            token_validity: self.token_validity,
            remote_timeout_secs: self.remote_timeout_secs,
        }
    }

    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::new(self.workers).with_queue_capacity(self.command_queue_capacity)
    }

    pub fn priority_scope(&self) -> PriorityScope {
        if self.priority_active_only {
            PriorityScope::ActiveOnly
        } else {
            PriorityScope::All
        }
    }
}

fn default_instance() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| format!("broker-{}", std::process::id()))
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

fn parse_env_secs(value: &str, key: &str) -> Result<Duration, ConfigError> {
    parse_env_value::<u64>(value, key).map(Duration::from_secs)
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.workers, 8);
        assert_eq!(config.command_queue_capacity, 256);
        assert_eq!(config.query_timeout, Duration::from_secs(30));
        assert_eq!(config.claim_timeout, Duration::from_secs(120));
        assert_eq!(config.liveness_interval, Duration::from_secs(300));
        assert_eq!(config.zombie_after, Duration::from_secs(3600));
        assert_eq!(config.expire_after, Duration::from_secs(7200));
        assert_eq!(config.remote_timeout_secs, 43_200);
        assert_eq!(config.token_validity, Duration::from_secs(86_400));
        assert!(config.priority_active_only);
        assert!(config.token_service_url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = SchedulerConfig::new()
            .with_database_url("postgres://db/broker")
            .with_workers(2)
            .with_command_queue_capacity(8)
            .with_liveness_thresholds(Duration::from_secs(600), Duration::from_secs(1200))
            .with_priority_active_only(false)
            .with_instance("broker-a");

        assert_eq!(config.database_url, "postgres://db/broker");
        assert_eq!(config.pool_config().num_workers, 2);
        assert_eq!(config.pool_config().queue_capacity, 8);
        assert_eq!(config.liveness_settings().zombie_after, Duration::from_secs(600));
        assert_eq!(config.priority_scope(), PriorityScope::All);
        assert_eq!(config.instance, "broker-a");
    }

    #[test]
    fn test_validation_zero_workers() {
        let result = SchedulerConfig::default().with_workers(0).validate();
        assert!(result.unwrap_err().to_string().contains("workers"));
    }

    #[test]
    fn test_validation_interval_longer_than_zombie_threshold() {
        let result = SchedulerConfig::default()
            .with_liveness_interval(Duration::from_secs(7200))
            .validate();
        assert!(result.unwrap_err().to_string().contains("liveness_interval"));
    }

    #[test]
    fn test_validation_negative_remote_timeout() {
        let result = SchedulerConfig::default().with_remote_timeout_secs(-1).validate();
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_env_helpers() {
        assert_eq!(parse_env_value::<usize>(" 4 ", "K").unwrap(), 4);
        assert!(parse_env_value::<usize>("four", "K").is_err());
        assert_eq!(parse_env_secs("90", "K").unwrap(), Duration::from_secs(90));
        assert!(parse_env_bool("on", "K").unwrap());
        assert!(!parse_env_bool("0", "K").unwrap());
        assert!(parse_env_bool("maybe", "K").is_err());
    }
}
