//! Configuration structures for the connection manager and its pool

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use crate::strategy::PoolingStrategy;
use crate::{Result, ResourceError};

/// Complete connector configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub manager: ManagerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Transaction support level of a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionSupport {
    #[default]
    None,
    Local,
    Xa,
}

/// Connection manager configuration section
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ManagerConfig {
    /// JNDI name of the deployment, used in diagnostics and unshareable matching
    pub jndi_name: String,
    /// Number of retries after a failed allocation (default: 0)
    #[serde(default)]
    pub allocation_retry: u32,
    /// Pause between allocation retries in milliseconds; 0 retries immediately
    #[serde(default = "default_allocation_retry_wait_millis")]
    pub allocation_retry_wait_millis: u64,
    /// Security domain handed to the subject factory
    #[serde(default)]
    pub security_domain: Option<String>,
    #[serde(default)]
    pub transaction_support: TransactionSupport,
    /// Reuse the connection already enlisted in the caller's transaction
    #[serde(default)]
    pub track_connection_by_tx: bool,
}

impl ManagerConfig {
    pub fn new(jndi_name: impl Into<String>) -> Self {
        Self {
            jndi_name: jndi_name.into(),
            allocation_retry: 0,
            allocation_retry_wait_millis: default_allocation_retry_wait_millis(),
            security_domain: None,
            transaction_support: TransactionSupport::None,
            track_connection_by_tx: false,
        }
    }

    pub fn allocation_retry_wait(&self) -> Duration {
        Duration::from_millis(self.allocation_retry_wait_millis)
    }
}

/// Pool configuration section
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub min_size: usize,
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// How long a request waits for a free slot (default: 30s)
    #[serde(default = "default_blocking_timeout_millis")]
    pub blocking_timeout_millis: u64,
    /// Idle time after which a connection is evicted; 0 disables eviction
    #[serde(default = "default_idle_timeout_millis")]
    pub idle_timeout_millis: u64,
    #[serde(default)]
    pub background_validation: bool,
    #[serde(default = "default_background_validation_millis")]
    pub background_validation_millis: u64,
    /// Fill the pool to `min_size` when it starts
    #[serde(default)]
    pub prefill: bool,
    #[serde(default)]
    pub strategy: PoolingStrategy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: default_max_size(),
            blocking_timeout_millis: default_blocking_timeout_millis(),
            idle_timeout_millis: default_idle_timeout_millis(),
            background_validation: false,
            background_validation_millis: default_background_validation_millis(),
            prefill: false,
            strategy: PoolingStrategy::default(),
        }
    }
}

impl PoolConfig {
    pub fn blocking_timeout(&self) -> Duration {
        Duration::from_millis(self.blocking_timeout_millis)
    }

    /// Idle timeout, or `None` when idle eviction is disabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_millis > 0).then(|| Duration::from_millis(self.idle_timeout_millis))
    }

    /// Background validation interval, or `None` when validation is off
    pub fn validation_interval(&self) -> Option<Duration> {
        (self.background_validation && self.background_validation_millis > 0)
            .then(|| Duration::from_millis(self.background_validation_millis))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(ResourceError::validation_error(
                "Pool max_size cannot be 0".to_string(),
                Some("Use a max_size of at least 1".to_string())
            ));
        }

        if self.min_size > self.max_size {
            return Err(ResourceError::validation_error(
                format!("Pool min_size {} exceeds max_size {}", self.min_size, self.max_size),
                None
            ));
        }

        if self.blocking_timeout_millis == 0 {
            return Err(ResourceError::validation_error(
                "Blocking timeout cannot be 0".to_string(),
                None
            ));
        }

        if self.background_validation && self.background_validation_millis == 0 {
            return Err(ResourceError::configuration_error(
                "pool.background_validation_millis".to_string(),
                "Background validation is enabled but its interval is 0".to_string()
            ));
        }

        Ok(())
    }
}

/// Logging configuration section
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ResourceError::validation_error(
                format!("Configuration file not found: {}", path.display()),
                Some("Create a connector.toml file or specify a different path".to_string())
            ));
        }

        let content = fs::read_to_string(path)
            .map_err(|e| ResourceError::io_error(e, format!("reading {}", path.display())))?;

        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| ResourceError::validation_error(
                format!("Failed to parse configuration: {}", e),
                Some("Check TOML syntax".to_string())
            ))?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration with fallback to default file locations
    pub fn load() -> Result<Self> {
        let config_paths = [
            "connector.toml",
            "config/connector.toml",
        ];

        for path in &config_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        Self::from_env()
    }

    /// Load configuration from environment variables (fallback)
    pub fn from_env() -> Result<Self> {
        use std::env;

        let jndi_name = env::var("CONNECTOR_JNDI_NAME")
            .map_err(|_| ResourceError::validation_error(
                "No configuration file found and CONNECTOR_JNDI_NAME is not set".to_string(),
                Some("Create a connector.toml file or set CONNECTOR_JNDI_NAME".to_string())
            ))?;

        let mut manager = ManagerConfig::new(jndi_name);
        if let Some(retry) = parse_env::<u32>("CONNECTOR_ALLOCATION_RETRY")? {
            manager.allocation_retry = retry;
        }
        if let Some(wait) = parse_env::<u64>("CONNECTOR_ALLOCATION_RETRY_WAIT_MILLIS")? {
            manager.allocation_retry_wait_millis = wait;
        }

        let mut pool = PoolConfig::default();
        if let Some(max_size) = parse_env::<usize>("CONNECTOR_POOL_MAX_SIZE")? {
            pool.max_size = max_size;
        }
        if let Some(min_size) = parse_env::<usize>("CONNECTOR_POOL_MIN_SIZE")? {
            pool.min_size = min_size;
        }

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| default_log_level());

        let config = Config {
            manager,
            pool,
            logging: LoggingConfig { log_level },
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.manager.jndi_name.trim().is_empty() {
            return Err(ResourceError::validation_error(
                "JNDI name cannot be empty".to_string(),
                None
            ));
        }

        self.pool.validate()?;

        match self.logging.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {},
            _ => {
                return Err(ResourceError::validation_error(
                    format!("Invalid log level: {}", self.logging.log_level),
                    Some("Valid log levels: trace, debug, info, warn, error".to_string())
                ));
            }
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            ResourceError::validation_error(
                format!("Invalid {} value: {}", name, raw),
                Some(format!("{} must be a non-negative number", name))
            )
        }),
        Err(_) => Ok(None),
    }
}

// Default value functions for serde
fn default_allocation_retry_wait_millis() -> u64 {
    5000
}

fn default_max_size() -> usize {
    20
}

fn default_blocking_timeout_millis() -> u64 {
    30_000
}

fn default_idle_timeout_millis() -> u64 {
    900_000
}

fn default_background_validation_millis() -> u64 {
    600_000
}

fn default_log_level() -> String {
    "info".to_string()
}
