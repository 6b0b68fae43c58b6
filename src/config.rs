//! Configuration management for Ratekeeper.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::error::{RatekeeperError, Result};
use crate::ratelimit::{PolicyOverride, PolicyTable};

/// Prefix for environment variable overrides, e.g.
/// `RATEKEEPER__ENVIRONMENT=production` or
/// `RATEKEEPER__POLICIES__LOGIN__MAX_REQUESTS=10`.
pub const ENV_PREFIX: &str = "RATEKEEPER";

/// Deployment environment the limiter runs in.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Local development
    #[default]
    Development,
    /// Automated tests; policies with `skip_in_test` are bypassed
    Test,
    /// Production traffic
    Production,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Environment::Development => "development",
            Environment::Test => "test",
            Environment::Production => "production",
        })
    }
}

/// Main configuration for Ratekeeper.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatekeeperConfig {
    /// Deployment environment
    #[serde(default)]
    pub environment: Environment,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Overrides and additions to the built-in policy table
    #[serde(default)]
    pub policies: HashMap<String, PolicyOverride>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

/// Counter store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Sweep interval in milliseconds; defaults to the shortest policy
    /// cleanup interval
    #[serde(default)]
    pub cleanup_interval_ms: Option<u64>,
}

impl RatekeeperConfig {
    /// Load configuration from an optional file plus `RATEKEEPER__*`
    /// environment variables, which take precedence.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        let config = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// The built-in policy table with this configuration's overrides applied.
    pub fn policy_table(&self) -> Result<PolicyTable> {
        PolicyTable::with_overrides(&self.policies)
    }

    /// Sweep interval for the store serving `table`.
    pub fn sweep_interval(&self, table: &PolicyTable) -> Result<Duration> {
        match self.store.cleanup_interval_ms {
            Some(0) => Err(RatekeeperError::Config(
                "store.cleanup_interval_ms must be positive".to_string(),
            )),
            Some(ms) => Ok(Duration::from_millis(ms)),
            None => Ok(table.cleanup_interval()),
        }
    }
}
