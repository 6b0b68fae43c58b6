//! Error types for Ratekeeper.

use thiserror::Error;

/// Main error type for Ratekeeper operations.
///
/// Quota exhaustion is not an error; it is reported as
/// [`Decision::Denied`](crate::ratelimit::Decision::Denied).
#[derive(Error, Debug)]
pub enum RatekeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A policy failed validation
    #[error("Invalid policy '{name}': {reason}")]
    InvalidPolicy {
        /// Name of the offending policy
        name: String,
        /// What was wrong with it
        reason: String,
    },

    /// Lookup of a policy name that is not registered
    #[error("Unknown policy: {0}")]
    UnknownPolicy(String),

    /// Errors raised while layering configuration sources
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] ::config::ConfigError),

    /// YAML parse errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RatekeeperError {
    pub(crate) fn invalid_policy(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPolicy {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for Ratekeeper operations.
pub type Result<T> = std::result::Result<T, RatekeeperError>;
