//! Configuration error types

use thiserror::Error;

/// Errors raised while loading, validating or saving a [`super::Config`]
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    FileReadError(String),

    #[error("Failed to write configuration file: {0}")]
    FileWriteError(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Failed to serialize configuration: {0}")]
    SerializeError(String),

    /// An environment override could not be parsed
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue("MESHLINK_LOG_JSON: bad bool".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid configuration value: MESHLINK_LOG_JSON: bad bool"
        );
    }
}
