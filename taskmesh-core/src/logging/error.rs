//! Error types for the logging subsystem

use thiserror::Error;

/// Errors that can occur while configuring logging
#[derive(Debug, Clone, Error)]
pub enum LoggingError {
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    #[error("Invalid logging configuration: {0}")]
    InvalidConfiguration(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_error_display() {
        let err = LoggingError::InitializationFailed("subscriber already set".to_string());
        assert_eq!(
            err.to_string(),
            "Failed to initialize logging: subscriber already set"
        );
    }
}
