//! Error types shared across exlib crates

use thiserror::Error;

/// Result type alias for exlib operations
pub type Result<T> = std::result::Result<T, ExlibError>;

/// Main error type for exlib
#[derive(Error, Debug)]
pub enum ExlibError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid source reference: {0}")]
    InvalidSource(String),

    #[error("Unknown job kind: {0}")]
    UnknownJobKind(String),

    #[error("Unknown job status: {0}")]
    UnknownJobStatus(String),
}

impl ExlibError {
    /// Build a configuration error from anything printable
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ExlibError::UnknownJobKind("reindex".to_string());
        assert_eq!(err.to_string(), "Unknown job kind: reindex");

        let err = ExlibError::config("port must be > 0");
        assert_eq!(err.to_string(), "Configuration error: port must be > 0");
    }

    #[test]
    fn test_from_serde_error() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: ExlibError = parse_err.into();
        assert!(matches!(err, ExlibError::Serialization(_)));
    }
}
