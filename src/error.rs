//! Error types for lorapt.

use thiserror::Error;

/// A specialized Result type for lorapt operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for lorapt operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors. Always fatal, raised before any model load.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Records or tensors that cannot be assembled as requested
    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// Failures reported by the numeric backend (model, trainer, adapter)
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// A blocking worker task panicked or was cancelled
    #[error("Task error: {0}")]
    Task(String),
}

impl Error {
    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(msg: S) -> Self {
        Error::InvalidData(msg.into())
    }

    /// Create a backend error
    pub fn backend<S: Into<String>>(msg: S) -> Self {
        Error::Backend(msg.into())
    }

    /// Whether the error is a configuration error
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<ndarray::ShapeError> for Error {
    fn from(err: ndarray::ShapeError) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Task(err.to_string())
    }
}

impl From<walkdir::Error> for Error {
    fn from(err: walkdir::Error) -> Self {
        match err.into_io_error() {
            Some(io) => Error::Io(io),
            None => Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "filesystem loop detected while walking directory",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::config("missing model_type");
        assert!(err.is_config());
        assert_eq!(err.to_string(), "Configuration error: missing model_type");

        let err = Error::invalid_data("ragged label_ids");
        assert!(matches!(err, Error::InvalidData(_)));
        assert!(!err.is_config());
    }

    #[test]
    fn test_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let converted: Error = io_err.into();
        assert!(matches!(converted, Error::Io(_)));

        let config_err = config::ConfigError::NotFound("model.model_type".to_string());
        let converted: Error = config_err.into();
        assert!(converted.is_config());

        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let converted: Error = json_err.into();
        assert!(matches!(converted, Error::Serialization(_)));
    }

    #[tokio::test]
    async fn test_join_error_conversion() {
        let join_err = tokio::task::spawn_blocking(|| panic!("worker died"))
            .await
            .unwrap_err();
        let converted: Error = join_err.into();
        assert!(matches!(converted, Error::Task(_)));
    }
}
