use thiserror::Error;

/// Top-level error type for the Affinity matching engine.
///
/// Infrastructure failures (`IndexUnavailable`, `StoreUnavailable`, `Timeout`)
/// are retryable and must be surfaced to callers instead of being turned into
/// empty result sets. Per-item problems during ingestion are reported through
/// [`EncodeError`] in the status list and never raised as `AffinityError`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AffinityError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Cache corruption: {0}")]
    CacheCorruption(String),

    #[error("Timed out during {0}")]
    Timeout(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl AffinityError {
    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AffinityError::IndexUnavailable(_)
                | AffinityError::StoreUnavailable(_)
                | AffinityError::Timeout(_)
        )
    }
}

/// Per-item failure produced by an encoder.
///
/// One bad item never aborts its siblings: the ingestion pipeline records the
/// error against the item and carries on with the rest of the batch.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EncodeError {
    #[error("input is empty")]
    Empty,

    #[error("unsupported input: {0}")]
    Unsupported(String),

    #[error("corrupt input: {0}")]
    Corrupt(String),

    #[error("model failure: {0}")]
    Model(String),

    #[error("encoder produced {actual} dimensions, expected {expected}")]
    Dimension { expected: usize, actual: usize },

    #[error("encoder produced a zero or non-finite vector")]
    Degenerate,
}

impl From<toml::de::Error> for AffinityError {
    fn from(err: toml::de::Error) -> Self {
        AffinityError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for AffinityError {
    fn from(err: toml::ser::Error) -> Self {
        AffinityError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for AffinityError {
    fn from(err: serde_json::Error) -> Self {
        AffinityError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Affinity operations.
pub type Result<T> = std::result::Result<T, AffinityError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AffinityError::Config("missing field".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing field");

        let err = AffinityError::DimensionMismatch {
            expected: 384,
            actual: 512,
        };
        assert_eq!(err.to_string(), "Dimension mismatch: expected 384, got 512");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(AffinityError::IndexUnavailable("loading".into()).is_retryable());
        assert!(AffinityError::StoreUnavailable("down".into()).is_retryable());
        assert!(AffinityError::Timeout("encode".into()).is_retryable());

        assert!(!AffinityError::InvalidInput("bad".into()).is_retryable());
        assert!(!AffinityError::Encode(EncodeError::Empty).is_retryable());
        assert!(!AffinityError::DimensionMismatch {
            expected: 3,
            actual: 4
        }
        .is_retryable());
    }

    #[test]
    fn test_encode_error_conversion() {
        let err: AffinityError = EncodeError::Corrupt("truncated png".into()).into();
        assert!(matches!(err, AffinityError::Encode(EncodeError::Corrupt(_))));
        assert_eq!(err.to_string(), "Encode error: corrupt input: truncated png");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: AffinityError = io_err.into();
        assert!(matches!(err, AffinityError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_error_from_toml_de() {
        let err: std::result::Result<toml::Value, _> = toml::from_str("invalid = [[[");
        let err: AffinityError = err.unwrap_err().into();
        assert!(matches!(err, AffinityError::Config(_)));
    }

    #[test]
    fn test_error_from_serde_json() {
        let err: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope }");
        let err: AffinityError = err.unwrap_err().into();
        assert!(matches!(err, AffinityError::Serialization(_)));
    }

    #[test]
    fn test_result_type_with_question_mark() {
        fn inner() -> Result<String> {
            let io_result: std::result::Result<i32, std::io::Error> = Ok(42);
            let value = io_result?;
            Ok(value.to_string())
        }

        assert_eq!(inner().unwrap(), "42");
    }
}
