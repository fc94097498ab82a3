use thiserror::Error;

/// Top-level error type for the Relay synchronization engine.
///
/// Subsystem crates define their own error types and implement
/// `From<SubsystemError> for RelayError` so that `?` works across crate
/// boundaries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RelayError {
    /// An operation needed a live transport connection and there was none.
    /// Callers retry after reconnection; nothing is queued on their behalf.
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// An inbound fragment could not be decoded. Logged and dropped.
    #[error("Malformed fragment: {0}")]
    MalformedFragment(String),

    /// The transport refused an outgoing publish.
    #[error("Publish failed: {0}")]
    PublishFailure(String),

    /// The history/CRUD collaborator failed or returned an unexpected payload.
    #[error("History error: {0}")]
    History(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<toml::de::Error> for RelayError {
    fn from(err: toml::de::Error) -> Self {
        RelayError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for RelayError {
    fn from(err: toml::ser::Error) -> Self {
        RelayError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_all_variants() {
        let cases: Vec<(RelayError, &str)> = vec![
            (
                RelayError::NotConnected("link down".to_string()),
                "Not connected: link down",
            ),
            (
                RelayError::MalformedFragment("missing role".to_string()),
                "Malformed fragment: missing role",
            ),
            (
                RelayError::PublishFailure("writer closed".to_string()),
                "Publish failed: writer closed",
            ),
            (
                RelayError::History("HTTP 500".to_string()),
                "History error: HTTP 500",
            ),
            (
                RelayError::Config("bad key".to_string()),
                "Configuration error: bad key",
            ),
            (
                RelayError::Serialization("invalid json".to_string()),
                "Serialization error: invalid json",
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.to_string(), expected);
        }
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: RelayError = io_err.into();
        assert!(matches!(err, RelayError::Io(_)));
        assert!(err.to_string().starts_with("I/O error:"));
        assert!(err.to_string().contains("access denied"));
    }

    #[test]
    fn test_error_from_toml_de() {
        let err: std::result::Result<toml::Value, _> = toml::from_str("invalid = [[[");
        let relay_err: RelayError = err.unwrap_err().into();
        assert!(matches!(relay_err, RelayError::Config(_)));
    }

    #[test]
    fn test_error_from_serde_json() {
        let err: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope }");
        let relay_err: RelayError = err.unwrap_err().into();
        assert!(matches!(relay_err, RelayError::Serialization(_)));
    }

    #[test]
    fn test_result_type_with_question_mark() {
        fn inner() -> Result<String> {
            let value: serde_json::Value = serde_json::from_str("{\"a\":1}")?;
            Ok(value["a"].to_string())
        }

        assert_eq!(inner().unwrap(), "1");
    }
}
