//! Error types for the transport layer.

use relay_core::error::RelayError;
use thiserror::Error;

use crate::frame::FrameError;

/// Errors from the publish/subscribe transport.
///
/// `Clone` because a single pending connect outcome is handed to every
/// caller that raced on `connect()`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No live link, or the link could not be established or authorized.
    #[error("not connected: {0}")]
    NotConnected(String),
    /// The link accepted the connection but refused an outgoing frame.
    #[error("publish failed: {0}")]
    PublishFailed(String),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

impl From<TransportError> for RelayError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotConnected(reason) => RelayError::NotConnected(reason),
            TransportError::PublishFailed(reason) => RelayError::PublishFailure(reason),
            TransportError::Frame(e) => RelayError::MalformedFragment(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::NotConnected("handshake rejected".to_string());
        assert_eq!(err.to_string(), "not connected: handshake rejected");

        let err = TransportError::PublishFailed("writer closed".to_string());
        assert_eq!(err.to_string(), "publish failed: writer closed");

        let err: TransportError = FrameError::Unterminated.into();
        assert_eq!(err.to_string(), "frame error: frame is not NUL terminated");
    }

    #[test]
    fn test_into_relay_error() {
        let relay: RelayError = TransportError::NotConnected("down".into()).into();
        assert!(matches!(relay, RelayError::NotConnected(_)));

        let relay: RelayError = TransportError::PublishFailed("full".into()).into();
        assert!(matches!(relay, RelayError::PublishFailure(_)));

        let relay: RelayError = TransportError::Frame(FrameError::Unterminated).into();
        assert!(matches!(relay, RelayError::MalformedFragment(_)));
    }
}
