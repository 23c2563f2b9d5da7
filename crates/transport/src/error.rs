//! Error types for the peer transport

use crate::peer_info::PeerId;

/// Result type alias using the transport [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Reason a single connection failed, closed, or refused a message.
///
/// Cloneable because one failure settles many waiters at once: every queued
/// send, the deferred connection attempt, and the endpoint's close event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// No open within the configured connection timeout
    #[error("connection timed out after {timeout_ms} ms")]
    ConnectionTimeout { timeout_ms: u64 },

    /// Ping attempts exhausted without a pong
    #[error("pong not received")]
    DeadConnection,

    /// Underlying socket or data channel error
    #[error("transport error: {0}")]
    Transport(String),

    /// Closed by the duplicate socket tie-break
    #[error("duplicate socket")]
    DuplicateSocket,

    /// Malformed incoming handshake
    #[error("{0} not given")]
    MissingParameter(String),

    /// A single message exceeds the transport's maximum size
    #[error("message size {size} exceeds maximum {max}")]
    MessageTooLarge { size: usize, max: usize },

    /// Delivery retried until the try limit and dropped
    #[error("failed to deliver message after {tries} tries: {}", .infos.join("; "))]
    SendFailed { tries: u32, infos: Vec<String> },

    /// Evicted from a full message queue
    #[error("message queue overflow")]
    QueueOverflow,

    /// Closed locally or by the remote end, with a reason
    #[error("{0}")]
    Closed(String),

    /// Operation attempted on a closed connection
    #[error("connection already closed")]
    AlreadyClosed,

    /// Operation attempted in the wrong lifecycle state
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl ConnectionError {
    /// The default rejection used when `close()` is called without a reason
    pub fn closed() -> Self {
        ConnectionError::Closed("closed".to_string())
    }

    /// Check if a fresh connection attempt may succeed after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnectionError::ConnectionTimeout { .. }
                | ConnectionError::DeadConnection
                | ConnectionError::Transport(_)
        )
    }

    pub fn is_duplicate_socket(&self) -> bool {
        matches!(self, ConnectionError::DuplicateSocket)
    }
}

/// Errors returned by endpoint operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration file could not be parsed
    #[error("Configuration parse error: {0}")]
    Config(#[from] toml::de::Error),

    /// `connect()` after `stop()`
    #[error("Endpoint has been stopped")]
    EndpointStopped,

    /// Attempt to connect to our own peer id or address
    #[error("Refusing to connect to self: {0}")]
    SelfConnection(String),

    /// No live connection to the peer
    #[error("Not connected to peer: {0}")]
    NotConnected(PeerId),

    /// Peer unknown to the peer book
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Per-connection failure surfaced to the caller
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Signalling relay failure
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Connection(err) => err.is_retryable(),
            Error::Signaling(_) | Error::WebSocketError(_) | Error::Io(_) => true,
            _ => false,
        }
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_) | Error::Config(_))
    }

    /// Check if this error is a peer-related error
    pub fn is_peer_error(&self) -> bool {
        matches!(
            self,
            Error::NotConnected(_)
                | Error::PeerNotFound(_)
                | Error::SelfConnection(_)
                | Error::Connection(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_close_reason() {
        assert_eq!(ConnectionError::closed().to_string(), "closed");
    }

    #[test]
    fn test_send_failed_lists_infos() {
        let err = ConnectionError::SendFailed {
            tries: 2,
            infos: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "failed to deliver message after 2 tries: a; b"
        );
    }

    #[test]
    fn test_missing_parameter_message() {
        let err = ConnectionError::MissingParameter("streamr-peer-id".to_string());
        assert_eq!(err.to_string(), "streamr-peer-id not given");
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::InvalidConfig("x".into()).is_config_error());
        assert!(Error::NotConnected("p".into()).is_peer_error());
        assert!(Error::from(ConnectionError::DeadConnection).is_retryable());
        assert!(!Error::from(ConnectionError::DuplicateSocket).is_retryable());
        assert!(!Error::EndpointStopped.is_retryable());
    }
}
