// Transport Traits and Core Types
// Defines the request/response channel a sync session talks through

use crate::sync::{ProtocolError, Request, Response};
use async_trait::async_trait;
use thiserror::Error;

// ============================================================================
// PEER CHANNEL
// ============================================================================

/// Request/response channel to one named peer.
///
/// Implementations carry a single request to the peer's responder and
/// return its answer. Timeouts are applied by the caller.
#[async_trait]
pub trait PeerChannel: Send + Sync {
    /// Send a request and wait for the response
    async fn request(&self, request: Request) -> Result<Response, TransportError>;

    /// Human-readable description of the remote end
    fn describe(&self) -> String;
}

// ============================================================================
// TRANSPORT ERRORS
// ============================================================================

/// Errors that can occur in the transport layer
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Injected fault: {0}")]
    Injected(String),
}

impl From<ProtocolError> for TransportError {
    fn from(err: ProtocolError) -> Self {
        TransportError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::ConnectionReset => {
                TransportError::NotConnected
            }
            _ => TransportError::ReceiveFailed(err.to_string()),
        }
    }
}
