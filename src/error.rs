use crate::protocol::DecodeError;
use crate::types::Endpoint;
use thiserror::Error;

/// Result type for control operations
pub type Result<T> = std::result::Result<T, ControlError>;

/// Errors that can occur when talking to a Snapcast server
#[derive(Error, Debug)]
pub enum ControlError {
    /// Initial connect failed (DNS, refused, timeout)
    #[error("Failed to connect to {endpoint}: {reason}")]
    Connect {
        /// Endpoint we tried to reach
        endpoint: Endpoint,
        /// Underlying cause
        reason: String,
    },

    /// Write failed because the socket is closed or broken
    #[error("Send error: {0}")]
    Send(String),

    /// Malformed JSON or an envelope without its discriminating fields
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The peer violated the JSON-RPC contract (e.g. response with an unknown id)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server answered with a well-formed JSON-RPC error object
    #[error("Server error {code}: {message}")]
    Server {
        /// JSON-RPC error code
        code: i64,
        /// Error message from the server
        message: String,
        /// Optional structured error data
        data: Option<serde_json::Value>,
    },

    /// The connection went away while the request was in flight
    #[error("Connection lost")]
    ConnectionLost,

    /// No connection is established
    #[error("Not connected")]
    NotConnected,

    /// Request timed out waiting for response
    #[error("Request timeout")]
    Timeout,

    /// A command named a client or group the mirror does not know
    #[error("Unknown {kind}: {id}")]
    NotFound {
        /// "client" or "group"
        kind: &'static str,
        id: String,
    },

    /// The result payload did not have the expected shape
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Channel receive error
    #[error("Channel error: {0}")]
    ChannelError(String),
}

impl ControlError {
    /// True if the request was dropped because the connection went away
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, ControlError::ConnectionLost)
    }

    /// True if the server rejected the request
    pub fn is_server_error(&self) -> bool {
        matches!(self, ControlError::Server { .. })
    }
}
