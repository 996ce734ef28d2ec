//! Error types for the MCP client.

use std::time::Duration;
use tether_core::bridge::BridgeError;
use tether_core::protocol::JsonRpcError;
use tether_core::ServerId;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Error types that can occur when talking to MCP servers.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// A connection with this id is already registered.
    #[error("Server '{0}' is already connected")]
    AlreadyConnected(ServerId),

    /// No connection is registered under this id.
    #[error("Server '{0}' is not connected")]
    NotConnected(ServerId),

    /// The per-request deadline elapsed before a response arrived.
    #[error("Request '{method}' timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    /// The transport closed while the request was outstanding.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The transport failed (liveness probe, stream, write).
    #[error("Transport error: {0}")]
    Transport(String),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The peer answered with a JSON-RPC error.
    #[error("Server error [{code}]: {message}")]
    Rpc {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The peer's answer did not match the expected schema.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The host bridge refused an operation.
    #[error("Host bridge error: {0}")]
    Bridge(#[from] BridgeError),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl ClientError {
    /// Check if retrying the same operation might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::ConnectionClosed | Self::Transport(_) => true,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::Bridge(BridgeError::Io(_)) => true,
            _ => false,
        }
    }
}

impl From<JsonRpcError> for ClientError {
    fn from(err: JsonRpcError) -> Self {
        Self::Rpc {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}
