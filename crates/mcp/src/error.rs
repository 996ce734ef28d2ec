// Error types for the server side

use tether_core::bridge::BridgeError;
use tether_core::protocol::JsonRpcError;
use tether_core::settings::ErrorCodePolicy;

/// Why a single inbound message could not be served.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Method {method} is disabled: {family} are not exposed by this server")]
    Disabled {
        method: String,
        family: &'static str,
    },

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("{0:#}")]
    Handler(#[from] anyhow::Error),
}

impl RouterError {
    /// The JSON-RPC error sent back to the peer.
    pub fn to_rpc(&self, policy: ErrorCodePolicy) -> JsonRpcError {
        let message = self.to_string();
        match self {
            Self::Parse(_) => JsonRpcError::parse_error(message),
            Self::InvalidRequest(_) => JsonRpcError::invalid_request(message),
            Self::UnknownMethod(method) => match policy {
                ErrorCodePolicy::Compatible => JsonRpcError::internal_error(message),
                ErrorCodePolicy::Strict => JsonRpcError::method_not_found(method),
            },
            Self::InvalidParams(_) => JsonRpcError::invalid_params(message),
            Self::Disabled { .. } | Self::Handler(_) => JsonRpcError::internal_error(message),
        }
    }
}

/// Lifecycle errors of the bridge-backed endpoint.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("MCP endpoint is already running")]
    AlreadyRunning,

    #[error("MCP server is disabled in settings")]
    Disabled,

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}
