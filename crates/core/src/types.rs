use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Default per-request deadline
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Unique identifier for a configured MCP server
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerId(pub String);

impl ServerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ServerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Which transport a server is reached through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    Http,
    Stdio,
    Local,
}

/// Lifecycle state of a server connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Header-based credentials for the HTTP transport
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HttpAuth {
    #[default]
    None,
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        password: String,
    },
    /// OAuth 2.1 access token obtained out of band
    #[serde(rename = "oauth2")]
    OAuth2 {
        access_token: String,
    },
}

impl HttpAuth {
    /// Token usable as the `?token=` query parameter of the event stream.
    pub fn stream_token(&self) -> Option<&str> {
        match self {
            Self::Bearer { token } => Some(token),
            Self::OAuth2 { access_token } => Some(access_token),
            Self::None | Self::Basic { .. } => None,
        }
    }
}

/// Transport-specific connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    Http {
        url: String,
        #[serde(default)]
        auth: HttpAuth,
    },
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Local {
        socket_path: PathBuf,
    },
}

impl TransportConfig {
    pub fn transport_type(&self) -> TransportType {
        match self {
            Self::Http { .. } => TransportType::Http,
            Self::Stdio { .. } => TransportType::Stdio,
            Self::Local { .. } => TransportType::Local,
        }
    }
}

/// Per-server configuration: transport plus generic limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(flatten)]
    pub transport: TransportConfig,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Hint for caller-level retry wrappers; connections never retry on their own
    #[serde(default)]
    pub retry_count: u32,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl ServerConfig {
    pub fn new(transport: TransportConfig) -> Self {
        Self {
            transport,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            retry_count: 0,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Descriptor of an external MCP server and its last known state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServer {
    pub id: ServerId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub config: ServerConfig,
    #[serde(default)]
    pub status: ServerStatus,
    /// Capability families advertised by the peer at handshake
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub last_connected: Option<DateTime<Utc>>,
}

impl McpServer {
    pub fn new(id: impl Into<String>, name: impl Into<String>, config: ServerConfig) -> Self {
        Self {
            id: ServerId::new(id),
            name: name.into(),
            description: None,
            config,
            status: ServerStatus::Disconnected,
            capabilities: Vec::new(),
            error: None,
            last_connected: None,
        }
    }

    pub fn transport_type(&self) -> TransportType {
        self.config.transport.transport_type()
    }

    pub fn mark_connecting(&mut self) {
        self.status = ServerStatus::Connecting;
        self.error = None;
    }

    pub fn mark_connected(&mut self, capabilities: Vec<String>) {
        self.status = ServerStatus::Connected;
        self.capabilities = capabilities;
        self.error = None;
        self.last_connected = Some(Utc::now());
    }

    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.status = ServerStatus::Error;
        self.error = Some(message.into());
    }

    pub fn mark_disconnected(&mut self) {
        self.status = ServerStatus::Disconnected;
    }
}
