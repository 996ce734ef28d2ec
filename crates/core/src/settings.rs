// Deployment settings for exposing this application as an MCP server

use serde::{Deserialize, Serialize};

/// How peers are expected to authenticate. Carried as transport
/// configuration only; validation happens outside the protocol core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    #[default]
    None,
    ApiKey,
    #[serde(rename = "oauth2")]
    OAuth2,
}

/// Which JSON-RPC code answers an unknown method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCodePolicy {
    /// -32603 for unknown methods, matching existing peers
    #[default]
    Compatible,
    /// -32601 for unknown methods
    Strict,
}

/// Method families the server is willing to serve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExposedResources {
    /// Gates `resources/list` and `resources/read`
    #[serde(default)]
    pub file_operations: bool,
    /// Gates `tools/list` and `tools/call`
    #[serde(default)]
    pub system_commands: bool,
    /// Gates `prompts/list` and `prompts/get`
    #[serde(default)]
    pub agent_configs: bool,
}

impl ExposedResources {
    pub fn all() -> Self {
        Self {
            file_operations: true,
            system_commands: true,
            agent_configs: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    #[serde(default = "default_burst")]
    pub burst: u32,
}

fn default_requests_per_minute() -> u32 {
    120
}

fn default_burst() -> u32 {
    20
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            burst: default_burst(),
        }
    }
}

/// Per-deployment MCP server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub auth_mode: AuthMode,

    #[serde(default)]
    pub exposed_resources: ExposedResources,

    #[serde(default)]
    pub rate_limit: RateLimit,

    #[serde(default)]
    pub error_codes: ErrorCodePolicy,

    /// Advertise the `logging` family and emit log notifications
    #[serde(default = "default_true")]
    pub logging: bool,
}

fn default_port() -> u16 {
    7420
}

fn default_true() -> bool {
    true
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_port(),
            auth_mode: AuthMode::default(),
            exposed_resources: ExposedResources::default(),
            rate_limit: RateLimit::default(),
            error_codes: ErrorCodePolicy::default(),
            logging: true,
        }
    }
}
