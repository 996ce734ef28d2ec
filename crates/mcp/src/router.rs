// Inbound JSON-RPC dispatch for the server role
//
// Every message is answered independently: a malformed envelope, a disabled
// family or a failing handler produces an error response for that message
// alone and leaves the peer's session usable.

use crate::error::RouterError;
use crate::handler::McpHandler;
use serde::de::DeserializeOwned;
use serde::Serialize;
use futures_util::FutureExt;
use serde_json::{json, Value};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tether_core::protocol::{
    methods, CallToolParams, Capabilities, FlagCapability, GetPromptParams, Implementation,
    InitializeParams, InitializeResult, ListChangedCapability, ListParams, LogLevel,
    LoggingMessageParams, McpMessage, MessageKind, ReadResourceParams, ResourcesCapability,
    PROTOCOL_VERSION,
};
use tether_core::settings::{ErrorCodePolicy, ExposedResources, ServerSettings};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Method family a gated method belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Resources,
    Tools,
    Prompts,
}

impl Family {
    pub fn of(method: &str) -> Option<Self> {
        match method {
            methods::RESOURCES_LIST | methods::RESOURCES_READ => Some(Self::Resources),
            methods::TOOLS_LIST | methods::TOOLS_CALL => Some(Self::Tools),
            methods::PROMPTS_LIST | methods::PROMPTS_GET => Some(Self::Prompts),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Resources => "resources",
            Self::Tools => "tools",
            Self::Prompts => "prompts",
        }
    }

    fn exposed(self, exposure: &ExposedResources) -> bool {
        match self {
            Self::Resources => exposure.file_operations,
            Self::Tools => exposure.system_commands,
            Self::Prompts => exposure.agent_configs,
        }
    }
}

/// Capability-gated method table in front of an [`McpHandler`].
pub struct McpRouter {
    handler: Arc<dyn McpHandler>,
    exposure: ExposedResources,
    policy: ErrorCodePolicy,
    logging: bool,
    server_info: Implementation,
    instructions: Option<String>,
    notifications: Option<broadcast::Sender<McpMessage>>,
}

impl McpRouter {
    pub fn new(settings: &ServerSettings, handler: Arc<dyn McpHandler>) -> Self {
        Self {
            handler,
            exposure: settings.exposed_resources,
            policy: settings.error_codes,
            logging: settings.logging,
            server_info: Implementation::new("tether", env!("CARGO_PKG_VERSION")),
            instructions: None,
            notifications: None,
        }
    }

    pub fn with_server_info(mut self, server_info: Implementation) -> Self {
        self.server_info = server_info;
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Publish `notifications/message` on handler failures to `sink`.
    pub fn with_notification_sink(mut self, sink: broadcast::Sender<McpMessage>) -> Self {
        self.notifications = Some(sink);
        self
    }

    /// Families this server serves, as advertised before negotiation.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            resources: self.exposure.file_operations.then(ResourcesCapability::default),
            tools: self.exposure.system_commands.then(ListChangedCapability::default),
            prompts: self.exposure.agent_configs.then(ListChangedCapability::default),
            elicitation: None,
            logging: self.logging.then_some(FlagCapability {}),
        }
    }

    /// Requested families ANDed with what this server exposes.
    pub fn negotiate(&self, requested: &Capabilities) -> Capabilities {
        let offered = self.capabilities();
        Capabilities {
            resources: requested.resources.as_ref().and(offered.resources),
            tools: requested.tools.as_ref().and(offered.tools),
            prompts: requested.prompts.as_ref().and(offered.prompts),
            elicitation: None,
            logging: requested.logging.as_ref().and(offered.logging),
        }
    }

    /// Handle one raw frame. `None` means nothing is sent back.
    pub async fn handle_text(&self, text: &str) -> Option<McpMessage> {
        match McpMessage::parse(text) {
            Ok(message) => self.handle(message).await,
            Err(e) => {
                warn!(error = %e, "Rejecting unparseable frame");
                let err = if e.code == tether_core::protocol::error_codes::PARSE_ERROR {
                    RouterError::Parse(e.message)
                } else {
                    RouterError::InvalidRequest(e.message)
                };
                Some(McpMessage::failure(None, err.to_rpc(self.policy)))
            }
        }
    }

    /// Handle one decoded envelope. `None` means nothing is sent back.
    pub async fn handle(&self, message: McpMessage) -> Option<McpMessage> {
        let Some(method) = message.method.clone() else {
            warn!(id = ?message.id, "Rejecting envelope without method");
            let err = RouterError::InvalidRequest("Invalid Request: missing method".to_string());
            return Some(McpMessage::failure(message.id, err.to_rpc(self.policy)));
        };

        match message.kind() {
            Ok(MessageKind::Notification) => {
                self.handle_notification(&method);
                None
            }
            Ok(MessageKind::Request) => {
                let id = message.id?;
                debug!(request_id = %id, method = %method, "Dispatching request");
                let outcome = AssertUnwindSafe(self.dispatch(&method, message.params))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| Err(RouterError::Handler(panic_error(payload))));
                match outcome {
                    Ok(result) => Some(McpMessage::success(id, result)),
                    Err(err) => {
                        self.report(&method, &err);
                        Some(McpMessage::failure(Some(id), err.to_rpc(self.policy)))
                    }
                }
            }
            Ok(MessageKind::Response) => None,
            Err(e) => {
                warn!(error = %e, "Rejecting invalid envelope");
                Some(McpMessage::failure(message.id, e))
            }
        }
    }

    fn handle_notification(&self, method: &str) {
        match method {
            methods::INITIALIZED => info!("Peer completed initialization"),
            _ => debug!(method, "Ignoring notification"),
        }
    }

    async fn dispatch(&self, method: &str, params: Option<Value>) -> Result<Value, RouterError> {
        match method {
            methods::INITIALIZE => return self.initialize(params),
            methods::PING => return Ok(json!({})),
            _ => {}
        }

        let family = Family::of(method)
            .ok_or_else(|| RouterError::UnknownMethod(method.to_string()))?;
        if !family.exposed(&self.exposure) {
            return Err(RouterError::Disabled {
                method: method.to_string(),
                family: family.name(),
            });
        }

        let handler = &self.handler;
        match method {
            methods::RESOURCES_LIST => {
                let p: ListParams = parse_params(params)?;
                encode(handler.list_resources(p.cursor).await?)
            }
            methods::RESOURCES_READ => {
                let p: ReadResourceParams = parse_params(params)?;
                encode(handler.read_resource(&p.uri).await?)
            }
            methods::TOOLS_LIST => {
                let p: ListParams = parse_params(params)?;
                encode(handler.list_tools(p.cursor).await?)
            }
            methods::TOOLS_CALL => {
                let p: CallToolParams = parse_params(params)?;
                encode(handler.call_tool(&p.name, p.arguments).await?)
            }
            methods::PROMPTS_LIST => {
                let p: ListParams = parse_params(params)?;
                encode(handler.list_prompts(p.cursor).await?)
            }
            methods::PROMPTS_GET => {
                let p: GetPromptParams = parse_params(params)?;
                encode(handler.get_prompt(&p.name, p.arguments).await?)
            }
            _ => Err(RouterError::UnknownMethod(method.to_string())),
        }
    }

    fn initialize(&self, params: Option<Value>) -> Result<Value, RouterError> {
        let params: InitializeParams = parse_params(params)?;
        let capabilities = self.negotiate(&params.capabilities);

        info!(
            client = %params.client_info.name,
            requested_version = %params.protocol_version,
            families = ?capabilities.families(),
            "Peer initializing"
        );

        encode(InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities,
            server_info: self.server_info.clone(),
            instructions: self.instructions.clone(),
        })
    }

    fn report(&self, method: &str, err: &RouterError) {
        match err {
            RouterError::Handler(e) => error!(method, error = %format!("{:#}", e), "Handler failed"),
            other => warn!(method, error = %other, "Request rejected"),
        }

        let (Some(sink), RouterError::Handler(e)) = (&self.notifications, err) else {
            return;
        };
        if !self.logging {
            return;
        }
        let params = LoggingMessageParams {
            level: LogLevel::Error,
            logger: Some("tether".to_string()),
            data: json!({ "method": method, "error": format!("{:#}", e) }),
        };
        if let Ok(params) = serde_json::to_value(params) {
            // No subscribers is fine.
            let _ = sink.send(McpMessage::notification(methods::LOG_MESSAGE, Some(params)));
        }
    }
}

/// Turn a caught panic into an error carrying the panic message.
fn panic_error(payload: Box<dyn Any + Send>) -> anyhow::Error {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    };
    anyhow::anyhow!(message)
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, RouterError> {
    let value = match params {
        None | Some(Value::Null) => Value::Object(Default::default()),
        Some(value) => value,
    };
    serde_json::from_value(value).map_err(|e| RouterError::InvalidParams(e.to_string()))
}

fn encode<T: Serialize>(result: T) -> Result<Value, RouterError> {
    serde_json::to_value(result).map_err(|e| RouterError::Handler(e.into()))
}
