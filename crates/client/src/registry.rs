//! Registry of live connections to external MCP servers, keyed by server id.
//!
//! The registry is an ordinary value owned by the application's composition
//! root. Callers address servers by id and never touch a `Connection`
//! directly; a failure on one connection leaves every other one untouched.

use crate::config::ClientOptions;
use crate::connection::Connection;
use crate::error::{ClientError, ClientResult};
use crate::transport::{self, lock};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};
use tether_core::bridge::HostBridge;
use tether_core::protocol::{
    GetPromptResult, InitializeResult, ListPromptsResult, ListResourcesResult, ListToolsResult,
    ReadResourceResult, ToolCallResult,
};
use tether_core::{McpServer, ServerId, ServerStatus};
use tracing::{info, warn};

struct Registered {
    descriptor: McpServer,
    connection: Arc<Connection>,
}

/// Facade over every client connection the application holds.
pub struct ClientRegistry {
    bridge: Arc<dyn HostBridge>,
    options: ClientOptions,
    connections: RwLock<HashMap<ServerId, Registered>>,
    connecting: Mutex<HashSet<ServerId>>,
}

impl ClientRegistry {
    pub fn new(bridge: Arc<dyn HostBridge>) -> Self {
        Self::with_options(bridge, ClientOptions::default())
    }

    pub fn with_options(bridge: Arc<dyn HostBridge>, options: ClientOptions) -> Self {
        Self {
            bridge,
            options,
            connections: RwLock::new(HashMap::new()),
            connecting: Mutex::new(HashSet::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ServerId, Registered>> {
        self.connections.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ServerId, Registered>> {
        self.connections.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `id` for an in-flight connect.
    fn reserve(&self, id: &ServerId) -> ClientResult<()> {
        let mut connecting = lock(&self.connecting);
        if self.read().contains_key(id) || connecting.contains(id) {
            return Err(ClientError::AlreadyConnected(id.clone()));
        }
        connecting.insert(id.clone());
        Ok(())
    }

    fn release(&self, id: &ServerId) {
        lock(&self.connecting).remove(id);
    }

    /// Connect to `server` and register the connection under its id.
    ///
    /// The descriptor's `status`, `capabilities`, `error` and
    /// `last_connected` fields are updated to reflect the outcome.
    pub async fn connect(&self, server: &mut McpServer) -> ClientResult<InitializeResult> {
        self.reserve(&server.id)?;
        server.mark_connecting();

        let result = self.open(server).await;
        match result {
            Ok((connection, init)) => {
                server.mark_connected(init.capabilities.families());
                self.write().insert(
                    server.id.clone(),
                    Registered {
                        descriptor: server.clone(),
                        connection,
                    },
                );
                self.release(&server.id);
                info!(
                    server_id = %server.id,
                    transport = ?server.transport_type(),
                    capabilities = ?server.capabilities,
                    "Connected to MCP server"
                );
                Ok(init)
            }
            Err(e) => {
                self.release(&server.id);
                server.mark_error(e.to_string());
                warn!(server_id = %server.id, error = %e, "MCP server connect failed");
                Err(e)
            }
        }
    }

    async fn open(&self, server: &McpServer) -> ClientResult<(Arc<Connection>, InitializeResult)> {
        let timeout = server.config.timeout();
        let transport = transport::for_config(
            &server.config.transport,
            timeout,
            self.bridge.clone(),
            &self.options,
        )?;
        let connection = Arc::new(Connection::new(
            server.id.clone(),
            transport,
            timeout,
            self.options.clone(),
        ));
        let init = connection.connect().await?;
        Ok((connection, init))
    }

    /// Connect, retrying transient failures up to the descriptor's
    /// `retry_count` with exponential backoff.
    pub async fn connect_with_retry(
        &self,
        server: &mut McpServer,
    ) -> ClientResult<InitializeResult> {
        let retry_config = &self.options.retry_config;
        let mut attempts = 0;

        loop {
            match self.connect(server).await {
                Ok(init) => return Ok(init),
                Err(e) if attempts < server.config.retry_count && e.is_retryable() => {
                    let backoff = retry_config.backoff_for_attempt(attempts);
                    warn!(
                        server_id = %server.id,
                        attempt = attempts + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Connect failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempts += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Close and forget a connection. Unknown ids are ignored.
    ///
    /// Returns the final descriptor when a connection was registered.
    pub async fn disconnect(&self, server_id: &ServerId) -> Option<McpServer> {
        let registered = self.write().remove(server_id)?;
        registered.connection.disconnect().await;

        let mut descriptor = registered.descriptor;
        descriptor.mark_disconnected();
        info!(server_id = %server_id, "Disconnected from MCP server");
        Some(descriptor)
    }

    pub async fn disconnect_all(&self) -> Vec<McpServer> {
        let ids: Vec<ServerId> = self.read().keys().cloned().collect();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(descriptor) = self.disconnect(&id).await {
                out.push(descriptor);
            }
        }
        out
    }

    /// Snapshot of every registered server, with live status.
    pub fn get_connected_servers(&self) -> Vec<McpServer> {
        let mut servers: Vec<McpServer> = self
            .read()
            .values()
            .map(|registered| {
                let mut descriptor = registered.descriptor.clone();
                match registered.connection.status() {
                    ServerStatus::Error => {
                        let reason = registered
                            .connection
                            .last_error()
                            .unwrap_or_else(|| "transport error".to_string());
                        descriptor.mark_error(reason);
                    }
                    ServerStatus::Disconnected => descriptor.mark_disconnected(),
                    _ => {}
                }
                descriptor
            })
            .collect();
        servers.sort_by(|a, b| a.id.cmp(&b.id));
        servers
    }

    pub fn is_connected(&self, server_id: &ServerId) -> bool {
        self.read().contains_key(server_id)
    }

    pub fn status(&self, server_id: &ServerId) -> Option<ServerStatus> {
        self.read()
            .get(server_id)
            .map(|registered| registered.connection.status())
    }

    /// Live connection for `server_id`.
    pub fn connection(&self, server_id: &ServerId) -> ClientResult<Arc<Connection>> {
        self.read()
            .get(server_id)
            .map(|registered| registered.connection.clone())
            .ok_or_else(|| ClientError::NotConnected(server_id.clone()))
    }

    pub async fn ping(&self, server_id: &ServerId) -> ClientResult<()> {
        self.connection(server_id)?.ping().await
    }

    pub async fn list_resources(
        &self,
        server_id: &ServerId,
        cursor: Option<String>,
    ) -> ClientResult<ListResourcesResult> {
        self.connection(server_id)?.list_resources(cursor).await
    }

    pub async fn read_resource(
        &self,
        server_id: &ServerId,
        uri: &str,
    ) -> ClientResult<ReadResourceResult> {
        self.connection(server_id)?.read_resource(uri).await
    }

    pub async fn list_tools(
        &self,
        server_id: &ServerId,
        cursor: Option<String>,
    ) -> ClientResult<ListToolsResult> {
        self.connection(server_id)?.list_tools(cursor).await
    }

    pub async fn call_tool(
        &self,
        server_id: &ServerId,
        name: &str,
        arguments: Option<Value>,
    ) -> ClientResult<ToolCallResult> {
        self.connection(server_id)?.call_tool(name, arguments).await
    }

    pub async fn list_prompts(
        &self,
        server_id: &ServerId,
        cursor: Option<String>,
    ) -> ClientResult<ListPromptsResult> {
        self.connection(server_id)?.list_prompts(cursor).await
    }

    pub async fn get_prompt(
        &self,
        server_id: &ServerId,
        name: &str,
        arguments: HashMap<String, String>,
    ) -> ClientResult<GetPromptResult> {
        self.connection(server_id)?.get_prompt(name, arguments).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use std::path::PathBuf;
    use std::time::Duration;
    use tether_core::bridge::{BridgeEvent, LoopbackBridge};
    use tether_core::{ServerConfig, TransportConfig};

    fn stdio_server(id: &str) -> McpServer {
        McpServer::new(
            id,
            format!("{} server", id),
            ServerConfig::new(TransportConfig::Stdio {
                command: "mcp-server".to_string(),
                args: vec!["--stdio".to_string()],
                env: HashMap::new(),
            }),
        )
    }

    fn local_server(id: &str) -> McpServer {
        McpServer::new(
            id,
            "socket server",
            ServerConfig::new(TransportConfig::Local {
                socket_path: PathBuf::from(format!("/tmp/{}.sock", id)),
            }),
        )
    }

    #[tokio::test]
    async fn test_connect_registers_and_updates_descriptor() {
        let bridge = LoopbackBridge::mcp_server();
        let registry = ClientRegistry::new(Arc::new(bridge.clone()));
        let mut server = stdio_server("alpha");

        registry.connect(&mut server).await.unwrap();

        assert_eq!(server.status, ServerStatus::Connected);
        assert!(server.last_connected.is_some());
        assert!(server.capabilities.contains(&"tools".to_string()));
        assert!(registry.is_connected(&server.id));

        let tools = registry.list_tools(&server.id, None).await.unwrap();
        assert!(tools.tools.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_connect_rejected() {
        let bridge = LoopbackBridge::mcp_server();
        let registry = ClientRegistry::new(Arc::new(bridge.clone()));
        let mut server = stdio_server("alpha");
        registry.connect(&mut server).await.unwrap();

        let mut again = stdio_server("alpha");
        let result = registry.connect(&mut again).await;

        assert!(matches!(result, Err(ClientError::AlreadyConnected(_))));
        assert_eq!(bridge.spawned().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_marks_error_and_stays_unregistered() {
        let bridge = LoopbackBridge::mcp_server();
        bridge.fail_next_open("permission denied");
        let registry = ClientRegistry::new(Arc::new(bridge.clone()));
        let mut server = local_server("beta");

        assert!(registry.connect(&mut server).await.is_err());

        assert_eq!(server.status, ServerStatus::Error);
        assert!(server.error.as_deref().unwrap().contains("permission denied"));
        assert!(!registry.is_connected(&server.id));

        // The id is free again after a failure.
        registry.connect(&mut server).await.unwrap();
        assert_eq!(server.status, ServerStatus::Connected);
    }

    #[tokio::test]
    async fn test_operations_on_unknown_server() {
        let registry = ClientRegistry::new(Arc::new(LoopbackBridge::mcp_server()));
        let id = ServerId::new("ghost");

        assert!(matches!(
            registry.call_tool(&id, "anything", None).await,
            Err(ClientError::NotConnected(_))
        ));
        assert!(registry.disconnect(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_connect_then_disconnect_each_bridge_transport() {
        let bridge = LoopbackBridge::mcp_server();
        let registry = ClientRegistry::new(Arc::new(bridge.clone()));

        for mut server in [stdio_server("one"), local_server("two")] {
            registry.connect(&mut server).await.unwrap();
            let connection = registry.connection(&server.id).unwrap();

            let descriptor = registry.disconnect(&server.id).await.unwrap();

            assert_eq!(descriptor.status, ServerStatus::Disconnected);
            assert_eq!(connection.pending_count(), 0);
            assert_eq!(connection.status(), ServerStatus::Disconnected);
        }
        assert!(registry.get_connected_servers().is_empty());
        assert!(bridge.open_channels().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_reflects_failed_connection_only() {
        let bridge = LoopbackBridge::mcp_server();
        let registry = ClientRegistry::new(Arc::new(bridge.clone()));
        let mut healthy = stdio_server("healthy");
        let mut broken = local_server("broken");
        registry.connect(&mut healthy).await.unwrap();
        registry.connect(&mut broken).await.unwrap();

        let key = tether_core::bridge::ChannelKey::Socket(PathBuf::from("/tmp/broken.sock"));
        bridge.push(&key, BridgeEvent::Error("socket reset".to_string()));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let snapshot = registry.get_connected_servers();
        assert_eq!(snapshot.len(), 2);
        let broken = snapshot.iter().find(|s| s.id.as_str() == "broken").unwrap();
        let healthy = snapshot.iter().find(|s| s.id.as_str() == "healthy").unwrap();
        assert_eq!(broken.status, ServerStatus::Error);
        assert_eq!(broken.error.as_deref(), Some("socket reset"));
        assert_eq!(healthy.status, ServerStatus::Connected);
        assert!(registry.ping(&healthy.id).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_with_retry_recovers() {
        let bridge = LoopbackBridge::mcp_server();
        let options = ClientOptions {
            retry_config: RetryConfig {
                initial_backoff: Duration::from_millis(10),
                ..Default::default()
            },
            ..Default::default()
        };
        let registry = ClientRegistry::with_options(Arc::new(bridge.clone()), options);
        let mut server = stdio_server("flaky");
        server.config.retry_count = 2;

        // First write fails, which fails the handshake with a retryable error.
        bridge.fail_sends(true);
        let unblock = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                bridge.fail_sends(false);
            })
        };

        registry.connect_with_retry(&mut server).await.unwrap();
        unblock.await.unwrap();

        assert_eq!(server.status, ServerStatus::Connected);
        assert_eq!(bridge.spawned().len(), 2);
    }

    #[tokio::test]
    async fn test_connect_with_retry_gives_up_on_permanent_error() {
        let bridge = LoopbackBridge::new();
        bridge.fail_next_open("no such binary");
        let registry = ClientRegistry::new(Arc::new(bridge.clone()));
        let mut server = stdio_server("missing");
        server.config.retry_count = 3;

        assert!(matches!(
            registry.connect_with_retry(&mut server).await,
            Err(ClientError::Bridge(_))
        ));
        assert_eq!(bridge.spawned().len(), 0);
    }
}
