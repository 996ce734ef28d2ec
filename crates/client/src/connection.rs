//! A single client session with one MCP server.
//!
//! The connection owns a transport, allocates request ids, and correlates
//! responses through its [`PendingTable`]. Responses are matched purely by id,
//! so they may arrive in any order. Each request carries its own deadline; a
//! response that shows up after its deadline is logged and dropped.

use crate::config::ClientOptions;
use crate::error::{ClientError, ClientResult};
use crate::pending::PendingTable;
use crate::transport::{lock, Transport};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_core::protocol::{
    methods, CallToolParams, Capabilities, GetPromptParams, GetPromptResult, InitializeParams,
    InitializeResult, ListParams, ListPromptsResult, ListResourcesResult, ListToolsResult,
    McpMessage, MessageKind, ReadResourceParams, ReadResourceResult, RequestId, ToolCallResult,
};
use tether_core::{ServerId, ServerStatus};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub type NotificationListener = Arc<dyn Fn(&McpMessage) + Send + Sync>;

/// State shared with the transport's listeners.
struct Shared {
    server_id: ServerId,
    pending: PendingTable,
    status: Mutex<ServerStatus>,
    last_error: Mutex<Option<String>>,
    peer: Mutex<Option<InitializeResult>>,
    notification_listeners: Mutex<Vec<NotificationListener>>,
}

impl Shared {
    fn set_status(&self, status: ServerStatus) {
        *lock(&self.status) = status;
    }

    fn handle_inbound(&self, message: &McpMessage) {
        let kind = match message.kind() {
            Ok(kind) => kind,
            Err(e) => {
                warn!(server_id = %self.server_id, error = %e, "Dropping invalid envelope");
                return;
            }
        };

        match kind {
            MessageKind::Response => self.handle_response(message.clone()),
            MessageKind::Notification => {
                debug!(server_id = %self.server_id, method = ?message.method, "Received notification");
                let listeners = lock(&self.notification_listeners).clone();
                for listener in listeners {
                    listener(message);
                }
            }
            MessageKind::Request => {
                warn!(
                    server_id = %self.server_id,
                    method = ?message.method,
                    "Ignoring server-initiated request"
                );
            }
        }
    }

    fn handle_response(&self, message: McpMessage) {
        let Some(id) = message.id.clone() else {
            if let Some(error) = &message.error {
                warn!(server_id = %self.server_id, error = %error, "Server reported an error without a request id");
            }
            return;
        };

        let outcome = message.into_result().map_err(ClientError::from);
        if !self.pending.resolve(&id, outcome) {
            warn!(server_id = %self.server_id, request_id = %id, "Dropping response for unknown or expired request");
        }
    }

    fn handle_close(&self) {
        let failed = self.pending.fail_all(|| ClientError::ConnectionClosed);
        self.set_status(ServerStatus::Disconnected);
        info!(server_id = %self.server_id, failed, "Connection closed");
    }

    fn handle_error(&self, reason: &str) {
        let failed = self
            .pending
            .fail_all(|| ClientError::Transport(reason.to_string()));
        *lock(&self.last_error) = Some(reason.to_string());
        self.set_status(ServerStatus::Error);
        warn!(server_id = %self.server_id, failed, error = reason, "Transport failed");
    }
}

/// Client session with one MCP server.
pub struct Connection {
    transport: Arc<dyn Transport>,
    timeout: Duration,
    options: ClientOptions,
    next_id: AtomicI64,
    shared: Arc<Shared>,
}

impl Connection {
    pub fn new(
        server_id: ServerId,
        transport: Arc<dyn Transport>,
        timeout: Duration,
        options: ClientOptions,
    ) -> Self {
        let shared = Arc::new(Shared {
            server_id,
            pending: PendingTable::new(),
            status: Mutex::new(ServerStatus::Disconnected),
            last_error: Mutex::new(None),
            peer: Mutex::new(None),
            notification_listeners: Mutex::new(Vec::new()),
        });

        let events = transport.events();
        let on_message = shared.clone();
        events.on_message(move |msg| on_message.handle_inbound(msg));
        let on_close = shared.clone();
        events.on_close(move || on_close.handle_close());
        let on_error = shared.clone();
        events.on_error(move |reason| on_error.handle_error(reason));

        Self {
            transport,
            timeout,
            options,
            next_id: AtomicI64::new(1),
            shared,
        }
    }

    pub fn server_id(&self) -> &ServerId {
        &self.shared.server_id
    }

    pub fn status(&self) -> ServerStatus {
        *lock(&self.shared.status)
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.shared.last_error).clone()
    }

    /// The server's `initialize` answer, once connected.
    pub fn peer_info(&self) -> Option<InitializeResult> {
        lock(&self.shared.peer).clone()
    }

    pub fn peer_capabilities(&self) -> Option<Capabilities> {
        lock(&self.shared.peer).as_ref().map(|p| p.capabilities.clone())
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Observe server notifications such as `notifications/message`.
    pub fn on_notification(&self, listener: impl Fn(&McpMessage) + Send + Sync + 'static) {
        lock(&self.shared.notification_listeners).push(Arc::new(listener));
    }

    /// Open the transport and perform the `initialize` handshake.
    pub async fn connect(&self) -> ClientResult<InitializeResult> {
        if self.status() == ServerStatus::Connected {
            return Err(ClientError::AlreadyConnected(self.shared.server_id.clone()));
        }
        self.shared.set_status(ServerStatus::Connecting);
        *lock(&self.shared.last_error) = None;

        if let Err(e) = self.transport.connect().await {
            self.fail_connect(&e);
            return Err(e);
        }

        match self.handshake().await {
            Ok(result) => {
                info!(
                    server_id = %self.shared.server_id,
                    server = %result.server_info.name,
                    protocol_version = %result.protocol_version,
                    "MCP session initialized"
                );
                *lock(&self.shared.peer) = Some(result.clone());
                self.shared.set_status(ServerStatus::Connected);
                Ok(result)
            }
            Err(e) => {
                self.transport.disconnect().await;
                self.shared
                    .pending
                    .fail_all(|| ClientError::ConnectionClosed);
                self.fail_connect(&e);
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> ClientResult<InitializeResult> {
        let params = InitializeParams {
            protocol_version: self.options.protocol_version.clone(),
            capabilities: self.options.capabilities.clone(),
            client_info: self.options.client_info.clone(),
        };
        let result: InitializeResult = self.call(methods::INITIALIZE, &params).await?;
        self.notify(methods::INITIALIZED, None).await?;
        Ok(result)
    }

    fn fail_connect(&self, error: &ClientError) {
        *lock(&self.shared.last_error) = Some(error.to_string());
        self.shared.set_status(ServerStatus::Error);
        warn!(server_id = %self.shared.server_id, error = %error, "Failed to connect");
    }

    /// Close the transport and fail anything still outstanding.
    pub async fn disconnect(&self) {
        self.transport.disconnect().await;
        let failed = self
            .shared
            .pending
            .fail_all(|| ClientError::ConnectionClosed);
        self.shared.set_status(ServerStatus::Disconnected);
        debug!(server_id = %self.shared.server_id, failed, "Disconnected");
    }

    /// Send a request and wait for its response or its deadline.
    pub async fn request(&self, method: &str, params: Option<Value>) -> ClientResult<Value> {
        if matches!(
            self.status(),
            ServerStatus::Disconnected | ServerStatus::Error
        ) {
            return Err(ClientError::ConnectionClosed);
        }

        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let deadline = Instant::now() + self.timeout;
        let rx = self.shared.pending.register(id.clone(), method, deadline);

        debug!(server_id = %self.shared.server_id, request_id = %id, method, "Sending request");
        let message = McpMessage::request(id.clone(), method, params);
        if let Err(e) = self.transport.send(&message).await {
            self.shared.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                self.shared.pending.remove(&id);
                warn!(
                    server_id = %self.shared.server_id,
                    request_id = %id,
                    method,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Request timed out"
                );
                Err(ClientError::Timeout {
                    method: method.to_string(),
                    timeout: self.timeout,
                })
            }
        }
    }

    /// Send a notification; no response is expected.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> ClientResult<()> {
        self.transport
            .send(&McpMessage::notification(method, params))
            .await
    }

    async fn call<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: &P,
    ) -> ClientResult<R> {
        let params = serde_json::to_value(params)?;
        let value = self.request(method, Some(params)).await?;
        decode(method, value)
    }

    pub async fn ping(&self) -> ClientResult<()> {
        self.request(methods::PING, None).await.map(|_| ())
    }

    pub async fn list_resources(&self, cursor: Option<String>) -> ClientResult<ListResourcesResult> {
        self.call(methods::RESOURCES_LIST, &ListParams { cursor }).await
    }

    pub async fn read_resource(&self, uri: &str) -> ClientResult<ReadResourceResult> {
        let params = ReadResourceParams {
            uri: uri.to_string(),
        };
        self.call(methods::RESOURCES_READ, &params).await
    }

    pub async fn list_tools(&self, cursor: Option<String>) -> ClientResult<ListToolsResult> {
        self.call(methods::TOOLS_LIST, &ListParams { cursor }).await
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> ClientResult<ToolCallResult> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };
        self.call(methods::TOOLS_CALL, &params).await
    }

    pub async fn list_prompts(&self, cursor: Option<String>) -> ClientResult<ListPromptsResult> {
        self.call(methods::PROMPTS_LIST, &ListParams { cursor }).await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: HashMap<String, String>,
    ) -> ClientResult<GetPromptResult> {
        let params = GetPromptParams {
            name: name.to_string(),
            arguments,
        };
        self.call(methods::PROMPTS_GET, &params).await
    }
}

/// A `null` result decodes like an empty object so absent fields default.
fn decode<R: DeserializeOwned>(method: &str, value: Value) -> ClientResult<R> {
    let value = if value.is_null() {
        Value::Object(Default::default())
    } else {
        value
    };
    serde_json::from_value(value)
        .map_err(|e| ClientError::Protocol(format!("invalid {} result: {}", method, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::StdioTransport;
    use serde_json::json;
    use tether_core::bridge::{BridgeEvent, ChannelKey, LoopbackBridge};
    use tether_core::protocol::JsonRpcError;

    fn connection(bridge: &LoopbackBridge, timeout: Duration) -> Arc<Connection> {
        let transport = Arc::new(StdioTransport::new(
            Arc::new(bridge.clone()),
            "mcp-server".to_string(),
            Vec::new(),
            HashMap::new(),
        ));
        Arc::new(Connection::new(
            ServerId::new("test"),
            transport,
            timeout,
            ClientOptions::default(),
        ))
    }

    fn channel(bridge: &LoopbackBridge) -> ChannelKey {
        bridge.open_channels().pop().expect("open channel")
    }

    async fn wait_for_pending(conn: &Connection, count: usize) {
        for _ in 0..200 {
            if conn.pending_count() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} pending requests, found {}", count, conn.pending_count());
    }

    #[tokio::test]
    async fn test_connect_performs_handshake() {
        let bridge = LoopbackBridge::mcp_server();
        let conn = connection(&bridge, Duration::from_secs(5));

        let result = conn.connect().await.unwrap();

        assert_eq!(result.server_info.name, "loopback");
        assert_eq!(conn.status(), ServerStatus::Connected);
        assert!(conn.peer_capabilities().unwrap().tools.is_some());

        let methods_sent: Vec<_> = bridge
            .sent(&channel(&bridge))
            .into_iter()
            .filter_map(|m| m.method)
            .collect();
        assert_eq!(methods_sent, vec!["initialize", "notifications/initialized"]);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_reach_their_callers() {
        let bridge = LoopbackBridge::mcp_server();
        let conn = connection(&bridge, Duration::from_secs(5));
        conn.connect().await.unwrap();
        let key = channel(&bridge);

        let mut tasks = Vec::new();
        for uri in ["file:///a", "file:///b", "file:///c"] {
            let conn = conn.clone();
            tasks.push(tokio::spawn(async move {
                (uri, conn.read_resource(uri).await)
            }));
        }
        wait_for_pending(&conn, 3).await;

        let reads: Vec<McpMessage> = bridge
            .sent(&key)
            .into_iter()
            .filter(|m| m.method.as_deref() == Some("resources/read"))
            .collect();
        assert_eq!(reads.len(), 3);

        for request in reads.iter().rev() {
            let uri = request.params.as_ref().unwrap()["uri"].clone();
            bridge.push_message(
                &key,
                &McpMessage::success(
                    request.id.clone().unwrap(),
                    json!({ "contents": [{ "uri": uri, "text": "body" }] }),
                ),
            );
        }

        for task in tasks {
            let (uri, result) = task.await.unwrap();
            assert_eq!(result.unwrap().contents[0].uri, uri);
        }
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_response_is_dropped() {
        let bridge = LoopbackBridge::mcp_server();
        let conn = connection(&bridge, Duration::from_secs(1));
        conn.connect().await.unwrap();
        let key = channel(&bridge);

        let result = conn.read_resource("file:///slow").await;
        assert!(matches!(result, Err(ClientError::Timeout { .. })));
        assert_eq!(conn.pending_count(), 0);

        let late = bridge
            .sent(&key)
            .into_iter()
            .find(|m| m.method.as_deref() == Some("resources/read"))
            .unwrap();
        bridge.push_message(
            &key,
            &McpMessage::success(late.id.unwrap(), json!({ "contents": [] })),
        );
        tokio::task::yield_now().await;

        assert_eq!(conn.pending_count(), 0);
        assert!(conn.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_close_fails_every_pending_request() {
        let bridge = LoopbackBridge::mcp_server();
        let conn = connection(&bridge, Duration::from_secs(5));
        conn.connect().await.unwrap();
        let key = channel(&bridge);

        let mut tasks = Vec::new();
        for n in 0..3 {
            let conn = conn.clone();
            tasks.push(tokio::spawn(async move {
                conn.call_tool(&format!("tool-{}", n), None).await
            }));
        }
        wait_for_pending(&conn, 3).await;

        bridge.push(&key, BridgeEvent::Closed);

        for task in tasks {
            assert!(matches!(task.await.unwrap(), Err(ClientError::ConnectionClosed)));
        }
        assert_eq!(conn.pending_count(), 0);
        assert_eq!(conn.status(), ServerStatus::Disconnected);
        assert!(matches!(
            conn.ping().await,
            Err(ClientError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_transport_error_marks_connection() {
        let bridge = LoopbackBridge::mcp_server();
        let conn = connection(&bridge, Duration::from_secs(5));
        conn.connect().await.unwrap();

        bridge.push(&channel(&bridge), BridgeEvent::Error("broken pipe".to_string()));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(conn.status(), ServerStatus::Error);
        assert_eq!(conn.last_error().as_deref(), Some("broken pipe"));
    }

    #[tokio::test]
    async fn test_connect_then_disconnect_leaves_nothing_behind() {
        let bridge = LoopbackBridge::mcp_server();
        let conn = connection(&bridge, Duration::from_secs(5));

        conn.connect().await.unwrap();
        conn.disconnect().await;

        assert_eq!(conn.status(), ServerStatus::Disconnected);
        assert_eq!(conn.pending_count(), 0);
        assert!(bridge.open_channels().is_empty());
    }

    #[tokio::test]
    async fn test_rpc_error_surfaces_code() {
        let bridge = LoopbackBridge::mcp_server();
        let conn = connection(&bridge, Duration::from_secs(5));
        conn.connect().await.unwrap();
        let key = channel(&bridge);

        let pending = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.get_prompt("missing", HashMap::new()).await })
        };
        wait_for_pending(&conn, 1).await;

        let request = bridge
            .sent(&key)
            .into_iter()
            .find(|m| m.method.as_deref() == Some("prompts/get"))
            .unwrap();
        bridge.push_message(
            &key,
            &McpMessage::failure(request.id, JsonRpcError::invalid_params("Unknown prompt")),
        );

        match pending.await.unwrap() {
            Err(ClientError::Rpc { code, .. }) => assert_eq!(code, -32602),
            other => panic!("expected rpc error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_failed_initialize_closes_transport() {
        let bridge = LoopbackBridge::new().with_responder(|msg| {
            Some(McpMessage::failure(
                msg.id.clone(),
                JsonRpcError::internal_error("boot failure"),
            ))
        });
        let conn = connection(&bridge, Duration::from_secs(5));

        assert!(matches!(
            conn.connect().await,
            Err(ClientError::Rpc { code: -32603, .. })
        ));
        assert_eq!(conn.status(), ServerStatus::Error);
        assert!(bridge.open_channels().is_empty());
    }

    #[tokio::test]
    async fn test_notifications_reach_listener() {
        let bridge = LoopbackBridge::mcp_server();
        let conn = connection(&bridge, Duration::from_secs(5));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        conn.on_notification(move |msg| {
            s.lock().unwrap().push(msg.method.clone().unwrap_or_default());
        });
        conn.connect().await.unwrap();

        bridge.push_message(
            &channel(&bridge),
            &McpMessage::notification(
                "notifications/message",
                Some(json!({ "level": "info", "data": "hello" })),
            ),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(*seen.lock().unwrap(), vec!["notifications/message".to_string()]);
    }

    #[test]
    fn test_null_result_decodes_as_empty() {
        let result: ListToolsResult = decode("tools/list", Value::Null).unwrap();
        assert!(result.tools.is_empty());
    }
}
