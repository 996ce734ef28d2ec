//! Local socket transport: newline-delimited envelopes over a named socket
//! opened by the host bridge.

use super::link::BridgeLink;
use super::{Transport, TransportEvents};
use crate::error::ClientResult;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tether_core::bridge::{ChannelKey, HostBridge};
use tether_core::protocol::McpMessage;
use tracing::{info, warn};

pub struct LocalSocketTransport {
    socket_path: PathBuf,
    link: BridgeLink,
}

impl LocalSocketTransport {
    pub fn new(bridge: Arc<dyn HostBridge>, socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            link: BridgeLink::new(bridge),
        }
    }
}

#[async_trait]
impl Transport for LocalSocketTransport {
    async fn connect(&self) -> ClientResult<()> {
        if self.link.is_attached() {
            return Ok(());
        }
        // Release a socket whose channel already closed or failed
        self.disconnect().await;

        self.link.bridge.open_local_socket(&self.socket_path).await?;

        if let Err(e) = self.link.attach(ChannelKey::Socket(self.socket_path.clone())) {
            if let Err(close) = self.link.bridge.close_local_socket(&self.socket_path).await {
                warn!(path = %self.socket_path.display(), error = %close, "Failed to close socket after subscribe error");
            }
            return Err(e);
        }

        info!(path = %self.socket_path.display(), "Opened local MCP socket");
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(ChannelKey::Socket(path)) = self.link.detach() {
            if let Err(e) = self.link.bridge.close_local_socket(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to close local socket");
            }
        }
    }

    async fn send(&self, message: &McpMessage) -> ClientResult<()> {
        self.link.send(message).await
    }

    fn events(&self) -> &TransportEvents {
        &self.link.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use tether_core::bridge::{BridgeEvent, LoopbackBridge};
    use tether_core::protocol::RequestId;

    #[tokio::test]
    async fn test_inbound_frames_reach_listener() {
        let bridge = LoopbackBridge::mcp_server();
        let transport = LocalSocketTransport::new(
            Arc::new(bridge.clone()),
            PathBuf::from("/tmp/tether-test.sock"),
        );
        let received = Arc::new(Mutex::new(Vec::new()));
        let r = received.clone();
        transport.events().on_message(move |msg| {
            r.lock().unwrap().push(msg.clone());
        });

        transport.connect().await.unwrap();
        transport
            .send(&McpMessage::request(RequestId::from(7), "ping", None))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].id, Some(RequestId::from(7)));
    }

    #[tokio::test]
    async fn test_stream_error_reported_once() {
        let bridge = LoopbackBridge::new();
        let path = PathBuf::from("/tmp/tether-error.sock");
        let transport = LocalSocketTransport::new(Arc::new(bridge.clone()), path.clone());
        let errors = Arc::new(Mutex::new(Vec::new()));
        let e = errors.clone();
        transport
            .events()
            .on_error(move |reason| e.lock().unwrap().push(reason.to_string()));

        transport.connect().await.unwrap();
        let key = ChannelKey::Socket(path);
        bridge.push(&key, BridgeEvent::Error("connection reset".to_string()));
        bridge.push(&key, BridgeEvent::Error("again".to_string()));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(*errors.lock().unwrap(), vec!["connection reset".to_string()]);
    }

    #[tokio::test]
    async fn test_reconnect_after_stream_error_reopens() {
        let bridge = LoopbackBridge::new();
        let path = PathBuf::from("/tmp/tether-reopen.sock");
        let transport = LocalSocketTransport::new(Arc::new(bridge.clone()), path.clone());
        transport.connect().await.unwrap();

        let key = ChannelKey::Socket(path);
        bridge.push(&key, BridgeEvent::Error("connection reset".to_string()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!transport.events().is_active());

        transport.connect().await.unwrap();

        assert!(transport.events().is_active());
        transport
            .send(&McpMessage::request(RequestId::from(3), "ping", None))
            .await
            .unwrap();
        assert_eq!(bridge.sent(&key).len(), 1);
    }

    #[tokio::test]
    async fn test_open_failure() {
        let bridge = LoopbackBridge::new();
        bridge.fail_next_open("refused");
        let transport =
            LocalSocketTransport::new(Arc::new(bridge.clone()), PathBuf::from("/tmp/none.sock"));

        assert!(transport.connect().await.is_err());
        assert!(bridge.open_channels().is_empty());
    }
}
