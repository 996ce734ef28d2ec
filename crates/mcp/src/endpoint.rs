// Serves the router to inbound peers accepted by the host bridge

use crate::error::EndpointError;
use crate::handler::McpHandler;
use crate::router::McpRouter;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tether_core::bridge::{HostBridge, PeerEvent, PeerEvents, PeerId};
use tether_core::protocol::McpMessage;
use tether_core::settings::ServerSettings;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const NOTIFICATION_CAPACITY: usize = 64;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Running {
    router: Arc<McpRouter>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// MCP server side bound to a [`HostBridge`].
///
/// Each inbound frame is answered on its own task, so one slow or failing
/// request never holds up other peers. Log notifications published by the
/// router are forwarded to every connected peer.
pub struct McpEndpoint {
    bridge: Arc<dyn HostBridge>,
    state: tokio::sync::Mutex<Option<Running>>,
    peers: Arc<Mutex<HashSet<PeerId>>>,
    notifications: broadcast::Sender<McpMessage>,
}

impl McpEndpoint {
    pub fn new(bridge: Arc<dyn HostBridge>) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            bridge,
            state: tokio::sync::Mutex::new(None),
            peers: Arc::new(Mutex::new(HashSet::new())),
            notifications,
        }
    }

    /// Start accepting peers on `settings.port`. The returned router is the
    /// one peers are served by and can be shared with other surfaces.
    pub async fn start(
        &self,
        settings: &ServerSettings,
        handler: Arc<dyn McpHandler>,
    ) -> Result<Arc<McpRouter>, EndpointError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(EndpointError::AlreadyRunning);
        }
        if !settings.enabled {
            return Err(EndpointError::Disabled);
        }

        let router = Arc::new(
            McpRouter::new(settings, handler).with_notification_sink(self.notifications.clone()),
        );
        let events = self.bridge.listen_for_peers(settings.port).await?;
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run(
            self.bridge.clone(),
            router.clone(),
            self.peers.clone(),
            events,
            self.notifications.subscribe(),
            cancel.clone(),
        ));

        info!(port = settings.port, "MCP endpoint started");
        *state = Some(Running {
            router: router.clone(),
            cancel,
            task,
        });
        Ok(router)
    }

    /// Stop accepting peers and forget all of them. Idempotent.
    pub async fn stop(&self) -> Result<(), EndpointError> {
        let running = self.state.lock().await.take();
        lock(&self.peers).clear();

        let Some(running) = running else {
            return Ok(());
        };
        running.cancel.cancel();
        if let Err(e) = running.task.await {
            warn!(error = %e, "MCP endpoint task ended abnormally");
        }
        self.bridge.stop_listening().await?;
        info!("MCP endpoint stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.is_some()
    }

    pub async fn router(&self) -> Option<Arc<McpRouter>> {
        self.state.lock().await.as_ref().map(|r| r.router.clone())
    }

    /// Currently connected peers
    pub fn peers(&self) -> Vec<PeerId> {
        lock(&self.peers).iter().copied().collect()
    }

    /// Server-initiated notifications, as sent to peers.
    pub fn subscribe(&self) -> broadcast::Receiver<McpMessage> {
        self.notifications.subscribe()
    }

    /// Publisher behind [`Self::subscribe`], for surfaces streaming the same
    /// notifications to their own clients.
    pub fn notification_sender(&self) -> broadcast::Sender<McpMessage> {
        self.notifications.clone()
    }
}

async fn run(
    bridge: Arc<dyn HostBridge>,
    router: Arc<McpRouter>,
    peers: Arc<Mutex<HashSet<PeerId>>>,
    mut events: PeerEvents,
    mut notifications: broadcast::Receiver<McpMessage>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(PeerEvent::Connected(peer)) => {
                    info!(peer = %peer, "Peer connected");
                    lock(&peers).insert(peer);
                }
                Some(PeerEvent::Disconnected(peer)) => {
                    info!(peer = %peer, "Peer disconnected");
                    lock(&peers).remove(&peer);
                }
                Some(PeerEvent::Message { peer, payload }) => {
                    debug!(peer = %peer, bytes = payload.len(), "Inbound frame");
                    let bridge = bridge.clone();
                    let router = router.clone();
                    tokio::spawn(async move {
                        if let Some(reply) = router.handle_text(&payload).await {
                            send(bridge.as_ref(), peer, &reply).await;
                        }
                    });
                }
                None => {
                    info!("Peer event stream ended");
                    break;
                }
            },
            note = notifications.recv() => match note {
                Ok(message) => {
                    // One write task per peer; a stalled peer must not block the loop.
                    let targets: Vec<PeerId> = lock(&peers).iter().copied().collect();
                    for peer in targets {
                        let bridge = bridge.clone();
                        let message = message.clone();
                        tokio::spawn(async move {
                            send(bridge.as_ref(), peer, &message).await;
                        });
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Dropped notifications for slow peers");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

async fn send(bridge: &dyn HostBridge, peer: PeerId, message: &McpMessage) {
    let line = match message.to_line() {
        Ok(line) => line,
        Err(e) => {
            error!(peer = %peer, error = %e, "Failed to encode reply");
            return;
        }
    };
    if let Err(e) = bridge.send_to_peer(peer, line.as_bytes()).await {
        warn!(peer = %peer, error = %e, "Failed to write to peer");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use serde_json::json;
    use tether_core::bridge::{
        BridgeEvents, BridgeResult, ChannelKey, LoopbackBridge, ProcessHandle,
    };
    use tether_core::protocol::{error_codes, methods, RequestId};
    use tether_core::settings::ExposedResources;

    fn settings() -> ServerSettings {
        ServerSettings {
            enabled: true,
            exposed_resources: ExposedResources::all(),
            ..Default::default()
        }
    }

    async fn started() -> (LoopbackBridge, McpEndpoint) {
        let bridge = LoopbackBridge::new();
        let endpoint = McpEndpoint::new(Arc::new(bridge.clone()));
        endpoint
            .start(&settings(), Arc::new(Catalog::new()))
            .await
            .unwrap();
        (bridge, endpoint)
    }

    async fn reply(bridge: &LoopbackBridge) -> (PeerId, McpMessage) {
        let (peer, text) = bridge.next_reply().await.unwrap();
        (peer, McpMessage::parse(&text).unwrap())
    }

    #[tokio::test]
    async fn test_answers_peer_requests() {
        let (bridge, endpoint) = started().await;
        let peer = bridge.connect_peer();

        let ping = McpMessage::request(1, methods::PING, None);
        bridge.deliver(peer, serde_json::to_string(&ping).unwrap());

        let (to, message) = reply(&bridge).await;
        assert_eq!(to, peer);
        assert_eq!(message.result, Some(json!({})));
        assert_eq!(endpoint.peers(), vec![peer]);
    }

    #[tokio::test]
    async fn test_bad_frame_gets_parse_error() {
        let (bridge, _endpoint) = started().await;
        let peer = bridge.connect_peer();

        bridge.deliver(peer, "{not json");

        let (_, message) = reply(&bridge).await;
        assert_eq!(message.error.unwrap().code, error_codes::PARSE_ERROR);
    }

    #[tokio::test]
    async fn test_start_twice_and_disabled() {
        let (_bridge, endpoint) = started().await;
        assert!(matches!(
            endpoint.start(&settings(), Arc::new(Catalog::new())).await,
            Err(EndpointError::AlreadyRunning)
        ));

        let other = McpEndpoint::new(Arc::new(LoopbackBridge::new()));
        let disabled = ServerSettings::default();
        assert!(matches!(
            other.start(&disabled, Arc::new(Catalog::new())).await,
            Err(EndpointError::Disabled)
        ));
        assert!(!other.is_running().await);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_clears_peers() {
        let (bridge, endpoint) = started().await;
        let peer = bridge.connect_peer();
        bridge.deliver(
            peer,
            serde_json::to_string(&McpMessage::request(1, methods::PING, None)).unwrap(),
        );
        reply(&bridge).await;
        assert_eq!(endpoint.peers().len(), 1);

        endpoint.stop().await.unwrap();
        endpoint.stop().await.unwrap();

        assert!(endpoint.peers().is_empty());
        assert!(!endpoint.is_running().await);
        assert!(!bridge.is_listening());

        // Can be started again after stopping
        endpoint
            .start(&settings(), Arc::new(Catalog::new()))
            .await
            .unwrap();
        assert!(endpoint.router().await.is_some());
    }

    #[tokio::test]
    async fn test_handler_failure_is_broadcast_as_log() {
        let (bridge, endpoint) = started().await;
        let mut logs = endpoint.subscribe();
        let peer = bridge.connect_peer();

        let call = McpMessage::request(
            7,
            methods::TOOLS_CALL,
            Some(json!({ "name": "missing" })),
        );
        bridge.deliver(peer, serde_json::to_string(&call).unwrap());

        let mut saw_error = false;
        let mut saw_log = false;
        for _ in 0..2 {
            let (_, message) = reply(&bridge).await;
            if message.id.is_some() {
                assert_eq!(message.error.unwrap().code, error_codes::INTERNAL_ERROR);
                saw_error = true;
            } else {
                assert_eq!(message.method.as_deref(), Some(methods::LOG_MESSAGE));
                saw_log = true;
            }
        }
        assert!(saw_error && saw_log);

        let log = logs.recv().await.unwrap();
        assert_eq!(log.params.unwrap()["level"], "error");
    }

    #[tokio::test]
    async fn test_disconnected_peer_is_forgotten() {
        let (bridge, endpoint) = started().await;
        let first = bridge.connect_peer();
        let second = bridge.connect_peer();
        bridge.disconnect_peer(first);

        bridge.deliver(
            second,
            serde_json::to_string(&McpMessage::request(1, methods::PING, None)).unwrap(),
        );
        reply(&bridge).await;

        assert_eq!(endpoint.peers(), vec![second]);
    }

    /// Delegates to a loopback bridge, except that writes to one chosen
    /// peer never complete.
    struct StallingBridge {
        inner: LoopbackBridge,
        stalled: Mutex<Option<PeerId>>,
    }

    #[async_trait::async_trait]
    impl HostBridge for StallingBridge {
        async fn spawn_process(
            &self,
            command: &str,
            args: &[String],
            env: &std::collections::HashMap<String, String>,
        ) -> BridgeResult<ProcessHandle> {
            self.inner.spawn_process(command, args, env).await
        }

        async fn terminate_process(&self, handle: ProcessHandle) -> BridgeResult<()> {
            self.inner.terminate_process(handle).await
        }

        async fn open_local_socket(&self, path: &std::path::Path) -> BridgeResult<()> {
            self.inner.open_local_socket(path).await
        }

        async fn close_local_socket(&self, path: &std::path::Path) -> BridgeResult<()> {
            self.inner.close_local_socket(path).await
        }

        async fn send_on_channel(&self, key: &ChannelKey, bytes: &[u8]) -> BridgeResult<()> {
            self.inner.send_on_channel(key, bytes).await
        }

        fn subscribe(&self, key: &ChannelKey) -> BridgeResult<BridgeEvents> {
            self.inner.subscribe(key)
        }

        async fn listen_for_peers(&self, port: u16) -> BridgeResult<PeerEvents> {
            self.inner.listen_for_peers(port).await
        }

        async fn send_to_peer(&self, peer: PeerId, bytes: &[u8]) -> BridgeResult<()> {
            if *lock(&self.stalled) == Some(peer) {
                std::future::pending::<()>().await;
            }
            self.inner.send_to_peer(peer, bytes).await
        }

        async fn stop_listening(&self) -> BridgeResult<()> {
            self.inner.stop_listening().await
        }
    }

    #[tokio::test]
    async fn test_stalled_peer_does_not_block_others() {
        let loopback = LoopbackBridge::new();
        let bridge = Arc::new(StallingBridge {
            inner: loopback.clone(),
            stalled: Mutex::new(None),
        });
        let endpoint = McpEndpoint::new(bridge.clone());
        endpoint
            .start(&settings(), Arc::new(Catalog::new()))
            .await
            .unwrap();
        let mut logs = endpoint.subscribe();

        let stuck = loopback.connect_peer();
        let live = loopback.connect_peer();
        *lock(&bridge.stalled) = Some(stuck);

        // A failing call publishes a log notification to every peer
        let call = McpMessage::request(
            7,
            methods::TOOLS_CALL,
            Some(json!({ "name": "missing" })),
        );
        loopback.deliver(live, serde_json::to_string(&call).unwrap());
        logs.recv().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let ping = McpMessage::request(8, methods::PING, None);
        loopback.deliver(live, serde_json::to_string(&ping).unwrap());

        let answered = tokio::time::timeout(std::time::Duration::from_secs(2), async {
            loop {
                let (to, message) = reply(&loopback).await;
                assert_eq!(to, live);
                if message.id == Some(RequestId::Number(8)) {
                    return message;
                }
            }
        })
        .await
        .expect("ping to the live peer was never answered");

        assert_eq!(answered.result, Some(json!({})));
    }
}
