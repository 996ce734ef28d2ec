// In-memory host bridge that plays the remote side of every channel.
//
// Processes and sockets are simulated: frames written by the local side are
// recorded and optionally answered by a `Responder`; tests can also inject
// events directly. Inbound peers are driven with `connect_peer` /
// `deliver` and their replies observed through `next_reply`.

use super::{
    BridgeError, BridgeEvent, BridgeEvents, BridgeResult, ChannelKey, HostBridge, PeerEvent,
    PeerEvents, PeerId, ProcessHandle,
};
use crate::protocol::{methods, Capabilities, Implementation, InitializeResult, McpMessage};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// Produces the remote side's answer to a frame written by the local side.
pub type Responder = Arc<dyn Fn(&McpMessage) -> Option<McpMessage> + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Channel {
    tx: mpsc::UnboundedSender<BridgeEvent>,
    sent: Vec<String>,
}

struct Inner {
    next_handle: AtomicU64,
    channels: Mutex<HashMap<ChannelKey, Channel>>,
    queues: Mutex<HashMap<ChannelKey, BridgeEvents>>,
    spawned: Mutex<Vec<(String, Vec<String>)>>,
    responder: Mutex<Option<Responder>>,
    fail_open: Mutex<Option<String>>,
    fail_sends: Mutex<bool>,
    peer_tx: Mutex<Option<mpsc::UnboundedSender<PeerEvent>>>,
    peers: Mutex<Vec<PeerId>>,
    reply_tx: Mutex<Option<mpsc::UnboundedSender<(PeerId, String)>>>,
    reply_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<(PeerId, String)>>>,
}

#[derive(Clone)]
pub struct LoopbackBridge {
    inner: Arc<Inner>,
}

impl Default for LoopbackBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackBridge {
    pub fn new() -> Self {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                next_handle: AtomicU64::new(0),
                channels: Mutex::new(HashMap::new()),
                queues: Mutex::new(HashMap::new()),
                spawned: Mutex::new(Vec::new()),
                responder: Mutex::new(None),
                fail_open: Mutex::new(None),
                fail_sends: Mutex::new(false),
                peer_tx: Mutex::new(None),
                peers: Mutex::new(Vec::new()),
                reply_tx: Mutex::new(Some(reply_tx)),
                reply_rx: tokio::sync::Mutex::new(Some(reply_rx)),
            }),
        }
    }

    /// A bridge whose channels behave like a minimal MCP server: `initialize`,
    /// `ping` and the three list methods are answered, everything else is left
    /// for the test to answer with [`LoopbackBridge::push`].
    pub fn mcp_server() -> Self {
        Self::new().with_responder(|msg| {
            let id = msg.id.clone()?;
            let result = match msg.method.as_deref()? {
                methods::INITIALIZE => serde_json::to_value(InitializeResult {
                    protocol_version: crate::protocol::PROTOCOL_VERSION.to_string(),
                    capabilities: Capabilities::all(),
                    server_info: Implementation::new("loopback", "0.0.0"),
                    instructions: None,
                })
                .ok()?,
                methods::PING => serde_json::json!({}),
                methods::TOOLS_LIST => serde_json::json!({ "tools": [] }),
                methods::RESOURCES_LIST => serde_json::json!({ "resources": [] }),
                methods::PROMPTS_LIST => serde_json::json!({ "prompts": [] }),
                _ => return None,
            };
            Some(McpMessage::success(id, result))
        })
    }

    pub fn with_responder<F>(self, responder: F) -> Self
    where
        F: Fn(&McpMessage) -> Option<McpMessage> + Send + Sync + 'static,
    {
        *lock(&self.inner.responder) = Some(Arc::new(responder));
        self
    }

    /// Make the next spawn/open fail with `reason`.
    pub fn fail_next_open(&self, reason: impl Into<String>) {
        *lock(&self.inner.fail_open) = Some(reason.into());
    }

    pub fn fail_sends(&self, fail: bool) {
        *lock(&self.inner.fail_sends) = fail;
    }

    /// Inject an event on a channel as if the remote side produced it.
    pub fn push(&self, key: &ChannelKey, event: BridgeEvent) {
        if let Some(channel) = lock(&self.inner.channels).get(key) {
            let _ = channel.tx.send(event);
        }
    }

    pub fn push_message(&self, key: &ChannelKey, message: &McpMessage) {
        if let Ok(text) = serde_json::to_string(message) {
            self.push(key, BridgeEvent::Message(text));
        }
    }

    /// Frames written to a channel, decoded.
    pub fn sent(&self, key: &ChannelKey) -> Vec<McpMessage> {
        lock(&self.inner.channels)
            .get(key)
            .map(|c| {
                c.sent
                    .iter()
                    .filter_map(|line| McpMessage::parse(line).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Channels that are currently open.
    pub fn open_channels(&self) -> Vec<ChannelKey> {
        lock(&self.inner.channels).keys().cloned().collect()
    }

    /// Commands spawned so far, with their arguments.
    pub fn spawned(&self) -> Vec<(String, Vec<String>)> {
        lock(&self.inner.spawned).clone()
    }

    fn open(&self, key: ChannelKey) -> BridgeResult<()> {
        if let Some(reason) = lock(&self.inner.fail_open).take() {
            return Err(match &key {
                ChannelKey::Process(_) => BridgeError::SpawnFailed {
                    command: key.to_string(),
                    reason,
                },
                ChannelKey::Socket(path) => BridgeError::SocketFailed {
                    path: path.clone(),
                    reason,
                },
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner.queues).insert(key.clone(), rx);
        lock(&self.inner.channels).insert(key, Channel { tx, sent: Vec::new() });
        Ok(())
    }

    fn close(&self, key: &ChannelKey) {
        lock(&self.inner.channels).remove(key);
        lock(&self.inner.queues).remove(key);
    }

    /// Simulate a peer connecting to our server side.
    pub fn connect_peer(&self) -> PeerId {
        let peer = PeerId::new();
        lock(&self.inner.peers).push(peer);
        if let Some(tx) = lock(&self.inner.peer_tx).as_ref() {
            let _ = tx.send(PeerEvent::Connected(peer));
        }
        peer
    }

    pub fn disconnect_peer(&self, peer: PeerId) {
        lock(&self.inner.peers).retain(|p| *p != peer);
        if let Some(tx) = lock(&self.inner.peer_tx).as_ref() {
            let _ = tx.send(PeerEvent::Disconnected(peer));
        }
    }

    /// Deliver a raw inbound frame from `peer`.
    pub fn deliver(&self, peer: PeerId, payload: impl Into<String>) {
        if let Some(tx) = lock(&self.inner.peer_tx).as_ref() {
            let _ = tx.send(PeerEvent::Message {
                peer,
                payload: payload.into(),
            });
        }
    }

    /// Wait for the next frame our server side wrote to any peer.
    pub async fn next_reply(&self) -> Option<(PeerId, String)> {
        let mut guard = self.inner.reply_rx.lock().await;
        guard.as_mut()?.recv().await
    }

    pub fn is_listening(&self) -> bool {
        lock(&self.inner.peer_tx).is_some()
    }
}

#[async_trait]
impl HostBridge for LoopbackBridge {
    async fn spawn_process(
        &self,
        command: &str,
        args: &[String],
        _env: &HashMap<String, String>,
    ) -> BridgeResult<ProcessHandle> {
        let handle = ProcessHandle(self.inner.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        self.open(ChannelKey::Process(handle))?;
        lock(&self.inner.spawned).push((command.to_string(), args.to_vec()));
        Ok(handle)
    }

    async fn terminate_process(&self, handle: ProcessHandle) -> BridgeResult<()> {
        self.close(&ChannelKey::Process(handle));
        Ok(())
    }

    async fn open_local_socket(&self, path: &Path) -> BridgeResult<()> {
        self.open(ChannelKey::Socket(path.to_path_buf()))
    }

    async fn close_local_socket(&self, path: &Path) -> BridgeResult<()> {
        self.close(&ChannelKey::Socket(path.to_path_buf()));
        Ok(())
    }

    async fn send_on_channel(&self, key: &ChannelKey, bytes: &[u8]) -> BridgeResult<()> {
        if *lock(&self.inner.fail_sends) {
            return Err(BridgeError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "simulated write failure",
            )));
        }

        let text = String::from_utf8_lossy(bytes).to_string();
        let responder = lock(&self.inner.responder).clone();

        let mut channels = lock(&self.inner.channels);
        let channel = channels
            .get_mut(key)
            .ok_or_else(|| BridgeError::UnknownChannel(key.to_string()))?;

        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            channel.sent.push(line.to_string());
            let reply = McpMessage::parse(line)
                .ok()
                .and_then(|msg| responder.as_ref().and_then(|r| r(&msg)));
            if let Some(reply) = reply {
                if let Ok(reply_text) = serde_json::to_string(&reply) {
                    let _ = channel.tx.send(BridgeEvent::Message(reply_text));
                }
            }
        }
        Ok(())
    }

    fn subscribe(&self, key: &ChannelKey) -> BridgeResult<BridgeEvents> {
        if let Some(queue) = lock(&self.inner.queues).remove(key) {
            return Ok(queue);
        }
        if lock(&self.inner.channels).contains_key(key) {
            Err(BridgeError::AlreadySubscribed(key.to_string()))
        } else {
            Err(BridgeError::UnknownChannel(key.to_string()))
        }
    }

    async fn listen_for_peers(&self, _port: u16) -> BridgeResult<PeerEvents> {
        let mut slot = lock(&self.inner.peer_tx);
        if slot.is_some() {
            return Err(BridgeError::AlreadyListening);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *slot = Some(tx);
        Ok(rx)
    }

    async fn send_to_peer(&self, peer: PeerId, bytes: &[u8]) -> BridgeResult<()> {
        if !lock(&self.inner.peers).contains(&peer) {
            return Err(BridgeError::UnknownPeer(peer));
        }
        let text = String::from_utf8_lossy(bytes).trim_end().to_string();
        if let Some(tx) = lock(&self.inner.reply_tx).as_ref() {
            let _ = tx.send((peer, text));
        }
        Ok(())
    }

    async fn stop_listening(&self) -> BridgeResult<()> {
        lock(&self.inner.peer_tx).take();
        lock(&self.inner.peers).clear();
        Ok(())
    }
}
