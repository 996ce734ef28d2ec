//! Host bridge: the platform layer that spawns processes, opens local
//! sockets, accepts inbound peers and delivers their events.
//!
//! The protocol core only talks to the host through [`HostBridge`]. Each
//! opened channel (process or socket) gets one event queue that buffers
//! from the moment the channel is opened until someone calls
//! [`HostBridge::subscribe`], so no early output is lost.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use uuid::Uuid;

#[cfg(feature = "test-util")]
mod loopback;
mod native;

#[cfg(feature = "test-util")]
pub use loopback::{LoopbackBridge, Responder};
pub use native::NativeHostBridge;

/// Opaque handle of a spawned process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessHandle(pub u64);

impl std::fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "proc-{}", self.0)
    }
}

/// Key of an outbound channel
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelKey {
    Process(ProcessHandle),
    Socket(PathBuf),
}

impl std::fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Process(handle) => write!(f, "{}", handle),
            Self::Socket(path) => write!(f, "socket:{}", path.display()),
        }
    }
}

/// Event delivered on an outbound channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// One inbound frame (a line, without its terminator)
    Message(String),
    Error(String),
    Closed,
}

pub type BridgeEvents = mpsc::UnboundedReceiver<BridgeEvent>;

/// Identifier of an inbound peer connected to our server side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub Uuid);

impl PeerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Event concerning an inbound peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Connected(PeerId),
    Disconnected(PeerId),
    Message { peer: PeerId, payload: String },
}

pub type PeerEvents = mpsc::UnboundedReceiver<PeerEvent>;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Failed to spawn '{command}': {reason}")]
    SpawnFailed { command: String, reason: String },

    #[error("Failed to open socket {}: {reason}", path.display())]
    SocketFailed { path: PathBuf, reason: String },

    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    #[error("Channel {0} already has a subscriber")]
    AlreadySubscribed(String),

    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),

    #[error("Already listening for peers")]
    AlreadyListening,

    #[error("Not supported on this platform: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type BridgeResult<T> = Result<T, BridgeError>;

/// Platform capabilities the protocol core is built on.
#[async_trait]
pub trait HostBridge: Send + Sync {
    /// Spawn `command` with piped stdio. Frames are newline-delimited.
    async fn spawn_process(
        &self,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> BridgeResult<ProcessHandle>;

    /// Request termination. Unknown handles are ignored.
    async fn terminate_process(&self, handle: ProcessHandle) -> BridgeResult<()>;

    async fn open_local_socket(&self, path: &Path) -> BridgeResult<()>;

    /// Close a socket opened with `open_local_socket`. Unknown paths are ignored.
    async fn close_local_socket(&self, path: &Path) -> BridgeResult<()>;

    /// Write bytes verbatim to the channel.
    async fn send_on_channel(&self, key: &ChannelKey, bytes: &[u8]) -> BridgeResult<()>;

    /// Take the event queue of an open channel. Each channel has one queue.
    fn subscribe(&self, key: &ChannelKey) -> BridgeResult<BridgeEvents>;

    /// Start accepting inbound peers.
    async fn listen_for_peers(&self, port: u16) -> BridgeResult<PeerEvents>;

    /// Write bytes verbatim to an inbound peer.
    async fn send_to_peer(&self, peer: PeerId, bytes: &[u8]) -> BridgeResult<()>;

    /// Stop accepting peers and drop every peer connection. Idempotent.
    async fn stop_listening(&self) -> BridgeResult<()>;
}
