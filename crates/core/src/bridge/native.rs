// Host bridge backed by tokio processes, Unix sockets and a TCP peer listener

use super::{
    BridgeError, BridgeEvent, BridgeEvents, BridgeResult, ChannelKey, HostBridge, PeerEvent,
    PeerEvents, PeerId, ProcessHandle,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pause after a failed accept, e.g. when the process is out of descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

type Writer = Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

fn writer<W: AsyncWrite + Send + Unpin + 'static>(w: W) -> Writer {
    Arc::new(tokio::sync::Mutex::new(Box::new(w)))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ProcessEntry {
    child: Child,
    stdin: Writer,
    tasks: Vec<JoinHandle<()>>,
}

struct SocketEntry {
    writer: Writer,
    reader: JoinHandle<()>,
}

struct PeerEntry {
    writer: Writer,
    reader: Option<JoinHandle<()>>,
}

type PeerMap = Arc<Mutex<HashMap<PeerId, PeerEntry>>>;

#[derive(Default)]
struct Inner {
    next_handle: AtomicU64,
    processes: Mutex<HashMap<ProcessHandle, ProcessEntry>>,
    sockets: Mutex<HashMap<PathBuf, SocketEntry>>,
    queues: Mutex<HashMap<ChannelKey, BridgeEvents>>,
    peers: PeerMap,
    listener: Mutex<Option<JoinHandle<()>>>,
}

/// Host bridge for running as a regular OS process.
#[derive(Clone, Default)]
pub struct NativeHostBridge {
    inner: Arc<Inner>,
}

impl NativeHostBridge {
    pub fn new() -> Self {
        Self::default()
    }

    fn writer_for(&self, key: &ChannelKey) -> Option<Writer> {
        match key {
            ChannelKey::Process(handle) => lock(&self.inner.processes)
                .get(handle)
                .map(|entry| entry.stdin.clone()),
            ChannelKey::Socket(path) => lock(&self.inner.sockets)
                .get(path)
                .map(|entry| entry.writer.clone()),
        }
    }
}

/// Forward each non-empty line as a message; end of stream closes the channel.
fn spawn_line_reader<R>(
    reader: R,
    tx: mpsc::UnboundedSender<BridgeEvent>,
    label: String,
) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if tx.send(BridgeEvent::Message(line)).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!(channel = %label, "Channel reached end of stream");
                    let _ = tx.send(BridgeEvent::Closed);
                    break;
                }
                Err(e) => {
                    let _ = tx.send(BridgeEvent::Error(e.to_string()));
                    break;
                }
            }
        }
    })
}

fn spawn_stderr_logger<R>(reader: R, command: String) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(command = %command, "stderr: {}", line);
        }
    })
}

fn spawn_peer_reader<R>(
    peer: PeerId,
    reader: R,
    tx: mpsc::UnboundedSender<PeerEvent>,
    peers: PeerMap,
) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(payload)) => {
                    if payload.trim().is_empty() {
                        continue;
                    }
                    if tx.send(PeerEvent::Message { peer, payload }).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Peer read failed");
                    break;
                }
            }
        }
        lock(&peers).remove(&peer);
        let _ = tx.send(PeerEvent::Disconnected(peer));
    })
}

#[async_trait]
impl HostBridge for NativeHostBridge {
    async fn spawn_process(
        &self,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> BridgeResult<ProcessHandle> {
        let spawn_failed = |reason: String| BridgeError::SpawnFailed {
            command: command.to_string(),
            reason,
        };

        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_failed(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_failed("stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_failed("stdout unavailable".to_string()))?;

        let handle = ProcessHandle(self.inner.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        let key = ChannelKey::Process(handle);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut tasks = vec![spawn_line_reader(stdout, tx, key.to_string())];
        if let Some(stderr) = child.stderr.take() {
            tasks.push(spawn_stderr_logger(stderr, command.to_string()));
        }

        lock(&self.inner.queues).insert(key, rx);
        lock(&self.inner.processes).insert(
            handle,
            ProcessEntry {
                child,
                stdin: writer(stdin),
                tasks,
            },
        );

        info!(command = %command, handle = %handle, "Spawned process");
        Ok(handle)
    }

    async fn terminate_process(&self, handle: ProcessHandle) -> BridgeResult<()> {
        let entry = lock(&self.inner.processes).remove(&handle);
        lock(&self.inner.queues).remove(&ChannelKey::Process(handle));

        if let Some(mut entry) = entry {
            if let Err(e) = entry.child.kill().await {
                warn!(handle = %handle, error = %e, "Failed to kill process");
            }
            for task in entry.tasks {
                task.abort();
            }
            info!(handle = %handle, "Terminated process");
        }
        Ok(())
    }

    #[cfg(unix)]
    async fn open_local_socket(&self, path: &Path) -> BridgeResult<()> {
        if lock(&self.inner.sockets).contains_key(path) {
            return Err(BridgeError::SocketFailed {
                path: path.to_path_buf(),
                reason: "socket already open".to_string(),
            });
        }

        let stream = tokio::net::UnixStream::connect(path)
            .await
            .map_err(|e| BridgeError::SocketFailed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        let (read_half, write_half) = stream.into_split();

        let key = ChannelKey::Socket(path.to_path_buf());
        let (tx, rx) = mpsc::unbounded_channel();
        let reader = spawn_line_reader(read_half, tx, key.to_string());

        lock(&self.inner.queues).insert(key, rx);
        lock(&self.inner.sockets).insert(
            path.to_path_buf(),
            SocketEntry {
                writer: writer(write_half),
                reader,
            },
        );

        info!(path = %path.display(), "Opened local socket");
        Ok(())
    }

    #[cfg(not(unix))]
    async fn open_local_socket(&self, _path: &Path) -> BridgeResult<()> {
        Err(BridgeError::Unsupported("local sockets".to_string()))
    }

    async fn close_local_socket(&self, path: &Path) -> BridgeResult<()> {
        let entry = lock(&self.inner.sockets).remove(path);
        lock(&self.inner.queues).remove(&ChannelKey::Socket(path.to_path_buf()));

        if let Some(entry) = entry {
            entry.reader.abort();
            let mut w = entry.writer.lock().await;
            if let Err(e) = w.shutdown().await {
                debug!(path = %path.display(), error = %e, "Socket shutdown failed");
            }
            info!(path = %path.display(), "Closed local socket");
        }
        Ok(())
    }

    async fn send_on_channel(&self, key: &ChannelKey, bytes: &[u8]) -> BridgeResult<()> {
        let writer = self
            .writer_for(key)
            .ok_or_else(|| BridgeError::UnknownChannel(key.to_string()))?;

        let mut w = writer.lock().await;
        w.write_all(bytes).await?;
        w.flush().await?;
        Ok(())
    }

    fn subscribe(&self, key: &ChannelKey) -> BridgeResult<BridgeEvents> {
        if let Some(queue) = lock(&self.inner.queues).remove(key) {
            return Ok(queue);
        }
        if self.writer_for(key).is_some() {
            Err(BridgeError::AlreadySubscribed(key.to_string()))
        } else {
            Err(BridgeError::UnknownChannel(key.to_string()))
        }
    }

    async fn listen_for_peers(&self, port: u16) -> BridgeResult<PeerEvents> {
        if lock(&self.inner.listener).is_some() {
            return Err(BridgeError::AlreadyListening);
        }

        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        info!(addr = ?listener.local_addr().ok(), "Listening for MCP peers");

        let (tx, rx) = mpsc::unbounded_channel();
        let peers = self.inner.peers.clone();
        let task = tokio::spawn(async move {
            loop {
                let (stream, addr) = accept_with_backoff(|| listener.accept()).await;

                let peer = PeerId::new();
                debug!(peer = %peer, addr = %addr, "Peer connected");
                let (read_half, write_half) = stream.into_split();

                lock(&peers).insert(
                    peer,
                    PeerEntry {
                        writer: writer(write_half),
                        reader: None,
                    },
                );
                if tx.send(PeerEvent::Connected(peer)).is_err() {
                    break;
                }

                let reader = spawn_peer_reader(peer, read_half, tx.clone(), peers.clone());
                if let Some(entry) = lock(&peers).get_mut(&peer) {
                    entry.reader = Some(reader);
                }
            }
        });

        let mut slot = lock(&self.inner.listener);
        if slot.is_some() {
            task.abort();
            return Err(BridgeError::AlreadyListening);
        }
        *slot = Some(task);
        Ok(rx)
    }

    async fn send_to_peer(&self, peer: PeerId, bytes: &[u8]) -> BridgeResult<()> {
        let writer = lock(&self.inner.peers)
            .get(&peer)
            .map(|entry| entry.writer.clone())
            .ok_or(BridgeError::UnknownPeer(peer))?;

        let mut w = writer.lock().await;
        w.write_all(bytes).await?;
        w.flush().await?;
        Ok(())
    }

    async fn stop_listening(&self) -> BridgeResult<()> {
        if let Some(task) = lock(&self.inner.listener).take() {
            task.abort();
            info!("Stopped listening for MCP peers");
        }

        let peers: Vec<PeerEntry> = lock(&self.inner.peers).drain().map(|(_, e)| e).collect();
        for entry in peers {
            if let Some(reader) = entry.reader {
                reader.abort();
            }
        }
        Ok(())
    }
}

/// Retry `accept` until it yields a connection, sleeping between failures.
async fn accept_with_backoff<T, E, F, Fut>(mut accept: F) -> T
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                warn!(error = %e, "Failed to accept peer");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}
