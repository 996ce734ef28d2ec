//! Transport layer for the MCP client.
//!
//! A transport only moves envelopes. It never correlates responses; inbound
//! messages, closure and failures are fanned out to every listener registered
//! on its [`TransportEvents`]. Once a transport is disconnected (or has
//! reported closure/failure) no further listener fires.

pub mod http;
pub mod local;
pub mod sse;
pub mod stdio;

mod link;

pub use http::HttpTransport;
pub use local::LocalSocketTransport;
pub use stdio::StdioTransport;

use crate::config::ClientOptions;
use crate::error::ClientResult;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tether_core::bridge::HostBridge;
use tether_core::protocol::McpMessage;
use tether_core::TransportConfig;

pub type MessageListener = Arc<dyn Fn(&McpMessage) + Send + Sync>;
pub type CloseListener = Arc<dyn Fn() + Send + Sync>;
pub type ErrorListener = Arc<dyn Fn(&str) + Send + Sync>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Listener lists for the three transport event kinds.
#[derive(Default)]
pub struct TransportEvents {
    active: AtomicBool,
    message: Mutex<Vec<MessageListener>>,
    close: Mutex<Vec<CloseListener>>,
    error: Mutex<Vec<ErrorListener>>,
}

impl TransportEvents {
    pub fn on_message(&self, listener: impl Fn(&McpMessage) + Send + Sync + 'static) {
        lock(&self.message).push(Arc::new(listener));
    }

    pub fn on_close(&self, listener: impl Fn() + Send + Sync + 'static) {
        lock(&self.close).push(Arc::new(listener));
    }

    pub fn on_error(&self, listener: impl Fn(&str) + Send + Sync + 'static) {
        lock(&self.error).push(Arc::new(listener));
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn activate(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    /// Silence all listeners. Returns whether the transport was active.
    pub(crate) fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn emit_message(&self, message: &McpMessage) {
        if !self.is_active() {
            return;
        }
        let listeners = lock(&self.message).clone();
        for listener in listeners {
            listener(message);
        }
    }

    /// Fires at most once per activation.
    pub(crate) fn emit_close(&self) {
        if !self.deactivate() {
            return;
        }
        let listeners = lock(&self.close).clone();
        for listener in listeners {
            listener();
        }
    }

    /// A transport failure is terminal: it fires once and silences the transport.
    pub(crate) fn emit_error(&self, reason: &str) {
        if !self.deactivate() {
            return;
        }
        let listeners = lock(&self.error).clone();
        for listener in listeners {
            listener(reason);
        }
    }
}

/// Byte-delivery mechanism underneath a connection.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> ClientResult<()>;

    /// Idempotent. No listener fires afterwards.
    async fn disconnect(&self);

    /// Deliver one envelope. Never resolves responses itself.
    async fn send(&self, message: &McpMessage) -> ClientResult<()>;

    fn events(&self) -> &TransportEvents;
}

/// Build the transport matching a server's configuration.
pub fn for_config(
    config: &TransportConfig,
    request_timeout: Duration,
    bridge: Arc<dyn HostBridge>,
    options: &ClientOptions,
) -> ClientResult<Arc<dyn Transport>> {
    let transport: Arc<dyn Transport> = match config {
        TransportConfig::Http { url, auth } => Arc::new(HttpTransport::new(
            url,
            auth.clone(),
            options.health_timeout,
            request_timeout,
        )?),
        TransportConfig::Stdio { command, args, env } => Arc::new(StdioTransport::new(
            bridge,
            command.clone(),
            args.clone(),
            env.clone(),
        )),
        TransportConfig::Local { socket_path } => {
            Arc::new(LocalSocketTransport::new(bridge, socket_path.clone()))
        }
    };
    Ok(transport)
}
