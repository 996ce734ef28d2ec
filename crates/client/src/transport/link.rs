// Shared plumbing for transports whose bytes travel through a host-bridge channel

use super::{lock, TransportEvents};
use crate::error::{ClientError, ClientResult};
use std::sync::{Arc, Mutex};
use tether_core::bridge::{BridgeEvent, BridgeEvents, ChannelKey, HostBridge};
use tether_core::protocol::McpMessage;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One open bridge channel plus the task pumping its events into listeners.
pub(crate) struct BridgeLink {
    pub(crate) bridge: Arc<dyn HostBridge>,
    pub(crate) events: Arc<TransportEvents>,
    key: Mutex<Option<ChannelKey>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeLink {
    pub(crate) fn new(bridge: Arc<dyn HostBridge>) -> Self {
        Self {
            bridge,
            events: Arc::new(TransportEvents::default()),
            key: Mutex::new(None),
            pump: Mutex::new(None),
        }
    }

    /// Whether a channel is held and has not closed or failed since.
    pub(crate) fn is_attached(&self) -> bool {
        lock(&self.key).is_some() && self.events.is_active()
    }

    /// Take the channel's event queue and start delivering to listeners.
    pub(crate) fn attach(&self, key: ChannelKey) -> ClientResult<()> {
        let queue = self.bridge.subscribe(&key)?;
        self.events.activate();
        let pump = spawn_pump(queue, self.events.clone(), key.to_string());
        *lock(&self.pump) = Some(pump);
        *lock(&self.key) = Some(key);
        Ok(())
    }

    /// Silence listeners, stop pumping and hand back the channel key.
    pub(crate) fn detach(&self) -> Option<ChannelKey> {
        self.events.deactivate();
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
        lock(&self.key).take()
    }

    /// Write one newline-delimited frame. A failed write also fails the
    /// channel, since the peer can no longer be reached.
    pub(crate) async fn send(&self, message: &McpMessage) -> ClientResult<()> {
        let key = lock(&self.key)
            .clone()
            .ok_or_else(|| ClientError::Transport("not connected".to_string()))?;
        let line = message.to_line()?;
        if let Err(e) = self.bridge.send_on_channel(&key, line.as_bytes()).await {
            warn!(channel = %key, error = %e, "Write failed");
            self.events.emit_error(&e.to_string());
            return Err(e.into());
        }
        Ok(())
    }
}

fn spawn_pump(
    mut queue: BridgeEvents,
    events: Arc<TransportEvents>,
    label: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = queue.recv().await {
            match event {
                BridgeEvent::Message(line) => match McpMessage::parse(&line) {
                    Ok(message) => events.emit_message(&message),
                    Err(e) => warn!(channel = %label, error = %e, "Ignoring malformed frame"),
                },
                BridgeEvent::Error(reason) => {
                    events.emit_error(&reason);
                    return;
                }
                BridgeEvent::Closed => {
                    events.emit_close();
                    return;
                }
            }
        }
        debug!(channel = %label, "Bridge event queue ended");
        events.emit_close();
    })
}
