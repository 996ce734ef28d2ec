//! Subprocess transport: one newline-delimited JSON envelope per line on the
//! child's stdin/stdout, carried by the host bridge.

use super::link::BridgeLink;
use super::{Transport, TransportEvents};
use crate::error::ClientResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tether_core::bridge::{ChannelKey, HostBridge};
use tether_core::protocol::McpMessage;
use tracing::{debug, info, warn};

pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    link: BridgeLink,
}

impl StdioTransport {
    pub fn new(
        bridge: Arc<dyn HostBridge>,
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    ) -> Self {
        Self {
            command,
            args,
            env,
            link: BridgeLink::new(bridge),
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn connect(&self) -> ClientResult<()> {
        if self.link.is_attached() {
            return Ok(());
        }
        // Reap a process whose channel already closed or failed
        self.disconnect().await;

        let handle = self
            .link
            .bridge
            .spawn_process(&self.command, &self.args, &self.env)
            .await?;

        if let Err(e) = self.link.attach(ChannelKey::Process(handle)) {
            if let Err(term) = self.link.bridge.terminate_process(handle).await {
                warn!(process = %handle, error = %term, "Failed to reap process after subscribe error");
            }
            return Err(e);
        }

        info!(command = %self.command, process = %handle, "Spawned MCP server process");
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(ChannelKey::Process(handle)) = self.link.detach() {
            debug!(process = %handle, "Terminating MCP server process");
            if let Err(e) = self.link.bridge.terminate_process(handle).await {
                warn!(process = %handle, error = %e, "Failed to terminate process");
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
