// Contract between the router and whatever the application exposes

use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use tether_core::protocol::{
    GetPromptResult, ListPromptsResult, ListResourcesResult, ListToolsResult, ReadResourceResult,
    ToolCallResult,
};

/// Backing implementation for the six gated MCP methods.
///
/// Errors returned here never reach the transport as failures; the router
/// turns them into JSON-RPC internal errors for the calling peer only.
#[async_trait::async_trait]
pub trait McpHandler: Send + Sync {
    async fn list_resources(&self, cursor: Option<String>) -> Result<ListResourcesResult>;

    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult>;

    async fn list_tools(&self, cursor: Option<String>) -> Result<ListToolsResult>;

    async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<ToolCallResult>;

    async fn list_prompts(&self, cursor: Option<String>) -> Result<ListPromptsResult>;

    async fn get_prompt(
        &self,
        name: &str,
        arguments: HashMap<String, String>,
    ) -> Result<GetPromptResult>;
}
