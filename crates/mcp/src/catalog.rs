// The default McpHandler: a tool registry, resource providers and prompts

use crate::handler::McpHandler;
use crate::prompts::PromptLibrary;
use crate::resources::ResourceProvider;
use crate::tools::{Tool, ToolRegistry};
use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tether_core::protocol::{
    GetPromptResult, ListPromptsResult, ListResourcesResult, ListToolsResult, ReadResourceResult,
    ToolCallResult,
};
use tracing::{debug, info};

const DEFAULT_PAGE_SIZE: usize = 100;

/// Everything this application serves over MCP.
pub struct Catalog {
    tools: ToolRegistry,
    resources: Vec<Arc<dyn ResourceProvider>>,
    prompts: PromptLibrary,
    page_size: usize,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            tools: ToolRegistry::new(),
            resources: Vec::new(),
            prompts: PromptLibrary::new(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.register(Arc::new(tool));
        self
    }

    pub fn with_resources(mut self, provider: impl ResourceProvider + 'static) -> Self {
        self.resources.push(Arc::new(provider));
        self
    }

    pub fn with_prompts(mut self, prompts: PromptLibrary) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn prompts(&self) -> &PromptLibrary {
        &self.prompts
    }
}

/// Slice one page out of `items`. Cursors are the decimal offset of the
/// next page's first item.
fn paginate<T>(items: Vec<T>, cursor: Option<String>, page_size: usize) -> Result<(Vec<T>, Option<String>)> {
    let start = match cursor {
        Some(cursor) => cursor
            .parse::<usize>()
            .with_context(|| format!("Invalid cursor: {}", cursor))?,
        None => 0,
    };
    if start > items.len() {
        bail!("Cursor {} is past the end of the list", start);
    }

    let end = (start + page_size).min(items.len());
    let next = (end < items.len()).then(|| end.to_string());
    let page = items.into_iter().skip(start).take(end - start).collect();
    Ok((page, next))
}

#[async_trait::async_trait]
impl McpHandler for Catalog {
    async fn list_resources(&self, cursor: Option<String>) -> Result<ListResourcesResult> {
        let mut all = Vec::new();
        for provider in &self.resources {
            all.extend(provider.list().await?);
        }
        let (resources, next_cursor) = paginate(all, cursor, self.page_size)?;
        Ok(ListResourcesResult {
            resources,
            next_cursor,
        })
    }

    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        let provider = self
            .resources
            .iter()
            .find(|p| p.handles(uri))
            .ok_or_else(|| anyhow!("No provider for resource: {}", uri))?;
        debug!(uri = %uri, "Reading resource");
        provider.read(uri).await
    }

    async fn list_tools(&self, cursor: Option<String>) -> Result<ListToolsResult> {
        let (tools, next_cursor) = paginate(self.tools.definitions(), cursor, self.page_size)?;
        Ok(ListToolsResult { tools, next_cursor })
    }

    async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<ToolCallResult> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| anyhow!("Unknown tool: {}", name))?;
        info!(tool = %name, "Calling tool");
        tool.execute(arguments.unwrap_or(Value::Null)).await
    }

    async fn list_prompts(&self, cursor: Option<String>) -> Result<ListPromptsResult> {
        let (prompts, next_cursor) = paginate(self.prompts.prompts(), cursor, self.page_size)?;
        Ok(ListPromptsResult {
            prompts,
            next_cursor,
        })
    }

    async fn get_prompt(
        &self,
        name: &str,
        arguments: HashMap<String, String>,
    ) -> Result<GetPromptResult> {
        self.prompts.get(name, &arguments)
    }
}
