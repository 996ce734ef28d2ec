use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod api;
mod config;

use config::AppConfig;
use tether_client::ClientRegistry;
use tether_core::bridge::{HostBridge, NativeHostBridge};
use tether_mcp::tools::{ExecuteCommandTool, ListFilesTool, ReadFileTool, WriteFileTool};
use tether_mcp::{Catalog, McpEndpoint, PromptLibrary, Workspace, WorkspaceResources};

#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(about = "Model Context Protocol server and client", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "TETHER_CONFIG", default_value = "tether.toml")]
    config: PathBuf,

    /// Address for the HTTP surface (overrides [http] bind)
    #[arg(long, env = "TETHER_BIND")]
    bind: Option<String>,

    /// Workspace directory (overrides [workspace] root)
    #[arg(short, long)]
    workspace: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether=info,tower_http=debug".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();

    let mut config = AppConfig::load(&args.config)?;
    if let Some(bind) = args.bind {
        config.http.bind = bind;
    }
    if let Some(workspace) = args.workspace {
        config.workspace.root = workspace;
    }

    tracing::info!("Starting Tether {}", env!("CARGO_PKG_VERSION"));

    let bridge: Arc<dyn HostBridge> = Arc::new(NativeHostBridge::new());
    let registry = Arc::new(ClientRegistry::new(bridge.clone()));
    let upstream = tokio::spawn(connect_upstream(registry.clone(), config.upstream.clone()));

    let endpoint = McpEndpoint::new(bridge);
    if config.server.enabled {
        let catalog = build_catalog(&config)?;
        tracing::info!(
            "Serving {} tools and {} prompts from {}",
            catalog.tools().len(),
            catalog.prompts().len(),
            config.workspace.root.display()
        );

        let router = endpoint.start(&config.server, Arc::new(catalog)).await?;
        let state = api::AppState {
            router,
            notifications: endpoint.notification_sender(),
        };
        api::serve(&config.http.bind, state, shutdown_signal()).await?;
    } else {
        tracing::info!("MCP server disabled; only upstream connections are active");
        shutdown_signal().await;
    }

    tracing::info!("Shutting down");
    upstream.abort();
    for server in registry.disconnect_all().await {
        tracing::info!(server_id = %server.id, "Disconnected upstream server");
    }
    endpoint.stop().await?;

    Ok(())
}

/// Assemble the catalog the MCP endpoint serves from configuration.
fn build_catalog(config: &AppConfig) -> Result<Catalog> {
    let workspace = Workspace::open(&config.workspace.root).with_context(|| {
        format!(
            "Failed to open workspace {}",
            config.workspace.root.display()
        )
    })?;

    let mut command = ExecuteCommandTool::new(workspace.clone())
        .with_timeout(Duration::from_secs(config.workspace.command_timeout_secs));
    if let Some(allowed) = &config.workspace.allowed_commands {
        command = command.with_allowed(allowed.iter().cloned());
    }

    let prompts: PromptLibrary = config.prompts.iter().cloned().collect();

    Ok(Catalog::new()
        .with_tool(ReadFileTool::new(workspace.clone()))
        .with_tool(WriteFileTool::new(workspace.clone()))
        .with_tool(ListFilesTool::new(workspace.clone()))
        .with_tool(command)
        .with_resources(WorkspaceResources::new(workspace))
        .with_prompts(prompts))
}

/// Connect every configured upstream server. Failures are logged and leave
/// the server out of the registry.
async fn connect_upstream(registry: Arc<ClientRegistry>, servers: Vec<tether_core::McpServer>) {
    for mut server in servers {
        match registry.connect_with_retry(&mut server).await {
            Ok(init) => tracing::info!(
                server_id = %server.id,
                peer = %init.server_info.name,
                capabilities = ?server.capabilities,
                "Connected upstream server"
            ),
            Err(e) => tracing::error!(
                server_id = %server.id,
                status = %server.status,
                error = %e,
                "Failed to connect upstream server"
            ),
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
    }
}
