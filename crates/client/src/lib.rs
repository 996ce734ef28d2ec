//! # Tether client
//!
//! Client side of the Model Context Protocol: three transports (HTTP + SSE,
//! subprocess stdio and local sockets), request/response correlation with
//! per-request deadlines, and a registry of named server connections.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tether_client::{ClientRegistry, ClientResult};
//! use tether_core::bridge::NativeHostBridge;
//! use tether_core::{HttpAuth, McpServer, ServerConfig, TransportConfig};
//!
//! #[tokio::main]
//! async fn main() -> ClientResult<()> {
//!     let registry = ClientRegistry::new(Arc::new(NativeHostBridge::new()));
//!
//!     let mut server = McpServer::new(
//!         "docs",
//!         "Docs server",
//!         ServerConfig::new(TransportConfig::Http {
//!             url: "http://localhost:7421".to_string(),
//!             auth: HttpAuth::None,
//!         }),
//!     );
//!     registry.connect(&mut server).await?;
//!
//!     let tools = registry.list_tools(&server.id, None).await?;
//!     println!("{} exposes {} tools", server.name, tools.tools.len());
//!
//!     registry.disconnect(&server.id).await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod pending;
pub mod registry;
pub mod transport;

pub use config::{ClientOptions, RetryConfig};
pub use connection::Connection;
pub use error::{ClientError, ClientResult};
pub use registry::ClientRegistry;
pub use transport::{HttpTransport, LocalSocketTransport, StdioTransport, Transport};
