// MCP server side for Tether: a capability-gated router in front of an
// McpHandler, an endpoint serving it to bridge peers, and the default
// Catalog handler with workspace tools, resources and prompts

pub mod catalog;
pub mod endpoint;
pub mod error;
pub mod handler;
pub mod prompts;
pub mod resources;
pub mod router;
pub mod tools;
pub mod workspace;

pub use catalog::Catalog;
pub use endpoint::McpEndpoint;
pub use error::{EndpointError, RouterError};
pub use handler::McpHandler;
pub use prompts::{PromptLibrary, PromptTemplate};
pub use resources::{ResourceProvider, WorkspaceResources};
pub use router::{Family, McpRouter};
pub use workspace::Workspace;
