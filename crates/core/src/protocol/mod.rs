// Wire protocol: JSON-RPC 2.0 envelope plus the MCP method schemas

mod jsonrpc;
mod mcp;

pub use jsonrpc::*;
pub use mcp::*;
