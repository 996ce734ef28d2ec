// Core types for Tether: the MCP wire protocol, server descriptors,
// deployment settings and the host bridge the protocol engine runs on

pub mod bridge;
pub mod protocol;
pub mod settings;
pub mod types;

pub use types::*;
