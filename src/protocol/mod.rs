//! MCP Protocol types

mod messages;
mod types;

pub use messages::*;
pub use types::*;

/// MCP Protocol version
pub const PROTOCOL_VERSION: &str = "2024-11-05";
