//! Model Context Protocol (MCP) client implementation.
//!
//! Speaks JSON-RPC over HTTP with the `2025-06-18` protocol surface:
//! `initialize`, `notifications/initialized`, `tools/list`, and `tools/call`,
//! with session tracking via the `Mcp-Session-Id` header.

pub mod error;
pub mod registry;
pub mod session;
pub mod types;

// Re-export types used outside this module
pub use error::{McpError, McpResult};
pub use registry::{prepare_request_tools, synthetic_tool_name, ToolRegistry};
pub use session::McpSessionManager;
pub use types::ToolRecord;
