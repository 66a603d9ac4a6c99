//! Streaming chat-completion proxy with MCP tool federation.
//!
//! A caller issues a single OpenAI-compatible chat-completion request; the
//! gateway discovers tools on the referenced MCP servers, advertises them to
//! the upstream LLM as plain function tools, and drives the multi-turn
//! tool-calling loop while re-streaming a merged response in the exact wire
//! shape the caller expects.

pub mod config;
pub mod mcp;
pub mod observability;
pub mod protocols;
pub mod proxy;
pub mod server;
pub mod url_context;

// Re-export types used at the crate surface
pub use config::{ClientInfo, GatewayConfig};
pub use mcp::McpSessionManager;
pub use server::AppState;
