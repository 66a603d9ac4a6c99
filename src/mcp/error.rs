//! MCP error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum McpError {
    #[error("failed to reach MCP server: {0}")]
    Connect(String),

    #[error("MCP server returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("MCP server error: {0}")]
    Rpc(String),

    #[error("Authentication failed for MCP server {0}")]
    Auth(String),

    #[error("Session expired, please retry the request")]
    SessionExpired,

    #[error("invalid MCP response: {0}")]
    InvalidResponse(String),

    #[error("No tool named '{0}' is available")]
    ToolNotFound(String),
}

pub type McpResult<T> = Result<T, McpError>;
