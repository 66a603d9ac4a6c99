//! Request decoding and validation.
//!
//! The body may arrive as a string, a byte buffer, or a lazy byte sequence;
//! by the time it reaches this module it has been fully drained into bytes.
//! Decoding is UTF-8 then JSON; the typed view keeps the raw JSON value
//! alongside so unknown fields survive the trip upstream.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use crate::protocols::chat::ChatCompletionRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestError {
    InvalidJson,
    InvalidMcpTools,
}

impl RequestError {
    pub fn into_response(self) -> Response {
        let message = match self {
            RequestError::InvalidJson => "Invalid JSON in request body",
            RequestError::InvalidMcpTools => "Invalid MCP tools",
        };
        (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": {
                    "message": message,
                    "type": "invalid_request_error",
                }
            })),
        )
            .into_response()
    }
}

#[derive(Debug)]
pub(crate) struct DecodedRequest {
    /// The body exactly as the caller sent it; cloned and mutated to build
    /// the per-round upstream payloads.
    pub raw: Value,
    pub request: ChatCompletionRequest,
}

pub(crate) fn decode_request(body: &[u8]) -> Result<DecodedRequest, RequestError> {
    let text = std::str::from_utf8(body).map_err(|_| RequestError::InvalidJson)?;
    let raw: Value = serde_json::from_str(text).map_err(|_| RequestError::InvalidJson)?;
    if !raw.is_object() {
        return Err(RequestError::InvalidJson);
    }

    validate_mcp_tools(&raw)?;

    let request: ChatCompletionRequest =
        serde_json::from_value(raw.clone()).map_err(|_| RequestError::InvalidJson)?;

    Ok(DecodedRequest { raw, request })
}

/// An MCP tool spec must carry a non-empty `server_url`, and its
/// `require_approval` must be absent, null, or exactly "never". Anything
/// else fails the whole request. Validation runs against the raw JSON so a
/// malformed spec cannot slip through as an unknown-variant passthrough.
fn validate_mcp_tools(raw: &Value) -> Result<(), RequestError> {
    let Some(tools) = raw.get("tools").and_then(Value::as_array) else {
        return Ok(());
    };

    for tool in tools {
        if tool.get("type").and_then(Value::as_str) != Some("mcp") {
            continue;
        }

        let server_url_ok = tool
            .get("server_url")
            .and_then(Value::as_str)
            .map(|url| !url.trim().is_empty())
            .unwrap_or(false);
        if !server_url_ok {
            return Err(RequestError::InvalidMcpTools);
        }

        match tool.get("require_approval") {
            None | Some(Value::Null) => {}
            Some(Value::String(mode)) if mode == "never" => {}
            Some(_) => return Err(RequestError::InvalidMcpTools),
        }
    }

    Ok(())
}
