//! MCP session management.
//!
//! Sessions are keyed by server URL and created lazily on first use. The
//! handshake is the three-step MCP flow (`initialize`, the `initialized`
//! notification, `tools/list`); the session id returned by the server in
//! `Mcp-Session-Id` rides along on every later request. A 404 on a tool
//! call means the server evicted the session: the cached entry is dropped
//! and the caller sees a retryable error.

use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

use dashmap::DashMap;
use reqwest::{
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    StatusCode,
};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::ClientInfo,
    mcp::{
        error::{McpError, McpResult},
        types::{
            rpc_error_message, JsonRpcRequest, ToolRecord, MCP_PROTOCOL_VERSION,
            PROTOCOL_VERSION_HEADER, SESSION_ID_HEADER,
        },
    },
};

#[derive(Debug, Clone)]
struct SessionState {
    session_id: Option<String>,
    tools: Vec<ToolRecord>,
}

/// Hostname of a server URL, for error messages and synthetic tool names.
pub fn server_host(server_url: &str) -> String {
    Url::parse(server_url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .unwrap_or_else(|| server_url.to_string())
}

pub struct McpSessionManager {
    http: reqwest::Client,
    client_info: ClientInfo,
    request_id: AtomicI64,
    // One slot per server; the Mutex keeps at most one handshake in flight.
    sessions: DashMap<String, Arc<tokio::sync::Mutex<Option<SessionState>>>>,
}

impl McpSessionManager {
    pub fn new(http: reqwest::Client, client_info: ClientInfo) -> Self {
        Self {
            http,
            client_info,
            request_id: AtomicI64::new(1),
            sessions: DashMap::new(),
        }
    }

    fn slot(&self, server_url: &str) -> Arc<tokio::sync::Mutex<Option<SessionState>>> {
        self.sessions
            .entry(server_url.to_string())
            .or_default()
            .clone()
    }

    fn next_id(&self) -> i64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Drop the cached session for a server; the next use re-initialises.
    pub fn invalidate(&self, server_url: &str) {
        self.sessions.remove(server_url);
    }

    /// Discovered tools for a server, initialising the session if needed.
    pub async fn tools(
        &self,
        server_url: &str,
        authorization: Option<&str>,
    ) -> McpResult<Vec<ToolRecord>> {
        let slot = self.slot(server_url);
        let mut guard = slot.lock().await;
        if guard.is_none() {
            *guard = Some(self.handshake(server_url, authorization).await?);
        }
        Ok(guard.as_ref().expect("session just ensured").tools.clone())
    }

    /// Invoke `tools/call` on a server, re-initialising the session first if
    /// it is not live. Returns the full JSON-RPC response payload.
    pub async fn call_tool(
        &self,
        server_url: &str,
        authorization: Option<&str>,
        tool_name: &str,
        arguments: Value,
    ) -> McpResult<Value> {
        let slot = self.slot(server_url);
        let session_id = {
            let mut guard = slot.lock().await;
            if guard.is_none() {
                *guard = Some(self.handshake(server_url, authorization).await?);
            }
            guard
                .as_ref()
                .expect("session just ensured")
                .session_id
                .clone()
        };

        let request = JsonRpcRequest::new(
            self.next_id(),
            "tools/call",
            json!({"name": tool_name, "arguments": arguments}),
        );

        debug!("Calling MCP tool '{}' on {}", tool_name, server_url);
        let response = self
            .post_rpc(server_url, authorization, session_id.as_deref(), &request)
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND && session_id.is_some() {
            // Server evicted the session; drop ours so the next call
            // re-initialises.
            warn!("MCP session expired on {}", server_url);
            self.invalidate(server_url);
            return Err(McpError::SessionExpired);
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(McpError::Auth(server_host(server_url)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let payload = Self::parse_rpc_response(response).await?;
        if let Some(message) = rpc_error_message(&payload) {
            return Err(McpError::Rpc(message));
        }
        Ok(payload)
    }

    /// Three-step MCP handshake: initialize, initialized notification,
    /// tools/list.
    async fn handshake(
        &self,
        server_url: &str,
        authorization: Option<&str>,
    ) -> McpResult<SessionState> {
        let init = JsonRpcRequest::new(
            self.next_id(),
            "initialize",
            json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {"roots": {"listChanged": true}, "sampling": {}},
                "clientInfo": &self.client_info,
            }),
        );

        let response = self.post_rpc(server_url, authorization, None, &init).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let session_id = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        let payload = Self::parse_rpc_response(response).await?;
        if let Some(message) = rpc_error_message(&payload) {
            return Err(McpError::Rpc(message));
        }

        // Notification failures are not fatal; some servers reply 202 or
        // nothing at all.
        let initialized = JsonRpcRequest::notification("notifications/initialized");
        if let Err(e) = self
            .post_rpc(
                server_url,
                authorization,
                session_id.as_deref(),
                &initialized,
            )
            .await
        {
            debug!("initialized notification to {} failed: {}", server_url, e);
        }

        let list = JsonRpcRequest::new(self.next_id(), "tools/list", Value::Null);
        let response = self
            .post_rpc(server_url, authorization, session_id.as_deref(), &list)
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let payload = Self::parse_rpc_response(response).await?;
        if let Some(message) = rpc_error_message(&payload) {
            return Err(McpError::Rpc(message));
        }

        let tools: Vec<ToolRecord> = payload
            .get("result")
            .and_then(|r| r.get("tools"))
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| McpError::InvalidResponse(format!("bad tools/list result: {}", e)))?
            .unwrap_or_default();

        info!(
            "Initialized MCP session with {} ({} tools, session_id: {})",
            server_url,
            tools.len(),
            session_id.as_deref().unwrap_or("none")
        );

        Ok(SessionState { session_id, tools })
    }

    async fn post_rpc(
        &self,
        server_url: &str,
        authorization: Option<&str>,
        session_id: Option<&str>,
        request: &JsonRpcRequest,
    ) -> McpResult<reqwest::Response> {
        let mut builder = self
            .http
            .post(server_url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json,text/event-stream")
            .header(PROTOCOL_VERSION_HEADER, MCP_PROTOCOL_VERSION)
            .json(request);

        if let Some(auth) = authorization {
            builder = builder.header(AUTHORIZATION, auth);
        }
        if let Some(sid) = session_id {
            builder = builder.header(SESSION_ID_HEADER, sid);
        }

        builder
            .send()
            .await
            .map_err(|e| McpError::Connect(e.to_string()))
    }

    /// MCP servers answer either `application/json` or `text/event-stream`;
    /// both forms carry a single JSON-RPC payload.
    async fn parse_rpc_response(response: reqwest::Response) -> McpResult<Value> {
        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("text/event-stream"))
            .unwrap_or(false);

        let body = response
            .text()
            .await
            .map_err(|e| McpError::Connect(e.to_string()))?;

        parse_rpc_body(is_event_stream, &body)
    }
}

fn parse_rpc_body(is_event_stream: bool, body: &str) -> McpResult<Value> {
    if is_event_stream {
        for line in body.lines() {
            // Comment lines keep SSE connections alive; skip them.
            if line.starts_with(':') {
                continue;
            }
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() || data == "[DONE]" {
                continue;
            }
            if let Ok(value) = serde_json::from_str::<Value>(data) {
                if value.get("jsonrpc").and_then(|v| v.as_str()) == Some("2.0") {
                    return Ok(value);
                }
            }
        }
        Err(McpError::InvalidResponse(
            "no JSON-RPC payload in event stream".to_string(),
        ))
    } else {
        if body.trim().is_empty() {
            return Err(McpError::InvalidResponse("empty response body".to_string()));
        }
        serde_json::from_str(body).map_err(|e| McpError::InvalidResponse(e.to_string()))
    }
}
