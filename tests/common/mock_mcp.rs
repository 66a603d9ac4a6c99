// tests/common/mock_mcp.rs - Scriptable MCP JSON-RPC server for testing

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};

#[derive(Clone)]
pub struct MockMcpConfig {
    /// Tool records returned from tools/list, in wire (camelCase) form.
    pub tools: Vec<Value>,
    /// Expected Authorization header; anything else is rejected with 401.
    pub required_auth: Option<String>,
    /// First tools/call answers 404 to simulate server-side session expiry.
    pub expire_first_call: bool,
    /// Answer JSON-RPC payloads in the text/event-stream form.
    pub sse_responses: bool,
    /// tools/list returns a JSON-RPC error, making initialization fail.
    pub fail_tools_list: bool,
    /// Result returned from tools/call.
    pub call_result: Value,
}

impl Default for MockMcpConfig {
    fn default() -> Self {
        Self {
            tools: vec![search_tool()],
            required_auth: None,
            expire_first_call: false,
            sse_responses: false,
            fail_tools_list: false,
            call_result: json!({"content": [{"type": "text", "text": "found"}]}),
        }
    }
}

pub fn search_tool() -> Value {
    json!({
        "name": "search",
        "description": "Web search",
        "inputSchema": {"type": "object", "properties": {"q": {"type": "string"}}}
    })
}

pub fn named_tool(name: &str) -> Value {
    json!({"name": name, "inputSchema": {"type": "object"}})
}

#[derive(Clone)]
struct MockMcpState {
    config: MockMcpConfig,
    session_counter: Arc<AtomicUsize>,
    init_count: Arc<AtomicUsize>,
    expirations_served: Arc<AtomicUsize>,
    calls: Arc<Mutex<Vec<Value>>>,
}

/// Mock MCP server speaking JSON-RPC over HTTP with Mcp-Session-Id
/// issuance.
pub struct MockMcpServer {
    addr: std::net::SocketAddr,
    state: MockMcpState,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl MockMcpServer {
    pub async fn start(config: MockMcpConfig) -> Self {
        let state = MockMcpState {
            config,
            session_counter: Arc::new(AtomicUsize::new(0)),
            init_count: Arc::new(AtomicUsize::new(0)),
            expirations_served: Arc::new(AtomicUsize::new(0)),
            calls: Arc::new(Mutex::new(Vec::new())),
        };

        let app = Router::new()
            .route("/mcp", post(rpc_handler))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock MCP server");
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("mock MCP failed");
        });

        MockMcpServer {
            addr,
            state,
            handle: Some(handle),
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}/mcp", self.addr)
    }

    /// Hostname as it appears in synthetic tool names.
    pub fn dashed_host(&self) -> String {
        "127-0-0-1".to_string()
    }

    pub fn init_count(&self) -> usize {
        self.state.init_count.load(Ordering::SeqCst)
    }

    /// Recorded tools/call requests: `{"session": .., "name": .., "arguments": ..}`.
    pub fn calls(&self) -> Vec<Value> {
        self.state.calls.lock().unwrap().clone()
    }
}

impl Drop for MockMcpServer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

fn rpc_response(state: &MockMcpState, payload: Value, session_id: Option<String>) -> Response {
    let mut response = if state.config.sse_responses {
        (
            [(CONTENT_TYPE, "text/event-stream")],
            format!("event: message\ndata: {}\n\n", payload),
        )
            .into_response()
    } else {
        Json(payload).into_response()
    };
    if let Some(session_id) = session_id {
        response
            .headers_mut()
            .insert("Mcp-Session-Id", session_id.parse().unwrap());
    }
    response
}

async fn rpc_handler(
    State(state): State<MockMcpState>,
    headers: HeaderMap,
    Json(request): Json<Value>,
) -> Response {
    if let Some(required) = &state.config.required_auth {
        let presented = headers.get("authorization").and_then(|v| v.to_str().ok());
        if presented != Some(required.as_str()) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let method = request.get("method").and_then(Value::as_str).unwrap_or("");
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let session = headers
        .get("Mcp-Session-Id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    match method {
        "initialize" => {
            state.init_count.fetch_add(1, Ordering::SeqCst);
            let session_id = format!(
                "sess-{}",
                state.session_counter.fetch_add(1, Ordering::SeqCst) + 1
            );
            rpc_response(
                &state,
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "protocolVersion": "2025-06-18",
                        "capabilities": {"tools": {}},
                        "serverInfo": {"name": "mock-mcp", "version": "0.1.0"}
                    }
                }),
                Some(session_id),
            )
        }
        "notifications/initialized" => StatusCode::ACCEPTED.into_response(),
        "tools/list" => {
            if state.config.fail_tools_list {
                return rpc_response(
                    &state,
                    json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {"code": -32603, "message": "listing unavailable"}
                    }),
                    None,
                );
            }
            rpc_response(
                &state,
                json!({"jsonrpc": "2.0", "id": id, "result": {"tools": state.config.tools}}),
                None,
            )
        }
        "tools/call" => {
            if state.config.expire_first_call
                && state.expirations_served.fetch_add(1, Ordering::SeqCst) == 0
            {
                return StatusCode::NOT_FOUND.into_response();
            }
            let params = request.get("params").cloned().unwrap_or(Value::Null);
            state.calls.lock().unwrap().push(json!({
                "session": session,
                "name": params.get("name").cloned().unwrap_or(Value::Null),
                "arguments": params.get("arguments").cloned().unwrap_or(Value::Null),
            }));
            rpc_response(
                &state,
                json!({"jsonrpc": "2.0", "id": id, "result": state.config.call_result}),
                None,
            )
        }
        _ => rpc_response(
            &state,
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32601, "message": format!("unknown method: {}", method)}
            }),
            None,
        ),
    }
}
