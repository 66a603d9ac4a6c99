// tests/common/mock_upstream.rs - Scripted OpenAI-compatible upstream for testing

use std::{
    collections::VecDeque,
    convert::Infallible,
    sync::{Arc, Mutex},
};

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Response, Sse,
    },
    routing::post,
    Json, Router,
};
use futures_util::stream;
use serde_json::{json, Value};
use uuid::Uuid;

/// One scripted upstream reply, consumed per request in order.
#[derive(Clone)]
pub enum UpstreamResponse {
    /// SSE chunks, emitted in order; `data: [DONE]` is appended.
    Sse(Vec<Value>),
    Error { status: u16, body: String },
}

#[derive(Clone, Default)]
struct UpstreamState {
    script: Arc<Mutex<VecDeque<UpstreamResponse>>>,
    requests: Arc<Mutex<Vec<Value>>>,
}

/// Mock LLM upstream that replays a scripted sequence of SSE responses and
/// records every payload it receives.
pub struct MockUpstream {
    addr: std::net::SocketAddr,
    state: UpstreamState,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl MockUpstream {
    pub async fn start(script: Vec<UpstreamResponse>) -> Self {
        let state = UpstreamState {
            script: Arc::new(Mutex::new(script.into())),
            requests: Arc::new(Mutex::new(Vec::new())),
        };

        let app = Router::new()
            .route("/v1/chat/completions", post(chat_completions_handler))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock upstream");
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .await
                .expect("mock upstream failed");
        });

        MockUpstream {
            addr,
            state,
            handle: Some(handle),
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}/v1/chat/completions", self.addr)
    }

    /// Payloads received so far, in order.
    pub fn requests(&self) -> Vec<Value> {
        self.state.requests.lock().unwrap().clone()
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn chat_completions_handler(
    State(state): State<UpstreamState>,
    Json(payload): Json<Value>,
) -> Response {
    state.requests.lock().unwrap().push(payload);

    let next = state.script.lock().unwrap().pop_front();
    match next {
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "mock upstream script exhausted",
        )
            .into_response(),
        Some(UpstreamResponse::Error { status, body }) => (
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            body,
        )
            .into_response(),
        Some(UpstreamResponse::Sse(chunks)) => {
            let mut events: Vec<Result<Event, Infallible>> = chunks
                .iter()
                .map(|chunk| Ok(Event::default().data(chunk.to_string())))
                .collect();
            events.push(Ok(Event::default().data("[DONE]")));

            Sse::new(stream::iter(events))
                .keep_alive(KeepAlive::default())
                .into_response()
        }
    }
}

// ============================================================================
// Chunk builders
// ============================================================================

fn chunk_envelope(choices: Value, usage: Option<(u64, u64, u64)>) -> Value {
    let mut chunk = json!({
        "id": format!("chatcmpl-{}", Uuid::new_v4()),
        "object": "chat.completion.chunk",
        "created": 0,
        "model": "mock-model",
        "choices": choices,
    });
    if let Some((prompt, completion, total)) = usage {
        chunk["usage"] = json!({
            "prompt_tokens": prompt,
            "completion_tokens": completion,
            "total_tokens": total,
        });
    }
    chunk
}

pub fn content_chunk(text: &str) -> Value {
    chunk_envelope(
        json!([{"index": 0, "delta": {"content": text}, "finish_reason": null}]),
        None,
    )
}

pub fn reasoning_chunk(text: &str) -> Value {
    chunk_envelope(
        json!([{"index": 0, "delta": {"reasoning_content": text}, "finish_reason": null}]),
        None,
    )
}

/// A single delta carrying a complete tool call.
pub fn tool_call_chunk(call_id: &str, name: &str, arguments: &str) -> Value {
    chunk_envelope(
        json!([{
            "index": 0,
            "delta": {
                "tool_calls": [{
                    "index": 0,
                    "id": call_id,
                    "type": "function",
                    "function": {"name": name, "arguments": arguments}
                }]
            },
            "finish_reason": null
        }]),
        None,
    )
}

/// A fragment of a tool call, for split-argument scenarios.
pub fn tool_call_fragment(
    index: u32,
    call_id: Option<&str>,
    name: Option<&str>,
    arguments: Option<&str>,
) -> Value {
    let mut call = json!({"index": index});
    if let Some(id) = call_id {
        call["id"] = json!(id);
        call["type"] = json!("function");
    }
    let mut function = json!({});
    if let Some(name) = name {
        function["name"] = json!(name);
    }
    if let Some(arguments) = arguments {
        function["arguments"] = json!(arguments);
    }
    call["function"] = function;

    chunk_envelope(
        json!([{"index": 0, "delta": {"tool_calls": [call]}, "finish_reason": null}]),
        None,
    )
}

pub fn finish_chunk(reason: &str, usage: Option<(u64, u64, u64)>) -> Value {
    chunk_envelope(
        json!([{"index": 0, "delta": {}, "finish_reason": reason}]),
        usage,
    )
}
