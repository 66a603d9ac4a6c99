//! Caller-facing HTTP server.
//!
//! One POST route accepts chat-completion bodies on any path; the response
//! is either a merged SSE stream or a single JSON object depending on the
//! caller's `stream` flag. Malformed bodies and invalid MCP tool specs are
//! rejected with 400 envelopes before any upstream work happens.

use std::{sync::Arc, time::Duration};

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header::CONTENT_TYPE, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::{signal, sync::mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{error, info};

use crate::{
    config::GatewayConfig,
    mcp::{
        registry::{prepare_request_tools, PreparedTools},
        McpSessionManager,
    },
    protocols::chat::{ChatMessage, Usage},
    proxy::{
        emitter::ResponseSink,
        request::{decode_request, DecodedRequest},
        tool_loop::{run_completion_loop, LoopContext, LoopError},
    },
    url_context::{HttpUrlContextProvider, UrlContextProvider},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub client: reqwest::Client,
    pub sessions: Arc<McpSessionManager>,
    pub url_context: Arc<dyn UrlContextProvider>,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build HTTP client");

        let sessions = Arc::new(McpSessionManager::new(
            client.clone(),
            config.client_info.clone(),
        ));
        let url_context = Arc::new(HttpUrlContextProvider::new(
            client.clone(),
            config.shadow_hosts.clone(),
            config.extract_service.clone(),
        ));

        Self {
            config: Arc::new(config),
            client,
            sessions,
            url_context,
        }
    }
}

fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": {
                "message": "Internal server error",
                "type": "internal_error",
            }
        })),
    )
        .into_response()
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/", post(chat_completions))
        .route("/{*path}", post(chat_completions))
        .with_state(state)
}

async fn health() -> Response {
    (StatusCode::OK, Json(json!({"status": "ok"}))).into_response()
}

async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let decoded = match decode_request(&body) {
        Ok(decoded) => decoded,
        Err(e) => return e.into_response(),
    };
    handle_completion(state, headers, decoded).await
}

async fn handle_completion(
    state: AppState,
    headers: HeaderMap,
    decoded: DecodedRequest,
) -> Response {
    let DecodedRequest { raw, request } = decoded;

    // Populate the synthetic-name map before the first upstream call; it is
    // immutable for the rest of the request.
    let specs = request.tools.clone().unwrap_or_default();
    let PreparedTools {
        registry,
        tools,
        url_context,
    } = prepare_request_tools(&state.sessions, &specs).await;

    let mut base_payload: Value = raw;
    if let Some(obj) = base_payload.as_object_mut() {
        match &tools {
            Some(tools) => {
                obj.insert("tools".to_string(), Value::Array(tools.clone()));
            }
            None => {
                obj.remove("tools");
            }
        }
    }

    let mut conversation = request.messages.clone();
    let mut usage = Usage::default();

    if let Some(options) = &url_context {
        let outcome = state.url_context.gather(&conversation, options).await;
        usage.additional_cost_cents += outcome.additional_cost_cents;
        if let Some(context) = outcome.context {
            conversation.insert(0, ChatMessage::system(context));
        }
    }

    let model = request.model.clone();
    let budget = request.token_budget();
    let max_rounds = state.config.max_rounds;

    if request.is_streaming() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sink = ResponseSink::streaming(model, request.include_usage(), tx);

        tokio::spawn(async move {
            let ctx = LoopContext {
                client: &state.client,
                upstream_url: &state.config.upstream_url,
                headers: &headers,
                sessions: &state.sessions,
                registry: &registry,
                max_rounds,
            };

            if !sink.send_role() {
                return;
            }
            match run_completion_loop(&ctx, &base_payload, conversation, budget, &mut usage, &mut sink)
                .await
            {
                Ok(()) => {
                    let _ = sink.finish(&usage);
                }
                Err(LoopError::Disconnected) => {}
                Err(LoopError::Upstream(message)) => {
                    error!("Completion loop failed: {}", message);
                    sink.fail(message);
                }
            }
        });

        let mut response = Response::new(Body::from_stream(UnboundedReceiverStream::new(rx)));
        *response.status_mut() = StatusCode::OK;
        let response_headers = response.headers_mut();
        response_headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        response_headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
        response_headers.insert("Connection", HeaderValue::from_static("keep-alive"));
        response
    } else {
        let ctx = LoopContext {
            client: &state.client,
            upstream_url: &state.config.upstream_url,
            headers: &headers,
            sessions: &state.sessions,
            registry: &registry,
            max_rounds,
        };

        let mut sink = ResponseSink::buffering(model);
        let _ = sink.send_role();
        match run_completion_loop(&ctx, &base_payload, conversation, budget, &mut usage, &mut sink)
            .await
        {
            Ok(()) => match sink.finish(&usage) {
                Some(response) => (StatusCode::OK, Json(response)).into_response(),
                None => internal_error(),
            },
            Err(LoopError::Disconnected) => internal_error(),
            Err(LoopError::Upstream(message)) => {
                error!("Completion loop failed: {}", message);
                internal_error()
            }
        }
    }
}

/// Bind and serve until ctrl-c.
pub async fn startup(config: GatewayConfig) -> Result<(), String> {
    config.validate().map_err(|e| e.to_string())?;

    let bind_addr = format!("{}:{}", config.host, config.port);
    let state = AppState::new(config);
    let router = app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| format!("failed to bind {}: {}", bind_addr, e))?;

    info!("mcp-completions-gateway listening on {}", bind_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .map_err(|e| format!("server error: {}", e))
}
