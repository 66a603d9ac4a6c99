//! Multi-turn completion loop.
//!
//! Drives the LLM dialog as a sequence of rounds; one round is one upstream
//! streaming chat-completion call. Content deltas are forwarded to the
//! caller as they arrive, tool-call deltas are buffered, and when a round
//! finishes with `finish_reason: "tool_calls"` the buffered calls are
//! dispatched to their MCP servers sequentially in index order. Tool-level
//! failures are surfaced into the conversation so the model can react;
//! protocol-level failures abort the request.

use std::sync::Arc;

use axum::http::HeaderMap;
use futures_util::StreamExt;
use serde_json::{json, to_value, Value};
use tracing::{debug, info, warn};

use super::{
    emitter::{DeltaKind, ResponseSink},
    headers::apply_request_headers,
    streaming::{block_data, SseFramer},
    tool_calls::{FinalizedToolCall, ToolCallAccumulator},
};
use crate::{
    mcp::{
        error::McpError,
        registry::{RegisteredTool, ToolRegistry, SYNTHETIC_PREFIX},
        session::{server_host, McpSessionManager},
    },
    protocols::chat::{ChatCompletionChunk, ChatMessage, FunctionCall, ToolCall, Usage},
};

pub(crate) enum LoopError {
    /// The caller went away; abort quietly at the next suspension point.
    Disconnected,
    /// Upstream or payload-level failure that aborts the whole response.
    Upstream(String),
}

pub(crate) struct LoopContext<'a> {
    pub client: &'a reqwest::Client,
    pub upstream_url: &'a str,
    pub headers: &'a HeaderMap,
    pub sessions: &'a Arc<McpSessionManager>,
    pub registry: &'a ToolRegistry,
    pub max_rounds: usize,
}

#[derive(Default)]
struct RoundResult {
    /// finish_reason was "stop" or "length".
    finished: bool,
    calls: Vec<FinalizedToolCall>,
    usage: Option<Usage>,
    content: String,
}

/// Clone the base payload and point it at the current working conversation,
/// forcing streaming mode and usage reporting regardless of what the caller
/// asked for. A caller-supplied token bound is replaced with the remaining
/// budget.
fn build_round_payload(
    base: &Value,
    conversation: &[ChatMessage],
    remaining_budget: Option<u64>,
) -> Result<Value, String> {
    let mut payload = base.clone();
    let obj = payload
        .as_object_mut()
        .ok_or_else(|| "request body is not an object".to_string())?;

    let messages =
        to_value(conversation).map_err(|e| format!("failed to serialize messages: {}", e))?;
    obj.insert("messages".to_string(), messages);
    obj.insert("stream".to_string(), Value::Bool(true));
    obj.insert(
        "stream_options".to_string(),
        json!({"include_usage": true}),
    );

    if let Some(remaining) = remaining_budget {
        if obj.contains_key("max_completion_tokens") {
            obj.insert("max_completion_tokens".to_string(), json!(remaining));
        } else {
            obj.insert("max_tokens".to_string(), json!(remaining));
        }
    }

    Ok(payload)
}

/// Run the completion loop to its termination condition: a finished round,
/// a round without tool calls, an exhausted token budget, or the round
/// backstop.
pub(crate) async fn run_completion_loop(
    ctx: &LoopContext<'_>,
    base_payload: &Value,
    mut conversation: Vec<ChatMessage>,
    budget: Option<u64>,
    usage_totals: &mut Usage,
    sink: &mut ResponseSink,
) -> Result<(), LoopError> {
    let mut remaining = budget;
    let mut rounds = 0usize;

    loop {
        rounds += 1;
        let payload = build_round_payload(base_payload, &conversation, remaining)
            .map_err(LoopError::Upstream)?;

        let round = run_round(ctx, &payload, sink).await?;

        let tool_calls: Vec<ToolCall> = round
            .calls
            .iter()
            .map(|call| ToolCall {
                id: call.id.clone(),
                kind: "function".to_string(),
                function: FunctionCall {
                    name: call.name.clone(),
                    arguments: call.arguments.to_string(),
                },
            })
            .collect();

        conversation.push(ChatMessage::assistant(
            if round.content.is_empty() {
                None
            } else {
                Some(round.content.clone())
            },
            if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
        ));

        if let Some(usage) = &round.usage {
            usage_totals.absorb(usage);
            if let Some(rem) = remaining.as_mut() {
                *rem = rem.saturating_sub(usage.completion_tokens);
            }
        }

        if round.finished || round.calls.is_empty() {
            debug!("Completion loop done after {} round(s)", rounds);
            break;
        }
        if remaining == Some(0) {
            info!("Token budget exhausted after {} round(s)", rounds);
            break;
        }
        if rounds >= ctx.max_rounds {
            warn!("Reached round backstop ({}), stopping loop", ctx.max_rounds);
            break;
        }

        for call in &round.calls {
            dispatch_tool_call(ctx, call, &mut conversation, sink).await?;
        }
    }

    Ok(())
}

/// One upstream streaming call: forward content deltas, buffer tool-call
/// deltas, capture usage, and classify the finish reason.
async fn run_round(
    ctx: &LoopContext<'_>,
    payload: &Value,
    sink: &mut ResponseSink,
) -> Result<RoundResult, LoopError> {
    let mut request_builder = ctx
        .client
        .post(ctx.upstream_url)
        .header("Accept", "text/event-stream")
        .json(payload);
    request_builder = apply_request_headers(ctx.headers, request_builder);

    let response = request_builder.send().await.map_err(|e| {
        LoopError::Upstream(format!("upstream request to {} failed: {}", ctx.upstream_url, e))
    })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(LoopError::Upstream(format!(
            "upstream {} returned {}: {}",
            ctx.upstream_url, status, body
        )));
    }

    let mut upstream_stream = response.bytes_stream();
    let mut framer = SseFramer::new();
    let mut accumulator = ToolCallAccumulator::default();
    let mut round = RoundResult::default();

    'stream: while let Some(chunk_result) = upstream_stream.next().await {
        let bytes =
            chunk_result.map_err(|e| LoopError::Upstream(format!("upstream stream error: {}", e)))?;
        framer.push(&bytes);

        while let Some(block) = framer.next_block() {
            let Some(data) = block_data(&block) else {
                continue;
            };
            if data == "[DONE]" {
                continue;
            }

            let parsed: ChatCompletionChunk = match serde_json::from_str(&data) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("Skipping unparseable upstream chunk: {}", e);
                    continue;
                }
            };

            let chunk_finish = parsed
                .choices
                .first()
                .and_then(|c| c.finish_reason.as_deref());

            if let Some(usage) = &parsed.usage {
                round.usage = Some(usage.clone());
                // Usage rides on the terminal bookkeeping chunk unless the
                // round ended in tool calls; don't re-process it.
                if chunk_finish != Some("tool_calls") {
                    if matches!(chunk_finish, Some("stop") | Some("length")) {
                        round.finished = true;
                        break 'stream;
                    }
                    continue;
                }
            }

            let Some(choice) = parsed.choices.into_iter().next() else {
                continue;
            };

            if let Some(content) = &choice.delta.content {
                if !sink.send_delta(DeltaKind::Content, content) {
                    return Err(LoopError::Disconnected);
                }
                round.content.push_str(content);
            }
            if let Some(refusal) = &choice.delta.refusal {
                if !sink.send_delta(DeltaKind::Refusal, refusal) {
                    return Err(LoopError::Disconnected);
                }
            }
            // Reasoning reaches the caller but stays out of the
            // model-facing history.
            if let Some(reasoning) = &choice.delta.reasoning_content {
                if !sink.send_delta(DeltaKind::Reasoning, reasoning) {
                    return Err(LoopError::Disconnected);
                }
            }
            if let Some(tool_deltas) = &choice.delta.tool_calls {
                for delta in tool_deltas {
                    accumulator.fold(delta);
                }
            }

            match choice.finish_reason.as_deref() {
                Some("tool_calls") => {
                    round.calls = std::mem::take(&mut accumulator).finalize();
                    break 'stream;
                }
                Some("stop") | Some("length") => {
                    round.finished = true;
                    break 'stream;
                }
                _ => {}
            }
        }
    }

    Ok(round)
}

/// Execute one finalised tool call: announce it to the caller, invoke the
/// MCP server, then feed the formatted result (or error) both into the
/// working conversation and the caller-facing stream.
async fn dispatch_tool_call(
    ctx: &LoopContext<'_>,
    call: &FinalizedToolCall,
    conversation: &mut Vec<ChatMessage>,
    sink: &mut ResponseSink,
) -> Result<(), LoopError> {
    let registered = if call.name.starts_with(SYNTHETIC_PREFIX) {
        ctx.registry.resolve(&call.name)
    } else {
        None
    };

    let formatted = match registered {
        Some(tool) => {
            let invocation = render_tool_invocation(tool, &call.arguments);
            if !sink.send_delta(DeltaKind::Content, &invocation) {
                return Err(LoopError::Disconnected);
            }

            match ctx
                .sessions
                .call_tool(
                    &tool.server_url,
                    tool.authorization.as_deref(),
                    &tool.original_name,
                    call.arguments.clone(),
                )
                .await
            {
                Ok(payload) => render_tool_result(&payload),
                Err(e) => {
                    warn!("Tool call '{}' failed: {}", call.name, e);
                    format!("**Error**: {}\n\n", e)
                }
            }
        }
        None => {
            warn!("Model called unregistered tool '{}'", call.name);
            format!(
                "**Error**: {}\n\n",
                McpError::ToolNotFound(call.name.clone())
            )
        }
    };

    conversation.push(ChatMessage::tool(&call.id, formatted.trim_end()));
    if !sink.send_delta(DeltaKind::Content, &formatted) {
        return Err(LoopError::Disconnected);
    }
    Ok(())
}

// ============================================================================
// Tool block rendering
// ============================================================================

fn render_tool_invocation(tool: &RegisteredTool, arguments: &Value) -> String {
    let host = server_host(&tool.server_url);
    let pretty =
        serde_json::to_string_pretty(arguments).unwrap_or_else(|_| arguments.to_string());
    format!(
        "\n\n<details>\n<summary>Calling {} on {}</summary>\n\n```json\n{}\n```\n\n</details>\n\n",
        tool.original_name, host, pretty
    )
}

/// Format a JSON-RPC `tools/call` response for the conversation. A
/// well-formed result carries a non-empty `result.content` array of typed
/// blocks; anything else is shown as an error block with the raw response.
fn render_tool_result(payload: &Value) -> String {
    let blocks = payload
        .get("result")
        .and_then(|r| r.get("content"))
        .and_then(Value::as_array)
        .filter(|blocks| !blocks.is_empty());

    match blocks {
        Some(blocks) => {
            let rendered: Vec<String> = blocks.iter().map(render_content_block).collect();
            let body = rendered.join("\n\n");
            let token_estimate = body.chars().count() / 5;
            format!(
                "<details>\n<summary>Result (±{} tokens)</summary>\n\n{}\n\n</details>\n\n",
                token_estimate, body
            )
        }
        None => {
            let dump = serde_json::to_string_pretty(payload).unwrap_or_else(|_| payload.to_string());
            format!(
                "<details>\n<summary>**Error**: unexpected tool response</summary>\n\n```json\n{}\n```\n\n</details>\n\n",
                dump
            )
        }
    }
}

fn render_content_block(block: &Value) -> String {
    match block.get("type").and_then(Value::as_str) {
        Some("text") => {
            let text = block.get("text").and_then(Value::as_str).unwrap_or("");
            match serde_json::from_str::<Value>(text) {
                Ok(parsed) => format!(
                    "```json\n{}\n```",
                    serde_json::to_string_pretty(&parsed).unwrap_or_else(|_| text.to_string())
                ),
                Err(_) => format!("```markdown\n{}\n```", text),
            }
        }
        Some("image") => format!(
            "[Image: {}]",
            block.get("data").and_then(Value::as_str).unwrap_or("")
        ),
        _ => format!(
            "```json\n{}\n```",
            serde_json::to_string_pretty(block).unwrap_or_else(|_| block.to_string())
        ),
    }
}
