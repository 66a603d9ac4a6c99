//! Response emission toward the caller.
//!
//! The pipeline always runs in streaming mode internally; the sink decides
//! what the caller actually sees. The streaming sink writes SSE chunks into
//! the response body channel as they are produced, the buffering sink
//! accumulates deltas and yields a single `chat.completion` object at the
//! end.

use std::io;

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::warn;

use crate::protocols::chat::{
    ChatChoice, ChatCompletionChunk, ChatCompletionResponse, ChatMessageDelta, ChatResponseMessage,
    ChatStreamChoice, Usage,
};

#[derive(Debug, Clone, Copy)]
pub(crate) enum DeltaKind {
    Content,
    Refusal,
    Reasoning,
}

enum SinkMode {
    Streaming {
        tx: mpsc::UnboundedSender<Result<Bytes, io::Error>>,
        include_usage: bool,
    },
    Buffering {
        content: String,
        reasoning_content: String,
    },
}

pub(crate) struct ResponseSink {
    id: String,
    created: u64,
    model: String,
    mode: SinkMode,
}

fn build_chunk(
    id: &str,
    created: u64,
    model: &str,
    delta: ChatMessageDelta,
    finish_reason: Option<String>,
    usage: Option<Usage>,
) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: id.to_string(),
        object: "chat.completion.chunk".to_string(),
        created,
        model: model.to_string(),
        choices: vec![ChatStreamChoice {
            index: 0,
            delta,
            finish_reason,
        }],
        usage,
    }
}

fn write_chunk(
    tx: &mpsc::UnboundedSender<Result<Bytes, io::Error>>,
    chunk: &ChatCompletionChunk,
) -> bool {
    let data = match serde_json::to_string(chunk) {
        Ok(data) => data,
        Err(e) => {
            warn!("Failed to serialize stream chunk: {}", e);
            return true;
        }
    };
    tx.send(Ok(Bytes::from(format!("data: {}\n\n", data))))
        .is_ok()
}

impl ResponseSink {
    pub fn streaming(
        model: impl Into<String>,
        include_usage: bool,
        tx: mpsc::UnboundedSender<Result<Bytes, io::Error>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: format!("chatcmpl-{}", now.timestamp_millis()),
            created: now.timestamp() as u64,
            model: model.into(),
            mode: SinkMode::Streaming { tx, include_usage },
        }
    }

    pub fn buffering(model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: format!("chatcmpl-{}", now.timestamp_millis()),
            created: now.timestamp() as u64,
            model: model.into(),
            mode: SinkMode::Buffering {
                content: String::new(),
                reasoning_content: String::new(),
            },
        }
    }

    /// Announce the assistant role; the first chunk of every stream.
    /// Returns false if the caller disconnected.
    pub fn send_role(&mut self) -> bool {
        match &self.mode {
            SinkMode::Streaming { tx, .. } => {
                let chunk = build_chunk(
                    &self.id,
                    self.created,
                    &self.model,
                    ChatMessageDelta {
                        role: Some("assistant".to_string()),
                        ..Default::default()
                    },
                    None,
                    None,
                );
                write_chunk(tx, &chunk)
            }
            SinkMode::Buffering { .. } => true,
        }
    }

    /// Forward one delta. Returns false if the caller disconnected.
    pub fn send_delta(&mut self, kind: DeltaKind, text: &str) -> bool {
        if text.is_empty() {
            return true;
        }
        match &mut self.mode {
            SinkMode::Streaming { tx, .. } => {
                let mut delta = ChatMessageDelta::default();
                match kind {
                    DeltaKind::Content => delta.content = Some(text.to_string()),
                    DeltaKind::Refusal => delta.refusal = Some(text.to_string()),
                    DeltaKind::Reasoning => delta.reasoning_content = Some(text.to_string()),
                }
                let chunk = build_chunk(&self.id, self.created, &self.model, delta, None, None);
                write_chunk(tx, &chunk)
            }
            SinkMode::Buffering {
                content,
                reasoning_content,
            } => {
                match kind {
                    DeltaKind::Content | DeltaKind::Refusal => content.push_str(text),
                    DeltaKind::Reasoning => reasoning_content.push_str(text),
                }
                true
            }
        }
    }

    /// Close the response. In streaming mode this emits the terminal chunk
    /// (with usage when the caller asked for it and tokens were counted) and
    /// the `[DONE]` sentinel; in buffering mode it yields the aggregated
    /// completion object.
    pub fn finish(self, usage: &Usage) -> Option<ChatCompletionResponse> {
        match self.mode {
            SinkMode::Streaming { tx, include_usage } => {
                let final_usage = if include_usage && usage.counted() {
                    Some(usage.clone())
                } else {
                    None
                };
                let chunk = build_chunk(
                    &self.id,
                    self.created,
                    &self.model,
                    ChatMessageDelta::default(),
                    Some("stop".to_string()),
                    final_usage,
                );
                if write_chunk(&tx, &chunk) {
                    let _ = tx.send(Ok(Bytes::from("data: [DONE]\n\n")));
                }
                None
            }
            SinkMode::Buffering {
                content,
                reasoning_content,
            } => Some(ChatCompletionResponse {
                id: self.id,
                object: "chat.completion".to_string(),
                created: self.created,
                model: self.model,
                choices: vec![ChatChoice {
                    index: 0,
                    message: ChatResponseMessage {
                        role: "assistant".to_string(),
                        content: if content.is_empty() {
                            None
                        } else {
                            Some(content)
                        },
                        reasoning_content: if reasoning_content.is_empty() {
                            None
                        } else {
                            Some(reasoning_content)
                        },
                    },
                    finish_reason: "stop".to_string(),
                }],
                usage: usage.clone(),
            }),
        }
    }

    /// Abort the response with a transport-level stream error.
    pub fn fail(self, message: String) {
        if let SinkMode::Streaming { tx, .. } = self.mode {
            let _ = tx.send(Err(io::Error::other(message)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<Result<Bytes, io::Error>>) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(item) = rx.try_recv() {
            frames.push(String::from_utf8(item.unwrap().to_vec()).unwrap());
        }
        frames
    }

    #[test]
    fn streaming_emits_role_content_and_done() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sink = ResponseSink::streaming("test-model", false, tx);

        assert!(sink.send_role());
        assert!(sink.send_delta(DeltaKind::Content, "he"));
        assert!(sink.send_delta(DeltaKind::Content, "llo"));
        assert!(sink.finish(&Usage::default()).is_none());

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 5);
        assert!(frames[0].contains("\"role\":\"assistant\""));
        assert!(frames[1].contains("\"content\":\"he\""));
        assert!(frames[2].contains("\"content\":\"llo\""));
        assert!(frames[3].contains("\"finish_reason\":\"stop\""));
        assert!(!frames[3].contains("\"usage\""));
        assert_eq!(frames[4], "data: [DONE]\n\n");
    }

    #[test]
    fn streaming_includes_usage_when_requested() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sink = ResponseSink::streaming("test-model", true, tx);
        assert!(sink.send_role());
        assert!(sink
            .finish(&Usage {
                prompt_tokens: 10,
                completion_tokens: 2,
                total_tokens: 12,
                additional_cost_cents: 0,
            })
            .is_none());

        let frames = drain(&mut rx);
        let terminal = &frames[frames.len() - 2];
        assert!(terminal.contains("\"prompt_tokens\":10"));
        assert!(terminal.contains("\"additional_cost_cents\":0"));
    }

    #[test]
    fn usage_is_omitted_when_nothing_was_counted() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sink = ResponseSink::streaming("test-model", true, tx);
        assert!(sink.send_role());
        assert!(sink.finish(&Usage::default()).is_none());

        let frames = drain(&mut rx);
        assert!(!frames[frames.len() - 2].contains("\"usage\""));
    }

    #[test]
    fn buffering_accumulates_into_single_response() {
        let mut sink = ResponseSink::buffering("test-model");
        assert!(sink.send_role());
        assert!(sink.send_delta(DeltaKind::Content, "hel"));
        assert!(sink.send_delta(DeltaKind::Content, "lo"));
        assert!(sink.send_delta(DeltaKind::Reasoning, "thinking"));

        let response = sink
            .finish(&Usage {
                prompt_tokens: 10,
                completion_tokens: 2,
                total_tokens: 12,
                additional_cost_cents: 0,
            })
            .unwrap();

        assert_eq!(response.object, "chat.completion");
        assert_eq!(
            response.choices[0].message.content.as_deref(),
            Some("hello")
        );
        assert_eq!(
            response.choices[0].message.reasoning_content.as_deref(),
            Some("thinking")
        );
        assert_eq!(response.choices[0].finish_reason, "stop");
        assert_eq!(response.usage.total_tokens, 12);
    }

    #[test]
    fn empty_buffered_content_becomes_null() {
        let sink = ResponseSink::buffering("test-model");
        let response = sink.finish(&Usage::default()).unwrap();
        assert!(response.choices[0].message.content.is_none());
    }

    #[test]
    fn send_after_disconnect_reports_false() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut sink = ResponseSink::streaming("test-model", false, tx);
        assert!(!sink.send_role());
    }
}
