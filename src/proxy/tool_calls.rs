//! Tool-call accumulation across streaming deltas.
//!
//! The upstream streams each tool call in fragments keyed by
//! `tool_calls[].index`: the id arrives once, the function name and the
//! argument string arrive in pieces. Calls are finalised when the round
//! reports `finish_reason: "tool_calls"`.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::warn;

use crate::protocols::chat::ToolCallDelta;

#[derive(Debug, Default)]
struct ToolCallInProgress {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// A tool call with fully-assembled, JSON-parsed arguments.
#[derive(Debug, Clone)]
pub(crate) struct FinalizedToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Default)]
pub(crate) struct ToolCallAccumulator {
    // BTreeMap keeps finalisation in upstream index order.
    calls: BTreeMap<u32, ToolCallInProgress>,
}

impl ToolCallAccumulator {
    /// Fold one streamed fragment into the call it belongs to.
    pub fn fold(&mut self, delta: &ToolCallDelta) {
        let call = self.calls.entry(delta.index).or_default();

        if call.id.is_none() {
            if let Some(id) = &delta.id {
                call.id = Some(id.clone());
            }
        }
        if let Some(function) = &delta.function {
            if let Some(name) = &function.name {
                call.name.push_str(name);
            }
            if let Some(arguments) = &function.arguments {
                call.arguments.push_str(arguments);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Finalise all buffered calls in index order. Calls need an id, a name,
    /// and non-empty arguments that parse as JSON; anything else is dropped
    /// without aborting the round.
    pub fn finalize(self) -> Vec<FinalizedToolCall> {
        let mut finalized = Vec::with_capacity(self.calls.len());

        for (index, call) in self.calls {
            let Some(id) = call.id else {
                warn!("Dropping tool call at index {}: no id received", index);
                continue;
            };
            if call.name.is_empty() || call.arguments.is_empty() {
                warn!(
                    "Dropping tool call '{}' (index {}): incomplete name or arguments",
                    call.name, index
                );
                continue;
            }
            let arguments = match serde_json::from_str::<Value>(&call.arguments) {
                Ok(value) => value,
                Err(e) => {
                    warn!(
                        "Dropping tool call '{}' (index {}): arguments are not valid JSON: {}",
                        call.name, index, e
                    );
                    continue;
                }
            };
            finalized.push(FinalizedToolCall {
                id,
                name: call.name,
                arguments,
            });
        }

        finalized
    }
}
