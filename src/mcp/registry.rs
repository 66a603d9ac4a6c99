//! Synthetic tool naming and the request-scoped tool registry.
//!
//! Remote MCP tools are advertised to the upstream LLM as plain function
//! tools under deterministic synthetic names; the registry resolves those
//! names back to `(server_url, original_name, authorization)` at call time.
//! The registry is populated once before the first upstream call and never
//! changes for the lifetime of the request.

use std::collections::HashMap;

use serde_json::{json, to_value, Value};
use tracing::warn;

use crate::{
    mcp::session::{server_host, McpSessionManager},
    protocols::chat::{KnownToolSpec, ToolSpec, UrlContextSpec},
};

pub const SYNTHETIC_PREFIX: &str = "mcp_tool_";

/// `mcp_tool_<dashed-hostname>_<original-name>`, with every `.` in the
/// hostname replaced by `-`.
pub fn synthetic_tool_name(hostname: &str, original_name: &str) -> String {
    format!(
        "{}{}_{}",
        SYNTHETIC_PREFIX,
        hostname.replace('.', "-"),
        original_name
    )
}

#[derive(Debug, Clone)]
pub struct RegisteredTool {
    pub server_url: String,
    pub original_name: String,
    pub authorization: Option<String>,
}

#[derive(Debug, Default)]
pub struct ToolRegistry {
    entries: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn resolve(&self, synthetic_name: &str) -> Option<&RegisteredTool> {
        self.entries.get(synthetic_name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn insert(&mut self, synthetic_name: String, tool: RegisteredTool) -> bool {
        if self.entries.contains_key(&synthetic_name) {
            return false;
        }
        self.entries.insert(synthetic_name, tool);
        true
    }
}

/// Result of transforming the caller's heterogeneous `tools` array.
pub struct PreparedTools {
    pub registry: ToolRegistry,
    /// Function tools for the upstream payload; `None` when nothing remains
    /// after the transformation.
    pub tools: Option<Vec<Value>>,
    /// Configuration stripped from the first `url_context` tool, if any.
    pub url_context: Option<UrlContextSpec>,
}

/// Build the upstream-facing tools array and the reverse name map.
///
/// MCP initialisation failures are tolerated per server: the failure is
/// logged, that server contributes no tools, and the request continues.
pub async fn prepare_request_tools(
    sessions: &McpSessionManager,
    specs: &[ToolSpec],
) -> PreparedTools {
    let mut registry = ToolRegistry::default();
    let mut tools: Vec<Value> = Vec::new();
    let mut url_context: Option<UrlContextSpec> = None;

    for spec in specs {
        match spec {
            ToolSpec::Known(KnownToolSpec::Function { .. }) => match to_value(spec) {
                Ok(value) => tools.push(value),
                Err(e) => warn!("Failed to serialize function tool: {}", e),
            },
            ToolSpec::Known(KnownToolSpec::UrlContext(config)) => {
                // Consumed by the URL-context pre-processor; never forwarded.
                if url_context.is_none() {
                    url_context = Some(config.clone());
                }
            }
            ToolSpec::Known(KnownToolSpec::Mcp(mcp)) => {
                let host = server_host(&mcp.server_url);
                let discovered = match sessions
                    .tools(&mcp.server_url, mcp.authorization.as_deref())
                    .await
                {
                    Ok(discovered) => discovered,
                    Err(e) => {
                        warn!("Skipping MCP server {}: {}", host, e);
                        continue;
                    }
                };

                for tool in discovered {
                    if !mcp.allows(&tool.name) {
                        continue;
                    }

                    let synthetic_name = synthetic_tool_name(&host, &tool.name);
                    let registered = registry.insert(
                        synthetic_name.clone(),
                        RegisteredTool {
                            server_url: mcp.server_url.clone(),
                            original_name: tool.name.clone(),
                            authorization: mcp.authorization.clone(),
                        },
                    );
                    if !registered {
                        warn!(
                            "Duplicate synthetic tool name '{}', keeping the first registration",
                            synthetic_name
                        );
                        continue;
                    }

                    let description = format!(
                        "{} (via MCP server: {})",
                        tool.description.as_deref().unwrap_or(&tool.name),
                        host
                    );
                    tools.push(json!({
                        "type": "function",
                        "function": {
                            "name": synthetic_name,
                            "description": description,
                            "parameters": tool.input_schema.unwrap_or_else(|| json!({})),
                        }
                    }));
                }
            }
            // Unknown variants are forwarded unchanged.
            ToolSpec::Other(value) => tools.push(value.clone()),
        }
    }

    PreparedTools {
        registry,
        tools: if tools.is_empty() { None } else { Some(tools) },
        url_context,
    }
}
