use std::collections::HashMap;

use clap::Parser;
use mcp_completions_gateway::{
    config::{ClientInfo, ExtractServiceConfig, GatewayConfig},
    observability::{init_logging, LoggingConfig},
    server,
};
use tracing::Level;

#[derive(Parser, Debug)]
#[command(name = "mcp-gateway")]
#[command(about = "Streaming chat-completion proxy with MCP tool federation")]
#[command(long_about = r#"
Streaming chat-completion proxy with MCP tool federation

The gateway accepts OpenAI-compatible chat-completion requests, discovers
tools on the MCP servers referenced in the request, advertises them to the
upstream LLM as function tools, and drives the tool-calling loop on the
model's behalf while re-streaming a merged response.

Examples:
  # Front the OpenAI API
  mcp-gateway --upstream-url https://api.openai.com/v1/chat/completions

  # Local inference server, verbose logs
  mcp-gateway --upstream-url http://127.0.0.1:8000/v1/chat/completions \
    --log-level debug
"#)]
struct Cli {
    /// Host to bind the caller-facing server on
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the caller-facing server on
    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// Upstream OpenAI-compatible /chat/completions endpoint
    #[arg(long, default_value = "https://api.openai.com/v1/chat/completions")]
    upstream_url: String,

    /// Client name sent in the MCP initialize handshake
    #[arg(long, default_value = "MCPCompletions")]
    client_name: String,

    /// Client version sent in the MCP initialize handshake
    #[arg(long, default_value = "1.0.0")]
    client_version: String,

    /// Hostname rewrite for URL-context fetches, as old=new (repeatable)
    #[arg(long = "shadow-host", value_name = "OLD=NEW")]
    shadow_hosts: Vec<String>,

    /// Extract-service endpoint for URL-context content conversion
    #[arg(long)]
    extract_service_url: Option<String>,

    /// Bearer token for the extract service
    #[arg(long)]
    extract_service_token: Option<String>,

    /// Safety backstop on tool-calling rounds per request
    #[arg(long, default_value_t = 10)]
    max_rounds: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Directory for rotating log files (stdout only when unset)
    #[arg(long)]
    log_dir: Option<String>,

    /// Emit logs as JSON
    #[arg(long, default_value_t = false)]
    log_json: bool,
}

fn parse_shadow_hosts(pairs: &[String]) -> Result<HashMap<String, String>, String> {
    let mut map = HashMap::new();
    for pair in pairs {
        let Some((old, new)) = pair.split_once('=') else {
            return Err(format!("invalid --shadow-host '{}', expected OLD=NEW", pair));
        };
        map.insert(old.trim().to_string(), new.trim().to_string());
    }
    Ok(map)
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let cli = Cli::parse();

    let _log_guard = init_logging(LoggingConfig {
        level: parse_level(&cli.log_level),
        json_format: cli.log_json,
        log_dir: cli.log_dir.clone(),
        ..Default::default()
    });

    let extract_service = match (cli.extract_service_url, cli.extract_service_token) {
        (Some(url), Some(bearer_token)) => Some(ExtractServiceConfig { url, bearer_token }),
        (Some(_), None) | (None, Some(_)) => {
            return Err(
                "extract service needs both --extract-service-url and --extract-service-token"
                    .to_string(),
            );
        }
        (None, None) => None,
    };

    let config = GatewayConfig {
        host: cli.host,
        port: cli.port,
        upstream_url: cli.upstream_url,
        client_info: ClientInfo {
            name: cli.client_name,
            version: cli.client_version,
        },
        shadow_hosts: parse_shadow_hosts(&cli.shadow_hosts)?,
        extract_service,
        max_rounds: cli.max_rounds,
    };

    server::startup(config).await
}
