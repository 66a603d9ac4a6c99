//! Gateway configuration.

use std::collections::HashMap;

use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Invalid value for field '{field}': {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Client identity sent in the MCP `initialize` handshake.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: "MCPCompletions".to_string(),
            version: "1.0.0".to_string(),
        }
    }
}

/// External content-extraction service used by the URL-context
/// pre-processor for HTML/PDF pages.
#[derive(Debug, Clone)]
pub struct ExtractServiceConfig {
    pub url: String,
    pub bearer_token: String,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Bind address for the caller-facing server.
    pub host: String,
    pub port: u16,
    /// Upstream OpenAI-compatible `/chat/completions` endpoint.
    pub upstream_url: String,
    pub client_info: ClientInfo,
    /// Hostname rewrites applied before URL-context fetches (old -> new).
    pub shadow_hosts: HashMap<String, String>,
    pub extract_service: Option<ExtractServiceConfig>,
    /// Safety backstop on tool-calling rounds per request.
    pub max_rounds: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            upstream_url: "https://api.openai.com/v1/chat/completions".to_string(),
            client_info: ClientInfo::default(),
            shadow_hosts: HashMap::new(),
            extract_service: None,
            max_rounds: 10,
        }
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        let upstream = Url::parse(&self.upstream_url).map_err(|e| ConfigError::InvalidValue {
            field: "upstream_url".to_string(),
            value: self.upstream_url.clone(),
            reason: e.to_string(),
        })?;
        if upstream.host_str().is_none() {
            return Err(ConfigError::InvalidValue {
                field: "upstream_url".to_string(),
                value: self.upstream_url.clone(),
                reason: "missing host".to_string(),
            });
        }

        if let Some(extract) = &self.extract_service {
            Url::parse(&extract.url).map_err(|e| ConfigError::InvalidValue {
                field: "extract_service.url".to_string(),
                value: extract.url.clone(),
                reason: e.to_string(),
            })?;
        }

        if self.max_rounds == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "max_rounds must be at least 1".to_string(),
            });
        }

        if self.client_info.name.is_empty() {
            return Err(ConfigError::ValidationFailed {
                reason: "client_info.name must not be empty".to_string(),
            });
        }

        Ok(())
    }
}
