//! URL-context pre-processing.
//!
//! Extracts URLs from user messages, fetches their content, and returns a
//! formatted system-message body that the pipeline prepends to the working
//! conversation. Hostnames can be rewritten via shadow-host mappings, and
//! an external extract service can be used for content that needs
//! conversion (HTML, PDF). Fetch costs are credited back to the request's
//! usage counter in cents.

use std::{collections::HashMap, sync::OnceLock};

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};
use url::Url;

use crate::{
    config::ExtractServiceConfig,
    protocols::chat::{ChatMessage, UrlContextSpec},
};

pub const DEFAULT_MAX_URLS: usize = 3;
pub const DEFAULT_MAX_CONTEXT_LENGTH: usize = 20_000;

/// Cost billed per extract-service call; direct fetches are free.
const EXTRACT_COST_CENTS: u64 = 1;

#[derive(Debug, Clone, Default)]
pub struct UrlContextOutcome {
    /// Formatted system-message body, absent when nothing was fetched.
    pub context: Option<String>,
    pub additional_cost_cents: u64,
}

#[async_trait]
pub trait UrlContextProvider: Send + Sync {
    async fn gather(&self, messages: &[ChatMessage], options: &UrlContextSpec)
        -> UrlContextOutcome;
}

/// Pull http(s) URLs out of free-form message text, in order of appearance,
/// deduplicated.
pub fn extract_urls(text: &str) -> Vec<String> {
    static URL_PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = URL_PATTERN
        .get_or_init(|| Regex::new(r#"https?://[^\s<>"')\]]+"#).expect("valid URL regex"));

    let mut urls = Vec::new();
    for m in pattern.find_iter(text) {
        // Trailing sentence punctuation is almost never part of the URL.
        let url = m.as_str().trim_end_matches(['.', ',', ';', ':', '!', '?']);
        if !url.is_empty() && !urls.iter().any(|u| u == url) {
            urls.push(url.to_string());
        }
    }
    urls
}

pub struct HttpUrlContextProvider {
    http: reqwest::Client,
    shadow_hosts: HashMap<String, String>,
    extract_service: Option<ExtractServiceConfig>,
}

impl HttpUrlContextProvider {
    pub fn new(
        http: reqwest::Client,
        shadow_hosts: HashMap<String, String>,
        extract_service: Option<ExtractServiceConfig>,
    ) -> Self {
        Self {
            http,
            shadow_hosts,
            extract_service,
        }
    }

    fn rewrite_host(&self, url: &str) -> String {
        let Ok(mut parsed) = Url::parse(url) else {
            return url.to_string();
        };
        let Some(host) = parsed.host_str() else {
            return url.to_string();
        };
        if let Some(replacement) = self.shadow_hosts.get(host) {
            if parsed.set_host(Some(replacement.as_str())).is_err() {
                warn!("Shadow host '{}' is not a valid hostname", replacement);
                return url.to_string();
            }
        }
        parsed.to_string()
    }

    /// Fetch one URL, via the extract service when configured. Returns the
    /// content and the cost in cents.
    async fn fetch(&self, url: &str) -> Option<(String, u64)> {
        if let Some(extract) = &self.extract_service {
            let response = self
                .http
                .post(&extract.url)
                .bearer_auth(&extract.bearer_token)
                .json(&serde_json::json!({"url": url}))
                .send()
                .await;
            match response {
                Ok(response) if response.status().is_success() => {
                    return response.text().await.ok().map(|t| (t, EXTRACT_COST_CENTS));
                }
                Ok(response) => {
                    warn!(
                        "Extract service returned {} for {}, falling back to direct fetch",
                        response.status(),
                        url
                    );
                }
                Err(e) => {
                    warn!("Extract service unreachable: {}", e);
                }
            }
        }

        match self.http.get(url).send().await {
            Ok(response) if response.status().is_success() => {
                response.text().await.ok().map(|t| (t, 0))
            }
            Ok(response) => {
                warn!("Fetch of {} returned {}", url, response.status());
                None
            }
            Err(e) => {
                warn!("Fetch of {} failed: {}", url, e);
                None
            }
        }
    }
}

#[async_trait]
impl UrlContextProvider for HttpUrlContextProvider {
    async fn gather(
        &self,
        messages: &[ChatMessage],
        options: &UrlContextSpec,
    ) -> UrlContextOutcome {
        let max_urls = options.max_urls.unwrap_or(DEFAULT_MAX_URLS);
        let max_context_length = options
            .max_context_length
            .unwrap_or(DEFAULT_MAX_CONTEXT_LENGTH);

        let mut urls = Vec::new();
        for message in messages.iter().filter(|m| m.role == "user") {
            if let Some(text) = message.plain_text() {
                for url in extract_urls(&text) {
                    if !urls.contains(&url) {
                        urls.push(url);
                    }
                }
            }
        }
        urls.truncate(max_urls);

        if urls.is_empty() {
            return UrlContextOutcome::default();
        }

        let mut sections = Vec::new();
        let mut additional_cost_cents = 0;

        for url in &urls {
            let target = self.rewrite_host(url);
            debug!("Fetching URL context from {}", target);
            let Some((content, cost)) = self.fetch(&target).await else {
                continue;
            };
            additional_cost_cents += cost;

            let mut content = content;
            if content.len() > max_context_length {
                // Truncate on a char boundary.
                let mut cut = max_context_length;
                while !content.is_char_boundary(cut) {
                    cut -= 1;
                }
                content.truncate(cut);
                content.push_str("\n[content truncated]");
            }
            sections.push(format!("## {}\n\n{}", url, content));
        }

        if sections.is_empty() {
            return UrlContextOutcome {
                context: None,
                additional_cost_cents,
            };
        }

        let context = format!(
            "The following content was fetched from URLs referenced in the conversation:\n\n{}",
            sections.join("\n\n")
        );
        UrlContextOutcome {
            context: Some(context),
            additional_cost_cents,
        }
    }
}
