//! Shared wire format and HTTP path for OpenAI-compatible providers.
//!
//! OpenAI and OpenRouter speak the same chat-completions shape; the structs
//! and the single-request client here are reused by both adapters. Error
//! responses are classified through the taxonomy before they leave this
//! module.

use crate::credentials::PlaintextKey;
use crate::error::{classify_http, classify_transport, ExtractError, ExtractResult};
use crate::logging::log_debug;
use crate::providers::{ChatOutcome, ChatRequest, ProviderUsage};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Chat-completions request body.
#[derive(Debug, Clone, Serialize)]
pub struct WireChatRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WireMessage {
    pub role: &'static str,
    pub content: String,
}

/// Chat-completions response body, reduced to what the contract needs.
#[derive(Debug, Clone, Deserialize)]
pub struct WireChatResponse {
    #[serde(default)]
    pub choices: Vec<WireChoice>,
    #[serde(default)]
    pub usage: Option<WireUsage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireChoice {
    pub message: WireResponseMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    /// OpenRouter reports the routed cost here; OpenAI omits it.
    #[serde(default)]
    pub cost: Option<f64>,
}

/// One-shot HTTP client for the chat-completions path. No retries.
#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    base_url: String,
}

impl OpenAiCompatClient {
    pub fn new(http: reqwest::Client, base_url: String) -> Self {
        Self { http, base_url }
    }

    /// Execute a single chat request and normalize the outcome.
    pub async fn execute_chat(
        &self,
        provider: &'static str,
        api_key: &PlaintextKey,
        request: &ChatRequest,
        extra_headers: &[(&'static str, &'static str)],
    ) -> ExtractResult<ChatOutcome> {
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let body = WireChatRequest {
            model: request.model.clone(),
            messages: vec![WireMessage {
                role: "user",
                content: request.prompt.clone(),
            }],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        log_debug!(
            provider = provider,
            model = %request.model,
            url = %url,
            "Executing chat request"
        );

        let started = Instant::now();
        let mut builder = self
            .http
            .post(&url)
            .bearer_auth(api_key.expose())
            .timeout(request.timeout)
            .json(&body);
        for (name, value) in extra_headers {
            builder = builder.header(*name, *value);
        }

        let response = builder.send().await.map_err(|e| {
            classify_transport(&e).with_attribution(provider, request.model.clone())
        })?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| {
            classify_transport(&e).with_attribution(provider, request.model.clone())
        })?;
        let latency = started.elapsed();

        if !(200..300).contains(&status) {
            return Err(classify_http(status, &text)
                .with_attribution(provider, request.model.clone()));
        }

        let parsed: WireChatResponse = serde_json::from_str(&text).map_err(|e| {
            ExtractError::invalid_response(format!("chat response failed to parse: {e}"))
                .with_attribution(provider, request.model.clone())
        })?;

        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                ExtractError::invalid_response("chat response carried no content")
                    .with_attribution(provider, request.model.clone())
            })?;

        let usage = parsed
            .usage
            .map(|u| ProviderUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
                reported_cost: u.cost,
            })
            .unwrap_or_default();

        Ok(ChatOutcome {
            text: content,
            usage,
            latency,
        })
    }
}
