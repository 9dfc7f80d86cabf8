//! Anthropic provider adapter.
//!
//! Uses the native messages API rather than the OpenAI-compatible shape:
//! `x-api-key` auth, a required `max_tokens`, and a content-block response.

use crate::credentials::PlaintextKey;
use crate::error::{classify_http, classify_transport, ExtractError, ExtractResult};
use crate::logging::log_debug;
use crate::providers::{ChatOutcome, ChatProvider, ChatRequest, ProviderUsage};
use serde::{Deserialize, Serialize};
use std::time::Instant;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<MessageParam>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Serialize)]
struct MessageParam {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<MessagesUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

pub struct AnthropicChat {
    http: reqwest::Client,
    base_url: String,
    api_key: PlaintextKey,
}

impl AnthropicChat {
    pub fn new(http: reqwest::Client, base_url: String, api_key: PlaintextKey) -> Self {
        Self {
            http,
            base_url,
            api_key,
        }
    }
}

#[async_trait::async_trait]
impl ChatProvider for AnthropicChat {
    async fn chat(&self, request: ChatRequest) -> ExtractResult<ChatOutcome> {
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let body = MessagesRequest {
            model: request.model.clone(),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages: vec![MessageParam {
                role: "user",
                content: request.prompt.clone(),
            }],
            temperature: request.temperature,
        };

        log_debug!(model = %request.model, url = %url, "Executing messages request");

        let started = Instant::now();
        let response = self
            .http
            .post(&url)
            .header("x-api-key", self.api_key.expose())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                classify_transport(&e).with_attribution("anthropic", request.model.clone())
            })?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| {
            classify_transport(&e).with_attribution("anthropic", request.model.clone())
        })?;
        let latency = started.elapsed();

        if !(200..300).contains(&status) {
            return Err(
                classify_http(status, &text).with_attribution("anthropic", request.model.clone())
            );
        }

        let parsed: MessagesResponse = serde_json::from_str(&text).map_err(|e| {
            ExtractError::invalid_response(format!("messages response failed to parse: {e}"))
                .with_attribution("anthropic", request.model.clone())
        })?;

        let content = parsed
            .content
            .iter()
            .filter(|b| b.block_type == "text")
            .filter_map(|b| b.text.as_deref())
            .collect::<Vec<_>>()
            .join("");
        if content.is_empty() {
            return Err(ExtractError::invalid_response("messages response had no text blocks")
                .with_attribution("anthropic", request.model.clone()));
        }

        let usage = parsed
            .usage
            .map(|u| ProviderUsage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
                reported_cost: None,
            })
            .unwrap_or_default();

        Ok(ChatOutcome {
            text: content,
            usage,
            latency,
        })
    }

    fn provider_name(&self) -> &'static str {
        "anthropic"
    }
}
