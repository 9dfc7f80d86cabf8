//! OpenRouter provider adapter.
//!
//! OpenAI-compatible wire format. OpenRouter self-reports the routed cost
//! in `usage.cost`, which flows through as `reported_cost`; it also hosts
//! the `:free` models used as the free-tier last resort.

use crate::credentials::PlaintextKey;
use crate::error::ExtractResult;
use crate::providers::openai_compat::OpenAiCompatClient;
use crate::providers::{ChatOutcome, ChatProvider, ChatRequest};

/// Attribution headers OpenRouter asks integrators to send.
const ATTRIBUTION_HEADERS: [(&str, &str); 2] = [
    ("HTTP-Referer", "https://pagesift.dev"),
    ("X-Title", "pagesift"),
];

pub struct OpenRouterChat {
    client: OpenAiCompatClient,
    api_key: PlaintextKey,
}

impl OpenRouterChat {
    pub fn new(http: reqwest::Client, base_url: String, api_key: PlaintextKey) -> Self {
        Self {
            client: OpenAiCompatClient::new(http, base_url),
            api_key,
        }
    }
}

#[async_trait::async_trait]
impl ChatProvider for OpenRouterChat {
    async fn chat(&self, request: ChatRequest) -> ExtractResult<ChatOutcome> {
        self.client
            .execute_chat("openrouter", &self.api_key, &request, &ATTRIBUTION_HEADERS)
            .await
    }

    fn provider_name(&self) -> &'static str {
        "openrouter"
    }
}
