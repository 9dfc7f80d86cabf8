//! OpenAI provider adapter.
//!
//! Thin wrapper over the shared OpenAI-compatible client.

use crate::credentials::PlaintextKey;
use crate::error::ExtractResult;
use crate::providers::openai_compat::OpenAiCompatClient;
use crate::providers::{ChatOutcome, ChatProvider, ChatRequest};

pub struct OpenAiChat {
    client: OpenAiCompatClient,
    api_key: PlaintextKey,
}

impl OpenAiChat {
    pub fn new(http: reqwest::Client, base_url: String, api_key: PlaintextKey) -> Self {
        Self {
            client: OpenAiCompatClient::new(http, base_url),
            api_key,
        }
    }
}

#[async_trait::async_trait]
impl ChatProvider for OpenAiChat {
    async fn chat(&self, request: ChatRequest) -> ExtractResult<ChatOutcome> {
        self.client
            .execute_chat("openai", &self.api_key, &request, &[])
            .await
    }

    fn provider_name(&self) -> &'static str {
        "openai"
    }
}
