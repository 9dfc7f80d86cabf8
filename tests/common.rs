//! Shared fixtures for the wiremock-backed integration tests.
//!
//! IMPORTANT: these helpers are test-only and should never be used in
//! production code.

// Allow dead code in test utilities - functions are used across different test files
#![allow(dead_code)]

use pagesift::chain::{ChainEntry, ChainExecutor, ChainResolver, FallbackChain};
use pagesift::config::ProviderEndpoint;
use pagesift::credentials::{CredentialCipher, CredentialStore};
use pagesift::error::{ExtractResult, classify_http};
use pagesift::jobs::{AdmissionController, JobService};
use pagesift::pipeline::{
    Cleaner, ContentPipeline, FetchKind, FetchedPage, Fetcher,
};
use pagesift::providers::DefaultProviderFactory;
use pagesift::store::{JobStore, MemoryJobStore};
use pagesift::tier::{Tier, UserContext};
use pagesift::webhooks::WebhookEngine;
use base64::Engine as _;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::ResponseTemplate;

// ============================================================================
// Canned provider responses
// ============================================================================

/// Successful OpenAI-format chat completion.
pub fn openai_chat_response(content: &str) -> serde_json::Value {
    serde_json::json!({
        "id": "chatcmpl-test123",
        "object": "chat.completion",
        "model": "gpt-4o-mini",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop"
        }],
        "usage": {
            "prompt_tokens": 100,
            "completion_tokens": 20,
            "total_tokens": 120
        }
    })
}

/// OpenRouter variant carrying the routed cost in usage.
pub fn openrouter_chat_response(content: &str, cost: f64) -> serde_json::Value {
    let mut body = openai_chat_response(content);
    body["usage"]["cost"] = serde_json::json!(cost);
    body
}

/// Successful Anthropic messages response.
pub fn anthropic_messages_response(content: &str) -> serde_json::Value {
    serde_json::json!({
        "id": "msg_test123",
        "type": "message",
        "role": "assistant",
        "model": "claude-3-5-haiku-20241022",
        "content": [{ "type": "text", "text": content }],
        "stop_reason": "end_turn",
        "usage": { "input_tokens": 80, "output_tokens": 15 }
    })
}

/// Error template with a provider-style body.
pub fn provider_error_response(status: u16, message: &str) -> ResponseTemplate {
    ResponseTemplate::new(status).set_body_json(serde_json::json!({
        "error": { "message": message, "type": "api_error" }
    }))
}

/// 429 with a retry-after header.
pub fn rate_limit_response() -> ResponseTemplate {
    ResponseTemplate::new(429)
        .insert_header("retry-after", "60")
        .set_body_json(serde_json::json!({
            "error": { "message": "Rate limit exceeded", "type": "rate_limit_error" }
        }))
}

// ============================================================================
// Stub fetcher
// ============================================================================

/// Serves canned pages by URL; unknown URLs answer 404.
pub struct MapFetcher {
    pages: Mutex<HashMap<String, String>>,
}

impl MapFetcher {
    pub fn new() -> Self {
        Self {
            pages: Mutex::new(HashMap::new()),
        }
    }

    pub fn serve(&self, url: &str, html: &str) {
        self.pages
            .lock()
            .unwrap()
            .insert(url.to_string(), html.to_string());
    }
}

#[async_trait::async_trait]
impl Fetcher for MapFetcher {
    async fn fetch(
        &self,
        url: &str,
        _kind: FetchKind,
        _timeout: Duration,
    ) -> ExtractResult<FetchedPage> {
        match self.pages.lock().unwrap().get(url) {
            Some(html) => Ok(FetchedPage {
                final_url: url.to_string(),
                content: html.clone(),
                status: 200,
                likely_js_rendered: false,
            }),
            None => Err(classify_http(404, "")),
        }
    }
}

struct IdentityCleaner;

#[async_trait::async_trait]
impl Cleaner for IdentityCleaner {
    fn name(&self) -> &'static str {
        "raw"
    }

    async fn clean(&self, content: &str) -> ExtractResult<String> {
        Ok(content.to_string())
    }
}

// ============================================================================
// Assembled service
// ============================================================================

pub struct Stack {
    pub service: Arc<JobService>,
    pub store: Arc<dyn JobStore>,
    pub engine: Arc<WebhookEngine>,
    pub admission: Arc<AdmissionController>,
    pub fetcher: Arc<MapFetcher>,
    pub credentials: Arc<CredentialStore>,
}

pub fn test_cipher() -> Arc<CredentialCipher> {
    let key = base64::engine::general_purpose::STANDARD.encode([5u8; 32]);
    Arc::new(CredentialCipher::from_base64(&key).unwrap())
}

/// One admin chain entry.
pub fn entry(provider: &str, model: &str, position: u32) -> ChainEntry {
    ChainEntry {
        provider: provider.to_string(),
        model: model.to_string(),
        base_url: None,
        temperature: None,
        max_tokens: None,
        position,
        enabled: true,
        tier_scope: None,
    }
}

/// Build the full service against real provider transports whose base URLs
/// point at wiremock servers. `endpoints` maps provider name to mock URI;
/// the admin chain is taken from `chain`.
pub fn stack(endpoints: Vec<(&str, String)>, chain: Vec<ChainEntry>) -> Stack {
    let cipher = test_cipher();
    let credentials = Arc::new(CredentialStore::new(cipher.clone()));
    let provider_names: Vec<String> = endpoints.iter().map(|(n, _)| n.to_string()).collect();
    for name in &provider_names {
        credentials
            .upsert(name, None, &format!("sk-admin-{name}"), None)
            .unwrap();
    }

    let resolver = Arc::new(ChainResolver::new(
        credentials.clone(),
        provider_names,
        "meta-llama/llama-3.1-8b-instruct:free".to_string(),
    ));
    resolver.set_admin_chain(None, FallbackChain::new(chain));

    let factory = Arc::new(DefaultProviderFactory::new(
        endpoints
            .into_iter()
            .map(|(name, base_url)| ProviderEndpoint {
                name: name.to_string(),
                base_url,
            })
            .collect(),
    ));
    let fetcher = Arc::new(MapFetcher::new());
    let executor = ChainExecutor::new(credentials.clone(), factory);
    let pipeline = Arc::new(ContentPipeline::new(
        fetcher.clone(),
        vec![Arc::new(IdentityCleaner)],
        vec!["raw".to_string()],
        Vec::new(),
        None,
        executor,
    ));

    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let admission = Arc::new(AdmissionController::new());
    let engine = Arc::new(WebhookEngine::new(
        store.clone(),
        cipher.clone(),
        2,
        "/api/v1".to_string(),
    ));
    let crawler = Arc::new(pagesift::crawl::CrawlWorker::new(
        store.clone(),
        pipeline.clone(),
        Duration::from_secs(30),
    ));
    let analyzer = Arc::new(pagesift::analyze::PageAnalyzer::new(fetcher.clone()));

    let service = Arc::new(JobService::new(
        store.clone(),
        pipeline,
        resolver,
        admission.clone(),
        engine.clone(),
        crawler,
        analyzer,
        credentials.clone(),
        cipher,
        Duration::from_secs(30),
    ));

    Stack {
        service,
        store,
        engine,
        admission,
        fetcher,
        credentials,
    }
}

pub fn pro_user(user_id: &str) -> UserContext {
    UserContext::new(user_id, Tier::Pro)
}
