//! Shared fixtures for the service-level tests.

#![allow(dead_code)]

use crate::chain::{ChainEntry, ChainExecutor, ChainResolver, FallbackChain};
use crate::credentials::{CredentialCipher, CredentialStore, PlaintextKey};
use crate::error::{ExtractError, ExtractResult};
use crate::jobs::{AdmissionController, JobService};
use crate::pipeline::{
    Cleaner, ContentPipeline, FetchKind, FetchedPage, Fetcher, Preprocessor,
};
use crate::providers::{ChatOutcome, ChatProvider, ChatRequest, ProviderFactory, ProviderUsage};
use crate::store::{JobStore, MemoryJobStore};
use crate::tier::{Tier, UserContext};
use crate::webhooks::WebhookEngine;
use base64::Engine as _;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Stub fetcher
// ============================================================================

/// Serves canned pages by URL; unknown URLs answer 404.
pub struct StubFetcher {
    pages: Mutex<HashMap<String, ExtractResult<FetchedPage>>>,
    /// Artificial latency applied to every fetch.
    pub delay: Mutex<Duration>,
}

impl StubFetcher {
    pub fn new() -> Self {
        Self {
            pages: Mutex::new(HashMap::new()),
            delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn serve(&self, url: &str, html: &str) {
        self.pages.lock().unwrap().insert(
            url.to_string(),
            Ok(FetchedPage {
                final_url: url.to_string(),
                content: html.to_string(),
                status: 200,
                likely_js_rendered: false,
            }),
        );
    }

    pub fn fail(&self, url: &str, err: ExtractError) {
        self.pages.lock().unwrap().insert(url.to_string(), Err(err));
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }
}

#[async_trait::async_trait]
impl Fetcher for StubFetcher {
    async fn fetch(
        &self,
        url: &str,
        _kind: FetchKind,
        _timeout: Duration,
    ) -> ExtractResult<FetchedPage> {
        let delay = *self.delay.lock().unwrap();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        match self.pages.lock().unwrap().get(url) {
            Some(Ok(page)) => Ok(page.clone()),
            Some(Err(err)) => Err(err.clone()),
            None => Err(crate::error::classify_http(404, "")),
        }
    }
}

// ============================================================================
// Scripted LLM providers
// ============================================================================

type Script = VecDeque<ExtractResult<ChatOutcome>>;

/// Factory whose built providers answer from per-provider scripts.
pub struct ScriptedFactory {
    scripts: Arc<Mutex<HashMap<String, Script>>>,
    /// Providers the factory was asked to build, in order.
    pub built: Mutex<Vec<String>>,
    /// With no script queued, reflect the page's `data-url` marker back as
    /// `{"items":[{"url": ...}]}` instead of failing. Lets crawl tests
    /// return URL-keyed records without caring about worker scheduling.
    reflect: Arc<std::sync::atomic::AtomicBool>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self {
            scripts: Arc::new(Mutex::new(HashMap::new())),
            built: Mutex::new(Vec::new()),
            reflect: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn set_reflect(&self, on: bool) {
        self.reflect.store(on, std::sync::atomic::Ordering::SeqCst);
    }

    /// Push the next response for a provider.
    pub fn push(&self, provider: &str, response: ExtractResult<ChatOutcome>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(provider.to_string())
            .or_default()
            .push_back(response);
    }

    /// Push `count` copies of a success for a provider.
    pub fn push_ok_n(&self, provider: &str, outcome: ChatOutcome, count: usize) {
        for _ in 0..count {
            self.push(provider, Ok(outcome.clone()));
        }
    }
}

impl ProviderFactory for ScriptedFactory {
    fn build(
        &self,
        provider: &str,
        _base_url: Option<&str>,
        _api_key: Option<PlaintextKey>,
    ) -> ExtractResult<Box<dyn ChatProvider>> {
        self.built.lock().unwrap().push(provider.to_string());
        Ok(Box::new(ScriptedChat {
            provider: provider.to_string(),
            scripts: self.scripts.clone(),
            reflect: self.reflect.clone(),
        }))
    }
}

struct ScriptedChat {
    provider: String,
    scripts: Arc<Mutex<HashMap<String, Script>>>,
    reflect: Arc<std::sync::atomic::AtomicBool>,
}

#[async_trait::async_trait]
impl ChatProvider for ScriptedChat {
    async fn chat(&self, request: ChatRequest) -> ExtractResult<ChatOutcome> {
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&self.provider)
            .and_then(Script::pop_front);
        match scripted {
            Some(response) => response,
            None if self.reflect.load(std::sync::atomic::Ordering::SeqCst) => {
                let marker = request
                    .prompt
                    .split("data-url=\"")
                    .nth(1)
                    .and_then(|rest| rest.split('"').next())
                    .unwrap_or("unknown");
                Ok(chat_ok(
                    &format!("{{\"items\":[{{\"url\":\"{marker}\",\"name\":\"page\"}}]}}"),
                    Some(0.0001),
                ))
            }
            None => Err(ExtractError::provider_error(format!(
                "no scripted response left for '{}'",
                self.provider
            ))),
        }
    }

    fn provider_name(&self) -> &'static str {
        "scripted"
    }
}

/// A canned successful chat outcome.
pub fn chat_ok(text: &str, cost: Option<f64>) -> ChatOutcome {
    ChatOutcome {
        text: text.to_string(),
        usage: ProviderUsage {
            input_tokens: 100,
            output_tokens: 20,
            reported_cost: cost,
        },
        latency: Duration::from_millis(40),
    }
}

// ============================================================================
// Inert cleaners / preprocessors
// ============================================================================

pub struct PassthroughCleaner;

#[async_trait::async_trait]
impl Cleaner for PassthroughCleaner {
    fn name(&self) -> &'static str {
        "raw"
    }

    async fn clean(&self, content: &str) -> ExtractResult<String> {
        Ok(content.to_string())
    }
}

/// Flags pages with many repeated anchors as listings.
pub struct ListingHint;

impl Preprocessor for ListingHint {
    fn name(&self) -> &'static str {
        "listing"
    }

    fn detect(&self, content: &str) -> Option<String> {
        let anchors = content.matches("<a ").count();
        (anchors >= 5).then(|| format!("listing page with {anchors} repeated elements"))
    }
}

// ============================================================================
// Assembled harness
// ============================================================================

pub struct Harness {
    pub service: Arc<JobService>,
    pub store: Arc<dyn JobStore>,
    pub admission: Arc<AdmissionController>,
    pub engine: Arc<WebhookEngine>,
    pub resolver: Arc<ChainResolver>,
    pub credentials: Arc<CredentialStore>,
    pub factory: Arc<ScriptedFactory>,
    pub fetcher: Arc<StubFetcher>,
}

pub fn test_cipher() -> Arc<CredentialCipher> {
    let key = base64::engine::general_purpose::STANDARD.encode([3u8; 32]);
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

/// Full service wired against the in-memory store and scripted
/// collaborators. The default admin chain is openai → anthropic with
/// non-premium models, and admin keys exist for all three providers.
pub fn harness() -> Harness {
    let cipher = test_cipher();
    let credentials = Arc::new(CredentialStore::new(cipher.clone()));
    for provider in ["openai", "anthropic", "openrouter"] {
        credentials
            .upsert(provider, None, &format!("sk-admin-{provider}"), None)
            .unwrap();
    }

    let resolver = Arc::new(ChainResolver::new(
        credentials.clone(),
        ["openai", "anthropic", "openrouter"]
            .map(str::to_string)
            .to_vec(),
        "meta-llama/llama-3.1-8b-instruct:free".to_string(),
    ));
    resolver.set_admin_chain(
        None,
        FallbackChain::new(vec![
            entry("openai", "gpt-4o-mini", 0),
            entry("anthropic", "claude-3-5-haiku-20241022", 1),
        ]),
    );

    let factory = Arc::new(ScriptedFactory::new());
    let fetcher = Arc::new(StubFetcher::new());
    let executor = ChainExecutor::new(credentials.clone(), factory.clone());
    let pipeline = Arc::new(ContentPipeline::new(
        fetcher.clone(),
        vec![Arc::new(PassthroughCleaner)],
        vec!["raw".to_string()],
        vec![Arc::new(ListingHint)],
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
    let crawler = Arc::new(crate::crawl::CrawlWorker::new(
        store.clone(),
        pipeline.clone(),
        Duration::from_secs(120),
    ));
    let analyzer = Arc::new(crate::analyze::PageAnalyzer::new(fetcher.clone()));

    let service = Arc::new(JobService::new(
        store.clone(),
        pipeline,
        resolver.clone(),
        admission.clone(),
        engine.clone(),
        crawler,
        analyzer,
        credentials.clone(),
        cipher,
        Duration::from_secs(120),
    ));

    Harness {
        service,
        store,
        admission,
        engine,
        resolver,
        credentials,
        factory,
        fetcher,
    }
}

pub fn pro_user(user_id: &str) -> UserContext {
    UserContext::new(user_id, Tier::Pro)
}

pub fn free_user(user_id: &str) -> UserContext {
    UserContext::new(user_id, Tier::Free)
}
