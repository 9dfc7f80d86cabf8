//! Content pipeline: fetch → clean → hint → extract → capture.
//!
//! The pipeline owns the per-page call path shared by single extracts and
//! crawl pages. Fetching, cleaning, hint detection, and blob storage are
//! collaborator traits — the implementations live outside the core — while
//! prompt composition and the fallback execution are in-process. Every step
//! is instrumented with its duration so page metadata always carries
//! fetch/extract timings.

pub mod parse;
pub mod prompt;

use crate::chain::{AttemptRecord, ChainExecutor, LlmCandidate};
use crate::error::{ErrorKind, ExtractError, ExtractResult};
use crate::internals::tokens::estimate_tokens;
use crate::logging::{log_debug, log_warn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Collaborator contracts
// ============================================================================

/// Requested fetch behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    /// Static first; escalate to dynamic when the page looks JS-rendered
    /// and the tier allows it.
    #[default]
    Auto,
    Static,
    Dynamic,
}

/// The concrete fetch a collaborator performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    Static,
    Dynamic,
}

/// A fetched page as returned by the fetcher collaborator.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub final_url: String,
    pub content: String,
    pub status: u16,
    /// Static fetcher's signal that the page is likely JS-rendered.
    pub likely_js_rendered: bool,
}

/// Raw page fetching (static HTTP or headless browser).
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        kind: FetchKind,
        timeout: Duration,
    ) -> ExtractResult<FetchedPage>;
}

/// One content reduction stage (HTML strip, markdown conversion, ...).
#[async_trait::async_trait]
pub trait Cleaner: Send + Sync {
    fn name(&self) -> &'static str;
    async fn clean(&self, content: &str) -> ExtractResult<String>;
}

/// Page-classification hint detector; hints are folded into the prompt.
pub trait Preprocessor: Send + Sync {
    fn name(&self) -> &'static str;
    fn detect(&self, content: &str) -> Option<String>;
}

/// Blob storage for debug captures and result downloads.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> ExtractResult<()>;
    async fn presign(&self, key: &str) -> ExtractResult<String>;
}

// ============================================================================
// Pipeline input and output
// ============================================================================

/// What the caller wants extracted: a structured schema or freeform prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ExtractionSpec {
    Schema(serde_json::Value),
    Prompt(String),
}

/// Which prompt form produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputFormat {
    Schema,
    Prompt,
}

/// Usage and cost for one page extraction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Underlying provider cost, always recorded.
    pub llm_cost: f64,
    /// What the platform bills; zero for BYOK.
    pub charged_cost: f64,
    pub is_byok: bool,
}

/// Step timings and attribution for one page extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageMetadata {
    pub fetch_ms: u64,
    pub extract_ms: u64,
    pub provider: String,
    pub model: String,
    pub attempts: Vec<AttemptRecord>,
    /// Index of the winning candidate; the crawl worker feeds this back as
    /// its starting point after rate-limit abandonment.
    pub candidate_index: usize,
}

/// Result of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageExtraction {
    pub data: serde_json::Value,
    pub url: String,
    pub fetched_at: DateTime<Utc>,
    pub input_format: InputFormat,
    pub usage: UsageReport,
    pub metadata: PageMetadata,
    /// Raw page content before cleaning; the crawl worker discovers links
    /// from it. In-memory only.
    #[serde(skip)]
    pub raw_content: String,
}

/// Parameters for one pipeline run.
pub struct PipelineRequest<'a> {
    pub job_id: &'a str,
    pub url: &'a str,
    pub spec: &'a ExtractionSpec,
    pub fetch_mode: FetchMode,
    /// Cleaner names to apply in order; empty means the default chain.
    pub cleaner_chain: &'a [String],
    pub candidates: &'a [LlmCandidate],
    pub capture_debug: bool,
    /// Tier allows headless fetching (`content_dynamic`).
    pub dynamic_allowed: bool,
    pub static_timeout: Duration,
    pub dynamic_timeout: Duration,
    pub llm_timeout: Duration,
    /// First candidate index to try; nonzero after rate-limit abandonment.
    pub start_candidate: usize,
    pub cancel: &'a CancellationToken,
}

// ============================================================================
// The pipeline
// ============================================================================

const FETCH_RETRIES: u32 = 2;

pub struct ContentPipeline {
    fetcher: Arc<dyn Fetcher>,
    cleaners: HashMap<String, Arc<dyn Cleaner>>,
    default_chain: Vec<String>,
    preprocessors: Vec<Arc<dyn Preprocessor>>,
    blobs: Option<Arc<dyn BlobStore>>,
    executor: ChainExecutor,
}

impl ContentPipeline {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        cleaners: Vec<Arc<dyn Cleaner>>,
        default_chain: Vec<String>,
        preprocessors: Vec<Arc<dyn Preprocessor>>,
        blobs: Option<Arc<dyn BlobStore>>,
        executor: ChainExecutor,
    ) -> Self {
        let cleaners = cleaners
            .into_iter()
            .map(|c| (c.name().to_string(), c))
            .collect();
        Self {
            fetcher,
            cleaners,
            default_chain,
            preprocessors,
            blobs,
            executor,
        }
    }

    /// The fetcher collaborator; the crawl worker borrows it for sitemaps.
    pub fn fetcher(&self) -> &Arc<dyn Fetcher> {
        &self.fetcher
    }

    /// Run the full per-page call path.
    pub async fn process(&self, req: PipelineRequest<'_>) -> ExtractResult<PageExtraction> {
        // 1. Fetch, with auto escalation and bounded transient retry.
        let fetch_started = Instant::now();
        let page = self.fetch_with_policy(&req).await?;
        let fetch_ms = fetch_started.elapsed().as_millis() as u64;

        // 2. Clean.
        let chain: &[String] = if req.cleaner_chain.is_empty() {
            &self.default_chain
        } else {
            req.cleaner_chain
        };
        let mut content = page.content.clone();
        for name in chain {
            let Some(cleaner) = self.cleaners.get(name) else {
                log_warn!(cleaner = %name, "Unknown cleaner in chain; skipping");
                continue;
            };
            content = cleaner.clean(&content).await?;
        }

        // 3. Hints.
        let hints: Vec<String> = self
            .preprocessors
            .iter()
            .filter_map(|p| p.detect(&content))
            .collect();

        // 4. Extract through the fallback chain.
        let (composed, input_format) = prompt::compose(req.spec, &hints, &content);
        let extract_started = Instant::now();
        let success = self
            .executor
            .execute(
                req.candidates,
                &composed,
                req.llm_timeout,
                req.cancel,
                req.start_candidate,
            )
            .await?;
        let extract_ms = extract_started.elapsed().as_millis() as u64;

        let data = parse::parse_structured(&success.text)?;

        // 5. Capture debug artifacts.
        if req.capture_debug {
            self.capture(req.job_id, &composed, &page.content, &success.text)
                .await;
        }

        // Normalize usage; estimate when the provider reported nothing.
        let mut input_tokens = success.usage.input_tokens;
        let mut output_tokens = success.usage.output_tokens;
        if input_tokens == 0 && output_tokens == 0 {
            input_tokens = estimate_tokens(&composed);
            output_tokens = estimate_tokens(&success.text);
        }
        let llm_cost = success.llm_cost.unwrap_or(0.0);
        let charged_cost = if success.charged && !success.is_byok {
            llm_cost
        } else {
            0.0
        };

        log_debug!(
            job_id = %req.job_id,
            url = %req.url,
            provider = %success.provider,
            model = %success.model,
            fetch_ms = fetch_ms,
            extract_ms = extract_ms,
            "Pipeline run complete"
        );

        Ok(PageExtraction {
            data,
            url: page.final_url,
            fetched_at: Utc::now(),
            input_format,
            usage: UsageReport {
                input_tokens,
                output_tokens,
                llm_cost,
                charged_cost,
                is_byok: success.is_byok,
            },
            metadata: PageMetadata {
                fetch_ms,
                extract_ms,
                provider: success.provider,
                model: success.model,
                attempts: success.attempts,
                candidate_index: success.candidate_index,
            },
            raw_content: page.content,
        })
    }

    /// Fetch honoring the requested mode, the dynamic feature gate, and the
    /// two-attempt transient retry budget.
    async fn fetch_with_policy(&self, req: &PipelineRequest<'_>) -> ExtractResult<FetchedPage> {
        let (kind, timeout) = match req.fetch_mode {
            FetchMode::Static | FetchMode::Auto => (FetchKind::Static, req.static_timeout),
            FetchMode::Dynamic => (FetchKind::Dynamic, req.dynamic_timeout),
        };

        let page = self.fetch_with_retry(req.url, kind, timeout).await?;

        if req.fetch_mode == FetchMode::Auto && page.likely_js_rendered {
            if req.dynamic_allowed {
                log_debug!(url = %req.url, "Static fetch looks JS-rendered; escalating to dynamic");
                return self
                    .fetch_with_retry(req.url, FetchKind::Dynamic, req.dynamic_timeout)
                    .await;
            }
            log_warn!(url = %req.url, "Page looks JS-rendered but tier lacks content_dynamic");
        }

        Ok(page)
    }

    async fn fetch_with_retry(
        &self,
        url: &str,
        kind: FetchKind,
        timeout: Duration,
    ) -> ExtractResult<FetchedPage> {
        let mut last_err: Option<ExtractError> = None;
        for attempt in 0..=FETCH_RETRIES {
            match self.fetcher.fetch(url, kind, timeout).await {
                Ok(page) => return Ok(page),
                Err(err) => {
                    let transient = matches!(
                        err.kind(),
                        ErrorKind::NetworkError | ErrorKind::ProviderError
                    );
                    if !transient || attempt == FETCH_RETRIES {
                        return Err(err);
                    }
                    log_debug!(url = %url, attempt = attempt + 1, "Transient fetch failure; retrying");
                    last_err = Some(err);
                }
            }
        }
        // Loop always returns; kept for the compiler.
        Err(last_err.unwrap_or_else(|| ExtractError::network_error("fetch failed")))
    }

    async fn capture(&self, job_id: &str, prompt: &str, raw: &str, response: &str) {
        let Some(blobs) = &self.blobs else {
            log_warn!(job_id = %job_id, "Debug capture requested but no blob store configured");
            return;
        };
        let artifacts = [
            (format!("debug/{job_id}/prompt.txt"), prompt),
            (format!("debug/{job_id}/content.txt"), raw),
            (format!("debug/{job_id}/response.txt"), response),
        ];
        for (key, body) in artifacts {
            if let Err(err) = blobs.put(&key, body.as_bytes().to_vec()).await {
                log_warn!(job_id = %job_id, key = %key, error = %err, "Debug capture write failed");
            }
        }
    }
}
