//! # pagesift
//!
//! Job orchestration core for a multi-tenant web-data extraction service.
//! Callers submit a URL plus an extraction schema or prompt; pagesift
//! admits the job against tier policy, resolves an ordered chain of LLM
//! candidates, runs the fetch → clean → hint → extract pipeline (per page
//! for crawls), persists results, and notifies webhook subscribers.
//!
//! ## Key pieces
//!
//! - **Job lifecycle**: durable state machine with admission control,
//!   concurrency caps, quota enforcement, and at-most-once cost charging
//! - **Fallback chains**: candidate resolution from admin, user, claims,
//!   and per-request BYOK sources; error-class-aware sequential execution
//! - **Crawling**: sitemap/selector discovery, bounded BFS with a fixed
//!   worker pool, per-page extraction and partial-failure accounting
//! - **Delivery**: HMAC-signed webhooks on a jittered retry ladder, plus
//!   sync-wait and SSE surfaces with correct cancellation semantics
//!
//! HTTP routing, identity issuance, raw fetching, content cleaning, and
//! blob storage are collaborator seams; see the `pipeline` traits.
//!
//! ## Example
//!
//! ```rust,no_run
//! use pagesift::{api::ExtractRequest, tier::{Tier, UserContext}};
//!
//! # async fn example(service: std::sync::Arc<pagesift::jobs::JobService>) -> pagesift::error::ExtractResult<()> {
//! let user = UserContext::new("user-1", Tier::Pro);
//! let request = ExtractRequest {
//!     url: "https://example.com/pricing".to_string(),
//!     schema: Some(serde_json::json!({"plan": "string", "price": "string"})),
//!     ..Default::default()
//! };
//! let response = service.run_extract(&user, request, None).await?;
//! println!("{}", response.data);
//! # Ok(())
//! # }
//! ```

// =============================================================================
// Module declarations
// =============================================================================

pub mod aggregate;
pub mod analyze;
pub mod api;
pub mod chain;
pub mod config;
pub mod crawl;
pub mod credentials;
pub mod error;
pub mod id;
pub mod jobs;
pub mod pipeline;
pub mod providers;
pub mod store;
pub mod stream;
pub mod tier;
pub mod webhooks;

// Internal modules
pub(crate) mod internals;
pub(crate) mod logging;

#[cfg(test)]
pub mod tests;

// =============================================================================
// Public API re-exports
// =============================================================================

// Errors
pub use error::{ErrorKind, ExtractError, ExtractResult};

// Configuration
pub use config::{ProviderEndpoint, ServiceConfig};

// Tiers and identity
pub use tier::{FeatureSet, Tier, TierLimits, UserContext};

// Chains
pub use chain::{ChainEntry, ChainExecutor, ChainResolver, FallbackChain, LlmCandidate};

// Pipeline collaborator contracts
pub use pipeline::{
    BlobStore, Cleaner, ContentPipeline, ExtractionSpec, FetchKind, FetchMode, FetchedPage,
    Fetcher, PageExtraction, Preprocessor,
};

// Providers
pub use providers::{ChatOutcome, ChatProvider, ChatRequest, ProviderFactory, ProviderUsage};

// Store
pub use store::{Job, JobResult, JobStatus, JobStore, MemoryJobStore};

// Services
pub use jobs::{AdmissionController, JobService};
pub use webhooks::WebhookEngine;

// Streaming surfaces
pub use stream::{sync_wait, SseFrame, SyncWaitOutcome};
