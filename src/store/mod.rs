//! Durable records and the job-store contract.
//!
//! The core persists four record families: jobs, per-page results, webhook
//! subscriptions, and webhook deliveries. [`JobStore`] is the abstract
//! surface the orchestration plane writes through; the SQL-backed
//! implementation lives with the storage collaborator, while
//! [`MemoryJobStore`] backs tests and single-process deployments.
//!
//! Record IDs are ULIDs, so `list_results_after` can implement SSE cursor
//! resume with a plain `id > cursor` comparison.

pub mod memory;

pub use memory::MemoryJobStore;

use crate::crawl::CrawlOptions;
use crate::error::{ErrorKind, ExtractError, ExtractResult};
use crate::pipeline::{ExtractionSpec, FetchMode};
use crate::tier::{Tier, TierLimits};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// Jobs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Extract,
    Analyze,
    Crawl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Legal state-machine successors.
    fn allows(self, next: JobStatus) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Cancelled | Self::Failed),
            Self::Running => {
                matches!(next, Self::Completed | Self::Failed | Self::Cancelled)
            }
            _ => false,
        }
    }
}

/// Classified error columns shared by jobs and results.
///
/// Details are stored in full; sanitization for non-BYOK callers happens at
/// the serialization boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFields {
    pub message: String,
    pub category: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorFields {
    pub fn from_error(err: &ExtractError) -> Self {
        Self {
            message: err.message().to_string(),
            category: err.kind(),
            details: err.detail().map(str::to_string),
        }
    }
}

/// A job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub user_id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub url: String,
    pub spec: ExtractionSpec,
    pub fetch_mode: FetchMode,
    pub capture_debug: bool,
    /// Tier and limits snapshotted at admission.
    pub tier: Tier,
    pub limits: TierLimits,
    pub is_byok: bool,
    /// Clamped crawl options; `None` for extract/analyze jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crawl: Option<CrawlOptions>,
    /// URLs ever admitted to the crawl frontier. Monotonic.
    pub urls_queued: u64,
    /// Results that reached a terminal state.
    pub page_count: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub charged_cost: f64,
    pub llm_cost: f64,
    /// Winning candidate attribution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorFields>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Partial job update. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub urls_queued: Option<u64>,
    pub page_count: Option<u64>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub charged_cost: Option<f64>,
    pub llm_cost: Option<f64>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub error: Option<ErrorFields>,
    pub merged_result: Option<serde_json::Value>,
}

// ============================================================================
// Per-page crawl results
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Pending,
    Crawling,
    Completed,
    Failed,
    Skipped,
}

impl ResultStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// One crawled URL's row. Append-only while the parent job runs; updates
/// stay within the row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub id: String,
    pub job_id: String,
    pub url: String,
    /// `None` exactly for depth-0 rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_url: Option<String>,
    pub depth: u32,
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub fetch_ms: u64,
    pub extract_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorFields>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial result update, applied under an optimistic status check.
#[derive(Debug, Clone, Default)]
pub struct ResultPatch {
    pub status: Option<ResultStatus>,
    pub data: Option<serde_json::Value>,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub fetch_ms: Option<u64>,
    pub extract_ms: Option<u64>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub error: Option<ErrorFields>,
}

// ============================================================================
// Webhooks
// ============================================================================

/// Events a subscriber can receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "job.started")]
    JobStarted,
    #[serde(rename = "job.completed")]
    JobCompleted,
    #[serde(rename = "job.failed")]
    JobFailed,
    #[serde(rename = "job.page_completed")]
    PageCompleted,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::JobStarted => "job.started",
            Self::JobCompleted => "job.completed",
            Self::JobFailed => "job.failed",
            Self::PageCompleted => "job.page_completed",
        }
    }
}

/// A saved webhook subscription. `events: None` is the wildcard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub id: String,
    pub user_id: String,
    /// Unique per user.
    pub name: String,
    pub url: String,
    /// HMAC secret, encrypted with the credential cipher. Never serialized.
    #[serde(skip)]
    pub secret_encrypted: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<EventKind>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Webhook {
    /// Whether this subscription wants the event.
    pub fn subscribes_to(&self, event: EventKind) -> bool {
        match &self.events {
            None => true,
            Some(kinds) => kinds.contains(&event),
        }
    }
}

/// Partial webhook update.
#[derive(Debug, Clone, Default)]
pub struct WebhookPatch {
    pub name: Option<String>,
    pub url: Option<String>,
    pub secret_encrypted: Option<Option<Vec<u8>>>,
    pub events: Option<Option<Vec<EventKind>>>,
    pub headers: Option<HashMap<String, String>>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Success,
    Failed,
    Retrying,
}

impl DeliveryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

/// One delivery attempt. Retries create a fresh row with the next attempt
/// number, so every attempt has exactly one row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: String,
    pub job_id: String,
    /// `None` for ephemeral and legacy bare-URL subscribers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_id: Option<String>,
    pub event: EventKind,
    pub url: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Due time; cleared while a dispatcher owns the row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Outcome update for a claimed delivery row.
#[derive(Debug, Clone, Default)]
pub struct DeliveryPatch {
    pub status: Option<DeliveryStatus>,
    pub response_code: Option<u16>,
    pub response_time_ms: Option<u64>,
    pub error: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
}

// ============================================================================
// The store contract
// ============================================================================

/// Abstract persistence for the orchestration plane.
///
/// Mutations on different jobs may run concurrently; mutations touching one
/// job's state must be serialized by the implementation. Status moves are
/// validated here, not in callers: illegal job transitions and writes to
/// terminal rows are errors.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: Job) -> ExtractResult<()>;
    /// Apply a patch and return the updated row.
    async fn update_job(&self, id: &str, patch: JobPatch) -> ExtractResult<Job>;
    async fn get_job(&self, id: &str) -> ExtractResult<Option<Job>>;
    async fn get_job_for_user(&self, user_id: &str, id: &str) -> ExtractResult<Option<Job>>;
    /// Newest first.
    async fn list_jobs(&self, user_id: &str, limit: usize, offset: usize)
        -> ExtractResult<Vec<Job>>;

    async fn append_result(&self, result: JobResult) -> ExtractResult<()>;
    /// Optimistic update keyed on (id, expected status). Returns `false`
    /// when another writer moved the row first.
    async fn update_result(
        &self,
        id: &str,
        expected: ResultStatus,
        patch: ResultPatch,
    ) -> ExtractResult<bool>;
    /// All results for a job in ID (creation) order.
    async fn list_results(&self, job_id: &str) -> ExtractResult<Vec<JobResult>>;
    /// Results with `id > cursor`, in ID order; the SSE resume path.
    async fn list_results_after(
        &self,
        job_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> ExtractResult<Vec<JobResult>>;

    async fn create_webhook(&self, webhook: Webhook) -> ExtractResult<()>;
    async fn get_webhook(&self, user_id: &str, id: &str) -> ExtractResult<Option<Webhook>>;
    async fn list_webhooks(&self, user_id: &str) -> ExtractResult<Vec<Webhook>>;
    async fn update_webhook(
        &self,
        user_id: &str,
        id: &str,
        patch: WebhookPatch,
    ) -> ExtractResult<Webhook>;
    async fn delete_webhook(&self, user_id: &str, id: &str) -> ExtractResult<bool>;

    async fn create_delivery(&self, delivery: WebhookDelivery) -> ExtractResult<()>;
    /// Atomically claim due pending/retrying rows by clearing their due
    /// time, so no two dispatchers own the same row.
    async fn claim_due_deliveries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> ExtractResult<Vec<WebhookDelivery>>;
    /// Optimistic outcome update keyed on (id, attempt). Returns `false`
    /// when the row's attempt number no longer matches.
    async fn update_delivery(
        &self,
        id: &str,
        expected_attempt: u32,
        patch: DeliveryPatch,
    ) -> ExtractResult<bool>;
    async fn list_deliveries_for_job(&self, job_id: &str) -> ExtractResult<Vec<WebhookDelivery>>;
    async fn list_deliveries_for_webhook(
        &self,
        webhook_id: &str,
        limit: usize,
        offset: usize,
    ) -> ExtractResult<Vec<WebhookDelivery>>;
}
