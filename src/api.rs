//! Request and response bodies for the HTTP surface.
//!
//! Routing, auth, and content negotiation live in the serialization shim
//! outside this crate; these types are the contract it maps onto the job
//! service. Error bodies apply the BYOK sanitization rule: non-BYOK callers
//! see only the message and category.

use crate::chain::resolver::RequestLlmOverride;
use crate::crawl::CrawlOptions;
use crate::error::{ErrorKind, ExtractError, ExtractResult};
use crate::pipeline::{ExtractionSpec, FetchMode, InputFormat, UsageReport};
use crate::store::{
    DeliveryStatus, ErrorFields, EventKind, Job, JobKind, JobResult, JobStatus, ResultStatus,
    Webhook, WebhookDelivery,
};
use crate::webhooks::EphemeralWebhook;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// Requests
// ============================================================================

/// `POST /extract` body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtractRequest {
    pub url: String,
    /// JSON schema, either inline or as an encoded string.
    #[serde(default)]
    pub schema: Option<serde_json::Value>,
    /// Freeform extraction instruction; `schema` wins when both are set.
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub fetch_mode: Option<FetchMode>,
    #[serde(default)]
    pub cleaner_chain: Vec<String>,
    #[serde(default)]
    pub llm_config: Option<RequestLlmOverride>,
    /// Ephemeral subscriber for this job only.
    #[serde(default)]
    pub webhook: Option<EphemeralWebhook>,
    /// Legacy bare destination, treated as a wildcard subscription.
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub capture_debug: bool,
}

impl ExtractRequest {
    /// Normalize the schema/prompt pair into the pipeline's input form.
    ///
    /// A schema arriving as a JSON-encoded string is parsed so the prompt
    /// composer always sees structure.
    pub fn extraction_spec(&self) -> ExtractResult<ExtractionSpec> {
        if let Some(schema) = &self.schema {
            let normalized = match schema {
                serde_json::Value::String(raw) => serde_json::from_str(raw)
                    .unwrap_or_else(|_| serde_json::Value::String(raw.clone())),
                other => other.clone(),
            };
            return Ok(ExtractionSpec::Schema(normalized));
        }
        if let Some(prompt) = &self.prompt {
            if !prompt.trim().is_empty() {
                return Ok(ExtractionSpec::Prompt(prompt.clone()));
            }
        }
        Err(ExtractError::invalid_response(
            "either schema or prompt is required",
        ))
    }
}

/// `POST /crawl` body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CrawlRequest {
    #[serde(flatten)]
    pub extract: ExtractRequest,
    #[serde(default)]
    pub options: CrawlOptions,
}

/// `POST /analyze` body.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzeRequest {
    pub url: String,
    #[serde(default)]
    pub fetch_mode: Option<FetchMode>,
    #[serde(default)]
    pub debug: bool,
}

/// `CRUD /webhooks` create/update body.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookUpsertRequest {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
    /// `None` subscribes to every event.
    #[serde(default)]
    pub events: Option<Vec<EventKind>>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// `CRUD /llm/keys` upsert body.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyUpsertRequest {
    pub provider: String,
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

// ============================================================================
// Error body
// ============================================================================

/// Serialized failure, with the §7 sanitization applied for non-BYOK
/// callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error_message: String,
    pub error_category: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_model: Option<String>,
}

impl ErrorBody {
    pub fn from_error(err: &ExtractError, byok: bool) -> Self {
        let err = if byok { err.clone() } else { err.sanitized() };
        Self {
            error_message: err.message().to_string(),
            error_category: err.kind(),
            error_details: err.detail().map(str::to_string),
            llm_provider: err.provider().map(str::to_string),
            llm_model: err.model().map(str::to_string),
        }
    }

    pub fn from_fields(
        fields: &ErrorFields,
        provider: Option<&str>,
        model: Option<&str>,
        byok: bool,
    ) -> Self {
        Self {
            error_message: fields.message.clone(),
            error_category: fields.category,
            error_details: byok.then(|| fields.details.clone()).flatten(),
            llm_provider: byok.then(|| provider.map(str::to_string)).flatten(),
            llm_model: byok.then(|| model.map(str::to_string)).flatten(),
        }
    }

    /// HTTP status the shim must answer with.
    pub fn http_status(&self) -> u16 {
        self.error_category.http_status()
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Extraction attribution and timings echoed to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub fetch_ms: u64,
    pub extract_ms: u64,
    pub provider: String,
    pub model: String,
    pub input_format: InputFormat,
}

/// `POST /extract` success body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractResponse {
    pub job_id: String,
    pub data: serde_json::Value,
    pub usage: UsageReport,
    pub metadata: ResponseMetadata,
}

/// Job row as shown to its owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub url: String,
    pub fetch_mode: FetchMode,
    pub is_byok: bool,
    pub urls_queued: u64,
    pub page_count: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub charged_cost: f64,
    pub llm_cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobView {
    pub fn from_job(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            kind: job.kind,
            status: job.status,
            url: job.url.clone(),
            fetch_mode: job.fetch_mode,
            is_byok: job.is_byok,
            urls_queued: job.urls_queued,
            page_count: job.page_count,
            input_tokens: job.input_tokens,
            output_tokens: job.output_tokens,
            charged_cost: job.charged_cost,
            llm_cost: job.llm_cost,
            provider: job.provider.clone(),
            model: job.model.clone(),
            error: job.error.as_ref().map(|fields| {
                ErrorBody::from_fields(
                    fields,
                    job.provider.as_deref(),
                    job.model.as_deref(),
                    job.is_byok,
                )
            }),
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

/// Per-page result as shown to the job owner. Error attribution follows
/// the job's BYOK visibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultView {
    pub id: String,
    pub url: String,
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
    pub error: Option<ErrorBody>,
    pub created_at: DateTime<Utc>,
}

impl ResultView {
    pub fn from_result(result: &JobResult, byok: bool) -> Self {
        Self {
            id: result.id.clone(),
            url: result.url.clone(),
            parent_url: result.parent_url.clone(),
            depth: result.depth,
            status: result.status,
            data: result.data.clone(),
            input_tokens: result.input_tokens,
            output_tokens: result.output_tokens,
            fetch_ms: result.fetch_ms,
            extract_ms: result.extract_ms,
            error: result.error.as_ref().map(|fields| {
                ErrorBody::from_fields(
                    fields,
                    result.provider.as_deref(),
                    result.model.as_deref(),
                    byok,
                )
            }),
            created_at: result.created_at,
        }
    }
}

/// One URL of the crawl map: discovery structure plus error attribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlMapEntry {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_url: Option<String>,
    pub depth: u32,
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl CrawlMapEntry {
    pub fn from_result(result: &JobResult) -> Self {
        Self {
            url: result.url.clone(),
            parent_url: result.parent_url.clone(),
            depth: result.depth,
            status: result.status,
            error_category: result.error.as_ref().map(|e| e.category),
            error_message: result.error.as_ref().map(|e| e.message.clone()),
        }
    }
}

/// Saved webhook as shown to its owner; secret presence only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookView {
    pub id: String,
    pub name: String,
    pub url: String,
    pub has_secret: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<EventKind>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookView {
    pub fn from_webhook(webhook: &Webhook) -> Self {
        Self {
            id: webhook.id.clone(),
            name: webhook.name.clone(),
            url: webhook.url.clone(),
            has_secret: webhook.secret_encrypted.is_some(),
            events: webhook.events.clone(),
            headers: webhook.headers.clone(),
            active: webhook.active,
            created_at: webhook.created_at,
            updated_at: webhook.updated_at,
        }
    }
}

/// Delivery row view for `GET /jobs/{id}/webhooks` and
/// `GET /webhooks/{id}/deliveries`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryView {
    pub id: String,
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_id: Option<String>,
    pub event: EventKind,
    pub url: String,
    pub attempt: u32,
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
}

impl DeliveryView {
    pub fn from_delivery(delivery: &WebhookDelivery) -> Self {
        Self {
            id: delivery.id.clone(),
            job_id: delivery.job_id.clone(),
            webhook_id: delivery.webhook_id.clone(),
            event: delivery.event,
            url: delivery.url.clone(),
            attempt: delivery.attempt,
            status: delivery.status,
            response_code: delivery.response_code,
            response_time_ms: delivery.response_time_ms,
            error: delivery.error.clone(),
            next_attempt_at: delivery.next_attempt_at,
            created_at: delivery.created_at,
            delivered_at: delivery.delivered_at,
        }
    }
}

/// `GET /llm/providers` entry.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderView {
    pub name: &'static str,
    pub models: Vec<crate::providers::ModelInfo>,
}

/// Every enabled provider with its model catalog.
pub fn provider_listing() -> Vec<ProviderView> {
    crate::providers::supported_providers()
        .iter()
        .map(|&name| ProviderView {
            name,
            models: crate::providers::model_catalog(name).to_vec(),
        })
        .collect()
}
