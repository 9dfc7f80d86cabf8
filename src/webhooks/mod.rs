//! Webhook delivery engine.
//!
//! Resolves the delivery set for each job event — the owner's saved
//! subscriptions, the ephemeral webhook supplied on the request, and the
//! legacy bare `webhook_url` field — and drains the resulting delivery
//! rows with a process-wide dispatcher pool. Each HTTP attempt is its own
//! delivery row; retryable failures schedule a fresh row on the backoff
//! ladder, and row ownership is settled through the store's optimistic
//! (id, attempt) update so two dispatchers can never both finish one row.

pub mod signing;

use crate::credentials::CredentialCipher;
use crate::error::ExtractResult;
use crate::id;
use crate::logging::{log_debug, log_info, log_warn};
use crate::store::{
    DeliveryPatch, DeliveryStatus, EventKind, Job, JobStore, WebhookDelivery,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Attempt ceiling; the fifth failure is final.
const MAX_ATTEMPTS: u32 = 5;
/// Backoff ladder between attempts, jittered ±10% at scheduling time.
const RETRY_DELAYS_SECS: [i64; 5] = [30, 120, 600, 3600, 21_600];
/// Per-delivery HTTP budget.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);
/// Dispatcher claim batch size.
const CLAIM_BATCH: usize = 16;
/// Idle sleep between empty claim rounds.
const IDLE_SLEEP: Duration = Duration::from_millis(500);

/// A subscriber supplied on one job request; never stored as a
/// subscription, though its deliveries are recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EphemeralWebhook {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// `None` subscribes to everything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<EventKind>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

impl EphemeralWebhook {
    fn subscribes_to(&self, event: EventKind) -> bool {
        match &self.events {
            None => true,
            Some(kinds) => kinds.contains(&event),
        }
    }
}

/// Outgoing payload envelope.
#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    event: &'a str,
    job_id: &'a str,
    delivered_at: DateTime<Utc>,
    summary: JobSummary,
}

/// Trimmed job view; counters and attribution only, never extracted data.
#[derive(Debug, Serialize)]
struct JobSummary {
    status: crate::store::JobStatus,
    kind: crate::store::JobKind,
    url: String,
    urls_queued: u64,
    page_count: u64,
    charged_cost: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_category: Option<&'static str>,
    results_url: String,
}

impl JobSummary {
    fn from_job(job: &Job, results_base: &str) -> Self {
        Self {
            status: job.status,
            kind: job.kind,
            url: job.url.clone(),
            urls_queued: job.urls_queued,
            page_count: job.page_count,
            charged_cost: job.charged_cost,
            error_message: job.error.as_ref().map(|e| e.message.clone()),
            error_category: job.error.as_ref().map(|e| e.category.as_str()),
            results_url: format!("{results_base}/jobs/{}/results", job.id),
        }
    }
}

pub struct WebhookEngine {
    store: Arc<dyn JobStore>,
    cipher: Arc<CredentialCipher>,
    http: reqwest::Client,
    pool_size: usize,
    results_base: String,
    /// Request-scoped subscribers, keyed by job ID. Lives for the process;
    /// retries up to the 6 h rung still find their secrets here.
    request_subscribers: DashMap<String, Vec<EphemeralWebhook>>,
    cancel: CancellationToken,
}

impl WebhookEngine {
    pub fn new(
        store: Arc<dyn JobStore>,
        cipher: Arc<CredentialCipher>,
        pool_size: usize,
        results_base: String,
    ) -> Self {
        Self {
            store,
            cipher,
            http: reqwest::Client::new(),
            pool_size: pool_size.max(1),
            results_base,
            request_subscribers: DashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Remember the request-supplied subscribers for a job. The legacy bare
    /// `webhook_url` becomes a secretless wildcard subscriber.
    pub fn register_request_subscribers(
        &self,
        job_id: &str,
        ephemeral: Option<EphemeralWebhook>,
        legacy_url: Option<String>,
    ) {
        let mut subscribers = Vec::new();
        if let Some(hook) = ephemeral {
            subscribers.push(hook);
        }
        if let Some(url) = legacy_url {
            subscribers.push(EphemeralWebhook {
                url,
                secret: None,
                events: None,
                headers: HashMap::new(),
            });
        }
        if !subscribers.is_empty() {
            self.request_subscribers
                .insert(job_id.to_string(), subscribers);
        }
    }

    /// Compute the delivery set for an event and create first-attempt rows.
    /// Returns how many deliveries were enqueued.
    pub async fn enqueue_event(&self, job: &Job, event: EventKind) -> ExtractResult<usize> {
        let now = Utc::now();
        let mut created = 0usize;

        for webhook in self.store.list_webhooks(&job.user_id).await? {
            if webhook.active && webhook.subscribes_to(event) {
                self.create_first_attempt(job, event, Some(webhook.id.clone()), &webhook.url, now)
                    .await?;
                created += 1;
            }
        }

        // Clone out of the map so no shard lock is held across the store
        // writes below.
        let request_hooks: Vec<EphemeralWebhook> = self
            .request_subscribers
            .get(&job.id)
            .map(|subscribers| subscribers.clone())
            .unwrap_or_default();
        for hook in request_hooks.iter().filter(|h| h.subscribes_to(event)) {
            self.create_first_attempt(job, event, None, &hook.url, now)
                .await?;
            created += 1;
        }

        if created > 0 {
            log_debug!(job_id = %job.id, event = event.as_str(), deliveries = created, "Webhook deliveries enqueued");
        }
        Ok(created)
    }

    async fn create_first_attempt(
        &self,
        job: &Job,
        event: EventKind,
        webhook_id: Option<String>,
        url: &str,
        now: DateTime<Utc>,
    ) -> ExtractResult<()> {
        self.store
            .create_delivery(WebhookDelivery {
                id: id::new_id(),
                job_id: job.id.clone(),
                webhook_id,
                event,
                url: url.to_string(),
                attempt: 1,
                status: DeliveryStatus::Pending,
                response_code: None,
                response_time_ms: None,
                error: None,
                next_attempt_at: Some(now),
                created_at: now,
                delivered_at: None,
            })
            .await
    }

    /// Spawn the dispatcher pool. Tasks run until [`shutdown`](Self::shutdown).
    pub fn start(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.pool_size)
            .map(|worker| {
                let engine = self.clone();
                tokio::spawn(async move {
                    log_debug!(worker = worker, "Webhook dispatcher started");
                    loop {
                        if engine.cancel.is_cancelled() {
                            break;
                        }
                        match engine.process_due(Utc::now()).await {
                            Ok(0) => tokio::time::sleep(IDLE_SLEEP).await,
                            Ok(_) => {}
                            Err(err) => {
                                log_warn!(error = %err, "Dispatcher claim round failed");
                                tokio::time::sleep(IDLE_SLEEP).await;
                            }
                        }
                    }
                })
            })
            .collect()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Claim and deliver one batch of due rows. Exposed so tests can drain
    /// deterministically without the background pool.
    pub async fn process_due(&self, now: DateTime<Utc>) -> ExtractResult<usize> {
        let batch = self.store.claim_due_deliveries(now, CLAIM_BATCH).await?;
        let claimed = batch.len();
        for delivery in batch {
            self.deliver(delivery).await;
        }
        Ok(claimed)
    }

    async fn deliver(&self, delivery: WebhookDelivery) {
        let job = match self.store.get_job(&delivery.job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                log_warn!(delivery_id = %delivery.id, job_id = %delivery.job_id, "Delivery references a missing job");
                self.finish(&delivery, DeliveryStatus::Failed, None, None, Some("job row missing".into()))
                    .await;
                return;
            }
            Err(err) => {
                log_warn!(delivery_id = %delivery.id, error = %err, "Job load failed; rescheduling");
                self.schedule_retry(&delivery, None, "job load failed").await;
                return;
            }
        };

        let payload = WebhookPayload {
            event: delivery.event.as_str(),
            job_id: &delivery.job_id,
            delivered_at: Utc::now(),
            summary: JobSummary::from_job(&job, &self.results_base),
        };
        let body = match serde_json::to_vec(&payload) {
            Ok(body) => body,
            Err(err) => {
                self.finish(
                    &delivery,
                    DeliveryStatus::Failed,
                    None,
                    None,
                    Some(format!("payload serialization failed: {err}")),
                )
                .await;
                return;
            }
        };

        let (secret, fixed_headers) = self.subscriber_context(&delivery).await;

        let mut request = self
            .http
            .post(&delivery.url)
            .timeout(DELIVERY_TIMEOUT)
            .header("content-type", "application/json")
            .header(signing::TIMESTAMP_HEADER, Utc::now().timestamp().to_string())
            .header(signing::EVENT_HEADER, delivery.event.as_str());
        if let Some(secret) = secret.as_deref() {
            request = request.header(signing::SIGNATURE_HEADER, signing::sign(secret, &body));
        }
        for (name, value) in &fixed_headers {
            request = request.header(name, value);
        }

        let started = std::time::Instant::now();
        let outcome = request.body(body).send().await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(response) => {
                let code = response.status().as_u16();
                match code {
                    200..=299 => {
                        log_info!(delivery_id = %delivery.id, url = %delivery.url, code = code, "Webhook delivered");
                        self.finish(
                            &delivery,
                            DeliveryStatus::Success,
                            Some(code),
                            Some(elapsed_ms),
                            None,
                        )
                        .await;
                    }
                    408 | 429 | 500..=599 => {
                        self.schedule_retry(
                            &delivery,
                            Some((code, elapsed_ms)),
                            &format!("destination answered {code}"),
                        )
                        .await;
                    }
                    _ => {
                        // Remaining 4xx: the destination rejected the
                        // delivery; retrying cannot help.
                        self.finish(
                            &delivery,
                            DeliveryStatus::Failed,
                            Some(code),
                            Some(elapsed_ms),
                            Some(format!("destination answered {code}")),
                        )
                        .await;
                    }
                }
            }
            Err(err) => {
                self.schedule_retry(&delivery, None, &format!("transport failure: {err}"))
                    .await;
            }
        }
    }

    /// Secret and fixed headers for the subscriber behind a delivery row.
    async fn subscriber_context(
        &self,
        delivery: &WebhookDelivery,
    ) -> (Option<String>, HashMap<String, String>) {
        if let Some(webhook_id) = &delivery.webhook_id {
            let job = self.store.get_job(&delivery.job_id).await.ok().flatten();
            let Some(job) = job else {
                return (None, HashMap::new());
            };
            let Ok(Some(webhook)) = self.store.get_webhook(&job.user_id, webhook_id).await else {
                return (None, HashMap::new());
            };
            let secret = webhook.secret_encrypted.as_ref().and_then(|encrypted| {
                match self.cipher.decrypt(encrypted) {
                    Ok(bytes) => String::from_utf8(bytes).ok(),
                    Err(err) => {
                        log_warn!(webhook_id = %webhook_id, error = %err, "Webhook secret failed to decrypt");
                        None
                    }
                }
            });
            return (secret, webhook.headers);
        }

        // Ephemeral subscriber: match the delivery URL back to the request
        // registration.
        let Some(subscribers) = self.request_subscribers.get(&delivery.job_id) else {
            return (None, HashMap::new());
        };
        subscribers
            .iter()
            .find(|h| h.url == delivery.url)
            .map(|h| (h.secret.clone(), h.headers.clone()))
            .unwrap_or((None, HashMap::new()))
    }

    async fn finish(
        &self,
        delivery: &WebhookDelivery,
        status: DeliveryStatus,
        code: Option<u16>,
        time_ms: Option<u64>,
        error: Option<String>,
    ) {
        let patch = DeliveryPatch {
            status: Some(status),
            response_code: code,
            response_time_ms: time_ms,
            error,
            delivered_at: (status == DeliveryStatus::Success).then(Utc::now),
        };
        match self
            .store
            .update_delivery(&delivery.id, delivery.attempt, patch)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                log_warn!(delivery_id = %delivery.id, "Another dispatcher finished this row first")
            }
            Err(err) => log_warn!(delivery_id = %delivery.id, error = %err, "Delivery update failed"),
        }
    }

    /// Record a retryable failure and, when attempts remain, create the
    /// next-attempt row on the backoff ladder.
    async fn schedule_retry(
        &self,
        delivery: &WebhookDelivery,
        response: Option<(u16, u64)>,
        reason: &str,
    ) {
        let (code, time_ms) = match response {
            Some((code, time_ms)) => (Some(code), Some(time_ms)),
            None => (None, None),
        };

        self.finish(
            delivery,
            DeliveryStatus::Failed,
            code,
            time_ms,
            Some(reason.to_string()),
        )
        .await;

        if delivery.attempt >= MAX_ATTEMPTS {
            log_warn!(
                delivery_id = %delivery.id,
                url = %delivery.url,
                attempts = delivery.attempt,
                "Delivery abandoned after final attempt"
            );
            return;
        }

        let base_secs = RETRY_DELAYS_SECS[(delivery.attempt - 1) as usize];
        // ±10% jitter.
        let jitter = 1.0 + (fastrand::f64() - 0.5) * 0.2;
        let delay_secs = ((base_secs as f64) * jitter).max(1.0) as i64;
        let due = Utc::now() + ChronoDuration::seconds(delay_secs);

        let next = WebhookDelivery {
            id: id::new_id(),
            job_id: delivery.job_id.clone(),
            webhook_id: delivery.webhook_id.clone(),
            event: delivery.event,
            url: delivery.url.clone(),
            attempt: delivery.attempt + 1,
            status: DeliveryStatus::Retrying,
            response_code: None,
            response_time_ms: None,
            error: None,
            next_attempt_at: Some(due),
            created_at: Utc::now(),
            delivered_at: None,
        };
        if let Err(err) = self.store.create_delivery(next).await {
            log_warn!(delivery_id = %delivery.id, error = %err, "Failed to schedule retry row");
        } else {
            log_debug!(
                delivery_id = %delivery.id,
                next_attempt = delivery.attempt + 1,
                due_in_secs = delay_secs,
                "Retry scheduled"
            );
        }
    }
}
