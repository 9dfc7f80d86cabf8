//! In-memory job store.
//!
//! Backs tests and single-process deployments. Results and deliveries live
//! in `BTreeMap`s keyed by ULID so iteration order is creation order and
//! cursor queries are range scans. A single async `RwLock` per record
//! family serializes writers; per-job serialization follows from that.

use super::{
    DeliveryPatch, DeliveryStatus, Job, JobPatch, JobResult, JobStore, ResultPatch, ResultStatus,
    Webhook, WebhookDelivery, WebhookPatch,
};
use crate::error::{ExtractError, ExtractResult};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, Job>>,
    results: RwLock<BTreeMap<String, JobResult>>,
    webhooks: RwLock<HashMap<String, Webhook>>,
    deliveries: RwLock<BTreeMap<String, WebhookDelivery>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, job: Job) -> ExtractResult<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(ExtractError::unknown(format!("job {} already exists", job.id)));
        }
        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn update_job(&self, id: &str, patch: JobPatch) -> ExtractResult<Job> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| ExtractError::unknown(format!("job {id} not found")))?;

        // Terminal rows are frozen; no second terminal transition, no
        // counter mutation after the fact.
        if job.status.is_terminal() {
            return Err(ExtractError::unknown(format!(
                "job {id} is already terminal ({:?})",
                job.status
            )));
        }

        if let Some(next) = patch.status {
            if !job.status.allows(next) {
                return Err(ExtractError::unknown(format!(
                    "illegal job transition {:?} -> {next:?}",
                    job.status
                )));
            }
            job.status = next;
        }
        if let Some(v) = patch.started_at {
            job.started_at = Some(v);
        }
        if let Some(v) = patch.completed_at {
            job.completed_at = Some(v);
        }
        if let Some(v) = patch.urls_queued {
            job.urls_queued = v;
        }
        if let Some(v) = patch.page_count {
            job.page_count = v;
        }
        if let Some(v) = patch.input_tokens {
            job.input_tokens = v;
        }
        if let Some(v) = patch.output_tokens {
            job.output_tokens = v;
        }
        if let Some(v) = patch.charged_cost {
            job.charged_cost = v;
        }
        if let Some(v) = patch.llm_cost {
            job.llm_cost = v;
        }
        if let Some(v) = patch.provider {
            job.provider = Some(v);
        }
        if let Some(v) = patch.model {
            job.model = Some(v);
        }
        if let Some(v) = patch.error {
            job.error = Some(v);
        }
        if let Some(v) = patch.merged_result {
            job.merged_result = Some(v);
        }
        job.updated_at = Utc::now();

        Ok(job.clone())
    }

    async fn get_job(&self, id: &str) -> ExtractResult<Option<Job>> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn get_job_for_user(&self, user_id: &str, id: &str) -> ExtractResult<Option<Job>> {
        Ok(self
            .jobs
            .read()
            .await
            .get(id)
            .filter(|j| j.user_id == user_id)
            .cloned())
    }

    async fn list_jobs(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> ExtractResult<Vec<Job>> {
        let jobs = self.jobs.read().await;
        let mut owned: Vec<Job> = jobs
            .values()
            .filter(|j| j.user_id == user_id)
            .cloned()
            .collect();
        // ULIDs sort by creation time; newest first.
        owned.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(owned.into_iter().skip(offset).take(limit).collect())
    }

    async fn append_result(&self, result: JobResult) -> ExtractResult<()> {
        {
            let jobs = self.jobs.read().await;
            let job = jobs
                .get(&result.job_id)
                .ok_or_else(|| ExtractError::unknown(format!("job {} not found", result.job_id)))?;
            if job.status.is_terminal() {
                return Err(ExtractError::unknown(
                    "results are append-only while the job is running",
                ));
            }
        }
        let mut results = self.results.write().await;
        if results.contains_key(&result.id) {
            return Err(ExtractError::unknown(format!(
                "result {} already exists",
                result.id
            )));
        }
        results.insert(result.id.clone(), result);
        Ok(())
    }

    async fn update_result(
        &self,
        id: &str,
        expected: ResultStatus,
        patch: ResultPatch,
    ) -> ExtractResult<bool> {
        let mut results = self.results.write().await;
        let result = results
            .get_mut(id)
            .ok_or_else(|| ExtractError::unknown(format!("result {id} not found")))?;

        if result.status != expected {
            return Ok(false);
        }

        if let Some(v) = patch.status {
            result.status = v;
        }
        if let Some(v) = patch.data {
            result.data = Some(v);
        }
        if let Some(v) = patch.input_tokens {
            result.input_tokens = v;
        }
        if let Some(v) = patch.output_tokens {
            result.output_tokens = v;
        }
        if let Some(v) = patch.fetch_ms {
            result.fetch_ms = v;
        }
        if let Some(v) = patch.extract_ms {
            result.extract_ms = v;
        }
        if let Some(v) = patch.provider {
            result.provider = Some(v);
        }
        if let Some(v) = patch.model {
            result.model = Some(v);
        }
        if let Some(v) = patch.error {
            result.error = Some(v);
        }
        result.updated_at = Utc::now();
        Ok(true)
    }

    async fn list_results(&self, job_id: &str) -> ExtractResult<Vec<JobResult>> {
        Ok(self
            .results
            .read()
            .await
            .values()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn list_results_after(
        &self,
        job_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> ExtractResult<Vec<JobResult>> {
        let results = self.results.read().await;
        let after = cursor.unwrap_or("");
        Ok(results
            .values()
            .filter(|r| r.job_id == job_id && r.id.as_str() > after)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn create_webhook(&self, webhook: Webhook) -> ExtractResult<()> {
        let mut webhooks = self.webhooks.write().await;
        let duplicate = webhooks
            .values()
            .any(|w| w.user_id == webhook.user_id && w.name == webhook.name);
        if duplicate {
            return Err(ExtractError::unknown(format!(
                "webhook name '{}' already in use",
                webhook.name
            )));
        }
        webhooks.insert(webhook.id.clone(), webhook);
        Ok(())
    }

    async fn get_webhook(&self, user_id: &str, id: &str) -> ExtractResult<Option<Webhook>> {
        Ok(self
            .webhooks
            .read()
            .await
            .get(id)
            .filter(|w| w.user_id == user_id)
            .cloned())
    }

    async fn list_webhooks(&self, user_id: &str) -> ExtractResult<Vec<Webhook>> {
        let webhooks = self.webhooks.read().await;
        let mut owned: Vec<Webhook> = webhooks
            .values()
            .filter(|w| w.user_id == user_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(owned)
    }

    async fn update_webhook(
        &self,
        user_id: &str,
        id: &str,
        patch: WebhookPatch,
    ) -> ExtractResult<Webhook> {
        let mut webhooks = self.webhooks.write().await;
        let webhook = webhooks
            .get_mut(id)
            .filter(|w| w.user_id == user_id)
            .ok_or_else(|| ExtractError::unknown(format!("webhook {id} not found")))?;

        if let Some(v) = patch.name {
            webhook.name = v;
        }
        if let Some(v) = patch.url {
            webhook.url = v;
        }
        if let Some(v) = patch.secret_encrypted {
            webhook.secret_encrypted = v;
        }
        if let Some(v) = patch.events {
            webhook.events = v;
        }
        if let Some(v) = patch.headers {
            webhook.headers = v;
        }
        if let Some(v) = patch.active {
            webhook.active = v;
        }
        webhook.updated_at = Utc::now();
        Ok(webhook.clone())
    }

    async fn delete_webhook(&self, user_id: &str, id: &str) -> ExtractResult<bool> {
        let mut webhooks = self.webhooks.write().await;
        match webhooks.get(id) {
            Some(w) if w.user_id == user_id => {
                webhooks.remove(id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn create_delivery(&self, delivery: WebhookDelivery) -> ExtractResult<()> {
        let mut deliveries = self.deliveries.write().await;
        if deliveries.contains_key(&delivery.id) {
            return Err(ExtractError::unknown(format!(
                "delivery {} already exists",
                delivery.id
            )));
        }
        deliveries.insert(delivery.id.clone(), delivery);
        Ok(())
    }

    async fn claim_due_deliveries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> ExtractResult<Vec<WebhookDelivery>> {
        let mut deliveries = self.deliveries.write().await;
        let mut claimed = Vec::new();
        for delivery in deliveries.values_mut() {
            if claimed.len() >= limit {
                break;
            }
            let due = matches!(
                delivery.status,
                DeliveryStatus::Pending | DeliveryStatus::Retrying
            ) && delivery.next_attempt_at.is_some_and(|at| at <= now);
            if due {
                // Clearing the due time is the claim; other dispatchers no
                // longer see the row as due.
                delivery.next_attempt_at = None;
                claimed.push(delivery.clone());
            }
        }
        Ok(claimed)
    }

    async fn update_delivery(
        &self,
        id: &str,
        expected_attempt: u32,
        patch: DeliveryPatch,
    ) -> ExtractResult<bool> {
        let mut deliveries = self.deliveries.write().await;
        let delivery = deliveries
            .get_mut(id)
            .ok_or_else(|| ExtractError::unknown(format!("delivery {id} not found")))?;

        if delivery.attempt != expected_attempt || delivery.status.is_terminal() {
            return Ok(false);
        }

        if let Some(v) = patch.status {
            delivery.status = v;
        }
        if let Some(v) = patch.response_code {
            delivery.response_code = Some(v);
        }
        if let Some(v) = patch.response_time_ms {
            delivery.response_time_ms = Some(v);
        }
        if let Some(v) = patch.error {
            delivery.error = Some(v);
        }
        if let Some(v) = patch.delivered_at {
            delivery.delivered_at = Some(v);
        }
        Ok(true)
    }

    async fn list_deliveries_for_job(&self, job_id: &str) -> ExtractResult<Vec<WebhookDelivery>> {
        Ok(self
            .deliveries
            .read()
            .await
            .values()
            .filter(|d| d.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn list_deliveries_for_webhook(
        &self,
        webhook_id: &str,
        limit: usize,
        offset: usize,
    ) -> ExtractResult<Vec<WebhookDelivery>> {
        Ok(self
            .deliveries
            .read()
            .await
            .values()
            .filter(|d| d.webhook_id.as_deref() == Some(webhook_id))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}
