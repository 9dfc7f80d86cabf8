//! Job lifecycle service.
//!
//! Owns the durable state machine for extract, analyze, and crawl jobs:
//! admission, candidate materialization, execution, cost posting, terminal
//! transitions, and webhook fan-out. Every job passes admission before a
//! row exists; every terminal transition releases the admission slot
//! exactly once and freezes the row's counters.

pub mod admission;

pub use admission::{AdmissionController, AdmissionTicket, RequestedFeatures};

use crate::analyze::{PageAnalysis, PageAnalyzer};
use crate::api::{
    AnalyzeRequest, CrawlMapEntry, CrawlRequest, DeliveryView, ExtractRequest, ExtractResponse,
    ResponseMetadata, ResultView, WebhookUpsertRequest, WebhookView,
};
use crate::chain::{ChainResolver, FallbackChain, LlmCandidate};
use crate::credentials::{CredentialCipher, CredentialStore, CredentialView};
use crate::crawl::CrawlWorker;
use crate::error::{ExtractError, ExtractResult};
use crate::id;
use crate::logging::{log_info, log_warn};
use crate::pipeline::{ContentPipeline, FetchMode, PageExtraction, PipelineRequest};
use crate::providers::is_premium_model;
use crate::store::{
    ErrorFields, EventKind, Job, JobKind, JobPatch, JobResult, JobStatus, JobStore, ResultStatus,
    Webhook, WebhookPatch,
};
use crate::tier::UserContext;
use crate::webhooks::WebhookEngine;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct JobService {
    store: Arc<dyn JobStore>,
    pipeline: Arc<ContentPipeline>,
    resolver: Arc<ChainResolver>,
    admission: Arc<AdmissionController>,
    webhooks: Arc<WebhookEngine>,
    crawler: Arc<CrawlWorker>,
    analyzer: Arc<PageAnalyzer>,
    credentials: Arc<CredentialStore>,
    cipher: Arc<CredentialCipher>,
    llm_timeout: Duration,
    /// Cancellation tokens for live jobs; removed at terminal state.
    running: DashMap<String, CancellationToken>,
}

impl JobService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn JobStore>,
        pipeline: Arc<ContentPipeline>,
        resolver: Arc<ChainResolver>,
        admission: Arc<AdmissionController>,
        webhooks: Arc<WebhookEngine>,
        crawler: Arc<CrawlWorker>,
        analyzer: Arc<PageAnalyzer>,
        credentials: Arc<CredentialStore>,
        cipher: Arc<CredentialCipher>,
        llm_timeout: Duration,
    ) -> Self {
        Self {
            store,
            pipeline,
            resolver,
            admission,
            webhooks,
            crawler,
            analyzer,
            credentials,
            cipher,
            llm_timeout,
            running: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    // ========================================================================
    // Single-page extract
    // ========================================================================

    /// `POST /extract`: admit, create, and run one extraction to completion.
    pub async fn run_extract(
        &self,
        user: &UserContext,
        request: ExtractRequest,
        claims_chain: Option<&FallbackChain>,
    ) -> ExtractResult<ExtractResponse> {
        let spec = request.extraction_spec()?;
        let requested = requested_features(
            request.fetch_mode,
            request.llm_config.as_ref().map(|c| (c, c.api_key.is_some())),
        );
        let ticket = self.admission.admit(user, requested)?;

        let candidates =
            match self
                .resolver
                .resolve(user, request.llm_config.as_ref(), claims_chain)
            {
                Ok(candidates) => candidates,
                Err(err) => {
                    self.admission.finish(&ticket, 0.0);
                    return Err(err);
                }
            };
        let is_byok = candidates[0].is_byok;

        let fetch_mode = request.fetch_mode.unwrap_or_default();
        let job = self.new_job(user, JobKind::Extract, &request.url, spec, fetch_mode, request.capture_debug, is_byok, None);
        let job_id = job.id.clone();
        if let Err(err) = self.store.create_job(job.clone()).await {
            self.admission.finish(&ticket, 0.0);
            return Err(err);
        }
        self.webhooks.register_request_subscribers(
            &job_id,
            request.webhook.clone(),
            request.webhook_url.clone(),
        );

        let cancel = CancellationToken::new();
        self.running.insert(job_id.clone(), cancel.clone());

        let started = self
            .store
            .update_job(
                &job_id,
                JobPatch {
                    status: Some(JobStatus::Running),
                    started_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await;
        if let Err(err) = started {
            self.finish_failed(&job_id, &ticket, &err).await;
            return Err(err);
        }

        let pipeline_request = PipelineRequest {
            job_id: &job_id,
            url: &request.url,
            spec: &job.spec,
            fetch_mode,
            cleaner_chain: &request.cleaner_chain,
            candidates: &candidates,
            capture_debug: request.capture_debug,
            dynamic_allowed: user.limits.features.content_dynamic,
            static_timeout: user.limits.static_fetch_timeout,
            dynamic_timeout: user.limits.dynamic_fetch_timeout,
            llm_timeout: self.llm_timeout,
            start_candidate: 0,
            cancel: &cancel,
        };

        match self.pipeline.process(pipeline_request).await {
            Ok(extraction) => {
                if let Err(err) = self
                    .record_extract_success(&job_id, &ticket, &extraction)
                    .await
                {
                    self.finish_failed(&job_id, &ticket, &err).await;
                    return Err(err);
                }
                Ok(ExtractResponse {
                    job_id,
                    data: extraction.data,
                    usage: extraction.usage,
                    metadata: ResponseMetadata {
                        fetch_ms: extraction.metadata.fetch_ms,
                        extract_ms: extraction.metadata.extract_ms,
                        provider: extraction.metadata.provider,
                        model: extraction.metadata.model,
                        input_format: extraction.input_format,
                    },
                })
            }
            Err(err) => {
                self.finish_failed(&job_id, &ticket, &err).await;
                Err(err)
            }
        }
    }

    async fn record_extract_success(
        &self,
        job_id: &str,
        ticket: &AdmissionTicket,
        extraction: &PageExtraction,
    ) -> ExtractResult<()> {
        let now = Utc::now();
        let row = JobResult {
            id: id::new_id(),
            job_id: job_id.to_string(),
            url: extraction.url.clone(),
            parent_url: None,
            depth: 0,
            status: ResultStatus::Completed,
            data: Some(extraction.data.clone()),
            input_tokens: extraction.usage.input_tokens,
            output_tokens: extraction.usage.output_tokens,
            fetch_ms: extraction.metadata.fetch_ms,
            extract_ms: extraction.metadata.extract_ms,
            provider: Some(extraction.metadata.provider.clone()),
            model: Some(extraction.metadata.model.clone()),
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.store.append_result(row).await?;

        let job = self
            .store
            .update_job(
                job_id,
                JobPatch {
                    status: Some(JobStatus::Completed),
                    completed_at: Some(now),
                    page_count: Some(1),
                    input_tokens: Some(u64::from(extraction.usage.input_tokens)),
                    output_tokens: Some(u64::from(extraction.usage.output_tokens)),
                    charged_cost: Some(extraction.usage.charged_cost),
                    llm_cost: Some(extraction.usage.llm_cost),
                    provider: Some(extraction.metadata.provider.clone()),
                    model: Some(extraction.metadata.model.clone()),
                    merged_result: Some(extraction.data.clone()),
                    ..Default::default()
                },
            )
            .await?;

        self.admission.finish(ticket, extraction.usage.charged_cost);
        self.running.remove(job_id);
        if let Err(err) = self.webhooks.enqueue_event(&job, EventKind::JobCompleted).await {
            log_warn!(job_id = %job_id, error = %err, "Webhook enqueue failed");
        }
        Ok(())
    }

    /// Write a failed terminal state and release the admission slot.
    async fn finish_failed(&self, job_id: &str, ticket: &AdmissionTicket, err: &ExtractError) {
        let patch = JobPatch {
            status: Some(JobStatus::Failed),
            completed_at: Some(Utc::now()),
            provider: err.provider().map(str::to_string),
            model: err.model().map(str::to_string),
            error: Some(ErrorFields::from_error(err)),
            ..Default::default()
        };
        match self.store.update_job(job_id, patch).await {
            Ok(job) => {
                if let Err(hook_err) = self.webhooks.enqueue_event(&job, EventKind::JobFailed).await
                {
                    log_warn!(job_id = %job_id, error = %hook_err, "Webhook enqueue failed");
                }
            }
            Err(store_err) => {
                log_warn!(job_id = %job_id, error = %store_err, "Failed to record job failure")
            }
        }
        self.admission.finish(ticket, 0.0);
        self.running.remove(job_id);
    }

    // ========================================================================
    // Crawl
    // ========================================================================

    /// `POST /crawl`: admit, create the parent job, and hand off to the
    /// crawl worker in the background. Returns the pending job row.
    pub async fn submit_crawl(
        self: &Arc<Self>,
        user: &UserContext,
        request: CrawlRequest,
        claims_chain: Option<&FallbackChain>,
    ) -> ExtractResult<Job> {
        let spec = request.extract.extraction_spec()?;
        let explicit_dynamic = request.options.fetch_mode == FetchMode::Dynamic
            || request.extract.fetch_mode == Some(FetchMode::Dynamic);
        let mut requested = requested_features(
            request.extract.fetch_mode,
            request
                .extract
                .llm_config
                .as_ref()
                .map(|c| (c, c.api_key.is_some())),
        );
        requested.dynamic_fetch = requested.dynamic_fetch || explicit_dynamic;
        let ticket = self.admission.admit(user, requested)?;

        let candidates = match self.resolver.resolve(
            user,
            request.extract.llm_config.as_ref(),
            claims_chain,
        ) {
            Ok(candidates) => candidates,
            Err(err) => {
                self.admission.finish(&ticket, 0.0);
                return Err(err);
            }
        };
        let is_byok = candidates[0].is_byok;

        let options = request.options.clamped(&user.limits.crawl);
        let job = self.new_job(
            user,
            JobKind::Crawl,
            &request.extract.url,
            spec,
            options.fetch_mode,
            request.extract.capture_debug,
            is_byok,
            Some(options),
        );
        if let Err(err) = self.store.create_job(job.clone()).await {
            self.admission.finish(&ticket, 0.0);
            return Err(err);
        }
        self.webhooks.register_request_subscribers(
            &job.id,
            request.extract.webhook.clone(),
            request.extract.webhook_url.clone(),
        );

        let cancel = CancellationToken::new();
        self.running.insert(job.id.clone(), cancel.clone());

        let service = self.clone();
        let spawned_job = job.clone();
        let candidates = Arc::new(candidates);
        tokio::spawn(async move {
            service
                .drive_crawl(spawned_job, candidates, ticket, cancel)
                .await;
        });

        Ok(job)
    }

    async fn drive_crawl(
        self: Arc<Self>,
        job: Job,
        candidates: Arc<Vec<LlmCandidate>>,
        ticket: AdmissionTicket,
        cancel: CancellationToken,
    ) {
        let job_id = job.id.clone();

        // Cancelled before the running transition is the one window where
        // the cancelled terminal state applies straight from pending.
        if cancel.is_cancelled() {
            let patch = JobPatch {
                status: Some(JobStatus::Cancelled),
                completed_at: Some(Utc::now()),
                ..Default::default()
            };
            if let Err(err) = self.store.update_job(&job_id, patch).await {
                log_warn!(job_id = %job_id, error = %err, "Failed to record cancellation");
            }
            self.admission.finish(&ticket, 0.0);
            self.running.remove(&job_id);
            return;
        }

        let running = self
            .store
            .update_job(
                &job_id,
                JobPatch {
                    status: Some(JobStatus::Running),
                    started_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await;
        let running_job = match running {
            Ok(job) => job,
            Err(err) => {
                log_warn!(job_id = %job_id, error = %err, "Failed to mark crawl running");
                self.admission.finish(&ticket, 0.0);
                self.running.remove(&job_id);
                return;
            }
        };
        if let Err(err) = self
            .webhooks
            .enqueue_event(&running_job, EventKind::JobStarted)
            .await
        {
            log_warn!(job_id = %job_id, error = %err, "Webhook enqueue failed");
        }

        match self
            .crawler
            .run(running_job, candidates, cancel.clone())
            .await
        {
            Ok(report) => {
                let (status, event, error) = if cancel.is_cancelled() {
                    (JobStatus::Cancelled, None, None)
                } else if report.seed_failed {
                    let err = report.seed_error.clone().unwrap_or_else(|| {
                        ExtractError::unknown("seed page failed")
                    });
                    (
                        JobStatus::Failed,
                        Some(EventKind::JobFailed),
                        Some(ErrorFields::from_error(&err)),
                    )
                } else {
                    (JobStatus::Completed, Some(EventKind::JobCompleted), None)
                };

                let merged = (status == JobStatus::Completed).then(|| report.merged.clone());
                let patch = JobPatch {
                    status: Some(status),
                    started_at: None,
                    completed_at: Some(Utc::now()),
                    urls_queued: Some(report.urls_queued),
                    page_count: Some(report.pages),
                    input_tokens: Some(report.input_tokens),
                    output_tokens: Some(report.output_tokens),
                    charged_cost: Some(report.charged_cost),
                    llm_cost: Some(report.llm_cost),
                    provider: report.provider.clone(),
                    model: report.model.clone(),
                    error,
                    merged_result: merged,
                };
                match self.store.update_job(&job_id, patch).await {
                    Ok(updated) => {
                        self.admission.finish(&ticket, report.charged_cost);
                        if let Some(event) = event {
                            if let Err(err) = self.webhooks.enqueue_event(&updated, event).await {
                                log_warn!(job_id = %job_id, error = %err, "Webhook enqueue failed");
                            }
                        }
                        log_info!(
                            job_id = %job_id,
                            status = ?updated.status,
                            pages = report.pages,
                            charged_cost = report.charged_cost,
                            "Crawl finished"
                        );
                    }
                    Err(err) => {
                        log_warn!(job_id = %job_id, error = %err, "Failed to record crawl outcome");
                        self.admission.finish(&ticket, 0.0);
                    }
                }
            }
            Err(err) => {
                self.finish_failed(&job_id, &ticket, &err).await;
                return;
            }
        }
        self.running.remove(&job_id);
    }

    // ========================================================================
    // Analyze
    // ========================================================================

    /// `POST /analyze`: fetch the page and produce detected elements, a
    /// suggested schema, and follow candidates.
    pub async fn run_analyze(
        &self,
        user: &UserContext,
        request: AnalyzeRequest,
    ) -> ExtractResult<(String, PageAnalysis)> {
        let requested = RequestedFeatures {
            dynamic_fetch: request.fetch_mode == Some(FetchMode::Dynamic),
            ..Default::default()
        };
        let ticket = self.admission.admit(user, requested)?;

        let fetch_mode = request.fetch_mode.unwrap_or_default();
        let job = self.new_job(
            user,
            JobKind::Analyze,
            &request.url,
            crate::pipeline::ExtractionSpec::Prompt("page structure analysis".to_string()),
            fetch_mode,
            request.debug,
            false,
            None,
        );
        let job_id = job.id.clone();
        if let Err(err) = self.store.create_job(job).await {
            self.admission.finish(&ticket, 0.0);
            return Err(err);
        }

        if let Err(err) = self
            .store
            .update_job(
                &job_id,
                JobPatch {
                    status: Some(JobStatus::Running),
                    started_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
        {
            self.admission.finish(&ticket, 0.0);
            return Err(err);
        }

        match self
            .analyzer
            .analyze(&request.url, fetch_mode, &user.limits)
            .await
        {
            Ok(analysis) => {
                let patch = JobPatch {
                    status: Some(JobStatus::Completed),
                    completed_at: Some(Utc::now()),
                    page_count: Some(1),
                    ..Default::default()
                };
                if let Err(err) = self.store.update_job(&job_id, patch).await {
                    log_warn!(job_id = %job_id, error = %err, "Failed to record analysis outcome");
                }
                self.admission.finish(&ticket, 0.0);
                Ok((job_id, analysis))
            }
            Err(err) => {
                self.finish_failed(&job_id, &ticket, &err).await;
                Err(err)
            }
        }
    }

    // ========================================================================
    // Cancellation and reads
    // ========================================================================

    /// Administrative stop. The job's workers observe the token at their
    /// next suspension point.
    pub async fn cancel_job(&self, user: &UserContext, job_id: &str) -> ExtractResult<bool> {
        let Some(_) = self.store.get_job_for_user(&user.user_id, job_id).await? else {
            return Ok(false);
        };
        match self.running.get(job_id) {
            Some(token) => {
                token.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn job_view(
        &self,
        user: &UserContext,
        job_id: &str,
    ) -> ExtractResult<Option<crate::api::JobView>> {
        Ok(self
            .store
            .get_job_for_user(&user.user_id, job_id)
            .await?
            .map(|job| crate::api::JobView::from_job(&job)))
    }

    pub async fn list_jobs(
        &self,
        user: &UserContext,
        limit: usize,
        offset: usize,
    ) -> ExtractResult<Vec<crate::api::JobView>> {
        Ok(self
            .store
            .list_jobs(&user.user_id, limit, offset)
            .await?
            .iter()
            .map(crate::api::JobView::from_job)
            .collect())
    }

    /// `GET /jobs/{id}/results`, optionally merged through the aggregator.
    pub async fn results(
        &self,
        user: &UserContext,
        job_id: &str,
        merge: bool,
    ) -> ExtractResult<Option<serde_json::Value>> {
        let Some(job) = self.store.get_job_for_user(&user.user_id, job_id).await? else {
            return Ok(None);
        };
        let rows = self.store.list_results(job_id).await?;
        if merge {
            if let Some(merged) = &job.merged_result {
                return Ok(Some(merged.clone()));
            }
            let inputs: Vec<serde_json::Value> = rows
                .iter()
                .filter(|r| r.status == ResultStatus::Completed)
                .filter_map(|r| r.data.clone())
                .collect();
            return Ok(Some(crate::aggregate::merge_page_results(&inputs)));
        }
        let views: Vec<ResultView> = rows
            .iter()
            .map(|r| ResultView::from_result(r, job.is_byok))
            .collect();
        Ok(Some(serde_json::json!({ "results": views })))
    }

    /// `GET /jobs/{id}/crawl-map`.
    pub async fn crawl_map(
        &self,
        user: &UserContext,
        job_id: &str,
    ) -> ExtractResult<Option<Vec<CrawlMapEntry>>> {
        let Some(_) = self.store.get_job_for_user(&user.user_id, job_id).await? else {
            return Ok(None);
        };
        let rows = self.store.list_results(job_id).await?;
        Ok(Some(rows.iter().map(CrawlMapEntry::from_result).collect()))
    }

    /// `GET /jobs/{id}/webhooks`.
    pub async fn job_deliveries(
        &self,
        user: &UserContext,
        job_id: &str,
    ) -> ExtractResult<Option<Vec<DeliveryView>>> {
        let Some(_) = self.store.get_job_for_user(&user.user_id, job_id).await? else {
            return Ok(None);
        };
        let rows = self.store.list_deliveries_for_job(job_id).await?;
        Ok(Some(rows.iter().map(DeliveryView::from_delivery).collect()))
    }

    // ========================================================================
    // Webhook CRUD
    // ========================================================================

    pub async fn create_webhook(
        &self,
        user: &UserContext,
        request: WebhookUpsertRequest,
    ) -> ExtractResult<WebhookView> {
        let secret_encrypted = match &request.secret {
            Some(secret) => Some(self.cipher.encrypt(secret.as_bytes())?),
            None => None,
        };
        let now = Utc::now();
        let webhook = Webhook {
            id: id::new_id(),
            user_id: user.user_id.clone(),
            name: request.name,
            url: request.url,
            secret_encrypted,
            events: request.events,
            headers: request.headers,
            active: request.active,
            created_at: now,
            updated_at: now,
        };
        self.store.create_webhook(webhook.clone()).await?;
        Ok(WebhookView::from_webhook(&webhook))
    }

    pub async fn list_webhooks(&self, user: &UserContext) -> ExtractResult<Vec<WebhookView>> {
        Ok(self
            .store
            .list_webhooks(&user.user_id)
            .await?
            .iter()
            .map(WebhookView::from_webhook)
            .collect())
    }

    pub async fn update_webhook(
        &self,
        user: &UserContext,
        webhook_id: &str,
        request: WebhookUpsertRequest,
    ) -> ExtractResult<WebhookView> {
        let secret_encrypted = match &request.secret {
            Some(secret) => Some(Some(self.cipher.encrypt(secret.as_bytes())?)),
            None => None,
        };
        let patch = WebhookPatch {
            name: Some(request.name),
            url: Some(request.url),
            secret_encrypted,
            events: Some(request.events),
            headers: Some(request.headers),
            active: Some(request.active),
        };
        let updated = self
            .store
            .update_webhook(&user.user_id, webhook_id, patch)
            .await?;
        Ok(WebhookView::from_webhook(&updated))
    }

    pub async fn delete_webhook(&self, user: &UserContext, webhook_id: &str) -> ExtractResult<bool> {
        self.store.delete_webhook(&user.user_id, webhook_id).await
    }

    pub async fn webhook_deliveries(
        &self,
        user: &UserContext,
        webhook_id: &str,
        limit: usize,
        offset: usize,
    ) -> ExtractResult<Option<Vec<DeliveryView>>> {
        let Some(_) = self.store.get_webhook(&user.user_id, webhook_id).await? else {
            return Ok(None);
        };
        let rows = self
            .store
            .list_deliveries_for_webhook(webhook_id, limit, offset)
            .await?;
        Ok(Some(rows.iter().map(DeliveryView::from_delivery).collect()))
    }

    // ========================================================================
    // LLM chain and key surfaces
    // ========================================================================

    /// `GET /llm/chain`.
    pub fn user_chain(&self, user: &UserContext) -> FallbackChain {
        self.resolver.user_chain(&user.user_id).unwrap_or_default()
    }

    /// `PUT /llm/chain`.
    pub fn put_user_chain(&self, user: &UserContext, chain: FallbackChain) -> ExtractResult<()> {
        if !user.features().models_custom {
            return Err(ExtractError::tier_feature_disabled(
                "custom fallback chains are not available on this tier",
            ));
        }
        self.resolver.set_user_chain(&user.user_id, chain);
        Ok(())
    }

    /// `PUT /llm/keys`.
    pub fn upsert_key(
        &self,
        user: &UserContext,
        request: crate::api::KeyUpsertRequest,
    ) -> ExtractResult<()> {
        if !user.features().provider_byok {
            return Err(ExtractError::tier_feature_disabled(
                "bring-your-own-key is not available on this tier",
            ));
        }
        self.credentials.upsert(
            &request.provider,
            Some(&user.user_id),
            &request.api_key,
            request.base_url,
        )
    }

    /// `GET /llm/keys`.
    pub fn list_keys(&self, user: &UserContext) -> Vec<CredentialView> {
        self.credentials.list(Some(&user.user_id))
    }

    /// `DELETE /llm/keys/{provider}`.
    pub fn delete_key(&self, user: &UserContext, provider: &str) -> bool {
        self.credentials.delete(provider, Some(&user.user_id))
    }

    // ========================================================================
    // Internals
    // ========================================================================

    #[allow(clippy::too_many_arguments)]
    fn new_job(
        &self,
        user: &UserContext,
        kind: JobKind,
        url: &str,
        spec: crate::pipeline::ExtractionSpec,
        fetch_mode: FetchMode,
        capture_debug: bool,
        is_byok: bool,
        crawl: Option<crate::crawl::CrawlOptions>,
    ) -> Job {
        let now = Utc::now();
        Job {
            id: id::new_id(),
            user_id: user.user_id.clone(),
            kind,
            status: JobStatus::Pending,
            url: url.to_string(),
            spec,
            fetch_mode,
            capture_debug,
            tier: user.tier,
            limits: user.limits.clone(),
            is_byok,
            crawl,
            urls_queued: 0,
            page_count: 0,
            input_tokens: 0,
            output_tokens: 0,
            charged_cost: 0.0,
            llm_cost: 0.0,
            provider: None,
            model: None,
            error: None,
            merged_result: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }
}

/// Derive the admission feature set from the request shape.
fn requested_features(
    fetch_mode: Option<FetchMode>,
    llm_override: Option<(&crate::chain::resolver::RequestLlmOverride, bool)>,
) -> RequestedFeatures {
    let mut requested = RequestedFeatures {
        dynamic_fetch: fetch_mode == Some(FetchMode::Dynamic),
        ..Default::default()
    };
    if let Some((config, has_key)) = llm_override {
        requested.byok = has_key;
        requested.premium_model = is_premium_model(&config.provider, &config.model);
    }
    requested
}
