//! Crawl worker.
//!
//! Runs the bounded BFS for one crawl job: seed (or sitemap) admission,
//! selector/pattern discovery, a fixed-size worker pool with pacing, the
//! per-page extraction pipeline, and partial-failure accounting. The
//! frontier is capped at `max_urls`; `urls_queued` counts every URL ever
//! admitted and never decreases. A crawl only fails as a whole when its
//! seed page fails; any other page failure is recorded on its result row
//! and the job completes around it.

pub mod discovery;

use crate::aggregate::merge_page_results;
use crate::chain::LlmCandidate;
use crate::error::{ErrorKind, ExtractError, ExtractResult};
use crate::id;
use crate::logging::{log_debug, log_info, log_warn};
use crate::pipeline::{ContentPipeline, FetchMode, PipelineRequest};
use crate::store::{
    ErrorFields, Job, JobPatch, JobResult, JobStore, ResultPatch, ResultStatus,
};
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use url::Url;

// ============================================================================
// Options
// ============================================================================

/// Crawl parameters as accepted on the request, before tier clamping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub follow_selector: Option<String>,
    /// Regex a discovered URL must match to be admitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub follow_pattern: Option<String>,
    /// Depth-preserving successor selector (pagination).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_selector: Option<String>,
    pub max_pages: u32,
    pub max_urls: u32,
    pub max_depth: u32,
    /// Pacing delay between pops, accepted as millis or "500ms"/"2s".
    #[serde(rename = "delay", deserialize_with = "de_delay")]
    pub delay_ms: u64,
    pub concurrency: u32,
    pub same_domain_only: bool,
    /// In sitemap mode, whether the seed URL itself is extracted too.
    pub extract_from_seeds: bool,
    pub use_sitemap: bool,
    pub fetch_mode: FetchMode,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        Self {
            follow_selector: None,
            follow_pattern: None,
            next_selector: None,
            max_pages: 10,
            max_urls: 50,
            max_depth: 1,
            delay_ms: 500,
            concurrency: 3,
            same_domain_only: true,
            extract_from_seeds: false,
            use_sitemap: false,
            fetch_mode: FetchMode::Auto,
        }
    }
}

impl CrawlOptions {
    /// Apply tier clamps. Numeric budgets only shrink; the delay floor only
    /// slows a crawl down.
    pub fn clamped(&self, clamps: &crate::tier::CrawlClamps) -> Self {
        Self {
            max_pages: self.max_pages.min(clamps.max_pages),
            max_urls: self.max_urls.min(clamps.max_urls),
            max_depth: self.max_depth.min(clamps.max_depth),
            delay_ms: self.delay_ms.max(clamps.min_delay_ms),
            concurrency: self.concurrency.clamp(1, clamps.max_concurrency),
            ..self.clone()
        }
    }
}

fn de_delay<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct DelayVisitor;

    impl serde::de::Visitor<'_> for DelayVisitor {
        type Value = u64;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("milliseconds or a duration string like \"500ms\" or \"2s\"")
        }

        fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<u64, E> {
            Ok(v)
        }

        fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<u64, E> {
            u64::try_from(v).map_err(|_| E::custom("delay must be non-negative"))
        }

        fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<u64, E> {
            parse_delay(v).ok_or_else(|| E::custom(format!("invalid delay '{v}'")))
        }
    }

    deserializer.deserialize_any(DelayVisitor)
}

fn parse_delay(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if let Some(ms) = raw.strip_suffix("ms") {
        return ms.trim().parse().ok();
    }
    if let Some(secs) = raw.strip_suffix('s') {
        return secs.trim().parse::<u64>().ok().map(|s| s * 1000);
    }
    raw.parse().ok()
}

// ============================================================================
// Worker
// ============================================================================

/// How long rate-limit hits against one provider stay in the trip window.
const RATE_WINDOW: Duration = Duration::from_secs(60);
/// Hits within the window that trip the permanent candidate switch.
const RATE_TRIP_COUNT: usize = 3;
/// Idle wait while the queue is empty but peers are still in flight.
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Everything the crawl produced, for the job service to persist.
#[derive(Debug)]
pub struct CrawlReport {
    pub pages: u64,
    pub urls_queued: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub llm_cost: f64,
    pub charged_cost: f64,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub seed_failed: bool,
    pub seed_error: Option<ExtractError>,
    pub merged: serde_json::Value,
}

struct QueuedPage {
    result_id: String,
    url: Url,
    parent_url: Option<String>,
    depth: u32,
}

#[derive(Default)]
struct FrontierState {
    queue: VecDeque<QueuedPage>,
    seen: HashSet<String>,
    urls_queued: u64,
    /// Results that reached any terminal state; drives the stop condition.
    pages_done: u64,
    /// Successfully extracted pages; what the job row reports.
    pages_completed: u64,
    in_flight: u32,
    /// First candidate index workers hand to the executor. Only ever
    /// advances; rate-limit tripping moves it past the offending provider.
    start_candidate: usize,
    rate_hits: HashMap<String, VecDeque<Instant>>,
}

#[derive(Default)]
struct StatsState {
    input_tokens: u64,
    output_tokens: u64,
    llm_cost: f64,
    charged_cost: f64,
    provider: Option<String>,
    model: Option<String>,
    seed_failed: bool,
    seed_error: Option<ExtractError>,
}

struct Shared {
    store: Arc<dyn JobStore>,
    pipeline: Arc<ContentPipeline>,
    job: Job,
    options: CrawlOptions,
    candidates: Arc<Vec<LlmCandidate>>,
    seed_host: String,
    follow_pattern: Option<Regex>,
    llm_timeout: Duration,
    cancel: CancellationToken,
    frontier: Mutex<FrontierState>,
    stats: Mutex<StatsState>,
    /// Serializes job-row patches so absolute counter writes stay monotonic.
    job_row: tokio::sync::Mutex<()>,
}

pub struct CrawlWorker {
    store: Arc<dyn JobStore>,
    pipeline: Arc<ContentPipeline>,
    llm_timeout: Duration,
    sitemap_timeout: Duration,
}

impl CrawlWorker {
    pub fn new(store: Arc<dyn JobStore>, pipeline: Arc<ContentPipeline>, llm_timeout: Duration) -> Self {
        Self {
            store,
            pipeline,
            llm_timeout,
            sitemap_timeout: Duration::from_secs(10),
        }
    }

    /// Run one crawl job to exhaustion or cancellation.
    ///
    /// Fatal errors (unparseable seed, storage failure) return `Err`; a
    /// failing seed page is reported through the returned summary.
    pub async fn run(
        &self,
        job: Job,
        candidates: Arc<Vec<LlmCandidate>>,
        cancel: CancellationToken,
    ) -> ExtractResult<CrawlReport> {
        let options = job.crawl.clone().unwrap_or_default();
        let seed = Url::parse(&job.url).map_err(|e| {
            ExtractError::invalid_response(format!("seed URL did not parse: {e}"))
        })?;
        let seed_host = seed.host_str().unwrap_or_default().to_string();

        let follow_pattern = match &options.follow_pattern {
            Some(raw) => Some(Regex::new(raw).map_err(|e| {
                ExtractError::invalid_response(format!("follow_pattern did not compile: {e}"))
            })?),
            None => None,
        };

        let shared = Arc::new(Shared {
            store: self.store.clone(),
            pipeline: self.pipeline.clone(),
            job,
            options: options.clone(),
            candidates,
            seed_host,
            follow_pattern,
            llm_timeout: self.llm_timeout,
            cancel,
            frontier: Mutex::new(FrontierState::default()),
            stats: Mutex::new(StatsState::default()),
            job_row: tokio::sync::Mutex::new(()),
        });

        self.admit_seeds(&shared, &seed).await?;

        let mut workers = Vec::with_capacity(options.concurrency as usize);
        for worker_index in 0..options.concurrency {
            let shared = shared.clone();
            workers.push(tokio::spawn(async move {
                drive(shared, worker_index).await;
            }));
        }
        for worker in workers {
            // A panicked worker should not wedge the crawl.
            if let Err(err) = worker.await {
                log_warn!(error = %err, "Crawl worker task ended abnormally");
            }
        }

        self.skip_leftovers(&shared).await;
        self.build_report(&shared).await
    }

    /// Seed the frontier: sitemap queue, or the seed page itself.
    async fn admit_seeds(&self, shared: &Arc<Shared>, seed: &Url) -> ExtractResult<()> {
        if shared.options.use_sitemap {
            match discovery::sitemap_urls(
                shared.pipeline.fetcher().as_ref(),
                seed,
                self.sitemap_timeout,
            )
            .await
            {
                Ok(urls) if !urls.is_empty() => {
                    let mut batch = Vec::new();
                    if shared.options.extract_from_seeds {
                        batch.push((seed.clone(), None, 0));
                    }
                    for url in urls {
                        batch.push((url, Some(seed.to_string()), 1));
                    }
                    enqueue(shared, batch).await?;
                    return Ok(());
                }
                Ok(_) => {
                    log_warn!(seed = %seed, "Sitemap was empty; falling back to selector discovery");
                }
                Err(err) => {
                    log_warn!(seed = %seed, error = %err, "Sitemap fetch failed; falling back to selector discovery");
                }
            }
        }
        enqueue(shared, vec![(seed.clone(), None, 0)]).await?;
        Ok(())
    }

    /// Anything still queued after the stop condition is marked skipped.
    async fn skip_leftovers(&self, shared: &Arc<Shared>) {
        let leftovers: Vec<QueuedPage> = {
            let mut frontier = shared.frontier.lock().expect("frontier lock poisoned");
            frontier.queue.drain(..).collect()
        };
        for page in leftovers {
            let patch = ResultPatch {
                status: Some(ResultStatus::Skipped),
                ..Default::default()
            };
            match shared
                .store
                .update_result(&page.result_id, ResultStatus::Pending, patch)
                .await
            {
                Ok(true) => {}
                Ok(false) => log_warn!(result_id = %page.result_id, "Leftover row moved under us"),
                Err(err) => log_warn!(result_id = %page.result_id, error = %err, "Failed to skip leftover row"),
            }
        }
    }

    async fn build_report(&self, shared: &Arc<Shared>) -> ExtractResult<CrawlReport> {
        let results = shared.store.list_results(&shared.job.id).await?;
        let pages = results
            .iter()
            .filter(|r| r.status == ResultStatus::Completed)
            .count() as u64;
        let merged_inputs: Vec<serde_json::Value> = results
            .iter()
            .filter(|r| r.status == ResultStatus::Completed)
            .filter_map(|r| r.data.clone())
            .collect();

        let (urls_queued, stats) = {
            let frontier = shared.frontier.lock().expect("frontier lock poisoned");
            let mut stats_guard = shared.stats.lock().expect("stats lock poisoned");
            let stats = StatsState {
                input_tokens: stats_guard.input_tokens,
                output_tokens: stats_guard.output_tokens,
                llm_cost: stats_guard.llm_cost,
                charged_cost: stats_guard.charged_cost,
                provider: stats_guard.provider.take(),
                model: stats_guard.model.take(),
                seed_failed: stats_guard.seed_failed,
                seed_error: stats_guard.seed_error.take(),
            };
            (frontier.urls_queued, stats)
        };

        log_info!(
            job_id = %shared.job.id,
            pages = pages,
            urls_queued = urls_queued,
            seed_failed = stats.seed_failed,
            "Crawl drained"
        );

        Ok(CrawlReport {
            pages,
            urls_queued,
            input_tokens: stats.input_tokens,
            output_tokens: stats.output_tokens,
            llm_cost: stats.llm_cost,
            charged_cost: stats.charged_cost,
            provider: stats.provider,
            model: stats.model,
            seed_failed: stats.seed_failed,
            seed_error: stats.seed_error,
            merged: merge_page_results(&merged_inputs),
        })
    }
}

// ============================================================================
// Frontier operations
// ============================================================================

/// Admit a batch of URLs: dedupe, enforce the frontier cap, create pending
/// result rows, and bump the job's `urls_queued`.
async fn enqueue(
    shared: &Arc<Shared>,
    batch: Vec<(Url, Option<String>, u32)>,
) -> ExtractResult<()> {
    // Reserve under the lock; rows are written before the pages become
    // visible to workers so a pop can never precede its result row.
    let admitted: Vec<QueuedPage> = {
        let mut frontier = shared.frontier.lock().expect("frontier lock poisoned");
        let mut admitted = Vec::new();
        for (url, parent_url, depth) in batch {
            if frontier.urls_queued >= u64::from(shared.options.max_urls) {
                break;
            }
            if !frontier.seen.insert(url.as_str().to_string()) {
                continue;
            }
            frontier.urls_queued += 1;
            admitted.push(QueuedPage {
                result_id: id::new_id(),
                url,
                parent_url,
                depth,
            });
        }
        admitted
    };

    if admitted.is_empty() {
        return Ok(());
    }

    let now = Utc::now();
    for page in &admitted {
        let row = JobResult {
            id: page.result_id.clone(),
            job_id: shared.job.id.clone(),
            url: page.url.to_string(),
            parent_url: page.parent_url.clone(),
            depth: page.depth,
            status: ResultStatus::Pending,
            data: None,
            input_tokens: 0,
            output_tokens: 0,
            fetch_ms: 0,
            extract_ms: 0,
            provider: None,
            model: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        shared.store.append_result(row).await?;
    }

    {
        let mut frontier = shared.frontier.lock().expect("frontier lock poisoned");
        frontier.queue.extend(admitted);
    }

    patch_job_counters(shared).await;
    Ok(())
}

/// Push the frontier counters onto the job row. Serialized so absolute
/// writes cannot regress.
async fn patch_job_counters(shared: &Arc<Shared>) {
    let _guard = shared.job_row.lock().await;
    let (urls_queued, pages_completed) = {
        let frontier = shared.frontier.lock().expect("frontier lock poisoned");
        (frontier.urls_queued, frontier.pages_completed)
    };
    let patch = JobPatch {
        urls_queued: Some(urls_queued),
        page_count: Some(pages_completed),
        ..Default::default()
    };
    if let Err(err) = shared.store.update_job(&shared.job.id, patch).await {
        log_warn!(job_id = %shared.job.id, error = %err, "Failed to update crawl counters");
    }
}

enum NextStep {
    Item(QueuedPage),
    Wait,
    Stop,
}

fn next_step(shared: &Arc<Shared>) -> NextStep {
    let mut frontier = shared.frontier.lock().expect("frontier lock poisoned");
    let budget = u64::from(shared.options.max_pages);
    if frontier.pages_done + u64::from(frontier.in_flight) >= budget {
        return NextStep::Stop;
    }
    match frontier.queue.pop_front() {
        Some(page) => {
            frontier.in_flight += 1;
            NextStep::Item(page)
        }
        None if frontier.in_flight > 0 => NextStep::Wait,
        None => NextStep::Stop,
    }
}

/// One worker of the pool.
async fn drive(shared: Arc<Shared>, worker_index: u32) {
    loop {
        // Cancellation check at the top of every iteration.
        if shared.cancel.is_cancelled() {
            log_debug!(job_id = %shared.job.id, worker = worker_index, "Crawl worker cancelled");
            break;
        }

        let page = match next_step(&shared) {
            NextStep::Item(page) => page,
            NextStep::Wait => {
                tokio::time::sleep(IDLE_POLL).await;
                continue;
            }
            NextStep::Stop => break,
        };

        tokio::time::sleep(Duration::from_millis(shared.options.delay_ms)).await;
        process_page(&shared, page).await;

        {
            let mut frontier = shared.frontier.lock().expect("frontier lock poisoned");
            frontier.pages_done += 1;
            frontier.in_flight -= 1;
        }
        patch_job_counters(&shared).await;
    }

    // A worker that exits while holding an in-flight slot would deadlock
    // peers waiting on the queue; next_step only increments on pop, and
    // process_page always returns, so nothing to release here.
}

async fn process_page(shared: &Arc<Shared>, page: QueuedPage) {
    let moved = shared
        .store
        .update_result(
            &page.result_id,
            ResultStatus::Pending,
            ResultPatch {
                status: Some(ResultStatus::Crawling),
                ..Default::default()
            },
        )
        .await;
    match moved {
        Ok(true) => {}
        Ok(false) => {
            log_warn!(result_id = %page.result_id, "Result row not pending; skipping");
            return;
        }
        Err(err) => {
            log_warn!(result_id = %page.result_id, error = %err, "Failed to mark row crawling");
            return;
        }
    }

    let start_candidate = {
        let frontier = shared.frontier.lock().expect("frontier lock poisoned");
        frontier.start_candidate
    };

    let url_string = page.url.to_string();
    let request = PipelineRequest {
        job_id: &shared.job.id,
        url: &url_string,
        spec: &shared.job.spec,
        fetch_mode: shared.options.fetch_mode,
        cleaner_chain: &[],
        candidates: &shared.candidates,
        capture_debug: shared.job.capture_debug,
        dynamic_allowed: shared.job.limits.features.content_dynamic,
        static_timeout: shared.job.limits.static_fetch_timeout,
        dynamic_timeout: shared.job.limits.dynamic_fetch_timeout,
        llm_timeout: shared.llm_timeout,
        start_candidate,
        cancel: &shared.cancel,
    };

    match shared.pipeline.process(request).await {
        Ok(extraction) => {
            // Discover before the row write so a storage hiccup cannot lose
            // the links.
            if page.depth < shared.options.max_depth || shared.options.next_selector.is_some() {
                let base = Url::parse(&extraction.url).unwrap_or_else(|_| page.url.clone());
                let links = discovery::discover_links(
                    &extraction.raw_content,
                    &base,
                    shared.options.follow_selector.as_deref(),
                    shared.options.next_selector.as_deref(),
                );
                let mut batch = Vec::new();
                if page.depth < shared.options.max_depth {
                    for url in links.follow {
                        if discovery::passes_filters(
                            &url,
                            &shared.seed_host,
                            shared.options.same_domain_only,
                            shared.follow_pattern.as_ref(),
                        ) {
                            batch.push((url, Some(url_string.clone()), page.depth + 1));
                        }
                    }
                }
                for url in links.next {
                    if discovery::passes_filters(
                        &url,
                        &shared.seed_host,
                        shared.options.same_domain_only,
                        shared.follow_pattern.as_ref(),
                    ) {
                        batch.push((url, Some(url_string.clone()), page.depth));
                    }
                }
                if let Err(err) = enqueue(shared, batch).await {
                    log_warn!(job_id = %shared.job.id, error = %err, "Link admission failed");
                }
            }

            let patch = ResultPatch {
                status: Some(ResultStatus::Completed),
                data: Some(extraction.data.clone()),
                input_tokens: Some(extraction.usage.input_tokens),
                output_tokens: Some(extraction.usage.output_tokens),
                fetch_ms: Some(extraction.metadata.fetch_ms),
                extract_ms: Some(extraction.metadata.extract_ms),
                provider: Some(extraction.metadata.provider.clone()),
                model: Some(extraction.metadata.model.clone()),
                error: None,
                ..Default::default()
            };
            if let Err(err) = shared
                .store
                .update_result(&page.result_id, ResultStatus::Crawling, patch)
                .await
            {
                log_warn!(result_id = %page.result_id, error = %err, "Failed to record page result");
            }

            {
                let mut frontier = shared.frontier.lock().expect("frontier lock poisoned");
                frontier.pages_completed += 1;
            }

            let mut stats = shared.stats.lock().expect("stats lock poisoned");
            stats.input_tokens += u64::from(extraction.usage.input_tokens);
            stats.output_tokens += u64::from(extraction.usage.output_tokens);
            stats.llm_cost += extraction.usage.llm_cost;
            stats.charged_cost += extraction.usage.charged_cost;
            if stats.provider.is_none() {
                stats.provider = Some(extraction.metadata.provider.clone());
                stats.model = Some(extraction.metadata.model.clone());
            }
        }
        Err(err) => {
            let patch = ResultPatch {
                status: Some(ResultStatus::Failed),
                provider: err.provider().map(str::to_string),
                model: err.model().map(str::to_string),
                error: Some(ErrorFields::from_error(&err)),
                ..Default::default()
            };
            if let Err(store_err) = shared
                .store
                .update_result(&page.result_id, ResultStatus::Crawling, patch)
                .await
            {
                log_warn!(result_id = %page.result_id, error = %store_err, "Failed to record page failure");
            }

            let rate_limited = matches!(
                err.kind(),
                ErrorKind::RateLimit | ErrorKind::FreeTierRateLimited
            );
            let mut frontier = shared.frontier.lock().expect("frontier lock poisoned");
            if rate_limited {
                let provider = err
                    .provider()
                    .map(str::to_string)
                    .or_else(|| {
                        shared
                            .candidates
                            .get(frontier.start_candidate)
                            .map(|c| c.provider.clone())
                    })
                    .unwrap_or_default();
                record_rate_hit(&mut frontier, &provider, &shared.candidates);
            }
            drop(frontier);

            if page.depth == 0 && page.parent_url.is_none() {
                let mut stats = shared.stats.lock().expect("stats lock poisoned");
                stats.seed_failed = true;
                stats.seed_error = Some(err);
            }
        }
    }
}

/// Count a rate-limit classification against a provider; three hits inside
/// the rolling window move the worker pool past that provider for the rest
/// of the job.
fn record_rate_hit(frontier: &mut FrontierState, provider: &str, candidates: &[LlmCandidate]) {
    let now = Instant::now();
    let hits = frontier.rate_hits.entry(provider.to_string()).or_default();
    hits.push_back(now);
    while hits
        .front()
        .is_some_and(|t| now.duration_since(*t) > RATE_WINDOW)
    {
        hits.pop_front();
    }
    if hits.len() < RATE_TRIP_COUNT {
        return;
    }
    hits.clear();

    let mut idx = frontier.start_candidate;
    while idx < candidates.len() && candidates[idx].provider == provider {
        idx += 1;
    }
    if idx > frontier.start_candidate && idx < candidates.len() {
        log_info!(
            provider = provider,
            from = frontier.start_candidate,
            to = idx,
            "Rate-limit window tripped; switching candidates for the rest of the job"
        );
        frontier.start_candidate = idx;
    }
}
