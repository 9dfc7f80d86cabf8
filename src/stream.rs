//! Synchronous wait and the SSE job stream.
//!
//! Both surfaces turn async jobs into something a caller can sit on: the
//! sync wait polls the store until a terminal state or a hard 120 s cap,
//! and the SSE stream emits typed frames — status ticks, cursor-ordered
//! result events, a final complete — with comment heartbeats every 15 s.
//! Client disconnection cancels only the surface; the job itself runs on.

use crate::error::ExtractResult;
use crate::logging::{log_debug, log_warn};
use crate::store::{Job, JobResult, JobStore};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Hard ceiling on any synchronous wait, whatever the caller asked for.
pub const SYNC_WAIT_CAP: Duration = Duration::from_secs(120);
/// Store poll cadence for both surfaces.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// SSE comment heartbeat cadence.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

// ============================================================================
// Sync wait
// ============================================================================

/// How a bounded synchronous wait ended.
#[derive(Debug)]
pub enum SyncWaitOutcome {
    /// The job reached a terminal state inside the window.
    Terminal(Box<Job>),
    /// The window elapsed; the job continues in the background.
    TimedOut,
    /// The caller went away; the job continues in the background.
    ClientGone,
}

/// Poll the job until terminal, timeout, or client cancellation.
pub async fn sync_wait(
    store: &Arc<dyn JobStore>,
    job_id: &str,
    requested_timeout: Duration,
    client_cancel: &CancellationToken,
) -> ExtractResult<SyncWaitOutcome> {
    let cap = requested_timeout.min(SYNC_WAIT_CAP);
    let deadline = tokio::time::Instant::now() + cap;

    loop {
        if let Some(job) = store.get_job(job_id).await? {
            if job.status.is_terminal() {
                return Ok(SyncWaitOutcome::Terminal(Box::new(job)));
            }
        }
        if tokio::time::Instant::now() >= deadline {
            log_debug!(job_id = %job_id, waited_secs = cap.as_secs(), "Sync wait timed out");
            return Ok(SyncWaitOutcome::TimedOut);
        }
        tokio::select! {
            _ = client_cancel.cancelled() => return Ok(SyncWaitOutcome::ClientGone),
            _ = tokio::time::sleep_until(deadline.min(tokio::time::Instant::now() + POLL_INTERVAL)) => {}
        }
    }
}

// ============================================================================
// SSE frames
// ============================================================================

/// One server-sent-events frame.
#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    Event {
        event: &'static str,
        data: serde_json::Value,
    },
    Comment(&'static str),
}

impl SseFrame {
    /// Standard `event:` / `data:` wire encoding; comments become
    /// `: <text>`.
    pub fn to_wire(&self) -> String {
        match self {
            Self::Event { event, data } => format!("event: {event}\ndata: {data}\n\n"),
            Self::Comment(text) => format!(": {text}\n\n"),
        }
    }

    fn status(job: &Job) -> Self {
        Self::Event {
            event: "status",
            data: json!({
                "job_id": job.id,
                "status": job.status,
                "urls_queued": job.urls_queued,
                "page_count": job.page_count,
            }),
        }
    }

    /// Result frames carry status and error metadata only, never the
    /// extracted data.
    fn result(result: &JobResult) -> Self {
        Self::Event {
            event: "result",
            data: json!({
                "id": result.id,
                "url": result.url,
                "depth": result.depth,
                "status": result.status,
                "error_category": result.error.as_ref().map(|e| e.category),
                "error_message": result.error.as_ref().map(|e| e.message.clone()),
            }),
        }
    }

    fn complete(job: &Job, results_base: &str) -> Self {
        Self::Event {
            event: "complete",
            data: json!({
                "job_id": job.id,
                "status": job.status,
                "page_count": job.page_count,
                "results_url": format!("{results_base}/jobs/{}/results", job.id),
            }),
        }
    }

    fn error(message: &str) -> Self {
        Self::Event {
            event: "error",
            data: json!({ "error_message": message }),
        }
    }
}

// ============================================================================
// The job stream
// ============================================================================

/// Stream configuration; intervals are overridable for tests.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub results_base: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval: POLL_INTERVAL,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            results_base: "/api/v1".to_string(),
        }
    }
}

/// Open the SSE frame stream for a job.
///
/// `cursor` resumes after the last result ID the client saw. The stream
/// ends on job terminal state, client disconnect (receiver drop), or
/// server shutdown; there is no write deadline.
pub fn job_events(
    store: Arc<dyn JobStore>,
    job_id: String,
    cursor: Option<String>,
    config: StreamConfig,
    shutdown: CancellationToken,
) -> ReceiverStream<SseFrame> {
    let (tx, rx) = mpsc::channel::<SseFrame>(32);

    tokio::spawn(async move {
        let mut cursor = cursor;
        let mut last_heartbeat = tokio::time::Instant::now();

        // Initial status frame.
        match store.get_job(&job_id).await {
            Ok(Some(job)) => {
                if tx.send(SseFrame::status(&job)).await.is_err() {
                    return;
                }
            }
            Ok(None) => {
                let _ = tx.send(SseFrame::error("job not found")).await;
                return;
            }
            Err(err) => {
                let _ = tx.send(SseFrame::error(err.message())).await;
                return;
            }
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    log_debug!(job_id = %job_id, "Stream closed by shutdown");
                    return;
                }
                _ = tokio::time::sleep(config.poll_interval) => {}
            }

            // Drain new result rows in cursor order. IDs are time-ordered,
            // so the cursor never regresses and no row repeats.
            match store
                .list_results_after(&job_id, cursor.as_deref(), 100)
                .await
            {
                Ok(rows) => {
                    for row in rows {
                        if tx.send(SseFrame::result(&row)).await.is_err() {
                            return;
                        }
                        cursor = Some(row.id);
                    }
                }
                Err(err) => {
                    log_warn!(job_id = %job_id, error = %err, "Result poll failed");
                    if tx.send(SseFrame::error(err.message())).await.is_err() {
                        return;
                    }
                }
            }

            match store.get_job(&job_id).await {
                Ok(Some(job)) => {
                    if tx.send(SseFrame::status(&job)).await.is_err() {
                        return;
                    }
                    if job.status.is_terminal() {
                        let _ = tx
                            .send(SseFrame::complete(&job, &config.results_base))
                            .await;
                        return;
                    }
                }
                Ok(None) => {
                    let _ = tx.send(SseFrame::error("job row disappeared")).await;
                    return;
                }
                Err(err) => {
                    if tx.send(SseFrame::error(err.message())).await.is_err() {
                        return;
                    }
                }
            }

            if last_heartbeat.elapsed() >= config.heartbeat_interval {
                if tx.send(SseFrame::Comment("heartbeat")).await.is_err() {
                    return;
                }
                last_heartbeat = tokio::time::Instant::now();
            }
        }
    });

    ReceiverStream::new(rx)
}
