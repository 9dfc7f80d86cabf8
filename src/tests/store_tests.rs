//! Memory store contract tests: the job state machine, terminal freezing,
//! append-only results, optimistic updates, and cursor listings.

use crate::crawl::CrawlOptions;
use crate::id;
use crate::pipeline::{ExtractionSpec, FetchMode};
use crate::store::{
    DeliveryPatch, DeliveryStatus, EventKind, Job, JobPatch, JobResult, JobStatus, JobStore,
    MemoryJobStore, ResultPatch, ResultStatus, WebhookDelivery,
};
use crate::tier::Tier;
use chrono::Utc;
use serde_json::json;

fn job(user_id: &str) -> Job {
    let now = Utc::now();
    Job {
        id: id::new_id(),
        user_id: user_id.to_string(),
        kind: crate::store::JobKind::Crawl,
        status: JobStatus::Pending,
        url: "https://ex.test/seed".to_string(),
        spec: ExtractionSpec::Prompt("extract".to_string()),
        fetch_mode: FetchMode::Auto,
        capture_debug: false,
        tier: Tier::Pro,
        limits: Tier::Pro.default_limits(),
        is_byok: false,
        crawl: Some(CrawlOptions::default()),
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

fn result_row(job_id: &str, depth: u32, parent: Option<&str>) -> JobResult {
    let now = Utc::now();
    JobResult {
        id: id::new_id(),
        job_id: job_id.to_string(),
        url: format!("https://ex.test/{depth}"),
        parent_url: parent.map(str::to_string),
        depth,
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
    }
}

fn delivery(job_id: &str, attempt: u32) -> WebhookDelivery {
    WebhookDelivery {
        id: id::new_id(),
        job_id: job_id.to_string(),
        webhook_id: None,
        event: EventKind::JobCompleted,
        url: "https://hooks.test/in".to_string(),
        attempt,
        status: DeliveryStatus::Pending,
        response_code: None,
        response_time_ms: None,
        error: None,
        next_attempt_at: Some(Utc::now()),
        created_at: Utc::now(),
        delivered_at: None,
    }
}

#[tokio::test]
async fn status_transitions_follow_the_state_machine() {
    let store = MemoryJobStore::new();
    let row = job("u1");
    let id = row.id.clone();
    store.create_job(row).await.unwrap();

    // pending -> completed is illegal; must pass through running.
    let skip = store
        .update_job(
            &id,
            JobPatch {
                status: Some(JobStatus::Completed),
                ..Default::default()
            },
        )
        .await;
    assert!(skip.is_err());

    let running = store
        .update_job(
            &id,
            JobPatch {
                status: Some(JobStatus::Running),
                started_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(running.status, JobStatus::Running);

    // running -> pending is a backward move.
    let backward = store
        .update_job(
            &id,
            JobPatch {
                status: Some(JobStatus::Running),
                ..Default::default()
            },
        )
        .await;
    assert!(backward.is_err());

    let done = store
        .update_job(
            &id,
            JobPatch {
                status: Some(JobStatus::Completed),
                completed_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(done.status, JobStatus::Completed);

    // Terminal rows are frozen entirely.
    let frozen = store
        .update_job(
            &id,
            JobPatch {
                urls_queued: Some(9),
                ..Default::default()
            },
        )
        .await;
    assert!(frozen.is_err());
}

#[tokio::test]
async fn pending_jobs_may_cancel_directly() {
    let store = MemoryJobStore::new();
    let row = job("u1");
    let id = row.id.clone();
    store.create_job(row).await.unwrap();

    let cancelled = store
        .update_job(
            &id,
            JobPatch {
                status: Some(JobStatus::Cancelled),
                completed_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
}

#[tokio::test]
async fn results_are_append_only_while_running() {
    let store = MemoryJobStore::new();
    let row = job("u1");
    let id = row.id.clone();
    store.create_job(row).await.unwrap();
    store
        .update_job(
            &id,
            JobPatch {
                status: Some(JobStatus::Running),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    store
        .append_result(result_row(&id, 0, None))
        .await
        .unwrap();

    store
        .update_job(
            &id,
            JobPatch {
                status: Some(JobStatus::Completed),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Appending under a terminal job is rejected.
    let late = store.append_result(result_row(&id, 1, Some("seed"))).await;
    assert!(late.is_err());
}

#[tokio::test]
async fn result_updates_are_optimistic_on_status() {
    let store = MemoryJobStore::new();
    let parent = job("u1");
    let job_id = parent.id.clone();
    store.create_job(parent).await.unwrap();
    let row = result_row(&job_id, 0, None);
    let result_id = row.id.clone();
    store.append_result(row).await.unwrap();

    let claimed = store
        .update_result(
            &result_id,
            ResultStatus::Pending,
            ResultPatch {
                status: Some(ResultStatus::Crawling),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(claimed);

    // A second writer with the stale expectation loses.
    let stale = store
        .update_result(
            &result_id,
            ResultStatus::Pending,
            ResultPatch {
                status: Some(ResultStatus::Skipped),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!stale);

    let finished = store
        .update_result(
            &result_id,
            ResultStatus::Crawling,
            ResultPatch {
                status: Some(ResultStatus::Completed),
                data: Some(json!({"ok": true})),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(finished);
}

#[tokio::test]
async fn cursor_listing_resumes_in_id_order() {
    let store = MemoryJobStore::new();
    let parent = job("u1");
    let job_id = parent.id.clone();
    store.create_job(parent).await.unwrap();

    let mut ids = Vec::new();
    for depth in 0..5 {
        let row = result_row(&job_id, depth, (depth > 0).then_some("seed"));
        ids.push(row.id.clone());
        store.append_result(row).await.unwrap();
    }

    let all = store.list_results_after(&job_id, None, 100).await.unwrap();
    assert_eq!(
        all.iter().map(|r| r.id.clone()).collect::<Vec<_>>(),
        ids,
        "listing order must match creation order"
    );

    // Resume after the second row.
    let rest = store
        .list_results_after(&job_id, Some(&ids[1]), 100)
        .await
        .unwrap();
    assert_eq!(
        rest.iter().map(|r| r.id.clone()).collect::<Vec<_>>(),
        ids[2..].to_vec()
    );

    let limited = store
        .list_results_after(&job_id, None, 2)
        .await
        .unwrap();
    assert_eq!(limited.len(), 2);
}

#[tokio::test]
async fn delivery_claims_are_exclusive() {
    let store = MemoryJobStore::new();
    let parent = job("u1");
    let job_id = parent.id.clone();
    store.create_job(parent).await.unwrap();

    let row = delivery(&job_id, 1);
    let delivery_id = row.id.clone();
    store.create_delivery(row).await.unwrap();

    let first = store
        .claim_due_deliveries(Utc::now(), 10)
        .await
        .unwrap();
    assert_eq!(first.len(), 1);

    // The claim cleared the due time; a second round sees nothing.
    let second = store.claim_due_deliveries(Utc::now(), 10).await.unwrap();
    assert!(second.is_empty());

    // Outcome update keyed by (id, attempt).
    let recorded = store
        .update_delivery(
            &delivery_id,
            1,
            DeliveryPatch {
                status: Some(DeliveryStatus::Success),
                response_code: Some(200),
                delivered_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(recorded);

    // Terminal rows reject further writes, and attempt mismatches lose.
    let again = store
        .update_delivery(&delivery_id, 1, DeliveryPatch::default())
        .await
        .unwrap();
    assert!(!again);
}

#[tokio::test]
async fn future_deliveries_are_not_due() {
    let store = MemoryJobStore::new();
    let parent = job("u1");
    let job_id = parent.id.clone();
    store.create_job(parent).await.unwrap();

    let mut row = delivery(&job_id, 2);
    row.status = DeliveryStatus::Retrying;
    row.next_attempt_at = Some(Utc::now() + chrono::Duration::seconds(300));
    store.create_delivery(row).await.unwrap();

    assert!(store
        .claim_due_deliveries(Utc::now(), 10)
        .await
        .unwrap()
        .is_empty());
    let later = Utc::now() + chrono::Duration::seconds(301);
    assert_eq!(store.claim_due_deliveries(later, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn webhook_names_are_unique_per_user() {
    let store = MemoryJobStore::new();
    let now = Utc::now();
    let make = |id: &str, user: &str, name: &str| crate::store::Webhook {
        id: id.to_string(),
        user_id: user.to_string(),
        name: name.to_string(),
        url: "https://hooks.test/in".to_string(),
        secret_encrypted: None,
        events: None,
        headers: Default::default(),
        active: true,
        created_at: now,
        updated_at: now,
    };

    store.create_webhook(make("w1", "u1", "ci")).await.unwrap();
    // Same name, same user: rejected.
    assert!(store.create_webhook(make("w2", "u1", "ci")).await.is_err());
    // Same name, different user: fine.
    store.create_webhook(make("w3", "u2", "ci")).await.unwrap();
}
