//! Job lifecycle tests: single extract success and fallback, BYOK cost and
//! error-surface rules, terminal-state invariants, and the sync wait.

use crate::api::{ErrorBody, ExtractRequest};
use crate::chain::resolver::RequestLlmOverride;
use crate::error::{ErrorKind, ExtractError};
use crate::store::{JobPatch, JobStatus, JobStore};
use crate::stream::{sync_wait, SyncWaitOutcome};
use crate::tests::helpers::{chat_ok, harness, pro_user};
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn extract_request(url: &str) -> ExtractRequest {
    ExtractRequest {
        url: url.to_string(),
        schema: Some(json!("{\"title\":\"string\"}")),
        ..Default::default()
    }
}

#[tokio::test]
async fn single_extract_success_fills_job_and_result_rows() {
    // Single extract, non-BYOK, one candidate succeeds: 200-shaped response,
    // charged cost on the job, exactly one result row, no deliveries.
    let h = harness();
    let user = pro_user("u1");
    h.fetcher.serve("https://ex.test/a", "<h1>Hi</h1>");
    h.factory
        .push("openai", Ok(chat_ok("{\"title\":\"Hi\"}", Some(0.0002))));

    let response = h
        .service
        .run_extract(&user, extract_request("https://ex.test/a"), None)
        .await
        .unwrap();

    assert_eq!(response.data, json!({"title": "Hi"}));
    assert!(!response.usage.is_byok);
    assert_eq!(response.metadata.provider, "openai");
    assert_eq!(response.metadata.model, "gpt-4o-mini");

    let job = h.store.get_job(&response.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!((job.charged_cost - 0.0002).abs() < 1e-9);
    assert!((job.llm_cost - 0.0002).abs() < 1e-9);
    assert_eq!(job.page_count, 1);
    assert!(job.completed_at.unwrap() >= job.started_at.unwrap());
    assert!(job.started_at.unwrap() >= job.created_at);

    let results = h.store.list_results(&response.job_id).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].data, Some(json!({"title": "Hi"})));

    // No subscribers were registered, so no delivery rows exist.
    let deliveries = h
        .store
        .list_deliveries_for_job(&response.job_id)
        .await
        .unwrap();
    assert!(deliveries.is_empty());

    // Terminal transition released the slot.
    assert_eq!(h.admission.in_flight("u1"), 0);
}

#[tokio::test]
async fn fallback_winner_supplies_attribution_and_charge() {
    // Primary candidate rate-limits; the second succeeds and its charge
    // rule applies.
    let h = harness();
    let user = pro_user("u1");
    h.fetcher.serve("https://ex.test/a", "<h1>Hi</h1>");
    h.factory
        .push("openai", Err(ExtractError::rate_limit("throttled")));
    h.factory
        .push("anthropic", Ok(chat_ok("{\"x\":1}", Some(0.003))));

    let response = h
        .service
        .run_extract(&user, extract_request("https://ex.test/a"), None)
        .await
        .unwrap();

    assert_eq!(response.data, json!({"x": 1}));
    assert_eq!(response.metadata.provider, "anthropic");
    assert_eq!(response.metadata.model, "claude-3-5-haiku-20241022");

    let job = h.store.get_job(&response.job_id).await.unwrap().unwrap();
    assert_eq!(job.provider.as_deref(), Some("anthropic"));
    assert!((job.charged_cost - 0.003).abs() < 1e-9);

    let results = h.store.list_results(&response.job_id).await.unwrap();
    let attempts = &results[0];
    // One result row; the attempt trail lives in the response metadata.
    assert_eq!(attempts.provider.as_deref(), Some("anthropic"));
}

#[tokio::test]
async fn byok_jobs_never_charge() {
    let h = harness();
    let user = pro_user("u1");
    h.fetcher.serve("https://ex.test/a", "<h1>Hi</h1>");
    h.factory
        .push("openai", Ok(chat_ok("{\"ok\":true}", Some(0.5))));

    let mut request = extract_request("https://ex.test/a");
    request.llm_config = Some(RequestLlmOverride {
        provider: "openai".to_string(),
        model: "gpt-4o-mini".to_string(),
        api_key: Some("sk-my-own".to_string()),
        ..Default::default()
    });

    let response = h.service.run_extract(&user, request, None).await.unwrap();
    assert!(response.usage.is_byok);
    assert_eq!(response.usage.charged_cost, 0.0);

    let job = h.store.get_job(&response.job_id).await.unwrap().unwrap();
    assert!(job.is_byok);
    assert_eq!(job.charged_cost, 0.0);
    // The underlying cost is still recorded for analytics.
    assert!((job.llm_cost - 0.5).abs() < 1e-9);
}

#[tokio::test]
async fn failed_extract_writes_error_fields_and_releases_slot() {
    let h = harness();
    let user = pro_user("u1");
    h.fetcher.serve("https://ex.test/a", "<h1>Hi</h1>");
    // Both chain candidates fail.
    h.factory
        .push("openai", Err(ExtractError::provider_error("upstream 500")));
    h.factory
        .push("anthropic", Err(ExtractError::provider_error("upstream 503")));

    let err = h
        .service
        .run_extract(&user, extract_request("https://ex.test/a"), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProviderError);

    let jobs = h.store.list_jobs("u1", 10, 0).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Failed);
    let fields = jobs[0].error.as_ref().unwrap();
    assert_eq!(fields.category, ErrorKind::ProviderError);
    assert_eq!(h.admission.in_flight("u1"), 0);
}

#[tokio::test]
async fn byok_error_surface_keeps_attribution_and_plain_surface_strips_it() {
    // BYOK caller sees detail and provider/model; the same failure for a
    // platform-charged caller omits all three.
    let h = harness();
    let user = pro_user("u1");
    h.fetcher.serve("https://ex.test/a", "<h1>Hi</h1>");

    h.factory.push(
        "openai",
        Err(ExtractError::invalid_api_key("provider rejected credential")
            .with_detail("x-request-id: r-123")
            .with_attribution("openai", "gpt-4o-mini")),
    );
    // The admin chain would normally take over after an invalid BYOK key;
    // make it fail the same way so the surfaced error stays invalid_api_key.
    h.factory.push(
        "anthropic",
        Err(ExtractError::invalid_api_key("provider rejected credential")
            .with_detail("upstream says invalid x-api-key")
            .with_attribution("anthropic", "claude-3-5-haiku-20241022")),
    );

    let mut request = extract_request("https://ex.test/a");
    request.llm_config = Some(RequestLlmOverride {
        provider: "openai".to_string(),
        model: "gpt-4o-mini".to_string(),
        api_key: Some("sk-bad".to_string()),
        ..Default::default()
    });

    let err = h.service.run_extract(&user, request, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidApiKey);

    let byok_body = ErrorBody::from_error(&err, true);
    assert!(byok_body.error_details.is_some());
    assert!(byok_body.llm_provider.is_some());
    assert!(byok_body.llm_model.is_some());
    assert_eq!(byok_body.http_status(), 401);

    let plain_body = ErrorBody::from_error(&err, false);
    assert!(plain_body.error_details.is_none());
    assert!(plain_body.llm_provider.is_none());
    assert!(plain_body.llm_model.is_none());
    assert_eq!(plain_body.error_category, ErrorKind::InvalidApiKey);
}

#[tokio::test]
async fn terminal_jobs_are_frozen() {
    // No job enters a terminal state twice, and counters cannot move after.
    let h = harness();
    let user = pro_user("u1");
    h.fetcher.serve("https://ex.test/a", "<h1>Hi</h1>");
    h.factory.push("openai", Ok(chat_ok("{}", None)));

    let response = h
        .service
        .run_extract(&user, extract_request("https://ex.test/a"), None)
        .await
        .unwrap();

    let frozen = h
        .store
        .update_job(
            &response.job_id,
            JobPatch {
                status: Some(JobStatus::Failed),
                ..Default::default()
            },
        )
        .await;
    assert!(frozen.is_err());

    let counters = h
        .store
        .update_job(
            &response.job_id,
            JobPatch {
                page_count: Some(99),
                ..Default::default()
            },
        )
        .await;
    assert!(counters.is_err());
}

#[tokio::test(start_paused = true)]
async fn sync_wait_returns_terminal_job() {
    let h = harness();
    let user = pro_user("u1");
    h.fetcher.serve("https://ex.test/a", "<h1>Hi</h1>");
    h.factory.push("openai", Ok(chat_ok("{}", None)));

    let response = h
        .service
        .run_extract(&user, extract_request("https://ex.test/a"), None)
        .await
        .unwrap();

    let outcome = sync_wait(
        &h.store,
        &response.job_id,
        Duration::from_secs(10),
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    match outcome {
        SyncWaitOutcome::Terminal(job) => assert_eq!(job.status, JobStatus::Completed),
        other => panic!("expected terminal outcome, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn sync_wait_caps_at_the_hard_limit() {
    // A pending job that never finishes: the wait must end at the 120 s
    // cap even though the caller asked for far longer.
    let h = harness();
    let user = pro_user("u1");
    h.fetcher.serve("https://ex.test/a", "<h1>Hi</h1>");
    h.factory.push("openai", Ok(chat_ok("{}", None)));
    let response = h
        .service
        .run_extract(&user, extract_request("https://ex.test/a"), None)
        .await
        .unwrap();

    // Use a job id that exists but never terminates by pointing at a fresh
    // pending row.
    let mut pending = h.store.get_job(&response.job_id).await.unwrap().unwrap();
    pending.id = "01JUNFINISHED0000000000000".to_string();
    pending.status = JobStatus::Pending;
    h.store.create_job(pending).await.unwrap();

    let started = tokio::time::Instant::now();
    let outcome = sync_wait(
        &h.store,
        "01JUNFINISHED0000000000000",
        Duration::from_secs(3_600),
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    let waited = started.elapsed();

    assert!(matches!(outcome, SyncWaitOutcome::TimedOut));
    assert!(waited >= Duration::from_secs(120));
    assert!(waited < Duration::from_secs(125));
}

#[tokio::test(start_paused = true)]
async fn sync_wait_detaches_on_client_cancellation() {
    let h = harness();
    let user = pro_user("u1");
    h.fetcher.serve("https://ex.test/a", "<h1>Hi</h1>");
    h.factory.push("openai", Ok(chat_ok("{}", None)));
    let response = h
        .service
        .run_extract(&user, extract_request("https://ex.test/a"), None)
        .await
        .unwrap();

    let mut pending = h.store.get_job(&response.job_id).await.unwrap().unwrap();
    pending.id = "01JSTILLRUNNING00000000000".to_string();
    pending.status = JobStatus::Pending;
    h.store.create_job(pending).await.unwrap();

    let client = CancellationToken::new();
    let waiter = {
        let store = h.store.clone();
        let client = client.clone();
        tokio::spawn(async move {
            sync_wait(
                &store,
                "01JSTILLRUNNING00000000000",
                Duration::from_secs(60),
                &client,
            )
            .await
        })
    };

    tokio::time::sleep(Duration::from_secs(2)).await;
    client.cancel();
    let outcome = waiter.await.unwrap().unwrap();
    assert!(matches!(outcome, SyncWaitOutcome::ClientGone));
}
