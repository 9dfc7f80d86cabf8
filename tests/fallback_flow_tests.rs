//! End-to-end fallback flow against real transports: the primary provider
//! rate-limits, the second candidate wins, and the job records the winner.

mod common;

use common::{
    anthropic_messages_response, entry, openai_chat_response, pro_user, rate_limit_response,
    stack,
};
use pagesift::api::ExtractRequest;
use pagesift::store::{JobStatus, JobStore};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn rate_limited_primary_falls_through_to_the_second_provider() {
    let openai = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(rate_limit_response())
        .expect(1)
        .mount(&openai)
        .await;

    let anthropic = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(anthropic_messages_response("{\"x\":1}")),
        )
        .expect(1)
        .mount(&anthropic)
        .await;

    let s = stack(
        vec![("openai", openai.uri()), ("anthropic", anthropic.uri())],
        vec![
            entry("openai", "gpt-4o-mini", 0),
            entry("anthropic", "claude-3-5-haiku-20241022", 1),
        ],
    );
    s.fetcher.serve("https://ex.test/a", "<h1>Hi</h1>");

    let response = s
        .service
        .run_extract(
            &pro_user("u1"),
            ExtractRequest {
                url: "https://ex.test/a".to_string(),
                schema: Some(serde_json::json!({"x": "number"})),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();

    assert_eq!(response.data, serde_json::json!({"x": 1}));
    assert_eq!(response.metadata.provider, "anthropic");
    assert_eq!(response.metadata.model, "claude-3-5-haiku-20241022");

    let job = s.store.get_job(&response.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.provider.as_deref(), Some("anthropic"));
    // Catalog pricing for the winner backs the cost when the provider does
    // not self-report one.
    assert!(job.llm_cost > 0.0);
}

#[tokio::test]
async fn fenced_model_output_still_parses() {
    let openai = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_chat_response(
            "```json\n{\"title\": \"Hi\"}\n```",
        )))
        .mount(&openai)
        .await;

    let s = stack(
        vec![("openai", openai.uri())],
        vec![entry("openai", "gpt-4o-mini", 0)],
    );
    s.fetcher.serve("https://ex.test/a", "<h1>Hi</h1>");

    let response = s
        .service
        .run_extract(
            &pro_user("u1"),
            ExtractRequest {
                url: "https://ex.test/a".to_string(),
                schema: Some(serde_json::json!({"title": "string"})),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(response.data, serde_json::json!({"title": "Hi"}));
}
