//! Fallback-chain executor tests.
//!
//! Cover error-class-aware advancement, the stop-immediately kinds, attempt
//! records, winner attribution, and the most-informative-error selection.

use crate::chain::{ChainExecutor, CredentialSource, LlmCandidate};
use crate::credentials::CredentialStore;
use crate::error::{ErrorKind, ExtractError};
use crate::tests::helpers::{chat_ok, test_cipher, ScriptedFactory};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn candidate(provider: &str, model: &str) -> LlmCandidate {
    LlmCandidate {
        provider: provider.to_string(),
        model: model.to_string(),
        base_url: None,
        credential: CredentialSource::Inline("sk-test".to_string()),
        temperature: None,
        max_tokens: None,
        is_byok: false,
        charged: true,
    }
}

fn executor(factory: Arc<ScriptedFactory>) -> ChainExecutor {
    ChainExecutor::new(Arc::new(CredentialStore::new(test_cipher())), factory)
}

async fn run(
    executor: &ChainExecutor,
    candidates: &[LlmCandidate],
) -> crate::error::ExtractResult<crate::chain::ChainSuccess> {
    executor
        .execute(
            candidates,
            "prompt",
            Duration::from_secs(5),
            &CancellationToken::new(),
            0,
        )
        .await
}

#[tokio::test]
async fn first_successful_candidate_wins_with_attribution() {
    let factory = Arc::new(ScriptedFactory::new());
    factory.push("openai", Ok(chat_ok("{\"x\":1}", Some(0.0002))));
    let executor = executor(factory);

    let candidates = [
        candidate("openai", "gpt-4o-mini"),
        candidate("anthropic", "claude-3-5-haiku-20241022"),
    ];
    let success = run(&executor, &candidates).await.unwrap();
    assert_eq!(success.provider, "openai");
    assert_eq!(success.model, "gpt-4o-mini");
    assert_eq!(success.candidate_index, 0);
    assert_eq!(success.llm_cost, Some(0.0002));
    assert_eq!(success.attempts.len(), 1);
    assert!(success.attempts[0].error_kind.is_none());
}

#[tokio::test]
async fn rate_limit_advances_to_the_next_candidate() {
    let factory = Arc::new(ScriptedFactory::new());
    factory.push(
        "openai",
        Err(ExtractError::rate_limit("provider throttled request")),
    );
    factory.push("anthropic", Ok(chat_ok("{\"x\":1}", None)));
    let executor = executor(factory);

    let candidates = [
        candidate("openai", "gpt-4o-mini"),
        candidate("anthropic", "claude-3-5-haiku-20241022"),
    ];
    let success = run(&executor, &candidates).await.unwrap();
    // The winner is the first candidate that succeeded.
    assert_eq!(success.provider, "anthropic");
    assert_eq!(success.candidate_index, 1);
    // Both attempts are on the record.
    assert_eq!(success.attempts.len(), 2);
    assert_eq!(success.attempts[0].error_kind, Some(ErrorKind::RateLimit));
    assert!(success.attempts[1].error_kind.is_none());
    // Cost falls back to the catalog price for the winner's model.
    assert!(success.llm_cost.is_some());
}

#[tokio::test]
async fn quota_class_errors_stop_the_chain_immediately() {
    for err in [
        ExtractError::tier_quota_exceeded("quota"),
        ExtractError::tier_feature_disabled("feature"),
        ExtractError::insufficient_credits("credits"),
    ] {
        let factory = Arc::new(ScriptedFactory::new());
        let expected_kind = err.kind();
        factory.push("openai", Err(err));
        factory.push("anthropic", Ok(chat_ok("{}", None)));
        let executor = executor(factory.clone());

        let candidates = [
            candidate("openai", "gpt-4o-mini"),
            candidate("anthropic", "claude-3-5-haiku-20241022"),
        ];
        let surfaced = run(&executor, &candidates).await.unwrap_err();
        assert_eq!(surfaced.kind(), expected_kind);
        // The second candidate was never built.
        assert_eq!(factory.built.lock().unwrap().len(), 1);
    }
}

#[tokio::test]
async fn each_candidate_is_tried_at_most_once() {
    let factory = Arc::new(ScriptedFactory::new());
    factory.push("openai", Err(ExtractError::provider_error("boom")));
    factory.push(
        "anthropic",
        Err(ExtractError::network_error("connection refused")),
    );
    let executor = executor(factory.clone());

    let candidates = [
        candidate("openai", "gpt-4o-mini"),
        candidate("anthropic", "claude-3-5-haiku-20241022"),
    ];
    let err = run(&executor, &candidates).await.unwrap_err();
    // provider_error outranks network_error in informativeness.
    assert_eq!(err.kind(), ErrorKind::ProviderError);
    assert_eq!(factory.built.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn most_informative_error_surfaces_after_total_failure() {
    let factory = Arc::new(ScriptedFactory::new());
    factory.push("openai", Err(ExtractError::network_error("dns")));
    factory.push(
        "anthropic",
        Err(ExtractError::invalid_api_key("credential rejected")),
    );
    factory.push("openrouter", Err(ExtractError::rate_limit("throttled")));
    let executor = executor(factory);

    let candidates = [
        candidate("openai", "gpt-4o-mini"),
        candidate("anthropic", "claude-3-5-haiku-20241022"),
        candidate("openrouter", "openai/gpt-4o-mini"),
    ];
    let err = run(&executor, &candidates).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidApiKey);
}

#[tokio::test]
async fn invalid_response_advances_and_retains_last_seen() {
    let factory = Arc::new(ScriptedFactory::new());
    factory.push(
        "openai",
        Err(ExtractError::invalid_response("first garbled reply")),
    );
    factory.push(
        "anthropic",
        Err(ExtractError::invalid_response("second garbled reply")),
    );
    let executor = executor(factory);

    let candidates = [
        candidate("openai", "gpt-4o-mini"),
        candidate("anthropic", "claude-3-5-haiku-20241022"),
    ];
    let err = run(&executor, &candidates).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidResponse);
    assert_eq!(err.message(), "second garbled reply");
}

#[tokio::test]
async fn start_at_skips_abandoned_candidates() {
    let factory = Arc::new(ScriptedFactory::new());
    factory.push("anthropic", Ok(chat_ok("{}", None)));
    let executor = executor(factory.clone());

    let candidates = [
        candidate("openai", "gpt-4o-mini"),
        candidate("anthropic", "claude-3-5-haiku-20241022"),
    ];
    let success = executor
        .execute(
            &candidates,
            "prompt",
            Duration::from_secs(5),
            &CancellationToken::new(),
            1,
        )
        .await
        .unwrap();
    assert_eq!(success.candidate_index, 1);
    // The skipped candidate was never touched.
    assert_eq!(factory.built.lock().unwrap().as_slice(), ["anthropic"]);
}

#[tokio::test]
async fn missing_stored_credential_advances_with_invalid_key_attempt() {
    let factory = Arc::new(ScriptedFactory::new());
    factory.push("anthropic", Ok(chat_ok("{}", None)));
    let executor = executor(factory);

    let mut first = candidate("openai", "gpt-4o-mini");
    first.credential = CredentialSource::Stored { owner: None };
    let candidates = [first, candidate("anthropic", "claude-3-5-haiku-20241022")];
    let success = run(&executor, &candidates).await.unwrap();
    assert_eq!(success.provider, "anthropic");
    assert_eq!(
        success.attempts[0].error_kind,
        Some(ErrorKind::InvalidApiKey)
    );
}

#[tokio::test]
async fn cancellation_short_circuits_execution() {
    let factory = Arc::new(ScriptedFactory::new());
    let executor = executor(factory.clone());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let candidates = [candidate("openai", "gpt-4o-mini")];
    let err = executor
        .execute(&candidates, "prompt", Duration::from_secs(5), &cancel, 0)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NetworkError);
    assert!(factory.built.lock().unwrap().is_empty());
}
