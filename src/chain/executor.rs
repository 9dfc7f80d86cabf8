//! Fallback-chain executor.
//!
//! Tries candidates in order until one succeeds or a non-recoverable error
//! surfaces. A candidate is tried at most once; transient-failure retries
//! against the same candidate belong to the crawl worker and webhook
//! engine, not here. Every attempt is recorded for observability.

use crate::chain::{CredentialSource, LlmCandidate};
use crate::credentials::{CredentialStore, PlaintextKey};
use crate::error::{ErrorKind, ExtractError, ExtractResult};
use crate::id;
use crate::logging::{log_debug, log_warn};
use crate::providers::{fallback_cost, ChatRequest, ProviderFactory, ProviderUsage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Record of one candidate invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt_id: String,
    pub provider: String,
    pub model: String,
    /// `None` on the winning attempt.
    pub error_kind: Option<ErrorKind>,
    pub latency_ms: u64,
}

/// Successful chain execution with attribution.
#[derive(Debug, Clone)]
pub struct ChainSuccess {
    pub text: String,
    pub usage: ProviderUsage,
    pub provider: String,
    pub model: String,
    /// Index into the candidate list of the winner.
    pub candidate_index: usize,
    pub is_byok: bool,
    pub charged: bool,
    pub latency_ms: u64,
    /// Provider-reported cost, or catalog fallback when unreported.
    pub llm_cost: Option<f64>,
    pub attempts: Vec<AttemptRecord>,
}

/// Executes a resolved candidate list against the provider transports.
pub struct ChainExecutor {
    credentials: Arc<CredentialStore>,
    factory: Arc<dyn ProviderFactory>,
}

impl ChainExecutor {
    pub fn new(credentials: Arc<CredentialStore>, factory: Arc<dyn ProviderFactory>) -> Self {
        Self {
            credentials,
            factory,
        }
    }

    /// Try candidates from `start_at` onward.
    ///
    /// `start_at` lets the crawl worker skip candidates it has permanently
    /// abandoned after repeated rate limiting.
    pub async fn execute(
        &self,
        candidates: &[LlmCandidate],
        prompt: &str,
        timeout: Duration,
        cancel: &CancellationToken,
        start_at: usize,
    ) -> ExtractResult<ChainSuccess> {
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut best_error: Option<ExtractError> = None;

        for (index, candidate) in candidates.iter().enumerate().skip(start_at) {
            if cancel.is_cancelled() {
                return Err(ExtractError::network_error("execution cancelled"));
            }

            let attempt_id = id::attempt_id();
            let started = std::time::Instant::now();

            match self.try_candidate(candidate, prompt, timeout, cancel).await {
                Ok(outcome) => {
                    let latency_ms = outcome.latency.as_millis() as u64;
                    attempts.push(AttemptRecord {
                        attempt_id,
                        provider: candidate.provider.clone(),
                        model: candidate.model.clone(),
                        error_kind: None,
                        latency_ms,
                    });
                    let llm_cost = outcome.usage.reported_cost.or_else(|| {
                        fallback_cost(
                            &candidate.provider,
                            &candidate.model,
                            outcome.usage.input_tokens,
                            outcome.usage.output_tokens,
                        )
                    });
                    log_debug!(
                        provider = %candidate.provider,
                        model = %candidate.model,
                        candidate_index = index,
                        attempts = attempts.len(),
                        latency_ms = latency_ms,
                        "Chain execution succeeded"
                    );
                    return Ok(ChainSuccess {
                        text: outcome.text,
                        usage: outcome.usage,
                        provider: candidate.provider.clone(),
                        model: candidate.model.clone(),
                        candidate_index: index,
                        is_byok: candidate.is_byok,
                        charged: candidate.charged,
                        latency_ms,
                        llm_cost,
                        attempts,
                    });
                }
                Err(err) => {
                    let kind = err.kind();
                    attempts.push(AttemptRecord {
                        attempt_id,
                        provider: candidate.provider.clone(),
                        model: candidate.model.clone(),
                        error_kind: Some(kind),
                        latency_ms: started.elapsed().as_millis() as u64,
                    });
                    log_warn!(
                        provider = %candidate.provider,
                        model = %candidate.model,
                        candidate_index = index,
                        error_kind = kind.as_str(),
                        "Candidate failed"
                    );

                    if kind.halts_chain() {
                        return Err(err);
                    }

                    // Keep the most informative error; later errors of equal
                    // rank replace earlier ones so invalid_response retains
                    // the last-seen failure.
                    let replace = best_error
                        .as_ref()
                        .map(|b| kind.informativeness() >= b.kind().informativeness())
                        .unwrap_or(true);
                    if replace {
                        best_error = Some(err);
                    }
                }
            }
        }

        Err(best_error.unwrap_or_else(|| {
            ExtractError::tier_feature_disabled("no usable model candidates for this tier")
        }))
    }

    async fn try_candidate(
        &self,
        candidate: &LlmCandidate,
        prompt: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ExtractResult<crate::providers::ChatOutcome> {
        let key = self.resolve_key(candidate)?;
        let provider =
            self.factory
                .build(&candidate.provider, candidate.base_url.as_deref(), key)?;

        let request = ChatRequest {
            model: candidate.model.clone(),
            prompt: prompt.to_string(),
            temperature: candidate.temperature,
            max_tokens: candidate.max_tokens,
            timeout,
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(ExtractError::network_error("execution cancelled")),
            result = provider.chat(request) => result,
        }
    }

    fn resolve_key(&self, candidate: &LlmCandidate) -> ExtractResult<Option<PlaintextKey>> {
        match &candidate.credential {
            CredentialSource::Inline(raw) => Ok(Some(PlaintextKey::new(raw.clone()))),
            CredentialSource::Stored { owner } => {
                match self.credentials.get(&candidate.provider, owner.as_deref())? {
                    Some(resolved) => Ok(Some(resolved.key)),
                    None => Err(ExtractError::invalid_api_key(format!(
                        "no stored credential for '{}'",
                        candidate.provider
                    ))),
                }
            }
        }
    }
}
