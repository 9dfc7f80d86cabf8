//! LLM transport adapters.
//!
//! Every provider implements the single-operation [`ChatProvider`] contract:
//! `chat(request)` returns text, normalized usage counters, and latency.
//! Adapters never retry internally — fallback and retry policy belong to the
//! chain executor — and they map transport failures into the error taxonomy.
//!
//! ## Architecture
//!
//! ```text
//! openai_compat.rs    <- Shared OpenAI-compatible wire format and HTTP path
//!      |         |
//! openai.rs  openrouter.rs   <- OpenAI-compatible providers
//!
//! anthropic.rs        <- Anthropic's native messages API format
//! ```

pub mod anthropic;
pub mod openai;
pub mod openai_compat;
pub mod openrouter;

pub use anthropic::AnthropicChat;
pub use openai::OpenAiChat;
pub use openrouter::OpenRouterChat;

use crate::config::ProviderEndpoint;
use crate::credentials::PlaintextKey;
use crate::error::{ExtractError, ExtractResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One chat invocation against a single (provider, model, credential).
#[derive(Debug)]
pub struct ChatRequest {
    pub model: String,
    pub prompt: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    /// Per-attempt budget; enforced at the transport.
    pub timeout: Duration,
}

/// Normalized usage counters.
///
/// `reported_cost` is the provider's self-reported USD cost when the wire
/// format carries one; callers fall back to [`fallback_cost`] otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ProviderUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub reported_cost: Option<f64>,
}

/// Successful chat outcome.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub text: String,
    pub usage: ProviderUsage,
    pub latency: Duration,
}

/// Contract between the fallback executor and provider transports.
///
/// Implementations must not retry; they honor `request.timeout` and
/// classify every failure through the taxonomy in `error`.
#[async_trait::async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> ExtractResult<ChatOutcome>;

    /// Provider name for logging and attribution.
    fn provider_name(&self) -> &'static str;
}

// ============================================================================
// Model catalog
// ============================================================================

/// A model the platform knows how to price and gate.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ModelInfo {
    pub id: &'static str,
    pub display_name: &'static str,
    /// Premium models require the `models_premium` feature.
    pub premium: bool,
    /// USD per million input tokens, for cost fallback.
    pub input_cost_per_mtok: f64,
    /// USD per million output tokens, for cost fallback.
    pub output_cost_per_mtok: f64,
    pub context_tokens: u32,
}

const OPENAI_MODELS: [ModelInfo; 3] = [
    ModelInfo {
        id: "gpt-4o",
        display_name: "GPT-4o",
        premium: true,
        input_cost_per_mtok: 2.50,
        output_cost_per_mtok: 10.00,
        context_tokens: 128_000,
    },
    ModelInfo {
        id: "gpt-4o-mini",
        display_name: "GPT-4o mini",
        premium: false,
        input_cost_per_mtok: 0.15,
        output_cost_per_mtok: 0.60,
        context_tokens: 128_000,
    },
    ModelInfo {
        id: "gpt-4.1-mini",
        display_name: "GPT-4.1 mini",
        premium: false,
        input_cost_per_mtok: 0.40,
        output_cost_per_mtok: 1.60,
        context_tokens: 1_000_000,
    },
];

const ANTHROPIC_MODELS: [ModelInfo; 2] = [
    ModelInfo {
        id: "claude-3-5-sonnet-20241022",
        display_name: "Claude 3.5 Sonnet",
        premium: true,
        input_cost_per_mtok: 3.00,
        output_cost_per_mtok: 15.00,
        context_tokens: 200_000,
    },
    ModelInfo {
        id: "claude-3-5-haiku-20241022",
        display_name: "Claude 3.5 Haiku",
        premium: false,
        input_cost_per_mtok: 0.80,
        output_cost_per_mtok: 4.00,
        context_tokens: 200_000,
    },
];

const OPENROUTER_MODELS: [ModelInfo; 3] = [
    ModelInfo {
        id: "meta-llama/llama-3.1-8b-instruct:free",
        display_name: "Llama 3.1 8B (free)",
        premium: false,
        input_cost_per_mtok: 0.0,
        output_cost_per_mtok: 0.0,
        context_tokens: 128_000,
    },
    ModelInfo {
        id: "openai/gpt-4o-mini",
        display_name: "GPT-4o mini (OpenRouter)",
        premium: false,
        input_cost_per_mtok: 0.15,
        output_cost_per_mtok: 0.60,
        context_tokens: 128_000,
    },
    ModelInfo {
        id: "anthropic/claude-3.5-sonnet",
        display_name: "Claude 3.5 Sonnet (OpenRouter)",
        premium: true,
        input_cost_per_mtok: 3.00,
        output_cost_per_mtok: 15.00,
        context_tokens: 200_000,
    },
];

/// Providers this build can construct transports for.
pub fn supported_providers() -> &'static [&'static str] {
    &["openai", "anthropic", "openrouter"]
}

/// Known models for a provider; empty for unknown providers.
pub fn model_catalog(provider: &str) -> &'static [ModelInfo] {
    match provider {
        "openai" => &OPENAI_MODELS,
        "anthropic" => &ANTHROPIC_MODELS,
        "openrouter" => &OPENROUTER_MODELS,
        _ => &[],
    }
}

/// Premium gating for a (provider, model).
///
/// Unknown models are treated as premium except for OpenRouter's explicit
/// `:free` suffix, so custom models never sneak past the tier gate.
pub fn is_premium_model(provider: &str, model: &str) -> bool {
    if model.ends_with(":free") {
        return false;
    }
    model_catalog(provider)
        .iter()
        .find(|m| m.id == model)
        .map(|m| m.premium)
        .unwrap_or(true)
}

/// Catalog-priced USD cost for a usage pair, when the model is known.
pub fn fallback_cost(provider: &str, model: &str, input_tokens: u32, output_tokens: u32) -> Option<f64> {
    let info = model_catalog(provider).iter().find(|m| m.id == model)?;
    Some(
        f64::from(input_tokens) * info.input_cost_per_mtok / 1_000_000.0
            + f64::from(output_tokens) * info.output_cost_per_mtok / 1_000_000.0,
    )
}

// ============================================================================
// Provider construction
// ============================================================================

/// Builds a transport for a resolved candidate.
///
/// The seam exists so the executor can be driven by scripted providers in
/// tests; production uses [`DefaultProviderFactory`].
pub trait ProviderFactory: Send + Sync {
    fn build(
        &self,
        provider: &str,
        base_url: Option<&str>,
        api_key: Option<PlaintextKey>,
    ) -> ExtractResult<Box<dyn ChatProvider>>;
}

/// Factory backed by the configured provider endpoints.
pub struct DefaultProviderFactory {
    endpoints: Vec<ProviderEndpoint>,
    http: reqwest::Client,
}

impl DefaultProviderFactory {
    pub fn new(endpoints: Vec<ProviderEndpoint>) -> Self {
        Self {
            endpoints,
            http: reqwest::Client::new(),
        }
    }

    fn endpoint_base(&self, provider: &str) -> Option<&str> {
        self.endpoints
            .iter()
            .find(|e| e.name == provider)
            .map(|e| e.base_url.as_str())
    }
}

impl ProviderFactory for DefaultProviderFactory {
    fn build(
        &self,
        provider: &str,
        base_url: Option<&str>,
        api_key: Option<PlaintextKey>,
    ) -> ExtractResult<Box<dyn ChatProvider>> {
        let base = base_url
            .or_else(|| self.endpoint_base(provider))
            .ok_or_else(|| {
                ExtractError::model_unavailable(format!("provider '{provider}' is not enabled"))
            })?
            .to_string();
        let key = api_key.ok_or_else(|| {
            ExtractError::invalid_api_key(format!("no credential available for '{provider}'"))
        })?;

        match provider {
            "openai" => Ok(Box::new(OpenAiChat::new(self.http.clone(), base, key))),
            "openrouter" => Ok(Box::new(OpenRouterChat::new(self.http.clone(), base, key))),
            "anthropic" => Ok(Box::new(AnthropicChat::new(self.http.clone(), base, key))),
            other => Err(ExtractError::model_unavailable(format!(
                "provider '{other}' is not supported"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_covers_every_supported_provider() {
        for provider in supported_providers() {
            assert!(
                !model_catalog(provider).is_empty(),
                "{provider} has no models"
            );
        }
        assert!(model_catalog("lexisnexis").is_empty());
    }

    #[test]
    fn premium_gate_defaults_closed_for_unknown_models() {
        assert!(is_premium_model("openai", "gpt-9-experimental"));
        assert!(!is_premium_model("openrouter", "some/new-model:free"));
        assert!(!is_premium_model("openai", "gpt-4o-mini"));
        assert!(is_premium_model("anthropic", "claude-3-5-sonnet-20241022"));
    }

    #[test]
    fn fallback_cost_uses_catalog_pricing() {
        // 1M input + 1M output of gpt-4o-mini = 0.15 + 0.60
        let cost = fallback_cost("openai", "gpt-4o-mini", 1_000_000, 1_000_000).unwrap();
        assert!((cost - 0.75).abs() < 1e-9);
        assert!(fallback_cost("openai", "made-up", 10, 10).is_none());
        assert_eq!(
            fallback_cost("openrouter", "meta-llama/llama-3.1-8b-instruct:free", 500, 500),
            Some(0.0)
        );
    }
}
