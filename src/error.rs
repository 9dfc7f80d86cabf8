//! Error taxonomy for extraction operations.
//!
//! Every failure surfaced by pagesift is an [`ExtractError`]: a tagged value
//! carrying an [`ErrorKind`], a retryability flag derived from the kind, a
//! user-visible message, and optional detail and provider/model attribution.
//! The kind-to-HTTP-status mapping is part of the public contract and is
//! exhaustive, so the serialization layer never has to guess.
//!
//! Detail and attribution fields are only shown to BYOK callers; use
//! [`ExtractError::sanitized`] before serializing an error for a
//! platform-charged caller.
//!
//! # Example
//!
//! ```rust
//! use pagesift::error::{ErrorKind, ExtractError};
//!
//! let err = ExtractError::rate_limit("provider throttled the request")
//!     .with_attribution("openai", "gpt-4o-mini");
//! assert_eq!(err.kind(), ErrorKind::RateLimit);
//! assert!(err.is_retryable());
//! assert_eq!(err.kind().http_status(), 429);
//! ```

use crate::logging::{log_error, log_warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenient result type for extraction operations.
pub type ExtractResult<T> = std::result::Result<T, ExtractError>;

// ============================================================================
// Error kinds
// ============================================================================

/// The closed set of failure kinds.
///
/// Each kind maps 1:1 to a surface HTTP status via [`http_status()`](Self::http_status).
/// Adding a kind is a contract change; the set below is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The supplied or stored provider credential was rejected.
    InvalidApiKey,
    /// The platform account has no remaining credits.
    InsufficientCredits,
    /// The period quota (jobs or charged cost) for the tier is exhausted.
    TierQuotaExceeded,
    /// The requested feature is not in the caller's tier feature set.
    TierFeatureDisabled,
    /// Free-tier request smoothing rejected the request.
    FreeTierRateLimited,
    /// The free tier's period allowance is used up.
    FreeTierQuotaExhausted,
    /// The free-tier fallback model is not currently serving.
    FreeTierUnavailable,
    /// The provider does not serve the requested model.
    ModelUnavailable,
    /// The provider throttled the request.
    RateLimit,
    /// Transient provider-side failure (5xx and friends).
    ProviderError,
    /// The composed prompt exceeds the model's context window.
    ContextLength,
    /// The provider answered with something we could not use.
    InvalidResponse,
    /// Connection, DNS, or timeout failure before a response arrived.
    NetworkError,
    /// Anything that did not classify.
    Unknown,
}

impl ErrorKind {
    /// Stable wire name, used as `error_category` in responses and rows.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidApiKey => "invalid_api_key",
            Self::InsufficientCredits => "insufficient_credits",
            Self::TierQuotaExceeded => "tier_quota_exceeded",
            Self::TierFeatureDisabled => "tier_feature_disabled",
            Self::FreeTierRateLimited => "free_tier_rate_limited",
            Self::FreeTierQuotaExhausted => "free_tier_quota_exhausted",
            Self::FreeTierUnavailable => "free_tier_unavailable",
            Self::ModelUnavailable => "model_unavailable",
            Self::RateLimit => "rate_limit",
            Self::ProviderError => "provider_error",
            Self::ContextLength => "context_length",
            Self::InvalidResponse => "invalid_response",
            Self::NetworkError => "network_error",
            Self::Unknown => "unknown",
        }
    }

    /// Deterministic HTTP status for the serialization layer.
    pub fn http_status(self) -> u16 {
        match self {
            Self::InvalidApiKey => 401,
            Self::InsufficientCredits => 402,
            Self::TierQuotaExceeded => 429,
            Self::TierFeatureDisabled => 403,
            Self::FreeTierRateLimited => 429,
            Self::FreeTierQuotaExhausted => 429,
            Self::FreeTierUnavailable => 503,
            Self::ModelUnavailable => 503,
            Self::RateLimit => 429,
            Self::ProviderError => 503,
            Self::ContextLength => 400,
            Self::InvalidResponse => 500,
            Self::NetworkError => 503,
            Self::Unknown => 500,
        }
    }

    /// Whether a failure of this kind may succeed on a different candidate
    /// or a later retry.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimit
                | Self::ProviderError
                | Self::NetworkError
                | Self::ModelUnavailable
                | Self::FreeTierRateLimited
                | Self::FreeTierUnavailable
        )
    }

    /// Whether the fallback executor must stop the chain immediately
    /// instead of advancing to the next candidate.
    pub(crate) fn halts_chain(self) -> bool {
        matches!(
            self,
            Self::TierQuotaExceeded | Self::TierFeatureDisabled | Self::InsufficientCredits
        )
    }

    /// Ranking used to pick the most informative error once every candidate
    /// has failed. Higher wins.
    pub(crate) fn informativeness(self) -> u8 {
        match self {
            Self::TierQuotaExceeded
            | Self::TierFeatureDisabled
            | Self::InsufficientCredits
            | Self::FreeTierQuotaExhausted => 7,
            Self::InvalidApiKey => 6,
            Self::ModelUnavailable | Self::FreeTierUnavailable => 5,
            Self::RateLimit | Self::FreeTierRateLimited => 4,
            Self::ProviderError | Self::ContextLength | Self::InvalidResponse => 3,
            Self::NetworkError => 2,
            Self::Unknown => 1,
        }
    }
}

// ============================================================================
// The error value
// ============================================================================

/// A classified extraction failure.
///
/// Constructed through the per-kind methods below, which log at the level
/// appropriate to the kind. The message is always safe to show the caller;
/// `detail`, `provider`, and `model` are BYOK-only.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
#[error("{message}")]
pub struct ExtractError {
    kind: ErrorKind,
    message: String,
    /// Underlying detail (provider response bodies, transport errors).
    detail: Option<String>,
    /// Provider that produced the failure, when attributable.
    provider: Option<String>,
    /// Model that produced the failure, when attributable.
    model: Option<String>,
}

impl ExtractError {
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    pub fn provider(&self) -> Option<&str> {
        self.provider.as_deref()
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Attach provider/model attribution.
    pub fn with_attribution(
        mut self,
        provider: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        self.provider = Some(provider.into());
        self.model = Some(model.into());
        self
    }

    /// Attach underlying detail.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Copy with detail and attribution stripped, for non-BYOK callers.
    pub fn sanitized(&self) -> Self {
        Self {
            kind: self.kind,
            message: self.message.clone(),
            detail: None,
            provider: None,
            model: None,
        }
    }

    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
            provider: None,
            model: None,
        }
    }

    // =========================================================================
    // Constructor methods with automatic logging
    // =========================================================================

    pub fn invalid_api_key(message: impl Into<String>) -> Self {
        let message = message.into();
        log_warn!(error_kind = "invalid_api_key", message = %message, "Provider rejected credential");
        Self::new(ErrorKind::InvalidApiKey, message)
    }

    pub fn insufficient_credits(message: impl Into<String>) -> Self {
        let message = message.into();
        log_warn!(error_kind = "insufficient_credits", message = %message, "Account has no remaining credits");
        Self::new(ErrorKind::InsufficientCredits, message)
    }

    pub fn tier_quota_exceeded(message: impl Into<String>) -> Self {
        let message = message.into();
        log_warn!(error_kind = "tier_quota_exceeded", message = %message, "Tier period quota exhausted");
        Self::new(ErrorKind::TierQuotaExceeded, message)
    }

    pub fn tier_feature_disabled(message: impl Into<String>) -> Self {
        let message = message.into();
        log_warn!(error_kind = "tier_feature_disabled", message = %message, "Requested feature not in tier");
        Self::new(ErrorKind::TierFeatureDisabled, message)
    }

    pub fn free_tier_rate_limited(message: impl Into<String>) -> Self {
        let message = message.into();
        log_warn!(error_kind = "free_tier_rate_limited", message = %message, "Free tier request rejected");
        Self::new(ErrorKind::FreeTierRateLimited, message)
    }

    pub fn free_tier_quota_exhausted(message: impl Into<String>) -> Self {
        let message = message.into();
        log_warn!(error_kind = "free_tier_quota_exhausted", message = %message, "Free tier allowance used up");
        Self::new(ErrorKind::FreeTierQuotaExhausted, message)
    }

    pub fn free_tier_unavailable(message: impl Into<String>) -> Self {
        let message = message.into();
        log_warn!(error_kind = "free_tier_unavailable", message = %message, "Free tier model unavailable");
        Self::new(ErrorKind::FreeTierUnavailable, message)
    }

    pub fn model_unavailable(message: impl Into<String>) -> Self {
        let message = message.into();
        log_warn!(error_kind = "model_unavailable", message = %message, "Requested model not served");
        Self::new(ErrorKind::ModelUnavailable, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        let message = message.into();
        log_warn!(error_kind = "rate_limit", message = %message, "Provider rate limit hit");
        Self::new(ErrorKind::RateLimit, message)
    }

    pub fn provider_error(message: impl Into<String>) -> Self {
        let message = message.into();
        log_warn!(error_kind = "provider_error", message = %message, "Transient provider failure");
        Self::new(ErrorKind::ProviderError, message)
    }

    pub fn context_length(message: impl Into<String>) -> Self {
        let message = message.into();
        log_warn!(error_kind = "context_length", message = %message, "Prompt exceeds model context");
        Self::new(ErrorKind::ContextLength, message)
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        let message = message.into();
        log_warn!(error_kind = "invalid_response", message = %message, "Unusable provider response");
        Self::new(ErrorKind::InvalidResponse, message)
    }

    pub fn network_error(message: impl Into<String>) -> Self {
        let message = message.into();
        log_warn!(error_kind = "network_error", message = %message, "Transport failure");
        Self::new(ErrorKind::NetworkError, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        let message = message.into();
        log_error!(error_kind = "unknown", message = %message, "Unclassified failure");
        Self::new(ErrorKind::Unknown, message)
    }
}

// ============================================================================
// Transport classification
// ============================================================================

/// Hints in provider error bodies that indicate a context-window overflow.
const CONTEXT_HINTS: [&str; 4] = [
    "context_length",
    "context window",
    "maximum context",
    "too many tokens",
];

/// Map an HTTP response from a provider transport into the taxonomy.
///
/// Inspects the status first, then falls back to body hints for the cases
/// providers report with a generic 400.
pub fn classify_http(status: u16, body: &str) -> ExtractError {
    let lower = body.to_lowercase();
    let summary = |prefix: &str| format!("{prefix} (HTTP {status})");

    let err = match status {
        401 | 403 => ExtractError::invalid_api_key(summary("provider rejected credential")),
        402 => ExtractError::insufficient_credits(summary("provider account out of credits")),
        404 => ExtractError::model_unavailable(summary("model not found")),
        408 => ExtractError::network_error(summary("provider request timed out")),
        413 => ExtractError::context_length(summary("request body too large")),
        429 => ExtractError::rate_limit(summary("provider throttled request")),
        400 if CONTEXT_HINTS.iter().any(|h| lower.contains(h)) => {
            ExtractError::context_length(summary("prompt exceeds model context"))
        }
        400 if lower.contains("model") && lower.contains("not") => {
            ExtractError::model_unavailable(summary("model not served"))
        }
        400..=499 => ExtractError::invalid_response(summary("provider rejected request")),
        500..=599 => ExtractError::provider_error(summary("provider-side failure")),
        _ => ExtractError::unknown(summary("unexpected provider status")),
    };

    if body.is_empty() {
        err
    } else {
        err.with_detail(body.chars().take(2048).collect::<String>())
    }
}

/// Map a reqwest transport failure (no HTTP response) into the taxonomy.
pub fn classify_transport(err: &reqwest::Error) -> ExtractError {
    if err.is_timeout() {
        ExtractError::network_error("provider request timed out").with_detail(err.to_string())
    } else if err.is_connect() {
        ExtractError::network_error("could not connect to provider").with_detail(err.to_string())
    } else if err.is_decode() {
        ExtractError::invalid_response("provider response failed to decode")
            .with_detail(err.to_string())
    } else {
        ExtractError::network_error("provider transport failure").with_detail(err.to_string())
    }
}
