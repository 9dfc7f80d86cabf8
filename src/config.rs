//! Service configuration.
//!
//! [`ServiceConfig`] captures the environment contract: master encryption
//! key, database connection, blob store endpoint, identity-provider JWKS
//! URL, the enabled LLM providers with their base URLs, webhook dispatcher
//! pool size, and tier limit overrides. Everything is read once at startup
//! via [`ServiceConfig::from_env`]; unknown `PAGESIFT_*` variables are
//! ignored with a warning.
//!
//! Collaborator endpoints (database, blob store, JWKS) are carried here but
//! dialed by external components; the core only validates their presence.

use crate::error::{ExtractError, ExtractResult};
use crate::logging::{log_debug, log_warn};
use crate::tier::{Tier, TierLimits};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Environment prefix for every option this service reads.
const ENV_PREFIX: &str = "PAGESIFT_";

/// Variables the loader understands. Anything else under the prefix warns.
const KNOWN_VARS: [&str; 13] = [
    "PAGESIFT_MASTER_KEY",
    "PAGESIFT_DATABASE_URL",
    "PAGESIFT_BLOB_ENDPOINT",
    "PAGESIFT_BLOB_ACCESS_KEY",
    "PAGESIFT_BLOB_SECRET_KEY",
    "PAGESIFT_BLOB_BUCKET",
    "PAGESIFT_JWKS_URL",
    "PAGESIFT_PROVIDERS",
    "PAGESIFT_WEBHOOK_POOL_SIZE",
    "PAGESIFT_FREE_FALLBACK_MODEL",
    "PAGESIFT_TIER_LIMITS",
    "PAGESIFT_LLM_TIMEOUT_SECS",
    "PAGESIFT_RESULTS_BASE_URL",
];

/// An enabled LLM provider and where to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    pub name: String,
    pub base_url: String,
}

/// Blob store collaborator coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobConfig {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
}

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Base64-encoded 32-byte key seeding the credential cipher.
    pub master_key: String,
    pub database_url: String,
    pub blob: Option<BlobConfig>,
    /// Identity provider's JWKS endpoint (token verification happens there).
    pub jwks_url: Option<String>,
    pub providers: Vec<ProviderEndpoint>,
    pub webhook_pool_size: usize,
    /// Free OpenRouter model appended as last-resort candidate for tiers
    /// without premium access.
    pub free_fallback_model: String,
    /// Per-tier limit overrides; tiers absent here use built-in defaults.
    pub tier_limits: HashMap<Tier, TierLimits>,
    /// Per-attempt LLM call budget.
    pub llm_timeout: Duration,
    /// Base URL used to build `results_url` links in SSE complete events.
    pub results_base_url: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            master_key: String::new(),
            database_url: String::new(),
            blob: None,
            jwks_url: None,
            providers: vec![
                ProviderEndpoint {
                    name: "openai".to_string(),
                    base_url: "https://api.openai.com".to_string(),
                },
                ProviderEndpoint {
                    name: "anthropic".to_string(),
                    base_url: "https://api.anthropic.com".to_string(),
                },
                ProviderEndpoint {
                    name: "openrouter".to_string(),
                    base_url: "https://openrouter.ai/api".to_string(),
                },
            ],
            webhook_pool_size: 4,
            free_fallback_model: "meta-llama/llama-3.1-8b-instruct:free".to_string(),
            tier_limits: HashMap::new(),
            llm_timeout: Duration::from_secs(120),
            results_base_url: "/api/v1".to_string(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from the environment.
    ///
    /// # Errors
    ///
    /// Fails with an `unknown`-kind error when a required variable is
    /// missing or malformed; startup should abort on any error here.
    pub fn from_env() -> ExtractResult<Self> {
        let mut config = Self::default();

        warn_unknown_vars();

        config.master_key = require("PAGESIFT_MASTER_KEY")?;
        config.database_url = require("PAGESIFT_DATABASE_URL")?;
        config.jwks_url = std::env::var("PAGESIFT_JWKS_URL").ok();
        config.results_base_url =
            std::env::var("PAGESIFT_RESULTS_BASE_URL").unwrap_or(config.results_base_url);

        if let Ok(endpoint) = std::env::var("PAGESIFT_BLOB_ENDPOINT") {
            config.blob = Some(BlobConfig {
                endpoint,
                access_key: require("PAGESIFT_BLOB_ACCESS_KEY")?,
                secret_key: require("PAGESIFT_BLOB_SECRET_KEY")?,
                bucket: require("PAGESIFT_BLOB_BUCKET")?,
            });
        }

        if let Ok(spec) = std::env::var("PAGESIFT_PROVIDERS") {
            config.providers = parse_providers(&spec)?;
        }

        if let Ok(raw) = std::env::var("PAGESIFT_WEBHOOK_POOL_SIZE") {
            config.webhook_pool_size = raw.parse().map_err(|_| {
                ExtractError::unknown(format!("PAGESIFT_WEBHOOK_POOL_SIZE is not a number: {raw}"))
            })?;
        }

        if let Ok(model) = std::env::var("PAGESIFT_FREE_FALLBACK_MODEL") {
            config.free_fallback_model = model;
        }

        if let Ok(raw) = std::env::var("PAGESIFT_TIER_LIMITS") {
            config.tier_limits = serde_json::from_str(&raw).map_err(|e| {
                ExtractError::unknown(format!("PAGESIFT_TIER_LIMITS is not valid JSON: {e}"))
            })?;
        }

        if let Ok(raw) = std::env::var("PAGESIFT_LLM_TIMEOUT_SECS") {
            let secs: u64 = raw.parse().map_err(|_| {
                ExtractError::unknown(format!("PAGESIFT_LLM_TIMEOUT_SECS is not a number: {raw}"))
            })?;
            config.llm_timeout = Duration::from_secs(secs);
        }

        config.validate()?;

        log_debug!(
            providers = config.providers.len(),
            webhook_pool = config.webhook_pool_size,
            has_blob = config.blob.is_some(),
            "Service configuration loaded"
        );

        Ok(config)
    }

    /// Validate the assembled configuration.
    pub fn validate(&self) -> ExtractResult<()> {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&self.master_key)
            .map_err(|_| ExtractError::unknown("PAGESIFT_MASTER_KEY is not valid base64"))?;
        if decoded.len() != 32 {
            return Err(ExtractError::unknown(format!(
                "PAGESIFT_MASTER_KEY must decode to 32 bytes, got {}",
                decoded.len()
            )));
        }
        if self.database_url.is_empty() {
            return Err(ExtractError::unknown("PAGESIFT_DATABASE_URL is empty"));
        }
        if self.providers.is_empty() {
            return Err(ExtractError::unknown("no LLM providers enabled"));
        }
        if self.webhook_pool_size == 0 {
            return Err(ExtractError::unknown("webhook pool size must be >= 1"));
        }
        Ok(())
    }

    /// Limits for a tier, honoring configured overrides.
    pub fn limits_for(&self, tier: Tier) -> TierLimits {
        self.tier_limits
            .get(&tier)
            .cloned()
            .unwrap_or_else(|| tier.default_limits())
    }

    /// Base URL for the named provider, if enabled.
    pub fn provider_base_url(&self, name: &str) -> Option<&str> {
        self.providers
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.base_url.as_str())
    }
}

fn require(var: &str) -> ExtractResult<String> {
    std::env::var(var).map_err(|_| ExtractError::unknown(format!("{var} is required")))
}

/// Parse `name=base_url,name=base_url` (base_url optional per entry).
fn parse_providers(spec: &str) -> ExtractResult<Vec<ProviderEndpoint>> {
    let defaults = ServiceConfig::default().providers;
    let mut out = Vec::new();
    for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, base_url) = match entry.split_once('=') {
            Some((n, u)) => (n.trim().to_string(), u.trim().to_string()),
            None => {
                let name = entry.to_string();
                let url = defaults
                    .iter()
                    .find(|p| p.name == name)
                    .map(|p| p.base_url.clone())
                    .ok_or_else(|| {
                        ExtractError::unknown(format!(
                            "provider '{name}' has no default base URL; use name=url"
                        ))
                    })?;
                (name, url)
            }
        };
        out.push(ProviderEndpoint { name, base_url });
    }
    Ok(out)
}

fn warn_unknown_vars() {
    for (key, _) in std::env::vars() {
        if key.starts_with(ENV_PREFIX) && !KNOWN_VARS.contains(&key.as_str()) {
            log_warn!(var = %key, "Ignoring unknown configuration variable");
        }
    }
}
