//! Fallback-chain resolver.
//!
//! Builds the ordered, deduplicated candidate list for one request from
//! (highest priority first): the per-request BYOK override, a
//! claims-injected chain, the user's saved chain, the admin chain scoped to
//! the user's tier, and finally the free-tier fallback model. An empty
//! result is a `tier_feature_disabled` failure — there is nothing the
//! executor could try.

use crate::chain::{ChainEntry, CredentialSource, FallbackChain, LlmCandidate};
use crate::credentials::CredentialStore;
use crate::error::{ExtractError, ExtractResult};
use crate::logging::{log_debug, log_warn};
use crate::providers::is_premium_model;
use crate::tier::{Tier, UserContext};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::RwLock;

/// Per-request LLM override from the request body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestLlmOverride {
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Resolves chains into candidate lists. Process-wide, read-mostly; chain
/// writes (admin updates, `PUT /llm/chain`) invalidate in place.
pub struct ChainResolver {
    credentials: Arc<CredentialStore>,
    /// Admin chains keyed by tier scope; `None` is the default chain.
    admin_chains: RwLock<std::collections::HashMap<Option<Tier>, FallbackChain>>,
    user_chains: DashMap<String, FallbackChain>,
    enabled_providers: HashSet<String>,
    free_fallback_model: String,
}

impl ChainResolver {
    pub fn new(
        credentials: Arc<CredentialStore>,
        enabled_providers: impl IntoIterator<Item = String>,
        free_fallback_model: String,
    ) -> Self {
        Self {
            credentials,
            admin_chains: RwLock::new(std::collections::HashMap::new()),
            user_chains: DashMap::new(),
            enabled_providers: enabled_providers.into_iter().collect(),
            free_fallback_model,
        }
    }

    /// Replace the admin chain for a tier scope (`None` = default).
    pub fn set_admin_chain(&self, scope: Option<Tier>, chain: FallbackChain) {
        self.admin_chains
            .write()
            .expect("admin chain lock poisoned")
            .insert(scope, chain);
    }

    /// Replace a user's saved chain.
    pub fn set_user_chain(&self, user_id: &str, chain: FallbackChain) {
        self.user_chains.insert(user_id.to_string(), chain);
    }

    pub fn user_chain(&self, user_id: &str) -> Option<FallbackChain> {
        self.user_chains.get(user_id).map(|c| c.clone())
    }

    /// Build the candidate list for one request.
    pub fn resolve(
        &self,
        user: &UserContext,
        request_override: Option<&RequestLlmOverride>,
        claims_chain: Option<&FallbackChain>,
    ) -> ExtractResult<Vec<LlmCandidate>> {
        let features = user.features();
        let mut out: Vec<LlmCandidate> = Vec::new();
        let mut dropped_premium = false;

        // 1. Per-request override with an inline key (BYOK).
        if let Some(req) = request_override {
            match (&req.api_key, features.provider_byok) {
                (Some(key), true) => out.push(LlmCandidate {
                    provider: req.provider.clone(),
                    model: req.model.clone(),
                    base_url: req.base_url.clone(),
                    credential: CredentialSource::Inline(key.clone()),
                    temperature: req.temperature,
                    max_tokens: req.max_tokens,
                    is_byok: true,
                    charged: false,
                }),
                (Some(_), false) => {
                    log_warn!(
                        user_id = %user.user_id,
                        "Request carries an inline key but tier lacks provider_byok; ignoring"
                    );
                }
                (None, _) => {
                    log_warn!(
                        user_id = %user.user_id,
                        "Request llm_config without api_key has no effect; ignoring"
                    );
                }
            }
        }

        // 2. Claims-injected chain. Trusted as resolved by the identity
        // layer, so no premium filtering here.
        if let Some(chain) = claims_chain {
            for entry in chain.active_entries() {
                out.push(self.platform_candidate(entry, None));
            }
        }

        // 3. User's saved chain, gated by models_custom.
        if features.models_custom {
            if let Some(chain) = self.user_chains.get(&user.user_id) {
                for entry in chain.active_entries() {
                    if !self.enabled_providers.contains(&entry.provider) {
                        continue;
                    }
                    if !features.models_premium && is_premium_model(&entry.provider, &entry.model)
                    {
                        dropped_premium = true;
                        continue;
                    }
                    // Prefer the user's own stored key when BYOK is allowed.
                    let owner = (features.provider_byok
                        && self
                            .credentials
                            .has_key(&entry.provider, Some(&user.user_id)))
                    .then(|| user.user_id.clone());
                    out.push(self.platform_candidate(entry, owner));
                }
            }
        }

        // 4. Admin chain scoped to the tier, else the default chain.
        {
            let chains = self.admin_chains.read().expect("admin chain lock poisoned");
            let chain = chains
                .get(&Some(user.tier))
                .or_else(|| chains.get(&None));
            if let Some(chain) = chain {
                for entry in chain.active_entries() {
                    if entry.tier_scope.is_some_and(|scope| scope != user.tier) {
                        continue;
                    }
                    if !self.enabled_providers.contains(&entry.provider) {
                        continue;
                    }
                    if !features.models_premium && is_premium_model(&entry.provider, &entry.model)
                    {
                        dropped_premium = true;
                        continue;
                    }
                    out.push(self.platform_candidate(entry, None));
                }
            }
        }

        // 5. Free-tier last resort when premium filtering emptied the list.
        if out.is_empty() && dropped_premium {
            out.push(LlmCandidate {
                provider: "openrouter".to_string(),
                model: self.free_fallback_model.clone(),
                base_url: None,
                credential: CredentialSource::Stored { owner: None },
                temperature: None,
                max_tokens: None,
                is_byok: false,
                charged: false,
            });
        }

        dedup(&mut out);

        if out.is_empty() {
            return Err(ExtractError::tier_feature_disabled(
                "no usable model candidates for this tier",
            ));
        }

        log_debug!(
            user_id = %user.user_id,
            candidates = out.len(),
            first_provider = %out[0].provider,
            first_model = %out[0].model,
            "Resolved fallback candidates"
        );

        Ok(out)
    }

    fn platform_candidate(&self, entry: &ChainEntry, byok_owner: Option<String>) -> LlmCandidate {
        let is_byok = byok_owner.is_some();
        LlmCandidate {
            provider: entry.provider.clone(),
            model: entry.model.clone(),
            base_url: entry.base_url.clone(),
            credential: CredentialSource::Stored { owner: byok_owner },
            temperature: entry.temperature,
            max_tokens: entry.max_tokens,
            is_byok,
            charged: !is_byok,
        }
    }
}

/// Keep the first occurrence of each (provider, model, credential) tuple.
fn dedup(candidates: &mut Vec<LlmCandidate>) {
    let mut seen = HashSet::new();
    candidates.retain(|c| seen.insert(c.dedup_key()));
}
