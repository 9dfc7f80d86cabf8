//! Fallback chains and resolved candidates.
//!
//! A [`FallbackChain`] is an ordered list of template entries owned by an
//! admin scope, a user, or injected through claims. At admission the
//! resolver flattens the applicable chains into [`LlmCandidate`] values —
//! concrete (provider, model, credential) tuples the executor can try in
//! order. Candidates are transient: they live with the in-memory job
//! execution and only the winning entry's provider/model is persisted.

pub mod executor;
pub mod resolver;

pub use executor::{AttemptRecord, ChainExecutor, ChainSuccess};
pub use resolver::ChainResolver;

use crate::tier::Tier;
use serde::{Deserialize, Serialize};

/// Where a candidate's credential comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// Key supplied inline on the request (BYOK). Never persisted.
    Inline(String),
    /// Key held by the credential store; `owner = None` is the admin
    /// service key.
    Stored { owner: Option<String> },
}

impl CredentialSource {
    /// Stable identity for candidate deduplication.
    pub(crate) fn dedup_key(&self) -> String {
        match self {
            Self::Inline(key) => format!("inline:{key}"),
            Self::Stored { owner: Some(user) } => format!("stored:{user}"),
            Self::Stored { owner: None } => "stored:admin".to_string(),
        }
    }
}

/// A resolved (provider, model, credential) tuple usable for one LLM call.
#[derive(Debug, Clone)]
pub struct LlmCandidate {
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub credential: CredentialSource,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    /// Caller supplies the credential; the platform never charges.
    pub is_byok: bool,
    /// Whether a winning attempt on this candidate posts charged cost.
    pub charged: bool,
}

impl LlmCandidate {
    pub(crate) fn dedup_key(&self) -> (String, String, String) {
        (
            self.provider.clone(),
            self.model.clone(),
            self.credential.dedup_key(),
        )
    }
}

/// One template entry of a stored chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainEntry {
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    pub position: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Restricts an admin entry to one tier; `None` applies everywhere.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier_scope: Option<Tier>,
}

fn default_enabled() -> bool {
    true
}

/// An ordered list of chain entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FallbackChain {
    pub entries: Vec<ChainEntry>,
}

impl FallbackChain {
    pub fn new(mut entries: Vec<ChainEntry>) -> Self {
        entries.sort_by_key(|e| e.position);
        Self { entries }
    }

    /// Enabled entries in position order.
    pub fn active_entries(&self) -> impl Iterator<Item = &ChainEntry> {
        self.entries.iter().filter(|e| e.enabled)
    }
}
