//! Encrypted provider-credential store.
//!
//! Holds the admin service keys (`owner = None`) and per-user BYOK keys.
//! Values are encrypted with [`CredentialCipher`] before they enter the
//! store; [`CredentialStore::get`] decrypts in memory and hands the
//! plaintext out by ownership as a [`PlaintextKey`], which zeroizes itself
//! when the transport drops it. Listings only ever report `has_key`.

pub mod cipher;

pub use cipher::CredentialCipher;

use crate::error::{ExtractError, ExtractResult};
use crate::logging::log_info;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use zeroize::Zeroize;

/// Decrypted credential, passed by ownership into a provider transport.
pub struct PlaintextKey(String);

impl PlaintextKey {
    /// Wrap an already-decrypted key, e.g. a BYOK value from a request.
    pub fn new(value: String) -> Self {
        Self(value)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl Drop for PlaintextKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for PlaintextKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PlaintextKey(..)")
    }
}

/// A stored credential row. The key never leaves this module decrypted
/// except through [`CredentialStore::get`].
#[derive(Debug, Clone)]
struct Credential {
    provider: String,
    owner: Option<String>,
    encrypted_key: Vec<u8>,
    base_url: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Listing view; presence only, no key material.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialView {
    pub provider: String,
    /// `None` for the admin service key.
    pub owner: Option<String>,
    pub has_key: bool,
    pub base_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The decrypted result of a `get`.
#[derive(Debug)]
pub struct ResolvedCredential {
    pub key: PlaintextKey,
    pub base_url: Option<String>,
}

/// Process-wide credential store.
///
/// Read-mostly; upserts and deletes invalidate in place. The map is the
/// cache — durable persistence sits behind the storage collaborator.
pub struct CredentialStore {
    cipher: Arc<CredentialCipher>,
    entries: DashMap<(String, Option<String>), Credential>,
}

impl CredentialStore {
    pub fn new(cipher: Arc<CredentialCipher>) -> Self {
        Self {
            cipher,
            entries: DashMap::new(),
        }
    }

    /// Decrypt and return the credential for (provider, owner).
    ///
    /// BYOK lookups pass the owning user; admin service keys use
    /// `owner = None`. Missing rows return `Ok(None)` so the resolver can
    /// skip candidates without a usable credential.
    pub fn get(&self, provider: &str, owner: Option<&str>) -> ExtractResult<Option<ResolvedCredential>> {
        let key = (provider.to_string(), owner.map(str::to_string));
        let Some(entry) = self.entries.get(&key) else {
            return Ok(None);
        };
        let mut plaintext = self.cipher.decrypt(&entry.encrypted_key)?;
        let value = String::from_utf8(plaintext.clone())
            .map_err(|_| ExtractError::unknown("stored credential is not valid UTF-8"))?;
        plaintext.zeroize();
        Ok(Some(ResolvedCredential {
            key: PlaintextKey::new(value),
            base_url: entry.base_url.clone(),
        }))
    }

    /// Insert or replace a credential.
    pub fn upsert(
        &self,
        provider: &str,
        owner: Option<&str>,
        raw_key: &str,
        base_url: Option<String>,
    ) -> ExtractResult<()> {
        let encrypted = self.cipher.encrypt(raw_key.as_bytes())?;
        let now = Utc::now();
        let map_key = (provider.to_string(), owner.map(str::to_string));
        let created_at = self
            .entries
            .get(&map_key)
            .map(|e| e.created_at)
            .unwrap_or(now);
        self.entries.insert(
            map_key,
            Credential {
                provider: provider.to_string(),
                owner: owner.map(str::to_string),
                encrypted_key: encrypted,
                base_url,
                created_at,
                updated_at: now,
            },
        );
        log_info!(
            provider = provider,
            byok = owner.is_some(),
            "Credential stored"
        );
        Ok(())
    }

    /// Remove a credential. Returns whether a row existed.
    pub fn delete(&self, provider: &str, owner: Option<&str>) -> bool {
        let removed = self
            .entries
            .remove(&(provider.to_string(), owner.map(str::to_string)))
            .is_some();
        if removed {
            log_info!(provider = provider, byok = owner.is_some(), "Credential removed");
        }
        removed
    }

    /// List credentials for an owner (or the admin set for `None`).
    pub fn list(&self, owner: Option<&str>) -> Vec<CredentialView> {
        let mut views: Vec<CredentialView> = self
            .entries
            .iter()
            .filter(|e| e.owner.as_deref() == owner)
            .map(|e| CredentialView {
                provider: e.provider.clone(),
                owner: e.owner.clone(),
                has_key: true,
                base_url: e.base_url.clone(),
                created_at: e.created_at,
                updated_at: e.updated_at,
            })
            .collect();
        views.sort_by(|a, b| a.provider.cmp(&b.provider));
        views
    }

    /// Whether any credential exists for (provider, owner).
    pub fn has_key(&self, provider: &str, owner: Option<&str>) -> bool {
        self.entries
            .contains_key(&(provider.to_string(), owner.map(str::to_string)))
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("entries", &self.entries.len())
            .finish()
    }
}
