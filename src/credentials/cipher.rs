//! Credential cipher — AES-256-GCM under a process-level master key.
//!
//! Ciphertext layout: nonce (12) || ciphertext+tag. The master key arrives
//! base64-encoded from configuration and is zeroized when the cipher drops.

use crate::error::{ExtractError, ExtractResult};
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::Engine;
use rand::RngCore;
use zeroize::Zeroize;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Symmetric cipher for credentials at rest.
pub struct CredentialCipher {
    key: [u8; 32],
}

impl CredentialCipher {
    /// Build from the base64-encoded master key in configuration.
    pub fn from_base64(master_key: &str) -> ExtractResult<Self> {
        let mut decoded = base64::engine::general_purpose::STANDARD
            .decode(master_key)
            .map_err(|_| ExtractError::unknown("master key is not valid base64"))?;
        if decoded.len() != 32 {
            decoded.zeroize();
            return Err(ExtractError::unknown("master key must decode to 32 bytes"));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&decoded);
        decoded.zeroize();
        Ok(Self { key })
    }

    /// Encrypt a plaintext credential.
    pub fn encrypt(&self, plaintext: &[u8]) -> ExtractResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| ExtractError::unknown("cipher key length invalid"))?;
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| ExtractError::unknown("credential encryption failed"))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt ciphertext produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, data: &[u8]) -> ExtractResult<Vec<u8>> {
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(ExtractError::unknown("credential ciphertext too short"));
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| ExtractError::unknown("cipher key length invalid"))?;
        let nonce = Nonce::from_slice(nonce_bytes);
        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| ExtractError::unknown("credential decryption failed"))
    }
}

impl Drop for CredentialCipher {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose key material through Debug.
        f.debug_struct("CredentialCipher").finish_non_exhaustive()
    }
}
