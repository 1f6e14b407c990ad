//! Key material helpers.
//!
//! API keys are opaque `tk_`-prefixed tokens. The plaintext is returned to
//! the caller exactly once at issue time; storage keeps only the SHA-256
//! hex hash (for cache lookups) and an AES-256-GCM ciphertext.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

/// Generate a fresh API key: `tk_` followed by 32 hex chars.
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("tk_{}", hex::encode(bytes))
}

/// SHA-256 hex digest of a key. Lookups go through this hash, so raw key
/// bytes never index anything.
pub fn hash_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// AES-256-GCM wrapper around stored secrets. The 32-byte key is loaded
/// from the environment at boot and never persisted.
pub struct KeyCipher {
    cipher: Aes256Gcm,
}

impl KeyCipher {
    pub fn from_base64(key_b64: &str) -> Result<Self> {
        let key_bytes = BASE64
            .decode(key_b64)
            .context("encryption key is not valid base64")?;
        if key_bytes.len() != 32 {
            return Err(anyhow!(
                "encryption key must be 32 bytes, got {}",
                key_bytes.len()
            ));
        }
        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|_| anyhow!("failed to build cipher"))?;
        Ok(Self { cipher })
    }

    /// Encrypt to base64(nonce || ciphertext).
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| anyhow!("encryption failed"))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let raw = BASE64.decode(encoded).context("ciphertext is not valid base64")?;
        if raw.len() <= NONCE_LEN {
            return Err(anyhow!("ciphertext too short"));
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| anyhow!("decryption failed: wrong key or corrupt data"))?;
        String::from_utf8(plaintext).context("decrypted secret is not utf-8")
    }
}
