pub mod cache;
pub mod crypto;
pub mod secretmanager;
pub mod simple;
pub mod thundering_herd;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use sha2::{Digest, Sha256};

use crate::error::CoreResult;
use crate::model::Keyset;

pub use simple::SimpleKeyManager;
pub use thundering_herd::ThunderingHerdKeyManager;

#[derive(Debug, Clone)]
pub struct KeyManagerConfig {
    pub project_id: String,
    pub private_ttl: std::time::Duration,
    pub public_ttl: std::time::Duration,
}

impl KeyManagerConfig {
    pub fn validate(self) -> CoreResult<Self> {
        if self.private_ttl.is_zero() || self.public_ttl.is_zero() {
            return Err(crate::error::CoreError::Transient(
                "cache_ttl.private_seconds and cache_ttl.public_seconds must be > 0".to_string(),
            ));
        }
        Ok(self)
    }
}

/// Private-keyset storage (Secret Manager) plus NP public-key lookup, with a
/// two-tier cache (spec §4.B). The `simple` and `thundering_herd` variants
/// share this interface.
#[async_trait]
pub trait KeyManager: Send + Sync {
    fn generate_keyset(&self) -> CoreResult<Keyset>;

    async fn insert_keyset(&self, key_id: &str, keyset: Keyset) -> CoreResult<()>;

    async fn keyset(&self, key_id: &str) -> CoreResult<Keyset>;

    async fn delete_keyset(&self, key_id: &str) -> CoreResult<()>;

    async fn lookup_np_keys(
        &self,
        subscriber_id: &str,
        unique_key_id: &str,
    ) -> CoreResult<(String, String)>;

    /// Zeroes all residual cached private-key bytes and releases the Secret
    /// Manager client (spec §9, ownership of cached private keys).
    async fn close(&self);
}

/// Deterministic secret identifier for a `key_id` (spec §4.B). Pure
/// function — every implementation must agree bit-exactly: characters
/// outside `[A-Za-z0-9_-]` become `-`, the prefix is truncated to
/// `255 - 43 - 1 = 211` bytes, then `_` and the base64url-no-padding
/// SHA-256 of the *original* `key_id` are appended.
pub fn secret_id(key_id: &str) -> String {
    const MAX_PREFIX_LEN: usize = 255 - 43 - 1;

    let sanitized: String = key_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();

    let mut prefix_bytes: Vec<u8> = sanitized.into_bytes();
    prefix_bytes.truncate(MAX_PREFIX_LEN);
    // Truncation must not land mid-codepoint; ASCII-only output from the map
    // above guarantees every byte is a full codepoint, so this is always safe.
    let prefix = String::from_utf8(prefix_bytes).expect("sanitized input is ASCII-only");

    let digest = Sha256::digest(key_id.as_bytes());
    let suffix = URL_SAFE_NO_PAD.encode(digest);

    format!("{prefix}_{suffix}")
}
