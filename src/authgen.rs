use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use ed25519_dalek::{Signer, SigningKey};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::error::{CoreError, CoreResult};
use crate::keymanager::KeyManager;

/// Produces the signed `Authorization` header participants attach to
/// outbound calls (spec §4.E). Treated as a capability interface: the exact
/// header wire format is out of scope (§1 Non-goals), this covers the
/// signing step every caller of it needs.
#[async_trait]
pub trait AuthGen: Send + Sync {
    async fn auth_header(&self, body: &[u8], key_id: &str) -> CoreResult<String>;
}

/// Signs a digest of the request body with the participant's own Ed25519
/// signing key, pulled from the Key Manager on every call — correctness
/// over the thundering-herd variant's caching lives in the Key Manager
/// layer, not here.
pub struct SigningAuthGen {
    key_manager: Arc<dyn KeyManager>,
    subscriber_id: String,
}

impl SigningAuthGen {
    pub fn new(key_manager: Arc<dyn KeyManager>, subscriber_id: String) -> Self {
        Self {
            key_manager,
            subscriber_id,
        }
    }
}

#[async_trait]
impl AuthGen for SigningAuthGen {
    async fn auth_header(&self, body: &[u8], key_id: &str) -> CoreResult<String> {
        let keyset = self.key_manager.keyset(key_id).await?;

        let raw = STANDARD
            .decode(&keyset.signing_private)
            .map_err(|e| CoreError::transient("decoding signing private key", e))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| CoreError::Transient("signing key must be 32 bytes".to_string()))?;
        let signing_key = SigningKey::from_bytes(&bytes);

        let digest = Sha256::digest(body);
        let created = Utc::now().timestamp();
        let expires = created + 300;

        let signing_string = format!(
            "(created): {created}\n(expires): {expires}\ndigest: BLAKE-512={}",
            STANDARD.encode(digest)
        );
        let signature = signing_key.sign(signing_string.as_bytes());

        Ok(format!(
            "Signature keyId=\"{}|{}|ed25519\",algorithm=\"ed25519\",created=\"{}\",expires=\"{}\",headers=\"(created) (expires) digest\",signature=\"{}\"",
            self.subscriber_id,
            key_id,
            created,
            expires,
            STANDARD.encode(signature.to_bytes()),
        ))
    }
}
