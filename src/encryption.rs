use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, KeyInit, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::sync::Arc;
use tokio::sync::Mutex;
use x25519_dalek::{PublicKey as XPublicKey, StaticSecret};

use crate::error::{CoreError, CoreResult};
use crate::keymanager::secretmanager::SecretManagerClient;

/// Capability interface for the envelope-encryption primitive the spec
/// treats as external (§1 Non-goals: "signing primitives ... treated as a
/// capability interface"). `ChaChaEcdhEncrypter` is the concrete stand-in:
/// X25519 ECDH, HKDF-SHA256 key derivation, ChaCha20-Poly1305 AEAD.
#[async_trait]
pub trait Encrypter: Send + Sync {
    async fn encrypt(&self, data: &[u8], peer_public_b64: &str) -> CoreResult<Vec<u8>>;
}

pub struct ChaChaEcdhEncrypter {
    my_private_b64: String,
}

impl ChaChaEcdhEncrypter {
    pub fn new(my_private_b64: String) -> Self {
        Self { my_private_b64 }
    }
}

fn decode_static_secret(b64: &str) -> CoreResult<StaticSecret> {
    let bytes = STANDARD
        .decode(b64)
        .map_err(|e| CoreError::transient("decoding private key", e))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CoreError::Transient("private key must be 32 bytes".to_string()))?;
    Ok(StaticSecret::from(arr))
}

fn decode_public(b64: &str) -> CoreResult<XPublicKey> {
    let bytes = STANDARD
        .decode(b64)
        .map_err(|e| CoreError::transient("decoding peer public key", e))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CoreError::Transient("public key must be 32 bytes".to_string()))?;
    Ok(XPublicKey::from(arr))
}

#[async_trait]
impl Encrypter for ChaChaEcdhEncrypter {
    async fn encrypt(&self, data: &[u8], peer_public_b64: &str) -> CoreResult<Vec<u8>> {
        let my_private = decode_static_secret(&self.my_private_b64)?;
        let peer_public = decode_public(peer_public_b64)?;

        let shared = my_private.diffie_hellman(&peer_public);
        let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut okm = [0u8; 32];
        hk.expand(b"np-registry-envelope", &mut okm)
            .map_err(|e| CoreError::transient("hkdf expand failed", e))?;

        let cipher = ChaCha20Poly1305::new((&okm).into());
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, data)
            .map_err(|e| CoreError::Transient(format!("envelope encryption failed: {e}")))?;

        // Nonce is public and travels with the ciphertext.
        let mut out = nonce_bytes.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }
}

/// Wraps the envelope-encryption primitive, lazily loading this
/// participant's own private key from Secret Manager (spec §4.D).
pub struct EncryptionService {
    project_id: String,
    key_id: String,
    secrets: Arc<dyn SecretManagerClient>,
    cached_private: Mutex<Option<String>>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct EncrKeyPayload {
    unique_key_id: String,
    encr_private: String,
    encr_public: String,
}

impl EncryptionService {
    pub fn new(project_id: String, key_id: String, secrets: Arc<dyn SecretManagerClient>) -> Self {
        Self {
            project_id,
            key_id,
            secrets,
            cached_private: Mutex::new(None),
        }
    }

    /// On first use, accesses the latest version of the `key_id` secret. If
    /// present, returns its public key. If absent, generates a fresh X25519
    /// pair, creates the secret container via `create_secret_if_absent`
    /// (ignoring AlreadyExists without deleting any version a racing caller
    /// may already have added — distinct from `InsertKeyset`'s
    /// delete-and-recurse `create_secret`), adds a version, and returns the
    /// new public key (spec §4.D `Init`).
    pub async fn init(&self) -> CoreResult<String> {
        let sid = crate::keymanager::secret_id(&self.key_id);

        if let Some(payload) = self.secrets.access_latest(&sid).await? {
            let decoded: EncrKeyPayload = serde_json::from_slice(&payload)
                .map_err(|e| CoreError::transient("decoding encryption key payload", e))?;
            *self.cached_private.lock().await = Some(decoded.encr_private.clone());
            return Ok(decoded.encr_public);
        }

        let keyset = crate::keymanager::crypto::generate_keyset();
        self.secrets.create_secret_if_absent(&sid).await?;

        let payload = EncrKeyPayload {
            unique_key_id: keyset.unique_key_id,
            encr_private: keyset.encr_private.clone(),
            encr_public: keyset.encr_public.clone(),
        };
        let bytes = serde_json::to_vec(&payload)
            .map_err(|e| CoreError::transient("encoding encryption key payload", e))?;
        self.secrets.add_version(&sid, bytes).await?;

        *self.cached_private.lock().await = Some(keyset.encr_private.clone());
        tracing::info!(project_id = %self.project_id, key_id = %self.key_id, "generated new encryption keypair");
        Ok(keyset.encr_public)
    }

    pub async fn encrypt(&self, data: &[u8], peer_public_b64: &str) -> CoreResult<Vec<u8>> {
        let private = {
            let guard = self.cached_private.lock().await;
            guard.clone()
        };
        let private = match private {
            Some(p) => p,
            None => {
                self.init().await?;
                self.cached_private
                    .lock()
                    .await
                    .clone()
                    .expect("init() always populates cached_private")
            }
        };

        ChaChaEcdhEncrypter::new(private)
            .encrypt(data, peer_public_b64)
            .await
    }
}

#[async_trait]
impl Encrypter for EncryptionService {
    async fn encrypt(&self, data: &[u8], peer_public_b64: &str) -> CoreResult<Vec<u8>> {
        EncryptionService::encrypt(self, data, peer_public_b64).await
    }
}
