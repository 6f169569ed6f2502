use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{CoreError, CoreResult};
use crate::model::Keyset;
use crate::repository::Repository;

use super::secretmanager::SecretManagerClient;
use super::{secret_id, KeyManager, KeyManagerConfig};

/// External cache used for public-key lookups. Narrowed to the
/// get/set-with-ttl shape `LookupNPKeys` needs (spec §4.B step 3).
#[async_trait]
pub trait ExternalCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<Vec<u8>>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration);
}

#[derive(serde::Serialize, serde::Deserialize)]
struct NpKeys {
    signing_public: String,
    encr_public: String,
}

/// Single external cache + Secret Manager, no in-process TTL cache or
/// thundering-herd suppression (spec §4.B "simple" variant).
pub struct SimpleKeyManager {
    config: KeyManagerConfig,
    secrets: Arc<dyn SecretManagerClient>,
    external_cache: Option<Arc<dyn ExternalCache>>,
    repository: Arc<dyn Repository>,
}

impl SimpleKeyManager {
    pub fn new(
        config: KeyManagerConfig,
        secrets: Arc<dyn SecretManagerClient>,
        external_cache: Option<Arc<dyn ExternalCache>>,
        repository: Arc<dyn Repository>,
    ) -> CoreResult<Self> {
        Ok(Self {
            config: config.validate()?,
            secrets,
            external_cache,
            repository,
        })
    }
}

#[async_trait]
impl KeyManager for SimpleKeyManager {
    fn generate_keyset(&self) -> CoreResult<Keyset> {
        Ok(super::crypto::generate_keyset())
    }

    async fn insert_keyset(&self, key_id: &str, keyset: Keyset) -> CoreResult<()> {
        insert_keyset_impl(self.secrets.as_ref(), key_id, &keyset).await
    }

    async fn keyset(&self, key_id: &str) -> CoreResult<Keyset> {
        let sid = secret_id(key_id);
        let payload = self
            .secrets
            .access_latest(&sid)
            .await?
            .ok_or_else(|| CoreError::KeysetNotFound(key_id.to_string()))?;
        serde_json::from_slice(&payload)
            .map_err(|e| CoreError::transient("decoding keyset json", e))
    }

    async fn delete_keyset(&self, key_id: &str) -> CoreResult<()> {
        let sid = secret_id(key_id);
        self.secrets.delete_secret(&sid).await
    }

    async fn lookup_np_keys(
        &self,
        subscriber_id: &str,
        unique_key_id: &str,
    ) -> CoreResult<(String, String)> {
        lookup_np_keys_impl(
            self.external_cache.as_deref(),
            self.repository.as_ref(),
            self.config.public_ttl,
            subscriber_id,
            unique_key_id,
        )
        .await
    }

    async fn close(&self) {
        // No in-process cache to wipe in the simple variant.
    }
}

pub(super) async fn insert_keyset_impl(
    secrets: &dyn SecretManagerClient,
    key_id: &str,
    keyset: &Keyset,
) -> CoreResult<()> {
    if key_id.trim().is_empty() {
        return Err(CoreError::EmptyKeyID);
    }
    let sid = secret_id(key_id);
    secrets.create_secret(&sid).await?;
    let payload =
        serde_json::to_vec(keyset).map_err(|e| CoreError::transient("encoding keyset json", e))?;
    secrets.add_version(&sid, payload).await
}

pub(super) async fn lookup_np_keys_impl(
    external_cache: Option<&dyn ExternalCache>,
    repository: &dyn Repository,
    public_ttl: Duration,
    subscriber_id: &str,
    unique_key_id: &str,
) -> CoreResult<(String, String)> {
    if subscriber_id.trim().is_empty() {
        return Err(CoreError::EmptySubscriberID);
    }
    if unique_key_id.trim().is_empty() {
        return Err(CoreError::EmptyUniqueKeyID);
    }

    let cache_key = format!("{subscriber_id}_{unique_key_id}");

    if let Some(cache) = external_cache {
        if let Some(bytes) = cache.get(&cache_key).await {
            if let Ok(keys) = serde_json::from_slice::<NpKeys>(&bytes) {
                return Ok((keys.signing_public, keys.encr_public));
            }
        }
    }

    let filter = crate::model::SubscriptionFilter::new()
        .with_subscriber_id(subscriber_id)
        .with_key_id(unique_key_id);
    let found = repository.lookup(&filter).await?;
    let sub = found
        .into_iter()
        .next()
        .ok_or_else(|| CoreError::SubscriberNotFound(subscriber_id.to_string()))?;

    if let Some(cache) = external_cache {
        let payload = serde_json::to_vec(&NpKeys {
            signing_public: sub.signing_public_key.clone(),
            encr_public: sub.encr_public_key.clone(),
        });
        if let Ok(payload) = payload {
            cache.set(&cache_key, payload, public_ttl).await;
        } else {
            tracing::warn!(subscriber_id, "failed to serialize NP keys for cache set");
        }
    }

    Ok((sub.signing_public_key, sub.encr_public_key))
}
