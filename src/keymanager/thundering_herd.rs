use async_trait::async_trait;
use std::sync::Arc;

use crate::error::CoreResult;
use crate::model::Keyset;
use crate::repository::Repository;

use super::cache::PrivateKeyCache;
use super::secretmanager::SecretManagerClient;
use super::simple::{insert_keyset_impl, lookup_np_keys_impl, ExternalCache};
use super::{secret_id, KeyManager, KeyManagerConfig};

/// Adds an in-process TTL cache and a per-key in-flight request table in
/// front of the `simple` variant's Secret Manager calls, suppressing
/// thundering-herd fetches for private keysets (spec §4.B).
pub struct ThunderingHerdKeyManager {
    config: KeyManagerConfig,
    secrets: Arc<dyn SecretManagerClient>,
    external_cache: Option<Arc<dyn ExternalCache>>,
    repository: Arc<dyn Repository>,
    private_cache: PrivateKeyCache,
}

impl ThunderingHerdKeyManager {
    pub fn new(
        config: KeyManagerConfig,
        secrets: Arc<dyn SecretManagerClient>,
        external_cache: Option<Arc<dyn ExternalCache>>,
        repository: Arc<dyn Repository>,
    ) -> CoreResult<Self> {
        let config = config.validate()?;
        let private_cache = PrivateKeyCache::new(config.private_ttl);
        Ok(Self {
            config,
            secrets,
            external_cache,
            repository,
            private_cache,
        })
    }
}

#[async_trait]
impl KeyManager for ThunderingHerdKeyManager {
    fn generate_keyset(&self) -> CoreResult<Keyset> {
        Ok(super::crypto::generate_keyset())
    }

    async fn insert_keyset(&self, key_id: &str, keyset: Keyset) -> CoreResult<()> {
        insert_keyset_impl(self.secrets.as_ref(), key_id, &keyset).await?;
        self.private_cache.insert(&secret_id(key_id), keyset);
        Ok(())
    }

    async fn keyset(&self, key_id: &str) -> CoreResult<Keyset> {
        let sid = secret_id(key_id);
        let secrets = self.secrets.clone();
        let key_id = key_id.to_string();
        self.private_cache
            .get_or_fetch(&sid, || async move {
                let sid = secret_id(&key_id);
                let payload = secrets
                    .access_latest(&sid)
                    .await?
                    .ok_or_else(|| crate::error::CoreError::KeysetNotFound(key_id.clone()))?;
                serde_json::from_slice(&payload)
                    .map_err(|e| crate::error::CoreError::transient("decoding keyset json", e))
            })
            .await
    }

    async fn delete_keyset(&self, key_id: &str) -> CoreResult<()> {
        let sid = secret_id(key_id);
        // Cache first: a concurrent `keyset` call must not reload a stale
        // value mid-delete (spec §4.B `DeleteKeyset` ordering note).
        self.private_cache.remove(&sid);
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
        self.private_cache.clear_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keymanager::secretmanager::InMemorySecretManagerClient;
    use crate::testutil::InMemoryRepository;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingSecretManager {
        inner: InMemorySecretManagerClient,
        access_calls: AtomicUsize,
    }

    #[async_trait]
    impl SecretManagerClient for CountingSecretManager {
        async fn create_secret(&self, secret_id: &str) -> CoreResult<()> {
            self.inner.create_secret(secret_id).await
        }
        async fn create_secret_if_absent(&self, secret_id: &str) -> CoreResult<()> {
            self.inner.create_secret_if_absent(secret_id).await
        }
        async fn delete_secret(&self, secret_id: &str) -> CoreResult<()> {
            self.inner.delete_secret(secret_id).await
        }
        async fn add_version(&self, secret_id: &str, payload: Vec<u8>) -> CoreResult<()> {
            self.inner.add_version(secret_id, payload).await
        }
        async fn access_latest(&self, secret_id: &str) -> CoreResult<Option<Vec<u8>>> {
            self.access_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.access_latest(secret_id).await
        }
    }

    fn sample_keyset() -> Keyset {
        Keyset {
            unique_key_id: "u1".into(),
            signing_private: "sp".into(),
            signing_public: "SP".into(),
            encr_private: "ep".into(),
            encr_public: "EP".into(),
        }
    }

    #[tokio::test]
    async fn twenty_concurrent_keyset_calls_hit_secret_manager_once() {
        let secrets = Arc::new(CountingSecretManager {
            inner: InMemorySecretManagerClient::default(),
            access_calls: AtomicUsize::new(0),
        });
        let repository = Arc::new(InMemoryRepository::default());

        let manager = Arc::new(
            ThunderingHerdKeyManager::new(
                KeyManagerConfig {
                    project_id: "proj".into(),
                    private_ttl: Duration::from_secs(60),
                    public_ttl: Duration::from_secs(60),
                },
                secrets.clone(),
                None,
                repository,
            )
            .unwrap(),
        );

        manager.insert_keyset("k9", sample_keyset()).await.unwrap();
        // insert_keyset already warms the cache; clear it so `keyset` must
        // go through the in-flight path for this test.
        manager.private_cache.remove(&secret_id("k9"));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move { manager.keyset("k9").await }));
        }

        for h in handles {
            let ks = h.await.unwrap().unwrap();
            assert_eq!(ks.unique_key_id, "u1");
        }

        assert_eq!(secrets.access_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn delete_then_keyset_is_not_found() {
        let secrets = Arc::new(InMemorySecretManagerClient::default());
        let repository = Arc::new(InMemoryRepository::default());
        let manager = ThunderingHerdKeyManager::new(
            KeyManagerConfig {
                project_id: "proj".into(),
                private_ttl: Duration::from_secs(60),
                public_ttl: Duration::from_secs(60),
            },
            secrets,
            None,
            repository,
        )
        .unwrap();

        manager.insert_keyset("k1", sample_keyset()).await.unwrap();
        manager.delete_keyset("k1").await.unwrap();

        let err = manager.keyset("k1").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
