use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{CoreError, CoreResult};

/// Thin capability interface over GCP Secret Manager's container/version
/// model, narrowed to the operations the Key Manager and Encryption Service
/// need (spec §4.B, §4.D, §6).
///
/// `create_secret` and `create_secret_if_absent` deliberately have different
/// AlreadyExists contracts, matching the spec's two distinct callers:
/// `InsertKeyset` (§4.B) wants a clean container and recurses through a
/// delete when one already exists, while `EncryptionService::Init` (§4.D)
/// wants "create the secret container (ignoring AlreadyExists)" — a
/// concurrent `Init` racing the same `key_id` must not have its version
/// clobbered by the other caller's create.
#[async_trait]
pub trait SecretManagerClient: Send + Sync {
    /// Create-if-missing, delete-and-recurse-once if the container already
    /// exists (spec §4.B `InsertKeyset`).
    async fn create_secret(&self, secret_id: &str) -> CoreResult<()>;

    /// Create-if-missing, treat AlreadyExists as a no-op (spec §4.D `Init`).
    /// Never deletes an existing container or its versions.
    async fn create_secret_if_absent(&self, secret_id: &str) -> CoreResult<()>;

    async fn delete_secret(&self, secret_id: &str) -> CoreResult<()>;

    async fn add_version(&self, secret_id: &str, payload: Vec<u8>) -> CoreResult<()>;

    /// Returns the payload of the latest version. `NotFound` is reported as
    /// `None`, not an error, so callers can implement the "create if absent"
    /// pattern (spec §4.D `Init`) without string-matching errors.
    async fn access_latest(&self, secret_id: &str) -> CoreResult<Option<Vec<u8>>>;
}

/// Adapter over `google-cloud-secretmanager-v1`. Construction requires a
/// live `google_cloud_auth` credential; wired up in `main.rs`.
pub struct GoogleSecretManagerClient {
    project_id: String,
    client: google_cloud_secretmanager_v1::client::SecretManagerService,
}

impl GoogleSecretManagerClient {
    pub fn new(
        project_id: String,
        client: google_cloud_secretmanager_v1::client::SecretManagerService,
    ) -> Self {
        Self { project_id, client }
    }

    fn parent(&self) -> String {
        format!("projects/{}", self.project_id)
    }

    fn secret_name(&self, secret_id: &str) -> String {
        format!("{}/secrets/{}", self.parent(), secret_id)
    }
}

#[async_trait]
impl SecretManagerClient for GoogleSecretManagerClient {
    async fn create_secret(&self, secret_id: &str) -> CoreResult<()> {
        use google_cloud_secretmanager_v1::model::{replication, Replication, Secret};

        let secret = Secret::new().set_replication(
            Replication::new().set_automatic(replication::Automatic::new()),
        );

        let result = self
            .client
            .create_secret()
            .set_parent(self.parent())
            .set_secret_id(secret_id)
            .set_secret(secret)
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_already_exists(&e) => {
                // Create-if-missing, delete-and-recurse-once (spec §4.B InsertKeyset).
                self.delete_secret(secret_id).await?;
                Box::pin(self.create_secret(secret_id)).await
            }
            Err(e) => Err(CoreError::transient("create_secret failed", e)),
        }
    }

    async fn create_secret_if_absent(&self, secret_id: &str) -> CoreResult<()> {
        use google_cloud_secretmanager_v1::model::{replication, Replication, Secret};

        let secret = Secret::new().set_replication(
            Replication::new().set_automatic(replication::Automatic::new()),
        );

        let result = self
            .client
            .create_secret()
            .set_parent(self.parent())
            .set_secret_id(secret_id)
            .set_secret(secret)
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            // Ignore AlreadyExists outright (spec §4.D Init) — unlike
            // `create_secret`, this never deletes the existing container.
            Err(e) if is_already_exists(&e) => Ok(()),
            Err(e) => Err(CoreError::transient("create_secret failed", e)),
        }
    }

    async fn delete_secret(&self, secret_id: &str) -> CoreResult<()> {
        self.client
            .delete_secret()
            .set_name(self.secret_name(secret_id))
            .send()
            .await
            .map(|_| ())
            .or_else(|e| if is_not_found(&e) { Ok(()) } else { Err(e) })
            .map_err(|e| CoreError::transient("delete_secret failed", e))
    }

    async fn add_version(&self, secret_id: &str, payload: Vec<u8>) -> CoreResult<()> {
        use google_cloud_secretmanager_v1::model::SecretPayload;

        self.client
            .add_secret_version()
            .set_parent(self.secret_name(secret_id))
            .set_payload(SecretPayload::new().set_data(payload.into()))
            .send()
            .await
            .map(|_| ())
            .map_err(|e| CoreError::transient("add_secret_version failed", e))
    }

    async fn access_latest(&self, secret_id: &str) -> CoreResult<Option<Vec<u8>>> {
        let result = self
            .client
            .access_secret_version()
            .set_name(format!("{}/versions/latest", self.secret_name(secret_id)))
            .send()
            .await;

        match result {
            Ok(resp) => Ok(resp.payload.map(|p| p.data.to_vec())),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(CoreError::transient("access_secret_version failed", e)),
        }
    }
}

fn is_not_found(err: &google_cloud_secretmanager_v1::Error) -> bool {
    err.to_string().contains("NOT_FOUND") || err.to_string().contains("404")
}

fn is_already_exists(err: &google_cloud_secretmanager_v1::Error) -> bool {
    err.to_string().contains("ALREADY_EXISTS") || err.to_string().contains("409")
}

/// In-memory fake used by unit tests and by `EncryptionService`/`KeyManager`
/// doctests. Never wired into `main.rs`.
#[derive(Default)]
pub struct InMemorySecretManagerClient {
    secrets: Mutex<HashMap<String, Vec<u8>>>,
    existing: Mutex<HashMap<String, bool>>,
}

#[async_trait]
impl SecretManagerClient for InMemorySecretManagerClient {
    async fn create_secret(&self, secret_id: &str) -> CoreResult<()> {
        let mut existing = self.existing.lock().unwrap();
        if existing.contains_key(secret_id) {
            // already exists: delete then recurse once, per spec.
            drop(existing);
            self.delete_secret(secret_id).await?;
            existing = self.existing.lock().unwrap();
        }
        existing.insert(secret_id.to_string(), true);
        Ok(())
    }

    async fn create_secret_if_absent(&self, secret_id: &str) -> CoreResult<()> {
        // No delete-and-recurse here: an already-existing container (and
        // any version already added to it) is left untouched.
        self.existing
            .lock()
            .unwrap()
            .entry(secret_id.to_string())
            .or_insert(true);
        Ok(())
    }

    async fn delete_secret(&self, secret_id: &str) -> CoreResult<()> {
        self.existing.lock().unwrap().remove(secret_id);
        self.secrets.lock().unwrap().remove(secret_id);
        Ok(())
    }

    async fn add_version(&self, secret_id: &str, payload: Vec<u8>) -> CoreResult<()> {
        self.secrets
            .lock()
            .unwrap()
            .insert(secret_id.to_string(), payload);
        Ok(())
    }

    async fn access_latest(&self, secret_id: &str) -> CoreResult<Option<Vec<u8>>> {
        Ok(self.secrets.lock().unwrap().get(secret_id).cloned())
    }
}
