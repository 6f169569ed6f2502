use std::sync::Arc;

use clap::Parser;
use np_registry_core::admin::{run_admin_command, AdminService};
use np_registry_core::authgen::SigningAuthGen;
use np_registry_core::challenge::RandomChallengeService;
use np_registry_core::config::{Cli, Config};
use np_registry_core::encryption::EncryptionService;
use np_registry_core::event::LoggingEventPublisher;
use np_registry_core::keymanager::secretmanager::GoogleSecretManagerClient;
use np_registry_core::keymanager::{KeyManager, SimpleKeyManager, ThunderingHerdKeyManager};
use np_registry_core::lookup_processor::LookupProcessor;
use np_registry_core::participant_client::HttpParticipantClient;
use np_registry_core::proxy_processor::HttpProxyProcessor;
use np_registry_core::queue::{empty_lookup_slot, TaskQueue};
use np_registry_core::repository::{PgRepository, Repository};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_cli(cli)?;

    tracing::info!(
        gcp_project_id = %config.gcp_project_id,
        subscriber_id = %config.subscriber_id,
        "np-registry starting"
    );

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .map_err(|e| anyhow::anyhow!("connecting to database: {e}"))?;
    let repository: Arc<dyn Repository> = Arc::new(PgRepository::new(pool));

    let gcp_auth = google_cloud_auth::credentials::Builder::default()
        .build()
        .await
        .map_err(|e| anyhow::anyhow!("building GCP credentials: {e}"))?;
    let secret_client = google_cloud_secretmanager_v1::client::SecretManagerService::builder()
        .with_credentials(gcp_auth)
        .build()
        .await
        .map_err(|e| anyhow::anyhow!("building Secret Manager client: {e}"))?;
    let secrets = Arc::new(GoogleSecretManagerClient::new(
        config.gcp_project_id.clone(),
        secret_client,
    ));

    let key_manager: Arc<dyn KeyManager> = if config.use_thundering_herd_cache {
        Arc::new(ThunderingHerdKeyManager::new(
            config.key_manager.clone(),
            secrets.clone(),
            None,
            repository.clone(),
        )?)
    } else {
        Arc::new(SimpleKeyManager::new(
            config.key_manager.clone(),
            secrets.clone(),
            None,
            repository.clone(),
        )?)
    };

    // Gateway's own keyset: generate-and-insert on first boot if absent.
    if key_manager.keyset(&config.gateway_key_id).await.is_err() {
        let keyset = key_manager.generate_keyset()?;
        key_manager
            .insert_keyset(&config.gateway_key_id, keyset)
            .await?;
        tracing::info!(key_id = %config.gateway_key_id, "generated gateway keyset on first boot");
    }

    let authgen = Arc::new(SigningAuthGen::new(
        key_manager.clone(),
        config.subscriber_id.clone(),
    ));

    let encryption_service = Arc::new(EncryptionService::new(
        config.gcp_project_id.clone(),
        format!("{}-encr", config.gateway_key_id),
        secrets.clone(),
    ));
    encryption_service.init().await?;

    let challenge_service = Arc::new(RandomChallengeService);
    let participant_client = Arc::new(HttpParticipantClient::with_timeout(
        config.proxy_processor.per_request_timeout,
    )?);
    let events = Arc::new(LoggingEventPublisher);

    let admin = Arc::new(AdminService::new(
        config.admin.clone(),
        repository.clone(),
        challenge_service,
        encryption_service,
        participant_client,
        events,
    ));
    if let Some(command) = config.admin_command.clone() {
        run_admin_command(&admin, command).await?;
        key_manager.close().await;
        return Ok(());
    }

    let proxy_processor = Arc::new(HttpProxyProcessor::new(
        config.proxy_processor.clone(),
        authgen.clone(),
    )?);

    let lookup_slot = empty_lookup_slot();
    let queue = Arc::new(TaskQueue::start(
        config.queue.clone(),
        proxy_processor,
        lookup_slot.clone(),
    ));

    let lookup_processor = Arc::new(LookupProcessor::new(
        config.lookup_processor.clone(),
        repository,
        authgen,
        queue.clone(),
    ));
    *lookup_slot.write().await = Some(lookup_processor);

    tracing::info!("np-registry ready");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("waiting for shutdown signal: {e}"))?;

    tracing::info!("shutdown signal received, draining task queue");
    queue.stop().await;
    key_manager.close().await;

    Ok(())
}
