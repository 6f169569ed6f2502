use clap::Parser;
use std::time::Duration;

use crate::admin::{AdminCommand, AdminConfig};
use crate::keymanager::KeyManagerConfig;
use crate::lookup_processor::LookupProcessorConfig;
use crate::proxy_processor::ProxyProcessorConfig;
use crate::queue::TaskQueueConfig;

/// Raw CLI/env surface. Every field is optional-with-default here; the
/// invariants that actually matter (positive counts, non-empty ids) are
/// enforced once, in `Config::from_cli`, following the teacher's
/// `KeeperConfig::from_cli_and_deployment` pattern: parse everything up
/// front, validate in one place, fail before any side effect.
#[derive(Parser, Debug, Clone)]
#[command(name = "np-registry", about = "Network participant registry and gateway core")]
pub struct Cli {
    #[arg(long, env = "NP_REGISTRY_DATABASE_URL")]
    pub database_url: String,

    #[arg(long, env = "NP_REGISTRY_GCP_PROJECT_ID")]
    pub gcp_project_id: String,

    #[arg(long, env = "NP_REGISTRY_SUBSCRIBER_ID")]
    pub subscriber_id: String,

    #[arg(long, env = "NP_REGISTRY_GATEWAY_KEY_ID", default_value = "gateway")]
    pub gateway_key_id: String,

    #[arg(long, env = "NP_REGISTRY_OPERATION_RETRY_MAX", default_value_t = 3)]
    pub operation_retry_max: i64,

    #[arg(long, env = "NP_REGISTRY_PRIVATE_CACHE_TTL_SECS", default_value_t = 300)]
    pub private_cache_ttl_secs: u64,

    #[arg(long, env = "NP_REGISTRY_PUBLIC_CACHE_TTL_SECS", default_value_t = 3600)]
    pub public_cache_ttl_secs: u64,

    #[arg(long, env = "NP_REGISTRY_QUEUE_CAPACITY", default_value_t = 100)]
    pub queue_capacity: usize,

    #[arg(long, env = "NP_REGISTRY_QUEUE_WORKERS", default_value_t = 1)]
    pub queue_workers: usize,

    #[arg(long, env = "NP_REGISTRY_MAX_PROXY_TASKS", default_value_t = 0)]
    pub max_proxy_tasks: usize,

    #[arg(long, env = "NP_REGISTRY_RETRY_MAX", default_value_t = 3)]
    pub proxy_retry_max: u32,

    #[arg(long, env = "NP_REGISTRY_WAIT_MIN_MS", default_value_t = 100)]
    pub proxy_wait_min_ms: u64,

    #[arg(long, env = "NP_REGISTRY_WAIT_MAX_MS", default_value_t = 5000)]
    pub proxy_wait_max_ms: u64,

    #[arg(long, env = "NP_REGISTRY_REQUEST_TIMEOUT_SECS", default_value_t = 10)]
    pub per_request_timeout_secs: u64,

    #[arg(long, env = "NP_REGISTRY_AUTH_HEADER_NAME", default_value = "Authorization")]
    pub auth_header_name: String,

    #[arg(long, env = "NP_REGISTRY_USE_THUNDERING_HERD_CACHE", default_value_t = true)]
    pub use_thundering_herd_cache: bool,

    /// If given, run this one admin command and exit instead of starting
    /// the task queue/server loop.
    #[command(subcommand)]
    pub admin_command: Option<AdminCommand>,
}

/// Fully validated configuration wiring every component's own config record
/// (spec §6: "an invalid field causes constructor failure before any side
/// effect").
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub gcp_project_id: String,
    pub subscriber_id: String,
    pub gateway_key_id: String,
    pub use_thundering_herd_cache: bool,
    pub key_manager: KeyManagerConfig,
    pub admin: AdminConfig,
    pub queue: TaskQueueConfig,
    pub proxy_processor: ProxyProcessorConfig,
    pub lookup_processor: LookupProcessorConfig,
    pub admin_command: Option<AdminCommand>,
}

impl Config {
    pub fn from_cli(cli: Cli) -> anyhow::Result<Self> {
        if cli.database_url.trim().is_empty() {
            anyhow::bail!("database_url must not be empty");
        }
        if cli.gcp_project_id.trim().is_empty() {
            anyhow::bail!("gcp_project_id must not be empty");
        }
        if cli.subscriber_id.trim().is_empty() {
            anyhow::bail!("subscriber_id must not be empty");
        }
        if cli.operation_retry_max <= 0 {
            anyhow::bail!("operation_retry_max must be positive, got {}", cli.operation_retry_max);
        }
        if cli.private_cache_ttl_secs == 0 {
            anyhow::bail!("private_cache_ttl_secs must be positive");
        }
        if cli.public_cache_ttl_secs == 0 {
            anyhow::bail!("public_cache_ttl_secs must be positive");
        }
        if cli.queue_workers == 0 {
            anyhow::bail!("queue_workers must be positive");
        }
        if cli.proxy_wait_min_ms > cli.proxy_wait_max_ms {
            // Not fatal — mirrors the teacher's backoff_base > backoff_max
            // warning — but the operator should know their backoff window
            // is inverted.
            tracing::warn!(
                wait_min_ms = cli.proxy_wait_min_ms,
                wait_max_ms = cli.proxy_wait_max_ms,
                "proxy wait_min exceeds wait_max; retries will not back off as intended"
            );
        }

        let key_manager = KeyManagerConfig {
            project_id: cli.gcp_project_id.clone(),
            private_ttl: Duration::from_secs(cli.private_cache_ttl_secs),
            public_ttl: Duration::from_secs(cli.public_cache_ttl_secs),
        };

        let admin = AdminConfig {
            operation_retry_max: cli.operation_retry_max,
        };

        let queue = TaskQueueConfig {
            capacity: cli.queue_capacity,
            workers: cli.queue_workers,
        };

        let proxy_processor = ProxyProcessorConfig {
            retry_max: cli.proxy_retry_max,
            wait_min: Duration::from_millis(cli.proxy_wait_min_ms),
            wait_max: Duration::from_millis(cli.proxy_wait_max_ms),
            per_request_timeout: Duration::from_secs(cli.per_request_timeout_secs),
            auth_header_name: cli.auth_header_name.clone(),
            key_id: cli.gateway_key_id.clone(),
            ..ProxyProcessorConfig::default()
        };

        let lookup_processor = LookupProcessorConfig {
            subscriber_id: cli.subscriber_id.clone(),
            max_proxy_tasks: cli.max_proxy_tasks,
            key_id: cli.gateway_key_id.clone(),
        };

        Ok(Self {
            database_url: cli.database_url,
            gcp_project_id: cli.gcp_project_id,
            subscriber_id: cli.subscriber_id,
            gateway_key_id: cli.gateway_key_id,
            use_thundering_herd_cache: cli.use_thundering_herd_cache,
            key_manager,
            admin,
            queue,
            proxy_processor,
            lookup_processor,
            admin_command: cli.admin_command,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli() -> Cli {
        Cli {
            database_url: "postgres://localhost/registry".to_string(),
            gcp_project_id: "proj".to_string(),
            subscriber_id: "gw".to_string(),
            gateway_key_id: "gateway".to_string(),
            operation_retry_max: 3,
            private_cache_ttl_secs: 300,
            public_cache_ttl_secs: 3600,
            queue_capacity: 100,
            queue_workers: 1,
            max_proxy_tasks: 0,
            proxy_retry_max: 3,
            proxy_wait_min_ms: 100,
            proxy_wait_max_ms: 5000,
            per_request_timeout_secs: 10,
            auth_header_name: "Authorization".to_string(),
            use_thundering_herd_cache: true,
            admin_command: None,
        }
    }

    #[test]
    fn valid_cli_builds_config() {
        let cfg = Config::from_cli(base_cli()).unwrap();
        assert_eq!(cfg.admin.operation_retry_max, 3);
        assert_eq!(cfg.queue.workers, 1);
    }

    #[test]
    fn empty_database_url_is_rejected_before_any_side_effect() {
        let mut cli = base_cli();
        cli.database_url = "".to_string();
        assert!(Config::from_cli(cli).is_err());
    }

    #[test]
    fn zero_operation_retry_max_is_rejected() {
        let mut cli = base_cli();
        cli.operation_retry_max = 0;
        assert!(Config::from_cli(cli).is_err());
    }

    #[test]
    fn zero_queue_workers_is_rejected() {
        let mut cli = base_cli();
        cli.queue_workers = 0;
        assert!(Config::from_cli(cli).is_err());
    }
}
