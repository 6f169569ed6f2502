use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::challenge::ChallengeService;
use crate::encryption::Encrypter;
use crate::error::{CoreError, CoreResult};
use crate::event::{Event, EventPublisher};
use crate::model::{
    Location, Lro, OperationStatus, OperationType, Role, Subscription, SubscriptionFilter,
    SubscriptionStatus,
};
use crate::participant_client::{OnSubscribeRequest, ParticipantClient};
use crate::repository::Repository;

#[derive(Debug, Clone)]
pub struct AdminConfig {
    pub operation_retry_max: i64,
}

/// The payload of `Lro::request_json` for both operation types (spec §4.F
/// step 5/6). `callback_url` and `encr_public_key` are the two fields step
/// 6 requires non-empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    pub subscriber_id: String,
    pub callback_url: String,
    pub role: Role,
    pub domain: String,
    #[serde(default)]
    pub location: Option<Location>,
    pub key_id: String,
    pub signing_public_key: String,
    pub encr_public_key: String,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

/// Orchestrates the approve/reject long-running-operation state machine
/// (spec §4.F), polymorphic over every capability it consumes (§9).
pub struct AdminService {
    config: AdminConfig,
    repository: Arc<dyn Repository>,
    challenge: Arc<dyn ChallengeService>,
    encrypter: Arc<dyn Encrypter>,
    participant_client: Arc<dyn ParticipantClient>,
    events: Arc<dyn EventPublisher>,
}

impl AdminService {
    pub fn new(
        config: AdminConfig,
        repository: Arc<dyn Repository>,
        challenge: Arc<dyn ChallengeService>,
        encrypter: Arc<dyn Encrypter>,
        participant_client: Arc<dyn ParticipantClient>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            config,
            repository,
            challenge,
            encrypter,
            participant_client,
            events,
        }
    }

    /// Writes `{status, error_data_json}` through `UpdateOperation` and
    /// returns `original_err` regardless of whether the secondary write
    /// succeeds — a failed secondary write is logged as critical, never
    /// substituted for the real error (spec §7 propagation policy).
    async fn mark_terminal(
        &self,
        lro: Lro,
        status: OperationStatus,
        error_payload: serde_json::Value,
        original_err: CoreError,
    ) -> CoreError {
        let operation_id = lro.operation_id.clone();
        let mut updated = lro;
        updated.status = status;
        updated.error_data_json = serde_json::to_vec(&error_payload).ok();

        if let Err(e) = self.repository.update_operation(updated).await {
            tracing::error!(
                operation_id,
                error = %e,
                original_error = %original_err,
                "critical: failed to persist terminal LRO status"
            );
        }
        original_err
    }

    fn existence_filter(request: &SubscriptionRequest) -> SubscriptionFilter {
        SubscriptionFilter::new()
            .with_subscriber_id(request.subscriber_id.clone())
            .with_domain(request.domain.clone())
            .with_role(request.role)
            .with_key_id(request.key_id.clone())
    }

    pub async fn approve_subscription(&self, operation_id: &str) -> CoreResult<()> {
        // 1. Load.
        let lro = self.repository.get_operation(operation_id).await?;

        // 2. Retry gate — checked before any mutation.
        if lro.retry_count > self.config.operation_retry_max {
            return Err(CoreError::MaxRetriesExceeded {
                operation_id: operation_id.to_string(),
                retry_count: lro.retry_count,
                max: self.config.operation_retry_max,
            });
        }

        // 3. Type gate. Rust's enum already restricts `operation_type` to
        // the two valid variants at the type level; decoding `request_json`
        // below is where an actually-invalid type would surface.

        // 4. Terminal gate.
        if lro.status.is_terminal() {
            return Err(CoreError::LROAlreadyProcessed(operation_id.to_string()));
        }

        // 5. Decode.
        let request: SubscriptionRequest = match serde_json::from_slice(&lro.request_json) {
            Ok(r) => r,
            Err(e) => {
                let err = CoreError::transient("decoding subscription request", e);
                let payload = serde_json::json!({ "error": err.to_string() });
                return Err(self.mark_terminal(lro, OperationStatus::Rejected, payload, err).await);
            }
        };

        // 6. Validate request.
        if request.callback_url.is_empty() || request.encr_public_key.is_empty() {
            let err = CoreError::Transient(
                "callback_url and encr_public_key are required".to_string(),
            );
            let payload = serde_json::json!({ "error": err.to_string() });
            return Err(self.mark_terminal(lro, OperationStatus::Rejected, payload, err).await);
        }

        // 7. Existence check. Driver errors surface directly without
        // touching the LRO (retry semantics live at a higher layer).
        let filter = Self::existence_filter(&request);
        let existing = self.repository.lookup(&filter).await?;

        match lro.operation_type {
            OperationType::CreateSubscription if !existing.is_empty() => {
                let err = CoreError::Transient("subscription already exists".to_string());
                let payload = serde_json::json!({ "error": err.to_string() });
                return Err(self.mark_terminal(lro, OperationStatus::Failure, payload, err).await);
            }
            OperationType::UpdateSubscription if existing.is_empty() => {
                let err = CoreError::Transient("subscription does not exist".to_string());
                let payload = serde_json::json!({ "error": err.to_string() });
                return Err(self.mark_terminal(lro, OperationStatus::Failure, payload, err).await);
            }
            _ => {}
        }

        // 8. Mint challenge.
        let challenge = match self.challenge.new_challenge() {
            Ok(c) => c,
            Err(e) => {
                let payload = serde_json::json!({ "error": e.to_string() });
                return Err(self.mark_terminal(lro, OperationStatus::Failure, payload, e).await);
            }
        };

        // 9. Encrypt challenge to the NP's encryption public key.
        let ciphertext = match self
            .encrypter
            .encrypt(challenge.as_bytes(), &request.encr_public_key)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                let payload = serde_json::json!({ "error": e.to_string() });
                return Err(self.mark_terminal(lro, OperationStatus::Failure, payload, e).await);
            }
        };

        // 10. Call participant.
        let on_subscribe_response = match self
            .participant_client
            .on_subscribe(
                &request.callback_url,
                OnSubscribeRequest {
                    subscriber_id: request.subscriber_id.clone(),
                    challenge: STANDARD.encode(&ciphertext),
                },
            )
            .await
        {
            Ok(r) => r,
            Err(e) => {
                let payload = serde_json::json!({ "error": e.to_string() });
                return Err(self.mark_terminal(lro, OperationStatus::Failure, payload, e).await);
            }
        };

        // 11. Verify answer.
        if !self.challenge.verify(&challenge, &on_subscribe_response.answer) {
            let err = CoreError::Transient("challenge verification failed".to_string());
            let payload = serde_json::json!({ "error": err.to_string() });
            return Err(self.mark_terminal(lro, OperationStatus::Failure, payload, err).await);
        }

        // 12. Commit.
        let subscription = Subscription {
            subscriber_id: request.subscriber_id.clone(),
            url: request.callback_url.clone(),
            role: request.role,
            domain: request.domain.clone(),
            location: request.location.clone(),
            key_id: request.key_id.clone(),
            signing_public_key: request.signing_public_key.clone(),
            encr_public_key: request.encr_public_key.clone(),
            valid_from: request.valid_from,
            valid_until: request.valid_until,
            nonce: String::new(),
            status: SubscriptionStatus::Subscribed,
            created: None,
            updated: None,
        };

        let mut approved_lro = lro;
        approved_lro.status = OperationStatus::Approved;
        approved_lro.error_data_json = None;

        let (_sub, approved_lro) = self
            .repository
            .upsert_subscription_and_lro(subscription, approved_lro)
            .await?;

        // 13. Emit event — publish failures are logged only, never
        // returned (spec §7).
        if let Err(e) = self
            .events
            .publish(Event::SubscriptionRequestApproved {
                operation_id: approved_lro.operation_id.clone(),
                subscriber_id: request.subscriber_id,
                domain: request.domain,
                role: request.role,
            })
            .await
        {
            tracing::warn!(error = %e, "failed to publish subscription-approved event");
        }

        Ok(())
    }

    pub async fn reject_subscription(&self, operation_id: &str, reason: &str) -> CoreResult<()> {
        let lro = self.repository.get_operation(operation_id).await?;

        if lro.retry_count > self.config.operation_retry_max {
            return Err(CoreError::MaxRetriesExceeded {
                operation_id: operation_id.to_string(),
                retry_count: lro.retry_count,
                max: self.config.operation_retry_max,
            });
        }

        if lro.status.is_terminal() {
            return Err(CoreError::LROAlreadyProcessed(operation_id.to_string()));
        }

        if reason.trim().is_empty() {
            return Err(CoreError::Transient("reason must not be empty".to_string()));
        }

        let request: Option<SubscriptionRequest> = serde_json::from_slice(&lro.request_json).ok();

        let mut rejected_lro = lro;
        rejected_lro.status = OperationStatus::Rejected;
        rejected_lro.error_data_json =
            serde_json::to_vec(&serde_json::json!({ "reason": reason })).ok();

        let rejected_lro = self.repository.update_operation(rejected_lro).await?;

        if let Err(e) = self
            .events
            .publish(Event::SubscriptionRequestRejected {
                operation_id: rejected_lro.operation_id.clone(),
                subscriber_id: request.as_ref().map(|r| r.subscriber_id.clone()).unwrap_or_default(),
                domain: request.as_ref().map(|r| r.domain.clone()).unwrap_or_default(),
                role: request.as_ref().map(|r| r.role).unwrap_or(Role::Bap),
                reason: reason.to_string(),
            })
            .await
        {
            tracing::warn!(error = %e, "failed to publish subscription-rejected event");
        }

        Ok(())
    }
}

/// The command an external admin surface sends the Admin Service (§1
/// Non-goals exclude that surface itself — UI, HTTP routing, CLI
/// ergonomics — not the entrypoint it would call). Wired into `main.rs` as
/// an optional CLI subcommand so the binary can dispatch an approve/reject
/// without a standing HTTP admin API.
#[derive(Subcommand, Debug, Clone)]
pub enum AdminCommand {
    /// Approve a pending subscription request.
    Approve {
        #[arg(long)]
        operation_id: String,
    },
    /// Reject a pending subscription request.
    Reject {
        #[arg(long)]
        operation_id: String,
        #[arg(long)]
        reason: String,
    },
}

/// Dispatches one admin command to the given service (spec §4.F).
pub async fn run_admin_command(admin: &AdminService, command: AdminCommand) -> CoreResult<()> {
    match command {
        AdminCommand::Approve { operation_id } => admin.approve_subscription(&operation_id).await,
        AdminCommand::Reject {
            operation_id,
            reason,
        } => admin.reject_subscription(&operation_id, &reason).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;
    use crate::testutil::{
        FixedChallengeService, InMemoryRepository, MockParticipantClient, NoopEncrypter,
        RecordingEventPublisher,
    };
    use chrono::Utc;

    fn request_json(subscriber_id: &str) -> Vec<u8> {
        serde_json::to_vec(&SubscriptionRequest {
            subscriber_id: subscriber_id.to_string(),
            callback_url: format!("http://{subscriber_id}"),
            role: Role::Bpp,
            domain: "nic2004:52110".to_string(),
            location: None,
            key_id: "k1".to_string(),
            signing_public_key: "sp".to_string(),
            encr_public_key: "pubA".to_string(),
            valid_from: Utc::now(),
            valid_until: Utc::now(),
        })
        .unwrap()
    }

    fn pending_lro(operation_id: &str, request: Vec<u8>) -> Lro {
        Lro {
            operation_id: operation_id.to_string(),
            operation_type: OperationType::CreateSubscription,
            status: OperationStatus::Pending,
            request_json: request,
            result_json: None,
            error_data_json: None,
            retry_count: 0,
            created_at: None,
            updated_at: None,
        }
    }

    fn service(
        repository: Arc<InMemoryRepository>,
        challenge_answer: &str,
        participant_answer: &str,
        participant_fails: bool,
    ) -> AdminService {
        AdminService::new(
            AdminConfig {
                operation_retry_max: 3,
            },
            repository,
            Arc::new(FixedChallengeService {
                challenge: challenge_answer.to_string(),
            }),
            Arc::new(NoopEncrypter),
            Arc::new(MockParticipantClient {
                answer: participant_answer.to_string(),
                fail: participant_fails,
            }),
            Arc::new(RecordingEventPublisher::default()),
        )
    }

    #[tokio::test]
    async fn happy_path_create_approves_and_subscribes() {
        let repository = Arc::new(InMemoryRepository::default());
        repository.seed_operation(pending_lro("op-1", request_json("npA")));

        let svc = service(repository.clone(), "c1", "c1", false);
        svc.approve_subscription("op-1").await.unwrap();

        let lro = repository.get_operation("op-1").await.unwrap();
        assert_eq!(lro.status, OperationStatus::Approved);

        let subs = repository
            .lookup(&SubscriptionFilter::new().with_subscriber_id("npA"))
            .await
            .unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].status, SubscriptionStatus::Subscribed);
    }

    #[tokio::test]
    async fn challenge_mismatch_ends_in_failure_without_subscription() {
        let repository = Arc::new(InMemoryRepository::default());
        repository.seed_operation(pending_lro("op-2", request_json("npB")));

        let svc = service(repository.clone(), "c1", "wrong", false);
        let err = svc.approve_subscription("op-2").await.unwrap_err();
        assert!(err.to_string().contains("challenge verification failed"));

        let lro = repository.get_operation("op-2").await.unwrap();
        assert_eq!(lro.status, OperationStatus::Failure);
        assert!(lro.error_data_json.is_some());

        let subs = repository
            .lookup(&SubscriptionFilter::new().with_subscriber_id("npB"))
            .await
            .unwrap();
        assert!(subs.is_empty());
    }

    #[tokio::test]
    async fn create_conflict_fails_without_participant_callback() {
        let repository = Arc::new(InMemoryRepository::default());
        repository.seed_operation(pending_lro("op-3", request_json("npC")));
        repository.seed_subscription(Subscription {
            subscriber_id: "npC".to_string(),
            url: "http://npC".to_string(),
            role: Role::Bpp,
            domain: "nic2004:52110".to_string(),
            location: None,
            key_id: "k1".to_string(),
            signing_public_key: "sp".to_string(),
            encr_public_key: "pubA".to_string(),
            valid_from: Utc::now(),
            valid_until: Utc::now(),
            nonce: String::new(),
            status: SubscriptionStatus::Subscribed,
            created: None,
            updated: None,
        });

        let svc = service(repository.clone(), "c1", "c1", true);
        let err = svc.approve_subscription("op-3").await.unwrap_err();
        assert!(err.to_string().contains("already exists"));

        let lro = repository.get_operation("op-3").await.unwrap();
        assert_eq!(lro.status, OperationStatus::Failure);
    }

    #[tokio::test]
    async fn reject_writes_reason_and_terminal_status() {
        let repository = Arc::new(InMemoryRepository::default());
        repository.seed_operation(pending_lro("op-4", request_json("npD")));

        let svc = service(repository.clone(), "c1", "c1", false);
        svc.reject_subscription("op-4", "missing-docs").await.unwrap();

        let lro = repository.get_operation("op-4").await.unwrap();
        assert_eq!(lro.status, OperationStatus::Rejected);
        let payload: serde_json::Value =
            serde_json::from_slice(&lro.error_data_json.unwrap()).unwrap();
        assert_eq!(payload["reason"], "missing-docs");
    }

    #[tokio::test]
    async fn approving_already_approved_lro_is_idempotently_rejected() {
        let repository = Arc::new(InMemoryRepository::default());
        let mut lro = pending_lro("op-5", request_json("npE"));
        lro.status = OperationStatus::Approved;
        repository.seed_operation(lro);

        let svc = service(repository.clone(), "c1", "c1", false);
        let err = svc.approve_subscription("op-5").await.unwrap_err();
        assert!(matches!(err, CoreError::LROAlreadyProcessed(_)));
    }

    #[tokio::test]
    async fn run_admin_command_dispatches_approve_and_reject() {
        let repository = Arc::new(InMemoryRepository::default());
        repository.seed_operation(pending_lro("op-8", request_json("npH")));
        repository.seed_operation(pending_lro("op-9", request_json("npI")));

        let svc = service(repository.clone(), "c1", "c1", false);

        run_admin_command(
            &svc,
            AdminCommand::Approve {
                operation_id: "op-8".to_string(),
            },
        )
        .await
        .unwrap();
        assert_eq!(
            repository.get_operation("op-8").await.unwrap().status,
            OperationStatus::Approved
        );

        run_admin_command(
            &svc,
            AdminCommand::Reject {
                operation_id: "op-9".to_string(),
                reason: "bad-docs".to_string(),
            },
        )
        .await
        .unwrap();
        assert_eq!(
            repository.get_operation("op-9").await.unwrap().status,
            OperationStatus::Rejected
        );
    }

    #[tokio::test]
    async fn retry_count_at_max_proceeds_retry_count_over_max_fails() {
        let repository = Arc::new(InMemoryRepository::default());
        let mut at_max = pending_lro("op-6", request_json("npF"));
        at_max.retry_count = 3;
        repository.seed_operation(at_max);

        let svc = service(repository.clone(), "c1", "c1", false);
        svc.approve_subscription("op-6").await.unwrap();

        let repository2 = Arc::new(InMemoryRepository::default());
        let mut over_max = pending_lro("op-7", request_json("npG"));
        over_max.retry_count = 4;
        repository2.seed_operation(over_max);

        let svc2 = service(repository2.clone(), "c1", "c1", false);
        let err = svc2.approve_subscription("op-7").await.unwrap_err();
        assert!(matches!(err, CoreError::MaxRetriesExceeded { .. }));
    }
}
