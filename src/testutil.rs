//! In-memory fakes for the core traits, shared across unit tests (spec §9:
//! "tests substitute in-memory variants"). Never compiled outside `cfg(test)`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::authgen::AuthGen;
use crate::challenge::ChallengeService;
use crate::encryption::Encrypter;
use crate::error::{CoreError, CoreResult};
use crate::event::{Event, EventPublisher};
use crate::model::{Lro, Role, Subscription, SubscriptionFilter};
use crate::participant_client::{OnSubscribeRequest, OnSubscribeResponse, ParticipantClient};
use crate::repository::Repository;

#[derive(Default)]
pub struct InMemoryRepository {
    subscriptions: Mutex<Vec<Subscription>>,
    operations: Mutex<HashMap<String, Lro>>,
}

impl InMemoryRepository {
    pub fn seed_operation(&self, lro: Lro) {
        self.operations
            .lock()
            .unwrap()
            .insert(lro.operation_id.clone(), lro);
    }

    pub fn seed_subscription(&self, sub: Subscription) {
        self.subscriptions.lock().unwrap().push(sub);
    }
}

fn matches(filter: &SubscriptionFilter, sub: &Subscription) -> bool {
    if let Some(v) = &filter.subscriber_id {
        if &sub.subscriber_id != v {
            return false;
        }
    }
    if let Some(v) = &filter.url {
        if &sub.url != v {
            return false;
        }
    }
    if let Some(v) = &filter.domain {
        if &sub.domain != v {
            return false;
        }
    }
    if let Some(v) = &filter.key_id {
        if &sub.key_id != v {
            return false;
        }
    }
    if let Some(v) = filter.role {
        if sub.role as u8 != v as u8 {
            return false;
        }
    }
    if let Some(v) = filter.status {
        if sub.status as u8 != v as u8 {
            return false;
        }
    }
    true
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn lookup(&self, filter: &SubscriptionFilter) -> CoreResult<Vec<Subscription>> {
        Ok(self
            .subscriptions
            .lock()
            .unwrap()
            .iter()
            .filter(|s| matches(filter, s))
            .cloned()
            .collect())
    }

    async fn insert_operation(&self, lro: Lro) -> CoreResult<Lro> {
        let mut ops = self.operations.lock().unwrap();
        if ops.contains_key(&lro.operation_id) {
            return Err(CoreError::OperationAlreadyExists(lro.operation_id));
        }
        ops.insert(lro.operation_id.clone(), lro.clone());
        Ok(lro)
    }

    async fn get_operation(&self, operation_id: &str) -> CoreResult<Lro> {
        self.operations
            .lock()
            .unwrap()
            .get(operation_id)
            .cloned()
            .ok_or_else(|| CoreError::OperationNotFound(operation_id.to_string()))
    }

    async fn update_operation(&self, lro: Lro) -> CoreResult<Lro> {
        let mut ops = self.operations.lock().unwrap();
        if !ops.contains_key(&lro.operation_id) {
            return Err(CoreError::OperationNotFound(lro.operation_id));
        }
        ops.insert(lro.operation_id.clone(), lro.clone());
        Ok(lro)
    }

    async fn insert_subscription(&self, sub: Subscription) -> CoreResult<Subscription> {
        let mut subs = self.subscriptions.lock().unwrap();
        let conflict = subs.iter().any(|s| {
            s.subscriber_id == sub.subscriber_id && s.domain == sub.domain && s.role as u8 == sub.role as u8
        });
        if conflict {
            return Err(CoreError::SubscriptionConflict {
                subscriber_id: sub.subscriber_id,
                domain: sub.domain,
                role: sub.role.as_str().to_string(),
            });
        }
        subs.push(sub.clone());
        Ok(sub)
    }

    async fn upsert_subscription_and_lro(
        &self,
        sub: Subscription,
        lro: Lro,
    ) -> CoreResult<(Subscription, Lro)> {
        {
            let mut subs = self.subscriptions.lock().unwrap();
            subs.retain(|s| {
                !(s.subscriber_id == sub.subscriber_id
                    && s.domain == sub.domain
                    && s.role as u8 == sub.role as u8)
            });
            subs.push(sub.clone());
        }
        let mut ops = self.operations.lock().unwrap();
        if !ops.contains_key(&lro.operation_id) {
            return Err(CoreError::OperationNotFound(lro.operation_id));
        }
        ops.insert(lro.operation_id.clone(), lro.clone());
        Ok((sub, lro))
    }

    async fn get_subscriber_signing_key(
        &self,
        subscriber_id: &str,
        domain: &str,
        role: Role,
        key_id: &str,
    ) -> CoreResult<String> {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .find(|s| {
                s.subscriber_id == subscriber_id
                    && s.domain == domain
                    && s.role as u8 == role as u8
                    && s.key_id == key_id
            })
            .map(|s| s.signing_public_key.clone())
            .ok_or_else(|| CoreError::SubscriberKeyNotFound {
                subscriber_id: subscriber_id.to_string(),
                domain: domain.to_string(),
            })
    }

    async fn encryption_key(&self, subscriber_id: &str, key_id: &str) -> CoreResult<String> {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.subscriber_id == subscriber_id && s.key_id == key_id)
            .map(|s| s.encr_public_key.clone())
            .ok_or_else(|| CoreError::EncryptionKeyNotFound(subscriber_id.to_string()))
    }
}

/// Challenge service that returns a fixed sequence of challenges and
/// verifies by plain equality.
pub struct FixedChallengeService {
    pub challenge: String,
}

impl ChallengeService for FixedChallengeService {
    fn new_challenge(&self) -> CoreResult<String> {
        Ok(self.challenge.clone())
    }

    fn verify(&self, challenge: &str, answer: &str) -> bool {
        challenge == answer
    }
}

/// Encrypter that "encrypts" by formatting a tagged string — enough to
/// exercise the Admin Service's call sequence without real cryptography.
pub struct NoopEncrypter;

#[async_trait]
impl Encrypter for NoopEncrypter {
    async fn encrypt(&self, data: &[u8], peer_public: &str) -> CoreResult<Vec<u8>> {
        let mut out = format!("enc:{peer_public}:").into_bytes();
        out.extend_from_slice(data);
        Ok(out)
    }
}

pub struct MockParticipantClient {
    pub answer: String,
    pub fail: bool,
}

#[async_trait]
impl ParticipantClient for MockParticipantClient {
    async fn on_subscribe(
        &self,
        _callback_url: &str,
        _request: OnSubscribeRequest,
    ) -> CoreResult<OnSubscribeResponse> {
        if self.fail {
            return Err(CoreError::transient("on_subscribe", "mock failure"));
        }
        Ok(OnSubscribeResponse {
            answer: self.answer.clone(),
        })
    }
}

#[derive(Default)]
pub struct RecordingEventPublisher {
    pub events: Mutex<Vec<Event>>,
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(&self, event: Event) -> CoreResult<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

pub struct FixedAuthGen {
    pub header: String,
}

#[async_trait]
impl AuthGen for FixedAuthGen {
    async fn auth_header(&self, _body: &[u8], _key_id: &str) -> CoreResult<String> {
        Ok(self.header.clone())
    }
}
