use async_trait::async_trait;

use crate::error::CoreResult;
use crate::model::Role;

/// Domain events the Admin Service emits at the end of `ApproveSubscription`
/// / `RejectSubscription` (spec §4.F step 13, §9 "observability"). Kept
/// separate from `tracing` output: these are meant for downstream
/// consumers, not operators.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    SubscriptionRequestApproved {
        operation_id: String,
        subscriber_id: String,
        domain: String,
        role: Role,
    },
    SubscriptionRequestRejected {
        operation_id: String,
        subscriber_id: String,
        domain: String,
        role: Role,
        reason: String,
    },
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: Event) -> CoreResult<()>;
}

/// Default publisher: structured log line, no external sink. Every
/// deployment that needs a real event bus supplies its own
/// `EventPublisher` (spec's capability-interface treatment of this seam).
pub struct LoggingEventPublisher;

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: Event) -> CoreResult<()> {
        match event {
            Event::SubscriptionRequestApproved {
                operation_id,
                subscriber_id,
                domain,
                role,
            } => {
                tracing::info!(
                    operation_id,
                    subscriber_id,
                    domain,
                    role = role.as_str(),
                    "subscription request approved"
                );
            }
            Event::SubscriptionRequestRejected {
                operation_id,
                subscriber_id,
                domain,
                role,
                reason,
            } => {
                tracing::info!(
                    operation_id,
                    subscriber_id,
                    domain,
                    role = role.as_str(),
                    reason,
                    "subscription request rejected"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn logging_publisher_accepts_both_event_variants() {
        let publisher = LoggingEventPublisher;
        publisher
            .publish(Event::SubscriptionRequestApproved {
                operation_id: "op1".into(),
                subscriber_id: "sub1".into(),
                domain: "nic2004:52110".into(),
                role: Role::Bpp,
            })
            .await
            .unwrap();

        publisher
            .publish(Event::SubscriptionRequestRejected {
                operation_id: "op2".into(),
                subscriber_id: "sub2".into(),
                domain: "nic2004:52110".into(),
                role: Role::Bap,
                reason: "challenge mismatch".into(),
            })
            .await
            .unwrap();
    }
}
