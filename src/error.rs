use thiserror::Error;

/// Matchable error kinds for the registry/gateway core.
///
/// Validation and not-found/conflict/workflow variants are surfaced to
/// callers unchanged; `Transient` wraps driver/RPC/network failures with a
/// contextual prefix (spec §7).
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    #[error("key_id must not be empty")]
    EmptyKeyID,
    #[error("keyset must not be nil")]
    NilKeyset,
    #[error("subscriber_id must not be empty")]
    EmptySubscriberID,
    #[error("unique_key_id must not be empty")]
    EmptyUniqueKeyID,
    #[error("invalid operation type: {0}")]
    InvalidOperationType(String),

    #[error("operation not found: {0}")]
    OperationNotFound(String),
    #[error("signing key not found for subscriber {subscriber_id} domain {domain}")]
    SubscriberKeyNotFound { subscriber_id: String, domain: String },
    #[error("encryption key not found for subscriber {0}")]
    EncryptionKeyNotFound(String),
    #[error("subscriber not found: {0}")]
    SubscriberNotFound(String),
    #[error("keyset not found for key_id {0}")]
    KeysetNotFound(String),

    #[error("operation already exists: {0}")]
    OperationAlreadyExists(String),
    #[error("subscription conflict for subscriber {subscriber_id} domain {domain} role {role}")]
    SubscriptionConflict {
        subscriber_id: String,
        domain: String,
        role: String,
    },

    #[error("LRO {0} already processed")]
    LROAlreadyProcessed(String),
    #[error("LRO {operation_id} exceeded max retries ({retry_count} > {max})")]
    MaxRetriesExceeded {
        operation_id: String,
        retry_count: i64,
        max: i64,
    },

    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("invalid task: {0}")]
    InvalidTask(String),
    #[error("queue stopped")]
    QueueStopped,

    #[error("nack response: code={code:?} message={message:?}")]
    Nack {
        code: Option<String>,
        message: Option<String>,
    },

    #[error("commit failed: {0}")]
    CommitFailed(String),

    #[error("transient failure: {0}")]
    Transient(String),
}

impl CoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CoreError::OperationNotFound(_)
                | CoreError::SubscriberKeyNotFound { .. }
                | CoreError::EncryptionKeyNotFound(_)
                | CoreError::SubscriberNotFound(_)
                | CoreError::KeysetNotFound(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            CoreError::OperationAlreadyExists(_) | CoreError::SubscriptionConflict { .. }
        )
    }

    pub fn transient(context: impl Into<String>, err: impl std::fmt::Display) -> Self {
        CoreError::Transient(format!("{}: {err}", context.into()))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => CoreError::OperationNotFound("no rows".to_string()),
            _ => CoreError::transient("database driver error", err),
        }
    }
}
