use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Bap,
    Bpp,
    Bg,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Bap => "BAP",
            Role::Bpp => "BPP",
            Role::Bg => "BG",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Initiated,
    UnderSubscription,
    Subscribed,
    Expired,
    Rejected,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeName {
    pub name: String,
    pub code: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub district: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polygon: Option<String>,
    #[serde(rename = "3dspace", default, skip_serializing_if = "Option::is_none")]
    pub three_d_space: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<CodeName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<CodeName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<CodeName>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub subscriber_id: String,
    pub url: String,
    pub role: Role,
    pub domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    pub key_id: String,
    pub signing_public_key: String,
    pub encr_public_key: String,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    #[serde(default)]
    pub nonce: String,
    pub status: SubscriptionStatus,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated: Option<DateTime<Utc>>,
}

/// A partially-populated `Subscription` used as a lookup predicate: only
/// non-empty scalar fields and non-nil nested location fields contribute an
/// equality clause (spec §3).
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub subscriber_id: Option<String>,
    pub url: Option<String>,
    pub role: Option<Role>,
    pub domain: Option<String>,
    pub key_id: Option<String>,
    pub status: Option<SubscriptionStatus>,
    pub location: Option<Location>,
}

impl SubscriptionFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subscriber_id(mut self, v: impl Into<String>) -> Self {
        self.subscriber_id = Some(v.into());
        self
    }

    pub fn with_domain(mut self, v: impl Into<String>) -> Self {
        self.domain = Some(v.into());
        self
    }

    pub fn with_role(mut self, v: Role) -> Self {
        self.role = Some(v);
        self
    }

    pub fn with_key_id(mut self, v: impl Into<String>) -> Self {
        self.key_id = Some(v.into());
        self
    }

    pub fn with_status(mut self, v: SubscriptionStatus) -> Self {
        self.status = Some(v);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    CreateSubscription,
    UpdateSubscription,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Pending,
    Approved,
    Rejected,
    Failure,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Approved | OperationStatus::Rejected)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lro {
    pub operation_id: String,
    #[serde(rename = "type")]
    pub operation_type: OperationType,
    pub status: OperationStatus,
    pub request_json: Vec<u8>,
    #[serde(default)]
    pub result_json: Option<Vec<u8>>,
    #[serde(default)]
    pub error_data_json: Option<Vec<u8>>,
    pub retry_count: i64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A network participant's own key material, including private halves.
/// Private fields are wiped when the keyset leaves the in-process cache —
/// see [`crate::keymanager::cache`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Keyset {
    pub unique_key_id: String,
    #[serde(default)]
    pub signing_private: String,
    pub signing_public: String,
    #[serde(default)]
    pub encr_private: String,
    pub encr_public: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Proxy,
    Lookup,
}

#[derive(Debug, Clone, Default)]
pub struct TaskContext {
    pub domain: String,
    pub action: String,
    pub bap_uri: String,
    pub bpp_uri: String,
}

/// In-flight work item on the task queue. Classification happens at enqueue
/// time (spec §9 "Variants" note) so workers never branch on absence of
/// fields: a `Proxy` task always carries a `target`, a `Lookup` task never
/// does.
#[derive(Debug, Clone)]
pub enum AsyncTask {
    Proxy {
        target: reqwest::Url,
        body: Vec<u8>,
        headers: std::collections::HashMap<String, Vec<String>>,
    },
    Lookup {
        body: Vec<u8>,
        headers: std::collections::HashMap<String, Vec<String>>,
        context: TaskContext,
    },
}

impl AsyncTask {
    pub fn kind(&self) -> TaskKind {
        match self {
            AsyncTask::Proxy { .. } => TaskKind::Proxy,
            AsyncTask::Lookup { .. } => TaskKind::Lookup,
        }
    }
}
