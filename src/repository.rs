use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};

use crate::error::{CoreError, CoreResult};
use crate::model::{
    CodeName, Location, Lro, OperationStatus, OperationType, Role, Subscription,
    SubscriptionFilter, SubscriptionStatus,
};

/// Durable store for subscriptions and long-running operations (spec §4.A).
///
/// Timestamps are authoritative from the database, never the caller; the
/// only multi-row transaction is `upsert_subscription_and_lro`.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn lookup(&self, filter: &SubscriptionFilter) -> CoreResult<Vec<Subscription>>;

    async fn insert_operation(&self, lro: Lro) -> CoreResult<Lro>;

    async fn get_operation(&self, operation_id: &str) -> CoreResult<Lro>;

    async fn update_operation(&self, lro: Lro) -> CoreResult<Lro>;

    async fn insert_subscription(&self, sub: Subscription) -> CoreResult<Subscription>;

    async fn upsert_subscription_and_lro(
        &self,
        sub: Subscription,
        lro: Lro,
    ) -> CoreResult<(Subscription, Lro)>;

    async fn get_subscriber_signing_key(
        &self,
        subscriber_id: &str,
        domain: &str,
        role: Role,
        key_id: &str,
    ) -> CoreResult<String>;

    async fn encryption_key(&self, subscriber_id: &str, key_id: &str) -> CoreResult<String>;
}

pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Builds the equality-conjunction WHERE clause and bind list for a
/// `SubscriptionFilter`. Scalar fields bind against their own column;
/// location sub-fields bind against JSON-encoded paths, e.g.
/// `location->>'id'` or `location->'city'->>'name'` (spec §4.A).
struct FilterClause {
    sql: String,
    binds: Vec<String>,
}

fn build_filter_clause(filter: &SubscriptionFilter) -> FilterClause {
    let mut clauses = Vec::new();
    let mut binds = Vec::new();
    let mut next = 1;

    macro_rules! scalar {
        ($col:expr, $val:expr) => {
            if let Some(v) = $val {
                next += 1;
                clauses.push(format!("{} = ${}", $col, next - 1));
                binds.push(v.clone());
            }
        };
    }

    scalar!("subscriber_id", &filter.subscriber_id);
    scalar!("url", &filter.url);
    scalar!("domain", &filter.domain);
    scalar!("key_id", &filter.key_id);

    if let Some(role) = &filter.role {
        next += 1;
        clauses.push(format!("role = ${}", next - 1));
        binds.push(role.as_str().to_string());
    }

    if let Some(status) = &filter.status {
        next += 1;
        clauses.push(format!("status = ${}", next - 1));
        binds.push(status_as_str(*status).to_string());
    }

    if let Some(loc) = &filter.location {
        macro_rules! loc_field {
            ($path:expr, $val:expr) => {
                if let Some(v) = $val {
                    next += 1;
                    clauses.push(format!("location->>'{}' = ${}", $path, next - 1));
                    binds.push(v.clone());
                }
            };
        }
        loc_field!("id", &loc.id);
        loc_field!("mapUrl", &loc.map_url);
        loc_field!("address", &loc.address);
        loc_field!("district", &loc.district);
        loc_field!("areaCode", &loc.area_code);
        loc_field!("polygon", &loc.polygon);
        loc_field!("rating", &loc.rating);

        macro_rules! loc_nested {
            ($outer:expr, $field:ident) => {
                if let Some(nested) = &loc.$field {
                    next += 1;
                    clauses.push(format!("location->'{}'->>'name' = ${}", $outer, next - 1));
                    binds.push(nested.name.clone());
                    next += 1;
                    clauses.push(format!("location->'{}'->>'code' = ${}", $outer, next - 1));
                    binds.push(nested.code.clone());
                }
            };
        }
        loc_nested!("city", city);
        loc_nested!("state", state);
        loc_nested!("country", country);
    }

    let sql = if clauses.is_empty() {
        "TRUE".to_string()
    } else {
        clauses.join(" AND ")
    };

    FilterClause { sql, binds }
}

fn status_as_str(s: SubscriptionStatus) -> &'static str {
    match s {
        SubscriptionStatus::Initiated => "INITIATED",
        SubscriptionStatus::UnderSubscription => "UNDER_SUBSCRIPTION",
        SubscriptionStatus::Subscribed => "SUBSCRIBED",
        SubscriptionStatus::Expired => "EXPIRED",
        SubscriptionStatus::Rejected => "REJECTED",
    }
}

fn parse_status(s: &str) -> CoreResult<SubscriptionStatus> {
    Ok(match s {
        "INITIATED" => SubscriptionStatus::Initiated,
        "UNDER_SUBSCRIPTION" => SubscriptionStatus::UnderSubscription,
        "SUBSCRIBED" => SubscriptionStatus::Subscribed,
        "EXPIRED" => SubscriptionStatus::Expired,
        "REJECTED" => SubscriptionStatus::Rejected,
        other => return Err(CoreError::Transient(format!("unknown subscription status {other}"))),
    })
}

fn parse_role(s: &str) -> CoreResult<Role> {
    Ok(match s {
        "BAP" => Role::Bap,
        "BPP" => Role::Bpp,
        "BG" => Role::Bg,
        other => return Err(CoreError::Transient(format!("unknown role {other}"))),
    })
}

fn row_to_subscription(row: &sqlx::postgres::PgRow) -> CoreResult<Subscription> {
    let location: Option<serde_json::Value> = row.try_get("location").ok();
    let location: Option<Location> = match location {
        Some(v) if !v.is_null() => Some(serde_json::from_value(v).map_err(|e| {
            CoreError::transient("decoding location json", e)
        })?),
        _ => None,
    };

    Ok(Subscription {
        subscriber_id: row.try_get("subscriber_id")?,
        url: row.try_get("url")?,
        role: parse_role(row.try_get::<String, _>("role")?.as_str())?,
        domain: row.try_get("domain")?,
        location,
        key_id: row.try_get("key_id")?,
        signing_public_key: row.try_get("signing_public_key")?,
        encr_public_key: row.try_get("encr_public_key")?,
        valid_from: row.try_get("valid_from")?,
        valid_until: row.try_get("valid_until")?,
        nonce: row.try_get("nonce")?,
        status: parse_status(row.try_get::<String, _>("status")?.as_str())?,
        created: row.try_get("created_at")?,
        updated: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl Repository for PgRepository {
    async fn lookup(&self, filter: &SubscriptionFilter) -> CoreResult<Vec<Subscription>> {
        let clause = build_filter_clause(filter);
        let sql = format!(
            "SELECT subscriber_id, url, role, domain, location, key_id, signing_public_key, \
             encr_public_key, valid_from, valid_until, status, nonce, created_at, updated_at \
             FROM subscriptions WHERE {}",
            clause.sql
        );

        let mut query = sqlx::query(&sql);
        for b in &clause.binds {
            query = query.bind(b);
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CoreError::transient("lookup query failed", e))?;

        rows.iter().map(row_to_subscription).collect()
    }

    async fn insert_operation(&self, lro: Lro) -> CoreResult<Lro> {
        if lro.operation_id.trim().is_empty() {
            return Err(CoreError::Transient(
                "operation_id must not be empty".to_string(),
            ));
        }

        let result = sqlx::query(
            "INSERT INTO operations (operation_id, status, type, request_json, retry_count) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING created_at, updated_at",
        )
        .bind(&lro.operation_id)
        .bind(status_as_str_op(lro.status))
        .bind(type_as_str(lro.operation_type))
        .bind(&lro.request_json)
        .bind(lro.retry_count)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => {
                let mut out = lro;
                out.created_at = row.try_get("created_at")?;
                out.updated_at = row.try_get("updated_at")?;
                Ok(out)
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(CoreError::OperationAlreadyExists(lro.operation_id))
            }
            Err(e) => Err(CoreError::transient("insert_operation failed", e)),
        }
    }

    async fn get_operation(&self, operation_id: &str) -> CoreResult<Lro> {
        let row = sqlx::query(
            "SELECT operation_id, status, type, request_json, result_json, error_data_json, \
             retry_count, created_at, updated_at FROM operations WHERE operation_id = $1",
        )
        .bind(operation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::transient("get_operation failed", e))?
        .ok_or_else(|| CoreError::OperationNotFound(operation_id.to_string()))?;

        row_to_lro(&row)
    }

    async fn update_operation(&self, lro: Lro) -> CoreResult<Lro> {
        let row = sqlx::query(
            "UPDATE operations SET status = $2, result_json = $3, error_data_json = $4, \
             retry_count = $5 WHERE operation_id = $1 \
             RETURNING created_at, updated_at, type, request_json",
        )
        .bind(&lro.operation_id)
        .bind(status_as_str_op(lro.status))
        .bind(&lro.result_json)
        .bind(&lro.error_data_json)
        .bind(lro.retry_count)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::transient("update_operation failed", e))?
        .ok_or_else(|| CoreError::OperationNotFound(lro.operation_id.clone()))?;

        let mut out = lro;
        out.created_at = row.try_get("created_at")?;
        out.updated_at = row.try_get("updated_at")?;
        out.operation_type = parse_op_type(row.try_get::<String, _>("type")?.as_str())?;
        out.request_json = row.try_get("request_json")?;
        Ok(out)
    }

    async fn insert_subscription(&self, sub: Subscription) -> CoreResult<Subscription> {
        let location_json = match &sub.location {
            Some(loc) => Some(
                serde_json::to_value(loc)
                    .map_err(|e| CoreError::transient("encoding location json", e))?,
            ),
            None => None,
        };

        let result = sqlx::query(
            "INSERT INTO subscriptions (subscriber_id, url, role, domain, location, key_id, \
             signing_public_key, encr_public_key, valid_from, valid_until, status, nonce) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             RETURNING created_at, updated_at",
        )
        .bind(&sub.subscriber_id)
        .bind(&sub.url)
        .bind(sub.role.as_str())
        .bind(&sub.domain)
        .bind(location_json)
        .bind(&sub.key_id)
        .bind(&sub.signing_public_key)
        .bind(&sub.encr_public_key)
        .bind(sub.valid_from)
        .bind(sub.valid_until)
        .bind(status_as_str(sub.status))
        .bind(&sub.nonce)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => {
                let mut out = sub;
                out.created = row.try_get("created_at")?;
                out.updated = row.try_get("updated_at")?;
                Ok(out)
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(CoreError::SubscriptionConflict {
                    subscriber_id: sub.subscriber_id,
                    domain: sub.domain,
                    role: sub.role.as_str().to_string(),
                })
            }
            Err(e) => Err(CoreError::transient("insert_subscription failed", e)),
        }
    }

    async fn upsert_subscription_and_lro(
        &self,
        sub: Subscription,
        lro: Lro,
    ) -> CoreResult<(Subscription, Lro)> {
        let mut txn = self
            .pool
            .begin()
            .await
            .map_err(|e| CoreError::transient("begin transaction failed", e))?;

        let location_json = match &sub.location {
            Some(loc) => Some(
                serde_json::to_value(loc)
                    .map_err(|e| CoreError::transient("encoding location json", e))?,
            ),
            None => None,
        };

        let sub_row = sqlx::query(
            "INSERT INTO subscriptions (subscriber_id, url, role, domain, location, key_id, \
             signing_public_key, encr_public_key, valid_from, valid_until, status, nonce) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (subscriber_id, domain, role) DO UPDATE SET \
             url = EXCLUDED.url, location = EXCLUDED.location, key_id = EXCLUDED.key_id, \
             signing_public_key = EXCLUDED.signing_public_key, \
             encr_public_key = EXCLUDED.encr_public_key, valid_from = EXCLUDED.valid_from, \
             valid_until = EXCLUDED.valid_until, status = EXCLUDED.status, \
             nonce = EXCLUDED.nonce \
             RETURNING created_at, updated_at",
        )
        .bind(&sub.subscriber_id)
        .bind(&sub.url)
        .bind(sub.role.as_str())
        .bind(&sub.domain)
        .bind(location_json)
        .bind(&sub.key_id)
        .bind(&sub.signing_public_key)
        .bind(&sub.encr_public_key)
        .bind(sub.valid_from)
        .bind(sub.valid_until)
        .bind(status_as_str(sub.status))
        .bind(&sub.nonce)
        .fetch_one(&mut *txn)
        .await;

        let sub_row = match sub_row {
            Ok(r) => r,
            Err(e) => {
                // Rollback on error paths must not mask the original error.
                let _ = txn.rollback().await;
                return Err(CoreError::transient("upsert subscription failed", e));
            }
        };

        let lro_row = sqlx::query(
            "UPDATE operations SET status = $2, result_json = $3, error_data_json = $4, \
             retry_count = $5 WHERE operation_id = $1 \
             RETURNING created_at, updated_at, type, request_json",
        )
        .bind(&lro.operation_id)
        .bind(status_as_str_op(lro.status))
        .bind(&lro.result_json)
        .bind(&lro.error_data_json)
        .bind(lro.retry_count)
        .fetch_optional(&mut *txn)
        .await;

        let lro_row = match lro_row {
            Ok(Some(r)) => r,
            Ok(None) => {
                let _ = txn.rollback().await;
                return Err(CoreError::OperationNotFound(lro.operation_id.clone()));
            }
            Err(e) => {
                let _ = txn.rollback().await;
                return Err(CoreError::transient("update lro in transaction failed", e));
            }
        };

        txn.commit()
            .await
            .map_err(|e| CoreError::CommitFailed(e.to_string()))?;

        let mut out_sub = sub;
        out_sub.created = sub_row.try_get("created_at")?;
        out_sub.updated = sub_row.try_get("updated_at")?;

        let mut out_lro = lro;
        out_lro.created_at = lro_row.try_get("created_at")?;
        out_lro.updated_at = lro_row.try_get("updated_at")?;
        out_lro.operation_type = parse_op_type(lro_row.try_get::<String, _>("type")?.as_str())?;
        out_lro.request_json = lro_row.try_get("request_json")?;

        Ok((out_sub, out_lro))
    }

    async fn get_subscriber_signing_key(
        &self,
        subscriber_id: &str,
        domain: &str,
        role: Role,
        key_id: &str,
    ) -> CoreResult<String> {
        let row = sqlx::query(
            "SELECT signing_public_key FROM subscriptions WHERE subscriber_id = $1 AND \
             domain = $2 AND role = $3 AND key_id = $4 AND status = 'SUBSCRIBED'",
        )
        .bind(subscriber_id)
        .bind(domain)
        .bind(role.as_str())
        .bind(key_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::transient("get_subscriber_signing_key failed", e))?
        .ok_or_else(|| CoreError::SubscriberKeyNotFound {
            subscriber_id: subscriber_id.to_string(),
            domain: domain.to_string(),
        })?;

        Ok(row.try_get("signing_public_key")?)
    }

    async fn encryption_key(&self, subscriber_id: &str, key_id: &str) -> CoreResult<String> {
        let row = sqlx::query(
            "SELECT encr_public_key FROM subscriptions WHERE subscriber_id = $1 AND \
             key_id = $2 AND status = 'SUBSCRIBED'",
        )
        .bind(subscriber_id)
        .bind(key_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::transient("encryption_key failed", e))?
        .ok_or_else(|| CoreError::EncryptionKeyNotFound(subscriber_id.to_string()))?;

        Ok(row.try_get("encr_public_key")?)
    }
}

fn status_as_str_op(s: OperationStatus) -> &'static str {
    match s {
        OperationStatus::Pending => "PENDING",
        OperationStatus::Approved => "APPROVED",
        OperationStatus::Rejected => "REJECTED",
        OperationStatus::Failure => "FAILURE",
    }
}

fn parse_op_status(s: &str) -> CoreResult<OperationStatus> {
    Ok(match s {
        "PENDING" => OperationStatus::Pending,
        "APPROVED" => OperationStatus::Approved,
        "REJECTED" => OperationStatus::Rejected,
        "FAILURE" => OperationStatus::Failure,
        other => return Err(CoreError::Transient(format!("unknown operation status {other}"))),
    })
}

fn type_as_str(t: OperationType) -> &'static str {
    match t {
        OperationType::CreateSubscription => "CREATE_SUBSCRIPTION",
        OperationType::UpdateSubscription => "UPDATE_SUBSCRIPTION",
    }
}

fn parse_op_type(s: &str) -> CoreResult<OperationType> {
    Ok(match s {
        "CREATE_SUBSCRIPTION" => OperationType::CreateSubscription,
        "UPDATE_SUBSCRIPTION" => OperationType::UpdateSubscription,
        other => return Err(CoreError::InvalidOperationType(other.to_string())),
    })
}

fn row_to_lro(row: &sqlx::postgres::PgRow) -> CoreResult<Lro> {
    Ok(Lro {
        operation_id: row.try_get("operation_id")?,
        operation_type: parse_op_type(row.try_get::<String, _>("type")?.as_str())?,
        status: parse_op_status(row.try_get::<String, _>("status")?.as_str())?,
        request_json: row.try_get("request_json")?,
        result_json: row.try_get("result_json")?,
        error_data_json: row.try_get("error_data_json")?,
        retry_count: row.try_get("retry_count")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_clause_defaults_to_true_when_empty() {
        let clause = build_filter_clause(&SubscriptionFilter::new());
        assert_eq!(clause.sql, "TRUE");
        assert!(clause.binds.is_empty());
    }

    #[test]
    fn filter_clause_combines_scalar_and_location_fields() {
        let filter = SubscriptionFilter::new()
            .with_subscriber_id("npA")
            .with_domain("retail")
            .with_role(Role::Bpp);

        let clause = build_filter_clause(&filter);
        assert!(clause.sql.contains("subscriber_id = $1"));
        assert!(clause.sql.contains("domain = $"));
        assert!(clause.sql.contains("role = $"));
        assert_eq!(clause.binds, vec!["npA", "retail", "BPP"]);
    }

    #[test]
    fn filter_clause_uses_json_path_for_nested_location() {
        let filter = SubscriptionFilter {
            location: Some(Location {
                city: Some(CodeName {
                    name: "Bengaluru".into(),
                    code: "std:080".into(),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let clause = build_filter_clause(&filter);
        assert!(clause.sql.contains("location->'city'->>'name'"));
        assert!(clause.sql.contains("location->'city'->>'code'"));
        assert_eq!(clause.binds, vec!["Bengaluru", "std:080"]);
    }

    #[test]
    fn terminal_status_round_trips() {
        assert_eq!(status_as_str_op(OperationStatus::Approved), "APPROVED");
        assert_eq!(
            parse_op_status("APPROVED").unwrap() as u8 as u8,
            OperationStatus::Approved as u8 as u8
        );
    }
}
