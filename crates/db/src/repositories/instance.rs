use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;

use approvd_core::domain::instance::{ApprovalInstance, DispatchState, InstanceId};
use approvd_core::store::{InstanceStore, StoreError};

use super::backend;
use crate::DbPool;

/// SQLite-backed instance store. The aggregate is persisted whole as JSON;
/// the projected columns exist only for lookups and the dispatch-due scan.
pub struct SqlInstanceStore {
    pool: DbPool,
}

impl SqlInstanceStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Fixed-width RFC 3339 so SQLite string comparison orders chronologically.
fn timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn pending_next_attempt(instance: &ApprovalInstance) -> Option<String> {
    match &instance.dispatch {
        DispatchState::Pending { next_attempt_at, .. } => Some(timestamp(*next_attempt_at)),
        _ => None,
    }
}

fn encode_body(instance: &ApprovalInstance) -> Result<String, StoreError> {
    serde_json::to_string(instance)
        .map_err(|e| StoreError::Backend(format!("encode instance: {e}")))
}

fn decode_body(raw: &str) -> Result<ApprovalInstance, StoreError> {
    serde_json::from_str(raw)
        .map_err(|e| StoreError::Backend(format!("decode instance: {e}")))
}

#[async_trait]
impl InstanceStore for SqlInstanceStore {
    async fn insert(&self, instance: ApprovalInstance) -> Result<(), StoreError> {
        let body_json = encode_body(&instance)?;

        let result = sqlx::query(
            "INSERT INTO approval_instance (id, entity_type, entity_id, status,
                                            dispatch_state, next_attempt_at, revision,
                                            body_json, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&instance.id.0)
        .bind(instance.entity.entity_type.key())
        .bind(&instance.entity.entity_id.0)
        .bind(instance.status.as_str())
        .bind(instance.dispatch.as_str())
        .bind(pending_next_attempt(&instance))
        .bind(instance.revision as i64)
        .bind(&body_json)
        .bind(timestamp(instance.created_at))
        .bind(timestamp(instance.updated_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::DuplicateInstance { instance_id: instance.id.clone() })
            }
            Err(other) => Err(backend(other)),
        }
    }

    async fn get(&self, id: &InstanceId) -> Result<Option<ApprovalInstance>, StoreError> {
        let row = sqlx::query("SELECT body_json FROM approval_instance WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        match row {
            Some(row) => {
                let body_json: String = row.try_get("body_json").map_err(backend)?;
                Ok(Some(decode_body(&body_json)?))
            }
            None => Ok(None),
        }
    }

    async fn update(
        &self,
        instance: ApprovalInstance,
        expected_revision: u64,
    ) -> Result<(), StoreError> {
        let body_json = encode_body(&instance)?;

        let rows_affected = sqlx::query(
            "UPDATE approval_instance
             SET status = ?, dispatch_state = ?, next_attempt_at = ?, revision = ?,
                 body_json = ?, updated_at = ?
             WHERE id = ? AND revision = ?",
        )
        .bind(instance.status.as_str())
        .bind(instance.dispatch.as_str())
        .bind(pending_next_attempt(&instance))
        .bind(instance.revision as i64)
        .bind(&body_json)
        .bind(timestamp(instance.updated_at))
        .bind(&instance.id.0)
        .bind(expected_revision as i64)
        .execute(&self.pool)
        .await
        .map_err(backend)?
        .rows_affected();

        if rows_affected == 0 {
            let exists = sqlx::query("SELECT 1 FROM approval_instance WHERE id = ?")
                .bind(&instance.id.0)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
            return Err(if exists.is_some() {
                StoreError::RevisionConflict {
                    instance_id: instance.id.clone(),
                    expected: expected_revision,
                }
            } else {
                StoreError::InstanceNotFound { instance_id: instance.id.clone() }
            });
        }
        Ok(())
    }

    async fn list_dispatch_due(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ApprovalInstance>, StoreError> {
        let rows = sqlx::query(
            "SELECT body_json FROM approval_instance
             WHERE dispatch_state = 'pending' AND next_attempt_at <= ?
             ORDER BY id",
        )
        .bind(timestamp(now))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter()
            .map(|row| {
                let body_json: String = row.try_get("body_json").map_err(backend)?;
                decode_body(&body_json)
            })
            .collect()
    }
}
