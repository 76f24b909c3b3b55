use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use approvd_core::audit::{AuditEntry, AuditKind, AuditStore};
use approvd_core::domain::instance::InstanceId;
use approvd_core::store::StoreError;

use super::backend;
use crate::DbPool;

/// SQLite-backed audit log. Strictly insert-only; the unique
/// (instance_id, seq) constraint makes a forked chain a write error.
pub struct SqlAuditStore {
    pool: DbPool,
}

impl SqlAuditStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const ENTRY_COLUMNS: &str = "entry_id, instance_id, seq, kind, actor, metadata_json,
                             occurred_at, prev_hash, entry_hash, signature";

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<AuditEntry, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Backend(format!("decode audit entry: {e}"));

    let kind_str: String = row.try_get("kind").map_err(decode)?;
    let kind = AuditKind::parse(&kind_str)
        .ok_or_else(|| StoreError::Backend(format!("unknown audit kind `{kind_str}`")))?;

    let metadata_json: String = row.try_get("metadata_json").map_err(decode)?;
    let metadata: BTreeMap<String, String> = serde_json::from_str(&metadata_json)
        .map_err(|e| StoreError::Backend(format!("decode audit metadata: {e}")))?;

    let occurred_at_str: String = row.try_get("occurred_at").map_err(decode)?;
    let occurred_at = DateTime::parse_from_rfc3339(&occurred_at_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("decode audit timestamp: {e}")))?;

    Ok(AuditEntry {
        entry_id: row.try_get("entry_id").map_err(decode)?,
        instance_id: InstanceId(row.try_get("instance_id").map_err(decode)?),
        seq: row.try_get::<i64, _>("seq").map_err(decode)? as u64,
        kind,
        actor: row.try_get("actor").map_err(decode)?,
        metadata,
        occurred_at,
        prev_hash: row.try_get("prev_hash").map_err(decode)?,
        entry_hash: row.try_get("entry_hash").map_err(decode)?,
        signature: row.try_get("signature").map_err(decode)?,
    })
}

#[async_trait]
impl AuditStore for SqlAuditStore {
    async fn append(&self, entry: AuditEntry) -> Result<(), StoreError> {
        let metadata_json = serde_json::to_string(&entry.metadata)
            .map_err(|e| StoreError::Backend(format!("encode audit metadata: {e}")))?;

        sqlx::query(
            "INSERT INTO audit_log (entry_id, instance_id, seq, kind, actor, metadata_json,
                                    occurred_at, prev_hash, entry_hash, signature)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.entry_id)
        .bind(&entry.instance_id.0)
        .bind(entry.seq as i64)
        .bind(entry.kind.as_str())
        .bind(&entry.actor)
        .bind(&metadata_json)
        .bind(entry.occurred_at.to_rfc3339())
        .bind(&entry.prev_hash)
        .bind(&entry.entry_hash)
        .bind(&entry.signature)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }

    async fn history(&self, instance_id: &InstanceId) -> Result<Vec<AuditEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM audit_log WHERE instance_id = ? ORDER BY seq"
        ))
        .bind(&instance_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(row_to_entry).collect()
    }

    async fn latest(&self, instance_id: &InstanceId) -> Result<Option<AuditEntry>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM audit_log
             WHERE instance_id = ? ORDER BY seq DESC LIMIT 1"
        ))
        .bind(&instance_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        match row {
            Some(ref row) => Ok(Some(row_to_entry(row)?)),
            None => Ok(None),
        }
    }
}
