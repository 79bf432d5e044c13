//! Synced entity persistence
//!
//! One table holds every record type, partitioned by `entity_type` and scoped to
//! `owner_id` on every read and write, so cross-account interference is structurally
//! impossible.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::SqlitePool;

use super::{format_ts, parse_ts};
use crate::error::Result;

/// One stored record of a synced entity type
#[derive(Debug, Clone)]
pub struct StoredEntity {
    pub id: String,
    pub owner_id: String,
    /// Type-specific fields (everything except the server-managed columns)
    pub fields: Map<String, Value>,
    pub is_deleted: bool,
    /// Server-assigned; the sole ordering authority
    pub updated_at: DateTime<Utc>,
}

impl StoredEntity {
    /// Render the record in wire form: fields plus `id`, `isDeleted`, `updatedAt`.
    ///
    /// `ownerId` is never sent back; it is implicit in the authenticated caller.
    pub fn to_wire(&self) -> Value {
        let mut obj = self.fields.clone();
        obj.insert("id".to_string(), Value::String(self.id.clone()));
        obj.insert("isDeleted".to_string(), Value::Bool(self.is_deleted));
        obj.insert(
            "updatedAt".to_string(),
            Value::String(format_ts(&self.updated_at)),
        );
        Value::Object(obj)
    }
}

/// Repository for synced entities
pub struct EntityRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> EntityRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or update records keyed on `(entity_type, owner_id, id)`.
    ///
    /// The caller's `owner_id` is bound explicitly for every row; any owner carried
    /// inside a record is ignored, which prevents cross-account writes.
    pub async fn upsert_many(
        &self,
        entity_type: &str,
        owner_id: &str,
        records: &[StoredEntity],
    ) -> Result<usize> {
        for record in records {
            let data = serde_json::to_string(&record.fields)?;

            sqlx::query(
                r#"
                INSERT INTO entities (entity_type, owner_id, id, data, is_deleted, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(entity_type, owner_id, id) DO UPDATE SET
                    data = excluded.data,
                    is_deleted = excluded.is_deleted,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(entity_type)
            .bind(owner_id)
            .bind(&record.id)
            .bind(&data)
            .bind(record.is_deleted)
            .bind(format_ts(&record.updated_at))
            .execute(self.pool)
            .await?;
        }

        Ok(records.len())
    }

    /// Get a single record by id
    pub async fn get(
        &self,
        entity_type: &str,
        owner_id: &str,
        id: &str,
    ) -> Result<Option<StoredEntity>> {
        let row = sqlx::query_as::<_, EntityRow>(
            r#"
            SELECT owner_id, id, data, is_deleted, updated_at
            FROM entities
            WHERE entity_type = ? AND owner_id = ? AND id = ?
            "#,
        )
        .bind(entity_type)
        .bind(owner_id)
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        row.map(|r| r.into_entity()).transpose()
    }

    /// The owner's singleton row for a type, preferring the live one.
    pub async fn find_singleton(
        &self,
        entity_type: &str,
        owner_id: &str,
    ) -> Result<Option<StoredEntity>> {
        let row = sqlx::query_as::<_, EntityRow>(
            r#"
            SELECT owner_id, id, data, is_deleted, updated_at
            FROM entities
            WHERE entity_type = ? AND owner_id = ?
            ORDER BY is_deleted ASC, updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(entity_type)
        .bind(owner_id)
        .fetch_optional(self.pool)
        .await?;

        row.map(|r| r.into_entity()).transpose()
    }

    /// All records modified strictly after `cutoff`, tombstones included so
    /// deletions propagate. Strictly greater-than: a record sitting exactly on a
    /// device's watermark has already been delivered.
    pub async fn find_modified_since(
        &self,
        entity_type: &str,
        owner_id: &str,
        cutoff: &DateTime<Utc>,
    ) -> Result<Vec<StoredEntity>> {
        let rows = sqlx::query_as::<_, EntityRow>(
            r#"
            SELECT owner_id, id, data, is_deleted, updated_at
            FROM entities
            WHERE entity_type = ? AND owner_id = ? AND updated_at > ?
            ORDER BY updated_at ASC
            "#,
        )
        .bind(entity_type)
        .bind(owner_id)
        .bind(format_ts(cutoff))
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_entity()).collect()
    }

    /// Hard-remove every record of a type for an owner. Reset only; normal sync
    /// never physically deletes.
    pub async fn delete_all(&self, entity_type: &str, owner_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM entities WHERE entity_type = ? AND owner_id = ?")
            .bind(entity_type)
            .bind(owner_id)
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Count non-tombstoned records of a type for an owner
    pub async fn count_live(&self, entity_type: &str, owner_id: &str) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM entities WHERE entity_type = ? AND owner_id = ? AND is_deleted = 0",
        )
        .bind(entity_type)
        .bind(owner_id)
        .fetch_one(self.pool)
        .await?;

        Ok(row.0)
    }
}

/// Internal row type for SQLite queries
#[derive(sqlx::FromRow)]
struct EntityRow {
    owner_id: String,
    id: String,
    data: String,
    is_deleted: bool,
    updated_at: String,
}

impl EntityRow {
    fn into_entity(self) -> Result<StoredEntity> {
        let fields: Map<String, Value> = serde_json::from_str(&self.data)?;
        let updated_at = parse_ts(&self.updated_at)?;

        Ok(StoredEntity {
            id: self.id,
            owner_id: self.owner_id,
            fields,
            is_deleted: self.is_deleted,
            updated_at,
        })
    }
}
