//! Database schema initialization

use sqlx::SqlitePool;

use crate::error::Result;

/// Initialize the database schema
pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(SCHEMA_SQL).execute(pool).await?;

    Ok(())
}

const SCHEMA_SQL: &str = r#"
-- Synced entities (all record types, partitioned by entity_type)
CREATE TABLE IF NOT EXISTS entities (
    entity_type TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    id TEXT NOT NULL,
    -- Type-specific fields as a JSON object (without id/ownerId/updatedAt/isDeleted)
    data TEXT NOT NULL,
    is_deleted INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL,

    PRIMARY KEY (entity_type, owner_id, id)
);

CREATE INDEX IF NOT EXISTS idx_entities_owner_updated
    ON entities(entity_type, owner_id, updated_at);

-- Per-owner sync bookkeeping
CREATE TABLE IF NOT EXISTS sync_watermarks (
    owner_id TEXT PRIMARY KEY,
    last_sync TEXT NOT NULL,
    exchange_count INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);
"#;
