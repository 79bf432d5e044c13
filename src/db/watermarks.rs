//! Per-owner sync watermark bookkeeping
//!
//! The authoritative cutoff a client receives is always the instant captured at the
//! start of its own exchange; this table exists for bookkeeping and the status
//! endpoint, never as a shared cursor between devices.

use chrono::{DateTime, DurationRound, Utc};
use sqlx::SqlitePool;

use super::{format_ts, parse_ts};
use crate::error::Result;

/// The server's notion of "now", captured once per exchange.
///
/// Truncated to microseconds so it round-trips exactly through the stored
/// timestamp format; every write in the exchange is stamped with the same value.
pub fn current_instant() -> DateTime<Utc> {
    let now = Utc::now();
    now.duration_trunc(chrono::Duration::microseconds(1))
        .unwrap_or(now)
}

/// Bookkeeping row for one owner
#[derive(Debug, Clone)]
pub struct Watermark {
    pub owner_id: String,
    pub last_sync: DateTime<Utc>,
    pub exchange_count: i64,
}

/// Repository for sync watermark bookkeeping
pub struct WatermarkRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> WatermarkRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Get the bookkeeping watermark for an owner
    pub async fn get(&self, owner_id: &str) -> Result<Option<Watermark>> {
        let row: Option<(String, i64)> = sqlx::query_as(
            "SELECT last_sync, exchange_count FROM sync_watermarks WHERE owner_id = ?",
        )
        .bind(owner_id)
        .fetch_optional(self.pool)
        .await?;

        row.map(|(last_sync, exchange_count)| {
            Ok(Watermark {
                owner_id: owner_id.to_string(),
                last_sync: parse_ts(&last_sync)?,
                exchange_count,
            })
        })
        .transpose()
    }

    /// Record a completed exchange. MAX keeps the row monotonic even when two
    /// devices' exchanges land out of order.
    pub async fn advance(&self, owner_id: &str, instant: &DateTime<Utc>) -> Result<()> {
        let ts = format_ts(instant);

        sqlx::query(
            r#"
            INSERT INTO sync_watermarks (owner_id, last_sync, exchange_count, updated_at)
            VALUES (?, ?, 1, ?)
            ON CONFLICT(owner_id) DO UPDATE SET
                last_sync = MAX(last_sync, excluded.last_sync),
                exchange_count = exchange_count + 1,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(owner_id)
        .bind(&ts)
        .bind(&ts)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Rewind the owner's watermark to the beginning of time, so the next sync
    /// behaves as a first sync.
    pub async fn reset(&self, owner_id: &str) -> Result<()> {
        let epoch = format_ts(&DateTime::<Utc>::UNIX_EPOCH);
        let now = format_ts(&current_instant());

        sqlx::query(
            r#"
            INSERT INTO sync_watermarks (owner_id, last_sync, exchange_count, updated_at)
            VALUES (?, ?, 0, ?)
            ON CONFLICT(owner_id) DO UPDATE SET
                last_sync = excluded.last_sync,
                exchange_count = 0,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(owner_id)
        .bind(&epoch)
        .bind(&now)
        .execute(self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::initialize_schema;

    async fn setup_test_db() -> SqlitePool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await
            .unwrap();
        initialize_schema(&pool).await.unwrap();
        pool
    }

    #[test]
    fn test_current_instant_roundtrips_through_storage() {
        let now = current_instant();
        assert_eq!(parse_ts(&format_ts(&now)).unwrap(), now);
    }

    #[tokio::test]
    async fn test_advance_and_get() {
        let pool = setup_test_db().await;
        let repo = WatermarkRepository::new(&pool);

        assert!(repo.get("u1").await.unwrap().is_none());

        let t1 = current_instant();
        repo.advance("u1", &t1).await.unwrap();

        let wm = repo.get("u1").await.unwrap().unwrap();
        assert_eq!(wm.last_sync, t1);
        assert_eq!(wm.exchange_count, 1);
    }

    #[tokio::test]
    async fn test_advance_is_monotonic() {
        let pool = setup_test_db().await;
        let repo = WatermarkRepository::new(&pool);

        let later = current_instant();
        let earlier = later - chrono::Duration::seconds(5);

        repo.advance("u1", &later).await.unwrap();
        repo.advance("u1", &earlier).await.unwrap();

        let wm = repo.get("u1").await.unwrap().unwrap();
        assert_eq!(wm.last_sync, later);
        assert_eq!(wm.exchange_count, 2);
    }

    #[tokio::test]
    async fn test_reset_rewinds_to_epoch() {
        let pool = setup_test_db().await;
        let repo = WatermarkRepository::new(&pool);

        repo.advance("u1", &current_instant()).await.unwrap();
        repo.reset("u1").await.unwrap();

        let wm = repo.get("u1").await.unwrap().unwrap();
        assert_eq!(wm.last_sync, DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(wm.exchange_count, 0);
    }
}
