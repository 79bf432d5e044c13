//! Sync coordination
//!
//! Orchestrates one sync exchange: validate the incoming batches, apply them per
//! type, compute the outgoing delta per type, advance the bookkeeping watermark,
//! respond. The coordinator is stateless; each exchange is one independent unit of
//! work, and per-type work within an exchange fans out concurrently because the
//! types touch disjoint storage partitions.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;

use super::merge::{collapse, resolve, IncomingRecord};
use super::registry::{lookup, EntityTypeDef, MergeStrategy, ENTITY_TYPES, SINGLETON_ID};
use super::types::SyncStatusResponse;
use crate::db::{current_instant, EntityRepository, StoredEntity, WatermarkRepository};
use crate::error::{AppError, Result};

/// Result of one successful sync exchange
#[derive(Debug)]
pub struct SyncOutcome {
    /// The instant captured for this exchange; the client's next watermark
    pub timestamp: DateTime<Utc>,
    pub changes: HashMap<String, Vec<Value>>,
    pub failed_types: Vec<String>,
}

/// Coordinates sync exchanges against the entity store
pub struct SyncCoordinator<'a> {
    pool: &'a SqlitePool,
}

impl<'a> SyncCoordinator<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Run one sync exchange for an owner.
    ///
    /// The push phase is a fan-out of independent per-type sub-transactions;
    /// a failed type is reported in `failed_types` rather than failing the
    /// exchange, and its mutations stay pending on the client. A pull failure
    /// fails the whole exchange, because a partial delta with an advanced
    /// watermark would silently skip records.
    pub async fn synchronize(
        &self,
        owner_id: &str,
        last_sync: Option<DateTime<Utc>>,
        changes: &HashMap<String, Vec<Value>>,
    ) -> Result<SyncOutcome> {
        let cutoff = last_sync.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        // Captured once and reused for every write, so the exchange is
        // internally time-consistent.
        let now = current_instant();

        // Validate every batch up front; a malformed request has no effects.
        let mut batches: Vec<(&'static EntityTypeDef, Vec<IncomingRecord>)> = Vec::new();
        for (name, records) in changes {
            let def = lookup(name)
                .ok_or_else(|| AppError::Validation(format!("unknown entity type: {name}")))?;

            let mut parsed = Vec::with_capacity(records.len());
            for record in records {
                let incoming = IncomingRecord::parse(record)?;
                if !def.is_singleton() && incoming.id.is_none() {
                    return Err(AppError::Validation(format!(
                        "{name} record is missing an id"
                    )));
                }
                parsed.push(incoming);
            }
            batches.push((def, parsed));
        }

        // Push phase
        let applies = batches.into_iter().map(|(def, records)| async move {
            (def.name, self.apply_batch(def, owner_id, now, records).await)
        });

        let mut failed_types = Vec::new();
        let mut echoes: HashMap<&str, HashSet<String>> = HashMap::new();
        for (name, applied) in futures::future::join_all(applies).await {
            match applied {
                Ok(suppressed) => {
                    echoes.insert(name, suppressed);
                }
                Err(e) => {
                    tracing::warn!("push failed for type {}: {}", name, e);
                    failed_types.push(name.to_string());
                }
            }
        }
        failed_types.sort();

        // Pull phase: every known type, not just the pushed ones.
        let pulls = ENTITY_TYPES.iter().map(|def| {
            let suppressed = echoes.remove(def.name).unwrap_or_default();
            async move {
                let repo = EntityRepository::new(self.pool);
                let records = repo.find_modified_since(def.name, owner_id, &cutoff).await?;
                let wire: Vec<Value> = records
                    .into_iter()
                    .filter(|r| !(r.updated_at == now && suppressed.contains(&r.id)))
                    .map(|r| r.to_wire())
                    .collect();
                Ok::<_, AppError>((def.name.to_string(), wire))
            }
        });
        let changes_by_type: HashMap<String, Vec<Value>> =
            futures::future::try_join_all(pulls).await?.into_iter().collect();

        WatermarkRepository::new(self.pool)
            .advance(owner_id, &now)
            .await?;

        tracing::debug!(
            "sync exchange for owner {} complete ({} failed types)",
            owner_id,
            failed_types.len()
        );

        Ok(SyncOutcome {
            timestamp: now,
            changes: changes_by_type,
            failed_types,
        })
    }

    /// Apply one type's batch. Returns the ids whose echo should be suppressed
    /// from this exchange's pull: records the device already holds verbatim.
    /// Field-merged records that combined with stored state are echoed back,
    /// since they may carry sub-keys the pushing device has never seen.
    async fn apply_batch(
        &self,
        def: &EntityTypeDef,
        owner_id: &str,
        now: DateTime<Utc>,
        records: Vec<IncomingRecord>,
    ) -> Result<HashSet<String>> {
        let repo = EntityRepository::new(self.pool);

        match def.strategy {
            MergeStrategy::SingletonCollapse => {
                let Some(winner) = collapse(records) else {
                    return Ok(HashSet::new());
                };

                // Identity is the owner alone. Every writer lands on the
                // canonical row id, so two devices' concurrent first syncs
                // collide on the primary key and the per-record-atomic upsert
                // resolves the race; a client-proposed id is never an identity.
                let existing = repo.find_singleton(def.name, owner_id).await?;
                let id = existing
                    .as_ref()
                    .map(|e| e.id.clone())
                    .unwrap_or_else(|| SINGLETON_ID.to_string());

                let resolved = resolve(def, id.clone(), owner_id, now, &winner, existing.as_ref());
                repo.upsert_many(def.name, owner_id, &[resolved]).await?;

                Ok(HashSet::from([id]))
            }
            MergeStrategy::WholeRecord | MergeStrategy::FieldMerge { .. } => {
                let mut resolved_batch: Vec<StoredEntity> = Vec::with_capacity(records.len());
                let mut suppressed = HashSet::new();

                for incoming in records {
                    let id = incoming.id.clone().ok_or_else(|| {
                        AppError::Validation(format!("{} record is missing an id", def.name))
                    })?;

                    let existing = repo.get(def.name, owner_id, &id).await?;
                    let echo_needed = matches!(def.strategy, MergeStrategy::FieldMerge { .. })
                        && existing.is_some();

                    resolved_batch.push(resolve(
                        def,
                        id.clone(),
                        owner_id,
                        now,
                        &incoming,
                        existing.as_ref(),
                    ));
                    if !echo_needed {
                        suppressed.insert(id);
                    }
                }

                repo.upsert_many(def.name, owner_id, &resolved_batch).await?;
                Ok(suppressed)
            }
        }
    }

    /// Destructive, explicit reset: hard-delete every record of every type for
    /// the owner and rewind the watermark, so the next sync is a first sync.
    pub async fn reset_all(&self, owner_id: &str) -> Result<()> {
        let repo = EntityRepository::new(self.pool);
        for def in ENTITY_TYPES {
            let removed = repo.delete_all(def.name, owner_id).await?;
            tracing::debug!("reset removed {} {} records for {}", removed, def.name, owner_id);
        }

        WatermarkRepository::new(self.pool).reset(owner_id).await?;
        tracing::info!("reset all synced data for owner {}", owner_id);

        Ok(())
    }

    /// Bookkeeping view for the status endpoint
    pub async fn status(&self, owner_id: &str) -> Result<SyncStatusResponse> {
        let watermark = WatermarkRepository::new(self.pool).get(owner_id).await?;

        let repo = EntityRepository::new(self.pool);
        let mut live_records = HashMap::new();
        for def in ENTITY_TYPES {
            live_records.insert(
                def.name.to_string(),
                repo.count_live(def.name, owner_id).await?,
            );
        }

        Ok(SyncStatusResponse {
            last_sync: watermark.as_ref().map(|w| w.last_sync),
            exchange_count: watermark.map(|w| w.exchange_count).unwrap_or(0),
            live_records,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::initialize_schema;
    use serde_json::json;
    use std::time::Duration;

    // One connection: every pooled connection of an in-memory SQLite database
    // would otherwise see its own empty database.
    async fn setup_test_db() -> SqlitePool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await
            .unwrap();
        initialize_schema(&pool).await.unwrap();
        pool
    }

    fn batch(type_name: &str, records: Vec<Value>) -> HashMap<String, Vec<Value>> {
        HashMap::from([(type_name.to_string(), records)])
    }

    // Exchanges in these tests must observe distinct instants
    async fn tick() {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    /// Make every write of one type fail, leaving the rest of the pool healthy
    async fn break_type_writes(pool: &SqlitePool, type_name: &str) {
        sqlx::query(&format!(
            r#"
            CREATE TRIGGER broken_type_writes BEFORE INSERT ON entities
            WHEN NEW.entity_type = '{type_name}'
            BEGIN
                SELECT RAISE(ABORT, 'storage failure');
            END
            "#,
        ))
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_first_push_gets_no_echo() {
        let pool = setup_test_db().await;
        let coordinator = SyncCoordinator::new(&pool);

        let changes = batch("tasks", vec![json!({"id": "t1", "title": "Buy milk"})]);
        let outcome = coordinator.synchronize("u1", None, &changes).await.unwrap();

        assert!(outcome.failed_types.is_empty());
        assert!(outcome.changes["tasks"].is_empty());
    }

    #[tokio::test]
    async fn test_second_device_receives_pushed_record() {
        let pool = setup_test_db().await;
        let coordinator = SyncCoordinator::new(&pool);

        let changes = batch(
            "tasks",
            vec![json!({"id": "t1", "title": "Buy milk", "completed": false})],
        );
        let a = coordinator.synchronize("u1", None, &changes).await.unwrap();
        tick().await;

        let b = coordinator
            .synchronize("u1", None, &HashMap::new())
            .await
            .unwrap();

        assert_eq!(b.changes["tasks"].len(), 1);
        let record = &b.changes["tasks"][0];
        assert_eq!(record["id"], "t1");
        assert_eq!(record["title"], "Buy milk");
        assert_eq!(record["isDeleted"], false);
        assert!(b.timestamp >= a.timestamp);
    }

    #[tokio::test]
    async fn test_idempotent_replay() {
        let pool = setup_test_db().await;
        let coordinator = SyncCoordinator::new(&pool);

        let changes = batch("tasks", vec![json!({"id": "t1", "title": "once"})]);
        coordinator.synchronize("u1", None, &changes).await.unwrap();
        tick().await;
        coordinator.synchronize("u1", None, &changes).await.unwrap();
        tick().await;

        let pull = coordinator
            .synchronize("u1", None, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(pull.changes["tasks"].len(), 1);
        assert_eq!(pull.changes["tasks"][0]["title"], "once");
    }

    #[tokio::test]
    async fn test_monotonic_timestamps() {
        let pool = setup_test_db().await;
        let coordinator = SyncCoordinator::new(&pool);

        let mut previous = None;
        for _ in 0..3 {
            let outcome = coordinator
                .synchronize("u1", previous, &HashMap::new())
                .await
                .unwrap();
            if let Some(previous) = previous {
                assert!(outcome.timestamp >= previous);
            }
            previous = Some(outcome.timestamp);
            tick().await;
        }
    }

    #[tokio::test]
    async fn test_concurrent_history_merge_converges() {
        let pool = setup_test_db().await;
        let coordinator = SyncCoordinator::new(&pool);

        // Both devices start from nothing and push disjoint history sub-keys
        // for the same habit.
        let from_a = batch(
            "habits",
            vec![json!({"id": "h1", "name": "run", "history": {"2024-01-01": true}})],
        );
        let a = coordinator.synchronize("u1", None, &from_a).await.unwrap();
        tick().await;

        let from_b = batch(
            "habits",
            vec![json!({"id": "h1", "name": "run", "history": {"2024-01-02": false}})],
        );
        let b = coordinator.synchronize("u1", None, &from_b).await.unwrap();

        // B's push merged with stored state, so B receives the combined record
        // in the same exchange.
        assert_eq!(b.changes["habits"].len(), 1);
        let merged = &b.changes["habits"][0];
        assert_eq!(merged["history"]["2024-01-01"], true);
        assert_eq!(merged["history"]["2024-01-02"], false);
        tick().await;

        // A pulls after B's write and converges too.
        let a_again = coordinator
            .synchronize("u1", Some(a.timestamp), &HashMap::new())
            .await
            .unwrap();
        assert_eq!(a_again.changes["habits"].len(), 1);
        let merged = &a_again.changes["habits"][0];
        assert_eq!(merged["history"]["2024-01-01"], true);
        assert_eq!(merged["history"]["2024-01-02"], false);
    }

    #[tokio::test]
    async fn test_tombstone_propagates() {
        let pool = setup_test_db().await;
        let coordinator = SyncCoordinator::new(&pool);

        let create = batch("tasks", vec![json!({"id": "t1", "title": "x"})]);
        coordinator.synchronize("u1", None, &create).await.unwrap();
        tick().await;

        let b = coordinator
            .synchronize("u1", None, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(b.changes["tasks"][0]["isDeleted"], false);
        tick().await;

        let delete = batch("tasks", vec![json!({"id": "t1", "title": "x", "isDeleted": true})]);
        coordinator.synchronize("u1", None, &delete).await.unwrap();
        tick().await;

        let b_again = coordinator
            .synchronize("u1", Some(b.timestamp), &HashMap::new())
            .await
            .unwrap();
        assert_eq!(b_again.changes["tasks"].len(), 1);
        assert_eq!(b_again.changes["tasks"][0]["isDeleted"], true);
    }

    #[tokio::test]
    async fn test_singleton_batch_collapses() {
        let pool = setup_test_db().await;
        let coordinator = SyncCoordinator::new(&pool);

        let changes = batch(
            "budget",
            vec![
                json!({"id": "b1", "limit": 100, "updatedAt": "2024-01-01T00:00:00Z"}),
                json!({"id": "b2", "limit": 200, "updatedAt": "2024-06-01T00:00:00Z"}),
            ],
        );
        coordinator.synchronize("u1", None, &changes).await.unwrap();
        tick().await;

        let pull = coordinator
            .synchronize("u1", None, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(pull.changes["budget"].len(), 1);
        assert_eq!(pull.changes["budget"][0]["limit"], 200);
    }

    #[tokio::test]
    async fn test_singleton_lands_on_canonical_row() {
        let pool = setup_test_db().await;
        let coordinator = SyncCoordinator::new(&pool);

        let first = batch("budget", vec![json!({"id": "b1", "limit": 100})]);
        coordinator.synchronize("u1", None, &first).await.unwrap();
        tick().await;

        // A different device proposes the singleton under its own id; both
        // writes land on the same stored row.
        let second = batch("budget", vec![json!({"id": "b2", "limit": 250})]);
        coordinator.synchronize("u1", None, &second).await.unwrap();
        tick().await;

        let pull = coordinator
            .synchronize("u1", None, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(pull.changes["budget"].len(), 1);
        assert_eq!(pull.changes["budget"][0]["id"], SINGLETON_ID);
        assert_eq!(pull.changes["budget"][0]["limit"], 250);
    }

    #[tokio::test]
    async fn test_concurrent_first_syncs_keep_one_singleton_row() {
        let pool = setup_test_db().await;
        let coordinator_a = SyncCoordinator::new(&pool);
        let coordinator_b = SyncCoordinator::new(&pool);

        // Two devices' first syncs race; neither has seen a stored row, so
        // both propose the singleton under their own id.
        let from_a = batch("budget", vec![json!({"id": "b1", "limit": 100})]);
        let from_b = batch("budget", vec![json!({"id": "b2", "limit": 200})]);

        let (a, b) = tokio::join!(
            coordinator_a.synchronize("u1", None, &from_a),
            coordinator_b.synchronize("u1", None, &from_b),
        );
        a.unwrap();
        b.unwrap();

        let live = EntityRepository::new(&pool)
            .count_live("budget", "u1")
            .await
            .unwrap();
        assert_eq!(live, 1);
    }

    #[tokio::test]
    async fn test_boundary_record_not_resent() {
        let pool = setup_test_db().await;
        let coordinator = SyncCoordinator::new(&pool);

        let changes = batch("tasks", vec![json!({"id": "t1", "title": "x"})]);
        let outcome = coordinator.synchronize("u1", None, &changes).await.unwrap();
        tick().await;

        // The record's updatedAt equals the returned watermark exactly; a pull
        // from that watermark must not re-include it.
        let next = coordinator
            .synchronize("u1", Some(outcome.timestamp), &HashMap::new())
            .await
            .unwrap();
        assert!(next.changes["tasks"].is_empty());
    }

    #[tokio::test]
    async fn test_failed_type_reported_without_failing_exchange() {
        let pool = setup_test_db().await;
        break_type_writes(&pool, "habits").await;
        let coordinator = SyncCoordinator::new(&pool);

        let changes = HashMap::from([
            ("tasks".to_string(), vec![json!({"id": "t1", "title": "ok"})]),
            ("habits".to_string(), vec![json!({"id": "h1", "name": "run"})]),
        ]);
        let outcome = coordinator.synchronize("u1", None, &changes).await.unwrap();

        assert_eq!(outcome.failed_types, vec!["habits".to_string()]);

        // The healthy type's write landed; the broken one left no row behind.
        let repo = EntityRepository::new(&pool);
        assert!(repo.get("tasks", "u1", "t1").await.unwrap().is_some());
        assert!(repo.get("habits", "u1", "h1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_type_rejected() {
        let pool = setup_test_db().await;
        let coordinator = SyncCoordinator::new(&pool);

        let changes = batch("gadgets", vec![json!({"id": "g1"})]);
        let result = coordinator.synchronize("u1", None, &changes).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_missing_id_rejected_without_effects() {
        let pool = setup_test_db().await;
        let coordinator = SyncCoordinator::new(&pool);

        let changes = HashMap::from([
            ("tasks".to_string(), vec![json!({"id": "t1", "title": "ok"})]),
            ("habits".to_string(), vec![json!({"name": "no id"})]),
        ]);
        let result = coordinator.synchronize("u1", None, &changes).await;
        assert!(matches!(result, Err(AppError::Validation(_))));

        // Validation happens before any write; the valid batch was not applied.
        let pull = coordinator
            .synchronize("u1", None, &HashMap::new())
            .await
            .unwrap();
        assert!(pull.changes["tasks"].is_empty());
    }

    #[tokio::test]
    async fn test_owner_isolation() {
        let pool = setup_test_db().await;
        let coordinator = SyncCoordinator::new(&pool);

        let changes = batch("tasks", vec![json!({"id": "t1", "title": "mine"})]);
        coordinator.synchronize("u1", None, &changes).await.unwrap();
        tick().await;

        let other = coordinator
            .synchronize("u2", None, &HashMap::new())
            .await
            .unwrap();
        assert!(other.changes["tasks"].is_empty());
    }

    #[tokio::test]
    async fn test_reset_rewinds_and_clears() {
        let pool = setup_test_db().await;
        let coordinator = SyncCoordinator::new(&pool);

        let changes = batch("tasks", vec![json!({"id": "t1", "title": "x"})]);
        coordinator.synchronize("u1", None, &changes).await.unwrap();

        coordinator.reset_all("u1").await.unwrap();

        let status = coordinator.status("u1").await.unwrap();
        assert_eq!(status.last_sync, Some(DateTime::<Utc>::UNIX_EPOCH));
        assert_eq!(status.exchange_count, 0);
        assert_eq!(status.live_records["tasks"], 0);

        let pull = coordinator
            .synchronize("u1", None, &HashMap::new())
            .await
            .unwrap();
        assert!(pull.changes.values().all(|records| records.is_empty()));
    }

    #[tokio::test]
    async fn test_status_counts_live_records() {
        let pool = setup_test_db().await;
        let coordinator = SyncCoordinator::new(&pool);

        let changes = batch(
            "tasks",
            vec![
                json!({"id": "t1", "title": "a"}),
                json!({"id": "t2", "title": "b", "isDeleted": true}),
            ],
        );
        coordinator.synchronize("u1", None, &changes).await.unwrap();

        let status = coordinator.status("u1").await.unwrap();
        assert_eq!(status.live_records["tasks"], 1);
        assert_eq!(status.exchange_count, 1);
        assert!(status.last_sync.is_some());
    }
}
