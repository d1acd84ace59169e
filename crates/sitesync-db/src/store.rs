//! Postgres implementation of the engine's store traits.
//!
//! Create-and-bind and update-and-touch each run in one transaction. Entity
//! creation for a correlation key is serialized with a transaction-scoped
//! advisory lock so two systems reporting the same project converge.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::PgConnection;
use std::collections::HashSet;
use uuid::Uuid;

use sitesync_connector::ids::{ExternalId, SystemId};
use sitesync_connector::types::EntityKind;
use sitesync_engine::change::ChangeRecord;
use sitesync_engine::entity::UnifiedEntity;
use sitesync_engine::identity::{BindOutcome, MappingKey, MappingStatus, SystemMapping};
use sitesync_engine::ids::{RunId, UnifiedId};
use sitesync_engine::run::{RunStatus, SyncRun};
use sitesync_engine::snapshot::EntitySnapshot;
use sitesync_engine::store::{
    ChangeLog, CreateOutcome, EntityStore, RunLog, SnapshotStore, StoreResult,
};

use crate::error::DbError;
use crate::pool::DbPool;
use crate::rows::{ChangeRow, EntityRow, MappingRow, RunRow, SnapshotRow};

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<Value, DbError> {
    Ok(serde_json::to_value(value)?)
}

fn conflict(key: &MappingKey, unified_id: UnifiedId, reason: impl Into<String>) -> DbError {
    DbError::BindConflict {
        system: key.system.clone(),
        external_id: key.external.clone(),
        unified_id,
        reason: reason.into(),
    }
}

fn limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Store backed by PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn begin(&self) -> Result<sqlx::Transaction<'static, sqlx::Postgres>, DbError> {
        self.pool.inner().begin().await.map_err(DbError::QueryFailed)
    }

    async fn mapped_entity(
        conn: &mut PgConnection,
        key: &MappingKey,
    ) -> Result<Option<UnifiedId>, DbError> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r"
            SELECT unified_id FROM system_mappings
            WHERE system_id = $1 AND external_id = $2
            FOR UPDATE
            ",
        )
        .bind(key.system.as_str())
        .bind(key.external.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(DbError::QueryFailed)?;

        Ok(row.map(|(id,)| id.into()))
    }

    /// Insert a mapping unless one already exists for the key or for the
    /// (entity, system) pair. Returns whether a row was written.
    async fn insert_mapping(
        conn: &mut PgConnection,
        key: &MappingKey,
        kind: EntityKind,
        unified_id: UnifiedId,
        synced_at: Option<DateTime<Utc>>,
    ) -> Result<bool, DbError> {
        let status = if synced_at.is_some() {
            MappingStatus::Completed
        } else {
            MappingStatus::Pending
        };

        let result = sqlx::query(
            r"
            INSERT INTO system_mappings
                (unified_id, system_id, external_id, kind, last_synced_at, status)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT DO NOTHING
            ",
        )
        .bind(unified_id.as_uuid())
        .bind(key.system.as_str())
        .bind(key.external.as_str())
        .bind(kind.as_str())
        .bind(synced_at)
        .bind(status.as_str())
        .execute(&mut *conn)
        .await
        .map_err(DbError::QueryFailed)?;

        Ok(result.rows_affected() == 1)
    }

    async fn bind_in(
        conn: &mut PgConnection,
        key: &MappingKey,
        kind: EntityKind,
        unified_id: UnifiedId,
    ) -> Result<BindOutcome, DbError> {
        if let Some(existing) = Self::mapped_entity(conn, key).await? {
            if existing == unified_id {
                return Ok(BindOutcome::AlreadyBound);
            }
            return Err(conflict(
                key,
                unified_id,
                format!("record already bound to {existing}"),
            ));
        }

        let other: Option<(String,)> = sqlx::query_as(
            r"
            SELECT external_id FROM system_mappings
            WHERE unified_id = $1 AND system_id = $2
            ",
        )
        .bind(unified_id.as_uuid())
        .bind(key.system.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(DbError::QueryFailed)?;

        if let Some((other,)) = other {
            return Err(conflict(
                key,
                unified_id,
                format!("entity already bound to record {other} of this system"),
            ));
        }

        if Self::insert_mapping(conn, key, kind, unified_id, None).await? {
            Ok(BindOutcome::Bound)
        } else {
            Err(conflict(key, unified_id, "concurrent binding for this record"))
        }
    }

    async fn correlated(
        conn: &mut PgConnection,
        entity: &UnifiedEntity,
        correlation_key: &str,
        system: &SystemId,
    ) -> Result<Option<UnifiedId>, DbError> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r"
            SELECT e.id FROM unified_entities e
            WHERE e.kind = $1 AND e.correlation_key = $2
              AND NOT EXISTS (
                  SELECT 1 FROM system_mappings m
                  WHERE m.unified_id = e.id AND m.system_id = $3
              )
            ORDER BY e.created_at
            LIMIT 1
            ",
        )
        .bind(entity.kind.as_str())
        .bind(correlation_key)
        .bind(system.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(DbError::QueryFailed)?;

        Ok(row.map(|(id,)| id.into()))
    }

    async fn insert_entity(conn: &mut PgConnection, entity: &UnifiedEntity) -> Result<(), DbError> {
        sqlx::query(
            r"
            INSERT INTO unified_entities
                (id, kind, fields, metadata, correlation_key, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ",
        )
        .bind(entity.id.as_uuid())
        .bind(entity.kind.as_str())
        .bind(to_json(&entity.fields)?)
        .bind(to_json(&entity.metadata)?)
        .bind(entity.correlation_key())
        .bind(entity.created_at)
        .bind(entity.updated_at)
        .execute(&mut *conn)
        .await
        .map_err(DbError::QueryFailed)?;
        Ok(())
    }

    async fn mark_synced(
        conn: &mut PgConnection,
        key: &MappingKey,
        synced_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let result = sqlx::query(
            r"
            UPDATE system_mappings
            SET last_synced_at = $3, status = $4, last_error = NULL,
                stale = FALSE, updated_at = NOW()
            WHERE system_id = $1 AND external_id = $2
            ",
        )
        .bind(key.system.as_str())
        .bind(key.external.as_str())
        .bind(synced_at)
        .bind(MappingStatus::Completed.as_str())
        .execute(&mut *conn)
        .await
        .map_err(DbError::QueryFailed)?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("mapping {key}")));
        }
        Ok(())
    }

    async fn create_bound_tx(
        &self,
        entity: &UnifiedEntity,
        key: &MappingKey,
        synced_at: DateTime<Utc>,
    ) -> Result<CreateOutcome, DbError> {
        let mut tx = self.begin().await?;
        let correlation_key = entity.correlation_key();

        if let Some(ck) = &correlation_key {
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(format!("{}:{}", entity.kind.as_str(), ck))
                .execute(&mut *tx)
                .await
                .map_err(DbError::QueryFailed)?;
        }

        if let Some(existing) = Self::mapped_entity(&mut tx, key).await? {
            return Ok(CreateOutcome::AlreadyMapped(existing));
        }

        let linked = match &correlation_key {
            Some(ck) => Self::correlated(&mut tx, entity, ck, &key.system).await?,
            None => None,
        };

        let outcome = match linked {
            Some(target) => CreateOutcome::Linked(target),
            None => {
                Self::insert_entity(&mut tx, entity).await?;
                CreateOutcome::Created(entity.id)
            }
        };

        let written = Self::insert_mapping(
            &mut tx,
            key,
            entity.kind,
            outcome.unified_id(),
            Some(synced_at),
        )
        .await?;

        if !written {
            tx.rollback().await.map_err(DbError::QueryFailed)?;
            let mut conn = self
                .pool
                .inner()
                .acquire()
                .await
                .map_err(DbError::ConnectionFailed)?;
            return match Self::mapped_entity(&mut conn, key).await? {
                Some(winner) => Ok(CreateOutcome::AlreadyMapped(winner)),
                None => Err(conflict(
                    key,
                    outcome.unified_id(),
                    "entity already bound to another record of this system",
                )),
            };
        }

        tx.commit().await.map_err(DbError::QueryFailed)?;
        tracing::debug!(
            system = %key.system,
            external_id = %key.external,
            outcome = ?outcome,
            "Created binding"
        );
        Ok(outcome)
    }

    async fn update_bound_tx(
        &self,
        entity: &UnifiedEntity,
        key: &MappingKey,
        synced_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let mut tx = self.begin().await?;

        match Self::mapped_entity(&mut tx, key).await? {
            None => return Err(DbError::NotFound(format!("mapping {key}"))),
            Some(bound) if bound != entity.id => {
                return Err(conflict(
                    key,
                    entity.id,
                    format!("record is bound to {bound}"),
                ));
            }
            Some(_) => {}
        }

        let result = sqlx::query(
            r"
            UPDATE unified_entities
            SET fields = $2, metadata = $3, correlation_key = $4, updated_at = $5
            WHERE id = $1
            ",
        )
        .bind(entity.id.as_uuid())
        .bind(to_json(&entity.fields)?)
        .bind(to_json(&entity.metadata)?)
        .bind(entity.correlation_key())
        .bind(entity.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(DbError::QueryFailed)?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("entity {}", entity.id)));
        }

        Self::mark_synced(&mut tx, key, synced_at).await?;
        tx.commit().await.map_err(DbError::QueryFailed)?;
        Ok(())
    }
}

#[async_trait]
impl EntityStore for PgStore {
    async fn find_mapping(&self, key: &MappingKey) -> StoreResult<Option<SystemMapping>> {
        let row: Option<MappingRow> = sqlx::query_as(
            r"
            SELECT unified_id, system_id, external_id, kind, last_synced_at,
                   status, last_error, stale, created_at, updated_at
            FROM system_mappings
            WHERE system_id = $1 AND external_id = $2
            ",
        )
        .bind(key.system.as_str())
        .bind(key.external.as_str())
        .fetch_optional(self.pool.inner())
        .await
        .map_err(DbError::QueryFailed)?;

        Ok(row.map(MappingRow::into_mapping).transpose()?)
    }

    async fn bind(
        &self,
        key: &MappingKey,
        kind: EntityKind,
        unified_id: UnifiedId,
    ) -> StoreResult<BindOutcome> {
        let mut tx = self.begin().await?;
        let outcome = Self::bind_in(&mut tx, key, kind, unified_id).await?;
        tx.commit().await.map_err(DbError::QueryFailed)?;
        Ok(outcome)
    }

    async fn load(&self, id: UnifiedId) -> StoreResult<Option<UnifiedEntity>> {
        let row: Option<EntityRow> = sqlx::query_as(
            r"
            SELECT id, kind, fields, metadata, created_at, updated_at
            FROM unified_entities
            WHERE id = $1
            ",
        )
        .bind(id.as_uuid())
        .fetch_optional(self.pool.inner())
        .await
        .map_err(DbError::QueryFailed)?;

        Ok(row.map(EntityRow::into_entity).transpose()?)
    }

    async fn mappings_for(&self, id: UnifiedId) -> StoreResult<Vec<SystemMapping>> {
        let rows: Vec<MappingRow> = sqlx::query_as(
            r"
            SELECT unified_id, system_id, external_id, kind, last_synced_at,
                   status, last_error, stale, created_at, updated_at
            FROM system_mappings
            WHERE unified_id = $1
            ORDER BY system_id
            ",
        )
        .bind(id.as_uuid())
        .fetch_all(self.pool.inner())
        .await
        .map_err(DbError::QueryFailed)?;

        Ok(rows
            .into_iter()
            .map(MappingRow::into_mapping)
            .collect::<Result<_, _>>()?)
    }

    async fn create_bound(
        &self,
        entity: &UnifiedEntity,
        key: &MappingKey,
        synced_at: DateTime<Utc>,
    ) -> StoreResult<CreateOutcome> {
        Ok(self.create_bound_tx(entity, key, synced_at).await?)
    }

    async fn update_bound(
        &self,
        entity: &UnifiedEntity,
        key: &MappingKey,
        synced_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        Ok(self.update_bound_tx(entity, key, synced_at).await?)
    }

    async fn touch_mapping(&self, key: &MappingKey, synced_at: DateTime<Utc>) -> StoreResult<()> {
        let mut conn = self
            .pool
            .inner()
            .acquire()
            .await
            .map_err(DbError::ConnectionFailed)?;
        Ok(Self::mark_synced(&mut conn, key, synced_at).await?)
    }

    async fn mark_mapping_failed(&self, key: &MappingKey, error: &str) -> StoreResult<()> {
        let result = sqlx::query(
            r"
            UPDATE system_mappings
            SET status = $3, last_error = $4, updated_at = NOW()
            WHERE system_id = $1 AND external_id = $2
            ",
        )
        .bind(key.system.as_str())
        .bind(key.external.as_str())
        .bind(MappingStatus::Failed.as_str())
        .bind(error)
        .execute(self.pool.inner())
        .await
        .map_err(DbError::QueryFailed)?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("mapping {key}")).into());
        }
        Ok(())
    }

    async fn mark_stale_except(
        &self,
        system: &SystemId,
        kind: EntityKind,
        seen: &HashSet<ExternalId>,
    ) -> StoreResult<u64> {
        let seen: Vec<String> = seen.iter().map(|id| id.as_str().to_string()).collect();

        let result = sqlx::query(
            r"
            UPDATE system_mappings
            SET stale = TRUE, updated_at = NOW()
            WHERE system_id = $1 AND kind = $2 AND NOT stale
              AND NOT (external_id = ANY($3))
            ",
        )
        .bind(system.as_str())
        .bind(kind.as_str())
        .bind(seen)
        .execute(self.pool.inner())
        .await
        .map_err(DbError::QueryFailed)?;

        let marked = result.rows_affected();
        if marked > 0 {
            tracing::info!(system = %system, kind = %kind, marked, "Marked mappings stale");
        }
        Ok(marked)
    }
}

#[async_trait]
impl SnapshotStore for PgStore {
    async fn get_snapshot(
        &self,
        entity_id: UnifiedId,
        kind: EntityKind,
    ) -> StoreResult<Option<EntitySnapshot>> {
        let row: Option<SnapshotRow> = sqlx::query_as(
            r"
            SELECT unified_id, kind, field_values, taken_at
            FROM entity_snapshots
            WHERE unified_id = $1 AND kind = $2
            ",
        )
        .bind(entity_id.as_uuid())
        .bind(kind.as_str())
        .fetch_optional(self.pool.inner())
        .await
        .map_err(DbError::QueryFailed)?;

        Ok(row.map(SnapshotRow::into_snapshot).transpose()?)
    }

    async fn put_snapshot(&self, snapshot: &EntitySnapshot) -> StoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO entity_snapshots (unified_id, kind, field_values, taken_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (unified_id, kind) DO UPDATE SET
                field_values = EXCLUDED.field_values,
                taken_at = EXCLUDED.taken_at
            ",
        )
        .bind(snapshot.entity_id.as_uuid())
        .bind(snapshot.kind.as_str())
        .bind(to_json(&snapshot.values)?)
        .bind(snapshot.taken_at)
        .execute(self.pool.inner())
        .await
        .map_err(DbError::QueryFailed)?;
        Ok(())
    }
}

#[async_trait]
impl ChangeLog for PgStore {
    async fn append_changes(&self, changes: &[ChangeRecord]) -> StoreResult<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut tx = self.begin().await?;
        for change in changes {
            sqlx::query(
                r"
                INSERT INTO change_records
                    (id, entity_id, kind, system_id, run_id, field, previous_value,
                     new_value, change_type, priority, impact, approval_required, detected_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ON CONFLICT (id) DO NOTHING
                ",
            )
            .bind(change.id.as_uuid())
            .bind(change.entity_id.as_uuid())
            .bind(change.kind.as_str())
            .bind(change.system.as_str())
            .bind(change.run_id.as_uuid())
            .bind(&change.field)
            .bind(change.previous.as_ref().map(to_json).transpose()?)
            .bind(change.new.as_ref().map(to_json).transpose()?)
            .bind(change.change_type.as_str())
            .bind(change.priority.as_str())
            .bind(to_json(&change.impact)?)
            .bind(change.approval_required)
            .bind(change.detected_at)
            .execute(&mut *tx)
            .await
            .map_err(DbError::QueryFailed)?;
        }
        tx.commit().await.map_err(DbError::QueryFailed)?;
        Ok(())
    }

    async fn changes_since(
        &self,
        since: DateTime<Utc>,
        max: usize,
    ) -> StoreResult<Vec<ChangeRecord>> {
        let rows: Vec<ChangeRow> = sqlx::query_as(
            r"
            SELECT id, entity_id, kind, system_id, run_id, field, previous_value,
                   new_value, change_type, priority, impact, approval_required, detected_at
            FROM change_records
            WHERE detected_at >= $1
            ORDER BY detected_at, id
            LIMIT $2
            ",
        )
        .bind(since)
        .bind(limit(max))
        .fetch_all(self.pool.inner())
        .await
        .map_err(DbError::QueryFailed)?;

        Ok(rows
            .into_iter()
            .map(ChangeRow::into_change)
            .collect::<Result<_, _>>()?)
    }
}

impl PgStore {
    /// Runs matching the optional filters, newest first.
    async fn fetch_runs(
        &self,
        system: Option<&SystemId>,
        kind: Option<EntityKind>,
        status: Option<RunStatus>,
        max: usize,
    ) -> Result<Vec<SyncRun>, DbError> {
        let rows: Vec<RunRow> = sqlx::query_as(
            r"
            SELECT id, system_id, kind, mode, status, trigger_source, counters,
                   cursor_start, cursor_end, errors, started_at, ended_at
            FROM sync_runs
            WHERE ($1::text IS NULL OR system_id = $1)
              AND ($2::text IS NULL OR kind = $2)
              AND ($3::text IS NULL OR status = $3)
            ORDER BY started_at DESC
            LIMIT $4
            ",
        )
            .bind(system.map(SystemId::as_str))
            .bind(kind.map(|k| k.as_str()))
            .bind(status.map(|s| s.as_str()))
            .bind(limit(max))
            .fetch_all(self.pool.inner())
            .await
            .map_err(DbError::QueryFailed)?;

        rows.into_iter().map(RunRow::into_run).collect()
    }
}

#[async_trait]
impl RunLog for PgStore {
    async fn insert_run(&self, run: &SyncRun) -> StoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO sync_runs
                (id, system_id, kind, mode, status, trigger_source, counters,
                 cursor_start, cursor_end, errors, started_at, ended_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ",
        )
        .bind(run.id.as_uuid())
        .bind(run.system.as_str())
        .bind(run.kind.as_str())
        .bind(run.mode.as_str())
        .bind(run.status.as_str())
        .bind(run.trigger.as_str())
        .bind(to_json(&run.counters)?)
        .bind(run.cursor_start.as_ref().map(|c| c.as_str()))
        .bind(run.cursor_end.as_ref().map(|c| c.as_str()))
        .bind(to_json(&run.errors)?)
        .bind(run.started_at)
        .bind(run.ended_at)
        .execute(self.pool.inner())
        .await
        .map_err(DbError::QueryFailed)?;
        Ok(())
    }

    async fn update_run(&self, run: &SyncRun) -> StoreResult<()> {
        let result = sqlx::query(
            r"
            UPDATE sync_runs
            SET status = $2, counters = $3, cursor_start = $4, cursor_end = $5,
                errors = $6, ended_at = $7
            WHERE id = $1
            ",
        )
        .bind(run.id.as_uuid())
        .bind(run.status.as_str())
        .bind(to_json(&run.counters)?)
        .bind(run.cursor_start.as_ref().map(|c| c.as_str()))
        .bind(run.cursor_end.as_ref().map(|c| c.as_str()))
        .bind(to_json(&run.errors)?)
        .bind(run.ended_at)
        .execute(self.pool.inner())
        .await
        .map_err(DbError::QueryFailed)?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("sync run {}", run.id)).into());
        }
        Ok(())
    }

    async fn get_run(&self, id: RunId) -> StoreResult<Option<SyncRun>> {
        let row: Option<RunRow> = sqlx::query_as(
            r"
            SELECT id, system_id, kind, mode, status, trigger_source, counters,
                   cursor_start, cursor_end, errors, started_at, ended_at
            FROM sync_runs
            WHERE id = $1
            ",
        )
        .bind(id.as_uuid())
        .fetch_optional(self.pool.inner())
        .await
        .map_err(DbError::QueryFailed)?;

        Ok(row.map(RunRow::into_run).transpose()?)
    }

    async fn last_successful_run(
        &self,
        system: &SystemId,
        kind: EntityKind,
    ) -> StoreResult<Option<SyncRun>> {
        let mut runs = self
            .fetch_runs(Some(system), Some(kind), Some(RunStatus::Success), 1)
            .await?;
        Ok(runs.pop())
    }

    async fn recent_runs(&self, max: usize) -> StoreResult<Vec<SyncRun>> {
        Ok(self.fetch_runs(None, None, None, max).await?)
    }

    async fn runs_for(&self, system: &SystemId, max: usize) -> StoreResult<Vec<SyncRun>> {
        Ok(self.fetch_runs(Some(system), None, None, max).await?)
    }
}
