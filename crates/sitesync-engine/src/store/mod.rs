//! Storage seams for the sync engine.
//!
//! Four narrow traits cover the unified store, snapshots, the change log and
//! the run log. [`memory::InMemoryStore`] implements all of them for tests and
//! single-process use; the Postgres implementation lives in `sitesync-db`.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

use sitesync_connector::ids::{ExternalId, SystemId};
use sitesync_connector::types::EntityKind;

use crate::change::ChangeRecord;
use crate::entity::UnifiedEntity;
use crate::identity::{BindOutcome, MappingKey, SystemMapping};
use crate::ids::{RunId, UnifiedId};
use crate::run::SyncRun;
use crate::snapshot::EntitySnapshot;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A binding would break mapping uniqueness.
    #[error("mapping conflict for {system}:{external_id} -> {unified_id}: {reason}")]
    BindConflict {
        system: SystemId,
        external_id: ExternalId,
        unified_id: UnifiedId,
        reason: String,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The backend itself failed (connection, query, serialization).
    #[error("store backend error: {message}")]
    Backend {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        StoreError::Backend {
            message: message.into(),
            source: None,
        }
    }

    pub fn backend_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        StoreError::Backend {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether this reflects backend health rather than data.
    pub fn is_backend(&self) -> bool {
        matches!(self, StoreError::Backend { .. })
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            StoreError::BindConflict { .. } => "BIND_CONFLICT",
            StoreError::NotFound { .. } => "NOT_FOUND",
            StoreError::Backend { .. } => "STORE_BACKEND",
        }
    }
}

/// Outcome of an atomic create-and-bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// A new entity was inserted and bound.
    Created(UnifiedId),
    /// An existing entity with the same correlation key was bound instead.
    Linked(UnifiedId),
    /// Another writer bound this external record first.
    AlreadyMapped(UnifiedId),
}

impl CreateOutcome {
    pub fn unified_id(&self) -> UnifiedId {
        match self {
            CreateOutcome::Created(id)
            | CreateOutcome::Linked(id)
            | CreateOutcome::AlreadyMapped(id) => *id,
        }
    }
}

/// Unified entities and their system mappings.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn find_mapping(&self, key: &MappingKey) -> StoreResult<Option<SystemMapping>>;

    /// Bind an external record to an existing entity.
    async fn bind(
        &self,
        key: &MappingKey,
        kind: EntityKind,
        unified_id: UnifiedId,
    ) -> StoreResult<BindOutcome>;

    async fn load(&self, id: UnifiedId) -> StoreResult<Option<UnifiedEntity>>;

    async fn mappings_for(&self, id: UnifiedId) -> StoreResult<Vec<SystemMapping>>;

    /// Insert `entity` and bind `key` to it in one atomic step.
    ///
    /// When the entity has a correlation key matching an entity of the same
    /// kind that `key.system` has not mapped yet, binds to that entity instead.
    async fn create_bound(
        &self,
        entity: &UnifiedEntity,
        key: &MappingKey,
        synced_at: DateTime<Utc>,
    ) -> StoreResult<CreateOutcome>;

    /// Write `entity` and mark `key` synced in one atomic step.
    async fn update_bound(
        &self,
        entity: &UnifiedEntity,
        key: &MappingKey,
        synced_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Mark `key` synced without touching the entity.
    async fn touch_mapping(&self, key: &MappingKey, synced_at: DateTime<Utc>) -> StoreResult<()>;

    async fn mark_mapping_failed(&self, key: &MappingKey, error: &str) -> StoreResult<()>;

    /// Flag every mapping of (system, kind) not in `seen` as stale.
    async fn mark_stale_except(
        &self,
        system: &SystemId,
        kind: EntityKind,
        seen: &HashSet<ExternalId>,
    ) -> StoreResult<u64>;
}

/// Last-known field values per entity.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn get_snapshot(
        &self,
        entity_id: UnifiedId,
        kind: EntityKind,
    ) -> StoreResult<Option<EntitySnapshot>>;

    /// Replace the snapshot for (entity, kind).
    async fn put_snapshot(&self, snapshot: &EntitySnapshot) -> StoreResult<()>;
}

/// Append-only change log.
#[async_trait]
pub trait ChangeLog: Send + Sync {
    async fn append_changes(&self, changes: &[ChangeRecord]) -> StoreResult<()>;

    /// Changes detected at or after `since`, oldest first.
    async fn changes_since(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<ChangeRecord>>;
}

/// Sync run history.
#[async_trait]
pub trait RunLog: Send + Sync {
    async fn insert_run(&self, run: &SyncRun) -> StoreResult<()>;

    async fn update_run(&self, run: &SyncRun) -> StoreResult<()>;

    async fn get_run(&self, id: RunId) -> StoreResult<Option<SyncRun>>;

    /// Most recent run of (system, kind) that ended `success`.
    async fn last_successful_run(
        &self,
        system: &SystemId,
        kind: EntityKind,
    ) -> StoreResult<Option<SyncRun>>;

    /// Most recent runs across all jobs, newest first.
    async fn recent_runs(&self, limit: usize) -> StoreResult<Vec<SyncRun>>;

    /// Most recent runs of one system, newest first.
    async fn runs_for(&self, system: &SystemId, limit: usize) -> StoreResult<Vec<SyncRun>>;
}

/// The store handles a service works with.
#[derive(Clone)]
pub struct Stores {
    pub entities: Arc<dyn EntityStore>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub changes: Arc<dyn ChangeLog>,
    pub runs: Arc<dyn RunLog>,
}

impl Stores {
    /// Use one backend for every concern.
    pub fn from_backend<S>(backend: Arc<S>) -> Self
    where
        S: EntityStore + SnapshotStore + ChangeLog + RunLog + 'static,
    {
        Self {
            entities: backend.clone(),
            snapshots: backend.clone(),
            changes: backend.clone(),
            runs: backend,
        }
    }

    pub fn in_memory() -> Self {
        Self::from_backend(Arc::new(memory::InMemoryStore::new()))
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}
