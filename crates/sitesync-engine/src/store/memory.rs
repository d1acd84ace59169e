//! In-memory store.
//!
//! Every operation runs under one mutex, which makes create-and-bind and
//! update-and-touch atomic the same way a database transaction would.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use sitesync_connector::ids::{ExternalId, SystemId};
use sitesync_connector::types::EntityKind;

use super::{
    ChangeLog, CreateOutcome, EntityStore, RunLog, SnapshotStore, StoreError, StoreResult,
};
use crate::change::ChangeRecord;
use crate::entity::UnifiedEntity;
use crate::identity::{BindOutcome, MappingKey, SystemMapping};
use crate::ids::{RunId, UnifiedId};
use crate::run::{RunStatus, SyncRun};
use crate::snapshot::EntitySnapshot;

#[derive(Debug, Default)]
struct State {
    entities: HashMap<UnifiedId, UnifiedEntity>,
    mappings: HashMap<MappingKey, SystemMapping>,
    by_entity: HashMap<(UnifiedId, SystemId), ExternalId>,
    snapshots: HashMap<(UnifiedId, EntityKind), EntitySnapshot>,
    changes: Vec<ChangeRecord>,
    runs: HashMap<RunId, SyncRun>,
}

impl State {
    fn bind(
        &mut self,
        key: &MappingKey,
        kind: EntityKind,
        unified_id: UnifiedId,
    ) -> StoreResult<BindOutcome> {
        if let Some(existing) = self.mappings.get(key) {
            if existing.unified_id == unified_id {
                return Ok(BindOutcome::AlreadyBound);
            }
            return Err(conflict(
                key,
                unified_id,
                format!("record already bound to {}", existing.unified_id),
            ));
        }
        if let Some(other) = self.by_entity.get(&(unified_id, key.system.clone())) {
            return Err(conflict(
                key,
                unified_id,
                format!("entity already bound to record {other} of this system"),
            ));
        }

        self.mappings
            .insert(key.clone(), SystemMapping::new(key, kind, unified_id));
        self.by_entity
            .insert((unified_id, key.system.clone()), key.external.clone());
        Ok(BindOutcome::Bound)
    }

    fn correlated(&self, entity: &UnifiedEntity, system: &SystemId) -> Option<UnifiedId> {
        let wanted = entity.correlation_key()?;
        self.entities
            .values()
            .filter(|e| e.kind == entity.kind)
            .filter(|e| !self.by_entity.contains_key(&(e.id, system.clone())))
            .find(|e| e.correlation_key().as_deref() == Some(wanted.as_str()))
            .map(|e| e.id)
    }

    fn mapping_mut(&mut self, key: &MappingKey) -> StoreResult<&mut SystemMapping> {
        self.mappings
            .get_mut(key)
            .ok_or_else(|| StoreError::not_found("mapping", key))
    }
}

fn conflict(key: &MappingKey, unified_id: UnifiedId, reason: String) -> StoreError {
    StoreError::BindConflict {
        system: key.system.clone(),
        external_id: key.external.clone(),
        unified_id,
        reason,
    }
}

/// Store backed by process memory.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of unified entities.
    pub fn entity_count(&self) -> usize {
        self.lock().entities.len()
    }

    /// Number of system mappings.
    pub fn mapping_count(&self) -> usize {
        self.lock().mappings.len()
    }

    pub fn all_mappings(&self) -> Vec<SystemMapping> {
        self.lock().mappings.values().cloned().collect()
    }
}

#[async_trait]
impl EntityStore for InMemoryStore {
    async fn find_mapping(&self, key: &MappingKey) -> StoreResult<Option<SystemMapping>> {
        Ok(self.lock().mappings.get(key).cloned())
    }

    async fn bind(
        &self,
        key: &MappingKey,
        kind: EntityKind,
        unified_id: UnifiedId,
    ) -> StoreResult<BindOutcome> {
        self.lock().bind(key, kind, unified_id)
    }

    async fn load(&self, id: UnifiedId) -> StoreResult<Option<UnifiedEntity>> {
        Ok(self.lock().entities.get(&id).cloned())
    }

    async fn mappings_for(&self, id: UnifiedId) -> StoreResult<Vec<SystemMapping>> {
        let mut mappings: Vec<_> = self
            .lock()
            .mappings
            .values()
            .filter(|m| m.unified_id == id)
            .cloned()
            .collect();
        mappings.sort_by(|a, b| a.system_id.cmp(&b.system_id));
        Ok(mappings)
    }

    async fn create_bound(
        &self,
        entity: &UnifiedEntity,
        key: &MappingKey,
        synced_at: DateTime<Utc>,
    ) -> StoreResult<CreateOutcome> {
        let mut state = self.lock();

        if let Some(existing) = state.mappings.get(key) {
            return Ok(CreateOutcome::AlreadyMapped(existing.unified_id));
        }

        let outcome = match state.correlated(entity, &key.system) {
            Some(target) => {
                state.bind(key, entity.kind, target)?;
                CreateOutcome::Linked(target)
            }
            None => {
                state.bind(key, entity.kind, entity.id)?;
                state.entities.insert(entity.id, entity.clone());
                CreateOutcome::Created(entity.id)
            }
        };
        state.mapping_mut(key)?.mark_synced(synced_at);
        Ok(outcome)
    }

    async fn update_bound(
        &self,
        entity: &UnifiedEntity,
        key: &MappingKey,
        synced_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.lock();
        let mapping = state.mapping_mut(key)?;
        if mapping.unified_id != entity.id {
            let reason = format!("record is bound to {}", mapping.unified_id);
            return Err(conflict(key, entity.id, reason));
        }
        mapping.mark_synced(synced_at);
        state.entities.insert(entity.id, entity.clone());
        Ok(())
    }

    async fn touch_mapping(&self, key: &MappingKey, synced_at: DateTime<Utc>) -> StoreResult<()> {
        self.lock().mapping_mut(key)?.mark_synced(synced_at);
        Ok(())
    }

    async fn mark_mapping_failed(&self, key: &MappingKey, error: &str) -> StoreResult<()> {
        self.lock().mapping_mut(key)?.mark_failed(error);
        Ok(())
    }

    async fn mark_stale_except(
        &self,
        system: &SystemId,
        kind: EntityKind,
        seen: &HashSet<ExternalId>,
    ) -> StoreResult<u64> {
        let mut state = self.lock();
        let now = Utc::now();
        let mut marked = 0;
        for mapping in state.mappings.values_mut() {
            if &mapping.system_id == system
                && mapping.kind == kind
                && !mapping.stale
                && !seen.contains(&mapping.external_id)
            {
                mapping.stale = true;
                mapping.updated_at = now;
                marked += 1;
            }
        }
        Ok(marked)
    }
}

#[async_trait]
impl SnapshotStore for InMemoryStore {
    async fn get_snapshot(
        &self,
        entity_id: UnifiedId,
        kind: EntityKind,
    ) -> StoreResult<Option<EntitySnapshot>> {
        Ok(self.lock().snapshots.get(&(entity_id, kind)).cloned())
    }

    async fn put_snapshot(&self, snapshot: &EntitySnapshot) -> StoreResult<()> {
        self.lock()
            .snapshots
            .insert((snapshot.entity_id, snapshot.kind), snapshot.clone());
        Ok(())
    }
}

#[async_trait]
impl ChangeLog for InMemoryStore {
    async fn append_changes(&self, changes: &[ChangeRecord]) -> StoreResult<()> {
        self.lock().changes.extend_from_slice(changes);
        Ok(())
    }

    async fn changes_since(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<ChangeRecord>> {
        let state = self.lock();
        let mut changes: Vec<_> = state
            .changes
            .iter()
            .filter(|c| c.detected_at >= since)
            .cloned()
            .collect();
        changes.sort_by_key(|c| c.detected_at);
        changes.truncate(limit);
        Ok(changes)
    }
}

#[async_trait]
impl RunLog for InMemoryStore {
    async fn insert_run(&self, run: &SyncRun) -> StoreResult<()> {
        self.lock().runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn update_run(&self, run: &SyncRun) -> StoreResult<()> {
        let mut state = self.lock();
        match state.runs.get_mut(&run.id) {
            Some(existing) => {
                *existing = run.clone();
                Ok(())
            }
            None => Err(StoreError::not_found("sync run", run.id)),
        }
    }

    async fn get_run(&self, id: RunId) -> StoreResult<Option<SyncRun>> {
        Ok(self.lock().runs.get(&id).cloned())
    }

    async fn last_successful_run(
        &self,
        system: &SystemId,
        kind: EntityKind,
    ) -> StoreResult<Option<SyncRun>> {
        Ok(self
            .lock()
            .runs
            .values()
            .filter(|r| &r.system == system && r.kind == kind && r.status == RunStatus::Success)
            .max_by_key(|r| r.started_at)
            .cloned())
    }

    async fn recent_runs(&self, limit: usize) -> StoreResult<Vec<SyncRun>> {
        let mut runs: Vec<_> = self.lock().runs.values().cloned().collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn runs_for(&self, system: &SystemId, limit: usize) -> StoreResult<Vec<SyncRun>> {
        let mut runs: Vec<_> = self
            .lock()
            .runs
            .values()
            .filter(|r| &r.system == system)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityFields, ProjectFields};
    use crate::identity::MappingStatus;
    use crate::run::{JobKey, SyncMode, TriggerSource};

    fn project(code: &str) -> UnifiedEntity {
        UnifiedEntity::new(EntityFields::Project(ProjectFields {
            name: Some(format!("Project {code}")),
            code: Some(code.to_string()),
            ..Default::default()
        }))
    }

    #[tokio::test]
    async fn test_create_bound_then_already_mapped() {
        let store = InMemoryStore::new();
        let key = MappingKey::new("procore", "P-1");
        let entity = project("HB-1");

        let outcome = store.create_bound(&entity, &key, Utc::now()).await.unwrap();
        assert_eq!(outcome, CreateOutcome::Created(entity.id));

        let again = store
            .create_bound(&project("HB-1"), &key, Utc::now())
            .await
            .unwrap();
        assert_eq!(again, CreateOutcome::AlreadyMapped(entity.id));
        assert_eq!(store.entity_count(), 1);

        let mapping = store.find_mapping(&key).await.unwrap().unwrap();
        assert_eq!(mapping.status, MappingStatus::Completed);
        assert!(mapping.last_synced_at.is_some());
    }

    #[tokio::test]
    async fn test_create_bound_links_by_correlation_key() {
        let store = InMemoryStore::new();
        let first = project("HB-1");
        store
            .create_bound(&first, &MappingKey::new("procore", "P-1"), Utc::now())
            .await
            .unwrap();

        let outcome = store
            .create_bound(&project("hb-1"), &MappingKey::new("costbook", "J-77"), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, CreateOutcome::Linked(first.id));
        assert_eq!(store.entity_count(), 1);
        assert_eq!(store.mappings_for(first.id).await.unwrap().len(), 2);

        // The same system never links twice onto one entity.
        let outcome = store
            .create_bound(&project("HB-1"), &MappingKey::new("procore", "P-2"), Utc::now())
            .await
            .unwrap();
        assert!(matches!(outcome, CreateOutcome::Created(_)));
    }

    #[tokio::test]
    async fn test_update_bound_rejects_foreign_entity() {
        let store = InMemoryStore::new();
        let key = MappingKey::new("procore", "P-1");
        store
            .create_bound(&project("A"), &key, Utc::now())
            .await
            .unwrap();

        let err = store
            .update_bound(&project("B"), &key, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::BindConflict { .. }));
    }

    #[tokio::test]
    async fn test_mark_stale_except() {
        let store = InMemoryStore::new();
        for id in ["P-1", "P-2", "P-3"] {
            store
                .create_bound(&project(id), &MappingKey::new("procore", id), Utc::now())
                .await
                .unwrap();
        }

        let seen: HashSet<ExternalId> = [ExternalId::from("P-1")].into_iter().collect();
        let marked = store
            .mark_stale_except(&SystemId::from("procore"), EntityKind::Project, &seen)
            .await
            .unwrap();
        assert_eq!(marked, 2);

        // Touching a stale mapping revives it.
        let key = MappingKey::new("procore", "P-2");
        store.touch_mapping(&key, Utc::now()).await.unwrap();
        assert!(!store.find_mapping(&key).await.unwrap().unwrap().stale);
    }

    #[tokio::test]
    async fn test_last_successful_run() {
        let store = InMemoryStore::new();
        let job = JobKey::new("procore", EntityKind::Project);

        let mut ok = SyncRun::new(&job, SyncMode::Incremental, TriggerSource::Manual);
        ok.finish(RunStatus::Success);
        store.insert_run(&ok).await.unwrap();

        let mut failed = SyncRun::new(&job, SyncMode::Incremental, TriggerSource::Manual);
        failed.finish(RunStatus::Failed);
        store.insert_run(&failed).await.unwrap();

        let last = store
            .last_successful_run(&job.system, job.kind)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last.id, ok.id);
        assert_eq!(store.recent_runs(10).await.unwrap().len(), 2);
    }
}
