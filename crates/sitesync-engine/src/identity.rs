//! Identity resolution between external records and unified entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error};

use sitesync_connector::ids::{ExternalId, SystemId};
use sitesync_connector::types::{EntityKind, ParseEnumError};

use crate::ids::UnifiedId;
use crate::store::{EntityStore, StoreError, StoreResult};

/// A record address in one external system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MappingKey {
    pub system: SystemId,
    pub external: ExternalId,
}

impl MappingKey {
    pub fn new(system: impl Into<SystemId>, external: impl Into<ExternalId>) -> Self {
        Self {
            system: system.into(),
            external: external.into(),
        }
    }
}

impl fmt::Display for MappingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.system, self.external)
    }
}

/// Sync status of one mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MappingStatus {
    #[default]
    Pending,
    /// Never persisted by the bundled stores: they write the entity and its
    /// mapping in one transaction, so a mapping goes straight to `Completed`.
    /// Kept so the status column accepts rows from stores that stage writes.
    InProgress,
    Completed,
    Failed,
}

impl MappingStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingStatus::Pending => "pending",
            MappingStatus::InProgress => "in_progress",
            MappingStatus::Completed => "completed",
            MappingStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for MappingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MappingStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MappingStatus::Pending),
            "in_progress" => Ok(MappingStatus::InProgress),
            "completed" => Ok(MappingStatus::Completed),
            "failed" => Ok(MappingStatus::Failed),
            _ => Err(ParseEnumError::new("mapping status", s)),
        }
    }
}

/// Link between a unified entity and its record in one external system.
///
/// Unique per (system, external id) and per (unified id, system). Never
/// deleted; records that disappear upstream are flagged `stale`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMapping {
    pub unified_id: UnifiedId,
    pub system_id: SystemId,
    pub external_id: ExternalId,
    pub kind: EntityKind,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub status: MappingStatus,
    pub last_error: Option<String>,
    pub stale: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SystemMapping {
    pub fn new(key: &MappingKey, kind: EntityKind, unified_id: UnifiedId) -> Self {
        let now = Utc::now();
        Self {
            unified_id,
            system_id: key.system.clone(),
            external_id: key.external.clone(),
            kind,
            last_synced_at: None,
            status: MappingStatus::Pending,
            last_error: None,
            stale: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> MappingKey {
        MappingKey::new(self.system_id.clone(), self.external_id.clone())
    }

    /// Record a successful sync.
    pub fn mark_synced(&mut self, at: DateTime<Utc>) {
        self.last_synced_at = Some(at);
        self.status = MappingStatus::Completed;
        self.last_error = None;
        self.stale = false;
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = MappingStatus::Failed;
        self.last_error = Some(error.into());
        self.updated_at = Utc::now();
    }
}

/// Result of resolving an external record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Found(UnifiedId),
    NotFound,
}

impl Resolution {
    pub fn unified_id(&self) -> Option<UnifiedId> {
        match self {
            Resolution::Found(id) => Some(*id),
            Resolution::NotFound => None,
        }
    }
}

/// Result of binding an external record to a unified entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    Bound,
    /// The exact same binding already existed.
    AlreadyBound,
}

/// Resolves (system, external id) pairs to unified ids.
#[derive(Clone)]
pub struct IdentityResolver {
    store: Arc<dyn EntityStore>,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    pub async fn resolve(
        &self,
        system: &SystemId,
        external: &ExternalId,
    ) -> StoreResult<Resolution> {
        let key = MappingKey::new(system.clone(), external.clone());
        let resolution = match self.store.find_mapping(&key).await? {
            Some(mapping) => Resolution::Found(mapping.unified_id),
            None => Resolution::NotFound,
        };
        debug!(mapping = %key, ?resolution, "Resolved external record");
        Ok(resolution)
    }

    /// Bind an external record to a unified entity.
    ///
    /// Re-binding the same triple is a no-op. Any other overlap is a
    /// [`StoreError::BindConflict`].
    pub async fn bind(
        &self,
        system: &SystemId,
        external: &ExternalId,
        kind: EntityKind,
        unified_id: UnifiedId,
    ) -> StoreResult<BindOutcome> {
        let key = MappingKey::new(system.clone(), external.clone());
        match self.store.bind(&key, kind, unified_id).await {
            Err(e @ StoreError::BindConflict { .. }) => {
                error!(
                    data_integrity = true,
                    mapping = %key,
                    unified_id = %unified_id,
                    error = %e,
                    "Rejected conflicting identity binding"
                );
                Err(e)
            }
            other => other,
        }
    }
}

impl fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityResolver").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;

    fn create_resolver() -> IdentityResolver {
        IdentityResolver::new(Arc::new(InMemoryStore::new()))
    }

    #[tokio::test]
    async fn test_resolve_unknown_is_not_found() {
        let resolver = create_resolver();
        let resolution = resolver
            .resolve(&SystemId::from("procore"), &ExternalId::from("P-1"))
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::NotFound);
    }

    #[tokio::test]
    async fn test_bind_then_resolve() {
        let resolver = create_resolver();
        let system = SystemId::from("procore");
        let external = ExternalId::from("P-1");
        let id = UnifiedId::new();

        let outcome = resolver
            .bind(&system, &external, EntityKind::Project, id)
            .await
            .unwrap();
        assert_eq!(outcome, BindOutcome::Bound);
        assert_eq!(
            resolver.resolve(&system, &external).await.unwrap(),
            Resolution::Found(id)
        );
    }

    #[tokio::test]
    async fn test_rebind_same_triple_is_noop() {
        let resolver = create_resolver();
        let system = SystemId::from("procore");
        let external = ExternalId::from("P-1");
        let id = UnifiedId::new();

        resolver
            .bind(&system, &external, EntityKind::Project, id)
            .await
            .unwrap();
        let outcome = resolver
            .bind(&system, &external, EntityKind::Project, id)
            .await
            .unwrap();
        assert_eq!(outcome, BindOutcome::AlreadyBound);
    }

    #[tokio::test]
    async fn test_conflicting_bindings_rejected() {
        let resolver = create_resolver();
        let system = SystemId::from("procore");
        let id = UnifiedId::new();

        resolver
            .bind(&system, &ExternalId::from("P-1"), EntityKind::Project, id)
            .await
            .unwrap();

        // Same external record, different entity.
        let err = resolver
            .bind(&system, &ExternalId::from("P-1"), EntityKind::Project, UnifiedId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::BindConflict { .. }));

        // Second record of the same system for one entity.
        let err = resolver
            .bind(&system, &ExternalId::from("P-2"), EntityKind::Project, id)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::BindConflict { .. }));

        // A different system may bind the same entity.
        let outcome = resolver
            .bind(
                &SystemId::from("costbook"),
                &ExternalId::from("J-9"),
                EntityKind::Project,
                id,
            )
            .await
            .unwrap();
        assert_eq!(outcome, BindOutcome::Bound);
    }
}
