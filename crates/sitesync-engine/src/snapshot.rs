//! Last-known field values used as the baseline for change detection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use sitesync_connector::types::EntityKind;

use crate::entity::{FieldValue, UnifiedEntity};
use crate::ids::UnifiedId;

/// Snapshot of one entity's monitored fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub entity_id: UnifiedId,
    pub kind: EntityKind,
    pub values: BTreeMap<String, FieldValue>,
    pub taken_at: DateTime<Utc>,
}

impl EntitySnapshot {
    pub fn new(entity_id: UnifiedId, kind: EntityKind, values: BTreeMap<String, FieldValue>) -> Self {
        Self {
            entity_id,
            kind,
            values,
            taken_at: Utc::now(),
        }
    }

    /// Snapshot of an entity restricted to `monitored` fields.
    pub fn of(entity: &UnifiedEntity, monitored: &[&str]) -> Self {
        let values = entity
            .fields
            .values()
            .into_iter()
            .filter(|(name, _)| monitored.contains(&name.as_str()))
            .collect();
        Self::new(entity.id, entity.kind, values)
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.values.get(field)
    }

    /// Whether both snapshots hold the same values.
    pub fn same_values(&self, other: &EntitySnapshot) -> bool {
        self.values == other.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityFields, ProjectFields};
    use rust_decimal::Decimal;

    #[test]
    fn test_snapshot_keeps_only_monitored_fields() {
        let entity = UnifiedEntity::new(EntityFields::Project(ProjectFields {
            name: Some("Tower".to_string()),
            owner: Some("City".to_string()),
            budget: Some(Decimal::from(5)),
            ..Default::default()
        }));

        let snapshot = EntitySnapshot::of(&entity, &["name", "budget"]);
        assert_eq!(snapshot.values.len(), 2);
        assert!(snapshot.get("owner").is_none());
        assert_eq!(snapshot.kind, EntityKind::Project);
    }
}
