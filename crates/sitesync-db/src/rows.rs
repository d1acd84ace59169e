//! Row types and their conversion into engine types.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::str::FromStr;
use uuid::Uuid;

use sitesync_connector::ids::{Cursor, ExternalId, SystemId};
use sitesync_connector::types::EntityKind;
use sitesync_engine::change::ChangeRecord;
use sitesync_engine::entity::UnifiedEntity;
use sitesync_engine::identity::SystemMapping;
use sitesync_engine::run::SyncRun;
use sitesync_engine::snapshot::EntitySnapshot;

use crate::error::DbError;

fn parse<T>(table: &'static str, value: &str) -> Result<T, DbError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| DbError::invalid_row(table, e))
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, DbError> {
    Ok(serde_json::from_value(value)?)
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EntityRow {
    pub id: Uuid,
    pub kind: String,
    pub fields: Value,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EntityRow {
    pub fn into_entity(self) -> Result<UnifiedEntity, DbError> {
        let kind: EntityKind = parse("unified_entities", &self.kind)?;
        let entity = UnifiedEntity {
            id: self.id.into(),
            kind,
            fields: decode(self.fields)?,
            metadata: decode(self.metadata)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        };
        if entity.fields.kind() != kind {
            return Err(DbError::invalid_row(
                "unified_entities",
                format!("entity {} stores {} fields", entity.id, entity.fields.kind()),
            ));
        }
        Ok(entity)
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct MappingRow {
    pub unified_id: Uuid,
    pub system_id: String,
    pub external_id: String,
    pub kind: String,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub status: String,
    pub last_error: Option<String>,
    pub stale: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MappingRow {
    pub fn into_mapping(self) -> Result<SystemMapping, DbError> {
        Ok(SystemMapping {
            unified_id: self.unified_id.into(),
            system_id: SystemId::from(self.system_id),
            external_id: ExternalId::from(self.external_id),
            kind: parse("system_mappings", &self.kind)?,
            last_synced_at: self.last_synced_at,
            status: parse("system_mappings", &self.status)?,
            last_error: self.last_error,
            stale: self.stale,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SnapshotRow {
    pub unified_id: Uuid,
    pub kind: String,
    pub field_values: Value,
    pub taken_at: DateTime<Utc>,
}

impl SnapshotRow {
    pub fn into_snapshot(self) -> Result<EntitySnapshot, DbError> {
        Ok(EntitySnapshot {
            entity_id: self.unified_id.into(),
            kind: parse("entity_snapshots", &self.kind)?,
            values: decode(self.field_values)?,
            taken_at: self.taken_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ChangeRow {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub kind: String,
    pub system_id: String,
    pub run_id: Uuid,
    pub field: String,
    pub previous_value: Option<Value>,
    pub new_value: Option<Value>,
    pub change_type: String,
    pub priority: String,
    pub impact: Value,
    pub approval_required: bool,
    pub detected_at: DateTime<Utc>,
}

impl ChangeRow {
    pub fn into_change(self) -> Result<ChangeRecord, DbError> {
        Ok(ChangeRecord {
            id: self.id.into(),
            entity_id: self.entity_id.into(),
            kind: parse("change_records", &self.kind)?,
            system: SystemId::from(self.system_id),
            run_id: self.run_id.into(),
            field: self.field,
            previous: self.previous_value.map(decode).transpose()?,
            new: self.new_value.map(decode).transpose()?,
            change_type: parse("change_records", &self.change_type)?,
            priority: parse("change_records", &self.priority)?,
            impact: decode(self.impact)?,
            approval_required: self.approval_required,
            detected_at: self.detected_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct RunRow {
    pub id: Uuid,
    pub system_id: String,
    pub kind: String,
    pub mode: String,
    pub status: String,
    pub trigger_source: String,
    pub counters: Value,
    pub cursor_start: Option<String>,
    pub cursor_end: Option<String>,
    pub errors: Value,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl RunRow {
    pub fn into_run(self) -> Result<SyncRun, DbError> {
        Ok(SyncRun {
            id: self.id.into(),
            system: SystemId::from(self.system_id),
            kind: parse("sync_runs", &self.kind)?,
            mode: parse("sync_runs", &self.mode)?,
            status: parse("sync_runs", &self.status)?,
            trigger: parse("sync_runs", &self.trigger_source)?,
            counters: decode(self.counters)?,
            cursor_start: self.cursor_start.map(Cursor::new),
            cursor_end: self.cursor_end.map(Cursor::new),
            started_at: self.started_at,
            ended_at: self.ended_at,
            errors: decode(self.errors)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use serde_json::json;
    use sitesync_engine::entity::{EntityFields, FieldValue, ProjectFields};
    use sitesync_engine::identity::MappingStatus;
    use sitesync_engine::run::{JobKey, RunStatus, SyncMode, TriggerSource};

    #[test]
    fn test_entity_row_round_trips_fields() {
        let entity = UnifiedEntity::new(EntityFields::Project(ProjectFields {
            name: Some("Harbour Tower".into()),
            code: Some("HT-01".into()),
            actual_cost: Some(Decimal::new(4_250_050, 2)),
            ..Default::default()
        }));
        let row = EntityRow {
            id: entity.id.as_uuid(),
            kind: "project".into(),
            fields: serde_json::to_value(&entity.fields).unwrap(),
            metadata: json!({}),
            created_at: entity.created_at,
            updated_at: entity.updated_at,
        };

        let decoded = row.into_entity().unwrap();
        assert!(decoded.same_content(&entity));
        assert_eq!(decoded.correlation_key().as_deref(), Some("HT-01"));
        assert_eq!(
            decoded.fields.values()["actual_cost"],
            FieldValue::Decimal(Decimal::new(4_250_050, 2))
        );
    }

    #[test]
    fn test_entity_row_rejects_mismatched_kind() {
        let fields = EntityFields::Project(ProjectFields::default());
        let row = EntityRow {
            id: Uuid::new_v4(),
            kind: "rfi".into(),
            fields: serde_json::to_value(&fields).unwrap(),
            metadata: json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let err = row.into_entity().unwrap_err();
        assert!(matches!(err, DbError::InvalidRow { table: "unified_entities", .. }));
    }

    #[test]
    fn test_mapping_row_rejects_unknown_status() {
        let row = MappingRow {
            unified_id: Uuid::new_v4(),
            system_id: "procore".into(),
            external_id: "P-1".into(),
            kind: "project".into(),
            last_synced_at: None,
            status: "archived".into(),
            last_error: None,
            stale: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let err = row.into_mapping().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid row in system_mappings: unknown mapping status: 'archived'"
        );
    }

    #[test]
    fn test_mapping_row_decodes_status() {
        let row = MappingRow {
            unified_id: Uuid::new_v4(),
            system_id: "costbook".into(),
            external_id: "J-77".into(),
            kind: "project".into(),
            last_synced_at: Some(Utc::now()),
            status: "in_progress".into(),
            last_error: None,
            stale: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let mapping = row.into_mapping().unwrap();
        assert_eq!(mapping.status, MappingStatus::InProgress);
        assert_eq!(mapping.key().external.as_str(), "J-77");
        assert!(mapping.stale);
    }

    #[test]
    fn test_snapshot_row_decodes_values() {
        let mut values = std::collections::BTreeMap::new();
        values.insert("name".to_string(), FieldValue::Text("Harbour Tower".into()));
        values.insert(
            "actual_cost".to_string(),
            FieldValue::Decimal(Decimal::new(9_900, 0)),
        );
        let row = SnapshotRow {
            unified_id: Uuid::new_v4(),
            kind: "project".into(),
            field_values: serde_json::to_value(&values).unwrap(),
            taken_at: Utc::now(),
        };
        let snapshot = row.into_snapshot().unwrap();
        assert_eq!(snapshot.get("name"), values.get("name"));
        assert_eq!(snapshot.get("actual_cost"), values.get("actual_cost"));
    }

    #[test]
    fn test_run_row_decodes_cursor_and_counters() {
        let mut run = SyncRun::new(
            &JobKey::new("procore", EntityKind::Project),
            SyncMode::Incremental,
            TriggerSource::Scheduled,
        );
        run.counters.processed = 5;
        run.cursor_end = Some(Cursor::new("page-2"));
        run.finish(RunStatus::Success);

        let row = RunRow {
            id: run.id.as_uuid(),
            system_id: "procore".into(),
            kind: "project".into(),
            mode: "incremental".into(),
            status: "success".into(),
            trigger_source: "scheduled".into(),
            counters: serde_json::to_value(run.counters).unwrap(),
            cursor_start: None,
            cursor_end: Some("page-2".into()),
            errors: json!([]),
            started_at: run.started_at,
            ended_at: run.ended_at,
        };
        assert_eq!(row.into_run().unwrap(), run);
    }
}
