//! Unified entity model.
//!
//! Every kind has a strongly typed field struct. Field access by name goes
//! through an explicit per-kind table generated by `entity_fields!`, so the
//! mapper and the change detector never reflect over structs.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use sitesync_connector::ids::SystemId;
use sitesync_connector::mapping::FieldType;
use sitesync_connector::types::EntityKind;

use crate::ids::UnifiedId;

/// A typed field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Decimal(Decimal),
    Integer(i64),
    Date(NaiveDate),
    Boolean(bool),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Text(_) => FieldType::Text,
            FieldValue::Decimal(_) => FieldType::Decimal,
            FieldValue::Integer(_) => FieldType::Integer,
            FieldValue::Date(_) => FieldType::Date,
            FieldValue::Boolean(_) => FieldType::Boolean,
        }
    }

    /// Numeric view for decimals and integers.
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            FieldValue::Decimal(d) => Some(*d),
            FieldValue::Integer(i) => Some(Decimal::from(*i)),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            FieldValue::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Decimal(d) => write!(f, "{}", d.normalize()),
            FieldValue::Integer(i) => write!(f, "{i}"),
            FieldValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            FieldValue::Boolean(b) => write!(f, "{b}"),
        }
    }
}

/// Error setting a field by name.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FieldError {
    #[error("{kind} has no field '{field}'")]
    UnknownField { kind: EntityKind, field: String },

    #[error("field '{field}' expects {expected:?}, got {found:?}")]
    TypeMismatch {
        field: String,
        expected: FieldType,
        found: FieldType,
    },
}

macro_rules! entity_fields {
    (
        $(#[$meta:meta])*
        $name:ident ($kind:ident) {
            $($field:ident: $ty:ty => $variant:ident),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        pub struct $name {
            $(
                #[serde(default, skip_serializing_if = "Option::is_none")]
                pub $field: Option<$ty>,
            )*
        }

        impl $name {
            /// Field names and their types.
            pub const FIELDS: &'static [(&'static str, FieldType)] =
                &[$((stringify!($field), FieldType::$variant)),*];

            /// Set a field by name.
            pub fn set(&mut self, field: &str, value: FieldValue) -> Result<(), FieldError> {
                match field {
                    $(
                        stringify!($field) => match value {
                            FieldValue::$variant(v) => {
                                self.$field = Some(v);
                                Ok(())
                            }
                            other => Err(FieldError::TypeMismatch {
                                field: field.to_string(),
                                expected: FieldType::$variant,
                                found: other.field_type(),
                            }),
                        },
                    )*
                    _ => Err(FieldError::UnknownField {
                        kind: EntityKind::$kind,
                        field: field.to_string(),
                    }),
                }
            }

            /// Clear a field by name.
            pub fn clear(&mut self, field: &str) -> Result<(), FieldError> {
                match field {
                    $(
                        stringify!($field) => {
                            self.$field = None;
                            Ok(())
                        }
                    )*
                    _ => Err(FieldError::UnknownField {
                        kind: EntityKind::$kind,
                        field: field.to_string(),
                    }),
                }
            }

            /// All populated fields, by name.
            pub fn values(&self) -> BTreeMap<String, FieldValue> {
                let mut values = BTreeMap::new();
                $(
                    if let Some(v) = &self.$field {
                        values.insert(stringify!($field).to_string(), FieldValue::$variant(v.clone()));
                    }
                )*
                values
            }
        }
    };
}

entity_fields!(
    /// Construction project.
    ProjectFields (Project) {
        name: String => Text,
        code: String => Text,
        status: String => Text,
        budget: Decimal => Decimal,
        actual_cost: Decimal => Decimal,
        currency: String => Text,
        start_date: NaiveDate => Date,
        end_date: NaiveDate => Date,
        location: String => Text,
        owner: String => Text,
    }
);

entity_fields!(
    /// Drawing, specification or other controlled document.
    DocumentFields (Document) {
        title: String => Text,
        document_number: String => Text,
        document_type: String => Text,
        revision: String => Text,
        status: String => Text,
        project_ref: String => Text,
        issued_on: NaiveDate => Date,
    }
);

entity_fields!(
    /// Schedule activity or milestone.
    ScheduleFields (Schedule) {
        name: String => Text,
        project_ref: String => Text,
        start_date: NaiveDate => Date,
        end_date: NaiveDate => Date,
        percent_complete: Decimal => Decimal,
        status: String => Text,
        critical_path: bool => Boolean,
    }
);

entity_fields!(
    /// Cost, commitment or invoice line.
    FinancialRecordFields (FinancialRecord) {
        description: String => Text,
        project_ref: String => Text,
        category: String => Text,
        cost_code: String => Text,
        amount: Decimal => Decimal,
        currency: String => Text,
        status: String => Text,
        posted_on: NaiveDate => Date,
    }
);

entity_fields!(
    /// Change order against a contract.
    ChangeOrderFields (ChangeOrder) {
        number: String => Text,
        title: String => Text,
        project_ref: String => Text,
        amount: Decimal => Decimal,
        status: String => Text,
        schedule_impact_days: i64 => Integer,
        submitted_on: NaiveDate => Date,
        approved_on: NaiveDate => Date,
    }
);

entity_fields!(
    /// Request for information.
    RfiFields (Rfi) {
        number: String => Text,
        subject: String => Text,
        project_ref: String => Text,
        status: String => Text,
        priority: String => Text,
        assignee: String => Text,
        due_date: NaiveDate => Date,
        answered_on: NaiveDate => Date,
    }
);

/// Kind-specific fields of a unified entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "fields", rename_all = "snake_case")]
pub enum EntityFields {
    Project(ProjectFields),
    Document(DocumentFields),
    Schedule(ScheduleFields),
    FinancialRecord(FinancialRecordFields),
    ChangeOrder(ChangeOrderFields),
    Rfi(RfiFields),
}

impl EntityFields {
    /// Empty field set for a kind.
    pub fn empty(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Project => EntityFields::Project(ProjectFields::default()),
            EntityKind::Document => EntityFields::Document(DocumentFields::default()),
            EntityKind::Schedule => EntityFields::Schedule(ScheduleFields::default()),
            EntityKind::FinancialRecord => {
                EntityFields::FinancialRecord(FinancialRecordFields::default())
            }
            EntityKind::ChangeOrder => EntityFields::ChangeOrder(ChangeOrderFields::default()),
            EntityKind::Rfi => EntityFields::Rfi(RfiFields::default()),
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            EntityFields::Project(_) => EntityKind::Project,
            EntityFields::Document(_) => EntityKind::Document,
            EntityFields::Schedule(_) => EntityKind::Schedule,
            EntityFields::FinancialRecord(_) => EntityKind::FinancialRecord,
            EntityFields::ChangeOrder(_) => EntityKind::ChangeOrder,
            EntityFields::Rfi(_) => EntityKind::Rfi,
        }
    }

    /// Declared fields of a kind.
    pub fn schema(kind: EntityKind) -> &'static [(&'static str, FieldType)] {
        match kind {
            EntityKind::Project => ProjectFields::FIELDS,
            EntityKind::Document => DocumentFields::FIELDS,
            EntityKind::Schedule => ScheduleFields::FIELDS,
            EntityKind::FinancialRecord => FinancialRecordFields::FIELDS,
            EntityKind::ChangeOrder => ChangeOrderFields::FIELDS,
            EntityKind::Rfi => RfiFields::FIELDS,
        }
    }

    /// Declared type of a field, if the kind has it.
    pub fn field_type(kind: EntityKind, field: &str) -> Option<FieldType> {
        Self::schema(kind)
            .iter()
            .find(|(name, _)| *name == field)
            .map(|(_, ty)| *ty)
    }

    pub fn set(&mut self, field: &str, value: FieldValue) -> Result<(), FieldError> {
        match self {
            EntityFields::Project(f) => f.set(field, value),
            EntityFields::Document(f) => f.set(field, value),
            EntityFields::Schedule(f) => f.set(field, value),
            EntityFields::FinancialRecord(f) => f.set(field, value),
            EntityFields::ChangeOrder(f) => f.set(field, value),
            EntityFields::Rfi(f) => f.set(field, value),
        }
    }

    pub fn clear(&mut self, field: &str) -> Result<(), FieldError> {
        match self {
            EntityFields::Project(f) => f.clear(field),
            EntityFields::Document(f) => f.clear(field),
            EntityFields::Schedule(f) => f.clear(field),
            EntityFields::FinancialRecord(f) => f.clear(field),
            EntityFields::ChangeOrder(f) => f.clear(field),
            EntityFields::Rfi(f) => f.clear(field),
        }
    }

    pub fn values(&self) -> BTreeMap<String, FieldValue> {
        match self {
            EntityFields::Project(f) => f.values(),
            EntityFields::Document(f) => f.values(),
            EntityFields::Schedule(f) => f.values(),
            EntityFields::FinancialRecord(f) => f.values(),
            EntityFields::ChangeOrder(f) => f.values(),
            EntityFields::Rfi(f) => f.values(),
        }
    }

    /// Overwrite every field populated in `other`. Fields `other` leaves
    /// empty keep their current value.
    pub fn merge_from(&mut self, other: &EntityFields) -> Result<(), FieldError> {
        for (name, value) in other.values() {
            self.set(&name, value)?;
        }
        Ok(())
    }

    /// Key used to link records of the same real-world entity across systems.
    ///
    /// Only projects carry one: their code is shared by procurement and
    /// costing systems.
    pub fn correlation_key(&self) -> Option<String> {
        match self {
            EntityFields::Project(p) => p
                .code
                .as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_uppercase),
            _ => None,
        }
    }
}

/// The canonical record of one real-world entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedEntity {
    pub id: UnifiedId,
    pub kind: EntityKind,
    pub fields: EntityFields,
    /// Unmapped external attributes, namespaced by source system.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UnifiedEntity {
    /// Create a new entity with a fresh id.
    pub fn new(fields: EntityFields) -> Self {
        let now = Utc::now();
        Self {
            id: UnifiedId::new(),
            kind: fields.kind(),
            fields,
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Unmapped attributes contributed by one system.
    pub fn metadata_for(&self, system: &SystemId) -> Option<&Map<String, Value>> {
        self.metadata.get(system.as_str()).and_then(Value::as_object)
    }

    /// Replace one system's metadata namespace. An empty map removes it.
    pub fn set_metadata(&mut self, system: &SystemId, attributes: Map<String, Value>) {
        if attributes.is_empty() {
            self.metadata.remove(system.as_str());
        } else {
            self.metadata
                .insert(system.as_str().to_string(), Value::Object(attributes));
        }
    }

    pub fn correlation_key(&self) -> Option<String> {
        self.fields.correlation_key()
    }

    /// Whether fields and metadata match, ignoring timestamps.
    pub fn same_content(&self, other: &UnifiedEntity) -> bool {
        self.fields == other.fields && self.metadata == other.metadata
    }
}
