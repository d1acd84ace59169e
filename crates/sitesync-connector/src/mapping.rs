//! Field mapping tables.
//!
//! Each (system, kind) pair has an explicit list of rules mapping external
//! attributes onto unified fields. Anything without a rule lands in the
//! entity's metadata bag.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::ids::SystemId;
use crate::types::EntityKind;

/// Expected type of a mapped value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Decimal,
    Integer,
    Date,
    Boolean,
}

/// Normalisation applied to text values before typing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    Trim,
    Lowercase,
    Uppercase,
}

impl Transform {
    pub fn apply(&self, value: &str) -> String {
        match self {
            Transform::Trim => value.trim().to_string(),
            Transform::Lowercase => value.to_lowercase(),
            Transform::Uppercase => value.to_uppercase(),
        }
    }
}

/// One external attribute mapped onto one unified field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
    /// Dotted path into the external payload.
    pub source: String,
    /// Unified field name.
    pub target: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Fail the record when the source is missing or null.
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transforms: Vec<Transform>,
}

impl FieldRule {
    pub fn new(source: impl Into<String>, target: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            field_type,
            required: false,
            transforms: Vec::new(),
        }
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transforms.push(transform);
        self
    }

    /// The top-level payload key this rule consumes.
    pub fn root_key(&self) -> &str {
        self.source.split('.').next().unwrap_or(&self.source)
    }
}

/// Rules for one (system, kind) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KindMapping {
    pub system: SystemId,
    pub kind: EntityKind,
    pub fields: Vec<FieldRule>,
}

impl KindMapping {
    pub fn new(system: impl Into<SystemId>, kind: EntityKind) -> Self {
        Self {
            system: system.into(),
            kind,
            fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_rule(mut self, rule: FieldRule) -> Self {
        self.fields.push(rule);
        self
    }

    /// Top-level payload keys consumed by some rule.
    pub fn consumed_keys(&self) -> HashSet<&str> {
        self.fields.iter().map(FieldRule::root_key).collect()
    }

    fn validate(&self) -> Result<(), MappingError> {
        let mut targets = HashSet::new();
        for rule in &self.fields {
            if rule.source.trim().is_empty() {
                return Err(MappingError::EmptySource {
                    system: self.system.clone(),
                    kind: self.kind,
                    target: rule.target.clone(),
                });
            }
            if !targets.insert(rule.target.as_str()) {
                return Err(MappingError::DuplicateTarget {
                    system: self.system.clone(),
                    kind: self.kind,
                    target: rule.target.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Errors in mapping configuration.
#[derive(Debug, Error)]
pub enum MappingError {
    #[error("failed to parse mapping configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("duplicate mapping for system {system}, kind {kind}")]
    DuplicateMapping { system: SystemId, kind: EntityKind },

    #[error("mapping {system}/{kind} maps more than one rule onto '{target}'")]
    DuplicateTarget {
        system: SystemId,
        kind: EntityKind,
        target: String,
    },

    #[error("mapping {system}/{kind} has an empty source for '{target}'")]
    EmptySource {
        system: SystemId,
        kind: EntityKind,
        target: String,
    },
}

#[derive(Debug, Default, Deserialize)]
struct MappingFile {
    #[serde(default)]
    mappings: Vec<KindMapping>,
}

/// All mapping tables, indexed by (system, kind).
#[derive(Debug, Clone, Default)]
pub struct MappingTables {
    tables: HashMap<(SystemId, EntityKind), KindMapping>,
}

impl MappingTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `{"mappings": [...]}` document.
    pub fn from_json(json: &str) -> Result<Self, MappingError> {
        let file: MappingFile = serde_json::from_str(json)?;
        let mut tables = Self::new();
        for mapping in file.mappings {
            tables.insert(mapping)?;
        }
        Ok(tables)
    }

    pub fn insert(&mut self, mapping: KindMapping) -> Result<(), MappingError> {
        mapping.validate()?;
        let key = (mapping.system.clone(), mapping.kind);
        if self.tables.contains_key(&key) {
            return Err(MappingError::DuplicateMapping {
                system: mapping.system,
                kind: mapping.kind,
            });
        }
        self.tables.insert(key, mapping);
        Ok(())
    }

    pub fn get(&self, system: &SystemId, kind: EntityKind) -> Option<&KindMapping> {
        self.tables.get(&(system.clone(), kind))
    }

    /// Kinds with a mapping for `system`, in synchronization order.
    pub fn kinds_for(&self, system: &SystemId) -> Vec<EntityKind> {
        EntityKind::ALL
            .into_iter()
            .filter(|kind| self.tables.contains_key(&(system.clone(), *kind)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
