//! Inbound field mapper.
//!
//! Turns a [`RawRecord`] into typed [`EntityFields`] using the explicit
//! per-system, per-kind rules from [`MappingTables`]. Top-level keys that no
//! rule consumes are returned as metadata for the source system's namespace.

use chrono::{DateTime, NaiveDate};
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use sitesync_connector::ids::SystemId;
use sitesync_connector::mapping::{FieldRule, FieldType, MappingTables};
use sitesync_connector::page::RawRecord;
use sitesync_connector::types::EntityKind;

use crate::entity::{EntityFields, FieldError, FieldValue};

/// Why a record could not be mapped. Always a data problem.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MappingFailure {
    #[error("no mapping configured for {system}/{kind}")]
    NoMapping { system: SystemId, kind: EntityKind },

    #[error("required field '{source_path}' is missing")]
    MissingRequired { source_path: String },

    #[error("field '{source_path}' has invalid value for {expected:?}: {value}")]
    InvalidValue {
        source_path: String,
        expected: FieldType,
        value: String,
    },

    #[error(transparent)]
    Field(#[from] FieldError),
}

impl MappingFailure {
    pub fn error_code(&self) -> &'static str {
        match self {
            MappingFailure::NoMapping { .. } => "NO_MAPPING",
            MappingFailure::MissingRequired { .. } => "MISSING_REQUIRED_FIELD",
            MappingFailure::InvalidValue { .. } => "INVALID_FIELD_VALUE",
            MappingFailure::Field(_) => "UNKNOWN_TARGET_FIELD",
        }
    }
}

/// Result of mapping one record.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedRecord {
    pub fields: EntityFields,
    /// Unconsumed top-level attributes.
    pub metadata: Map<String, Value>,
    /// Target fields the source sent as an explicit `null`.
    pub cleared: Vec<String>,
}

/// Applies mapping tables to raw records.
#[derive(Debug, Clone)]
pub struct FieldMapper {
    tables: Arc<MappingTables>,
}

impl FieldMapper {
    pub fn new(tables: Arc<MappingTables>) -> Self {
        Self { tables }
    }

    pub fn tables(&self) -> &MappingTables {
        &self.tables
    }

    /// Check that every rule targets a declared field with the declared type.
    ///
    /// Run once at startup so misconfigured tables fail fast instead of
    /// failing every record.
    pub fn validate_targets(&self, systems: &[SystemId]) -> Result<(), FieldError> {
        for system in systems {
            for kind in self.tables.kinds_for(system) {
                let Some(mapping) = self.tables.get(system, kind) else {
                    continue;
                };
                for rule in &mapping.fields {
                    match EntityFields::field_type(kind, &rule.target) {
                        None => {
                            return Err(FieldError::UnknownField {
                                kind,
                                field: rule.target.clone(),
                            })
                        }
                        Some(ty) if ty != rule.field_type => {
                            return Err(FieldError::TypeMismatch {
                                field: rule.target.clone(),
                                expected: ty,
                                found: rule.field_type,
                            })
                        }
                        Some(_) => {}
                    }
                }
            }
        }
        Ok(())
    }

    /// Map one record.
    pub fn map(
        &self,
        system: &SystemId,
        kind: EntityKind,
        record: &RawRecord,
    ) -> Result<MappedRecord, MappingFailure> {
        let mapping = self
            .tables
            .get(system, kind)
            .ok_or_else(|| MappingFailure::NoMapping {
                system: system.clone(),
                kind,
            })?;

        let mut fields = EntityFields::empty(kind);
        let mut cleared = Vec::new();
        for rule in &mapping.fields {
            match record.lookup(&rule.source) {
                None | Some(Value::Null) if rule.required => {
                    return Err(MappingFailure::MissingRequired {
                        source_path: rule.source.clone(),
                    });
                }
                // An absent key may be a partial payload; only null clears.
                None => {}
                Some(Value::Null) => {
                    fields.clear(&rule.target)?;
                    cleared.push(rule.target.clone());
                }
                Some(raw) => {
                    let value = convert(rule, raw)?;
                    fields.set(&rule.target, value)?;
                }
            }
        }

        let consumed = mapping.consumed_keys();
        let metadata = record
            .data
            .iter()
            .filter(|(key, _)| !consumed.contains(key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(MappedRecord {
            fields,
            metadata,
            cleared,
        })
    }
}

fn convert(rule: &FieldRule, raw: &Value) -> Result<FieldValue, MappingFailure> {
    let invalid = || MappingFailure::InvalidValue {
        source_path: rule.source.clone(),
        expected: rule.field_type,
        value: raw.to_string(),
    };

    let text = match raw {
        Value::String(s) => Some(
            rule.transforms
                .iter()
                .fold(s.clone(), |acc, transform| transform.apply(&acc)),
        ),
        _ => None,
    };

    match rule.field_type {
        FieldType::Text => match (raw, text) {
            (_, Some(s)) => Ok(FieldValue::Text(s)),
            (Value::Number(n), None) => Ok(FieldValue::Text(n.to_string())),
            (Value::Bool(b), None) => Ok(FieldValue::Text(b.to_string())),
            _ => Err(invalid()),
        },
        FieldType::Decimal => {
            let repr = match (raw, text) {
                (_, Some(s)) => s.trim().replace(',', ""),
                (Value::Number(n), None) => n.to_string(),
                _ => return Err(invalid()),
            };
            Decimal::from_str(&repr)
                .or_else(|_| Decimal::from_scientific(&repr))
                .map(FieldValue::Decimal)
                .map_err(|_| invalid())
        }
        FieldType::Integer => match (raw, text) {
            (Value::Number(n), None) => n.as_i64().map(FieldValue::Integer).ok_or_else(invalid),
            (_, Some(s)) => s
                .trim()
                .parse::<i64>()
                .map(FieldValue::Integer)
                .map_err(|_| invalid()),
            _ => Err(invalid()),
        },
        FieldType::Date => {
            let s = text.ok_or_else(invalid)?;
            parse_date(s.trim()).map(FieldValue::Date).ok_or_else(invalid)
        }
        FieldType::Boolean => match (raw, text) {
            (Value::Bool(b), None) => Ok(FieldValue::Boolean(*b)),
            (Value::Number(n), None) => match n.as_i64() {
                Some(0) => Ok(FieldValue::Boolean(false)),
                Some(1) => Ok(FieldValue::Boolean(true)),
                _ => Err(invalid()),
            },
            (_, Some(s)) => match s.trim().to_lowercase().as_str() {
                "true" | "yes" | "y" | "1" => Ok(FieldValue::Boolean(true)),
                "false" | "no" | "n" | "0" => Ok(FieldValue::Boolean(false)),
                _ => Err(invalid()),
            },
            _ => Err(invalid()),
        },
    }
}

/// Accepts `YYYY-MM-DD` or a full RFC 3339 timestamp.
fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(value)
                .ok()
                .map(|dt| dt.date_naive())
        })
}
