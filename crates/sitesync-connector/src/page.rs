//! Raw records and pages returned by connectors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{Cursor, ExternalId};

/// One record as the external system returned it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub external_id: ExternalId,
    pub data: Map<String, Value>,
    /// Remote modification time, when the system reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
}

impl RawRecord {
    pub fn new(external_id: impl Into<ExternalId>, data: Map<String, Value>) -> Self {
        Self {
            external_id: external_id.into(),
            data,
            modified_at: None,
        }
    }

    /// Build a record from a JSON value. Non-object values produce an empty
    /// payload.
    pub fn from_value(external_id: impl Into<ExternalId>, value: Value) -> Self {
        let data = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::new(external_id, data)
    }

    #[must_use]
    pub fn with_modified_at(mut self, modified_at: DateTime<Utc>) -> Self {
        self.modified_at = Some(modified_at);
        self
    }

    /// Look up a value by dotted path (`budget.amount`).
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        lookup_path(&self.data, path)
    }
}

/// Resolve a dotted path inside a JSON object.
pub fn lookup_path<'a>(data: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = data.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// An entry the connector received but could not turn into a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRecord {
    /// Zero-based position within the page.
    pub position: usize,
    pub reason: String,
}

impl RejectedRecord {
    pub fn new(position: usize, reason: impl Into<String>) -> Self {
        Self {
            position,
            reason: reason.into(),
        }
    }
}

/// One page of a listing.
///
/// When `done` is true, `next_cursor` is the position an incremental run should
/// resume from next time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub records: Vec<RawRecord>,
    pub next_cursor: Option<Cursor>,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<RejectedRecord>,
}

impl Page {
    /// A page with more to come.
    pub fn more(records: Vec<RawRecord>, next_cursor: Cursor) -> Self {
        Self {
            records,
            next_cursor: Some(next_cursor),
            done: false,
            rejected: Vec::new(),
        }
    }

    /// The final page.
    pub fn last(records: Vec<RawRecord>, resume_cursor: Option<Cursor>) -> Self {
        Self {
            records,
            next_cursor: resume_cursor,
            done: true,
            rejected: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_rejected(mut self, rejected: Vec<RejectedRecord>) -> Self {
        self.rejected = rejected;
        self
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
