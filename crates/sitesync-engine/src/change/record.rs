//! Change records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use sitesync_connector::ids::SystemId;
use sitesync_connector::types::{EntityKind, ParseEnumError};

use crate::entity::FieldValue;
use crate::ids::{ChangeId, RunId, UnifiedId};

/// How a field changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Added,
    Removed,
    Increased,
    Decreased,
    Modified,
}

impl ChangeType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Added => "added",
            ChangeType::Removed => "removed",
            ChangeType::Increased => "increased",
            ChangeType::Decreased => "decreased",
            ChangeType::Modified => "modified",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ChangeType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "added" => Ok(ChangeType::Added),
            "removed" => Ok(ChangeType::Removed),
            "increased" => Ok(ChangeType::Increased),
            "decreased" => Ok(ChangeType::Decreased),
            "modified" => Ok(ChangeType::Modified),
            _ => Err(ParseEnumError::new("change type", s)),
        }
    }
}

/// Notification priority of a change.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Low,
    Medium,
    High,
}

impl Priority {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            _ => Err(ParseEnumError::new("priority", s)),
        }
    }
}

/// Business impact of a change.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum ImpactLevel {
    #[default]
    None,
    Low,
    Medium,
    High,
}

impl ImpactLevel {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ImpactLevel::None => "none",
            ImpactLevel::Low => "low",
            ImpactLevel::Medium => "medium",
            ImpactLevel::High => "high",
        }
    }
}

/// Impact assessment attached to a change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ImpactAssessment {
    pub level: ImpactLevel,
    pub summary: String,
    /// Days a date moved later (negative when pulled in).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_days: Option<i64>,
    /// Relative change of a monetary value, in percent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent_change: Option<f64>,
}

impl ImpactAssessment {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(level: ImpactLevel, summary: impl Into<String>) -> Self {
        Self {
            level,
            summary: summary.into(),
            delay_days: None,
            percent_change: None,
        }
    }

    #[must_use]
    pub fn with_delay_days(mut self, days: i64) -> Self {
        self.delay_days = Some(days);
        self
    }

    #[must_use]
    pub fn with_percent_change(mut self, percent: f64) -> Self {
        self.percent_change = Some(percent);
        self
    }
}

/// One detected field change. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: ChangeId,
    pub entity_id: UnifiedId,
    pub kind: EntityKind,
    pub system: SystemId,
    pub run_id: RunId,
    pub field: String,
    pub previous: Option<FieldValue>,
    pub new: Option<FieldValue>,
    pub change_type: ChangeType,
    pub priority: Priority,
    pub impact: ImpactAssessment,
    pub approval_required: bool,
    pub detected_at: DateTime<Utc>,
}

impl ChangeRecord {
    /// Key consumers use to drop redelivered events.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.entity_id,
            self.field,
            self.detected_at.timestamp_micros()
        )
    }
}
