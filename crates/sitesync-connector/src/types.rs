//! Enums shared between connectors and the sync engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of construction entity a connector can list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Project,
    Document,
    Schedule,
    FinancialRecord,
    ChangeOrder,
    Rfi,
}

impl EntityKind {
    /// Every kind, in synchronization order (projects first so later kinds can
    /// reference them).
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Project,
        EntityKind::Document,
        EntityKind::Schedule,
        EntityKind::FinancialRecord,
        EntityKind::ChangeOrder,
        EntityKind::Rfi,
    ];

    /// Get the string representation used in storage and configuration.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Project => "project",
            EntityKind::Document => "document",
            EntityKind::Schedule => "schedule",
            EntityKind::FinancialRecord => "financial_record",
            EntityKind::ChangeOrder => "change_order",
            EntityKind::Rfi => "rfi",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "project" => Ok(EntityKind::Project),
            "document" => Ok(EntityKind::Document),
            "schedule" => Ok(EntityKind::Schedule),
            "financial_record" => Ok(EntityKind::FinancialRecord),
            "change_order" => Ok(EntityKind::ChangeOrder),
            "rfi" => Ok(EntityKind::Rfi),
            _ => Err(ParseEnumError::new("entity kind", s)),
        }
    }
}

/// Health reported by a connector's target system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Target answered normally.
    #[default]
    Connected,
    /// Target answered but reported reduced service.
    Degraded,
    /// Target could not be reached.
    Disconnected,
}

impl HealthStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Connected => "connected",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Disconnected => "disconnected",
        }
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Connected)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Circuit breaker state for one guarded dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through and failures are counted.
    #[default]
    Closed,
    /// Calls are rejected without reaching the dependency.
    Open,
    /// A single trial call is admitted to probe recovery.
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    /// Check if a call could be admitted in this state.
    #[must_use]
    pub fn allows_operations(&self) -> bool {
        matches!(self, CircuitState::Closed | CircuitState::HalfOpen)
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CircuitState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "closed" => Ok(CircuitState::Closed),
            "open" => Ok(CircuitState::Open),
            "half_open" => Ok(CircuitState::HalfOpen),
            _ => Err(ParseEnumError::new("circuit state", s)),
        }
    }
}

/// Error returned when a stored or configured enum value is not recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    what: &'static str,
    value: String,
}

impl ParseEnumError {
    pub fn new(what: &'static str, value: impl Into<String>) -> Self {
        Self {
            what,
            value: value.into(),
        }
    }
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: '{}'", self.what, self.value)
    }
}

impl std::error::Error for ParseEnumError {}
