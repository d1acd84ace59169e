//! Sync run records and job state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use sitesync_connector::classify::{Classification, ErrorCategory, Severity};
use sitesync_connector::ids::{Cursor, ExternalId, SystemId};
use sitesync_connector::types::{EntityKind, ParseEnumError};

use crate::ids::RunId;

/// How much of the remote data a run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Resume from the last successful run's cursor.
    #[default]
    Incremental,
    /// Start from the beginning.
    Full,
}

impl SyncMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Incremental => "incremental",
            SyncMode::Full => "full",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incremental" => Ok(SyncMode::Incremental),
            "full" => Ok(SyncMode::Full),
            _ => Err(ParseEnumError::new("sync mode", s)),
        }
    }
}

/// Status of a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Partial,
    Failed,
    Cancelled,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "partial" => Ok(RunStatus::Partial),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            _ => Err(ParseEnumError::new("run status", s)),
        }
    }
}

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    #[default]
    Manual,
    Scheduled,
}

impl TriggerSource {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Manual => "manual",
            TriggerSource::Scheduled => "scheduled",
        }
    }
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TriggerSource {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(TriggerSource::Manual),
            "scheduled" => Ok(TriggerSource::Scheduled),
            _ => Err(ParseEnumError::new("trigger source", s)),
        }
    }
}

/// Per-job state machine: `Idle -> Running -> {Success, Partial, Failed, Cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Idle,
    Running,
    Success,
    Partial,
    Failed,
    Cancelled,
}

impl From<RunStatus> for JobState {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Running => JobState::Running,
            RunStatus::Success => JobState::Success,
            RunStatus::Partial => JobState::Partial,
            RunStatus::Failed => JobState::Failed,
            RunStatus::Cancelled => JobState::Cancelled,
        }
    }
}

/// One synchronizable unit: a kind in a system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub system: SystemId,
    pub kind: EntityKind,
}

impl JobKey {
    pub fn new(system: impl Into<SystemId>, kind: EntityKind) -> Self {
        Self {
            system: system.into(),
            kind,
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.system, self.kind)
    }
}

/// Record counts for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub unchanged: u64,
    /// Records rejected by an identity conflict.
    pub skipped: u64,
    pub failed: u64,
}

impl RunCounters {
    /// Records written or confirmed.
    pub fn succeeded(&self) -> u64 {
        self.created + self.updated + self.unchanged
    }

    /// Records that did not make it into the unified store.
    pub fn unsuccessful(&self) -> u64 {
        self.failed + self.skipped
    }
}

/// One error captured during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunErrorEntry {
    pub category: ErrorCategory,
    pub severity: Severity,
    pub code: String,
    pub message: String,
    /// Record the error belongs to, for per-record failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<ExternalId>,
    /// Page number (from 1), for page-level failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    pub occurred_at: DateTime<Utc>,
}

impl RunErrorEntry {
    pub fn new(
        classification: &Classification,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category: classification.category,
            severity: classification.severity,
            code: code.into(),
            message: message.into(),
            external_id: None,
            page: None,
            occurred_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn for_record(mut self, external_id: ExternalId) -> Self {
        self.external_id = Some(external_id);
        self
    }

    #[must_use]
    pub fn for_page(mut self, page: u32) -> Self {
        self.page = Some(page);
        self
    }

    pub fn is_page_level(&self) -> bool {
        self.page.is_some() && self.external_id.is_none()
    }
}

/// One orchestration cycle for a (system, kind) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: RunId,
    pub system: SystemId,
    pub kind: EntityKind,
    pub mode: SyncMode,
    pub status: RunStatus,
    pub trigger: TriggerSource,
    pub counters: RunCounters,
    pub cursor_start: Option<Cursor>,
    pub cursor_end: Option<Cursor>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub errors: Vec<RunErrorEntry>,
}

impl SyncRun {
    pub fn new(job: &JobKey, mode: SyncMode, trigger: TriggerSource) -> Self {
        Self {
            id: RunId::new(),
            system: job.system.clone(),
            kind: job.kind,
            mode,
            status: RunStatus::Running,
            trigger,
            counters: RunCounters::default(),
            cursor_start: None,
            cursor_end: None,
            started_at: Utc::now(),
            ended_at: None,
            errors: Vec::new(),
        }
    }

    pub fn job(&self) -> JobKey {
        JobKey::new(self.system.clone(), self.kind)
    }

    pub fn record_error(&mut self, entry: RunErrorEntry) {
        self.errors.push(entry);
    }

    /// Highest severity among recorded errors.
    pub fn max_severity(&self) -> Option<Severity> {
        self.errors.iter().map(|e| e.severity).max()
    }

    /// Whether the run ended on a page-level failure.
    pub fn aborted(&self) -> bool {
        self.errors.iter().any(RunErrorEntry::is_page_level)
    }

    /// Close the run with its final status.
    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.ended_at = Some(Utc::now());
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

/// Final status from what happened during a run.
///
/// An aborted run (page failure) and a run with record failures both end
/// `Partial` when anything succeeded and `Failed` otherwise.
pub fn resolve_status(counters: &RunCounters, aborted: bool, cancelled: bool) -> RunStatus {
    if cancelled {
        return RunStatus::Cancelled;
    }
    if aborted || counters.unsuccessful() > 0 {
        if counters.succeeded() > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Failed
        }
    } else {
        RunStatus::Success
    }
}
