//! Sync engine errors.

use thiserror::Error;

use sitesync_connector::error::ConnectorError;
use sitesync_connector::ids::SystemId;
use sitesync_connector::mapping::MappingError;
use sitesync_connector::types::EntityKind;

use crate::entity::FieldError;
use crate::ids::RunId;
use crate::run::JobKey;
use crate::store::StoreError;

/// Errors surfaced by the orchestrator and service.
///
/// Per-record and per-page failures never show up here; they are recorded
/// on the [`SyncRun`](crate::run::SyncRun) instead.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A run for the same (system, kind) is in progress.
    #[error("sync already running for {job}")]
    AlreadyRunning { job: JobKey },

    #[error("sync run not found: {0}")]
    RunNotFound(RunId),

    #[error("system not registered: {0}")]
    SystemNotRegistered(SystemId),

    #[error("system {system} has no field mapping for {kind}")]
    KindNotMapped { system: SystemId, kind: EntityKind },

    #[error("orchestrator is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    pub fn configuration(message: impl Into<String>) -> Self {
        SyncError::Configuration(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        SyncError::Internal(message.into())
    }

    pub fn is_already_running(&self) -> bool {
        matches!(self, SyncError::AlreadyRunning { .. })
    }
}

impl From<MappingError> for SyncError {
    fn from(err: MappingError) -> Self {
        SyncError::Configuration(err.to_string())
    }
}

impl From<FieldError> for SyncError {
    fn from(err: FieldError) -> Self {
        SyncError::Configuration(err.to_string())
    }
}
