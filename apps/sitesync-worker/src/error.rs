//! Startup failures of the worker.

use std::path::PathBuf;

use sitesync_connector::error::ConnectorError;
use sitesync_connector::mapping::MappingError;
use sitesync_db::DbError;
use sitesync_engine::config::ConfigError;
use sitesync_engine::error::SyncError;
use sitesync_engine::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("connector setup failed: {0}")]
    Connector(#[from] ConnectorError),

    #[error("invalid field mappings: {0}")]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    Database(#[from] DbError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("engine setup failed: {0}")]
    Sync(#[from] SyncError),
}
