//! Error types for the sitesync-db crate.

use sitesync_connector::ids::{ExternalId, SystemId};
use sitesync_engine::ids::UnifiedId;
use sitesync_engine::store::StoreError;
use thiserror::Error;

/// Database operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Failed to establish or acquire a database connection.
    #[error("Database connection failed: {0}")]
    ConnectionFailed(#[source] sqlx::Error),

    /// A database migration failed to apply.
    #[error("Migration failed: {0}")]
    MigrationFailed(#[source] sqlx::migrate::MigrateError),

    /// A database query failed to execute.
    #[error("Query failed: {0}")]
    QueryFailed(#[source] sqlx::Error),

    /// A JSON column could not be encoded or decoded.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[source] serde_json::Error),

    /// A stored row holds a value the engine does not recognise.
    #[error("Invalid row in {table}: {message}")]
    InvalidRow {
        table: &'static str,
        message: String,
    },

    /// A binding would break mapping uniqueness.
    #[error("Mapping conflict for {system}:{external_id}: {reason}")]
    BindConflict {
        system: SystemId,
        external_id: ExternalId,
        unified_id: UnifiedId,
        reason: String,
    },

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation failed.
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

impl DbError {
    pub(crate) fn invalid_row(table: &'static str, message: impl ToString) -> Self {
        DbError::InvalidRow {
            table,
            message: message.to_string(),
        }
    }

    /// Check if this error indicates a connection problem.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(self, DbError::ConnectionFailed(_))
    }

    #[must_use]
    pub fn is_migration_error(&self) -> bool {
        matches!(self, DbError::MigrationFailed(_))
    }

    #[must_use]
    pub fn is_query_error(&self) -> bool {
        matches!(self, DbError::QueryFailed(_))
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, DbError::NotFound(_))
    }

    #[must_use]
    pub fn is_validation_failed(&self) -> bool {
        matches!(self, DbError::ValidationFailed(_))
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::SerializationFailed(err)
    }
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(id) => StoreError::not_found("record", id),
            DbError::BindConflict {
                system,
                external_id,
                unified_id,
                reason,
            } => StoreError::BindConflict {
                system,
                external_id,
                unified_id,
                reason,
            },
            other => StoreError::backend_with_source("postgres store failure", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_invalid_row() {
        let err = DbError::invalid_row("sync_runs", "unknown status 'paused'");
        assert_eq!(
            err.to_string(),
            "Invalid row in sync_runs: unknown status 'paused'"
        );
    }

    #[test]
    fn test_error_predicates() {
        let err = DbError::NotFound("mapping procore:P-1".into());
        assert!(err.is_not_found());
        assert!(!err.is_connection_error());
        assert!(!err.is_query_error());
        assert!(!err.is_migration_error());
        assert!(!err.is_validation_failed());
    }

    #[test]
    fn test_not_found_maps_to_store_not_found() {
        let err: StoreError = DbError::NotFound("mapping procore:P-1".into()).into();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert!(!err.is_backend());
    }

    #[test]
    fn test_bind_conflict_keeps_its_shape() {
        let unified_id = UnifiedId::new();
        let err: StoreError = DbError::BindConflict {
            system: SystemId::from("procore"),
            external_id: ExternalId::from("P-1"),
            unified_id,
            reason: "record already bound".into(),
        }
        .into();
        match err {
            StoreError::BindConflict {
                system,
                unified_id: bound,
                ..
            } => {
                assert_eq!(system.as_str(), "procore");
                assert_eq!(bound, unified_id);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_other_errors_map_to_backend() {
        let err: StoreError = DbError::QueryFailed(sqlx::Error::PoolTimedOut).into();
        assert!(err.is_backend());
        assert_eq!(err.error_code(), "STORE_BACKEND");

        let err: StoreError = DbError::invalid_row("system_mappings", "bad status").into();
        assert!(err.is_backend());
    }
}
