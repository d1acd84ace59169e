//! Connection pool.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

use crate::error::DbError;

/// Default pool size when none is configured.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Thin wrapper around a Postgres pool.
#[derive(Debug, Clone)]
pub struct DbPool {
    pool: PgPool,
}

impl DbPool {
    /// Connect with the default pool size.
    pub async fn connect(database_url: &str) -> Result<Self, DbError> {
        Self::connect_with(database_url, DEFAULT_MAX_CONNECTIONS).await
    }

    /// Connect with at most `max_connections` connections.
    ///
    /// # Errors
    ///
    /// Returns `DbError::ConnectionFailed` when the server is unreachable or
    /// rejects the credentials.
    pub async fn connect_with(database_url: &str, max_connections: u32) -> Result<Self, DbError> {
        tracing::info!(max_connections, "Connecting to database");

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Some(Duration::from_secs(600)))
            .connect(database_url)
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "Failed to connect to database");
                DbError::ConnectionFailed(e)
            })?;

        tracing::info!("Database connection pool created");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying sqlx pool.
    pub fn inner(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
