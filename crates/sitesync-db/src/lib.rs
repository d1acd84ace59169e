//! # sitesync-db
//!
//! PostgreSQL storage for the SiteSync engine: unified entities, system
//! mappings, snapshots, the change log and run history.
//!
//! ```rust,ignore
//! use sitesync_db::{run_migrations, DbPool, PgStore};
//! use sitesync_engine::store::Stores;
//!
//! let pool = DbPool::connect(&database_url).await?;
//! run_migrations(&pool).await?;
//! let stores = Stores::from_backend(Arc::new(PgStore::new(pool)));
//! ```

pub mod error;
pub mod migrations;
pub mod pool;
mod rows;
pub mod store;

pub use error::DbError;
pub use migrations::run_migrations;
pub use pool::{DbPool, DEFAULT_MAX_CONNECTIONS};
pub use store::PgStore;
