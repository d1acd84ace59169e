//! # SiteSync connector framework
//!
//! The boundary between the sync engine and external construction-management
//! platforms (procurement, field management, job costing).
//!
//! ## Crate Organization
//!
//! - [`ids`] - System, external record and cursor identifiers
//! - [`types`] - Entity kinds, health and circuit states
//! - [`error`] - [`ConnectorError`](error::ConnectorError)
//! - [`classify`] - Error categories, severities and retry decisions
//! - [`page`] - Raw records and pages
//! - [`traits`] - The [`Connector`](traits::Connector) contract
//! - [`registry`] - Connectors keyed by system id
//! - [`resilience`] - Circuit breaker, retry executor, resilient wrapper
//! - [`mapping`] - Per-system, per-kind field mapping tables

pub mod classify;
pub mod error;
pub mod ids;
pub mod mapping;
pub mod page;
pub mod registry;
pub mod resilience;
pub mod traits;
pub mod types;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::classify::{Classification, ErrorCategory, ErrorClassifier, Severity};
    pub use crate::error::{ConnectorError, ConnectorResult};
    pub use crate::ids::{Cursor, ExternalId, SystemId};
    pub use crate::mapping::{FieldRule, FieldType, KindMapping, MappingError, MappingTables};
    pub use crate::page::{Page, RawRecord, RejectedRecord};
    pub use crate::registry::ConnectorRegistry;
    pub use crate::resilience::{
        CircuitBreaker, CircuitBreakerConfig, ResilientConnector, RetryExecutor, RetryPolicy,
    };
    pub use crate::traits::{BoxedConnector, Connector};
    pub use crate::types::{CircuitState, EntityKind, HealthStatus};
}

// Re-export async_trait for connector implementors
pub use async_trait::async_trait;
