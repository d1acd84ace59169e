//! The connector contract.
//!
//! Every external platform is reached through an adapter implementing
//! [`Connector`]. Adapters own authentication refresh and any rate-limit
//! bookkeeping; callers only see pages or classified errors.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::ConnectorResult;
use crate::ids::{Cursor, SystemId};
use crate::page::Page;
use crate::types::{EntityKind, HealthStatus};

/// Adapter for one external construction-management system.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Identifier this connector is registered under.
    fn system_id(&self) -> &SystemId;

    /// Human-readable name for logs.
    fn display_name(&self) -> &str {
        self.system_id().as_str()
    }

    /// Whether the system exposes this entity kind at all.
    fn supports(&self, _kind: EntityKind) -> bool {
        true
    }

    /// Fetch one page of entities of `kind`, starting after `since`.
    ///
    /// A `None` cursor starts from the beginning. Failures are always reported
    /// as errors, never as an empty page.
    async fn list_entities(&self, kind: EntityKind, since: Option<&Cursor>)
        -> ConnectorResult<Page>;

    /// Probe the target system.
    async fn health_check(&self) -> ConnectorResult<HealthStatus>;
}

/// Shared, type-erased connector handle.
pub type BoxedConnector = Arc<dyn Connector>;
