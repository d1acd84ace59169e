//! # SiteSync engine
//!
//! Keeps one unified view of construction entities fed by several external
//! systems, and records the field changes that matter to project teams.
//!
//! ## Crate Organization
//!
//! - [`entity`] - Unified entities and their typed field sets
//! - [`mapper`] - Raw records to typed fields via mapping tables
//! - [`identity`] - External id to unified id resolution and binding
//! - [`store`] - Store traits and the in-memory store
//! - [`change`] - Change detection, priorities and impact analysis
//! - [`synchronizer`] - The per-(system, kind) pipeline
//! - [`orchestrator`] - Run locks, triggers, cancellation, completion events
//! - [`schedule`] - Periodic job classes and the scheduler loop
//! - [`breakers`] - Circuit breakers per dependency
//! - [`events`] - Outbound events and alerts
//! - [`metrics`] - Process-wide counters
//! - [`config`] - Engine settings from the environment
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sitesync_engine::prelude::*;
//!
//! let service = SyncService::builder(registry, Stores::in_memory(), tables).build()?;
//! let orchestrator = SyncOrchestrator::new(Arc::new(service));
//! let run = orchestrator
//!     .trigger_sync(&SystemId::from("procore"), EntityKind::Project, SyncMode::Incremental)
//!     .await?;
//! ```

pub mod breakers;
pub mod change;
pub mod config;
pub mod entity;
pub mod error;
pub mod events;
pub mod identity;
pub mod ids;
pub mod mapper;
pub mod metrics;
pub mod orchestrator;
pub mod run;
pub mod schedule;
pub mod service;
pub mod snapshot;
pub mod store;
pub mod synchronizer;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::change::{ChangeRecord, ChangeRules, ChangeType, ImpactLevel, Priority};
    pub use crate::config::SyncSettings;
    pub use crate::entity::{EntityFields, FieldValue, UnifiedEntity};
    pub use crate::error::{SyncError, SyncResult};
    pub use crate::events::{Alert, AlertKind, BroadcastEventSink, EventSink, SyncEvent};
    pub use crate::identity::{MappingKey, Resolution};
    pub use crate::ids::{ChangeId, RunId, UnifiedId};
    pub use crate::orchestrator::SyncOrchestrator;
    pub use crate::run::{JobKey, JobState, RunStatus, SyncMode, SyncRun, TriggerSource};
    pub use crate::schedule::{JobSchedule, ScheduleFrequency, SyncScheduler};
    pub use crate::service::SyncService;
    pub use crate::store::{StoreError, Stores};
    pub use sitesync_connector::prelude::*;
}
