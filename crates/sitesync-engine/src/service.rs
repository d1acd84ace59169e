//! Shared sync context.
//!
//! Everything a run needs is reached through one [`SyncService`] built at
//! startup and passed around in an `Arc`; nothing lives in globals.

use std::sync::Arc;

use sitesync_connector::ids::SystemId;
use sitesync_connector::mapping::MappingTables;
use sitesync_connector::registry::ConnectorRegistry;
use sitesync_connector::resilience::{ResilientConnector, RetryExecutor};

use crate::breakers::BreakerRegistry;
use crate::change::{ChangeDetector, ChangeRules, ImpactAnalyzer};
use crate::config::SyncSettings;
use crate::error::{SyncError, SyncResult};
use crate::events::{BroadcastEventSink, EventSink};
use crate::identity::IdentityResolver;
use crate::mapper::FieldMapper;
use crate::metrics::SyncMetrics;
use crate::store::Stores;

/// Connectors, stores, mapping, detection and resilience, wired together.
pub struct SyncService {
    registry: Arc<ConnectorRegistry>,
    stores: Stores,
    identity: IdentityResolver,
    mapper: FieldMapper,
    detector: ChangeDetector,
    breakers: BreakerRegistry,
    retry: RetryExecutor,
    events: Arc<dyn EventSink>,
    metrics: Arc<SyncMetrics>,
    settings: SyncSettings,
}

impl SyncService {
    pub fn builder(
        registry: Arc<ConnectorRegistry>,
        stores: Stores,
        tables: MappingTables,
    ) -> SyncServiceBuilder {
        SyncServiceBuilder::new(registry, stores, tables)
    }

    pub fn registry(&self) -> &ConnectorRegistry {
        &self.registry
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn identity(&self) -> &IdentityResolver {
        &self.identity
    }

    pub fn mapper(&self) -> &FieldMapper {
        &self.mapper
    }

    pub fn detector(&self) -> &ChangeDetector {
        &self.detector
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn events(&self) -> &dyn EventSink {
        self.events.as_ref()
    }

    pub fn metrics(&self) -> &SyncMetrics {
        &self.metrics
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// The registered connector for `system`, wrapped in retry and its
    /// circuit breaker.
    pub fn connector_for(&self, system: &SystemId) -> SyncResult<ResilientConnector> {
        let inner = self
            .registry
            .get(system)
            .map_err(|_| SyncError::SystemNotRegistered(system.clone()))?;
        Ok(ResilientConnector::new(
            inner,
            self.breakers.connector(system),
            self.retry.clone(),
        ))
    }
}

impl std::fmt::Debug for SyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncService")
            .field("registry", &self.registry)
            .field("mappings", &self.mapper.tables().len())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Builder for [`SyncService`].
pub struct SyncServiceBuilder {
    registry: Arc<ConnectorRegistry>,
    stores: Stores,
    tables: MappingTables,
    settings: SyncSettings,
    rules: ChangeRules,
    events: Option<Arc<dyn EventSink>>,
    metrics: Option<Arc<SyncMetrics>>,
}

impl SyncServiceBuilder {
    pub fn new(registry: Arc<ConnectorRegistry>, stores: Stores, tables: MappingTables) -> Self {
        Self {
            registry,
            stores,
            tables,
            settings: SyncSettings::default(),
            rules: ChangeRules::default(),
            events: None,
            metrics: None,
        }
    }

    #[must_use]
    pub fn settings(mut self, settings: SyncSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn change_rules(mut self, rules: ChangeRules) -> Self {
        self.rules = rules;
        self
    }

    #[must_use]
    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    #[must_use]
    pub fn metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the service. Fails when a mapping rule targets a field the
    /// entity kind does not declare.
    pub fn build(self) -> SyncResult<SyncService> {
        let mapper = FieldMapper::new(Arc::new(self.tables));
        mapper.validate_targets(&self.registry.systems())?;

        let detector = ChangeDetector::new(
            self.rules,
            ImpactAnalyzer::new(self.settings.impact_thresholds()),
        );

        Ok(SyncService {
            identity: IdentityResolver::new(self.stores.entities.clone()),
            registry: self.registry,
            stores: self.stores,
            mapper,
            detector,
            breakers: BreakerRegistry::new(self.settings.breaker_config()),
            retry: RetryExecutor::new(self.settings.retry_policy()),
            events: self
                .events
                .unwrap_or_else(|| Arc::new(BroadcastEventSink::default())),
            metrics: self.metrics.unwrap_or_default(),
            settings: self.settings,
        })
    }
}
