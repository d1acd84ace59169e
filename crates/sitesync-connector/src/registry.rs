//! Registry of configured connectors, keyed by system id.
//!
//! Populated once at startup and then only read.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::info;

use crate::error::{ConnectorError, ConnectorResult};
use crate::ids::SystemId;
use crate::traits::BoxedConnector;

/// Connectors available to the sync engine.
#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: RwLock<HashMap<SystemId, BoxedConnector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connector under its own system id.
    ///
    /// Registering the same system twice is a configuration error.
    pub fn register(&self, connector: BoxedConnector) -> ConnectorResult<()> {
        let system = connector.system_id().clone();
        let mut connectors = self
            .connectors
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if connectors.contains_key(&system) {
            return Err(ConnectorError::invalid_configuration(format!(
                "system {system} is already registered"
            )));
        }

        info!(system = %system, name = connector.display_name(), "Registered connector");
        connectors.insert(system, connector);
        Ok(())
    }

    /// Look up the connector for a system.
    pub fn get(&self, system: &SystemId) -> ConnectorResult<BoxedConnector> {
        self.connectors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(system)
            .cloned()
            .ok_or_else(|| ConnectorError::SystemNotRegistered {
                system: system.clone(),
            })
    }

    /// Registered system ids, sorted.
    pub fn systems(&self) -> Vec<SystemId> {
        let mut systems: Vec<SystemId> = self
            .connectors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        systems.sort();
        systems
    }

    pub fn len(&self) -> usize {
        self.connectors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("systems", &self.systems())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Cursor;
    use crate::page::Page;
    use crate::traits::Connector;
    use crate::types::{EntityKind, HealthStatus};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct NullConnector {
        system: SystemId,
    }

    #[async_trait]
    impl Connector for NullConnector {
        fn system_id(&self) -> &SystemId {
            &self.system
        }

        async fn list_entities(
            &self,
            _kind: EntityKind,
            _since: Option<&Cursor>,
        ) -> ConnectorResult<Page> {
            Ok(Page::last(vec![], None))
        }

        async fn health_check(&self) -> ConnectorResult<HealthStatus> {
            Ok(HealthStatus::Connected)
        }
    }

    fn null(system: &str) -> BoxedConnector {
        Arc::new(NullConnector {
            system: SystemId::from(system),
        })
    }

    #[test]
    fn test_register_and_get() {
        let registry = ConnectorRegistry::new();
        registry.register(null("procore")).unwrap();
        registry.register(null("costbook")).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.systems(),
            vec![SystemId::from("costbook"), SystemId::from("procore")]
        );
        let connector = registry.get(&SystemId::from("procore")).unwrap();
        assert_eq!(connector.display_name(), "procore");
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = ConnectorRegistry::new();
        registry.register(null("procore")).unwrap();
        let err = registry.register(null("procore")).unwrap_err();
        assert!(matches!(err, ConnectorError::InvalidConfiguration { .. }));
    }

    #[test]
    fn test_unknown_system() {
        let registry = ConnectorRegistry::new();
        assert!(registry.is_empty());
        let err = registry.get(&SystemId::from("ghost")).err().unwrap();
        assert!(matches!(err, ConnectorError::SystemNotRegistered { .. }));
    }
}
