//! Builds the connector registry and mapping tables from configuration files.

use std::path::Path;
use std::sync::Arc;

use sitesync_connector::mapping::MappingTables;
use sitesync_connector::registry::ConnectorRegistry;
use sitesync_connector_rest::{load_systems, RestConnector};

use crate::error::WorkerError;

pub fn read_config_file(path: &Path) -> Result<String, WorkerError> {
    std::fs::read_to_string(path).map_err(|source| WorkerError::ReadFile {
        path: path.to_path_buf(),
        source,
    })
}

/// One REST connector per system in a `{"systems": [...]}` document.
pub fn build_registry(systems_json: &str) -> Result<ConnectorRegistry, WorkerError> {
    let registry = ConnectorRegistry::new();
    for system in load_systems(systems_json)? {
        let id = system.system_id.clone();
        let kinds = system.endpoints.len();
        registry.register(Arc::new(RestConnector::new(system)?))?;
        tracing::info!(system = %id, endpoints = kinds, "Registered connector");
    }
    Ok(registry)
}

pub fn load_tables(mappings_json: &str) -> Result<MappingTables, WorkerError> {
    Ok(MappingTables::from_json(mappings_json)?)
}

/// Registered systems that have no mapping table for any kind.
pub fn unmapped_systems(registry: &ConnectorRegistry, tables: &MappingTables) -> Vec<String> {
    let mut unmapped: Vec<String> = registry
        .systems()
        .into_iter()
        .filter(|system| tables.kinds_for(system).is_empty())
        .map(|system| system.as_str().to_string())
        .collect();
    unmapped.sort();
    unmapped
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYSTEMS: &str = r#"{
        "systems": [
            {
                "system_id": "procore",
                "base_url": "https://api.procore.example/v1",
                "auth": {"type": "bearer", "token": "secret"},
                "endpoints": {"project": {"path": "/projects"}}
            },
            {
                "system_id": "costbook",
                "base_url": "https://costbook.example/api",
                "endpoints": {"project": {"path": "/jobs"}}
            }
        ]
    }"#;

    const MAPPINGS: &str = r#"{
        "mappings": [{
            "system": "procore",
            "kind": "project",
            "fields": [{"source": "name", "target": "name", "type": "text", "required": true}]
        }]
    }"#;

    #[test]
    fn test_build_registry_registers_every_system() {
        let registry = build_registry(SYSTEMS).unwrap();
        let mut systems: Vec<String> = registry
            .systems()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        systems.sort();
        assert_eq!(systems, vec!["costbook", "procore"]);
    }

    #[test]
    fn test_duplicate_system_rejected() {
        let json = r#"{
            "systems": [
                {"system_id": "procore", "base_url": "https://a.example"},
                {"system_id": "procore", "base_url": "https://b.example"}
            ]
        }"#;
        let err = build_registry(json).unwrap_err();
        assert!(matches!(err, WorkerError::Connector(_)));
    }

    #[test]
    fn test_unmapped_systems_reported() {
        let registry = build_registry(SYSTEMS).unwrap();
        let tables = load_tables(MAPPINGS).unwrap();
        assert_eq!(unmapped_systems(&registry, &tables), vec!["costbook"]);
    }

    #[test]
    fn test_bad_mapping_file_rejected() {
        let err = load_tables("{not json").unwrap_err();
        assert!(matches!(err, WorkerError::Mapping(_)));
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = read_config_file(Path::new("/nonexistent/systems.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/systems.json"));
    }
}
