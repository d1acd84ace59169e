//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};

use sitesync_connector::error::{ConnectorError, ConnectorResult};
use sitesync_connector::ids::{Cursor, SystemId};
use sitesync_connector::mapping::{FieldRule, FieldType, KindMapping, MappingTables, Transform};
use sitesync_connector::page::{Page, RawRecord, RejectedRecord};
use sitesync_connector::registry::ConnectorRegistry;
use sitesync_connector::traits::Connector;
use sitesync_connector::types::{EntityKind, HealthStatus};
use sitesync_engine::config::SyncSettings;
use sitesync_engine::events::{BroadcastEventSink, SyncEvent};
use sitesync_engine::orchestrator::SyncOrchestrator;
use sitesync_engine::run::SyncRun;
use sitesync_engine::service::SyncService;
use sitesync_engine::store::memory::InMemoryStore;
use sitesync_engine::store::Stores;

// =============================================================================
// Scripted connector
// =============================================================================

/// Connector serving fixed pages, with optional injected failures and a
/// gate that holds fetches until released.
pub struct ScriptedConnector {
    system: SystemId,
    pages: Mutex<HashMap<EntityKind, Vec<Vec<RawRecord>>>>,
    rejected: Mutex<HashMap<EntityKind, Vec<RejectedRecord>>>,
    failures: Mutex<VecDeque<ConnectorError>>,
    fail_always: Mutex<Option<fn() -> ConnectorError>>,
    gate: watch::Sender<bool>,
    calls: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new(system: &str) -> Arc<Self> {
        let (gate, _) = watch::channel(true);
        Arc::new(Self {
            system: SystemId::from(system),
            pages: Mutex::new(HashMap::new()),
            rejected: Mutex::new(HashMap::new()),
            failures: Mutex::new(VecDeque::new()),
            fail_always: Mutex::new(None),
            gate,
            calls: AtomicUsize::new(0),
        })
    }

    /// Replace the pages served for `kind`.
    pub fn set_pages(&self, kind: EntityKind, pages: Vec<Vec<Value>>) {
        let pages = pages
            .into_iter()
            .map(|page| page.into_iter().map(record).collect())
            .collect();
        self.pages.lock().unwrap().insert(kind, pages);
    }

    /// Serve `records` as a single page of projects.
    pub fn set_projects(&self, records: Vec<Value>) {
        self.set_pages(EntityKind::Project, vec![records]);
    }

    /// Report `rejected` alongside the first page of `kind`.
    pub fn set_rejected(&self, kind: EntityKind, rejected: Vec<RejectedRecord>) {
        self.rejected.lock().unwrap().insert(kind, rejected);
    }

    /// Fail the next call with `error`.
    pub fn fail_next(&self, error: ConnectorError) {
        self.failures.lock().unwrap().push_back(error);
    }

    /// Fail every call until cleared.
    pub fn fail_always(&self, error: Option<fn() -> ConnectorError>) {
        *self.fail_always.lock().unwrap() = error;
    }

    /// Hold every fetch until [`open`](Self::open) is called.
    pub fn close(&self) {
        self.gate.send_replace(false);
    }

    pub fn open(&self) {
        self.gate.send_replace(true);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn record(value: Value) -> RawRecord {
    let id = value
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    RawRecord::from_value(id, value)
}

fn page_index(cursor: Option<&Cursor>) -> usize {
    cursor
        .and_then(|c| c.as_str().strip_prefix("page-"))
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl Connector for ScriptedConnector {
    fn system_id(&self) -> &SystemId {
        &self.system
    }

    async fn list_entities(
        &self,
        kind: EntityKind,
        since: Option<&Cursor>,
    ) -> ConnectorResult<Page> {
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        if let Some(make) = *self.fail_always.lock().unwrap() {
            return Err(make());
        }

        let pages = self.pages.lock().unwrap();
        let Some(pages) = pages.get(&kind) else {
            return Ok(Page::last(Vec::new(), None));
        };
        let index = page_index(since);
        let records = pages.get(index).cloned().unwrap_or_default();
        let rejected = match index {
            0 => self
                .rejected
                .lock()
                .unwrap()
                .get(&kind)
                .cloned()
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        let page = if index + 1 < pages.len() {
            Page::more(records, Cursor::new(format!("page-{}", index + 1)))
        } else {
            Page::last(records, None)
        };
        Ok(page.with_rejected(rejected))
    }

    async fn health_check(&self) -> ConnectorResult<HealthStatus> {
        Ok(HealthStatus::Connected)
    }
}

// =============================================================================
// Fixtures
// =============================================================================

pub fn project(id: &str, name: &str, code: &str, budget: &str) -> Value {
    json!({
        "id": id,
        "name": name,
        "project_number": code,
        "budget": budget,
        "status": "active",
        "completion_date": "2025-06-30",
        "region": "north"
    })
}

/// Project mapping for `system`.
pub fn project_mapping(system: &str) -> KindMapping {
    KindMapping::new(system, EntityKind::Project)
        .with_rule(FieldRule::new("name", "name", FieldType::Text).required())
        .with_rule(
            FieldRule::new("project_number", "code", FieldType::Text)
                .with_transform(Transform::Trim)
                .with_transform(Transform::Uppercase),
        )
        .with_rule(FieldRule::new("budget", "budget", FieldType::Decimal))
        .with_rule(FieldRule::new("status", "status", FieldType::Text))
        .with_rule(FieldRule::new("completion_date", "end_date", FieldType::Date))
}

pub fn tables(systems: &[&str]) -> MappingTables {
    let mut tables = MappingTables::new();
    for system in systems {
        tables.insert(project_mapping(system)).unwrap();
    }
    tables
}

/// Settings with millisecond backoff so retry tests stay fast.
pub fn fast_settings() -> SyncSettings {
    SyncSettings {
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 10,
        notify_min_priority: sitesync_engine::change::Priority::High,
        ..SyncSettings::default()
    }
}

/// Everything a pipeline test needs.
pub struct Harness {
    pub orchestrator: SyncOrchestrator,
    pub store: Arc<InMemoryStore>,
    pub events: BroadcastEventSink,
}

impl Harness {
    pub fn new(connectors: &[Arc<ScriptedConnector>]) -> Self {
        Self::with_settings(connectors, fast_settings())
    }

    pub fn with_settings(connectors: &[Arc<ScriptedConnector>], settings: SyncSettings) -> Self {
        let registry = ConnectorRegistry::new();
        let mut names = Vec::new();
        for connector in connectors {
            names.push(connector.system_id().as_str().to_string());
            registry.register(connector.clone()).unwrap();
        }
        let names: Vec<&str> = names.iter().map(String::as_str).collect();

        let store = Arc::new(InMemoryStore::new());
        let events = BroadcastEventSink::new(256);
        let service = SyncService::builder(
            Arc::new(registry),
            Stores::from_backend(store.clone()),
            tables(&names),
        )
        .settings(settings)
        .event_sink(Arc::new(events.clone()))
        .build()
        .unwrap();

        Self {
            orchestrator: SyncOrchestrator::new(Arc::new(service)),
            store,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }
}

/// Wait for the next `RunCompleted` event.
pub async fn next_completed(rx: &mut broadcast::Receiver<SyncEvent>) -> SyncRun {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let SyncEvent::RunCompleted { run } = rx.recv().await.unwrap() {
                return run;
            }
        }
    })
    .await
    .expect("run did not complete")
}

/// Drain events already published.
pub fn drain(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
