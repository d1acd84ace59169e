//! End-to-end tests of the sync pipeline against scripted connectors and
//! the in-memory store.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::collections::HashSet;

use common::{drain, next_completed, project, Harness, ScriptedConnector};
use sitesync_connector::classify::{ErrorCategory, Severity};
use sitesync_connector::error::ConnectorError;
use sitesync_connector::ids::{Cursor, SystemId};
use sitesync_connector::page::RejectedRecord;
use sitesync_connector::types::{CircuitState, EntityKind};
use sitesync_engine::change::{ChangeType, Priority};
use sitesync_engine::config::SyncSettings;
use sitesync_engine::error::SyncError;
use sitesync_engine::events::{AlertKind, SyncEvent};
use sitesync_engine::identity::MappingStatus;
use sitesync_engine::ids::RunId;
use sitesync_engine::run::{JobState, RunStatus, SyncMode};
use sitesync_engine::schedule::{JobSchedule, SyncScheduler, TickReport};

fn procore() -> SystemId {
    SystemId::from("procore")
}

fn three_projects() -> Vec<serde_json::Value> {
    vec![
        project("P-1", "Harbor Tower", "HT-01", "100000"),
        project("P-2", "Depot Extension", "DE-02", "250000"),
        project("P-3", "School Annex", "SA-03", "80000"),
    ]
}

// =============================================================================
// Creation and idempotence
// =============================================================================

#[tokio::test]
async fn test_first_sync_creates_entities_and_mappings() {
    let connector = ScriptedConnector::new("procore");
    connector.set_projects(three_projects());
    let h = Harness::new(&[connector.clone()]);

    let run = h
        .orchestrator
        .run_to_completion(&procore(), EntityKind::Project, SyncMode::Full)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.counters.processed, 3);
    assert_eq!(run.counters.created, 3);
    assert!(run.errors.is_empty());
    assert_eq!(h.store.entity_count(), 3);
    assert_eq!(h.store.mapping_count(), 3);
    assert!(h
        .store
        .all_mappings()
        .iter()
        .all(|m| m.status == MappingStatus::Completed && m.last_synced_at.is_some()));
}

#[tokio::test]
async fn test_resync_of_unchanged_data_is_idempotent() {
    let connector = ScriptedConnector::new("procore");
    connector.set_projects(three_projects());
    let h = Harness::new(&[connector.clone()]);
    let started = Utc::now() - ChronoDuration::seconds(1);

    h.orchestrator
        .run_to_completion(&procore(), EntityKind::Project, SyncMode::Full)
        .await
        .unwrap();
    let second = h
        .orchestrator
        .run_to_completion(&procore(), EntityKind::Project, SyncMode::Full)
        .await
        .unwrap();

    assert_eq!(second.status, RunStatus::Success);
    assert_eq!(second.counters.created, 0);
    assert_eq!(second.counters.updated, 0);
    assert_eq!(second.counters.unchanged, 3);
    assert_eq!(h.store.entity_count(), 3);
    assert_eq!(h.store.mapping_count(), 3);
    assert!(h
        .orchestrator
        .get_recent_changes(started)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_incremental_run_resumes_from_last_cursor() {
    let connector = ScriptedConnector::new("procore");
    connector.set_pages(
        EntityKind::Project,
        vec![
            vec![project("P-1", "Harbor Tower", "HT-01", "100000")],
            vec![project("P-2", "Depot Extension", "DE-02", "250000")],
        ],
    );
    let h = Harness::new(&[connector.clone()]);

    let first = h
        .orchestrator
        .run_to_completion(&procore(), EntityKind::Project, SyncMode::Incremental)
        .await
        .unwrap();
    assert_eq!(first.status, RunStatus::Success);
    assert_eq!(first.counters.created, 2);
    assert_eq!(first.cursor_end, Some(Cursor::new("page-1")));
    assert_eq!(connector.calls(), 2);

    let second = h
        .orchestrator
        .run_to_completion(&procore(), EntityKind::Project, SyncMode::Incremental)
        .await
        .unwrap();
    assert_eq!(second.cursor_start, Some(Cursor::new("page-1")));
    assert_eq!(second.counters.processed, 1);
    assert_eq!(connector.calls(), 3);
}

// =============================================================================
// Change detection
// =============================================================================

#[tokio::test]
async fn test_budget_increase_emits_one_high_priority_change() {
    let connector = ScriptedConnector::new("procore");
    connector.set_projects(vec![project("P-1", "Harbor Tower", "HT-01", "100000")]);
    let h = Harness::new(&[connector.clone()]);
    let mut rx = h.subscribe();
    let started = Utc::now() - ChronoDuration::seconds(1);

    h.orchestrator
        .run_to_completion(&procore(), EntityKind::Project, SyncMode::Incremental)
        .await
        .unwrap();

    connector.set_projects(vec![project("P-1", "Harbor Tower", "HT-01", "130000")]);
    let run = h
        .orchestrator
        .run_to_completion(&procore(), EntityKind::Project, SyncMode::Incremental)
        .await
        .unwrap();
    assert_eq!(run.counters.updated, 1);

    let changes = h.orchestrator.get_recent_changes(started).await.unwrap();
    assert_eq!(changes.len(), 1);
    let change = &changes[0];
    assert_eq!(change.field, "budget");
    assert_eq!(change.change_type, ChangeType::Increased);
    assert_eq!(change.priority, Priority::High);
    assert!(change.approval_required);
    assert_eq!(change.run_id, run.id);

    let published: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            SyncEvent::Change { change } => Some(change),
            _ => None,
        })
        .collect();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].dedup_key(), change.dedup_key());
}

#[tokio::test]
async fn test_null_from_source_clears_field_and_emits_removed() {
    let connector = ScriptedConnector::new("procore");
    connector.set_projects(vec![project("P-1", "Harbor Tower", "HT-01", "100000")]);
    let h = Harness::new(&[connector.clone()]);
    let started = Utc::now() - ChronoDuration::seconds(1);

    h.orchestrator
        .run_to_completion(&procore(), EntityKind::Project, SyncMode::Full)
        .await
        .unwrap();

    let mut cleared = project("P-1", "Harbor Tower", "HT-01", "100000");
    cleared["completion_date"] = serde_json::Value::Null;
    connector.set_projects(vec![cleared]);
    let run = h
        .orchestrator
        .run_to_completion(&procore(), EntityKind::Project, SyncMode::Full)
        .await
        .unwrap();
    assert_eq!(run.counters.updated, 1);
    assert_eq!(run.counters.unchanged, 0);

    let changes = h.orchestrator.get_recent_changes(started).await.unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].field, "end_date");
    assert_eq!(changes[0].change_type, ChangeType::Removed);
    assert!(changes[0].new.is_none());
    assert!(changes[0].previous.is_some());

    // A record that leaves the key out keeps the value it had.
    connector.set_projects(vec![json!({
        "id": "P-1",
        "name": "Harbor Tower",
        "budget": "100000",
        "region": "north"
    })]);
    let run = h
        .orchestrator
        .run_to_completion(&procore(), EntityKind::Project, SyncMode::Full)
        .await
        .unwrap();
    assert_eq!(run.counters.unchanged, 1);
    assert_eq!(h.orchestrator.get_recent_changes(started).await.unwrap().len(), 1);
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_invalid_record_fails_alone_and_run_is_partial() {
    let connector = ScriptedConnector::new("procore");
    connector.set_projects(vec![
        project("P-1", "Harbor Tower", "HT-01", "100000"),
        project("P-2", "Depot Extension", "DE-02", "250000"),
        json!({"id": "P-3", "project_number": "SA-03", "budget": "80000"}),
        project("P-4", "Bridge Deck", "BD-04", "410000"),
        project("P-5", "Clinic Fit-out", "CF-05", "95000"),
    ]);
    let h = Harness::new(&[connector.clone()]);

    let run = h
        .orchestrator
        .run_to_completion(&procore(), EntityKind::Project, SyncMode::Full)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Partial);
    assert_eq!(run.counters.processed, 5);
    assert_eq!(run.counters.created, 4);
    assert_eq!(run.counters.failed, 1);
    assert_eq!(run.errors.len(), 1);

    let error = &run.errors[0];
    assert_eq!(error.category, ErrorCategory::Validation);
    assert_eq!(error.code, "MISSING_REQUIRED_FIELD");
    assert_eq!(error.external_id.as_ref().map(|id| id.as_str()), Some("P-3"));
    assert_eq!(h.store.entity_count(), 4);
}

#[tokio::test]
async fn test_connector_rejections_are_recorded_as_failures() {
    let connector = ScriptedConnector::new("procore");
    connector.set_projects(vec![project("P-1", "Harbor Tower", "HT-01", "100000")]);
    connector.set_rejected(
        EntityKind::Project,
        vec![RejectedRecord::new(1, "record has no 'id' identifier")],
    );
    let h = Harness::new(&[connector.clone()]);

    let run = h
        .orchestrator
        .run_to_completion(&procore(), EntityKind::Project, SyncMode::Full)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Partial);
    assert_eq!(run.counters.processed, 2);
    assert_eq!(run.counters.created, 1);
    assert_eq!(run.counters.failed, 1);
    assert_eq!(run.errors.len(), 1);
    let error = &run.errors[0];
    assert_eq!(error.category, ErrorCategory::Validation);
    assert_eq!(error.code, "REJECTED_RECORD");
    assert!(error.message.contains("entry 1 of page 1"));
    assert!(!error.is_page_level());
}

#[tokio::test]
async fn test_failed_record_marks_existing_mapping_failed() {
    let connector = ScriptedConnector::new("procore");
    connector.set_projects(vec![project("P-1", "Harbor Tower", "HT-01", "100000")]);
    let h = Harness::new(&[connector.clone()]);

    h.orchestrator
        .run_to_completion(&procore(), EntityKind::Project, SyncMode::Full)
        .await
        .unwrap();

    connector.set_projects(vec![json!({
        "id": "P-1",
        "name": "Harbor Tower",
        "budget": "not a number"
    })]);
    let run = h
        .orchestrator
        .run_to_completion(&procore(), EntityKind::Project, SyncMode::Full)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.errors[0].code, "INVALID_FIELD_VALUE");

    let mapping = h.store.all_mappings().pop().unwrap();
    assert_eq!(mapping.status, MappingStatus::Failed);
    assert!(mapping.last_error.is_some());
}

#[tokio::test]
async fn test_authentication_failure_is_not_retried_and_raises_alert() {
    let connector = ScriptedConnector::new("procore");
    connector.set_projects(three_projects());
    connector.fail_next(ConnectorError::http(401, "unauthorized"));
    let h = Harness::new(&[connector.clone()]);
    let mut rx = h.subscribe();

    let run = h
        .orchestrator
        .run_to_completion(&procore(), EntityKind::Project, SyncMode::Full)
        .await
        .unwrap();

    assert_eq!(connector.calls(), 1);
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.counters.processed, 0);
    assert_eq!(run.errors.len(), 1);
    assert_eq!(run.errors[0].category, ErrorCategory::Authentication);
    assert_eq!(run.errors[0].severity, Severity::Critical);
    assert_eq!(run.errors[0].page, Some(1));

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        SyncEvent::Alert { alert } if alert.kind == AlertKind::CriticalError
    )));
    assert!(events
        .iter()
        .any(|e| matches!(e, SyncEvent::RunCompleted { run: r } if r.id == run.id)));
    assert_eq!(h.orchestrator.service().metrics().snapshot().alerts_raised, 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried() {
    let connector = ScriptedConnector::new("procore");
    connector.set_projects(three_projects());
    connector.fail_next(ConnectorError::http(503, "service unavailable"));
    connector.fail_next(ConnectorError::network("connection reset"));
    let h = Harness::with_settings(
        &[connector.clone()],
        SyncSettings {
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 10_000,
            ..SyncSettings::default()
        },
    );

    let run = h
        .orchestrator
        .run_to_completion(&procore(), EntityKind::Project, SyncMode::Full)
        .await
        .unwrap();

    assert_eq!(connector.calls(), 3);
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.counters.created, 3);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_after_failed_runs_and_rejects_without_calling() {
    let connector = ScriptedConnector::new("procore");
    connector.fail_always(Some(|| ConnectorError::http(503, "service unavailable")));
    let h = Harness::with_settings(
        &[connector.clone()],
        SyncSettings {
            retry_max_attempts: 1,
            breaker_failure_threshold: 3,
            ..SyncSettings::default()
        },
    );
    let mut rx = h.subscribe();

    for _ in 0..3 {
        let run = h
            .orchestrator
            .run_to_completion(&procore(), EntityKind::Project, SyncMode::Full)
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
    }
    assert_eq!(connector.calls(), 3);

    let breaker = h.orchestrator.service().breakers().connector(&procore());
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(drain(&mut rx).iter().any(|e| matches!(
        e,
        SyncEvent::CircuitOpened { dependency, .. } if dependency == "connector:procore"
    )));

    let rejected = h
        .orchestrator
        .run_to_completion(&procore(), EntityKind::Project, SyncMode::Full)
        .await
        .unwrap();
    assert_eq!(connector.calls(), 3);
    assert_eq!(rejected.status, RunStatus::Failed);
    assert_eq!(rejected.errors[0].code, "CIRCUIT_OPEN");
    assert_eq!(
        h.orchestrator
            .service()
            .metrics()
            .snapshot()
            .circuit_rejections,
        1
    );
}

// =============================================================================
// Concurrency, correlation and cancellation
// =============================================================================

#[tokio::test]
async fn test_second_trigger_while_running_is_rejected() {
    let connector = ScriptedConnector::new("procore");
    connector.set_projects(three_projects());
    connector.close();
    let h = Harness::new(&[connector.clone()]);
    let mut rx = h.subscribe();

    let run = h
        .orchestrator
        .trigger_sync(&procore(), EntityKind::Project, SyncMode::Full)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(
        h.orchestrator.job_state(&procore(), EntityKind::Project),
        JobState::Running
    );

    let err = h
        .orchestrator
        .trigger_sync(&procore(), EntityKind::Project, SyncMode::Incremental)
        .await
        .unwrap_err();
    assert!(err.is_already_running());

    connector.open();
    let finished = next_completed(&mut rx).await;
    assert_eq!(finished.id, run.id);
    assert_eq!(finished.status, RunStatus::Success);
    assert_eq!(
        h.orchestrator.job_state(&procore(), EntityKind::Project),
        JobState::Success
    );
    assert!(h.orchestrator.running_jobs().is_empty());
}

#[tokio::test]
async fn test_concurrent_systems_converge_on_one_project() {
    let procore_conn = ScriptedConnector::new("procore");
    procore_conn.set_projects(vec![project("P-100", "Harbor Tower", " ht-01 ", "100000")]);
    let costbook = ScriptedConnector::new("costbook");
    costbook.set_projects(vec![project("JOB-7", "Harbor Tower", "HT-01", "100000")]);
    let h = Harness::new(&[procore_conn.clone(), costbook.clone()]);
    let mut rx = h.subscribe();

    h.orchestrator
        .trigger_sync(&procore(), EntityKind::Project, SyncMode::Full)
        .await
        .unwrap();
    h.orchestrator
        .trigger_sync(&SystemId::from("costbook"), EntityKind::Project, SyncMode::Full)
        .await
        .unwrap();
    next_completed(&mut rx).await;
    next_completed(&mut rx).await;

    assert_eq!(h.store.entity_count(), 1);
    let mappings = h.store.all_mappings();
    assert_eq!(mappings.len(), 2);
    let unified: HashSet<_> = mappings.iter().map(|m| m.unified_id).collect();
    assert_eq!(unified.len(), 1);
}

#[tokio::test]
async fn test_cancel_stops_run_and_releases_lock() {
    let connector = ScriptedConnector::new("procore");
    connector.set_projects(three_projects());
    connector.close();
    let h = Harness::new(&[connector.clone()]);
    let mut rx = h.subscribe();

    let run = h
        .orchestrator
        .trigger_sync(&procore(), EntityKind::Project, SyncMode::Full)
        .await
        .unwrap();
    h.orchestrator.cancel(run.id).await.unwrap();
    connector.open();

    let finished = next_completed(&mut rx).await;
    assert_eq!(finished.status, RunStatus::Cancelled);
    assert_eq!(finished.counters.processed, 0);
    assert_eq!(
        h.orchestrator.job_state(&procore(), EntityKind::Project),
        JobState::Cancelled
    );

    // Finished runs can be cancelled again harmlessly; the lock is free.
    h.orchestrator.cancel(run.id).await.unwrap();
    h.orchestrator
        .run_to_completion(&procore(), EntityKind::Project, SyncMode::Full)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_shutdown_cancels_running_jobs_and_rejects_new_triggers() {
    let connector = ScriptedConnector::new("procore");
    connector.set_projects(three_projects());
    connector.close();
    let h = Harness::new(&[connector.clone()]);

    let run = h
        .orchestrator
        .trigger_sync(&procore(), EntityKind::Project, SyncMode::Full)
        .await
        .unwrap();

    tokio::join!(h.orchestrator.shutdown(), async { connector.open() });

    let persisted = h.orchestrator.get_run_status(run.id).await.unwrap();
    assert_eq!(persisted.status, RunStatus::Cancelled);

    let err = h
        .orchestrator
        .trigger_sync(&procore(), EntityKind::Project, SyncMode::Full)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::ShuttingDown));
}

// =============================================================================
// Stale marking and run lookup
// =============================================================================

#[tokio::test]
async fn test_full_sync_marks_missing_records_stale() {
    let connector = ScriptedConnector::new("procore");
    connector.set_projects(three_projects());
    let h = Harness::new(&[connector.clone()]);

    h.orchestrator
        .run_to_completion(&procore(), EntityKind::Project, SyncMode::Full)
        .await
        .unwrap();

    connector.set_projects(vec![project("P-1", "Harbor Tower", "HT-01", "100000")]);
    h.orchestrator
        .run_to_completion(&procore(), EntityKind::Project, SyncMode::Full)
        .await
        .unwrap();

    let stale: HashSet<String> = h
        .store
        .all_mappings()
        .into_iter()
        .filter(|m| m.stale)
        .map(|m| m.external_id.into_inner())
        .collect();
    assert_eq!(stale, HashSet::from(["P-2".to_string(), "P-3".to_string()]));
}

#[tokio::test]
async fn test_run_status_lookup() {
    let connector = ScriptedConnector::new("procore");
    connector.set_projects(three_projects());
    let h = Harness::new(&[connector.clone()]);

    let run = h
        .orchestrator
        .run_to_completion(&procore(), EntityKind::Project, SyncMode::Full)
        .await
        .unwrap();

    let persisted = h.orchestrator.get_run_status(run.id).await.unwrap();
    assert_eq!(persisted.status, RunStatus::Success);
    assert_eq!(persisted.counters, run.counters);
    assert!(persisted.ended_at.is_some());

    let err = h.orchestrator.get_run_status(RunId::new()).await.unwrap_err();
    assert!(matches!(err, SyncError::RunNotFound(_)));
}

#[tokio::test]
async fn test_trigger_rejects_unknown_system_and_unmapped_kind() {
    let connector = ScriptedConnector::new("procore");
    let h = Harness::new(&[connector]);

    let err = h
        .orchestrator
        .trigger_sync(&SystemId::from("unknown"), EntityKind::Project, SyncMode::Full)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::SystemNotRegistered(_)));

    let err = h
        .orchestrator
        .trigger_sync(&procore(), EntityKind::Rfi, SyncMode::Full)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::KindNotMapped { .. }));
}

// =============================================================================
// Scheduler
// =============================================================================

#[tokio::test]
async fn test_scheduler_triggers_due_jobs_and_skips_running_ones() {
    let connector = ScriptedConnector::new("procore");
    connector.set_projects(three_projects());
    connector.close();
    let h = Harness::new(&[connector.clone()]);
    let mut rx = h.subscribe();
    let mut scheduler = SyncScheduler::new(h.orchestrator.clone(), JobSchedule::defaults());
    let now = Utc::now();

    // Every class covers projects; only the first trigger wins the lock.
    let report = scheduler.tick_once(now).await;
    assert_eq!(
        report,
        TickReport {
            triggered: 1,
            skipped: 2,
            failed: 0
        }
    );
    assert!(scheduler.schedules().iter().all(|s| s.next_run > Some(now)));

    connector.open();
    next_completed(&mut rx).await;

    assert_eq!(scheduler.tick_once(now).await, TickReport::default());
}
