//! Per-(system, kind) synchronization pipeline.
//!
//! Fetch pages through the resilient connector, then for every record:
//! map, resolve identity, create-and-bind or load-and-update, and diff
//! against the last snapshot. Record failures are recorded and skipped; a
//! page failure ends the run.

use chrono::Utc;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use sitesync_connector::classify::{Classification, ErrorCategory, ErrorClassifier, Severity};
use sitesync_connector::error::ConnectorError;
use sitesync_connector::ids::{Cursor, ExternalId};
use sitesync_connector::page::{RawRecord, RejectedRecord};
use sitesync_connector::traits::Connector;

use crate::entity::{FieldError, UnifiedEntity};
use crate::events::SyncEvent;
use crate::identity::{MappingKey, Resolution};
use crate::ids::UnifiedId;
use crate::mapper::{MappedRecord, MappingFailure};
use crate::run::{resolve_status, RunErrorEntry, RunStatus, SyncMode, SyncRun};
use crate::service::SyncService;
use crate::store::{CreateOutcome, StoreError, StoreResult};

/// What happened to one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Why one record was not synchronized.
#[derive(Debug, Error)]
pub enum RecordFailure {
    #[error(transparent)]
    Mapping(#[from] MappingFailure),

    /// Identity conflict; the record is skipped.
    #[error(transparent)]
    Conflict(StoreError),

    #[error(transparent)]
    Store(StoreError),

    /// The store's write breaker is open; the run must stop.
    #[error(transparent)]
    StoreUnavailable(ConnectorError),
}

impl From<StoreError> for RecordFailure {
    fn from(err: StoreError) -> Self {
        match err {
            err @ StoreError::BindConflict { .. } => RecordFailure::Conflict(err),
            err => RecordFailure::Store(err),
        }
    }
}

impl From<FieldError> for RecordFailure {
    fn from(err: FieldError) -> Self {
        RecordFailure::Mapping(MappingFailure::Field(err))
    }
}

impl RecordFailure {
    pub fn error_code(&self) -> &'static str {
        match self {
            RecordFailure::Mapping(e) => e.error_code(),
            RecordFailure::Conflict(e) | RecordFailure::Store(e) => e.error_code(),
            RecordFailure::StoreUnavailable(e) => e.error_code(),
        }
    }

    /// Category and severity for the run's error log.
    pub fn classification(&self) -> Classification {
        match self {
            RecordFailure::Mapping(_) => Classification::from_category(ErrorCategory::Validation),
            RecordFailure::Conflict(_) => {
                let mut c = Classification::from_category(ErrorCategory::Validation);
                c.severity = Severity::High;
                c
            }
            RecordFailure::Store(_) => Classification::from_category(ErrorCategory::Internal),
            RecordFailure::StoreUnavailable(e) => ErrorClassifier::new().classify(e),
        }
    }
}

/// Runs one (system, kind) job.
#[derive(Debug, Clone)]
pub struct EntitySynchronizer {
    service: Arc<SyncService>,
    classifier: ErrorClassifier,
}

impl EntitySynchronizer {
    pub fn new(service: Arc<SyncService>) -> Self {
        Self {
            service,
            classifier: ErrorClassifier::new(),
        }
    }

    /// Execute `run` to a terminal status.
    ///
    /// Never fails: every problem is recorded on the run.
    #[instrument(
        skip_all,
        fields(run_id = %run.id, system = %run.system, kind = %run.kind, mode = %run.mode)
    )]
    pub async fn run(&self, run: &mut SyncRun, cancel: &CancellationToken) {
        let connector = match self.service.connector_for(&run.system) {
            Ok(connector) => connector,
            Err(e) => {
                let classification = Classification::from_category(ErrorCategory::Internal);
                run.record_error(
                    RunErrorEntry::new(&classification, "SYSTEM_NOT_REGISTERED", e.to_string())
                        .for_page(1),
                );
                run.finish(resolve_status(&run.counters, true, false));
                return;
            }
        };

        let mut cursor = match self.start_cursor(run).await {
            Ok(cursor) => cursor,
            Err(e) => {
                let classification = Classification::from_category(ErrorCategory::Internal);
                run.record_error(
                    RunErrorEntry::new(&classification, e.error_code(), e.to_string()).for_page(1),
                );
                run.finish(resolve_status(&run.counters, true, false));
                return;
            }
        };
        run.cursor_start = cursor.clone();
        run.cursor_end = cursor.clone();

        let mut seen: HashSet<ExternalId> = HashSet::new();
        let mut aborted = false;
        let mut cancelled = false;
        let mut page_no: u32 = 0;

        'pages: loop {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            page_no += 1;

            let page = match connector.list_entities(run.kind, cursor.as_ref()).await {
                Ok(page) => page,
                Err(e) => {
                    self.record_page_failure(run, page_no, &e);
                    aborted = true;
                    break;
                }
            };
            debug!(page = page_no, records = page.len(), done = page.done, "Fetched page");

            for rejected in &page.rejected {
                run.counters.processed += 1;
                self.record_rejection(run, page_no, rejected);
            }

            for record in &page.records {
                if cancel.is_cancelled() {
                    cancelled = true;
                    break 'pages;
                }
                match self.process_record(run, record).await {
                    Ok(outcome) => {
                        run.counters.processed += 1;
                        match outcome {
                            RecordOutcome::Created => run.counters.created += 1,
                            RecordOutcome::Updated => run.counters.updated += 1,
                            RecordOutcome::Unchanged => run.counters.unchanged += 1,
                        }
                        seen.insert(record.external_id.clone());
                    }
                    Err(RecordFailure::StoreUnavailable(e)) => {
                        self.record_page_failure(run, page_no, &e);
                        aborted = true;
                        break 'pages;
                    }
                    Err(failure) => {
                        run.counters.processed += 1;
                        self.record_failure(run, record, failure).await;
                        seen.insert(record.external_id.clone());
                    }
                }
            }

            let next = page.next_cursor.clone();
            if next.is_some() {
                run.cursor_end = next.clone();
            }
            if page.done {
                break;
            }
            match next {
                Some(next) if Some(&next) != cursor.as_ref() => cursor = Some(next),
                _ => {
                    warn!(page = page_no, "Unfinished page without a new cursor; stopping");
                    break;
                }
            }
        }

        let status = resolve_status(&run.counters, aborted, cancelled);
        if status == RunStatus::Success && run.mode == SyncMode::Full {
            self.mark_stale(run, &seen).await;
        }
        run.finish(status);

        info!(
            status = %run.status,
            processed = run.counters.processed,
            created = run.counters.created,
            updated = run.counters.updated,
            unchanged = run.counters.unchanged,
            skipped = run.counters.skipped,
            failed = run.counters.failed,
            "Sync run finished"
        );
    }

    /// Incremental runs resume from the last successful run's end cursor.
    async fn start_cursor(&self, run: &SyncRun) -> StoreResult<Option<Cursor>> {
        if run.mode == SyncMode::Full {
            return Ok(None);
        }
        let last = self
            .service
            .stores()
            .runs
            .last_successful_run(&run.system, run.kind)
            .await?;
        Ok(last.and_then(|r| r.cursor_end))
    }

    fn record_page_failure(&self, run: &mut SyncRun, page_no: u32, error: &ConnectorError) {
        let classification = self.classifier.classify(error).for_page();
        if error.is_circuit_open() {
            self.service.metrics().record_circuit_rejection();
        }
        warn!(
            page = page_no,
            category = %classification.category,
            severity = %classification.severity,
            error = %error,
            "Page fetch failed; aborting run"
        );
        run.record_error(
            RunErrorEntry::new(&classification, error.error_code(), error.to_string()).for_page(page_no),
        );
    }

    fn record_rejection(&self, run: &mut SyncRun, page_no: u32, rejected: &RejectedRecord) {
        run.counters.failed += 1;
        let classification = Classification::from_category(ErrorCategory::Validation);
        warn!(
            page = page_no,
            position = rejected.position,
            reason = %rejected.reason,
            "Connector rejected record"
        );
        // Record-level, so it carries no page: a page tag would read as an abort.
        run.record_error(RunErrorEntry::new(
            &classification,
            "REJECTED_RECORD",
            format!("entry {} of page {page_no}: {}", rejected.position, rejected.reason),
        ));
    }

    async fn record_failure(&self, run: &mut SyncRun, record: &RawRecord, failure: RecordFailure) {
        let classification = failure.classification();
        match &failure {
            RecordFailure::Conflict(_) => {
                run.counters.skipped += 1;
                error!(
                    external_id = %record.external_id,
                    severity = %classification.severity,
                    code = failure.error_code(),
                    data_integrity = true,
                    error = %failure,
                    "Identity binding conflict; record skipped"
                );
            }
            _ => {
                run.counters.failed += 1;
                warn!(
                    external_id = %record.external_id,
                    category = %classification.category,
                    code = failure.error_code(),
                    error = %failure,
                    "Record failed"
                );
            }
        }

        let key = MappingKey::new(run.system.clone(), record.external_id.clone());
        if let Ok(Some(_)) = self.service.stores().entities.find_mapping(&key).await {
            if let Err(e) = self
                .service
                .stores()
                .entities
                .mark_mapping_failed(&key, &failure.to_string())
                .await
            {
                warn!(mapping = %key, error = %e, "Failed to record mapping failure");
            }
        }

        run.record_error(
            RunErrorEntry::new(&classification, failure.error_code(), failure.to_string())
                .for_record(record.external_id.clone()),
        );
    }

    async fn mark_stale(&self, run: &SyncRun, seen: &HashSet<ExternalId>) {
        match self
            .service
            .stores()
            .entities
            .mark_stale_except(&run.system, run.kind, seen)
            .await
        {
            Ok(0) => {}
            Ok(marked) => info!(marked, "Marked mappings not seen in full sync as stale"),
            Err(e) => warn!(error = %e, "Failed to mark stale mappings"),
        }
    }

    /// Synchronize one record.
    pub async fn process_record(
        &self,
        run: &SyncRun,
        record: &RawRecord,
    ) -> Result<RecordOutcome, RecordFailure> {
        let mapped = self
            .service
            .mapper()
            .map(&run.system, run.kind, record)?;
        let key = MappingKey::new(run.system.clone(), record.external_id.clone());
        let synced_at = Utc::now();

        let resolution = self
            .service
            .identity()
            .resolve(&run.system, &record.external_id)
            .await?;

        match resolution {
            Resolution::NotFound => {
                let mut entity = UnifiedEntity::new(mapped.fields.clone());
                entity.set_metadata(&run.system, mapped.metadata.clone());
                let stores = self.service.stores();
                let outcome = self
                    .guarded_write(|| stores.entities.create_bound(&entity, &key, synced_at))
                    .await?;

                match outcome {
                    CreateOutcome::Created(_) => {
                        debug!(external_id = %record.external_id, unified_id = %entity.id, "Created entity");
                        self.detect_changes(run, &entity).await?;
                        Ok(RecordOutcome::Created)
                    }
                    CreateOutcome::Linked(id) => {
                        info!(
                            external_id = %record.external_id,
                            unified_id = %id,
                            "Linked record to existing entity by correlation key"
                        );
                        self.apply_update(run, id, &key, mapped).await
                    }
                    CreateOutcome::AlreadyMapped(id) => self.apply_update(run, id, &key, mapped).await,
                }
            }
            Resolution::Found(id) => self.apply_update(run, id, &key, mapped).await,
        }
    }

    async fn apply_update(
        &self,
        run: &SyncRun,
        id: UnifiedId,
        key: &MappingKey,
        mapped: MappedRecord,
    ) -> Result<RecordOutcome, RecordFailure> {
        let stores = self.service.stores();
        let current = stores
            .entities
            .load(id)
            .await?
            .ok_or_else(|| StoreError::not_found("entity", id))?;

        let mut merged = current.clone();
        merged.fields.merge_from(&mapped.fields)?;
        for field in &mapped.cleared {
            merged.fields.clear(field)?;
        }
        merged.set_metadata(&run.system, mapped.metadata);
        let synced_at = Utc::now();

        let outcome = if merged.same_content(&current) {
            self.guarded_write(|| stores.entities.touch_mapping(key, synced_at))
                .await?;
            RecordOutcome::Unchanged
        } else {
            merged.updated_at = synced_at;
            self.guarded_write(|| stores.entities.update_bound(&merged, key, synced_at))
                .await?;
            RecordOutcome::Updated
        };

        self.detect_changes(run, &merged).await?;
        Ok(outcome)
    }

    /// Diff against the stored snapshot, record and publish the changes,
    /// then replace the snapshot.
    async fn detect_changes(&self, run: &SyncRun, entity: &UnifiedEntity) -> Result<(), RecordFailure> {
        let stores = self.service.stores();
        let previous = stores.snapshots.get_snapshot(entity.id, entity.kind).await?;
        let detection = self
            .service
            .detector()
            .detect(&run.system, run.id, entity, previous.as_ref());

        if detection.has_changes() {
            self.guarded_write(|| stores.changes.append_changes(&detection.changes))
                .await?;
            self.service
                .metrics()
                .record_changes(detection.changes.len() as u64);

            let min_priority = self.service.settings().notify_min_priority;
            for change in &detection.changes {
                debug!(
                    entity_id = %change.entity_id,
                    field = %change.field,
                    change_type = %change.change_type,
                    priority = %change.priority,
                    "Detected change"
                );
                if change.priority >= min_priority {
                    self.service.events().publish(SyncEvent::Change {
                        change: change.clone(),
                    });
                }
            }
        }

        if detection.snapshot_changed {
            self.guarded_write(|| stores.snapshots.put_snapshot(&detection.snapshot))
                .await?;
        }
        Ok(())
    }

    /// Run a store write through the `store:writes` breaker.
    ///
    /// Only backend failures count against the breaker; conflicts and
    /// missing rows are answers from a healthy store.
    async fn guarded_write<T, F, Fut>(&self, write: F) -> Result<T, RecordFailure>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let breaker = self.service.breakers().store_writes();
        let permit = breaker
            .try_acquire()
            .map_err(RecordFailure::StoreUnavailable)?;

        match write().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) if e.is_backend() => {
                permit.failure();
                Err(e.into())
            }
            Err(e) => {
                permit.release();
                Err(e.into())
            }
        }
    }
}
