//! Sync orchestration.
//!
//! The orchestrator accepts triggers, enforces one running job per
//! (system, kind), runs each job on its own task and, whatever the outcome,
//! persists the run, releases the run lock and emits the completion event.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, instrument, warn};

use sitesync_connector::classify::{Classification, ErrorCategory, Severity};
use sitesync_connector::ids::SystemId;
use sitesync_connector::resilience::CircuitBreaker;
use sitesync_connector::types::EntityKind;

use crate::change::ChangeRecord;
use crate::error::{SyncError, SyncResult};
use crate::events::{Alert, AlertKind, SyncEvent};
use crate::ids::RunId;
use crate::run::{JobKey, JobState, RunErrorEntry, RunStatus, SyncMode, SyncRun, TriggerSource};
use crate::service::SyncService;
use crate::synchronizer::EntitySynchronizer;

/// Maximum change records returned by [`SyncOrchestrator::get_recent_changes`].
pub const RECENT_CHANGES_LIMIT: usize = 1000;

/// Set of jobs currently holding their run lock.
#[derive(Debug, Default)]
struct RunLocks {
    held: Mutex<HashSet<JobKey>>,
}

impl RunLocks {
    fn try_acquire(self: &Arc<Self>, job: &JobKey) -> Option<RunLockGuard> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.insert(job.clone()) {
            return None;
        }
        Some(RunLockGuard {
            locks: Arc::clone(self),
            job: job.clone(),
        })
    }

    fn is_held(&self, job: &JobKey) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(job)
    }

    fn held(&self) -> Vec<JobKey> {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

/// Releases the run lock when dropped, on every exit path.
#[derive(Debug)]
struct RunLockGuard {
    locks: Arc<RunLocks>,
    job: JobKey,
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        self.locks
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.job);
    }
}

#[derive(Debug)]
struct Inner {
    service: Arc<SyncService>,
    synchronizer: EntitySynchronizer,
    locks: Arc<RunLocks>,
    active: Mutex<HashMap<RunId, CancellationToken>>,
    job_states: Mutex<HashMap<JobKey, JobState>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// Accepts sync triggers and supervises running jobs.
///
/// Cheap to clone; clones share the same locks and tasks.
#[derive(Debug, Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl SyncOrchestrator {
    pub fn new(service: Arc<SyncService>) -> Self {
        Self {
            inner: Arc::new(Inner {
                synchronizer: EntitySynchronizer::new(Arc::clone(&service)),
                service,
                locks: Arc::new(RunLocks::default()),
                active: Mutex::new(HashMap::new()),
                job_states: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn service(&self) -> &Arc<SyncService> {
        &self.inner.service
    }

    /// Start a manual run of `kind` against `system`.
    ///
    /// Returns the accepted run in `running` state; the run completes in
    /// the background. Fails with [`SyncError::AlreadyRunning`] if the same
    /// job is in progress.
    pub async fn trigger_sync(
        &self,
        system: &SystemId,
        kind: EntityKind,
        mode: SyncMode,
    ) -> SyncResult<SyncRun> {
        self.trigger_with(system, kind, mode, TriggerSource::Manual)
            .await
    }

    /// Like [`trigger_sync`](Self::trigger_sync) with an explicit trigger
    /// source.
    pub async fn trigger_with(
        &self,
        system: &SystemId,
        kind: EntityKind,
        mode: SyncMode,
        trigger: TriggerSource,
    ) -> SyncResult<SyncRun> {
        let (run, _) = self.start(system, kind, mode, trigger).await?;
        Ok(run)
    }

    /// Trigger a run and wait for it to reach a terminal status.
    pub async fn run_to_completion(
        &self,
        system: &SystemId,
        kind: EntityKind,
        mode: SyncMode,
    ) -> SyncResult<SyncRun> {
        let (_, handle) = self
            .start(system, kind, mode, TriggerSource::Manual)
            .await?;
        handle
            .await
            .map_err(|e| SyncError::internal(format!("run supervisor failed: {e}")))
    }

    #[instrument(skip_all, fields(system = %system, kind = %kind, mode = %mode))]
    async fn start(
        &self,
        system: &SystemId,
        kind: EntityKind,
        mode: SyncMode,
        trigger: TriggerSource,
    ) -> SyncResult<(SyncRun, JoinHandle<SyncRun>)> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(SyncError::ShuttingDown);
        }
        if inner.service.registry().get(system).is_err() {
            return Err(SyncError::SystemNotRegistered(system.clone()));
        }
        if inner.service.mapper().tables().get(system, kind).is_none() {
            return Err(SyncError::KindNotMapped {
                system: system.clone(),
                kind,
            });
        }

        let job = JobKey::new(system.clone(), kind);
        let guard = inner
            .locks
            .try_acquire(&job)
            .ok_or_else(|| SyncError::AlreadyRunning { job: job.clone() })?;

        let run = SyncRun::new(&job, mode, trigger);
        // The guard drops with this frame if the insert fails.
        inner.service.stores().runs.insert_run(&run).await?;

        inner.service.metrics().record_run_started();
        self.set_job_state(&job, JobState::Running);
        let token = inner.shutdown.child_token();
        inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run.id, token.clone());

        info!(run_id = %run.id, trigger = %trigger, "Sync run accepted");

        let handle = inner
            .tasks
            .spawn(supervise(Arc::clone(inner), run.clone(), token, guard));
        Ok((run, handle))
    }

    /// Current record of a run.
    pub async fn get_run_status(&self, run_id: RunId) -> SyncResult<SyncRun> {
        self.inner
            .service
            .stores()
            .runs
            .get_run(run_id)
            .await?
            .ok_or(SyncError::RunNotFound(run_id))
    }

    /// Change records detected at or after `since`, oldest first.
    pub async fn get_recent_changes(&self, since: DateTime<Utc>) -> SyncResult<Vec<ChangeRecord>> {
        Ok(self
            .inner
            .service
            .stores()
            .changes
            .changes_since(since, RECENT_CHANGES_LIMIT)
            .await?)
    }

    /// Request cancellation of a running run.
    ///
    /// The in-flight record finishes; the run ends `cancelled`. Cancelling
    /// a run that already finished is a no-op.
    pub async fn cancel(&self, run_id: RunId) -> SyncResult<()> {
        let token = self
            .inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&run_id)
            .cloned();
        match token {
            Some(token) => {
                info!(run_id = %run_id, "Cancellation requested");
                token.cancel();
                Ok(())
            }
            None => self.get_run_status(run_id).await.map(|_| ()),
        }
    }

    /// State of the (system, kind) job.
    pub fn job_state(&self, system: &SystemId, kind: EntityKind) -> JobState {
        let job = JobKey::new(system.clone(), kind);
        if self.inner.locks.is_held(&job) {
            return JobState::Running;
        }
        self.inner
            .job_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job)
            .copied()
            .unwrap_or(JobState::Idle)
    }

    pub fn is_running(&self, system: &SystemId, kind: EntityKind) -> bool {
        self.inner
            .locks
            .is_held(&JobKey::new(system.clone(), kind))
    }

    /// Jobs currently holding their run lock.
    pub fn running_jobs(&self) -> Vec<JobKey> {
        let mut jobs = self.inner.locks.held();
        jobs.sort();
        jobs
    }

    /// Stop accepting triggers, cancel every running job and wait for the
    /// supervisors to persist their runs.
    pub async fn shutdown(&self) {
        info!(running = self.running_jobs().len(), "Shutting down orchestrator");
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        info!("Orchestrator stopped");
    }

    fn set_job_state(&self, job: &JobKey, state: JobState) {
        self.inner
            .job_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job.clone(), state);
    }
}

/// Drive one run on a worker task and finish its bookkeeping.
async fn supervise(
    inner: Arc<Inner>,
    run: SyncRun,
    token: CancellationToken,
    guard: RunLockGuard,
) -> SyncRun {
    let breakers = inner.service.breakers();
    let watched: Vec<(Arc<CircuitBreaker>, u32)> =
        [breakers.connector(&run.system), breakers.store_writes()]
            .into_iter()
            .map(|breaker| {
                let opened = breaker.opened_since_close();
                (breaker, opened)
            })
            .collect();

    let synchronizer = inner.synchronizer.clone();
    let worker_token = token.clone();
    let mut worker_run = run.clone();
    let worker = tokio::spawn(async move {
        synchronizer.run(&mut worker_run, &worker_token).await;
        worker_run
    });

    let mut finished = match worker.await {
        Ok(finished) => finished,
        Err(e) => {
            error!(run_id = %run.id, error = %e, "Sync worker panicked");
            let mut failed = run;
            let classification = Classification::from_category(ErrorCategory::Internal);
            failed.record_error(RunErrorEntry::new(
                &classification,
                "WORKER_PANIC",
                e.to_string(),
            ));
            failed
        }
    };
    if !finished.status.is_terminal() {
        finished.finish(RunStatus::Failed);
    }

    if let Err(e) = inner.service.stores().runs.update_run(&finished).await {
        error!(run_id = %finished.id, error = %e, "Failed to persist finished run");
    }
    inner.service.metrics().record_run_finished(&finished);

    let job = finished.job();
    inner
        .job_states
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(job.clone(), finished.status.into());
    inner
        .active
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&finished.id);
    drop(guard);

    for (breaker, opened_before) in &watched {
        report_breaker(&inner, breaker, *opened_before, &finished);
    }
    raise_critical_alert(&inner, &finished);

    info!(
        run_id = %finished.id,
        job = %job,
        status = %finished.status,
        duration_ms = finished.duration_ms().unwrap_or_default(),
        "Sync run completed"
    );
    inner.service.events().publish(SyncEvent::RunCompleted {
        run: finished.clone(),
    });
    finished
}

fn report_breaker(inner: &Inner, breaker: &CircuitBreaker, opened_before: u32, run: &SyncRun) {
    let opened = breaker.opened_since_close();
    if opened <= opened_before {
        return;
    }

    warn!(
        dependency = breaker.dependency(),
        consecutive_failures = breaker.consecutive_failures(),
        opened_since_close = opened,
        "Circuit breaker opened"
    );
    inner.service.events().publish(SyncEvent::CircuitOpened {
        dependency: breaker.dependency().to_string(),
        consecutive_failures: breaker.consecutive_failures(),
    });

    let threshold = inner.service.settings().alert_open_circuit_threshold;
    if opened >= threshold {
        let alert = Alert::new(
            AlertKind::CircuitRepeatedlyOpen,
            Severity::High,
            format!(
                "circuit for {} opened {opened} times without closing",
                breaker.dependency()
            ),
        )
        .with_system(run.system.clone())
        .with_run(run.id);
        publish_alert(inner, alert);
    }
}

fn raise_critical_alert(inner: &Inner, run: &SyncRun) {
    let Some(critical) = run
        .errors
        .iter()
        .find(|e| e.severity == Severity::Critical)
    else {
        return;
    };

    let alert = Alert::new(
        AlertKind::CriticalError,
        Severity::Critical,
        format!("{} ({}): {}", critical.code, critical.category, critical.message),
    )
    .with_system(run.system.clone())
    .with_run(run.id);
    publish_alert(inner, alert);
}

fn publish_alert(inner: &Inner, alert: Alert) {
    error!(
        kind = ?alert.kind,
        severity = %alert.severity,
        message = %alert.message,
        "Raising alert"
    );
    inner.service.metrics().record_alert();
    inner.service.events().publish(SyncEvent::Alert { alert });
}
