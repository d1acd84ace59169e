//! Process-wide sync counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::run::{RunStatus, SyncRun};

/// Thread-safe counters updated as runs progress.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    runs_started: AtomicU64,
    runs_succeeded: AtomicU64,
    runs_partial: AtomicU64,
    runs_failed: AtomicU64,
    runs_cancelled: AtomicU64,
    records_created: AtomicU64,
    records_updated: AtomicU64,
    records_unchanged: AtomicU64,
    records_skipped: AtomicU64,
    records_failed: AtomicU64,
    changes_emitted: AtomicU64,
    alerts_raised: AtomicU64,
    circuit_rejections: AtomicU64,
}

/// Point-in-time copy of [`SyncMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub runs_started: u64,
    pub runs_succeeded: u64,
    pub runs_partial: u64,
    pub runs_failed: u64,
    pub runs_cancelled: u64,
    pub records_created: u64,
    pub records_updated: u64,
    pub records_unchanged: u64,
    pub records_skipped: u64,
    pub records_failed: u64,
    pub changes_emitted: u64,
    pub alerts_raised: u64,
    pub circuit_rejections: u64,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_run_started(&self) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold a finished run into the totals.
    pub fn record_run_finished(&self, run: &SyncRun) {
        let outcome = match run.status {
            RunStatus::Success => &self.runs_succeeded,
            RunStatus::Partial => &self.runs_partial,
            RunStatus::Failed => &self.runs_failed,
            RunStatus::Cancelled => &self.runs_cancelled,
            RunStatus::Running => return,
        };
        outcome.fetch_add(1, Ordering::Relaxed);

        let c = &run.counters;
        self.records_created.fetch_add(c.created, Ordering::Relaxed);
        self.records_updated.fetch_add(c.updated, Ordering::Relaxed);
        self.records_unchanged.fetch_add(c.unchanged, Ordering::Relaxed);
        self.records_skipped.fetch_add(c.skipped, Ordering::Relaxed);
        self.records_failed.fetch_add(c.failed, Ordering::Relaxed);
    }

    pub fn record_changes(&self, count: u64) {
        self.changes_emitted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_alert(&self) {
        self.alerts_raised.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_circuit_rejection(&self) {
        self.circuit_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            runs_started: self.runs_started.load(Ordering::Relaxed),
            runs_succeeded: self.runs_succeeded.load(Ordering::Relaxed),
            runs_partial: self.runs_partial.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            runs_cancelled: self.runs_cancelled.load(Ordering::Relaxed),
            records_created: self.records_created.load(Ordering::Relaxed),
            records_updated: self.records_updated.load(Ordering::Relaxed),
            records_unchanged: self.records_unchanged.load(Ordering::Relaxed),
            records_skipped: self.records_skipped.load(Ordering::Relaxed),
            records_failed: self.records_failed.load(Ordering::Relaxed),
            changes_emitted: self.changes_emitted.load(Ordering::Relaxed),
            alerts_raised: self.alerts_raised.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{JobKey, SyncMode, TriggerSource};
    use sitesync_connector::types::EntityKind;

    #[test]
    fn test_run_totals() {
        let metrics = SyncMetrics::new();
        let mut run = SyncRun::new(
            &JobKey::new("procore", EntityKind::Rfi),
            SyncMode::Incremental,
            TriggerSource::Scheduled,
        );
        run.counters.created = 3;
        run.counters.failed = 1;
        run.finish(RunStatus::Partial);

        metrics.record_run_started();
        metrics.record_run_finished(&run);
        metrics.record_changes(2);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.runs_started, 1);
        assert_eq!(snapshot.runs_partial, 1);
        assert_eq!(snapshot.records_created, 3);
        assert_eq!(snapshot.records_failed, 1);
        assert_eq!(snapshot.changes_emitted, 2);
    }
}
