//! Periodic sync triggers.
//!
//! Three job classes run on fixed frequencies: critical projects hourly,
//! the full catalog daily and a full re-sync weekly. The scheduler ticks,
//! triggers every due job for every registered system that maps the job's
//! kinds, and leaves jobs that are still running alone.

use chrono::{DateTime, Datelike, Duration, NaiveTime, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use sitesync_connector::types::{EntityKind, ParseEnumError};

use crate::orchestrator::SyncOrchestrator;
use crate::run::{SyncMode, TriggerSource};

/// How often a job class runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleFrequency {
    /// At the top of every hour.
    Hourly,
    /// Once a day at the schedule's hour.
    Daily,
    /// Once a week on the schedule's day and hour.
    Weekly,
    /// Every N seconds from the previous run.
    Every(u64),
}

impl fmt::Display for ScheduleFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hourly => write!(f, "hourly"),
            Self::Daily => write!(f, "daily"),
            Self::Weekly => write!(f, "weekly"),
            Self::Every(secs) => write!(f, "every {secs}s"),
        }
    }
}

impl FromStr for ScheduleFrequency {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        match lower.as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            other => other
                .strip_prefix("every ")
                .map(|rest| rest.trim_end_matches('s'))
                .and_then(|secs| secs.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Self::Every)
                .ok_or_else(|| ParseEnumError::new("schedule frequency", s)),
        }
    }
}

/// Named group of jobs sharing a frequency and mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobClass {
    Critical,
    Catalog,
    FullResync,
}

impl JobClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobClass::Critical => "critical",
            JobClass::Catalog => "catalog",
            JobClass::FullResync => "full_resync",
        }
    }
}

impl fmt::Display for JobClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One periodic job class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSchedule {
    pub class: JobClass,
    pub frequency: ScheduleFrequency,
    pub mode: SyncMode,
    pub kinds: Vec<EntityKind>,
    /// Hour of day (0-23 UTC) for daily and weekly runs.
    pub hour_of_day: u8,
    /// Day of week for weekly runs.
    pub day_of_week: Weekday,
    pub enabled: bool,
    /// `None` until the first tick; a schedule with no next run is due.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
}

impl JobSchedule {
    pub fn new(
        class: JobClass,
        frequency: ScheduleFrequency,
        mode: SyncMode,
        kinds: Vec<EntityKind>,
    ) -> Self {
        Self {
            class,
            frequency,
            mode,
            kinds,
            hour_of_day: 2,
            day_of_week: Weekday::Sun,
            enabled: true,
            next_run: None,
        }
    }

    /// Projects, incrementally, every hour.
    pub fn critical() -> Self {
        Self::new(
            JobClass::Critical,
            ScheduleFrequency::Hourly,
            SyncMode::Incremental,
            vec![EntityKind::Project],
        )
    }

    /// Every kind, incrementally, once a day.
    pub fn catalog() -> Self {
        Self::new(
            JobClass::Catalog,
            ScheduleFrequency::Daily,
            SyncMode::Incremental,
            EntityKind::ALL.to_vec(),
        )
    }

    /// Every kind, in full, once a week.
    pub fn full_resync() -> Self {
        Self::new(
            JobClass::FullResync,
            ScheduleFrequency::Weekly,
            SyncMode::Full,
            EntityKind::ALL.to_vec(),
        )
        .with_hour(3)
    }

    pub fn defaults() -> Vec<Self> {
        vec![Self::critical(), Self::catalog(), Self::full_resync()]
    }

    #[must_use]
    pub fn with_hour(mut self, hour: u8) -> Self {
        self.hour_of_day = hour.min(23);
        self
    }

    #[must_use]
    pub fn with_day_of_week(mut self, day: Weekday) -> Self {
        self.day_of_week = day;
        self
    }

    #[must_use]
    pub fn with_frequency(mut self, frequency: ScheduleFrequency) -> Self {
        self.frequency = frequency;
        self
    }

    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run.map_or(true, |next| now >= next)
    }

    /// First run strictly after `from`.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let target_time = NaiveTime::from_hms_opt(u32::from(self.hour_of_day), 0, 0)?;

        match self.frequency {
            ScheduleFrequency::Hourly => {
                let next = from + Duration::hours(1);
                Some(
                    next.date_naive()
                        .and_time(NaiveTime::from_hms_opt(next.hour(), 0, 0)?)
                        .and_utc(),
                )
            }
            ScheduleFrequency::Daily => Some(next_daily(from, target_time)),
            ScheduleFrequency::Weekly => Some(next_weekly(from, target_time, self.day_of_week)),
            ScheduleFrequency::Every(secs) => {
                Some(from + Duration::seconds(i64::try_from(secs).ok()?))
            }
        }
    }
}

fn next_daily(from: DateTime<Utc>, target_time: NaiveTime) -> DateTime<Utc> {
    let today_target = from.date_naive().and_time(target_time).and_utc();
    if from < today_target {
        today_target
    } else {
        (from.date_naive() + Duration::days(1))
            .and_time(target_time)
            .and_utc()
    }
}

fn next_weekly(from: DateTime<Utc>, target_time: NaiveTime, day: Weekday) -> DateTime<Utc> {
    let days_until = (i64::from(day.num_days_from_sunday())
        - i64::from(from.weekday().num_days_from_sunday())
        + 7)
        % 7;

    let target = (from.date_naive() + Duration::days(days_until))
        .and_time(target_time)
        .and_utc();
    if from >= target {
        target + Duration::days(7)
    } else {
        target
    }
}

/// What one scheduler tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub triggered: usize,
    /// Jobs skipped because a run was still in progress.
    pub skipped: usize,
    pub failed: usize,
}

/// Triggers [`JobSchedule`]s through a [`SyncOrchestrator`].
#[derive(Debug)]
pub struct SyncScheduler {
    orchestrator: SyncOrchestrator,
    schedules: Vec<JobSchedule>,
    tick: std::time::Duration,
}

impl SyncScheduler {
    pub fn new(orchestrator: SyncOrchestrator, schedules: Vec<JobSchedule>) -> Self {
        Self {
            orchestrator,
            schedules,
            tick: std::time::Duration::from_secs(30),
        }
    }

    #[must_use]
    pub fn with_tick(mut self, tick: std::time::Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn schedules(&self) -> &[JobSchedule] {
        &self.schedules
    }

    /// Tick until `cancel` fires.
    #[instrument(skip_all, fields(schedules = self.schedules.len()))]
    pub async fn run(&mut self, cancel: CancellationToken) {
        info!(tick_secs = self.tick.as_secs(), "Starting sync scheduler");
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("Scheduler shutdown requested");
                    break;
                }
                _ = interval.tick() => {
                    let report = self.tick_once(Utc::now()).await;
                    if report != TickReport::default() {
                        debug!(
                            triggered = report.triggered,
                            skipped = report.skipped,
                            failed = report.failed,
                            "Scheduler tick"
                        );
                    }
                }
            }
        }
        info!("Sync scheduler stopped");
    }

    /// Trigger every schedule due at `now` and advance its next run.
    pub async fn tick_once(&mut self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let service = self.orchestrator.service().clone();
        let systems = service.registry().systems();

        for schedule in self.schedules.iter_mut().filter(|s| s.is_due(now)) {
            for system in &systems {
                let mapped = service.mapper().tables().kinds_for(system);
                for kind in schedule.kinds.iter().filter(|k| mapped.contains(*k)) {
                    match self
                        .orchestrator
                        .trigger_with(system, *kind, schedule.mode, TriggerSource::Scheduled)
                        .await
                    {
                        Ok(run) => {
                            debug!(
                                class = %schedule.class,
                                run_id = %run.id,
                                system = %system,
                                kind = %kind,
                                "Triggered scheduled run"
                            );
                            report.triggered += 1;
                        }
                        Err(e) if e.is_already_running() => {
                            debug!(
                                class = %schedule.class,
                                system = %system,
                                kind = %kind,
                                "Job still running; skipping"
                            );
                            report.skipped += 1;
                        }
                        Err(e) => {
                            warn!(
                                class = %schedule.class,
                                system = %system,
                                kind = %kind,
                                error = %e,
                                "Failed to trigger scheduled run"
                            );
                            report.failed += 1;
                        }
                    }
                }
            }
            schedule.next_run = schedule.next_after(now);
            if let Some(next) = schedule.next_run {
                debug!(class = %schedule.class, next_run = %next, "Schedule advanced");
            }
        }
        report
    }
}
