//! SiteSync worker.
//!
//! Connects the Postgres store, builds REST connectors from the systems file
//! and runs the sync scheduler until interrupted.

mod bootstrap;
mod config;
mod error;
mod logging;

use std::sync::Arc;

use tokio::signal;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sitesync_db::{run_migrations, DbPool, PgStore};
use sitesync_engine::config::SyncSettings;
use sitesync_engine::events::{BroadcastEventSink, SyncEvent};
use sitesync_engine::orchestrator::SyncOrchestrator;
use sitesync_engine::schedule::{JobSchedule, SyncScheduler};
use sitesync_engine::service::SyncService;
use sitesync_engine::store::Stores;

use config::WorkerConfig;
use error::WorkerError;

/// Runs consulted when rebuilding breaker state at startup.
const BREAKER_HISTORY_RUNS: usize = 200;

#[tokio::main]
async fn main() {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let config = WorkerConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Configuration error: {e}");
        std::process::exit(1);
    });

    logging::init_logging(&config.log_filter);

    if let Err(e) = run(config).await {
        error!(error = %e, "Worker stopped");
        std::process::exit(1);
    }
}

async fn run(config: WorkerConfig) -> Result<(), WorkerError> {
    let settings = SyncSettings::from_env()?;

    let pool = DbPool::connect_with(&config.database_url, config.db_max_connections).await?;
    run_migrations(&pool).await?;

    let registry = bootstrap::build_registry(&bootstrap::read_config_file(&config.systems_path)?)?;
    let tables = bootstrap::load_tables(&bootstrap::read_config_file(&config.mappings_path)?)?;
    for system in bootstrap::unmapped_systems(&registry, &tables) {
        warn!(system = %system, "Connector has no field mappings and will not sync");
    }

    let events = BroadcastEventSink::default();
    let service = SyncService::builder(
        Arc::new(registry),
        Stores::from_backend(Arc::new(PgStore::new(pool.clone()))),
        tables,
    )
    .settings(settings)
    .event_sink(Arc::new(events.clone()))
    .build()?;

    let history = service.stores().runs.recent_runs(BREAKER_HISTORY_RUNS).await?;
    for dependency in service.breakers().rebuild_from_history(&history) {
        warn!(dependency = %dependency, "Circuit reopened from run history");
    }

    let orchestrator = SyncOrchestrator::new(Arc::new(service));
    let cancel = CancellationToken::new();
    // Outlives `cancel` so completions of runs stopped at shutdown are logged.
    let events_done = CancellationToken::new();

    let event_task = tokio::spawn(log_events(events.subscribe(), events_done.clone()));

    let mut scheduler = SyncScheduler::new(orchestrator.clone(), JobSchedule::defaults())
        .with_tick(config.scheduler_tick());
    let scheduler_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { scheduler.run(cancel).await }
    });

    info!("Worker started");
    shutdown_signal().await;
    info!("Shutdown requested, cancelling active runs");

    cancel.cancel();
    if let Err(e) = scheduler_task.await {
        error!(error = %e, "Scheduler task failed");
    }
    orchestrator.shutdown().await;
    events_done.cancel();
    if let Ok(logged) = event_task.await {
        info!(events = logged, "Event log closed");
    }

    let metrics = orchestrator.service().metrics().snapshot();
    info!(?metrics, "Worker stopped");
    pool.close().await;
    Ok(())
}

/// Write every engine event to the log until cancelled, then drain what is
/// already buffered. Returns the number of events logged.
async fn log_events(mut rx: broadcast::Receiver<SyncEvent>, done: CancellationToken) -> u64 {
    let mut logged = 0;
    loop {
        let event = tokio::select! {
            () = done.cancelled() => break,
            event = rx.recv() => event,
        };
        match event {
            Ok(event) => {
                log_event(event);
                logged += 1;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event log fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => return logged,
        }
    }

    while let Ok(event) = rx.try_recv() {
        log_event(event);
        logged += 1;
    }
    logged
}

fn log_event(event: SyncEvent) {
    match event {
        SyncEvent::Change { change } => info!(
            entity_id = %change.entity_id,
            system = %change.system,
            field = %change.field,
            change_type = %change.change_type,
            priority = %change.priority,
            approval_required = change.approval_required,
            "Change detected"
        ),
        SyncEvent::RunCompleted { run } => info!(
            run_id = %run.id,
            system = %run.system,
            kind = %run.kind,
            status = %run.status,
            processed = run.counters.processed,
            failed = run.counters.failed,
            "Run completed"
        ),
        SyncEvent::CircuitOpened {
            dependency,
            consecutive_failures,
        } => warn!(dependency = %dependency, consecutive_failures, "Circuit opened"),
        SyncEvent::Alert { alert } => error!(
            kind = ?alert.kind,
            severity = %alert.severity,
            system = ?alert.system,
            message = %alert.message,
            "Alert raised"
        ),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
