//! Circuit breakers per logical dependency.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{info, warn};

use sitesync_connector::classify::ErrorCategory;
use sitesync_connector::ids::SystemId;
use sitesync_connector::resilience::{CircuitBreaker, CircuitBreakerConfig};
use sitesync_connector::types::CircuitState;

use crate::run::{RunStatus, SyncRun};

/// Dependency name of the unified store's write path.
pub const STORE_WRITES: &str = "store:writes";

/// Dependency name of a connector.
pub fn connector_dependency(system: &SystemId) -> String {
    format!("connector:{system}")
}

/// Holds one breaker per dependency, created on first use.
#[derive(Debug)]
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Breaker guarding a connector.
    pub fn connector(&self, system: &SystemId) -> Arc<CircuitBreaker> {
        self.get_or_create(&connector_dependency(system))
    }

    /// Breaker guarding store writes.
    pub fn store_writes(&self) -> Arc<CircuitBreaker> {
        self.get_or_create(STORE_WRITES)
    }

    pub fn get(&self, dependency: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(dependency)
            .cloned()
    }

    /// Current state of every known breaker, by dependency name.
    pub fn states(&self) -> BTreeMap<String, CircuitState> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.state()))
            .collect()
    }

    fn get_or_create(&self, dependency: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.get(dependency) {
            return breaker;
        }
        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(dependency.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(dependency, self.config.clone())))
            .clone()
    }

    /// Reopen connector breakers whose recent history is a streak of
    /// page-level failures.
    ///
    /// Breaker state lives in memory. After a restart, when the latest
    /// `failure_threshold` or more runs of a system all aborted on a
    /// dependency failure, its breaker starts open with the recovery clock
    /// running from the newest of those runs. Returns the reopened
    /// dependencies.
    pub fn rebuild_from_history(&self, runs: &[SyncRun]) -> Vec<String> {
        let mut by_system: HashMap<&SystemId, Vec<&SyncRun>> = HashMap::new();
        for run in runs.iter().filter(|r| r.status.is_terminal()) {
            by_system.entry(&run.system).or_default().push(run);
        }

        let mut reopened = Vec::new();
        for (system, mut history) in by_system {
            history.sort_by(|a, b| b.started_at.cmp(&a.started_at));
            let streak = history
                .iter()
                .take_while(|run| ended_on_dependency_failure(run))
                .count();
            let streak = u32::try_from(streak).unwrap_or(u32::MAX);
            if streak < self.config.failure_threshold {
                continue;
            }

            let last = history[0];
            let last_failure_at = last.ended_at.unwrap_or(last.started_at);
            let since = (Utc::now() - last_failure_at)
                .to_std()
                .unwrap_or(Duration::ZERO);

            let dependency = connector_dependency(system);
            let breaker =
                CircuitBreaker::restore_open(&dependency, self.config.clone(), streak, since);
            warn!(
                dependency = %dependency,
                failed_runs = streak,
                since_last_failure_secs = since.as_secs(),
                "Restored open circuit breaker from run history"
            );
            self.breakers
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(dependency.clone(), Arc::new(breaker));
            reopened.push(dependency);
        }

        if reopened.is_empty() {
            info!("No circuit breakers restored from run history");
        }
        reopened.sort();
        reopened
    }
}

fn ended_on_dependency_failure(run: &SyncRun) -> bool {
    matches!(run.status, RunStatus::Failed | RunStatus::Partial)
        && run
            .errors
            .iter()
            .any(|e| e.is_page_level() && e.category != ErrorCategory::Validation)
}
