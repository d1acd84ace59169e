//! Resilience patterns for connector calls.
//!
//! Provides a circuit breaker per dependency and a retry executor with
//! exponential backoff and jitter. [`ResilientConnector`] composes both around
//! any [`Connector`].

use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::classify::ErrorClassifier;
use crate::error::{ConnectorError, ConnectorResult};
use crate::ids::{Cursor, SystemId};
use crate::page::Page;
use crate::traits::{BoxedConnector, Connector};
use crate::types::{CircuitState, EntityKind, HealthStatus};

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive counted failures before the circuit opens.
    pub failure_threshold: u32,
    /// Time since the last failure before a trial call is admitted.
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
    opened_since_close: u32,
}

/// Circuit breaker guarding one logical dependency.
///
/// All transitions happen under a single mutex, once per call outcome.
#[derive(Debug)]
pub struct CircuitBreaker {
    dependency: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    classifier: ErrorClassifier,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(dependency: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            dependency: dependency.into(),
            config,
            inner: Mutex::new(BreakerInner::default()),
            classifier: ErrorClassifier::new(),
        }
    }

    #[must_use]
    pub fn with_defaults(dependency: impl Into<String>) -> Self {
        Self::new(dependency, CircuitBreakerConfig::default())
    }

    /// Rebuild an open breaker from persisted history.
    ///
    /// `since_last_failure` is how long ago the most recent failure happened.
    #[must_use]
    pub fn restore_open(
        dependency: impl Into<String>,
        config: CircuitBreakerConfig,
        consecutive_failures: u32,
        since_last_failure: Duration,
    ) -> Self {
        let breaker = Self::new(dependency, config);
        {
            let mut inner = breaker.lock();
            inner.state = CircuitState::Open;
            inner.consecutive_failures = consecutive_failures;
            inner.last_failure = Some(
                Instant::now()
                    .checked_sub(since_last_failure)
                    .unwrap_or_else(Instant::now),
            );
            inner.opened_since_close = 1;
        }
        breaker
    }

    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. An open circuit whose recovery timeout has elapsed
    /// reports `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// How many times the circuit opened since it was last closed by a
    /// successful call.
    pub fn opened_since_close(&self) -> u32 {
        self.lock().opened_since_close
    }

    /// Ask permission to call the dependency.
    ///
    /// In `HalfOpen` only one permit is handed out until it is settled.
    pub fn try_acquire(&self) -> ConnectorResult<CallPermit<'_>> {
        let mut inner = self.lock();
        self.refresh(&mut inner);

        match inner.state {
            CircuitState::Closed => Ok(CallPermit::new(self, false)),
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                debug!(dependency = %self.dependency, "Admitting half-open trial call");
                Ok(CallPermit::new(self, true))
            }
            CircuitState::HalfOpen | CircuitState::Open => Err(ConnectorError::CircuitOpen {
                dependency: self.dependency.clone(),
            }),
        }
    }

    /// Execute an operation with circuit breaker protection.
    ///
    /// Rejected calls return `CircuitOpen` without invoking `operation`.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> ConnectorResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ConnectorResult<T>>,
    {
        let permit = self.try_acquire()?;

        match operation().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                if self.classifier.counts_toward_breaker(&e) {
                    permit.failure();
                } else {
                    permit.release();
                }
                Err(e)
            }
        }
    }

    /// Record a success outside of [`execute`](Self::execute).
    pub fn record_success(&self) {
        self.on_success(false);
    }

    /// Record a failure outside of [`execute`](Self::execute).
    pub fn record_failure(&self) {
        self.on_failure(false);
    }

    /// Force the circuit closed.
    pub fn reset(&self) {
        let mut inner = self.lock();
        *inner = BreakerInner::default();
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let elapsed = inner
            .last_failure
            .map_or(self.config.recovery_timeout, |at| at.elapsed());
        if elapsed >= self.config.recovery_timeout {
            debug!(dependency = %self.dependency, "Circuit breaker transitioning to HALF_OPEN");
            inner.state = CircuitState::HalfOpen;
            inner.trial_in_flight = false;
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();
        if trial {
            inner.trial_in_flight = false;
        }
        if inner.state != CircuitState::Closed {
            info!(dependency = %self.dependency, "Circuit breaker transitioning to CLOSED");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_since_close = 0;
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.lock();
        if trial {
            inner.trial_in_flight = false;
        }
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(Instant::now());

        let open = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            CircuitState::Open => false,
        };
        if open {
            warn!(
                dependency = %self.dependency,
                failures = inner.consecutive_failures,
                "Circuit breaker transitioning to OPEN"
            );
            inner.state = CircuitState::Open;
            inner.opened_since_close += 1;
        }
    }

    fn release_trial(&self) {
        self.lock().trial_in_flight = false;
    }
}

/// Admission ticket for one guarded call.
///
/// Settle it with [`success`](Self::success) or [`failure`](Self::failure).
/// Dropping an unsettled half-open trial frees the slot for the next caller.
#[derive(Debug)]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }

    /// Settle without affecting failure accounting.
    pub fn release(self) {}
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial();
        }
    }
}

/// Retry policy: bounded attempts with capped exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total invocations allowed, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Multiply each delay by a random factor in `[0.5, 1.5)`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Un-jittered delay after the failure of attempt `attempt` (0-indexed).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(hint) = retry_after {
            return hint.min(self.max_delay);
        }
        let delay = self.backoff_delay(attempt);
        if self.jitter {
            delay.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
        } else {
            delay
        }
    }
}

/// Retry executor driven by the error classifier.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    classifier: ErrorClassifier,
}

impl RetryExecutor {
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            classifier: ErrorClassifier::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute an operation, retrying retryable failures.
    ///
    /// Non-retryable failures and the last failure are returned unchanged.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> ConnectorResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ConnectorResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => match self.backoff_after(attempt, &e) {
                    Some(delay) => {
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => return Err(e),
                },
            }
        }
    }

    /// Execute with retries where every attempt passes through `breaker`.
    ///
    /// A `CircuitOpen` rejection ends the loop immediately. When the circuit
    /// opened on this call's own failures, the failure that tripped it is
    /// returned instead of the rejection.
    pub async fn execute_with_circuit_breaker<F, Fut, T>(
        &self,
        breaker: &CircuitBreaker,
        mut operation: F,
    ) -> ConnectorResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ConnectorResult<T>>,
    {
        let mut attempt = 0;
        let mut last_failure: Option<ConnectorError> = None;
        loop {
            match breaker.execute(&mut operation).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_circuit_open() => return Err(last_failure.unwrap_or(e)),
                Err(e) => match self.backoff_after(attempt, &e) {
                    Some(delay) => {
                        last_failure = Some(e);
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => return Err(e),
                },
            }
        }
    }

    /// Delay before the next attempt, or `None` when `error` must be returned.
    fn backoff_after(&self, attempt: u32, error: &ConnectorError) -> Option<Duration> {
        let classification = self.classifier.classify(error);
        if !classification.retryable {
            return None;
        }
        if attempt + 1 >= self.policy.max_attempts {
            warn!(
                attempts = attempt + 1,
                category = %classification.category,
                error = %error,
                "Retries exhausted"
            );
            return None;
        }

        let delay = self.policy.delay_for(attempt, classification.retry_after);
        debug!(
            attempt = attempt + 1,
            max_attempts = self.policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            category = %classification.category,
            error = %error,
            "Retrying after retryable error"
        );
        Some(delay)
    }
}

/// Connector wrapper that adds retry and circuit breaker protection.
pub struct ResilientConnector {
    inner: BoxedConnector,
    breaker: Arc<CircuitBreaker>,
    retry: RetryExecutor,
}

impl ResilientConnector {
    pub fn new(inner: BoxedConnector, breaker: Arc<CircuitBreaker>, retry: RetryExecutor) -> Self {
        Self {
            inner,
            breaker,
            retry,
        }
    }

    pub fn inner(&self) -> &BoxedConnector {
        &self.inner
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

impl std::fmt::Debug for ResilientConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientConnector")
            .field("system", self.inner.system_id())
            .field("breaker", &self.breaker.dependency())
            .finish()
    }
}

#[async_trait]
impl Connector for ResilientConnector {
    fn system_id(&self) -> &SystemId {
        self.inner.system_id()
    }

    fn display_name(&self) -> &str {
        self.inner.display_name()
    }

    fn supports(&self, kind: EntityKind) -> bool {
        self.inner.supports(kind)
    }

    async fn list_entities(
        &self,
        kind: EntityKind,
        since: Option<&Cursor>,
    ) -> ConnectorResult<Page> {
        let inner = &self.inner;
        self.retry
            .execute_with_circuit_breaker(&self.breaker, move || inner.list_entities(kind, since))
            .await
    }

    async fn health_check(&self) -> ConnectorResult<HealthStatus> {
        let inner = &self.inner;
        self.breaker.execute(|| inner.health_check()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker(threshold: u32, recovery_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "connector:test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_secs(recovery_secs),
            },
        )
    }

    async fn fail(cb: &CircuitBreaker) -> ConnectorResult<()> {
        cb.execute(|| async { Err(ConnectorError::network("connection reset")) })
            .await
    }

    #[tokio::test]
    async fn test_circuit_breaker_starts_closed() {
        let cb = CircuitBreaker::with_defaults("connector:test");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
    }

    /// Threshold 3: three failures open, rejection skips the call, the trial
    /// after the timeout closes it again.
    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_full_cycle() {
        let cb = breaker(3, 60);

        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let invoked = AtomicUsize::new(0);
        let result = cb
            .execute(|| {
                invoked.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, ConnectorError>(()) }
            })
            .await;
        assert!(matches!(result, Err(ConnectorError::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let result = cb.execute(|| async { Ok::<_, ConnectorError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_failure_reopens() {
        let cb = breaker(1, 10);
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(11)).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.opened_since_close(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let cb = breaker(1, 10);
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_secs(11)).await;

        let permit = cb.try_acquire().unwrap();
        assert!(matches!(
            cb.try_acquire(),
            Err(ConnectorError::CircuitOpen { .. })
        ));

        drop(permit);
        let permit = cb.try_acquire().unwrap();
        permit.success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let cb = breaker(3, 60);
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        cb.execute(|| async { Ok::<_, ConnectorError>(()) })
            .await
            .unwrap();
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_validation_errors_do_not_trip_breaker() {
        let cb = breaker(1, 60);
        let _ = cb
            .execute(|| async { Err::<(), _>(ConnectorError::invalid_data("bad row")) })
            .await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_open_respects_elapsed_time() {
        let config = CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
        };
        let cb = CircuitBreaker::restore_open("connector:test", config, 3, Duration::from_secs(50));
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_backoff_delay_doubles_until_cap() {
        let policy = RetryPolicy::new(5)
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10));

        assert_eq!(policy.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(4));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(8));
        assert_eq!(policy.backoff_delay(4), Duration::from_secs(10));
        assert_eq!(policy.backoff_delay(40), Duration::from_secs(10));
    }

    /// Three network failures: exactly three calls, and the total sleep stays
    /// inside the jitter window of 1s + 2s.
    #[tokio::test(start_paused = true)]
    async fn test_retry_bound_and_total_sleep() {
        let executor = RetryExecutor::new(RetryPolicy::default());
        let calls = AtomicUsize::new(0);
        let started = Instant::now();

        let result: ConnectorResult<()> = executor
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ConnectorError::network("connection reset")) }
            })
            .await;

        assert!(matches!(result, Err(ConnectorError::Network { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let slept = started.elapsed();
        assert!(slept >= Duration::from_millis(1500), "slept {slept:?}");
        assert!(slept <= Duration::from_millis(4500), "slept {slept:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_transient_failures() {
        let executor = RetryExecutor::new(RetryPolicy::new(3).without_jitter());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result = executor
            .execute(move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ConnectorError::http(503, "unavailable"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_authentication_failure_not_retried() {
        let executor = RetryExecutor::new(RetryPolicy::default());
        let calls = AtomicUsize::new(0);

        let result: ConnectorResult<()> = executor
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ConnectorError::http(401, "unauthorized")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_is_capped() {
        let executor = RetryExecutor::new(
            RetryPolicy::new(2)
                .with_max_delay(Duration::from_secs(5))
                .without_jitter(),
        );
        let started = Instant::now();

        let _: ConnectorResult<()> = executor
            .execute(|| async {
                Err(ConnectorError::RateLimited {
                    retry_after: Some(Duration::from_secs(120)),
                })
            })
            .await;

        let slept = started.elapsed();
        assert!(slept >= Duration::from_secs(5) && slept < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_tripped_mid_retry_reports_cause() {
        let executor = RetryExecutor::new(RetryPolicy::new(5).without_jitter());
        let cb = breaker(2, 600);
        let calls = AtomicUsize::new(0);

        let result: ConnectorResult<()> = executor
            .execute_with_circuit_breaker(&cb, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ConnectorError::Timeout { timeout_secs: 30 }) }
            })
            .await;

        assert!(matches!(
            result,
            Err(ConnectorError::Timeout { timeout_secs: 30 })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_open_before_first_attempt_is_rejected() {
        let executor = RetryExecutor::new(RetryPolicy::new(5).without_jitter());
        let cb = breaker(1, 600);
        let _ = fail(&cb).await;
        let calls = AtomicUsize::new(0);

        let result: ConnectorResult<()> = executor
            .execute_with_circuit_breaker(&cb, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(ConnectorError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
