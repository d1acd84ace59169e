//! Engine settings loaded from the environment.

use std::env::VarError;
use std::str::FromStr;
use std::time::Duration;

use sitesync_connector::resilience::{CircuitBreakerConfig, RetryPolicy};

use crate::change::{ImpactThresholds, Priority};

/// Tunables for retries, breakers, impact analysis and notifications.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_recovery_timeout_secs: u64,
    /// Percent change of a budget or amount above which impact is high.
    pub budget_impact_threshold_pct: f64,
    /// Delay in days at or above which a schedule slip is high impact.
    pub schedule_delay_threshold_days: i64,
    /// Lowest change priority that is published as an event.
    pub notify_min_priority: Priority,
    /// Consecutive openings of one breaker that raise an alert.
    pub alert_open_circuit_threshold: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            retry_max_attempts: 3,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 10_000,
            breaker_failure_threshold: 5,
            breaker_recovery_timeout_secs: 60,
            budget_impact_threshold_pct: 10.0,
            schedule_delay_threshold_days: 14,
            notify_min_priority: Priority::High,
            alert_open_circuit_threshold: 3,
        }
    }
}

impl SyncSettings {
    /// Load settings from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_reader(|key| std::env::var(key))
    }

    /// Load settings from a custom variable reader.
    ///
    /// Tests pass a closure over a map instead of touching process env.
    pub fn from_reader<F>(reader: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, VarError>,
    {
        let defaults = Self::default();

        let settings = Self {
            retry_max_attempts: parse_or(
                &reader,
                "SITESYNC_RETRY_MAX_ATTEMPTS",
                defaults.retry_max_attempts,
            )?,
            retry_base_delay_ms: parse_or(
                &reader,
                "SITESYNC_RETRY_BASE_DELAY_MS",
                defaults.retry_base_delay_ms,
            )?,
            retry_max_delay_ms: parse_or(
                &reader,
                "SITESYNC_RETRY_MAX_DELAY_MS",
                defaults.retry_max_delay_ms,
            )?,
            breaker_failure_threshold: parse_or(
                &reader,
                "SITESYNC_BREAKER_FAILURE_THRESHOLD",
                defaults.breaker_failure_threshold,
            )?,
            breaker_recovery_timeout_secs: parse_or(
                &reader,
                "SITESYNC_BREAKER_RECOVERY_TIMEOUT_SECS",
                defaults.breaker_recovery_timeout_secs,
            )?,
            budget_impact_threshold_pct: parse_or(
                &reader,
                "SITESYNC_BUDGET_IMPACT_THRESHOLD_PCT",
                defaults.budget_impact_threshold_pct,
            )?,
            schedule_delay_threshold_days: parse_or(
                &reader,
                "SITESYNC_SCHEDULE_DELAY_THRESHOLD_DAYS",
                defaults.schedule_delay_threshold_days,
            )?,
            notify_min_priority: parse_or(
                &reader,
                "SITESYNC_NOTIFY_MIN_PRIORITY",
                defaults.notify_min_priority,
            )?,
            alert_open_circuit_threshold: parse_or(
                &reader,
                "SITESYNC_ALERT_OPEN_CIRCUIT_THRESHOLD",
                defaults.alert_open_circuit_threshold,
            )?,
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "SITESYNC_RETRY_MAX_ATTEMPTS".into(),
                "must be at least 1".into(),
            ));
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(ConfigError::InvalidValue(
                "SITESYNC_RETRY_MAX_DELAY_MS".into(),
                "must not be below the base delay".into(),
            ));
        }
        if self.breaker_failure_threshold == 0 {
            return Err(ConfigError::InvalidValue(
                "SITESYNC_BREAKER_FAILURE_THRESHOLD".into(),
                "must be at least 1".into(),
            ));
        }
        if !self.budget_impact_threshold_pct.is_finite() || self.budget_impact_threshold_pct < 0.0 {
            return Err(ConfigError::InvalidValue(
                "SITESYNC_BUDGET_IMPACT_THRESHOLD_PCT".into(),
                "must be a non-negative number".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_max_attempts)
            .with_base_delay(Duration::from_millis(self.retry_base_delay_ms))
            .with_max_delay(Duration::from_millis(self.retry_max_delay_ms))
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker_failure_threshold,
            recovery_timeout: Duration::from_secs(self.breaker_recovery_timeout_secs),
        }
    }

    pub fn impact_thresholds(&self) -> ImpactThresholds {
        ImpactThresholds {
            budget_change_pct: self.budget_impact_threshold_pct,
            schedule_delay_days: self.schedule_delay_threshold_days,
        }
    }
}

fn parse_or<F, T>(reader: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Result<String, VarError>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match reader(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(key.into(), e.to_string())),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Create a reader closure from a HashMap (no global env mutation).
    fn make_reader(vars: HashMap<&str, &str>) -> impl Fn(&str) -> Result<String, VarError> {
        let owned: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| owned.get(key).cloned().ok_or(VarError::NotPresent)
    }

    #[test]
    fn test_defaults() {
        let settings = SyncSettings::from_reader(make_reader(HashMap::new())).unwrap();
        assert_eq!(settings, SyncSettings::default());

        let policy = settings.retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(10));
        assert_eq!(settings.breaker_config().failure_threshold, 5);
    }

    #[test]
    fn test_custom_values() {
        let reader = make_reader(HashMap::from([
            ("SITESYNC_RETRY_MAX_ATTEMPTS", "5"),
            ("SITESYNC_BREAKER_FAILURE_THRESHOLD", "3"),
            ("SITESYNC_BUDGET_IMPACT_THRESHOLD_PCT", "12.5"),
            ("SITESYNC_NOTIFY_MIN_PRIORITY", "medium"),
        ]));

        let settings = SyncSettings::from_reader(reader).unwrap();
        assert_eq!(settings.retry_max_attempts, 5);
        assert_eq!(settings.breaker_failure_threshold, 3);
        assert!((settings.impact_thresholds().budget_change_pct - 12.5).abs() < f64::EPSILON);
        assert_eq!(settings.notify_min_priority, Priority::Medium);
    }

    #[test]
    fn test_invalid_number() {
        let reader = make_reader(HashMap::from([("SITESYNC_RETRY_MAX_ATTEMPTS", "many")]));
        let err = SyncSettings::from_reader(reader).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(..)));
        assert!(err.to_string().contains("SITESYNC_RETRY_MAX_ATTEMPTS"));
    }

    #[test]
    fn test_invalid_priority() {
        let reader = make_reader(HashMap::from([("SITESYNC_NOTIFY_MIN_PRIORITY", "urgent")]));
        let err = SyncSettings::from_reader(reader).unwrap_err();
        assert!(err.to_string().contains("SITESYNC_NOTIFY_MIN_PRIORITY"));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let reader = make_reader(HashMap::from([("SITESYNC_RETRY_MAX_ATTEMPTS", "0")]));
        assert!(SyncSettings::from_reader(reader).is_err());
    }

    #[test]
    fn test_max_delay_below_base_rejected() {
        let reader = make_reader(HashMap::from([
            ("SITESYNC_RETRY_BASE_DELAY_MS", "5000"),
            ("SITESYNC_RETRY_MAX_DELAY_MS", "1000"),
        ]));
        let err = SyncSettings::from_reader(reader).unwrap_err();
        assert!(err.to_string().contains("SITESYNC_RETRY_MAX_DELAY_MS"));
    }
}
