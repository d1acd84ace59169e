//! Worker configuration loaded from environment variables.
//!
//! `DATABASE_URL` is required; everything else has a default. Engine tunables
//! are read separately by `SyncSettings::from_env`.

use std::env::VarError;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use sitesync_engine::config::ConfigError;

const DEFAULT_SYSTEMS_PATH: &str = "config/systems.json";
const DEFAULT_MAPPINGS_PATH: &str = "config/mappings.json";
const DEFAULT_LOG_FILTER: &str = "info,sitesync=debug";

/// Process-level settings for the worker binary.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub database_url: String,
    /// JSON file with the connector definitions.
    pub systems_path: PathBuf,
    /// JSON file with the field-mapping tables.
    pub mappings_path: PathBuf,
    pub scheduler_tick_secs: u64,
    pub db_max_connections: u32,
    pub log_filter: String,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_reader(|key| std::env::var(key))
    }

    pub fn from_reader<F>(reader: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, VarError>,
    {
        let database_url = reader("DATABASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingVar("DATABASE_URL".into()))?;

        let config = Self {
            database_url,
            systems_path: reader("SITESYNC_SYSTEMS_PATH")
                .map_or_else(|_| PathBuf::from(DEFAULT_SYSTEMS_PATH), PathBuf::from),
            mappings_path: reader("SITESYNC_MAPPINGS_PATH")
                .map_or_else(|_| PathBuf::from(DEFAULT_MAPPINGS_PATH), PathBuf::from),
            scheduler_tick_secs: parse_or(&reader, "SITESYNC_SCHEDULER_TICK_SECS", 30)?,
            db_max_connections: parse_or(&reader, "SITESYNC_DB_MAX_CONNECTIONS", 10)?,
            log_filter: reader("SITESYNC_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string()),
        };

        if config.scheduler_tick_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "SITESYNC_SCHEDULER_TICK_SECS".into(),
                "must be at least 1".into(),
            ));
        }
        if config.db_max_connections == 0 {
            return Err(ConfigError::InvalidValue(
                "SITESYNC_DB_MAX_CONNECTIONS".into(),
                "must be at least 1".into(),
            ));
        }
        Ok(config)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_secs)
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
