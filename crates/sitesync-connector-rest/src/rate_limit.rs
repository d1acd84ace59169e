//! Client-side rate limiting and `Retry-After` handling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};
use tokio::time::Instant;
use tracing::debug;

use sitesync_connector::error::{ConnectorError, ConnectorResult};

/// Configuration for request throttling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum requests per second; `0` disables spacing.
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
    /// Maximum requests in flight.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
}

fn default_requests_per_second() -> u32 {
    10
}

fn default_max_concurrent() -> u32 {
    4
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_requests_per_second(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

impl RateLimitConfig {
    /// No spacing and a generous concurrency bound.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            requests_per_second: 0,
            max_concurrent: 64,
        }
    }
}

/// Spaces requests and bounds concurrency for one system.
///
/// A server-imposed pause (429 with `Retry-After`) pushes the next slot out
/// for every caller.
#[derive(Debug)]
pub struct RequestThrottle {
    semaphore: Semaphore,
    min_interval: Option<Duration>,
    next_slot: Mutex<Instant>,
}

impl RequestThrottle {
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        let min_interval = (config.requests_per_second > 0)
            .then(|| Duration::from_secs(1) / config.requests_per_second);
        Self {
            semaphore: Semaphore::new(config.max_concurrent.max(1) as usize),
            min_interval,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    /// Wait for a request slot.
    pub async fn acquire(&self) -> ConnectorResult<SemaphorePermit<'_>> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| ConnectorError::internal_with_source("request throttle closed", e))?;

        let mut next = self.next_slot.lock().await;
        let now = Instant::now();
        if *next > now {
            debug!(wait_ms = (*next - now).as_millis() as u64, "Throttling request");
            tokio::time::sleep_until(*next).await;
        }
        let start = (*next).max(now);
        *next = start + self.min_interval.unwrap_or_default();
        Ok(permit)
    }

    /// Hold back every request for `duration`.
    pub async fn pause_for(&self, duration: Duration) {
        let mut next = self.next_slot.lock().await;
        let until = Instant::now() + duration;
        if until > *next {
            *next = until;
        }
    }
}

/// Parse a `Retry-After` header value: delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    let delta = at - Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}
