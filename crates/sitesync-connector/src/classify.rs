//! Error classification.
//!
//! Maps a [`ConnectorError`] onto a category, a retry decision and a severity.
//! Structured information (status codes, retry hints) wins; free-form messages
//! fall back to keyword inspection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConnectorError;
use crate::types::ParseEnumError;

/// Broad failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Authentication,
    RateLimit,
    Validation,
    Internal,
}

impl ErrorCategory {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Internal => "internal",
        }
    }

    /// Default retry decision for the category.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Network | ErrorCategory::RateLimit | ErrorCategory::Internal
        )
    }

    /// Default severity for the category.
    #[must_use]
    pub fn default_severity(&self) -> Severity {
        match self {
            ErrorCategory::Authentication => Severity::Critical,
            ErrorCategory::Internal => Severity::High,
            ErrorCategory::Network | ErrorCategory::Validation => Severity::Medium,
            ErrorCategory::RateLimit => Severity::Low,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ErrorCategory {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "network" => Ok(ErrorCategory::Network),
            "authentication" => Ok(ErrorCategory::Authentication),
            "rate_limit" => Ok(ErrorCategory::RateLimit),
            "validation" => Ok(ErrorCategory::Validation),
            "internal" => Ok(ErrorCategory::Internal),
            _ => Err(ParseEnumError::new("error category", s)),
        }
    }
}

/// Operator-facing severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Severity {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            _ => Err(ParseEnumError::new("severity", s)),
        }
    }
}

/// Outcome of classifying one error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub category: ErrorCategory,
    pub retryable: bool,
    pub severity: Severity,
    pub retry_after: Option<Duration>,
}

impl Classification {
    /// Defaults of a category, for failures that are not connector errors.
    #[must_use]
    pub fn from_category(category: ErrorCategory) -> Self {
        Self::of(category)
    }

    fn of(category: ErrorCategory) -> Self {
        Self {
            category,
            retryable: category.is_retryable(),
            severity: category.default_severity(),
            retry_after: None,
        }
    }

    fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    fn not_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    /// Raise severity for failures that cost a whole page of records.
    #[must_use]
    pub fn for_page(mut self) -> Self {
        if self.category == ErrorCategory::Validation {
            self.severity = self.severity.max(Severity::High);
        }
        self
    }
}

const AUTH_KEYWORDS: &[&str] = &[
    "unauthorized",
    "unauthorised",
    "forbidden",
    "token expired",
    "invalid token",
    "invalid_grant",
];
const RATE_LIMIT_KEYWORDS: &[&str] = &["rate limit", "too many requests", "throttl", "quota"];
const VALIDATION_KEYWORDS: &[&str] = &[
    "schema",
    "missing field",
    "invalid type",
    "malformed",
    "deserializ",
    "expected value",
];
const NETWORK_KEYWORDS: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "connection closed",
    "broken pipe",
    "dns",
    "unreachable",
];

/// Stateless error classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify a connector error.
    pub fn classify(&self, error: &ConnectorError) -> Classification {
        match error {
            ConnectorError::Network { .. } | ConnectorError::Timeout { .. } => {
                Classification::of(ErrorCategory::Network)
            }
            ConnectorError::Http {
                status,
                message,
                retry_after,
            } => self
                .classify_status(*status)
                .unwrap_or_else(|| self.classify_message(message))
                .with_retry_after(*retry_after),
            ConnectorError::AuthenticationFailed { .. } | ConnectorError::CredentialsExpired => {
                Classification::of(ErrorCategory::Authentication)
            }
            ConnectorError::RateLimited { retry_after } => {
                Classification::of(ErrorCategory::RateLimit).with_retry_after(*retry_after)
            }
            ConnectorError::InvalidData { .. } => Classification::of(ErrorCategory::Validation),
            // Retrying locally would defeat the breaker; the next trigger tries again.
            ConnectorError::CircuitOpen { .. }
            | ConnectorError::UnsupportedKind { .. }
            | ConnectorError::SystemNotRegistered { .. }
            | ConnectorError::InvalidConfiguration { .. } => {
                Classification::of(ErrorCategory::Internal).not_retryable()
            }
            ConnectorError::Internal { message, .. } => self.classify_message(message),
        }
    }

    /// Classify by HTTP status alone. Returns `None` for statuses that carry no
    /// failure information (1xx-3xx).
    pub fn classify_status(&self, status: u16) -> Option<Classification> {
        let category = match status {
            401 | 403 => ErrorCategory::Authentication,
            429 => ErrorCategory::RateLimit,
            408 | 500..=599 => ErrorCategory::Network,
            400..=499 => ErrorCategory::Validation,
            _ => return None,
        };
        Some(Classification::of(category))
    }

    /// Classify a free-form error message by keyword.
    pub fn classify_message(&self, message: &str) -> Classification {
        let lower = message.to_lowercase();
        let matches = |keywords: &[&str]| keywords.iter().any(|k| lower.contains(k));

        let category = if matches(AUTH_KEYWORDS) {
            ErrorCategory::Authentication
        } else if matches(RATE_LIMIT_KEYWORDS) {
            ErrorCategory::RateLimit
        } else if matches(VALIDATION_KEYWORDS) {
            ErrorCategory::Validation
        } else if matches(NETWORK_KEYWORDS) {
            ErrorCategory::Network
        } else {
            ErrorCategory::Internal
        };
        Classification::of(category)
    }

    /// Whether a failure says something about the dependency's health.
    ///
    /// Bad payloads and breaker rejections do not.
    pub fn counts_toward_breaker(&self, error: &ConnectorError) -> bool {
        if error.is_circuit_open() {
            return false;
        }
        self.classify(error).category != ErrorCategory::Validation
    }
}
