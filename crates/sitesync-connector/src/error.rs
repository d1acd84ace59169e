//! Connector error types.
//!
//! Errors carry enough structure (HTTP status, retry hints) for the
//! [`ErrorClassifier`](crate::classify::ErrorClassifier) to decide how the
//! sync engine should react.

use std::time::Duration;
use thiserror::Error;

use crate::ids::SystemId;
use crate::types::EntityKind;

/// Error that can occur while talking to an external system.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Transport-level failure (DNS, refused or reset connection).
    #[error("network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The request did not complete within the connector's timeout.
    #[error("request timed out after {timeout_secs} seconds")]
    Timeout { timeout_secs: u64 },

    /// The remote answered with a non-success HTTP status.
    #[error("http {status}: {message}")]
    Http {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    /// Credentials were rejected, even after a re-authentication attempt.
    #[error("authentication failed: {message}")]
    AuthenticationFailed { message: String },

    /// Stored credentials have expired and cannot be refreshed automatically.
    #[error("authentication failed: credentials expired")]
    CredentialsExpired,

    /// The remote asked us to slow down.
    #[error("rate limited by remote system")]
    RateLimited { retry_after: Option<Duration> },

    /// The payload could not be interpreted.
    #[error("invalid data: {message}")]
    InvalidData { message: String },

    /// The guarding circuit breaker rejected the call without invoking it.
    #[error("circuit breaker open for {dependency}")]
    CircuitOpen { dependency: String },

    /// The connector does not expose this entity kind.
    #[error("system {system} does not support entity kind {kind}")]
    UnsupportedKind { system: SystemId, kind: EntityKind },

    /// No connector is registered under this system id.
    #[error("no connector registered for system {system}")]
    SystemNotRegistered { system: SystemId },

    /// The connector configuration is unusable.
    #[error("invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    /// Anything else.
    #[error("internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Result type for connector operations.
pub type ConnectorResult<T> = Result<T, ConnectorError>;

impl ConnectorError {
    /// Stable error code, used in run logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            ConnectorError::Network { .. } => "NETWORK_ERROR",
            ConnectorError::Timeout { .. } => "TIMEOUT",
            ConnectorError::Http { .. } => "HTTP_ERROR",
            ConnectorError::AuthenticationFailed { .. } => "AUTH_FAILED",
            ConnectorError::CredentialsExpired => "CREDENTIALS_EXPIRED",
            ConnectorError::RateLimited { .. } => "RATE_LIMITED",
            ConnectorError::InvalidData { .. } => "INVALID_DATA",
            ConnectorError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            ConnectorError::UnsupportedKind { .. } => "UNSUPPORTED_KIND",
            ConnectorError::SystemNotRegistered { .. } => "SYSTEM_NOT_REGISTERED",
            ConnectorError::InvalidConfiguration { .. } => "INVALID_CONFIG",
            ConnectorError::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Server-provided delay before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ConnectorError::Http { retry_after, .. }
            | ConnectorError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// HTTP status code, if the error came from an HTTP response.
    pub fn status(&self) -> Option<u16> {
        match self {
            ConnectorError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Check if this is a circuit breaker rejection.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ConnectorError::CircuitOpen { .. })
    }

    // Convenience constructors

    pub fn network(message: impl Into<String>) -> Self {
        ConnectorError::Network {
            message: message.into(),
            source: None,
        }
    }

    pub fn network_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ConnectorError::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        ConnectorError::Http {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        ConnectorError::AuthenticationFailed {
            message: message.into(),
        }
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        ConnectorError::InvalidData {
            message: message.into(),
        }
    }

    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        ConnectorError::InvalidConfiguration {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ConnectorError::Internal {
            message: message.into(),
            source: None,
        }
    }

    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ConnectorError::Internal {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ConnectorError::network("reset").error_code(), "NETWORK_ERROR");
        assert_eq!(ConnectorError::http(502, "bad gateway").error_code(), "HTTP_ERROR");
        assert_eq!(
            ConnectorError::CircuitOpen {
                dependency: "connector:procore".to_string()
            }
            .error_code(),
            "CIRCUIT_OPEN"
        );
    }

    #[test]
    fn test_error_display() {
        let err = ConnectorError::Timeout { timeout_secs: 30 };
        assert_eq!(err.to_string(), "request timed out after 30 seconds");

        let err = ConnectorError::UnsupportedKind {
            system: SystemId::from("costbook"),
            kind: EntityKind::Rfi,
        };
        assert_eq!(
            err.to_string(),
            "system costbook does not support entity kind rfi"
        );
    }

    #[test]
    fn test_retry_after_hint() {
        let err = ConnectorError::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(ConnectorError::network("x").retry_after(), None);
    }

    #[test]
    fn test_error_with_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = ConnectorError::network_with_source("read failed", io);

        if let ConnectorError::Network { source, .. } = &err {
            assert!(source.is_some());
        } else {
            panic!("Expected Network variant");
        }
    }
}
