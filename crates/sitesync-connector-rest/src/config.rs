//! Configuration for REST-backed systems.
//!
//! Systems are described in a JSON document:
//!
//! ```json
//! {
//!   "systems": [{
//!     "system_id": "procore",
//!     "base_url": "https://api.procore.example/v1",
//!     "auth": {"type": "bearer", "token": "..."},
//!     "endpoints": {
//!       "project": {"path": "/projects", "resume_cursor_path": "sync_token"}
//!     }
//!   }]
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use sitesync_connector::error::{ConnectorError, ConnectorResult};
use sitesync_connector::ids::SystemId;
use sitesync_connector::types::EntityKind;

use crate::rate_limit::RateLimitConfig;

/// Authentication scheme for a REST system.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RestAuth {
    #[default]
    None,
    Bearer {
        token: String,
    },
    /// Client-credentials grant; the token is cached and refreshed on 401.
    Oauth2ClientCredentials {
        token_url: String,
        client_id: String,
        client_secret: String,
        #[serde(default)]
        scopes: Vec<String>,
    },
}

/// How one entity kind is listed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Path relative to the base URL.
    pub path: String,
    /// Dotted path of the records array in the response. `None` means the
    /// response body is the array.
    #[serde(default = "default_records_path")]
    pub records_path: Option<String>,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    #[serde(default)]
    pub modified_field: Option<String>,
    #[serde(default = "default_cursor_param")]
    pub cursor_param: String,
    #[serde(default = "default_page_size_param")]
    pub page_size_param: String,
    /// Dotted path of the next-page cursor; absent or null ends the listing.
    #[serde(default = "default_next_cursor_path")]
    pub next_cursor_path: String,
    /// Dotted path of the change-tracking token returned on the last page.
    #[serde(default)]
    pub resume_cursor_path: Option<String>,
}

fn default_records_path() -> Option<String> {
    Some("data".to_string())
}

fn default_id_field() -> String {
    "id".to_string()
}

fn default_cursor_param() -> String {
    "cursor".to_string()
}

fn default_page_size_param() -> String {
    "per_page".to_string()
}

fn default_next_cursor_path() -> String {
    "next_cursor".to_string()
}

impl EndpointConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            records_path: default_records_path(),
            id_field: default_id_field(),
            modified_field: None,
            cursor_param: default_cursor_param(),
            page_size_param: default_page_size_param(),
            next_cursor_path: default_next_cursor_path(),
            resume_cursor_path: None,
        }
    }

    #[must_use]
    pub fn with_records_path(mut self, path: Option<&str>) -> Self {
        self.records_path = path.map(str::to_string);
        self
    }

    #[must_use]
    pub fn with_modified_field(mut self, field: impl Into<String>) -> Self {
        self.modified_field = Some(field.into());
        self
    }

    #[must_use]
    pub fn with_resume_cursor_path(mut self, path: impl Into<String>) -> Self {
        self.resume_cursor_path = Some(path.into());
        self
    }
}

/// One REST-backed external system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestSystemConfig {
    pub system_id: SystemId,
    #[serde(default)]
    pub display_name: Option<String>,
    pub base_url: String,
    #[serde(default)]
    pub auth: RestAuth,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub endpoints: HashMap<EntityKind, EndpointConfig>,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_page_size() -> u32 {
    100
}

fn default_health_path() -> String {
    "/health".to_string()
}

impl RestSystemConfig {
    pub fn new(system_id: impl Into<SystemId>, base_url: impl Into<String>) -> Self {
        Self {
            system_id: system_id.into(),
            display_name: None,
            base_url: base_url.into(),
            auth: RestAuth::None,
            timeout_secs: default_timeout_secs(),
            page_size: default_page_size(),
            health_path: default_health_path(),
            rate_limit: RateLimitConfig::default(),
            endpoints: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.auth = RestAuth::Bearer {
            token: token.into(),
        };
        self
    }

    #[must_use]
    pub fn with_auth(mut self, auth: RestAuth) -> Self {
        self.auth = auth;
        self
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    #[must_use]
    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    #[must_use]
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    #[must_use]
    pub fn with_endpoint(mut self, kind: EntityKind, endpoint: EndpointConfig) -> Self {
        self.endpoints.insert(kind, endpoint);
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ConnectorResult<()> {
        let url = reqwest::Url::parse(&self.base_url).map_err(|e| {
            ConnectorError::invalid_configuration(format!(
                "{}: invalid base_url '{}': {e}",
                self.system_id, self.base_url
            ))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConnectorError::invalid_configuration(format!(
                "{}: base_url must use http or https",
                self.system_id
            )));
        }
        if self.page_size == 0 {
            return Err(ConnectorError::invalid_configuration(format!(
                "{}: page_size must be positive",
                self.system_id
            )));
        }
        if self.timeout_secs == 0 {
            return Err(ConnectorError::invalid_configuration(format!(
                "{}: timeout_secs must be positive",
                self.system_id
            )));
        }
        if let RestAuth::Oauth2ClientCredentials { token_url, .. } = &self.auth {
            reqwest::Url::parse(token_url).map_err(|e| {
                ConnectorError::invalid_configuration(format!(
                    "{}: invalid token_url: {e}",
                    self.system_id
                ))
            })?;
        }
        Ok(())
    }

    /// Absolute URL for a path relative to the base URL.
    pub fn url_for(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Deserialize)]
struct SystemsFile {
    #[serde(default)]
    systems: Vec<RestSystemConfig>,
}

/// Parse a `{"systems": [...]}` document and validate every entry.
pub fn load_systems(json: &str) -> ConnectorResult<Vec<RestSystemConfig>> {
    let file: SystemsFile = serde_json::from_str(json).map_err(|e| {
        ConnectorError::invalid_configuration(format!("failed to parse systems file: {e}"))
    })?;
    for system in &file.systems {
        system.validate()?;
    }
    Ok(file.systems)
}
