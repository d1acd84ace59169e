//! REST connector implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use sitesync_connector::error::{ConnectorError, ConnectorResult};
use sitesync_connector::ids::{Cursor, SystemId};
use sitesync_connector::page::{Page, RawRecord, RejectedRecord};
use sitesync_connector::traits::Connector;
use sitesync_connector::types::{EntityKind, HealthStatus};

use crate::config::{EndpointConfig, RestAuth, RestSystemConfig};
use crate::rate_limit::{parse_retry_after, RequestThrottle};

/// Connector for one REST/JSON system.
pub struct RestConnector {
    config: RestSystemConfig,
    display_name: String,
    client: Client,
    /// Cached OAuth2 access token.
    oauth_token: Arc<RwLock<Option<String>>>,
    throttle: RequestThrottle,
}

impl std::fmt::Debug for RestConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestConnector")
            .field("system", &self.config.system_id)
            .field("base_url", &self.config.base_url)
            .finish_non_exhaustive()
    }
}

impl RestConnector {
    /// Create a connector from a validated configuration.
    pub fn new(config: RestSystemConfig) -> ConnectorResult<Self> {
        config.validate()?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.timeout_secs.min(10)))
            .build()
            .map_err(|e| {
                ConnectorError::invalid_configuration(format!("failed to build HTTP client: {e}"))
            })?;

        let display_name = config
            .display_name
            .clone()
            .unwrap_or_else(|| format!("REST: {}", config.system_id));
        let throttle = RequestThrottle::new(&config.rate_limit);

        Ok(Self {
            config,
            display_name,
            client,
            oauth_token: Arc::new(RwLock::new(None)),
            throttle,
        })
    }

    pub fn config(&self) -> &RestSystemConfig {
        &self.config
    }

    /// Authorization header value, fetching an OAuth2 token when needed.
    async fn auth_header(&self) -> ConnectorResult<Option<String>> {
        match &self.config.auth {
            RestAuth::None => Ok(None),
            RestAuth::Bearer { token } => Ok(Some(format!("Bearer {token}"))),
            RestAuth::Oauth2ClientCredentials {
                token_url,
                client_id,
                client_secret,
                scopes,
            } => {
                if let Some(token) = self.oauth_token.read().await.as_ref() {
                    return Ok(Some(format!("Bearer {token}")));
                }

                let token = self
                    .fetch_oauth_token(token_url, client_id, client_secret, scopes)
                    .await?;
                *self.oauth_token.write().await = Some(token.clone());
                Ok(Some(format!("Bearer {token}")))
            }
        }
    }

    async fn fetch_oauth_token(
        &self,
        token_url: &str,
        client_id: &str,
        client_secret: &str,
        scopes: &[String],
    ) -> ConnectorResult<String> {
        let mut params = vec![
            ("grant_type", "client_credentials".to_string()),
            ("client_id", client_id.to_string()),
            ("client_secret", client_secret.to_string()),
        ];
        if !scopes.is_empty() {
            params.push(("scope", scopes.join(" ")));
        }

        debug!(system = %self.config.system_id, "Fetching OAuth2 token");
        let response = self
            .client
            .post(token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !response.status().is_success() {
            return Err(ConnectorError::auth_failed(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }

        let body: Value = response.json().await.map_err(|e| {
            ConnectorError::auth_failed(format!("unreadable token response: {e}"))
        })?;
        body.get("access_token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ConnectorError::auth_failed("token response has no access_token"))
    }

    fn uses_oauth(&self) -> bool {
        matches!(self.config.auth, RestAuth::Oauth2ClientCredentials { .. })
    }

    /// Send a request built by `build`, re-authenticating once on 401.
    async fn send<F>(&self, build: F) -> ConnectorResult<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut reauthenticated = false;
        loop {
            let mut request = build().header(header::ACCEPT, "application/json");
            if let Some(auth) = self.auth_header().await? {
                request = request.header(header::AUTHORIZATION, auth);
            }

            let _permit = self.throttle.acquire().await?;
            let response = request.send().await.map_err(|e| self.transport_error(e))?;

            if response.status() == StatusCode::UNAUTHORIZED && self.uses_oauth() && !reauthenticated
            {
                warn!(system = %self.config.system_id, "Access token rejected, re-authenticating");
                *self.oauth_token.write().await = None;
                reauthenticated = true;
                continue;
            }
            return Ok(response);
        }
    }

    fn transport_error(&self, error: reqwest::Error) -> ConnectorError {
        if error.is_timeout() {
            ConnectorError::Timeout {
                timeout_secs: self.config.timeout_secs,
            }
        } else if error.is_decode() {
            ConnectorError::invalid_data(format!("undecodable response: {error}"))
        } else {
            ConnectorError::network_with_source(
                format!("request to {} failed", self.config.system_id),
                error,
            )
        }
    }

    /// Convert a non-success response into an error.
    async fn status_error(&self, response: Response) -> ConnectorError {
        let status = response.status();
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await.unwrap_or_default();
        let message = error_message(&body).unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("unexpected status")
                .to_string()
        });

        match status {
            StatusCode::UNAUTHORIZED => ConnectorError::auth_failed(message),
            StatusCode::TOO_MANY_REQUESTS => {
                if let Some(delay) = retry_after {
                    self.throttle.pause_for(delay).await;
                }
                ConnectorError::RateLimited { retry_after }
            }
            _ => ConnectorError::Http {
                status: status.as_u16(),
                message,
                retry_after,
            },
        }
    }

    fn endpoint(&self, kind: EntityKind) -> ConnectorResult<&EndpointConfig> {
        self.config
            .endpoints
            .get(&kind)
            .ok_or_else(|| ConnectorError::UnsupportedKind {
                system: self.config.system_id.clone(),
                kind,
            })
    }

    fn parse_page(&self, endpoint: &EndpointConfig, body: &Value) -> ConnectorResult<Page> {
        let records = match &endpoint.records_path {
            Some(path) => pointer(body, path),
            None => Some(body),
        }
        .and_then(Value::as_array)
        .ok_or_else(|| {
            ConnectorError::invalid_data(format!(
                "response has no records array at '{}'",
                endpoint.records_path.as_deref().unwrap_or("<root>")
            ))
        })?;

        let mut parsed = Vec::with_capacity(records.len());
        let mut rejected = Vec::new();
        for (position, value) in records.iter().enumerate() {
            let Some(external_id) = value.get(&endpoint.id_field).and_then(id_string) else {
                warn!(
                    system = %self.config.system_id,
                    id_field = %endpoint.id_field,
                    position,
                    "Rejecting record without identifier"
                );
                rejected.push(RejectedRecord::new(
                    position,
                    format!("record has no '{}' identifier", endpoint.id_field),
                ));
                continue;
            };
            let modified_at = endpoint
                .modified_field
                .as_deref()
                .and_then(|field| value.get(field))
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc));

            let mut record = RawRecord::from_value(external_id, value.clone());
            record.modified_at = modified_at;
            parsed.push(record);
        }

        let next = pointer(body, &endpoint.next_cursor_path).and_then(id_string);
        let page = match next {
            Some(cursor) => Page::more(parsed, Cursor::new(cursor)),
            None => {
                let resume = endpoint
                    .resume_cursor_path
                    .as_deref()
                    .and_then(|path| pointer(body, path))
                    .and_then(id_string)
                    .map(Cursor::new);
                Page::last(parsed, resume)
            }
        };
        Ok(page.with_rejected(rejected))
    }
}

/// Resolve a dotted path in a JSON value.
fn pointer<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    value
        .pointer(&format!("/{}", path.replace('.', "/")))
        .filter(|v| !v.is_null())
}

/// String form of an identifier or cursor value.
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn error_message(body: &str) -> Option<String> {
    let json: Value = serde_json::from_str(body).ok()?;
    ["message", "error_description", "error"]
        .iter()
        .find_map(|key| json.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

#[async_trait]
impl Connector for RestConnector {
    fn system_id(&self) -> &SystemId {
        &self.config.system_id
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn supports(&self, kind: EntityKind) -> bool {
        self.config.endpoints.contains_key(&kind)
    }

    #[instrument(skip(self), fields(system = %self.config.system_id))]
    async fn list_entities(
        &self,
        kind: EntityKind,
        since: Option<&Cursor>,
    ) -> ConnectorResult<Page> {
        let endpoint = self.endpoint(kind)?;
        let url = self.config.url_for(&endpoint.path);
        let page_size = self.config.page_size.to_string();

        let response = self
            .send(|| {
                let mut query = vec![(endpoint.page_size_param.as_str(), page_size.as_str())];
                if let Some(cursor) = since {
                    query.push((endpoint.cursor_param.as_str(), cursor.as_str()));
                }
                self.client.get(&url).query(&query)
            })
            .await?;

        if !response.status().is_success() {
            return Err(self.status_error(response).await);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ConnectorError::invalid_data(format!("malformed JSON page: {e}")))?;
        let page = self.parse_page(endpoint, &body)?;
        debug!(records = page.len(), done = page.done, "Fetched page");
        Ok(page)
    }

    async fn health_check(&self) -> ConnectorResult<HealthStatus> {
        let url = self.config.url_for(&self.config.health_path);
        let response = match self.send(|| self.client.get(&url)).await {
            Ok(response) => response,
            Err(ConnectorError::Network { .. } | ConnectorError::Timeout { .. }) => {
                return Ok(HealthStatus::Disconnected)
            }
            Err(e) => return Err(e),
        };

        let status = response.status();
        if status.is_success() {
            Ok(HealthStatus::Connected)
        } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Ok(HealthStatus::Degraded)
        } else {
            Err(self.status_error(response).await)
        }
    }
}
