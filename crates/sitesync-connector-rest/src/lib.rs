//! # REST Connector
//!
//! Generic paged REST/JSON connector for SiteSync.
//!
//! One [`RestConnector`] serves one external system. Each entity kind maps to
//! an endpoint returning a JSON page with a records array and an optional
//! next-page cursor.
//!
//! ## Example
//!
//! ```ignore
//! use sitesync_connector_rest::{RestSystemConfig, RestConnector};
//!
//! let config = RestSystemConfig::new("procore", "https://api.procore.example/v1")
//!     .with_bearer_token("token")
//!     .with_endpoint(EntityKind::Project, EndpointConfig::new("/projects"));
//!
//! let connector = RestConnector::new(config)?;
//! let page = connector.list_entities(EntityKind::Project, None).await?;
//! ```

pub mod config;
pub mod connector;
pub mod rate_limit;

pub use config::{load_systems, EndpointConfig, RestAuth, RestSystemConfig};
pub use connector::RestConnector;
pub use rate_limit::{parse_retry_after, RateLimitConfig, RequestThrottle};
