//! # HTTP Transport
//!
//! The single seam between the resilience layer and the network.
//!
//! ## Request Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  OperationQueue / fetch_json                                           │
//! │       │  HttpRequest { method, path, headers, body }                   │
//! │       ▼                                                                 │
//! │  AuthPipeline  ── adds `Authorization: Bearer …`                       │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  dyn HttpTransport                                                     │
//! │       ├── ReqwestTransport  (production: base_url + path, timeouts)    │
//! │       └── fakes in tests                                               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  HttpResponse { status, headers, body }                                │
//! │                                                                         │
//! │  Transport errors:                                                     │
//! │  • no response          → SyncError::NetworkFailure                    │
//! │  • exceeded timeout     → SyncError::Timeout                           │
//! │  • any status (incl. 4xx/5xx) is a *response*, not an error            │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Connectivity is tracked separately by [`Connectivity`], a `watch` channel
//! the scheduler listens to.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};
use url::Url;

use crate::config::TetherConfig;
use crate::error::{SyncError, SyncResult};
use tether_core::{HttpMethod, PendingOperation};

// =============================================================================
// Request / Response
// =============================================================================

/// An outbound HTTP call, relative to the API base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        HttpRequest {
            method,
            path: path.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, path)
    }

    /// Rebuilds the request a queued operation describes.
    pub fn from_operation(op: &PendingOperation) -> Self {
        HttpRequest {
            method: op.target.method,
            path: op.target.path.clone(),
            headers: op.headers.clone(),
            body: op.body.clone(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Returns a copy carrying `token` as its bearer credential.
    ///
    /// Any `Authorization` header already present is replaced.
    pub fn with_bearer(&self, token: &str) -> Self {
        let mut request = self.clone();
        request
            .headers
            .retain(|(name, _)| !name.eq_ignore_ascii_case("authorization"));
        request
            .headers
            .push(("Authorization".to_string(), format!("Bearer {}", token)));
        request
    }

    /// Value of the first header named `name` (case-insensitive).
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A response with any status code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        HttpResponse {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_json(mut self, body: &serde_json::Value) -> Self {
        self.body = body.to_string().into_bytes();
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == 401
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Decodes the body as JSON. An empty body decodes as `null`.
    pub fn json<T: DeserializeOwned>(&self) -> SyncResult<T> {
        if self.body.is_empty() {
            return Ok(serde_json::from_value(serde_json::Value::Null)?);
        }
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Earliest time the server allows another attempt, from `Retry-After`.
    ///
    /// Accepts both delta-seconds and HTTP-date forms.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let value = self.header("retry-after")?.trim();

        if let Ok(secs) = value.parse::<i64>() {
            return now.checked_add_signed(ChronoDuration::seconds(secs.max(0)));
        }

        DateTime::parse_from_rfc2822(value)
            .ok()
            .map(|at| at.with_timezone(&Utc))
    }

    /// Converts a non-2xx response into the matching error.
    pub fn error_for_status(self) -> SyncResult<Self> {
        if self.is_success() {
            return Ok(self);
        }
        if self.is_unauthorized() {
            return Err(SyncError::AuthFailure("request rejected with 401".into()));
        }
        let message = String::from_utf8_lossy(&self.body).chars().take(200).collect();
        Err(SyncError::ServerError {
            status: self.status,
            message,
        })
    }
}

// =============================================================================
// Transport Trait
// =============================================================================

/// Sends one HTTP request.
///
/// Implementations return `Ok` for every response the server produced,
/// whatever its status, and `Err` only when no response arrived.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> SyncResult<HttpResponse>;
}

// =============================================================================
// Reqwest Transport
// =============================================================================

/// Production transport over `reqwest`.
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: Url,
    request_timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(config: &TetherConfig) -> SyncResult<Self> {
        let base_url = Url::parse(&config.api.base_url)?;

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| SyncError::InvalidConfig(e.to_string()))?;

        info!(base_url = %base_url, "HTTP transport ready");

        Ok(ReqwestTransport {
            client,
            base_url,
            request_timeout: config.request_timeout(),
        })
    }

    /// Appends `path` to the base URL, keeping any base path prefix.
    ///
    /// Absolute URLs are accepted only on the base URL's origin: every
    /// request carries the bearer token.
    pub fn resolve(&self, path: &str) -> SyncResult<Url> {
        if let Ok(absolute) = Url::parse(path) {
            if absolute.origin() != self.base_url.origin() {
                return Err(SyncError::ValidationFailure(format!(
                    "{} is outside the API origin {}",
                    absolute,
                    self.base_url.origin().ascii_serialization()
                )));
            }
            return Ok(absolute);
        }

        let base = self.base_url.as_str().trim_end_matches('/');
        let path = path.trim_start_matches('/');
        Ok(Url::parse(&format!("{}/{}", base, path))?)
    }

    fn method(method: HttpMethod) -> reqwest::Method {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }

    fn map_error(&self, err: reqwest::Error) -> SyncError {
        if err.is_timeout() {
            SyncError::Timeout(self.request_timeout.as_secs())
        } else {
            SyncError::NetworkFailure(err.to_string())
        }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
        let url = self.resolve(&request.path)?;
        debug!(method = request.method.as_str(), %url, "Sending request");

        let mut builder = self.client.request(Self::method(request.method), url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let exchange = async {
            let response = builder.send().await.map_err(|e| self.map_error(e))?;

            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect();
            let body = response.bytes().await.map_err(|e| self.map_error(e))?;

            Ok::<_, SyncError>(HttpResponse {
                status,
                headers,
                body: body.to_vec(),
            })
        };

        let response = tokio::time::timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| SyncError::Timeout(self.request_timeout.as_secs()))??;

        debug!(status = response.status, "Response received");
        Ok(response)
    }
}

// =============================================================================
// Connectivity
// =============================================================================

/// Online/offline flag with change notification.
///
/// The host application reports transitions with [`Connectivity::set_online`];
/// the scheduler reacts to them through [`Connectivity::subscribe`].
#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: watch::Sender<bool>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Connectivity { tx }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Records the current state. Returns `true` if it changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(online, "Connectivity changed");
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
