//! Fetch capability.
//!
//! A [`Fetcher`] performs one network fetch, optionally through a relay, and
//! returns the raw payload or a classified [`FetchError`]. [`HttpFetcher`] is
//! the reqwest-backed implementation used by the binary; tests plug in
//! in-memory fetchers.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use graham_common::util::{redact_credentials, truncate_with_ellipsis};

use crate::error::{FailureKind, TaskFailure};

/// Desktop browser user agents rotated per request.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
];

/// Longest body excerpt kept in an error message.
const ERROR_BODY_CHARS: usize = 200;

// ============================================================================
// Types
// ============================================================================

/// A relay handed to a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRoute {
    /// Pool key (`host:port`, possibly with credentials)
    pub address: String,
    /// Full relay URL including scheme
    pub url: String,
}

impl ProxyRoute {
    /// Address safe to log.
    pub fn display_address(&self) -> String {
        redact_credentials(&self.address)
    }
}

/// Classified fetch failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("HTTP {0}")]
    HttpStatus(u16),

    #[error("parse error: {0}")]
    ParseError(String),
}

impl FetchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Timeout | Self::ConnectionError(_) => FailureKind::NetworkError,
            Self::HttpStatus(429) => FailureKind::RateLimited,
            Self::HttpStatus(code) => FailureKind::HttpStatus(*code),
            Self::ParseError(_) => FailureKind::ParseError,
        }
    }
}

impl From<FetchError> for TaskFailure {
    fn from(err: FetchError) -> Self {
        TaskFailure::new(err.kind(), err.to_string())
    }
}

/// Performs one fetch.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Fetch `url`, through `proxy` when given, within `timeout`.
    async fn fetch(
        &self,
        url: &str,
        proxy: Option<&ProxyRoute>,
        timeout: Duration,
    ) -> Result<String, FetchError>;

    /// Drop whatever is kept per relay for `route`. Called once the relay is banned.
    fn release_route(&self, _route: &ProxyRoute) {}
}

// ============================================================================
// HTTP Fetcher
// ============================================================================

/// Relay clients kept before the cache is flushed.
const MAX_RELAY_CLIENTS: usize = 64;

/// reqwest-backed fetcher. One client per relay is built lazily and reused
/// until the relay is banned or the cache fills up.
pub struct HttpFetcher {
    name: String,
    clients: Mutex<HashMap<Option<String>, reqwest::Client>>,
}

impl HttpFetcher {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, proxy: Option<&ProxyRoute>) -> Result<reqwest::Client, FetchError> {
        let key = proxy.map(|p| p.url.clone());
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .gzip(true);
        if let Some(route) = proxy {
            let relay = reqwest::Proxy::all(&route.url).map_err(|e| {
                FetchError::ConnectionError(format!(
                    "invalid relay {}: {}",
                    route.display_address(),
                    e
                ))
            })?;
            builder = builder.proxy(relay);
        } else {
            builder = builder.no_proxy();
        }

        let client = builder
            .build()
            .map_err(|e| FetchError::ConnectionError(format!("failed to build client: {}", e)))?;
        if key.is_some() && clients.len() >= MAX_RELAY_CLIENTS {
            // Keep the direct client; relays rebuild theirs on next use
            clients.retain(|cached, _| cached.is_none());
            debug!(fetcher = %self.name, "Relay client cache flushed");
        }
        clients.insert(key, client.clone());
        Ok(client)
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new("http")
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        url: &str,
        proxy: Option<&ProxyRoute>,
        timeout: Duration,
    ) -> Result<String, FetchError> {
        let client = self.client_for(proxy)?;
        let user_agent = USER_AGENTS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(USER_AGENTS[0]);

        let via = proxy.map_or_else(|| "direct".to_string(), ProxyRoute::display_address);
        debug!(fetcher = %self.name, url = %url, proxy = %via, "Fetching");

        let response = client
            .get(url)
            .timeout(timeout)
            .header(reqwest::header::USER_AGENT, user_agent)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(
                status = status.as_u16(),
                body = %truncate_with_ellipsis(&body, ERROR_BODY_CHARS),
                "Non-success response"
            );
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let body = response.text().await.map_err(classify_reqwest_error)?;
        if body.trim().is_empty() {
            return Err(FetchError::ParseError("empty response body".into()));
        }
        Ok(body)
    }

    fn release_route(&self, route: &ProxyRoute) {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if clients.remove(&Some(route.url.clone())).is_some() {
            debug!(fetcher = %self.name, proxy = %route.display_address(), "Dropped relay client");
        }
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else if e.is_connect() {
        FetchError::ConnectionError("connection failed".into())
    } else if e.is_decode() {
        FetchError::ParseError(e.to_string())
    } else {
        FetchError::ConnectionError(e.to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================
