use std::collections::HashMap;
use std::io::prelude::*;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::StatusCode;

use crate::config::{CrawlerConfig, Throttle};
use crate::error::{ConfigError, FetchError};
use crate::identity::Identity;
use crate::limiter::RateLimiter;

/// Raw response handed to the extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub status: u16,
    pub body: String,
}

impl Payload {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// `204 No Content` or a blank body.
    pub fn is_empty(&self) -> bool {
        self.status == StatusCode::NO_CONTENT.as_u16() || self.body.trim().is_empty()
    }
}

/// A single network attempt. Implementations never retry on their own.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(
        &self,
        target: &str,
        identity: &Identity,
        timeout: Duration,
    ) -> Result<Payload, FetchError>;
}

pub struct HttpFetcher {
    direct: reqwest::Client,
    proxied: HashMap<Arc<str>, reqwest::Client>,
    base_headers: HeaderMap,
    block_markers: Vec<String>,
    limiter: Option<RateLimiter>,
}

impl HttpFetcher {
    /// Builds one client per configured proxy up front. Must be called from
    /// within a tokio runtime when a throttle is configured.
    pub fn new(config: &CrawlerConfig) -> Result<Self, ConfigError> {
        let direct = client_builder()
            .build()
            .map_err(|e| ConfigError(format!("Couldn't build HTTP client: {e}")))?;

        let mut proxied = HashMap::new();
        for proxy in &config.proxies {
            let client = reqwest::Proxy::all(proxy.as_str())
                .and_then(|p| client_builder().proxy(p).build())
                .map_err(|e| ConfigError(format!("Invalid proxy {proxy}: {e}")))?;
            proxied.insert(Arc::from(proxy.as_str()), client);
        }

        let mut base_headers = HeaderMap::new();
        for (name, value) in &config.base_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ConfigError(format!("Invalid header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ConfigError(format!("Invalid header value {value}: {e}")))?;
            base_headers.insert(name, value);
        }

        let limiter = config.throttle.map(|throttle| match throttle {
            Throttle::PerSecond(n) => RateLimiter::new(n.get()),
        });

        Ok(Self {
            direct,
            proxied,
            base_headers,
            block_markers: config
                .block_markers
                .iter()
                .map(|m| m.to_lowercase())
                .collect(),
            limiter,
        })
    }

    fn client_for(&self, identity: &Identity) -> &reqwest::Client {
        identity
            .proxy
            .as_ref()
            .and_then(|p| self.proxied.get(p))
            .unwrap_or(&self.direct)
    }

    fn headers_for(&self, identity: &Identity) -> HeaderMap {
        let mut headers = self.base_headers.clone();
        for (name, value) in identity.agent.hints() {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => log::warn!("Skipping invalid client hint {name}: {value}"),
            }
        }
        match HeaderValue::from_str(identity.user_agent()) {
            Ok(ua) => {
                headers.insert(USER_AGENT, ua);
            }
            Err(e) => log::warn!("Invalid user agent {:?}: {e}", identity.user_agent()),
        }
        headers
    }

    fn is_blocked_page(&self, body: &str) -> Option<&str> {
        if self.block_markers.is_empty() {
            return None;
        }
        let body = body.to_lowercase();
        self.block_markers
            .iter()
            .find(|m| body.contains(m.as_str()))
            .map(String::as_str)
    }
}

fn client_builder() -> reqwest::ClientBuilder {
    reqwest::ClientBuilder::new().gzip(true).deflate(true)
}

/// Maps a non-success status to the retry taxonomy.
pub fn classify_status(status: StatusCode) -> Option<FetchError> {
    if status.is_success() {
        return None;
    }
    let reason = format!("Not allowed status code: {status}");
    let err = match status {
        StatusCode::FORBIDDEN => FetchError::Blocked(reason),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            FetchError::Transient(reason)
        }
        s if s.is_server_error() => FetchError::Transient(reason),
        _ => FetchError::Permanent(reason),
    };
    Some(err)
}

fn classify_request_error(e: reqwest::Error) -> FetchError {
    if e.is_builder() {
        FetchError::Permanent(e.to_string())
    } else if let Some(status) = e.status() {
        classify_status(status).unwrap_or_else(|| FetchError::Transient(e.to_string()))
    } else {
        // timeouts, refused or reset connections, truncated bodies
        FetchError::Transient(e.to_string())
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(
        &self,
        target: &str,
        identity: &Identity,
        timeout: Duration,
    ) -> Result<Payload, FetchError> {
        let url = reqwest::Url::parse(target)
            .map_err(|e| FetchError::Permanent(format!("Malformed target {target}: {e}")))?;

        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        let resp = self
            .client_for(identity)
            .get(url)
            .headers(self.headers_for(identity))
            .timeout(timeout)
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = resp.status();
        if let Some(err) = classify_status(status) {
            return Err(err);
        }

        let body = match resp.headers().get(CONTENT_TYPE) {
            Some(c) if c == "application/x-gzip" || c == "application/gzip" => {
                let compressed = resp.bytes().await.map_err(classify_request_error)?;
                let mut gz = GzDecoder::new(&compressed[..]);
                let mut page = String::new();
                gz.read_to_string(&mut page)
                    .map_err(|e| FetchError::Transient(format!("Corrupted gzip body: {e}")))?;
                page
            }
            _ => resp.text().await.map_err(classify_request_error)?,
        };

        if let Some(marker) = self.is_blocked_page(&body) {
            return Err(FetchError::Blocked(format!(
                "Anti-bot page detected ({marker}) for {target}"
            )));
        }

        Ok(Payload {
            status: status.as_u16(),
            body,
        })
    }
}
