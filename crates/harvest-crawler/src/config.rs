use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlerConfig {
    #[serde(default)]
    pub proxies: Vec<String>,

    #[serde(default)]
    pub user_agents: Vec<UserAgentProfile>,

    #[serde(default = "default_base_headers")]
    pub base_headers: BTreeMap<String, String>,

    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_on_queue_full")]
    pub on_queue_full: OnQueueFull,

    #[serde(default = "default_sink_max_attempts")]
    pub sink_max_attempts: u32,

    #[serde(default = "default_sink_timeout_secs")]
    pub sink_timeout_secs: u64,

    #[serde(default)]
    pub overflow_path: Option<PathBuf>,

    #[serde(default = "default_throttle")]
    pub throttle: Option<Throttle>,

    #[serde(default = "default_block_markers")]
    pub block_markers: Vec<String>,

    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            proxies: vec![],
            user_agents: vec![],
            base_headers: default_base_headers(),
            concurrency: default_concurrency(),
            batch_size: default_batch_size(),
            flush_interval_secs: default_flush_interval_secs(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            queue_capacity: default_queue_capacity(),
            on_queue_full: default_on_queue_full(),
            sink_max_attempts: default_sink_max_attempts(),
            sink_timeout_secs: default_sink_timeout_secs(),
            overflow_path: None,
            throttle: default_throttle(),
            block_markers: default_block_markers(),
            max_depth: default_max_depth(),
            seed: None,
        }
    }
}

impl CrawlerConfig {
    /// Rejects configurations that cannot start a run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.user_agents.is_empty() {
            return Err(ConfigError("user agent pool is empty".into()));
        }
        if self.concurrency == 0 {
            return Err(ConfigError("concurrency must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError("batch size must be at least 1".into()));
        }
        if self.flush_interval_secs == 0 {
            return Err(ConfigError("flush interval must be at least 1 second".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError("queue capacity must be at least 1".into()));
        }
        if self.sink_max_attempts == 0 {
            return Err(ConfigError("sink attempts must be at least 1".into()));
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return Err(ConfigError(format!(
                "backoff cap ({}ms) is lower than backoff base ({}ms)",
                self.backoff_cap_ms, self.backoff_base_ms
            )));
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_secs(self.sink_timeout_secs)
    }
}

/// A user agent, optionally paired with the client-hint headers that
/// a real browser would send alongside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserAgentProfile {
    Plain(String),
    #[serde(rename_all = "camelCase")]
    WithHints {
        user_agent: String,
        #[serde(flatten)]
        hints: BTreeMap<String, String>,
    },
}

impl UserAgentProfile {
    pub fn user_agent(&self) -> &str {
        match self {
            Self::Plain(ua) => ua,
            Self::WithHints { user_agent, .. } => user_agent,
        }
    }

    pub fn hints(&self) -> impl Iterator<Item = (&str, &str)> {
        let hints = match self {
            Self::Plain(_) => None,
            Self::WithHints { hints, .. } => Some(hints),
        };
        hints
            .into_iter()
            .flatten()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl From<&str> for UserAgentProfile {
    fn from(ua: &str) -> Self {
        Self::Plain(ua.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum OnQueueFull {
    /// Wait until a slot frees up
    Block,
    /// Return `SubmitError::QueueFull` to the caller
    Reject,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum Throttle {
    /// The number of requests per second
    PerSecond(NonZeroUsize),
}

fn default_base_headers() -> BTreeMap<String, String> {
    [
        ("accept", "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        ("accept-language", "en,en-US;q=0.9"),
        ("cache-control", "max-age=0"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn default_concurrency() -> usize {
    20
}

fn default_batch_size() -> usize {
    250
}

fn default_flush_interval_secs() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    1_500
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_on_queue_full() -> OnQueueFull {
    OnQueueFull::Block
}

fn default_sink_max_attempts() -> u32 {
    3
}

fn default_sink_timeout_secs() -> u64 {
    30
}

fn default_throttle() -> Option<Throttle> {
    None
}

fn default_block_markers() -> Vec<String> {
    vec!["captcha".into(), "Access Denied".into()]
}

fn default_max_depth() -> usize {
    8
}
