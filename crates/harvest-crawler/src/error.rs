use thiserror::Error;

/// Outcome of a single failed fetch attempt, classified for the retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Timeouts, connection resets and 429/5xx statuses.
    #[error("transient failure: {0}")]
    Transient(String),
    /// The remote answered with an anti-bot signal for this identity.
    #[error("blocked: {0}")]
    Blocked(String),
    /// Not worth retrying (404, malformed target, unparsable payload).
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("parse error: {0}")]
pub struct ParseError(pub String);

impl ParseError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<ParseError> for FetchError {
    fn from(e: ParseError) -> Self {
        Self::Permanent(e.to_string())
    }
}

impl From<serde_json::Error> for ParseError {
    fn from(e: serde_json::Error) -> Self {
        Self(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    /// The whole batch could not be delivered, it will be retried.
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    #[error("sink io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("distributor is draining and no longer accepts work")]
    Closed,
    #[error("work queue is full")]
    QueueFull,
}
