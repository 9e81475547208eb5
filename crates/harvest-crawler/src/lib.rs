mod batch;
mod config;
mod distributor;
mod error;
mod extractor;
mod fetch;
mod identity;
mod limiter;
mod model;
mod overflow;
mod pipeline;
mod retry;
mod sink;
mod stats;
mod walker;

pub use batch::{BatchBuffer, Buffered};
pub use config::{CrawlerConfig, OnQueueFull, Throttle, UserAgentProfile};
pub use distributor::{Collaborators, RunSettings, TaskDistributor};
pub use error::{ConfigError, FetchError, ParseError, SinkError, SubmitError};
pub use extractor::Extractor;
pub use fetch::{classify_status, Fetch, HttpFetcher, Payload};
pub use identity::{Identity, IdentityRotator, RandomSource, SeededRandom, ThreadRandom};
pub use model::{
    CategoryEntry, CategoryNode, CategoryTree, Discovered, DiscoveryError, LeafCategory,
    ListingPage, NodeId, ProductRecord, ProductRef, Subtree, WorkItem, WorkKind,
};
pub use overflow::OverflowLog;
pub use pipeline::Pipeline;
pub use retry::{RetryDecision, RetryPolicy};
pub use sink::{MemorySink, PersistOutcome, Rejection, Sink};
pub use stats::{DistributorReport, Failure, RunStats, RunSummary};
pub use walker::CategoryWalker;

pub use anyhow;
pub use async_trait::async_trait;
