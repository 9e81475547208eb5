use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{self, BoxFuture};
use futures::{stream, Stream, StreamExt};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::OnceCell;
use tokio::time::sleep;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::config::CrawlerConfig;
use crate::distributor::Collaborators;
use crate::error::FetchError;
use crate::extractor::Extractor;
use crate::fetch::{Fetch, Payload};
use crate::identity::{Identity, IdentityRotator};
use crate::model::{CategoryEntry, CategoryTree, Discovered, DiscoveryError, LeafCategory, Subtree};
use crate::retry::{RetryDecision, RetryPolicy};

/// Expands the category taxonomy depth-first, fetching sibling subtrees
/// concurrently and reporting leaves as soon as they are known.
pub struct CategoryWalker {
    fetcher: Arc<dyn Fetch>,
    rotator: Arc<IdentityRotator>,
    extractor: Arc<dyn Extractor>,
    policy: RetryPolicy,
    request_timeout: Duration,
    concurrency: usize,
    max_depth: usize,
    cancel: CancellationToken,
    pages: Mutex<HashMap<String, Arc<OnceCell<Payload>>>>,
}

impl CategoryWalker {
    pub fn new(config: &CrawlerConfig, parts: &Collaborators) -> Self {
        Self {
            fetcher: parts.fetcher.clone(),
            rotator: parts.rotator.clone(),
            extractor: parts.extractor.clone(),
            policy: RetryPolicy::from_config(config),
            request_timeout: config.request_timeout(),
            concurrency: config.concurrency.max(1),
            max_depth: config.max_depth,
            cancel: CancellationToken::new(),
            pages: Mutex::new(HashMap::new()),
        }
    }

    /// Nodes not yet fetched when `cancel` fires are reported as errors.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Walks the whole taxonomy under `root`, sending every leaf and every
    /// failed node on `tx` as it goes.
    pub async fn walk(&self, root: CategoryEntry, tx: &UnboundedSender<Discovered>) -> CategoryTree {
        let subtree = self.expand(root, vec![], 0, tx).await;
        CategoryTree::from(subtree)
    }

    /// Lazy stream of discoveries; the walk makes progress as the stream is
    /// polled and the stream ends with the walk.
    pub fn discover_leaves(&self, root: CategoryEntry) -> impl Stream<Item = Discovered> + '_ {
        let (tx, rx) = mpsc::unbounded_channel();
        let walk = stream::once(async move {
            let tree = self.walk(root, &tx).await;
            log::info!(
                "Category walk finished with {} nodes, {} leaves",
                tree.len(),
                tree.leaves().count()
            );
        })
        .filter_map(|_| future::ready(None));
        stream::select(UnboundedReceiverStream::new(rx), walk)
    }

    fn expand<'a>(
        &'a self,
        mut entry: CategoryEntry,
        path: Vec<String>,
        depth: usize,
        tx: &'a UnboundedSender<Discovered>,
    ) -> BoxFuture<'a, Subtree> {
        Box::pin(async move {
            if depth > 0 && !entry.has_children {
                report(tx, Discovered::Leaf(LeafCategory::new(entry.clone(), path)));
                return Subtree {
                    entry,
                    children: vec![],
                };
            }

            if depth > self.max_depth {
                report(
                    tx,
                    Discovered::Error(DiscoveryError {
                        category_id: entry.id.clone(),
                        path,
                        attempts: 0,
                        reason: format!("deeper than {} levels", self.max_depth),
                    }),
                );
                return Subtree {
                    entry,
                    children: vec![],
                };
            }

            let children = match self.fetch_children(&entry, &path).await {
                Ok(children) => children,
                Err(e) => {
                    log::warn!(
                        "Couldn't expand category {} ({}): {}",
                        e.category_id,
                        e.path.join(" > "),
                        e.reason
                    );
                    report(tx, Discovered::Error(e));
                    return Subtree {
                        entry,
                        children: vec![],
                    };
                }
            };

            if children.is_empty() {
                entry.has_children = false;
                if depth > 0 {
                    report(tx, Discovered::Leaf(LeafCategory::new(entry.clone(), path)));
                }
                return Subtree {
                    entry,
                    children: vec![],
                };
            }

            log::debug!("Category {} has {} children", entry.id, children.len());
            let children = stream::iter(children)
                .map(|child| {
                    let mut child_path = path.clone();
                    child_path.push(child.name.clone());
                    self.expand(child, child_path, depth + 1, tx)
                })
                .buffered(self.concurrency)
                .collect::<Vec<_>>()
                .await;

            Subtree { entry, children }
        })
    }

    async fn fetch_children(
        &self,
        entry: &CategoryEntry,
        path: &[String],
    ) -> Result<Vec<CategoryEntry>, DiscoveryError> {
        let failed = |attempts: u32, reason: String| DiscoveryError {
            category_id: entry.id.clone(),
            path: path.to_vec(),
            attempts,
            reason,
        };

        let target = self.extractor.category_target(entry);
        let page = self.page(&target);
        let payload = page
            .get_or_try_init(|| self.fetch_page(&target, entry))
            .await
            .map_err(|(attempts, reason)| failed(attempts, reason))?;
        if payload.is_empty() {
            return Ok(vec![]);
        }
        self.extractor
            .parse_category_page(payload, entry)
            .map_err(|e| failed(1, FetchError::from(e).to_string()))
    }

    /// One cell per target. Nodes sharing a target share one download;
    /// failures are not cached.
    fn page(&self, target: &str) -> Arc<OnceCell<Payload>> {
        self.pages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(target.to_string())
            .or_default()
            .clone()
    }

    async fn fetch_page(
        &self,
        target: &str,
        entry: &CategoryEntry,
    ) -> Result<Payload, (u32, String)> {
        let mut retries = 0;
        let mut avoid: Option<Identity> = None;
        loop {
            if self.cancel.is_cancelled() {
                return Err((retries, "cancelled".into()));
            }
            let identity = match &avoid {
                Some(blocked) => self.rotator.next_excluding(blocked),
                None => self.rotator.next(),
            };

            let err = match self
                .fetcher
                .fetch(target, &identity, self.request_timeout)
                .await
            {
                Ok(payload) => return Ok(payload),
                Err(err) => err,
            };

            match self.policy.decide(retries, &err) {
                RetryDecision::Backoff(delay) => {
                    log::warn!(
                        "Category {} attempt {} failed: {err}, retrying in {delay:?}",
                        entry.id,
                        retries + 1
                    );
                    avoid = None;
                    tokio::select! {
                        _ = sleep(delay) => {},
                        _ = self.cancel.cancelled() => {},
                    }
                }
                RetryDecision::Rotate => {
                    log::warn!(
                        "Category {} blocked for {identity:?}, rotating identity",
                        entry.id
                    );
                    avoid = Some(identity);
                }
                RetryDecision::GiveUp => return Err((retries + 1, err.to_string())),
            }
            retries += 1;
        }
    }
}

fn report(tx: &UnboundedSender<Discovered>, discovered: Discovered) {
    // A dropped receiver only means nobody listens to discoveries anymore.
    let _ = tx.send(discovered);
}
