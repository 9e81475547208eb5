use std::pin::pin;

use chrono::Utc;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::CrawlerConfig;
use crate::distributor::{Collaborators, RunSettings, TaskDistributor};
use crate::error::ConfigError;
use crate::model::{CategoryEntry, Discovered, DiscoveryError, WorkItem};
use crate::stats::RunSummary;
use crate::walker::CategoryWalker;

/// Wires the category walk into the distributor: each leaf becomes a
/// listing work item while the walk is still going.
pub struct Pipeline {
    config: CrawlerConfig,
    parts: Collaborators,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(config: CrawlerConfig, parts: Collaborators) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            parts,
            cancel: CancellationToken::new(),
        })
    }

    /// Runs under an externally owned token instead of a fresh one.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Cancelling ends the walk, stops fetching and flushes what was
    /// already scraped.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(&self, root: CategoryEntry) -> RunSummary {
        let started_at = Utc::now();
        log::info!("Starting crawl from category {}", root.id);

        let mut distributor = TaskDistributor::with_cancellation(
            &self.config,
            self.parts.clone(),
            self.cancel.clone(),
        );
        distributor.run(RunSettings::from(&self.config));

        let walker =
            CategoryWalker::new(&self.config, &self.parts).with_cancellation(self.cancel.clone());
        let mut discoveries = pin!(walker.discover_leaves(root));

        let mut leaves_discovered = 0;
        let mut discovery_errors = vec![];
        while let Some(discovered) = discoveries.next().await {
            match discovered {
                Discovered::Leaf(leaf) => {
                    leaves_discovered += 1;
                    log::info!("Discovered leaf {leaf}");
                    let (category_id, path) = (leaf.entry.id.clone(), leaf.path.clone());
                    if let Err(e) = distributor.submit(WorkItem::listing(leaf, 1)).await {
                        let reason = if self.cancel.is_cancelled() {
                            "cancelled".to_string()
                        } else {
                            log::error!("Couldn't enqueue listing for {category_id}: {e}");
                            e.to_string()
                        };
                        discovery_errors.push(DiscoveryError {
                            category_id,
                            path,
                            attempts: 0,
                            reason,
                        });
                    }
                }
                Discovered::Error(e) => discovery_errors.push(e),
            }
        }

        let distributor = distributor.drain().await;
        let summary = RunSummary {
            started_at,
            finished_at: Utc::now(),
            leaves_discovered,
            discovery_errors,
            distributor,
        };
        log::info!("{summary}");
        summary
    }
}
