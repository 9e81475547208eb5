use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::DiscoveryError;

/// An item that reached a terminal failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub item: String,
    pub reason: String,
}

/// Live counters shared by the workers and the flusher.
#[derive(Debug)]
pub struct RunStats {
    start_time: Instant,
    listing_pages_succeeded: AtomicUsize,
    listing_pages_failed: AtomicUsize,
    products_attempted: AtomicUsize,
    products_succeeded: AtomicUsize,
    products_failed: AtomicUsize,
    products_overflowed: AtomicUsize,
    retried: AtomicUsize,
    batches_flushed: AtomicUsize,
    overflow_batches: AtomicUsize,
    pending_at_shutdown: AtomicUsize,
    failures: Mutex<Vec<Failure>>,
}

impl Default for RunStats {
    fn default() -> Self {
        Self {
            start_time: Instant::now(),
            listing_pages_succeeded: AtomicUsize::new(0),
            listing_pages_failed: AtomicUsize::new(0),
            products_attempted: AtomicUsize::new(0),
            products_succeeded: AtomicUsize::new(0),
            products_failed: AtomicUsize::new(0),
            products_overflowed: AtomicUsize::new(0),
            retried: AtomicUsize::new(0),
            batches_flushed: AtomicUsize::new(0),
            overflow_batches: AtomicUsize::new(0),
            pending_at_shutdown: AtomicUsize::new(0),
            failures: Mutex::new(vec![]),
        }
    }
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn listing_succeeded(&self) {
        self.listing_pages_succeeded.fetch_add(1, Ordering::SeqCst);
    }

    pub fn listing_failed(&self, item: impl fmt::Display, reason: impl fmt::Display) {
        self.listing_pages_failed.fetch_add(1, Ordering::SeqCst);
        self.record_failure(item, reason);
    }

    pub fn product_attempted(&self) {
        self.products_attempted.fetch_add(1, Ordering::SeqCst);
    }

    pub fn products_succeeded(&self, n: usize) {
        self.products_succeeded.fetch_add(n, Ordering::SeqCst);
        self.log_progress();
    }

    pub fn product_failed(&self, item: impl fmt::Display, reason: impl fmt::Display) {
        self.products_failed.fetch_add(1, Ordering::SeqCst);
        self.record_failure(item, reason);
        self.log_progress();
    }

    pub fn products_overflowed(&self, n: usize) {
        self.products_overflowed.fetch_add(n, Ordering::SeqCst);
        self.overflow_batches.fetch_add(1, Ordering::SeqCst);
        self.log_progress();
    }

    pub fn retried(&self) {
        self.retried.fetch_add(1, Ordering::SeqCst);
    }

    pub fn batch_flushed(&self) {
        self.batches_flushed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn pending_at_shutdown(&self, item: impl fmt::Display) {
        log::warn!("Still pending at shutdown: {item}");
        self.pending_at_shutdown.fetch_add(1, Ordering::SeqCst);
    }

    fn record_failure(&self, item: impl fmt::Display, reason: impl fmt::Display) {
        let failure = Failure {
            item: item.to_string(),
            reason: reason.to_string(),
        };
        log::error!("Giving up on {}: {}", failure.item, failure.reason);
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(failure);
    }

    fn log_progress(&self) {
        let success = self.products_succeeded.load(Ordering::SeqCst);
        let failed = self.products_failed.load(Ordering::SeqCst)
            + self.products_overflowed.load(Ordering::SeqCst);
        let total = self.products_attempted.load(Ordering::SeqCst);
        if total > 0 {
            log::info!(
                "success: {success} / failed: {failed} / total: {total} progress: {:.2}% / exec time: {:?}",
                (success + failed) as f64 / total as f64 * 100.0,
                self.elapsed()
            );
        }
    }

    pub fn report(&self) -> DistributorReport {
        DistributorReport {
            listing_pages_succeeded: self.listing_pages_succeeded.load(Ordering::SeqCst),
            listing_pages_failed: self.listing_pages_failed.load(Ordering::SeqCst),
            products_attempted: self.products_attempted.load(Ordering::SeqCst),
            products_succeeded: self.products_succeeded.load(Ordering::SeqCst),
            products_failed: self.products_failed.load(Ordering::SeqCst),
            products_overflowed: self.products_overflowed.load(Ordering::SeqCst),
            retried: self.retried.load(Ordering::SeqCst),
            batches_flushed: self.batches_flushed.load(Ordering::SeqCst),
            overflow_batches: self.overflow_batches.load(Ordering::SeqCst),
            pending_at_shutdown: self.pending_at_shutdown.load(Ordering::SeqCst),
            failures: self
                .failures
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }
}

/// Aggregate counts returned by a drained distributor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributorReport {
    pub listing_pages_succeeded: usize,
    pub listing_pages_failed: usize,
    pub products_attempted: usize,
    pub products_succeeded: usize,
    pub products_failed: usize,
    pub products_overflowed: usize,
    pub retried: usize,
    pub batches_flushed: usize,
    pub overflow_batches: usize,
    pub pending_at_shutdown: usize,
    pub failures: Vec<Failure>,
}

/// What a whole pipeline run did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub leaves_discovered: usize,
    pub discovery_errors: Vec<DiscoveryError>,
    #[serde(flatten)]
    pub distributor: DistributorReport,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = &self.distributor;
        writeln!(
            f,
            "Run {} -> {} ({}s)",
            self.started_at.format("%Y-%m-%d %H:%M:%S"),
            self.finished_at.format("%Y-%m-%d %H:%M:%S"),
            (self.finished_at - self.started_at).num_seconds()
        )?;
        writeln!(
            f,
            "  leaves discovered:   {} ({} discovery errors)",
            self.leaves_discovered,
            self.discovery_errors.len()
        )?;
        writeln!(
            f,
            "  listing pages:       {} ok, {} failed",
            d.listing_pages_succeeded, d.listing_pages_failed
        )?;
        writeln!(
            f,
            "  products:            {} attempted, {} succeeded, {} failed, {} overflowed",
            d.products_attempted, d.products_succeeded, d.products_failed, d.products_overflowed
        )?;
        writeln!(f, "  retries:             {}", d.retried)?;
        writeln!(
            f,
            "  batches:             {} flushed, {} overflowed",
            d.batches_flushed, d.overflow_batches
        )?;
        write!(f, "  pending at shutdown: {}", d.pending_at_shutdown)
    }
}
