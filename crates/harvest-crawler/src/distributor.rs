use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::batch::{BatchBuffer, Buffered};
use crate::config::{CrawlerConfig, OnQueueFull};
use crate::error::{FetchError, SinkError, SubmitError};
use crate::extractor::Extractor;
use crate::fetch::{Fetch, Payload};
use crate::identity::IdentityRotator;
use crate::model::{ListingPage, ProductRef, WorkItem, WorkKind};
use crate::overflow::OverflowLog;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::sink::{PersistOutcome, Sink};
use crate::stats::{DistributorReport, RunStats};

/// The capabilities a run is wired with.
#[derive(Clone)]
pub struct Collaborators {
    pub fetcher: Arc<dyn Fetch>,
    pub rotator: Arc<IdentityRotator>,
    pub extractor: Arc<dyn Extractor>,
    pub sink: Arc<dyn Sink>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSettings {
    pub concurrency: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl From<&CrawlerConfig> for RunSettings {
    fn from(config: &CrawlerConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            batch_size: config.batch_size,
            flush_interval: config.flush_interval(),
        }
    }
}

struct Queued {
    item: WorkItem,
    // Held while the item sits in the queue, released on dequeue.
    _slot: Option<OwnedSemaphorePermit>,
}

struct Shared {
    parts: Collaborators,
    policy: RetryPolicy,
    request_timeout: Duration,
    sink_timeout: Duration,
    sink_max_attempts: u32,
    on_queue_full: OnQueueFull,
    overflow: OverflowLog,
    stats: Arc<RunStats>,

    tx: mpsc::UnboundedSender<Queued>,
    rx: Mutex<mpsc::UnboundedReceiver<Queued>>,
    slots: Arc<Semaphore>,
    accepting: AtomicBool,

    /// Items queued, being processed, waiting out a backoff, or a flush in
    /// progress. Zero means the run has nothing left to do.
    pending: AtomicUsize,
    idle: Notify,

    cancel: CancellationToken,
    stop: CancellationToken,
    finish: CancellationToken,
    sleepers: TaskTracker,
}

struct Running {
    workers: Vec<JoinHandle<()>>,
    flusher: JoinHandle<()>,
}

/// Runs work items over a fixed pool of workers and feeds the resulting
/// records to the sink in bounded batches.
pub struct TaskDistributor {
    shared: Arc<Shared>,
    defaults: RunSettings,
    running: Option<Running>,
}

impl TaskDistributor {
    pub fn new(config: &CrawlerConfig, parts: Collaborators) -> Self {
        Self::with_cancellation(config, parts, CancellationToken::new())
    }

    pub fn with_cancellation(
        config: &CrawlerConfig,
        parts: Collaborators,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = cancel.child_token();
        let shared = Shared {
            parts,
            policy: RetryPolicy::from_config(config),
            request_timeout: config.request_timeout(),
            sink_timeout: config.sink_timeout(),
            sink_max_attempts: config.sink_max_attempts.max(1),
            on_queue_full: config.on_queue_full,
            overflow: OverflowLog::new(config.overflow_path.clone()),
            stats: Arc::new(RunStats::new()),
            tx,
            rx: Mutex::new(rx),
            slots: Arc::new(Semaphore::new(config.queue_capacity.max(1))),
            accepting: AtomicBool::new(true),
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
            cancel,
            stop,
            finish: CancellationToken::new(),
            sleepers: TaskTracker::new(),
        };
        Self {
            shared: Arc::new(shared),
            defaults: RunSettings::from(config),
            running: None,
        }
    }

    /// Cancelling stops new fetch attempts; buffered records are still flushed
    /// by [`drain`](Self::drain).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    pub fn stats(&self) -> Arc<RunStats> {
        self.shared.stats.clone()
    }

    /// Enqueues one item. Once the queue holds `queue_capacity` external
    /// items this either waits for room or fails, per `on_queue_full`.
    /// A cancelled run accepts nothing and releases waiting callers.
    pub async fn submit(&self, item: WorkItem) -> Result<(), SubmitError> {
        let shared = &self.shared;
        if !shared.accepting.load(Ordering::SeqCst) || shared.cancel.is_cancelled() {
            return Err(SubmitError::Closed);
        }
        let slot = match shared.on_queue_full {
            OnQueueFull::Block => tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => return Err(SubmitError::Closed),
                slot = shared.slots.clone().acquire_owned() => {
                    slot.map_err(|_| SubmitError::Closed)?
                }
            },
            OnQueueFull::Reject => {
                shared
                    .slots
                    .clone()
                    .try_acquire_owned()
                    .map_err(|e| match e {
                        TryAcquireError::NoPermits => SubmitError::QueueFull,
                        TryAcquireError::Closed => SubmitError::Closed,
                    })?
            }
        };
        shared.count_new(&item);
        shared.pending.fetch_add(1, Ordering::SeqCst);
        shared.send(Queued {
            item,
            _slot: Some(slot),
        });
        Ok(())
    }

    /// Starts the workers and the flusher. Items submitted earlier are
    /// picked up immediately.
    pub fn run(&mut self, settings: RunSettings) {
        if self.running.is_some() {
            log::warn!("Distributor already running, ignoring {settings:?}");
            return;
        }
        let buffer = Arc::new(BatchBuffer::new(settings.batch_size));

        let workers = (0..settings.concurrency.max(1))
            .map(|id| tokio::spawn(self.shared.clone().work(id, buffer.clone())))
            .collect();
        let flusher = tokio::spawn(
            self.shared
                .clone()
                .flush_loop(buffer, settings.flush_interval),
        );

        log::info!(
            "Started {} workers, batch size {}, flush interval {:?}",
            settings.concurrency,
            settings.batch_size,
            settings.flush_interval
        );
        self.running = Some(Running { workers, flusher });
    }

    /// Stops accepting submissions, waits for outstanding work (or for
    /// cancellation), flushes what is buffered and reports.
    pub async fn drain(mut self) -> DistributorReport {
        if self.running.is_none() {
            self.run(self.defaults);
        }
        let shared = self.shared.clone();
        shared.accepting.store(false, Ordering::SeqCst);
        shared.slots.close();

        loop {
            let idle = shared.idle.notified();
            if shared.pending.load(Ordering::SeqCst) == 0 {
                break;
            }
            tokio::select! {
                _ = idle => {},
                _ = shared.cancel.cancelled() => {
                    log::warn!("Run cancelled, finishing in-flight attempts");
                    break;
                }
            }
        }

        shared.stop.cancel();
        if let Some(Running { workers, flusher }) = self.running.take() {
            for w in workers {
                if let Err(e) = w.await {
                    log::error!("Worker ended abnormally: {e}");
                }
            }
            shared.sleepers.close();
            shared.sleepers.wait().await;

            shared.finish.cancel();
            if let Err(e) = flusher.await {
                log::error!("Flusher ended abnormally: {e}");
            }
        }

        let report = shared.stats.report();
        log::info!(
            "Drained: {} succeeded, {} retried, {} failed, {} overflowed, {} pending",
            report.products_succeeded,
            report.retried,
            report.products_failed,
            report.products_overflowed,
            report.pending_at_shutdown
        );
        report
    }
}

/// Marks one unit of pending work as done when dropped, even on panic.
struct InFlight<'a>(&'a Shared);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.done_one();
    }
}

impl Shared {
    fn done_one(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn count_new(&self, item: &WorkItem) {
        if item.retries == 0 && matches!(item.kind, WorkKind::Product { .. }) {
            self.stats.product_attempted();
        }
    }

    fn send(&self, queued: Queued) {
        if let Err(mpsc::error::SendError(queued)) = self.tx.send(queued) {
            self.stats.pending_at_shutdown(&queued.item);
            self.done_one();
        }
    }

    /// Follow-up work produced by the run itself; bypasses the capacity
    /// limit so workers never wait on their own queue.
    fn enqueue(&self, item: WorkItem) {
        self.count_new(&item);
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.send(Queued { item, _slot: None });
    }

    fn schedule_retry(self: &Arc<Self>, item: WorkItem, delay: Duration) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let shared = self.clone();
        self.sleepers.spawn(async move {
            tokio::select! {
                _ = sleep(delay) => {},
                _ = shared.stop.cancelled() => {},
            }
            shared.send(Queued { item, _slot: None });
        });
    }

    async fn next_item(&self) -> Option<WorkItem> {
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => None,
            queued = async { self.rx.lock().await.recv().await } => queued.map(|q| q.item),
        }
    }

    async fn work(self: Arc<Self>, id: usize, buffer: Arc<BatchBuffer>) {
        log::debug!("Worker {id} started");
        loop {
            // Backpressure while the flusher is behind, e.g. a slow sink.
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                _ = buffer.room() => {}
            }
            let Some(item) = self.next_item().await else {
                break;
            };
            let _in_flight = InFlight(&self);
            self.process(item, &buffer).await;
        }
        log::debug!("Worker {id} finished");
    }

    async fn process(self: &Arc<Self>, item: WorkItem, buffer: &BatchBuffer) {
        if let WorkKind::RePersist { record } = item.kind {
            buffer.push(Buffered {
                record: *record,
                retries: item.retries,
            });
            return;
        }
        let target = match &item.kind {
            WorkKind::Listing { leaf, page } => self.parts.extractor.listing_target(leaf, *page),
            WorkKind::Product { url, .. } => url.clone(),
            WorkKind::RePersist { .. } => return,
        };

        let identity = match &item.avoid {
            Some(blocked) => self.parts.rotator.next_excluding(blocked),
            None => self.parts.rotator.next(),
        };

        let res = match self
            .parts
            .fetcher
            .fetch(&target, &identity, self.request_timeout)
            .await
        {
            Ok(payload) => self.handle_payload(&item, payload, buffer),
            Err(e) => Err(e),
        };

        let Err(err) = res else {
            return;
        };

        match self.policy.decide(item.retries, &err) {
            RetryDecision::Backoff(delay) => {
                log::warn!(
                    "Attempt {} for {item} failed: {err}, retrying in {delay:?}",
                    item.retries + 1
                );
                self.stats.retried();
                self.schedule_retry(item.retry(None), delay);
            }
            RetryDecision::Rotate => {
                log::warn!("{item} blocked for {identity:?}, rotating identity");
                self.stats.retried();
                self.enqueue(item.retry(Some(identity)));
            }
            RetryDecision::GiveUp => match item.kind {
                WorkKind::Listing { .. } => self.stats.listing_failed(&item, &err),
                _ => self.stats.product_failed(&item, &err),
            },
        }
    }

    fn handle_payload(
        &self,
        item: &WorkItem,
        payload: Payload,
        buffer: &BatchBuffer,
    ) -> Result<(), FetchError> {
        match &item.kind {
            WorkKind::Listing { leaf, page } => {
                let listing = if payload.is_empty() {
                    ListingPage::default()
                } else {
                    self.parts.extractor.parse_product_list_page(&payload, leaf)?
                };
                self.stats.listing_succeeded();
                log::info!(
                    "Successfully parsed {page}/{} for category {leaf}",
                    listing.page_count.unwrap_or(*page)
                );

                if *page == 1 {
                    for next in 2..=listing.page_count.unwrap_or(1) {
                        self.enqueue(WorkItem::listing(leaf.clone(), next));
                    }
                }
                for product in listing.products {
                    match product {
                        ProductRef::Detail(url) => {
                            self.enqueue(WorkItem::product(url, leaf.clone()));
                        }
                        ProductRef::Unparsable { reference, reason } => {
                            self.stats.product_attempted();
                            self.stats
                                .product_failed(format!("product {reference} in {leaf}"), reason);
                        }
                        ProductRef::Resolved(record) => {
                            self.stats.product_attempted();
                            let record = record.with_category_fallback(leaf);
                            match record.validate() {
                                Ok(()) => buffer.push(Buffered::new(record)),
                                Err(e) => self
                                    .stats
                                    .product_failed(format!("product {}", record.product_id), e),
                            }
                        }
                    }
                }
            }
            WorkKind::Product { leaf, url } => {
                if payload.is_empty() {
                    return Err(FetchError::Permanent(format!("Empty payload for {url}")));
                }
                let record = self
                    .parts
                    .extractor
                    .parse_product_detail(&payload, leaf)?
                    .with_category_fallback(leaf);
                record.validate()?;
                buffer.push(Buffered::new(record));
            }
            WorkKind::RePersist { .. } => {}
        }
        Ok(())
    }

    async fn flush_loop(self: Arc<Self>, buffer: Arc<BatchBuffer>, flush_interval: Duration) {
        let mut last_flush = Instant::now();
        loop {
            tokio::select! {
                _ = buffer.filled() => {
                    while buffer.is_full() {
                        self.flush(&buffer, false).await;
                    }
                    last_flush = Instant::now();
                }
                _ = sleep_until(last_flush + flush_interval) => {
                    if !buffer.is_empty() {
                        log::debug!("Flush interval elapsed with {} buffered records", buffer.len());
                        self.flush(&buffer, false).await;
                    }
                    last_flush = Instant::now();
                }
                _ = self.finish.cancelled() => break,
            }
        }

        // Workers and backoff timers are gone. Whatever is still queued is
        // either a record to persist or work that never started.
        while let Ok(Queued { item, .. }) = self.rx.lock().await.try_recv() {
            let _in_flight = InFlight(&self);
            match item.kind {
                WorkKind::RePersist { record } => buffer.push(Buffered {
                    record: *record,
                    retries: item.retries,
                }),
                _ => self.stats.pending_at_shutdown(&item),
            }
        }
        while !buffer.is_empty() {
            self.flush(&buffer, true).await;
        }
        if let Err(e) = self.parts.sink.finalize().await {
            log::error!("Couldn't finalize sink: {e}");
        }
    }

    /// Persists one batch. During the final pass, retryable rejections go
    /// straight back into the buffer instead of through the queue.
    async fn flush(&self, buffer: &BatchBuffer, final_pass: bool) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight(self);

        let batch = buffer.take_batch();
        if batch.is_empty() {
            return;
        }
        let records = batch.iter().map(|b| b.record.clone()).collect::<Vec<_>>();
        log::info!("Saving batch of {} records", records.len());

        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            let res = match timeout(self.sink_timeout, self.parts.sink.persist_batch(&records)).await
            {
                Ok(res) => res,
                Err(_) => Err(SinkError::Unavailable(format!(
                    "no answer within {:?}",
                    self.sink_timeout
                ))),
            };
            match res {
                Ok(outcome) => break outcome,
                Err(e) if attempt < self.sink_max_attempts => {
                    let delay = self.policy.delay(attempt - 1);
                    log::warn!("Saving attempt {attempt} failed: {e}, retrying in {delay:?}");
                    sleep(delay).await;
                }
                Err(e) => {
                    log::error!("Saving failed after {attempt} attempts: {e}");
                    if let Err(io) = self.overflow.record(&records, &e.to_string()) {
                        log::error!("Couldn't write overflow report: {io}");
                    }
                    self.stats.products_overflowed(records.len());
                    return;
                }
            }
        };

        self.stats.batch_flushed();
        self.settle(batch, outcome, buffer, final_pass);
    }

    fn settle(
        &self,
        batch: Vec<Buffered>,
        outcome: PersistOutcome,
        buffer: &BatchBuffer,
        final_pass: bool,
    ) {
        let mut in_batch = batch
            .into_iter()
            .map(|b| (b.record.product_id, b))
            .collect::<HashMap<_, _>>();

        let mut succeeded = 0;
        for id in &outcome.accepted {
            if in_batch.remove(id).is_some() {
                succeeded += 1;
            }
        }
        if succeeded > 0 {
            self.stats.products_succeeded(succeeded);
        }

        let mut rejected = outcome
            .rejected
            .into_iter()
            .filter_map(|r| in_batch.remove(&r.product_id).map(|b| (b, r.reason, r.retryable)))
            .collect::<Vec<_>>();
        // Anything the sink neither accepted nor rejected gets another try.
        rejected.extend(
            in_batch
                .into_values()
                .map(|b| (b, "not acknowledged by sink".to_string(), true)),
        );

        for (entry, reason, retryable) in rejected {
            let id = entry.record.product_id;
            if !retryable || entry.retries >= self.policy.max_retries {
                self.stats.product_failed(format!("product {id}"), reason);
                continue;
            }
            log::warn!("Sink rejected product {id}: {reason}, persisting again");
            self.stats.retried();
            if final_pass {
                buffer.push(Buffered {
                    record: entry.record,
                    retries: entry.retries + 1,
                });
            } else {
                self.enqueue(WorkItem::re_persist(entry.record, entry.retries + 1));
            }
        }
    }
}

impl std::fmt::Debug for TaskDistributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDistributor")
            .field("pending", &self.shared.pending.load(Ordering::SeqCst))
            .field("running", &self.running.is_some())
            .finish()
    }
}
