#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use harvest_crawler::{
    async_trait, CategoryEntry, Collaborators, CrawlerConfig, Extractor, Fetch, FetchError,
    Identity, IdentityRotator, LeafCategory, ListingPage, MemorySink, ParseError, Payload,
    PersistOutcome, ProductRecord, ProductRef, Rejection, SeededRandom, Sink, SinkError,
};

pub fn config() -> CrawlerConfig {
    CrawlerConfig {
        user_agents: vec!["agent-a".into(), "agent-b".into()],
        concurrency: 2,
        batch_size: 4,
        flush_interval_secs: 60,
        max_retries: 3,
        backoff_base_ms: 5,
        backoff_cap_ms: 20,
        request_timeout_secs: 5,
        sink_timeout_secs: 5,
        seed: Some(7),
        ..Default::default()
    }
}

pub fn parts(config: &CrawlerConfig, fetcher: Arc<ScriptedFetcher>, sink: Arc<ScriptedSink>) -> Collaborators {
    let rotator = IdentityRotator::new(
        config.proxies.clone(),
        config.user_agents.clone(),
        Box::new(SeededRandom::new(config.seed.unwrap_or_default())),
    )
    .unwrap();
    Collaborators {
        fetcher,
        rotator: Arc::new(rotator),
        extractor: Arc::new(LineExtractor),
        sink,
    }
}

pub fn ok(body: &str) -> Result<Payload, FetchError> {
    Ok(Payload::new(200, body))
}

pub fn transient() -> Result<Payload, FetchError> {
    Err(FetchError::Transient("503 Service Unavailable".into()))
}

pub fn blocked() -> Result<Payload, FetchError> {
    Err(FetchError::Blocked("403 Forbidden".into()))
}

pub fn not_found() -> Result<Payload, FetchError> {
    Err(FetchError::Permanent("404 Not Found".into()))
}

pub fn leaf(id: &str, path: &[&str]) -> LeafCategory {
    LeafCategory::new(
        CategoryEntry::new(id, *path.last().unwrap_or(&id), false),
        path.iter().map(|s| s.to_string()).collect(),
    )
}

/// Answers each target from a script. The last response of a script repeats.
#[derive(Default)]
pub struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, VecDeque<Result<Payload, FetchError>>>>,
    calls: Mutex<Vec<(String, Identity)>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(
        self,
        target: &str,
        responses: impl IntoIterator<Item = Result<Payload, FetchError>>,
    ) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(target.to_string(), responses.into_iter().collect());
        self
    }

    pub fn calls_to(&self, target: &str) -> usize {
        self.identities_for(target).len()
    }

    pub fn identities_for(&self, target: &str) -> Vec<Identity> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == target)
            .map(|(_, identity)| identity.clone())
            .collect()
    }
}

#[async_trait]
impl Fetch for ScriptedFetcher {
    async fn fetch(
        &self,
        target: &str,
        identity: &Identity,
        _timeout: Duration,
    ) -> Result<Payload, FetchError> {
        self.calls
            .lock()
            .unwrap()
            .push((target.to_string(), identity.clone()));
        tokio::task::yield_now().await;

        let mut scripts = self.scripts.lock().unwrap();
        let Some(script) = scripts.get_mut(target) else {
            return Err(FetchError::Permanent(format!("no route to {target}")));
        };
        match script.len() {
            0 => Err(FetchError::Permanent(format!("empty script for {target}"))),
            1 => script[0].clone(),
            _ => script.pop_front().unwrap(),
        }
    }
}

/// Plain-text payloads:
/// - category pages: `id|name|has_children` per line
/// - listing pages: optional `pages N`, then `detail <url>`, `resolved <record>`
///   or `garbled <reference>`
/// - records: `id|name|mrp|sp`
pub struct LineExtractor;

fn parse_record(line: &str) -> Result<ProductRecord, ParseError> {
    let fields = line.split('|').collect::<Vec<_>>();
    let [id, name, mrp, sp] = fields[..] else {
        return Err(ParseError::new(format!("bad record line {line:?}")));
    };
    let price = |s: &str| s.parse::<f64>().ok();
    Ok(ProductRecord {
        product_id: id
            .parse()
            .map_err(|_| ParseError::new(format!("bad product id {id:?}")))?,
        name: name.to_string(),
        price_mrp: price(mrp),
        price_sp: price(sp),
        ..Default::default()
    }
    .with_derived_discount())
}

impl Extractor for LineExtractor {
    fn category_target(&self, category: &CategoryEntry) -> String {
        format!("cat:{}", category.id)
    }

    fn listing_target(&self, leaf: &LeafCategory, page: u32) -> String {
        format!("list:{}:{page}", leaf.entry.id)
    }

    fn parse_category_page(
        &self,
        payload: &Payload,
        _parent: &CategoryEntry,
    ) -> Result<Vec<CategoryEntry>, ParseError> {
        payload
            .body
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|line| match line.split('|').collect::<Vec<_>>()[..] {
                [id, name, children] => Ok(CategoryEntry::new(id, name, children == "1")),
                _ => Err(ParseError::new(format!("bad category line {line:?}"))),
            })
            .collect()
    }

    fn parse_product_list_page(
        &self,
        payload: &Payload,
        _leaf: &LeafCategory,
    ) -> Result<ListingPage, ParseError> {
        let mut page = ListingPage::default();
        for line in payload.body.lines().filter(|l| !l.trim().is_empty()) {
            match line.split_once(' ') {
                Some(("pages", n)) => {
                    page.page_count = Some(n.parse().map_err(|_| ParseError::new("bad page count"))?)
                }
                Some(("detail", url)) => page.products.push(ProductRef::Detail(url.to_string())),
                Some(("resolved", record)) => page
                    .products
                    .push(ProductRef::Resolved(Box::new(parse_record(record)?))),
                Some(("garbled", reference)) => page.products.push(ProductRef::Unparsable {
                    reference: reference.to_string(),
                    reason: "garbled entry".into(),
                }),
                _ => return Err(ParseError::new(format!("bad listing line {line:?}"))),
            }
        }
        Ok(page)
    }

    fn parse_product_detail(
        &self,
        payload: &Payload,
        _leaf: &LeafCategory,
    ) -> Result<ProductRecord, ParseError> {
        parse_record(payload.body.trim())
    }
}

/// Sink over a [`MemorySink`] with scriptable failures.
#[derive(Default)]
pub struct ScriptedSink {
    inner: MemorySink,
    batches: Mutex<Vec<Vec<u64>>>,
    malformed: HashSet<u64>,
    flaky: Mutex<HashSet<u64>>,
    unavailable_calls: AtomicUsize,
    always_unavailable: bool,
    calls: AtomicUsize,
}

impl ScriptedSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// These ids are always rejected as malformed.
    pub fn malformed(mut self, ids: impl IntoIterator<Item = u64>) -> Self {
        self.malformed.extend(ids);
        self
    }

    /// These ids are rejected once as retryable, then accepted.
    pub fn flaky(self, ids: impl IntoIterator<Item = u64>) -> Self {
        self.flaky.lock().unwrap().extend(ids);
        self
    }

    /// The first `n` calls fail as a whole.
    pub fn unavailable_for(self, n: usize) -> Self {
        self.unavailable_calls.store(n, Ordering::SeqCst);
        self
    }

    pub fn down(mut self) -> Self {
        self.always_unavailable = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Ids of every batch the sink answered, in order.
    pub fn batches(&self) -> Vec<Vec<u64>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches().iter().map(Vec::len).collect()
    }

    pub fn records(&self) -> Vec<ProductRecord> {
        self.inner.records()
    }
}

#[async_trait]
impl Sink for ScriptedSink {
    async fn persist_batch(&self, batch: &[ProductRecord]) -> Result<PersistOutcome, SinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.always_unavailable {
            return Err(SinkError::Unavailable("connection refused".into()));
        }
        if self
            .unavailable_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SinkError::Unavailable("connection reset".into()));
        }

        self.batches
            .lock()
            .unwrap()
            .push(batch.iter().map(|r| r.product_id).collect());

        let mut outcome = PersistOutcome::default();
        let mut keep = vec![];
        for record in batch {
            let id = record.product_id;
            if self.malformed.contains(&id) {
                outcome.rejected.push(Rejection::malformed(id, "malformed record"));
            } else if self.flaky.lock().unwrap().remove(&id) {
                outcome.rejected.push(Rejection::retryable(id, "deadlock detected"));
            } else {
                keep.push(record.clone());
            }
        }
        let stored = self.inner.persist_batch(&keep).await?;
        outcome.accepted = stored.accepted;
        Ok(outcome)
    }
}
