use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::SinkError;
use crate::model::ProductRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub product_id: u64,
    pub reason: String,
    /// Whether persisting the same record again may succeed.
    pub retryable: bool,
}

impl Rejection {
    pub fn malformed(product_id: u64, reason: impl Into<String>) -> Self {
        Self {
            product_id,
            reason: reason.into(),
            retryable: false,
        }
    }

    pub fn retryable(product_id: u64, reason: impl Into<String>) -> Self {
        Self {
            product_id,
            reason: reason.into(),
            retryable: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistOutcome {
    pub accepted: Vec<u64>,
    pub rejected: Vec<Rejection>,
}

impl PersistOutcome {
    pub fn all_accepted(batch: &[ProductRecord]) -> Self {
        Self {
            accepted: batch.iter().map(|r| r.product_id).collect(),
            rejected: vec![],
        }
    }
}

/// Durable destination for product batches.
///
/// Persisting is an upsert on `product_id`: storing the same id twice leaves
/// a single record behind. An `Err` means nothing in the batch was stored.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn persist_batch(&self, batch: &[ProductRecord]) -> Result<PersistOutcome, SinkError>;

    /// Called once after the final flush.
    async fn finalize(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Keeps everything in memory, keyed by product id.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<BTreeMap<u64, ProductRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ProductRecord> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, ProductRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn persist_batch(&self, batch: &[ProductRecord]) -> Result<PersistOutcome, SinkError> {
        let mut records = self.lock();
        for record in batch {
            records.insert(record.product_id, record.clone());
        }
        Ok(PersistOutcome::all_accepted(batch))
    }
}
