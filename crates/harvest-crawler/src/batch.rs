use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::model::ProductRecord;

#[derive(Debug, Clone, PartialEq)]
pub struct Buffered {
    pub record: ProductRecord,
    /// Times this record was already handed back by the sink.
    pub retries: u32,
}

impl Buffered {
    pub fn new(record: ProductRecord) -> Self {
        Self { record, retries: 0 }
    }
}

/// Workers stop taking new items once this many batches are waiting.
const BUFFERED_BATCHES: usize = 4;

/// Records waiting for the next flush. Appends and batch removal take the
/// same lock, so a record is either still buffered or owned by exactly one
/// batch.
///
/// The buffer is soft-capped at `BUFFERED_BATCHES` batches: `push` never
/// waits, but [`room`](Self::room) holds producers back until the flusher
/// has taken a batch out.
#[derive(Debug)]
pub struct BatchBuffer {
    entries: Mutex<VecDeque<Buffered>>,
    batch_size: usize,
    capacity: usize,
    full: Notify,
    drained: Notify,
}

impl BatchBuffer {
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            entries: Mutex::new(VecDeque::new()),
            batch_size,
            capacity: batch_size.saturating_mul(BUFFERED_BATCHES),
            full: Notify::new(),
            drained: Notify::new(),
        }
    }

    pub fn push(&self, entry: Buffered) {
        let len = {
            let mut entries = self.lock();
            entries.push_back(entry);
            entries.len()
        };
        if len >= self.batch_size {
            self.full.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.batch_size
    }

    /// Resolves once a push brought the buffer to the batch size.
    pub async fn filled(&self) {
        self.full.notified().await
    }

    /// Resolves once the buffer is below its soft cap.
    pub async fn room(&self) {
        loop {
            let drained = self.drained.notified();
            if self.len() < self.capacity {
                return;
            }
            drained.await;
        }
    }

    /// Removes up to `batch_size` records with distinct product ids, oldest
    /// first. Duplicates of an id already in the batch stay buffered.
    pub fn take_batch(&self) -> Vec<Buffered> {
        let mut entries = self.lock();
        let mut seen = HashSet::new();
        let mut batch = Vec::with_capacity(self.batch_size.min(entries.len()));
        let mut rest = VecDeque::with_capacity(entries.len());
        for entry in entries.drain(..) {
            if batch.len() < self.batch_size && seen.insert(entry.record.product_id) {
                batch.push(entry);
            } else {
                rest.push_back(entry);
            }
        }
        *entries = rest;
        drop(entries);
        if !batch.is_empty() {
            self.drained.notify_waiters();
        }
        batch
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Buffered>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    fn entry(id: u64) -> Buffered {
        Buffered::new(ProductRecord {
            product_id: id,
            ..Default::default()
        })
    }

    fn ids(batch: &[Buffered]) -> Vec<u64> {
        batch.iter().map(|b| b.record.product_id).collect()
    }

    #[test]
    fn batches_never_exceed_batch_size() {
        let buffer = BatchBuffer::new(4);
        (1..=6).for_each(|id| buffer.push(entry(id)));

        assert!(buffer.is_full());
        assert_eq!(ids(&buffer.take_batch()), vec![1, 2, 3, 4]);
        assert_eq!(ids(&buffer.take_batch()), vec![5, 6]);
        assert!(buffer.take_batch().is_empty());
    }

    #[test]
    fn duplicate_ids_are_deferred_to_the_next_batch() {
        let buffer = BatchBuffer::new(3);
        for id in [1, 2, 1, 3, 1] {
            buffer.push(entry(id));
        }

        assert_eq!(ids(&buffer.take_batch()), vec![1, 2, 3]);
        assert_eq!(ids(&buffer.take_batch()), vec![1]);
        assert_eq!(ids(&buffer.take_batch()), vec![1]);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn reaching_batch_size_wakes_the_flusher() {
        let buffer = BatchBuffer::new(2);
        buffer.push(entry(1));
        buffer.push(entry(2));
        // The permit is stored even though nobody was waiting yet.
        buffer.filled().await;
        assert_eq!(buffer.len(), 2);
    }

    #[tokio::test]
    async fn producers_wait_for_room_past_the_soft_cap() {
        let buffer = Arc::new(BatchBuffer::new(1));
        for id in 1..=BUFFERED_BATCHES as u64 {
            buffer.push(entry(id));
        }
        assert!(timeout(Duration::from_millis(50), buffer.room()).await.is_err());

        let waiting = tokio::spawn({
            let buffer = buffer.clone();
            async move { buffer.room().await }
        });
        tokio::task::yield_now().await;
        assert_eq!(ids(&buffer.take_batch()), vec![1]);

        timeout(Duration::from_secs(1), waiting).await.unwrap().unwrap();
    }
}
