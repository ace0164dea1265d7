use hwvtep_southbound_sdk::TransactionRecord;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};
use tracing::warn;

/// Bounded, append-only audit log of device transactions.
///
/// Oldest records are evicted first once `capacity` is reached. Every
/// `log_threshold` evictions a warning is emitted so operators notice that
/// audit data is being dropped.
#[derive(Debug)]
pub struct TransactionHistory {
    name: &'static str,
    capacity: usize,
    log_threshold: u64,
    records: Mutex<VecDeque<Arc<TransactionRecord>>>,
    total_recorded: AtomicU64,
    evicted: AtomicU64,
}

impl TransactionHistory {
    pub fn new(capacity: usize, log_threshold: usize) -> Self {
        Self::named("transaction", capacity, log_threshold)
    }

    /// Same as [`TransactionHistory::new`] with a label used in log output.
    pub fn named(name: &'static str, capacity: usize, log_threshold: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name,
            capacity,
            log_threshold: log_threshold.max(1) as u64,
            records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            total_recorded: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn record(&self, entry: TransactionRecord) {
        let entry = Arc::new(entry);
        let dropped = {
            let mut records = self.records.lock().unwrap();
            let dropped = if records.len() >= self.capacity {
                records.pop_front().is_some()
            } else {
                false
            };
            records.push_back(entry);
            dropped
        };
        let total = self.total_recorded.fetch_add(1, Ordering::AcqRel) + 1;
        if dropped {
            let evicted = self.evicted.fetch_add(1, Ordering::AcqRel) + 1;
            if evicted % self.log_threshold == 0 {
                warn!(
                    history = self.name,
                    capacity = self.capacity,
                    total_recorded = total,
                    evicted,
                    "Transaction history is evicting old records"
                );
            }
        }
    }

    /// Ordered copy, oldest first. Later writes do not affect the snapshot.
    pub fn snapshot(&self) -> Arc<[Arc<TransactionRecord>]> {
        let records = self.records.lock().unwrap();
        records.iter().cloned().collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn total_recorded(&self) -> u64 {
        self.total_recorded.load(Ordering::Acquire)
    }

    #[inline]
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Acquire)
    }
}
