use crate::storage::index_table::RecordId;
use bson::Document;
use crossbeam_skiplist::SkipMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A stored document and the version of the write that produced it.
#[derive(Debug)]
pub struct Record {
    pub version: u64,
    pub doc: Arc<Document>,
}

/// Documents of a collection ordered by record id.
pub struct RecordStore {
    records: SkipMap<RecordId, Arc<Record>>,
    next_record_id: AtomicU64,
}

impl RecordStore {
    pub fn new() -> Self {
        RecordStore {
            records: SkipMap::new(),
            next_record_id: AtomicU64::new(1),
        }
    }

    pub fn next_record_id(&self) -> RecordId {
        self.next_record_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn get(&self, record_id: RecordId) -> Option<Arc<Record>> {
        self.records.get(&record_id).map(|e| e.value().clone())
    }

    pub fn put(&self, record_id: RecordId, version: u64, doc: Arc<Document>) {
        self.records.insert(record_id, Arc::new(Record { version, doc }));
    }

    pub fn remove(&self, record_id: RecordId) -> Option<Arc<Record>> {
        self.records.remove(&record_id).map(|e| e.value().clone())
    }

    /// Returns the record following `after` in record id order, or the first
    /// one when `after` is `None`. With `forward == false` the order is reversed.
    pub fn next_after(&self, after: Option<RecordId>, forward: bool) -> Option<(RecordId, Arc<Record>)> {
        let entry = match (after, forward) {
            (None, true) => self.records.front(),
            (None, false) => self.records.back(),
            (Some(id), true) => self.records.lower_bound(Bound::Excluded(&id)),
            (Some(id), false) => self.records.upper_bound(Bound::Excluded(&id)),
        };
        entry.map(|e| (*e.key(), e.value().clone()))
    }
}
