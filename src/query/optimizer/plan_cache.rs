use crate::obs::metrics::PlannerMetrics;
use crate::query::physical_plan::{summary, AccessPlan};
use crate::query::shape::QueryShape;
use crate::storage::catalog::IndexRef;
use bson::{doc, Bson, Document};
use moka::sync::Cache;
use std::sync::Arc;
use tracing::{debug, info};

/// Winning plan of a query shape.
#[derive(Debug, Clone)]
pub struct PlanCacheEntry {
    pub shape: QueryShape,
    pub plan: AccessPlan,
    /// Inactive entries are only candidates: the shape is still multiplanned
    /// until the same plan wins again.
    pub is_active: bool,
    /// Works the plan needed to produce its first batch.
    pub works: u64,
    /// Plan epoch of the collection when the plan was chosen.
    pub plan_epoch: u64,
    pub indexes: Vec<IndexRef>,
    /// The query that created the entry, as reported by `list`.
    pub created_from: Document,
}

impl PlanCacheEntry {
    pub fn uses_index(&self, name: &str) -> bool {
        self.indexes.iter().any(|i| i.name == name)
    }

    fn describe(&self) -> Document {
        doc! {
            "queryHash": self.shape.query_hash_hex(),
            "planCacheKey": self.shape.plan_cache_key_hex(),
            "isActive": self.is_active,
            "works": self.works as i64,
            "planEpoch": self.plan_epoch as i64,
            "plan": summary(&self.plan.root),
            "indexes": self.indexes.iter().map(|i| Bson::String(i.name.clone())).collect::<Vec<_>>(),
            "createdFromQuery": self.created_from.clone(),
        }
    }
}

/// What recording a multiplanning winner did to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    CreatedInactive,
    ReplacedInactive,
    Activated,
    /// An active entry already exists for the shape.
    Unchanged,
}

/// Plans of the query shapes of one collection.
///
/// Lookups and updates are atomic per entry. Invalidations triggered by
/// catalog changes may race with queries planned against the previous
/// catalog: such entries carry an older plan epoch and are dropped when read.
pub struct PlanCache {
    cache: Cache<u64, Arc<PlanCacheEntry>>,
    metrics: Arc<PlannerMetrics>,
}

impl PlanCache {
    pub fn new(max_entries: u64, metrics: Arc<PlannerMetrics>) -> Self {
        let cache = Cache::builder().max_capacity(max_entries).build();
        info!("PlanCache initialized with {} entries", max_entries);
        PlanCache { cache, metrics }
    }

    /// Returns the entry of a shape, dropping it if it was built against an
    /// older plan epoch.
    pub fn get(&self, shape: &QueryShape, plan_epoch: u64) -> Option<Arc<PlanCacheEntry>> {
        let entry = self.cache.get(&shape.plan_cache_key)?;
        if entry.plan_epoch != plan_epoch {
            debug!(
                "Dropping stale plan cache entry {} (epoch {} < {})",
                shape.plan_cache_key_hex(),
                entry.plan_epoch,
                plan_epoch
            );
            self.cache.invalidate(&shape.plan_cache_key);
            self.metrics.plan_cache_invalidations.inc();
            return None;
        }
        Some(entry)
    }

    /// Records the winner of a multiplanning round.
    ///
    /// The first win creates an inactive entry. A second win of the same plan
    /// activates it, while a different winner replaces the inactive entry.
    pub fn record_winner(&self, entry: PlanCacheEntry) -> RecordOutcome {
        let key = entry.shape.plan_cache_key;
        let outcome = match self.cache.get(&key) {
            Some(existing) if existing.is_active && existing.plan_epoch == entry.plan_epoch => {
                return RecordOutcome::Unchanged
            }
            Some(existing) if existing.plan == entry.plan && existing.plan_epoch == entry.plan_epoch => {
                self.cache.insert(
                    key,
                    Arc::new(PlanCacheEntry {
                        is_active: true,
                        ..entry
                    }),
                );
                RecordOutcome::Activated
            }
            Some(_) => {
                self.cache.insert(key, Arc::new(PlanCacheEntry { is_active: false, ..entry }));
                RecordOutcome::ReplacedInactive
            }
            None => {
                self.cache.insert(key, Arc::new(PlanCacheEntry { is_active: false, ..entry }));
                RecordOutcome::CreatedInactive
            }
        };
        debug!("Plan cache entry {:016X}: {:?}", key, outcome);
        outcome
    }

    /// Turns an active entry back into a candidate, after its plan performed
    /// much worse than during its trial.
    pub fn deactivate(&self, shape: &QueryShape) {
        if let Some(entry) = self.cache.get(&shape.plan_cache_key) {
            let works = entry.works.saturating_mul(2);
            self.cache.insert(
                shape.plan_cache_key,
                Arc::new(PlanCacheEntry {
                    is_active: false,
                    works,
                    ..entry.as_ref().clone()
                }),
            );
            debug!("Deactivated plan cache entry {}", shape.plan_cache_key_hex());
        }
    }

    /// Removes the entries whose plan reads the index.
    pub fn remove_plans_using(&self, index_name: &str) -> usize {
        let keys: Vec<u64> = self
            .cache
            .iter()
            .filter(|(_, entry)| entry.uses_index(index_name))
            .map(|(key, _)| *key)
            .collect();
        for key in &keys {
            self.cache.invalidate(key);
        }
        self.metrics.plan_cache_invalidations.inc_by(keys.len() as u64);
        info!("Removed {} plan cache entries using index {}", keys.len(), index_name);
        keys.len()
    }

    pub fn clear(&self) {
        let count = self.cache.iter().count();
        self.cache.invalidate_all();
        self.metrics.plan_cache_invalidations.inc_by(count as u64);
        info!("Cleared {} plan cache entries", count);
    }

    pub fn len(&self) -> usize {
        self.cache.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Describes every entry, ordered by query hash.
    pub fn list(&self) -> Vec<Document> {
        let mut entries: Vec<Arc<PlanCacheEntry>> = self.cache.iter().map(|(_, entry)| entry).collect();
        entries.sort_by_key(|e| (e.shape.query_hash, e.shape.plan_cache_key));
        entries.iter().map(|e| e.describe()).collect()
    }
}
