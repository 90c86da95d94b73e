pub mod collection;
pub mod error;
mod io;
pub mod obs;
pub mod options;
mod query;
pub mod sharding;
mod storage;
mod util;

use crate::collection::Collection;
use crate::error::{Error, Result};
use crate::obs::logger::{LoggerAndTracer, NoOpLogger};
use crate::obs::metrics::{DerivedGauge, MetricRegistry, PlannerMetrics};
use crate::options::options::Options;
use crate::query::canonical_query::{CanonicalQuery, FindCommand, QueryKind};
use crate::query::explain::explain;
use crate::query::optimizer::Optimizer;
use crate::query::query_planner::{PreparedQuery, QueryPlanner};
use crate::storage::index_table::RecordId;
use crate::storage::storage_engine::StorageEngine;
use bson::{Bson, Document};
use crossbeam_skiplist::SkipMap;
use std::sync::Arc;

pub use crate::collection::{CollMod, Distinct, Query, QueryOutput};
pub use crate::query::execution::plan_executor::{OperationContext, YieldHook};
pub use crate::query::execution::stage::StageStats;
pub use crate::query::explain::Verbosity;
pub use crate::query::optimizer::plan_cache::PlanCache;
pub use crate::sharding::ShardedCollection;
pub use crate::storage::catalog::IndexOptions;

/// An in-memory document database whose queries are planned against the
/// indexes of each collection.
pub struct Database {
    options: Arc<Options>,
    db_impl: Arc<DbImpl>,
}

impl Database {
    pub fn open(options: Options) -> Self {
        Self::open_with_logger(options, Arc::new(NoOpLogger))
    }

    pub fn open_with_logger(options: Options, logger: Arc<dyn LoggerAndTracer>) -> Self {
        let options = Arc::new(options);
        let mut metric_registry = MetricRegistry::new();
        let metrics = PlannerMetrics::new(&mut metric_registry);
        let plan_caches: Arc<SkipMap<String, Arc<PlanCache>>> = Arc::new(SkipMap::new());
        let caches = plan_caches.clone();
        metric_registry.register_gauge(
            "plan_cache_entries",
            DerivedGauge::new(Arc::new(move || caches.iter().map(|e| e.value().len() as u64).sum())),
        );
        let storage_engine = StorageEngine::new(logger.clone());
        let optimizer = Arc::new(Optimizer::new(logger.clone()));
        let db_impl = Arc::new(DbImpl {
            options: options.clone(),
            logger,
            storage_engine,
            optimizer,
            metrics,
            metric_registry,
            plan_caches,
        });
        Database { options, db_impl }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Returns a handle on a collection. The collection is created by the
    /// first operation needing it.
    pub fn collection(&self, name: &str) -> Collection {
        Collection::new(self.db_impl.clone(), name.to_string())
    }

    /// Drops a collection, its indexes and its cached plans.
    pub fn drop_collection(&self, name: &str) -> Result<bool> {
        let dropped = self.db_impl.storage_engine.drop_collection(name)?;
        if let Some(entry) = self.db_impl.plan_caches.remove(name) {
            entry.value().clear();
        }
        Ok(dropped)
    }

    /// Current value of every planner metric, sorted by name.
    pub fn metrics(&self) -> Vec<(String, u64)> {
        self.db_impl.metric_registry.snapshot()
    }

    pub fn metric_registry(&self) -> &MetricRegistry {
        &self.db_impl.metric_registry
    }
}

pub(crate) struct DbImpl {
    options: Arc<Options>,
    logger: Arc<dyn LoggerAndTracer>,
    storage_engine: Arc<StorageEngine>,
    optimizer: Arc<Optimizer>,
    metrics: Arc<PlannerMetrics>,
    metric_registry: MetricRegistry,
    plan_caches: Arc<SkipMap<String, Arc<PlanCache>>>,
}

impl DbImpl {
    pub fn storage_engine(&self) -> &Arc<StorageEngine> {
        &self.storage_engine
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Plan cache of a collection, created on first use.
    pub fn plan_cache(&self, collection: &str) -> Arc<PlanCache> {
        let max_entries = self.options.planner_options().plan_cache_max_entries();
        self.plan_caches
            .get_or_insert_with(collection.to_string(), || {
                Arc::new(PlanCache::new(max_entries, self.metrics.clone()))
            })
            .value()
            .clone()
    }

    pub fn canonicalize(&self, collection: &str, command: &FindCommand, kind: QueryKind) -> Result<CanonicalQuery> {
        self.storage_engine.create_collection_if_not_exists(collection)?;
        CanonicalQuery::new(collection, command, kind, &self.optimizer)
    }

    fn planner(&self, collection: &str) -> QueryPlanner {
        QueryPlanner::new(
            self.storage_engine.clone(),
            self.options.clone(),
            self.plan_cache(collection),
            self.metrics.clone(),
            self.logger.clone(),
        )
    }

    pub fn prepare(&self, query: &CanonicalQuery, op_ctx: Arc<OperationContext>) -> Result<PreparedQuery> {
        self.planner(&query.namespace).prepare(query, op_ctx, true)
    }

    pub fn explain(&self, query: &CanonicalQuery, verbosity: Verbosity) -> Result<Document> {
        let collection = self
            .storage_engine
            .get_collection(&query.namespace)
            .ok_or_else(|| Error::CollectionNotFound { name: query.namespace.clone() })?;
        let prepared = self.planner(&query.namespace).prepare(query, OperationContext::new(), false)?;
        explain(prepared, query, &collection, verbosity)
    }

    /// Record currently holding the document with the given `_id`.
    pub fn record_id_of(&self, collection: &str, id: &Bson) -> Option<RecordId> {
        let metadata = self.storage_engine.get_collection(collection)?;
        self.storage_engine.collection_store(metadata.id)?.record_id_of(id)
    }
}
