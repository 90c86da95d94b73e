use crate::error::{Error, Result};
use crate::obs::logger::LoggerAndTracer;
use crate::obs::metrics::PlannerMetrics;
use crate::options::options::Options;
use crate::query::canonical_query::CanonicalQuery;
use crate::query::execution::plan_executor::{build_execution_plan, OperationContext, PlanExecutor};
use crate::query::execution::stage::StageState;
use crate::query::optimizer::enumerator::PlanEnumerator;
use crate::query::optimizer::multiplanner::{Candidate, MultiPlanner, TrialResult};
use crate::query::optimizer::plan_cache::{PlanCache, PlanCacheEntry};
use crate::query::physical_plan::{summary, AccessPlan};
use crate::query::shape::QueryShape;
use crate::query::sort_to_document;
use crate::storage::storage_engine::StorageEngine;
use crate::{event, info};
use bson::{doc, Document};
use std::sync::Arc;

/// How the plan of a query was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanSource {
    /// The enumerator produced a single candidate.
    SingleCandidate,
    Multiplanned,
    Cached,
}

/// A query ready to return its results.
pub struct PreparedQuery {
    pub shape: QueryShape,
    pub executor: PlanExecutor,
    pub source: PlanSource,
    /// `true` if an active cache entry was evicted before multiplanning.
    pub replanned: bool,
    /// Trial of the winning plan, when it was multiplanned.
    pub winner_trial: Option<TrialResult>,
    pub rejected: Vec<TrialResult>,
}

/// Chooses the plan of a query: from the plan cache when the shape has an
/// active entry, by multiplanning otherwise.
pub struct QueryPlanner {
    engine: Arc<StorageEngine>,
    options: Arc<Options>,
    plan_cache: Arc<PlanCache>,
    metrics: Arc<PlannerMetrics>,
    logger: Arc<dyn LoggerAndTracer>,
}

impl QueryPlanner {
    pub fn new(
        engine: Arc<StorageEngine>,
        options: Arc<Options>,
        plan_cache: Arc<PlanCache>,
        metrics: Arc<PlannerMetrics>,
        logger: Arc<dyn LoggerAndTracer>,
    ) -> Self {
        QueryPlanner {
            engine,
            options,
            plan_cache,
            metrics,
            logger,
        }
    }

    /// Plans a query. Multiplanning winners are recorded in the plan cache
    /// unless `record` is `false`, as for explain.
    pub fn prepare(&self, query: &CanonicalQuery, op_ctx: Arc<OperationContext>, record: bool) -> Result<PreparedQuery> {
        let collection = self
            .engine
            .get_collection(&query.namespace)
            .ok_or_else(|| Error::CollectionNotFound { name: query.namespace.clone() })?;
        let planner_options = self.options.planner_options();
        let shape = QueryShape::compute(query, &collection, planner_options)?;

        let mut replanned = false;
        match self.plan_cache.get(&shape, collection.plan_epoch) {
            Some(entry) if entry.is_active => {
                self.metrics.plan_cache_hits.inc();
                event!(self.logger, "event: plan cache hit, key={}", shape.plan_cache_key_hex());
                if let Some(executor) = self.run_cached(query, &entry, op_ctx.clone())? {
                    return Ok(PreparedQuery {
                        shape,
                        executor,
                        source: PlanSource::Cached,
                        replanned,
                        winner_trial: None,
                        rejected: Vec::new(),
                    });
                }
                info!(
                    self.logger,
                    "Cached plan {} for {} exceeded {} works, replanning",
                    summary(&entry.plan.root),
                    shape.plan_cache_key_hex(),
                    entry.works
                );
                self.plan_cache.deactivate(&shape);
                self.metrics.replans.inc();
                replanned = true;
            }
            _ => {
                self.metrics.plan_cache_misses.inc();
                event!(self.logger, "event: plan cache miss, key={}", shape.plan_cache_key_hex());
            }
        }

        let plans = PlanEnumerator::new(&collection, query, planner_options).enumerate()?;
        if plans.len() == 1 {
            let executor = self.executor(&plans[0], query, op_ctx)?;
            return Ok(PreparedQuery {
                shape,
                executor,
                source: PlanSource::SingleCandidate,
                replanned,
                winner_trial: None,
                rejected: Vec::new(),
            });
        }

        let candidates = plans
            .into_iter()
            .map(|access| {
                let executor = self.executor(&access, query, op_ctx.clone())?;
                Ok(Candidate { access, executor })
            })
            .collect::<Result<Vec<_>>>()?;
        let multiplanner = MultiPlanner::new(planner_options, self.metrics.clone(), self.logger.clone());
        let ranking = multiplanner.pick_best(candidates, multiplanner.max_results(query.limit))?;

        if record {
            let access = &ranking.winner.access;
            self.plan_cache.record_winner(PlanCacheEntry {
                shape,
                plan: access.clone(),
                is_active: false,
                works: ranking.winner_result.works,
                plan_epoch: collection.plan_epoch,
                indexes: access.root.indexes_used(),
                created_from: describe_query(query)?,
            });
        }

        Ok(PreparedQuery {
            shape,
            executor: ranking.winner.executor,
            source: PlanSource::Multiplanned,
            replanned,
            winner_trial: Some(ranking.winner_result),
            rejected: ranking.rejected,
        })
    }

    fn executor(&self, access: &AccessPlan, query: &CanonicalQuery, op_ctx: Arc<OperationContext>) -> Result<PlanExecutor> {
        PlanExecutor::new(
            self.engine.clone(),
            build_execution_plan(access, query),
            query,
            &query.namespace,
            self.options.execution_options(),
            op_ctx,
            self.metrics.clone(),
        )
    }

    /// Runs a cached plan until its first batch. Returns `None` if the plan
    /// needed more than `works * replan_eviction_ratio` works to produce it.
    fn run_cached(
        &self,
        query: &CanonicalQuery,
        entry: &PlanCacheEntry,
        op_ctx: Arc<OperationContext>,
    ) -> Result<Option<PlanExecutor>> {
        let planner_options = self.options.planner_options();
        let budget = ((entry.works.max(1) as f64) * planner_options.replan_eviction_ratio()).ceil() as u64;
        let batch = MultiPlanner::new(planner_options, self.metrics.clone(), self.logger.clone()).max_results(query.limit);

        let mut executor = self.executor(&entry.plan, query, op_ctx)?;
        let mut results = 0;
        while results < batch {
            if executor.works() >= budget {
                return Ok(None);
            }
            match executor.work()? {
                StageState::Advanced(member) => {
                    executor.buffer(member);
                    results += 1;
                }
                StageState::NeedTime => (),
                StageState::IsEof => break,
            }
        }
        Ok(Some(executor))
    }
}

/// The query an entry was created from, as listed by the plan cache.
fn describe_query(query: &CanonicalQuery) -> Result<Document> {
    let mut doc = doc! { "filter": query.parsed_query()? };
    if let Some(sort) = &query.sort {
        doc.insert("sort", sort_to_document(sort));
    }
    if let Some(projection) = &query.projection {
        doc.insert("projection", projection.to_document());
    }
    Ok(doc)
}
