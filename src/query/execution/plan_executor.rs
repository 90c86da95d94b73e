use crate::error::{Error, Result};
use crate::obs::metrics::PlannerMetrics;
use crate::options::options::ExecutionOptions;
use crate::query::canonical_query::{CanonicalQuery, QueryKind};
use crate::query::execution::stage::{build_stage, ExecutionContext, Member, PlanStage, StageState, StageStats};
use crate::query::physical_plan::{AccessPlan, PhysicalPlan};
use crate::storage::storage_engine::StorageEngine;
use bson::Document;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub type YieldHook = Arc<dyn Fn() + Send + Sync>;

/// State shared between an operation and whoever may interrupt it.
#[derive(Default)]
pub struct OperationContext {
    killed: AtomicBool,
    yield_hook: Option<YieldHook>,
}

impl OperationContext {
    pub fn new() -> Arc<Self> {
        Arc::new(OperationContext::default())
    }

    /// Context running `hook` at every yield, once the plan released the catalog snapshot.
    pub fn with_yield_hook(hook: YieldHook) -> Arc<Self> {
        Arc::new(OperationContext {
            killed: AtomicBool::new(false),
            yield_hook: Some(hook),
        })
    }

    /// Interrupts the operation at its next yield.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    pub fn check_for_interrupt(&self) -> Result<()> {
        if self.killed.load(Ordering::SeqCst) {
            return Err(Error::Interrupted("Operation was interrupted".to_string()));
        }
        Ok(())
    }
}

/// Adds to an access plan the stages depending on the query values: the
/// blocking sort when the plan does not provide the order, then skip, limit,
/// projection and grouping.
pub fn build_execution_plan(access: &AccessPlan, query: &CanonicalQuery) -> Arc<PhysicalPlan> {
    let mut plan = access.root.clone();
    if let Some(sort) = &query.sort {
        if !access.provides_sort {
            let limit = query.limit.map(|l| l.saturating_add(query.skip.unwrap_or(0)));
            plan = Arc::new(PhysicalPlan::Sort {
                input: plan,
                sort: sort.clone(),
                limit,
            });
        }
    }
    if let Some(skip) = query.skip {
        plan = Arc::new(PhysicalPlan::Skip { input: plan, skip });
    }
    if let Some(limit) = query.limit {
        plan = Arc::new(PhysicalPlan::Limit { input: plan, limit });
    }
    if let Some(projection) = &query.projection {
        plan = Arc::new(PhysicalPlan::Projection {
            input: plan,
            projection: projection.clone(),
        });
    }
    if let QueryKind::Group { key, accumulator } = &query.kind {
        plan = Arc::new(PhysicalPlan::Group {
            input: plan,
            key: key.clone(),
            accumulator: accumulator.clone(),
        });
    }
    plan
}

/// Runs the stages of a plan.
///
/// Every `yield_iterations` works the executor yields: stages release what
/// they derived from the catalog snapshot, interrupts are checked and the
/// snapshot is reloaded. A write conflict yields too, then retries the same
/// work, up to `max_write_conflict_retries` times.
pub struct PlanExecutor {
    engine: Arc<StorageEngine>,
    collection_name: String,
    plan: Arc<PhysicalPlan>,
    root: Box<dyn PlanStage>,
    ctx: ExecutionContext,
    options: ExecutionOptions,
    op_ctx: Arc<OperationContext>,
    metrics: Arc<PlannerMetrics>,
    works: u64,
    works_since_yield: u64,
    /// Results produced while the plan was competing in a trial.
    buffered: VecDeque<Member>,
    returned: u64,
    is_eof: bool,
}

impl PlanExecutor {
    pub fn new(
        engine: Arc<StorageEngine>,
        plan: Arc<PhysicalPlan>,
        query: &CanonicalQuery,
        collection_name: &str,
        options: &ExecutionOptions,
        op_ctx: Arc<OperationContext>,
        metrics: Arc<PlannerMetrics>,
    ) -> Result<Self> {
        let ctx = load_context(&engine, collection_name, query, options)?;
        let root = build_stage(&plan);
        Ok(Self::with_root(engine, plan, root, ctx, options, op_ctx, metrics))
    }

    fn with_root(
        engine: Arc<StorageEngine>,
        plan: Arc<PhysicalPlan>,
        root: Box<dyn PlanStage>,
        ctx: ExecutionContext,
        options: &ExecutionOptions,
        op_ctx: Arc<OperationContext>,
        metrics: Arc<PlannerMetrics>,
    ) -> Self {
        PlanExecutor {
            engine,
            collection_name: ctx.store.name.clone(),
            root,
            plan,
            ctx,
            options: options.clone(),
            op_ctx,
            metrics,
            works: 0,
            works_since_yield: 0,
            buffered: VecDeque::new(),
            returned: 0,
            is_eof: false,
        }
    }

    pub fn plan(&self) -> &Arc<PhysicalPlan> {
        &self.plan
    }

    /// Works done by the stages, retries included.
    pub fn works(&self) -> u64 {
        self.works
    }

    pub fn is_eof(&self) -> bool {
        self.is_eof
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// Performs one unit of work, yielding first if it is time to.
    pub fn work(&mut self) -> Result<StageState> {
        if self.is_eof {
            return Ok(StageState::IsEof);
        }
        let mut retries = 0;
        loop {
            if self.works_since_yield >= self.options.yield_iterations() {
                self.yield_now()?;
            }
            self.works += 1;
            self.works_since_yield += 1;
            match self.root.work(&self.ctx) {
                Ok(StageState::IsEof) => {
                    self.is_eof = true;
                    return Ok(StageState::IsEof);
                }
                Ok(state) => return Ok(state),
                Err(Error::WriteConflict(message)) => {
                    if retries >= self.options.max_write_conflict_retries() {
                        return Err(Error::WriteConflict(message));
                    }
                    retries += 1;
                    self.metrics.write_conflict_retries.inc();
                    self.yield_now()?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Keeps a result produced during a trial, to return it first.
    pub fn buffer(&mut self, member: Member) {
        self.buffered.push_back(member);
    }

    /// Returns the next result, or `None` once the plan is exhausted.
    pub fn next_document(&mut self) -> Result<Option<Document>> {
        if let Some(member) = self.buffered.pop_front() {
            self.returned += 1;
            return Ok(Some(member.document()?.as_ref().clone()));
        }
        loop {
            match self.work()? {
                StageState::Advanced(member) => {
                    self.returned += 1;
                    return Ok(Some(member.document()?.as_ref().clone()));
                }
                StageState::NeedTime => (),
                StageState::IsEof => return Ok(None),
            }
        }
    }

    /// Number of documents returned to the caller so far.
    pub fn returned(&self) -> u64 {
        self.returned
    }

    pub fn stats(&self) -> StageStats {
        self.root.stats()
    }

    fn yield_now(&mut self) -> Result<()> {
        self.root.save_state();
        self.metrics.yields.inc();
        self.works_since_yield = 0;
        self.op_ctx.check_for_interrupt()?;
        if let Some(hook) = &self.op_ctx.yield_hook {
            hook();
        }
        let collection = self.engine.get_collection(&self.collection_name);
        match collection {
            Some(collection) if collection.id == self.ctx.collection.id => {
                self.ctx.store = self
                    .engine
                    .collection_store(collection.id)
                    .ok_or_else(|| collection_dropped(&self.collection_name))?;
                self.ctx.collection = collection;
            }
            _ => return Err(collection_dropped(&self.collection_name)),
        }
        self.root.restore_state(&self.ctx)
    }
}

fn collection_dropped(name: &str) -> Error {
    Error::QueryPlanKilled(format!("Collection {} was dropped during the query", name))
}

fn load_context(
    engine: &StorageEngine,
    collection_name: &str,
    query: &CanonicalQuery,
    options: &ExecutionOptions,
) -> Result<ExecutionContext> {
    let collection = engine
        .get_collection(collection_name)
        .ok_or_else(|| Error::CollectionNotFound { name: collection_name.to_string() })?;
    let store = engine
        .collection_store(collection.id)
        .ok_or_else(|| Error::CollectionNotFound { name: collection_name.to_string() })?;
    Ok(ExecutionContext {
        collection,
        store,
        parameters: query.parameters.clone(),
        collation: query.collation.clone(),
        sort_memory_limit: options.sort_memory_limit().to_bytes(),
        allow_disk_use: query.allow_disk_use,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obs::logger::test_instance;
    use crate::obs::metrics::MetricRegistry;
    use crate::query::canonical_query::FindCommand;
    use crate::query::execution::stage::test_support::{context, engine_with};
    use crate::query::optimizer::Optimizer;
    use crate::query::physical_plan::summary;
    use crate::query::Parameters;
    use crate::storage::Direction;
    use bson::doc;
    use std::sync::atomic::AtomicUsize;

    fn query(command: FindCommand) -> CanonicalQuery {
        CanonicalQuery::new("c", &command, QueryKind::Find, &Optimizer::new(test_instance())).unwrap()
    }

    fn metrics() -> Arc<PlannerMetrics> {
        PlannerMetrics::new(&mut MetricRegistry::new())
    }

    fn collection_scan() -> AccessPlan {
        AccessPlan::new(PhysicalPlan::CollectionScan { direction: Direction::Forward, filter: None }, false)
    }

    /// Fails with a write conflict a given number of times, then returns one document.
    struct ConflictingStage {
        conflicts: usize,
        done: bool,
        stats: StageStats,
    }

    impl PlanStage for ConflictingStage {
        fn work(&mut self, _ctx: &ExecutionContext) -> Result<StageState> {
            if self.conflicts > 0 {
                self.conflicts -= 1;
                return Err(Error::WriteConflict("conflict".to_string()));
            }
            if self.done {
                return Ok(StageState::IsEof);
            }
            self.done = true;
            Ok(StageState::Advanced(Member::of_document(doc! { "ok": 1 })))
        }

        fn save_state(&mut self) {}

        fn restore_state(&mut self, _ctx: &ExecutionContext) -> Result<()> {
            Ok(())
        }

        fn stats(&self) -> StageStats {
            self.stats.clone()
        }
    }

    fn conflicting_executor(conflicts: usize, options: &ExecutionOptions, metrics: Arc<PlannerMetrics>) -> PlanExecutor {
        let engine = engine_with(vec![], vec![]);
        let ctx = context(&engine, Parameters::new());
        let root = Box::new(ConflictingStage { conflicts, done: false, stats: StageStats::new("TEST") });
        PlanExecutor::with_root(engine, Arc::new(PhysicalPlan::Eof), root, ctx, options, OperationContext::new(), metrics)
    }

    #[test]
    fn test_execution_plan_wraps_access_plan() {
        let command = FindCommand {
            filter: doc! {},
            sort: Some(doc! { "a": 1 }),
            skip: Some(2),
            limit: Some(3),
            projection: Some(doc! { "a": 1 }),
            ..FindCommand::default()
        };
        let plan = build_execution_plan(&collection_scan(), &query(command));
        assert_eq!(summary(&plan), "PROJECTION_SIMPLE(LIMIT(SKIP(SORT(COLLSCAN))))");
        match plan.inputs()[0].inputs()[0].inputs()[0].as_ref() {
            PhysicalPlan::Sort { limit, .. } => assert_eq!(*limit, Some(5)),
            other => panic!("unexpected {:?}", other),
        }

        let sorted = AccessPlan { provides_sort: true, ..collection_scan() };
        let command = FindCommand { sort: Some(doc! { "a": 1 }), ..FindCommand::default() };
        assert_eq!(summary(&build_execution_plan(&sorted, &query(command))), "COLLSCAN");
    }

    #[test]
    fn test_yields_and_runs_hook() {
        let engine = engine_with((0..10).map(|i| doc! { "a": i }).collect(), vec![]);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let op_ctx = OperationContext::with_yield_hook(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let options = ExecutionOptions::default().with_yield_iterations(3);
        let metrics = metrics();
        let query = query(FindCommand::default());
        let plan = build_execution_plan(&collection_scan(), &query);
        let mut executor = PlanExecutor::new(engine, plan, &query, "c", &options, op_ctx, metrics.clone()).unwrap();

        let mut count = 0;
        while executor.next_document().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 10);
        assert_eq!(executor.works(), 11);
        assert_eq!(metrics.yields.get(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_interrupt_is_checked_at_yield() {
        let engine = engine_with((0..10).map(|i| doc! { "a": i }).collect(), vec![]);
        let op_ctx = OperationContext::new();
        let options = ExecutionOptions::default().with_yield_iterations(2);
        let query = query(FindCommand::default());
        let plan = build_execution_plan(&collection_scan(), &query);
        let mut executor = PlanExecutor::new(engine, plan, &query, "c", &options, op_ctx.clone(), metrics()).unwrap();

        assert!(executor.next_document().unwrap().is_some());
        op_ctx.kill();
        let err = loop {
            match executor.next_document() {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("the query should have been interrupted"),
                Err(e) => break e,
            }
        };
        assert!(matches!(err, Error::Interrupted(_)));
    }

    #[test]
    fn test_dropped_collection_kills_the_plan() {
        let engine = engine_with((0..5).map(|i| doc! { "a": i }).collect(), vec![]);
        let options = ExecutionOptions::default().with_yield_iterations(1);
        let query = query(FindCommand::default());
        let plan = build_execution_plan(&collection_scan(), &query);
        let mut executor =
            PlanExecutor::new(engine.clone(), plan, &query, "c", &options, OperationContext::new(), metrics()).unwrap();
        assert!(executor.next_document().unwrap().is_some());
        engine.drop_collection("c").unwrap();
        assert!(matches!(executor.next_document(), Err(Error::QueryPlanKilled(_))));
    }

    #[test]
    fn test_write_conflicts_are_retried() {
        let metrics = metrics();
        let options = ExecutionOptions::default().with_max_write_conflict_retries(3);
        let mut executor = conflicting_executor(3, &options, metrics.clone());
        assert_eq!(executor.next_document().unwrap(), Some(doc! { "ok": 1 }));
        assert_eq!(metrics.write_conflict_retries.get(), 3);

        let mut executor = conflicting_executor(4, &options, metrics.clone());
        assert!(matches!(executor.next_document(), Err(Error::WriteConflict(_))));
    }
}
