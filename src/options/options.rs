use crate::options::storage_quantity::{StorageQuantity, StorageUnit};

#[derive(Default, Clone, Debug)]
pub struct Options {
    planner_options: Option<PlannerOptions>,
    execution_options: Option<ExecutionOptions>,
}

impl Options {
    pub fn planner_options(&self) -> &PlannerOptions {
        static DEFAULT_PLANNER_OPTIONS: PlannerOptions = PlannerOptions {
            trial_max_works: None,
            trial_max_results: None,
            max_enumerated_plans: None,
            plan_cache_max_entries: None,
            replan_eviction_ratio: None,
            max_wildcard_fields: None,
            max_wildcard_fields_with_projection: None,
        };
        self.planner_options.as_ref().unwrap_or(&DEFAULT_PLANNER_OPTIONS)
    }

    pub fn execution_options(&self) -> &ExecutionOptions {
        static DEFAULT_EXECUTION_OPTIONS: ExecutionOptions = ExecutionOptions {
            yield_iterations: None,
            max_write_conflict_retries: None,
            sort_memory_limit: None,
        };
        self.execution_options.as_ref().unwrap_or(&DEFAULT_EXECUTION_OPTIONS)
    }

    pub fn with_planner_options(mut self, planner_options: PlannerOptions) -> Self {
        self.planner_options = Some(planner_options);
        self
    }

    pub fn with_execution_options(mut self, execution_options: ExecutionOptions) -> Self {
        self.execution_options = Some(execution_options);
        self
    }
}

#[derive(Default, Clone, Debug)]
pub struct PlannerOptions {
    /// Maximum number of work units each candidate may perform during a trial.
    trial_max_works: Option<u64>,

    /// Number of results that ends a trial early.
    trial_max_results: Option<usize>,

    /// Upper bound on the number of candidate plans produced for one query.
    max_enumerated_plans: Option<usize>,

    /// Maximum number of entries in the plan cache of a collection.
    plan_cache_max_entries: Option<u64>,

    /// An active cached plan is evicted once it needs more than
    /// `works * ratio` work units to produce its first batch.
    replan_eviction_ratio: Option<f64>,

    /// Maximum number of distinct fields a query may reference to use a wildcard index.
    max_wildcard_fields: Option<usize>,

    /// Same as `max_wildcard_fields`, for wildcard indexes with a projection.
    max_wildcard_fields_with_projection: Option<usize>,
}

impl PlannerOptions {
    pub fn trial_max_works(&self) -> u64 {
        self.trial_max_works.unwrap_or(10_000)
    }

    pub fn trial_max_results(&self) -> usize {
        self.trial_max_results.unwrap_or(101)
    }

    pub fn max_enumerated_plans(&self) -> usize {
        self.max_enumerated_plans.unwrap_or(64)
    }

    pub fn plan_cache_max_entries(&self) -> u64 {
        self.plan_cache_max_entries.unwrap_or(5_000)
    }

    pub fn replan_eviction_ratio(&self) -> f64 {
        self.replan_eviction_ratio.unwrap_or(10.0)
    }

    pub fn max_wildcard_fields(&self) -> usize {
        self.max_wildcard_fields.unwrap_or(32)
    }

    pub fn max_wildcard_fields_with_projection(&self) -> usize {
        self.max_wildcard_fields_with_projection.unwrap_or(16)
    }

    pub fn with_trial_max_works(mut self, value: u64) -> Self {
        self.trial_max_works = Some(value);
        self
    }

    pub fn with_trial_max_results(mut self, value: usize) -> Self {
        self.trial_max_results = Some(value);
        self
    }

    pub fn with_max_enumerated_plans(mut self, value: usize) -> Self {
        self.max_enumerated_plans = Some(value);
        self
    }

    pub fn with_plan_cache_max_entries(mut self, value: u64) -> Self {
        self.plan_cache_max_entries = Some(value);
        self
    }

    pub fn with_replan_eviction_ratio(mut self, value: f64) -> Self {
        self.replan_eviction_ratio = Some(value);
        self
    }

    pub fn with_max_wildcard_fields(mut self, value: usize) -> Self {
        self.max_wildcard_fields = Some(value);
        self
    }

    pub fn with_max_wildcard_fields_with_projection(mut self, value: usize) -> Self {
        self.max_wildcard_fields_with_projection = Some(value);
        self
    }
}

#[derive(Default, Clone, Debug)]
pub struct ExecutionOptions {
    /// Number of work units between two yields.
    yield_iterations: Option<u64>,

    /// Number of times an operation is transparently retried after a write conflict.
    max_write_conflict_retries: Option<u32>,

    /// Memory available to a blocking sort before it fails or spills to disk.
    sort_memory_limit: Option<StorageQuantity>,
}

impl ExecutionOptions {
    pub fn yield_iterations(&self) -> u64 {
        self.yield_iterations.unwrap_or(128)
    }

    pub fn max_write_conflict_retries(&self) -> u32 {
        self.max_write_conflict_retries.unwrap_or(10)
    }

    pub fn sort_memory_limit(&self) -> StorageQuantity {
        self.sort_memory_limit.unwrap_or(StorageQuantity::new(100, StorageUnit::Mebibytes))
    }

    pub fn with_yield_iterations(mut self, value: u64) -> Self {
        self.yield_iterations = Some(value.max(1));
        self
    }

    pub fn with_max_write_conflict_retries(mut self, value: u32) -> Self {
        self.max_write_conflict_retries = Some(value);
        self
    }

    pub fn with_sort_memory_limit(mut self, value: StorageQuantity) -> Self {
        self.sort_memory_limit = Some(value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = Options::default();
        assert_eq!(options.planner_options().trial_max_works(), 10_000);
        assert_eq!(options.planner_options().trial_max_results(), 101);
        assert_eq!(options.planner_options().max_enumerated_plans(), 64);
        assert_eq!(options.execution_options().yield_iterations(), 128);
        assert_eq!(options.execution_options().sort_memory_limit().to_bytes(), 100 * 1024 * 1024);
    }

    #[test]
    fn test_overrides() {
        let options = Options::default()
            .with_planner_options(PlannerOptions::default().with_trial_max_works(5))
            .with_execution_options(ExecutionOptions::default().with_yield_iterations(0));
        assert_eq!(options.planner_options().trial_max_works(), 5);
        assert_eq!(options.planner_options().trial_max_results(), 101);
        assert_eq!(options.execution_options().yield_iterations(), 1);

        let planner = PlannerOptions::default()
            .with_plan_cache_max_entries(10)
            .with_max_wildcard_fields(4)
            .with_max_wildcard_fields_with_projection(2);
        assert_eq!(planner.plan_cache_max_entries(), 10);
        assert_eq!(planner.max_wildcard_fields(), 4);
        assert_eq!(planner.max_wildcard_fields_with_projection(), 2);
        assert_eq!(planner.replan_eviction_ratio(), 10.0);
    }
}
