use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Named metrics of a database instance.
#[derive(Default, Clone)]
pub struct MetricRegistry {
    counters: BTreeMap<String, Arc<Counter>>,
    gauges: BTreeMap<String, Arc<dyn Gauge>>,
    computed: BTreeMap<String, Arc<dyn Computed>>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_counter(&mut self, name: &str, counter: Arc<Counter>) -> &mut Self {
        self.counters.insert(name.to_string(), counter);
        self
    }

    pub fn register_gauge(&mut self, name: &str, gauge: Arc<dyn Gauge>) -> &mut Self {
        self.gauges.insert(name.to_string(), gauge);
        self
    }

    pub fn register_computed(&mut self, name: &str, computed: Arc<dyn Computed>) -> &mut Self {
        self.computed.insert(name.to_string(), computed);
        self
    }

    pub fn get_counter(&self, name: &str) -> Option<Arc<Counter>> {
        self.counters.get(name).cloned()
    }

    pub fn get_gauge(&self, name: &str) -> Option<Arc<dyn Gauge>> {
        self.gauges.get(name).cloned()
    }

    pub fn get_computed(&self, name: &str) -> Option<Arc<dyn Computed>> {
        self.computed.get(name).cloned()
    }

    /// Returns the current value of every counter and gauge, sorted by name.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let mut values: Vec<(String, u64)> = self
            .counters
            .iter()
            .map(|(name, c)| (name.clone(), c.get()))
            .chain(self.gauges.iter().map(|(name, g)| (name.clone(), g.get())))
            .collect();
        values.sort();
        values
    }
}

#[derive(Default)]
pub struct Counter {
    atomic: AtomicU64,
}

impl Counter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self) -> u64 {
        self.atomic.load(Ordering::Relaxed)
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, amount: u64) {
        self.atomic.fetch_add(amount, Ordering::Relaxed);
    }
}

pub trait Gauge: Send + Sync {
    fn get(&self) -> u64;
}

/// Gauge whose value is computed on demand.
pub struct DerivedGauge {
    compute: Arc<dyn Fn() -> u64 + Send + Sync>,
}

impl DerivedGauge {
    pub fn new(compute: Arc<dyn Fn() -> u64 + Send + Sync>) -> Arc<Self> {
        Arc::new(Self { compute })
    }
}

impl Gauge for DerivedGauge {
    fn get(&self) -> u64 {
        (self.compute)()
    }
}

pub trait Computed: Send + Sync {
    fn get(&self) -> f64;
}

pub struct HitRatio {
    hit_counter: Arc<Counter>,
    miss_counter: Arc<Counter>,
}

impl HitRatio {
    pub fn new(hit_counter: Arc<Counter>, miss_counter: Arc<Counter>) -> Arc<Self> {
        Arc::new(Self { hit_counter, miss_counter })
    }
}

impl Computed for HitRatio {
    fn get(&self) -> f64 {
        let h = self.hit_counter.get() as f64;
        let m = self.miss_counter.get() as f64;
        if h + m == 0.0 {
            0.0
        } else {
            h / (h + m)
        }
    }
}

/// Counters shared by the planners and executors of every collection.
pub struct PlannerMetrics {
    pub plan_cache_hits: Arc<Counter>,
    pub plan_cache_misses: Arc<Counter>,
    pub plan_cache_invalidations: Arc<Counter>,
    pub replans: Arc<Counter>,
    pub multiplanner_trials: Arc<Counter>,
    pub write_conflict_retries: Arc<Counter>,
    pub yields: Arc<Counter>,
}

impl PlannerMetrics {
    pub fn new(registry: &mut MetricRegistry) -> Arc<Self> {
        let metrics = PlannerMetrics {
            plan_cache_hits: Counter::new(),
            plan_cache_misses: Counter::new(),
            plan_cache_invalidations: Counter::new(),
            replans: Counter::new(),
            multiplanner_trials: Counter::new(),
            write_conflict_retries: Counter::new(),
            yields: Counter::new(),
        };
        registry
            .register_counter("plan_cache_hits", metrics.plan_cache_hits.clone())
            .register_counter("plan_cache_misses", metrics.plan_cache_misses.clone())
            .register_counter("plan_cache_invalidations", metrics.plan_cache_invalidations.clone())
            .register_counter("replans", metrics.replans.clone())
            .register_counter("multiplanner_trials", metrics.multiplanner_trials.clone())
            .register_counter("write_conflict_retries", metrics.write_conflict_retries.clone())
            .register_counter("yields", metrics.yields.clone())
            .register_computed(
                "plan_cache_hit_ratio",
                HitRatio::new(metrics.plan_cache_hits.clone(), metrics.plan_cache_misses.clone()),
            );
        Arc::new(metrics)
    }
}
