pub(crate) mod filters;
pub(crate) mod plan_executor;
pub(crate) mod projections;
pub(crate) mod scans;
pub(crate) mod sort;
pub(crate) mod stage;
pub(crate) mod stages;
