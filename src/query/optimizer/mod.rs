pub(crate) mod bounds;
pub(crate) mod bounds_format;
pub(crate) mod enumerator;
pub(crate) mod multiplanner;
pub(crate) mod normalization_rules;
pub(crate) mod optimizer;
pub(crate) mod plan_cache;

pub use optimizer::Optimizer;
