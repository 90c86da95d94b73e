use crate::event;
use crate::obs::logger::LoggerAndTracer;
use crate::query::optimizer::normalization_rules::{all_normalization_rules, NormalisationRule};
use crate::query::tree_node::TreeNode;
use crate::query::{Expr, Parameters};
use std::sync::Arc;
use std::time::Instant;

/// Rewrites filters into their canonical form and extracts their literals.
pub struct Optimizer {
    logger: Arc<dyn LoggerAndTracer>,
    normalization_rules: Vec<Arc<dyn NormalisationRule>>,
}

impl Optimizer {
    pub fn new(logger: Arc<dyn LoggerAndTracer>) -> Self {
        Self::with_rules(logger, all_normalization_rules())
    }

    pub fn with_rules(logger: Arc<dyn LoggerAndTracer>, normalization_rules: Vec<Arc<dyn NormalisationRule>>) -> Self {
        Optimizer { logger, normalization_rules }
    }

    pub fn normalize(&self, filter: Arc<Expr>) -> Arc<Expr> {
        event!(self.logger, "event: normalization start, filter={:?}", filter);
        let start = Instant::now();

        let normalized = self
            .normalization_rules
            .iter()
            .fold(filter, |expr, rule| rule.apply(expr));

        event!(
            self.logger,
            "event: normalization done, duration={}µs, normalized_filter={:?}",
            start.elapsed().as_micros(),
            normalized
        );
        normalized
    }

    /// Replaces every literal of the filter by a placeholder.
    pub fn parametrize(&self, filter: Arc<Expr>) -> (Arc<Expr>, Parameters) {
        use std::cell::RefCell;

        let parameters = RefCell::new(Parameters::new());
        let filter = filter.transform_down(&|e| Optimizer::parametrize_expr(e, &mut parameters.borrow_mut()));
        (filter, parameters.into_inner())
    }

    fn parametrize_expr(expr: Arc<Expr>, params: &mut Parameters) -> Arc<Expr> {
        match expr.as_ref() {
            Expr::Literal(value) => params.collect_parameter(value.clone()),
            Expr::ExprFilter(agg) => Arc::new(Expr::ExprFilter(agg.parametrize(params))),
            _ => expr,
        }
    }
}
