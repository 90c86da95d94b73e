use crate::query::agg_expr::{compare_operands, is_truthy, AggExpr};
use crate::query::tree_node::TreeNode;
use crate::query::{ComparisonOperator, Expr, PathComponent};
use bson::Bson;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// A rewrite of the filter tree that preserves its meaning.
pub trait NormalisationRule: Send + Sync {
    fn apply(&self, expr: Arc<Expr>) -> Arc<Expr>;
}

/// Returns the list of normalization rules to be applied in sequence.
pub fn all_normalization_rules() -> Vec<Arc<dyn NormalisationRule>> {
    vec![
        Arc::new(DeMorganNorToAnd {}),
        Arc::new(RewriteExprFilter {}),
        Arc::new(PushDownNotExpressions {}),
        Arc::new(SimplifyLogicalOperators {}),
    ]
}

/// Normalization rule to apply De Morgan's Law for NOR expressions.
/// This rule transforms NOR expressions into AND expressions with negated conditions.
pub struct DeMorganNorToAnd;

impl NormalisationRule for DeMorganNorToAnd {
    fn apply(&self, expr: Arc<Expr>) -> Arc<Expr> {
        expr.transform_down(&Self::de_morgan_nor_to_and)
    }
}

impl DeMorganNorToAnd {
    fn de_morgan_nor_to_and(expr: Arc<Expr>) -> Arc<Expr> {
        match expr.as_ref() {
            Expr::Nor(conditions) => {
                // NOR(A, B) → AND(NOT(A), NOT(B))
                Arc::new(Expr::And(
                    conditions.iter().map(|c| Arc::new(Expr::Not(c.clone()))).collect(),
                ))
            }
            _ => expr,
        }
    }
}

/// Rewrites `$expr` filters into field predicates where possible.
///
/// A comparison between a top level field and a constant becomes an
/// `ExprComparison` on that field, with the operands swapped if the constant
/// comes first. Comparisons between constants are folded. Everything else
/// stays an opaque `ExprFilter` evaluated on fetched documents.
pub struct RewriteExprFilter;

impl NormalisationRule for RewriteExprFilter {
    fn apply(&self, expr: Arc<Expr>) -> Arc<Expr> {
        expr.transform_down(&|e| match e.as_ref() {
            Expr::ExprFilter(agg) => Self::rewrite(agg),
            _ => e,
        })
    }
}

impl RewriteExprFilter {
    fn rewrite(agg: &Arc<AggExpr>) -> Arc<Expr> {
        match agg.as_ref() {
            AggExpr::And(children) => Arc::new(Expr::And(children.iter().map(Self::rewrite).collect())),
            AggExpr::Or(children) => Arc::new(Expr::Or(children.iter().map(Self::rewrite).collect())),
            AggExpr::Not(child) => Self::rewrite(child).negate(),
            AggExpr::Literal(value) => Self::constant(is_truthy(Some(&value.0))),
            AggExpr::Compare { operator, lhs, rhs } => match (lhs.as_ref(), rhs.as_ref()) {
                (AggExpr::Literal(l), AggExpr::Literal(r)) => {
                    Self::constant(compare_operands(*operator, &l.0, &r.0))
                }
                (AggExpr::FieldPath(path), AggExpr::Literal(value)) if Self::is_top_level(path) => {
                    Self::field_comparison(path, *operator, value.0.clone())
                }
                (AggExpr::Literal(value), AggExpr::FieldPath(path)) if Self::is_top_level(path) => {
                    Self::field_comparison(path, operator.swap_operands(), value.0.clone())
                }
                _ => Arc::new(Expr::ExprFilter(agg.clone())),
            },
            _ => Arc::new(Expr::ExprFilter(agg.clone())),
        }
    }

    fn is_top_level(path: &[PathComponent]) -> bool {
        matches!(path, [PathComponent::FieldName(_)])
    }

    fn field_comparison(path: &[PathComponent], operator: ComparisonOperator, value: Bson) -> Arc<Expr> {
        Arc::new(Expr::FieldFilters {
            field: Arc::new(Expr::Field(path.to_vec())),
            filters: vec![Arc::new(Expr::ExprComparison {
                operator,
                value: Arc::new(Expr::Literal(value.into())),
            })],
        })
    }

    fn constant(value: bool) -> Arc<Expr> {
        if value {
            Arc::new(Expr::AlwaysTrue)
        } else {
            Arc::new(Expr::AlwaysFalse)
        }
    }
}

/// Normalization rule to simplify NOT expressions.
pub struct PushDownNotExpressions;

impl NormalisationRule for PushDownNotExpressions {
    fn apply(&self, expr: Arc<Expr>) -> Arc<Expr> {
        expr.transform_down(&Self::push_down_not)
    }
}

impl PushDownNotExpressions {
    fn push_down_not(expr: Arc<Expr>) -> Arc<Expr> {
        match expr.as_ref() {
            Expr::Not(inner) => inner.negate(),
            _ => expr,
        }
    }
}

/// Normalization rule to simplify logical operators in expressions by flattening nested AND/OR,
/// removing duplicates, folding constants, and detecting contradictions or tautologies.
pub struct SimplifyLogicalOperators;

impl NormalisationRule for SimplifyLogicalOperators {
    fn apply(&self, expr: Arc<Expr>) -> Arc<Expr> {
        expr.transform_up(&Self::simplify_operators)
    }
}

impl SimplifyLogicalOperators {
    fn simplify_operators(expr: Arc<Expr>) -> Arc<Expr> {
        match expr.as_ref() {
            Expr::And(conditions) => Self::simplify_and(conditions),
            Expr::Or(conditions) => Self::simplify_or(conditions),
            Expr::FieldFilters { field, filters } => Self::simplify_field_filters(field, filters),
            Expr::Comparison { operator, value }
                if *operator == ComparisonOperator::In || *operator == ComparisonOperator::Nin =>
            {
                if let Expr::Literal(bson_val) = value.as_ref() {
                    if let Bson::Array(arr) = &bson_val.0 {
                        if arr.is_empty() {
                            return if *operator == ComparisonOperator::In {
                                Arc::new(Expr::AlwaysFalse) // IN [] => FALSE
                            } else {
                                Arc::new(Expr::AlwaysTrue) // NIN [] => TRUE
                            };
                        }
                    }
                }
                expr
            }
            // Value level negation of a constant
            Expr::Not(inner) => match inner.as_ref() {
                Expr::AlwaysTrue => Arc::new(Expr::AlwaysFalse),
                Expr::AlwaysFalse => Arc::new(Expr::AlwaysTrue),
                _ => expr,
            },
            _ => expr,
        }
    }

    fn simplify_and(expressions: &[Arc<Expr>]) -> Arc<Expr> {
        // First, flatten nested ANDs
        let mut flattened: Vec<Arc<Expr>> = Vec::new();
        for expr in expressions {
            if let Expr::And(sub_exprs) = expr.as_ref() {
                flattened.extend(sub_exprs.iter().cloned());
            } else {
                flattened.push(expr.clone());
            }
        }

        // Filters on the same field are merged so that their bounds can be intersected.
        let mut by_field: BTreeMap<Arc<Expr>, Vec<Arc<Expr>>> = BTreeMap::new();
        let mut others = Vec::new();
        for expr in flattened {
            match expr.as_ref() {
                Expr::FieldFilters { field, filters } => {
                    by_field.entry(field.clone()).or_default().extend(filters.iter().cloned())
                }
                _ => others.push(expr),
            }
        }
        for (field, filters) in by_field {
            let merged = Self::simplify_field_filters(&field, &filters);
            others.push(merged);
        }

        // Apply constant folding, deduplication, and contradiction detection
        let mut result: Vec<Arc<Expr>> = Vec::new();
        let mut seen: HashSet<Arc<Expr>> = HashSet::new();

        for e in others {
            match e.as_ref() {
                Expr::AlwaysTrue => continue,
                Expr::AlwaysFalse => return Arc::new(Expr::AlwaysFalse), // A AND FALSE => FALSE
                _ => {}
            }

            if seen.contains(&e.negate()) {
                // A AND NOT A => FALSE
                return Arc::new(Expr::AlwaysFalse);
            }

            if seen.insert(e.clone()) {
                result.push(e);
            }
        }
        // Sorting gives equivalent filters the same shape
        result.sort();
        match result.len() {
            0 => Arc::new(Expr::AlwaysTrue), // AND() == TRUE
            1 => result.remove(0),
            _ => Arc::new(Expr::And(result)),
        }
    }

    fn simplify_or(expressions: &[Arc<Expr>]) -> Arc<Expr> {
        // First, flatten nested ORs
        let mut flattened: Vec<Arc<Expr>> = Vec::new();
        for expr in expressions {
            if let Expr::Or(sub_exprs) = expr.as_ref() {
                flattened.extend(sub_exprs.iter().cloned());
            } else {
                flattened.push(expr.clone());
            }
        }

        // Apply constant folding, deduplication, and tautology detection
        let mut result: Vec<Arc<Expr>> = Vec::new();
        let mut seen: HashSet<Arc<Expr>> = HashSet::new();

        for e in flattened {
            match e.as_ref() {
                Expr::AlwaysTrue => return Arc::new(Expr::AlwaysTrue), // A OR TRUE => TRUE
                Expr::AlwaysFalse => continue,
                _ => {}
            }

            if seen.contains(&e.negate()) {
                // A OR NOT A => TRUE
                return Arc::new(Expr::AlwaysTrue);
            }

            if seen.insert(e.clone()) {
                result.push(e);
            }
        }
        result.sort();
        match result.len() {
            0 => Arc::new(Expr::AlwaysFalse), // OR() == FALSE
            1 => result.remove(0),
            _ => Arc::new(Expr::Or(result)),
        }
    }

    fn simplify_field_filters(field: &Arc<Expr>, filters: &[Arc<Expr>]) -> Arc<Expr> {
        let mut result: Vec<Arc<Expr>> = Vec::new();
        let mut seen: HashSet<Arc<Expr>> = HashSet::new();

        for e in filters {
            match e.as_ref() {
                Expr::AlwaysTrue => continue,
                Expr::AlwaysFalse => return Arc::new(Expr::AlwaysFalse),
                _ => {}
            }

            if seen.contains(&e.negate()) {
                return Arc::new(Expr::AlwaysFalse);
            }

            if seen.insert(e.clone()) {
                result.push(e.clone());
            }
        }
        result.sort();
        match result.len() {
            0 => Arc::new(Expr::AlwaysTrue), // FieldFilters with no filters is a tautology
            _ => Arc::new(Expr::FieldFilters {
                field: field.clone(),
                filters: result,
            }),
        }
    }
}
