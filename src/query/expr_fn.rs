use crate::query::agg_expr::AggExpr;
use crate::query::{BsonValue, ComparisonOperator, Expr, PathComponent};
use std::sync::Arc;

pub fn field<T, U>(name: T) -> Arc<Expr>
where
    T: IntoIterator<Item = U>,
    U: Into<PathComponent>,
{
    Arc::new(Expr::Field(name.into_iter().map(|c| c.into()).collect()))
}

pub fn lit(value: impl Into<BsonValue>) -> Arc<Expr> {
    Arc::new(Expr::Literal(value.into()))
}

pub fn placeholder(idx: u32) -> Arc<Expr> {
    Arc::new(Expr::Placeholder(idx))
}

pub fn exists(exists: bool) -> Arc<Expr> {
    Arc::new(Expr::Exists(exists))
}

pub fn has_type(bson_type: Arc<Expr>, negated: bool) -> Arc<Expr> {
    Arc::new(Expr::Type { bson_type, negated })
}

pub fn size(size: Arc<Expr>, negated: bool) -> Arc<Expr> {
    Arc::new(Expr::Size { size, negated })
}

pub fn field_filters<T>(field: Arc<Expr>, predicates: T) -> Arc<Expr>
where
    T: IntoIterator<Item = Arc<Expr>>,
{
    Arc::new(Expr::FieldFilters {
        field,
        filters: predicates.into_iter().collect(),
    })
}

fn comparison(operator: ComparisonOperator, value: Arc<Expr>) -> Arc<Expr> {
    Arc::new(Expr::Comparison { operator, value })
}

pub fn gt(bson_value: Arc<Expr>) -> Arc<Expr> {
    comparison(ComparisonOperator::Gt, bson_value)
}

pub fn gte(bson_value: Arc<Expr>) -> Arc<Expr> {
    comparison(ComparisonOperator::Gte, bson_value)
}

pub fn lt(bson_value: Arc<Expr>) -> Arc<Expr> {
    comparison(ComparisonOperator::Lt, bson_value)
}

pub fn lte(bson_value: Arc<Expr>) -> Arc<Expr> {
    comparison(ComparisonOperator::Lte, bson_value)
}

pub fn within(bson_value: Arc<Expr>) -> Arc<Expr> {
    comparison(ComparisonOperator::In, bson_value)
}

pub fn nin(bson_value: Arc<Expr>) -> Arc<Expr> {
    comparison(ComparisonOperator::Nin, bson_value)
}

pub fn eq(bson_value: Arc<Expr>) -> Arc<Expr> {
    comparison(ComparisonOperator::Eq, bson_value)
}

pub fn ne(bson_value: Arc<Expr>) -> Arc<Expr> {
    comparison(ComparisonOperator::Ne, bson_value)
}

/// Comparison extracted from a `$expr`.
pub fn expr_cmp(operator: ComparisonOperator, bson_value: Arc<Expr>) -> Arc<Expr> {
    Arc::new(Expr::ExprComparison { operator, value: bson_value })
}

pub fn expr_filter(agg: Arc<AggExpr>) -> Arc<Expr> {
    Arc::new(Expr::ExprFilter(agg))
}

pub fn all(array: Arc<Expr>) -> Arc<Expr> {
    Arc::new(Expr::All(array))
}

pub fn elem_match<T>(predicates: T) -> Arc<Expr>
where
    T: IntoIterator<Item = Arc<Expr>>,
{
    Arc::new(Expr::ElemMatch(predicates.into_iter().collect()))
}

pub fn and<T>(predicates: T) -> Arc<Expr>
where
    T: IntoIterator<Item = Arc<Expr>>,
{
    Arc::new(Expr::And(predicates.into_iter().collect()))
}

pub fn or<T>(predicates: T) -> Arc<Expr>
where
    T: IntoIterator<Item = Arc<Expr>>,
{
    Arc::new(Expr::Or(predicates.into_iter().collect()))
}

pub fn nor<T>(predicates: T) -> Arc<Expr>
where
    T: IntoIterator<Item = Arc<Expr>>,
{
    Arc::new(Expr::Nor(predicates.into_iter().collect()))
}

pub fn not(predicate: Arc<Expr>) -> Arc<Expr> {
    Arc::new(Expr::Not(predicate))
}

pub fn always_true() -> Arc<Expr> {
    Arc::new(Expr::AlwaysTrue)
}

pub fn always_false() -> Arc<Expr> {
    Arc::new(Expr::AlwaysFalse)
}
