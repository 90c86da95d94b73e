use crate::error::{Error, Result};
use crate::query::{resolve_value, BsonValue, ComparisonOperator, Expr, Parameters};
use crate::storage::catalog::{IndexMetadata, KeyKind};
use crate::util::bson_utils::{hash_key, is_nan, is_sentinel, type_bracket, type_rank, RANK_DOCUMENT, RANK_NULL};
use crate::util::collation::{contains_string, Collation};
use crate::util::interval::{intersect_all, union_all, Interval};
use bson::Bson;
use std::ops::Bound;

/// How precisely index bounds represent the predicate they come from.
///
/// The order matters: combining bounds keeps the least exact tightness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tightness {
    /// The bounds are a superset and the fetched document must be re-checked,
    /// whatever the other predicates are.
    InexactFetchRequired,
    /// The bounds are a superset of the matching keys.
    Inexact,
    /// Exact bounds involving `MinKey` or `MaxKey`.
    ExactMaxKey,
    Exact,
}

impl Tightness {
    pub fn is_exact(&self) -> bool {
        *self >= Tightness::ExactMaxKey
    }
}

pub type ValueInterval = Interval<BsonValue>;

/// `[MinKey, MaxKey]`
pub fn full_range() -> ValueInterval {
    Interval::closed(BsonValue(Bson::MinKey), BsonValue(Bson::MaxKey))
}

/// Disjoint intervals of one key field, sorted in ascending value order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedIntervalList {
    pub field: String,
    pub intervals: Vec<ValueInterval>,
}

impl OrderedIntervalList {
    pub fn new(field: &str, intervals: Vec<ValueInterval>) -> Self {
        OrderedIntervalList {
            field: field.to_string(),
            intervals,
        }
    }

    pub fn all_values(field: &str) -> Self {
        Self::new(field, vec![full_range()])
    }

    pub fn is_all_values(&self) -> bool {
        self.intervals.len() == 1 && self.intervals[0] == full_range()
    }

    /// Values of the list if every interval is a point.
    pub fn points(&self) -> Option<Vec<BsonValue>> {
        self.intervals
            .iter()
            .map(|i| match i.start() {
                Bound::Included(v) if i.is_point() => Some(v.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn contains(&self, value: &Bson) -> bool {
        let value = BsonValue(value.clone());
        self.intervals.iter().any(|i| i.contains_value(&value))
    }

    /// Intervals in the order a scan visits them: descending fields and
    /// backward scans each reverse the natural order.
    pub fn in_scan_order(&self, reverse: bool) -> Vec<ValueInterval> {
        if reverse {
            self.intervals.iter().rev().cloned().map(|i| i.reversed()).collect()
        } else {
            self.intervals.clone()
        }
    }
}

/// Bounds of every field of an index, in key pattern order.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexBounds {
    pub fields: Vec<OrderedIntervalList>,
}

impl IndexBounds {
    /// Returns `true` if no key can be within the bounds.
    pub fn is_empty(&self) -> bool {
        self.fields.iter().any(|f| f.intervals.is_empty())
    }
}

/// Bounds a single predicate puts on a key field.
#[derive(Debug, Clone, PartialEq)]
pub struct LeafBounds {
    pub intervals: Vec<ValueInterval>,
    pub tightness: Tightness,
    /// `false` if the predicate requires the field to exist.
    pub matches_missing: bool,
}

impl LeafBounds {
    fn new(intervals: Vec<ValueInterval>, tightness: Tightness) -> Self {
        let intervals = union_all(intervals);
        let matches_missing = intervals
            .iter()
            .any(|i| i.contains_value(&BsonValue(Bson::Null)));
        LeafBounds { intervals, tightness, matches_missing }
    }

    fn with_tightness(self, tightness: Tightness) -> Self {
        LeafBounds { tightness, ..self }
    }

    /// Bounds satisfying both predicates.
    pub fn intersect(&self, other: &LeafBounds) -> LeafBounds {
        LeafBounds {
            intervals: intersect_all(&self.intervals, &other.intervals),
            tightness: self.tightness.min(other.tightness),
            matches_missing: self.matches_missing && other.matches_missing,
        }
    }

    pub fn is_points(&self) -> bool {
        !self.intervals.is_empty() && self.intervals.iter().all(|i| i.is_point())
    }
}

/// What the bounds builder needs to know about the key field.
#[derive(Debug, Clone, Copy)]
pub struct KeyContext<'a> {
    pub kind: KeyKind,
    pub index_collation: &'a Collation,
    pub sparse: bool,
    pub wildcard: bool,
}

impl<'a> KeyContext<'a> {
    pub fn for_field(index: &'a IndexMetadata, position: usize) -> Self {
        KeyContext {
            kind: index.fields[position].kind,
            index_collation: &index.collation,
            sparse: index.sparse,
            wildcard: index.is_wildcard(),
        }
    }

    /// Context of a plain ascending field, used to compare predicates.
    pub fn plain(collation: &'a Collation) -> Self {
        KeyContext {
            kind: KeyKind::Ascending,
            index_collation: collation,
            sparse: false,
            wildcard: false,
        }
    }
}

/// Translates a predicate on a field into bounds on a key field indexing it.
///
/// Returns `None` if the predicate cannot be expressed as bounds (the
/// predicate is not sargable for this key).
pub fn leaf_bounds(
    predicate: &Expr,
    key: &KeyContext,
    parameters: &Parameters,
    collation: &Collation,
) -> Result<Option<LeafBounds>> {
    let bounds = match predicate {
        Expr::Comparison { operator, value } => {
            comparison_bounds(*operator, resolve_value(value, parameters)?, key, collation)
        }
        // Whole value comparisons: arrays produce keys per element, so the
        // document must be re-checked.
        Expr::ExprComparison { operator, value } => {
            comparison_bounds(*operator, resolve_value(value, parameters)?, key, collation)
                .map(|b| b.with_tightness(Tightness::InexactFetchRequired))
        }
        Expr::Exists(true) if key.sparse && !key.wildcard => Some(LeafBounds {
            intervals: vec![full_range()],
            tightness: Tightness::Inexact,
            matches_missing: false,
        }),
        _ => None,
    };
    Ok(bounds)
}

fn comparison_bounds(
    operator: ComparisonOperator,
    operand: &Bson,
    key: &KeyContext,
    collation: &Collation,
) -> Option<LeafBounds> {
    // Keys hold collation keys: string comparisons need the collation of the query.
    if contains_string(operand) && !key.index_collation.matches(collation) {
        return None;
    }
    match operator {
        ComparisonOperator::Eq => point_bounds(operand, key),
        ComparisonOperator::In => {
            let elements = match operand {
                Bson::Array(elements) => elements,
                _ => return None,
            };
            let mut intervals = Vec::with_capacity(elements.len());
            let mut tightness = Tightness::Exact;
            for element in elements {
                let bounds = point_bounds(element, key)?;
                tightness = tightness.min(bounds.tightness);
                intervals.extend(bounds.intervals);
            }
            Some(LeafBounds::new(intervals, tightness))
        }
        ComparisonOperator::Gt | ComparisonOperator::Gte | ComparisonOperator::Lt | ComparisonOperator::Lte => {
            range_bounds(operator, operand, key)
        }
        ComparisonOperator::Ne | ComparisonOperator::Nin => None,
    }
}

fn point_bounds(value: &Bson, key: &KeyContext) -> Option<LeafBounds> {
    match value {
        Bson::Array(_) | Bson::RegularExpression(_) | Bson::Undefined => return None,
        // Wildcard indexes have no key for missing fields or sub-documents
        Bson::Null | Bson::Document(_) if key.wildcard => return None,
        _ => (),
    }

    if key.kind == KeyKind::Hashed {
        let hashed = Bson::Int64(hash_key(&key.index_collation.collation_key(value)));
        return Some(LeafBounds::new(vec![Interval::point(BsonValue(hashed))], Tightness::Inexact));
    }

    let point = Interval::point(BsonValue(key.index_collation.collation_key(value)));
    let tightness = match value {
        // Also matches missing fields and arrays containing null
        Bson::Null => Tightness::Inexact,
        Bson::MinKey | Bson::MaxKey => Tightness::ExactMaxKey,
        _ => Tightness::Exact,
    };
    Some(LeafBounds::new(vec![point], tightness))
}

fn range_bounds(operator: ComparisonOperator, operand: &Bson, key: &KeyContext) -> Option<LeafBounds> {
    if key.kind == KeyKind::Hashed {
        return None;
    }
    if matches!(operand, Bson::Array(_) | Bson::RegularExpression(_) | Bson::Undefined) {
        return None;
    }

    if is_sentinel(operand) {
        if key.wildcard {
            return None;
        }
        let (min, max) = (BsonValue(Bson::MinKey), BsonValue(Bson::MaxKey));
        let value = BsonValue(operand.clone());
        let interval = match operator {
            ComparisonOperator::Gt => Interval::open_closed(value, max),
            ComparisonOperator::Gte => Interval::closed(value, max),
            ComparisonOperator::Lt => Interval::closed_open(min, value),
            _ => Interval::closed(min, value),
        };
        return Some(LeafBounds::new(vec![interval], Tightness::ExactMaxKey));
    }

    if is_nan(operand) {
        // NaN is only within range of itself, and only inclusively
        let intervals = match operator {
            ComparisonOperator::Gte | ComparisonOperator::Lte => vec![Interval::point(BsonValue(operand.clone()))],
            _ => vec![],
        };
        return Some(LeafBounds::new(intervals, Tightness::Exact));
    }

    if key.wildcard && matches!(type_rank(operand), RANK_NULL | RANK_DOCUMENT) {
        return None;
    }

    let ((low, low_inclusive), (high, high_inclusive)) = type_bracket(operand)?;
    let value = BsonValue(key.index_collation.collation_key(operand));
    let low = if low_inclusive { Bound::Included(BsonValue(low)) } else { Bound::Excluded(BsonValue(low)) };
    let high = if high_inclusive { Bound::Included(BsonValue(high)) } else { Bound::Excluded(BsonValue(high)) };
    let interval = match operator {
        ComparisonOperator::Gt => Interval::new(Bound::Excluded(value), high),
        ComparisonOperator::Gte => Interval::new(Bound::Included(value), high),
        ComparisonOperator::Lt => Interval::new(low, Bound::Excluded(value)),
        _ => Interval::new(low, Bound::Included(value)),
    };
    let tightness = if type_rank(operand) == RANK_NULL {
        Tightness::Inexact
    } else {
        Tightness::Exact
    };
    Some(LeafBounds::new(vec![interval], tightness))
}

/// Computes the bounds of a key field from the predicates assigned to it.
/// A field without predicate is unrestricted.
pub fn field_bounds(
    field: &str,
    predicates: &[std::sync::Arc<Expr>],
    key: &KeyContext,
    parameters: &Parameters,
    collation: &Collation,
) -> Result<OrderedIntervalList> {
    let mut bounds: Option<LeafBounds> = None;
    for predicate in predicates {
        let leaf = leaf_bounds(predicate, key, parameters, collation)?.ok_or_else(|| {
            Error::QueryPlanKilled(format!("Predicate {:?} no longer bounds field {}", predicate, field))
        })?;
        bounds = Some(match bounds {
            Some(bounds) => bounds.intersect(&leaf),
            None => leaf,
        });
    }
    Ok(match bounds {
        Some(bounds) => OrderedIntervalList::new(field, bounds.intervals),
        None => OrderedIntervalList::all_values(field),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::expr_fn::*;
    use bson::{bson, Timestamp};

    fn bounds(predicate: std::sync::Arc<Expr>, kind: KeyKind) -> Option<LeafBounds> {
        let collation = Collation::simple();
        let key = KeyContext {
            kind,
            index_collation: &collation,
            sparse: false,
            wildcard: false,
        };
        leaf_bounds(&predicate, &key, &Parameters::new(), &collation).unwrap()
    }

    fn asc(predicate: std::sync::Arc<Expr>) -> LeafBounds {
        bounds(predicate, KeyKind::Ascending).unwrap()
    }

    fn value(v: Bson) -> BsonValue {
        BsonValue(v)
    }

    #[test]
    fn test_equality() {
        let leaf = asc(eq(lit(1)));
        assert_eq!(leaf.intervals, vec![Interval::point(value(bson!(1)))]);
        assert_eq!(leaf.tightness, Tightness::Exact);
        assert!(!leaf.matches_missing);

        let leaf = asc(eq(lit(Bson::Null)));
        assert_eq!(leaf.tightness, Tightness::Inexact);
        assert!(leaf.matches_missing);

        assert!(bounds(eq(lit(vec![1, 2])), KeyKind::Ascending).is_none());
    }

    #[test]
    fn test_ranges_are_type_bracketed() {
        let leaf = asc(gt(lit(1)));
        assert_eq!(
            leaf.intervals,
            vec![Interval::open_closed(value(bson!(1)), value(Bson::Double(f64::INFINITY)))]
        );
        let leaf = asc(lt(lit("m")));
        assert_eq!(
            leaf.intervals,
            vec![Interval::closed_open(value(bson!("")), value(bson!("m")))]
        );
        let leaf = asc(gte(lit(Bson::Timestamp(Timestamp { time: 0, increment: 0 }))));
        assert_eq!(
            leaf.intervals,
            vec![Interval::closed(
                value(Bson::Timestamp(Timestamp { time: 0, increment: 0 })),
                value(Bson::Timestamp(Timestamp { time: u32::MAX, increment: u32::MAX })),
            )]
        );
    }

    #[test]
    fn test_sentinels_and_nan() {
        let leaf = asc(gt(lit(Bson::MinKey)));
        assert_eq!(leaf.tightness, Tightness::ExactMaxKey);
        assert!(leaf.matches_missing);

        assert!(asc(gt(lit(f64::NAN))).intervals.is_empty());
        assert_eq!(asc(lte(lit(f64::NAN))).intervals.len(), 1);
    }

    #[test]
    fn test_in_unions_points() {
        let leaf = asc(within(lit(vec![3, 1, 3])));
        assert_eq!(
            leaf.intervals,
            vec![Interval::point(value(bson!(1))), Interval::point(value(bson!(3)))]
        );
    }

    #[test]
    fn test_hashed() {
        let leaf = bounds(eq(lit(5)), KeyKind::Hashed).unwrap();
        assert_eq!(leaf.intervals, vec![Interval::point(value(Bson::Int64(hash_key(&bson!(5)))))]);
        assert_eq!(leaf.tightness, Tightness::Inexact);
        assert!(bounds(gt(lit(5)), KeyKind::Hashed).is_none());
    }

    #[test]
    fn test_expr_comparison_requires_fetch() {
        let leaf = asc(expr_cmp(ComparisonOperator::Gt, lit(1)));
        assert_eq!(leaf.tightness, Tightness::InexactFetchRequired);
    }

    #[test]
    fn test_collation_mismatch_is_not_sargable() {
        let index_collation = Collation::new("en", 2);
        let key = KeyContext::plain(&index_collation);
        let simple = Collation::simple();
        assert!(leaf_bounds(&eq(lit("a")), &key, &Parameters::new(), &simple).unwrap().is_none());
        assert!(leaf_bounds(&eq(lit(1)), &key, &Parameters::new(), &simple).unwrap().is_some());
        let leaf = leaf_bounds(&eq(lit("AbC")), &key, &Parameters::new(), &index_collation)
            .unwrap()
            .unwrap();
        assert_eq!(leaf.intervals, vec![Interval::point(value(bson!("abc")))]);
    }

    #[test]
    fn test_scan_order() {
        let list = OrderedIntervalList::new(
            "a",
            vec![Interval::point(value(bson!(1))), Interval::closed_open(value(bson!(3)), value(bson!(5)))],
        );
        assert_eq!(
            list.in_scan_order(true),
            vec![Interval::open_closed(value(bson!(5)), value(bson!(3))), Interval::point(value(bson!(1)))]
        );
    }
}
