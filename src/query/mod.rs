use crate::error::{self, Error};
use crate::query::agg_expr::AggExpr;
use crate::query::tree_node::TreeNode;
use crate::util::bson_utils;
use bson::{Bson, Document};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

pub(crate) mod agg_expr;
pub(crate) mod canonical_query;
pub(crate) mod execution;
pub(crate) mod explain;
pub(crate) mod optimizer;
pub(crate) mod parser;
pub(crate) mod physical_plan;
pub(crate) mod query_planner;
pub(crate) mod shape;
pub(crate) mod tree_node;

#[cfg(test)]
pub(crate) mod expr_fn;

pub use parser::parse_field_path;

#[derive(Debug, Clone, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub enum Expr {
    /// Field reference
    Field(Vec<PathComponent>),
    /// Literal values
    Literal(BsonValue),
    /// Placeholder for parameters. After normalization, literals are replaced by placeholders
    /// and the parameters captured, allowing plans to be cached and reused.
    Placeholder(u32),
    /// Multiple filters on the same field (e.g., `{ "price": { "$ne": 1.99, "$exists": true } }`)
    FieldFilters {
        field: Arc<Expr>,
        filters: Vec<Arc<Expr>>,
    },
    /// A single comparison (e.g., `$gt: 5`, `$eq: "Alice"`)
    Comparison {
        operator: ComparisonOperator,
        value: Arc<Expr>,
    },
    /// A comparison extracted from a `$expr` filter. Unlike `Comparison`, it
    /// compares the whole field value and never looks inside arrays.
    ExprComparison {
        operator: ComparisonOperator,
        value: Arc<Expr>,
    },
    And(Vec<Arc<Expr>>),
    Or(Vec<Arc<Expr>>),
    Not(Arc<Expr>),
    Nor(Vec<Arc<Expr>>),
    /// Field existence
    Exists(bool),
    /// Type check
    Type {
        bson_type: Arc<Expr>,
        negated: bool,
    },
    Size {
        size: Arc<Expr>,
        negated: bool,
    },
    All(Arc<Expr>),
    ElemMatch(Vec<Arc<Expr>>),
    /// Part of a `$expr` filter that cannot be expressed as field predicates.
    ExprFilter(Arc<AggExpr>),
    /// Represents an expression that is always true (e.g. $and: [])
    AlwaysTrue,
    /// Represents an expression that is always false (e.g. $or: [])
    AlwaysFalse,
}

impl TreeNode for Expr {
    fn children(&self) -> Vec<Arc<Self>> {
        match self {
            Expr::FieldFilters { field, filters } => {
                let mut children = Vec::with_capacity(filters.len() + 1);
                children.push(field.clone());
                children.extend(filters.iter().cloned());
                children
            }
            Expr::Comparison { value, .. } | Expr::ExprComparison { value, .. } => vec![value.clone()],
            Expr::And(elements) | Expr::Or(elements) | Expr::Nor(elements) | Expr::ElemMatch(elements) => {
                elements.to_vec()
            }
            Expr::Not(expr) => vec![expr.clone()],
            Expr::Type { bson_type, .. } => vec![bson_type.clone()],
            Expr::Size { size, .. } => vec![size.clone()],
            Expr::All(values) => vec![values.clone()],
            _ => vec![],
        }
    }

    fn with_new_children(self: Arc<Self>, children: Vec<Arc<Self>>) -> Arc<Self> {
        let mut iter = children.into_iter();
        let mut next = |fallback: &Arc<Expr>| iter.next().unwrap_or_else(|| fallback.clone());

        match self.as_ref() {
            Expr::FieldFilters { field, .. } => {
                let field = next(field);
                Arc::new(Expr::FieldFilters { field, filters: iter.collect() })
            }
            Expr::Comparison { operator, value } => Arc::new(Expr::Comparison {
                operator: *operator,
                value: next(value),
            }),
            Expr::ExprComparison { operator, value } => Arc::new(Expr::ExprComparison {
                operator: *operator,
                value: next(value),
            }),
            Expr::And(_) => Arc::new(Expr::And(iter.collect())),
            Expr::Or(_) => Arc::new(Expr::Or(iter.collect())),
            Expr::Nor(_) => Arc::new(Expr::Nor(iter.collect())),
            Expr::ElemMatch(_) => Arc::new(Expr::ElemMatch(iter.collect())),
            Expr::Not(expr) => Arc::new(Expr::Not(next(expr))),
            Expr::Type { bson_type, negated } => Arc::new(Expr::Type {
                bson_type: next(bson_type),
                negated: *negated,
            }),
            Expr::Size { size, negated } => Arc::new(Expr::Size {
                size: next(size),
                negated: *negated,
            }),
            Expr::All(values) => Arc::new(Expr::All(next(values))),
            _ => self,
        }
    }
}

impl Expr {
    /// Returns the logical negation of this expression.
    ///
    /// Equality and membership have direct negations (`$ne`, `$nin`). Range
    /// comparisons are wrapped in a `Not`: `!(a > 5)` also matches values of
    /// other types and missing fields, so it cannot become `a <= 5`.
    pub fn negate(&self) -> Arc<Expr> {
        match self {
            Expr::Not(expr) => expr.clone(),
            Expr::Nor(exprs) => Arc::new(Expr::Or(exprs.clone())),
            Expr::And(exprs) => Arc::new(Expr::Or(exprs.iter().map(|e| e.negate()).collect())),
            Expr::Or(exprs) => Arc::new(Expr::And(exprs.iter().map(|e| e.negate()).collect())),
            Expr::FieldFilters { field, filters } => {
                if filters.len() == 1 {
                    return Arc::new(Expr::FieldFilters {
                        field: field.clone(),
                        filters: vec![filters[0].negate()],
                    });
                }
                // not(x and y) == not(x) or not(y)
                Arc::new(Expr::Or(
                    filters
                        .iter()
                        .map(|f| {
                            Arc::new(Expr::FieldFilters {
                                field: field.clone(),
                                filters: vec![f.negate()],
                            })
                        })
                        .collect(),
                ))
            }
            Expr::Comparison { operator, value } => match operator.negate() {
                Some(operator) => Arc::new(Expr::Comparison { operator, value: value.clone() }),
                None => Arc::new(Expr::Not(Arc::new(self.clone()))),
            },
            Expr::ExprComparison { operator, value } => match operator.negate() {
                Some(operator) => Arc::new(Expr::ExprComparison { operator, value: value.clone() }),
                None => Arc::new(Expr::Not(Arc::new(self.clone()))),
            },
            Expr::Exists(exists) => Arc::new(Expr::Exists(!*exists)),
            Expr::Type { bson_type, negated } => Arc::new(Expr::Type {
                bson_type: bson_type.clone(),
                negated: !*negated,
            }),
            Expr::Size { size, negated } => Arc::new(Expr::Size {
                size: size.clone(),
                negated: !*negated,
            }),
            Expr::ExprFilter(agg) => Arc::new(Expr::ExprFilter(Arc::new(AggExpr::Not(agg.clone())))),
            Expr::AlwaysTrue => Arc::new(Expr::AlwaysFalse),
            Expr::AlwaysFalse => Arc::new(Expr::AlwaysTrue),
            _ => Arc::new(Expr::Not(Arc::new(self.clone()))),
        }
    }

    /// Returns the path of a `Field` expression.
    pub fn field_path(&self) -> Option<&[PathComponent]> {
        match self {
            Expr::Field(path) => Some(path),
            _ => None,
        }
    }

    /// Splits a top level conjunction into its members.
    pub fn conjuncts(self: &Arc<Self>) -> Vec<Arc<Expr>> {
        match self.as_ref() {
            Expr::And(children) => children.clone(),
            Expr::AlwaysTrue => vec![],
            _ => vec![self.clone()],
        }
    }

    /// Builds the conjunction of `exprs`.
    pub fn and_of(mut exprs: Vec<Arc<Expr>>) -> Arc<Expr> {
        match exprs.len() {
            0 => Arc::new(Expr::AlwaysTrue),
            1 => exprs.remove(0),
            _ => Arc::new(Expr::And(exprs)),
        }
    }
}

/// Projection tree over field names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProjectionExpr {
    Fields { children: BTreeMap<String, Arc<ProjectionExpr>> },
    Field,
}

impl ProjectionExpr {
    pub fn add_path(&mut self, path: &[String]) -> error::Result<()> {
        let children = match self {
            ProjectionExpr::Fields { children } => children,
            ProjectionExpr::Field => {
                return Err(Error::InvalidRequest(format!(
                    "Path collision at {}",
                    path.join(".")
                )))
            }
        };

        let (first, rest) = match path.split_first() {
            Some(split) => split,
            None => return Ok(()),
        };

        if rest.is_empty() {
            if children.contains_key(first) {
                return Err(Error::InvalidRequest(format!("Path collision at {}", first)));
            }
            children.insert(first.clone(), Arc::new(ProjectionExpr::Field));
            return Ok(());
        }

        let child = children
            .entry(first.clone())
            .or_insert_with(|| Arc::new(ProjectionExpr::Fields { children: BTreeMap::new() }));
        let mut node = child.as_ref().clone();
        node.add_path(rest)?;
        *child = Arc::new(node);
        Ok(())
    }

    pub fn remove_path(&mut self, path: &[String]) {
        if let ProjectionExpr::Fields { children } = self {
            match path.split_first() {
                Some((first, rest)) if rest.is_empty() => {
                    children.remove(first);
                }
                Some((first, rest)) => {
                    if let Some(child) = children.get_mut(first) {
                        let mut node = child.as_ref().clone();
                        node.remove_path(rest);
                        *child = Arc::new(node);
                    }
                }
                None => (),
            }
        }
    }

    pub fn children(&self) -> Option<&BTreeMap<String, Arc<ProjectionExpr>>> {
        match self {
            ProjectionExpr::Fields { children } => Some(children),
            ProjectionExpr::Field => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.children().map_or(true, |c| c.is_empty())
    }

    /// Lists the dotted paths of the tree leaves.
    pub fn paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        if let ProjectionExpr::Fields { children } = self {
            for (name, child) in children {
                match child.as_ref() {
                    ProjectionExpr::Field => paths.push(name.clone()),
                    nested => paths.extend(nested.paths().into_iter().map(|p| format!("{}.{}", name, p))),
                }
            }
        }
        paths
    }
}

/// Projection for included or excluded fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Projection {
    Include(Arc<ProjectionExpr>),
    Exclude(Arc<ProjectionExpr>),
}

impl Projection {
    pub fn to_document(&self) -> Document {
        let (paths, flag) = match self {
            Projection::Include(expr) => (expr.paths(), 1),
            Projection::Exclude(expr) => (expr.paths(), 0),
        };
        let mut doc = Document::new();
        for path in paths {
            doc.insert(path, flag);
        }
        doc
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    pub fn reverse(self) -> SortOrder {
        match self {
            SortOrder::Ascending => SortOrder::Descending,
            SortOrder::Descending => SortOrder::Ascending,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            SortOrder::Ascending => 1,
            SortOrder::Descending => -1,
        }
    }
}

/// Represents a sorting instruction for a query.
#[derive(Debug, Clone, PartialEq, Hash, Eq)]
pub struct SortField {
    pub path: Vec<PathComponent>,
    pub order: SortOrder,
}

impl SortField {
    pub fn asc(path: Vec<PathComponent>) -> SortField {
        SortField { path, order: SortOrder::Ascending }
    }

    pub fn desc(path: Vec<PathComponent>) -> SortField {
        SortField { path, order: SortOrder::Descending }
    }

    pub fn path_string(&self) -> String {
        format_path(&self.path)
    }
}

pub fn sort_to_document(sort: &[SortField]) -> Document {
    let mut doc = Document::new();
    for field in sort {
        doc.insert(field.path_string(), field.order.as_i32());
    }
    doc
}

#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub enum ComparisonOperator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Nin,
}

impl ComparisonOperator {
    /// Direct negation, if one exists without changing the matching semantics.
    fn negate(&self) -> Option<ComparisonOperator> {
        match self {
            ComparisonOperator::Eq => Some(ComparisonOperator::Ne),
            ComparisonOperator::Ne => Some(ComparisonOperator::Eq),
            ComparisonOperator::In => Some(ComparisonOperator::Nin),
            ComparisonOperator::Nin => Some(ComparisonOperator::In),
            _ => None,
        }
    }

    /// Operator with its operands swapped: `1 > x` is `x < 1`.
    pub fn swap_operands(&self) -> ComparisonOperator {
        match self {
            ComparisonOperator::Gt => ComparisonOperator::Lt,
            ComparisonOperator::Gte => ComparisonOperator::Lte,
            ComparisonOperator::Lt => ComparisonOperator::Gt,
            ComparisonOperator::Lte => ComparisonOperator::Gte,
            other => *other,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ComparisonOperator::Eq => "$eq",
            ComparisonOperator::Ne => "$ne",
            ComparisonOperator::Gt => "$gt",
            ComparisonOperator::Gte => "$gte",
            ComparisonOperator::Lt => "$lt",
            ComparisonOperator::Lte => "$lte",
            ComparisonOperator::In => "$in",
            ComparisonOperator::Nin => "$nin",
        }
    }
}

/// Represents a component in a field path
#[derive(Debug, Clone, Eq, Hash, PartialEq)]
pub enum PathComponent {
    FieldName(String),
    /// A numeric component (e.g., "0" in "array.0")
    ArrayElement(usize),
}

impl PartialOrd for PathComponent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PathComponent {
    fn cmp(&self, other: &Self) -> Ordering {
        use PathComponent::*;
        match (self, other) {
            (FieldName(a), FieldName(b)) => a.cmp(b),
            (ArrayElement(a), ArrayElement(b)) => a.cmp(b),
            (FieldName(_), ArrayElement(_)) => Ordering::Less,
            (ArrayElement(_), FieldName(_)) => Ordering::Greater,
        }
    }
}

impl From<&str> for PathComponent {
    fn from(value: &str) -> Self {
        PathComponent::FieldName(value.to_string())
    }
}

impl From<usize> for PathComponent {
    fn from(index: usize) -> Self {
        PathComponent::ArrayElement(index)
    }
}

impl fmt::Display for PathComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathComponent::FieldName(name) => write!(f, "{}", name),
            PathComponent::ArrayElement(index) => write!(f, "{}", index),
        }
    }
}

pub fn format_path(path: &[PathComponent]) -> String {
    path.iter().map(|c| c.to_string()).collect::<Vec<_>>().join(".")
}

/// Values reached by a path, one entry per branch explored. `None` marks a
/// branch on which the path is missing.
#[derive(Debug, Default)]
pub struct PathValues<'a> {
    pub values: Vec<Option<&'a Bson>>,
    /// `true` if an array was traversed before reaching the last component.
    pub through_array: bool,
}

impl<'a> PathValues<'a> {
    /// Returns `true` if every branch is missing.
    pub fn is_missing(&self) -> bool {
        self.values.iter().all(|v| v.is_none())
    }
}

/// Collects the values reached by `path`. Arrays of documents met before the
/// last component are traversed element by element. Nested arrays are not.
pub fn collect_path_values<'a>(doc: &'a Document, path: &[PathComponent]) -> PathValues<'a> {
    let mut values = PathValues::default();
    match path.split_first() {
        Some((first, rest)) => match doc.get(first.to_string()) {
            Some(value) => walk_path(value, rest, &mut values),
            None => values.values.push(None),
        },
        None => values.values.push(None),
    }
    values
}

fn walk_path<'a>(value: &'a Bson, path: &[PathComponent], out: &mut PathValues<'a>) {
    let (first, rest) = match path.split_first() {
        None => {
            out.values.push(Some(value));
            return;
        }
        Some(split) => split,
    };

    match value {
        Bson::Document(doc) => match doc.get(first.to_string()) {
            Some(v) => walk_path(v, rest, out),
            None => out.values.push(None),
        },
        Bson::Array(elements) => {
            if let PathComponent::ArrayElement(index) = first {
                match elements.get(*index) {
                    Some(v) => walk_path(v, rest, out),
                    None => out.values.push(None),
                }
                return;
            }
            out.through_array = true;
            if elements.is_empty() {
                out.values.push(None);
            }
            for element in elements {
                match element {
                    Bson::Document(doc) => match doc.get(first.to_string()) {
                        Some(v) => walk_path(v, rest, out),
                        None => out.values.push(None),
                    },
                    _ => out.values.push(None),
                }
            }
        }
        _ => out.values.push(None),
    }
}

#[derive(Debug, Clone)]
pub struct BsonValue(pub Bson);

impl BsonValue {
    pub fn to_bson(&self) -> Bson {
        self.0.clone()
    }

    pub fn as_ref(&self) -> BsonValueRef<'_> {
        BsonValueRef(&self.0)
    }
}

impl PartialEq for BsonValue {
    fn eq(&self, other: &Self) -> bool {
        bson_utils::bson_eq(&self.0, &other.0)
    }
}

impl Eq for BsonValue {}

impl Hash for BsonValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        bson_utils::bson_hash(&self.0, state);
    }
}

impl PartialOrd for BsonValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BsonValue {
    fn cmp(&self, other: &Self) -> Ordering {
        bson_utils::cmp_bson(&self.0, &other.0)
    }
}

impl From<i32> for BsonValue {
    fn from(value: i32) -> Self {
        BsonValue(Bson::Int32(value))
    }
}

impl From<i64> for BsonValue {
    fn from(value: i64) -> Self {
        BsonValue(Bson::Int64(value))
    }
}

impl From<f64> for BsonValue {
    fn from(value: f64) -> Self {
        BsonValue(Bson::Double(value))
    }
}

impl From<&str> for BsonValue {
    fn from(value: &str) -> Self {
        BsonValue(Bson::String(value.to_string()))
    }
}

impl From<bool> for BsonValue {
    fn from(value: bool) -> Self {
        BsonValue(Bson::Boolean(value))
    }
}

impl From<Document> for BsonValue {
    fn from(value: Document) -> Self {
        BsonValue(Bson::Document(value))
    }
}

impl From<Bson> for BsonValue {
    fn from(value: Bson) -> Self {
        BsonValue(value)
    }
}

impl<T> From<Vec<T>> for BsonValue
where
    T: Into<Bson>,
{
    fn from(values: Vec<T>) -> Self {
        BsonValue(Bson::Array(values.into_iter().map(|v| v.into()).collect()))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BsonValueRef<'a>(pub &'a Bson);

impl<'a> PartialEq for BsonValueRef<'a> {
    fn eq(&self, other: &Self) -> bool {
        bson_utils::bson_eq(self.0, other.0)
    }
}

impl<'a> Eq for BsonValueRef<'a> {}

impl<'a> Hash for BsonValueRef<'a> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        bson_utils::bson_hash(self.0, state);
    }
}

impl<'a> PartialOrd for BsonValueRef<'a> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<'a> Ord for BsonValueRef<'a> {
    fn cmp(&self, other: &Self) -> Ordering {
        bson_utils::cmp_bson(self.0, other.0)
    }
}

#[macro_export]
macro_rules! bson_value {
    ( $($tokens:tt)* ) => {
        $crate::query::BsonValue(bson::bson!($($tokens)*))
    };
}

/// Literal values extracted from a query, referenced by `Expr::Placeholder`.
#[derive(Debug, Clone, Default)]
pub struct Parameters {
    parameters: Vec<BsonValue>,
}

impl Parameters {
    pub fn new() -> Self {
        Self { parameters: Vec::new() }
    }

    pub fn collect_parameter(&mut self, value: BsonValue) -> Arc<Expr> {
        let idx = self.parameters.len() as u32;
        self.parameters.push(value);
        Arc::new(Expr::Placeholder(idx))
    }

    pub fn get(&self, index: u32) -> error::Result<&BsonValue> {
        self.parameters.get(index as usize).ok_or_else(|| {
            Error::UnexpectedError(format!("Parameter index {} out of bounds", index))
        })
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BsonValue> {
        self.parameters.iter()
    }
}

/// Returns the literal referenced by `expr`, resolving placeholders.
pub fn resolve_value<'a>(expr: &'a Expr, parameters: &'a Parameters) -> error::Result<&'a Bson> {
    match expr {
        Expr::Literal(value) => Ok(&value.0),
        Expr::Placeholder(idx) => Ok(&parameters.get(*idx)?.0),
        other => Err(Error::UnexpectedError(format!("Expected a literal value, got {:?}", other))),
    }
}
