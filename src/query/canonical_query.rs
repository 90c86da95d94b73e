use crate::error::{Error, Result};
use crate::query::optimizer::optimizer::Optimizer;
use crate::query::parser::{parse_conditions, parse_projection, parse_sort};
use crate::query::physical_plan::Accumulator;
use crate::query::{
    format_path, parse_field_path, resolve_value, ComparisonOperator, Expr, Parameters, PathComponent, Projection,
    SortField,
};
use crate::util::collation::Collation;
use bson::{Bson, Document};
use std::sync::Arc;

/// What the query computes from the documents matching its filter.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryKind {
    Find,
    /// Distinct values of a field.
    Distinct { key: Vec<PathComponent> },
    /// Documents grouped by the value of a field, with an optional named accumulator.
    Group {
        key: Vec<PathComponent>,
        accumulator: Option<(String, Accumulator)>,
    },
}

impl QueryKind {
    pub fn name(&self) -> &'static str {
        match self {
            QueryKind::Find => "find",
            QueryKind::Distinct { .. } => "distinct",
            QueryKind::Group { .. } => "group",
        }
    }

    /// The field whose distinct values the query needs, if any.
    pub fn distinct_key(&self) -> Option<&[PathComponent]> {
        match self {
            QueryKind::Distinct { key } => Some(key),
            QueryKind::Group { key, accumulator: None } => Some(key),
            _ => None,
        }
    }
}

/// A query as received from the caller, before any validation.
#[derive(Debug, Clone, Default)]
pub struct FindCommand {
    pub filter: Document,
    pub projection: Option<Document>,
    pub sort: Option<Document>,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
    pub collation: Option<Document>,
    pub hint: Option<String>,
    pub allow_disk_use: bool,
}

/// A validated query in canonical form.
///
/// The filter is normalized and its literals are replaced by placeholders:
/// two queries differing only by their literal values have the same filter
/// and differ only by their `parameters`.
#[derive(Debug, Clone)]
pub struct CanonicalQuery {
    pub namespace: String,
    pub filter: Arc<Expr>,
    pub parameters: Parameters,
    pub projection: Option<Arc<Projection>>,
    pub sort: Option<Arc<Vec<SortField>>>,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
    pub collation: Collation,
    pub hint: Option<String>,
    pub allow_disk_use: bool,
    pub kind: QueryKind,
}

impl CanonicalQuery {
    pub fn new(namespace: &str, command: &FindCommand, kind: QueryKind, optimizer: &Optimizer) -> Result<Self> {
        let filter = optimizer.normalize(parse_conditions(&command.filter)?);
        let (filter, parameters) = optimizer.parametrize(filter);

        let projection = match &command.projection {
            Some(doc) if !doc.is_empty() => Some(Arc::new(parse_projection(doc)?)),
            _ => None,
        };
        let sort = match &command.sort {
            Some(doc) if !doc.is_empty() => Some(Arc::new(parse_sort(doc)?)),
            _ => None,
        };
        if kind != QueryKind::Find && (projection.is_some() || sort.is_some()) {
            return Err(Error::InvalidRequest(format!(
                "{} does not accept a projection or a sort",
                kind.name()
            )));
        }
        if command.limit == Some(0) {
            return Err(Error::InvalidRequest("limit must be positive".to_string()));
        }
        let collation = match &command.collation {
            Some(doc) => Collation::from_document(doc)?,
            None => Collation::simple(),
        };

        Ok(CanonicalQuery {
            namespace: namespace.to_string(),
            filter,
            parameters,
            projection,
            sort,
            skip: command.skip.filter(|s| *s > 0),
            limit: command.limit,
            collation,
            hint: command.hint.clone(),
            allow_disk_use: command.allow_disk_use,
            kind,
        })
    }

    /// Filter with its literal values, as reported by explain.
    pub fn parsed_query(&self) -> Result<Document> {
        filter_to_document(&self.filter, &self.parameters)
    }
}

/// Parses a distinct or group key.
pub fn parse_key(key: &str) -> Result<Vec<PathComponent>> {
    if key.is_empty() || key.starts_with('$') {
        return Err(Error::InvalidRequest(format!("Invalid key '{}'", key)));
    }
    parse_field_path(key)
}

/// Renders a normalized filter as a query document.
pub fn filter_to_document(expr: &Expr, parameters: &Parameters) -> Result<Document> {
    let mut doc = Document::new();
    match expr {
        Expr::And(children) => {
            doc.insert("$and", render_children(children, parameters)?);
        }
        Expr::Or(children) => {
            doc.insert("$or", render_children(children, parameters)?);
        }
        Expr::Nor(children) => {
            doc.insert("$nor", render_children(children, parameters)?);
        }
        Expr::Not(child) => {
            doc.insert("$nor", vec![Bson::Document(filter_to_document(child, parameters)?)]);
        }
        Expr::FieldFilters { field, filters } => {
            let path = match field.field_path() {
                Some(path) => format_path(path),
                None => return Err(Error::UnexpectedError(format!("Expected a field, got {:?}", field))),
            };
            if filters.len() == 1 {
                doc.insert(path, render_predicate(&filters[0], parameters)?);
            } else {
                let mut conditions = Vec::with_capacity(filters.len());
                for filter in filters {
                    let mut condition = Document::new();
                    condition.insert(path.clone(), render_predicate(filter, parameters)?);
                    conditions.push(Bson::Document(condition));
                }
                doc.insert("$and", conditions);
            }
        }
        Expr::ExprFilter(agg) => {
            doc.insert("$expr", agg.bind(parameters)?.to_bson());
        }
        Expr::AlwaysTrue => (),
        Expr::AlwaysFalse => {
            doc.insert("$alwaysFalse", 1);
        }
        other => return Err(Error::UnexpectedError(format!("Unexpected top level expression {:?}", other))),
    }
    Ok(doc)
}

fn render_children(children: &[Arc<Expr>], parameters: &Parameters) -> Result<Vec<Bson>> {
    children
        .iter()
        .map(|c| filter_to_document(c, parameters).map(Bson::Document))
        .collect()
}

fn render_predicate(predicate: &Expr, parameters: &Parameters) -> Result<Document> {
    let mut doc = Document::new();
    match predicate {
        Expr::Comparison { operator, value } => {
            doc.insert(operator.name(), resolve_value(value, parameters)?.clone());
        }
        Expr::ExprComparison { operator, value } => {
            doc.insert(internal_expr_name(*operator), resolve_value(value, parameters)?.clone());
        }
        Expr::Exists(exists) => {
            doc.insert("$exists", *exists);
        }
        Expr::Type { bson_type, negated } => {
            let rendered = doc_of("$type", resolve_value(bson_type, parameters)?.clone());
            return Ok(if *negated { doc_of("$not", rendered) } else { rendered });
        }
        Expr::Size { size, negated } => {
            let rendered = doc_of("$size", resolve_value(size, parameters)?.clone());
            return Ok(if *negated { doc_of("$not", rendered) } else { rendered });
        }
        Expr::All(values) => {
            doc.insert("$all", resolve_value(values, parameters)?.clone());
        }
        Expr::ElemMatch(predicates) => {
            let mut inner = Document::new();
            for predicate in predicates {
                let rendered = match predicate.as_ref() {
                    Expr::FieldFilters { .. } | Expr::And(_) | Expr::Or(_) | Expr::Nor(_) => {
                        filter_to_document(predicate, parameters)?
                    }
                    other => render_predicate(other, parameters)?,
                };
                inner.extend(rendered);
            }
            doc.insert("$elemMatch", inner);
        }
        Expr::Not(inner) => {
            doc.insert("$not", render_predicate(inner, parameters)?);
        }
        other => return Err(Error::UnexpectedError(format!("Unexpected predicate {:?}", other))),
    }
    Ok(doc)
}

fn doc_of(key: &str, value: impl Into<Bson>) -> Document {
    let mut doc = Document::new();
    doc.insert(key, value.into());
    doc
}

fn internal_expr_name(operator: ComparisonOperator) -> &'static str {
    match operator {
        ComparisonOperator::Eq => "$_internalExprEq",
        ComparisonOperator::Ne => "$_internalExprNe",
        ComparisonOperator::Gt => "$_internalExprGt",
        ComparisonOperator::Gte => "$_internalExprGte",
        ComparisonOperator::Lt => "$_internalExprLt",
        ComparisonOperator::Lte => "$_internalExprLte",
        ComparisonOperator::In => "$_internalExprIn",
        ComparisonOperator::Nin => "$_internalExprNin",
    }
}
