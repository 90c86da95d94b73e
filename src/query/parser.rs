use crate::error::Error;
use crate::query::agg_expr::parse_agg_expr;
use crate::query::{
    BsonValue, ComparisonOperator, ComparisonOperator::*, Expr, PathComponent, Projection, ProjectionExpr,
    SortField, SortOrder,
};
use bson::{Bson, Document, Regex};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, LazyLock};

static SCALAR_OPERATIONS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    HashSet::from([
        "$eq", "$ne", "$gt", "$gte", "$lt", "$lte", "$in", "$nin", "$exists", "$type", "$size", "$all",
        "$elemMatch", "$regex", "$options", "$not",
    ])
});

/// Parses a BSON `Document` representing a query filter into an `Expr`.
pub fn parse_conditions(doc: &Document) -> Result<Arc<Expr>, Error> {
    let mut conditions = Vec::new();

    for (key, value) in doc.iter() {
        match key.as_str() {
            "$and" | "$or" | "$nor" => {
                let parsed_conditions = parse_logical_operator(key, value)?;
                conditions.push(Arc::new(parsed_conditions));
            }
            "$not" => {
                if let Bson::Document(sub_doc) = value {
                    let parsed_condition = parse_conditions(sub_doc)?;
                    conditions.push(Arc::new(Expr::Not(parsed_condition)));
                } else {
                    return Err(Error::InvalidRequest(
                        "Invalid format for $not; must be a document".to_string(),
                    ));
                }
            }
            "$expr" => conditions.push(Arc::new(Expr::ExprFilter(parse_agg_expr(value)?))),
            _ if key.starts_with('$') => {
                return Err(Error::InvalidRequest(format!("Unknown top level operator: {}", key)))
            }
            _ => {
                let field = Expr::Field(parse_field_path(key)?);
                conditions.push(parse_field_conditions(field, value)?);
            }
        }
    }

    match conditions.len() {
        0 => Ok(Arc::new(Expr::AlwaysTrue)),
        1 => Ok(conditions.remove(0)),
        _ => Ok(Arc::new(Expr::And(conditions))),
    }
}

fn parse_field_conditions(field: Expr, value: &Bson) -> Result<Arc<Expr>, Error> {
    Ok(Arc::new(Expr::FieldFilters {
        field: Arc::new(field),
        filters: parse_predicates(value)?,
    }))
}

/// Parses logical operators ($and, $or, $nor) into an `Expr`.
fn parse_logical_operator(operator: &str, value: &Bson) -> Result<Expr, Error> {
    if let Bson::Array(sub_docs) = value {
        if sub_docs.is_empty() {
            return Err(Error::InvalidRequest(format!(
                "{} must be a nonempty array",
                operator
            )));
        }
        let mut parsed_conditions = Vec::with_capacity(sub_docs.len());
        for bson in sub_docs {
            if let Bson::Document(sub_doc) = bson {
                parsed_conditions.push(parse_conditions(sub_doc)?);
            } else {
                return Err(Error::InvalidRequest(format!(
                    "Invalid format for {}; must be an array of documents",
                    operator
                )));
            }
        }

        match operator {
            "$and" => Ok(Expr::And(parsed_conditions)),
            "$or" => Ok(Expr::Or(parsed_conditions)),
            "$nor" => Ok(Expr::Nor(parsed_conditions)),
            _ => Err(Error::InvalidRequest(format!(
                "Unknown logical operator: {}",
                operator
            ))),
        }
    } else {
        Err(Error::InvalidRequest(format!(
            "Invalid format for {}; must be an array",
            operator
        )))
    }
}

/// Parses predicate conditions (e.g., `$eq`, `$gt`) for a specific field.
fn parse_predicates(value: &Bson) -> Result<Vec<Arc<Expr>>, Error> {
    let sub_docs = match value {
        Bson::Document(sub_docs) if is_operator_document(sub_docs) => sub_docs,
        // Implicit equality for direct field values, including documents without operators
        _ => return Ok(vec![new_predicate(Eq, value)?]),
    };

    let mut predicates = Vec::new();
    for (key, value) in sub_docs.iter() {
        match key.as_str() {
            "$eq" => predicates.push(new_predicate(Eq, value)?),
            "$ne" => predicates.push(new_predicate(Ne, value)?),
            "$gt" => predicates.push(new_predicate(Gt, value)?),
            "$gte" => predicates.push(new_predicate(Gte, value)?),
            "$lt" => predicates.push(new_predicate(Lt, value)?),
            "$lte" => predicates.push(new_predicate(Lte, value)?),
            "$in" => predicates.push(new_set_predicate(In, value)?),
            "$nin" => predicates.push(new_set_predicate(Nin, value)?),
            "$exists" => predicates.push(Arc::new(Expr::Exists(is_true(value)))),
            "$type" => {
                if let Some(bson_type) = parse_bson_type(value) {
                    predicates.push(Arc::new(Expr::Type {
                        bson_type: Arc::new(Expr::Literal(BsonValue(bson_type))),
                        negated: false,
                    }))
                } else {
                    return Err(Error::InvalidRequest(
                        "$type must be a valid BSON type".to_string(),
                    ));
                }
            }
            "$size" => {
                let size = match value {
                    Bson::Int32(size) if *size >= 0 => *size as i64,
                    Bson::Int64(size) if *size >= 0 => *size,
                    Bson::Double(size) if *size >= 0.0 && size.fract() == 0.0 => *size as i64,
                    _ => {
                        return Err(Error::InvalidRequest(
                            "$size must be a non-negative integer".to_string(),
                        ))
                    }
                };
                predicates.push(Arc::new(Expr::Size {
                    size: Arc::new(Expr::Literal(BsonValue(Bson::Int64(size)))),
                    negated: false,
                }))
            }
            "$all" => {
                if let Bson::Array(values) = value {
                    predicates.push(Arc::new(Expr::All(Arc::new(Expr::Literal(BsonValue(Bson::Array(
                        values.clone(),
                    )))))))
                } else {
                    return Err(Error::InvalidRequest("$all must be an array".to_string()));
                }
            }
            "$elemMatch" => predicates.push(parse_elem_match(value)?),
            "$regex" => {
                let options = sub_docs.get_str("$options").unwrap_or("");
                predicates.push(new_predicate(Eq, &Bson::RegularExpression(parse_regex(value, options)?))?);
            }
            "$options" => {
                if !sub_docs.contains_key("$regex") {
                    return Err(Error::InvalidRequest("$options needs a $regex".to_string()));
                }
            }
            "$not" => {
                let negated = match value {
                    Bson::Document(doc) if is_operator_document(doc) => parse_predicates(value)?,
                    Bson::RegularExpression(_) => vec![new_predicate(Eq, value)?],
                    _ => {
                        return Err(Error::InvalidRequest(
                            "$not needs a regex or a document".to_string(),
                        ))
                    }
                };
                let inner = if negated.len() == 1 {
                    negated.into_iter().next().unwrap_or_else(|| Arc::new(Expr::AlwaysTrue))
                } else {
                    Arc::new(Expr::And(negated))
                };
                predicates.push(Arc::new(Expr::Not(inner)));
            }
            _ => return Err(Error::InvalidRequest(format!("Unknown operator: {}", key))),
        }
    }
    Ok(predicates)
}

fn is_operator_document(doc: &Document) -> bool {
    doc.keys().next().is_some_and(|k| k.starts_with('$'))
}

fn is_true(value: &Bson) -> bool {
    match value {
        Bson::Boolean(b) => *b,
        Bson::Int32(i) => *i != 0,
        Bson::Int64(i) => *i != 0,
        Bson::Double(d) => *d != 0.0,
        Bson::Null | Bson::Undefined => false,
        _ => true,
    }
}

fn parse_elem_match(value: &Bson) -> Result<Arc<Expr>, Error> {
    let doc = match value {
        Bson::Document(doc) => doc,
        _ => return Err(Error::InvalidRequest("$elemMatch must be a document".to_string())),
    };

    let is_operator_only = !doc.is_empty() && doc.keys().all(|k| SCALAR_OPERATIONS.contains(k.as_str()));

    if is_operator_only {
        // Scalar array case: operators only
        let sub_preds = parse_predicates(value)?;
        Ok(Arc::new(Expr::ElemMatch(sub_preds)))
    } else {
        // Array of documents case: fields and nested conditions
        let nested = parse_conditions(doc)?;
        let sub_preds = match nested.as_ref() {
            Expr::And(children) => children.clone(),
            Expr::AlwaysTrue => vec![],
            _ => vec![nested],
        };
        Ok(Arc::new(Expr::ElemMatch(sub_preds)))
    }
}

fn parse_regex(pattern: &Bson, options: &str) -> Result<Regex, Error> {
    match pattern {
        Bson::String(pattern) => Ok(new_regex(pattern, options)),
        Bson::RegularExpression(regex) if options.is_empty() => Ok(regex.clone()),
        Bson::RegularExpression(regex) => Ok(new_regex(&regex.pattern, options)),
        _ => Err(Error::InvalidRequest("$regex has to be a string".to_string())),
    }
}

fn new_regex(pattern: &str, options: &str) -> Regex {
    let mut options: Vec<char> = options.chars().collect();
    options.sort_unstable();
    options.dedup();
    Regex {
        pattern: pattern.to_string(),
        options: options.into_iter().collect(),
    }
}

fn new_predicate(operator: ComparisonOperator, value: &Bson) -> Result<Arc<Expr>, Error> {
    if let Bson::RegularExpression(regex) = value {
        if operator != Eq || !regex.options.chars().all(|c| "imsx".contains(c)) {
            return Err(Error::InvalidRequest(format!(
                "Invalid regular expression for {}: /{}/{}",
                operator.name(),
                regex.pattern,
                regex.options
            )));
        }
    }
    Ok(Arc::new(Expr::Comparison {
        operator,
        value: Arc::new(Expr::Literal(BsonValue(value.clone()))),
    }))
}

fn new_set_predicate(operator: ComparisonOperator, value: &Bson) -> Result<Arc<Expr>, Error> {
    match value {
        Bson::Array(values) => {
            if values.iter().any(|v| matches!(v, Bson::Document(d) if is_operator_document(d))) {
                return Err(Error::InvalidRequest(format!(
                    "Cannot nest operators inside {}",
                    operator.name()
                )));
            }
            Ok(Arc::new(Expr::Comparison {
                operator,
                value: Arc::new(Expr::Literal(BsonValue(value.clone()))),
            }))
        }
        _ => Err(Error::InvalidRequest(format!("{} needs an array", operator.name()))),
    }
}

/// Type codes accepted by `$type`. `"number"` is reported as the pseudo code 0.
fn parse_bson_type(value: &Bson) -> Option<Bson> {
    const CODES: [(i32, &str); 17] = [
        (1, "double"),
        (2, "string"),
        (3, "object"),
        (4, "array"),
        (5, "binData"),
        (6, "undefined"),
        (7, "objectId"),
        (8, "bool"),
        (9, "date"),
        (10, "null"),
        (11, "regex"),
        (16, "int"),
        (17, "timestamp"),
        (18, "long"),
        (19, "decimal"),
        (-1, "minKey"),
        (127, "maxKey"),
    ];

    match value {
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => {
            let code = match value {
                Bson::Int32(i) => *i as i64,
                Bson::Int64(i) => *i,
                Bson::Double(d) if d.fract() == 0.0 => *d as i64,
                _ => return None,
            };
            CODES
                .iter()
                .find(|(c, _)| *c as i64 == code)
                .map(|(c, _)| Bson::Int32(*c))
        }
        Bson::String(alias) if alias == "number" => Some(Bson::Int32(0)),
        Bson::String(alias) => CODES
            .iter()
            .find(|(_, name)| name == alias)
            .map(|(c, _)| Bson::Int32(*c)),
        _ => None,
    }
}

/// Parses a projection document into a `Projection`.
///
/// - Fields with value `1` (or `true`) are included.
/// - Fields with value `0` (or `false`) are excluded.
/// - Mixing inclusion and exclusion is only allowed for excluding `_id`.
pub fn parse_projection(doc: &Document) -> Result<Projection, Error> {
    let mut include_fields = ProjectionExpr::Fields { children: BTreeMap::new() };
    let mut exclude_fields = ProjectionExpr::Fields { children: BTreeMap::new() };
    let mut has_id = false;
    let mut exclude_id = false;

    for (key, value) in doc.iter() {
        let path = parse_field_path(key)?
            .into_iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>();

        let include = match value {
            Bson::Int32(1) | Bson::Int64(1) | Bson::Boolean(true) => true,
            Bson::Int32(0) | Bson::Int64(0) | Bson::Boolean(false) => false,
            Bson::Double(d) if *d == 1.0 => true,
            Bson::Double(d) if *d == 0.0 => false,
            _ => {
                return Err(Error::InvalidRequest(format!(
                    "Invalid projection value for field '{}'",
                    key
                )))
            }
        };

        if key == "_id" {
            has_id = true;
            exclude_id = !include;
        }

        if include {
            include_fields.add_path(&path)?;
        } else {
            exclude_fields.add_path(&path)?;
        }
    }

    let id_path = vec!["_id".to_string()];

    match (!include_fields.is_empty(), !exclude_fields.is_empty()) {
        (true, false) => {
            if !has_id {
                include_fields.add_path(&id_path)?;
            }
            Ok(Projection::Include(Arc::new(include_fields)))
        }
        (false, true) => Ok(Projection::Exclude(Arc::new(exclude_fields))),
        (true, true) => {
            if exclude_id && exclude_fields.children().map_or(0, |c| c.len()) == 1 {
                include_fields.remove_path(&id_path);
            } else {
                return Err(Error::InvalidRequest(
                    "Projection cannot have a mix of inclusion and exclusion.".to_string(),
                ));
            }
            Ok(Projection::Include(Arc::new(include_fields)))
        }
        (false, false) => Err(Error::InvalidRequest(
            "Projection document cannot be empty".to_string(),
        )),
    }
}

pub fn parse_field_path(path: &str) -> Result<Vec<PathComponent>, Error> {
    path.split('.').map(parse_path_component).collect()
}

fn parse_path_component(component: &str) -> Result<PathComponent, Error> {
    if let Ok(index) = component.parse::<usize>() {
        Ok(PathComponent::ArrayElement(index))
    } else {
        validate_field_name(component)?;
        Ok(PathComponent::FieldName(component.to_string()))
    }
}

fn validate_field_name(field_name: &str) -> Result<(), Error> {
    if field_name.is_empty() {
        return Err(Error::InvalidRequest(
            "Field name cannot be empty.".to_string(),
        ));
    }
    if field_name.starts_with('$') {
        return Err(Error::InvalidRequest(format!(
            "Field name cannot start with '$': {}",
            field_name
        )));
    }
    if field_name.contains('\0') {
        return Err(Error::InvalidRequest(
            "Field name cannot contain null characters ('\\0').".to_string(),
        ));
    }
    Ok(())
}

pub fn parse_sort(doc: &Document) -> Result<Vec<SortField>, Error> {
    let mut fields = Vec::new();

    for (key, value) in doc.iter() {
        let order = match value {
            Bson::Int32(1) | Bson::Int64(1) => SortOrder::Ascending,
            Bson::Int32(-1) | Bson::Int64(-1) => SortOrder::Descending,
            Bson::Double(d) if *d == 1.0 => SortOrder::Ascending,
            Bson::Double(d) if *d == -1.0 => SortOrder::Descending,
            _ => {
                return Err(Error::InvalidRequest(format!(
                    "Invalid sort order for field '{}'",
                    key
                )))
            }
        };

        fields.push(SortField {
            path: parse_field_path(key)?,
            order,
        });
    }

    Ok(fields)
}
