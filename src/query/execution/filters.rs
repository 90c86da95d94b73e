use crate::error::{Error, Result};
use crate::query::agg_expr::{compare_whole_values, is_truthy};
use crate::query::{collect_path_values, resolve_value, BsonValueRef, ComparisonOperator, Expr, Parameters, PathValues};
use crate::util::bson_utils::bson_eq;
use crate::util::collation::Collation;
use bson::spec::ElementType;
use bson::{Bson, Document};
use regex::RegexBuilder;
use std::collections::HashSet;
use std::sync::Arc;

/// Compiled document filter.
pub type Filter = Box<dyn Fn(&Document) -> bool + Send + Sync>;

/// Compiled filter over the values reached by a path.
type ValueFilter = Box<dyn Fn(&PathValues, &Document) -> bool + Send + Sync>;

/// Compiled filter over a single value.
type ValueMatcher = Arc<dyn Fn(&Bson) -> bool + Send + Sync>;

/// Converts a numeric BSON type code to an `ElementType`.
fn get_element_type_from_code(code: i32) -> Option<ElementType> {
    match code {
        1 => Some(ElementType::Double),
        2 => Some(ElementType::String),
        3 => Some(ElementType::EmbeddedDocument),
        4 => Some(ElementType::Array),
        5 => Some(ElementType::Binary),
        6 => Some(ElementType::Undefined),
        7 => Some(ElementType::ObjectId),
        8 => Some(ElementType::Boolean),
        9 => Some(ElementType::DateTime),
        10 => Some(ElementType::Null),
        11 => Some(ElementType::RegularExpression),
        13 => Some(ElementType::JavaScriptCode),
        16 => Some(ElementType::Int32),
        17 => Some(ElementType::Timestamp),
        18 => Some(ElementType::Int64),
        19 => Some(ElementType::Decimal128),
        127 => Some(ElementType::MaxKey),
        -1 => Some(ElementType::MinKey),
        _ => None,
    }
}

/// Checks a value against a type code. The pseudo code 0 stands for `"number"`.
fn check_bson_type(value: &Bson, code: i32) -> bool {
    let value_type = value.element_type();
    if code == 0 {
        return matches!(
            value_type,
            ElementType::Double | ElementType::Int32 | ElementType::Int64 | ElementType::Decimal128
        );
    }
    get_element_type_from_code(code).is_some_and(|t| t == value_type)
}

/// Builds the matcher of an equality against `operand`. Regular expressions
/// match strings, as well as an identical regular expression.
fn equality_matcher(operand: &Bson, collation: &Collation) -> Result<ValueMatcher> {
    if let Bson::RegularExpression(regex) = operand {
        let compiled = RegexBuilder::new(&regex.pattern)
            .case_insensitive(regex.options.contains('i'))
            .multi_line(regex.options.contains('m'))
            .dot_matches_new_line(regex.options.contains('s'))
            .ignore_whitespace(regex.options.contains('x'))
            .build()
            .map_err(|e| Error::InvalidRequest(format!("Invalid regular expression /{}/: {}", regex.pattern, e)))?;
        let regex = regex.clone();
        return Ok(Arc::new(move |value| match value {
            Bson::String(s) | Bson::Symbol(s) => compiled.is_match(s),
            Bson::RegularExpression(r) => r.pattern == regex.pattern && r.options == regex.options,
            _ => false,
        }));
    }

    let collation = collation.clone();
    let operand = collation.collation_key(operand);
    Ok(Arc::new(move |value| {
        if collation.is_simple() {
            bson_eq(value, &operand)
        } else {
            bson_eq(&collation.collation_key(value), &operand)
        }
    }))
}

fn range_matcher(operator: ComparisonOperator, operand: &Bson, collation: &Collation) -> ValueMatcher {
    let collation = collation.clone();
    let operand = collation.collation_key(operand);
    Arc::new(move |value| {
        if collation.is_simple() {
            compare_whole_values(operator, value, &operand)
        } else {
            compare_whole_values(operator, &collation.collation_key(value), &operand)
        }
    })
}

/// Applies `matcher` the way query predicates look at a field: a missing
/// branch is treated as `null`, an array matches if the array itself or
/// one of its elements matches.
fn any_value(values: &PathValues, matcher: &ValueMatcher) -> bool {
    values.values.iter().any(|value| match *value {
        None => matcher(&Bson::Null),
        Some(value) => {
            matcher(value) || matches!(value, Bson::Array(elements) if elements.iter().any(|e| matcher(e)))
        }
    })
}

fn comparison_filter(operator: ComparisonOperator, operand: &Bson, collation: &Collation) -> Result<ValueFilter> {
    let matcher: ValueMatcher = match operator {
        ComparisonOperator::Eq | ComparisonOperator::Ne => equality_matcher(operand, collation)?,
        ComparisonOperator::In | ComparisonOperator::Nin => {
            let elements = match operand {
                Bson::Array(elements) => elements,
                other => {
                    return Err(Error::InvalidRequest(format!("{} needs an array, got {}", operator.name(), other)))
                }
            };
            let matchers = elements
                .iter()
                .map(|e| equality_matcher(e, collation))
                .collect::<Result<Vec<_>>>()?;
            Arc::new(move |value| matchers.iter().any(|m| m(value)))
        }
        range => range_matcher(range, operand, collation),
    };

    let negated = matches!(operator, ComparisonOperator::Ne | ComparisonOperator::Nin);
    Ok(Box::new(move |values, _doc| any_value(values, &matcher) != negated))
}

/// Whole value comparison used by `$expr`: the field value is never unwound
/// and a missing field compares as `null`.
fn expr_comparison_filter(operator: ComparisonOperator, operand: &Bson, collation: &Collation) -> ValueFilter {
    let collation = collation.clone();
    let operand = collation.collation_key(operand);
    Box::new(move |values, _doc| {
        let value = match values.values.as_slice() {
            [Some(value)] if !values.through_array => collation.collation_key(value),
            _ => Bson::Null,
        };
        compare_whole_values(operator, &value, &operand)
    })
}

/// Converts a value filter expression into a function applied to the values of a field.
fn to_value_filter(filter: &Arc<Expr>, parameters: &Parameters, collation: &Collation) -> Result<ValueFilter> {
    match filter.as_ref() {
        Expr::Comparison { operator, value } => {
            comparison_filter(*operator, resolve_value(value, parameters)?, collation)
        }
        Expr::ExprComparison { operator, value } => Ok(expr_comparison_filter(
            *operator,
            resolve_value(value, parameters)?,
            collation,
        )),
        Expr::Exists(exists) => {
            let exists = *exists;
            Ok(Box::new(move |values, _doc| values.is_missing() != exists))
        }
        Expr::Type { bson_type, negated } => {
            let code = match resolve_value(bson_type, parameters)? {
                Bson::Int32(code) => *code,
                other => return Err(Error::InvalidRequest(format!("Invalid $type value: {}", other))),
            };
            let negated = *negated;
            Ok(Box::new(move |values, _doc| {
                let found = values.values.iter().flatten().any(|value| {
                    check_bson_type(value, code)
                        || matches!(value, Bson::Array(elements) if elements.iter().any(|e| check_bson_type(e, code)))
                });
                found != negated
            }))
        }
        Expr::Size { size, negated } => {
            let size = match resolve_value(size, parameters)? {
                Bson::Int64(size) => usize::try_from(*size).ok(),
                Bson::Int32(size) => usize::try_from(*size).ok(),
                _ => None,
            };
            let size = match size {
                Some(size) => size,
                None => return Err(Error::InvalidRequest("$size must be a non-negative integer".to_string())),
            };
            let negated = *negated;
            Ok(Box::new(move |values, _doc| {
                let found = values
                    .values
                    .iter()
                    .any(|value| matches!(value, Some(Bson::Array(elements)) if elements.len() == size));
                found != negated
            }))
        }
        Expr::All(value) => {
            let elements = match resolve_value(value, parameters)? {
                Bson::Array(elements) => elements.clone(),
                other => return Err(Error::InvalidRequest(format!("$all needs an array, got {}", other))),
            };
            let matchers = elements
                .iter()
                .map(|e| equality_matcher(e, collation))
                .collect::<Result<Vec<_>>>()?;
            Ok(Box::new(move |values, _doc| {
                !matchers.is_empty() && matchers.iter().all(|m| any_value(values, m))
            }))
        }
        Expr::ElemMatch(filters) => {
            let is_doc_filter = filters.iter().any(|f| {
                matches!(
                    f.as_ref(),
                    Expr::FieldFilters { .. } | Expr::And(_) | Expr::Or(_) | Expr::Nor(_) | Expr::ExprFilter(_)
                )
            });

            if is_doc_filter {
                let element_filter = to_filter(&Expr::and_of(filters.clone()), parameters, collation)?;
                Ok(Box::new(move |values, _doc| {
                    elem_match(values, |element| match element {
                        Bson::Document(sub_doc) => element_filter(sub_doc),
                        _ => false,
                    })
                }))
            } else {
                let element_filters = to_value_filters(filters, parameters, collation)?;
                Ok(Box::new(move |values, doc| {
                    elem_match(values, |element| {
                        let element_values = PathValues {
                            values: vec![Some(element)],
                            through_array: false,
                        };
                        element_filters.iter().all(|f| f(&element_values, doc))
                    })
                }))
            }
        }
        Expr::Not(child) => {
            let inner = to_value_filter(child, parameters, collation)?;
            Ok(Box::new(move |values, doc| !inner(values, doc)))
        }
        Expr::AlwaysTrue => Ok(Box::new(|_, _| true)),
        Expr::AlwaysFalse => Ok(Box::new(|_, _| false)),
        _ => Err(Error::UnexpectedError(format!("Unsupported value filter: {:?}", filter))),
    }
}

fn elem_match<F>(values: &PathValues, matcher: F) -> bool
where
    F: Fn(&Bson) -> bool,
{
    values.values.iter().any(|value| match value {
        Some(Bson::Array(elements)) => elements.iter().any(&matcher),
        _ => false,
    })
}

/// Compiles an expression into a filter function that can be applied to documents.
///
/// Placeholders are resolved against `parameters` once, at compile time.
pub fn to_filter(expr: &Arc<Expr>, parameters: &Parameters, collation: &Collation) -> Result<Filter> {
    match expr.as_ref() {
        Expr::And(children) => {
            let children_filters = to_filters(children, parameters, collation)?;
            Ok(Box::new(move |doc: &Document| children_filters.iter().all(|f| f(doc))))
        }
        Expr::Or(children) => {
            let children_filters = to_filters(children, parameters, collation)?;
            Ok(Box::new(move |doc: &Document| children_filters.iter().any(|f| f(doc))))
        }
        Expr::Not(child) => {
            let child_filter = to_filter(child, parameters, collation)?;
            Ok(Box::new(move |doc: &Document| !child_filter(doc)))
        }
        Expr::Nor(children) => {
            let children_filters = to_filters(children, parameters, collation)?;
            Ok(Box::new(move |doc: &Document| !children_filters.iter().any(|f| f(doc))))
        }
        Expr::AlwaysTrue => Ok(Box::new(|_| true)),
        Expr::AlwaysFalse => Ok(Box::new(|_| false)),
        Expr::FieldFilters { field, filters } => {
            let path = match field.as_ref() {
                Expr::Field(path) => path.clone(),
                other => return Err(Error::UnexpectedError(format!("Expected a field expression, got {:?}", other))),
            };
            let value_filters = to_value_filters(filters, parameters, collation)?;
            Ok(Box::new(move |doc: &Document| {
                let values = collect_path_values(doc, &path);
                value_filters.iter().all(|f| f(&values, doc))
            }))
        }
        Expr::ExprFilter(agg) => {
            let bound = agg.bind(parameters)?;
            let no_parameters = Parameters::new();
            Ok(Box::new(move |doc: &Document| {
                bound
                    .evaluate(doc, &no_parameters)
                    .map(|value| is_truthy(value.as_ref()))
                    .unwrap_or(false)
            }))
        }
        _ => Err(Error::UnexpectedError(format!("Unsupported top-level filter: {:?}", expr))),
    }
}

fn to_value_filters(filters: &[Arc<Expr>], parameters: &Parameters, collation: &Collation) -> Result<Vec<ValueFilter>> {
    filters
        .iter()
        .map(|f| to_value_filter(f, parameters, collation))
        .collect()
}

fn to_filters(children: &[Arc<Expr>], parameters: &Parameters, collation: &Collation) -> Result<Vec<Filter>> {
    children
        .iter()
        .map(|c| to_filter(c, parameters, collation))
        .collect()
}

/// Values of `path` the way `distinct` reports them: arrays are unwound one
/// level and a missing field counts as `null`.
pub fn distinct_values(doc: &Document, path: &[crate::query::PathComponent]) -> Vec<Bson> {
    let mut seen = HashSet::new();
    let mut result = Vec::new();
    for value in collect_path_values(doc, path).values {
        let unwound: Vec<&Bson> = match value {
            None => vec![&Bson::Null],
            Some(Bson::Array(elements)) if elements.is_empty() => vec![],
            Some(Bson::Array(elements)) => elements.iter().collect(),
            Some(value) => vec![value],
        };
        for value in unwound {
            if seen.insert(BsonValueRef(value)) {
                result.push(value.clone());
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::optimizer::optimizer::Optimizer;
    use crate::query::parser::parse_conditions;
    use crate::query::BsonValue;
    use bson::{bson, doc};

    fn matches(filter: Document, doc: Document) -> bool {
        matches_with(filter, doc, &Collation::simple())
    }

    fn matches_with(filter: Document, doc: Document, collation: &Collation) -> bool {
        let optimizer = Optimizer::new(Arc::new(crate::obs::logger::NoOpLogger));
        let normalized = optimizer.normalize(parse_conditions(&filter).unwrap());
        let (parametrized, parameters) = optimizer.parametrize(normalized);
        to_filter(&parametrized, &parameters, collation).unwrap()(&doc)
    }

    #[test]
    fn test_check_bson_type() {
        assert!(check_bson_type(&Bson::String("hello".to_string()), 2));
        assert!(check_bson_type(&Bson::Int64(1), 18));
        assert!(check_bson_type(&Bson::Double(1.0), 0));
        assert!(!check_bson_type(&Bson::Int32(1), 1));
        assert!(!check_bson_type(&Bson::Int32(1), 12345));
    }

    #[test]
    fn test_equality_and_arrays() {
        assert!(matches(doc! { "a": 1 }, doc! { "a": 1.0 }));
        assert!(matches(doc! { "a": 1 }, doc! { "a": [3, 1] }));
        assert!(matches(doc! { "a": [3, 1] }, doc! { "a": [3, 1] }));
        assert!(!matches(doc! { "a": 1 }, doc! { "a": 2 }));
        assert!(matches(doc! { "a.b": 2 }, doc! { "a": [{ "b": 1 }, { "b": 2 }] }));
    }

    #[test]
    fn test_null_matches_missing() {
        assert!(matches(doc! { "a": null }, doc! { "b": 1 }));
        assert!(matches(doc! { "a": null }, doc! { "a": null }));
        assert!(!matches(doc! { "a": null }, doc! { "a": 0 }));
        assert!(matches(doc! { "a.b": null }, doc! { "a": [{ "b": 1 }, { "c": 2 }] }));
        assert!(!matches(doc! { "a": { "$ne": null } }, doc! { "b": 1 }));
    }

    #[test]
    fn test_ranges_stay_within_type() {
        assert!(matches(doc! { "a": { "$gt": 1 } }, doc! { "a": 2 }));
        assert!(!matches(doc! { "a": { "$gt": 1 } }, doc! { "a": "z" }));
        assert!(!matches(doc! { "a": { "$lt": "m" } }, doc! { "a": 1 }));
        assert!(matches(doc! { "a": { "$gt": 1, "$lt": 3 } }, doc! { "a": [0, 5] }));
        assert!(matches(doc! { "a": { "$gt": Bson::MinKey } }, doc! { "a": "z" }));
    }

    #[test]
    fn test_nan() {
        assert!(matches(doc! { "a": f64::NAN }, doc! { "a": f64::NAN }));
        assert!(!matches(doc! { "a": { "$gt": f64::NAN } }, doc! { "a": f64::NAN }));
        assert!(matches(doc! { "a": { "$gte": f64::NAN } }, doc! { "a": f64::NAN }));
        assert!(!matches(doc! { "a": { "$lt": 0 } }, doc! { "a": f64::NAN }));
    }

    #[test]
    fn test_negations() {
        assert!(matches(doc! { "a": { "$not": { "$gt": 5 } } }, doc! { "b": 1 }));
        assert!(matches(doc! { "a": { "$not": { "$gt": 5 } } }, doc! { "a": "x" }));
        assert!(!matches(doc! { "a": { "$ne": 1 } }, doc! { "a": [1, 2] }));
        assert!(matches(doc! { "a": { "$nin": [1, 2] } }, doc! { "a": 3 }));
        assert!(matches(doc! { "$nor": [{ "a": 1 }, { "b": 1 }] }, doc! { "a": 2 }));
    }

    #[test]
    fn test_in_and_regex() {
        assert!(matches(doc! { "a": { "$in": [1, "x"] } }, doc! { "a": "x" }));
        assert!(matches(doc! { "a": { "$regex": "^ab", "$options": "i" } }, doc! { "a": "ABc" }));
        assert!(matches(doc! { "a": { "$in": [bson::Regex { pattern: "^z".into(), options: "".into() }] } }, doc! { "a": ["y", "zz"] }));
        assert!(!matches(doc! { "a": { "$regex": "^ab" } }, doc! { "a": 1 }));
    }

    #[test]
    fn test_exists_type_size_all() {
        assert!(matches(doc! { "a": { "$exists": false } }, doc! { "b": 1 }));
        assert!(matches(doc! { "a.b": { "$exists": true } }, doc! { "a": [{ "c": 1 }, { "b": 2 }] }));
        assert!(matches(doc! { "a": { "$type": "string" } }, doc! { "a": [1, "x"] }));
        assert!(matches(doc! { "a": { "$size": 2 } }, doc! { "a": [1, 2] }));
        assert!(matches(doc! { "a": { "$all": [1, 2] } }, doc! { "a": [2, 3, 1] }));
        assert!(!matches(doc! { "a": { "$all": [] } }, doc! { "a": [2] }));
    }

    #[test]
    fn test_negative_size_is_rejected() {
        let optimizer = Optimizer::new(Arc::new(crate::obs::logger::NoOpLogger));
        let normalized = optimizer.normalize(parse_conditions(&doc! { "a": { "$size": 2 } }).unwrap());
        let (parametrized, _) = optimizer.parametrize(normalized);

        // Same shape bound to a negative size
        let mut parameters = Parameters::new();
        parameters.collect_parameter(BsonValue(Bson::Int64(-1)));
        let error = to_filter(&parametrized, &parameters, &Collation::simple()).err().unwrap();
        assert!(matches!(error, Error::InvalidRequest(_)));

        let mut parameters = Parameters::new();
        parameters.collect_parameter(BsonValue(Bson::Int64(2)));
        assert!(to_filter(&parametrized, &parameters, &Collation::simple()).unwrap()(&doc! { "a": [1, 2] }));
    }

    #[test]
    fn test_elem_match() {
        assert!(matches(doc! { "a": { "$elemMatch": { "$gt": 1, "$lt": 3 } } }, doc! { "a": [0, 2] }));
        assert!(!matches(doc! { "a": { "$elemMatch": { "$gt": 1, "$lt": 3 } } }, doc! { "a": [0, 5] }));
        assert!(matches(
            doc! { "a": { "$elemMatch": { "b": 1, "c": 2 } } },
            doc! { "a": [{ "b": 1, "c": 1 }, { "b": 1, "c": 2 }] }
        ));
    }

    #[test]
    fn test_expr() {
        assert!(matches(doc! { "$expr": { "$gt": ["$a", 1] } }, doc! { "a": 2 }));
        assert!(!matches(doc! { "$expr": { "$eq": ["$a", 1] } }, doc! { "a": [1] }));
        assert!(matches(doc! { "$expr": { "$eq": ["$a", null] } }, doc! { "b": 1 }));
        assert!(matches(doc! { "$expr": { "$lt": ["$a", "$b"] } }, doc! { "a": 1, "b": 2 }));
        assert!(matches(doc! { "$expr": { "$lt": [1, "$a.b"] } }, doc! { "a": { "b": 2 } }));
    }

    #[test]
    fn test_collation() {
        let collation = Collation::new("en", 2);
        assert!(matches_with(doc! { "a": "abc" }, doc! { "a": "ABC" }, &collation));
        assert!(!matches(doc! { "a": "abc" }, doc! { "a": "ABC" }));
        assert!(matches_with(doc! { "a": { "$lt": "B" } }, doc! { "a": "a" }, &collation));
    }

    #[test]
    fn test_distinct_values() {
        let path = crate::query::parse_field_path("a").unwrap();
        assert_eq!(distinct_values(&doc! { "a": [1, 2, 1] }, &path), vec![bson!(1), bson!(2)]);
        assert_eq!(distinct_values(&doc! { "b": 1 }, &path), vec![Bson::Null]);
        assert!(distinct_values(&doc! { "a": [] }, &path).is_empty());
    }
}
