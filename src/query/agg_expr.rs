use crate::error::{Error, Result};
use crate::query::{parse_field_path, BsonValue, ComparisonOperator, Parameters, PathComponent};
use crate::util::bson_utils::{bson_eq, cmp_bson, is_nan, is_sentinel, same_type_class};
use bson::{Bson, Document};
use std::cmp::Ordering;
use std::sync::Arc;

/// Computed expression used by `$expr` filters.
///
/// Only the subset needed to express comparisons between fields and
/// constants is supported.
#[derive(Debug, Clone, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub enum AggExpr {
    /// `"$a.b"`
    FieldPath(Vec<PathComponent>),
    Literal(BsonValue),
    Placeholder(u32),
    Compare {
        operator: ComparisonOperator,
        lhs: Arc<AggExpr>,
        rhs: Arc<AggExpr>,
    },
    And(Vec<Arc<AggExpr>>),
    Or(Vec<Arc<AggExpr>>),
    Not(Arc<AggExpr>),
}

/// Parses the value of a `$expr` operator.
pub fn parse_agg_expr(value: &Bson) -> Result<Arc<AggExpr>> {
    match value {
        Bson::String(s) if s.starts_with("$$") => Err(Error::InvalidRequest(format!(
            "Variables are not supported in $expr: {}",
            s
        ))),
        Bson::String(s) if s.starts_with('$') => {
            let path = parse_field_path(&s[1..])?;
            Ok(Arc::new(AggExpr::FieldPath(path)))
        }
        Bson::Document(doc) => parse_agg_document(doc),
        other => Ok(Arc::new(AggExpr::Literal(BsonValue(other.clone())))),
    }
}

fn parse_agg_document(doc: &Document) -> Result<Arc<AggExpr>> {
    let operator = match doc.keys().next() {
        Some(key) if key.starts_with('$') => key.clone(),
        _ => return Ok(Arc::new(AggExpr::Literal(BsonValue(Bson::Document(doc.clone()))))),
    };

    if doc.len() != 1 {
        return Err(Error::InvalidRequest(format!(
            "An expression specification must contain exactly one operator, got: {}",
            doc
        )));
    }

    let args = doc.get(&operator).unwrap_or(&Bson::Null);

    let comparison = match operator.as_str() {
        "$eq" => Some(ComparisonOperator::Eq),
        "$ne" => Some(ComparisonOperator::Ne),
        "$gt" => Some(ComparisonOperator::Gt),
        "$gte" => Some(ComparisonOperator::Gte),
        "$lt" => Some(ComparisonOperator::Lt),
        "$lte" => Some(ComparisonOperator::Lte),
        _ => None,
    };

    if let Some(operator) = comparison {
        return match args {
            Bson::Array(operands) if operands.len() == 2 => Ok(Arc::new(AggExpr::Compare {
                operator,
                lhs: parse_agg_expr(&operands[0])?,
                rhs: parse_agg_expr(&operands[1])?,
            })),
            _ => Err(Error::InvalidRequest(format!(
                "Expression {} takes exactly 2 arguments",
                operator.name()
            ))),
        };
    }

    match operator.as_str() {
        "$and" | "$or" => {
            let children = parse_agg_args(args)?;
            if operator == "$and" {
                Ok(Arc::new(AggExpr::And(children)))
            } else {
                Ok(Arc::new(AggExpr::Or(children)))
            }
        }
        "$not" => {
            let mut children = parse_agg_args(args)?;
            if children.len() != 1 {
                return Err(Error::InvalidRequest("Expression $not takes exactly 1 argument".to_string()));
            }
            Ok(Arc::new(AggExpr::Not(children.remove(0))))
        }
        "$literal" => Ok(Arc::new(AggExpr::Literal(BsonValue(args.clone())))),
        _ => Err(Error::InvalidRequest(format!("Unrecognized expression '{}'", operator))),
    }
}

fn parse_agg_args(args: &Bson) -> Result<Vec<Arc<AggExpr>>> {
    match args {
        Bson::Array(values) => values.iter().map(parse_agg_expr).collect(),
        single => Ok(vec![parse_agg_expr(single)?]),
    }
}

impl AggExpr {
    /// Evaluates the expression against `doc`. A missing field evaluates to `None`.
    pub fn evaluate(&self, doc: &Document, parameters: &Parameters) -> Result<Option<Bson>> {
        match self {
            AggExpr::FieldPath(path) => Ok(resolve_field_path(doc, path)),
            AggExpr::Literal(value) => Ok(Some(value.to_bson())),
            AggExpr::Placeholder(idx) => Ok(Some(parameters.get(*idx)?.to_bson())),
            AggExpr::Compare { operator, lhs, rhs } => {
                let lhs = lhs.evaluate(doc, parameters)?.unwrap_or(Bson::Null);
                let rhs = rhs.evaluate(doc, parameters)?.unwrap_or(Bson::Null);
                Ok(Some(Bson::Boolean(compare_operands(*operator, &lhs, &rhs))))
            }
            AggExpr::And(children) => {
                for child in children {
                    if !is_truthy(child.evaluate(doc, parameters)?.as_ref()) {
                        return Ok(Some(Bson::Boolean(false)));
                    }
                }
                Ok(Some(Bson::Boolean(true)))
            }
            AggExpr::Or(children) => {
                for child in children {
                    if is_truthy(child.evaluate(doc, parameters)?.as_ref()) {
                        return Ok(Some(Bson::Boolean(true)));
                    }
                }
                Ok(Some(Bson::Boolean(false)))
            }
            AggExpr::Not(child) => {
                let value = child.evaluate(doc, parameters)?;
                Ok(Some(Bson::Boolean(!is_truthy(value.as_ref()))))
            }
        }
    }

    /// Returns `true` if the expression does not reference any field.
    pub fn is_constant(&self) -> bool {
        match self {
            AggExpr::FieldPath(_) => false,
            AggExpr::Literal(_) | AggExpr::Placeholder(_) => true,
            AggExpr::Compare { lhs, rhs, .. } => lhs.is_constant() && rhs.is_constant(),
            AggExpr::And(children) | AggExpr::Or(children) => children.iter().all(|c| c.is_constant()),
            AggExpr::Not(child) => child.is_constant(),
        }
    }

    /// Replaces every literal by a placeholder registered in `parameters`.
    pub fn parametrize(self: &Arc<Self>, parameters: &mut Parameters) -> Arc<AggExpr> {
        match self.as_ref() {
            AggExpr::Literal(value) => match parameters.collect_parameter(value.clone()).as_ref() {
                crate::query::Expr::Placeholder(idx) => Arc::new(AggExpr::Placeholder(*idx)),
                _ => self.clone(),
            },
            AggExpr::Compare { operator, lhs, rhs } => Arc::new(AggExpr::Compare {
                operator: *operator,
                lhs: lhs.parametrize(parameters),
                rhs: rhs.parametrize(parameters),
            }),
            AggExpr::And(children) => {
                Arc::new(AggExpr::And(children.iter().map(|c| c.parametrize(parameters)).collect()))
            }
            AggExpr::Or(children) => {
                Arc::new(AggExpr::Or(children.iter().map(|c| c.parametrize(parameters)).collect()))
            }
            AggExpr::Not(child) => Arc::new(AggExpr::Not(child.parametrize(parameters))),
            _ => self.clone(),
        }
    }

    /// Replaces every placeholder by the literal it references.
    pub fn bind(self: &Arc<Self>, parameters: &Parameters) -> Result<Arc<AggExpr>> {
        Ok(match self.as_ref() {
            AggExpr::Placeholder(idx) => Arc::new(AggExpr::Literal(parameters.get(*idx)?.clone())),
            AggExpr::Compare { operator, lhs, rhs } => Arc::new(AggExpr::Compare {
                operator: *operator,
                lhs: lhs.bind(parameters)?,
                rhs: rhs.bind(parameters)?,
            }),
            AggExpr::And(children) => Arc::new(AggExpr::And(
                children.iter().map(|c| c.bind(parameters)).collect::<Result<_>>()?,
            )),
            AggExpr::Or(children) => Arc::new(AggExpr::Or(
                children.iter().map(|c| c.bind(parameters)).collect::<Result<_>>()?,
            )),
            AggExpr::Not(child) => Arc::new(AggExpr::Not(child.bind(parameters)?)),
            _ => self.clone(),
        })
    }

    /// Converts back to the `$expr` syntax.
    pub fn to_bson(&self) -> Bson {
        match self {
            AggExpr::FieldPath(path) => Bson::String(format!("${}", crate::query::format_path(path))),
            AggExpr::Literal(value) => match &value.0 {
                Bson::String(s) if s.starts_with('$') => bson::bson!({ "$literal": s.clone() }),
                Bson::Document(_) | Bson::Array(_) => bson::bson!({ "$literal": value.to_bson() }),
                other => other.clone(),
            },
            AggExpr::Placeholder(idx) => Bson::String(format!("?{}", idx)),
            AggExpr::Compare { operator, lhs, rhs } => {
                let mut doc = Document::new();
                doc.insert(operator.name(), vec![lhs.to_bson(), rhs.to_bson()]);
                Bson::Document(doc)
            }
            AggExpr::And(children) => {
                bson::bson!({ "$and": children.iter().map(|c| c.to_bson()).collect::<Vec<_>>() })
            }
            AggExpr::Or(children) => {
                bson::bson!({ "$or": children.iter().map(|c| c.to_bson()).collect::<Vec<_>>() })
            }
            AggExpr::Not(child) => bson::bson!({ "$not": [child.to_bson()] }),
        }
    }
}

/// Aggregation truthiness: `false`, `null`, missing and zero are false.
pub fn is_truthy(value: Option<&Bson>) -> bool {
    match value {
        None | Some(Bson::Null) | Some(Bson::Undefined) | Some(Bson::Boolean(false)) => false,
        Some(Bson::Int32(0)) | Some(Bson::Int64(0)) => false,
        Some(Bson::Double(d)) => *d != 0.0,
        Some(_) => true,
    }
}

/// Compares two whole values. Range operators only hold between values of the
/// same type class, `MinKey` and `MaxKey` being comparable with everything.
pub fn compare_whole_values(operator: ComparisonOperator, value: &Bson, operand: &Bson) -> bool {
    match operator {
        ComparisonOperator::Eq => bson_eq(value, operand),
        ComparisonOperator::Ne => !bson_eq(value, operand),
        ComparisonOperator::Gt | ComparisonOperator::Gte | ComparisonOperator::Lt | ComparisonOperator::Lte => {
            let sentinel = is_sentinel(operand);
            if !(sentinel || same_type_class(value, operand)) {
                return false;
            }
            // NaN sorts as a number, strictly between MinKey and MaxKey
            if !sentinel && (is_nan(value) || is_nan(operand)) {
                return matches!(operator, ComparisonOperator::Gte | ComparisonOperator::Lte)
                    && is_nan(value)
                    && is_nan(operand);
            }
            let ord = cmp_bson(value, operand);
            match operator {
                ComparisonOperator::Gt => ord == Ordering::Greater,
                ComparisonOperator::Gte => ord != Ordering::Less,
                ComparisonOperator::Lt => ord == Ordering::Less,
                _ => ord != Ordering::Greater,
            }
        }
        ComparisonOperator::In | ComparisonOperator::Nin => false,
    }
}

/// Compares the two operands of a `$expr` comparison. A sentinel is compared
/// as the operand whatever its side.
pub fn compare_operands(operator: ComparisonOperator, lhs: &Bson, rhs: &Bson) -> bool {
    if is_sentinel(lhs) && !is_sentinel(rhs) {
        compare_whole_values(operator.swap_operands(), rhs, lhs)
    } else {
        compare_whole_values(operator, lhs, rhs)
    }
}

/// Resolves `$a.b.c`. Traversing an array of documents returns the array of
/// the sub-field values, as aggregation field paths do.
fn resolve_field_path(doc: &Document, path: &[PathComponent]) -> Option<Bson> {
    let (first, rest) = path.split_first()?;
    let value = doc.get(first.to_string())?;
    resolve_in_value(value, rest)
}

fn resolve_in_value(value: &Bson, path: &[PathComponent]) -> Option<Bson> {
    let (first, rest) = match path.split_first() {
        None => return Some(value.clone()),
        Some(split) => split,
    };
    match value {
        Bson::Document(doc) => resolve_in_value(doc.get(first.to_string())?, rest),
        Bson::Array(values) => {
            let resolved: Vec<Bson> = values
                .iter()
                .filter(|v| matches!(v, Bson::Document(_) | Bson::Array(_)))
                .filter_map(|v| resolve_in_value(v, path))
                .collect();
            Some(Bson::Array(resolved))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{bson, doc};

    fn eval(expr: &Bson, doc: &Document) -> Option<Bson> {
        parse_agg_expr(expr)
            .unwrap()
            .evaluate(doc, &Parameters::new())
            .unwrap()
    }

    #[test]
    fn test_parse_comparison() {
        let expr = parse_agg_expr(&bson!({ "$gt": ["$x", 1] })).unwrap();
        assert_eq!(
            expr.as_ref(),
            &AggExpr::Compare {
                operator: ComparisonOperator::Gt,
                lhs: Arc::new(AggExpr::FieldPath(vec!["x".into()])),
                rhs: Arc::new(AggExpr::Literal(BsonValue(Bson::Int32(1)))),
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_agg_expr(&bson!({ "$gt": ["$x"] })).is_err());
        assert!(parse_agg_expr(&bson!({ "$foo": 1 })).is_err());
        assert!(parse_agg_expr(&bson!("$$ROOT")).is_err());
        assert!(parse_agg_expr(&bson!({ "$not": [1, 2] })).is_err());
    }

    #[test]
    fn test_field_vs_field() {
        let expr = bson!({ "$lt": ["$a", "$b"] });
        assert_eq!(eval(&expr, &doc! { "a": 1, "b": 2 }), Some(Bson::Boolean(true)));
        assert_eq!(eval(&expr, &doc! { "a": 3, "b": 2 }), Some(Bson::Boolean(false)));
        // Different type classes never satisfy a range comparison.
        assert_eq!(eval(&expr, &doc! { "a": 1, "b": "2" }), Some(Bson::Boolean(false)));
    }

    #[test]
    fn test_missing_is_null() {
        let expr = bson!({ "$eq": ["$a", null] });
        assert_eq!(eval(&expr, &doc! { "b": 1 }), Some(Bson::Boolean(true)));
        let expr = bson!({ "$lt": ["$a", 1] });
        assert_eq!(eval(&expr, &doc! { "b": 1 }), Some(Bson::Boolean(false)));
    }

    #[test]
    fn test_whole_value_comparison() {
        let expr = bson!({ "$eq": ["$a", 1] });
        assert_eq!(eval(&expr, &doc! { "a": [1, 2] }), Some(Bson::Boolean(false)));
        let expr = bson!({ "$eq": ["$a", [1, 2]] });
        assert_eq!(eval(&expr, &doc! { "a": [1, 2] }), Some(Bson::Boolean(true)));
    }

    #[test]
    fn test_nan_sorts_between_sentinels() {
        use std::str::FromStr;
        let nans = [
            Bson::Double(f64::NAN),
            Bson::Decimal128(bson::Decimal128::from_str("NaN").unwrap()),
        ];
        for nan in &nans {
            assert!(compare_whole_values(ComparisonOperator::Lt, nan, &Bson::MaxKey));
            assert!(compare_whole_values(ComparisonOperator::Lte, nan, &Bson::MaxKey));
            assert!(!compare_whole_values(ComparisonOperator::Gt, nan, &Bson::MaxKey));
            assert!(!compare_whole_values(ComparisonOperator::Gte, nan, &Bson::MaxKey));
            assert!(compare_whole_values(ComparisonOperator::Gt, nan, &Bson::MinKey));
            assert!(compare_whole_values(ComparisonOperator::Gte, nan, &Bson::MinKey));
            assert!(!compare_whole_values(ComparisonOperator::Lt, nan, &Bson::MinKey));
            assert!(!compare_whole_values(ComparisonOperator::Lte, nan, &Bson::MinKey));

            let mut doc = Document::new();
            doc.insert("a", nan.clone());
            let expr = Bson::Document(doc! { "$lt": ["$a", Bson::MaxKey] });
            assert_eq!(eval(&expr, &doc), Some(Bson::Boolean(true)));
            let expr = Bson::Document(doc! { "$gt": [Bson::MaxKey, "$a"] });
            assert_eq!(eval(&expr, &doc), Some(Bson::Boolean(true)));
            let expr = Bson::Document(doc! { "$gte": [Bson::MinKey, "$a"] });
            assert_eq!(eval(&expr, &doc), Some(Bson::Boolean(false)));
        }
        // NaN only equals NaN inside the number class
        assert!(!compare_whole_values(ComparisonOperator::Lt, &nans[0], &Bson::Int32(1)));
        assert!(compare_whole_values(ComparisonOperator::Lte, &nans[0], &nans[1]));
    }

    #[test]
    fn test_logical() {
        let expr = bson!({ "$and": [{ "$gt": ["$a", 1] }, { "$not": [{ "$eq": ["$b", 2] }] }] });
        assert_eq!(eval(&expr, &doc! { "a": 2, "b": 3 }), Some(Bson::Boolean(true)));
        assert_eq!(eval(&expr, &doc! { "a": 2, "b": 2 }), Some(Bson::Boolean(false)));
        let expr = bson!({ "$or": [false, "$c"] });
        assert_eq!(eval(&expr, &doc! { "c": 1 }), Some(Bson::Boolean(true)));
        assert_eq!(eval(&expr, &doc! { "c": 0 }), Some(Bson::Boolean(false)));
    }

    #[test]
    fn test_dotted_path_through_array() {
        let expr = bson!("$a.b");
        assert_eq!(
            eval(&expr, &doc! { "a": [{ "b": 1 }, { "c": 2 }, { "b": 3 }] }),
            Some(bson!([1, 3]))
        );
    }

    #[test]
    fn test_parametrize() {
        let expr = parse_agg_expr(&bson!({ "$gt": ["$x", 5] })).unwrap();
        let mut parameters = Parameters::new();
        let parametrized = expr.parametrize(&mut parameters);
        assert_eq!(parameters.len(), 1);
        assert!(matches!(parametrized.as_ref(), AggExpr::Compare { rhs, .. } if matches!(rhs.as_ref(), AggExpr::Placeholder(0))));
        assert_eq!(
            parametrized.evaluate(&doc! { "x": 6 }, &parameters).unwrap(),
            Some(Bson::Boolean(true))
        );
    }

    #[test]
    fn test_bind() {
        let expr = parse_agg_expr(&bson!({ "$gt": ["$x", 5] })).unwrap();
        let mut parameters = Parameters::new();
        let bound = expr.parametrize(&mut parameters).bind(&parameters).unwrap();
        assert_eq!(bound, expr);
        assert_eq!(bound.to_bson(), bson!({ "$gt": ["$x", 5] }));
    }
}
