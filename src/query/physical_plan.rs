use crate::error::{Error, Result};
use crate::query::agg_expr::{parse_agg_expr, AggExpr};
use crate::query::{format_path, Expr, PathComponent, Projection, SortField};
use crate::storage::catalog::IndexRef;
use crate::storage::Direction;
use bson::{Bson, Document};
use std::sync::Arc;

/// A physical plan that can be executed by the query engine.
///
/// A physical plan is a tree of stages describing *how* the documents
/// matching a query are found. Index scans only keep the predicates bounding
/// each key field: bounds are computed from the query parameters when the plan
/// is executed, so one plan serves every query of the same shape.
#[derive(Debug, Clone, PartialEq)]
pub enum PhysicalPlan {
    /// Returns nothing. Used for filters that cannot match.
    Eof,

    /// Scans every record of the collection in record id order.
    CollectionScan {
        direction: Direction,
        /// Filter applied to every record, if any.
        filter: Option<Arc<Expr>>,
    },

    /// Scans a range of index entries.
    IndexScan(IndexScan),

    /// Scans an index returning only the first entry of each distinct
    /// value of the key prefix ending at `distinct_position`.
    DistinctScan {
        scan: IndexScan,
        distinct_position: usize,
    },

    /// Loads the documents of the records found by its input and applies the
    /// filters the index bounds could not express.
    Fetch {
        input: Arc<PhysicalPlan>,
        filter: Option<Arc<Expr>>,
    },

    /// Union of its inputs. A record returned by several inputs is returned once.
    Or { inputs: Vec<Arc<PhysicalPlan>> },

    /// Union of inputs sorted on the same fields, preserving the sort order.
    SortMerge {
        sort: Arc<Vec<SortField>>,
        inputs: Vec<Arc<PhysicalPlan>>,
    },

    /// Intersection of inputs returning their records in record id order.
    AndSorted { inputs: Vec<Arc<PhysicalPlan>> },

    /// Blocking sort. With a limit, only the top `limit` documents are kept.
    Sort {
        input: Arc<PhysicalPlan>,
        sort: Arc<Vec<SortField>>,
        limit: Option<usize>,
    },

    Skip {
        input: Arc<PhysicalPlan>,
        skip: usize,
    },

    Limit {
        input: Arc<PhysicalPlan>,
        limit: usize,
    },

    /// Applies an inclusion or exclusion projection to fetched documents.
    Projection {
        input: Arc<PhysicalPlan>,
        projection: Arc<Projection>,
    },

    /// Builds documents from index keys alone, without fetching.
    CoveredProjection {
        input: Arc<PhysicalPlan>,
        /// Output paths and the key position holding their value.
        fields: Vec<(Vec<PathComponent>, usize)>,
    },

    /// Groups documents by the value of `key`, in first-seen order.
    Group {
        input: Arc<PhysicalPlan>,
        key: Vec<PathComponent>,
        accumulator: Option<(String, Accumulator)>,
    },
}

impl PhysicalPlan {
    /// Name of the stage as reported by explain.
    pub fn stage_name(&self) -> &'static str {
        match self {
            PhysicalPlan::Eof => "EOF",
            PhysicalPlan::CollectionScan { .. } => "COLLSCAN",
            PhysicalPlan::IndexScan(_) => "IXSCAN",
            PhysicalPlan::DistinctScan { .. } => "DISTINCT_SCAN",
            PhysicalPlan::Fetch { .. } => "FETCH",
            PhysicalPlan::Or { .. } => "OR",
            PhysicalPlan::SortMerge { .. } => "SORT_MERGE",
            PhysicalPlan::AndSorted { .. } => "AND_SORTED",
            PhysicalPlan::Sort { .. } => "SORT",
            PhysicalPlan::Skip { .. } => "SKIP",
            PhysicalPlan::Limit { .. } => "LIMIT",
            PhysicalPlan::Projection { .. } => "PROJECTION_SIMPLE",
            PhysicalPlan::CoveredProjection { .. } => "PROJECTION_COVERED",
            PhysicalPlan::Group { .. } => "GROUP",
        }
    }

    pub fn inputs(&self) -> Vec<&Arc<PhysicalPlan>> {
        match self {
            PhysicalPlan::Eof
            | PhysicalPlan::CollectionScan { .. }
            | PhysicalPlan::IndexScan(_)
            | PhysicalPlan::DistinctScan { .. } => vec![],
            PhysicalPlan::Or { inputs } | PhysicalPlan::SortMerge { inputs, .. } | PhysicalPlan::AndSorted { inputs } => {
                inputs.iter().collect()
            }
            PhysicalPlan::Fetch { input, .. }
            | PhysicalPlan::Sort { input, .. }
            | PhysicalPlan::Skip { input, .. }
            | PhysicalPlan::Limit { input, .. }
            | PhysicalPlan::Projection { input, .. }
            | PhysicalPlan::CoveredProjection { input, .. }
            | PhysicalPlan::Group { input, .. } => vec![input],
        }
    }

    /// Index scans of the plan, in plan order.
    pub fn index_scans(&self) -> Vec<&IndexScan> {
        match self {
            PhysicalPlan::IndexScan(scan) | PhysicalPlan::DistinctScan { scan, .. } => vec![scan],
            other => other.inputs().into_iter().flat_map(|i| i.index_scans()).collect(),
        }
    }

    /// Names of the indexes the plan reads, deduplicated.
    pub fn indexes_used(&self) -> Vec<IndexRef> {
        let mut indexes: Vec<IndexRef> = self.index_scans().into_iter().map(|s| s.index.clone()).collect();
        indexes.sort();
        indexes.dedup();
        indexes
    }
}

/// Index scan of a plan.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexScan {
    /// The scanned index, re-resolved by name and id each time the plan runs.
    pub index: IndexRef,
    pub key_pattern: Document,
    /// Predicates bounding each key field, in key pattern order.
    pub field_predicates: Vec<Vec<Arc<Expr>>>,
    /// Path scanned by a wildcard index.
    pub wildcard_path: Option<String>,
    pub direction: Direction,
}

/// An access plan together with what it provides to the rest of the query.
///
/// This is what the plan cache stores: the stages that depend on the values
/// of skip, limit and projection are added to it for every execution.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessPlan {
    pub root: Arc<PhysicalPlan>,
    /// `true` if documents come out in the order the query asks for.
    pub provides_sort: bool,
}

impl AccessPlan {
    pub fn new(root: PhysicalPlan, provides_sort: bool) -> Self {
        AccessPlan {
            root: Arc::new(root),
            provides_sort,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccumulatorOp {
    Count,
    First,
    Last,
    Sum,
    Min,
    Max,
}

impl AccumulatorOp {
    pub fn name(&self) -> &'static str {
        match self {
            AccumulatorOp::Count => "$count",
            AccumulatorOp::First => "$first",
            AccumulatorOp::Last => "$last",
            AccumulatorOp::Sum => "$sum",
            AccumulatorOp::Min => "$min",
            AccumulatorOp::Max => "$max",
        }
    }
}

/// Accumulator of a group stage, e.g. `{ "$sum": "$qty" }` or `{ "$count": {} }`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Accumulator {
    pub op: AccumulatorOp,
    /// Evaluated for every document of a group. `None` for `$count`.
    pub operand: Option<Arc<AggExpr>>,
}

impl Accumulator {
    pub fn parse(spec: &Document) -> Result<Accumulator> {
        let (name, operand) = match spec.iter().next() {
            Some(entry) if spec.len() == 1 => entry,
            _ => {
                return Err(Error::InvalidRequest(format!(
                    "An accumulator must have exactly one operator, got: {}",
                    spec
                )))
            }
        };
        let op = match name.as_str() {
            "$count" => AccumulatorOp::Count,
            "$first" => AccumulatorOp::First,
            "$last" => AccumulatorOp::Last,
            "$sum" => AccumulatorOp::Sum,
            "$min" => AccumulatorOp::Min,
            "$max" => AccumulatorOp::Max,
            other => return Err(Error::InvalidRequest(format!("Unknown accumulator '{}'", other))),
        };
        let operand = match op {
            AccumulatorOp::Count => match operand {
                Bson::Document(doc) if doc.is_empty() => None,
                other => {
                    return Err(Error::InvalidRequest(format!("$count takes an empty document, got {}", other)))
                }
            },
            _ => Some(parse_agg_expr(operand)?),
        };
        Ok(Accumulator { op, operand })
    }

    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        let operand = match &self.operand {
            Some(operand) => operand.to_bson(),
            None => Bson::Document(Document::new()),
        };
        doc.insert(self.op.name(), operand);
        doc
    }
}

/// Describes a plan without execution details, e.g. `FETCH(IXSCAN a_1)`.
pub fn summary(plan: &PhysicalPlan) -> String {
    match plan {
        PhysicalPlan::IndexScan(scan) | PhysicalPlan::DistinctScan { scan, .. } => {
            format!("{} {}", plan.stage_name(), scan.index.name)
        }
        PhysicalPlan::Group { key, .. } => {
            format!("GROUP {}({})", format_path(key), summaries(plan))
        }
        other if other.inputs().is_empty() => other.stage_name().to_string(),
        other => format!("{}({})", other.stage_name(), summaries(other)),
    }
}

fn summaries(plan: &PhysicalPlan) -> String {
    plan.inputs()
        .into_iter()
        .map(|i| summary(i))
        .collect::<Vec<_>>()
        .join(", ")
}
