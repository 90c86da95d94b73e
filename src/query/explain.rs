use crate::error::{Error, Result};
use crate::query::canonical_query::{filter_to_document, CanonicalQuery};
use crate::query::execution::plan_executor::build_execution_plan;
use crate::query::execution::scans::{resolve_index, scan_bounds};
use crate::query::execution::stage::StageStats;
use crate::query::optimizer::bounds_format::format_interval;
use crate::query::optimizer::multiplanner::TrialResult;
use crate::query::physical_plan::{IndexScan, PhysicalPlan};
use crate::query::query_planner::{PlanSource, PreparedQuery};
use crate::query::{format_path, sort_to_document};
use crate::storage::catalog::CollectionMetadata;
use crate::storage::Direction;
use bson::{doc, Bson, Document};
use std::time::Instant;

/// Level of detail of an explain report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// Chosen plan only. The query is planned but not run.
    QueryPlanner,
    /// Also runs the chosen plan and reports its statistics.
    ExecutionStats,
    /// Also reports the trial statistics of every candidate plan.
    AllPlansExecution,
}

impl Verbosity {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "queryPlanner" => Ok(Verbosity::QueryPlanner),
            "executionStats" => Ok(Verbosity::ExecutionStats),
            "allPlansExecution" => Ok(Verbosity::AllPlansExecution),
            other => Err(Error::InvalidRequest(format!("Unknown explain verbosity '{}'", other))),
        }
    }
}

/// Builds the explain report of a planned query, running it if the
/// verbosity asks for execution statistics.
pub fn explain(
    mut prepared: PreparedQuery,
    query: &CanonicalQuery,
    collection: &CollectionMetadata,
    verbosity: Verbosity,
) -> Result<Document> {
    let rejected = prepared
        .rejected
        .iter()
        .map(|r| plan_to_document(&build_execution_plan(&r.access, query), query, collection).map(Bson::Document))
        .collect::<Result<Vec<_>>>()?;

    let winning_plan = plan_to_document(prepared.executor.plan(), query, collection)?;
    let query_planner = doc! {
        "namespace": query.namespace.clone(),
        "parsedQuery": query.parsed_query()?,
        "queryHash": prepared.shape.query_hash_hex(),
        "planCacheKey": prepared.shape.plan_cache_key_hex(),
        "fromPlanCache": prepared.source == PlanSource::Cached,
        "replanned": prepared.replanned,
        "winningPlan": winning_plan,
        "rejectedPlans": rejected,
    };
    let mut report = doc! { "queryPlanner": query_planner };
    if verbosity == Verbosity::QueryPlanner {
        return Ok(report);
    }

    let start = Instant::now();
    while prepared.executor.next_document()?.is_some() {}
    let elapsed = start.elapsed().as_millis() as i64;

    let mut execution_stats = execution_summary(prepared.executor.returned(), &prepared.executor.stats())?;
    execution_stats.insert("executionTimeMillis", elapsed);
    if verbosity == Verbosity::AllPlansExecution {
        let mut trials = Vec::with_capacity(prepared.rejected.len() + 1);
        if let Some(winner) = &prepared.winner_trial {
            trials.push(Bson::Document(trial_summary(winner)?));
        }
        for rejected in &prepared.rejected {
            trials.push(Bson::Document(trial_summary(rejected)?));
        }
        execution_stats.insert("allPlansExecution", trials);
    }
    report.insert("executionStats", execution_stats);
    Ok(report)
}

fn execution_summary(returned: u64, stats: &StageStats) -> Result<Document> {
    Ok(doc! {
        "nReturned": returned as i64,
        "totalKeysExamined": stats.total_keys_examined() as i64,
        "totalDocsExamined": stats.total_docs_examined() as i64,
        "executionStages": stats.to_document()?,
    })
}

fn trial_summary(trial: &TrialResult) -> Result<Document> {
    let mut doc = execution_summary(trial.results as u64, &trial.stats)?;
    if let Some(error) = &trial.error {
        doc.insert("error", error.clone());
    }
    Ok(doc)
}

/// Describes a plan tree, with the index bounds computed from the query
/// parameters.
pub fn plan_to_document(plan: &PhysicalPlan, query: &CanonicalQuery, collection: &CollectionMetadata) -> Result<Document> {
    let mut doc = doc! { "stage": plan.stage_name() };
    match plan {
        PhysicalPlan::Eof | PhysicalPlan::Or { .. } | PhysicalPlan::AndSorted { .. } => (),
        PhysicalPlan::CollectionScan { direction, filter } => {
            if let Some(filter) = filter {
                doc.insert("filter", filter_to_document(filter, &query.parameters)?);
            }
            doc.insert("direction", direction_name(*direction));
        }
        PhysicalPlan::IndexScan(scan) => describe_scan(&mut doc, scan, query, collection)?,
        PhysicalPlan::DistinctScan { scan, .. } => describe_scan(&mut doc, scan, query, collection)?,
        PhysicalPlan::Fetch { filter, .. } => {
            if let Some(filter) = filter {
                doc.insert("filter", filter_to_document(filter, &query.parameters)?);
            }
        }
        PhysicalPlan::SortMerge { sort, .. } => {
            doc.insert("sortPattern", sort_to_document(sort));
        }
        PhysicalPlan::Sort { sort, limit, .. } => {
            doc.insert("sortPattern", sort_to_document(sort));
            if let Some(limit) = limit {
                doc.insert("limitAmount", *limit as i64);
            }
        }
        PhysicalPlan::Skip { skip, .. } => {
            doc.insert("skipAmount", *skip as i64);
        }
        PhysicalPlan::Limit { limit, .. } => {
            doc.insert("limitAmount", *limit as i64);
        }
        PhysicalPlan::Projection { projection, .. } => {
            doc.insert("transformBy", projection.to_document());
        }
        PhysicalPlan::CoveredProjection { fields, .. } => {
            let mut transform = Document::new();
            for (path, _) in fields {
                transform.insert(format_path(path), 1);
            }
            doc.insert("transformBy", transform);
        }
        PhysicalPlan::Group { key, accumulator, .. } => {
            doc.insert("groupBy", format!("${}", format_path(key)));
            if let Some((name, accumulator)) = accumulator {
                doc.insert(name.clone(), accumulator.to_document());
            }
        }
    }

    match plan.inputs().as_slice() {
        [] => (),
        [input] => {
            doc.insert("inputStage", plan_to_document(input, query, collection)?);
        }
        inputs => {
            let inputs = inputs
                .iter()
                .map(|i| plan_to_document(i, query, collection).map(Bson::Document))
                .collect::<Result<Vec<_>>>()?;
            doc.insert("inputStages", inputs);
        }
    }
    Ok(doc)
}

fn describe_scan(doc: &mut Document, scan: &IndexScan, query: &CanonicalQuery, collection: &CollectionMetadata) -> Result<()> {
    let index = resolve_index(collection, scan)?;
    let bounds = scan_bounds(scan, &index, &query.parameters, &query.collation)?;

    doc.insert("keyPattern", scan.key_pattern.clone());
    doc.insert("indexName", scan.index.name.clone());
    doc.insert("isMultiKey", index.multikey.iter().any(|m| *m));
    doc.insert("multiKeyPaths", index.multikey_paths_document());
    doc.insert("isSparse", index.sparse);
    doc.insert("isPartial", index.partial_filter.is_some());
    doc.insert("direction", direction_name(scan.direction));

    let reverse_scan = scan.direction == Direction::Reverse;
    let mut index_bounds = Document::new();
    for (position, list) in bounds.fields.iter().enumerate() {
        let descending = match &scan.wildcard_path {
            Some(_) if position == 0 => false,
            Some(_) => index.fields.first().map_or(false, |f| f.is_descending()),
            None => index.fields.get(position).map_or(false, |f| f.is_descending()),
        };
        let intervals: Vec<Bson> = list
            .in_scan_order(descending != reverse_scan)
            .iter()
            .map(|i| Bson::String(format_interval(i)))
            .collect();
        index_bounds.insert(list.field.clone(), intervals);
    }
    doc.insert("indexBounds", index_bounds);
    Ok(())
}

fn direction_name(direction: Direction) -> &'static str {
    match direction {
        Direction::Forward => "forward",
        Direction::Reverse => "backward",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obs::logger::test_instance;
    use crate::obs::metrics::{MetricRegistry, PlannerMetrics};
    use crate::options::options::Options;
    use crate::query::canonical_query::{FindCommand, QueryKind};
    use crate::query::execution::plan_executor::OperationContext;
    use crate::query::execution::stage::test_support::engine_with;
    use crate::query::optimizer::plan_cache::PlanCache;
    use crate::query::optimizer::Optimizer;
    use crate::query::query_planner::QueryPlanner;
    use crate::storage::storage_engine::StorageEngine;
    use std::sync::Arc;

    fn engine() -> Arc<StorageEngine> {
        engine_with(
            vec![
                doc! { "x": 0 },
                doc! { "x": 1, "y": 1 },
                doc! { "x": 2, "y": 2 },
                doc! { "x": 3, "y": 10 },
                doc! { "y": 20 },
            ],
            vec![doc! { "x": 1, "y": 1 }],
        )
    }

    fn run_explain(engine: &Arc<StorageEngine>, command: FindCommand, verbosity: Verbosity) -> Document {
        let metrics = PlannerMetrics::new(&mut MetricRegistry::new());
        let planner = QueryPlanner::new(
            engine.clone(),
            Arc::new(Options::default()),
            Arc::new(PlanCache::new(10, metrics.clone())),
            metrics,
            test_instance(),
        );
        let query = CanonicalQuery::new("c", &command, QueryKind::Find, &Optimizer::new(test_instance())).unwrap();
        let collection = engine.get_collection("c").unwrap();
        let prepared = planner.prepare(&query, OperationContext::new(), false).unwrap();
        explain(prepared, &query, &collection, verbosity).unwrap()
    }

    fn find(filter: Document) -> FindCommand {
        FindCommand {
            filter,
            ..FindCommand::default()
        }
    }

    fn index_bounds(report: &Document) -> Document {
        let mut plan = report.get_document("queryPlanner").unwrap().get_document("winningPlan").unwrap();
        while plan.get_str("stage").unwrap() != "IXSCAN" {
            plan = plan.get_document("inputStage").unwrap();
        }
        plan.get_document("indexBounds").unwrap().clone()
    }

    #[test]
    fn test_expr_equality_bounds() {
        let report = run_explain(&engine(), find(doc! { "$expr": { "$eq": ["$x", 1] } }), Verbosity::ExecutionStats);
        assert_eq!(
            index_bounds(&report),
            doc! { "x": ["[1, 1]"], "y": ["[MinKey, MaxKey]"] }
        );
        assert_eq!(report.get_document("executionStats").unwrap().get_i64("nReturned").unwrap(), 1);
    }

    #[test]
    fn test_expr_range_bounds_follow_operand_order() {
        let engine = engine();
        let report = run_explain(&engine, find(doc! { "$expr": { "$gt": ["$x", 1] } }), Verbosity::ExecutionStats);
        assert_eq!(index_bounds(&report).get_array("x").unwrap(), &vec![Bson::from("(1, inf.0]")]);
        assert_eq!(report.get_document("executionStats").unwrap().get_i64("nReturned").unwrap(), 2);

        let report = run_explain(&engine, find(doc! { "$expr": { "$gt": [1, "$x"] } }), Verbosity::ExecutionStats);
        assert_eq!(index_bounds(&report).get_array("x").unwrap(), &vec![Bson::from("[-inf.0, 1)")]);
        assert_eq!(report.get_document("executionStats").unwrap().get_i64("nReturned").unwrap(), 1);
    }

    #[test]
    fn test_query_planner_verbosity_does_not_run() {
        let report = run_explain(&engine(), find(doc! { "x": { "$gte": 2 } }), Verbosity::QueryPlanner);
        let planner = report.get_document("queryPlanner").unwrap();
        assert_eq!(planner.get_str("namespace").unwrap(), "c");
        assert_eq!(planner.get_str("queryHash").unwrap().len(), 16);
        assert_eq!(planner.get_array("rejectedPlans").unwrap().len(), 1);
        assert!(report.get("executionStats").is_none());
    }

    #[test]
    fn test_all_plans_execution_reports_every_candidate() {
        let report = run_explain(&engine(), find(doc! { "x": { "$gte": 2 } }), Verbosity::AllPlansExecution);
        let stats = report.get_document("executionStats").unwrap();
        assert_eq!(stats.get_i64("nReturned").unwrap(), 2);
        assert_eq!(stats.get_i64("totalKeysExamined").unwrap(), 2);
        assert_eq!(stats.get_array("allPlansExecution").unwrap().len(), 2);
    }

    #[test]
    fn test_unknown_verbosity() {
        assert_eq!(Verbosity::parse("executionStats").unwrap(), Verbosity::ExecutionStats);
        assert!(Verbosity::parse("verbose").is_err());
    }
}
