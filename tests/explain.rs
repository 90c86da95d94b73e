use bson::{doc, Bson, Document};
use quokkadb_planner::obs::logger::{LogLevel, StdoutLogger};
use quokkadb_planner::options::options::Options;
use quokkadb_planner::{Database, IndexOptions, Verbosity};

fn setup_db(docs: Vec<Document>, indexes: Vec<Document>) -> Database {
    let db = Database::open_with_logger(Options::default(), StdoutLogger::new(LogLevel::Debug, true));
    let collection = db.collection("test");
    collection.insert_many(docs).unwrap();
    for keys in indexes {
        collection.create_index(keys, IndexOptions::default()).unwrap();
    }
    db
}

fn compound_db() -> Database {
    setup_db(
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

fn explain(db: &Database, filter: Document) -> Document {
    db.collection("test").find(filter).explain(Verbosity::ExecutionStats).unwrap()
}

fn winning_plan(report: &Document) -> &Document {
    report.get_document("queryPlanner").unwrap().get_document("winningPlan").unwrap()
}

/// First stage with the given name, walking down single input stages.
fn find_stage<'a>(mut plan: &'a Document, stage: &str) -> Option<&'a Document> {
    loop {
        if plan.get_str("stage").unwrap() == stage {
            return Some(plan);
        }
        plan = plan.get_document("inputStage").ok()?;
    }
}

fn index_bounds(report: &Document) -> Document {
    find_stage(winning_plan(report), "IXSCAN")
        .unwrap()
        .get_document("indexBounds")
        .unwrap()
        .clone()
}

fn n_returned(report: &Document) -> i64 {
    report.get_document("executionStats").unwrap().get_i64("nReturned").unwrap()
}

fn strings(values: &[&str]) -> Vec<Bson> {
    values.iter().map(|v| Bson::String(v.to_string())).collect()
}

#[test]
fn test_expr_equality_uses_the_compound_index() {
    let db = compound_db();
    let report = explain(&db, doc! { "$expr": { "$eq": ["$x", 1] } });

    let scan = find_stage(winning_plan(&report), "IXSCAN").unwrap();
    assert_eq!(scan.get_document("keyPattern").unwrap(), &doc! { "x": 1, "y": 1 });
    assert_eq!(scan.get_str("indexName").unwrap(), "x_1_y_1");
    assert_eq!(index_bounds(&report), doc! { "x": ["[1, 1]"], "y": ["[MinKey, MaxKey]"] });
    assert_eq!(n_returned(&report), 1);
}

#[test]
fn test_expr_range_follows_operand_order() {
    let db = compound_db();

    let report = explain(&db, doc! { "$expr": { "$gt": ["$x", 1] } });
    assert_eq!(index_bounds(&report).get_array("x").unwrap(), &strings(&["(1, inf.0]"]));
    assert_eq!(n_returned(&report), 2);

    let report = explain(&db, doc! { "$expr": { "$gt": [1, "$x"] } });
    assert_eq!(index_bounds(&report).get_array("x").unwrap(), &strings(&["[-inf.0, 1)"]));
    assert_eq!(n_returned(&report), 1);
}

#[test]
fn test_field_to_field_comparison_is_a_residual_filter() {
    let db = compound_db();
    let filter = doc! { "$and": [ { "$expr": { "$gt": ["$y", "$x"] } }, { "x": { "$gte": 1 } } ] };
    let report = explain(&db, filter.clone());

    assert_eq!(
        index_bounds(&report),
        doc! { "x": ["[1, inf.0]"], "y": ["[MinKey, MaxKey]"] }
    );
    let fetch = find_stage(winning_plan(&report), "FETCH").unwrap();
    assert!(fetch.get_document("filter").is_ok());

    let scanned = db.collection("test").find(filter).hint("x_1_y_1").execute().unwrap().count();
    assert_eq!(n_returned(&report), 1);
    assert_eq!(scanned, 1);
}

#[test]
fn test_redundant_constant_conjunction_does_not_change_the_plan() {
    let db = setup_db(
        (1..=4).map(|a| doc! { "_id": a, "a": a }).collect(),
        vec![doc! { "a": 1 }],
    );
    let plain = explain(&db, doc! { "$expr": { "$and": [ { "$eq": ["$a", 3] } ] } });
    let wrapped = explain(&db, doc! { "$expr": { "$and": [ { "$and": [true] }, { "$eq": ["$a", 3] } ] } });

    assert_eq!(index_bounds(&plain), doc! { "a": ["[3, 3]"] });
    assert_eq!(winning_plan(&plain), winning_plan(&wrapped));
    assert_eq!(n_returned(&plain), 1);
    assert_eq!(n_returned(&wrapped), 1);
}

#[test]
fn test_distinct_scan_on_hashed_compound_prefix() {
    let db = setup_db(
        (0..12).map(|i| doc! { "_id": i, "a": i % 3, "b": i, "c": i % 2 }).collect(),
        vec![doc! { "a": 1, "b": "hashed" }],
    );
    let collection = db.collection("test");

    let report = collection.distinct("a", doc! {}).explain(Verbosity::ExecutionStats).unwrap();
    let plan = winning_plan(&report);
    assert_eq!(plan.get_str("stage").unwrap(), "PROJECTION_COVERED");
    let scan = plan.get_document("inputStage").unwrap();
    assert_eq!(scan.get_str("stage").unwrap(), "DISTINCT_SCAN");
    assert_eq!(scan.get_str("indexName").unwrap(), "a_1_b_hashed");
    assert_eq!(report.get_document("executionStats").unwrap().get_i64("totalDocsExamined").unwrap(), 0);

    let mut values: Vec<i32> = collection
        .distinct("a", doc! {})
        .execute()
        .unwrap()
        .iter()
        .map(|v| v.as_i32().unwrap())
        .collect();
    values.sort();
    assert_eq!(values, vec![0, 1, 2]);

    for key in ["b", "c"] {
        let report = collection.distinct(key, doc! {}).explain(Verbosity::QueryPlanner).unwrap();
        assert_eq!(winning_plan(&report).get_str("stage").unwrap(), "COLLSCAN", "distinct on {}", key);
    }
    assert_eq!(collection.distinct("c", doc! {}).execute().unwrap().len(), 2);
}

#[test]
fn test_or_plan_explain() {
    let db = setup_db(
        (0..50).map(|i| doc! { "_id": i, "a": i, "b": 100 - i }).collect(),
        vec![doc! { "a": 1 }, doc! { "b": 1 }],
    );
    let report = explain(&db, doc! { "$or": [ { "a": { "$lt": 3 } }, { "b": 60 } ] });
    let plan = winning_plan(&report);

    let or = find_stage(plan, "OR").unwrap();
    let inputs = or.get_array("inputStages").unwrap();
    assert_eq!(inputs.len(), 2);
    assert_eq!(n_returned(&report), 4);
}

#[test]
fn test_verbosities() {
    let db = compound_db();
    let collection = db.collection("test");

    let report = collection.find(doc! { "x": { "$gte": 2 } }).explain(Verbosity::QueryPlanner).unwrap();
    let planner = report.get_document("queryPlanner").unwrap();
    assert_eq!(planner.get_str("namespace").unwrap(), "test");
    assert!(planner.get_document("parsedQuery").is_ok());
    assert_eq!(planner.get_str("queryHash").unwrap().len(), 16);
    assert_eq!(planner.get_str("planCacheKey").unwrap().len(), 16);
    assert!(!planner.get_bool("fromPlanCache").unwrap());
    assert_eq!(planner.get_array("rejectedPlans").unwrap().len(), 1);
    assert!(report.get("executionStats").is_none());

    let report = collection.find(doc! { "x": { "$gte": 2 } }).explain(Verbosity::AllPlansExecution).unwrap();
    let stats = report.get_document("executionStats").unwrap();
    assert_eq!(stats.get_i64("nReturned").unwrap(), 2);
    assert_eq!(stats.get_i64("totalKeysExamined").unwrap(), 2);
    assert_eq!(stats.get_i64("totalDocsExamined").unwrap(), 2);
    assert!(stats.get_i64("executionTimeMillis").unwrap() >= 0);
    assert_eq!(stats.get_array("allPlansExecution").unwrap().len(), 2);

    let stages = stats.get_document("executionStages").unwrap();
    assert_eq!(stages.get_str("stage").unwrap(), "FETCH");
    assert_eq!(stages.get_i64("advanced").unwrap(), 2);
    assert!(stages.get_bool("isEOF").unwrap());
    let scan = stages.get_document("inputStage").unwrap();
    assert_eq!(scan.get_str("stage").unwrap(), "IXSCAN");
    assert_eq!(scan.get_i64("keysExamined").unwrap(), 2);
}

#[test]
fn test_sort_and_limit_stages() {
    let db = compound_db();
    let report = db
        .collection("test")
        .find(doc! {})
        .sort(doc! { "y": -1 })
        .skip(1)
        .limit(2)
        .explain(Verbosity::ExecutionStats)
        .unwrap();
    let plan = winning_plan(&report);
    assert_eq!(plan.get_str("stage").unwrap(), "LIMIT");
    assert_eq!(plan.get_i64("limitAmount").unwrap(), 2);
    let skip = plan.get_document("inputStage").unwrap();
    assert_eq!(skip.get_i64("skipAmount").unwrap(), 1);
    let sort = skip.get_document("inputStage").unwrap();
    assert_eq!(sort.get_str("stage").unwrap(), "SORT");
    assert_eq!(sort.get_document("sortPattern").unwrap(), &doc! { "y": -1 });
    assert_eq!(n_returned(&report), 2);
}
