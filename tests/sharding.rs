use bson::{doc, Document};
use quokkadb_planner::obs::logger::{LogLevel, StdoutLogger};
use quokkadb_planner::options::options::Options;
use quokkadb_planner::{IndexOptions, ShardedCollection, Verbosity};

fn setup_sharded() -> ShardedCollection {
    let sharded = ShardedCollection::new(
        "orders",
        "customer",
        3,
        Options::default(),
        StdoutLogger::new(LogLevel::Debug, true),
    )
    .unwrap();
    let docs: Vec<Document> = (0..90)
        .map(|i| {
            let status = if i % 2 == 0 { "open" } else { "closed" };
            doc! { "_id": i, "customer": format!("c{}", i % 9), "amount": i, "status": status }
        })
        .collect();
    sharded.insert_many(docs).unwrap();
    sharded.create_index(doc! { "amount": 1 }, IndexOptions::default()).unwrap();
    sharded
}

#[test]
fn test_documents_are_spread_by_shard_key() {
    let sharded = setup_sharded();
    let mut total = 0;
    for name in sharded.shard_names() {
        let shard = sharded.shard(&name).unwrap();
        for doc in shard.find(doc! {}).execute().unwrap() {
            let doc = doc.unwrap();
            assert_eq!(sharded.shard_for(&doc), name);
            total += 1;
        }
    }
    assert_eq!(total, 90);

    // A customer lives on a single shard
    let owner = sharded.shard_for(&doc! { "customer": "c4" }).to_string();
    let on_owner = sharded.shard(&owner).unwrap().find(doc! { "customer": "c4" }).execute().unwrap().count();
    assert_eq!(on_owner, 10);
}

#[test]
fn test_merged_results() {
    let sharded = setup_sharded();
    let docs = sharded
        .find(doc! { "amount": { "$gte": 80 } })
        .sort(doc! { "amount": -1 })
        .execute()
        .unwrap();
    let amounts: Vec<i32> = docs.iter().map(|d| d.get_i32("amount").unwrap()).collect();
    assert_eq!(amounts, (80..90).rev().collect::<Vec<_>>());

    let docs = sharded
        .find(doc! { "status": "open" })
        .sort(doc! { "amount": 1 })
        .projection(doc! { "amount": 1, "_id": 0 })
        .skip(2)
        .limit(3)
        .execute()
        .unwrap();
    assert_eq!(docs, vec![doc! { "amount": 4 }, doc! { "amount": 6 }, doc! { "amount": 8 }]);

    let docs = sharded
        .find(doc! {})
        .sort(doc! { "amount": 1 })
        .skip(usize::MAX)
        .limit(usize::MAX)
        .execute()
        .unwrap();
    assert!(docs.is_empty());
    let docs = sharded.find(doc! {}).skip(85).limit(usize::MAX).execute().unwrap();
    assert_eq!(docs.len(), 5);

    let unsorted = sharded.find(doc! { "customer": "c1" }).execute().unwrap();
    assert_eq!(unsorted.len(), 10);
}

#[test]
fn test_merged_explain() {
    let sharded = setup_sharded();
    let report = sharded
        .find(doc! { "amount": { "$lt": 30 } })
        .explain(Verbosity::ExecutionStats)
        .unwrap();

    let winning_plan = report.get_document("queryPlanner").unwrap().get_document("winningPlan").unwrap();
    assert_eq!(winning_plan.get_str("stage").unwrap(), "SHARD_MERGE");
    let shards = winning_plan.get_array("shards").unwrap();
    assert_eq!(shards.len(), 3);
    let mut names = Vec::new();
    for shard in shards {
        let shard = shard.as_document().unwrap();
        names.push(shard.get_str("shardName").unwrap().to_string());
        // Each shard reports a complete plan of its own
        let plan = shard.get_document("winningPlan").unwrap();
        assert_eq!(plan.get_str("stage").unwrap(), "FETCH");
        let scan = plan.get_document("inputStage").unwrap();
        assert_eq!(scan.get_str("indexName").unwrap(), "amount_1");
        assert_eq!(scan.get_document("indexBounds").unwrap(), &doc! { "amount": ["[-inf.0, 30)"] });
    }
    assert_eq!(names, sharded.shard_names());

    let stats = report.get_document("executionStats").unwrap();
    assert_eq!(stats.get_i64("nReturned").unwrap(), 30);
    assert_eq!(stats.get_i64("totalKeysExamined").unwrap(), 30);
    assert_eq!(stats.get_i64("totalDocsExamined").unwrap(), 30);
    let per_shard = stats.get_document("executionStages").unwrap().get_array("shards").unwrap();
    let returned: i64 = per_shard
        .iter()
        .map(|s| s.as_document().unwrap().get_i64("nReturned").unwrap())
        .sum();
    assert_eq!(returned, 30);

    let sorted = sharded
        .find(doc! {})
        .sort(doc! { "amount": 1 })
        .explain(Verbosity::QueryPlanner)
        .unwrap();
    let stage = sorted.get_document("queryPlanner").unwrap().get_document("winningPlan").unwrap().get_str("stage").unwrap();
    assert_eq!(stage, "SHARD_MERGE_SORT");
    assert!(sorted.get("executionStats").is_none());
}

#[test]
fn test_distinct_and_index_management() {
    let sharded = setup_sharded();
    let mut customers: Vec<String> = sharded
        .distinct("customer", doc! { "amount": { "$lt": 20 } })
        .unwrap()
        .into_iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    customers.sort();
    assert_eq!(customers, (0..9).map(|i| format!("c{}", i)).collect::<Vec<_>>());

    sharded.drop_index("amount_1").unwrap();
    for name in sharded.shard_names() {
        let indexes = sharded.shard(&name).unwrap().list_indexes().unwrap();
        assert!(indexes.iter().all(|i| i.get_str("name").unwrap() != "amount_1"));
    }
    assert!(sharded.drop_index("amount_1").is_err());
}
