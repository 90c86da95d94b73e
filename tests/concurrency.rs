use bson::{doc, Document};
use quokkadb_planner::error::Error;
use quokkadb_planner::options::options::{ExecutionOptions, Options};
use quokkadb_planner::{CollMod, Database, IndexOptions, OperationContext};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

fn setup_db(yield_iterations: u64) -> Arc<Database> {
    let options = Options::default()
        .with_execution_options(ExecutionOptions::default().with_yield_iterations(yield_iterations));
    let db = Arc::new(Database::open(options));
    let collection = db.collection("test");
    let docs: Vec<Document> = (0..300).map(|i| doc! { "_id": i, "a": i % 30, "b": i }).collect();
    collection.insert_many(docs).unwrap();
    collection.create_index(doc! { "a": 1 }, IndexOptions::default()).unwrap();
    collection.create_index(doc! { "b": 1 }, IndexOptions::default()).unwrap();
    db
}

fn run_with(db: &Database, filter: Document, hint: Option<&str>, op_ctx: Arc<OperationContext>) -> Result<Vec<i32>, Error> {
    let collection = db.collection("test");
    let mut query = collection.find(filter);
    query.with_operation_context(op_ctx);
    if let Some(hint) = hint {
        query.hint(hint);
    }
    query
        .execute()?
        .map(|doc| doc.map(|d| d.get_i32("_id").unwrap()))
        .collect()
}

#[test]
fn test_hiding_the_scanned_index_during_yields() {
    let db = setup_db(4);
    let yields = Arc::new(AtomicUsize::new(0));

    let hook_db = db.clone();
    let hook_yields = yields.clone();
    let op_ctx = OperationContext::with_yield_hook(Arc::new(move || {
        let count = hook_yields.fetch_add(1, Ordering::SeqCst);
        let change = if count % 2 == 0 {
            CollMod::HideIndex("a_1".to_string())
        } else {
            CollMod::UnhideIndex("a_1".to_string())
        };
        hook_db.collection("test").coll_mod(change).unwrap();
    }));

    let ids = run_with(&db, doc! { "a": { "$gte": 10 } }, Some("a_1"), op_ctx).unwrap();
    let expected: BTreeSet<i32> = (0..300).filter(|i| i % 30 >= 10).collect();
    assert_eq!(ids.len(), expected.len());
    assert_eq!(ids.into_iter().collect::<BTreeSet<_>>(), expected);
    assert!(yields.load(Ordering::SeqCst) > 10);
}

#[test]
fn test_dropping_the_scanned_index_kills_the_plan() {
    let db = setup_db(4);
    let dropped = Arc::new(AtomicBool::new(false));

    let hook_db = db.clone();
    let hook_dropped = dropped.clone();
    let op_ctx = OperationContext::with_yield_hook(Arc::new(move || {
        if !hook_dropped.swap(true, Ordering::SeqCst) {
            hook_db.collection("test").drop_index("a_1").unwrap();
        }
    }));

    let error = run_with(&db, doc! { "a": { "$gte": 10 } }, Some("a_1"), op_ctx).err().unwrap();
    assert!(matches!(error, Error::QueryPlanKilled(_)), "{}", error);
    assert!(dropped.load(Ordering::SeqCst));

    // New queries plan against the remaining indexes
    let output = db.collection("test").find(doc! { "a": 10 }).execute().unwrap();
    assert_eq!(output.plan_summary(), "COLLSCAN");
    assert_eq!(output.count(), 10);
}

#[test]
fn test_dropping_the_collection_kills_the_plan() {
    let db = setup_db(8);
    let hook_db = db.clone();
    let dropped = Arc::new(AtomicBool::new(false));
    let hook_dropped = dropped.clone();
    let op_ctx = OperationContext::with_yield_hook(Arc::new(move || {
        if !hook_dropped.swap(true, Ordering::SeqCst) {
            hook_db.drop_collection("test").unwrap();
        }
    }));

    let error = run_with(&db, doc! { "c": { "$exists": false } }, None, op_ctx).err().unwrap();
    assert!(matches!(error, Error::QueryPlanKilled(_)), "{}", error);
}

#[test]
fn test_killed_operation_is_interrupted() {
    let db = setup_db(8);
    let op_ctx = OperationContext::new();
    op_ctx.kill();
    let error = run_with(&db, doc! { "c": { "$exists": false } }, None, op_ctx).err().unwrap();
    assert!(matches!(error, Error::Interrupted(_)), "{}", error);
}

#[test]
fn test_interrupted_trial_leaves_no_cache_entry() {
    let db = setup_db(8);
    let filter = doc! { "a": { "$gte": 0 }, "b": { "$gte": 0 } };
    let op_ctx = OperationContext::new();
    op_ctx.kill();
    let error = run_with(&db, filter.clone(), None, op_ctx).err().unwrap();
    assert!(matches!(error, Error::Interrupted(_)), "{}", error);
    assert!(db.collection("test").plan_cache().is_empty());

    let ids = run_with(&db, filter, None, OperationContext::new()).unwrap();
    assert_eq!(ids.len(), 300);
    assert_eq!(db.collection("test").plan_cache().len(), 1);
}

#[test]
fn test_kill_from_the_yield_hook() {
    let db = setup_db(8);
    let slot: Arc<std::sync::Mutex<Option<Arc<OperationContext>>>> = Arc::new(std::sync::Mutex::new(None));
    let hook_slot = slot.clone();
    let yields = Arc::new(AtomicUsize::new(0));
    let hook_yields = yields.clone();
    let op_ctx = OperationContext::with_yield_hook(Arc::new(move || {
        if hook_yields.fetch_add(1, Ordering::SeqCst) == 2 {
            if let Some(op_ctx) = hook_slot.lock().unwrap().as_ref() {
                op_ctx.kill();
            }
        }
    }));
    *slot.lock().unwrap() = Some(op_ctx.clone());

    let error = run_with(&db, doc! { "b": { "$gte": 0 } }, Some("b_1"), op_ctx).err().unwrap();
    assert!(matches!(error, Error::Interrupted(_)), "{}", error);
    assert!(yields.load(Ordering::SeqCst) >= 3);

    // Break the cycle between the context and its hook
    slot.lock().unwrap().take();
}

#[test]
fn test_concurrent_inserts_and_queries() {
    let db = setup_db(16);
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let db = db.clone();
            thread::spawn(move || {
                let collection = db.collection("test");
                for i in 0..100 {
                    let id = 1_000 + t * 100 + i;
                    collection.insert_one(doc! { "_id": id, "a": 100 + t, "b": id }).unwrap();
                    if i % 10 == 0 {
                        let found = collection
                            .find(doc! { "a": 100 + t, "b": { "$gte": 1_000 } })
                            .execute()
                            .unwrap()
                            .map(Result::unwrap)
                            .count();
                        assert!(found as i32 >= i + 1 && found <= 100);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let collection = db.collection("test");
    assert_eq!(collection.find(doc! {}).execute().unwrap().count(), 700);
    for t in 0..4 {
        let ids: BTreeSet<i32> = collection
            .find(doc! { "a": 100 + t })
            .execute()
            .unwrap()
            .map(|d| d.unwrap().get_i32("_id").unwrap())
            .collect();
        assert_eq!(ids, (1_000 + t * 100..1_100 + t * 100).collect());
    }
}

#[test]
fn test_concurrent_writers_on_the_same_documents() {
    let db = setup_db(16);
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let db = db.clone();
            thread::spawn(move || {
                let collection = db.collection("test");
                let mut deleted = 0;
                for a in 0..30 {
                    deleted += collection.delete_one(doc! { "a": a, "b": { "$lt": 30 } }).unwrap();
                }
                deleted
            })
        })
        .collect();
    let deleted: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();

    // Each of the 30 documents with b < 30 is deleted exactly once
    assert_eq!(deleted, 30);
    assert_eq!(db.collection("test").find(doc! { "b": { "$lt": 30 } }).execute().unwrap().count(), 0);
    assert_eq!(db.collection("test").find(doc! {}).execute().unwrap().count(), 270);
}
