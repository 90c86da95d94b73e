use bson::{doc, Document};
use criterion::{criterion_group, criterion_main, Criterion};
use quokkadb_planner::options::options::Options;
use quokkadb_planner::{Database, IndexOptions, Verbosity};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Generates `n` documents with a few low and high cardinality fields.
pub fn generate_documents(n: usize) -> Vec<Document> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..n as i64)
        .map(|id| {
            let status = ["A", "B", "C", "D"][rng.gen_range(0..4)];
            let qty: i32 = rng.gen_range(0..1_000);
            let price = rng.gen_range(0..10_000) as f64 / 100.0;
            let tags: Vec<String> = (0..rng.gen_range(0..4)).map(|_| format!("t{}", rng.gen_range(0..20))).collect();
            doc! { "_id": id, "status": status, "qty": qty, "price": price, "tags": tags }
        })
        .collect()
}

fn setup(n: usize) -> Database {
    let db = Database::open(Options::default());
    let collection = db.collection("bench");
    collection.insert_many(generate_documents(n)).unwrap();
    for keys in [doc! { "status": 1 }, doc! { "qty": 1 }, doc! { "status": 1, "qty": 1 }, doc! { "tags": 1 }] {
        collection.create_index(keys, IndexOptions::default()).unwrap();
    }
    db
}

fn bench_multiplanning(c: &mut Criterion) {
    let db = setup(10_000);
    let collection = db.collection("bench");
    c.bench_function("multiplanning", |b| {
        b.iter(|| {
            // Explain never records the winner, so every iteration multiplans
            collection
                .find(doc! { "status": "B", "qty": { "$gte": 500, "$lt": 520 } })
                .explain(Verbosity::QueryPlanner)
                .unwrap()
        });
    });
}

fn bench_cached_plan(c: &mut Criterion) {
    let db = setup(10_000);
    let collection = db.collection("bench");
    let mut rng = StdRng::seed_from_u64(7);
    c.bench_function("cached_plan", |b| {
        b.iter(|| {
            let qty: i32 = rng.gen_range(0..1_000);
            collection
                .find(doc! { "status": "C", "qty": { "$gte": qty, "$lt": qty + 10 } })
                .execute()
                .unwrap()
                .count()
        });
    });
}

fn bench_or_plan(c: &mut Criterion) {
    let db = setup(10_000);
    let collection = db.collection("bench");
    c.bench_function("or_plan", |b| {
        b.iter(|| {
            collection
                .find(doc! { "$or": [ { "tags": "t3" }, { "qty": { "$lt": 10 } } ] })
                .execute()
                .unwrap()
                .count()
        });
    });
}

criterion_group!(benches, bench_multiplanning, bench_cached_plan, bench_or_plan);
criterion_main!(benches);
