//! Scatter/gather over collections partitioned by a hashed shard key.
//!
//! Every shard is an independent database: it has its own catalog, its own
//! plan cache and plans its part of a query on its own. The router merges
//! the results and the explain reports of the shards.

use crate::collection::{CollMod, Collection};
use crate::error::Result;
use crate::obs::logger::LoggerAndTracer;
use crate::options::options::Options;
use crate::query::execution::sort::{compare_sort_keys, sort_key};
use crate::query::parser::parse_sort;
use crate::query::{collect_path_values, parse_field_path, BsonValue, PathComponent};
use crate::storage::catalog::IndexOptions;
use crate::util::bson_utils::hash_key;
use crate::util::collation::Collation;
use crate::{info, Database, Verbosity};
use bson::{doc, Bson, Document};
use std::collections::HashSet;
use std::sync::Arc;

struct Shard {
    name: String,
    collection: Collection,
}

pub struct ShardedCollection {
    shards: Vec<Shard>,
    shard_key: Vec<PathComponent>,
    logger: Arc<dyn LoggerAndTracer>,
}

impl ShardedCollection {
    /// Creates a collection spread over `shard_count` shards named
    /// `shard0` to `shard{n-1}`.
    pub fn new(
        name: &str,
        shard_key: &str,
        shard_count: usize,
        options: Options,
        logger: Arc<dyn LoggerAndTracer>,
    ) -> Result<Self> {
        if shard_count == 0 {
            return Err(crate::error::Error::InvalidRequest(
                "A sharded collection needs at least one shard".to_string(),
            ));
        }
        let shard_key = parse_field_path(shard_key)?;
        let shards = (0..shard_count)
            .map(|i| {
                let database = Database::open_with_logger(options.clone(), logger.clone());
                Shard {
                    name: format!("shard{}", i),
                    collection: database.collection(name),
                }
            })
            .collect();
        info!(logger, "Sharded collection {} created with {} shards", name, shard_count);
        Ok(ShardedCollection { shards, shard_key, logger })
    }

    pub fn shard_names(&self) -> Vec<String> {
        self.shards.iter().map(|s| s.name.clone()).collect()
    }

    /// Collection of one shard.
    pub fn shard(&self, name: &str) -> Option<&Collection> {
        self.shards.iter().find(|s| s.name == name).map(|s| &s.collection)
    }

    /// Shard owning a document: the hash of its shard key value, a missing
    /// key counting as `null`, modulo the number of shards.
    pub fn shard_for(&self, doc: &Document) -> &str {
        &self.shards[self.route(doc)].name
    }

    fn route(&self, doc: &Document) -> usize {
        let values = collect_path_values(doc, &self.shard_key);
        let value = match values.values.as_slice() {
            [Some(value)] if !values.through_array => (*value).clone(),
            _ => Bson::Null,
        };
        (hash_key(&value) as u64 % self.shards.len() as u64) as usize
    }

    pub fn insert_one(&self, doc: Document) -> Result<Bson> {
        let shard = self.route(&doc);
        self.shards[shard].collection.insert_one(doc)
    }

    pub fn insert_many(&self, docs: Vec<Document>) -> Result<Vec<Bson>> {
        docs.into_iter().map(|doc| self.insert_one(doc)).collect()
    }

    pub fn create_index(&self, keys: Document, options: IndexOptions) -> Result<String> {
        let mut name = String::new();
        for shard in &self.shards {
            name = shard.collection.create_index(keys.clone(), options.clone())?;
        }
        Ok(name)
    }

    pub fn drop_index(&self, name: &str) -> Result<()> {
        for shard in &self.shards {
            shard.collection.drop_index(name)?;
        }
        Ok(())
    }

    pub fn coll_mod(&self, change: CollMod) -> Result<()> {
        for shard in &self.shards {
            shard.collection.coll_mod(change.clone())?;
        }
        Ok(())
    }

    pub fn find(&self, filter: Document) -> ShardedQuery<'_> {
        ShardedQuery {
            collection: self,
            filter,
            projection: None,
            sort: None,
            skip: None,
            limit: None,
            hint: None,
        }
    }

    /// Distinct values over every shard, in shard order.
    pub fn distinct(&self, key: &str, filter: Document) -> Result<Vec<Bson>> {
        let mut seen = HashSet::new();
        let mut values = Vec::new();
        for shard in &self.shards {
            for value in shard.collection.distinct(key, filter.clone()).execute()? {
                if seen.insert(BsonValue(value.clone())) {
                    values.push(value);
                }
            }
        }
        Ok(values)
    }
}

/// A query sent to every shard.
pub struct ShardedQuery<'a> {
    collection: &'a ShardedCollection,
    filter: Document,
    projection: Option<Document>,
    sort: Option<Document>,
    skip: Option<usize>,
    limit: Option<usize>,
    hint: Option<String>,
}

impl<'a> ShardedQuery<'a> {
    pub fn projection(&mut self, projection: Document) -> &mut Self {
        self.projection = Some(projection);
        self
    }

    pub fn sort(&mut self, sort: Document) -> &mut Self {
        self.sort = Some(sort);
        self
    }

    pub fn skip(&mut self, skip: usize) -> &mut Self {
        self.skip = Some(skip);
        self
    }

    pub fn limit(&mut self, limit: usize) -> &mut Self {
        self.limit = Some(limit);
        self
    }

    pub fn hint(&mut self, index_name: &str) -> &mut Self {
        self.hint = Some(index_name.to_string());
        self
    }

    /// The query each shard runs: the skip is applied by the router, so
    /// shards return up to `skip + limit` documents.
    fn shard_query(&self, collection: &Collection) -> crate::collection::Query {
        let mut query = collection.find(self.filter.clone());
        if let Some(projection) = &self.projection {
            query.projection(projection.clone());
        }
        if let Some(sort) = &self.sort {
            query.sort(sort.clone());
        }
        if let Some(limit) = self.limit {
            query.limit(limit.saturating_add(self.skip.unwrap_or(0)));
        }
        if let Some(hint) = &self.hint {
            query.hint(hint);
        }
        query
    }

    /// Runs the query on every shard and merges the results, in sort order
    /// if the query is sorted.
    pub fn execute(&self) -> Result<Vec<Document>> {
        let mut docs = Vec::new();
        for shard in &self.collection.shards {
            for doc in self.shard_query(&shard.collection).execute()? {
                docs.push(doc?);
            }
        }
        if let Some(sort) = &self.sort {
            let fields = parse_sort(sort)?;
            let collation = Collation::simple();
            let mut keyed: Vec<(Vec<Bson>, Document)> = docs
                .into_iter()
                .map(|doc| (sort_key(&doc, &fields, &collation), doc))
                .collect();
            keyed.sort_by(|(a, _), (b, _)| compare_sort_keys(a, b, &fields));
            docs = keyed.into_iter().map(|(_, doc)| doc).collect();
        }
        let skip = self.skip.unwrap_or(0);
        let limit = self.limit.unwrap_or(usize::MAX);
        Ok(docs.into_iter().skip(skip).take(limit).collect())
    }

    /// Merges the explain reports of the shards under a `SHARD_MERGE` stage,
    /// or `SHARD_MERGE_SORT` for a sorted query.
    pub fn explain(&self, verbosity: Verbosity) -> Result<Document> {
        let stage = if self.sort.is_some() { "SHARD_MERGE_SORT" } else { "SHARD_MERGE" };
        let mut planner_shards = Vec::new();
        let mut execution_shards = Vec::new();
        let mut totals = (0i64, 0i64, 0i64, 0i64);

        for shard in &self.collection.shards {
            let report = self.shard_query(&shard.collection).explain(verbosity)?;
            let mut planner = report.get_document("queryPlanner").cloned().unwrap_or_default();
            planner.insert("shardName", shard.name.clone());
            planner_shards.push(Bson::Document(planner));

            if let Ok(stats) = report.get_document("executionStats") {
                totals.0 += stats.get_i64("nReturned").unwrap_or(0);
                totals.1 = totals.1.max(stats.get_i64("executionTimeMillis").unwrap_or(0));
                totals.2 += stats.get_i64("totalKeysExamined").unwrap_or(0);
                totals.3 += stats.get_i64("totalDocsExamined").unwrap_or(0);
                let mut stats = stats.clone();
                stats.insert("shardName", shard.name.clone());
                execution_shards.push(Bson::Document(stats));
            }
        }

        let mut report = doc! {
            "queryPlanner": {
                "winningPlan": {
                    "stage": stage,
                    "shards": planner_shards,
                },
            },
        };
        if verbosity != Verbosity::QueryPlanner {
            report.insert(
                "executionStats",
                doc! {
                    "nReturned": totals.0,
                    "executionTimeMillis": totals.1,
                    "totalKeysExamined": totals.2,
                    "totalDocsExamined": totals.3,
                    "executionStages": {
                        "stage": stage,
                        "shards": execution_shards,
                    },
                },
            );
        }
        crate::debug!(self.collection.logger, "Merged explain of {} shards", self.collection.shards.len());
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obs::logger::test_instance;

    fn sharded() -> ShardedCollection {
        let sharded = ShardedCollection::new("c", "k", 3, Options::default(), test_instance()).unwrap();
        for i in 0..30 {
            sharded.insert_one(doc! { "k": i, "v": i % 5 }).unwrap();
        }
        sharded
    }

    #[test]
    fn test_routing_is_stable() {
        let sharded = sharded();
        let doc = doc! { "k": 7 };
        assert_eq!(sharded.shard_for(&doc), sharded.shard_for(&doc! { "k": 7.0 }));
        assert_eq!(sharded.shard_names(), vec!["shard0", "shard1", "shard2"]);
        let total: usize = sharded
            .shard_names()
            .iter()
            .map(|name| sharded.shard(name).unwrap().find(doc! {}).execute().unwrap().count())
            .sum();
        assert_eq!(total, 30);
    }

    #[test]
    fn test_sorted_merge_with_skip_and_limit() {
        let sharded = sharded();
        let docs = sharded.find(doc! { "v": 1 }).sort(doc! { "k": -1 }).skip(1).limit(3).execute().unwrap();
        let keys: Vec<i32> = docs.iter().map(|d| d.get_i32("k").unwrap()).collect();
        assert_eq!(keys, vec![21, 16, 11]);
    }

    #[test]
    fn test_distinct_over_shards() {
        let sharded = sharded();
        let mut values: Vec<i32> = sharded
            .distinct("v", doc! {})
            .unwrap()
            .into_iter()
            .map(|v| v.as_i32().unwrap())
            .collect();
        values.sort();
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
    }
}
