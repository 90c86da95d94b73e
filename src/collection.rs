use crate::error::{Error, Result};
use crate::query::canonical_query::{parse_key, FindCommand, QueryKind};
use crate::query::execution::filters::distinct_values;
use crate::query::execution::plan_executor::{OperationContext, PlanExecutor};
use crate::query::execution::stage::StageStats;
use crate::query::explain::Verbosity;
use crate::query::optimizer::plan_cache::PlanCache;
use crate::query::physical_plan::{summary, Accumulator};
use crate::query::query_planner::PlanSource;
use crate::query::BsonValue;
use crate::storage::catalog::IndexOptions;
use crate::storage::index_table::RecordId;
use crate::util::collation::Collation;
use crate::DbImpl;
use bson::{Bson, Document};
use std::collections::HashSet;
use std::sync::Arc;

/// Catalog change applied by [`Collection::coll_mod`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollMod {
    HideIndex(String),
    UnhideIndex(String),
    /// Makes an index unique, failing if it holds duplicate keys.
    ConvertToUnique(String),
}

impl CollMod {
    fn index_name(&self) -> &str {
        match self {
            CollMod::HideIndex(name) | CollMod::UnhideIndex(name) | CollMod::ConvertToUnique(name) => name,
        }
    }
}

pub struct Collection {
    db_impl: Arc<DbImpl>,
    name: String,
}

impl Collection {
    pub(crate) fn new(db_impl: Arc<DbImpl>, name: String) -> Collection {
        Collection { db_impl, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Inserts a document and returns its `_id`, generated if absent.
    pub fn insert_one(&self, doc: Document) -> Result<Bson> {
        let (_, id) = self.db_impl.storage_engine().insert(&self.name, doc)?;
        Ok(id)
    }

    pub fn insert_many(&self, docs: Vec<Document>) -> Result<Vec<Bson>> {
        docs.into_iter().map(|doc| self.insert_one(doc)).collect()
    }

    /// Replaces the first document matching `filter`. Returns the number of
    /// replaced documents.
    pub fn replace_one(&self, filter: Document, replacement: Document) -> Result<u64> {
        self.write_first_match(filter, |record_id| {
            self.db_impl
                .storage_engine()
                .replace(&self.name, record_id, replacement.clone())
                .map(|_| true)
        })
    }

    /// Deletes the first document matching `filter`. Returns the number of
    /// deleted documents.
    pub fn delete_one(&self, filter: Document) -> Result<u64> {
        self.write_first_match(filter, |record_id| self.db_impl.storage_engine().delete(&self.name, record_id))
    }

    /// Finds the first match and writes it, starting over when a concurrent
    /// write got in between.
    fn write_first_match<F>(&self, filter: Document, write: F) -> Result<u64>
    where
        F: Fn(RecordId) -> Result<bool>,
    {
        let max_retries = self.db_impl.options().execution_options().max_write_conflict_retries();
        let mut attempt = 0;
        loop {
            let found = self.find(filter.clone()).limit(1).execute()?.next().transpose()?;
            let id = match found.as_ref().and_then(|doc| doc.get("_id")) {
                Some(id) => id,
                None => return Ok(0),
            };
            let outcome = match self.db_impl.record_id_of(&self.name, id) {
                Some(record_id) => write(record_id),
                None => Err(Error::WriteConflict(format!("Document {} was deleted concurrently", id))),
            };
            match outcome {
                Ok(written) => return Ok(written as u64),
                Err(Error::WriteConflict(_)) if attempt < max_retries => attempt += 1,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn find(&self, filter: Document) -> Query {
        Query::new(self.db_impl.clone(), self.name.clone(), filter)
    }

    /// Distinct values of `key` among the documents matching `filter`.
    pub fn distinct(&self, key: &str, filter: Document) -> Distinct {
        Distinct {
            db_impl: self.db_impl.clone(),
            collection: self.name.clone(),
            key: key.to_string(),
            command: FindCommand {
                filter,
                ..FindCommand::default()
            },
        }
    }

    /// Groups the documents matching `filter` by the value of `key`.
    ///
    /// `accumulator` names an output field and its operator, e.g.
    /// `{ "total": { "$sum": "$qty" } }`. Groups are returned in the order
    /// their first document was found.
    pub fn group_by(&self, key: &str, filter: Document, accumulator: Option<Document>) -> Result<Vec<Document>> {
        let accumulator = match accumulator {
            Some(spec) => Some(parse_named_accumulator(&spec)?),
            None => None,
        };
        let kind = QueryKind::Group {
            key: parse_key(key)?,
            accumulator,
        };
        let command = FindCommand {
            filter,
            ..FindCommand::default()
        };
        let query = self.db_impl.canonicalize(&self.name, &command, kind)?;
        let prepared = self.db_impl.prepare(&query, OperationContext::new())?;
        QueryOutput::new(prepared.executor, prepared.source).collect()
    }

    /// Creates an index and returns its name. Creating an existing index
    /// again is a no-op.
    pub fn create_index(&self, keys: Document, options: IndexOptions) -> Result<String> {
        let (index, created) = self.db_impl.storage_engine().create_index(&self.name, &keys, &options)?;
        if created {
            self.plan_cache().clear();
        }
        Ok(index.name.clone())
    }

    pub fn drop_index(&self, name: &str) -> Result<()> {
        self.db_impl.storage_engine().drop_index(&self.name, name)?;
        self.plan_cache().remove_plans_using(name);
        Ok(())
    }

    pub fn coll_mod(&self, change: CollMod) -> Result<()> {
        let engine = self.db_impl.storage_engine();
        match &change {
            CollMod::HideIndex(name) => engine.set_index_hidden(&self.name, name, true)?,
            CollMod::UnhideIndex(name) => engine.set_index_hidden(&self.name, name, false)?,
            CollMod::ConvertToUnique(name) => engine.convert_to_unique(&self.name, name)?,
        };
        self.plan_cache().remove_plans_using(change.index_name());
        Ok(())
    }

    pub fn list_indexes(&self) -> Result<Vec<Document>> {
        let collection = self
            .db_impl
            .storage_engine()
            .get_collection(&self.name)
            .ok_or_else(|| Error::CollectionNotFound { name: self.name.clone() })?;
        Ok(collection.indexes.values().map(|index| index.describe()).collect())
    }

    pub fn plan_cache(&self) -> Arc<PlanCache> {
        self.db_impl.plan_cache(&self.name)
    }
}

fn parse_named_accumulator(spec: &Document) -> Result<(String, Accumulator)> {
    match spec.iter().next() {
        Some((name, Bson::Document(operator))) if spec.len() == 1 && !name.starts_with('$') => {
            Ok((name.clone(), Accumulator::parse(operator)?))
        }
        _ => Err(Error::InvalidRequest(format!(
            "A group accumulator must be of the form {{ name: {{ $op: expr }} }}, got: {}",
            spec
        ))),
    }
}

pub struct Query {
    db_impl: Arc<DbImpl>,
    collection: String,
    command: FindCommand,
    op_ctx: Option<Arc<OperationContext>>,
}

impl Query {
    fn new(db_impl: Arc<DbImpl>, collection: String, filter: Document) -> Query {
        Query {
            db_impl,
            collection,
            command: FindCommand {
                filter,
                ..FindCommand::default()
            },
            op_ctx: None,
        }
    }

    pub fn projection(&mut self, projection: Document) -> &mut Self {
        self.command.projection = Some(projection);
        self
    }

    pub fn sort(&mut self, sort: Document) -> &mut Self {
        self.command.sort = Some(sort);
        self
    }

    pub fn limit(&mut self, limit: usize) -> &mut Self {
        self.command.limit = Some(limit);
        self
    }

    pub fn skip(&mut self, value: usize) -> &mut Self {
        self.command.skip = Some(value);
        self
    }

    pub fn collation(&mut self, collation: Document) -> &mut Self {
        self.command.collation = Some(collation);
        self
    }

    /// Forces the use of an index, by name.
    pub fn hint(&mut self, index_name: &str) -> &mut Self {
        self.command.hint = Some(index_name.to_string());
        self
    }

    /// Lets blocking sorts spill to temporary files past their memory limit.
    pub fn allow_disk_use(&mut self, allow: bool) -> &mut Self {
        self.command.allow_disk_use = allow;
        self
    }

    /// Runs the query under a context that can interrupt it.
    pub fn with_operation_context(&mut self, op_ctx: Arc<OperationContext>) -> &mut Self {
        self.op_ctx = Some(op_ctx);
        self
    }

    pub fn execute(&self) -> Result<QueryOutput> {
        let query = self.db_impl.canonicalize(&self.collection, &self.command, QueryKind::Find)?;
        let op_ctx = self.op_ctx.clone().unwrap_or_else(OperationContext::new);
        let prepared = self.db_impl.prepare(&query, op_ctx)?;
        Ok(QueryOutput::new(prepared.executor, prepared.source))
    }

    pub fn explain(&self, verbosity: Verbosity) -> Result<Document> {
        let query = self.db_impl.canonicalize(&self.collection, &self.command, QueryKind::Find)?;
        self.db_impl.explain(&query, verbosity)
    }
}

/// Results of a query, pulled one document at a time.
pub struct QueryOutput {
    executor: PlanExecutor,
    source: PlanSource,
    failed: bool,
}

impl QueryOutput {
    fn new(executor: PlanExecutor, source: PlanSource) -> Self {
        QueryOutput {
            executor,
            source,
            failed: false,
        }
    }

    /// Describes the executed plan, e.g. `LIMIT(FETCH(IXSCAN a_1))`.
    pub fn plan_summary(&self) -> String {
        summary(self.executor.plan())
    }

    /// Returns `true` if the plan came from an active plan cache entry.
    pub fn from_plan_cache(&self) -> bool {
        self.source == PlanSource::Cached
    }

    pub fn stats(&self) -> StageStats {
        self.executor.stats()
    }
}

impl Iterator for QueryOutput {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.executor.next_document() {
            Ok(doc) => doc.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// A distinct query.
pub struct Distinct {
    db_impl: Arc<DbImpl>,
    collection: String,
    key: String,
    command: FindCommand,
}

impl Distinct {
    pub fn collation(&mut self, collation: Document) -> &mut Self {
        self.command.collation = Some(collation);
        self
    }

    pub fn hint(&mut self, index_name: &str) -> &mut Self {
        self.command.hint = Some(index_name.to_string());
        self
    }

    /// Returns the distinct values, arrays being unwound one level and a
    /// missing field counting as `null`.
    pub fn execute(&self) -> Result<Vec<Bson>> {
        let key = parse_key(&self.key)?;
        let query = self.db_impl.canonicalize(&self.collection, &self.command, QueryKind::Distinct { key: key.clone() })?;
        let prepared = self.db_impl.prepare(&query, OperationContext::new())?;
        let mut output = QueryOutput::new(prepared.executor, prepared.source);
        distinct_of(&mut output, &key, &query.collation)
    }

    pub fn explain(&self, verbosity: Verbosity) -> Result<Document> {
        let key = parse_key(&self.key)?;
        let query = self.db_impl.canonicalize(&self.collection, &self.command, QueryKind::Distinct { key })?;
        self.db_impl.explain(&query, verbosity)
    }
}

fn distinct_of(
    output: &mut QueryOutput,
    key: &[crate::query::PathComponent],
    collation: &Collation,
) -> Result<Vec<Bson>> {
    let mut seen = HashSet::new();
    let mut values = Vec::new();
    for doc in output {
        for value in distinct_values(&doc?, key) {
            if seen.insert(BsonValue(collation.collation_key(&value))) {
                values.push(value);
            }
        }
    }
    Ok(values)
}
