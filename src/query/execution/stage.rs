use crate::error::{Error, Result};
use crate::query::execution::filters::{to_filter, Filter};
use crate::query::execution::scans::{CollectionScanStage, IndexScanStage};
use crate::query::execution::sort::SortStage;
use crate::query::execution::stages::{
    AndSortedStage, CoveredProjectionStage, EofStage, FetchStage, GroupStage, LimitStage, OrStage,
    ProjectionStage, SkipStage, SortMergeStage,
};
use crate::query::physical_plan::PhysicalPlan;
use crate::query::{Expr, Parameters};
use crate::storage::catalog::{CollectionMetadata, IndexRef};
use crate::storage::index_table::RecordId;
use crate::storage::storage_engine::CollectionStore;
use crate::util::collation::Collation;
use bson::{Bson, Document};
use serde::Serialize;
use std::sync::Arc;

/// Index entry a member was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexKey {
    pub index: IndexRef,
    pub key: Vec<Bson>,
    /// Version of the record when the entry was written.
    pub version: u64,
}

/// Unit of data flowing between stages: a record id, the index entry that
/// produced it and, once fetched or computed, a document.
#[derive(Debug, Clone, Default)]
pub struct Member {
    pub record_id: Option<RecordId>,
    pub index_key: Option<IndexKey>,
    pub doc: Option<Arc<Document>>,
}

impl Member {
    pub fn of_document(doc: Document) -> Self {
        Member {
            doc: Some(Arc::new(doc)),
            ..Member::default()
        }
    }

    pub fn document(&self) -> Result<&Arc<Document>> {
        self.doc
            .as_ref()
            .ok_or_else(|| Error::UnexpectedError(format!("Member {:?} has no document", self.record_id)))
    }
}

/// Outcome of one unit of work.
#[derive(Debug)]
pub enum StageState {
    Advanced(Member),
    /// Work was done without producing a result.
    NeedTime,
    IsEof,
}

/// Execution statistics of a stage and its inputs.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageStats {
    pub stage: &'static str,
    pub works: u64,
    pub advanced: u64,
    pub need_time: u64,
    #[serde(rename = "isEOF")]
    pub is_eof: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys_examined: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docs_examined: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dups_tested: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dups_dropped: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_disk: Option<bool>,
    #[serde(skip)]
    pub children: Vec<StageStats>,
}

impl StageStats {
    pub fn new(stage: &'static str) -> Self {
        StageStats {
            stage,
            ..StageStats::default()
        }
    }

    pub fn record(&mut self, state: &StageState) {
        self.works += 1;
        match state {
            StageState::Advanced(_) => self.advanced += 1,
            StageState::NeedTime => self.need_time += 1,
            StageState::IsEof => self.is_eof = true,
        }
    }

    pub fn total_keys_examined(&self) -> u64 {
        self.keys_examined.unwrap_or(0) + self.children.iter().map(|c| c.total_keys_examined()).sum::<u64>()
    }

    pub fn total_docs_examined(&self) -> u64 {
        self.docs_examined.unwrap_or(0) + self.children.iter().map(|c| c.total_docs_examined()).sum::<u64>()
    }

    /// Renders the stats the way explain reports them: a single input under
    /// `inputStage`, several under `inputStages`.
    pub fn to_document(&self) -> Result<Document> {
        let mut doc = bson::to_document(self)?;
        match self.children.as_slice() {
            [] => (),
            [child] => {
                doc.insert("inputStage", child.to_document()?);
            }
            children => {
                let inputs = children
                    .iter()
                    .map(|c| c.to_document().map(Bson::Document))
                    .collect::<Result<Vec<_>>>()?;
                doc.insert("inputStages", inputs);
            }
        }
        Ok(doc)
    }
}

/// What stages need to run: a catalog snapshot, the data of the collection
/// and the query parameters.
///
/// The snapshot is replaced at every yield. Stages must not keep anything
/// derived from it across `save_state` / `restore_state`.
pub struct ExecutionContext {
    pub collection: Arc<CollectionMetadata>,
    pub store: Arc<CollectionStore>,
    pub parameters: Parameters,
    pub collation: Collation,
    pub sort_memory_limit: usize,
    pub allow_disk_use: bool,
}

/// A step of a running plan. Stages are pulled one unit of work at a time,
/// which lets the multiplanner interleave candidate plans.
pub trait PlanStage: Send {
    fn work(&mut self, ctx: &ExecutionContext) -> Result<StageState>;

    /// Releases everything derived from the catalog snapshot before a yield.
    fn save_state(&mut self);

    /// Re-acquires, from the new snapshot, what `save_state` released.
    fn restore_state(&mut self, ctx: &ExecutionContext) -> Result<()>;

    fn stats(&self) -> StageStats;
}

/// Builds the stages executing a plan.
pub fn build_stage(plan: &Arc<PhysicalPlan>) -> Box<dyn PlanStage> {
    match plan.as_ref() {
        PhysicalPlan::Eof => Box::new(EofStage::new()),
        PhysicalPlan::CollectionScan { direction, filter } => {
            Box::new(CollectionScanStage::new(*direction, filter.clone()))
        }
        PhysicalPlan::IndexScan(scan) => Box::new(IndexScanStage::new(scan.clone(), None)),
        PhysicalPlan::DistinctScan { scan, distinct_position } => {
            Box::new(IndexScanStage::new(scan.clone(), Some(*distinct_position)))
        }
        PhysicalPlan::Fetch { input, filter } => Box::new(FetchStage::new(build_stage(input), filter.clone())),
        PhysicalPlan::Or { inputs } => Box::new(OrStage::new(inputs.iter().map(build_stage).collect())),
        PhysicalPlan::SortMerge { sort, inputs } => {
            Box::new(SortMergeStage::new(sort.clone(), inputs.iter().map(build_stage).collect()))
        }
        PhysicalPlan::AndSorted { inputs } => {
            Box::new(AndSortedStage::new(inputs.iter().map(build_stage).collect()))
        }
        PhysicalPlan::Sort { input, sort, limit } => Box::new(SortStage::new(build_stage(input), sort.clone(), *limit)),
        PhysicalPlan::Skip { input, skip } => Box::new(SkipStage::new(build_stage(input), *skip)),
        PhysicalPlan::Limit { input, limit } => Box::new(LimitStage::new(build_stage(input), *limit)),
        PhysicalPlan::Projection { input, projection } => {
            Box::new(ProjectionStage::new(build_stage(input), projection))
        }
        PhysicalPlan::CoveredProjection { input, fields } => {
            Box::new(CoveredProjectionStage::new(build_stage(input), fields.clone()))
        }
        PhysicalPlan::Group { input, key, accumulator } => {
            Box::new(GroupStage::new(build_stage(input), key.clone(), accumulator.clone()))
        }
    }
}

/// Filter compiled on first use, against the parameters of the execution.
pub struct LazyFilter {
    expr: Option<Arc<Expr>>,
    compiled: Option<Filter>,
}

impl LazyFilter {
    pub fn new(expr: Option<Arc<Expr>>) -> Self {
        LazyFilter { expr, compiled: None }
    }

    pub fn matches(&mut self, doc: &Document, ctx: &ExecutionContext) -> Result<bool> {
        let expr = match &self.expr {
            Some(expr) => expr,
            None => return Ok(true),
        };
        if self.compiled.is_none() {
            self.compiled = Some(to_filter(expr, &ctx.parameters, &ctx.collation)?);
        }
        Ok(self.compiled.as_ref().map_or(true, |f| f(doc)))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::obs::logger::test_instance;
    use crate::storage::storage_engine::StorageEngine;

    /// Engine holding collection `c` with the given documents and indexes.
    pub fn engine_with(docs: Vec<Document>, indexes: Vec<Document>) -> Arc<StorageEngine> {
        let engine = StorageEngine::new(test_instance());
        engine.create_collection_if_not_exists("c").unwrap();
        for doc in docs {
            engine.insert("c", doc).unwrap();
        }
        for keys in indexes {
            engine
                .create_index("c", &keys, &crate::storage::catalog::IndexOptions::default())
                .unwrap();
        }
        engine
    }

    pub fn context(engine: &StorageEngine, parameters: Parameters) -> ExecutionContext {
        let collection = engine.get_collection("c").unwrap();
        ExecutionContext {
            store: engine.collection_store(collection.id).unwrap(),
            collection,
            parameters,
            collation: Collation::simple(),
            sort_memory_limit: 1024 * 1024,
            allow_disk_use: false,
        }
    }

    /// Runs a stage to completion and returns the documents it produced.
    pub fn drain(stage: &mut dyn PlanStage, ctx: &ExecutionContext) -> Result<Vec<Member>> {
        let mut members = Vec::new();
        loop {
            match stage.work(ctx)? {
                StageState::Advanced(member) => members.push(member),
                StageState::NeedTime => (),
                StageState::IsEof => return Ok(members),
            }
        }
    }
}
