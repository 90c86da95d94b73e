use crate::error::{Error, Result};
use crate::query::execution::projections::{to_projector, Projector};
use crate::query::execution::sort::{compare_sort_keys, sort_key};
use crate::query::execution::stage::{ExecutionContext, LazyFilter, Member, PlanStage, StageState, StageStats};
use crate::query::physical_plan::{Accumulator, AccumulatorOp};
use crate::query::{collect_path_values, BsonValue, Expr, PathComponent, Projection, SortField};
use crate::storage::index_table::RecordId;
use crate::util::bson_utils::{cmp_bson, decimal_to_f64};
use bson::{Bson, Document};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub struct EofStage {
    stats: StageStats,
}

impl EofStage {
    pub fn new() -> Self {
        EofStage {
            stats: StageStats::new("EOF"),
        }
    }
}

impl PlanStage for EofStage {
    fn work(&mut self, _ctx: &ExecutionContext) -> Result<StageState> {
        let state = StageState::IsEof;
        self.stats.record(&state);
        Ok(state)
    }

    fn save_state(&mut self) {}

    fn restore_state(&mut self, _ctx: &ExecutionContext) -> Result<()> {
        Ok(())
    }

    fn stats(&self) -> StageStats {
        self.stats.clone()
    }
}

/// Loads the documents of the records returned by its input.
///
/// The record version stored in the index entry must match the version of
/// the record. When they differ the record is being rewritten: the member
/// is kept and `WriteConflict` returned, so that the same member is checked
/// again once the operation retries.
pub struct FetchStage {
    child: Box<dyn PlanStage>,
    filter: LazyFilter,
    pending: Option<Member>,
    stats: StageStats,
}

impl FetchStage {
    pub fn new(child: Box<dyn PlanStage>, filter: Option<Arc<Expr>>) -> Self {
        let mut stats = StageStats::new("FETCH");
        stats.docs_examined = Some(0);
        FetchStage {
            child,
            filter: LazyFilter::new(filter),
            pending: None,
            stats,
        }
    }

    fn fetch(&mut self, member: Member, ctx: &ExecutionContext) -> Result<Option<Member>> {
        if member.doc.is_some() {
            return Ok(Some(member));
        }
        let record_id = match member.record_id {
            Some(record_id) => record_id,
            None => return Err(Error::UnexpectedError("Cannot fetch a member without record id".to_string())),
        };
        let record = ctx.store.records.get(record_id);
        if let Some(key) = &member.index_key {
            if record.as_ref().map(|r| r.version) != Some(key.version) {
                let table = ctx.store.index_table(&key.index).ok_or_else(|| {
                    Error::QueryPlanKilled(format!("Index {} was dropped during the query", key.index.name))
                })?;
                match (table.version_of(&key.key, record_id), &record) {
                    // The entry is gone: the record no longer has this key
                    (None, _) => return Ok(None),
                    (Some(version), Some(record)) if version == record.version => (),
                    _ => {
                        let message = format!("Record {} changed while reading index {}", record_id, key.index.name);
                        self.pending = Some(member);
                        return Err(Error::WriteConflict(message));
                    }
                }
            }
        }
        let record = match record {
            Some(record) => record,
            None => return Ok(None),
        };
        self.stats.docs_examined = self.stats.docs_examined.map(|d| d + 1);
        Ok(Some(Member {
            record_id: Some(record_id),
            index_key: member.index_key,
            doc: Some(record.doc.clone()),
        }))
    }

    fn do_work(&mut self, ctx: &ExecutionContext) -> Result<StageState> {
        let member = match self.pending.take() {
            Some(member) => member,
            None => match self.child.work(ctx)? {
                StageState::Advanced(member) => member,
                other => return Ok(other),
            },
        };
        let fetched = match self.fetch(member, ctx)? {
            Some(fetched) => fetched,
            None => return Ok(StageState::NeedTime),
        };
        if !self.filter.matches(fetched.document()?, ctx)? {
            return Ok(StageState::NeedTime);
        }
        Ok(StageState::Advanced(fetched))
    }
}

impl PlanStage for FetchStage {
    fn work(&mut self, ctx: &ExecutionContext) -> Result<StageState> {
        let state = self.do_work(ctx)?;
        self.stats.record(&state);
        Ok(state)
    }

    fn save_state(&mut self) {
        self.child.save_state();
    }

    fn restore_state(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.child.restore_state(ctx)
    }

    fn stats(&self) -> StageStats {
        let mut stats = self.stats.clone();
        stats.children = vec![self.child.stats()];
        stats
    }
}

fn save_all(children: &mut [Box<dyn PlanStage>]) {
    for child in children.iter_mut() {
        child.save_state();
    }
}

fn restore_all(children: &mut [Box<dyn PlanStage>], ctx: &ExecutionContext) -> Result<()> {
    for child in children.iter_mut() {
        child.restore_state(ctx)?;
    }
    Ok(())
}

fn all_stats(children: &[Box<dyn PlanStage>]) -> Vec<StageStats> {
    children.iter().map(|c| c.stats()).collect()
}

/// Returns the records of its inputs one input after the other, each record once.
pub struct OrStage {
    children: Vec<Box<dyn PlanStage>>,
    current: usize,
    seen: HashSet<RecordId>,
    stats: StageStats,
}

impl OrStage {
    pub fn new(children: Vec<Box<dyn PlanStage>>) -> Self {
        let mut stats = StageStats::new("OR");
        stats.dups_tested = Some(0);
        stats.dups_dropped = Some(0);
        OrStage {
            children,
            current: 0,
            seen: HashSet::new(),
            stats,
        }
    }

    fn do_work(&mut self, ctx: &ExecutionContext) -> Result<StageState> {
        let child = match self.children.get_mut(self.current) {
            Some(child) => child,
            None => return Ok(StageState::IsEof),
        };
        match child.work(ctx)? {
            StageState::Advanced(member) => {
                if let Some(record_id) = member.record_id {
                    self.stats.dups_tested = self.stats.dups_tested.map(|d| d + 1);
                    if !self.seen.insert(record_id) {
                        self.stats.dups_dropped = self.stats.dups_dropped.map(|d| d + 1);
                        return Ok(StageState::NeedTime);
                    }
                }
                Ok(StageState::Advanced(member))
            }
            StageState::NeedTime => Ok(StageState::NeedTime),
            StageState::IsEof => {
                self.current += 1;
                Ok(StageState::NeedTime)
            }
        }
    }
}

impl PlanStage for OrStage {
    fn work(&mut self, ctx: &ExecutionContext) -> Result<StageState> {
        let state = self.do_work(ctx)?;
        self.stats.record(&state);
        Ok(state)
    }

    fn save_state(&mut self) {
        save_all(&mut self.children);
    }

    fn restore_state(&mut self, ctx: &ExecutionContext) -> Result<()> {
        restore_all(&mut self.children, ctx)
    }

    fn stats(&self) -> StageStats {
        let mut stats = self.stats.clone();
        stats.children = all_stats(&self.children);
        stats
    }
}

/// Merges inputs sorted on the same fields, keeping the order and returning
/// each record once.
pub struct SortMergeStage {
    children: Vec<Box<dyn PlanStage>>,
    sort: Arc<Vec<SortField>>,
    /// Next member of every input, with its sort key.
    heads: Vec<Option<(Vec<Bson>, Member)>>,
    exhausted: Vec<bool>,
    seen: HashSet<RecordId>,
    stats: StageStats,
}

impl SortMergeStage {
    pub fn new(sort: Arc<Vec<SortField>>, children: Vec<Box<dyn PlanStage>>) -> Self {
        let mut stats = StageStats::new("SORT_MERGE");
        stats.dups_tested = Some(0);
        stats.dups_dropped = Some(0);
        SortMergeStage {
            heads: children.iter().map(|_| None).collect(),
            exhausted: vec![false; children.len()],
            children,
            sort,
            seen: HashSet::new(),
            stats,
        }
    }

    fn do_work(&mut self, ctx: &ExecutionContext) -> Result<StageState> {
        // Every input must have a head before the smallest one can be picked
        for (i, child) in self.children.iter_mut().enumerate() {
            if self.heads[i].is_some() || self.exhausted[i] {
                continue;
            }
            match child.work(ctx)? {
                StageState::Advanced(member) => {
                    let key = sort_key(member.document()?, &self.sort, &ctx.collation);
                    self.heads[i] = Some((key, member));
                }
                StageState::NeedTime => (),
                StageState::IsEof => self.exhausted[i] = true,
            }
            return Ok(StageState::NeedTime);
        }

        let sort = &self.sort;
        let smallest = self
            .heads
            .iter()
            .enumerate()
            .filter_map(|(i, head)| head.as_ref().map(|(key, _)| (i, key)))
            .min_by(|(i, a), (j, b)| compare_sort_keys(a, b, sort).then(i.cmp(j)))
            .map(|(i, _)| i);
        let member = match smallest.and_then(|i| self.heads[i].take()) {
            Some((_, member)) => member,
            None => return Ok(StageState::IsEof),
        };
        if let Some(record_id) = member.record_id {
            self.stats.dups_tested = self.stats.dups_tested.map(|d| d + 1);
            if !self.seen.insert(record_id) {
                self.stats.dups_dropped = self.stats.dups_dropped.map(|d| d + 1);
                return Ok(StageState::NeedTime);
            }
        }
        Ok(StageState::Advanced(member))
    }
}

impl PlanStage for SortMergeStage {
    fn work(&mut self, ctx: &ExecutionContext) -> Result<StageState> {
        let state = self.do_work(ctx)?;
        self.stats.record(&state);
        Ok(state)
    }

    fn save_state(&mut self) {
        save_all(&mut self.children);
    }

    fn restore_state(&mut self, ctx: &ExecutionContext) -> Result<()> {
        restore_all(&mut self.children, ctx)
    }

    fn stats(&self) -> StageStats {
        let mut stats = self.stats.clone();
        stats.children = all_stats(&self.children);
        stats
    }
}

/// Intersection of inputs returning their records in record id order.
///
/// The input lagging behind is advanced until every input returned the same
/// record id.
pub struct AndSortedStage {
    children: Vec<Box<dyn PlanStage>>,
    heads: Vec<Option<Member>>,
    stats: StageStats,
}

impl AndSortedStage {
    pub fn new(children: Vec<Box<dyn PlanStage>>) -> Self {
        AndSortedStage {
            heads: children.iter().map(|_| None).collect(),
            children,
            stats: StageStats::new("AND_SORTED"),
        }
    }

    fn do_work(&mut self, ctx: &ExecutionContext) -> Result<StageState> {
        if self.stats.is_eof {
            return Ok(StageState::IsEof);
        }
        for (i, child) in self.children.iter_mut().enumerate() {
            if self.heads[i].is_some() {
                continue;
            }
            return Ok(match child.work(ctx)? {
                StageState::Advanced(member) => {
                    self.heads[i] = Some(member);
                    StageState::NeedTime
                }
                StageState::NeedTime => StageState::NeedTime,
                // One input exhausted, nothing else can be in every input
                StageState::IsEof => StageState::IsEof,
            });
        }

        let ids: Vec<Option<RecordId>> = self.heads.iter().map(|h| h.as_ref().and_then(|m| m.record_id)).collect();
        let target = ids.iter().max().copied().flatten();
        if ids.iter().all(|id| *id == target) {
            let mut heads = self.heads.iter_mut();
            let member = heads.next().and_then(|h| h.take());
            heads.for_each(|h| *h = None);
            return Ok(match member {
                Some(member) => StageState::Advanced(member),
                None => StageState::IsEof,
            });
        }
        for (head, id) in self.heads.iter_mut().zip(ids) {
            if id < target {
                *head = None;
            }
        }
        Ok(StageState::NeedTime)
    }
}

impl PlanStage for AndSortedStage {
    fn work(&mut self, ctx: &ExecutionContext) -> Result<StageState> {
        let state = self.do_work(ctx)?;
        self.stats.record(&state);
        Ok(state)
    }

    fn save_state(&mut self) {
        save_all(&mut self.children);
    }

    fn restore_state(&mut self, ctx: &ExecutionContext) -> Result<()> {
        restore_all(&mut self.children, ctx)
    }

    fn stats(&self) -> StageStats {
        let mut stats = self.stats.clone();
        stats.children = all_stats(&self.children);
        stats
    }
}

pub struct SkipStage {
    child: Box<dyn PlanStage>,
    remaining: usize,
    stats: StageStats,
}

impl SkipStage {
    pub fn new(child: Box<dyn PlanStage>, skip: usize) -> Self {
        SkipStage {
            child,
            remaining: skip,
            stats: StageStats::new("SKIP"),
        }
    }
}

impl PlanStage for SkipStage {
    fn work(&mut self, ctx: &ExecutionContext) -> Result<StageState> {
        let state = match self.child.work(ctx)? {
            StageState::Advanced(_) if self.remaining > 0 => {
                self.remaining -= 1;
                StageState::NeedTime
            }
            other => other,
        };
        self.stats.record(&state);
        Ok(state)
    }

    fn save_state(&mut self) {
        self.child.save_state();
    }

    fn restore_state(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.child.restore_state(ctx)
    }

    fn stats(&self) -> StageStats {
        let mut stats = self.stats.clone();
        stats.children = vec![self.child.stats()];
        stats
    }
}

pub struct LimitStage {
    child: Box<dyn PlanStage>,
    remaining: usize,
    stats: StageStats,
}

impl LimitStage {
    pub fn new(child: Box<dyn PlanStage>, limit: usize) -> Self {
        LimitStage {
            child,
            remaining: limit,
            stats: StageStats::new("LIMIT"),
        }
    }
}

impl PlanStage for LimitStage {
    fn work(&mut self, ctx: &ExecutionContext) -> Result<StageState> {
        let state = if self.remaining == 0 {
            StageState::IsEof
        } else {
            match self.child.work(ctx)? {
                StageState::Advanced(member) => {
                    self.remaining -= 1;
                    StageState::Advanced(member)
                }
                other => other,
            }
        };
        self.stats.record(&state);
        Ok(state)
    }

    fn save_state(&mut self) {
        self.child.save_state();
    }

    fn restore_state(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.child.restore_state(ctx)
    }

    fn stats(&self) -> StageStats {
        let mut stats = self.stats.clone();
        stats.children = vec![self.child.stats()];
        stats
    }
}

pub struct ProjectionStage {
    child: Box<dyn PlanStage>,
    projector: Projector,
    stats: StageStats,
}

impl ProjectionStage {
    pub fn new(child: Box<dyn PlanStage>, projection: &Arc<Projection>) -> Self {
        ProjectionStage {
            child,
            projector: to_projector(projection),
            stats: StageStats::new("PROJECTION_SIMPLE"),
        }
    }
}

impl PlanStage for ProjectionStage {
    fn work(&mut self, ctx: &ExecutionContext) -> Result<StageState> {
        let state = match self.child.work(ctx)? {
            StageState::Advanced(member) => {
                let doc = member.document()?.as_ref().clone();
                StageState::Advanced(Member {
                    record_id: member.record_id,
                    index_key: None,
                    doc: Some(Arc::new((self.projector)(doc))),
                })
            }
            other => other,
        };
        self.stats.record(&state);
        Ok(state)
    }

    fn save_state(&mut self) {
        self.child.save_state();
    }

    fn restore_state(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.child.restore_state(ctx)
    }

    fn stats(&self) -> StageStats {
        let mut stats = self.stats.clone();
        stats.children = vec![self.child.stats()];
        stats
    }
}

/// Builds documents out of index keys.
pub struct CoveredProjectionStage {
    child: Box<dyn PlanStage>,
    fields: Vec<(Vec<PathComponent>, usize)>,
    stats: StageStats,
}

impl CoveredProjectionStage {
    pub fn new(child: Box<dyn PlanStage>, fields: Vec<(Vec<PathComponent>, usize)>) -> Self {
        CoveredProjectionStage {
            child,
            fields,
            stats: StageStats::new("PROJECTION_COVERED"),
        }
    }

    fn project(&self, member: Member) -> Result<Member> {
        let key = match &member.index_key {
            Some(key) => key,
            None => return Err(Error::UnexpectedError("Covered projection of a member without index key".to_string())),
        };
        let mut doc = Document::new();
        for (path, position) in &self.fields {
            let value = key.key.get(*position).cloned().unwrap_or(Bson::Null);
            insert_path(&mut doc, path, value);
        }
        Ok(Member {
            record_id: member.record_id,
            index_key: member.index_key,
            doc: Some(Arc::new(doc)),
        })
    }
}

fn insert_path(doc: &mut Document, path: &[PathComponent], value: Bson) {
    let (first, rest) = match path.split_first() {
        Some(split) => split,
        None => return,
    };
    let name = first.to_string();
    if rest.is_empty() {
        doc.insert(name, value);
        return;
    }
    if !matches!(doc.get(&name), Some(Bson::Document(_))) {
        doc.insert(name.clone(), Document::new());
    }
    if let Some(Bson::Document(child)) = doc.get_mut(&name) {
        insert_path(child, rest, value);
    }
}

impl PlanStage for CoveredProjectionStage {
    fn work(&mut self, ctx: &ExecutionContext) -> Result<StageState> {
        let state = match self.child.work(ctx)? {
            StageState::Advanced(member) => StageState::Advanced(self.project(member)?),
            other => other,
        };
        self.stats.record(&state);
        Ok(state)
    }

    fn save_state(&mut self) {
        self.child.save_state();
    }

    fn restore_state(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.child.restore_state(ctx)
    }

    fn stats(&self) -> StageStats {
        let mut stats = self.stats.clone();
        stats.children = vec![self.child.stats()];
        stats
    }
}

/// Running value of an accumulator for one group.
enum AccumulatorState {
    Count(i64),
    First(Option<Bson>),
    Last(Bson),
    Sum { int: i64, double: f64, is_double: bool },
    Extreme(Option<Bson>),
}

impl AccumulatorState {
    fn new(op: AccumulatorOp) -> Self {
        match op {
            AccumulatorOp::Count => AccumulatorState::Count(0),
            AccumulatorOp::First => AccumulatorState::First(None),
            AccumulatorOp::Last => AccumulatorState::Last(Bson::Null),
            AccumulatorOp::Sum => AccumulatorState::Sum { int: 0, double: 0.0, is_double: false },
            AccumulatorOp::Min | AccumulatorOp::Max => AccumulatorState::Extreme(None),
        }
    }

    fn add(&mut self, op: AccumulatorOp, value: Option<Bson>) {
        match self {
            AccumulatorState::Count(count) => *count += 1,
            AccumulatorState::First(first) => {
                if first.is_none() {
                    *first = Some(value.unwrap_or(Bson::Null));
                }
            }
            AccumulatorState::Last(last) => *last = value.unwrap_or(Bson::Null),
            AccumulatorState::Sum { int, double, is_double } => match value {
                Some(Bson::Int32(v)) => add_int(int, double, is_double, v as i64),
                Some(Bson::Int64(v)) => add_int(int, double, is_double, v),
                Some(Bson::Double(v)) => {
                    *is_double = true;
                    *double += v;
                }
                Some(Bson::Decimal128(v)) => {
                    *is_double = true;
                    *double += decimal_to_f64(&v);
                }
                // Non numeric values are ignored
                _ => (),
            },
            AccumulatorState::Extreme(current) => {
                let value = match value {
                    Some(Bson::Null) | Some(Bson::Undefined) | None => return,
                    Some(value) => value,
                };
                let replace = match current {
                    None => true,
                    Some(current) => {
                        let ordering = cmp_bson(&value, current);
                        if op == AccumulatorOp::Min {
                            ordering == Ordering::Less
                        } else {
                            ordering == Ordering::Greater
                        }
                    }
                };
                if replace {
                    *current = Some(value);
                }
            }
        }
    }

    fn result(self) -> Bson {
        match self {
            AccumulatorState::Count(count) => int_result(count),
            AccumulatorState::First(first) => first.unwrap_or(Bson::Null),
            AccumulatorState::Last(last) => last,
            AccumulatorState::Sum { int, double, is_double } => {
                if is_double {
                    Bson::Double(double + int as f64)
                } else {
                    int_result(int)
                }
            }
            AccumulatorState::Extreme(value) => value.unwrap_or(Bson::Null),
        }
    }
}

fn add_int(int: &mut i64, double: &mut f64, is_double: &mut bool, value: i64) {
    match int.checked_add(value) {
        Some(sum) => *int = sum,
        // Overflow switches the sum to doubles
        None => {
            *is_double = true;
            *double += value as f64;
        }
    }
}

fn int_result(value: i64) -> Bson {
    match i32::try_from(value) {
        Ok(value) => Bson::Int32(value),
        Err(_) => Bson::Int64(value),
    }
}

/// Groups its input by the value of a field, returning one document per
/// group, `{ _id: <value>, <name>: <accumulated> }`, in first-seen order.
/// A missing field groups under `null`.
pub struct GroupStage {
    child: Box<dyn PlanStage>,
    key: Vec<PathComponent>,
    accumulator: Option<(String, Accumulator)>,
    groups: Vec<(Bson, Option<AccumulatorState>)>,
    positions: HashMap<BsonValue, usize>,
    output: Option<std::vec::IntoIter<Document>>,
    stats: StageStats,
}

impl GroupStage {
    pub fn new(child: Box<dyn PlanStage>, key: Vec<PathComponent>, accumulator: Option<(String, Accumulator)>) -> Self {
        GroupStage {
            child,
            key,
            accumulator,
            groups: Vec::new(),
            positions: HashMap::new(),
            output: None,
            stats: StageStats::new("GROUP"),
        }
    }

    fn add(&mut self, doc: &Document, ctx: &ExecutionContext) -> Result<()> {
        let values = collect_path_values(doc, &self.key);
        let key = if values.through_array {
            // A path through arrays groups by the array of the values it reaches
            Bson::Array(values.values.iter().filter_map(|v| v.cloned()).collect())
        } else {
            values.values.first().copied().flatten().cloned().unwrap_or(Bson::Null)
        };
        let position = match self.positions.get(&BsonValue(key.clone())) {
            Some(position) => *position,
            None => {
                let state = self.accumulator.as_ref().map(|(_, acc)| AccumulatorState::new(acc.op));
                self.groups.push((key.clone(), state));
                self.positions.insert(BsonValue(key), self.groups.len() - 1);
                self.groups.len() - 1
            }
        };
        if let (Some((_, accumulator)), Some(state)) = (&self.accumulator, self.groups[position].1.as_mut()) {
            let value = match &accumulator.operand {
                Some(operand) => operand.evaluate(doc, &ctx.parameters)?,
                None => None,
            };
            state.add(accumulator.op, value);
        }
        Ok(())
    }

    fn finish(&mut self) -> std::vec::IntoIter<Document> {
        let name = self.accumulator.as_ref().map(|(name, _)| name.clone());
        let groups = std::mem::take(&mut self.groups);
        let docs: Vec<Document> = groups
            .into_iter()
            .map(|(key, state)| {
                let mut doc = Document::new();
                doc.insert("_id", key);
                if let (Some(name), Some(state)) = (&name, state) {
                    doc.insert(name.clone(), state.result());
                }
                doc
            })
            .collect();
        docs.into_iter()
    }

    fn do_work(&mut self, ctx: &ExecutionContext) -> Result<StageState> {
        if let Some(output) = self.output.as_mut() {
            return Ok(match output.next() {
                Some(doc) => StageState::Advanced(Member::of_document(doc)),
                None => StageState::IsEof,
            });
        }
        match self.child.work(ctx)? {
            StageState::Advanced(member) => {
                let doc = member.document()?.clone();
                self.add(&doc, ctx)?;
            }
            StageState::NeedTime => (),
            StageState::IsEof => {
                self.output = Some(self.finish());
            }
        }
        Ok(StageState::NeedTime)
    }
}

impl PlanStage for GroupStage {
    fn work(&mut self, ctx: &ExecutionContext) -> Result<StageState> {
        let state = self.do_work(ctx)?;
        self.stats.record(&state);
        Ok(state)
    }

    fn save_state(&mut self) {
        self.child.save_state();
    }

    fn restore_state(&mut self, ctx: &ExecutionContext) -> Result<()> {
        if self.output.is_some() {
            return Ok(());
        }
        self.child.restore_state(ctx)
    }

    fn stats(&self) -> StageStats {
        let mut stats = self.stats.clone();
        stats.children = vec![self.child.stats()];
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::execution::scans::{CollectionScanStage, IndexScanStage};
    use crate::query::execution::stage::test_support::{context, drain, engine_with};
    use crate::query::expr_fn::*;
    use crate::query::physical_plan::IndexScan;
    use crate::query::Parameters;
    use crate::storage::catalog::IndexRef;
    use crate::storage::storage_engine::StorageEngine;
    use crate::storage::Direction;
    use bson::{bson, doc};

    fn collection_scan() -> Box<dyn PlanStage> {
        Box::new(CollectionScanStage::new(Direction::Forward, None))
    }

    fn index_scan(engine: &StorageEngine, name: &str, predicates: Vec<Vec<Arc<Expr>>>) -> Box<dyn PlanStage> {
        let index = engine.get_collection("c").unwrap().index(name).unwrap();
        Box::new(IndexScanStage::new(
            IndexScan {
                index: IndexRef { name: name.to_string(), id: index.id },
                key_pattern: index.key_pattern.clone(),
                field_predicates: predicates,
                wildcard_path: None,
                direction: Direction::Forward,
            },
            None,
        ))
    }

    fn values(members: &[Member], field: &str) -> Vec<Bson> {
        members
            .iter()
            .map(|m| m.doc.as_ref().unwrap().get(field).cloned().unwrap_or(Bson::Null))
            .collect()
    }

    fn path(name: &str) -> Vec<PathComponent> {
        name.split('.').map(PathComponent::from).collect()
    }

    #[test]
    fn test_fetch_applies_residual_filter() {
        let engine = engine_with(
            vec![doc! { "a": 1, "b": 1 }, doc! { "a": 1, "b": 2 }, doc! { "a": 2, "b": 2 }],
            vec![doc! { "a": 1 }],
        );
        let ctx = context(&engine, Parameters::new());
        let filter = field_filters(field(["b"]), vec![eq(lit(2))]);
        let mut stage = FetchStage::new(index_scan(&engine, "a_1", vec![vec![eq(lit(1))]]), Some(filter));
        let members = drain(&mut stage, &ctx).unwrap();
        assert_eq!(values(&members, "b"), vec![bson!(2)]);
        let stats = stage.stats();
        assert_eq!(stats.docs_examined, Some(2));
        assert_eq!(stats.total_keys_examined(), 2);
    }

    #[test]
    fn test_fetch_detects_concurrent_rewrite() {
        let engine = engine_with(vec![doc! { "_id": 1, "a": 1 }, doc! { "_id": 2, "a": 2 }], vec![doc! { "a": 1 }]);
        let ctx = context(&engine, Parameters::new());
        let mut stage = FetchStage::new(index_scan(&engine, "a_1", vec![vec![]]), None);

        // Rewrite the record between the index read and the fetch
        let mut scan = index_scan(&engine, "a_1", vec![vec![]]);
        let member = match scan.work(&ctx).unwrap() {
            StageState::Advanced(member) => member,
            other => panic!("unexpected {:?}", other),
        };
        engine.replace("c", 1, doc! { "a": 1, "b": true }).unwrap();
        let fetched = stage.fetch(member.clone(), &ctx).unwrap().unwrap();
        assert_eq!(fetched.doc.unwrap().get("b"), Some(&Bson::Boolean(true)));

        engine.replace("c", 1, doc! { "a": 5 }).unwrap();
        assert!(stage.fetch(member, &ctx).unwrap().is_none());
    }

    #[test]
    fn test_or_drops_duplicates() {
        let engine = engine_with(
            vec![doc! { "a": 1, "b": 1 }, doc! { "a": 2, "b": 1 }, doc! { "a": 3, "b": 3 }],
            vec![doc! { "a": 1 }, doc! { "b": 1 }],
        );
        let ctx = context(&engine, Parameters::new());
        let mut stage = OrStage::new(vec![
            index_scan(&engine, "a_1", vec![vec![lte(lit(2))]]),
            index_scan(&engine, "b_1", vec![vec![eq(lit(1))]]),
        ]);
        let members = drain(&mut stage, &ctx).unwrap();
        let ids: Vec<RecordId> = members.iter().filter_map(|m| m.record_id).collect();
        assert_eq!(ids, vec![1, 2]);
        let stats = stage.stats();
        assert_eq!(stats.dups_dropped, Some(2));
        assert_eq!(stats.children.len(), 2);
    }

    #[test]
    fn test_sort_merge_keeps_order() {
        let engine = engine_with(
            vec![doc! { "a": 1, "s": 4 }, doc! { "a": 2, "s": 1 }, doc! { "a": 1, "s": 2 }, doc! { "a": 2, "s": 3 }],
            vec![doc! { "a": 1, "s": 1 }],
        );
        let ctx = context(&engine, Parameters::new());
        let input = |value: i32| -> Box<dyn PlanStage> {
            Box::new(FetchStage::new(index_scan(&engine, "a_1_s_1", vec![vec![eq(lit(value))], vec![]]), None))
        };
        let sort = Arc::new(vec![SortField::asc(path("s"))]);
        let mut stage = SortMergeStage::new(sort, vec![input(1), input(2), input(1)]);
        let members = drain(&mut stage, &ctx).unwrap();
        assert_eq!(values(&members, "s"), vec![bson!(1), bson!(2), bson!(3), bson!(4)]);
        assert_eq!(stage.stats().dups_dropped, Some(2));
    }

    #[test]
    fn test_and_sorted_intersects_record_ids() {
        let engine = engine_with(
            vec![
                doc! { "a": 1, "b": 1 },
                doc! { "a": 1, "b": 2 },
                doc! { "a": 2, "b": 1 },
                doc! { "a": 1, "b": 1 },
            ],
            vec![doc! { "a": 1 }, doc! { "b": 1 }],
        );
        let ctx = context(&engine, Parameters::new());
        let mut stage = AndSortedStage::new(vec![
            index_scan(&engine, "a_1", vec![vec![eq(lit(1))]]),
            index_scan(&engine, "b_1", vec![vec![eq(lit(1))]]),
        ]);
        let members = drain(&mut stage, &ctx).unwrap();
        let ids: Vec<RecordId> = members.iter().filter_map(|m| m.record_id).collect();
        assert_eq!(ids, vec![1, 4]);
    }

    #[test]
    fn test_skip_limit_and_projection() {
        let engine = engine_with((0..5).map(|i| doc! { "_id": i, "a": i, "b": "x" }).collect(), vec![]);
        let ctx = context(&engine, Parameters::new());
        let projection = Arc::new(crate::query::parser::parse_projection(&doc! { "a": 1, "_id": 0 }).unwrap());
        let mut stage = ProjectionStage::new(
            Box::new(LimitStage::new(Box::new(SkipStage::new(collection_scan(), 1)), 2)),
            &projection,
        );
        let members = drain(&mut stage, &ctx).unwrap();
        let docs: Vec<Document> = members.iter().map(|m| m.doc.as_ref().unwrap().as_ref().clone()).collect();
        assert_eq!(docs, vec![doc! { "a": 1 }, doc! { "a": 2 }]);
        let stats = stage.stats();
        assert_eq!(stats.children[0].stage, "LIMIT");
        assert_eq!(stats.total_docs_examined(), 3);
    }

    #[test]
    fn test_covered_projection() {
        let engine = engine_with(vec![doc! { "a": { "x": 1 }, "b": 2 }], vec![doc! { "a.x": 1, "b": 1 }]);
        let ctx = context(&engine, Parameters::new());
        let mut stage = CoveredProjectionStage::new(
            index_scan(&engine, "a.x_1_b_1", vec![vec![], vec![]]),
            vec![(path("a.x"), 0), (path("b"), 1)],
        );
        let members = drain(&mut stage, &ctx).unwrap();
        assert_eq!(members[0].doc.as_ref().unwrap().as_ref(), &doc! { "a": { "x": 1 }, "b": 2 });
    }

    #[test]
    fn test_group_accumulators() {
        let docs = vec![
            doc! { "k": "x", "v": 1 },
            doc! { "k": "y", "v": 2.5 },
            doc! { "v": 7 },
            doc! { "k": "x", "v": 3 },
            doc! { "k": null, "v": "text" },
        ];
        let engine = engine_with(docs, vec![]);
        let ctx = context(&engine, Parameters::new());
        let run = |spec: Option<Document>| {
            let accumulator = spec.map(|s| ("out".to_string(), Accumulator::parse(&s).unwrap()));
            let mut stage = GroupStage::new(collection_scan(), path("k"), accumulator);
            drain(&mut stage, &ctx).unwrap()
        };

        let members = run(None);
        assert_eq!(values(&members, "_id"), vec![bson!("x"), bson!("y"), Bson::Null]);

        let members = run(Some(doc! { "$sum": "$v" }));
        assert_eq!(values(&members, "out"), vec![bson!(4), bson!(2.5), bson!(7)]);

        let members = run(Some(doc! { "$count": {} }));
        assert_eq!(values(&members, "out"), vec![bson!(2), bson!(1), bson!(2)]);

        let members = run(Some(doc! { "$max": "$v" }));
        assert_eq!(values(&members, "out"), vec![bson!(3), bson!(2.5), bson!("text")]);

        let members = run(Some(doc! { "$first": "$v" }));
        assert_eq!(values(&members, "out"), vec![bson!(1), bson!(2.5), bson!(7)]);
    }
}
