use crate::error::{Error, Result};
use crate::query::execution::stage::{ExecutionContext, IndexKey, LazyFilter, Member, PlanStage, StageState, StageStats};
use crate::query::optimizer::bounds::{field_bounds, IndexBounds, KeyContext, OrderedIntervalList};
use crate::query::physical_plan::IndexScan;
use crate::query::{BsonValue, Expr, Parameters};
use crate::storage::catalog::{CollectionMetadata, IndexMetadata};
use crate::storage::index_table::{IndexEntry, IndexTable, KeyRange, RecordId};
use crate::storage::Direction;
use crate::util::collation::Collation;
use crate::util::interval::Interval;
use bson::Bson;
use std::collections::HashSet;
use std::ops::Bound;
use std::sync::Arc;

/// Maximum number of point prefixes expanded into separate key ranges.
const MAX_POINT_PREFIXES: usize = 4096;

pub struct CollectionScanStage {
    direction: Direction,
    filter: LazyFilter,
    last: Option<RecordId>,
    stats: StageStats,
}

impl CollectionScanStage {
    pub fn new(direction: Direction, filter: Option<Arc<Expr>>) -> Self {
        let mut stats = StageStats::new("COLLSCAN");
        stats.docs_examined = Some(0);
        CollectionScanStage {
            direction,
            filter: LazyFilter::new(filter),
            last: None,
            stats,
        }
    }

    fn do_work(&mut self, ctx: &ExecutionContext) -> Result<StageState> {
        if self.stats.is_eof {
            return Ok(StageState::IsEof);
        }
        let forward = self.direction == Direction::Forward;
        let (record_id, record) = match ctx.store.records.next_after(self.last, forward) {
            Some(next) => next,
            None => return Ok(StageState::IsEof),
        };
        self.last = Some(record_id);
        self.stats.docs_examined = self.stats.docs_examined.map(|d| d + 1);
        if !self.filter.matches(&record.doc, ctx)? {
            return Ok(StageState::NeedTime);
        }
        Ok(StageState::Advanced(Member {
            record_id: Some(record_id),
            index_key: None,
            doc: Some(record.doc.clone()),
        }))
    }
}

impl PlanStage for CollectionScanStage {
    fn work(&mut self, ctx: &ExecutionContext) -> Result<StageState> {
        let state = self.do_work(ctx)?;
        self.stats.record(&state);
        Ok(state)
    }

    fn save_state(&mut self) {}

    fn restore_state(&mut self, _ctx: &ExecutionContext) -> Result<()> {
        // The position is a record id, valid even if the record was removed
        Ok(())
    }

    fn stats(&self) -> StageStats {
        self.stats.clone()
    }
}

/// Position of an index scan, kept across yields.
struct ScanPosition {
    ranges: Vec<KeyRange>,
    /// Next range to scan, counted in scan order.
    current: usize,
    last: Option<IndexEntry>,
    bounds: IndexBounds,
}

/// Scans the entries of an index within the bounds computed from the query
/// parameters. With a distinct position, only the first entry of each
/// distinct key prefix is returned.
pub struct IndexScanStage {
    scan: IndexScan,
    distinct_position: Option<usize>,
    /// Released at every yield.
    table: Option<Arc<IndexTable>>,
    position: Option<ScanPosition>,
    dedup: bool,
    seen: HashSet<RecordId>,
    stats: StageStats,
}

impl IndexScanStage {
    pub fn new(scan: IndexScan, distinct_position: Option<usize>) -> Self {
        let mut stats = StageStats::new(if distinct_position.is_some() { "DISTINCT_SCAN" } else { "IXSCAN" });
        stats.index_name = Some(scan.index.name.clone());
        stats.keys_examined = Some(0);
        IndexScanStage {
            scan,
            distinct_position,
            table: None,
            position: None,
            dedup: false,
            seen: HashSet::new(),
            stats,
        }
    }

    fn resolve(&mut self, ctx: &ExecutionContext) -> Result<(Arc<IndexMetadata>, Arc<IndexTable>)> {
        let index = resolve_index(&ctx.collection, &self.scan)?;
        let table = ctx.store.index_table(&self.scan.index).ok_or_else(|| index_killed(&self.scan))?;
        let multikey = match &self.scan.wildcard_path {
            Some(path) => index.is_multikey_path(path),
            None => index.multikey.iter().any(|m| *m),
        };
        if multikey && !self.dedup {
            self.dedup = true;
            self.stats.dups_tested = Some(0);
            self.stats.dups_dropped = Some(0);
        }
        Ok((index, table))
    }

    fn do_work(&mut self, ctx: &ExecutionContext) -> Result<StageState> {
        if self.stats.is_eof {
            return Ok(StageState::IsEof);
        }
        if self.table.is_none() {
            let (index, table) = self.resolve(ctx)?;
            if self.position.is_none() {
                let bounds = scan_bounds(&self.scan, &index, &ctx.parameters, &ctx.collation)?;
                let ranges = if bounds.is_empty() {
                    vec![]
                } else {
                    key_ranges(&table, &bounds, &index)
                };
                self.position = Some(ScanPosition {
                    ranges,
                    current: 0,
                    last: None,
                    bounds,
                });
            }
            self.table = Some(table);
        }
        let table = match &self.table {
            Some(table) => table.clone(),
            None => return Err(index_killed(&self.scan)),
        };
        let position = match self.position.as_mut() {
            Some(position) => position,
            None => return Err(index_killed(&self.scan)),
        };

        if position.current >= position.ranges.len() {
            return Ok(StageState::IsEof);
        }
        let range_index = match self.scan.direction {
            Direction::Forward => position.current,
            Direction::Reverse => position.ranges.len() - 1 - position.current,
        };
        let range = &position.ranges[range_index];
        let (entry, version) = match table.next_in_range(range, position.last.as_ref(), &self.scan.direction) {
            Some(next) => next,
            None => {
                position.current += 1;
                position.last = None;
                return Ok(StageState::NeedTime);
            }
        };
        self.stats.keys_examined = self.stats.keys_examined.map(|k| k + 1);

        let within_bounds = position
            .bounds
            .fields
            .iter()
            .zip(entry.key.iter())
            .all(|(list, value)| list.is_all_values() || list.contains(value));
        position.last = Some(match self.distinct_position {
            // Skip every other entry of the same distinct prefix
            Some(distinct) if within_bounds => {
                let prefix = &entry.key[..=distinct];
                let width = entry.key.len();
                match self.scan.direction {
                    Direction::Forward => table.highest_with_prefix(prefix, width),
                    Direction::Reverse => table.lowest_with_prefix(prefix, width),
                }
            }
            _ => entry.clone(),
        });
        if !within_bounds {
            return Ok(StageState::NeedTime);
        }

        let first_time = self.seen.insert(entry.record_id);
        if self.dedup {
            self.stats.dups_tested = self.stats.dups_tested.map(|d| d + 1);
            if !first_time {
                self.stats.dups_dropped = self.stats.dups_dropped.map(|d| d + 1);
                return Ok(StageState::NeedTime);
            }
        }

        Ok(StageState::Advanced(Member {
            record_id: Some(entry.record_id),
            index_key: Some(IndexKey {
                index: self.scan.index.clone(),
                key: entry.key,
                version,
            }),
            doc: None,
        }))
    }
}

impl PlanStage for IndexScanStage {
    fn work(&mut self, ctx: &ExecutionContext) -> Result<StageState> {
        let state = self.do_work(ctx)?;
        self.stats.record(&state);
        Ok(state)
    }

    fn save_state(&mut self) {
        self.table = None;
    }

    fn restore_state(&mut self, ctx: &ExecutionContext) -> Result<()> {
        if self.position.is_none() || self.stats.is_eof {
            return Ok(());
        }
        let (_, table) = self.resolve(ctx)?;
        self.table = Some(table);
        Ok(())
    }

    fn stats(&self) -> StageStats {
        self.stats.clone()
    }
}

/// Looks an index up by name and id. An index dropped, or dropped and
/// recreated, since the plan was built kills the plan.
pub fn resolve_index(collection: &CollectionMetadata, scan: &IndexScan) -> Result<Arc<IndexMetadata>> {
    collection.resolve(&scan.index).ok_or_else(|| index_killed(scan))
}

fn index_killed(scan: &IndexScan) -> Error {
    Error::QueryPlanKilled(format!("Index {} was dropped during the query", scan.index.name))
}

/// Computes the bounds of every key field of a scan from the query parameters.
pub fn scan_bounds(
    scan: &IndexScan,
    index: &IndexMetadata,
    parameters: &Parameters,
    collation: &Collation,
) -> Result<IndexBounds> {
    let mut fields = Vec::with_capacity(index.fields.len());
    for (position, predicates) in scan.field_predicates.iter().enumerate() {
        let list = match (&scan.wildcard_path, position) {
            (Some(path), 0) => OrderedIntervalList::new(
                "$_path",
                vec![Interval::point(BsonValue(Bson::String(path.clone())))],
            ),
            (Some(path), _) => field_bounds(
                path,
                predicates,
                &KeyContext::for_field(index, position),
                parameters,
                collation,
            )?,
            (None, _) => field_bounds(
                &index.fields[position].name,
                predicates,
                &KeyContext::for_field(index, position),
                parameters,
                collation,
            )?,
        };
        fields.push(list);
    }
    Ok(IndexBounds { fields })
}

/// Converts bounds into disjoint key ranges sorted in table order.
///
/// Leading fields bounded by points are expanded into one prefix per
/// combination of points. The first other field contributes one range per
/// interval. Later fields are checked entry by entry.
pub fn key_ranges(table: &IndexTable, bounds: &IndexBounds, index: &IndexMetadata) -> Vec<KeyRange> {
    let width = bounds.fields.len();
    let mut prefixes: Vec<Vec<Bson>> = vec![vec![]];
    let mut position = 0;
    while position < width {
        let points = match bounds.fields[position].points() {
            Some(points) => points,
            None => break,
        };
        if prefixes.len() * points.len() > MAX_POINT_PREFIXES {
            break;
        }
        prefixes = prefixes
            .iter()
            .flat_map(|prefix| {
                points.iter().map(move |point| {
                    let mut key = prefix.clone();
                    key.push(point.0.clone());
                    key
                })
            })
            .collect();
        position += 1;
    }

    let mut ranges = Vec::new();
    for prefix in &prefixes {
        if position == width {
            ranges.push(KeyRange {
                start: table.lowest_with_prefix(prefix, width),
                end: table.highest_with_prefix(prefix, width),
            });
            continue;
        }
        let descending = index.fields.get(position).map_or(false, |f| f.is_descending());
        for interval in &bounds.fields[position].intervals {
            let (low, high) = if descending {
                (interval.end(), interval.start())
            } else {
                (interval.start(), interval.end())
            };
            ranges.push(KeyRange {
                start: bound_entry(table, prefix, low, width, true),
                end: bound_entry(table, prefix, high, width, false),
            });
        }
    }
    ranges.sort_by(|a, b| a.start.cmp(&b.start));
    ranges
}

fn bound_entry(table: &IndexTable, prefix: &[Bson], bound: &Bound<BsonValue>, width: usize, is_start: bool) -> IndexEntry {
    let (key, lowest) = match bound {
        Bound::Included(value) => ([prefix, &[value.0.clone()]].concat(), is_start),
        Bound::Excluded(value) => ([prefix, &[value.0.clone()]].concat(), !is_start),
        Bound::Unbounded => (prefix.to_vec(), is_start),
    };
    if lowest {
        table.lowest_with_prefix(&key, width)
    } else {
        table.highest_with_prefix(&key, width)
    }
}
