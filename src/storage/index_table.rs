use crate::storage::catalog::{IndexMetadata, IndexRef, KeyKind};
use crate::storage::Direction;
use crate::util::bson_utils::cmp_bson;
use bson::Bson;
use crossbeam_skiplist::SkipMap;
use std::cmp::Ordering;
use std::ops::Bound;

pub type RecordId = u64;

/// Entry of an index table: the key values followed by the record id.
///
/// Entries sort by key, each field in the direction of the key pattern, then by
/// record id. `descending` flags the descending fields and is the same for all
/// the entries of a table.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub key: Vec<Bson>,
    pub record_id: RecordId,
    descending: u64,
}

impl IndexEntry {
    pub fn new(key: Vec<Bson>, record_id: RecordId, descending: u64) -> Self {
        IndexEntry { key, record_id, descending }
    }

    fn is_descending(&self, position: usize) -> bool {
        self.descending & (1 << position) != 0
    }
}

impl PartialEq for IndexEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexEntry {}

impl PartialOrd for IndexEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        for (position, (a, b)) in self.key.iter().zip(other.key.iter()).enumerate() {
            let ordering = cmp_bson(a, b);
            let ordering = if self.is_descending(position) { ordering.reverse() } else { ordering };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        self.key
            .len()
            .cmp(&other.key.len())
            .then(self.record_id.cmp(&other.record_id))
    }
}

/// Contiguous range of entries, both ends included.
#[derive(Debug, Clone)]
pub struct KeyRange {
    pub start: IndexEntry,
    pub end: IndexEntry,
}

/// Entries of one index, ordered by key. The value of an entry is the version of
/// the record at the time the entry was written.
pub struct IndexTable {
    pub index_ref: IndexRef,
    descending: u64,
    entries: SkipMap<IndexEntry, u64>,
}

impl IndexTable {
    pub fn new(index: &IndexMetadata) -> Self {
        let descending = index
            .fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.kind == KeyKind::Descending)
            .fold(0u64, |mask, (position, _)| mask | (1 << position));
        IndexTable {
            index_ref: index.index_ref(),
            descending,
            entries: SkipMap::new(),
        }
    }

    pub fn entry(&self, key: Vec<Bson>, record_id: RecordId) -> IndexEntry {
        IndexEntry::new(key, record_id, self.descending)
    }

    pub fn insert(&self, key: Vec<Bson>, record_id: RecordId, version: u64) {
        self.entries.insert(self.entry(key, record_id), version);
    }

    pub fn remove(&self, key: Vec<Bson>, record_id: RecordId) {
        self.entries.remove(&self.entry(key, record_id));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Record version stored with an entry, if the entry still exists.
    pub fn version_of(&self, key: &[Bson], record_id: RecordId) -> Option<u64> {
        self.entries.get(&self.entry(key.to_vec(), record_id)).map(|e| *e.value())
    }

    /// Returns `true` if another record than `record_id` has the key `key`.
    pub fn has_other_record(&self, key: &[Bson], record_id: Option<RecordId>) -> bool {
        let start = self.entry(key.to_vec(), 0);
        let end = self.entry(key.to_vec(), RecordId::MAX);
        self.entries
            .range(start..=end)
            .any(|e| Some(e.key().record_id) != record_id)
    }

    /// Returns the first duplicated key, if any.
    pub fn find_duplicate(&self) -> Option<Vec<Bson>> {
        let mut previous: Option<IndexEntry> = None;
        for entry in self.entries.iter() {
            let entry = entry.key().clone();
            if let Some(previous) = &previous {
                if previous.key.len() == entry.key.len()
                    && previous
                        .key
                        .iter()
                        .zip(entry.key.iter())
                        .all(|(a, b)| cmp_bson(a, b) == Ordering::Equal)
                {
                    return Some(entry.key);
                }
            }
            previous = Some(entry);
        }
        None
    }

    /// Smallest entry, in table order, whose key starts with `prefix`.
    pub fn lowest_with_prefix(&self, prefix: &[Bson], width: usize) -> IndexEntry {
        self.fill(prefix, width, true)
    }

    /// Largest entry, in table order, whose key starts with `prefix`.
    pub fn highest_with_prefix(&self, prefix: &[Bson], width: usize) -> IndexEntry {
        self.fill(prefix, width, false)
    }

    fn fill(&self, prefix: &[Bson], width: usize, lowest: bool) -> IndexEntry {
        let mut key = prefix.to_vec();
        for position in prefix.len()..width {
            let descending = self.descending & (1 << position) != 0;
            key.push(if lowest != descending { Bson::MinKey } else { Bson::MaxKey });
        }
        let record_id = if lowest { 0 } else { RecordId::MAX };
        self.entry(key, record_id)
    }

    /// Returns the entry following `after` in the scan direction, within `range`.
    /// Without `after`, returns the first entry of the range.
    pub fn next_in_range(
        &self,
        range: &KeyRange,
        after: Option<&IndexEntry>,
        direction: &Direction,
    ) -> Option<(IndexEntry, u64)> {
        if range.start > range.end {
            return None;
        }
        let entry = match direction {
            Direction::Forward => {
                let lower = match after {
                    Some(after) if after >= &range.start => Bound::Excluded(after.clone()),
                    _ => Bound::Included(range.start.clone()),
                };
                if matches!(&lower, Bound::Excluded(after) if after >= &range.end) {
                    return None;
                }
                self.entries.range((lower, Bound::Included(range.end.clone()))).next()
            }
            Direction::Reverse => {
                let upper = match after {
                    Some(after) if after <= &range.end => Bound::Excluded(after.clone()),
                    _ => Bound::Included(range.end.clone()),
                };
                if matches!(&upper, Bound::Excluded(after) if after <= &range.start) {
                    return None;
                }
                self.entries.range((Bound::Included(range.start.clone()), upper)).next_back()
            }
        };
        entry.map(|e| (e.key().clone(), *e.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::catalog::IndexOptions;
    use bson::{bson, doc};

    fn table(key_pattern: bson::Document) -> IndexTable {
        IndexTable::new(&IndexMetadata::new(&key_pattern, &IndexOptions::default()).unwrap())
    }

    fn scan(table: &IndexTable, range: &KeyRange, direction: Direction) -> Vec<RecordId> {
        let mut ids = Vec::new();
        let mut after = None;
        while let Some((entry, _)) = table.next_in_range(range, after.as_ref(), &direction) {
            ids.push(entry.record_id);
            after = Some(entry);
        }
        ids
    }

    #[test]
    fn test_descending_fields_sort_in_reverse() {
        let table = table(doc! { "a": 1, "b": -1 });
        table.insert(vec![bson!(1), bson!(1)], 1, 0);
        table.insert(vec![bson!(1), bson!(2)], 2, 0);
        table.insert(vec![bson!(0), bson!(5)], 3, 0);

        let range = KeyRange {
            start: table.lowest_with_prefix(&[], 2),
            end: table.highest_with_prefix(&[], 2),
        };
        assert_eq!(scan(&table, &range, Direction::Forward), vec![3, 2, 1]);
        assert_eq!(scan(&table, &range, Direction::Reverse), vec![1, 2, 3]);
    }

    #[test]
    fn test_prefix_range() {
        let table = table(doc! { "a": 1, "b": 1 });
        for (i, (a, b)) in [(1, 1), (1, 2), (2, 1), (2, 2)].iter().enumerate() {
            table.insert(vec![bson!(*a), bson!(*b)], i as RecordId, 0);
        }
        let range = KeyRange {
            start: table.lowest_with_prefix(&[bson!(2)], 2),
            end: table.highest_with_prefix(&[bson!(2)], 2),
        };
        assert_eq!(scan(&table, &range, Direction::Forward), vec![2, 3]);
    }

    #[test]
    fn test_duplicates() {
        let table = table(doc! { "a": 1 });
        table.insert(vec![bson!(1)], 1, 0);
        assert!(table.has_other_record(&[bson!(1)], None));
        assert!(!table.has_other_record(&[bson!(1)], Some(1)));
        assert!(table.find_duplicate().is_none());
        table.insert(vec![bson!(1.0)], 2, 0);
        assert_eq!(table.find_duplicate(), Some(vec![bson!(1.0)]));
        table.remove(vec![bson!(1)], 2);
        assert!(table.find_duplicate().is_none());
    }
}
