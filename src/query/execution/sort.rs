use crate::error::{Error, Result};
use crate::query::execution::stage::{ExecutionContext, Member, PlanStage, StageState, StageStats};
use crate::query::{collect_path_values, SortField, SortOrder};
use crate::util::bson_utils::cmp_bson;
use crate::util::collation::Collation;
use bson::{doc, Bson, Document};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io::{BufReader, BufWriter, ErrorKind, Seek, SeekFrom};
use std::sync::Arc;
use tempfile::{tempdir, NamedTempFile, TempDir};

/// Computes the value a document sorts by for each sort field.
///
/// A missing field sorts as `null`. Arrays sort by their smallest element in
/// an ascending sort and by their largest one in a descending sort, an empty
/// array sorting before `null`. Strings are replaced by their collation key.
pub fn sort_key(doc: &Document, sort: &[SortField], collation: &Collation) -> Vec<Bson> {
    sort.iter()
        .map(|field| {
            let values = collect_path_values(doc, &field.path).values;
            let mut candidates: Vec<&Bson> = Vec::new();
            for value in values {
                match value {
                    None => candidates.push(&Bson::Null),
                    Some(Bson::Array(elements)) if elements.is_empty() => candidates.push(&Bson::Undefined),
                    Some(Bson::Array(elements)) => candidates.extend(elements.iter()),
                    Some(value) => candidates.push(value),
                }
            }
            let chosen = match field.order {
                SortOrder::Ascending => candidates.into_iter().min_by(|a, b| cmp_bson(a, b)),
                SortOrder::Descending => candidates.into_iter().max_by(|a, b| cmp_bson(a, b)),
            };
            collation.collation_key(chosen.unwrap_or(&Bson::Null))
        })
        .collect()
}

/// Compares two sort keys computed by `sort_key` for the same fields.
pub fn compare_sort_keys(a: &[Bson], b: &[Bson], sort: &[SortField]) -> Ordering {
    for ((a, b), field) in a.iter().zip(b.iter()).zip(sort.iter()) {
        let ordering = cmp_bson(a, b);
        let ordering = match field.order {
            SortOrder::Ascending => ordering,
            SortOrder::Descending => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

struct SortItem {
    key: Vec<Bson>,
    /// Arrival order, keeping the sort stable.
    seq: u64,
    member: Member,
    size: usize,
    sort: Arc<Vec<SortField>>,
}

impl PartialEq for SortItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortItem {}

impl PartialOrd for SortItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortItem {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_sort_keys(&self.key, &other.key, &self.sort).then(self.seq.cmp(&other.seq))
    }
}

enum Output {
    Memory(std::vec::IntoIter<Member>),
    Merge(MergeRuns),
}

/// Blocking sort.
///
/// Documents are buffered until the input is exhausted. With a limit only the
/// top `limit` documents are kept, in a heap. Without one, a buffer growing
/// past the memory limit fails the query, unless disk use is allowed: the
/// buffer is then written as a sorted run to a temporary file, and the runs
/// are merged once the input is exhausted.
pub struct SortStage {
    child: Box<dyn PlanStage>,
    sort: Arc<Vec<SortField>>,
    limit: Option<usize>,
    buffer: Vec<SortItem>,
    heap: BinaryHeap<SortItem>,
    memory: usize,
    seq: u64,
    runs: Vec<NamedTempFile>,
    temp_dir: Option<TempDir>,
    output: Option<Output>,
    stats: StageStats,
}

impl SortStage {
    pub fn new(child: Box<dyn PlanStage>, sort: Arc<Vec<SortField>>, limit: Option<usize>) -> Self {
        SortStage {
            child,
            sort,
            limit,
            buffer: Vec::new(),
            heap: BinaryHeap::new(),
            memory: 0,
            seq: 0,
            runs: Vec::new(),
            temp_dir: None,
            output: None,
            stats: StageStats::new("SORT"),
        }
    }

    fn add(&mut self, member: Member, ctx: &ExecutionContext) -> Result<()> {
        let doc = member.document()?;
        let size = bson::to_vec(doc.as_ref())?.len();
        let item = SortItem {
            key: sort_key(doc, &self.sort, &ctx.collation),
            seq: self.seq,
            member,
            size,
            sort: self.sort.clone(),
        };
        self.seq += 1;
        self.memory += size;

        if let Some(limit) = self.limit {
            if limit == 0 {
                self.memory -= size;
                return Ok(());
            }
            self.heap.push(item);
            if self.heap.len() > limit {
                if let Some(largest) = self.heap.pop() {
                    self.memory -= largest.size;
                }
            }
            // A top-k sort holds at most `limit` documents, spilling would not help
            if self.memory > ctx.sort_memory_limit && !ctx.allow_disk_use {
                return Err(memory_exceeded(ctx.sort_memory_limit));
            }
            return Ok(());
        }

        self.buffer.push(item);
        if self.memory > ctx.sort_memory_limit {
            if !ctx.allow_disk_use {
                return Err(memory_exceeded(ctx.sort_memory_limit));
            }
            self.spill()?;
        }
        Ok(())
    }

    fn spill(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        if self.temp_dir.is_none() {
            self.temp_dir = Some(tempdir()?);
        }
        let dir = match &self.temp_dir {
            Some(dir) => dir,
            None => return Err(Error::UnexpectedError("Missing sort spill directory".to_string())),
        };
        let mut items = std::mem::take(&mut self.buffer);
        items.sort();

        let run_file = tempfile::Builder::new().tempfile_in(dir)?;
        let mut writer = BufWriter::new(run_file);
        for item in items {
            spilled_document(item)?.to_writer(&mut writer)?;
        }
        let mut file = writer.into_inner().map_err(|e| e.into_error())?;
        file.seek(SeekFrom::Start(0))?;
        self.runs.push(file);
        self.memory = 0;
        self.stats.used_disk = Some(true);
        Ok(())
    }

    fn finish(&mut self) -> Result<Output> {
        if self.limit.is_some() {
            let heap = std::mem::take(&mut self.heap);
            let members: Vec<Member> = heap.into_sorted_vec().into_iter().map(|i| i.member).collect();
            return Ok(Output::Memory(members.into_iter()));
        }
        if self.runs.is_empty() {
            let mut items = std::mem::take(&mut self.buffer);
            items.sort();
            let members: Vec<Member> = items.into_iter().map(|i| i.member).collect();
            return Ok(Output::Memory(members.into_iter()));
        }
        self.spill()?;
        let temp_dir = match self.temp_dir.take() {
            Some(dir) => dir,
            None => return Err(Error::UnexpectedError("Missing sort spill directory".to_string())),
        };
        Ok(Output::Merge(MergeRuns::new(
            std::mem::take(&mut self.runs),
            self.sort.clone(),
            temp_dir,
        )?))
    }

    fn do_work(&mut self, ctx: &ExecutionContext) -> Result<StageState> {
        if let Some(output) = self.output.as_mut() {
            let next = match output {
                Output::Memory(members) => members.next(),
                Output::Merge(runs) => runs.next_member()?,
            };
            return Ok(match next {
                Some(member) => StageState::Advanced(member),
                None => StageState::IsEof,
            });
        }
        match self.child.work(ctx)? {
            StageState::Advanced(member) => {
                self.add(member, ctx)?;
            }
            StageState::NeedTime => (),
            StageState::IsEof => {
                self.output = Some(self.finish()?);
            }
        }
        Ok(StageState::NeedTime)
    }
}

impl PlanStage for SortStage {
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
        if self.limit.is_none() && stats.used_disk.is_none() {
            stats.used_disk = Some(false);
        }
        stats.children = vec![self.child.stats()];
        stats
    }
}

fn memory_exceeded(limit: usize) -> Error {
    Error::ResourceExhausted(format!(
        "Sort exceeded memory limit of {} bytes, but did not opt in to external sorting",
        limit
    ))
}

fn spilled_document(item: SortItem) -> Result<Document> {
    let doc = item.member.document()?.as_ref().clone();
    Ok(doc! {
        "k": item.key,
        "r": item.member.record_id.map_or(Bson::Null, |r| Bson::Int64(r as i64)),
        "d": doc,
    })
}

fn read_spilled(spilled: Document) -> Result<(Vec<Bson>, Member)> {
    let malformed = || Error::UnexpectedError("Malformed sort spill record".to_string());
    let key = spilled.get_array("k").map_err(|_| malformed())?.clone();
    let doc = spilled.get_document("d").map_err(|_| malformed())?.clone();
    let record_id = spilled.get_i64("r").ok().map(|r| r as u64);
    let mut member = Member::of_document(doc);
    member.record_id = record_id;
    Ok((key, member))
}

/// Merges sorted runs read back from temporary files.
struct MergeRuns {
    heap: BinaryHeap<RunHead>,
    readers: Vec<BufReader<NamedTempFile>>,
    sort: Arc<Vec<SortField>>,
    _temp_dir: TempDir,
}

struct RunHead {
    key: Vec<Bson>,
    member: Member,
    run: usize,
    sort: Arc<Vec<SortField>>,
}

impl PartialEq for RunHead {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RunHead {}

impl PartialOrd for RunHead {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RunHead {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed, `BinaryHeap` is a max-heap. Earlier runs win ties.
        compare_sort_keys(&other.key, &self.key, &self.sort).then(other.run.cmp(&self.run))
    }
}

impl MergeRuns {
    fn new(runs: Vec<NamedTempFile>, sort: Arc<Vec<SortField>>, temp_dir: TempDir) -> Result<Self> {
        let mut merge = MergeRuns {
            heap: BinaryHeap::new(),
            readers: runs.into_iter().map(BufReader::new).collect(),
            sort,
            _temp_dir: temp_dir,
        };
        for run in 0..merge.readers.len() {
            merge.load(run)?;
        }
        Ok(merge)
    }

    fn load(&mut self, run: usize) -> Result<()> {
        match Document::from_reader(&mut self.readers[run]) {
            Ok(spilled) => {
                let (key, member) = read_spilled(spilled)?;
                self.heap.push(RunHead {
                    key,
                    member,
                    run,
                    sort: self.sort.clone(),
                });
                Ok(())
            }
            // Run exhausted
            Err(bson::de::Error::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn next_member(&mut self) -> Result<Option<Member>> {
        match self.heap.pop() {
            Some(head) => {
                self.load(head.run)?;
                Ok(Some(head.member))
            }
            None => Ok(None),
        }
    }
}
