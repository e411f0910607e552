//! Bulk loader: builds one or more tree files from unsorted rows.
//!
//! Rows handed to [`Loader::put`] are batched into rowsets. A background
//! extractor thread sorts each rowset per output index and spills it to a
//! temp file. [`Loader::close`] then runs, for every index, a merge thread
//! that reduces the spill files in k-way passes and streams the final pass to
//! a fractal writer that lays the tree out bottom-up.
//!
//! The first error any stage hits is latched; every stage polls the latch,
//! drains its queues, and exits. A failed load removes its output files and
//! every temp file.

pub mod dbout;
pub mod fractal;
pub mod merge;
pub mod pqueue;
mod progress;
pub mod rowset;
pub mod sort;
pub mod tempfiles;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::primitives::concurrency::{BoundedQueue, ErrorLatch};
use crate::storage::ft::cachetable::CacheTable;
use crate::storage::ft::comparator::{bytewise, SharedComparator};
use crate::storage::ft::context::FtContext;
use crate::storage::ft::header::Descriptor;
use crate::storage::ft::leafentry::LeafEntry;
use crate::storage::options::LoaderOptions;
use crate::types::{FtError, Result};

pub use dbout::Dbout;
pub use fractal::{plan_groups, FractalStats, FractalWriter};
pub use merge::{fanin_for, pass_count, MergeFileSet};
pub use pqueue::{MergeEntry, MergeQueue};
pub use rowset::{RowRef, Rowset};
pub use tempfiles::{Fidx, SpillReader, SpillWriter, TempFiles};

use merge::MergeCtx;
use progress::Progress;

/// Smallest rowset the loader will work with.
pub const MIN_ROWSET_BUDGET: usize = 1024;

/// Rows one input row contributes to an output index.
pub type GeneratedRows = Vec<(Vec<u8>, Vec<u8>)>;

/// Derives the rows of one output index from an input row.
pub trait RowGenerator: Send + Sync {
    /// Keys and values stored in index `index` for the input row. May be
    /// empty or hold several rows.
    fn generate(&self, index: usize, key: &[u8], val: &[u8]) -> Result<GeneratedRows>;
}

impl<F> RowGenerator for F
where
    F: Fn(usize, &[u8], &[u8]) -> Result<GeneratedRows> + Send + Sync,
{
    fn generate(&self, index: usize, key: &[u8], val: &[u8]) -> Result<GeneratedRows> {
        self(index, key, val)
    }
}

/// Row generator shared with the extractor thread.
pub type SharedRowGenerator = Arc<dyn RowGenerator>;

/// One output tree of a load.
#[derive(Clone)]
pub struct IndexSpec {
    /// Output file.
    pub path: PathBuf,
    /// Key order of the tree.
    pub comparator: SharedComparator,
    /// Row transformation; rows are stored as given when unset.
    pub row_generator: Option<SharedRowGenerator>,
    /// Stored at blocknum 2.
    pub descriptor: Descriptor,
}

impl std::fmt::Debug for IndexSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexSpec")
            .field("path", &self.path)
            .field("row_generator", &self.row_generator.is_some())
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

impl IndexSpec {
    /// Bytewise-ordered index storing rows as given.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            comparator: bytewise(),
            row_generator: None,
            descriptor: Descriptor::default(),
        }
    }

    /// Orders the tree with `cmp` instead of bytewise.
    pub fn comparator(mut self, cmp: SharedComparator) -> Self {
        self.comparator = cmp;
        self
    }

    /// Stores what `generator` derives from each input row.
    pub fn row_generator(mut self, generator: SharedRowGenerator) -> Self {
        self.row_generator = Some(generator);
        self
    }

    /// Descriptor written to the output file.
    pub fn descriptor(mut self, version: u32, bytes: impl Into<Vec<u8>>) -> Self {
        self.descriptor = Descriptor {
            version,
            bytes: bytes.into(),
        };
        self
    }
}

/// Outcome of one output tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    /// Output file.
    pub path: PathBuf,
    /// Rows stored in the tree.
    pub rows: u64,
    /// Spill files written during extraction.
    pub spill_files: usize,
    /// Sorted runs appended to an existing spill file.
    pub appended_runs: usize,
    /// Merge passes, the final one included.
    pub merge_passes: usize,
    /// Leaf nodes written.
    pub leaves: u64,
    /// Nonleaf nodes written.
    pub internal_nodes: u64,
    /// Height of the root; 0 for a single leaf.
    pub height: u32,
    /// Blocknum of the root.
    pub root: u64,
    /// Bytes in the finished file.
    pub file_size: u64,
}

/// Outcome of a finished load.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    /// Rows accepted by [`Loader::put`].
    pub rows_put: u64,
    /// Rowsets handed to the extractor.
    pub rowsets: u64,
    /// One entry per output tree, in index order.
    pub indexes: Vec<IndexReport>,
    /// Wall time from open to close.
    pub elapsed_ms: u64,
}

/// Reserves a fraction of a cache table's free memory for a load. The
/// returned byte count is meant for [`LoaderOptions::memory_budget`] and
/// should be handed back with `release_reserved_memory` once the load ends.
pub fn reserve_loader_memory(ct: &dyn CacheTable, fraction: f64) -> u64 {
    let bytes = ct.reserve_memory(fraction);
    debug!(fraction, bytes, "loader.memory.reserve");
    bytes
}

/// Sorted runs of one index, handed from the extractor to close.
#[derive(Debug, Default)]
struct IndexRuns {
    files: Vec<Fidx>,
    appended_runs: usize,
    rows: u64,
    bytes: u64,
}

struct Shared {
    indexes: Vec<IndexSpec>,
    opts: LoaderOptions,
    temp: TempFiles,
    latch: ErrorLatch,
    queue: BoundedQueue<Rowset>,
}

/// Records `res`'s error in the latch. Returns the value on success.
fn latched<T>(latch: &ErrorLatch, res: Result<T>) -> Option<T> {
    match res {
        Ok(v) => Some(v),
        Err(err) => {
            latch.latch(err);
            None
        }
    }
}

/// An open bulk load.
pub struct Loader {
    shared: Arc<Shared>,
    ctx: Arc<FtContext>,
    ingest: Rowset,
    rowset_budget: usize,
    extractor: Option<JoinHandle<Option<Vec<IndexRuns>>>>,
    rows_put: u64,
    rowsets: u64,
    started: Instant,
    finished: bool,
}

/// Starts a load writing one tree per entry of `indexes`.
pub fn open_loader(indexes: Vec<IndexSpec>, opts: LoaderOptions, ctx: Arc<FtContext>) -> Result<Loader> {
    if indexes.is_empty() {
        return Err(FtError::Invalid("loader needs at least one index"));
    }
    for (i, spec) in indexes.iter().enumerate() {
        if indexes[..i].iter().any(|other| other.path == spec.path) {
            return Err(FtError::Invalid("two indexes share an output file"));
        }
    }
    let depth = opts.rowset_queue_depth.max(1);
    let rowset_budget = (opts.memory_budget / (indexes.len() + depth + 1)).max(MIN_ROWSET_BUDGET);
    let temp = TempFiles::new(
        opts.temp_dir.as_deref(),
        &opts.temp_prefix,
        opts.compress_intermediates
            .then_some(opts.intermediate_compression),
        opts.io_buffer_size,
    );
    let shared = Arc::new(Shared {
        indexes,
        opts,
        temp,
        latch: ErrorLatch::new(),
        queue: BoundedQueue::new(depth),
    });
    let worker = Arc::clone(&shared);
    let extractor = thread::Builder::new()
        .name("ft-loader-extract".to_string())
        .spawn(move || extract(&worker))
        .map_err(|err| FtError::Resource(format!("extractor thread: {err}")))?;
    info!(
        indexes = shared.indexes.len(),
        memory_budget = shared.opts.memory_budget,
        rowset_budget,
        compress_intermediates = shared.opts.compress_intermediates,
        "loader.open"
    );
    Ok(Loader {
        shared,
        ctx,
        ingest: Rowset::new(rowset_budget),
        rowset_budget,
        extractor: Some(extractor),
        rows_put: 0,
        rowsets: 0,
        started: Instant::now(),
        finished: false,
    })
}

impl Loader {
    /// Bytes each rowset may hold.
    pub fn rowset_budget(&self) -> usize {
        self.rowset_budget
    }

    /// Rows accepted so far.
    pub fn rows_put(&self) -> u64 {
        self.rows_put
    }

    /// Adds one row. Fails with the latched error once any stage failed.
    pub fn put(&mut self, key: &[u8], val: &[u8]) -> Result<()> {
        if self.finished {
            return Err(FtError::Invalid("loader is closed"));
        }
        if let Some(err) = self.shared.latch.get() {
            return Err(err);
        }
        check_row_limits(&self.shared.opts, key, val)?;
        if !self.ingest.try_push(key, val) {
            if !self.ingest.is_empty() {
                self.flush_ingest()?;
            }
            if !self.ingest.try_push(key, val) {
                return Err(FtError::RowTooLarge {
                    key_len: key.len(),
                    val_len: val.len(),
                    limit: self.rowset_budget,
                });
            }
        }
        self.rows_put += 1;
        Ok(())
    }

    fn flush_ingest(&mut self) -> Result<()> {
        let full = std::mem::replace(&mut self.ingest, Rowset::new(self.rowset_budget));
        self.rowsets += 1;
        self.shared
            .queue
            .push(full)
            .map_err(|_| self.shared.latch.get().unwrap_or(FtError::Cancelled))
    }

    /// Finishes extraction, merges, and writes every output tree.
    pub fn close(mut self) -> Result<LoadReport> {
        match self.finish_load() {
            Ok(report) => {
                info!(
                    rows = report.rows_put,
                    indexes = report.indexes.len(),
                    elapsed_ms = report.elapsed_ms,
                    "loader.close"
                );
                Ok(report)
            }
            Err(err) => {
                warn!(error = %err, "loader.close.failed");
                self.shutdown();
                Err(err)
            }
        }
    }

    /// Stops the load, discarding everything written so far.
    pub fn abort(mut self) -> Result<()> {
        self.shared.latch.latch(FtError::Cancelled);
        self.shutdown();
        info!(rows = self.rows_put, "loader.abort");
        Ok(())
    }

    fn finish_load(&mut self) -> Result<LoadReport> {
        if !self.ingest.is_empty() {
            self.flush_ingest()?;
        }
        self.shared.queue.close();
        let runs = self.join_extractor()?;
        self.finished = true;

        let shared = &*self.shared;
        let n = shared.indexes.len();
        let fanin = fanin_for(shared.opts.memory_budget / n, shared.opts.io_buffer_size);
        let total_work: u64 = runs
            .iter()
            .map(|r| r.rows * (pass_count(r.files.len(), fanin) as u64 + 1))
            .sum();
        let progress = Progress::new(shared.opts.progress.clone(), total_work);

        let mut outputs = Vec::with_capacity(n);
        for spec in &shared.indexes {
            match Dbout::create(&spec.path, shared.opts.tree.file_growth_increment) {
                Ok(out) => outputs.push(out),
                Err(err) => {
                    remove_outputs(&outputs);
                    return Err(err);
                }
            }
        }

        let ctx = &*self.ctx;
        let budget = self.rowset_budget;
        let reports: Vec<Option<IndexReport>> = thread::scope(|s| {
            let handles: Vec<_> = runs
                .into_iter()
                .zip(&outputs)
                .enumerate()
                .map(|(i, (runs, out))| {
                    let progress = &progress;
                    thread::Builder::new()
                        .name(format!("ft-loader-index-{i}"))
                        .spawn_scoped(s, move || {
                            let res = build_index(shared, ctx, i, runs, out, progress, fanin, budget);
                            latched(&shared.latch, res)
                        })
                        .map_err(|err| FtError::Resource(format!("index thread: {err}")))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| match h {
                    Ok(h) => h.join().unwrap_or_else(|_| {
                        shared
                            .latch
                            .latch(FtError::Resource("index thread panicked".to_string()));
                        None
                    }),
                    Err(err) => {
                        shared.latch.latch(err);
                        None
                    }
                })
                .collect()
        });

        let finished = match shared.latch.take() {
            Some(err) => Err(err),
            None => progress.finish(),
        };
        if let Err(err) = finished {
            remove_outputs(&outputs);
            return Err(err);
        }
        shared.temp.unlink_all();
        Ok(LoadReport {
            rows_put: self.rows_put,
            rowsets: self.rowsets,
            indexes: reports.into_iter().flatten().collect(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        })
    }

    fn join_extractor(&mut self) -> Result<Vec<IndexRuns>> {
        let Some(handle) = self.extractor.take() else {
            return Err(FtError::Invalid("extractor already joined"));
        };
        let runs = handle
            .join()
            .map_err(|_| FtError::Resource("extractor thread panicked".to_string()))?;
        match (runs, self.shared.latch.take()) {
            (_, Some(err)) => Err(err),
            (Some(runs), None) => Ok(runs),
            (None, None) => Err(FtError::Cancelled),
        }
    }

    /// Stops every stage and removes temp files. Idempotent.
    fn shutdown(&mut self) {
        self.finished = true;
        let dropped = self.shared.queue.drain();
        if let Some(handle) = self.extractor.take() {
            if handle.join().is_err() {
                warn!("loader.extract.panicked");
            }
        }
        let removed = self.shared.temp.unlink_all();
        debug!(dropped_rowsets = dropped, removed, "loader.cleanup");
    }
}

impl Drop for Loader {
    fn drop(&mut self) {
        if !self.finished || self.extractor.is_some() {
            self.shared.latch.latch(FtError::Cancelled);
            self.shutdown();
        }
    }
}

/// Refuses rows past the configured key or value length.
fn check_row_limits(opts: &LoaderOptions, key: &[u8], val: &[u8]) -> Result<()> {
    if key.len() > opts.max_key_len || val.len() > opts.max_val_len {
        return Err(FtError::RowTooLarge {
            key_len: key.len(),
            val_len: val.len(),
            limit: if key.len() > opts.max_key_len {
                opts.max_key_len
            } else {
                opts.max_val_len
            },
        });
    }
    Ok(())
}

fn remove_outputs(outputs: &[Dbout]) {
    for out in outputs {
        if let Err(err) = out.remove() {
            warn!(path = %out.path().display(), error = %err, "loader.cleanup.output");
        }
    }
}

/// Extractor thread body. Returns `None` after latching an error.
fn extract(shared: &Shared) -> Option<Vec<IndexRuns>> {
    let mut sets: Vec<MergeFileSet> = shared.indexes.iter().map(|_| MergeFileSet::new()).collect();
    let mut runs: Vec<IndexRuns> = shared.indexes.iter().map(|_| IndexRuns::default()).collect();
    while let Some(rowset) = shared.queue.pop() {
        if shared.latch.is_set() {
            break;
        }
        if latched(&shared.latch, extract_rowset(shared, rowset, &mut sets, &mut runs)).is_none() {
            break;
        }
    }
    if shared.latch.is_set() {
        shared.queue.drain();
        return None;
    }
    for (set, run) in sets.into_iter().zip(runs.iter_mut()) {
        run.appended_runs = set.appended_runs();
        run.files = latched(&shared.latch, set.finish(&shared.temp))?;
    }
    debug!(
        spill_files = shared.temp.created(),
        "loader.extract.done"
    );
    Some(runs)
}

fn extract_rowset(
    shared: &Shared,
    mut rowset: Rowset,
    sets: &mut [MergeFileSet],
    runs: &mut [IndexRuns],
) -> Result<()> {
    let n = shared.indexes.len();
    for (i, spec) in shared.indexes.iter().enumerate() {
        if i + 1 == n && spec.row_generator.is_none() {
            let rs = std::mem::take(&mut rowset);
            spill_run(shared, i, rs, &mut sets[i], &mut runs[i])?;
        } else {
            index_rowsets(spec, i, &rowset, &shared.opts, |rs| {
                spill_run(shared, i, rs, &mut sets[i], &mut runs[i])
            })?;
        }
    }
    Ok(())
}

/// Sorts one working rowset of index `i` and adds it as a run.
fn spill_run(shared: &Shared, i: usize, mut rs: Rowset, set: &mut MergeFileSet, run: &mut IndexRuns) -> Result<()> {
    let cmp = shared.indexes[i].comparator.as_ref();
    rs.sort(cmp);
    if let Some(d) = rs.first_duplicate(cmp) {
        let (key, val) = rs.row(d);
        if let Some(cb) = &shared.opts.on_duplicate {
            cb(i, key, val);
        }
        return Err(FtError::DuplicateKey {
            index: i,
            key: key.to_vec(),
        });
    }
    run.rows += rs.len() as u64;
    run.bytes += rs
        .iter()
        .map(|(k, v)| LeafEntry::clean_disk_size(k.len(), v.len()) as u64)
        .sum::<u64>();
    set.add_run(&shared.temp, &rs, cmp)?;
    Ok(())
}

/// Hands `emit` the rows index `i` stores for `src`, in working rowsets no
/// larger than `src`'s budget. Generated rows are held to the row limits.
fn index_rowsets(
    spec: &IndexSpec,
    i: usize,
    src: &Rowset,
    opts: &LoaderOptions,
    mut emit: impl FnMut(Rowset) -> Result<()>,
) -> Result<()> {
    let budget = src.budget();
    let Some(generator) = &spec.row_generator else {
        let mut copy = Rowset::new(budget);
        for (k, v) in src.iter() {
            copy.try_push(k, v);
        }
        return emit(copy);
    };
    let mut work = Rowset::new(budget);
    for (k, v) in src.iter() {
        for (gk, gv) in generator.generate(i, k, v)? {
            check_row_limits(opts, &gk, &gv)?;
            if work.try_push(&gk, &gv) {
                continue;
            }
            if !work.is_empty() {
                emit(std::mem::replace(&mut work, Rowset::new(budget)))?;
            }
            if !work.try_push(&gk, &gv) {
                return Err(FtError::RowTooLarge {
                    key_len: gk.len(),
                    val_len: gv.len(),
                    limit: budget,
                });
            }
        }
    }
    if work.is_empty() {
        return Ok(());
    }
    emit(work)
}

/// Merges one index's runs and writes its tree to `out`.
#[allow(clippy::too_many_arguments)]
fn build_index(
    shared: &Shared,
    ctx: &FtContext,
    i: usize,
    runs: IndexRuns,
    out: &Dbout,
    progress: &Progress,
    fanin: usize,
    budget: usize,
) -> Result<IndexReport> {
    let spec = &shared.indexes[i];
    out.write_descriptor(&spec.descriptor)?;
    let queue: BoundedQueue<Rowset> = BoundedQueue::new(shared.opts.merge_queue_depth.max(1));
    let mctx = MergeCtx {
        temp: &shared.temp,
        cmp: spec.comparator.as_ref(),
        index: i,
        on_dup: shared.opts.on_duplicate.clone(),
        latch: &shared.latch,
        progress,
    };
    let spill_files = runs.files.len();
    let (merged, stats) = thread::scope(|s| {
        let merger = thread::Builder::new()
            .name(format!("ft-loader-merge-{i}"))
            .spawn_scoped(s, || {
                let res = mctx.reduce(runs.files, fanin).and_then(|(files, passes)| {
                    mctx.merge_into_queue(&files, budget, &queue)
                        .map(|rows| (rows, passes + 1))
                });
                let res = latched(&shared.latch, res);
                if res.is_none() {
                    queue.close();
                }
                res
            });
        let merger = match merger {
            Ok(h) => h,
            Err(err) => {
                shared
                    .latch
                    .latch(FtError::Resource(format!("merge thread: {err}")));
                return (None, None);
            }
        };
        let stats = latched(&shared.latch, write_tree(shared, ctx, out, &queue, progress, runs.bytes));
        if stats.is_none() {
            queue.drain();
        }
        let merged = merger.join().unwrap_or_else(|_| {
            shared
                .latch
                .latch(FtError::Resource("merge thread panicked".to_string()));
            None
        });
        (merged, stats)
    });
    let ((rows, merge_passes), stats) = match (merged, stats) {
        (Some(m), Some(s)) => (m, s),
        _ => return Err(FtError::Cancelled),
    };
    if rows != runs.rows || stats.rows != rows {
        return Err(FtError::BadFormatDetail(format!(
            "index {i}: extracted {} rows, merged {rows}, wrote {}",
            runs.rows, stats.rows
        )));
    }
    info!(
        index = i,
        path = %spec.path.display(),
        rows,
        spill_files,
        merge_passes,
        leaves = stats.leaves,
        height = stats.height,
        "loader.index.done"
    );
    Ok(IndexReport {
        path: spec.path.clone(),
        rows,
        spill_files,
        appended_runs: runs.appended_runs,
        merge_passes,
        leaves: stats.leaves,
        internal_nodes: stats.internal_nodes,
        height: stats.height,
        root: stats.root,
        file_size: stats.file_size,
    })
}

fn write_tree(
    shared: &Shared,
    ctx: &FtContext,
    out: &Dbout,
    queue: &BoundedQueue<Rowset>,
    progress: &Progress,
    total_bytes: u64,
) -> Result<FractalStats> {
    let mut writer = FractalWriter::new(out, &shared.opts.tree, ctx, &shared.temp, progress, total_bytes)?;
    while let Some(rs) = queue.pop() {
        if shared.latch.is_set() {
            return Err(FtError::Cancelled);
        }
        for (k, v) in rs.iter() {
            writer.add_row(k, v)?;
        }
    }
    if shared.latch.is_set() {
        return Err(FtError::Cancelled);
    }
    writer.finish()
}
