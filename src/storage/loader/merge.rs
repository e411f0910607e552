//! Sorted runs on disk and the k-way merge passes over them.

use std::cmp::Ordering;

use tracing::{debug, trace};

use crate::primitives::concurrency::{BoundedQueue, ErrorLatch};
use crate::storage::ft::comparator::Comparator;
use crate::storage::options::DuplicateCallback;
use crate::types::{FtError, Result};

use super::pqueue::MergeQueue;
use super::progress::Progress;
use super::rowset::Rowset;
use super::tempfiles::{Fidx, SpillReader, SpillWriter, TempFiles};

/// Rows merged between checks of the error latch.
const LATCH_CHECK_INTERVAL: u64 = 1024;

struct Tail {
    fidx: Fidx,
    writer: SpillWriter,
    max_key: Vec<u8>,
}

/// Spill files holding the sorted runs of one index.
///
/// The most recent file stays open as an appendable tail: a run whose
/// smallest key sorts after everything in the tail is appended to it instead
/// of starting a new file.
#[derive(Default)]
pub struct MergeFileSet {
    files: Vec<Fidx>,
    tail: Option<Tail>,
    appended_runs: usize,
}

impl MergeFileSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Files created so far.
    pub fn files(&self) -> &[Fidx] {
        &self.files
    }

    /// Runs that went into an existing file.
    pub fn appended_runs(&self) -> usize {
        self.appended_runs
    }

    /// Largest key in the most recently written file.
    pub fn tail_max(&self) -> Option<&[u8]> {
        self.tail.as_ref().map(|t| t.max_key.as_slice())
    }

    /// Spills a sorted, duplicate-free rowset. Returns true if it was
    /// appended to the tail file.
    pub fn add_run(&mut self, temp: &TempFiles, rows: &Rowset, cmp: &dyn Comparator) -> Result<bool> {
        let (Some(first), Some(last)) = (rows.first_key(), rows.last_key()) else {
            return Ok(false);
        };
        let append = self
            .tail
            .as_ref()
            .is_some_and(|t| cmp.compare(&t.max_key, first) == Ordering::Less);
        if !append {
            self.close_tail(temp)?;
            let (fidx, writer) = temp.create()?;
            self.files.push(fidx);
            self.tail = Some(Tail {
                fidx,
                writer,
                max_key: Vec::new(),
            });
        }
        let Some(tail) = self.tail.as_mut() else {
            return Err(FtError::Invalid("merge file set lost its tail"));
        };
        for (k, v) in rows.iter() {
            tail.writer.write_row(k, v)?;
        }
        tail.max_key = last.to_vec();
        if append {
            self.appended_runs += 1;
        }
        trace!(fidx = tail.fidx.0, rows = rows.len(), append, "loader.extract.spill");
        Ok(append)
    }

    fn close_tail(&mut self, temp: &TempFiles) -> Result<()> {
        if let Some(tail) = self.tail.take() {
            let rows = tail.writer.finish()?;
            temp.set_rows(tail.fidx, rows);
        }
        Ok(())
    }

    /// Closes the tail and returns every file in creation order.
    pub fn finish(mut self, temp: &TempFiles) -> Result<Vec<Fidx>> {
        self.close_tail(temp)?;
        Ok(std::mem::take(&mut self.files))
    }
}

/// Streams merged per pass given the memory for one index and the read
/// buffer of one stream; every stream is double buffered.
pub fn fanin_for(memory: usize, io_buffer: usize) -> usize {
    (memory / (2 * io_buffer.max(1))).max(2)
}

/// Merge passes needed for `files` runs at `fanin`, the final pass that
/// feeds the fractal writer included.
pub fn pass_count(files: usize, fanin: usize) -> usize {
    let fanin = fanin.max(2);
    let mut n = files;
    let mut passes = 1;
    while n > fanin {
        n = n.div_ceil(fanin);
        passes += 1;
    }
    passes
}

/// Everything a merge pass of one index needs.
pub struct MergeCtx<'a> {
    /// Spill files of the load.
    pub temp: &'a TempFiles,
    /// Key order of the index.
    pub cmp: &'a dyn Comparator,
    /// Index being merged.
    pub index: usize,
    /// Told about duplicate keys before the load fails.
    pub on_dup: Option<DuplicateCallback>,
    /// Where the first error is recorded.
    pub latch: &'a ErrorLatch,
    pub(crate) progress: &'a Progress,
}

impl MergeCtx<'_> {
    /// Merges `files` in order, handing each row to `sink`. Inputs are
    /// unlinked once fully consumed.
    fn merge_streams(
        &self,
        files: &[Fidx],
        mut sink: impl FnMut(Vec<u8>, Vec<u8>) -> Result<()>,
    ) -> Result<u64> {
        let mut readers: Vec<SpillReader> = files
            .iter()
            .map(|f| self.temp.open(*f))
            .collect::<Result<_>>()?;
        let mut queue = MergeQueue::new(self.cmp, self.index, self.on_dup.clone());
        for (stream, reader) in readers.iter_mut().enumerate() {
            if let Some((k, v)) = reader.next_row()? {
                queue.insert(stream, k, v);
            }
        }
        let mut rows = 0u64;
        while let Some(entry) = queue.pop()? {
            if let Some((k, v)) = readers[entry.stream].next_row()? {
                queue.insert(entry.stream, k, v);
            }
            sink(entry.key, entry.val)?;
            rows += 1;
            if rows % LATCH_CHECK_INTERVAL == 0 {
                if self.latch.is_set() {
                    return Err(FtError::Cancelled);
                }
                self.progress.advance(LATCH_CHECK_INTERVAL)?;
            }
        }
        self.progress.advance(rows % LATCH_CHECK_INTERVAL)?;
        drop(readers);
        for f in files {
            self.temp.unlink(*f)?;
        }
        Ok(rows)
    }

    /// Merges groups of `fanin` files into new files until at most `fanin`
    /// remain. Returns the remaining files and the passes run.
    pub fn reduce(&self, mut files: Vec<Fidx>, fanin: usize) -> Result<(Vec<Fidx>, usize)> {
        let fanin = fanin.max(2);
        let mut passes = 0;
        while files.len() > fanin {
            let mut next = Vec::with_capacity(files.len().div_ceil(fanin));
            for group in files.chunks(fanin) {
                if group.len() == 1 {
                    next.push(group[0]);
                    continue;
                }
                let (fidx, mut writer) = self.temp.create()?;
                self.merge_streams(group, |k, v| writer.write_row(&k, &v))?;
                let rows = writer.finish()?;
                self.temp.set_rows(fidx, rows);
                next.push(fidx);
            }
            passes += 1;
            debug!(
                index = self.index,
                pass = passes,
                inputs = files.len(),
                outputs = next.len(),
                "loader.merge.pass"
            );
            files = next;
        }
        Ok((files, passes))
    }

    /// Final pass: merges `files` into rowsets of `budget` bytes pushed to
    /// `out`. Closes `out` when done. Returns the rows merged.
    pub fn merge_into_queue(&self, files: &[Fidx], budget: usize, out: &BoundedQueue<Rowset>) -> Result<u64> {
        let mut current = Rowset::new(budget);
        let rows = self.merge_streams(files, |k, v| {
            if current.try_push(&k, &v) {
                return Ok(());
            }
            if !current.is_empty() {
                let full = std::mem::replace(&mut current, Rowset::new(budget));
                out.push(full).map_err(|_| FtError::Cancelled)?;
            }
            if !current.try_push(&k, &v) {
                // a row bigger than the budget travels alone
                current = Rowset::new(Rowset::row_cost(k.len(), v.len()));
                current.try_push(&k, &v);
            }
            Ok(())
        })?;
        if !current.is_empty() {
            out.push(current).map_err(|_| FtError::Cancelled)?;
        }
        out.close();
        debug!(index = self.index, rows, inputs = files.len(), "loader.merge.final");
        Ok(rows)
    }
}
