//! Spill file registry and the record streams stored in spill files.
//!
//! A spill file holds `{klen i32, key, vlen i32, val}` records. With
//! compressed intermediates the records are grouped into chunks of roughly
//! the io buffer size and each chunk is written as one framed sub-block.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::primitives::bytes::{RBuf, WBuf};
use crate::primitives::compress::CompressionMethod;
use crate::storage::ft::sub_block::{self, SubBlock, FRAME_OVERHEAD};
use crate::types::{FtError, Result};

/// Index of a spill file in its [`TempFiles`] registry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fidx(pub usize);

#[derive(Debug)]
struct Entry {
    path: PathBuf,
    rows: u64,
    extant: bool,
}

/// Every spill file a load created, by [`Fidx`].
///
/// Files are unlinked when consumed, by [`TempFiles::unlink_all`], and on
/// drop; unlinking is idempotent.
#[derive(Debug)]
pub struct TempFiles {
    dir: PathBuf,
    prefix: String,
    compression: Option<CompressionMethod>,
    buffer_size: usize,
    entries: Mutex<Vec<Entry>>,
}

impl TempFiles {
    /// Registry creating files named `prefix*` in `dir` (the system temp dir
    /// when `None`). `compression` selects compressed intermediates.
    pub fn new(
        dir: Option<&Path>,
        prefix: &str,
        compression: Option<CompressionMethod>,
        buffer_size: usize,
    ) -> Self {
        Self {
            dir: dir.map(Path::to_path_buf).unwrap_or_else(std::env::temp_dir),
            prefix: prefix.to_string(),
            compression,
            buffer_size: buffer_size.max(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Creates a new spill file and returns a writer on it.
    pub fn create(&self) -> Result<(Fidx, SpillWriter)> {
        let named = tempfile::Builder::new()
            .prefix(&self.prefix)
            .tempfile_in(&self.dir)
            .map_err(|err| {
                FtError::Resource(format!("spill file in {}: {err}", self.dir.display()))
            })?;
        let (file, path) = named
            .keep()
            .map_err(|err| FtError::Resource(format!("spill file: {err}")))?;
        let fidx = {
            let mut entries = self.entries.lock();
            entries.push(Entry {
                path: path.clone(),
                rows: 0,
                extant: true,
            });
            Fidx(entries.len() - 1)
        };
        trace!(fidx = fidx.0, path = %path.display(), "loader.tempfile.create");
        Ok((fidx, SpillWriter::new(file, self.compression, self.buffer_size)))
    }

    /// Opens `fidx` for reading from the start.
    pub fn open(&self, fidx: Fidx) -> Result<SpillReader> {
        let path = {
            let entries = self.entries.lock();
            match entries.get(fidx.0) {
                Some(entry) if entry.extant => entry.path.clone(),
                _ => return Err(FtError::Invalid("spill file is not extant")),
            }
        };
        let file = File::open(&path)?;
        Ok(SpillReader::new(file, self.compression.is_some(), self.buffer_size))
    }

    /// Records the row count written to `fidx`.
    pub fn set_rows(&self, fidx: Fidx, rows: u64) {
        if let Some(entry) = self.entries.lock().get_mut(fidx.0) {
            entry.rows = rows;
        }
    }

    /// Rows written to `fidx`.
    pub fn rows(&self, fidx: Fidx) -> u64 {
        self.entries.lock().get(fidx.0).map_or(0, |e| e.rows)
    }

    /// Removes `fidx` from disk.
    pub fn unlink(&self, fidx: Fidx) -> Result<()> {
        let path = {
            let mut entries = self.entries.lock();
            match entries.get_mut(fidx.0) {
                Some(entry) if entry.extant => {
                    entry.extant = false;
                    entry.path.clone()
                }
                _ => return Ok(()),
            }
        };
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Removes every file still on disk. Returns how many were removed.
    pub fn unlink_all(&self) -> usize {
        let paths: Vec<PathBuf> = {
            let mut entries = self.entries.lock();
            entries
                .iter_mut()
                .filter(|e| e.extant)
                .map(|e| {
                    e.extant = false;
                    e.path.clone()
                })
                .collect()
        };
        for path in &paths {
            if let Err(err) = std::fs::remove_file(path) {
                if err.kind() != ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %err, "loader.tempfile.unlink");
                }
            }
        }
        if !paths.is_empty() {
            debug!(removed = paths.len(), "loader.cleanup");
        }
        paths.len()
    }

    /// Files created so far.
    pub fn created(&self) -> usize {
        self.entries.lock().len()
    }

    /// Files still on disk.
    pub fn extant(&self) -> usize {
        self.entries.lock().iter().filter(|e| e.extant).count()
    }
}

impl Drop for TempFiles {
    fn drop(&mut self) {
        self.unlink_all();
    }
}

/// Appends records to one spill file.
pub struct SpillWriter {
    out: BufWriter<File>,
    compression: Option<CompressionMethod>,
    chunk: WBuf,
    chunk_target: usize,
    rows: u64,
}

impl SpillWriter {
    fn new(file: File, compression: Option<CompressionMethod>, buffer_size: usize) -> Self {
        Self {
            out: BufWriter::with_capacity(buffer_size, file),
            compression,
            chunk: WBuf::new(),
            chunk_target: buffer_size,
            rows: 0,
        }
    }

    /// Appends one record.
    pub fn write_row(&mut self, key: &[u8], val: &[u8]) -> Result<()> {
        let klen = record_len(key.len())?;
        let vlen = record_len(val.len())?;
        match self.compression {
            None => {
                self.out.write_all(&klen.to_le_bytes())?;
                self.out.write_all(key)?;
                self.out.write_all(&vlen.to_le_bytes())?;
                self.out.write_all(val)?;
            }
            Some(_) => {
                self.chunk.put_i32(klen);
                self.chunk.put_bytes(key);
                self.chunk.put_i32(vlen);
                self.chunk.put_bytes(val);
                if self.chunk.len() >= self.chunk_target {
                    self.flush_chunk()?;
                }
            }
        }
        self.rows += 1;
        Ok(())
    }

    /// Records written so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    fn flush_chunk(&mut self) -> Result<()> {
        let Some(method) = self.compression else {
            return Ok(());
        };
        if self.chunk.is_empty() {
            return Ok(());
        }
        let block = SubBlock::compress(method, self.chunk.as_slice());
        self.out.write_all(&block.into_framed())?;
        self.chunk = WBuf::with_capacity(self.chunk_target);
        Ok(())
    }

    /// Flushes buffered records and closes the file. Returns the row count.
    pub fn finish(mut self) -> Result<u64> {
        self.flush_chunk()?;
        self.out.flush()?;
        Ok(self.rows)
    }
}

fn record_len(len: usize) -> Result<i32> {
    i32::try_from(len).map_err(|_| FtError::Invalid("spill record longer than i32::MAX"))
}

/// Reads records back from a spill file.
pub struct SpillReader {
    input: BufReader<File>,
    compressed: bool,
    chunk: Vec<u8>,
    chunk_pos: usize,
}

impl SpillReader {
    fn new(file: File, compressed: bool, buffer_size: usize) -> Self {
        Self {
            input: BufReader::with_capacity(buffer_size, file),
            compressed,
            chunk: Vec::new(),
            chunk_pos: 0,
        }
    }

    /// Next record, or `None` at the end of the file.
    pub fn next_row(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.compressed {
            return self.next_chunked_row();
        }
        let mut len = [0u8; 4];
        if !read_or_eof(&mut self.input, &mut len)? {
            return Ok(None);
        }
        let key = read_field(&mut self.input, i32::from_le_bytes(len))?;
        if !read_or_eof(&mut self.input, &mut len)? {
            return Err(FtError::BadFormat("spill record truncated"));
        }
        let val = read_field(&mut self.input, i32::from_le_bytes(len))?;
        Ok(Some((key, val)))
    }

    fn next_chunked_row(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.chunk_pos >= self.chunk.len() && !self.load_chunk()? {
            return Ok(None);
        }
        let mut r = RBuf::new(&self.chunk);
        r.seek(self.chunk_pos)?;
        let key = take_field(&mut r)?;
        let val = take_field(&mut r)?;
        self.chunk_pos = r.position();
        Ok(Some((key, val)))
    }

    fn load_chunk(&mut self) -> Result<bool> {
        let mut head = [0u8; 8];
        if !read_or_eof(&mut self.input, &mut head)? {
            return Ok(false);
        }
        let sizes = sub_block::peek_sizes(&head)?;
        let mut framed = vec![0u8; sizes.compressed + FRAME_OVERHEAD];
        framed[..8].copy_from_slice(&head);
        self.input
            .read_exact(&mut framed[8..])
            .map_err(truncated)?;
        self.chunk = sub_block::decode_framed(&framed, "spill chunk")?;
        self.chunk_pos = 0;
        Ok(!self.chunk.is_empty())
    }
}

fn truncated(err: io::Error) -> FtError {
    if err.kind() == ErrorKind::UnexpectedEof {
        FtError::BadFormat("spill file truncated")
    } else {
        err.into()
    }
}

/// Fills `buf`, returning false on a clean end of file before the first byte.
fn read_or_eof(input: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(FtError::BadFormat("spill file truncated")),
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(true)
}

fn read_field(input: &mut impl Read, len: i32) -> Result<Vec<u8>> {
    let len = usize::try_from(len).map_err(|_| FtError::BadFormat("negative spill record length"))?;
    let mut out = vec![0u8; len];
    input.read_exact(&mut out).map_err(truncated)?;
    Ok(out)
}

fn take_field(r: &mut RBuf<'_>) -> Result<Vec<u8>> {
    let len = usize::try_from(r.get_i32()?)
        .map_err(|_| FtError::BadFormat("negative spill record length"))?;
    Ok(r.take(len)?.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn rows(n: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
        (0..n)
            .map(|i| (format!("key{i:05}").into_bytes(), vec![i as u8; i % 37]))
            .collect()
    }

    fn write_and_read(compression: Option<CompressionMethod>) {
        let dir = tempdir().unwrap();
        let temp = TempFiles::new(Some(dir.path()), "spill", compression, 256);
        let (fidx, mut w) = temp.create().unwrap();
        let expected = rows(500);
        for (k, v) in &expected {
            w.write_row(k, v).unwrap();
        }
        assert_eq!(w.finish().unwrap(), 500);
        temp.set_rows(fidx, 500);

        let mut r = temp.open(fidx).unwrap();
        let mut got = Vec::new();
        while let Some(row) = r.next_row().unwrap() {
            got.push(row);
        }
        assert_eq!(got, expected);
        assert_eq!(temp.rows(fidx), 500);
    }

    #[test]
    fn plain_records_round_trip() {
        write_and_read(None);
    }

    #[test]
    fn compressed_records_round_trip() {
        write_and_read(Some(CompressionMethod::Fast));
        write_and_read(Some(CompressionMethod::Zlib));
    }

    #[test]
    fn files_carry_prefix_and_are_unlinked() {
        let dir = tempdir().unwrap();
        let temp = TempFiles::new(Some(dir.path()), "tokuld", None, 64);
        let (a, wa) = temp.create().unwrap();
        let (_b, wb) = temp.create().unwrap();
        wa.finish().unwrap();
        wb.finish().unwrap();
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.iter().all(|n| n.starts_with("tokuld")));

        temp.unlink(a).unwrap();
        temp.unlink(a).unwrap();
        assert_eq!(temp.extant(), 1);
        assert!(temp.open(a).is_err());
        assert_eq!(temp.unlink_all(), 1);
        assert_eq!(temp.unlink_all(), 0);
        assert_eq!(temp.created(), 2);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn drop_removes_files() {
        let dir = tempdir().unwrap();
        {
            let temp = TempFiles::new(Some(dir.path()), "x", None, 64);
            let (_, w) = temp.create().unwrap();
            w.finish().unwrap();
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn truncated_record_is_format_error() {
        let dir = tempdir().unwrap();
        let temp = TempFiles::new(Some(dir.path()), "t", None, 64);
        let (fidx, mut w) = temp.create().unwrap();
        w.write_row(b"abcdef", b"v").unwrap();
        w.finish().unwrap();
        let path = std::fs::read_dir(dir.path()).unwrap().next().unwrap().unwrap().path();
        let len = std::fs::metadata(&path).unwrap().len();
        let f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(len - 3).unwrap();
        let mut r = temp.open(fidx).unwrap();
        assert!(r.next_row().unwrap_err().is_corruption());
    }
}
