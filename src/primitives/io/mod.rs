#![forbid(unsafe_code)]

//! Positioned file I/O used by the tree-file writer and reader, plus the
//! growth/truncation policy applied to tree files.

use std::{
    fs::{File, OpenOptions},
    io::{self, ErrorKind},
    path::Path,
    sync::Arc,
};

use tracing::trace;

use crate::types::{layout, FtError, Result};

/// Positioned reads and writes against one file.
pub trait FileIo: Send + Sync + 'static {
    /// Fills `dst` from `off`; a short file is `UnexpectedEof`.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` at `off`.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Flushes data and metadata.
    fn sync_all(&self) -> Result<()>;
    /// Current file length.
    fn len(&self) -> Result<u64>;
    /// True if the file has no bytes.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Sets the file length.
    fn truncate(&self, len: u64) -> Result<()>;
}

#[cfg(unix)]
mod positioned {
    use std::{
        fs::File,
        io::{self, ErrorKind},
        os::unix::fs::FileExt,
    };

    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let n = file.read_at(dst, off)?;
            if n == 0 {
                return Err(io::Error::new(ErrorKind::UnexpectedEof, "read_at hit EOF"));
            }
            dst = &mut dst[n..];
            off += n as u64;
        }
        Ok(())
    }

    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let n = file.write_at(src, off)?;
            if n == 0 {
                return Err(io::Error::new(ErrorKind::WriteZero, "write_at wrote nothing"));
            }
            src = &src[n..];
            off += n as u64;
        }
        Ok(())
    }
}

#[cfg(windows)]
mod positioned {
    use std::{
        fs::File,
        io::{self, ErrorKind},
        os::windows::fs::FileExt,
    };

    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let n = file.seek_read(dst, off)?;
            if n == 0 {
                return Err(io::Error::new(ErrorKind::UnexpectedEof, "seek_read hit EOF"));
            }
            dst = &mut dst[n..];
            off += n as u64;
        }
        Ok(())
    }

    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let n = file.seek_write(src, off)?;
            if n == 0 {
                return Err(io::Error::new(ErrorKind::WriteZero, "seek_write wrote nothing"));
            }
            src = &src[n..];
            off += n as u64;
        }
        Ok(())
    }
}

/// [`FileIo`] over a shared `std::fs::File`.
#[derive(Clone, Debug)]
pub struct StdFileIo {
    inner: Arc<File>,
}

impl StdFileIo {
    /// Wraps an already open file.
    pub fn new(file: File) -> Self {
        Self {
            inner: Arc::new(file),
        }
    }

    /// Creates (or truncates) a file for writing a new tree.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self::new(file))
    }

    /// Opens an existing file read-only.
    pub fn open_read(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self::new(file))
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        positioned::read_exact(&self.inner, off, dst).map_err(FtError::from)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        trace!(off, len = src.len(), "io.write_at");
        positioned::write_all(&self.inner, off, src).map_err(FtError::from)
    }

    fn sync_all(&self) -> Result<()> {
        self.inner.sync_all().map_err(FtError::from)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.inner.metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.inner.set_len(len).map_err(FtError::from)
    }
}

/// Preallocation policy for a file that is only ever appended to.
///
/// The file doubles in size while small, never grows by more than `increment`
/// at once, and is truncated back once it is over-allocated by at least twice
/// the increment.
#[derive(Clone, Copy, Debug)]
pub struct FileGrowth {
    increment: u64,
}

impl FileGrowth {
    /// Policy with the given maximum growth step (rounded to the block alignment).
    pub fn new(increment: u64) -> Self {
        let align = layout::BLOCK_ALIGNMENT as u64;
        Self {
            increment: layout::round_up(increment.max(align), align),
        }
    }

    /// Length the file should be grown to so that `needed` bytes fit.
    pub fn target_len(&self, current: u64, needed: u64) -> u64 {
        let align = layout::BLOCK_ALIGNMENT as u64;
        let mut len = current;
        while len < needed {
            let step = len.clamp(align, self.increment);
            len += step;
        }
        layout::round_up(len, align)
    }

    /// Grows `io` so that `needed` bytes fit.
    pub fn ensure(&self, io: &dyn FileIo, needed: u64) -> Result<()> {
        let current = io.len()?;
        if current >= needed {
            return Ok(());
        }
        let target = self.target_len(current, needed);
        trace!(current, target, "io.grow");
        io.truncate(target)
    }

    /// Truncates `io` back to `used` bytes when it is over-allocated.
    pub fn trim(&self, io: &dyn FileIo, used: u64) -> Result<bool> {
        let current = io.len()?;
        let used = layout::round_up(used, layout::BLOCK_ALIGNMENT as u64);
        if current >= used + 2 * self.increment {
            io.truncate(used)?;
            return Ok(true);
        }
        Ok(false)
    }
}

/// Maps an `UnexpectedEof` from a read into a truncation format error.
pub fn eof_as_truncation(err: FtError) -> FtError {
    match err {
        FtError::Io(inner) if inner.kind() == ErrorKind::UnexpectedEof => {
            FtError::BadFormat("file truncated")
        }
        other => other,
    }
}

/// Wraps an `io::Error` whose origin should be reported verbatim.
pub fn io_error(err: io::Error) -> FtError {
    FtError::Io(err)
}
