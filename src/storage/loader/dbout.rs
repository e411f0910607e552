//! Append-only output stream of one tree file.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::primitives::io::{FileGrowth, FileIo, StdFileIo};
use crate::storage::ft::header::{BlockLocation, Descriptor, FileHeader, TranslationTable};
use crate::types::{layout, BlockNum, Result};

#[derive(Debug)]
struct State {
    offset: u64,
    next_blocknum: u64,
    translation: TranslationTable,
    bytes_written: u64,
}

/// Writes node blocks of one tree file at increasing, 4096-aligned offsets.
///
/// Block numbers, the write offset, file growth, and the translation table
/// are guarded by one mutex. Block bytes are written outside it.
#[derive(Debug)]
pub struct Dbout {
    path: PathBuf,
    io: StdFileIo,
    growth: FileGrowth,
    state: Mutex<State>,
}

impl Dbout {
    /// Creates (or truncates) `path`. Nodes start after the reserved header.
    pub fn create(path: impl AsRef<Path>, growth_increment: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let io = StdFileIo::create(&path)?;
        debug!(path = %path.display(), "loader.dbout.create");
        Ok(Self {
            path,
            io,
            growth: FileGrowth::new(growth_increment),
            state: Mutex::new(State {
                offset: layout::HEADER_RESERVED,
                next_blocknum: BlockNum::FIRST_FREE.0,
                translation: TranslationTable::new(),
                bytes_written: 0,
            }),
        })
    }

    /// Output file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hands out the next unused block number.
    pub fn allocate_blocknum(&self) -> BlockNum {
        let mut st = self.state.lock();
        let b = BlockNum(st.next_blocknum);
        st.next_blocknum += 1;
        b
    }

    /// Bytes of blocks written so far, padding excluded.
    pub fn bytes_written(&self) -> u64 {
        self.state.lock().bytes_written
    }

    /// Writes `bytes` as `blocknum` and records it in the translation table.
    pub fn write_block(&self, blocknum: BlockNum, bytes: &[u8]) -> Result<BlockLocation> {
        let loc = {
            let mut st = self.state.lock();
            let offset = layout::round_up(st.offset, layout::NODE_ALIGNMENT);
            let loc = BlockLocation {
                offset,
                size: bytes.len() as u64,
            };
            self.growth.ensure(&self.io, loc.offset + loc.size)?;
            st.offset = loc.offset + loc.size;
            loc
        };
        self.io.write_at(loc.offset, bytes)?;
        let mut st = self.state.lock();
        st.translation.set(blocknum, loc);
        st.bytes_written += loc.size;
        trace!(blocknum = blocknum.0, offset = loc.offset, size = loc.size, "loader.dbout.write");
        Ok(loc)
    }

    /// Writes the descriptor block.
    pub fn write_descriptor(&self, descriptor: &Descriptor) -> Result<BlockLocation> {
        self.write_block(BlockNum::DESCRIPTOR, &descriptor.encode())
    }

    /// Writes the translation table and the header naming `root`, trims an
    /// over-allocated tail, and syncs. Returns the header as written.
    pub fn finish(&self, root: BlockNum, mut header: FileHeader) -> Result<FileHeader> {
        let mut st = self.state.lock();
        let offset = layout::round_up(st.offset, layout::NODE_ALIGNMENT);
        // the table records its own location, so size it with the slot present
        st.translation.set(BlockNum::TRANSLATION, BlockLocation { offset, size: 0 });
        let size = layout::block_padded(st.translation.encoded_len()) as u64;
        st.translation
            .set(BlockNum::TRANSLATION, BlockLocation { offset, size });
        let table = st.translation.encode();
        self.growth.ensure(&self.io, offset + size)?;
        self.io.write_at(offset, &table)?;
        st.offset = offset + size;

        header.root = root;
        header.translation_offset = offset;
        header.translation_size = size;
        header.file_size = st.offset;
        self.io.write_at(0, &header.encode())?;
        let trimmed = self.growth.trim(&self.io, header.file_size)?;
        self.io.sync_all()?;
        debug!(
            path = %self.path.display(),
            root = root.0,
            file_size = header.file_size,
            blocks = st.translation.iter().count(),
            trimmed,
            "loader.dbout.finish"
        );
        Ok(header)
    }

    /// Removes the output file.
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
