//! Independently compressed, checksummed units of a node block.
//!
//! Framing: `compressed_size u32 | uncompressed_size u32 | compressed | checksum u32`,
//! where the checksum is x1764 over everything before it.

use tracing::warn;

use crate::primitives::bytes::{RBuf, WBuf};
use crate::primitives::compress::{self, CompressionMethod};
use crate::types::{FtError, Result, X1764};

/// Bytes the framing adds around the compressed payload.
pub const FRAME_OVERHEAD: usize = 4 + 4 + 4;

/// A payload compressed for writing.
#[derive(Debug)]
pub struct SubBlock {
    uncompressed_size: u32,
    compressed: Vec<u8>,
    checksum: u32,
}

impl SubBlock {
    /// Compresses `payload` with `method` and checksums the result.
    pub fn compress(method: CompressionMethod, payload: &[u8]) -> Self {
        let compressed = compress::compress_to_vec(method, payload);
        let uncompressed_size = payload.len() as u32;
        let checksum = frame_checksum(compressed.len() as u32, uncompressed_size, &compressed);
        Self {
            uncompressed_size,
            compressed,
            checksum,
        }
    }

    /// Uncompressed payload length.
    pub fn uncompressed_size(&self) -> usize {
        self.uncompressed_size as usize
    }

    /// Compressed payload length, header byte included.
    pub fn compressed_size(&self) -> usize {
        self.compressed.len()
    }

    /// Length once framed.
    pub fn framed_size(&self) -> usize {
        self.compressed.len() + FRAME_OVERHEAD
    }

    /// Stored checksum.
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Appends the framed sub-block.
    pub fn write_to(&self, out: &mut WBuf) {
        out.put_u32(self.compressed.len() as u32);
        out.put_u32(self.uncompressed_size);
        out.put_bytes(&self.compressed);
        out.put_u32(self.checksum);
    }

    /// Consumes the sub-block and returns its framed bytes.
    pub fn into_framed(self) -> Vec<u8> {
        let mut out = WBuf::with_capacity(self.framed_size());
        self.write_to(&mut out);
        out.into_vec()
    }
}

fn frame_checksum(compressed_size: u32, uncompressed_size: u32, compressed: &[u8]) -> u32 {
    let mut sum = X1764::new();
    sum.add(&compressed_size.to_le_bytes());
    sum.add(&uncompressed_size.to_le_bytes());
    sum.add(compressed);
    sum.finish()
}

/// Sizes read from a frame header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameSizes {
    /// Compressed payload length.
    pub compressed: usize,
    /// Uncompressed payload length.
    pub uncompressed: usize,
}

impl FrameSizes {
    /// Total framed length.
    pub fn framed(&self) -> usize {
        self.compressed + FRAME_OVERHEAD
    }
}

/// Reads the two size fields at the start of a frame.
pub fn peek_sizes(framed: &[u8]) -> Result<FrameSizes> {
    let mut r = RBuf::new(framed);
    let compressed = r.get_u32()? as usize;
    let uncompressed = r.get_u32()? as usize;
    if compressed == 0 {
        return Err(FtError::BadFormat("sub-block without codec header"));
    }
    Ok(FrameSizes {
        compressed,
        uncompressed,
    })
}

/// Verifies a frame at the reader's position and returns its compressed
/// payload, leaving the reader after the checksum.
pub fn read_verified<'a>(r: &mut RBuf<'a>, what: &'static str) -> Result<(FrameSizes, &'a [u8])> {
    let start = r.position();
    let compressed = r.get_u32()? as usize;
    let uncompressed = r.get_u32()? as usize;
    if compressed == 0 {
        return Err(FtError::BadFormat("sub-block without codec header"));
    }
    let payload = r.take(compressed)?;
    let stored = r.get_u32()?;
    let computed = frame_checksum(compressed as u32, uncompressed as u32, payload);
    if stored != computed {
        warn!(what, stored, computed, offset = start, "ft.checksum.mismatch");
        return Err(FtError::BadChecksum {
            what,
            stored,
            computed,
        });
    }
    Ok((
        FrameSizes {
            compressed,
            uncompressed,
        },
        payload,
    ))
}

/// Verifies and decompresses one frame at the reader's position.
pub fn read_framed(r: &mut RBuf<'_>, what: &'static str) -> Result<Vec<u8>> {
    let (sizes, payload) = read_verified(r, what)?;
    let mut out = vec![0u8; sizes.uncompressed];
    compress::decompress(&mut out, payload)?;
    Ok(out)
}

/// Verifies and decompresses a buffer holding exactly one frame.
pub fn decode_framed(framed: &[u8], what: &'static str) -> Result<Vec<u8>> {
    let mut r = RBuf::new(framed);
    let out = read_framed(&mut r, what)?;
    if !r.is_exhausted() {
        return Err(FtError::BadFormat("trailing bytes after sub-block"));
    }
    Ok(out)
}

/// Location of one partition inside the legacy combined node body.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SubBlockMap {
    /// Partition index.
    pub idx: u32,
    /// Offset of the partition from the start of the partition region.
    pub offset: u32,
    /// Partition length in bytes.
    pub size: u32,
}

impl SubBlockMap {
    /// Encoded length.
    pub const ENCODED_LEN: usize = 12;

    /// Appends the map entry.
    pub fn encode(&self, out: &mut WBuf) {
        out.put_u32(self.idx);
        out.put_u32(self.offset);
        out.put_u32(self.size);
    }

    /// Reads one map entry.
    pub fn decode(r: &mut RBuf<'_>) -> Result<Self> {
        Ok(Self {
            idx: r.get_u32()?,
            offset: r.get_u32()?,
            size: r.get_u32()?,
        })
    }

    /// Slice of `region` this entry names.
    pub fn slice<'a>(&self, region: &'a [u8]) -> Result<&'a [u8]> {
        let start = self.offset as usize;
        let end = start
            .checked_add(self.size as usize)
            .ok_or(FtError::BadFormat("sub-block map overflow"))?;
        region
            .get(start..end)
            .ok_or(FtError::BadFormat("sub-block map points past node body"))
    }
}
