//! Tree-file header, block translation table, and descriptor.

use tracing::warn;

use crate::primitives::bytes::{RBuf, WBuf};
use crate::primitives::compress::CompressionMethod;
use crate::types::{layout, x1764, BlockNum, FtError, Msn, Result};

const BYTE_ORDER: u64 = 0x0102_0304_0506_0708;

/// Fixed-size header at offset zero of every tree file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileHeader {
    /// Layout the file was written with.
    pub layout_version: u32,
    /// Layout the file was first created with.
    pub layout_version_original: u32,
    /// Build that wrote the file.
    pub build_id: u32,
    /// File length once the load finished.
    pub file_size: u64,
    /// Offset of the translation table.
    pub translation_offset: u64,
    /// Bytes of the translation table, checksum included.
    pub translation_size: u64,
    /// Root node, [`BlockNum::NULL`] for a file without nodes.
    pub root: BlockNum,
    /// Target size of a serialized node.
    pub node_size: u32,
    /// Target size of a basement.
    pub basement_node_size: u32,
    /// Codec every node of the file uses.
    pub compression: CompressionMethod,
    /// Children per nonleaf node.
    pub fanout: u32,
    /// Highest msn stamped on any node in the file.
    pub max_msn: Msn,
}

impl FileHeader {
    /// Encoded length before padding.
    pub const ENCODED_LEN: usize = 8 + 4 * 3 + 8 * 5 + 4 + 4 + 1 + 4 + 8 + 4;

    /// Header for a new file written with the current layout.
    pub fn new(node_size: u32, basement_node_size: u32, compression: CompressionMethod, fanout: u32) -> Self {
        Self {
            layout_version: layout::LAYOUT_VERSION,
            layout_version_original: layout::LAYOUT_VERSION,
            build_id: layout::BUILD_ID,
            file_size: 0,
            translation_offset: 0,
            translation_size: 0,
            root: BlockNum::NULL,
            node_size,
            basement_node_size,
            compression,
            fanout,
            max_msn: Msn::MIN,
        }
    }

    /// Encodes the header padded to [`layout::HEADER_RESERVED`].
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WBuf::with_capacity(layout::HEADER_RESERVED as usize);
        w.put_bytes(&layout::HEADER_MAGIC);
        w.put_u32(self.layout_version);
        w.put_u32(self.layout_version_original);
        w.put_u32(self.build_id);
        w.put_u64(BYTE_ORDER);
        w.put_u64(self.file_size);
        w.put_u64(self.translation_offset);
        w.put_u64(self.translation_size);
        w.put_u64(self.root.0);
        w.put_u32(self.node_size);
        w.put_u32(self.basement_node_size);
        w.put_u8(self.compression.tag());
        w.put_u32(self.fanout);
        w.put_u64(self.max_msn.0);
        let checksum = x1764(w.as_slice());
        w.put_u32(checksum);
        debug_assert_eq!(w.len(), Self::ENCODED_LEN);
        w.pad_to(layout::HEADER_RESERVED as usize);
        w.into_vec()
    }

    /// Decodes and verifies a header.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = RBuf::new(bytes);
        let magic: [u8; 8] = r.get_array()?;
        if magic != layout::HEADER_MAGIC {
            return Err(FtError::BadFormat("bad tree file magic"));
        }
        let layout_version = r.get_u32()?;
        if !(layout::LAYOUT_VERSION_LEGACY_MIN..=layout::LAYOUT_VERSION).contains(&layout_version) {
            return Err(FtError::BadVersion(layout_version));
        }
        let layout_version_original = r.get_u32()?;
        let build_id = r.get_u32()?;
        if r.get_u64()? != BYTE_ORDER {
            return Err(FtError::BadFormat("tree file written with another byte order"));
        }
        let file_size = r.get_u64()?;
        let translation_offset = r.get_u64()?;
        let translation_size = r.get_u64()?;
        let root = BlockNum(r.get_u64()?);
        let node_size = r.get_u32()?;
        let basement_node_size = r.get_u32()?;
        let compression = CompressionMethod::from_tag(r.get_u8()?)
            .ok_or(FtError::BadFormat("unknown compression method in header"))?;
        let fanout = r.get_u32()?;
        let max_msn = Msn(r.get_u64()?);
        let covered = r.position();
        let stored = r.get_u32()?;
        let computed = x1764(&bytes[..covered]);
        if stored != computed {
            warn!(stored, computed, "ft.checksum.mismatch.file_header");
            return Err(FtError::BadChecksum {
                what: "file header",
                stored,
                computed,
            });
        }
        Ok(Self {
            layout_version,
            layout_version_original,
            build_id,
            file_size,
            translation_offset,
            translation_size,
            root,
            node_size,
            basement_node_size,
            compression,
            fanout,
            max_msn,
        })
    }
}

/// Where one block lives in the file.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockLocation {
    /// Byte offset in the file.
    pub offset: u64,
    /// Bytes the block occupies.
    pub size: u64,
}

/// Maps block numbers to file regions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TranslationTable {
    slots: Vec<Option<BlockLocation>>,
}

impl TranslationTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of slots, used or not.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when there are no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Records where `blocknum` was written.
    pub fn set(&mut self, blocknum: BlockNum, loc: BlockLocation) {
        let idx = blocknum.0 as usize;
        if self.slots.len() <= idx {
            self.slots.resize(idx + 1, None);
        }
        self.slots[idx] = Some(loc);
    }

    /// Location of `blocknum`, if it was written.
    pub fn get(&self, blocknum: BlockNum) -> Option<BlockLocation> {
        self.slots.get(blocknum.0 as usize).copied().flatten()
    }

    /// Used slots in block number order.
    pub fn iter(&self) -> impl Iterator<Item = (BlockNum, BlockLocation)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.map(|loc| (BlockNum(i as u64), loc)))
    }

    /// Length of the encoded table before padding.
    pub fn encoded_len(&self) -> usize {
        8 + 16 * self.slots.len() + 4
    }

    /// Encodes the table padded to the block alignment.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WBuf::with_capacity(layout::block_padded(self.encoded_len()));
        w.put_u64(self.slots.len() as u64);
        for slot in &self.slots {
            match slot {
                Some(loc) => {
                    w.put_i64(loc.offset as i64);
                    w.put_i64(loc.size as i64);
                }
                None => {
                    w.put_i64(-1);
                    w.put_i64(0);
                }
            }
        }
        let checksum = x1764(w.as_slice());
        w.put_u32(checksum);
        w.pad_to(layout::BLOCK_ALIGNMENT);
        w.into_vec()
    }

    /// Decodes and verifies a table.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = RBuf::new(bytes);
        let n = r.get_u64()? as usize;
        if n.saturating_mul(16) > r.remaining() {
            return Err(FtError::BadFormat("translation table truncated"));
        }
        let mut slots = Vec::with_capacity(n);
        for _ in 0..n {
            let offset = r.get_i64()?;
            let size = r.get_i64()?;
            slots.push(match (offset, size) {
                (-1, 0) => None,
                (o, s) if o >= 0 && s >= 0 => Some(BlockLocation {
                    offset: o as u64,
                    size: s as u64,
                }),
                _ => return Err(FtError::BadFormat("bad translation entry")),
            });
        }
        let covered = r.position();
        let stored = r.get_u32()?;
        let computed = x1764(&bytes[..covered]);
        if stored != computed {
            warn!(stored, computed, "ft.checksum.mismatch.translation");
            return Err(FtError::BadChecksum {
                what: "translation table",
                stored,
                computed,
            });
        }
        Ok(Self { slots })
    }
}

/// Opaque per-tree descriptor stored at blocknum 2.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Descriptor {
    /// Caller-defined version of `bytes`.
    pub version: u32,
    /// Caller-defined contents.
    pub bytes: Vec<u8>,
}

impl Descriptor {
    /// Encodes with a trailing checksum, padded to the block alignment.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WBuf::with_capacity(layout::block_padded(12 + self.bytes.len()));
        w.put_u32(self.version);
        w.put_len_bytes(&self.bytes);
        let checksum = x1764(w.as_slice());
        w.put_u32(checksum);
        w.pad_to(layout::BLOCK_ALIGNMENT);
        w.into_vec()
    }

    /// Decodes and checks the trailing checksum.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = RBuf::new(bytes);
        let version = r.get_u32()?;
        let body = r.get_len_bytes()?.to_vec();
        let covered = r.position();
        let stored = r.get_u32()?;
        let computed = x1764(&bytes[..covered]);
        if stored != computed {
            warn!(stored, computed, "ft.checksum.mismatch.descriptor");
            return Err(FtError::BadChecksum {
                what: "descriptor",
                stored,
                computed,
            });
        }
        Ok(Self {
            version,
            bytes: body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip_and_padding() {
        let mut header = FileHeader::new(1 << 20, 64 << 10, CompressionMethod::Small, 15);
        header.root = BlockNum(9);
        header.translation_offset = 8192;
        header.translation_size = 512;
        header.max_msn = Msn(44);
        let bytes = header.encode();
        assert_eq!(bytes.len(), layout::HEADER_RESERVED as usize);
        assert_eq!(FileHeader::decode(&bytes).unwrap(), header);

        let mut bad = bytes.clone();
        bad[60] ^= 0x04;
        assert!(matches!(
            FileHeader::decode(&bad).unwrap_err(),
            FtError::BadChecksum { what: "file header", .. }
        ));
        bad = bytes;
        bad[0] = b'x';
        assert!(FileHeader::decode(&bad).unwrap_err().is_corruption());
    }

    #[test]
    fn translation_roundtrip_with_holes() {
        let mut table = TranslationTable::new();
        table.set(BlockNum(3), BlockLocation { offset: 4096, size: 512 });
        table.set(BlockNum(5), BlockLocation { offset: 8192, size: 1024 });
        assert_eq!(table.len(), 6);
        assert_eq!(table.get(BlockNum(4)), None);
        let bytes = table.encode();
        assert_eq!(bytes.len() % layout::BLOCK_ALIGNMENT, 0);
        let back = TranslationTable::decode(&bytes).unwrap();
        assert_eq!(back, table);
        let used: Vec<_> = back.iter().map(|(b, _)| b.0).collect();
        assert_eq!(used, vec![3, 5]);

        let mut bad = bytes.clone();
        bad[8 + 3 * 16] ^= 0x01;
        assert!(TranslationTable::decode(&bad).unwrap_err().is_corruption());
    }

    #[test]
    fn descriptor_roundtrip() {
        let desc = Descriptor {
            version: 2,
            bytes: b"bytewise".to_vec(),
        };
        let bytes = desc.encode();
        assert_eq!(bytes.len(), 512);
        assert_eq!(Descriptor::decode(&bytes).unwrap(), desc);
    }
}
