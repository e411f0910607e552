#![forbid(unsafe_code)]

//! Identifiers, the crate error type, and on-disk layout constants.

use std::fmt;

pub mod checksum;

pub use checksum::{x1764, Checksum, X1764};

/// Block number inside a tree file's translation table.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct BlockNum(pub u64);

/// Message sequence number.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Msn(pub u64);

/// Transaction id stamp. Opaque to this crate.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct TxnId(pub u64);

/// Identifies an open tree file inside a cache table.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct FileId(pub u32);

impl BlockNum {
    /// The null block.
    pub const NULL: BlockNum = BlockNum(0);
    /// Block holding the translation table itself.
    pub const TRANSLATION: BlockNum = BlockNum(1);
    /// Block holding the tree descriptor.
    pub const DESCRIPTOR: BlockNum = BlockNum(2);
    /// First block number handed out for nodes.
    pub const FIRST_FREE: BlockNum = BlockNum(3);
}

impl Msn {
    /// Smallest valid message sequence number.
    pub const MIN: Msn = Msn(0);
    /// Starting point of the downward-counting upgrade watermark.
    pub const UPGRADE_START: Msn = Msn(1 << 62);
}

impl TxnId {
    /// The "no transaction" stamp.
    pub const NONE: TxnId = TxnId(0);
}

impl fmt::Display for BlockNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Msn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors produced by the tree codec, the loader, and the cache-table wrapper.
#[derive(thiserror::Error, Debug)]
pub enum FtError {
    /// Error reported by the operating system.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Structural problem in on-disk bytes (bad magic, truncation, bad lengths).
    #[error("bad format: {0}")]
    BadFormat(&'static str),
    /// Structural problem with a formatted description.
    #[error("bad format: {0}")]
    BadFormatDetail(String),
    /// A stored checksum does not match the recomputed one.
    #[error("bad checksum in {what}: stored {stored:#010x}, computed {computed:#010x}")]
    BadChecksum {
        /// Which unit failed verification.
        what: &'static str,
        /// Checksum found on disk.
        stored: u32,
        /// Checksum recomputed from the bytes.
        computed: u32,
    },
    /// The layout version is neither current nor upgradable.
    #[error("unsupported layout version {0}")]
    BadVersion(u32),
    /// Two equal keys were found while sorting or merging an index.
    #[error("duplicate key in index {index} ({} bytes)", key.len())]
    DuplicateKey {
        /// Output index the key belongs to.
        index: usize,
        /// The duplicated key.
        key: Vec<u8>,
    },
    /// A row exceeds the configured key/value limits.
    #[error("row too large: key {key_len} bytes, value {val_len} bytes, limit {limit}")]
    RowTooLarge {
        /// Key length of the offending row.
        key_len: usize,
        /// Value length of the offending row.
        val_len: usize,
        /// The limit that was exceeded.
        limit: usize,
    },
    /// Out of a finite resource (temp files, memory budget).
    #[error("resource exhausted: {0}")]
    Resource(String),
    /// Lock contention in the cache table; release held pins and retry.
    #[error("try again")]
    TryAgain,
    /// The bulk load was cancelled.
    #[error("cancelled")]
    Cancelled,
    /// A partition needed by the operation is not materialized.
    #[error("partition {0} is not available")]
    PartitionUnavailable(usize),
    /// Caller violated an API precondition.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
}

impl FtError {
    /// True when the error means on-disk data failed validation.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            FtError::BadFormat(_)
                | FtError::BadFormatDetail(_)
                | FtError::BadChecksum { .. }
                | FtError::BadVersion(_)
        )
    }

    /// True when the operation may succeed after the caller drops its pins.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FtError::TryAgain)
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, FtError>;

pub mod layout {
    //! Constants shared by every on-disk unit.

    /// Current node layout version.
    pub const LAYOUT_VERSION: u32 = 29;
    /// Oldest version decoded by the current (partitioned) decoder.
    pub const LAYOUT_VERSION_MIN_CURRENT: u32 = 20;
    /// Oldest version accepted by the upgrade path.
    pub const LAYOUT_VERSION_LEGACY_MIN: u32 = 14;
    /// Build id stamped into every unit written by this crate.
    pub const BUILD_ID: u32 = 0x0046_5452;

    /// Magic for leaf nodes.
    pub const LEAF_MAGIC: [u8; 8] = *b"tokuleaf";
    /// Magic for internal nodes.
    pub const NODE_MAGIC: [u8; 8] = *b"tokunode";
    /// Magic for rollback-log blocks.
    pub const ROLLBACK_MAGIC: [u8; 8] = *b"tokuroll";
    /// Magic for the file header.
    pub const HEADER_MAGIC: [u8; 8] = *b"tokudata";

    /// Every tree-file write is a multiple of this many bytes at an aligned offset.
    pub const BLOCK_ALIGNMENT: usize = 512;
    /// Node writes start at offsets rounded up to this.
    pub const NODE_ALIGNMENT: u64 = 4096;
    /// Bytes reserved for the file header at offset zero.
    pub const HEADER_RESERVED: u64 = 4096;

    /// Rounds `n` up to the next multiple of `align` (a power of two).
    pub const fn round_up(n: u64, align: u64) -> u64 {
        (n + align - 1) & !(align - 1)
    }

    /// Rounds a byte count up to [`BLOCK_ALIGNMENT`].
    pub const fn block_padded(n: usize) -> usize {
        (n + BLOCK_ALIGNMENT - 1) & !(BLOCK_ALIGNMENT - 1)
    }
}
