//! The cache-table seam: how nodes are pinned, fetched, and released.
//!
//! The tree code never owns nodes directly. It asks a [`CacheTable`] for a
//! pinned node by [`CacheKey`], hands it a [`NodeFetcher`] to materialize the
//! node on a miss, and releases the pin with [`CacheTable::unpin`]. Lock
//! conflicts surface as [`FtError::TryAgain`](crate::types::FtError::TryAgain);
//! callers drop every pin they hold and restart their operation.

use std::ops::Deref;
use std::sync::Arc;

use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, RawRwLock, RwLock};

use crate::types::{BlockNum, FileId, Result};

use super::comparator::Comparator;
use super::node::{FetchPolicy, Node};

pub mod pin;
pub mod simple;

pub use pin::{maybe_pin_clean, pin_for_read, pin_for_write, put_new_node, unpin, AncestorMessages};
pub use simple::SimpleCacheTable;

/// Identifies one node of one open tree file.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Tree file the node belongs to.
    pub file: FileId,
    /// Node within that file.
    pub blocknum: BlockNum,
    /// Hash of `(file, blocknum)`; cache tables shard and bucket by it.
    pub fullhash: u32,
}

impl CacheKey {
    /// Key for `blocknum` of `file`, with its hash computed.
    pub fn new(file: FileId, blocknum: BlockNum) -> Self {
        Self {
            file,
            blocknum,
            fullhash: fullhash(file, blocknum),
        }
    }
}

/// Jenkins' final mix over the file id and both halves of the block number.
pub fn fullhash(file: FileId, blocknum: BlockNum) -> u32 {
    let mut a = file.0;
    let mut b = blocknum.0 as u32;
    let mut c = (blocknum.0 >> 32) as u32;
    c ^= b;
    c = c.wrapping_sub(b.rotate_left(14));
    a ^= c;
    a = a.wrapping_sub(c.rotate_left(11));
    b ^= a;
    b = b.wrapping_sub(a.rotate_left(25));
    c ^= b;
    c = c.wrapping_sub(b.rotate_left(16));
    a ^= c;
    a = a.wrapping_sub(c.rotate_left(4));
    b ^= a;
    b = b.wrapping_sub(a.rotate_left(14));
    c ^= b;
    c = c.wrapping_sub(b.rotate_left(24));
    c
}

/// Pin mode.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PinLock {
    /// Shared; other readers may pin too.
    Read,
    /// Exclusive.
    Write,
}

/// Accounting attributes the cache table keeps per node.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PairAttr {
    /// In-memory footprint in bytes.
    pub size: u64,
}

impl PairAttr {
    /// Attributes of `node` as it currently sits in memory.
    pub fn of(node: &Node) -> Self {
        Self {
            size: node.memory_size() as u64,
        }
    }
}

/// A node pinned in a cache table. Dropping it without going through
/// [`CacheTable::unpin`] releases the lock but skips dirty and size updates.
pub enum PinnedNode {
    /// Shared pin.
    Read {
        /// Key the node is pinned under.
        key: CacheKey,
        /// Held read lock.
        guard: ArcRwLockReadGuard<RawRwLock, Node>,
    },
    /// Exclusive pin.
    Write {
        /// Key the node is pinned under.
        key: CacheKey,
        /// Held write lock.
        guard: ArcRwLockWriteGuard<RawRwLock, Node>,
    },
}

impl PinnedNode {
    pub(crate) fn try_read(key: CacheKey, lock: &Arc<RwLock<Node>>) -> Option<Self> {
        lock.try_read_arc().map(|guard| PinnedNode::Read { key, guard })
    }

    pub(crate) fn try_write(key: CacheKey, lock: &Arc<RwLock<Node>>) -> Option<Self> {
        lock.try_write_arc().map(|guard| PinnedNode::Write { key, guard })
    }

    /// Key the node is pinned under.
    pub fn key(&self) -> &CacheKey {
        match self {
            PinnedNode::Read { key, .. } | PinnedNode::Write { key, .. } => key,
        }
    }

    /// Kind of pin held.
    pub fn lock(&self) -> PinLock {
        match self {
            PinnedNode::Read { .. } => PinLock::Read,
            PinnedNode::Write { .. } => PinLock::Write,
        }
    }

    /// Mutable access; `None` under a read pin.
    pub fn node_mut(&mut self) -> Option<&mut Node> {
        match self {
            PinnedNode::Read { .. } => None,
            PinnedNode::Write { guard, .. } => Some(&mut **guard),
        }
    }

    /// Turns a write pin into a read pin without letting other writers in.
    pub fn downgrade(self) -> Self {
        match self {
            PinnedNode::Write { key, guard } => PinnedNode::Read {
                key,
                guard: ArcRwLockWriteGuard::downgrade(guard),
            },
            read => read,
        }
    }
}

impl Deref for PinnedNode {
    type Target = Node;

    fn deref(&self) -> &Node {
        match self {
            PinnedNode::Read { guard, .. } => &**guard,
            PinnedNode::Write { guard, .. } => &**guard,
        }
    }
}

impl std::fmt::Debug for PinnedNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedNode")
            .field("key", self.key())
            .field("lock", &self.lock())
            .finish()
    }
}

/// Materializes nodes for a cache table.
pub trait NodeFetcher: Send + Sync {
    /// Reads and decodes the node for `key`, decoding what `policy` asks for.
    fn fetch(&self, key: &CacheKey, policy: &FetchPolicy) -> Result<(Node, PairAttr)>;

    /// True when `node` lacks a partition `policy` needs.
    fn partial_fetch_required(&self, node: &Node, policy: &FetchPolicy) -> bool;

    /// Brings in the partitions `policy` needs. Called under a write pin.
    fn partial_fetch(&self, node: &mut Node, policy: &FetchPolicy) -> Result<PairAttr>;

    /// Key order of the tree, when one is known.
    fn comparator(&self) -> Option<&dyn Comparator>;
}

/// A pin the caller already holds that the new pin depends on, and whether
/// the caller dirtied it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DependentPin {
    /// Node the caller already holds pinned.
    pub key: CacheKey,
    /// Whether the caller dirtied it.
    pub dirty: bool,
}

/// Node cache with per-node reader/writer pins.
pub trait CacheTable: Send + Sync {
    /// Pins `key`, fetching it on a miss and partially fetching what `policy`
    /// needs. Answers [`FtError::TryAgain`](crate::types::FtError::TryAgain)
    /// when the lock cannot be taken without waiting.
    fn get_and_pin(
        &self,
        key: &CacheKey,
        lock: PinLock,
        fetcher: &dyn NodeFetcher,
        policy: &FetchPolicy,
        deps: &[DependentPin],
    ) -> Result<PinnedNode>;

    /// Pins `key` only if it is resident, clean, and free.
    fn maybe_get_and_pin_clean(&self, key: &CacheKey, lock: PinLock) -> Result<Option<PinnedNode>>;

    /// Inserts a new node and returns it write-pinned.
    fn put(&self, key: CacheKey, node: Node, attr: PairAttr) -> Result<PinnedNode>;

    /// Releases a pin. `attr` replaces the stored attributes when given.
    fn unpin(&self, pinned: PinnedNode, dirty: bool, attr: Option<PairAttr>) -> Result<()>;

    /// Drops an unpinned, clean node. Returns whether anything was removed.
    fn evict(&self, key: &CacheKey) -> Result<bool>;

    /// Sets aside `fraction` of the memory not yet used or reserved and
    /// returns the number of bytes reserved.
    fn reserve_memory(&self, fraction: f64) -> u64;

    /// Returns bytes obtained from [`CacheTable::reserve_memory`].
    fn release_reserved_memory(&self, bytes: u64);
}
