//! In-memory tree nodes and their partitions.

use std::cmp::Ordering;

use crate::types::{layout, BlockNum, FtError, Msn, Result, TxnId};

use super::comparator::Comparator;
use super::leafentry::LeafEntry;
use super::msg::ChildBuffer;

/// Pivot keys of a node plus their summed length.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PivotKeys {
    keys: Vec<Vec<u8>>,
    total_size: usize,
}

impl PivotKeys {
    /// Builds pivots from owned keys.
    pub fn new(keys: Vec<Vec<u8>>) -> Self {
        let total_size = keys.iter().map(Vec::len).sum();
        Self { keys, total_size }
    }

    /// Number of pivots.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True when there are no pivots.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Pivot `i`.
    pub fn get(&self, i: usize) -> Option<&[u8]> {
        self.keys.get(i).map(Vec::as_slice)
    }

    /// Iterates over pivots in order.
    pub fn iter(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.keys.iter().map(Vec::as_slice)
    }

    /// Appends a pivot.
    pub fn push(&mut self, key: Vec<u8>) {
        self.total_size += key.len();
        self.keys.push(key);
    }

    /// Sum of all pivot lengths.
    pub fn total_size(&self) -> usize {
        self.total_size
    }
}

/// Leaf partition: key-ordered, key-unique entries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Basement {
    /// Entries in key order.
    pub entries: Vec<LeafEntry>,
    /// Highest msn whose effect is reflected in `entries`.
    pub max_msn_applied: Msn,
}

impl Basement {
    /// Basement holding `entries`.
    pub fn new(entries: Vec<LeafEntry>) -> Self {
        Self {
            entries,
            max_msn_applied: Msn::MIN,
        }
    }

    /// Serialized size of the entries.
    pub fn disk_size(&self) -> usize {
        self.entries.iter().map(LeafEntry::disk_size).sum()
    }

    /// Largest key, if any.
    pub fn max_key(&self) -> Option<&[u8]> {
        self.entries.last().map(LeafEntry::key)
    }
}

/// Materialized partition contents.
#[derive(Clone, Debug, PartialEq)]
pub enum Partition {
    /// Leaf entries.
    Basement(Basement),
    /// Buffered messages for an internal child.
    Buffer(ChildBuffer),
}

impl Partition {
    fn memory_size(&self) -> usize {
        match self {
            Partition::Basement(bn) => {
                bn.disk_size() + bn.entries.len() * std::mem::size_of::<LeafEntry>()
            }
            Partition::Buffer(buffer) => buffer.memory_size(),
        }
    }
}

/// Residency of one partition.
#[derive(Clone, Debug, PartialEq)]
pub enum PartitionState {
    /// Only the location inside the node block is known.
    OnDisk,
    /// The framed sub-block is resident but not decoded.
    Compressed(Vec<u8>),
    /// Decoded.
    Avail(Partition),
}

impl PartitionState {
    /// True when decoded.
    pub fn is_avail(&self) -> bool {
        matches!(self, PartitionState::Avail(_))
    }
}

/// Where a partition's sub-block lives inside its node block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockRegion {
    /// Offset from the start of the node block.
    pub start: u32,
    /// Framed length.
    pub size: u32,
}

/// One child slot of a node.
#[derive(Clone, Debug, PartialEq)]
pub struct Child {
    /// Child node (internal nodes only).
    pub blocknum: BlockNum,
    /// Partition residency.
    pub state: PartitionState,
    /// Location of the partition in the block this node was read from.
    pub region: Option<BlockRegion>,
}

/// Aggregate statistics recovered from legacy subtree estimates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpgradeStats {
    /// Estimated rows below the node.
    pub rows: u64,
    /// Estimated bytes below the node.
    pub bytes: u64,
}

/// In-memory tree node.
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    /// Block number in the translation table.
    pub blocknum: BlockNum,
    /// 0 for leaves.
    pub height: u32,
    /// Layout version this node was read with, or will be written with.
    pub layout_version: u32,
    /// Layout version the node was first written with.
    pub layout_version_original: u32,
    /// Build id of the writer.
    pub build_id: u32,
    /// Opaque node flags.
    pub flags: u32,
    /// Highest msn applied to this node as stored on disk.
    pub max_msn_applied_on_disk: Msn,
    /// Needs writing.
    pub dirty: bool,
    /// Cache table hash of `(file, blocknum)`.
    pub fullhash: u32,
    /// Oldest transaction still referenced by this node's messages.
    pub oldest_referenced_xid: TxnId,
    /// `children.len() - 1` separator keys.
    pub pivots: PivotKeys,
    /// Child slots.
    pub children: Vec<Child>,
    /// Statistics folded in from a layout upgrade.
    pub upgrade_stats: UpgradeStats,
}

impl Node {
    fn empty(blocknum: BlockNum, height: u32) -> Self {
        Self {
            blocknum,
            height,
            layout_version: layout::LAYOUT_VERSION,
            layout_version_original: layout::LAYOUT_VERSION,
            build_id: layout::BUILD_ID,
            flags: 0,
            max_msn_applied_on_disk: Msn::MIN,
            dirty: true,
            fullhash: 0,
            oldest_referenced_xid: TxnId::NONE,
            pivots: PivotKeys::default(),
            children: Vec::new(),
            upgrade_stats: UpgradeStats::default(),
        }
    }

    /// Leaf with a single basement holding `entries`.
    pub fn new_leaf(blocknum: BlockNum, entries: Vec<LeafEntry>) -> Self {
        Self::leaf_from_basements(blocknum, vec![Basement::new(entries)])
    }

    /// Leaf with the given basements; pivots are each basement's largest key.
    pub fn leaf_from_basements(blocknum: BlockNum, basements: Vec<Basement>) -> Self {
        let mut node = Self::empty(blocknum, 0);
        let last = basements.len().saturating_sub(1);
        for (i, bn) in basements.into_iter().enumerate() {
            if i < last {
                node.pivots
                    .push(bn.max_key().map(<[u8]>::to_vec).unwrap_or_default());
            }
            node.children.push(Child {
                blocknum: BlockNum::NULL,
                state: PartitionState::Avail(Partition::Basement(bn)),
                region: None,
            });
        }
        node
    }

    /// Internal node over `children` with empty buffers.
    pub fn new_internal(
        blocknum: BlockNum,
        height: u32,
        pivots: Vec<Vec<u8>>,
        children: Vec<BlockNum>,
    ) -> Result<Self> {
        if height == 0 {
            return Err(FtError::Invalid("internal node needs height > 0"));
        }
        if children.is_empty() || pivots.len() + 1 != children.len() {
            return Err(FtError::Invalid("internal node needs one pivot fewer than children"));
        }
        let mut node = Self::empty(blocknum, height);
        node.pivots = PivotKeys::new(pivots);
        node.children = children
            .into_iter()
            .map(|blocknum| Child {
                blocknum,
                state: PartitionState::Avail(Partition::Buffer(ChildBuffer::new())),
                region: None,
            })
            .collect();
        Ok(node)
    }

    /// True for height 0.
    pub fn is_leaf(&self) -> bool {
        self.height == 0
    }

    /// Number of children.
    pub fn n_children(&self) -> usize {
        self.children.len()
    }

    /// Decoded basement `i`, if available.
    pub fn basement(&self, i: usize) -> Option<&Basement> {
        match self.children.get(i).map(|c| &c.state) {
            Some(PartitionState::Avail(Partition::Basement(bn))) => Some(bn),
            _ => None,
        }
    }

    /// Mutable decoded basement `i`, if available.
    pub fn basement_mut(&mut self, i: usize) -> Option<&mut Basement> {
        match self.children.get_mut(i).map(|c| &mut c.state) {
            Some(PartitionState::Avail(Partition::Basement(bn))) => Some(bn),
            _ => None,
        }
    }

    /// Decoded child buffer `i`, if available.
    pub fn buffer(&self, i: usize) -> Option<&ChildBuffer> {
        match self.children.get(i).map(|c| &c.state) {
            Some(PartitionState::Avail(Partition::Buffer(buffer))) => Some(buffer),
            _ => None,
        }
    }

    /// Mutable decoded child buffer `i`, if available.
    pub fn buffer_mut(&mut self, i: usize) -> Option<&mut ChildBuffer> {
        match self.children.get_mut(i).map(|c| &mut c.state) {
            Some(PartitionState::Avail(Partition::Buffer(buffer))) => Some(buffer),
            _ => None,
        }
    }

    /// True when every partition is decoded.
    pub fn all_avail(&self) -> bool {
        self.children.iter().all(|c| c.state.is_avail())
    }

    /// Index of the child whose key range holds `key`: the first child whose
    /// pivot is not less than `key`, else the last child.
    pub fn child_for_key(&self, cmp: &dyn Comparator, key: &[u8]) -> usize {
        self.pivots
            .iter()
            .position(|pivot| cmp.compare(key, pivot) != Ordering::Greater)
            .unwrap_or_else(|| self.children.len().saturating_sub(1))
    }

    /// Highest basement msn, or the node watermark for internal nodes.
    pub fn max_msn_in_memory(&self) -> Msn {
        let mut msn = self.max_msn_applied_on_disk;
        for i in 0..self.children.len() {
            if let Some(bn) = self.basement(i) {
                msn = msn.max(bn.max_msn_applied);
            }
        }
        msn
    }

    /// Approximate heap footprint used for cache accounting.
    pub fn memory_size(&self) -> usize {
        let mut size = std::mem::size_of::<Node>()
            + self.pivots.total_size()
            + self.children.len() * std::mem::size_of::<Child>();
        for child in &self.children {
            size += match &child.state {
                PartitionState::OnDisk => 0,
                PartitionState::Compressed(bytes) => bytes.len(),
                PartitionState::Avail(partition) => partition.memory_size(),
            };
        }
        size
    }

    /// Checks the structural invariants that do not need key comparisons.
    pub fn check_shape(&self) -> Result<()> {
        if self.children.is_empty() {
            return Err(FtError::BadFormat("node without children"));
        }
        if self.pivots.len() + 1 != self.children.len() {
            return Err(FtError::BadFormat("pivot count does not match child count"));
        }
        if self.pivots.total_size() != self.pivots.iter().map(<[u8]>::len).sum::<usize>() {
            return Err(FtError::BadFormat("pivot size total out of sync"));
        }
        for child in &self.children {
            let ok = match &child.state {
                PartitionState::Avail(Partition::Basement(_)) => self.is_leaf(),
                PartitionState::Avail(Partition::Buffer(_)) => !self.is_leaf(),
                _ => true,
            };
            if !ok {
                return Err(FtError::BadFormat("partition kind does not match height"));
            }
        }
        Ok(())
    }
}

/// Which partitions a read should decode.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum FetchPolicy {
    /// Decode nothing; partitions are left compressed or on disk.
    #[default]
    None,
    /// Decode everything.
    All,
    /// Decode the partition whose range holds the key.
    Key(Vec<u8>),
    /// Decode the partitions overlapping the range; `None` is unbounded.
    Range {
        /// Inclusive lower bound.
        left: Option<Vec<u8>>,
        /// Inclusive upper bound.
        right: Option<Vec<u8>>,
    },
}

impl FetchPolicy {
    /// Whether `child` of `node` should be decoded.
    pub fn wants(&self, node: &Node, child: usize, cmp: Option<&dyn Comparator>) -> Result<bool> {
        match self {
            FetchPolicy::None => Ok(false),
            FetchPolicy::All => Ok(true),
            FetchPolicy::Key(key) => {
                let cmp = cmp.ok_or(FtError::Invalid("fetch by key needs a comparator"))?;
                Ok(node.child_for_key(cmp, key) == child)
            }
            FetchPolicy::Range { left, right } => {
                let cmp = cmp.ok_or(FtError::Invalid("fetch by range needs a comparator"))?;
                let lo = left.as_deref().map_or(0, |k| node.child_for_key(cmp, k));
                let hi = right
                    .as_deref()
                    .map_or(node.n_children().saturating_sub(1), |k| {
                        node.child_for_key(cmp, k)
                    });
                Ok(lo <= child && child <= hi)
            }
        }
    }
}
