//! Bottom-up construction of one tree from its merged, sorted rows.
//!
//! Leaves are cut by [`LeafClosePolicy`](crate::storage::options::LeafClosePolicy)
//! and written as soon as they close. Each leaf's largest key goes to a pivot
//! spill file together with its block number; internal levels are then built
//! one at a time from the previous level's spill file until a single root is
//! left.

use serde::Serialize;
use tracing::{debug, trace};

use crate::storage::ft::context::FtContext;
use crate::storage::ft::header::FileHeader;
use crate::storage::ft::leafentry::LeafEntry;
use crate::storage::ft::node::Node;
use crate::storage::ft::serialize::{serialize_node, SerializeOptions};
use crate::storage::options::TreeOptions;
use crate::types::{BlockNum, FtError, Result};

use super::dbout::Dbout;
use super::progress::Progress;
use super::tempfiles::{Fidx, SpillWriter, TempFiles};

/// What a fractal writer produced.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FractalStats {
    /// Rows written.
    pub rows: u64,
    /// Leaves written.
    pub leaves: u64,
    /// Nonleaf nodes written.
    pub internal_nodes: u64,
    /// Height of the root; 0 when the root is a leaf.
    pub height: u32,
    /// Blocknum of the root.
    pub root: u64,
    /// Bytes in the finished file.
    pub file_size: u64,
}

/// Splits `n` children into internal nodes of `fanout`.
///
/// Full groups are taken while at least two groups' worth remain; what is
/// left is one group if it fits, else two halves.
pub fn plan_groups(n: usize, fanout: usize) -> Vec<usize> {
    let fanout = fanout.max(2);
    let mut groups = Vec::with_capacity(n / fanout + 2);
    let mut left = n;
    while left >= 2 * fanout {
        groups.push(fanout);
        left -= fanout;
    }
    if left > fanout {
        groups.push(left.div_ceil(2));
        groups.push(left / 2);
    } else if left > 0 {
        groups.push(left);
    }
    groups
}

/// Streams sorted rows into leaves and finishes the tree above them.
pub struct FractalWriter<'a> {
    dbout: &'a Dbout,
    tree: &'a TreeOptions,
    ser: SerializeOptions,
    ctx: &'a FtContext,
    temp: &'a TempFiles,
    progress: &'a Progress,
    leaf: Vec<LeafEntry>,
    leaf_bytes: u64,
    remaining: u64,
    pivots: Option<(Fidx, SpillWriter)>,
    last_key: Option<Vec<u8>>,
    stats: FractalStats,
}

impl<'a> FractalWriter<'a> {
    /// Writer for a tree whose leaf entries total `total_bytes` on disk.
    pub(crate) fn new(
        dbout: &'a Dbout,
        tree: &'a TreeOptions,
        ctx: &'a FtContext,
        temp: &'a TempFiles,
        progress: &'a Progress,
        total_bytes: u64,
    ) -> Result<Self> {
        let pivots = Some(temp.create()?);
        Ok(Self {
            dbout,
            tree,
            ser: SerializeOptions::from_tree(tree),
            ctx,
            temp,
            progress,
            leaf: Vec::new(),
            leaf_bytes: 0,
            remaining: total_bytes,
            pivots,
            last_key: None,
            stats: FractalStats::default(),
        })
    }

    /// Adds the next row. Rows must arrive in ascending key order.
    pub fn add_row(&mut self, key: &[u8], val: &[u8]) -> Result<()> {
        let incoming = LeafEntry::clean_disk_size(key.len(), val.len()) as u64;
        let node_size = u64::from(self.tree.node_size);
        // rows beyond the announced total still count as remaining
        let remaining = self.remaining.max(incoming);
        if self
            .tree
            .leaf_close
            .should_close(node_size, self.leaf_bytes, incoming, remaining)
        {
            self.close_leaf()?;
        }
        self.leaf.push(LeafEntry::clean(key, val));
        self.leaf_bytes += incoming;
        self.remaining = self.remaining.saturating_sub(incoming);
        self.stats.rows += 1;
        Ok(())
    }

    fn close_leaf(&mut self) -> Result<()> {
        let entries = std::mem::take(&mut self.leaf);
        let Some(max_key) = entries.last().map(|e| e.key().to_vec()) else {
            return Ok(());
        };
        let rows = entries.len() as u64;
        let blocknum = self.dbout.allocate_blocknum();
        let mut node = Node::new_leaf(blocknum, entries);
        let written = serialize_node(&mut node, &self.ser, self.ctx)?;
        self.dbout.write_block(blocknum, &written.bytes)?;
        let (_, spill) = self
            .pivots
            .as_mut()
            .ok_or(FtError::Invalid("fractal writer already finished"))?;
        spill.write_row(&max_key, &blocknum.0.to_le_bytes())?;
        trace!(
            blocknum = blocknum.0,
            rows,
            bytes = self.leaf_bytes,
            basements = node.n_children(),
            "loader.fractal.leaf"
        );
        self.stats.leaves += 1;
        self.leaf_bytes = 0;
        self.last_key = Some(max_key);
        self.progress.advance(rows)
    }

    /// Closes the last leaf, builds the internal levels, and writes the
    /// file header. Returns the stats of the finished tree.
    pub fn finish(mut self) -> Result<FractalStats> {
        self.close_leaf()?;
        let (level, spill) = self
            .pivots
            .take()
            .ok_or(FtError::Invalid("fractal writer already finished"))?;
        let count = spill.finish()?;
        self.temp.set_rows(level, count);

        let root = if count == 0 {
            self.temp.unlink(level)?;
            let blocknum = self.dbout.allocate_blocknum();
            let mut node = Node::new_leaf(blocknum, Vec::new());
            let written = serialize_node(&mut node, &self.ser, self.ctx)?;
            self.dbout.write_block(blocknum, &written.bytes)?;
            self.stats.leaves = 1;
            blocknum
        } else {
            self.build_levels(level, count)?
        };
        self.stats.root = root.0;

        let header = FileHeader::new(
            self.tree.node_size,
            self.tree.basement_node_size,
            self.tree.compression,
            self.tree.fanout,
        );
        let header = self.dbout.finish(root, header)?;
        self.stats.file_size = header.file_size;
        Ok(self.stats)
    }

    fn build_levels(&mut self, mut level: Fidx, mut count: u64) -> Result<BlockNum> {
        let fanout = self.tree.fanout.max(2) as usize;
        let mut height = 0u32;
        loop {
            let mut reader = self.temp.open(level)?;
            if count == 1 {
                let (_, b) = reader
                    .next_row()?
                    .ok_or(FtError::BadFormat("pivot spill file is empty"))?;
                drop(reader);
                self.temp.unlink(level)?;
                self.stats.height = height;
                return decode_blocknum(&b);
            }
            height += 1;
            let groups = plan_groups(count as usize, fanout);
            let (next, mut spill) = self.temp.create()?;
            for &size in &groups {
                let mut children = Vec::with_capacity(size);
                let mut pivots = Vec::with_capacity(size);
                for _ in 0..size {
                    let (key, b) = reader
                        .next_row()?
                        .ok_or(FtError::BadFormat("pivot spill file ended early"))?;
                    children.push(decode_blocknum(&b)?);
                    pivots.push(key);
                }
                // the last child's max key bounds the node, it is not a pivot
                let max_key = pivots.pop().unwrap_or_default();
                let blocknum = self.dbout.allocate_blocknum();
                let mut node = Node::new_internal(blocknum, height, pivots, children)?;
                let written = serialize_node(&mut node, &self.ser, self.ctx)?;
                self.dbout.write_block(blocknum, &written.bytes)?;
                spill.write_row(&max_key, &blocknum.0.to_le_bytes())?;
                self.stats.internal_nodes += 1;
            }
            let written = spill.finish()?;
            self.temp.set_rows(next, written);
            drop(reader);
            self.temp.unlink(level)?;
            debug!(height, nodes = groups.len(), children = count, "loader.fractal.level");
            level = next;
            count = written;
        }
    }

    /// Largest key written so far.
    pub fn last_key(&self) -> Option<&[u8]> {
        self.last_key.as_deref()
    }
}

fn decode_blocknum(bytes: &[u8]) -> Result<BlockNum> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| FtError::BadFormat("bad block number in pivot spill file"))?;
    Ok(BlockNum(u64::from_le_bytes(raw)))
}
