//! Node to bytes.
//!
//! ```text
//! magic[8] | layout_version u32 | layout_version_original u32 | build_id u32
//! n_children u32 | n_children x { start u32, size u32 }
//! header_checksum u32
//! node-info sub-block
//! partition sub-block x n_children
//! zero padding to 512
//! ```

use rayon::prelude::*;
use tracing::debug;

use crate::primitives::bytes::WBuf;
use crate::primitives::compress::CompressionMethod;
use crate::storage::options::TreeOptions;
use crate::types::{layout, x1764, FtError, Msn, Result};

use super::context::FtContext;
use super::node::{Basement, Child, Node, Partition, PartitionState};
use super::sub_block::{self, SubBlock};

pub(crate) const BASEMENT_TAG: u8 = 0xBB;
pub(crate) const BUFFER_TAG: u8 = 0xAA;

/// Per-call serialization settings.
#[derive(Clone, Copy, Debug)]
pub struct SerializeOptions {
    /// Target uncompressed basement size used when rebalancing.
    pub basement_node_size: usize,
    /// Sub-block compression.
    pub compression: CompressionMethod,
    /// Repack leaf entries into basements of `basement_node_size`.
    pub rebalance: bool,
    /// Compress partitions on the context's pool when it has one.
    pub parallel: bool,
}

impl SerializeOptions {
    /// Settings derived from tree options, with rebalancing enabled.
    pub fn from_tree(opts: &TreeOptions) -> Self {
        Self {
            basement_node_size: opts.basement_node_size as usize,
            compression: opts.compression,
            rebalance: true,
            parallel: opts.parallel_serialize,
        }
    }
}

impl Default for SerializeOptions {
    fn default() -> Self {
        Self::from_tree(&TreeOptions::default())
    }
}

/// Output of [`serialize_node`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerializedNode {
    /// Block bytes, padded to the block alignment.
    pub bytes: Vec<u8>,
    /// Padded length.
    pub size: usize,
    /// Header plus every sub-block payload before compression.
    pub uncompressed_size: usize,
}

/// Length of the plain header for `n_children`, checksum included.
pub(crate) fn header_len(n_children: usize) -> usize {
    8 + 4 + 4 + 4 + 4 + 8 * n_children + 4
}

/// Serializes `node` into a self-describing block.
///
/// Leaves are rebalanced first when `opts.rebalance` is set. Partitions that
/// are still compressed are copied through unchanged unless rebalancing needs
/// them decoded. The output is identical with or without the worker pool.
pub fn serialize_node(
    node: &mut Node,
    opts: &SerializeOptions,
    ctx: &FtContext,
) -> Result<SerializedNode> {
    node.check_shape()?;
    if node.is_leaf() {
        if opts.rebalance {
            rebalance_leaf(node, opts.basement_node_size)?;
        }
        node.max_msn_applied_on_disk = node.max_msn_in_memory();
    }

    let method = opts.compression;
    let frames: Vec<(Vec<u8>, usize)> = match ctx.pool() {
        Some(pool) if opts.parallel && node.children.len() > 1 => pool.install(|| {
            node.children
                .par_iter()
                .enumerate()
                .map(|(i, child)| frame_child(i, child, method))
                .collect::<Result<Vec<_>>>()
        })?,
        _ => node
            .children
            .iter()
            .enumerate()
            .map(|(i, child)| frame_child(i, child, method))
            .collect::<Result<Vec<_>>>()?,
    };

    let info_payload = encode_info(node);
    let info = SubBlock::compress(method, &info_payload);

    let n_children = node.children.len();
    let hlen = header_len(n_children);
    let total: usize = hlen + info.framed_size() + frames.iter().map(|(f, _)| f.len()).sum::<usize>();
    let mut out = WBuf::with_capacity(layout::block_padded(total));
    out.put_bytes(if node.is_leaf() {
        &layout::LEAF_MAGIC
    } else {
        &layout::NODE_MAGIC
    });
    out.put_u32(layout::LAYOUT_VERSION);
    out.put_u32(node.layout_version_original);
    out.put_u32(layout::BUILD_ID);
    out.put_u32(n_children as u32);
    let mut start = hlen + info.framed_size();
    for (framed, _) in &frames {
        out.put_u32(start as u32);
        out.put_u32(framed.len() as u32);
        start += framed.len();
    }
    let checksum = x1764(out.as_slice());
    out.put_u32(checksum);
    debug_assert_eq!(out.len(), hlen);

    let uncompressed_size = hlen
        + info.uncompressed_size()
        + frames.iter().map(|(_, raw)| *raw).sum::<usize>();
    info.write_to(&mut out);
    for (framed, _) in &frames {
        out.put_bytes(framed);
    }
    out.pad_to(layout::BLOCK_ALIGNMENT);

    node.layout_version = layout::LAYOUT_VERSION;
    node.build_id = layout::BUILD_ID;
    let bytes = out.into_vec();
    debug!(
        blocknum = node.blocknum.0,
        height = node.height,
        children = n_children,
        size = bytes.len(),
        uncompressed_size,
        "ft.serialize"
    );
    Ok(SerializedNode {
        size: bytes.len(),
        bytes,
        uncompressed_size,
    })
}

fn frame_child(i: usize, child: &Child, method: CompressionMethod) -> Result<(Vec<u8>, usize)> {
    match &child.state {
        PartitionState::Avail(partition) => {
            let payload = encode_partition(partition);
            let block = SubBlock::compress(method, &payload);
            Ok((block.into_framed(), payload.len()))
        }
        PartitionState::Compressed(framed) => {
            let sizes = sub_block::peek_sizes(framed)?;
            Ok((framed.clone(), sizes.uncompressed))
        }
        PartitionState::OnDisk => Err(FtError::PartitionUnavailable(i)),
    }
}

/// Uncompressed payload of one partition.
pub fn encode_partition(partition: &Partition) -> Vec<u8> {
    match partition {
        Partition::Basement(bn) => {
            let mut out = WBuf::with_capacity(5 + bn.disk_size());
            out.put_u8(BASEMENT_TAG);
            out.put_u32(bn.entries.len() as u32);
            for entry in &bn.entries {
                entry.encode(&mut out);
            }
            out.into_vec()
        }
        Partition::Buffer(buffer) => {
            let mut out = WBuf::with_capacity(5 + buffer.disk_size());
            out.put_u8(BUFFER_TAG);
            out.put_u32(buffer.len() as u32);
            for msg in buffer.messages() {
                msg.encode(&mut out);
            }
            out.into_vec()
        }
    }
}

fn encode_info(node: &Node) -> Vec<u8> {
    let mut out = WBuf::with_capacity(
        8 + 4 + 4 + 8 + 4 * node.pivots.len() + node.pivots.total_size() + 8 * node.children.len(),
    );
    out.put_u64(node.max_msn_applied_on_disk.0);
    out.put_u32(node.flags);
    out.put_u32(node.height);
    out.put_u64(node.oldest_referenced_xid.0);
    for pivot in node.pivots.iter() {
        out.put_len_bytes(pivot);
    }
    if !node.is_leaf() {
        for child in &node.children {
            out.put_u64(child.blocknum.0);
        }
    }
    out.into_vec()
}

/// Repacks every leaf entry into basements of at most `basement_size` bytes.
///
/// Packing is greedy from the left; a basement closes only once it holds an
/// entry, so an oversized entry gets a basement of its own. Every new
/// basement carries the highest msn of the old ones.
pub fn rebalance_leaf(node: &mut Node, basement_size: usize) -> Result<()> {
    if !node.is_leaf() {
        return Err(FtError::Invalid("only leaves are rebalanced"));
    }
    if let Some(i) = (0..node.n_children()).find(|&i| node.basement(i).is_none()) {
        return Err(FtError::PartitionUnavailable(i));
    }
    let mut max_msn = Msn::MIN;
    let mut entries = Vec::new();
    for child in std::mem::take(&mut node.children) {
        if let PartitionState::Avail(Partition::Basement(bn)) = child.state {
            max_msn = max_msn.max(bn.max_msn_applied);
            entries.extend(bn.entries);
        }
    }

    let mut basements = Vec::new();
    let mut current = Vec::new();
    let mut current_size = 0usize;
    for entry in entries {
        let size = entry.disk_size();
        if !current.is_empty() && current_size + size > basement_size {
            basements.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size += size;
        current.push(entry);
    }
    basements.push(current);

    let rebuilt = Node::leaf_from_basements(
        node.blocknum,
        basements
            .into_iter()
            .map(|entries| Basement {
                entries,
                max_msn_applied: max_msn,
            })
            .collect(),
    );
    node.pivots = rebuilt.pivots;
    node.children = rebuilt.children;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ft::leafentry::LeafEntry;
    use crate::types::BlockNum;

    fn leaf(n: usize) -> Node {
        let entries = (0..n)
            .map(|i| LeafEntry::clean(format!("key{i:04}").into_bytes(), vec![i as u8; 20]))
            .collect();
        Node::new_leaf(BlockNum(5), entries)
    }

    #[test]
    fn rebalance_packs_greedily_and_keeps_msn() {
        let mut node = leaf(10);
        node.basement_mut(0).unwrap().max_msn_applied = Msn(42);
        // each entry is 9 + 7 + 20 = 36 bytes
        rebalance_leaf(&mut node, 100).unwrap();
        let sizes: Vec<_> = (0..node.n_children())
            .map(|i| node.basement(i).unwrap().entries.len())
            .collect();
        assert_eq!(sizes, vec![2, 2, 2, 2, 2]);
        assert!((0..node.n_children()).all(|i| node.basement(i).unwrap().max_msn_applied == Msn(42)));
        assert_eq!(node.pivots.get(0), Some(&b"key0001"[..]));
    }

    #[test]
    fn oversized_entry_gets_its_own_basement() {
        let mut node = Node::new_leaf(
            BlockNum(5),
            vec![
                LeafEntry::clean(b"a".to_vec(), vec![0; 500]),
                LeafEntry::clean(b"b".to_vec(), vec![0; 1]),
            ],
        );
        rebalance_leaf(&mut node, 64).unwrap();
        assert_eq!(node.n_children(), 2);
        assert!(node.children.iter().all(|c| c.state.is_avail()));
        for i in 0..2 {
            assert_eq!(node.basement(i).unwrap().entries.len(), 1);
        }
    }

    #[test]
    fn empty_leaf_keeps_one_basement() {
        let mut node = Node::new_leaf(BlockNum(5), Vec::new());
        let out = serialize_node(&mut node, &SerializeOptions::default(), &FtContext::serial())
            .unwrap();
        assert_eq!(node.n_children(), 1);
        assert_eq!(out.size % layout::BLOCK_ALIGNMENT, 0);
    }

    #[test]
    fn header_layout_and_checksum() {
        let mut node = leaf(3);
        let out = serialize_node(&mut node, &SerializeOptions::default(), &FtContext::serial())
            .unwrap();
        let bytes = &out.bytes;
        assert_eq!(&bytes[..8], &layout::LEAF_MAGIC);
        assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), layout::LAYOUT_VERSION);
        assert_eq!(u32::from_le_bytes(bytes[16..20].try_into().unwrap()), layout::BUILD_ID);
        let n = u32::from_le_bytes(bytes[20..24].try_into().unwrap()) as usize;
        assert_eq!(n, 1);
        let hlen = header_len(n);
        let stored = u32::from_le_bytes(bytes[hlen - 4..hlen].try_into().unwrap());
        assert_eq!(stored, x1764(&bytes[..hlen - 4]));
        let start = u32::from_le_bytes(bytes[24..28].try_into().unwrap()) as usize;
        let size = u32::from_le_bytes(bytes[28..32].try_into().unwrap()) as usize;
        assert!(start > hlen);
        assert!(start + size <= out.size);
        assert!(bytes[start + size..].iter().all(|&b| b == 0));
    }

    #[test]
    fn parallel_and_serial_output_match() {
        let ctx = FtContext::with_threads(4).unwrap();
        let opts = SerializeOptions {
            basement_node_size: 128,
            ..SerializeOptions::default()
        };
        let mut a = leaf(64);
        let mut b = leaf(64);
        let parallel = serialize_node(&mut a, &opts, &ctx).unwrap();
        let serial = serialize_node(
            &mut b,
            &SerializeOptions {
                parallel: false,
                ..opts
            },
            &ctx,
        )
        .unwrap();
        assert!(a.n_children() > 4);
        assert_eq!(parallel, serial);
    }

    #[test]
    fn on_disk_partition_cannot_be_written() {
        let mut node = leaf(2);
        node.children[0].state = PartitionState::OnDisk;
        let opts = SerializeOptions {
            rebalance: false,
            ..SerializeOptions::default()
        };
        let err = serialize_node(&mut node, &opts, &FtContext::serial()).unwrap_err();
        assert!(matches!(err, FtError::PartitionUnavailable(0)));
    }
}
