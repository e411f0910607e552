//! Bytes to node, fully or partially.

use tracing::{debug, warn};

use crate::primitives::bytes::RBuf;
use crate::types::{layout, x1764, BlockNum, FtError, Msn, Result, TxnId};

use super::comparator::Comparator;
use super::context::FtContext;
use super::leafentry::LeafEntry;
use super::msg::{ChildBuffer, Message};
use super::node::{
    Basement, BlockRegion, Child, FetchPolicy, Node, Partition, PartitionState, PivotKeys,
    UpgradeStats,
};
use super::serialize::{header_len, BASEMENT_TAG, BUFFER_TAG};
use super::sub_block;
use super::upgrade;

/// Fields every serialized unit starts with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct UnitPrefix {
    pub leaf: bool,
    pub version: u32,
    pub original: u32,
    pub build_id: u32,
}

/// Length of [`UnitPrefix`] on disk.
pub(crate) const UNIT_PREFIX_LEN: usize = 8 + 4 + 4 + 4;

pub(crate) fn read_unit_prefix(r: &mut RBuf<'_>) -> Result<UnitPrefix> {
    let magic: [u8; 8] = r.get_array()?;
    let leaf = if magic == layout::LEAF_MAGIC {
        true
    } else if magic == layout::NODE_MAGIC {
        false
    } else {
        return Err(FtError::BadFormat("bad node magic"));
    };
    Ok(UnitPrefix {
        leaf,
        version: r.get_u32()?,
        original: r.get_u32()?,
        build_id: r.get_u32()?,
    })
}

fn is_current(version: u32) -> bool {
    (layout::LAYOUT_VERSION_MIN_CURRENT..=layout::LAYOUT_VERSION).contains(&version)
}

fn is_legacy(version: u32) -> bool {
    (layout::LAYOUT_VERSION_LEGACY_MIN..layout::LAYOUT_VERSION_MIN_CURRENT).contains(&version)
}

/// Decodes a node block, materializing the partitions `policy` asks for and
/// keeping the rest compressed.
///
/// Blocks written with an older layout go through the upgrade path and come
/// back fully decoded and dirty.
pub fn deserialize_node(
    bytes: &[u8],
    blocknum: BlockNum,
    policy: &FetchPolicy,
    cmp: Option<&dyn Comparator>,
    ctx: &FtContext,
) -> Result<Node> {
    let mut r = RBuf::new(bytes);
    let prefix = read_unit_prefix(&mut r)?;
    if is_legacy(prefix.version) {
        return upgrade::upgrade_legacy_node(bytes, blocknum, cmp, ctx);
    }
    if !is_current(prefix.version) {
        return Err(FtError::BadVersion(prefix.version));
    }
    let regions = read_header(&mut r, bytes)?;
    let mut node = read_info(&mut r, prefix, &regions, blocknum)?;

    for i in 0..node.children.len() {
        let region = regions[i];
        let framed = region_slice(bytes, region)?;
        node.children[i].state = if policy.wants(&node, i, cmp)? {
            let partition = decode_partition_frame(framed, node.height, cmp)?;
            PartitionState::Avail(with_watermark(partition, node.max_msn_applied_on_disk))
        } else {
            PartitionState::Compressed(framed.to_vec())
        };
    }
    debug!(
        blocknum = blocknum.0,
        height = node.height,
        children = node.children.len(),
        avail = node.children.iter().filter(|c| c.state.is_avail()).count(),
        "ft.deserialize"
    );
    Ok(node)
}

/// Decodes the header and node-info sub-block from a prefix of a node block.
///
/// Returns `Ok(None)` when the prefix is too short to hold both, or when the
/// block uses a legacy layout that can only be decoded whole. Every partition
/// of the returned node is [`PartitionState::OnDisk`].
pub fn deserialize_node_header(prefix_bytes: &[u8], blocknum: BlockNum) -> Result<Option<Node>> {
    if prefix_bytes.len() < UNIT_PREFIX_LEN + 4 {
        return Ok(None);
    }
    let mut r = RBuf::new(prefix_bytes);
    let prefix = read_unit_prefix(&mut r)?;
    if is_legacy(prefix.version) {
        return Ok(None);
    }
    if !is_current(prefix.version) {
        return Err(FtError::BadVersion(prefix.version));
    }
    let n_children = RBuf::new(&prefix_bytes[UNIT_PREFIX_LEN..]).get_u32()? as usize;
    let hlen = header_len(n_children);
    if prefix_bytes.len() < hlen + 8 {
        return Ok(None);
    }
    let info_sizes = sub_block::peek_sizes(&prefix_bytes[hlen..])?;
    if prefix_bytes.len() < hlen + info_sizes.framed() {
        return Ok(None);
    }
    let regions = read_header(&mut r, prefix_bytes)?;
    let node = read_info(&mut r, prefix, &regions, blocknum)?;
    debug!(blocknum = blocknum.0, height = node.height, "ft.deserialize.header");
    Ok(Some(node))
}

fn read_header(r: &mut RBuf<'_>, bytes: &[u8]) -> Result<Vec<BlockRegion>> {
    let n_children = r.get_u32()? as usize;
    if n_children == 0 {
        return Err(FtError::BadFormat("node without children"));
    }
    if n_children.saturating_mul(8) > r.remaining() {
        return Err(FtError::BadFormat("child count exceeds block"));
    }
    let mut regions = Vec::with_capacity(n_children);
    for _ in 0..n_children {
        regions.push(BlockRegion {
            start: r.get_u32()?,
            size: r.get_u32()?,
        });
    }
    let covered = r.position();
    let stored = r.get_u32()?;
    let computed = x1764(&bytes[..covered]);
    if stored != computed {
        warn!(stored, computed, "ft.checksum.mismatch.header");
        return Err(FtError::BadChecksum {
            what: "node header",
            stored,
            computed,
        });
    }
    Ok(regions)
}

fn read_info(
    r: &mut RBuf<'_>,
    prefix: UnitPrefix,
    regions: &[BlockRegion],
    blocknum: BlockNum,
) -> Result<Node> {
    let payload = sub_block::read_framed(r, "node info")?;
    let mut info = RBuf::new(&payload);
    let max_msn = Msn(info.get_u64()?);
    let flags = info.get_u32()?;
    let height = info.get_u32()?;
    let oldest = TxnId(info.get_u64()?);
    if prefix.leaf != (height == 0) {
        return Err(FtError::BadFormat("node magic does not match height"));
    }
    let n_children = regions.len();
    let mut pivots = PivotKeys::default();
    for _ in 0..n_children - 1 {
        pivots.push(info.get_len_bytes()?.to_vec());
    }
    let mut blocknums = vec![BlockNum::NULL; n_children];
    if height > 0 {
        for slot in &mut blocknums {
            *slot = BlockNum(info.get_u64()?);
        }
    }
    if !info.is_exhausted() {
        return Err(FtError::BadFormat("trailing bytes in node info"));
    }
    let children = blocknums
        .into_iter()
        .zip(regions)
        .map(|(blocknum, region)| Child {
            blocknum,
            state: PartitionState::OnDisk,
            region: Some(*region),
        })
        .collect();
    Ok(Node {
        blocknum,
        height,
        layout_version: prefix.version,
        layout_version_original: prefix.original,
        build_id: prefix.build_id,
        flags,
        max_msn_applied_on_disk: max_msn,
        dirty: false,
        fullhash: 0,
        oldest_referenced_xid: oldest,
        pivots,
        children,
        upgrade_stats: UpgradeStats::default(),
    })
}

fn region_slice(bytes: &[u8], region: BlockRegion) -> Result<&[u8]> {
    let start = region.start as usize;
    let end = start
        .checked_add(region.size as usize)
        .ok_or(FtError::BadFormat("partition region overflow"))?;
    bytes
        .get(start..end)
        .ok_or(FtError::BadFormat("partition region past end of block"))
}

fn with_watermark(partition: Partition, msn: Msn) -> Partition {
    match partition {
        Partition::Basement(mut bn) => {
            bn.max_msn_applied = msn;
            Partition::Basement(bn)
        }
        other => other,
    }
}

fn decode_partition_frame(
    framed: &[u8],
    height: u32,
    cmp: Option<&dyn Comparator>,
) -> Result<Partition> {
    let payload = sub_block::decode_framed(framed, "partition")?;
    decode_partition(&payload, height, cmp)
}

/// Decodes an uncompressed partition payload.
pub fn decode_partition(
    payload: &[u8],
    height: u32,
    cmp: Option<&dyn Comparator>,
) -> Result<Partition> {
    let mut r = RBuf::new(payload);
    let tag = r.get_u8()?;
    let n = r.get_u32()? as usize;
    let partition = match (tag, height) {
        (BASEMENT_TAG, 0) => {
            // smallest entry is 9 bytes
            if n.saturating_mul(9) > r.remaining() {
                return Err(FtError::BadFormat("entry count exceeds partition"));
            }
            let mut entries = Vec::with_capacity(n);
            for _ in 0..n {
                entries.push(LeafEntry::decode(&mut r)?);
            }
            Partition::Basement(Basement::new(entries))
        }
        (BUFFER_TAG, h) if h > 0 => {
            // smallest message is 19 bytes
            if n.saturating_mul(19) > r.remaining() {
                return Err(FtError::BadFormat("message count exceeds partition"));
            }
            let mut messages = Vec::with_capacity(n);
            for _ in 0..n {
                messages.push(Message::decode(&mut r)?);
            }
            Partition::Buffer(ChildBuffer::from_messages(messages, cmp))
        }
        _ => return Err(FtError::BadFormat("partition tag does not match height")),
    };
    if !r.is_exhausted() {
        return Err(FtError::BadFormat("trailing bytes in partition"));
    }
    Ok(partition)
}

/// Decodes partition `i` if it is resident but compressed.
pub fn decompress_partition(node: &mut Node, i: usize, cmp: Option<&dyn Comparator>) -> Result<()> {
    let height = node.height;
    let msn = node.max_msn_applied_on_disk;
    let child = node
        .children
        .get_mut(i)
        .ok_or(FtError::Invalid("child index out of range"))?;
    let partition = match &child.state {
        PartitionState::Avail(_) => return Ok(()),
        PartitionState::OnDisk => return Err(FtError::PartitionUnavailable(i)),
        PartitionState::Compressed(framed) => decode_partition_frame(framed, height, cmp)?,
    };
    child.state = PartitionState::Avail(with_watermark(partition, msn));
    Ok(())
}

/// Decodes partition `i` from the full block bytes the node was read from.
pub fn fetch_partition(
    node: &mut Node,
    i: usize,
    block: &[u8],
    cmp: Option<&dyn Comparator>,
) -> Result<()> {
    let region = match node.children.get(i) {
        Some(child) if matches!(child.state, PartitionState::OnDisk) => child
            .region
            .ok_or(FtError::Invalid("on-disk partition without a location"))?,
        Some(_) => return decompress_partition(node, i, cmp),
        None => return Err(FtError::Invalid("child index out of range")),
    };
    let partition = decode_partition_frame(region_slice(block, region)?, node.height, cmp)?;
    node.children[i].state =
        PartitionState::Avail(with_watermark(partition, node.max_msn_applied_on_disk));
    Ok(())
}
