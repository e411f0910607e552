//! Decoding of the combined node layout used by versions 14 through 19.
//!
//! The whole node body is split into sub-blocks that are compressed
//! independently but only make sense concatenated:
//!
//! ```text
//! magic | version u32 | original u32 | build_id u32
//! n_sub_blocks u32 | n_sub_blocks × { compressed_size u32, uncompressed_size u32, checksum u32 }
//! header_checksum u32
//! compressed bodies, concatenated
//! ```
//!
//! Upgraded nodes come back fully decoded, dirty, and stamped with the current
//! layout version so the next write uses the partitioned layout.

use tracing::{debug, warn};

use crate::primitives::bytes::RBuf;
use crate::primitives::compress;
use crate::types::{layout, x1764, BlockNum, FtError, Msn, Result, TxnId};

use super::comparator::Comparator;
use super::context::FtContext;
use super::deserialize::read_unit_prefix;
use super::leafentry::{LeafEntry, TxnRecord};
use super::msg::{ChildBuffer, Message, MessageType};
use super::node::{Basement, Child, Node, Partition, PartitionState, PivotKeys, UpgradeStats};
use super::sub_block::SubBlockMap;

const LEGACY_CLEAN: u8 = 0;
const LEGACY_MVCC: u8 = 1;
const LEGACY_INSERT: u8 = 1;
const LEGACY_DELETE: u8 = 2;

/// Upper bound on sub-blocks in one legacy node.
const MAX_SUB_BLOCKS: usize = 256;
const MAX_LEGACY_BODY: usize = 1 << 30;

struct LegacyEstimate {
    nkeys: u64,
    dsize: u64,
}

/// Decodes a legacy node and upgrades it to the in-memory form of the current
/// layout.
pub fn upgrade_legacy_node(
    bytes: &[u8],
    blocknum: BlockNum,
    cmp: Option<&dyn Comparator>,
    ctx: &FtContext,
) -> Result<Node> {
    let mut r = RBuf::new(bytes);
    let prefix = read_unit_prefix(&mut r)?;
    let body = read_body(&mut r, bytes)?;

    let mut b = RBuf::new(&body);
    let flags = b.get_u32()?;
    let height = b.get_u32()?;
    // optimized-for-upgrade flag, no longer meaningful
    let _ = b.get_u32()?;
    if prefix.leaf != (height == 0) {
        return Err(FtError::BadFormat("node magic does not match height"));
    }
    let n_children = b.get_u32()? as usize;
    if n_children == 0 {
        return Err(FtError::BadFormat("node without children"));
    }
    // an estimate is 25 bytes
    if n_children.saturating_mul(25) > b.remaining() {
        return Err(FtError::BadFormat("child count exceeds node body"));
    }
    let mut stats = UpgradeStats::default();
    for _ in 0..n_children {
        let est = read_estimate(&mut b)?;
        stats.rows = stats.rows.saturating_add(est.nkeys);
        stats.bytes = stats.bytes.saturating_add(est.dsize);
    }
    let mut pivots = PivotKeys::default();
    for _ in 0..n_children - 1 {
        pivots.push(b.get_len_bytes()?.to_vec());
    }
    let mut blocknums = vec![BlockNum::NULL; n_children];
    if height > 0 {
        for slot in &mut blocknums {
            *slot = BlockNum(b.get_u64()?);
        }
    }
    let mut maps = Vec::with_capacity(n_children);
    for i in 0..n_children {
        let map = SubBlockMap::decode(&mut b)?;
        if map.idx as usize != i {
            return Err(FtError::BadFormat("sub-block map out of order"));
        }
        maps.push(map);
    }
    let region = b.take(b.remaining())?;

    let mut node = Node {
        blocknum,
        height,
        layout_version: layout::LAYOUT_VERSION,
        layout_version_original: prefix.original,
        build_id: prefix.build_id,
        flags,
        max_msn_applied_on_disk: Msn::MIN,
        dirty: true,
        fullhash: 0,
        oldest_referenced_xid: TxnId::NONE,
        pivots,
        children: Vec::with_capacity(n_children),
        upgrade_stats: stats,
    };

    if height == 0 {
        let watermark = ctx.upgrade_watermark();
        for map in &maps {
            let mut bn = Basement::new(read_legacy_entries(map.slice(region)?)?);
            bn.max_msn_applied = watermark;
            node.children.push(Child {
                blocknum: BlockNum::NULL,
                state: PartitionState::Avail(Partition::Basement(bn)),
                region: None,
            });
        }
        node.max_msn_applied_on_disk = watermark;
    } else {
        let mut buffers = Vec::with_capacity(n_children);
        for map in &maps {
            buffers.push(read_legacy_messages(map.slice(region)?)?);
        }
        let count: usize = buffers.iter().map(Vec::len).sum();
        let (low, high) = ctx.reserve_upgrade_msns(count as u64)?;
        let mut next = low.0;
        for (messages, blocknum) in buffers.iter_mut().zip(&blocknums) {
            for msg in messages.iter_mut() {
                next += 1;
                msg.msn = Msn(next);
            }
            node.children.push(Child {
                blocknum: *blocknum,
                state: PartitionState::Avail(Partition::Buffer(ChildBuffer::from_messages(
                    std::mem::take(messages),
                    cmp,
                ))),
                region: None,
            });
        }
        node.max_msn_applied_on_disk = high;
    }

    debug!(
        blocknum = blocknum.0,
        from_version = prefix.version,
        height,
        children = n_children,
        rows = node.upgrade_stats.rows,
        "ft.upgrade"
    );
    Ok(node)
}

fn read_body(r: &mut RBuf<'_>, bytes: &[u8]) -> Result<Vec<u8>> {
    let n = r.get_u32()? as usize;
    if n == 0 || n > MAX_SUB_BLOCKS {
        return Err(FtError::BadFormat("bad legacy sub-block count"));
    }
    let mut sizes = Vec::with_capacity(n);
    for _ in 0..n {
        sizes.push((r.get_u32()? as usize, r.get_u32()? as usize, r.get_u32()?));
    }
    let covered = r.position();
    let stored = r.get_u32()?;
    let computed = x1764(&bytes[..covered]);
    if stored != computed {
        warn!(stored, computed, "ft.checksum.mismatch.header");
        return Err(FtError::BadChecksum {
            what: "legacy node header",
            stored,
            computed,
        });
    }
    let total: usize = sizes.iter().map(|s| s.1).sum();
    if total > MAX_LEGACY_BODY {
        return Err(FtError::BadFormat("legacy node body too large"));
    }
    let mut body = vec![0u8; total];
    let mut at = 0;
    for (compressed_size, uncompressed_size, stored) in sizes {
        let compressed = r.take(compressed_size)?;
        let computed = x1764(compressed);
        if stored != computed {
            warn!(stored, computed, "ft.checksum.mismatch");
            return Err(FtError::BadChecksum {
                what: "legacy sub-block",
                stored,
                computed,
            });
        }
        compress::decompress(&mut body[at..at + uncompressed_size], compressed)?;
        at += uncompressed_size;
    }
    Ok(body)
}

fn read_estimate(r: &mut RBuf<'_>) -> Result<LegacyEstimate> {
    let nkeys = r.get_u64()?;
    let _ndata = r.get_u64()?;
    let dsize = r.get_u64()?;
    let _exact = r.get_u8()?;
    Ok(LegacyEstimate { nkeys, dsize })
}

fn read_legacy_messages(payload: &[u8]) -> Result<Vec<Message>> {
    let mut r = RBuf::new(payload);
    let n = r.get_u32()? as usize;
    // smallest legacy message is 10 bytes
    if n.saturating_mul(10) > r.remaining() {
        return Err(FtError::BadFormat("message count exceeds partition"));
    }
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let kind = MessageType::from_u8(r.get_u8()?)?;
        let n_xids = r.get_u8()? as usize;
        let mut xids = Vec::with_capacity(n_xids);
        for _ in 0..n_xids {
            xids.push(TxnId(r.get_u64()?));
        }
        out.push(Message {
            kind,
            msn: Msn::MIN,
            xids,
            key: r.get_len_bytes()?.to_vec(),
            val: r.get_len_bytes()?.to_vec(),
            fresh: true,
        });
    }
    if !r.is_exhausted() {
        return Err(FtError::BadFormat("trailing bytes in legacy partition"));
    }
    Ok(out)
}

fn read_legacy_entries(payload: &[u8]) -> Result<Vec<LeafEntry>> {
    let mut r = RBuf::new(payload);
    let n = r.get_u32()? as usize;
    if n.saturating_mul(9) > r.remaining() {
        return Err(FtError::BadFormat("entry count exceeds partition"));
    }
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let kind = r.get_u8()?;
        let key = r.get_len_bytes()?.to_vec();
        let entry = match kind {
            LEGACY_CLEAN => LeafEntry::Clean {
                key,
                val: r.get_len_bytes()?.to_vec(),
            },
            LEGACY_MVCC => {
                let n_records = r.get_u8()? as usize;
                if n_records == 0 {
                    return Err(FtError::BadFormat("mvcc leaf entry without records"));
                }
                let mut committed = Vec::new();
                let mut provisional = Vec::new();
                for _ in 0..n_records {
                    let xid = TxnId(r.get_u64()?);
                    let is_committed = r.get_u8()? != 0;
                    let record = match r.get_u8()? {
                        LEGACY_INSERT => TxnRecord::insert(xid, r.get_len_bytes()?),
                        LEGACY_DELETE => TxnRecord::delete(xid),
                        _ => return Err(FtError::BadFormat("bad legacy record kind")),
                    };
                    if is_committed {
                        committed.push(record);
                    } else {
                        provisional.push(record);
                    }
                }
                LeafEntry::Mvcc {
                    key,
                    committed,
                    provisional,
                }
            }
            _ => return Err(FtError::BadFormat("bad legacy leaf entry kind")),
        };
        out.push(entry);
    }
    if !r.is_exhausted() {
        return Err(FtError::BadFormat("trailing bytes in legacy partition"));
    }
    Ok(out)
}
