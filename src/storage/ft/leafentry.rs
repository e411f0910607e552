//! Leaf entries as stored in basement partitions.
//!
//! ```text
//! clean: 1 u8 | key_len u32 | val_len u32 | key | val
//! mvcc:  2 u8 | key_len u32 | n_committed u32 | n_provisional u8 | key | records
//! record: xid u64 | kind u8 (1 insert, 2 delete) | [val_len u32 | val]
//! ```
//!
//! Committed records are listed oldest first, provisional records outermost
//! transaction first. Visibility is not interpreted here.

use crate::primitives::bytes::{RBuf, WBuf};
use crate::types::{FtError, Result, TxnId};

const TAG_CLEAN: u8 = 1;
const TAG_MVCC: u8 = 2;
const RECORD_INSERT: u8 = 1;
const RECORD_DELETE: u8 = 2;

/// One version in an MVCC leaf entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxnRecord {
    /// Transaction that wrote the record.
    pub xid: TxnId,
    /// What the transaction did.
    pub op: TxnOp,
}

/// Operation recorded by a [`TxnRecord`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxnOp {
    /// The key maps to this value.
    Insert(Vec<u8>),
    /// The key was deleted.
    Delete,
}

impl TxnRecord {
    /// Insert record.
    pub fn insert(xid: TxnId, val: impl Into<Vec<u8>>) -> Self {
        Self {
            xid,
            op: TxnOp::Insert(val.into()),
        }
    }

    /// Delete record.
    pub fn delete(xid: TxnId) -> Self {
        Self {
            xid,
            op: TxnOp::Delete,
        }
    }

    fn disk_size(&self) -> usize {
        match &self.op {
            TxnOp::Insert(val) => 8 + 1 + 4 + val.len(),
            TxnOp::Delete => 8 + 1,
        }
    }

    fn encode(&self, out: &mut WBuf) {
        out.put_u64(self.xid.0);
        match &self.op {
            TxnOp::Insert(val) => {
                out.put_u8(RECORD_INSERT);
                out.put_len_bytes(val);
            }
            TxnOp::Delete => out.put_u8(RECORD_DELETE),
        }
    }

    fn decode(r: &mut RBuf<'_>) -> Result<Self> {
        let xid = TxnId(r.get_u64()?);
        let op = match r.get_u8()? {
            RECORD_INSERT => TxnOp::Insert(r.get_len_bytes()?.to_vec()),
            RECORD_DELETE => TxnOp::Delete,
            _ => return Err(FtError::BadFormat("unknown leaf entry record kind")),
        };
        Ok(Self { xid, op })
    }
}

/// A key and its committed and provisional values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeafEntry {
    /// Exactly one committed value and nothing in flight.
    Clean {
        /// Entry key.
        key: Vec<u8>,
        /// Committed value.
        val: Vec<u8>,
    },
    /// Committed history plus a provisional chain.
    Mvcc {
        /// Entry key.
        key: Vec<u8>,
        /// Committed records, oldest first.
        committed: Vec<TxnRecord>,
        /// Provisional records, outermost first.
        provisional: Vec<TxnRecord>,
    },
}

impl LeafEntry {
    /// Clean entry.
    pub fn clean(key: impl Into<Vec<u8>>, val: impl Into<Vec<u8>>) -> Self {
        LeafEntry::Clean {
            key: key.into(),
            val: val.into(),
        }
    }

    /// Entry key.
    pub fn key(&self) -> &[u8] {
        match self {
            LeafEntry::Clean { key, .. } | LeafEntry::Mvcc { key, .. } => key,
        }
    }

    /// The newest committed value, ignoring provisional records. `None` when
    /// the newest committed record is a delete.
    pub fn committed_value(&self) -> Option<&[u8]> {
        match self {
            LeafEntry::Clean { val, .. } => Some(val),
            LeafEntry::Mvcc { committed, .. } => match committed.last().map(|r| &r.op) {
                Some(TxnOp::Insert(val)) => Some(val),
                _ => None,
            },
        }
    }

    /// Bytes this entry occupies in a serialized basement.
    pub fn disk_size(&self) -> usize {
        match self {
            LeafEntry::Clean { key, val } => 1 + 4 + 4 + key.len() + val.len(),
            LeafEntry::Mvcc {
                key,
                committed,
                provisional,
            } => {
                1 + 4
                    + 4
                    + 1
                    + key.len()
                    + committed
                        .iter()
                        .chain(provisional)
                        .map(TxnRecord::disk_size)
                        .sum::<usize>()
            }
        }
    }

    /// Serialized size of a clean entry with these lengths.
    pub fn clean_disk_size(key_len: usize, val_len: usize) -> usize {
        1 + 4 + 4 + key_len + val_len
    }

    /// Appends the serialized entry.
    pub fn encode(&self, out: &mut WBuf) {
        match self {
            LeafEntry::Clean { key, val } => {
                out.put_u8(TAG_CLEAN);
                out.put_u32(key.len() as u32);
                out.put_u32(val.len() as u32);
                out.put_bytes(key);
                out.put_bytes(val);
            }
            LeafEntry::Mvcc {
                key,
                committed,
                provisional,
            } => {
                debug_assert!(provisional.len() <= u8::MAX as usize);
                out.put_u8(TAG_MVCC);
                out.put_u32(key.len() as u32);
                out.put_u32(committed.len() as u32);
                out.put_u8(provisional.len() as u8);
                out.put_bytes(key);
                for record in committed.iter().chain(provisional) {
                    record.encode(out);
                }
            }
        }
    }

    /// Reads one serialized entry.
    pub fn decode(r: &mut RBuf<'_>) -> Result<Self> {
        match r.get_u8()? {
            TAG_CLEAN => {
                let klen = r.get_u32()? as usize;
                let vlen = r.get_u32()? as usize;
                let key = r.take(klen)?.to_vec();
                let val = r.take(vlen)?.to_vec();
                Ok(LeafEntry::Clean { key, val })
            }
            TAG_MVCC => {
                let klen = r.get_u32()? as usize;
                let n_committed = r.get_u32()? as usize;
                let n_provisional = r.get_u8()? as usize;
                if n_committed == 0 && n_provisional == 0 {
                    return Err(FtError::BadFormat("mvcc leaf entry without records"));
                }
                let key = r.take(klen)?.to_vec();
                // each record is at least 9 bytes
                if n_committed.saturating_add(n_provisional).saturating_mul(9) > r.remaining() {
                    return Err(FtError::BadFormat("mvcc record count exceeds buffer"));
                }
                let mut committed = Vec::with_capacity(n_committed);
                for _ in 0..n_committed {
                    committed.push(TxnRecord::decode(r)?);
                }
                let mut provisional = Vec::with_capacity(n_provisional);
                for _ in 0..n_provisional {
                    provisional.push(TxnRecord::decode(r)?);
                }
                Ok(LeafEntry::Mvcc {
                    key,
                    committed,
                    provisional,
                })
            }
            _ => Err(FtError::BadFormat("unknown leaf entry type")),
        }
    }
}
