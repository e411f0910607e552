//! Buffered messages held by internal-node partitions.

use std::cmp::Ordering;

use crate::primitives::bytes::{RBuf, WBuf};
use crate::types::{FtError, Msn, Result, TxnId};

use super::comparator::Comparator;

/// Kind of a buffered message.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// No-op.
    None = 0,
    /// Insert or overwrite.
    Insert = 1,
    /// Insert unless the key exists.
    InsertNoOverwrite = 2,
    /// Delete regardless of transaction.
    DeleteAny = 3,
    /// Abort the transaction's change to one key.
    AbortAny = 4,
    /// Commit the transaction's change to one key.
    CommitAny = 5,
    /// Apply an update function to one key.
    Update = 6,
    /// Apply an update function to every key.
    UpdateBroadcastAll = 7,
    /// Commit every key.
    CommitBroadcastAll = 8,
    /// Commit one transaction everywhere.
    CommitBroadcastTxn = 9,
    /// Abort one transaction everywhere.
    AbortBroadcastTxn = 10,
    /// Garbage-collect committed history everywhere.
    Optimize = 11,
    /// Like [`MessageType::Optimize`] but only for leaves it reaches.
    OptimizeForUpgrade = 12,
}

impl MessageType {
    /// Decodes a stored type byte.
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => MessageType::None,
            1 => MessageType::Insert,
            2 => MessageType::InsertNoOverwrite,
            3 => MessageType::DeleteAny,
            4 => MessageType::AbortAny,
            5 => MessageType::CommitAny,
            6 => MessageType::Update,
            7 => MessageType::UpdateBroadcastAll,
            8 => MessageType::CommitBroadcastAll,
            9 => MessageType::CommitBroadcastTxn,
            10 => MessageType::AbortBroadcastTxn,
            11 => MessageType::Optimize,
            12 => MessageType::OptimizeForUpgrade,
            _ => return Err(FtError::BadFormat("unknown message type")),
        })
    }

    /// True for messages that apply to every key below the buffer.
    pub fn is_broadcast(self) -> bool {
        matches!(
            self,
            MessageType::UpdateBroadcastAll
                | MessageType::CommitBroadcastAll
                | MessageType::CommitBroadcastTxn
                | MessageType::AbortBroadcastTxn
                | MessageType::Optimize
                | MessageType::OptimizeForUpgrade
        )
    }
}

/// One buffered message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Message kind.
    pub kind: MessageType,
    /// Sequence number assigned when the message entered the tree.
    pub msn: Msn,
    /// Transaction chain, outermost first.
    pub xids: Vec<TxnId>,
    /// Target key (empty for broadcasts).
    pub key: Vec<u8>,
    /// Payload.
    pub val: Vec<u8>,
    /// Not yet seen by any reader below this buffer.
    pub fresh: bool,
}

impl Message {
    /// Serialized size.
    pub fn disk_size(&self) -> usize {
        1 + 1 + 8 + 1 + 8 * self.xids.len() + 4 + self.key.len() + 4 + self.val.len()
    }

    /// Appends the serialized message.
    pub fn encode(&self, out: &mut WBuf) {
        debug_assert!(self.xids.len() <= u8::MAX as usize);
        out.put_u8(self.kind as u8);
        out.put_u8(u8::from(self.fresh));
        out.put_u64(self.msn.0);
        out.put_u8(self.xids.len() as u8);
        for xid in &self.xids {
            out.put_u64(xid.0);
        }
        out.put_len_bytes(&self.key);
        out.put_len_bytes(&self.val);
    }

    /// Reads one serialized message.
    pub fn decode(r: &mut RBuf<'_>) -> Result<Self> {
        let kind = MessageType::from_u8(r.get_u8()?)?;
        let fresh = match r.get_u8()? {
            0 => false,
            1 => true,
            _ => return Err(FtError::BadFormat("bad message freshness flag")),
        };
        let msn = Msn(r.get_u64()?);
        let n_xids = r.get_u8()? as usize;
        let mut xids = Vec::with_capacity(n_xids);
        for _ in 0..n_xids {
            xids.push(TxnId(r.get_u64()?));
        }
        let key = r.get_len_bytes()?.to_vec();
        let val = r.get_len_bytes()?.to_vec();
        Ok(Self {
            kind,
            msn,
            xids,
            key,
            val,
            fresh,
        })
    }
}

/// Messages buffered for one child, in arrival order, plus key orderings.
///
/// `fresh` and `stale` hold indices into `messages` sorted by `(key, msn)`;
/// `broadcast` holds the broadcast messages in arrival order. The orderings are
/// only built when a comparator is supplied.
#[derive(Clone, Debug, Default)]
pub struct ChildBuffer {
    messages: Vec<Message>,
    fresh: Vec<usize>,
    stale: Vec<usize>,
    broadcast: Vec<usize>,
    indexed: bool,
}

impl PartialEq for ChildBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.messages == other.messages
    }
}

impl ChildBuffer {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a buffer from messages in arrival order.
    pub fn from_messages(messages: Vec<Message>, cmp: Option<&dyn Comparator>) -> Self {
        let mut buffer = Self {
            messages,
            ..Self::default()
        };
        if let Some(cmp) = cmp {
            buffer.rebuild_orderings(cmp);
        }
        buffer
    }

    /// Appends a message.
    pub fn push(&mut self, msg: Message, cmp: Option<&dyn Comparator>) {
        let idx = self.messages.len();
        let broadcast = msg.kind.is_broadcast();
        let fresh = msg.fresh;
        self.messages.push(msg);
        match cmp {
            Some(cmp) if self.indexed || idx == 0 => {
                self.indexed = true;
                if broadcast {
                    self.broadcast.push(idx);
                } else {
                    let list = if fresh {
                        &mut self.fresh
                    } else {
                        &mut self.stale
                    };
                    let messages = &self.messages;
                    let pos = list.partition_point(|&i| {
                        order(cmp, &messages[i], &messages[idx]) != Ordering::Greater
                    });
                    list.insert(pos, idx);
                }
            }
            _ => self.indexed = false,
        }
    }

    /// Recomputes the key orderings.
    pub fn rebuild_orderings(&mut self, cmp: &dyn Comparator) {
        self.fresh.clear();
        self.stale.clear();
        self.broadcast.clear();
        for (i, msg) in self.messages.iter().enumerate() {
            if msg.kind.is_broadcast() {
                self.broadcast.push(i);
            } else if msg.fresh {
                self.fresh.push(i);
            } else {
                self.stale.push(i);
            }
        }
        let messages = &self.messages;
        self.fresh
            .sort_by(|&a, &b| order(cmp, &messages[a], &messages[b]));
        self.stale
            .sort_by(|&a, &b| order(cmp, &messages[a], &messages[b]));
        self.indexed = true;
    }

    /// Reclassifies every fresh message as stale.
    pub fn mark_all_stale(&mut self, cmp: Option<&dyn Comparator>) {
        for msg in &mut self.messages {
            if !msg.kind.is_broadcast() {
                msg.fresh = false;
            }
        }
        match cmp {
            Some(cmp) if !self.indexed => self.rebuild_orderings(cmp),
            Some(cmp) => {
                let fresh = std::mem::take(&mut self.fresh);
                let stale = std::mem::take(&mut self.stale);
                let messages = &self.messages;
                let mut merged = Vec::with_capacity(fresh.len() + stale.len());
                let (mut a, mut b) = (fresh.into_iter().peekable(), stale.into_iter().peekable());
                loop {
                    let take_a = match (a.peek(), b.peek()) {
                        (Some(&x), Some(&y)) => {
                            order(cmp, &messages[x], &messages[y]) != Ordering::Greater
                        }
                        (Some(_), None) => true,
                        (None, Some(_)) => false,
                        (None, None) => break,
                    };
                    let next = if take_a { a.next() } else { b.next() };
                    merged.extend(next);
                }
                self.stale = merged;
                self.indexed = true;
            }
            None => {
                self.fresh.clear();
                self.stale.clear();
                self.broadcast.clear();
                self.indexed = false;
            }
        }
    }

    /// Messages in arrival order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Fresh non-broadcast messages sorted by key.
    pub fn fresh(&self) -> impl Iterator<Item = &Message> + '_ {
        self.fresh.iter().map(move |&i| &self.messages[i])
    }

    /// Stale non-broadcast messages sorted by key.
    pub fn stale(&self) -> impl Iterator<Item = &Message> + '_ {
        self.stale.iter().map(move |&i| &self.messages[i])
    }

    /// Broadcast messages in arrival order.
    pub fn broadcast(&self) -> impl Iterator<Item = &Message> + '_ {
        self.broadcast.iter().map(move |&i| &self.messages[i])
    }

    /// True when the key orderings reflect the current messages.
    pub fn is_indexed(&self) -> bool {
        self.indexed || self.messages.is_empty()
    }

    /// Number of messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// True when no message is buffered.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Highest msn among the buffered messages.
    pub fn max_msn(&self) -> Msn {
        self.messages
            .iter()
            .map(|m| m.msn)
            .max()
            .unwrap_or(Msn::MIN)
    }

    /// Serialized size of the messages.
    pub fn disk_size(&self) -> usize {
        self.messages.iter().map(Message::disk_size).sum()
    }

    /// Approximate heap footprint.
    pub fn memory_size(&self) -> usize {
        self.disk_size()
            + self.messages.len() * std::mem::size_of::<Message>()
            + (self.fresh.len() + self.stale.len() + self.broadcast.len())
                * std::mem::size_of::<usize>()
    }
}

fn order(cmp: &dyn Comparator, a: &Message, b: &Message) -> Ordering {
    cmp.compare(&a.key, &b.key).then(a.msn.cmp(&b.msn))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ft::comparator::BytewiseComparator;

    fn msg(kind: MessageType, msn: u64, key: &[u8], fresh: bool) -> Message {
        Message {
            kind,
            msn: Msn(msn),
            xids: vec![TxnId(1)],
            key: key.to_vec(),
            val: b"v".to_vec(),
            fresh,
        }
    }

    #[test]
    fn orderings_split_fresh_stale_broadcast() {
        let cmp = BytewiseComparator;
        let buffer = ChildBuffer::from_messages(
            vec![
                msg(MessageType::Insert, 1, b"c", true),
                msg(MessageType::DeleteAny, 2, b"a", false),
                msg(MessageType::Optimize, 3, b"", true),
                msg(MessageType::Insert, 4, b"b", true),
                msg(MessageType::Insert, 5, b"a", true),
            ],
            Some(&cmp),
        );
        let fresh: Vec<_> = buffer.fresh().map(|m| m.msn.0).collect();
        let stale: Vec<_> = buffer.stale().map(|m| m.msn.0).collect();
        let bcast: Vec<_> = buffer.broadcast().map(|m| m.msn.0).collect();
        assert_eq!(fresh, vec![5, 4, 1]);
        assert_eq!(stale, vec![2]);
        assert_eq!(bcast, vec![3]);
        assert_eq!(buffer.max_msn(), Msn(5));
    }

    #[test]
    fn push_keeps_orderings_sorted() {
        let cmp = BytewiseComparator;
        let mut buffer = ChildBuffer::new();
        for (i, key) in [b"d", b"b", b"c", b"a"].iter().enumerate() {
            buffer.push(msg(MessageType::Insert, i as u64 + 1, *key, true), Some(&cmp));
        }
        let keys: Vec<_> = buffer.fresh().map(|m| m.key.clone()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
        assert!(buffer.is_indexed());
    }

    #[test]
    fn mark_all_stale_merges_orderings() {
        let cmp = BytewiseComparator;
        let mut buffer = ChildBuffer::from_messages(
            vec![
                msg(MessageType::Insert, 1, b"b", true),
                msg(MessageType::Insert, 2, b"a", false),
                msg(MessageType::Insert, 3, b"c", true),
            ],
            Some(&cmp),
        );
        buffer.mark_all_stale(Some(&cmp));
        assert_eq!(buffer.fresh().count(), 0);
        let stale: Vec<_> = buffer.stale().map(|m| m.msn.0).collect();
        assert_eq!(stale, vec![2, 1, 3]);
        assert!(buffer.messages().iter().all(|m| !m.fresh));
    }

    #[test]
    fn message_encoding_matches_size() {
        let m = msg(MessageType::Update, 77, b"key", true);
        let mut w = WBuf::new();
        m.encode(&mut w);
        assert_eq!(w.len(), m.disk_size());
        let bytes = w.into_vec();
        let back = Message::decode(&mut RBuf::new(&bytes)).unwrap();
        assert_eq!(back, m);
    }
}
