//! Sequential cursor over every leaf entry of a tree.
//!
//! Visibility is ignored: committed and provisional versions alike are
//! returned as stored. Messages still buffered in internal nodes are not
//! applied. The cursor keeps at most one node pinned at a time and re-descends
//! from the root for every leaf, so a `TryAgain` from the cache table only
//! costs a restart of the current descent.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::thread;

use tracing::{debug, trace};

use crate::types::{FtError, Result};

use super::cachetable::{pin_for_read, unpin, CacheTable};
use super::leafentry::LeafEntry;
use super::node::{FetchPolicy, Node, Partition, PartitionState};
use super::tree::FtTree;

const MAX_DESCENT_RETRIES: usize = 64;

/// Where the cursor stands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CursorPosition {
    /// Before the first entry.
    NegativeInfinity,
    /// On the entry with this key.
    At(Vec<u8>),
    /// After the last entry.
    PositiveInfinity,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// Bound for the next leaf to load: forward wants keys strictly greater than
/// `key`, reverse wants keys below it (`inclusive` lets equal keys through).
#[derive(Clone, Debug)]
struct Seek {
    key: Option<Vec<u8>>,
    inclusive: bool,
}

/// Sequential cursor over every leaf entry of a tree, ignoring
/// transactional visibility.
pub struct LeCursor<'a> {
    tree: &'a FtTree,
    ct: &'a dyn CacheTable,
    direction: Direction,
    position: CursorPosition,
    current: Option<LeafEntry>,
    batch: VecDeque<LeafEntry>,
    leaves_read: u64,
}

impl<'a> LeCursor<'a> {
    /// Forward cursor positioned at negative infinity.
    pub fn create(tree: &'a FtTree, ct: &'a dyn CacheTable) -> Self {
        Self::new(tree, ct, Direction::Forward, CursorPosition::NegativeInfinity)
    }

    /// Reverse cursor positioned at positive infinity.
    pub fn create_reverse(tree: &'a FtTree, ct: &'a dyn CacheTable) -> Self {
        Self::new(tree, ct, Direction::Reverse, CursorPosition::PositiveInfinity)
    }

    fn new(
        tree: &'a FtTree,
        ct: &'a dyn CacheTable,
        direction: Direction,
        position: CursorPosition,
    ) -> Self {
        trace!(file = tree.file_id().0, ?direction, "le_cursor.create");
        Self {
            tree,
            ct,
            direction,
            position,
            current: None,
            batch: VecDeque::new(),
            leaves_read: 0,
        }
    }

    /// Where the cursor stands.
    pub fn position(&self) -> &CursorPosition {
        &self.position
    }

    /// Entry under the cursor.
    pub fn current(&self) -> Option<&LeafEntry> {
        self.current.as_ref()
    }

    /// Steps to the next entry in the cursor's direction. Returns `false`
    /// once the cursor has moved past the last entry.
    pub fn advance(&mut self) -> Result<bool> {
        if self.is_done() {
            return Ok(false);
        }
        if self.batch.is_empty() {
            self.load_next_leaf()?;
        }
        match self.batch.pop_front() {
            Some(entry) => {
                self.position = CursorPosition::At(entry.key().to_vec());
                self.current = Some(entry);
                Ok(true)
            }
            None => {
                self.position = match self.direction {
                    Direction::Forward => CursorPosition::PositiveInfinity,
                    Direction::Reverse => CursorPosition::NegativeInfinity,
                };
                self.current = None;
                Ok(false)
            }
        }
    }

    /// True when `key` sorts after the cursor's key.
    pub fn is_key_right_of_cursor(&self, key: &[u8]) -> bool {
        match &self.position {
            CursorPosition::NegativeInfinity => true,
            CursorPosition::PositiveInfinity => false,
            CursorPosition::At(cur) => self.tree.cmp().compare(key, cur) == Ordering::Greater,
        }
    }

    /// Ends the scan.
    pub fn close(self) {
        debug!(leaves = self.leaves_read, "le_cursor.close");
    }

    fn is_done(&self) -> bool {
        matches!(
            (&self.position, self.direction),
            (CursorPosition::PositiveInfinity, Direction::Forward)
                | (CursorPosition::NegativeInfinity, Direction::Reverse)
        )
    }

    fn load_next_leaf(&mut self) -> Result<()> {
        let mut seek = Seek {
            key: match &self.position {
                CursorPosition::At(key) => Some(key.clone()),
                _ => None,
            },
            inclusive: false,
        };
        loop {
            let (entries, next) = self.descend_with_retry(&seek)?;
            self.leaves_read += 1;
            if !entries.is_empty() {
                self.batch.extend(entries);
                return Ok(());
            }
            match next {
                Some(next) => seek = next,
                None => return Ok(()),
            }
        }
    }

    fn descend_with_retry(&self, seek: &Seek) -> Result<(Vec<LeafEntry>, Option<Seek>)> {
        let mut attempts = 0;
        loop {
            match self.descend(seek) {
                Err(FtError::TryAgain) if attempts < MAX_DESCENT_RETRIES => {
                    attempts += 1;
                    trace!(attempts, "le_cursor.retry");
                    thread::yield_now();
                }
                other => return other,
            }
        }
    }

    /// Walks from the root to the leaf that should hold the next entries.
    /// Returns the qualifying entries in cursor order, and the seek to try
    /// when that leaf turns out to hold none.
    fn descend(&self, seek: &Seek) -> Result<(Vec<LeafEntry>, Option<Seek>)> {
        let Some(mut blocknum) = self.tree.root() else {
            return Ok((Vec::new(), None));
        };
        let cmp = self.tree.cmp();
        let mut fallback: Option<Vec<u8>> = None;
        loop {
            let key = self.tree.key(blocknum);
            let node = pin_for_read(self.ct, &key, self.tree, &FetchPolicy::All, None, &[])?;
            if node.is_leaf() {
                let entries = self.collect(&node, seek);
                unpin(self.ct, node, false)?;
                let next = fallback.map(|key| Seek {
                    key: Some(key),
                    inclusive: self.direction == Direction::Reverse,
                });
                return Ok((entries, next));
            }
            let last = node.n_children() - 1;
            let child = match (self.direction, seek.key.as_deref()) {
                (Direction::Forward, None) => 0,
                (Direction::Reverse, None) => last,
                (Direction::Forward, Some(k)) => (0..last)
                    .find(|&i| {
                        node.pivots
                            .get(i)
                            .is_some_and(|p| cmp.compare(p, k) == Ordering::Greater)
                    })
                    .unwrap_or(last),
                (Direction::Reverse, Some(k)) => node.child_for_key(cmp, k),
            };
            match self.direction {
                Direction::Forward if child < last => {
                    fallback = node.pivots.get(child).map(<[u8]>::to_vec);
                }
                Direction::Reverse if child > 0 => {
                    fallback = node.pivots.get(child - 1).map(<[u8]>::to_vec);
                }
                _ => {}
            }
            let next = node.children[child].blocknum;
            unpin(self.ct, node, false)?;
            blocknum = next;
        }
    }

    fn collect(&self, leaf: &Node, seek: &Seek) -> Vec<LeafEntry> {
        let cmp = self.tree.cmp();
        let wanted = |entry: &LeafEntry| match (&seek.key, self.direction) {
            (None, _) => true,
            (Some(k), Direction::Forward) => cmp.compare(entry.key(), k) == Ordering::Greater,
            (Some(k), Direction::Reverse) => match cmp.compare(entry.key(), k) {
                Ordering::Less => true,
                Ordering::Equal => seek.inclusive,
                Ordering::Greater => false,
            },
        };
        let mut out: Vec<LeafEntry> = leaf
            .children
            .iter()
            .filter_map(|child| match &child.state {
                PartitionState::Avail(Partition::Basement(bn)) => Some(bn.entries.iter()),
                _ => None,
            })
            .flatten()
            .filter(|e| wanted(e))
            .cloned()
            .collect();
        if self.direction == Direction::Reverse {
            out.reverse();
        }
        out
    }
}
