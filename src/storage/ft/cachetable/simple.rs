//! In-process cache table.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::types::{FtError, Result};

use super::super::node::{FetchPolicy, Node};
use super::{CacheKey, CacheTable, DependentPin, NodeFetcher, PairAttr, PinLock, PinnedNode};

struct Pair {
    node: Arc<RwLock<Node>>,
    dirty: bool,
    attr: PairAttr,
}

impl Pair {
    fn is_pinned(&self) -> bool {
        Arc::strong_count(&self.node) > 1
    }
}

#[derive(Default)]
struct Inner {
    pairs: HashMap<CacheKey, Pair>,
    used: u64,
    reserved: u64,
}

/// In-process cache table without write-back.
///
/// Locks are only ever tried, never waited on, so a conflicting pin answers
/// [`FtError::TryAgain`]. Dirty nodes stay resident until the table is
/// dropped.
pub struct SimpleCacheTable {
    capacity: u64,
    inner: Mutex<Inner>,
}

impl SimpleCacheTable {
    /// Table that accounts for at most `capacity` bytes.
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Bytes the table may hold.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes attributed to resident nodes.
    pub fn memory_used(&self) -> u64 {
        self.inner.lock().used
    }

    /// Bytes handed out by [`CacheTable::reserve_memory`] and not yet returned.
    pub fn memory_reserved(&self) -> u64 {
        self.inner.lock().reserved
    }

    /// Resident nodes.
    pub fn len(&self) -> usize {
        self.inner.lock().pairs.len()
    }

    /// True when nothing is held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` is resident and marked dirty.
    pub fn is_dirty(&self, key: &CacheKey) -> bool {
        self.inner
            .lock()
            .pairs
            .get(key)
            .map(|p| p.dirty)
            .unwrap_or(false)
    }

    /// Whether `key` is resident and pinned by someone.
    pub fn is_pinned(&self, key: &CacheKey) -> bool {
        self.inner
            .lock()
            .pairs
            .get(key)
            .map(Pair::is_pinned)
            .unwrap_or(false)
    }

    fn check_dependents(inner: &mut Inner, deps: &[DependentPin]) -> Result<()> {
        for dep in deps {
            let pair = inner
                .pairs
                .get_mut(&dep.key)
                .ok_or(FtError::Invalid("dependent pair is not resident"))?;
            if !pair.is_pinned() {
                return Err(FtError::Invalid("dependent pair is not pinned"));
            }
            pair.dirty |= dep.dirty;
        }
        Ok(())
    }

    fn lock_pair(key: &CacheKey, node: &Arc<RwLock<Node>>, lock: PinLock) -> Result<PinnedNode> {
        let pinned = match lock {
            PinLock::Read => PinnedNode::try_read(*key, node),
            PinLock::Write => PinnedNode::try_write(*key, node),
        };
        pinned.ok_or(FtError::TryAgain)
    }
}

impl CacheTable for SimpleCacheTable {
    fn get_and_pin(
        &self,
        key: &CacheKey,
        lock: PinLock,
        fetcher: &dyn NodeFetcher,
        policy: &FetchPolicy,
        deps: &[DependentPin],
    ) -> Result<PinnedNode> {
        let node = {
            let mut inner = self.inner.lock();
            Self::check_dependents(&mut inner, deps)?;
            if let Some(pair) = inner.pairs.get(key) {
                Arc::clone(&pair.node)
            } else {
                let (mut node, attr) = fetcher.fetch(key, policy)?;
                node.fullhash = key.fullhash;
                trace!(blocknum = key.blocknum.0, size = attr.size, "cachetable.fetch");
                let node = Arc::new(RwLock::new(node));
                inner.used += attr.size;
                inner.pairs.insert(
                    *key,
                    Pair {
                        node: Arc::clone(&node),
                        dirty: false,
                        attr,
                    },
                );
                node
            }
        };

        let pinned = Self::lock_pair(key, &node, lock)?;
        if !fetcher.partial_fetch_required(&pinned, policy) {
            return Ok(pinned);
        }
        let was_read = pinned.lock() == PinLock::Read;
        drop(pinned);
        let mut pinned = Self::lock_pair(key, &node, PinLock::Write)?;
        if let Some(node) = pinned.node_mut() {
            if fetcher.partial_fetch_required(node, policy) {
                let attr = fetcher.partial_fetch(node, policy)?;
                trace!(blocknum = key.blocknum.0, size = attr.size, "cachetable.partial_fetch");
                let mut inner = self.inner.lock();
                let Inner { pairs, used, .. } = &mut *inner;
                if let Some(pair) = pairs.get_mut(key) {
                    *used = used.saturating_sub(pair.attr.size) + attr.size;
                    pair.attr = attr;
                }
            }
        }
        Ok(if was_read { pinned.downgrade() } else { pinned })
    }

    fn maybe_get_and_pin_clean(&self, key: &CacheKey, lock: PinLock) -> Result<Option<PinnedNode>> {
        let inner = self.inner.lock();
        match inner.pairs.get(key) {
            Some(pair) if !pair.dirty => Ok(Self::lock_pair(key, &pair.node, lock).ok()),
            _ => Ok(None),
        }
    }

    fn put(&self, key: CacheKey, mut node: Node, attr: PairAttr) -> Result<PinnedNode> {
        let mut inner = self.inner.lock();
        if inner.pairs.contains_key(&key) {
            return Err(FtError::Invalid("node already cached"));
        }
        node.fullhash = key.fullhash;
        let node = Arc::new(RwLock::new(node));
        let pinned = Self::lock_pair(&key, &node, PinLock::Write)?;
        inner.used += attr.size;
        inner.pairs.insert(
            key,
            Pair {
                node,
                dirty: true,
                attr,
            },
        );
        Ok(pinned)
    }

    fn unpin(&self, mut pinned: PinnedNode, dirty: bool, attr: Option<PairAttr>) -> Result<()> {
        let key = *pinned.key();
        if dirty {
            if let Some(node) = pinned.node_mut() {
                node.dirty = true;
            }
        }
        let mut inner = self.inner.lock();
        let Inner { pairs, used, .. } = &mut *inner;
        let pair = pairs
            .get_mut(&key)
            .ok_or(FtError::Invalid("unpin of a node that is not cached"))?;
        pair.dirty |= dirty;
        if let Some(attr) = attr {
            *used = used.saturating_sub(pair.attr.size) + attr.size;
            pair.attr = attr;
        }
        drop(pinned);
        trace!(blocknum = key.blocknum.0, dirty, "cachetable.release");
        Ok(())
    }

    fn evict(&self, key: &CacheKey) -> Result<bool> {
        let mut inner = self.inner.lock();
        let (pinned, dirty) = match inner.pairs.get(key) {
            Some(pair) => (pair.is_pinned(), pair.dirty),
            None => return Ok(false),
        };
        if pinned {
            return Err(FtError::TryAgain);
        }
        if dirty {
            return Ok(false);
        }
        if let Some(pair) = inner.pairs.remove(key) {
            inner.used = inner.used.saturating_sub(pair.attr.size);
            trace!(blocknum = key.blocknum.0, "cachetable.evict");
        }
        Ok(true)
    }

    fn reserve_memory(&self, fraction: f64) -> u64 {
        let mut inner = self.inner.lock();
        let free = self.capacity.saturating_sub(inner.used + inner.reserved);
        let bytes = (free as f64 * fraction.clamp(0.0, 1.0)) as u64;
        inner.reserved += bytes;
        bytes
    }

    fn release_reserved_memory(&self, bytes: u64) {
        let mut inner = self.inner.lock();
        inner.reserved = inner.reserved.saturating_sub(bytes);
    }
}
