//! Pin protocol used by tree code on top of any [`CacheTable`].

use tracing::{debug, trace};

use crate::storage::ft::comparator::Comparator;
use crate::storage::ft::node::{FetchPolicy, Node, Partition, PartitionState};
use crate::types::{FtError, Msn, Result};

use super::{CacheKey, CacheTable, DependentPin, NodeFetcher, PairAttr, PinLock, PinnedNode};

/// Messages buffered above a leaf that a reader must see.
pub trait AncestorMessages {
    /// Highest msn among the messages.
    fn max_msn(&self) -> Msn;

    /// Applies the messages to the available basements of `leaf` and returns
    /// the msn the basements are now current to.
    fn apply(&self, leaf: &mut Node, cmp: Option<&dyn Comparator>) -> Result<Msn>;
}

fn needs_ancestors(node: &Node, ancestors: &dyn AncestorMessages) -> bool {
    let max = ancestors.max_msn();
    node.is_leaf()
        && node.children.iter().any(|child| match &child.state {
            PartitionState::Avail(Partition::Basement(bn)) => bn.max_msn_applied < max,
            _ => false,
        })
}

/// Pins a node for reading.
///
/// When `ancestors` is given and the leaf has not seen all of them, the read
/// pin is traded for a write pin, the messages are applied, and the pin is
/// downgraded back. Basement watermarks only move forward when the node was
/// clean.
pub fn pin_for_read(
    ct: &dyn CacheTable,
    key: &CacheKey,
    fetcher: &dyn NodeFetcher,
    policy: &FetchPolicy,
    ancestors: Option<&dyn AncestorMessages>,
    deps: &[DependentPin],
) -> Result<PinnedNode> {
    let pinned = ct.get_and_pin(key, PinLock::Read, fetcher, policy, deps)?;
    trace!(blocknum = key.blocknum.0, "cachetable.pin.read");
    let Some(ancestors) = ancestors else {
        return Ok(pinned);
    };
    if !needs_ancestors(&pinned, ancestors) {
        return Ok(pinned);
    }
    ct.unpin(pinned, false, None)?;
    let mut pinned = ct.get_and_pin(key, PinLock::Write, fetcher, policy, deps)?;
    if let Some(node) = pinned.node_mut() {
        if needs_ancestors(node, ancestors) {
            let was_clean = !node.dirty;
            let msn = ancestors.apply(node, fetcher.comparator())?;
            if was_clean {
                for child in &mut node.children {
                    if let PartitionState::Avail(Partition::Basement(bn)) = &mut child.state {
                        bn.max_msn_applied = bn.max_msn_applied.max(msn);
                    }
                }
            }
            debug!(
                blocknum = key.blocknum.0,
                msn = msn.0,
                was_clean,
                "cachetable.ancestors.apply"
            );
        }
    }
    Ok(pinned.downgrade())
}

/// Pins a node for writing. Fresh messages in an internal node's buffers
/// become stale.
pub fn pin_for_write(
    ct: &dyn CacheTable,
    key: &CacheKey,
    fetcher: &dyn NodeFetcher,
    policy: &FetchPolicy,
    deps: &[DependentPin],
) -> Result<PinnedNode> {
    let mut pinned = ct.get_and_pin(key, PinLock::Write, fetcher, policy, deps)?;
    trace!(blocknum = key.blocknum.0, deps = deps.len(), "cachetable.pin.write");
    if let Some(node) = pinned.node_mut() {
        if !node.is_leaf() {
            for child in &mut node.children {
                if let PartitionState::Avail(Partition::Buffer(buffer)) = &mut child.state {
                    buffer.mark_all_stale(fetcher.comparator());
                }
            }
        }
    }
    Ok(pinned)
}

/// Pins a resident clean node without fetching or waiting.
pub fn maybe_pin_clean(ct: &dyn CacheTable, key: &CacheKey, lock: PinLock) -> Result<Option<PinnedNode>> {
    ct.maybe_get_and_pin_clean(key, lock)
}

/// Inserts a freshly built node, returning it write-pinned.
pub fn put_new_node(ct: &dyn CacheTable, key: CacheKey, node: Node) -> Result<PinnedNode> {
    let attr = PairAttr::of(&node);
    ct.put(key, node, attr)
}

/// Releases a pin. Write pins report the node's current footprint; read pins
/// report no change and may not dirty the node.
pub fn unpin(ct: &dyn CacheTable, pinned: PinnedNode, dirty: bool) -> Result<()> {
    let attr = match pinned.lock() {
        PinLock::Write => Some(PairAttr::of(&pinned)),
        PinLock::Read if dirty => return Err(FtError::Invalid("read pin cannot dirty a node")),
        PinLock::Read => None,
    };
    trace!(blocknum = pinned.key().blocknum.0, dirty, "cachetable.unpin");
    ct.unpin(pinned, dirty, attr)
}
