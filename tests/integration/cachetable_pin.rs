#![allow(missing_docs)]

use std::path::Path;
use std::sync::Arc;
use std::thread;

use fractree::{
    storage::{
        ft::{
            bytewise,
            cachetable::{maybe_pin_clean, pin_for_read, pin_for_write, put_new_node, unpin, AncestorMessages},
            CacheTable, Comparator, DependentPin, FetchPolicy, FtContext, FtTree, LeafEntry,
            Node, PinLock, SimpleCacheTable,
        },
        loader::{open_loader, reserve_loader_memory, IndexSpec},
        LoaderOptions, TreeOptions,
    },
    types::{BlockNum, FileId, FtError, Msn, Result},
};
use tempfile::tempdir;

const ROWS: u32 = 600;

fn build(dir: &Path) -> Result<FtTree> {
    let path = dir.join("pin.ft");
    let opts = LoaderOptions::default()
        .temp_dir(dir)
        .tree(
            TreeOptions::default()
                .node_size(4096)
                .basement_node_size(1024)
                .fanout(4),
        );
    let mut loader = open_loader(vec![IndexSpec::new(&path)], opts, Arc::new(FtContext::serial()))?;
    for i in 0..ROWS {
        loader.put(format!("key{i:05}").as_bytes(), format!("value-{i:05}-padding").as_bytes())?;
    }
    loader.close()?;
    FtTree::open(&path, FileId(5), bytewise(), Arc::new(FtContext::serial()))
}

/// Follows the leftmost child down to a leaf.
fn first_leaf(tree: &FtTree) -> Result<BlockNum> {
    let mut blocknum = tree.root().expect("loaded tree has a root");
    loop {
        let node = tree.read_node_header(blocknum)?;
        if node.is_leaf() {
            return Ok(blocknum);
        }
        blocknum = node.children[0].blocknum;
    }
}

/// Inserts one entry just after the first key of the leaf.
struct InsertAfterFirst {
    msn: Msn,
}

impl AncestorMessages for InsertAfterFirst {
    fn max_msn(&self) -> Msn {
        self.msn
    }

    fn apply(&self, leaf: &mut Node, _cmp: Option<&dyn Comparator>) -> Result<Msn> {
        if let Some(bn) = leaf.basement_mut(0) {
            bn.entries.insert(1, LeafEntry::clean("key00000x", "from-above"));
        }
        Ok(self.msn)
    }
}

fn entry_count(node: &Node) -> usize {
    (0..node.n_children())
        .filter_map(|i| node.basement(i))
        .map(|bn| bn.entries.len())
        .sum()
}

#[test]
fn partial_fetch_fills_what_a_later_policy_needs() -> Result<()> {
    let dir = tempdir()?;
    let tree = build(dir.path())?;
    let leaf = tree.key(first_leaf(&tree)?);
    let ct = SimpleCacheTable::new(64 << 20);

    let pinned = pin_for_read(&ct, &leaf, &tree, &FetchPolicy::None, None, &[])?;
    assert!(pinned.n_children() > 1);
    assert!(!pinned.all_avail());
    unpin(&ct, pinned, false)?;
    let before = ct.memory_used();

    let pinned = pin_for_read(&ct, &leaf, &tree, &FetchPolicy::Key(b"key00000".to_vec()), None, &[])?;
    assert!(pinned.children[0].state.is_avail());
    assert!(!pinned.children[pinned.n_children() - 1].state.is_avail());
    unpin(&ct, pinned, false)?;

    let pinned = pin_for_read(&ct, &leaf, &tree, &FetchPolicy::All, None, &[])?;
    assert!(pinned.all_avail());
    assert_eq!(pinned.lock(), PinLock::Read);
    assert_eq!(pinned.basement(0).unwrap().entries[0].key(), b"key00000");
    unpin(&ct, pinned, false)?;

    assert!(ct.memory_used() > before);
    assert!(!ct.is_dirty(&leaf));
    Ok(())
}

#[test]
fn readers_share_and_writers_get_try_again() -> Result<()> {
    let dir = tempdir()?;
    let tree = build(dir.path())?;
    let leaf = tree.key(first_leaf(&tree)?);
    let ct = SimpleCacheTable::new(64 << 20);

    let a = pin_for_read(&ct, &leaf, &tree, &FetchPolicy::All, None, &[])?;
    let b = pin_for_read(&ct, &leaf, &tree, &FetchPolicy::All, None, &[])?;
    let err = pin_for_write(&ct, &leaf, &tree, &FetchPolicy::All, &[]).unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(ct.evict(&leaf), Err(FtError::TryAgain)));
    unpin(&ct, a, false)?;
    unpin(&ct, b, false)?;

    let w = pin_for_write(&ct, &leaf, &tree, &FetchPolicy::All, &[])?;
    assert!(pin_for_read(&ct, &leaf, &tree, &FetchPolicy::All, None, &[])
        .unwrap_err()
        .is_retryable());
    assert!(maybe_pin_clean(&ct, &leaf, PinLock::Read)?.is_none());
    unpin(&ct, w, false)?;

    assert!(ct.evict(&leaf)?);
    assert!(!ct.evict(&leaf)?);
    Ok(())
}

#[test]
fn concurrent_readers_retry_until_pinned() -> Result<()> {
    let dir = tempdir()?;
    let tree = build(dir.path())?;
    let leaf = tree.key(first_leaf(&tree)?);
    let ct = SimpleCacheTable::new(64 << 20);

    let counts: Vec<usize> = thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                s.spawn(|| loop {
                    match pin_for_read(&ct, &leaf, &tree, &FetchPolicy::All, None, &[]) {
                        Ok(pinned) => {
                            let n = entry_count(&pinned);
                            unpin(&ct, pinned, false).unwrap();
                            break n;
                        }
                        Err(err) if err.is_retryable() => thread::yield_now(),
                        Err(err) => panic!("pin failed: {err}"),
                    }
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert!(counts[0] > 0);
    assert!(counts.iter().all(|&n| n == counts[0]));
    assert!(!ct.is_pinned(&leaf));
    Ok(())
}

#[test]
fn ancestors_are_applied_once_to_a_clean_leaf() -> Result<()> {
    let dir = tempdir()?;
    let tree = build(dir.path())?;
    let leaf = tree.key(first_leaf(&tree)?);
    let ct = SimpleCacheTable::new(64 << 20);
    let plain = entry_count(&tree.read_node(leaf.blocknum, &FetchPolicy::All)?);
    let above = InsertAfterFirst { msn: Msn(1 << 40) };

    let pinned = pin_for_read(&ct, &leaf, &tree, &FetchPolicy::All, Some(&above), &[])?;
    assert_eq!(pinned.lock(), PinLock::Read);
    assert_eq!(entry_count(&pinned), plain + 1);
    assert_eq!(pinned.basement(0).unwrap().entries[1].key(), b"key00000x");
    for i in 0..pinned.n_children() {
        assert_eq!(pinned.basement(i).unwrap().max_msn_applied, Msn(1 << 40));
    }
    unpin(&ct, pinned, false)?;
    assert!(!ct.is_dirty(&leaf));

    let pinned = pin_for_read(&ct, &leaf, &tree, &FetchPolicy::All, Some(&above), &[])?;
    assert_eq!(entry_count(&pinned), plain + 1);
    unpin(&ct, pinned, false)?;
    Ok(())
}

#[test]
fn dependent_pins_pick_up_the_callers_dirty_bit() -> Result<()> {
    let dir = tempdir()?;
    let tree = build(dir.path())?;
    let root = tree.key(tree.root().unwrap());
    let parent = tree.read_node_header(root.blocknum)?;
    assert!(!parent.is_leaf());
    let child = tree.key(parent.children[0].blocknum);
    let ct = SimpleCacheTable::new(64 << 20);

    let held = pin_for_write(&ct, &root, &tree, &FetchPolicy::All, &[])?;
    let dep = DependentPin { key: root, dirty: true };
    let pinned = pin_for_write(&ct, &child, &tree, &FetchPolicy::All, &[dep])?;
    assert!(ct.is_dirty(&root));
    assert!(!ct.is_dirty(&child));
    unpin(&ct, pinned, false)?;
    unpin(&ct, held, false)?;

    assert!(ct.is_dirty(&root));
    assert!(maybe_pin_clean(&ct, &root, PinLock::Read)?.is_none());
    let clean = maybe_pin_clean(&ct, &child, PinLock::Read)?.expect("child is clean and free");
    unpin(&ct, clean, false)?;

    // the dependency has to be pinned by the caller
    let err = pin_for_read(&ct, &child, &tree, &FetchPolicy::All, None, &[dep]).unwrap_err();
    assert!(matches!(err, FtError::Invalid(_)));
    Ok(())
}

#[test]
fn resident_nodes_are_served_without_the_file() -> Result<()> {
    let dir = tempdir()?;
    let tree = build(dir.path())?;
    let ct = SimpleCacheTable::new(64 << 20);
    let fresh = tree.key(BlockNum(10_000));
    assert!(tree.read_node(fresh.blocknum, &FetchPolicy::None).is_err());

    let node = Node::new_leaf(fresh.blocknum, vec![LeafEntry::clean("zzz", "new")]);
    let pinned = put_new_node(&ct, fresh, node)?;
    assert_eq!(pinned.lock(), PinLock::Write);
    unpin(&ct, pinned, false)?;
    assert!(ct.is_dirty(&fresh));
    assert!(!ct.evict(&fresh)?);

    let pinned = pin_for_read(&ct, &fresh, &tree, &FetchPolicy::All, None, &[])?;
    assert_eq!(pinned.basement(0).unwrap().entries[0].key(), b"zzz");
    unpin(&ct, pinned, false)?;

    let err = put_new_node(&ct, fresh, Node::new_leaf(fresh.blocknum, Vec::new())).unwrap_err();
    assert!(matches!(err, FtError::Invalid(_)));
    Ok(())
}

#[test]
fn loader_memory_comes_out_of_the_cache_budget() -> Result<()> {
    let dir = tempdir()?;
    let tree = build(dir.path())?;
    let ct = SimpleCacheTable::new(4 << 20);
    let leaf = tree.key(first_leaf(&tree)?);
    let pinned = pin_for_read(&ct, &leaf, &tree, &FetchPolicy::All, None, &[])?;
    unpin(&ct, pinned, false)?;
    let used = ct.memory_used();
    assert!(used > 0);

    let budget = reserve_loader_memory(&ct, 0.5);
    assert_eq!(budget, ((4 << 20) - used) / 2);
    assert_eq!(ct.memory_reserved(), budget);
    // a second reservation only sees what is left
    let more = reserve_loader_memory(&ct, 1.0);
    assert_eq!(more, (4 << 20) - used - budget);

    let path = dir.path().join("reserved.ft");
    let opts = LoaderOptions::default().memory_budget(budget as usize).temp_dir(dir.path());
    let mut loader = open_loader(vec![IndexSpec::new(&path)], opts, Arc::new(FtContext::serial()))?;
    loader.put(b"k", b"v")?;
    assert_eq!(loader.close()?.rows_put, 1);

    ct.release_reserved_memory(budget + more);
    assert_eq!(ct.memory_reserved(), 0);
    Ok(())
}
