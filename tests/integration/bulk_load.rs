#![allow(missing_docs)]

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use fractree::{
    admin::{verify_tree, VerifyLevel},
    primitives::compress::CompressionMethod,
    storage::{
        ft::{
            bytewise, CursorPosition, FetchPolicy, FtContext, FtTree, LeCursor, Node, Partition,
            PartitionState, SharedComparator, SimpleCacheTable,
        },
        loader::{open_loader, GeneratedRows, IndexSpec, LoadReport, SharedRowGenerator},
        LoaderOptions, TreeOptions,
    },
    types::{FileId, FtError, Result},
};
use parking_lot::Mutex;
use rand::{seq::SliceRandom, Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

const PREFIX: &str = "bulkld";

fn small_opts(dir: &Path) -> LoaderOptions {
    LoaderOptions::default()
        .memory_budget(8 << 10)
        .io_buffer_size(512)
        .temp_dir(dir)
        .temp_prefix(PREFIX)
        .tree(
            TreeOptions::default()
                .node_size(4096)
                .basement_node_size(1024)
                .fanout(4),
        )
}

fn spill_files_left(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with(PREFIX))
        .count()
}

fn open(path: &Path, cmp: SharedComparator) -> FtTree {
    FtTree::open(path, FileId(1), cmp, Arc::new(FtContext::serial())).unwrap()
}

fn scan(tree: &FtTree) -> Vec<(Vec<u8>, Vec<u8>)> {
    let ct = SimpleCacheTable::new(64 << 20);
    let mut cursor = LeCursor::create(tree, &ct);
    let mut rows = Vec::new();
    while cursor.advance().unwrap() {
        let entry = cursor.current().unwrap();
        rows.push((entry.key().to_vec(), entry.committed_value().unwrap().to_vec()));
    }
    assert_eq!(cursor.position(), &CursorPosition::PositiveInfinity);
    cursor.close();
    rows
}

fn load(path: &Path, opts: LoaderOptions, rows: &[(Vec<u8>, Vec<u8>)]) -> Result<LoadReport> {
    let mut loader = open_loader(vec![IndexSpec::new(path)], opts, Arc::new(FtContext::serial()))?;
    for (k, v) in rows {
        loader.put(k, v)?;
    }
    loader.close()
}

fn random_rows(seed: u64, n: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut unique = BTreeMap::new();
    while unique.len() < n {
        let klen = rng.gen_range(4..24);
        let key: Vec<u8> = (0..klen).map(|_| rng.gen()).collect();
        let vlen = rng.gen_range(0..40);
        let val: Vec<u8> = (0..vlen).map(|_| rng.gen()).collect();
        unique.insert(key, val);
    }
    let mut rows: Vec<_> = unique.into_iter().collect();
    rows.shuffle(&mut rng);
    rows
}

#[test]
fn five_rows_in_two_leaves_scan_in_order() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("five.ft");
    // each row is an 11 byte leaf entry; a 48 byte node closes after three
    let opts = LoaderOptions::default()
        .temp_dir(dir.path())
        .temp_prefix(PREFIX)
        .tree(TreeOptions::default().node_size(48).basement_node_size(32));
    let input: Vec<(Vec<u8>, Vec<u8>)> = [("a", "1"), ("c", "3"), ("b", "2"), ("e", "5"), ("d", "4")]
        .iter()
        .map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec()))
        .collect();
    let report = load(&path, opts, &input)?;
    assert_eq!(report.rows_put, 5);
    assert_eq!(report.indexes[0].leaves, 2);
    assert_eq!(report.indexes[0].height, 1);

    let tree = open(&path, bytewise());
    let ct = SimpleCacheTable::new(1 << 20);
    let mut cursor = LeCursor::create(&tree, &ct);
    assert!(cursor.is_key_right_of_cursor(b"c"));
    let mut seen = Vec::new();
    let mut right_of = Vec::new();
    while cursor.advance()? {
        let entry = cursor.current().unwrap();
        seen.push(String::from_utf8(entry.key().to_vec()).unwrap());
        right_of.push(cursor.is_key_right_of_cursor(b"c"));
    }
    assert_eq!(seen, ["a", "b", "c", "d", "e"]);
    assert_eq!(right_of, [true, true, false, false, false]);
    assert!(!cursor.is_key_right_of_cursor(b"c"));
    cursor.close();
    assert_eq!(spill_files_left(dir.path()), 0);
    Ok(())
}

#[test]
fn duplicate_across_rowsets_fails_without_leftovers() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("dup.ft");
    let dups = Arc::new(Mutex::new(Vec::new()));
    let sink = dups.clone();
    let opts = small_opts(dir.path()).on_duplicate(Arc::new(move |index, key, _val| {
        sink.lock().push((index, key.to_vec()));
    }));
    let mut loader = open_loader(vec![IndexSpec::new(&path)], opts, Arc::new(FtContext::serial()))?;
    let budget = loader.rowset_budget();
    let mut rows = 0usize;
    for i in 0..1000u32 {
        loader.put(format!("key{i:05}").as_bytes(), b"first")?;
        rows += 1;
    }
    assert!(rows * 16 > budget, "rows must span several rowsets");
    loader.put(b"key00000", b"again")?;
    let err = loader.close().unwrap_err();
    match err {
        FtError::DuplicateKey { index, key } => {
            assert_eq!(index, 0);
            assert_eq!(key, b"key00000");
        }
        other => panic!("expected a duplicate key error, got {other}"),
    }
    assert_eq!(*dups.lock(), vec![(0, b"key00000".to_vec())]);
    assert_eq!(spill_files_left(dir.path()), 0);
    assert!(!path.exists());
    Ok(())
}

#[test]
fn many_spill_files_merge_in_several_passes() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("merge.ft");
    let rows = random_rows(7, 6000);
    let report = load(&path, small_opts(dir.path()), &rows)?;
    let index = &report.indexes[0];
    assert_eq!(index.rows, 6000);
    assert!(index.spill_files > 8, "spill files: {}", index.spill_files);
    assert!(index.merge_passes >= 2);
    assert!(report.rowsets > 1);
    assert_eq!(spill_files_left(dir.path()), 0);

    let mut expected = rows.clone();
    expected.sort();
    let tree = open(&path, bytewise());
    assert_eq!(scan(&tree), expected);

    let verified = verify_tree(&path, bytewise(), VerifyLevel::Full)?;
    assert!(verified.success, "{:?}", verified.findings);
    assert_eq!(verified.counts.entries, 6000);
    assert_eq!(verified.counts.leaves, index.leaves);
    Ok(())
}

#[test]
fn compressed_intermediates_give_the_same_tree_contents() -> Result<()> {
    let dir = tempdir()?;
    let rows = random_rows(11, 2500);
    let plain = dir.path().join("plain.ft");
    let packed = dir.path().join("packed.ft");
    load(&plain, small_opts(dir.path()), &rows)?;
    for method in [CompressionMethod::Fast, CompressionMethod::Zlib, CompressionMethod::Small] {
        load(&packed, small_opts(dir.path()).compress_intermediates(method), &rows)?;
        assert_eq!(scan(&open(&plain, bytewise())), scan(&open(&packed, bytewise())));
    }
    assert_eq!(spill_files_left(dir.path()), 0);
    Ok(())
}

fn subtree_bounds(tree: &FtTree, node: &Node) -> (Vec<u8>, Vec<u8>) {
    if node.is_leaf() {
        let keys: Vec<Vec<u8>> = node
            .children
            .iter()
            .filter_map(|c| match &c.state {
                PartitionState::Avail(Partition::Basement(bn)) => Some(bn),
                _ => None,
            })
            .flat_map(|bn| bn.entries.iter().map(|e| e.key().to_vec()))
            .collect();
        return (keys.first().cloned().unwrap(), keys.last().cloned().unwrap());
    }
    let mut lo = None;
    let mut hi = Vec::new();
    for (i, child) in node.children.iter().enumerate() {
        let child = tree.read_node(child.blocknum, &FetchPolicy::All).unwrap();
        let (min, max) = subtree_bounds(tree, &child);
        if i > 0 {
            assert!(node.pivots.get(i - 1).unwrap() < min.as_slice());
        }
        if let Some(pivot) = node.pivots.get(i) {
            assert!(pivot >= max.as_slice());
        }
        lo.get_or_insert(min);
        hi = max;
    }
    (lo.unwrap(), hi)
}

#[test]
fn internal_pivots_separate_their_subtrees() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("pivots.ft");
    let rows = random_rows(3, 4000);
    let report = load(&path, small_opts(dir.path()), &rows)?;
    assert!(report.indexes[0].height >= 2);
    let tree = open(&path, bytewise());
    let root = tree.read_node(tree.root().unwrap(), &FetchPolicy::All)?;
    let (min, max) = subtree_bounds(&tree, &root);
    let mut keys: Vec<_> = rows.iter().map(|(k, _)| k.clone()).collect();
    keys.sort();
    assert_eq!(min, keys[0]);
    assert_eq!(&max, keys.last().unwrap());
    Ok(())
}

#[test]
fn empty_load_writes_an_empty_tree() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("empty.ft");
    let report = load(&path, small_opts(dir.path()), &[])?;
    assert_eq!(report.rows_put, 0);
    assert_eq!(report.rowsets, 0);
    assert_eq!(report.indexes[0].rows, 0);
    assert_eq!(report.indexes[0].leaves, 1);
    let tree = open(&path, bytewise());
    assert!(scan(&tree).is_empty());
    assert!(verify_tree(&path, bytewise(), VerifyLevel::Full)?.success);
    Ok(())
}

#[test]
fn several_indexes_from_one_stream() -> Result<()> {
    let dir = tempdir()?;
    let primary = dir.path().join("primary.ft");
    let secondary = dir.path().join("secondary.ft");
    let reversed: SharedComparator = Arc::new(|a: &[u8], b: &[u8]| b.cmp(a));
    // secondary index: value becomes the key, the primary key the value
    let swap: SharedRowGenerator =
        Arc::new(|_index: usize, key: &[u8], val: &[u8]| -> Result<GeneratedRows> {
            Ok(vec![(val.to_vec(), key.to_vec())])
        });
    let indexes = vec![
        IndexSpec::new(&primary).descriptor(1, b"primary".to_vec()),
        IndexSpec::new(&secondary)
            .comparator(reversed.clone())
            .row_generator(swap)
            .descriptor(7, b"by value".to_vec()),
    ];
    let mut loader = open_loader(indexes, small_opts(dir.path()), Arc::new(FtContext::serial()))?;
    for i in 0..3000u32 {
        loader.put(&i.to_be_bytes(), format!("v{:08}", 3000 - i).as_bytes())?;
    }
    let report = loader.close()?;
    assert_eq!(report.indexes.len(), 2);
    assert!(report.indexes.iter().all(|ix| ix.rows == 3000));

    let p = open(&primary, bytewise());
    assert_eq!(p.descriptor().bytes, b"primary");
    let rows = scan(&p);
    assert_eq!(rows.first().unwrap().0, 0u32.to_be_bytes());
    assert_eq!(rows.last().unwrap().0, 2999u32.to_be_bytes());

    let s = open(&secondary, reversed.clone());
    assert_eq!(s.descriptor().version, 7);
    let rows = scan(&s);
    assert_eq!(rows.len(), 3000);
    assert!(rows.windows(2).all(|w| reversed.compare(&w[0].0, &w[1].0) == Ordering::Less));
    assert_eq!(rows[0].0, b"v00003000");
    assert_eq!(rows[0].1, 0u32.to_be_bytes());
    assert!(verify_tree(&secondary, reversed, VerifyLevel::Full)?.success);
    Ok(())
}

#[test]
fn reverse_cursor_walks_back_from_the_end() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("rev.ft");
    let rows: Vec<_> = (0..1500u32)
        .map(|i| (i.to_be_bytes().to_vec(), b"x".to_vec()))
        .collect();
    load(&path, small_opts(dir.path()), &rows)?;
    let tree = open(&path, bytewise());
    let ct = SimpleCacheTable::new(16 << 20);
    let mut cursor = LeCursor::create_reverse(&tree, &ct);
    let mut keys = Vec::new();
    while cursor.advance()? {
        keys.push(u32::from_be_bytes(cursor.current().unwrap().key().try_into().unwrap()));
    }
    assert_eq!(cursor.position(), &CursorPosition::NegativeInfinity);
    assert_eq!(keys, (0..1500).rev().collect::<Vec<_>>());
    Ok(())
}

#[test]
fn progress_is_monotonic_and_finishes_at_one() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("progress.ft");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let opts = small_opts(dir.path()).progress(Arc::new(move |f| {
        sink.lock().push(f);
        true
    }));
    load(&path, opts, &random_rows(5, 3000))?;
    let seen = seen.lock();
    assert!(seen.len() > 2);
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(*seen.last().unwrap(), 1.0);
    Ok(())
}
