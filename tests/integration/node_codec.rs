#![allow(missing_docs)]

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use fractree::{
    primitives::compress::CompressionMethod,
    storage::{
        ft::{
            bytewise, serialize_node, Basement, BytewiseComparator, ChildBuffer, FetchPolicy,
            FileHeader, FtContext, FtTree, LeafEntry, Message, MessageType, Node, Partition,
            PartitionState, SerializeOptions, TxnRecord,
        },
        loader::Dbout,
        TreeOptions,
    },
    types::{BlockNum, FileId, FtError, Msn, Result, TxnId},
};
use tempfile::tempdir;

fn entries(range: std::ops::Range<u32>) -> Vec<LeafEntry> {
    range
        .map(|i| {
            let key = format!("key{i:04}").into_bytes();
            if i % 5 == 0 {
                LeafEntry::Mvcc {
                    key,
                    committed: vec![TxnRecord::insert(TxnId(1), format!("old{i}"))],
                    provisional: vec![TxnRecord::delete(TxnId(9)), TxnRecord::insert(TxnId(10), "new")],
                }
            } else {
                LeafEntry::clean(key, format!("value-{i}").repeat(3))
            }
        })
        .collect()
}

fn message(kind: MessageType, msn: u64, key: &str) -> Message {
    Message {
        kind,
        msn: Msn(msn),
        xids: vec![TxnId(msn % 3)],
        key: key.as_bytes().to_vec(),
        val: format!("payload-{msn}").into_bytes(),
        fresh: msn % 2 == 0,
    }
}

/// Writes `nodes` into a tree file whose root is the first node.
fn write_file(path: &Path, method: CompressionMethod, nodes: &mut [Node]) -> Result<()> {
    let tree_opts = TreeOptions::default()
        .compression(method)
        .basement_node_size(256);
    let mut ser = SerializeOptions::from_tree(&tree_opts);
    ser.rebalance = false;
    let ctx = FtContext::serial();
    let out = Dbout::create(path, 1 << 16)?;
    for node in nodes.iter_mut() {
        let written = serialize_node(node, &ser, &ctx)?;
        out.write_block(node.blocknum, &written.bytes)?;
    }
    let header = FileHeader::new(tree_opts.node_size, tree_opts.basement_node_size, method, tree_opts.fanout);
    out.finish(nodes[0].blocknum, header)?;
    Ok(())
}

fn open(path: &Path) -> Result<FtTree> {
    FtTree::open(path, FileId(3), bytewise(), Arc::new(FtContext::serial()))
}

fn basements(node: &Node) -> Vec<&Basement> {
    node.children
        .iter()
        .map(|c| match &c.state {
            PartitionState::Avail(Partition::Basement(bn)) => bn,
            other => panic!("partition not decoded: {other:?}"),
        })
        .collect()
}

fn leaf(blocknum: u64) -> Node {
    Node::leaf_from_basements(
        BlockNum(blocknum),
        vec![
            Basement::new(entries(0..20)),
            Basement::new(entries(20..45)),
            Basement::new(entries(45..50)),
        ],
    )
}

fn internal(blocknum: u64, children: Vec<BlockNum>) -> Result<Node> {
    let mut node = Node::new_internal(
        BlockNum(blocknum),
        1,
        vec![b"key0019".to_vec(), b"key0044".to_vec()],
        children,
    )?;
    let buffers = [
        vec![
            message(MessageType::Insert, 4, "key0003"),
            message(MessageType::DeleteAny, 7, "key0001"),
        ],
        vec![],
        vec![
            message(MessageType::Insert, 5, "key0047"),
            message(MessageType::CommitBroadcastAll, 6, ""),
        ],
    ];
    for (child, msgs) in node.children.iter_mut().zip(buffers) {
        child.state = PartitionState::Avail(Partition::Buffer(ChildBuffer::from_messages(
            msgs,
            Some(&BytewiseComparator),
        )));
    }
    node.max_msn_applied_on_disk = Msn(7);
    Ok(node)
}

#[test]
fn leaf_roundtrips_through_a_tree_file_with_every_method() -> Result<()> {
    let dir = tempdir()?;
    for method in [
        CompressionMethod::None,
        CompressionMethod::Default,
        CompressionMethod::Fast,
        CompressionMethod::Small,
        CompressionMethod::Zlib,
        CompressionMethod::QuickLz,
        CompressionMethod::Lzma,
        CompressionMethod::ZlibNoChecksum,
    ] {
        let path = dir.path().join(format!("leaf-{}.ft", method.tag()));
        let original = leaf(3);
        write_file(&path, method, &mut [original.clone()])?;

        let tree = open(&path)?;
        assert_eq!(tree.header().compression, method);
        let node = tree.read_node(BlockNum(3), &FetchPolicy::All)?;
        assert!(node.is_leaf());
        assert!(!node.dirty);
        assert_eq!(node.pivots, original.pivots);
        assert_eq!(basements(&node), basements(&original));
    }
    Ok(())
}

#[test]
fn internal_node_keeps_buffers_children_and_watermark() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("internal.ft");
    let children = vec![BlockNum(4), BlockNum(5), BlockNum(6)];
    let original = internal(3, children.clone())?;
    write_file(&path, CompressionMethod::Default, &mut [original.clone(), leaf(4)])?;

    let tree = open(&path)?;
    assert_eq!(tree.root(), Some(BlockNum(3)));
    let node = tree.read_node(BlockNum(3), &FetchPolicy::All)?;
    assert_eq!(node.height, 1);
    assert_eq!(node.max_msn_applied_on_disk, Msn(7));
    assert_eq!(node.children.iter().map(|c| c.blocknum).collect::<Vec<_>>(), children);
    for i in 0..3 {
        assert_eq!(
            node.buffer(i).unwrap().messages(),
            original.buffer(i).unwrap().messages()
        );
    }
    assert_eq!(node.buffer(2).unwrap().broadcast().count(), 1);
    Ok(())
}

#[test]
fn key_policy_decodes_only_the_matching_partition() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("policy.ft");
    write_file(&path, CompressionMethod::Zlib, &mut [leaf(3)])?;
    let tree = open(&path)?;
    let node = tree.read_node(BlockNum(3), &FetchPolicy::Key(b"key0030".to_vec()))?;
    let avail: Vec<bool> = node.children.iter().map(|c| c.state.is_avail()).collect();
    assert_eq!(avail, [false, true, false]);
    assert!(matches!(node.children[0].state, PartitionState::Compressed(_)));

    let range = FetchPolicy::Range {
        left: Some(b"key0010".to_vec()),
        right: Some(b"key0030".to_vec()),
    };
    let node = tree.read_node(BlockNum(3), &range)?;
    let avail: Vec<bool> = node.children.iter().map(|c| c.state.is_avail()).collect();
    assert_eq!(avail, [true, true, false]);
    Ok(())
}

#[test]
fn header_only_read_then_partition_fetch() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("header.ft");
    let original = leaf(3);
    write_file(&path, CompressionMethod::Fast, &mut [original.clone()])?;
    let tree = open(&path)?;

    let mut node = tree.read_node_header(BlockNum(3))?;
    assert_eq!(node.n_children(), 3);
    assert_eq!(node.pivots, original.pivots);
    assert!(node
        .children
        .iter()
        .all(|c| matches!(c.state, PartitionState::OnDisk)));

    tree.fetch_partition(&mut node, 1)?;
    match &node.children[1].state {
        PartitionState::Avail(Partition::Basement(bn)) => {
            assert_eq!(bn.entries, original.basement(1).unwrap().entries);
        }
        other => panic!("partition 1 not decoded: {other:?}"),
    }
    assert!(matches!(node.children[0].state, PartitionState::OnDisk));
    Ok(())
}

#[test]
fn corrupted_block_is_reported_as_corruption() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("corrupt.ft");
    write_file(&path, CompressionMethod::None, &mut [leaf(3)])?;
    let loc = open(&path)?.translation().get(BlockNum(3)).unwrap();

    let mut file = OpenOptions::new().write(true).open(&path)?;
    // a key byte inside the first basement
    file.seek(SeekFrom::Start(loc.offset + 200))?;
    file.write_all(&[0xFF])?;
    drop(file);

    let tree = open(&path)?;
    let err = tree.read_node(BlockNum(3), &FetchPolicy::All).unwrap_err();
    assert!(err.is_corruption(), "{err}");
    assert!(matches!(err, FtError::BadChecksum { .. } | FtError::BadFormat(_) | FtError::BadFormatDetail(_)));
    Ok(())
}

#[test]
fn missing_block_is_a_format_error() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("missing.ft");
    write_file(&path, CompressionMethod::None, &mut [leaf(3)])?;
    let tree = open(&path)?;
    let err = tree.read_node(BlockNum(40), &FetchPolicy::None).unwrap_err();
    assert!(err.is_corruption());
    Ok(())
}
