//! Read access to a finished tree file.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::primitives::io::{eof_as_truncation, FileIo, StdFileIo};
use crate::types::{layout, BlockNum, FileId, FtError, Result};

use super::cachetable::{CacheKey, NodeFetcher, PairAttr};
use super::comparator::{Comparator, SharedComparator};
use super::context::FtContext;
use super::deserialize::{deserialize_node, deserialize_node_header, fetch_partition};
use super::header::{BlockLocation, Descriptor, FileHeader, TranslationTable};
use super::node::{FetchPolicy, Node, PartitionState};

/// Bytes read up front when only a node's header is wanted.
const HEADER_PREFIX: u64 = 4096;

/// Read-only handle on a tree file.
pub struct FtTree {
    path: PathBuf,
    io: StdFileIo,
    file: FileId,
    header: FileHeader,
    translation: TranslationTable,
    descriptor: Descriptor,
    cmp: SharedComparator,
    ctx: Arc<FtContext>,
}

impl fmt::Debug for FtTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FtTree")
            .field("path", &self.path)
            .field("file", &self.file)
            .field("root", &self.header.root)
            .finish()
    }
}

impl FtTree {
    /// Opens `path`, verifying the header, translation table, and descriptor.
    pub fn open(
        path: impl AsRef<Path>,
        file: FileId,
        cmp: SharedComparator,
        ctx: Arc<FtContext>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let io = StdFileIo::open_read(&path)?;
        let mut head = vec![0u8; layout::HEADER_RESERVED as usize];
        io.read_at(0, &mut head).map_err(eof_as_truncation)?;
        let header = FileHeader::decode(&head)?;

        let mut table = vec![0u8; header.translation_size as usize];
        io.read_at(header.translation_offset, &mut table)
            .map_err(eof_as_truncation)?;
        let translation = TranslationTable::decode(&table)?;
        let recorded = translation.get(BlockNum::TRANSLATION);
        let expected = BlockLocation {
            offset: header.translation_offset,
            size: header.translation_size,
        };
        if recorded != Some(expected) {
            return Err(FtError::BadFormat("translation table does not describe itself"));
        }
        if header.root != BlockNum::NULL && translation.get(header.root).is_none() {
            return Err(FtError::BadFormat("root block missing from translation table"));
        }

        let mut tree = Self {
            path,
            io,
            file,
            header,
            translation,
            descriptor: Descriptor::default(),
            cmp,
            ctx,
        };
        if tree.translation.get(BlockNum::DESCRIPTOR).is_some() {
            tree.descriptor = Descriptor::decode(&tree.read_block(BlockNum::DESCRIPTOR)?)?;
        }
        debug!(
            path = %tree.path.display(),
            root = tree.header.root.0,
            blocks = tree.translation.iter().count(),
            "ft.tree.open"
        );
        Ok(tree)
    }

    /// Path the tree was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File id its cache keys carry.
    pub fn file_id(&self) -> FileId {
        self.file
    }

    /// Header read from block 0.
    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Block locations, indexed by blocknum.
    pub fn translation(&self) -> &TranslationTable {
        &self.translation
    }

    /// Descriptor stored at blocknum 2.
    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    /// Shared codec context.
    pub fn context(&self) -> &Arc<FtContext> {
        &self.ctx
    }

    /// Key order of the tree.
    pub fn cmp(&self) -> &dyn Comparator {
        self.cmp.as_ref()
    }

    /// Root block, or `None` for an empty tree.
    pub fn root(&self) -> Option<BlockNum> {
        (self.header.root != BlockNum::NULL).then_some(self.header.root)
    }

    /// Cache key of `blocknum` in this file.
    pub fn key(&self, blocknum: BlockNum) -> CacheKey {
        CacheKey::new(self.file, blocknum)
    }

    fn location(&self, blocknum: BlockNum) -> Result<BlockLocation> {
        self.translation
            .get(blocknum)
            .ok_or_else(|| FtError::BadFormatDetail(format!("block {blocknum} is not allocated")))
    }

    /// Raw bytes of `blocknum`.
    pub fn read_block(&self, blocknum: BlockNum) -> Result<Vec<u8>> {
        let loc = self.location(blocknum)?;
        let mut buf = vec![0u8; loc.size as usize];
        self.io
            .read_at(loc.offset, &mut buf)
            .map_err(eof_as_truncation)?;
        Ok(buf)
    }

    /// Reads and decodes a node, materializing what `policy` asks for.
    pub fn read_node(&self, blocknum: BlockNum, policy: &FetchPolicy) -> Result<Node> {
        let bytes = self.read_block(blocknum)?;
        let mut node = deserialize_node(&bytes, blocknum, policy, Some(self.cmp()), &self.ctx)
            .map_err(|err| self.annotate(blocknum, err))?;
        node.fullhash = self.key(blocknum).fullhash;
        Ok(node)
    }

    /// Reads only the header and node info of a node when a prefix of the
    /// block suffices; falls back to a full read otherwise.
    pub fn read_node_header(&self, blocknum: BlockNum) -> Result<Node> {
        let loc = self.location(blocknum)?;
        let mut prefix = vec![0u8; loc.size.min(HEADER_PREFIX) as usize];
        self.io
            .read_at(loc.offset, &mut prefix)
            .map_err(eof_as_truncation)?;
        let node = match deserialize_node_header(&prefix, blocknum) {
            Ok(Some(node)) => node,
            Ok(None) => self.read_node(blocknum, &FetchPolicy::None)?,
            Err(err) => return Err(self.annotate(blocknum, err)),
        };
        Ok(Node {
            fullhash: self.key(blocknum).fullhash,
            ..node
        })
    }

    /// Brings partition `i` of `node` into memory.
    pub fn fetch_partition(&self, node: &mut Node, i: usize) -> Result<()> {
        let block = match node.children.get(i).map(|c| &c.state) {
            Some(PartitionState::OnDisk) => self.read_block(node.blocknum)?,
            _ => Vec::new(),
        };
        fetch_partition(node, i, &block, Some(self.cmp()))
    }

    fn annotate(&self, blocknum: BlockNum, err: FtError) -> FtError {
        if err.is_corruption() {
            warn!(
                path = %self.path.display(),
                blocknum = blocknum.0,
                error = %err,
                "ft.corruption"
            );
        }
        err
    }
}

impl NodeFetcher for FtTree {
    fn fetch(&self, key: &CacheKey, policy: &FetchPolicy) -> Result<(Node, PairAttr)> {
        if key.file != self.file {
            return Err(FtError::Invalid("cache key names another file"));
        }
        let node = self.read_node(key.blocknum, policy)?;
        let attr = PairAttr::of(&node);
        Ok((node, attr))
    }

    fn partial_fetch_required(&self, node: &Node, policy: &FetchPolicy) -> bool {
        (0..node.n_children()).any(|i| {
            !node.children[i].state.is_avail()
                && policy.wants(node, i, Some(self.cmp())).unwrap_or(true)
        })
    }

    fn partial_fetch(&self, node: &mut Node, policy: &FetchPolicy) -> Result<PairAttr> {
        let mut block: Option<Vec<u8>> = None;
        for i in 0..node.n_children() {
            if node.children[i].state.is_avail() || !policy.wants(node, i, Some(self.cmp()))? {
                continue;
            }
            if matches!(node.children[i].state, PartitionState::OnDisk) && block.is_none() {
                block = Some(self.read_block(node.blocknum)?);
            }
            fetch_partition(node, i, block.as_deref().unwrap_or(&[]), Some(self.cmp()))?;
        }
        Ok(PairAttr::of(node))
    }

    fn comparator(&self) -> Option<&dyn Comparator> {
        Some(self.cmp())
    }
}
