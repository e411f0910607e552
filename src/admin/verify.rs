use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::storage::ft::comparator::{Comparator, SharedComparator};
use crate::storage::ft::context::FtContext;
use crate::storage::ft::node::{FetchPolicy, Node, Partition, PartitionState};
use crate::storage::ft::tree::FtTree;
use crate::types::{BlockNum, FileId, Result};

const MAX_FINDINGS: usize = 64;

/// Specifies the depth of verification checks to perform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyLevel {
    /// Header, translation table, and node headers; partitions stay on disk.
    Fast,
    /// Every partition is decoded and every key checked.
    Full,
}

/// Indicates the severity level of a verification finding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifySeverity {
    /// Informational message about the verification process.
    Info,
    /// Suspicious but readable.
    Warning,
    /// Corruption or a broken ordering invariant.
    Error,
}

/// A single issue discovered during verification.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyFinding {
    /// How serious the finding is.
    pub severity: VerifySeverity,
    /// Node the finding is about, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocknum: Option<u64>,
    /// What was wrong.
    pub message: String,
}

/// Totals gathered while walking the tree.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VerifyCounts {
    /// Nodes read.
    pub nodes: u64,
    /// Leaf nodes among them.
    pub leaves: u64,
    /// Nonleaf nodes among them.
    pub internal_nodes: u64,
    /// Basements across every leaf read.
    pub basements: u64,
    /// Leaf entries seen (full level only).
    pub entries: u64,
    /// Buffered messages seen (full level only).
    pub messages: u64,
    /// Height of the root, 0 for a single leaf.
    pub height: u32,
    /// Translation table slots in use, reserved blocks included.
    pub blocks_allocated: u64,
}

/// Complete report of a verification run.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyReport {
    /// File that was checked.
    pub path: PathBuf,
    /// How far the walk went.
    pub level: VerifyLevel,
    /// True when nothing of warning or error severity was found.
    pub success: bool,
    /// Every finding, in walk order.
    pub findings: Vec<VerifyFinding>,
    /// What the walk saw.
    pub counts: VerifyCounts,
}

/// Checks a tree file.
///
/// Walks every node reachable from the root and checks block checksums,
/// child heights, pivot order, and that each child's keys lie inside the
/// range its parent's pivots give it: above the previous pivot and at most
/// the next one. The full level also decodes every partition and checks that
/// leaf keys are strictly ascending across the whole tree.
///
/// Corruption found while opening the file is reported as a finding. Other
/// I/O failures are returned as errors.
pub fn verify_tree(path: impl AsRef<Path>, cmp: SharedComparator, level: VerifyLevel) -> Result<VerifyReport> {
    let path = path.as_ref().to_path_buf();
    let mut walk = Walk::new(level);
    let tree = match FtTree::open(&path, FileId(0), cmp, Arc::new(FtContext::serial())) {
        Ok(tree) => Some(tree),
        Err(err) if err.is_corruption() => {
            walk.error(None, format!("cannot open tree: {err}"));
            None
        }
        Err(err) => return Err(err),
    };
    if let Some(tree) = &tree {
        walk.counts.blocks_allocated = tree.translation().iter().count() as u64;
        if let Some(root) = tree.root() {
            walk.run(tree, root)?;
            walk.check_reachability(tree);
        } else {
            walk.info(None, "tree has no root");
        }
    }
    let success = !walk
        .findings
        .iter()
        .any(|f| f.severity != VerifySeverity::Info);
    info!(
        path = %path.display(),
        success,
        findings = walk.findings.len(),
        nodes = walk.counts.nodes,
        "admin.verify"
    );
    Ok(VerifyReport {
        path,
        level,
        success,
        findings: walk.findings,
        counts: walk.counts,
    })
}

/// Key range a subtree must stay inside: `(lower, upper]`.
#[derive(Clone, Debug, Default)]
struct Bounds {
    lower: Option<Vec<u8>>,
    upper: Option<Vec<u8>>,
}

impl Bounds {
    fn contains(&self, cmp: &dyn Comparator, key: &[u8]) -> bool {
        let above = self
            .lower
            .as_deref()
            .map_or(true, |lo| cmp.compare(key, lo) == Ordering::Greater);
        let below = self
            .upper
            .as_deref()
            .map_or(true, |hi| cmp.compare(key, hi) != Ordering::Greater);
        above && below
    }
}

struct Pending {
    blocknum: BlockNum,
    expected_height: Option<u32>,
    bounds: Bounds,
    /// `bounds.upper` should equal this subtree's largest key.
    tight_upper: bool,
}

struct Walk {
    level: VerifyLevel,
    findings: Vec<VerifyFinding>,
    suppressed: usize,
    counts: VerifyCounts,
    visited: HashSet<BlockNum>,
    last_key: Option<Vec<u8>>,
}

impl Walk {
    fn new(level: VerifyLevel) -> Self {
        Self {
            level,
            findings: Vec::new(),
            suppressed: 0,
            counts: VerifyCounts::default(),
            visited: HashSet::new(),
            last_key: None,
        }
    }

    fn push(&mut self, severity: VerifySeverity, blocknum: Option<BlockNum>, message: impl Into<String>) {
        if self.findings.len() >= MAX_FINDINGS {
            self.suppressed += 1;
            return;
        }
        self.findings.push(VerifyFinding {
            severity,
            blocknum: blocknum.map(|b| b.0),
            message: message.into(),
        });
    }

    fn error(&mut self, blocknum: Option<BlockNum>, message: impl Into<String>) {
        self.push(VerifySeverity::Error, blocknum, message);
    }

    fn warning(&mut self, blocknum: Option<BlockNum>, message: impl Into<String>) {
        self.push(VerifySeverity::Warning, blocknum, message);
    }

    fn info(&mut self, blocknum: Option<BlockNum>, message: impl Into<String>) {
        self.push(VerifySeverity::Info, blocknum, message);
    }

    fn read(&mut self, tree: &FtTree, blocknum: BlockNum) -> Result<Option<Node>> {
        let res = match self.level {
            VerifyLevel::Fast => tree.read_node_header(blocknum),
            VerifyLevel::Full => tree.read_node(blocknum, &FetchPolicy::All),
        };
        match res {
            Ok(node) => Ok(Some(node)),
            Err(err) if err.is_corruption() => {
                self.error(Some(blocknum), format!("unreadable node: {err}"));
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Depth-first, left to right, so leaves are visited in key order.
    fn run(&mut self, tree: &FtTree, root: BlockNum) -> Result<()> {
        let cmp = tree.cmp();
        let mut stack = vec![Pending {
            blocknum: root,
            expected_height: None,
            bounds: Bounds::default(),
            tight_upper: false,
        }];
        while let Some(item) = stack.pop() {
            if !self.visited.insert(item.blocknum) {
                self.error(Some(item.blocknum), "node is reachable more than once");
                continue;
            }
            let Some(node) = self.read(tree, item.blocknum)? else {
                continue;
            };
            self.counts.nodes += 1;
            if item.expected_height.is_none() {
                self.counts.height = node.height;
            }
            if let Some(h) = item.expected_height {
                if node.height != h {
                    self.error(
                        Some(node.blocknum),
                        format!("height {} where {h} was expected", node.height),
                    );
                }
            }
            if let Err(err) = node.check_shape() {
                self.error(Some(node.blocknum), err.to_string());
                continue;
            }
            self.check_pivots(cmp, &node, &item.bounds);
            if node.is_leaf() {
                self.counts.leaves += 1;
                self.counts.basements += node.n_children() as u64;
                self.check_leaf(cmp, &node, &item);
            } else {
                self.counts.internal_nodes += 1;
                self.check_buffers(cmp, &node, &item.bounds);
                for i in (0..node.n_children()).rev() {
                    let lower = if i == 0 {
                        item.bounds.lower.clone()
                    } else {
                        node.pivots.get(i - 1).map(<[u8]>::to_vec)
                    };
                    let last = i + 1 == node.n_children();
                    let upper = if last {
                        item.bounds.upper.clone()
                    } else {
                        node.pivots.get(i).map(<[u8]>::to_vec)
                    };
                    stack.push(Pending {
                        blocknum: node.children[i].blocknum,
                        expected_height: Some(node.height.saturating_sub(1)),
                        bounds: Bounds { lower, upper },
                        tight_upper: !last || item.tight_upper,
                    });
                }
            }
            debug!(blocknum = node.blocknum.0, height = node.height, "admin.verify.node");
        }
        if self.suppressed > 0 {
            let n = self.suppressed;
            self.suppressed = 0;
            self.findings.push(VerifyFinding {
                severity: VerifySeverity::Info,
                blocknum: None,
                message: format!("{n} further findings suppressed"),
            });
        }
        Ok(())
    }

    fn check_pivots(&mut self, cmp: &dyn Comparator, node: &Node, bounds: &Bounds) {
        let pivots: Vec<&[u8]> = node.pivots.iter().collect();
        for w in pivots.windows(2) {
            if cmp.compare(w[0], w[1]) != Ordering::Less {
                self.error(Some(node.blocknum), "pivots are not strictly ascending");
                break;
            }
        }
        if pivots.iter().any(|p| !bounds.contains(cmp, p)) {
            self.error(Some(node.blocknum), "pivot outside the range given by the parent");
        }
    }

    fn check_leaf(&mut self, cmp: &dyn Comparator, node: &Node, item: &Pending) {
        if self.level == VerifyLevel::Fast {
            return;
        }
        let mut max_key: Option<Vec<u8>> = None;
        for (i, child) in node.children.iter().enumerate() {
            let PartitionState::Avail(Partition::Basement(bn)) = &child.state else {
                self.error(Some(node.blocknum), format!("basement {i} was not decoded"));
                continue;
            };
            let lower = if i == 0 {
                item.bounds.lower.clone()
            } else {
                node.pivots.get(i - 1).map(<[u8]>::to_vec)
            };
            let upper = if i + 1 == node.n_children() {
                item.bounds.upper.clone()
            } else {
                node.pivots.get(i).map(<[u8]>::to_vec)
            };
            let range = Bounds { lower, upper };
            for entry in &bn.entries {
                let key = entry.key();
                self.counts.entries += 1;
                if let Some(prev) = &self.last_key {
                    match cmp.compare(prev, key) {
                        Ordering::Less => {}
                        Ordering::Equal => {
                            self.error(Some(node.blocknum), "duplicate key");
                        }
                        Ordering::Greater => {
                            self.error(Some(node.blocknum), "keys out of order");
                        }
                    }
                }
                if !range.contains(cmp, key) {
                    self.error(
                        Some(node.blocknum),
                        format!("key in basement {i} outside its pivot range"),
                    );
                }
                self.last_key = Some(key.to_vec());
                max_key = Some(key.to_vec());
            }
        }
        // pivots written by a bulk load equal the largest key of their left subtree
        if let (true, Some(upper), Some(max)) = (item.tight_upper, &item.bounds.upper, &max_key) {
            if cmp.compare(upper, max) != Ordering::Equal {
                self.warning(
                    Some(node.blocknum),
                    "parent pivot is not the largest key of this subtree",
                );
            }
        }
    }

    fn check_buffers(&mut self, cmp: &dyn Comparator, node: &Node, bounds: &Bounds) {
        for i in 0..node.n_children() {
            let Some(buffer) = node.buffer(i) else {
                continue;
            };
            self.counts.messages += buffer.len() as u64;
            let outside = buffer
                .messages()
                .iter()
                .filter(|m| !m.kind.is_broadcast())
                .any(|m| !bounds.contains(cmp, &m.key));
            if outside {
                self.error(
                    Some(node.blocknum),
                    format!("buffer {i} holds a message outside the node's range"),
                );
            }
        }
    }

    fn check_reachability(&mut self, tree: &FtTree) {
        let unreachable: Vec<BlockNum> = tree
            .translation()
            .iter()
            .map(|(b, _)| b)
            .filter(|b| b.0 >= BlockNum::FIRST_FREE.0 && !self.visited.contains(b))
            .collect();
        for b in unreachable {
            self.warning(Some(b), "allocated block is not reachable from the root");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ft::comparator::bytewise;
    use crate::storage::loader::{open_loader, IndexSpec};
    use crate::storage::options::{LoaderOptions, TreeOptions};
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::tempdir;

    fn load(path: &Path, rows: u32) {
        let opts = LoaderOptions::default()
            .memory_budget(64 << 10)
            .temp_dir(path.parent().unwrap())
            .tree(TreeOptions::default().node_size(2048).basement_node_size(512).fanout(4));
        let mut loader = open_loader(vec![IndexSpec::new(path)], opts, Arc::new(FtContext::serial())).unwrap();
        for i in 0..rows {
            loader.put(&i.to_be_bytes(), format!("value-{i}").as_bytes()).unwrap();
        }
        loader.close().unwrap();
    }

    #[test]
    fn loaded_tree_verifies_clean() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ok.ft");
        load(&path, 3000);
        let report = verify_tree(&path, bytewise(), VerifyLevel::Full).unwrap();
        assert!(report.success, "{:?}", report.findings);
        assert_eq!(report.counts.entries, 3000);
        assert!(report.counts.height >= 2);
        assert_eq!(report.counts.nodes, report.counts.leaves + report.counts.internal_nodes);

        let fast = verify_tree(&path, bytewise(), VerifyLevel::Fast).unwrap();
        assert!(fast.success);
        assert_eq!(fast.counts.entries, 0);
        assert_eq!(fast.counts.nodes, report.counts.nodes);
        serde_json::to_string(&fast).unwrap();
    }

    #[test]
    fn flipped_byte_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.ft");
        load(&path, 500);
        let tree = FtTree::open(&path, FileId(0), bytewise(), Arc::new(FtContext::serial())).unwrap();
        let root = tree.root().unwrap();
        let loc = tree.translation().get(root).unwrap();
        drop(tree);

        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        // inside the node header, ahead of its checksum
        file.seek(SeekFrom::Start(loc.offset + 20)).unwrap();
        file.write_all(&[0xA5]).unwrap();
        drop(file);

        let report = verify_tree(&path, bytewise(), VerifyLevel::Full).unwrap();
        assert!(!report.success);
        assert!(report
            .findings
            .iter()
            .any(|f| f.severity == VerifySeverity::Error && f.blocknum == Some(root.0)));
    }

    #[test]
    fn wrong_comparator_breaks_ordering() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("order.ft");
        load(&path, 800);
        let reversed: SharedComparator = Arc::new(|a: &[u8], b: &[u8]| b.cmp(a));
        let report = verify_tree(&path, reversed, VerifyLevel::Full).unwrap();
        assert!(!report.success);
        assert!(report.findings.iter().any(|f| f.message.contains("out of order")));
    }

    #[test]
    fn garbage_file_is_a_finding() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("junk.ft");
        std::fs::write(&path, vec![7u8; 8192]).unwrap();
        let report = verify_tree(&path, bytewise(), VerifyLevel::Fast).unwrap();
        assert!(!report.success);
        assert_eq!(report.counts.nodes, 0);
    }
}
