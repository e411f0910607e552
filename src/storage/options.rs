use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::primitives::compress::CompressionMethod;

/// Default target size of a serialized node.
pub const DEFAULT_NODE_SIZE: u32 = 4 << 20;
/// Default target size of one basement partition.
pub const DEFAULT_BASEMENT_NODE_SIZE: u32 = 128 << 10;
/// Default number of children per internal node built by the loader.
pub const DEFAULT_FANOUT: u32 = 15;

/// Called with the fraction of work done; returning `false` cancels the load.
pub type ProgressCallback = Arc<dyn Fn(f64) -> bool + Send + Sync>;
/// Called with `(index, key, value)` when a duplicate key is found.
pub type DuplicateCallback = Arc<dyn Fn(usize, &[u8], &[u8]) + Send + Sync>;

/// Shape of the trees written by the serializer and the loader.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeOptions {
    /// Target serialized size of a node in bytes.
    pub node_size: u32,
    /// Target uncompressed size of a leaf basement.
    pub basement_node_size: u32,
    /// Compression applied to every sub-block.
    pub compression: CompressionMethod,
    /// Children per internal node built bottom-up.
    pub fanout: u32,
    /// When the loader closes a leaf.
    pub leaf_close: LeafClosePolicy,
    /// Compress partitions of one node on the rayon pool.
    pub parallel_serialize: bool,
    /// Largest single growth step of the output file.
    pub file_growth_increment: u64,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            node_size: DEFAULT_NODE_SIZE,
            basement_node_size: DEFAULT_BASEMENT_NODE_SIZE,
            compression: CompressionMethod::Default,
            fanout: DEFAULT_FANOUT,
            leaf_close: LeafClosePolicy::default(),
            parallel_serialize: true,
            file_growth_increment: 4 << 20,
        }
    }
}

impl TreeOptions {
    /// Sets the target node size.
    pub fn node_size(mut self, bytes: u32) -> Self {
        self.node_size = bytes;
        self
    }

    /// Sets the target basement size.
    pub fn basement_node_size(mut self, bytes: u32) -> Self {
        self.basement_node_size = bytes;
        self
    }

    /// Selects the sub-block compression.
    pub fn compression(mut self, method: CompressionMethod) -> Self {
        self.compression = method;
        self
    }

    /// Sets the internal-node fanout (at least 2).
    pub fn fanout(mut self, fanout: u32) -> Self {
        self.fanout = fanout.max(2);
        self
    }

    /// Replaces the leaf close thresholds.
    pub fn leaf_close(mut self, policy: LeafClosePolicy) -> Self {
        self.leaf_close = policy;
        self
    }

    /// Enables or disables parallel partition compression.
    pub fn parallel_serialize(mut self, enabled: bool) -> Self {
        self.parallel_serialize = enabled;
        self
    }

    /// Sets the output file growth increment.
    pub fn file_growth_increment(mut self, bytes: u64) -> Self {
        self.file_growth_increment = bytes;
        self
    }
}

/// Thresholds deciding when the loader closes the leaf it is filling.
///
/// A leaf closes when the next row would push it past
/// `node_size * fill_numerator / fill_denominator`, or when the balance rule
/// fires: the leaf already holds at least `balance_numerator /
/// balance_denominator` of what is left (itself included) and what is left
/// after it would not fill another node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeafClosePolicy {
    /// Numerator of the fill fraction.
    pub fill_numerator: u32,
    /// Denominator of the fill fraction.
    pub fill_denominator: u32,
    /// Numerator of the balance fraction.
    pub balance_numerator: u32,
    /// Denominator of the balance fraction.
    pub balance_denominator: u32,
}

impl Default for LeafClosePolicy {
    fn default() -> Self {
        Self {
            fill_numerator: 7,
            fill_denominator: 8,
            balance_numerator: 1,
            balance_denominator: 2,
        }
    }
}

impl LeafClosePolicy {
    /// Bytes at which a leaf counts as full for `node_size`.
    pub fn full_size(&self, node_size: u64) -> u64 {
        node_size * u64::from(self.fill_numerator) / u64::from(self.fill_denominator.max(1))
    }

    /// Decides whether a leaf holding `acc` bytes must close before taking a
    /// row of `incoming` bytes. `remaining` counts every byte not yet placed
    /// in a leaf, `incoming` included.
    pub fn should_close(&self, node_size: u64, acc: u64, incoming: u64, remaining: u64) -> bool {
        if acc == 0 {
            return false;
        }
        let full = self.full_size(node_size);
        if acc + incoming > full {
            return true;
        }
        let total_left = acc + remaining;
        total_left > full
            && remaining < full
            && acc * u64::from(self.balance_denominator)
                >= total_left * u64::from(self.balance_numerator)
    }
}

/// Bulk loader configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderOptions {
    /// Total memory the loader may use for rowsets and merge buffers.
    pub memory_budget: usize,
    /// Directory for spill files; the system temp dir when unset.
    pub temp_dir: Option<PathBuf>,
    /// File name prefix of spill files.
    pub temp_prefix: String,
    /// Wrap spill file records in compressed sub-blocks.
    pub compress_intermediates: bool,
    /// Codec for compressed spill files.
    pub intermediate_compression: CompressionMethod,
    /// Rowsets that may wait for the extractor.
    pub rowset_queue_depth: usize,
    /// Rowsets that may wait for each fractal writer.
    pub merge_queue_depth: usize,
    /// Read buffer per merge input stream.
    pub io_buffer_size: usize,
    /// Longest accepted key.
    pub max_key_len: usize,
    /// Longest accepted value.
    pub max_val_len: usize,
    /// Shape of the output trees.
    pub tree: TreeOptions,
    /// Progress reporting and cancellation.
    #[serde(skip)]
    pub progress: Option<ProgressCallback>,
    /// Duplicate key notification.
    #[serde(skip)]
    pub on_duplicate: Option<DuplicateCallback>,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            memory_budget: 64 << 20,
            temp_dir: None,
            temp_prefix: "tokuld".to_string(),
            compress_intermediates: false,
            intermediate_compression: CompressionMethod::Fast,
            rowset_queue_depth: 2,
            merge_queue_depth: 2,
            io_buffer_size: 64 << 10,
            max_key_len: 32 << 10,
            max_val_len: 32 << 20,
            tree: TreeOptions::default(),
            progress: None,
            on_duplicate: None,
        }
    }
}

impl fmt::Debug for LoaderOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderOptions")
            .field("memory_budget", &self.memory_budget)
            .field("temp_dir", &self.temp_dir)
            .field("temp_prefix", &self.temp_prefix)
            .field("compress_intermediates", &self.compress_intermediates)
            .field("intermediate_compression", &self.intermediate_compression)
            .field("rowset_queue_depth", &self.rowset_queue_depth)
            .field("merge_queue_depth", &self.merge_queue_depth)
            .field("io_buffer_size", &self.io_buffer_size)
            .field("max_key_len", &self.max_key_len)
            .field("max_val_len", &self.max_val_len)
            .field("tree", &self.tree)
            .field("progress", &self.progress.is_some())
            .field("on_duplicate", &self.on_duplicate.is_some())
            .finish()
    }
}

impl LoaderOptions {
    /// Sets the memory budget.
    pub fn memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget = bytes;
        self
    }

    /// Sets the spill directory.
    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    /// Sets the spill file name prefix.
    pub fn temp_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.temp_prefix = prefix.into();
        self
    }

    /// Enables compressed spill files using `method`.
    pub fn compress_intermediates(mut self, method: CompressionMethod) -> Self {
        self.compress_intermediates = true;
        self.intermediate_compression = method;
        self
    }

    /// Sets both queue depths.
    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.rowset_queue_depth = depth.max(1);
        self.merge_queue_depth = depth.max(1);
        self
    }

    /// Sets the per-stream merge read buffer.
    pub fn io_buffer_size(mut self, bytes: usize) -> Self {
        self.io_buffer_size = bytes.max(1);
        self
    }

    /// Sets the key and value length limits.
    pub fn row_limits(mut self, max_key_len: usize, max_val_len: usize) -> Self {
        self.max_key_len = max_key_len;
        self.max_val_len = max_val_len;
        self
    }

    /// Sets the output tree shape.
    pub fn tree(mut self, tree: TreeOptions) -> Self {
        self.tree = tree;
        self
    }

    /// Installs a progress callback.
    pub fn progress(mut self, cb: ProgressCallback) -> Self {
        self.progress = Some(cb);
        self
    }

    /// Installs a duplicate-key callback.
    pub fn on_duplicate(mut self, cb: DuplicateCallback) -> Self {
        self.on_duplicate = Some(cb);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_rule_closes_near_target() {
        let policy = LeafClosePolicy::default();
        assert_eq!(policy.full_size(40), 35);
        assert!(!policy.should_close(40, 0, 50, 1000));
        assert!(policy.should_close(40, 33, 11, 1000));
        assert!(!policy.should_close(40, 22, 11, 1000));
    }

    #[test]
    fn balance_rule_splits_tail_evenly() {
        let policy = LeafClosePolicy::default();
        assert_eq!(policy.full_size(100), 87);
        // 110 bytes left in total: closing at 50 would leave 60 for one more leaf
        // but the leaf is not yet half of what is left
        assert!(!policy.should_close(100, 50, 10, 60));
        assert!(policy.should_close(100, 60, 10, 50));
        // plenty left after this leaf: only the fill rule applies
        assert!(!policy.should_close(100, 60, 10, 500));
    }

    #[test]
    fn options_load_from_toml() {
        let opts: LoaderOptions = toml::from_str(
            r#"
            memory_budget = 1048576
            temp_prefix = "spill"
            [tree]
            node_size = 65536
            compression = "zlib"
            [tree.leaf_close]
            fill_numerator = 3
            fill_denominator = 4
            "#,
        )
        .unwrap();
        assert_eq!(opts.memory_budget, 1 << 20);
        assert_eq!(opts.temp_prefix, "spill");
        assert_eq!(opts.tree.node_size, 65536);
        assert_eq!(opts.tree.compression, CompressionMethod::Zlib);
        assert_eq!(opts.tree.leaf_close.fill_numerator, 3);
        assert_eq!(opts.tree.leaf_close.balance_denominator, 2);
        assert_eq!(opts.tree.fanout, DEFAULT_FANOUT);
        assert!(opts.progress.is_none());
    }
}
