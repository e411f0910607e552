//! Fractal tree nodes: in-memory form, on-disk codec, tree files, and the
//! cache-table protocol used to reach them.

pub mod cachetable;
pub mod comparator;
pub mod context;
pub mod deserialize;
pub mod header;
pub mod le_cursor;
pub mod leafentry;
pub mod msg;
pub mod node;
pub mod serialize;
pub mod sub_block;
pub mod tree;
pub mod upgrade;

pub use cachetable::{
    CacheKey, CacheTable, DependentPin, NodeFetcher, PairAttr, PinLock, PinnedNode,
    SimpleCacheTable,
};
pub use comparator::{bytewise, BytewiseComparator, Comparator, SharedComparator};
pub use context::FtContext;
pub use deserialize::{decompress_partition, deserialize_node, deserialize_node_header, fetch_partition};
pub use header::{BlockLocation, Descriptor, FileHeader, TranslationTable};
pub use le_cursor::{CursorPosition, LeCursor};
pub use leafentry::{LeafEntry, TxnOp, TxnRecord};
pub use msg::{ChildBuffer, Message, MessageType};
pub use node::{Basement, Child, FetchPolicy, Node, Partition, PartitionState, PivotKeys};
pub use serialize::{serialize_node, SerializeOptions, SerializedNode};
pub use tree::FtTree;
