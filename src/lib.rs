//! Fractal tree node codec and bulk loader.
//!
//! [`storage::ft`] reads and writes tree nodes in the current on-disk layout
//! (upgrading legacy nodes on read) and reaches them through a cache table.
//! [`storage::loader`] builds whole tree files from unsorted rows with an
//! external merge sort.

#![warn(missing_docs)]

pub mod admin;
pub mod primitives;
pub mod storage;
pub mod types;

pub use storage::ft::{FtContext, FtTree, LeCursor, SimpleCacheTable};
pub use storage::loader::{open_loader, IndexSpec, LoadReport, Loader};
pub use storage::options::{LoaderOptions, TreeOptions};
pub use types::{FtError, Result};
