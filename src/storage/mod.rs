//! Fractal tree storage: the on-disk node codec, tree files, and the bulk
//! loader that builds them.

/// Node codec, tree files, cache table wrapper, and leaf cursor.
pub mod ft;

/// Builds tree files from unsorted rows.
pub mod loader;

/// Tree shape and loader configuration.
pub mod options;

pub use options::{LeafClosePolicy, LoaderOptions, ProgressCallback, DuplicateCallback, TreeOptions};
