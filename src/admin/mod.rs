#![forbid(unsafe_code)]

//! Offline maintenance tools for tree files.

mod verify;

/// Tree file integrity verification.
///
/// Walks a tree file and reports checksum failures and broken key order.
pub use verify::{verify_tree, VerifyCounts, VerifyFinding, VerifyLevel, VerifyReport, VerifySeverity};
