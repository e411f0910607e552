//! Low-level primitives the tree codec and the loader are built from.
//!
//! Includes byte encoding, positioned file I/O, compression, and the
//! queue/latch pair the loader threads coordinate through.

/// Little-endian encode/decode buffers.
pub mod bytes;

/// Self-describing compression codecs.
pub mod compress;

/// Bounded hand-off queues and first-error latching.
pub mod concurrency;

/// Positioned file I/O and file growth policy.
pub mod io;
