//! Key comparators.

use std::cmp::Ordering;
use std::sync::Arc;

/// Key ordering used by a tree.
///
/// Implementations must be a total order over byte strings and must agree with
/// the order the tree was built with.
pub trait Comparator: Send + Sync {
    /// Compares two keys.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

impl<F> Comparator for F
where
    F: Fn(&[u8], &[u8]) -> Ordering + Send + Sync,
{
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self(a, b)
    }
}

/// Lexicographic byte order.
#[derive(Copy, Clone, Debug, Default)]
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Comparator shared between threads and handles.
pub type SharedComparator = Arc<dyn Comparator>;

/// Shared [`BytewiseComparator`].
pub fn bytewise() -> SharedComparator {
    Arc::new(BytewiseComparator)
}
