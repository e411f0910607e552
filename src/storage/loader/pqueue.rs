//! Duplicate-detecting priority queue for k-way merges.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::storage::ft::comparator::Comparator;
use crate::storage::options::DuplicateCallback;
use crate::types::{FtError, Result};

/// Head row of one merge input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeEntry {
    /// Input stream the row came from.
    pub stream: usize,
    /// Key bytes.
    pub key: Vec<u8>,
    /// Value bytes.
    pub val: Vec<u8>,
}

struct HeapItem<'c> {
    entry: MergeEntry,
    cmp: &'c dyn Comparator,
}

impl PartialEq for HeapItem<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapItem<'_> {}

impl PartialOrd for HeapItem<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        // max-heap: reversed so the smallest key (then lowest stream) is on top
        self.cmp
            .compare(&other.entry.key, &self.entry.key)
            .then_with(|| other.entry.stream.cmp(&self.entry.stream))
    }
}

/// Min-queue over the current head of every merge input.
///
/// Every input must be sorted and free of duplicates, and the caller must
/// refill from the popped stream before popping again. Under that contract
/// two equal keys from different inputs are both in the queue when the first
/// is popped, so comparing the popped key with the new top finds every
/// duplicate.
pub struct MergeQueue<'c> {
    heap: BinaryHeap<HeapItem<'c>>,
    cmp: &'c dyn Comparator,
    index: usize,
    on_dup: Option<DuplicateCallback>,
}

impl<'c> MergeQueue<'c> {
    /// Queue for output `index` ordered by `cmp`.
    pub fn new(cmp: &'c dyn Comparator, index: usize, on_dup: Option<DuplicateCallback>) -> Self {
        Self {
            heap: BinaryHeap::new(),
            cmp,
            index,
            on_dup,
        }
    }

    /// Adds the head row of `stream`.
    pub fn insert(&mut self, stream: usize, key: Vec<u8>, val: Vec<u8>) {
        self.heap.push(HeapItem {
            entry: MergeEntry { stream, key, val },
            cmp: self.cmp,
        });
    }

    /// Removes the smallest entry. A popped key equal to the next one is
    /// reported to the duplicate callback and fails with
    /// [`FtError::DuplicateKey`].
    pub fn pop(&mut self) -> Result<Option<MergeEntry>> {
        let Some(item) = self.heap.pop() else {
            return Ok(None);
        };
        let entry = item.entry;
        if let Some(next) = self.heap.peek() {
            if self.cmp.compare(&entry.key, &next.entry.key) == Ordering::Equal {
                if let Some(cb) = &self.on_dup {
                    cb(self.index, &entry.key, &entry.val);
                }
                return Err(FtError::DuplicateKey {
                    index: self.index,
                    key: entry.key,
                });
            }
        }
        Ok(Some(entry))
    }

    /// Rows queued.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// True when nothing is held.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ft::comparator::BytewiseComparator;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    /// Drives the queue over in-memory streams the way a merge pass does.
    fn merge(streams: &[Vec<Vec<u8>>], on_dup: Option<DuplicateCallback>) -> Result<Vec<Vec<u8>>> {
        let mut q = MergeQueue::new(&BytewiseComparator, 0, on_dup);
        let mut pos = vec![0usize; streams.len()];
        for (s, rows) in streams.iter().enumerate() {
            if let Some(k) = rows.first() {
                q.insert(s, k.clone(), Vec::new());
                pos[s] = 1;
            }
        }
        let mut out = Vec::new();
        while let Some(e) = q.pop()? {
            if let Some(k) = streams[e.stream].get(pos[e.stream]) {
                q.insert(e.stream, k.clone(), Vec::new());
                pos[e.stream] += 1;
            }
            out.push(e.key);
        }
        Ok(out)
    }

    #[test]
    fn pops_in_comparator_order() {
        let streams = vec![
            vec![b"a".to_vec(), b"d".to_vec()],
            vec![b"b".to_vec(), b"c".to_vec(), b"e".to_vec()],
            vec![],
        ];
        let out = merge(&streams, None).unwrap();
        assert_eq!(out, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec(), b"e".to_vec()]);
    }

    #[test]
    fn duplicate_across_streams_is_reported() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: DuplicateCallback = Arc::new(move |index, key, _val| {
            sink.lock().push((index, key.to_vec()));
        });
        let streams = vec![vec![b"a".to_vec(), b"b".to_vec()], vec![b"b".to_vec()]];
        let err = merge(&streams, Some(cb)).unwrap_err();
        assert!(matches!(err, FtError::DuplicateKey { index: 0, ref key } if key == b"b"));
        assert_eq!(*seen.lock(), vec![(0, b"b".to_vec())]);
    }

    proptest! {
        #[test]
        fn output_is_sorted_concatenation(
            sets in proptest::collection::vec(proptest::collection::btree_set(any::<u16>(), 0..40), 1..6)
        ) {
            // make keys disjoint across streams by tagging with the stream id
            let streams: Vec<Vec<Vec<u8>>> = sets
                .iter()
                .enumerate()
                .map(|(s, set)| {
                    set.iter()
                        .map(|k| {
                            let mut key = k.to_be_bytes().to_vec();
                            key.push(s as u8);
                            key
                        })
                        .collect()
                })
                .collect();
            let out = merge(&streams, None).unwrap();
            let expected: BTreeSet<Vec<u8>> = streams.iter().flatten().cloned().collect();
            prop_assert_eq!(out, expected.into_iter().collect::<Vec<_>>());
        }

        #[test]
        fn shared_key_always_detected(
            a in proptest::collection::btree_set(any::<u8>(), 1..30),
            b in proptest::collection::btree_set(any::<u8>(), 1..30),
        ) {
            let streams = vec![
                a.iter().map(|k| vec![*k]).collect::<Vec<_>>(),
                b.iter().map(|k| vec![*k]).collect::<Vec<_>>(),
            ];
            let res = merge(&streams, None);
            prop_assert_eq!(res.is_err(), a.intersection(&b).next().is_some());
        }
    }
}
