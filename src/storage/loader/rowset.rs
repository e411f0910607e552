//! Batches of rows moved between loader stages.

use std::mem;

use crate::storage::ft::comparator::Comparator;

use super::sort;

/// Location of one row inside a [`Rowset`] arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RowRef {
    /// Offset of the key in the arena.
    pub off: usize,
    /// Key length.
    pub klen: usize,
    /// Value length.
    pub vlen: usize,
}

impl RowRef {
    /// Key bytes of this row in `data`.
    pub fn key<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.off..self.off + self.klen]
    }

    /// Value bytes of this row in `data`.
    pub fn val<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        let start = self.off + self.klen;
        &data[start..start + self.vlen]
    }
}

/// Growable arena of key/value pairs with a fixed memory budget.
///
/// The footprint counts the arena bytes plus one [`RowRef`] per row. A push
/// that would take the footprint past the budget is refused, so an accepted
/// row never leaves the rowset over budget.
#[derive(Debug, Default)]
pub struct Rowset {
    data: Vec<u8>,
    rows: Vec<RowRef>,
    budget: usize,
}

impl Rowset {
    /// Empty rowset holding at most `budget` bytes.
    pub fn new(budget: usize) -> Self {
        Self {
            data: Vec::new(),
            rows: Vec::new(),
            budget,
        }
    }

    /// Bytes the rowset may hold.
    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Rows held.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when nothing is held.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Bytes charged against the budget.
    pub fn footprint(&self) -> usize {
        self.data.len() + self.rows.len() * mem::size_of::<RowRef>()
    }

    /// Bytes a row of this shape would add.
    pub fn row_cost(klen: usize, vlen: usize) -> usize {
        klen + vlen + mem::size_of::<RowRef>()
    }

    /// True if a row of this shape fits in the remaining budget.
    pub fn fits(&self, klen: usize, vlen: usize) -> bool {
        self.footprint() + Self::row_cost(klen, vlen) <= self.budget
    }

    /// Appends a row if it fits. Returns false and leaves the rowset
    /// untouched otherwise.
    pub fn try_push(&mut self, key: &[u8], val: &[u8]) -> bool {
        if !self.fits(key.len(), val.len()) {
            return false;
        }
        let off = self.data.len();
        self.data.extend_from_slice(key);
        self.data.extend_from_slice(val);
        self.rows.push(RowRef {
            off,
            klen: key.len(),
            vlen: val.len(),
        });
        true
    }

    /// Row `i` as `(key, value)`.
    pub fn row(&self, i: usize) -> (&[u8], &[u8]) {
        let r = &self.rows[i];
        (r.key(&self.data), r.val(&self.data))
    }

    /// Rows in their current order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> + '_ {
        self.rows
            .iter()
            .map(move |r| (r.key(&self.data), r.val(&self.data)))
    }

    /// Smallest key, valid once sorted.
    pub fn first_key(&self) -> Option<&[u8]> {
        self.rows.first().map(|r| r.key(&self.data))
    }

    /// Largest key, valid once sorted.
    pub fn last_key(&self) -> Option<&[u8]> {
        self.rows.last().map(|r| r.key(&self.data))
    }

    /// Stable sort by key.
    pub fn sort(&mut self, cmp: &dyn Comparator) {
        sort::sort_rows(&mut self.rows, &self.data, cmp);
    }

    /// Index of the first row whose key equals its predecessor's, assuming
    /// the rowset is sorted.
    pub fn first_duplicate(&self, cmp: &dyn Comparator) -> Option<usize> {
        self.rows
            .windows(2)
            .position(|w| cmp.compare(w[0].key(&self.data), w[1].key(&self.data)).is_eq())
            .map(|i| i + 1)
    }

    /// Drops every row, keeping the allocations.
    pub fn clear(&mut self) {
        self.data.clear();
        self.rows.clear();
    }
}
