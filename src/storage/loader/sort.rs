//! Stable parallel mergesort over rowset records.

use std::cmp::Ordering;

use crate::storage::ft::comparator::Comparator;

use super::rowset::RowRef;

/// Runs at or below this length are insertion sorted.
const INSERTION_CUTOFF: usize = 16;
/// Halves at or above this length are sorted on the rayon pool.
const PARALLEL_CUTOFF: usize = 4096;

/// Sorts `rows` by key, keeping equal keys in their original order.
pub fn sort_rows(rows: &mut [RowRef], data: &[u8], cmp: &dyn Comparator) {
    if rows.len() < 2 {
        return;
    }
    let mut scratch = rows.to_vec();
    sort_slice(rows, &mut scratch, data, cmp);
}

fn sort_slice(rows: &mut [RowRef], scratch: &mut [RowRef], data: &[u8], cmp: &dyn Comparator) {
    let n = rows.len();
    if n <= INSERTION_CUTOFF {
        insertion_sort(rows, data, cmp);
        return;
    }
    let mid = n / 2;
    {
        let (lo, hi) = rows.split_at_mut(mid);
        let (slo, shi) = scratch.split_at_mut(mid);
        if n >= PARALLEL_CUTOFF {
            rayon::join(
                || sort_slice(lo, slo, data, cmp),
                || sort_slice(hi, shi, data, cmp),
            );
        } else {
            sort_slice(lo, slo, data, cmp);
            sort_slice(hi, shi, data, cmp);
        }
    }
    // already in order across the seam
    if cmp.compare(rows[mid - 1].key(data), rows[mid].key(data)) != Ordering::Greater {
        return;
    }
    merge_halves(rows, mid, scratch, data, cmp);
}

fn insertion_sort(rows: &mut [RowRef], data: &[u8], cmp: &dyn Comparator) {
    for i in 1..rows.len() {
        let mut j = i;
        while j > 0 && cmp.compare(rows[j - 1].key(data), rows[j].key(data)) == Ordering::Greater {
            rows.swap(j - 1, j);
            j -= 1;
        }
    }
}

fn merge_halves(rows: &mut [RowRef], mid: usize, scratch: &mut [RowRef], data: &[u8], cmp: &dyn Comparator) {
    let n = rows.len();
    scratch[..n].copy_from_slice(rows);
    let (mut i, mut j, mut k) = (0, mid, 0);
    while i < mid && j < n {
        // left wins ties
        if cmp.compare(scratch[j].key(data), scratch[i].key(data)) == Ordering::Less {
            rows[k] = scratch[j];
            j += 1;
        } else {
            rows[k] = scratch[i];
            i += 1;
        }
        k += 1;
    }
    let left = mid - i;
    rows[k..k + left].copy_from_slice(&scratch[i..mid]);
    k += left;
    rows[k..].copy_from_slice(&scratch[j..n]);
}
