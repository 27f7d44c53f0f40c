//! Unordered pair-index tables for the roughness kernel.
//!
//! Every grid point runs the same O(n^2) loop over a combined partial list.
//! The loop order is fixed by enumerating all index pairs (a, b) with
//! 0 <= a < b < n once per distinct n, in lexicographic order, and reusing
//! the table from then on. Entries are immutable after construction and
//! handed out as `Arc`s, so concurrent grid rows share one cache without
//! copying or re-enumeration.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

/// Index table for all unordered pairs of `n` partials.
#[derive(Debug, PartialEq, Eq)]
pub struct PairIndices {
    /// First member of each pair; `i[k] < j[k]` for every k.
    pub i: Vec<u32>,
    /// Second member of each pair.
    pub j: Vec<u32>,
}

impl PairIndices {
    /// Number of enumerated pairs, `n*(n-1)/2`.
    pub fn len(&self) -> usize {
        self.i.len()
    }

    pub fn is_empty(&self) -> bool {
        self.i.is_empty()
    }
}

fn build_pairs(n: usize) -> PairIndices {
    let count = n * n.saturating_sub(1) / 2;
    let mut i = Vec::with_capacity(count);
    let mut j = Vec::with_capacity(count);
    for a in 0..n {
        for b in (a + 1)..n {
            i.push(a as u32);
            j.push(b as u32);
        }
    }
    PairIndices { i, j }
}

/// Memoized pair-index tables keyed by partial count.
///
/// Owned by the caller and passed by reference into computations rather than
/// living in process-global state, so concurrent or test-isolated runs never
/// interfere. A mutex guards the memo map; a table never changes once
/// inserted, which makes the handed-out `Arc`s safe to read lock-free.
#[derive(Debug, Default)]
pub struct PairIndexCache {
    entries: Mutex<HashMap<usize, Arc<PairIndices>>>,
}

impl PairIndexCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table for `n` partials; for n of 0 or 1 both arrays are empty.
    ///
    /// Repeated calls with the same `n` return the same allocation
    /// (`Arc::ptr_eq` holds), so downstream code may key work off the table
    /// identity.
    pub fn get(&self, n: usize) -> Arc<PairIndices> {
        let mut entries = self.entries.lock().expect("pair cache lock");
        Arc::clone(entries.entry(n).or_insert_with(|| {
            debug!(n, pairs = n * n.saturating_sub(1) / 2, "building pair index table");
            Arc::new(build_pairs(n))
        }))
    }

    /// Evict every memoized table.
    pub fn clear(&self) {
        self.entries.lock().expect("pair cache lock").clear();
    }

    /// Number of distinct partial counts currently memoized.
    pub fn entry_count(&self) -> usize {
        self.entries.lock().expect("pair cache lock").len()
    }
}
