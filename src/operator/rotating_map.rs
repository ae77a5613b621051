//! A two-generation keyed map that bounds its own memory instead of growing
//! without limit (spec §9, supplemental operator primitive). Grounded on
//! `examples/original_source/src/analysis/nfs/MergeJoins.cpp`'s
//! request/reply correlation table: a one-pass trace join keeps a working
//! set of "seen but not yet matched" keys, and must evict old entries rather
//! than retain every key for the life of the process.
//!
//! Inserts always land in the *current* generation. A lookup checks current
//! first, then falls back to *old*. Once current reaches `max_entries`,
//! current is promoted to old (replacing it) and a fresh, empty current is
//! started — so at most two generations, and at most `2 * max_entries`
//! entries, are ever live.

use std::collections::HashMap;
use std::hash::Hash;

pub struct RotatingMap<K, V> {
    max_entries: usize,
    current: HashMap<K, V>,
    old: HashMap<K, V>,
}

impl<K: Eq + Hash, V> RotatingMap<K, V> {
    pub fn new(max_entries: usize) -> RotatingMap<K, V> {
        RotatingMap { max_entries: max_entries.max(1), current: HashMap::new(), old: HashMap::new() }
    }

    /// Insert `key -> value` into the current generation, rotating first if
    /// it's both full and about to grow (an update to an already-present key
    /// never triggers rotation).
    pub fn insert(&mut self, key: K, value: V) {
        if self.current.len() >= self.max_entries && !self.current.contains_key(&key) {
            self.old = std::mem::take(&mut self.current);
        }
        self.current.insert(key, value);
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.current.get(key).or_else(|| self.old.get(key))
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.current.contains_key(key) || self.old.contains_key(key)
    }

    /// Upper bound on live entries. Keys present in both generations (an
    /// entry updated just before a rotation) are counted twice, which only
    /// ever over-counts relative to the true distinct-key count.
    pub fn len(&self) -> usize {
        self.current.len() + self.old.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty() && self.old.is_empty()
    }
}
