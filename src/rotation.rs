//! Per-route rotation of live backend addresses.
//!
//! Each route prefix owns a list of currently-live addresses plus a
//! round-robin cursor. The probe cycle replaces the whole entry in
//! one step; the dispatcher advances the cursor under the same entry
//! guard. A reader therefore always sees a (list, cursor) pair from
//! the same snapshot.

use dashmap::DashMap;

/// Live list and cursor for one route prefix.
///
/// Invariant: `cursor < addrs.len()` whenever `addrs` is non-empty.
#[derive(Debug, Clone, Default)]
pub struct Rotation {
    addrs: Vec<String>,
    cursor: usize,
}

impl Rotation {
    fn new(addrs: Vec<String>) -> Self {
        Self { addrs, cursor: 0 }
    }

    fn next(&mut self) -> Option<String> {
        if self.addrs.is_empty() {
            return None;
        }
        let addr = self.addrs[self.cursor].clone();
        self.cursor = (self.cursor + 1) % self.addrs.len();
        Some(addr)
    }
}

/// Shared cache of live addresses, one [`Rotation`] per prefix.
#[derive(Debug, Default)]
pub struct LiveAddressCache {
    entries: DashMap<String, Rotation>,
}

impl LiveAddressCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically replace a prefix's live list, resetting the cursor
    /// to the head of the new list.
    pub fn publish(&self, prefix: &str, addrs: Vec<String>) {
        self.entries.insert(prefix.to_string(), Rotation::new(addrs));
    }

    /// Select the next address for a prefix in round-robin order and
    /// advance the cursor. `None` when the prefix has no live
    /// backends (or no cycle has published yet).
    pub fn next(&self, prefix: &str) -> Option<String> {
        self.entries.get_mut(prefix)?.next()
    }

    /// Current (list, cursor) pair for a prefix.
    pub fn snapshot(&self, prefix: &str) -> Option<(Vec<String>, usize)> {
        self.entries
            .get(prefix)
            .map(|entry| (entry.addrs.clone(), entry.cursor))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
