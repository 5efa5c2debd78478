//! In-memory address cache shared between intake and refresh tasks.
//!
//! The cache holds the addresses of every payment the monitor may still
//! act on: a set for transparent addresses and a map for shielded ones.
//! Readers take an `Arc` snapshot; the refresh task builds a complete
//! replacement and swaps it in one assignment, so readers never observe a
//! partially rebuilt view. The lock is only held for the pointer swap and
//! is never held across an await.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::types::ViewingKey;

/// Cache entry for one shielded address.
#[derive(Debug, Clone)]
pub struct ShieldedEntry {
    pub payment_id: String,
    /// Viewing capability from the wallet collaborator; `None` when the
    /// wallet has no key on file (the import step logs and skips it).
    pub viewing_key: Option<ViewingKey>,
}

/// Atomically swapped snapshots of the monitored address views.
pub struct AddressCache {
    transparent: RwLock<Arc<HashSet<String>>>,
    shielded: RwLock<Arc<HashMap<String, ShieldedEntry>>>,
}

impl AddressCache {
    pub fn new() -> Self {
        Self {
            transparent: RwLock::new(Arc::new(HashSet::new())),
            shielded: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Current transparent snapshot. Cheap: clones an `Arc`.
    pub fn transparent(&self) -> Arc<HashSet<String>> {
        Arc::clone(&self.transparent.read().expect("address cache lock poisoned"))
    }

    /// Current shielded snapshot. Cheap: clones an `Arc`.
    pub fn shielded(&self) -> Arc<HashMap<String, ShieldedEntry>> {
        Arc::clone(&self.shielded.read().expect("address cache lock poisoned"))
    }

    pub fn contains_transparent(&self, address: &str) -> bool {
        self.transparent().contains(address)
    }

    /// Replace the transparent view with a freshly built snapshot.
    pub fn replace_transparent(&self, addresses: HashSet<String>) {
        *self.transparent.write().expect("address cache lock poisoned") = Arc::new(addresses);
    }

    /// Replace the shielded view with a freshly built snapshot.
    pub fn replace_shielded(&self, entries: HashMap<String, ShieldedEntry>) {
        *self.shielded.write().expect("address cache lock poisoned") = Arc::new(entries);
    }
}

impl Default for AddressCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty() {
        let cache = AddressCache::new();
        assert!(cache.transparent().is_empty());
        assert!(cache.shielded().is_empty());
        assert!(!cache.contains_transparent("addr"));
    }

    #[test]
    fn replacement_is_total_not_incremental() {
        let cache = AddressCache::new();
        cache.replace_transparent(["a1".to_owned(), "a2".to_owned()].into());
        assert!(cache.contains_transparent("a1"));

        cache.replace_transparent(["a3".to_owned()].into());
        assert!(!cache.contains_transparent("a1"));
        assert!(cache.contains_transparent("a3"));
    }

    #[test]
    fn snapshots_outlive_replacement() {
        let cache = AddressCache::new();
        cache.replace_transparent(["a1".to_owned()].into());

        let snapshot = cache.transparent();
        cache.replace_transparent(HashSet::new());

        // An intake path holding the old snapshot still sees a coherent view.
        assert!(snapshot.contains("a1"));
        assert!(!cache.contains_transparent("a1"));
    }

    #[test]
    fn shielded_entries_carry_payment_linkage() {
        let cache = AddressCache::new();
        let mut entries = HashMap::new();
        entries.insert(
            "zs1addr".to_owned(),
            ShieldedEntry {
                payment_id: "pay-1".to_owned(),
                viewing_key: None,
            },
        );
        cache.replace_shielded(entries);

        let snapshot = cache.shielded();
        assert_eq!(snapshot.get("zs1addr").map(|e| e.payment_id.as_str()), Some("pay-1"));
    }
}
