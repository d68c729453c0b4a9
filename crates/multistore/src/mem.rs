// Path: crates/multistore/src/mem.rs

//! Unhashed in-memory stores mounted next to the IAVL trees.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// A key/value map that lives only in memory. A transient store is emptied
/// after every multi-store commit; a memory store keeps its contents until
/// the process exits.
#[derive(Debug, Default)]
pub struct MemStore {
    map: RwLock<BTreeMap<Bytes, Bytes>>,
    transient: bool,
}

impl MemStore {
    pub(crate) fn new(transient: bool) -> Self {
        Self {
            map: RwLock::default(),
            transient,
        }
    }

    /// Whether the store is cleared on commit.
    pub fn is_transient(&self) -> bool {
        self.transient
    }

    /// The value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.map.read().get(key).cloned()
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Applies buffered writes; `None` deletes.
    pub(crate) fn write(&self, writes: BTreeMap<Bytes, Option<Bytes>>) {
        let mut map = self.map.write();
        for (key, value) in writes {
            match value {
                Some(value) => {
                    map.insert(key, value);
                }
                None => {
                    map.remove(&key);
                }
            }
        }
    }

    pub(crate) fn on_commit(&self) {
        if self.transient {
            self.map.write().clear();
        }
    }
}

/// Buffered writes over a [`MemStore`], read through to the store.
#[derive(Debug)]
pub(crate) struct MemBranch {
    pub(crate) base: std::sync::Arc<MemStore>,
    pub(crate) writes: BTreeMap<Bytes, Option<Bytes>>,
}

impl MemBranch {
    pub(crate) fn new(base: std::sync::Arc<MemStore>) -> Self {
        Self {
            base,
            writes: BTreeMap::new(),
        }
    }

    pub(crate) fn get(&self, key: &[u8]) -> Option<Bytes> {
        match self.writes.get(key) {
            Some(buffered) => buffered.clone(),
            None => self.base.get(key),
        }
    }

    pub(crate) fn set(&mut self, key: Bytes, value: Bytes) -> bool {
        let existed = self.get(&key).is_some();
        self.writes.insert(key, Some(value));
        existed
    }

    pub(crate) fn delete(&mut self, key: &[u8]) -> Option<Bytes> {
        let previous = self.get(key);
        self.writes.insert(Bytes::copy_from_slice(key), None);
        previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn branch_reads_through_and_buffers() {
        let store = Arc::new(MemStore::new(false));
        let mut seed = MemBranch::new(Arc::clone(&store));
        seed.set(Bytes::from_static(b"a"), Bytes::from_static(b"1"));
        store.write(seed.writes);

        let mut branch = MemBranch::new(Arc::clone(&store));
        assert_eq!(branch.get(b"a"), Some(Bytes::from_static(b"1")));
        assert_eq!(branch.delete(b"a"), Some(Bytes::from_static(b"1")));
        assert!(branch.get(b"a").is_none());
        assert!(!branch.set(Bytes::from_static(b"b"), Bytes::from_static(b"2")));
        assert_eq!(store.len(), 1);
        store.write(branch.writes);
        assert!(store.get(b"a").is_none());
        assert_eq!(store.get(b"b"), Some(Bytes::from_static(b"2")));
    }

    #[test]
    fn only_transient_stores_clear_on_commit() {
        for transient in [true, false] {
            let store = Arc::new(MemStore::new(transient));
            let mut branch = MemBranch::new(Arc::clone(&store));
            branch.set(Bytes::from_static(b"k"), Bytes::from_static(b"v"));
            store.write(branch.writes);
            store.on_commit();
            assert_eq!(store.is_empty(), transient);
        }
    }
}
