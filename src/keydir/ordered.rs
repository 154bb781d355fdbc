//! Ordered keydir
//!
//! BTreeMap wrapped in a single RwLock. Slower than the sharded map under
//! write contention, but iterates in key order.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use super::{IndexEntry, KeyDir, KeyDirIter};

#[derive(Default)]
pub struct OrderedKeyDir {
    tree: RwLock<BTreeMap<Vec<u8>, IndexEntry>>,
}

impl OrderedKeyDir {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyDir for OrderedKeyDir {
    fn get(&self, key: &[u8]) -> Option<IndexEntry> {
        self.tree.read().get(key).copied()
    }

    fn put(&self, key: Vec<u8>, entry: IndexEntry) {
        self.tree.write().insert(key, entry);
    }

    fn delete(&self, key: &[u8]) -> Option<IndexEntry> {
        self.tree.write().remove(key)
    }

    fn keys(&self) -> Vec<Vec<u8>> {
        self.tree.read().keys().cloned().collect()
    }

    fn iter(&self) -> KeyDirIter {
        let entries = self
            .tree
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        KeyDirIter::new(entries)
    }

    fn len(&self) -> usize {
        self.tree.read().len()
    }

    fn close(&self) {
        self.tree.write().clear();
    }
}
