//! Sharded hash keydir

use std::collections::HashMap;

use crossbeam::utils::CachePadded;
use parking_lot::RwLock;
use xxhash_rust::xxh64::xxh64;

use super::{IndexEntry, KeyDir, KeyDirIter};

type Shard = CachePadded<RwLock<HashMap<Vec<u8>, IndexEntry>>>;

/// Hash map partitioned into a fixed number of independently locked shards.
///
/// The shard count is fixed at construction; shards are padded to a cache
/// line so neighbouring locks do not false-share.
pub struct ShardedKeyDir {
    shards: Box<[Shard]>,
}

impl ShardedKeyDir {
    /// Create with `shard_count` shards (at least one)
    pub fn new(shard_count: usize) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|_| CachePadded::new(RwLock::new(HashMap::new())))
            .collect();
        Self { shards }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, key: &[u8]) -> &Shard {
        let index = xxh64(key, 0) % self.shards.len() as u64;
        &self.shards[index as usize]
    }
}

impl KeyDir for ShardedKeyDir {
    fn get(&self, key: &[u8]) -> Option<IndexEntry> {
        self.shard(key).read().get(key).copied()
    }

    fn put(&self, key: Vec<u8>, entry: IndexEntry) {
        self.shard(&key).write().insert(key, entry);
    }

    fn delete(&self, key: &[u8]) -> Option<IndexEntry> {
        self.shard(key).write().remove(key)
    }

    fn keys(&self) -> Vec<Vec<u8>> {
        let mut keys = Vec::with_capacity(self.len());
        for shard in self.shards.iter() {
            keys.extend(shard.read().keys().cloned());
        }
        keys
    }

    fn iter(&self) -> KeyDirIter {
        let mut entries = Vec::with_capacity(self.len());
        for shard in self.shards.iter() {
            let shard = shard.read();
            entries.extend(shard.iter().map(|(k, v)| (k.clone(), *v)));
        }
        KeyDirIter::new(entries)
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    fn close(&self) {
        for shard in self.shards.iter() {
            shard.write().clear();
        }
    }
}
