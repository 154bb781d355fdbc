//! KeyDir Module
//!
//! In-memory index from key to the location of its live value.
//!
//! ## Responsibilities
//! - Point lookups on every `get`
//! - Unconditional overwrite on every successful `put`
//! - Snapshot iteration for merge, fold and key listing
//!
//! ## Backing Choice
//! Both backings sit behind the [`KeyDir`] trait and are picked once, at
//! construction, from [`IndexKind`]:
//! - [`ShardedKeyDir`]: hash map split into cache-padded shards, each behind
//!   its own RwLock. O(1), unordered.
//! - [`OrderedKeyDir`]: one BTreeMap behind one RwLock. O(log n), iterates in
//!   key order.
//!
//! Writers are already serialized by the engine, so per-shard locks only
//! have to keep readers from observing a half-updated map.

mod ordered;
mod sharded;

pub use ordered::OrderedKeyDir;
pub use sharded::ShardedKeyDir;

use crate::config::IndexKind;
use crate::error::{CaskError, Result};
use crate::record::encoded_len;

/// Location of a key's current value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Segment holding the record
    pub segment_id: u32,
    /// Offset of the record start within that segment
    pub offset: u64,
    /// Length of the value in bytes
    pub value_size: u32,
    /// Write time of the record (unix seconds)
    pub timestamp: u64,
}

impl IndexEntry {
    /// Encoded length of the record this entry points at
    pub fn record_len(&self, key_len: usize) -> usize {
        encoded_len(key_len, self.value_size as usize)
    }
}

/// Capability set shared by every keydir backing
pub trait KeyDir: Send + Sync {
    fn get(&self, key: &[u8]) -> Option<IndexEntry>;

    /// Insert or overwrite, last writer wins
    fn put(&self, key: Vec<u8>, entry: IndexEntry);

    /// Remove a key, returning its previous entry
    fn delete(&self, key: &[u8]) -> Option<IndexEntry>;

    /// Every key currently indexed
    fn keys(&self) -> Vec<Vec<u8>>;

    /// Point-in-time snapshot; later mutations are not reflected
    fn iter(&self) -> KeyDirIter;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry
    fn close(&self);
}

/// Snapshot iterator over `(key, entry)` pairs
pub struct KeyDirIter {
    entries: std::vec::IntoIter<(Vec<u8>, IndexEntry)>,
}

impl KeyDirIter {
    pub(crate) fn new(entries: Vec<(Vec<u8>, IndexEntry)>) -> Self {
        Self {
            entries: entries.into_iter(),
        }
    }
}

impl Iterator for KeyDirIter {
    type Item = (Vec<u8>, IndexEntry);

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.entries.size_hint()
    }
}

impl ExactSizeIterator for KeyDirIter {}

/// Construct the backing selected by configuration
pub fn build(kind: IndexKind, shard_count: usize) -> Result<Box<dyn KeyDir>> {
    match kind {
        IndexKind::Sharded => {
            if shard_count == 0 {
                return Err(CaskError::Config(
                    "shard_count must be greater than 0".to_string(),
                ));
            }
            Ok(Box::new(ShardedKeyDir::new(shard_count)))
        }
        IndexKind::Ordered => Ok(Box::new(OrderedKeyDir::new())),
    }
}
