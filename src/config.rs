//! Configuration for CaskKV
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CaskError, Result};

/// Default maximum segment size before rotation (1 GiB)
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 1 << 30;

/// Default number of keydir shards for the hash backing
pub const DEFAULT_SHARD_COUNT: usize = 64;

/// Default maximum key length in bytes
pub const DEFAULT_MAX_KEY_SIZE: usize = u16::MAX as usize;

/// Default maximum value length in bytes (width of the on-disk length field)
pub const DEFAULT_MAX_VALUE_SIZE: usize = u32::MAX as usize;

/// Main configuration for a CaskKV instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Directory holding every file of the store
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── LOCK                (advisory process lock)
    ///     ├── 0000000001.data     (sealed segment)
    ///     ├── 0000000001.hint     (hint file, only for compacted segments)
    ///     └── 0000000002.data     (active segment)
    pub data_dir: PathBuf,

    /// Segment size (in bytes) that triggers rotation of the active segment
    pub max_segment_size: u64,

    /// fsync the active segment after every put/delete
    pub sync_on_write: bool,

    /// Open without write access; put/delete/merge are rejected
    pub read_only: bool,

    // -------------------------------------------------------------------------
    // Index Configuration
    // -------------------------------------------------------------------------
    /// Backing structure of the in-memory keydir
    pub index_kind: IndexKind,

    /// Number of shards (hash backing only)
    pub shard_count: usize,

    // -------------------------------------------------------------------------
    // Record Limits
    // -------------------------------------------------------------------------
    /// Maximum key length in bytes
    pub max_key_size: usize,

    /// Maximum value length in bytes
    pub max_value_size: usize,

    // -------------------------------------------------------------------------
    // Locking
    // -------------------------------------------------------------------------
    /// How long `open` waits for the directory lock. `None` fails immediately.
    pub lock_timeout: Option<Duration>,
}

/// Keydir backing selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    /// Hash map split into independently locked shards (unordered, O(1))
    Sharded,

    /// Single-lock B-tree (key-ordered iteration, O(log n))
    Ordered,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./caskkv_data"),
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            sync_on_write: false,
            read_only: false,
            index_kind: IndexKind::Sharded,
            shard_count: DEFAULT_SHARD_COUNT,
            max_key_size: DEFAULT_MAX_KEY_SIZE,
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
            lock_timeout: None,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_segment_size == 0 {
            return Err(CaskError::Config(
                "max_segment_size must be greater than 0".to_string(),
            ));
        }
        if self.index_kind == IndexKind::Sharded && self.shard_count == 0 {
            return Err(CaskError::Config(
                "shard_count must be greater than 0".to_string(),
            ));
        }
        if self.max_key_size > u32::MAX as usize {
            return Err(CaskError::Config(format!(
                "max_key_size {} exceeds the on-disk limit {}",
                self.max_key_size,
                u32::MAX
            )));
        }
        if self.max_value_size > u32::MAX as usize {
            return Err(CaskError::Config(format!(
                "max_value_size {} exceeds the on-disk limit {}",
                self.max_value_size,
                u32::MAX
            )));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the rotation threshold (in bytes)
    pub fn max_segment_size(mut self, size: u64) -> Self {
        self.config.max_segment_size = size;
        self
    }

    /// fsync after every write
    pub fn sync_on_write(mut self, sync: bool) -> Self {
        self.config.sync_on_write = sync;
        self
    }

    /// Open the store read-only
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.config.read_only = read_only;
        self
    }

    /// Select the keydir backing
    pub fn index_kind(mut self, kind: IndexKind) -> Self {
        self.config.index_kind = kind;
        self
    }

    /// Set the shard count for the hash backing
    pub fn shard_count(mut self, count: usize) -> Self {
        self.config.shard_count = count;
        self
    }

    /// Set the maximum key length
    pub fn max_key_size(mut self, size: usize) -> Self {
        self.config.max_key_size = size;
        self
    }

    /// Set the maximum value length
    pub fn max_value_size(mut self, size: usize) -> Self {
        self.config.max_value_size = size;
        self
    }

    /// Wait up to `timeout` for the directory lock instead of failing fast
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
