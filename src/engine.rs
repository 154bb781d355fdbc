//! Engine Module
//!
//! The storage engine facade that coordinates all components.
//!
//! ## Responsibilities
//! - Take the directory lock, open the segments and rebuild the keydir
//! - Append records and keep the keydir pointing at the newest ones
//! - Serve point reads and full scans straight from the segments
//! - Run merges without stopping writers

use std::fs;
use std::path::Path;

use parking_lot::{Mutex, RwLock};

use crate::config::Config;
use crate::error::{CaskError, Result};
use crate::keydir::{self, IndexEntry, KeyDir};
use crate::lock::{DirLock, LockMode};
use crate::merge::{plan_output_count, Compactor, MergeStats};
use crate::record::{now_secs, RecordCodec};
use crate::recovery::{recover, RecoveryReport};
use crate::segment::{MergeWindow, SegmentManager};

/// State guarded by the engine write lock
#[derive(Debug, Default)]
struct WriteState {
    /// A merge is between its seal and retire phases
    merging: bool,
}

/// The main storage engine
///
/// ## Concurrency Model: Single-Writer / Multiple-Reader (SWMR)
///
/// - **Writes** (put/delete, merge seal and retire): serialized by
///   `write_state`. Append, then keydir update, in that order, so a reader
///   that finds an entry always finds its record on disk.
///
/// - **Reads** (get/fold): never touch `write_state`
///   - Keydir lookups take a shard read lock only
///   - Segment reads are positional and need no lock at all
///   - `retire_gate` is held shared from lookup until the record is read,
///     so merge cannot delete the segment in between
///
/// - **Merge**: the copy phase runs with no engine lock held; only the
///   short retire phase takes `retire_gate` exclusively.
pub struct Engine {
    /// Engine configuration
    config: Config,

    /// Process-level lock on the data directory
    lock: DirLock,

    /// Active and sealed segments
    segments: SegmentManager,

    /// Key → location of the live value
    keydir: Box<dyn KeyDir>,

    /// Size-checked record encoder
    codec: RecordCodec,

    /// Serializes mutations and owns the merge flag
    write_state: Mutex<WriteState>,

    /// Held shared by readers, exclusively while merge retires segments
    retire_gate: RwLock<()>,

    /// What recovery found when the engine was opened
    recovery_report: RecoveryReport,
}

impl Engine {
    /// Open or create a store with the given config
    ///
    /// On startup:
    /// 1. Validate config and create the data directory (writable only)
    /// 2. Take the directory lock (exclusive, or shared when read-only)
    /// 3. Open segments, dropping orphaned temporaries
    /// 4. Rebuild the keydir from hint files and segment scans
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;

        // Step 1: Create data directory if it doesn't exist
        let dir = config.data_dir.clone();
        if !config.read_only {
            fs::create_dir_all(&dir)?;
        }

        // Step 2: Lock the directory
        let mode = if config.read_only {
            LockMode::Shared
        } else {
            LockMode::Exclusive
        };
        let lock = match config.lock_timeout {
            Some(timeout) => DirLock::acquire_timeout(&dir, mode, timeout)?,
            None => DirLock::try_acquire(&dir, mode)?,
        };

        // Step 3: Open segments
        let segments = SegmentManager::open(&dir, config.max_segment_size, config.read_only)?;

        // Step 4: Rebuild the keydir
        let keydir = keydir::build(config.index_kind, config.shard_count)?;
        let recovery_report = recover(&segments, keydir.as_ref())?;

        if !recovery_report.corrupt_segments.is_empty() {
            tracing::warn!(
                "Opened with {} corrupt segment(s); keys past the damage may be stale",
                recovery_report.corrupt_segments.len()
            );
        }

        tracing::info!(
            "Opened {} ({}): {} keys in {} segment(s), active segment {}",
            dir.display(),
            if config.read_only { "read-only" } else { "read-write" },
            keydir.len(),
            segments.segment_count(),
            segments.active_id()
        );

        Ok(Self {
            codec: RecordCodec::new(config.max_key_size, config.max_value_size),
            config,
            lock,
            segments,
            keydir,
            write_state: Mutex::new(WriteState::default()),
            retire_gate: RwLock::new(()),
            recovery_report,
        })
    }

    /// Open with a path (convenience method)
    ///
    /// Uses default config with the specified data directory
    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(Config::builder().data_dir(path).build())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Get the live value of `key`, or `None` if it was never written or has
    /// been deleted
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let _gate = self.retire_gate.read();

        let entry = match self.keydir.get(key) {
            Some(entry) => entry,
            None => return Ok(None),
        };

        self.read_value(key, &entry).map(Some)
    }

    /// Visit every live key/value pair once, in keydir iteration order.
    ///
    /// Works on a snapshot of the keys: pairs written during the fold may or
    /// may not be seen, and a key deleted meanwhile is skipped.
    pub fn fold<B, F>(&self, init: B, mut f: F) -> Result<B>
    where
        F: FnMut(B, &[u8], &[u8]) -> B,
    {
        let mut acc = init;

        for (key, _) in self.keydir.iter() {
            let value = {
                let _gate = self.retire_gate.read();
                match self.keydir.get(&key) {
                    Some(entry) => self.read_value(&key, &entry)?,
                    None => continue,
                }
            };
            acc = f(acc, &key, &value);
        }

        Ok(acc)
    }

    /// Every live key
    pub fn list_keys(&self) -> Vec<Vec<u8>> {
        self.keydir.keys()
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        self.keydir.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keydir.is_empty()
    }

    /// Read the record `entry` points at. Caller holds `retire_gate`.
    fn read_value(&self, key: &[u8], entry: &IndexEntry) -> Result<Vec<u8>> {
        let record = self.segments.read(entry.segment_id, entry.offset)?;

        if record.key != key || record.is_tombstone() {
            return Err(CaskError::Storage(format!(
                "keydir points at a foreign record (segment {}, offset {})",
                entry.segment_id, entry.offset
            )));
        }

        Ok(record.value)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Put a key-value pair
    ///
    /// Steps:
    /// 1. Encode (rejects oversized keys and values before touching disk)
    /// 2. Acquire write lock
    /// 3. Append to the active segment, rotating if needed
    /// 4. Point the keydir at the new record
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_writable()?;

        let timestamp = now_secs();
        let bytes = self.codec.encode_at(key, value, false, timestamp)?;

        let _state = self.write_state.lock();
        let (segment_id, offset) = self.append(&bytes)?;

        self.keydir.put(
            key.to_vec(),
            IndexEntry {
                segment_id,
                offset,
                value_size: value.len() as u32,
                timestamp,
            },
        );

        Ok(())
    }

    /// Delete a key
    ///
    /// Appends a tombstone and drops the key from the keydir. Deleting a key
    /// that is not present writes nothing.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.check_writable()?;
        self.codec.check_key(key)?;

        let _state = self.write_state.lock();
        if self.keydir.get(key).is_none() {
            return Ok(());
        }

        let bytes = self.codec.encode(key, &[], true)?;
        self.append(&bytes)?;
        self.keydir.delete(key);

        Ok(())
    }

    /// fsync the active segment
    pub fn sync(&self) -> Result<()> {
        self.segments.sync()
    }

    /// Append under the write lock, honouring `sync_on_write`
    fn append(&self, bytes: &[u8]) -> Result<(u32, u64)> {
        let location = self.segments.write(bytes)?;
        if self.config.sync_on_write {
            self.segments.sync()?;
        }
        Ok(location)
    }

    fn check_writable(&self) -> Result<()> {
        if self.config.read_only {
            return Err(CaskError::ReadOnlyViolation);
        }
        Ok(())
    }

    // =========================================================================
    // Merge
    // =========================================================================

    /// Compact every sealed segment (plus the active one, which is sealed
    /// first) into fresh segments holding only live records
    pub fn merge(&self) -> Result<MergeStats> {
        self.check_writable()?;

        // Phase 1: snapshot and seal under the write lock
        let (snapshot, window) = {
            let mut state = self.write_state.lock();
            if state.merging {
                return Err(CaskError::MergeInProgress);
            }

            let snapshot: Vec<(Vec<u8>, IndexEntry)> = self.keydir.iter().collect();
            let reserved = plan_output_count(&snapshot, self.segments.max_segment_size());
            let window = self.segments.seal_for_merge(reserved)?;

            state.merging = true;
            (snapshot, window)
        };

        let _flag = MergeFlag(&self.write_state);

        tracing::info!(
            "Merge started: {} keys across {} source segment(s)",
            snapshot.len(),
            window.sources.len()
        );

        let stats = self.run_merge(snapshot, &window)?;

        tracing::info!(
            "Merge complete: {} keys copied, {} skipped, {} segment(s) written, {} retired",
            stats.keys_copied,
            stats.keys_skipped,
            stats.output_segments,
            stats.segments_retired
        );

        Ok(stats)
    }

    /// Copy, publish and retire. Runs with the merge flag set.
    fn run_merge(
        &self,
        snapshot: Vec<(Vec<u8>, IndexEntry)>,
        window: &MergeWindow,
    ) -> Result<MergeStats> {
        // Phase 2: copy without any engine lock
        let output = Compactor::new(&self.segments, window).copy(snapshot)?;

        // Phase 3: make the outputs durable under their final names
        let published = output.publish()?;

        let mut stats = MergeStats {
            source_segments: window.sources.len(),
            output_segments: published.segments.len(),
            keys_copied: published.relocations.len(),
            keys_skipped: published.keys_skipped,
            segments_retired: 0,
        };

        // Phase 4: swap in the outputs and drop the sources
        let _state = self.write_state.lock();
        let _gate = self.retire_gate.write();
        stats.segments_retired =
            published.install(&self.segments, self.keydir.as_ref(), &window.sources)?;

        Ok(stats)
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Close the engine gracefully
    ///
    /// Syncs and closes every segment, clears the keydir and releases the
    /// directory lock. Every step runs; failures are collected into
    /// [`CaskError::Close`].
    pub fn close(self) -> Result<()> {
        let mut errors = Vec::new();

        {
            let _state = self.write_state.lock();
            match self.segments.close() {
                Ok(()) => {}
                Err(CaskError::Close(inner)) => errors.extend(inner),
                Err(e) => errors.push(e),
            }
            self.keydir.close();
        }

        if let Err(e) = self.lock.release() {
            errors.push(e);
        }

        if errors.is_empty() {
            tracing::info!("Closed {}", self.config.data_dir.display());
            Ok(())
        } else {
            tracing::error!(
                "Closed {} with {} error(s)",
                self.config.data_dir.display(),
                errors.len()
            );
            Err(CaskError::Close(errors))
        }
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// Number of segments, active included
    pub fn segment_count(&self) -> usize {
        self.segments.segment_count()
    }

    pub fn active_segment_id(&self) -> u32 {
        self.segments.active_id()
    }

    /// Get what recovery found at open
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery_report
    }

    /// Whether a merge is currently running
    pub fn is_merging(&self) -> bool {
        self.write_state.lock().merging
    }
}

/// Clears the merge flag on every exit path of a merge
struct MergeFlag<'a>(&'a Mutex<WriteState>);

impl Drop for MergeFlag<'_> {
    fn drop(&mut self) {
        self.0.lock().merging = false;
    }
}
