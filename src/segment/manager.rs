//! Segment Manager
//!
//! Owns the active segment and the set of sealed segments.
//!
//! ## Responsibilities
//! - Discover existing segments on startup and resume from the highest id
//! - Route appends to the active segment, rotating when it is full
//! - Route reads to the active or a sealed segment by id
//! - Seal, install and retire segments on behalf of merge

use std::collections::BTreeMap;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{CaskError, Result};
use crate::record::LogRecord;

use super::{
    discover_segment_ids, hint_path, remove_orphans, Segment, FIRST_SEGMENT_ID,
};

/// Segments handed to a merge, plus the ids reserved for its output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeWindow {
    /// Every sealed segment at the time of sealing, ascending
    pub sources: Vec<u32>,
    /// Ids between the sources and the new active segment
    pub output_ids: Range<u32>,
}

/// Manages the segment set
///
/// ## Concurrency:
/// - `write_lock`: rotation and the append that follows it are one unit
/// - `active`: swapped under a short write lock during rotation; readers
///   clone the `Arc` and read without holding anything
/// - `sealed`: RwLock, many concurrent readers; a rotated segment is inserted
///   here before the active pointer moves, so no id is ever unroutable
pub struct SegmentManager {
    dir: PathBuf,
    max_segment_size: u64,
    read_only: bool,
    active: RwLock<Arc<Segment>>,
    sealed: RwLock<BTreeMap<u32, Arc<Segment>>>,
    write_lock: Mutex<()>,
}

impl SegmentManager {
    /// Open or create the segment set in `dir`
    ///
    /// On startup:
    /// 1. Create the directory and drop orphaned temporaries (writable only)
    /// 2. Discover segment ids
    /// 3. Open the highest id as active, the rest as sealed
    pub fn open(dir: &Path, max_segment_size: u64, read_only: bool) -> Result<Self> {
        if !read_only {
            fs::create_dir_all(dir)?;
            remove_orphans(dir)?;
        }

        let ids = discover_segment_ids(dir)?;

        let active_id = match ids.last() {
            Some(&id) => id,
            None if read_only => {
                return Err(CaskError::Storage(format!(
                    "{} contains no segments to open read-only",
                    dir.display()
                )))
            }
            None => FIRST_SEGMENT_ID,
        };

        let mut sealed = BTreeMap::new();
        for &id in ids.iter().filter(|&&id| id != active_id) {
            sealed.insert(id, Arc::new(Segment::open(dir, id, true)?));
        }

        let active = Segment::open(dir, active_id, read_only)?;

        tracing::debug!(
            "Opened {} sealed segment(s), active segment {} ({} bytes)",
            sealed.len(),
            active_id,
            active.size()
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            max_segment_size,
            read_only,
            active: RwLock::new(Arc::new(active)),
            sealed: RwLock::new(sealed),
            write_lock: Mutex::new(()),
        })
    }

    /// Append an encoded record, rotating first if it would overflow
    /// the active segment. Returns `(segment_id, offset)`.
    pub fn write(&self, bytes: &[u8]) -> Result<(u32, u64)> {
        if self.read_only {
            return Err(CaskError::ReadOnlyViolation);
        }

        let _guard = self.write_lock.lock();

        let mut active = self.active();
        if self.needs_rotation(active.size(), bytes.len() as u64) {
            let next_id = next_id(active.id(), 1)?;
            active = self.rotate(&active, next_id)?;
        }

        let offset = active.append(bytes)?;
        Ok((active.id(), offset))
    }

    /// Read the record at `(segment_id, offset)`
    pub fn read(&self, segment_id: u32, offset: u64) -> Result<LogRecord> {
        self.segment(segment_id)
            .ok_or(CaskError::SegmentNotFound(segment_id))?
            .read_at(offset)
    }

    /// fsync the active segment
    pub fn sync(&self) -> Result<()> {
        self.active().sync()
    }

    /// Sync the active segment and drop every handle.
    ///
    /// Errors are collected rather than stopping at the first one.
    pub fn close(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut errors = Vec::new();

        if let Err(e) = self.active().sync() {
            errors.push(e);
        }
        let mut sealed = self.sealed.write();
        for segment in sealed.values() {
            if let Err(e) = segment.sync() {
                errors.push(e);
            }
        }
        sealed.clear();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CaskError::Close(errors))
        }
    }

    /// Discard everything past `len` in the active segment
    pub fn truncate_active(&self, len: u64) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.active().truncate(len)
    }

    // =========================================================================
    // Merge Support
    // =========================================================================

    /// Seal the active segment and open a new one `reserved` ids further on.
    ///
    /// The skipped ids are for merge output: they sort after every source
    /// and before anything written from now on.
    pub fn seal_for_merge(&self, reserved: u32) -> Result<MergeWindow> {
        if self.read_only {
            return Err(CaskError::ReadOnlyViolation);
        }

        let _guard = self.write_lock.lock();

        let current = self.active();
        let first_output = next_id(current.id(), 1)?;
        let new_active = next_id(current.id(), reserved.saturating_add(1))?;
        self.rotate(&current, new_active)?;

        let sources = self.sealed.read().keys().copied().collect();
        Ok(MergeWindow {
            sources,
            output_ids: first_output..new_active,
        })
    }

    /// Register a published, read-only segment
    pub fn install(&self, segment: Segment) -> Result<()> {
        if !segment.is_read_only() {
            return Err(CaskError::Storage(format!(
                "segment {} must be read-only to be installed",
                segment.id()
            )));
        }
        self.sealed.write().insert(segment.id(), Arc::new(segment));
        Ok(())
    }

    /// Delete a sealed segment and its hint file
    pub fn retire(&self, id: u32) -> Result<()> {
        if id == self.active_id() {
            return Err(CaskError::Storage(format!(
                "cannot retire active segment {}",
                id
            )));
        }

        let segment = self
            .sealed
            .write()
            .remove(&id)
            .ok_or(CaskError::SegmentNotFound(id))?;
        segment.destroy()?;

        let hint = hint_path(&self.dir, id);
        if hint.exists() {
            fs::remove_file(&hint)?;
        }

        tracing::debug!("Retired segment {}", id);
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Handle to the active or a sealed segment
    pub fn segment(&self, id: u32) -> Option<Arc<Segment>> {
        let active = self.active();
        if active.id() == id {
            return Some(active);
        }
        self.sealed.read().get(&id).cloned()
    }

    /// Every segment id, ascending (the active id is always last)
    pub fn segment_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.sealed.read().keys().copied().collect();
        ids.push(self.active_id());
        ids
    }

    pub fn segment_count(&self) -> usize {
        self.sealed.read().len() + 1
    }

    pub fn active_id(&self) -> u32 {
        self.active.read().id()
    }

    pub fn active_size(&self) -> u64 {
        self.active.read().size()
    }

    pub fn max_segment_size(&self) -> u64 {
        self.max_segment_size
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn active(&self) -> Arc<Segment> {
        Arc::clone(&self.active.read())
    }

    /// A record never shares a segment it would overflow, unless the segment
    /// is still empty (an oversized record gets a segment of its own)
    fn needs_rotation(&self, current_size: u64, record_len: u64) -> bool {
        current_size > 0 && current_size + record_len > self.max_segment_size
    }

    /// Seal `current` and make `next_id` the active segment.
    /// Caller holds `write_lock`.
    fn rotate(&self, current: &Arc<Segment>, next_id: u32) -> Result<Arc<Segment>> {
        current.sync()?;
        let sealed = Arc::new(Segment::open(&self.dir, current.id(), true)?);
        let next = Arc::new(Segment::open(&self.dir, next_id, false)?);

        self.sealed.write().insert(current.id(), sealed);
        *self.active.write() = Arc::clone(&next);

        tracing::debug!(
            "Rotated segment {} ({} bytes), new active segment {}",
            current.id(),
            current.size(),
            next_id
        );

        Ok(next)
    }
}

fn next_id(id: u32, step: u32) -> Result<u32> {
    id.checked_add(step)
        .ok_or_else(|| CaskError::Storage("segment id space exhausted".to_string()))
}
