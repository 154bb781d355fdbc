//! Segment Module
//!
//! Append-only segment files and the manager that rotates them.
//!
//! ## Responsibilities
//! - Append encoded records and hand out their offsets
//! - Positional reads that never block appends
//! - Rotate the active segment once it would exceed the size limit
//! - Route reads to the active or a sealed segment by id
//!
//! ## Directory Layout
//! ```text
//! {data_dir}/
//!   ├── LOCK
//!   ├── 0000000001.data        sealed, immutable
//!   ├── 0000000003.data        compacted output
//!   ├── 0000000003.hint        hint file for 3
//!   ├── 0000000004.data        active (highest id)
//!   └── 0000000005.data.tmp    unpublished merge output, removed at open
//! ```

mod file;
mod manager;

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

pub use file::{Segment, SegmentIter};
pub use manager::{MergeWindow, SegmentManager};

/// Id given to the first segment of an empty store
pub const FIRST_SEGMENT_ID: u32 = 1;

/// Extension of segment data files
pub const SEGMENT_EXT: &str = "data";

/// Extension of hint files
pub const HINT_EXT: &str = "hint";

/// Suffix of files that have not been published yet
pub const TEMP_EXT: &str = "tmp";

/// "0000000042.data"
pub fn segment_path(dir: &Path, id: u32) -> PathBuf {
    dir.join(format!("{:010}.{}", id, SEGMENT_EXT))
}

/// "0000000042.hint"
pub fn hint_path(dir: &Path, id: u32) -> PathBuf {
    dir.join(format!("{:010}.{}", id, HINT_EXT))
}

/// "0000000042.data" → "0000000042.data.tmp"
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(TEMP_EXT);
    PathBuf::from(name)
}

/// "0000000042.data" → Some(42)
pub fn parse_segment_id(path: &Path) -> Option<u32> {
    if path.extension() != Some(OsStr::new(SEGMENT_EXT)) {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

/// Ids of every segment file in `dir`, ascending
pub fn discover_segment_ids(dir: &Path) -> Result<Vec<u32>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            if let Some(id) = parse_segment_id(&path) {
                ids.push(id);
            }
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Delete temporary files left behind by an interrupted merge
pub fn remove_orphans(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension() == Some(OsStr::new(TEMP_EXT)) {
            tracing::warn!("Removing orphaned temporary file {}", path.display());
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Make renames and unlinks in `dir` durable
pub fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        fs::File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}
