//! Merge Module
//!
//! Compaction of sealed segments into fresh segments plus hint files.
//!
//! ## Protocol
//! 1. Snapshot the keydir and seal the active segment; every sealed segment
//!    becomes a source. Output ids are reserved between the sources and the
//!    new active segment, so recovery order stays sources → outputs → newer
//!    writes.
//! 2. Copy each snapshot entry's record into the current output segment and
//!    add a hint entry for it. Deleted keys are not in the snapshot, so
//!    tombstones and the values they shadow are dropped.
//! 3. Verify and fsync the outputs under temporary names, then rename them
//!    into place.
//! 4. Repoint keydir entries that did not change meanwhile and retire the
//!    sources. When a source record could not be copied, sources from that
//!    one on are kept, except earlier merge outputs nothing points into.
//!
//! Steps 1 and 4 run under the engine's write lock; step 2 and 3 do not, so
//! writes continue during the copy.

mod compactor;
pub mod hint;

pub use compactor::{CompactionOutput, Compactor, PublishedMerge, Relocation};
pub use hint::{read_hint, HintEntry, HintWriter, HINT_VERSION};

use crate::keydir::IndexEntry;

/// Summary of one merge run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Segments sealed and handed to the merge
    pub source_segments: usize,

    /// Compacted segments published
    pub output_segments: usize,

    /// Live records copied forward
    pub keys_copied: usize,

    /// Snapshot entries whose source record could not be read
    pub keys_skipped: usize,

    /// Source segments deleted
    pub segments_retired: usize,
}

/// Number of output segments the snapshot fills at `max_segment_size`.
///
/// Mirrors the rotation rule of the segment manager: a record starts a new
/// segment when it would overflow a non-empty one.
pub fn plan_output_count(snapshot: &[(Vec<u8>, IndexEntry)], max_segment_size: u64) -> u32 {
    let mut count = 0u32;
    let mut current = 0u64;

    for (key, entry) in snapshot {
        let len = entry.record_len(key.len()) as u64;
        if count == 0 || (current > 0 && current + len > max_segment_size) {
            count += 1;
            current = 0;
        }
        current += len;
    }

    count
}
