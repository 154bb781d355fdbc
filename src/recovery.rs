//! Recovery
//!
//! Rebuilds the keydir from disk when a store is opened.
//!
//! Segments are replayed in ascending id order so later records override
//! earlier ones. A segment with a valid hint file is replayed from the hint
//! alone; any other segment is scanned record by record.
//!
//! ## Damage Handling
//! - Highest segment: a bad record is a torn write from an unclean shutdown.
//!   Scanning stops there and, when writable, the file is cut back to the
//!   last good record so new appends are not hidden behind the garbage.
//! - Any other segment: a bad record is an integrity error. It is logged and
//!   reported, records before it stay applied, and the open continues.

use crate::error::{CaskError, Result};
use crate::keydir::{IndexEntry, KeyDir};
use crate::merge::hint::{read_hint, HintEntry};
use crate::record::RecordFlag;
use crate::segment::{hint_path, Segment, SegmentManager};

/// Outcome of a recovery pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Segments rebuilt from their hint file
    pub hints_loaded: usize,

    /// Segments scanned record by record
    pub segments_scanned: usize,

    /// Hint entries and records applied to the keydir
    pub records_applied: u64,

    /// Whether a torn tail was found in the highest segment
    pub tail_truncated: bool,

    /// Sealed segments with unreadable records
    pub corrupt_segments: Vec<CorruptSegment>,
}

/// An integrity error found in a sealed segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptSegment {
    pub segment_id: u32,
    /// Offset of the first unreadable record
    pub offset: u64,
    pub reason: String,
}

/// Replay every segment of `segments` into `keydir`
pub fn recover(segments: &SegmentManager, keydir: &dyn KeyDir) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    let ids = segments.segment_ids();
    let tail_id = ids.last().copied();

    for id in ids {
        let segment = segments
            .segment(id)
            .ok_or(CaskError::SegmentNotFound(id))?;

        if let Some(entries) = load_hint(segments, &segment) {
            tracing::debug!("Segment {}: loaded {} keys from hint file", id, entries.len());
            report.records_applied += entries.len() as u64;
            report.hints_loaded += 1;
            for entry in entries {
                let index = entry.index_entry();
                keydir.put(entry.key, index);
            }
            continue;
        }

        scan_segment(segments, &segment, keydir, Some(id) == tail_id, &mut report)?;
    }

    tracing::info!(
        "Recovery complete: {} keys, {} hint file(s), {} segment(s) scanned, {} record(s) applied",
        keydir.len(),
        report.hints_loaded,
        report.segments_scanned,
        report.records_applied
    );

    Ok(report)
}

/// Read the hint file of `segment`, if there is a valid one
fn load_hint(segments: &SegmentManager, segment: &Segment) -> Option<Vec<HintEntry>> {
    let path = hint_path(segments.dir(), segment.id());
    if !path.exists() {
        return None;
    }

    let entries = match read_hint(&path, segment.id()) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("Ignoring hint file, scanning segment instead: {}", e);
            return None;
        }
    };

    // Every entry must point inside the segment it describes
    let size = segment.size();
    let out_of_bounds = entries
        .iter()
        .any(|e| {
            e.offset
                .saturating_add(e.index_entry().record_len(e.key.len()) as u64)
                > size
        });
    if out_of_bounds {
        tracing::warn!(
            "Hint file {} points past the end of segment {}, scanning instead",
            path.display(),
            segment.id()
        );
        return None;
    }

    Some(entries)
}

fn scan_segment(
    segments: &SegmentManager,
    segment: &Segment,
    keydir: &dyn KeyDir,
    is_tail: bool,
    report: &mut RecoveryReport,
) -> Result<()> {
    report.segments_scanned += 1;
    let mut iter = segment.iter()?;
    let mut applied = 0u64;

    while let Some(item) = iter.next() {
        let (offset, record) = match item {
            Ok(item) => item,
            Err(CaskError::Io(e)) => return Err(CaskError::Io(e)),
            Err(e) => {
                let good_len = iter.position();
                if is_tail {
                    tracing::warn!(
                        "Segment {}: discarding torn tail at offset {} ({} bytes): {}",
                        segment.id(),
                        good_len,
                        segment.size() - good_len,
                        e
                    );
                    if !segment.is_read_only() {
                        segments.truncate_active(good_len)?;
                    }
                    report.tail_truncated = true;
                } else {
                    tracing::error!(
                        "Segment {}: unreadable record at offset {}, skipping rest of segment: {}",
                        segment.id(),
                        good_len,
                        e
                    );
                    report.corrupt_segments.push(CorruptSegment {
                        segment_id: segment.id(),
                        offset: good_len,
                        reason: e.to_string(),
                    });
                }
                break;
            }
        };

        match record.flag {
            RecordFlag::Normal => keydir.put(
                record.key,
                IndexEntry {
                    segment_id: segment.id(),
                    offset,
                    value_size: record.value.len() as u32,
                    timestamp: record.timestamp,
                },
            ),
            RecordFlag::Tombstone => {
                keydir.delete(&record.key);
            }
        }
        applied += 1;
    }

    tracing::debug!("Segment {}: replayed {} records", segment.id(), applied);
    report.records_applied += applied;
    Ok(())
}
