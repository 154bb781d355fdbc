//! Compactor
//!
//! Copy phase and publication of a merge.

use std::collections::BTreeSet;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use crate::error::{CaskError, Result};
use crate::keydir::{IndexEntry, KeyDir};
use crate::record::LogRecord;
use crate::segment::{
    hint_path, segment_path, sync_dir, temp_path, MergeWindow, Segment, SegmentManager,
};

use super::hint::{HintEntry, HintWriter};

/// A key moved by the merge: where it was in the snapshot and where it is now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    pub key: Vec<u8>,
    pub old: IndexEntry,
    pub new: IndexEntry,
}

/// Rewrites the live records of a snapshot into fresh segments
pub struct Compactor<'a> {
    segments: &'a SegmentManager,
    window: &'a MergeWindow,
}

impl<'a> Compactor<'a> {
    pub fn new(segments: &'a SegmentManager, window: &'a MergeWindow) -> Self {
        Self { segments, window }
    }

    /// Copy every snapshot entry into output segments under temporary names.
    ///
    /// Unreadable source records are skipped and reported; an I/O failure,
    /// or an output segment that fails verification, aborts the merge and
    /// removes everything written so far.
    pub fn copy(
        &self,
        snapshot: impl IntoIterator<Item = (Vec<u8>, IndexEntry)>,
    ) -> Result<CompactionOutput> {
        let mut writer = OutputWriter::new(
            self.segments.dir(),
            self.segments.max_segment_size(),
            self.window.output_ids.clone(),
        );

        let mut relocations = Vec::new();
        let mut failed_sources = BTreeSet::new();
        let mut keys_skipped = 0;

        for (key, old) in snapshot {
            let record = match self.read_source(&key, &old) {
                Ok(record) => record,
                Err(CaskError::Io(e)) => {
                    writer.discard();
                    return Err(CaskError::Io(e));
                }
                Err(e) => {
                    tracing::warn!(
                        "Merge skipping key in segment {} at offset {}: {}",
                        old.segment_id,
                        old.offset,
                        e
                    );
                    failed_sources.insert(old.segment_id);
                    keys_skipped += 1;
                    continue;
                }
            };

            let bytes = record.encode();
            let (segment_id, offset) = match writer.append(&bytes) {
                Ok(location) => location,
                Err(e) => {
                    writer.discard();
                    return Err(e);
                }
            };

            let new = IndexEntry {
                segment_id,
                offset,
                value_size: record.value.len() as u32,
                timestamp: record.timestamp,
            };

            if let Err(e) = writer.add_hint(&HintEntry::new(key.clone(), new)) {
                writer.discard();
                return Err(e);
            }

            relocations.push(Relocation { key, old, new });
        }

        let outputs = writer.finish()?;

        let tombstone_free = match failed_sources.first() {
            Some(&first_failed) => self.tombstone_free_sources(first_failed),
            None => BTreeSet::new(),
        };

        Ok(CompactionOutput {
            dir: self.segments.dir().to_path_buf(),
            outputs,
            relocations,
            failed_sources,
            tombstone_free,
            keys_skipped,
        })
    }

    /// Sources from `first_failed` on that provably hold no tombstone
    fn tombstone_free_sources(&self, first_failed: u32) -> BTreeSet<u32> {
        self.window
            .sources
            .iter()
            .copied()
            .filter(|&id| id >= first_failed && self.holds_no_tombstones(id))
            .collect()
    }

    /// Merge outputs (segments with a hint file) never do; anything else is
    /// scanned, and a scan that cannot finish counts as "may hold one"
    fn holds_no_tombstones(&self, id: u32) -> bool {
        if hint_path(self.segments.dir(), id).exists() {
            return true;
        }
        let Some(segment) = self.segments.segment(id) else {
            return false;
        };
        let Ok(records) = segment.iter() else {
            return false;
        };
        for item in records {
            match item {
                Ok((_, record)) if !record.is_tombstone() => {}
                _ => return false,
            }
        }
        true
    }

    fn read_source(&self, key: &[u8], entry: &IndexEntry) -> Result<LogRecord> {
        if !self.window.sources.contains(&entry.segment_id) {
            return Err(CaskError::SegmentNotFound(entry.segment_id));
        }

        let record = self.segments.read(entry.segment_id, entry.offset)?;
        if record.key != key || record.is_tombstone() {
            return Err(CaskError::Storage(format!(
                "record at segment {} offset {} does not hold a live value for its key",
                entry.segment_id, entry.offset
            )));
        }
        Ok(record)
    }
}

// =============================================================================
// Output Handling
// =============================================================================

/// Output of the copy phase, still under temporary names
pub struct CompactionOutput {
    dir: PathBuf,
    outputs: Vec<FinishedOutput>,
    relocations: Vec<Relocation>,
    failed_sources: BTreeSet<u32>,
    tombstone_free: BTreeSet<u32>,
    keys_skipped: usize,
}

/// Result of publishing: segments ready to install plus keydir updates
pub struct PublishedMerge {
    pub segments: Vec<Segment>,
    pub relocations: Vec<Relocation>,
    /// Sources with at least one record that could not be copied
    pub failed_sources: BTreeSet<u32>,
    /// Sources from the first failed one on known to hold no tombstones
    pub tombstone_free: BTreeSet<u32>,
    pub keys_skipped: usize,
}

impl CompactionOutput {
    /// Rename every output and hint file into place, then reopen the
    /// segments read-only.
    ///
    /// If a rename fails, every output (published or not) is removed again:
    /// nothing references them yet, and a stray copy of old values must not
    /// outlive the tombstones that shadow them.
    pub fn publish(self) -> Result<PublishedMerge> {
        let segments = match self.publish_outputs() {
            Ok(segments) => segments,
            Err(e) => {
                for output in self.outputs {
                    let _ = fs::remove_file(segment_path(&self.dir, output.id));
                    let _ = fs::remove_file(hint_path(&self.dir, output.id));
                    output.remove();
                }
                return Err(e);
            }
        };

        Ok(PublishedMerge {
            segments,
            relocations: self.relocations,
            failed_sources: self.failed_sources,
            tombstone_free: self.tombstone_free,
            keys_skipped: self.keys_skipped,
        })
    }

    fn publish_outputs(&self) -> Result<Vec<Segment>> {
        for output in &self.outputs {
            output.rename_into_place(&self.dir)?;
        }
        sync_dir(&self.dir)?;

        self.outputs
            .iter()
            .map(|output| Segment::open(&self.dir, output.id, true))
            .collect()
    }
}

impl PublishedMerge {
    /// Swap the outputs in, repoint unchanged keys and retire what the merge
    /// made redundant. Returns the number of sources retired.
    ///
    /// Callers must exclude writers and segment readers while this runs.
    pub fn install(
        self,
        segments: &SegmentManager,
        keydir: &dyn KeyDir,
        sources: &[u32],
    ) -> Result<usize> {
        let PublishedMerge {
            segments: outputs,
            relocations,
            failed_sources,
            tombstone_free,
            ..
        } = self;

        for segment in outputs {
            segments.install(segment)?;
        }

        // Keys overwritten or deleted during the copy keep their newer entry
        for relocation in relocations {
            if keydir.get(&relocation.key) == Some(relocation.old) {
                keydir.put(relocation.key, relocation.new);
            }
        }

        let retirable = retirable_sources(keydir, sources, &failed_sources, &tombstone_free);
        for &id in &retirable {
            segments.retire(id)?;
        }
        Ok(retirable.len())
    }
}

/// Sources that can be deleted once the keydir has been repointed.
///
/// A failed source may hold the only tombstone for an older value, so it and
/// every later source stay, unless the later source holds no tombstone and no
/// key points into it.
fn retirable_sources(
    keydir: &dyn KeyDir,
    sources: &[u32],
    failed_sources: &BTreeSet<u32>,
    tombstone_free: &BTreeSet<u32>,
) -> Vec<u32> {
    let Some(&first_failed) = failed_sources.first() else {
        return sources.to_vec();
    };

    let referenced: BTreeSet<u32> = keydir.iter().map(|(_, entry)| entry.segment_id).collect();
    let retirable: Vec<u32> = sources
        .iter()
        .copied()
        .filter(|&id| {
            id < first_failed || (tombstone_free.contains(&id) && !referenced.contains(&id))
        })
        .collect();

    tracing::warn!(
        "Merge keeping {} source segment(s) from {} on: records there could not be copied",
        sources.len() - retirable.len(),
        first_failed
    );
    retirable
}

struct PendingOutput {
    id: u32,
    segment: Segment,
    hint: HintWriter,
    records: usize,
}

struct FinishedOutput {
    id: u32,
    data_temp: PathBuf,
    hint_temp: PathBuf,
}

impl FinishedOutput {
    fn rename_into_place(&self, dir: &Path) -> Result<()> {
        fs::rename(&self.data_temp, segment_path(dir, self.id))?;
        fs::rename(&self.hint_temp, hint_path(dir, self.id))?;
        Ok(())
    }

    fn remove(self) {
        let _ = fs::remove_file(&self.data_temp);
        let _ = fs::remove_file(&self.hint_temp);
    }
}

impl PendingOutput {
    fn create(dir: &Path, id: u32) -> Result<Self> {
        let segment = Segment::create_at(&temp_path(&segment_path(dir, id)), id)?;
        let hint = HintWriter::create(&hint_path(dir, id))?;
        Ok(Self {
            id,
            segment,
            hint,
            records: 0,
        })
    }

    /// fsync, re-read every record, then finish the hint file
    fn finish(self) -> Result<FinishedOutput> {
        let data_temp = self.segment.path().to_path_buf();

        if let Err(e) = self.segment.sync().and_then(|_| verify(&self.segment, self.records)) {
            let _ = fs::remove_file(&data_temp);
            self.hint.abort();
            return Err(e);
        }

        let id = self.id;
        drop(self.segment);
        match self.hint.finish() {
            Ok(hint_temp) => Ok(FinishedOutput {
                id,
                data_temp,
                hint_temp,
            }),
            Err(e) => {
                let _ = fs::remove_file(&data_temp);
                Err(e)
            }
        }
    }

    fn abort(self) {
        let data_temp = self.segment.path().to_path_buf();
        drop(self.segment);
        let _ = fs::remove_file(data_temp);
        self.hint.abort();
    }
}

/// Scan a freshly written output; any decode failure is fatal to the merge
fn verify(segment: &Segment, expected_records: usize) -> Result<()> {
    let mut count = 0;
    let mut iter = segment.iter()?;
    for item in iter.by_ref() {
        item.map_err(|e| {
            CaskError::Storage(format!(
                "merge output segment {} failed verification: {}",
                segment.id(),
                e
            ))
        })?;
        count += 1;
    }

    if count != expected_records || iter.position() != segment.size() {
        return Err(CaskError::Storage(format!(
            "merge output segment {} holds {} readable records ({} bytes), expected {} ({} bytes)",
            segment.id(),
            count,
            iter.position(),
            expected_records,
            segment.size()
        )));
    }
    Ok(())
}

/// Appends records across the reserved output ids
struct OutputWriter<'a> {
    dir: &'a Path,
    max_segment_size: u64,
    ids: Range<u32>,
    current: Option<PendingOutput>,
    finished: Vec<FinishedOutput>,
}

impl<'a> OutputWriter<'a> {
    fn new(dir: &'a Path, max_segment_size: u64, ids: Range<u32>) -> Self {
        Self {
            dir,
            max_segment_size,
            ids,
            current: None,
            finished: Vec::new(),
        }
    }

    fn append(&mut self, bytes: &[u8]) -> Result<(u32, u64)> {
        let len = bytes.len() as u64;
        let rotate = match &self.current {
            None => true,
            // Stay in the last reserved segment rather than run out of ids
            Some(output) => {
                let size = output.segment.size();
                size > 0 && size + len > self.max_segment_size && !self.ids.is_empty()
            }
        };

        if rotate {
            let id = self.ids.next().ok_or_else(|| {
                CaskError::Storage("merge ran out of reserved segment ids".to_string())
            })?;
            let next = PendingOutput::create(self.dir, id)?;
            if let Some(previous) = self.current.replace(next) {
                self.finished.push(previous.finish()?);
            }
        }

        let output = self
            .current
            .as_mut()
            .ok_or_else(|| CaskError::Storage("no merge output segment open".to_string()))?;
        let offset = output.segment.append(bytes)?;
        output.records += 1;
        Ok((output.id, offset))
    }

    fn add_hint(&mut self, entry: &HintEntry) -> Result<()> {
        match self.current.as_mut() {
            Some(output) => output.hint.add(entry),
            None => Err(CaskError::Storage(
                "no merge output segment open".to_string(),
            )),
        }
    }

    fn finish(mut self) -> Result<Vec<FinishedOutput>> {
        if let Some(last) = self.current.take() {
            match last.finish() {
                Ok(output) => self.finished.push(output),
                Err(e) => {
                    self.discard();
                    return Err(e);
                }
            }
        }
        Ok(std::mem::take(&mut self.finished))
    }

    fn discard(&mut self) {
        if let Some(current) = self.current.take() {
            current.abort();
        }
        for output in self.finished.drain(..) {
            output.remove();
        }
    }
}
