//! Hint files
//!
//! A hint file lists every key of one compacted segment together with its
//! location, so recovery can rebuild the keydir without reading values.
//!
//! ## File Format (big-endian)
//! ```text
//! ┌─────────────┐
//! │ Version (4) │
//! ├─────────────┴───┬────────────┬────────────────┬───────────────┬─────────────┬─────┐
//! │ SegmentId (4)   │ Offset (8) │ ValueSize (4)  │ Timestamp (8) │ KeyLen (4)  │ Key │
//! └─────────────────┴────────────┴────────────────┴───────────────┴─────────────┴─────┘
//!   ... repeated once per live key, in keydir snapshot order ...
//! ```

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{CaskError, Result};
use crate::keydir::IndexEntry;
use crate::segment::temp_path;

/// Current hint file format version
pub const HINT_VERSION: u32 = 1;

/// Version field
pub const HINT_HEADER_SIZE: usize = 4;

/// SegmentId (4) + Offset (8) + ValueSize (4) + Timestamp (8) + KeyLen (4)
pub const HINT_ENTRY_HEADER_SIZE: usize = 28;

/// One live key of a compacted segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HintEntry {
    pub key: Vec<u8>,
    pub segment_id: u32,
    pub offset: u64,
    pub value_size: u32,
    pub timestamp: u64,
}

impl HintEntry {
    pub fn new(key: Vec<u8>, entry: IndexEntry) -> Self {
        Self {
            key,
            segment_id: entry.segment_id,
            offset: entry.offset,
            value_size: entry.value_size,
            timestamp: entry.timestamp,
        }
    }

    /// The keydir entry this hint restores
    pub fn index_entry(&self) -> IndexEntry {
        IndexEntry {
            segment_id: self.segment_id,
            offset: self.offset,
            value_size: self.value_size,
            timestamp: self.timestamp,
        }
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32(self.segment_id);
        buf.put_u64(self.offset);
        buf.put_u32(self.value_size);
        buf.put_u64(self.timestamp);
        buf.put_u32(self.key.len() as u32);
        buf.put_slice(&self.key);
    }
}

// =============================================================================
// Writer
// =============================================================================

/// Writes a hint file under its temporary name.
///
/// Nothing is visible under the final name until the caller renames the
/// finished temporary file into place.
pub struct HintWriter {
    temp_path: PathBuf,
    writer: BufWriter<File>,
    buf: BytesMut,
    entry_count: usize,
}

impl HintWriter {
    /// Start a hint file that will eventually live at `final_path`
    pub fn create(final_path: &Path) -> Result<Self> {
        let temp_path = temp_path(final_path);
        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&HINT_VERSION.to_be_bytes())?;

        Ok(Self {
            temp_path,
            writer,
            buf: BytesMut::with_capacity(HINT_ENTRY_HEADER_SIZE + 64),
            entry_count: 0,
        })
    }

    pub fn add(&mut self, entry: &HintEntry) -> Result<()> {
        self.buf.clear();
        entry.encode_into(&mut self.buf);
        self.writer.write_all(&self.buf)?;
        self.entry_count += 1;
        Ok(())
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    /// Flush and fsync; returns the temporary path to be renamed
    pub fn finish(mut self) -> Result<PathBuf> {
        self.writer.flush()?;
        let file = self.writer.into_inner().map_err(|e| {
            CaskError::Storage(format!("Failed to flush hint file: {}", e))
        })?;
        file.sync_all()?;
        Ok(self.temp_path)
    }

    /// Throw the unfinished file away
    pub fn abort(self) {
        let HintWriter {
            temp_path, writer, ..
        } = self;
        drop(writer);
        let _ = fs::remove_file(temp_path);
    }
}

// =============================================================================
// Reader
// =============================================================================

/// Read and validate a hint file describing segment `segment_id`.
///
/// The file is rejected as a whole if the version is unknown, any entry is
/// truncated, or any entry names a different segment.
pub fn read_hint(path: &Path, segment_id: u32) -> Result<Vec<HintEntry>> {
    let data = fs::read(path)?;
    let mut buf = &data[..];

    if buf.remaining() < HINT_HEADER_SIZE {
        return Err(CaskError::InvalidHint(format!(
            "{}: missing version header",
            path.display()
        )));
    }

    let version = buf.get_u32();
    if version != HINT_VERSION {
        return Err(CaskError::InvalidHint(format!(
            "{}: unsupported version {}",
            path.display(),
            version
        )));
    }

    let mut entries = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < HINT_ENTRY_HEADER_SIZE {
            return Err(CaskError::InvalidHint(format!(
                "{}: truncated entry header after {} entries",
                path.display(),
                entries.len()
            )));
        }

        let entry_segment = buf.get_u32();
        let offset = buf.get_u64();
        let value_size = buf.get_u32();
        let timestamp = buf.get_u64();
        let key_len = buf.get_u32() as usize;

        if entry_segment != segment_id {
            return Err(CaskError::InvalidHint(format!(
                "{}: entry for segment {} in hint of segment {}",
                path.display(),
                entry_segment,
                segment_id
            )));
        }

        if buf.remaining() < key_len {
            return Err(CaskError::InvalidHint(format!(
                "{}: truncated key after {} entries",
                path.display(),
                entries.len()
            )));
        }

        let key = buf[..key_len].to_vec();
        buf.advance(key_len);

        entries.push(HintEntry {
            key,
            segment_id: entry_segment,
            offset,
            value_size,
            timestamp,
        });
    }

    Ok(entries)
}
