//! Segment file
//!
//! One append-only file of encoded records.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{CaskError, Result};
use crate::record::{self, LogRecord, HEADER_SIZE};

use super::segment_path;

/// A single segment file
///
/// ## Concurrency:
/// - `append`: serialized by `append_lock`; bytes are written at `size`
///   positionally and `size` is published only after they are, so any offset
///   below `size` is fully backed and nothing past it is trusted
/// - `read_at`: positional, lock-free, safe alongside appends
pub struct Segment {
    id: u32,
    path: PathBuf,
    file: File,
    /// Length visible to readers, advanced only after a completed append
    size: AtomicU64,
    /// Set when a failed append left bytes past `size` that could not be cut
    torn_tail: AtomicBool,
    read_only: bool,
    append_lock: Mutex<()>,
}

impl Segment {
    /// Open segment `id` in `dir`, creating it when writable
    pub fn open(dir: &Path, id: u32, read_only: bool) -> Result<Self> {
        Self::open_path(&segment_path(dir, id), id, read_only)
    }

    /// Open a segment stored under an explicit path
    pub fn open_path(path: &Path, id: u32, read_only: bool) -> Result<Self> {
        let file = if read_only {
            File::open(path)?
        } else {
            OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(path)?
        };
        let size = file.metadata()?.len();

        Ok(Self {
            id,
            path: path.to_path_buf(),
            file,
            size: AtomicU64::new(size),
            torn_tail: AtomicBool::new(false),
            read_only,
            append_lock: Mutex::new(()),
        })
    }

    /// Create an empty writable segment at `path`, replacing any stale file
    pub fn create_at(path: &Path, id: u32) -> Result<Self> {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Self::open_path(path, id, false)
    }

    /// Append encoded bytes, returning the offset they start at
    pub fn append(&self, bytes: &[u8]) -> Result<u64> {
        if self.read_only {
            return Err(CaskError::ReadOnlyViolation);
        }

        let _guard = self.append_lock.lock();
        let offset = self.size.load(Ordering::Acquire);

        if self.torn_tail.load(Ordering::Acquire) {
            self.file.set_len(offset)?;
            self.torn_tail.store(false, Ordering::Release);
        }

        if let Err(e) = write_all_at(&self.file, bytes, offset) {
            // Drop whatever part of the record made it out
            if let Err(trim) = self.file.set_len(offset) {
                tracing::warn!(
                    "Segment {}: could not cut failed append back to {}: {}",
                    self.id,
                    offset,
                    trim
                );
                self.torn_tail.store(true, Ordering::Release);
            }
            return Err(e.into());
        }

        self.size
            .store(offset + bytes.len() as u64, Ordering::Release);
        Ok(offset)
    }

    /// Read and decode the record starting at `offset`
    pub fn read_at(&self, offset: u64) -> Result<LogRecord> {
        let available = self.size().saturating_sub(offset);

        if available < HEADER_SIZE as u64 {
            return Err(CaskError::TruncatedHeader {
                expected: HEADER_SIZE,
                actual: available as usize,
            });
        }

        let mut header = [0u8; HEADER_SIZE];
        read_exact_at(&self.file, &mut header, offset)?;
        let total_len = record::decode_header(&header)?.record_len();

        if total_len as u64 > available {
            return Err(CaskError::TruncatedBody {
                expected: total_len,
                actual: available as usize,
            });
        }

        let mut buf = vec![0u8; total_len];
        buf[..HEADER_SIZE].copy_from_slice(&header);
        read_exact_at(&self.file, &mut buf[HEADER_SIZE..], offset + HEADER_SIZE as u64)?;

        record::decode(&buf)
    }

    /// Sequential scan over every record currently in the segment
    pub fn iter(&self) -> Result<SegmentIter> {
        SegmentIter::new(&self.path, self.size())
    }

    /// Flush to stable storage (no-op for read-only segments)
    pub fn sync(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let _guard = self.append_lock.lock();
        self.file.sync_all()?;
        Ok(())
    }

    /// Cut the file back to `len` bytes, discarding a torn tail
    pub fn truncate(&self, len: u64) -> Result<()> {
        if self.read_only {
            return Err(CaskError::ReadOnlyViolation);
        }
        let _guard = self.append_lock.lock();
        self.file.set_len(len)?;
        self.file.sync_all()?;
        self.size.store(len, Ordering::Release);
        self.torn_tail.store(false, Ordering::Release);
        Ok(())
    }

    /// Sync and release the file handle
    pub fn close(self) -> Result<()> {
        self.sync()
    }

    /// Remove the file from disk. Only retired (read-only) segments qualify.
    pub fn destroy(&self) -> Result<()> {
        if !self.read_only {
            return Err(CaskError::Storage(format!(
                "cannot destroy writable segment {}",
                self.id
            )));
        }
        fs::remove_file(&self.path)?;
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current published length in bytes
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("size", &self.size())
            .field("read_only", &self.read_only)
            .finish()
    }
}

// =============================================================================
// Sequential Iterator
// =============================================================================

/// Iterator over `(offset, record)` pairs in file order.
///
/// Stops after the first error; `position()` is then the end of the last
/// record that decoded cleanly.
pub struct SegmentIter {
    reader: BufReader<File>,
    /// Start of the next unread record
    position: u64,
    /// Scan limit (segment size when the iterator was created)
    end: u64,
    failed: bool,
}

impl SegmentIter {
    fn new(path: &Path, end: u64) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            position: 0,
            end,
            failed: false,
        })
    }

    /// Offset just past the last record returned successfully
    pub fn position(&self) -> u64 {
        self.position
    }

    fn read_next(&mut self) -> Result<(LogRecord, usize)> {
        let remaining = self.end - self.position;

        if remaining < HEADER_SIZE as u64 {
            return Err(CaskError::TruncatedHeader {
                expected: HEADER_SIZE,
                actual: remaining as usize,
            });
        }

        let mut buf = vec![0u8; HEADER_SIZE];
        self.reader.read_exact(&mut buf)?;
        let total_len = record::decode_header(&buf)?.record_len();

        if total_len as u64 > remaining {
            return Err(CaskError::TruncatedBody {
                expected: total_len,
                actual: remaining as usize,
            });
        }

        buf.resize(total_len, 0);
        self.reader.read_exact(&mut buf[HEADER_SIZE..])?;

        Ok((record::decode(&buf)?, total_len))
    }
}

impl Iterator for SegmentIter {
    type Item = Result<(u64, LogRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.position >= self.end {
            return None;
        }

        match self.read_next() {
            Ok((record, len)) => {
                let offset = self.position;
                self.position += len as u64;
                Some(Ok((offset, record)))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

// =============================================================================
// Positional I/O
// =============================================================================

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ))
            }
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ))
            }
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
