//! Record codec
//!
//! Size-checked encoding and strict decoding of log records.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, Bytes};

use crate::config::{DEFAULT_MAX_KEY_SIZE, DEFAULT_MAX_VALUE_SIZE};
use crate::error::{CaskError, Result};

use super::{LogRecord, RecordFlag, RecordHeader, CHECKSUM_SIZE, HEADER_SIZE};

/// Encoder holding the configured key/value limits
#[derive(Debug, Clone, Copy)]
pub struct RecordCodec {
    max_key_size: usize,
    max_value_size: usize,
}

impl Default for RecordCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_KEY_SIZE, DEFAULT_MAX_VALUE_SIZE)
    }
}

impl RecordCodec {
    pub fn new(max_key_size: usize, max_value_size: usize) -> Self {
        Self {
            max_key_size,
            max_value_size,
        }
    }

    pub fn max_key_size(&self) -> usize {
        self.max_key_size
    }

    pub fn max_value_size(&self) -> usize {
        self.max_value_size
    }

    /// Encode a put or a delete, stamped with the current time.
    ///
    /// For tombstones the supplied value is discarded and never written.
    pub fn encode(&self, key: &[u8], value: &[u8], is_tombstone: bool) -> Result<Bytes> {
        self.encode_at(key, value, is_tombstone, now_secs())
    }

    /// Same as [`encode`](Self::encode) with an explicit timestamp
    pub fn encode_at(
        &self,
        key: &[u8],
        value: &[u8],
        is_tombstone: bool,
        timestamp: u64,
    ) -> Result<Bytes> {
        self.check_key(key)?;

        let record = if is_tombstone {
            LogRecord::tombstone(key.to_vec(), timestamp)
        } else {
            self.check_value(value)?;
            LogRecord::normal(key.to_vec(), value.to_vec(), timestamp)
        };

        Ok(record.encode())
    }

    pub fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() > self.max_key_size {
            return Err(CaskError::KeyTooLarge {
                size: key.len(),
                max: self.max_key_size,
            });
        }
        Ok(())
    }

    pub fn check_value(&self, value: &[u8]) -> Result<()> {
        if value.len() > self.max_value_size {
            return Err(CaskError::ValueTooLarge {
                size: value.len(),
                max: self.max_value_size,
            });
        }
        Ok(())
    }
}

/// Encoded length of a record with the given key and value sizes
pub fn encoded_len(key_len: usize, value_len: usize) -> usize {
    HEADER_SIZE + key_len + value_len
}

/// Parse only the fixed header
pub fn decode_header(bytes: &[u8]) -> Result<RecordHeader> {
    if bytes.len() < HEADER_SIZE {
        return Err(CaskError::TruncatedHeader {
            expected: HEADER_SIZE,
            actual: bytes.len(),
        });
    }

    let mut buf = &bytes[..HEADER_SIZE];
    Ok(RecordHeader {
        checksum: buf.get_u32(),
        timestamp: buf.get_u64(),
        key_len: buf.get_u32(),
        value_len: buf.get_u32(),
        flag: buf.get_u8(),
    })
}

/// Decode one record from the start of `bytes`.
///
/// Trailing bytes beyond the record are ignored.
pub fn decode(bytes: &[u8]) -> Result<LogRecord> {
    let header = decode_header(bytes)?;

    let total_len = header.record_len();
    if bytes.len() < total_len {
        return Err(CaskError::TruncatedBody {
            expected: total_len,
            actual: bytes.len(),
        });
    }

    let computed = crc32fast::hash(&bytes[CHECKSUM_SIZE..total_len]);
    if computed != header.checksum {
        return Err(CaskError::ChecksumMismatch {
            stored: header.checksum,
            computed,
        });
    }

    let flag = RecordFlag::try_from(header.flag)?;

    let key_end = HEADER_SIZE + header.key_len as usize;
    let key = bytes[HEADER_SIZE..key_end].to_vec();
    let value = bytes[key_end..total_len].to_vec();

    Ok(LogRecord {
        checksum: header.checksum,
        timestamp: header.timestamp,
        flag,
        key,
        value,
    })
}

/// Current unix time in seconds
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
