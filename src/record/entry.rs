//! Record definitions
//!
//! In-memory forms of a log record and of its fixed header.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::CaskError;

use super::{CHECKSUM_SIZE, HEADER_SIZE};

/// Record type stored in the flag byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordFlag {
    /// Deletion marker, carries no value
    Tombstone = 0,

    /// Live value
    Normal = 1,
}

impl TryFrom<u8> for RecordFlag {
    type Error = CaskError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0 => Ok(RecordFlag::Tombstone),
            1 => Ok(RecordFlag::Normal),
            other => Err(CaskError::InvalidRecordFlag(other)),
        }
    }
}

/// The fixed-size prefix of a record, parsed without touching key/value bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub checksum: u32,
    pub timestamp: u64,
    pub key_len: u32,
    pub value_len: u32,
    /// Raw flag byte; validated only once the checksum has been verified
    pub flag: u8,
}

impl RecordHeader {
    /// Total encoded length of the record this header describes
    pub fn record_len(&self) -> usize {
        HEADER_SIZE
            .saturating_add(self.key_len as usize)
            .saturating_add(self.value_len as usize)
    }
}

/// A single decoded log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Checksum as stored on disk (0 for records not yet encoded)
    pub checksum: u32,

    /// Unix seconds at write time
    pub timestamp: u64,

    /// Normal value or tombstone
    pub flag: RecordFlag,

    pub key: Vec<u8>,

    /// Always empty for tombstones
    pub value: Vec<u8>,
}

impl LogRecord {
    /// Build a live record
    pub fn normal(key: Vec<u8>, value: Vec<u8>, timestamp: u64) -> Self {
        Self {
            checksum: 0,
            timestamp,
            flag: RecordFlag::Normal,
            key,
            value,
        }
    }

    /// Build a deletion marker
    pub fn tombstone(key: Vec<u8>, timestamp: u64) -> Self {
        Self {
            checksum: 0,
            timestamp,
            flag: RecordFlag::Tombstone,
            key,
            value: Vec::new(),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.flag == RecordFlag::Tombstone
    }

    /// Length of this record once encoded
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.key.len() + self.stored_value().len()
    }

    /// Encode to the on-disk layout, computing a fresh checksum.
    ///
    /// The timestamp is kept as-is, so compaction can copy a record forward
    /// without changing it. Size limits are not checked here; see
    /// [`RecordCodec::encode`](super::RecordCodec::encode).
    pub fn encode(&self) -> Bytes {
        let value = self.stored_value();
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.key.len() + value.len());

        buf.put_u32(0); // checksum placeholder
        buf.put_u64(self.timestamp);
        buf.put_u32(self.key.len() as u32);
        buf.put_u32(value.len() as u32);
        buf.put_u8(self.flag as u8);
        buf.put_slice(&self.key);
        buf.put_slice(value);

        let checksum = crc32fast::hash(&buf[CHECKSUM_SIZE..]);
        buf[..CHECKSUM_SIZE].copy_from_slice(&checksum.to_be_bytes());

        buf.freeze()
    }

    fn stored_value(&self) -> &[u8] {
        match self.flag {
            RecordFlag::Normal => &self.value,
            RecordFlag::Tombstone => &[],
        }
    }
}
