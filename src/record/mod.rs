//! Record Module
//!
//! The on-disk unit of every segment: one encoded log record.
//!
//! ## Responsibilities
//! - Fixed-width header with explicit lengths and a type flag
//! - CRC32 (IEEE) checksum over everything after the checksum field
//! - Strict decoding: truncation and corruption are distinct errors
//!
//! ## Record Format (big-endian)
//! ```text
//! ┌──────────────┬───────────────┬─────────────┬───────────────┬──────────┬─────┬───────┐
//! │ Checksum (4) │ Timestamp (8) │ KeyLen (4)  │ ValueLen (4)  │ Flag (1) │ Key │ Value │
//! └──────────────┴───────────────┴─────────────┴───────────────┴──────────┴─────┴───────┘
//!                 └──────────────────── covered by checksum ────────────────────────────┘
//! ```
//!
//! Flag `0` is a tombstone, `1` a normal value. A tombstone always carries
//! `ValueLen = 0`; an empty value is also `ValueLen = 0` and is told apart
//! only by the flag.

mod codec;
mod entry;

pub use codec::{decode, decode_header, encoded_len, now_secs, RecordCodec};
pub use entry::{LogRecord, RecordFlag, RecordHeader};

/// Size of the checksum field
pub const CHECKSUM_SIZE: usize = 4;

/// Fixed header size: Checksum (4) + Timestamp (8) + KeyLen (4) + ValueLen (4) + Flag (1)
pub const HEADER_SIZE: usize = 21;
