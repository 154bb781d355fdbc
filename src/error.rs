//! Error types for CaskKV
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using CaskError
pub type Result<T> = std::result::Result<T, CaskError>;

/// Unified error type for CaskKV operations
#[derive(Debug, Error)]
pub enum CaskError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Record Codec Errors
    // -------------------------------------------------------------------------
    #[error("Truncated record header: expected {expected} bytes, got {actual}")]
    TruncatedHeader { expected: usize, actual: usize },

    #[error("Truncated record body: expected {expected} bytes, got {actual}")]
    TruncatedBody { expected: usize, actual: usize },

    #[error("Checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("Invalid record flag: 0x{0:02x}")]
    InvalidRecordFlag(u8),

    #[error("Key too large: {size} bytes (max {max})")]
    KeyTooLarge { size: usize, max: usize },

    #[error("Value too large: {size} bytes (max {max})")]
    ValueTooLarge { size: usize, max: usize },

    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    #[error("Write rejected: store or segment is read-only")]
    ReadOnlyViolation,

    #[error("Segment {0} not found (index and segments out of sync)")]
    SegmentNotFound(u32),

    #[error("Invalid hint file: {0}")]
    InvalidHint(String),

    #[error("Storage error: {0}")]
    Storage(String),

    // -------------------------------------------------------------------------
    // Concurrency Errors
    // -------------------------------------------------------------------------
    #[error("Directory lock is held by another process")]
    LockUnavailable,

    #[error("Timed out waiting for directory lock after {0:?}")]
    LockTimeout(std::time::Duration),

    #[error("A merge is already in progress")]
    MergeInProgress,

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------------
    #[error("Close failed with {} error(s): {}", .0.len(), join_errors(.0))]
    Close(Vec<CaskError>),
}

impl CaskError {
    /// True for errors that mean a record's bytes cannot be trusted
    /// (torn write, bit rot, or a reader running past the end of a file).
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            CaskError::TruncatedHeader { .. }
                | CaskError::TruncatedBody { .. }
                | CaskError::ChecksumMismatch { .. }
                | CaskError::InvalidRecordFlag(_)
        )
    }
}

fn join_errors(errors: &[CaskError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
