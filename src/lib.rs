//! # CaskKV
//!
//! An embedded, log-structured key-value store in the Bitcask family:
//! - Append-only segment files with CRC-protected records
//! - In-memory keydir holding the location of every live value
//! - One disk seek per read
//! - Online merge that compacts sealed segments and writes hint files
//! - Crash recovery with torn-tail truncation
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                             │
//! │        (Single Writer / Multi Reader, directory lock)       │
//! └───────┬─────────────────────┬─────────────────────┬─────────┘
//!         │                     │                     │
//!         ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │   KeyDir    │       │  Segments   │◄──────│    Merge    │
//!  │  (sharded)  │       │ (append/rd) │       │ (+ hints)   │
//!  └──────▲──────┘       └──────┬──────┘       └─────────────┘
//!         │                     │
//!         │              ┌──────▼──────┐
//!         └──────────────│  Recovery   │
//!                        │(hint / scan)│
//!                        └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use caskkv::{Config, Engine};
//!
//! let engine = Engine::open(Config::builder().data_dir("./data").build())?;
//! engine.put(b"user:1", b"alice")?;
//! assert_eq!(engine.get(b"user:1")?, Some(b"alice".to_vec()));
//! engine.close()?;
//! # Ok::<(), caskkv::CaskError>(())
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod record;
pub mod segment;
pub mod keydir;
pub mod merge;
pub mod recovery;
pub mod lock;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{CaskError, Result};
pub use config::{Config, IndexKind};
pub use engine::Engine;
pub use merge::MergeStats;
pub use recovery::RecoveryReport;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of CaskKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
