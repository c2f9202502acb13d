//! # Segment - append-only log files
//!
//! A segment is one file in the data directory holding a run of records
//! written by [`record::encode`]. It moves through three phases:
//!
//! ```text
//!   log_<id>_active.kv            log_<id>.kv                  (unlinked)
//! ┌────────────────────┐  seal  ┌────────────────────┐  retire ┌──────────┐
//! │ ACTIVE  (writable) │ ─────> │ SEALED (read-only) │ ──────> │ RECLAIMED│
//! │ records only       │        │ records + footer   │         │          │
//! └────────────────────┘        └────────────────────┘         └──────────┘
//! ```
//!
//! Sealing appends the footer (one entry per record plus a checksummed
//! trailer) and atomically renames the file. On startup the footer lets the
//! caller rebuild its key index without reading any value bytes.
//!
//! ## Module Responsibilities
//!
//! | Module        | Purpose                                                   |
//! |---------------|-----------------------------------------------------------|
//! | [`directory`] | file naming, discovery scan, shared id allocator          |
//! | [`segment`]   | one file: append, point reads, seal, footer load, repair  |
//! | [`writer`]    | [`LogWriter`]: the single append path with size rotation  |
//!
//! ## Renaming While Open
//!
//! Readers may hold a sealed or active segment open while it is renamed or
//! unlinked; on POSIX `rename(2)` and `unlink(2)` leave open descriptors
//! valid. New openers resolve the path again through [`Segment::open_sealed`].

mod directory;
mod segment;
mod writer;

pub use directory::{
    parse_segment_name, Discovery, SegmentDirectory, SegmentIdAllocator, SegmentOptions,
};
pub use segment::{ActiveRepair, Segment, SegmentState};
pub use writer::LogWriter;

use record::RecordError;
use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Numeric segment identifier. Monotonic, never reused.
pub type SegmentId = u64;

/// Points at one record: the segment holding it and the byte offset of its
/// header. The record's length is read from the header, never stored here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Location {
    pub segment_id: SegmentId,
    pub offset: u32,
}

impl Location {
    #[must_use]
    pub fn new(segment_id: SegmentId, offset: u32) -> Self {
        Self { segment_id, offset }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.segment_id, self.offset)
    }
}

/// Errors that can occur during segment operations.
#[derive(Debug, Error)]
pub enum SegmentError {
    /// Encoding or decoding of a record failed (includes checksum mismatch).
    #[error(transparent)]
    Record(#[from] RecordError),

    /// Neither the sealed nor the active file exists for this id.
    #[error("segment {id} not found")]
    SegmentNotFound { id: SegmentId },

    /// The footer of a sealed segment is missing, torn or inconsistent.
    #[error("corrupt footer in segment {id}: {reason}")]
    CorruptFooter { id: SegmentId, reason: String },

    #[error("segment {id} is already sealed")]
    AlreadySealed { id: SegmentId },

    #[error("footer of segment {id} is already loaded")]
    FooterAlreadyLoaded { id: SegmentId },

    /// Append to a segment that is sealed or waiting for its rename.
    #[error("segment {id} is not writable")]
    NotWritable { id: SegmentId },

    /// The record would push offsets past what a footer entry can address.
    #[error("segment {id} is full")]
    SegmentFull { id: SegmentId },

    /// The [`LogWriter`] has been shut down.
    #[error("log writer is closed")]
    WriterClosed,

    #[error("failed to open {}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The footer is on disk but the file kept its active name.
    #[error("failed to rename {} to {}", from.display(), to.display())]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Fsyncs the directory containing `path` so a rename or create is durable.
///
/// Best-effort: on platforms where directories cannot be opened this is a
/// no-op.
pub(crate) fn sync_parent_dir(path: &std::path::Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = std::fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

#[cfg(test)]
mod tests;
