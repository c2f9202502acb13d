//! # Record - on-disk framing for LogKV segments
//!
//! Stateless encode/decode of the two structures stored in a segment file:
//! the key/value **record** written on every put or delete, and the
//! **footer entry** written once per record when a segment is sealed.
//!
//! ## Segment Layout
//!
//! ```text
//! [Record]* [Footer Entry]* footer_start:u32 entry_count:u32 checksum:u32
//! ```
//!
//! ## Record
//!
//! ```text
//! ┌──────────┬─────────┬───────────┬───────────┬───────────┬─────┬───────┐
//! │ crc (4)  │ seq (8) │ flags (2) │ key_len(2)│ val_len(4)│ key │ value │
//! └──────────┴─────────┴───────────┴───────────┴───────────┴─────┴───────┘
//! ```
//!
//! The CRC-32 covers everything after itself: the four header fields, the key
//! and the value. A record is self-describing, so a segment can be walked
//! front to back from its headers alone when no footer is available.
//!
//! ## Footer Entry
//!
//! ```text
//! key_len:u16 key val_len:u32 offset:u32 seq:u64 flags:u16
//! ```
//!
//! All integers are little-endian.
//!
//! ## Example
//!
//! ```rust
//! use record::{decode_full, encode, FLAG_TOMBSTONE};
//! use std::io::Cursor;
//!
//! let bytes = encode(b"k", b"v", 0, 7, 1024).unwrap();
//! let rec = decode_full(&mut Cursor::new(bytes), 0).unwrap();
//! rec.verify().unwrap();
//! assert_eq!(rec.value, b"v");
//! assert_eq!(rec.flags & FLAG_TOMBSTONE, 0);
//! ```

mod codec;
mod footer;

pub use codec::{
    checksum, decode_body, decode_full, decode_header, encode, encode_into, encoded_len, Record,
    RecordHeader,
};
pub use footer::{
    encode_footer, footer_checksum, read_footer_entry, read_trailer, write_footer_entry,
    FooterEntry, FooterTrailer,
};

use std::io;
use thiserror::Error;

/// Bit 0 of the flags field marks a delete (tombstone) record.
pub const FLAG_TOMBSTONE: u16 = 1 << 0;

/// Fixed size of a record header: crc + seq + flags + key_len + value_len.
pub const RECORD_HEADER_LEN: usize = 4 + 8 + 2 + 2 + 4;

/// Fixed-width part of a footer entry (everything except the key bytes).
pub const FOOTER_ENTRY_FIXED_LEN: usize = 2 + 4 + 4 + 8 + 2;

/// Size of the footer trailer: footer_start + entry_count + checksum.
pub const FOOTER_TRAILER_LEN: usize = 4 + 4 + 4;

/// Default maximum key length in bytes.
///
/// Recovery decodes footer keys through a buffer of this size, so keys longer
/// than the configured maximum are refused at write time.
pub const DEFAULT_MAX_KEY_LEN: usize = 1024;

/// Returns `true` if the delete bit is set in `flags`.
#[must_use]
pub fn is_tombstone(flags: u16) -> bool {
    flags & FLAG_TOMBSTONE != 0
}

/// Errors produced while encoding or decoding records and footers.
#[derive(Debug, Error)]
pub enum RecordError {
    /// An underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The input cannot be represented on disk (oversized or empty key, etc.).
    /// Nothing has been written when this is returned.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// A short read or an impossible header value.
    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    /// The stored CRC-32 does not match the decoded bytes.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum stored on disk.
        expected: u32,
        /// Checksum recomputed from the decoded bytes.
        actual: u32,
    },
}

impl RecordError {
    /// Maps an `UnexpectedEof` from a fixed-size read into [`RecordError::CorruptRecord`].
    pub(crate) fn short_read(e: io::Error, what: &str) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            RecordError::CorruptRecord(format!("truncated {}", what))
        } else {
            RecordError::Io(e)
        }
    }
}
