//! Footer entry and trailer encode/decode.
//!
//! A sealed segment ends with one footer entry per record followed by a
//! fixed 12-byte trailer:
//!
//! ```text
//! [entry]* footer_start(u32) | entry_count(u32) | crc32(u32)
//! ```
//!
//! The trailer CRC covers the entry bytes, `footer_start` and `entry_count`,
//! so a torn or overwritten footer is detected before any entry is trusted.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::{is_tombstone, RecordError, FOOTER_ENTRY_FIXED_LEN, FOOTER_TRAILER_LEN};

/// In-memory form of one footer entry: everything about a record except its
/// value bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FooterEntry {
    pub key: Vec<u8>,
    pub value_len: u32,
    /// Byte offset of the record inside its segment.
    pub offset: u32,
    pub seq: u64,
    pub flags: u16,
}

impl FooterEntry {
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        is_tombstone(self.flags)
    }

    /// Encoded size of this entry inside the footer region.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        FOOTER_ENTRY_FIXED_LEN + self.key.len()
    }
}

/// Writes one footer entry to `w`.
pub fn write_footer_entry<W: Write>(w: &mut W, entry: &FooterEntry) -> Result<(), RecordError> {
    if entry.key.is_empty() || entry.key.len() > u16::MAX as usize {
        return Err(RecordError::Encoding(format!(
            "footer entry key length {} out of range",
            entry.key.len()
        )));
    }
    w.write_u16::<LittleEndian>(entry.key.len() as u16)?;
    w.write_all(&entry.key)?;
    w.write_u32::<LittleEndian>(entry.value_len)?;
    w.write_u32::<LittleEndian>(entry.offset)?;
    w.write_u64::<LittleEndian>(entry.seq)?;
    w.write_u16::<LittleEndian>(entry.flags)?;
    Ok(())
}

/// Reads one footer entry from `r`.
pub fn read_footer_entry<R: Read>(r: &mut R) -> Result<FooterEntry, RecordError> {
    let key_len = r
        .read_u16::<LittleEndian>()
        .map_err(|e| RecordError::short_read(e, "footer entry key length"))?;
    if key_len == 0 {
        return Err(RecordError::CorruptRecord(
            "footer entry with empty key".into(),
        ));
    }
    let mut key = vec![0u8; key_len as usize];
    r.read_exact(&mut key)
        .map_err(|e| RecordError::short_read(e, "footer entry key"))?;

    let mut rest = [0u8; FOOTER_ENTRY_FIXED_LEN - 2];
    r.read_exact(&mut rest)
        .map_err(|e| RecordError::short_read(e, "footer entry"))?;
    let mut rest = &rest[..];
    let value_len = rest.read_u32::<LittleEndian>()?;
    let offset = rest.read_u32::<LittleEndian>()?;
    let seq = rest.read_u64::<LittleEndian>()?;
    let flags = rest.read_u16::<LittleEndian>()?;

    Ok(FooterEntry {
        key,
        value_len,
        offset,
        seq,
        flags,
    })
}

/// The fixed-size trailer at the very end of a sealed segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FooterTrailer {
    /// Offset of the first footer entry (equals the end of the record data).
    pub footer_start: u32,
    pub entry_count: u32,
    pub checksum: u32,
}

impl FooterTrailer {
    /// Recomputes the CRC over `region` (the raw entry bytes) and compares it
    /// with the stored one.
    pub fn verify(&self, region: &[u8]) -> Result<(), RecordError> {
        let actual = footer_checksum(region, self.footer_start, self.entry_count);
        if actual != self.checksum {
            return Err(RecordError::ChecksumMismatch {
                expected: self.checksum,
                actual,
            });
        }
        Ok(())
    }
}

/// CRC-32 over the footer entry bytes followed by `footer_start` and
/// `entry_count`.
#[must_use]
pub fn footer_checksum(region: &[u8], footer_start: u32, entry_count: u32) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(region);
    hasher.update(&footer_start.to_le_bytes());
    hasher.update(&entry_count.to_le_bytes());
    hasher.finalize()
}

/// Serializes `entries` plus the trailer into one buffer, ready to be written
/// at `footer_start`.
pub fn encode_footer(entries: &[FooterEntry], footer_start: u32) -> Result<Vec<u8>, RecordError> {
    let entry_count = u32::try_from(entries.len()).map_err(|_| {
        RecordError::Encoding(format!("too many footer entries: {}", entries.len()))
    })?;

    let region_len: usize = entries.iter().map(FooterEntry::encoded_len).sum();
    let mut buf = Vec::with_capacity(region_len + FOOTER_TRAILER_LEN);
    for entry in entries {
        write_footer_entry(&mut buf, entry)?;
    }

    let crc = footer_checksum(&buf, footer_start, entry_count);
    buf.write_u32::<LittleEndian>(footer_start)?;
    buf.write_u32::<LittleEndian>(entry_count)?;
    buf.write_u32::<LittleEndian>(crc)?;
    Ok(buf)
}

/// Reads the trailer from the last [`FOOTER_TRAILER_LEN`] bytes of `r`.
///
/// Only the size of the file is checked here; callers validate
/// `footer_start` and `entry_count` against the file length.
pub fn read_trailer<R: Read + Seek>(r: &mut R) -> Result<FooterTrailer, RecordError> {
    let filesize = r.seek(SeekFrom::End(0))?;
    if filesize < FOOTER_TRAILER_LEN as u64 {
        return Err(RecordError::CorruptRecord(format!(
            "file too small for footer trailer ({} bytes)",
            filesize
        )));
    }

    r.seek(SeekFrom::End(-(FOOTER_TRAILER_LEN as i64)))?;
    let mut raw = [0u8; FOOTER_TRAILER_LEN];
    r.read_exact(&mut raw)
        .map_err(|e| RecordError::short_read(e, "footer trailer"))?;
    let mut t = &raw[..];
    Ok(FooterTrailer {
        footer_start: t.read_u32::<LittleEndian>()?,
        entry_count: t.read_u32::<LittleEndian>()?,
        checksum: t.read_u32::<LittleEndian>()?,
    })
}
