//! Record encode/decode.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use std::io::{Read, Seek, SeekFrom};

use crate::{is_tombstone, RecordError, RECORD_HEADER_LEN};

/// The fixed-width prefix of a record.
///
/// Decoding a header never allocates; the lengths tell the caller exactly how
/// many bytes follow, which is what makes a streaming scan possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// CRC-32 stored on disk.
    pub checksum: u32,
    /// Sequence number assigned at append time.
    pub seq: u64,
    /// Flag bits; see [`crate::FLAG_TOMBSTONE`].
    pub flags: u16,
    /// Length of the key in bytes.
    pub key_len: u16,
    /// Length of the value in bytes (zero for tombstones).
    pub value_len: u32,
}

impl RecordHeader {
    /// Returns `true` if this header describes a tombstone.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        is_tombstone(self.flags)
    }

    /// Total encoded size of the record this header belongs to.
    #[must_use]
    pub fn record_len(&self) -> u64 {
        encoded_len(self.key_len as usize, self.value_len as usize)
    }

    /// Rejects header values that no valid writer produces.
    fn validate(&self) -> Result<(), RecordError> {
        if self.key_len == 0 {
            return Err(RecordError::CorruptRecord("key_len is zero".into()));
        }
        if self.value_len == 0 && !self.is_tombstone() {
            return Err(RecordError::CorruptRecord(
                "value_len is zero on a non-tombstone record".into(),
            ));
        }
        if self.value_len != 0 && self.is_tombstone() {
            return Err(RecordError::CorruptRecord(format!(
                "tombstone carries a {}-byte value",
                self.value_len
            )));
        }
        Ok(())
    }
}

/// A fully decoded record. Key and value are owned buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// CRC-32 stored on disk.
    pub checksum: u32,
    /// Sequence number assigned at append time.
    pub seq: u64,
    /// Flag bits.
    pub flags: u16,
    /// Key bytes.
    pub key: Vec<u8>,
    /// Value bytes (empty for tombstones).
    pub value: Vec<u8>,
}

impl Record {
    /// Returns `true` if this record is a tombstone.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        is_tombstone(self.flags)
    }

    /// Total encoded size of this record.
    #[must_use]
    pub fn encoded_len(&self) -> u64 {
        encoded_len(self.key.len(), self.value.len())
    }

    /// Recomputes the CRC-32 and compares it with the stored one.
    ///
    /// Decoding does not verify; callers do it once they hold the record.
    pub fn verify(&self) -> Result<(), RecordError> {
        let actual = checksum(self.seq, self.flags, &self.key, &self.value);
        if actual != self.checksum {
            return Err(RecordError::ChecksumMismatch {
                expected: self.checksum,
                actual,
            });
        }
        Ok(())
    }
}

/// Encoded size of a record with the given key and value lengths.
#[must_use]
pub fn encoded_len(key_len: usize, value_len: usize) -> u64 {
    RECORD_HEADER_LEN as u64 + key_len as u64 + value_len as u64
}

/// CRC-32 over the header fields (after the checksum itself), key and value.
#[must_use]
pub fn checksum(seq: u64, flags: u16, key: &[u8], value: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(&seq.to_le_bytes());
    hasher.update(&flags.to_le_bytes());
    hasher.update(&(key.len() as u16).to_le_bytes());
    hasher.update(&(value.len() as u32).to_le_bytes());
    hasher.update(key);
    hasher.update(value);
    hasher.finalize()
}

/// Encodes one record into a fresh buffer.
///
/// See [`encode_into`] for the validation rules.
pub fn encode(
    key: &[u8],
    value: &[u8],
    flags: u16,
    seq: u64,
    max_key_len: usize,
) -> Result<Vec<u8>, RecordError> {
    let mut buf = Vec::with_capacity(encoded_len(key.len(), value.len()) as usize);
    encode_into(&mut buf, key, value, flags, seq, max_key_len)?;
    Ok(buf)
}

/// Appends one encoded record to `buf`.
///
/// # Errors
///
/// Returns [`RecordError::Encoding`] without touching `buf` if:
/// - the key is empty or longer than `max_key_len` (or `u16::MAX`),
/// - the value does not fit in a `u32`,
/// - a non-tombstone carries an empty value, or a tombstone a non-empty one.
pub fn encode_into(
    buf: &mut Vec<u8>,
    key: &[u8],
    value: &[u8],
    flags: u16,
    seq: u64,
    max_key_len: usize,
) -> Result<(), RecordError> {
    if key.is_empty() {
        return Err(RecordError::Encoding("key must not be empty".into()));
    }
    let limit = max_key_len.min(u16::MAX as usize);
    if key.len() > limit {
        return Err(RecordError::Encoding(format!(
            "key too large: {} bytes (max {})",
            key.len(),
            limit
        )));
    }
    if value.len() > u32::MAX as usize {
        return Err(RecordError::Encoding(format!(
            "value too large: {} bytes (max {})",
            value.len(),
            u32::MAX
        )));
    }
    if is_tombstone(flags) {
        if !value.is_empty() {
            return Err(RecordError::Encoding(
                "tombstone records carry no value".into(),
            ));
        }
    } else if value.is_empty() {
        return Err(RecordError::Encoding("value must not be empty".into()));
    }

    let crc = checksum(seq, flags, key, value);
    buf.reserve(encoded_len(key.len(), value.len()) as usize);
    // Writes into a Vec cannot fail.
    buf.write_u32::<LittleEndian>(crc)?;
    buf.write_u64::<LittleEndian>(seq)?;
    buf.write_u16::<LittleEndian>(flags)?;
    buf.write_u16::<LittleEndian>(key.len() as u16)?;
    buf.write_u32::<LittleEndian>(value.len() as u32)?;
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    Ok(())
}

/// Reads the fixed-width header at the current position of `r`.
///
/// A clean end-of-stream before the first byte is reported as
/// [`RecordError::CorruptRecord`] like any other short read; streaming callers that
/// need to tell the two apart check their position against the data end.
pub fn decode_header<R: Read>(r: &mut R) -> Result<RecordHeader, RecordError> {
    let mut raw = [0u8; RECORD_HEADER_LEN];
    r.read_exact(&mut raw)
        .map_err(|e| RecordError::short_read(e, "record header"))?;

    let mut h = &raw[..];
    let header = RecordHeader {
        checksum: h.read_u32::<LittleEndian>()?,
        seq: h.read_u64::<LittleEndian>()?,
        flags: h.read_u16::<LittleEndian>()?,
        key_len: h.read_u16::<LittleEndian>()?,
        value_len: h.read_u32::<LittleEndian>()?,
    };
    header.validate()?;
    Ok(header)
}

/// Reads the key and value that follow an already-decoded `header`.
pub fn decode_body<R: Read>(r: &mut R, header: RecordHeader) -> Result<Record, RecordError> {
    let mut key = vec![0u8; header.key_len as usize];
    r.read_exact(&mut key)
        .map_err(|e| RecordError::short_read(e, "record key"))?;

    let mut value = vec![0u8; header.value_len as usize];
    r.read_exact(&mut value)
        .map_err(|e| RecordError::short_read(e, "record value"))?;

    Ok(Record {
        checksum: header.checksum,
        seq: header.seq,
        flags: header.flags,
        key,
        value,
    })
}

/// Seeks to `offset` and decodes the complete record found there.
///
/// The checksum is **not** verified; call [`Record::verify`].
pub fn decode_full<R: Read + Seek>(r: &mut R, offset: u64) -> Result<Record, RecordError> {
    r.seek(SeekFrom::Start(offset))?;
    let header = decode_header(r)?;
    decode_body(r, header)
}
