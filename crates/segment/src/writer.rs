use record::{encode_into, encoded_len, FLAG_TOMBSTONE};
use tracing::info;

use crate::{Location, Segment, SegmentDirectory, SegmentError, SegmentState};

/// The single append path into a data directory.
///
/// Owns the current active [`Segment`]. Before each append it checks whether
/// the record would push the segment past `max_segment_size`; if so the
/// active segment is sealed and a fresh one created, and the record lands
/// whole at offset 0 of the new segment. An empty segment always accepts the
/// record, so a record larger than the limit gets a segment of its own.
///
/// `LogWriter` is not internally synchronized. Callers that share it wrap it
/// in a lock, which makes check, rotate and write one critical section.
#[derive(Debug)]
pub struct LogWriter {
    directory: SegmentDirectory,
    max_segment_size: u64,
    active: Segment,
    closed: bool,
    /// Reusable encode buffer.
    buf: Vec<u8>,
}

impl LogWriter {
    /// Creates a writer with a fresh active segment in `directory`.
    pub fn new(directory: SegmentDirectory, max_segment_size: u64) -> Result<Self, SegmentError> {
        let active = Segment::create_active(&directory)?;
        Ok(Self {
            directory,
            max_segment_size,
            active,
            closed: false,
            buf: Vec::with_capacity(256),
        })
    }

    /// The current active segment.
    #[must_use]
    pub fn active(&self) -> &Segment {
        &self.active
    }

    #[must_use]
    pub fn directory(&self) -> &SegmentDirectory {
        &self.directory
    }

    #[must_use]
    pub fn max_segment_size(&self) -> u64 {
        self.max_segment_size
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Appends one record, rotating first if it would not fit.
    ///
    /// The record is encoded before any rotation decision, so an
    /// [`record::RecordError::Encoding`] failure never seals a segment. If
    /// sealing the full segment fails, the record is not written and the error
    /// is returned; the next append retries the seal.
    pub fn append(
        &mut self,
        key: &[u8],
        value: &[u8],
        flags: u16,
        seq: u64,
    ) -> Result<Location, SegmentError> {
        if self.closed {
            return Err(SegmentError::WriterClosed);
        }

        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();
        let result = self.append_with(&mut buf, key, value, flags, seq);
        self.buf = buf;
        result
    }

    fn append_with(
        &mut self,
        buf: &mut Vec<u8>,
        key: &[u8],
        value: &[u8],
        flags: u16,
        seq: u64,
    ) -> Result<Location, SegmentError> {
        encode_into(
            buf,
            key,
            value,
            flags,
            seq,
            self.directory.options().max_key_len,
        )?;

        if self.needs_rotation(encoded_len(key.len(), value.len())) {
            self.rotate()?;
        }
        self.active
            .append_encoded(buf, key, value.len() as u32, flags, seq)
    }

    /// Appends a tombstone for `key`. The delete bit is set on top of `flags`.
    pub fn append_delete(
        &mut self,
        key: &[u8],
        flags: u16,
        seq: u64,
    ) -> Result<Location, SegmentError> {
        self.append(key, &[], flags | FLAG_TOMBSTONE, seq)
    }

    fn needs_rotation(&self, record_len: u64) -> bool {
        if self.active.state() != SegmentState::Active {
            return true;
        }
        let offset = u64::from(self.active.write_offset());
        offset > 0 && offset + record_len > self.max_segment_size
    }

    /// Seals the active segment (unless already sealed) and opens the next.
    fn rotate(&mut self) -> Result<(), SegmentError> {
        let old_id = self.active.id();
        if !self.active.is_sealed() {
            self.active.seal()?;
        }
        self.active = Segment::create_active(&self.directory)?;
        info!(
            sealed_segment = old_id,
            active_segment = self.active.id(),
            "rotated active segment"
        );
        Ok(())
    }

    /// Seals the active segment and closes the writer.
    ///
    /// The segment is sealed even when empty. Further appends return
    /// [`SegmentError::WriterClosed`]. Calling `shutdown` again is a no-op
    /// once the seal has succeeded.
    pub fn shutdown(&mut self) -> Result<(), SegmentError> {
        if self.closed {
            return Ok(());
        }
        if !self.active.is_sealed() {
            self.active.seal()?;
        }
        self.closed = true;
        Ok(())
    }
}
