/// Read path: `get()` and `exists()` by location.
///
/// A location in the active segment is served under the writer lock. Sealed
/// segments are opened on first use and kept in a shared cache; a compaction
/// that retires a segment evicts it, while readers already holding the
/// handle finish against the unlinked file.
use anyhow::{Context, Result};
use segment::{Location, Segment, SegmentError, SegmentId};
use std::sync::Arc;
use tracing::debug;

use crate::{Engine, EngineInner};

/// What a location holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueState {
    Live(Vec<u8>),
    /// The record is a tombstone.
    Deleted,
}

impl ValueState {
    /// The value, or `None` for a tombstone.
    pub fn into_value(self) -> Option<Vec<u8>> {
        match self {
            ValueState::Live(v) => Some(v),
            ValueState::Deleted => None,
        }
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        matches!(self, ValueState::Deleted)
    }
}

impl Engine {
    /// Reads the record at `location` and verifies its checksum.
    ///
    /// # Errors
    ///
    /// The wrapped [`SegmentError`] is
    /// - `SegmentNotFound` when the segment is gone, typically retired by
    ///   compaction; re-resolve the key through the index and retry.
    /// - `Record(ChecksumMismatch)` when the stored bytes are corrupt.
    /// - `Record(CorruptRecord)` when the offset is past the end of the
    ///   segment or does not start a record.
    pub fn get(&self, location: Location) -> Result<ValueState> {
        let record = self
            .inner
            .with_segment(location.segment_id, |seg| seg.load(location.offset))
            .with_context(|| format!("failed to read record at {location}"))?;

        Ok(if record.is_tombstone() {
            ValueState::Deleted
        } else {
            ValueState::Live(record.value)
        })
    }

    /// Whether `location` holds a live (non-tombstone) record.
    ///
    /// Only the record header is read; the value is neither loaded nor
    /// checksummed.
    pub fn exists(&self, location: Location) -> Result<bool> {
        let header = self
            .inner
            .with_segment(location.segment_id, |seg| seg.load_header(location.offset))
            .with_context(|| format!("failed to read record header at {location}"))?;
        Ok(!header.is_tombstone())
    }
}

impl EngineInner {
    /// Runs `f` against segment `id`, wherever it currently lives.
    pub(crate) fn with_segment<T, F>(&self, id: SegmentId, f: F) -> Result<T, SegmentError>
    where
        F: Fn(&Segment) -> Result<T, SegmentError>,
    {
        if let Some(seg) = self.cached(id) {
            return f(&seg);
        }

        {
            let write = self.write.lock();
            let active = write.writer.active();
            if active.id() == id && !active.is_sealed() {
                return f(active);
            }
        }

        let seg = self.open_sealed(id)?;
        f(&seg)
    }

    fn cached(&self, id: SegmentId) -> Option<Arc<Segment>> {
        self.sealed.read().get(&id).cloned()
    }

    /// Opens sealed segment `id` and caches it. Two racing openers both
    /// succeed; the first insert wins.
    ///
    /// A segment whose file was unlinked after the open serves this read but
    /// is not cached, so a retired file is never pinned.
    fn open_sealed(&self, id: SegmentId) -> Result<Arc<Segment>, SegmentError> {
        let seg = Arc::new(Segment::open_sealed(id, &self.directory)?);
        debug!(segment_id = id, path = %seg.path().display(), "opened sealed segment");

        let mut cache = self.sealed.write();
        if let Some(cached) = cache.get(&id) {
            return Ok(Arc::clone(cached));
        }
        if !seg.path().exists() {
            debug!(segment_id = id, "segment retired while opening; not caching");
            return Ok(seg);
        }
        cache.insert(id, Arc::clone(&seg));
        Ok(seg)
    }

    /// Drops segment `id` from the read cache and unlinks its sealed file.
    ///
    /// Both happen under the cache lock, which `open_sealed` also takes to
    /// insert, so a concurrent opener sees the file gone.
    pub(crate) fn retire_file(&self, id: SegmentId) -> std::io::Result<()> {
        let mut cache = self.sealed.write();
        cache.remove(&id);
        std::fs::remove_file(self.directory.sealed_path(id))
    }
}
