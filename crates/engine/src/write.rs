/// Write path: `put()`, `delete()` and their index-updating variants.
///
/// Every mutation takes the writer lock, so sequence numbers are assigned in
/// append order. A sequence number is only consumed by a write that reached
/// the log.
use anyhow::{anyhow, Context, Result};
use keydir::KeyDir;
use record::FLAG_TOMBSTONE;
use segment::{Location, SegmentError};

use crate::{Engine, WriteState};

impl Engine {
    /// Appends `key → value` and returns where the record landed.
    ///
    /// # Errors
    ///
    /// Fails without writing anything if the key is empty or longer than
    /// `max_key_len`, or the value is empty. I/O failures leave the segment
    /// at its previous length. The error wraps a [`SegmentError`] that can be
    /// recovered with `downcast_ref`.
    ///
    /// [`SegmentError`]: segment::SegmentError
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<Location> {
        let mut state = self.inner.write.lock();
        let (location, _) = self.append_locked(&mut state, key, value, 0)?;
        Ok(location)
    }

    /// Appends a tombstone for `key` and returns its location.
    ///
    /// Nothing checks that the key exists; deleting an unknown key still
    /// writes a tombstone.
    pub fn delete(&self, key: &[u8]) -> Result<Location> {
        let mut state = self.inner.write.lock();
        let (location, _) = self.append_locked(&mut state, key, &[], FLAG_TOMBSTONE)?;
        Ok(location)
    }

    /// Like [`put`](Self::put), and records the write in `index` before the
    /// writer lock is released, so the index sees writes in sequence order.
    pub fn put_indexed(&self, index: &KeyDir, key: &[u8], value: &[u8]) -> Result<Location> {
        let mut state = self.inner.write.lock();
        let (location, seq) = self.append_locked(&mut state, key, value, 0)?;
        index.apply(key.to_vec(), location, seq, 0);
        Ok(location)
    }

    /// Like [`delete`](Self::delete), recording the tombstone in `index`.
    pub fn delete_indexed(&self, index: &KeyDir, key: &[u8]) -> Result<Location> {
        let mut state = self.inner.write.lock();
        let (location, seq) = self.append_locked(&mut state, key, &[], FLAG_TOMBSTONE)?;
        index.apply(key.to_vec(), location, seq, FLAG_TOMBSTONE);
        Ok(location)
    }

    fn append_locked(
        &self,
        state: &mut WriteState,
        key: &[u8],
        value: &[u8],
        flags: u16,
    ) -> Result<(Location, u64)> {
        // checked under the writer lock: a failed seal leaves the writer open
        if self.is_closed() {
            return Err(SegmentError::WriterClosed.into());
        }
        let seq = state
            .seq
            .checked_add(1)
            .ok_or_else(|| anyhow!("sequence number overflow (u64::MAX reached)"))?;

        let location = if flags & FLAG_TOMBSTONE != 0 {
            state.writer.append_delete(key, flags, seq)
        } else {
            state.writer.append(key, value, flags, seq)
        }
        .with_context(|| format!("failed to append record seq {seq}"))?;

        state.seq = seq;
        Ok((location, seq))
    }
}
