use parking_lot::Mutex;
use record::{
    decode_body, decode_header, encode_footer, encode_into, read_footer_entry, read_trailer,
    FooterEntry, Record, RecordError, RecordHeader, FOOTER_ENTRY_FIXED_LEN, FOOTER_TRAILER_LEN,
    RECORD_HEADER_LEN,
};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::{sync_parent_dir, Location, SegmentDirectory, SegmentError, SegmentId, SegmentOptions};

/// Lifecycle phase of a [`Segment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// Accepting appends under the active file name.
    Active,
    /// Footer is on disk but the rename to the sealed name has not succeeded.
    /// Appends are refused; the next [`Segment::seal`] only retries the rename.
    RenamePending,
    /// Immutable. Also the state of any segment opened for reading.
    Sealed,
}

/// What [`Segment::recover_active`] found in a leftover active file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActiveRepair {
    /// Records that passed decoding and checksum verification.
    pub records: usize,
    /// Bytes cut from the end of the file.
    pub truncated_bytes: u64,
}

/// One segment file and its in-memory footer entries.
///
/// A segment owns exactly one file handle. Point reads (`load*`) take
/// `&self` and serialize on an internal lock, so a sealed segment can be
/// shared behind an `Arc` by any number of readers. Mutations (`append`,
/// `seal`, `load_footer`) take `&mut self`.
pub struct Segment {
    id: SegmentId,
    /// Current on-disk name; changes on seal.
    path: PathBuf,
    sealed_path: PathBuf,
    state: SegmentState,
    /// End of record data. For a sealed segment this is the footer start once
    /// the footer has been loaded.
    write_offset: u32,
    entries: Vec<FooterEntry>,
    footer_loaded: bool,
    file: Mutex<File>,
    options: SegmentOptions,
    /// Reusable encode buffer for `append`.
    buf: Vec<u8>,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("state", &self.state)
            .field("write_offset", &self.write_offset)
            .field("entries", &self.entries.len())
            .field("footer_loaded", &self.footer_loaded)
            .finish()
    }
}

impl Segment {
    fn from_parts(
        id: SegmentId,
        path: PathBuf,
        sealed_path: PathBuf,
        state: SegmentState,
        file: File,
        options: SegmentOptions,
    ) -> Self {
        Self {
            id,
            path,
            sealed_path,
            state,
            write_offset: 0,
            entries: Vec::new(),
            footer_loaded: false,
            file: Mutex::new(file),
            options,
            buf: Vec::with_capacity(256),
        }
    }

    /// Allocates the next id from `dir` and creates an empty active file.
    ///
    /// The file is created with `create_new`, so an id collision with an
    /// existing file is an [`SegmentError::Open`] instead of a silent reuse.
    pub fn create_active(dir: &SegmentDirectory) -> Result<Self, SegmentError> {
        let id = dir.ids().next_id();
        let path = dir.active_path(id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|source| SegmentError::Open {
                path: path.clone(),
                source,
            })?;
        sync_parent_dir(&path);

        debug!(segment_id = id, "created active segment");
        Ok(Self::from_parts(
            id,
            path,
            dir.sealed_path(id),
            SegmentState::Active,
            file,
            dir.options(),
        ))
    }

    /// Opens segment `id` read-only.
    ///
    /// Tries the sealed name first and falls back to the active name, so a
    /// record appended to the current active segment can still be read by id.
    /// If the active file was renamed between the two attempts, the sealed
    /// name is tried once more.
    ///
    /// The returned segment has no entries until [`load_footer`] is called.
    ///
    /// [`load_footer`]: Segment::load_footer
    pub fn open_sealed(id: SegmentId, dir: &SegmentDirectory) -> Result<Self, SegmentError> {
        let sealed_path = dir.sealed_path(id);
        let active_path = dir.active_path(id);

        let candidates = [&sealed_path, &active_path, &sealed_path];
        for path in candidates {
            match File::open(path) {
                Ok(file) => {
                    return Ok(Self::from_parts(
                        id,
                        path.clone(),
                        sealed_path.clone(),
                        SegmentState::Sealed,
                        file,
                        dir.options(),
                    ))
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(source) => {
                    return Err(SegmentError::Open {
                        path: path.clone(),
                        source,
                    })
                }
            }
        }
        Err(SegmentError::SegmentNotFound { id })
    }

    /// Reopens a leftover active file after a crash and repairs it.
    ///
    /// Records are streamed from offset 0. The first record that is short,
    /// malformed or fails its checksum marks the torn tail: it and everything
    /// after it is truncated. The surviving records become the in-memory
    /// entries, and the segment is returned in the [`SegmentState::Active`]
    /// state ready to be sealed.
    pub fn recover_active(
        id: SegmentId,
        dir: &SegmentDirectory,
    ) -> Result<(Self, ActiveRepair), SegmentError> {
        let path = dir.active_path(id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| match source.kind() {
                io::ErrorKind::NotFound => SegmentError::SegmentNotFound { id },
                _ => SegmentError::Open {
                    path: path.clone(),
                    source,
                },
            })?;

        let file_len = file.metadata()?.len();
        let scan = scan_records(&file, file_len)?;
        let truncated_bytes = file_len - scan.valid_end;
        if truncated_bytes > 0 {
            warn!(
                segment_id = id,
                valid_bytes = scan.valid_end,
                truncated_bytes,
                reason = scan.stop.as_deref().unwrap_or("unknown"),
                "truncating torn tail of active segment"
            );
            file.set_len(scan.valid_end)?;
            file.sync_all()?;
        }

        let repair = ActiveRepair {
            records: scan.entries.len(),
            truncated_bytes,
        };
        let mut segment = Self::from_parts(
            id,
            path,
            dir.sealed_path(id),
            SegmentState::Active,
            file,
            dir.options(),
        );
        segment.write_offset = scan.valid_end as u32;
        segment.entries = scan.entries;
        Ok((segment, repair))
    }

    #[must_use]
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Current on-disk path of this segment.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn state(&self) -> SegmentState {
        self.state
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.state == SegmentState::Sealed
    }

    /// Byte offset where the next record would be written.
    #[must_use]
    pub fn write_offset(&self) -> u32 {
        self.write_offset
    }

    /// Footer entries known so far, in append order.
    #[must_use]
    pub fn entries(&self) -> &[FooterEntry] {
        &self.entries
    }

    /// Number of records in the segment.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `true` if the first footer entry is a tombstone.
    ///
    /// This is only a cheap pre-filter; it says nothing about later entries.
    #[must_use]
    pub fn is_tombstone_only(&self) -> bool {
        self.entries.first().is_some_and(FooterEntry::is_tombstone)
    }

    fn ensure_writable(&self) -> Result<(), SegmentError> {
        if self.state != SegmentState::Active {
            return Err(SegmentError::NotWritable { id: self.id });
        }
        Ok(())
    }

    /// Encodes and appends one record, returning its [`Location`].
    ///
    /// Nothing is written if encoding fails. On a failed write the file is
    /// truncated back to the previous write offset.
    pub fn append(
        &mut self,
        key: &[u8],
        value: &[u8],
        flags: u16,
        seq: u64,
    ) -> Result<Location, SegmentError> {
        self.ensure_writable()?;

        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();
        let result = encode_into(&mut buf, key, value, flags, seq, self.options.max_key_len)
            .map_err(SegmentError::from)
            .and_then(|()| self.append_encoded(&buf, key, value.len() as u32, flags, seq));
        self.buf = buf;
        result
    }

    /// Writes an already-encoded record. `bytes` must be the output of
    /// [`record::encode`] for the given key, value length, flags and seq.
    pub(crate) fn append_encoded(
        &mut self,
        bytes: &[u8],
        key: &[u8],
        value_len: u32,
        flags: u16,
        seq: u64,
    ) -> Result<Location, SegmentError> {
        self.ensure_writable()?;

        let offset = self.write_offset;
        let new_end = u64::from(offset) + bytes.len() as u64;
        if new_end > u64::from(u32::MAX) {
            return Err(SegmentError::SegmentFull { id: self.id });
        }

        {
            let mut file = self.file.lock();
            if let Err(e) = write_at(&mut file, offset, bytes, self.options.sync_writes) {
                // Drop whatever part of the record reached the file.
                truncate_after_failure(&file, self.id, offset);
                return Err(e.into());
            }
        }

        self.entries.push(FooterEntry {
            key: key.to_vec(),
            value_len,
            offset,
            seq,
            flags,
        });
        self.write_offset = new_end as u32;
        Ok(Location::new(self.id, offset))
    }

    /// Reads and checksum-verifies the record at `offset`.
    ///
    /// The header lengths are checked against the file size before any key or
    /// value buffer is allocated.
    pub fn load(&self, offset: u32) -> Result<Record, SegmentError> {
        let mut file = self.file.lock();
        let header = self.header_at(&mut file, offset)?;
        let record = decode_body(&mut *file, header)?;
        record.verify()?;
        Ok(record)
    }

    /// Returns the value bytes of the record at `offset` (empty for a
    /// tombstone).
    pub fn load_value(&self, offset: u32) -> Result<Vec<u8>, SegmentError> {
        Ok(self.load(offset)?.value)
    }

    /// Reads only the fixed-width header of the record at `offset`.
    ///
    /// The checksum covers key and value bytes, so it is not verified here.
    pub fn load_header(&self, offset: u32) -> Result<RecordHeader, SegmentError> {
        let mut file = self.file.lock();
        self.header_at(&mut file, offset)
    }

    fn header_at(&self, file: &mut File, offset: u32) -> Result<RecordHeader, SegmentError> {
        let file_len = file.metadata()?.len();
        let start = u64::from(offset);
        if start + RECORD_HEADER_LEN as u64 > file_len {
            return Err(RecordError::CorruptRecord(format!(
                "offset {} is past the end of segment {} ({} bytes)",
                offset, self.id, file_len
            ))
            .into());
        }

        file.seek(SeekFrom::Start(start))?;
        let header = decode_header(file)?;
        if start + header.record_len() > file_len {
            return Err(RecordError::CorruptRecord(format!(
                "record at offset {} in segment {} runs past end of file",
                offset, self.id
            ))
            .into());
        }
        Ok(header)
    }

    /// Writes the footer and renames the file to its sealed name.
    ///
    /// - On an active segment: footer + trailer are written at the write
    ///   offset and fsynced, then the file is renamed and the parent
    ///   directory fsynced.
    /// - If the footer write fails, the file is truncated back and the
    ///   segment stays active; a later call writes the footer again.
    /// - If the rename fails, the segment moves to
    ///   [`SegmentState::RenamePending`]; a later call retries only the
    ///   rename and never writes a second footer.
    ///
    /// # Errors
    ///
    /// [`SegmentError::AlreadySealed`] if the segment is already sealed.
    pub fn seal(&mut self) -> Result<(), SegmentError> {
        match self.state {
            SegmentState::Sealed => return Err(SegmentError::AlreadySealed { id: self.id }),
            SegmentState::RenamePending => {}
            SegmentState::Active => self.write_footer()?,
        }
        self.rename_to_sealed()
    }

    fn write_footer(&mut self) -> Result<(), SegmentError> {
        let footer = encode_footer(&self.entries, self.write_offset)?;
        {
            let mut file = self.file.lock();
            if let Err(e) = write_at(&mut file, self.write_offset, &footer, true) {
                truncate_after_failure(&file, self.id, self.write_offset);
                warn!(
                    segment_id = self.id,
                    error = %e,
                    "footer write failed; segment stays active"
                );
                return Err(e.into());
            }
        }
        self.state = SegmentState::RenamePending;
        self.footer_loaded = true;
        Ok(())
    }

    fn rename_to_sealed(&mut self) -> Result<(), SegmentError> {
        fs::rename(&self.path, &self.sealed_path).map_err(|source| {
            warn!(segment_id = self.id, error = %source, "rename to sealed name failed");
            SegmentError::Rename {
                from: self.path.clone(),
                to: self.sealed_path.clone(),
                source,
            }
        })?;
        sync_parent_dir(&self.sealed_path);

        self.path = self.sealed_path.clone();
        self.state = SegmentState::Sealed;
        info!(
            segment_id = self.id,
            records = self.entries.len(),
            bytes = self.write_offset,
            "sealed segment"
        );
        Ok(())
    }

    /// Loads the footer entries of a sealed segment. Allowed once.
    ///
    /// The trailer is read from the end of the file, `entry_count` is checked
    /// against the size of the footer region, the region checksum is verified,
    /// and exactly `entry_count` entries must consume the whole region.
    ///
    /// # Errors
    ///
    /// - [`SegmentError::FooterAlreadyLoaded`] on a second call, or on a
    ///   segment whose entries are already known (sealed by this process).
    /// - [`SegmentError::CorruptFooter`] for any inconsistency.
    pub fn load_footer(&mut self) -> Result<&[FooterEntry], SegmentError> {
        if self.footer_loaded {
            return Err(SegmentError::FooterAlreadyLoaded { id: self.id });
        }
        let id = self.id;
        let corrupt = |reason: String| SegmentError::CorruptFooter { id, reason };

        let (footer_start, entries) = {
            let mut file = self.file.lock();
            let file_len = file.metadata()?.len();
            let trailer = read_trailer(&mut *file).map_err(|e| match e {
                RecordError::Io(e) => SegmentError::Io(e),
                other => corrupt(other.to_string()),
            })?;

            let trailer_pos = file_len - FOOTER_TRAILER_LEN as u64;
            let footer_start = u64::from(trailer.footer_start);
            if footer_start > trailer_pos {
                return Err(corrupt(format!(
                    "footer_start {} is past the trailer at {}",
                    footer_start, trailer_pos
                )));
            }

            let region_len = trailer_pos - footer_start;
            let min_entry_len = FOOTER_ENTRY_FIXED_LEN as u64 + 1;
            if u64::from(trailer.entry_count) * min_entry_len > region_len {
                return Err(corrupt(format!(
                    "entry_count {} does not fit in a {}-byte footer",
                    trailer.entry_count, region_len
                )));
            }

            let mut region = vec![0u8; region_len as usize];
            file.seek(SeekFrom::Start(footer_start))?;
            file.read_exact(&mut region)
                .map_err(|e| corrupt(format!("short footer read: {}", e)))?;
            trailer.verify(&region).map_err(|e| corrupt(e.to_string()))?;

            let mut cur = Cursor::new(region.as_slice());
            let mut entries = Vec::with_capacity(trailer.entry_count as usize);
            for _ in 0..trailer.entry_count {
                let entry = read_footer_entry(&mut cur).map_err(|e| corrupt(e.to_string()))?;
                if u64::from(entry.offset) >= footer_start {
                    return Err(corrupt(format!(
                        "entry offset {} is inside the footer",
                        entry.offset
                    )));
                }
                entries.push(entry);
            }
            if cur.position() != region_len {
                return Err(corrupt(format!(
                    "{} unread bytes after the last entry",
                    region_len - cur.position()
                )));
            }
            (trailer.footer_start, entries)
        };

        debug!(segment_id = id, entries = entries.len(), "loaded footer");
        self.entries = entries;
        self.write_offset = footer_start;
        self.footer_loaded = true;
        Ok(&self.entries)
    }

    /// Rebuilds the entry list by walking the records from offset 0.
    ///
    /// Used when the footer of a sealed segment cannot be trusted. Scanning
    /// stops at the first record that fails to decode or verify; on a sealed
    /// file that is normally the start of the footer.
    pub fn rebuild_from_records(&mut self) -> Result<&[FooterEntry], SegmentError> {
        if self.footer_loaded {
            return Err(SegmentError::FooterAlreadyLoaded { id: self.id });
        }
        let scan = {
            let file = self.file.lock();
            let file_len = file.metadata()?.len();
            scan_records(&file, file_len)?
        };

        debug!(
            segment_id = self.id,
            entries = scan.entries.len(),
            stop = scan.stop.as_deref().unwrap_or("end of file"),
            "rebuilt entries from records"
        );
        self.entries = scan.entries;
        self.write_offset = scan.valid_end as u32;
        self.footer_loaded = true;
        Ok(&self.entries)
    }
}

fn write_at(file: &mut File, offset: u32, bytes: &[u8], sync: bool) -> io::Result<()> {
    file.seek(SeekFrom::Start(u64::from(offset)))?;
    file.write_all(bytes)?;
    file.flush()?;
    if sync {
        file.sync_all()?;
    }
    Ok(())
}

/// Cuts a partial write back to `len`. A failure leaves stray bytes past the
/// write offset, which are overwritten by the next append or sit behind the
/// footer and force a record scan on the next load.
pub(crate) fn truncate_after_failure(file: &File, id: SegmentId, len: u32) {
    if let Err(e) = file.set_len(u64::from(len)) {
        warn!(segment_id = id, len, error = %e, "failed to truncate after a failed write");
    }
}

/// Outcome of walking a file record by record.
struct Scan {
    entries: Vec<FooterEntry>,
    /// End of the last valid record.
    valid_end: u64,
    /// Why the walk stopped before `end`, if it did.
    stop: Option<String>,
}

/// Streams records from offset 0 up to `end` (capped at `u32::MAX`),
/// collecting a footer entry for every record that decodes and verifies.
///
/// Only real I/O errors are returned as `Err`; a bad record ends the walk.
fn scan_records(file: &File, end: u64) -> Result<Scan, SegmentError> {
    let mut rdr = BufReader::new(file);
    rdr.seek(SeekFrom::Start(0))?;

    let limit = end.min(u64::from(u32::MAX));
    let mut pos = 0u64;
    let mut entries = Vec::new();

    let stop = loop {
        let remaining = limit - pos;
        if remaining == 0 {
            break None;
        }
        if remaining < RECORD_HEADER_LEN as u64 {
            break Some(format!("{} trailing bytes at offset {}", remaining, pos));
        }

        let header = match decode_header(&mut rdr) {
            Ok(h) => h,
            Err(RecordError::Io(e)) => return Err(e.into()),
            Err(e) => break Some(format!("offset {}: {}", pos, e)),
        };
        if header.record_len() > remaining {
            break Some(format!("record at offset {} runs past the end", pos));
        }

        let record = match decode_body(&mut rdr, header) {
            Ok(r) => r,
            Err(RecordError::Io(e)) => return Err(e.into()),
            Err(e) => break Some(format!("offset {}: {}", pos, e)),
        };
        if let Err(e) = record.verify() {
            break Some(format!("offset {}: {}", pos, e));
        }

        entries.push(FooterEntry {
            key: record.key,
            value_len: header.value_len,
            offset: pos as u32,
            seq: record.seq,
            flags: record.flags,
        });
        pos += header.record_len();
    };

    Ok(Scan {
        entries,
        valid_end: pos,
        stop,
    })
}
