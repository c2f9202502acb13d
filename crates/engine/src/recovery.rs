/// Startup recovery: turns whatever is in the data directory into index
/// entries.
///
/// Leftover active segments are repaired and sealed first, then every sealed
/// segment's footer is loaded. A segment that cannot be read at all is
/// skipped and left on disk for inspection; it never aborts startup.
use anyhow::{Context, Result};
use keydir::KeyDir;
use record::is_tombstone;
use segment::{Location, Segment, SegmentDirectory, SegmentError, SegmentId};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// One footer entry, as an index update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredEntry {
    pub key: Vec<u8>,
    pub location: Location,
    pub flags: u16,
    pub seq: u64,
}

impl RecoveredEntry {
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        is_tombstone(self.flags)
    }
}

/// Counters describing what recovery found and repaired.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Sealed segments indexed from a verified footer.
    pub sealed_loaded: usize,
    /// Sealed segments indexed by scanning records after a footer failure.
    pub footers_rebuilt: usize,
    /// Active segments repaired and sealed.
    pub actives_repaired: usize,
    /// Torn bytes cut from the tails of active segments.
    pub truncated_bytes: u64,
    /// Active segments with no intact record, removed.
    pub empty_actives_removed: usize,
    /// Segments that could not be read and were left in place.
    pub skipped: Vec<SegmentId>,
}

/// Output of [`recover`].
#[derive(Debug, Clone, Default)]
pub struct Recovery {
    /// Highest segment id seen on disk, if any.
    pub highest_segment_id: Option<SegmentId>,
    /// Every record, grouped by ascending segment id and in file order
    /// within a segment. A key can appear many times; the entry with the
    /// highest `seq` is current.
    pub entries: Vec<RecoveredEntry>,
    pub stats: RecoveryStats,
}

impl Recovery {
    /// Highest sequence number among the recovered entries (0 if none).
    pub fn max_seq(&self) -> u64 {
        self.entries.iter().map(|e| e.seq).max().unwrap_or(0)
    }

    /// Builds a [`KeyDir`] holding the latest entry for every key.
    pub fn build_keydir(&self) -> KeyDir {
        KeyDir::from_entries(
            self.entries
                .iter()
                .map(|e| (e.key.clone(), e.location, e.flags, e.seq)),
        )
    }
}

/// Scans `dir` and returns index entries for every readable segment.
///
/// Seeds the directory's id allocator past every id found, so segments
/// created afterwards never collide with existing files.
///
/// # Errors
///
/// Only a failure to list the directory is fatal. Unreadable segments are
/// reported in [`RecoveryStats::skipped`].
pub fn recover(dir: &SegmentDirectory) -> Result<Recovery> {
    let found = dir
        .discover()
        .with_context(|| format!("failed to list data directory {}", dir.root().display()))?;

    let mut recovery = Recovery {
        highest_segment_id: found.highest_id(),
        ..Recovery::default()
    };
    let mut by_segment: BTreeMap<SegmentId, Vec<RecoveredEntry>> = BTreeMap::new();

    // 1. actives: repair, then seal (or drop if nothing survived)
    for &id in &found.active {
        if found.sealed.binary_search(&id).is_ok() {
            // rename never leaves both names behind
            warn!(segment_id = id, "active and sealed files share an id; ignoring active file");
            recovery.stats.skipped.push(id);
            continue;
        }
        match recover_active(dir, id, &mut recovery.stats) {
            Ok(Some(entries)) => {
                by_segment.insert(id, entries);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(segment_id = id, error = %e, "skipping unrecoverable active segment");
                recovery.stats.skipped.push(id);
            }
        }
    }

    // 2. sealed: footer, falling back to a record scan
    for &id in &found.sealed {
        match load_sealed(dir, id, &mut recovery.stats) {
            Ok(entries) => {
                by_segment.insert(id, entries);
            }
            Err(e) => {
                warn!(segment_id = id, error = %e, "skipping unreadable sealed segment");
                recovery.stats.skipped.push(id);
            }
        }
    }

    recovery.entries = by_segment.into_values().flatten().collect();
    recovery.stats.skipped.sort_unstable();

    info!(
        entries = recovery.entries.len(),
        sealed_loaded = recovery.stats.sealed_loaded,
        footers_rebuilt = recovery.stats.footers_rebuilt,
        actives_repaired = recovery.stats.actives_repaired,
        truncated_bytes = recovery.stats.truncated_bytes,
        skipped = recovery.stats.skipped.len(),
        "recovery complete"
    );
    Ok(recovery)
}

/// Repairs active segment `id` and seals it. Returns `None` when the file
/// held no intact record and was removed.
fn recover_active(
    dir: &SegmentDirectory,
    id: SegmentId,
    stats: &mut RecoveryStats,
) -> Result<Option<Vec<RecoveredEntry>>, SegmentError> {
    let (mut seg, repair) = Segment::recover_active(id, dir)?;
    stats.truncated_bytes += repair.truncated_bytes;

    if repair.records == 0 {
        let path = seg.path().to_path_buf();
        drop(seg);
        std::fs::remove_file(&path)?;
        debug!(segment_id = id, "removed empty active segment");
        stats.empty_actives_removed += 1;
        return Ok(None);
    }

    seg.seal()?;
    stats.actives_repaired += 1;
    info!(
        segment_id = id,
        records = repair.records,
        truncated_bytes = repair.truncated_bytes,
        "sealed recovered active segment"
    );
    Ok(Some(entries_of(&seg)))
}

fn load_sealed(
    dir: &SegmentDirectory,
    id: SegmentId,
    stats: &mut RecoveryStats,
) -> Result<Vec<RecoveredEntry>, SegmentError> {
    let mut seg = Segment::open_sealed(id, dir)?;
    match seg.load_footer() {
        Ok(_) => {
            stats.sealed_loaded += 1;
            Ok(entries_of(&seg))
        }
        Err(SegmentError::CorruptFooter { reason, .. }) => {
            warn!(segment_id = id, reason = %reason, "footer unusable; scanning records");
            let mut seg = Segment::open_sealed(id, dir)?;
            seg.rebuild_from_records()?;
            stats.footers_rebuilt += 1;
            Ok(entries_of(&seg))
        }
        Err(e) => Err(e),
    }
}

fn entries_of(seg: &Segment) -> Vec<RecoveredEntry> {
    seg.entries()
        .iter()
        .map(|e| RecoveredEntry {
            key: e.key.clone(),
            location: Location::new(seg.id(), e.offset),
            flags: e.flags,
            seq: e.seq,
        })
        .collect()
}
