//! # Engine - LogKV Storage Engine
//!
//! Ties the [`record`], [`segment`] and [`keydir`] crates into a
//! log-structured key-value store: every mutation is appended to the active
//! segment and answered with the [`Location`] of its record. Keeping a key
//! index is the caller's job; [`KeyDir`] is the stock one.
//!
//! ## Architecture
//!
//! ```text
//! Client (owns a KeyDir)
//!   |        ^
//!   | put    | Location
//!   v        |
//! ┌───────────────────────────────────────────────┐
//! │                   ENGINE                      │
//! │                                               │
//! │ write.rs → LogWriter append → active segment  │
//! │              |                                │
//! │              |  (size limit reached?)         │
//! │              |            yes                 │
//! │              v                                │
//! │           seal: footer + rename               │
//! │                                               │
//! │ read.rs → active segment | sealed cache       │
//! │                                               │
//! │ compaction.rs → rewrite sparse sealed         │
//! │                 segments, publish relocations │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module         | Purpose                                                  |
//! |----------------|----------------------------------------------------------|
//! | [`lib.rs`]     | `Engine` struct, `open`, stats, `shutdown`, `Debug`, `Drop` |
//! | [`recovery`]   | startup scan: footers, active repair, index entries      |
//! | [`write`]      | `put()`, `delete()` and their index-updating variants    |
//! | [`read`]       | `get()`, `exists()` by location                          |
//! | [`compaction`] | `Compactor`, `compact_now()`, background worker          |
//!
//! ## Crash Safety
//!
//! A record is durable once `put` returns (fsynced when `sync_writes` is
//! set). A sealed segment is only ever published under its sealed name after
//! its footer is on disk. On restart a torn tail in an active segment is cut
//! back to the last intact record and the segment is sealed; a sealed
//! segment whose footer does not verify is indexed by scanning its records.

mod compaction;
mod read;
mod recovery;
mod write;

pub use compaction::{CompactionPhase, CompactionReport};
pub use config::EngineConfig;
pub use keydir::{KeyDir, KeyEntry, LiveIndex, Relocation};
pub use read::ValueState;
pub use recovery::{recover, RecoveredEntry, Recovery, RecoveryStats};
pub use segment::{Location, SegmentDirectory, SegmentError, SegmentId, SegmentOptions};

use anyhow::{Context, Result};
use compaction::CompactionWorker;
use parking_lot::{Mutex, RwLock};
use segment::{LogWriter, Segment};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// A point-in-time view of engine counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    pub active_segment_id: SegmentId,
    /// Bytes of records in the active segment.
    pub active_write_offset: u32,
    /// Sealed segment files currently in the data directory.
    pub sealed_segments: usize,
    /// Sealed segments with an open handle in the read cache.
    pub cached_segments: usize,
    /// Sequence number of the last successful write.
    pub last_seq: u64,
}

/// Writer state; everything behind one lock so that sequence numbers follow
/// append order.
pub(crate) struct WriteState {
    pub(crate) writer: LogWriter,
    pub(crate) seq: u64,
}

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) directory: SegmentDirectory,
    pub(crate) write: Mutex<WriteState>,
    /// Open sealed segments, keyed by id. Filled lazily by the read path.
    pub(crate) sealed: RwLock<HashMap<SegmentId, Arc<Segment>>>,
    /// Held for the whole of a compaction run.
    pub(crate) compaction: Mutex<()>,
    pub(crate) phase: Mutex<CompactionPhase>,
    /// Checked by a running compaction between candidates.
    pub(crate) stop: AtomicBool,
}

/// The log-structured storage engine.
///
/// All methods take `&self`; an `Engine` can be shared across threads
/// behind an [`Arc`].
///
/// # Write Path
///
/// 1. Take the writer lock and assign the next sequence number.
/// 2. Append the record through the [`LogWriter`], rotating to a fresh
///    segment when the active one is full.
/// 3. Return the record's [`Location`].
///
/// # Read Path
///
/// A location in the active segment is read under the writer lock. Any
/// other location is served from a cache of open sealed segments, so reads
/// of sealed data never wait on appends.
///
/// # Recovery
///
/// [`Engine::open`] runs [`recover`] over the data directory and returns
/// its [`Recovery`] alongside the engine; feed
/// [`Recovery::build_keydir`] (or the raw entries) to the index.
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
    pub(crate) worker: Mutex<Option<CompactionWorker>>,
    pub(crate) closed: AtomicBool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let write = self.inner.write.lock();
        f.debug_struct("Engine")
            .field("data_dir", &self.inner.directory.root())
            .field("active_segment_id", &write.writer.active().id())
            .field("active_write_offset", &write.writer.active().write_offset())
            .field("seq", &write.seq)
            .field("max_segment_size", &self.inner.config.max_segment_size)
            .field("sync_writes", &self.inner.config.sync_writes)
            .field("cached_segments", &self.inner.sealed.read().len())
            .field("compaction_running", &self.worker.lock().is_some())
            .finish()
    }
}

impl Engine {
    /// Opens the data directory, recovers it and starts a fresh active
    /// segment.
    ///
    /// # Recovery Steps
    ///
    /// 1. Validate the configuration and create the data directory.
    /// 2. Seed the segment id allocator past every id on disk.
    /// 3. Repair and seal leftover active segments.
    /// 4. Load the footer of every sealed segment, scanning records where the
    ///    footer is corrupt.
    /// 5. Create a new active segment and continue sequence numbers from the
    ///    highest one found.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid, the data directory cannot be
    /// created or listed, or the first active segment cannot be created.
    /// Individual unreadable segments are skipped and counted in
    /// [`RecoveryStats::skipped`].
    pub fn open(config: EngineConfig) -> Result<(Self, Recovery)> {
        config.validate().context("invalid engine configuration")?;

        let options = SegmentOptions {
            max_key_len: config.max_key_len,
            sync_writes: config.sync_writes,
        };
        let directory = SegmentDirectory::open(&config.data_dir, options).with_context(|| {
            format!("failed to open data directory {}", config.data_dir.display())
        })?;

        let recovery = recover(&directory)?;
        let seq = recovery.max_seq();

        let writer = LogWriter::new(directory.clone(), config.max_segment_size)
            .context("failed to create active segment")?;

        info!(
            data_dir = %directory.root().display(),
            active_segment_id = writer.active().id(),
            seq,
            "engine opened"
        );

        let inner = EngineInner {
            config,
            directory,
            write: Mutex::new(WriteState { writer, seq }),
            sealed: RwLock::new(HashMap::new()),
            compaction: Mutex::new(()),
            phase: Mutex::new(CompactionPhase::Idle),
            stop: AtomicBool::new(false),
        };

        let engine = Self {
            inner: Arc::new(inner),
            worker: Mutex::new(None),
            closed: AtomicBool::new(false),
        };
        Ok((engine, recovery))
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Id of the segment currently receiving appends.
    pub fn active_segment_id(&self) -> SegmentId {
        self.inner.write.lock().writer.active().id()
    }

    /// Sequence number of the last successful write (0 if none).
    pub fn last_seq(&self) -> u64 {
        self.inner.write.lock().seq
    }

    /// Current phase of the compactor.
    pub fn compaction_phase(&self) -> CompactionPhase {
        *self.inner.phase.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Collects [`EngineStats`]. Lists the data directory.
    pub fn stats(&self) -> Result<EngineStats> {
        let (active_segment_id, active_write_offset, last_seq) = {
            let write = self.inner.write.lock();
            (
                write.writer.active().id(),
                write.writer.active().write_offset(),
                write.seq,
            )
        };
        let found = self.inner.directory.discover()?;
        let sealed_segments = found
            .sealed
            .iter()
            .filter(|id| **id != active_segment_id)
            .count();

        Ok(EngineStats {
            active_segment_id,
            active_write_offset,
            sealed_segments,
            cached_segments: self.inner.sealed.read().len(),
            last_seq,
        })
    }

    /// Stops background compaction and seals the active segment.
    ///
    /// A compaction run in progress stops before its next candidate. Once
    /// shutdown has started every write fails; reads of sealed segments keep
    /// working. If sealing fails the error is returned and the next call
    /// retries it. Calling it again after a successful seal is a no-op.
    pub fn shutdown(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.stop_compaction();

        let mut write = self.inner.write.lock();
        if write.writer.is_closed() {
            return Ok(());
        }
        write
            .writer
            .shutdown()
            .context("failed to seal active segment on shutdown")?;
        info!(seq = write.seq, "engine shut down");
        Ok(())
    }
}

/// Best-effort shutdown on drop.
///
/// Errors cannot propagate out of `Drop`. An active segment left unsealed is
/// repaired and sealed by the next [`Engine::open`].
impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "shutdown on drop failed");
        }
    }
}

#[cfg(test)]
mod tests;
