/// Compaction: rewrites sparse sealed segments and reclaims their files.
///
/// Each run walks one state machine:
///
/// ```text
///   Idle ──> Scanning ──> ( Rewriting ──> Publishing )* ──> Idle
/// ```
///
/// - **Scanning** loads the footer of every sealed segment and asks the
///   caller's [`LiveIndex`] which entries are still current. A segment whose
///   live ratio is below `compaction_threshold` (or whose first entry is a
///   tombstone) becomes a candidate. A segment holding any record above the
///   index's applied watermark is skipped: the index cannot yet vouch for it.
/// - **Rewriting** copies each live record of one candidate, with its
///   original sequence number and flags, into fresh segments from a private
///   [`LogWriter`], then seals them.
/// - **Publishing** hands the relocations to the index and only then evicts
///   and unlinks the old segment.
///
/// A failure while rewriting a candidate deletes that candidate's output and
/// leaves the old segment untouched; the run moves on. Tombstones the index
/// still points at are copied like any other live record, so a delete is
/// never lost to compaction.
use anyhow::{anyhow, Context, Result};
use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use keydir::{LiveIndex, Relocation};
use segment::{LogWriter, Location, Segment, SegmentError, SegmentId};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

use crate::{Engine, EngineInner};

/// Where a compaction run is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompactionPhase {
    #[default]
    Idle,
    Scanning,
    Rewriting,
    Publishing,
}

/// What one compaction run did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompactionReport {
    /// Sealed segments whose footer was examined.
    pub segments_scanned: usize,
    /// Segments selected for rewriting.
    pub candidates: Vec<SegmentId>,
    /// Old segments whose file was removed.
    pub segments_reclaimed: Vec<SegmentId>,
    /// New sealed segments holding the copied records.
    pub segments_written: Vec<SegmentId>,
    /// Live records copied.
    pub records_relocated: usize,
    /// Dead records left behind.
    pub records_dropped: usize,
    /// Segments skipped because they hold writes the index has not applied.
    pub segments_ahead_of_index: usize,
    /// Relocations the index rejected because the key moved meanwhile.
    pub relocations_rejected: usize,
    /// Candidates that failed and were left in place.
    pub failed: Vec<SegmentId>,
    /// The run stopped early because of a shutdown request.
    pub stopped: bool,
}

impl Engine {
    /// Runs one compaction pass on the calling thread.
    ///
    /// `index` must be authoritative up to its
    /// [`applied_seq`](LiveIndex::applied_seq): every write at or below it has
    /// to be reflected, or the record is treated as dead and reclaimed.
    /// Waits for a concurrent run (background or manual) to finish first.
    pub fn compact_now(&self, index: &dyn LiveIndex) -> Result<CompactionReport> {
        if self.is_closed() {
            return Err(anyhow!("engine is shut down"));
        }
        Compactor::new(&self.inner, index).run()
    }

    /// Starts the background compaction thread. It runs a pass every
    /// `compaction_interval` until [`shutdown`](Engine::shutdown) or
    /// [`stop_compaction`](Engine::stop_compaction).
    pub fn start_compaction(&self, index: Arc<dyn LiveIndex>) -> Result<()> {
        if self.is_closed() {
            return Err(anyhow!("engine is shut down"));
        }
        let mut slot = self.worker.lock();
        if slot.is_some() {
            return Err(anyhow!("background compaction is already running"));
        }
        self.inner.stop.store(false, Ordering::Release);
        *slot = Some(CompactionWorker::spawn(Arc::clone(&self.inner), index)?);
        Ok(())
    }

    /// Stops the background thread, if any, and waits for it to exit.
    ///
    /// Any run in progress, background or manual, stops after its current
    /// candidate.
    pub fn stop_compaction(&self) {
        self.inner.stop.store(true, Ordering::Release);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.stop();
        }
        if !self.is_closed() {
            self.inner.stop.store(false, Ordering::Release);
        }
    }
}

pub(crate) struct Compactor<'a> {
    inner: &'a EngineInner,
    index: &'a dyn LiveIndex,
    report: CompactionReport,
}

/// Output of rewriting one candidate.
#[derive(Default)]
struct Rewrite {
    writer: Option<LogWriter>,
    outputs: Vec<SegmentId>,
    relocations: Vec<Relocation>,
    dropped: usize,
}

impl<'a> Compactor<'a> {
    pub(crate) fn new(inner: &'a EngineInner, index: &'a dyn LiveIndex) -> Self {
        Self {
            inner,
            index,
            report: CompactionReport::default(),
        }
    }

    fn set_phase(&self, phase: CompactionPhase) {
        *self.inner.phase.lock() = phase;
    }

    fn stop_requested(&self) -> bool {
        self.inner.stop.load(Ordering::Acquire)
    }

    pub(crate) fn run(mut self) -> Result<CompactionReport> {
        let inner = self.inner;
        let _running = inner.compaction.lock();

        self.set_phase(CompactionPhase::Scanning);
        let candidates = match self.scan() {
            Ok(c) => c,
            Err(e) => {
                self.set_phase(CompactionPhase::Idle);
                return Err(e);
            }
        };

        for seg in candidates {
            if self.stop_requested() {
                self.report.stopped = true;
                break;
            }
            self.compact_segment(&seg);
        }

        self.set_phase(CompactionPhase::Idle);
        if !self.report.candidates.is_empty() {
            info!(
                scanned = self.report.segments_scanned,
                candidates = self.report.candidates.len(),
                reclaimed = self.report.segments_reclaimed.len(),
                relocated = self.report.records_relocated,
                dropped = self.report.records_dropped,
                failed = self.report.failed.len(),
                stopped = self.report.stopped,
                "compaction run finished"
            );
        }
        Ok(self.report)
    }

    /// Picks the sealed segments worth rewriting.
    ///
    /// Segments created after the scan starts (the engine's next active, or
    /// this run's own output) are never considered.
    fn scan(&mut self) -> Result<Vec<Segment>> {
        let horizon = self.inner.directory.ids().peek();
        let active_id = self.inner.write.lock().writer.active().id();
        let found = self
            .inner
            .directory
            .discover()
            .context("failed to list segments for compaction")?;

        let threshold = self.inner.config.compaction_threshold;
        let applied = self.index.applied_seq();
        let mut candidates = Vec::new();

        for id in found.sealed {
            if id == active_id || id >= horizon {
                continue;
            }
            if self.stop_requested() {
                self.report.stopped = true;
                break;
            }

            let seg = match load_entries(self.inner, id) {
                Ok(seg) => seg,
                Err(SegmentError::SegmentNotFound { .. }) => continue,
                Err(e) => {
                    warn!(segment_id = id, error = %e, "cannot load segment for compaction");
                    continue;
                }
            };
            self.report.segments_scanned += 1;

            let max_seq = seg.entries().iter().map(|e| e.seq).max().unwrap_or(0);
            if max_seq > applied {
                debug!(segment_id = id, max_seq, applied, "index behind segment; skipping");
                self.report.segments_ahead_of_index += 1;
                continue;
            }

            let total = seg.len();
            let live = seg
                .entries()
                .iter()
                .filter(|e| self.index.is_live(&e.key, Location::new(id, e.offset)))
                .count();
            let ratio = if total == 0 {
                0.0
            } else {
                live as f64 / total as f64
            };

            debug!(segment_id = id, live, total, ratio, "scanned segment");
            // a leading tombstone only matters if something can be dropped
            if ratio < threshold || (seg.is_tombstone_only() && live < total) {
                self.report.candidates.push(id);
                candidates.push(seg);
            }
        }
        Ok(candidates)
    }

    fn compact_segment(&mut self, seg: &Segment) {
        let id = seg.id();
        self.set_phase(CompactionPhase::Rewriting);

        let mut rewrite = Rewrite::default();
        if let Err(e) = self.copy_live(seg, &mut rewrite) {
            warn!(segment_id = id, error = %e, "compaction of segment failed; keeping it");
            self.discard(rewrite);
            self.report.failed.push(id);
            return;
        }

        self.set_phase(CompactionPhase::Publishing);
        let applied = self.index.apply_relocations(&rewrite.relocations);
        self.report.relocations_rejected += rewrite.relocations.len() - applied;
        self.report.records_relocated += rewrite.relocations.len();
        self.report.records_dropped += rewrite.dropped;
        self.report.segments_written.extend(&rewrite.outputs);

        match self.retire(id) {
            Ok(()) => {
                info!(
                    segment_id = id,
                    relocated = rewrite.relocations.len(),
                    dropped = rewrite.dropped,
                    outputs = ?rewrite.outputs,
                    "reclaimed segment"
                );
                self.report.segments_reclaimed.push(id);
            }
            Err(e) => {
                // Every record is already reachable through its new location;
                // a later run finds this file fully dead and retries.
                warn!(segment_id = id, error = %e, "failed to remove compacted segment");
                self.report.failed.push(id);
            }
        }
    }

    /// Copies every live record of `seg` and seals the output.
    fn copy_live(&self, seg: &Segment, rewrite: &mut Rewrite) -> Result<()> {
        for entry in seg.entries() {
            let from = Location::new(seg.id(), entry.offset);
            if !self.index.is_live(&entry.key, from) {
                rewrite.dropped += 1;
                continue;
            }

            let writer = match rewrite.writer.as_mut() {
                Some(w) => w,
                None => {
                    let w = LogWriter::new(
                        self.inner.directory.clone(),
                        self.inner.config.max_segment_size,
                    )?;
                    rewrite.outputs.push(w.active().id());
                    rewrite.writer.insert(w)
                }
            };

            let to = if entry.is_tombstone() {
                writer.append_delete(&entry.key, entry.flags, entry.seq)?
            } else {
                let value = seg.load_value(entry.offset)?;
                writer.append(&entry.key, &value, entry.flags, entry.seq)?
            };
            if !rewrite.outputs.contains(&to.segment_id) {
                rewrite.outputs.push(to.segment_id);
            }
            rewrite.relocations.push(Relocation {
                key: entry.key.clone(),
                from,
                to,
            });
        }

        if let Some(w) = rewrite.writer.as_mut() {
            w.shutdown().context("failed to seal compaction output")?;
        }
        Ok(())
    }

    /// Deletes every file a failed rewrite produced.
    fn discard(&self, rewrite: Rewrite) {
        drop(rewrite.writer);
        let dir = &self.inner.directory;
        for id in rewrite.outputs {
            for path in [dir.sealed_path(id), dir.active_path(id)] {
                match std::fs::remove_file(&path) {
                    Ok(()) => debug!(segment_id = id, "removed compaction output"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!(
                        segment_id = id,
                        path = %path.display(),
                        error = %e,
                        "failed to remove compaction output"
                    ),
                }
            }
        }
    }

    /// Evicts segment `id` from the read cache and unlinks its file.
    fn retire(&self, id: SegmentId) -> Result<()> {
        self.inner.retire_file(id).with_context(|| {
            format!("failed to remove {}", self.inner.directory.sealed_path(id).display())
        })?;
        if let Ok(dir) = std::fs::File::open(self.inner.directory.root()) {
            let _ = dir.sync_all();
        }
        Ok(())
    }
}

/// Opens sealed segment `id` with its entries loaded, scanning records if
/// the footer does not verify.
fn load_entries(inner: &EngineInner, id: SegmentId) -> Result<Segment, SegmentError> {
    let mut seg = Segment::open_sealed(id, &inner.directory)?;
    match seg.load_footer() {
        Ok(_) => Ok(seg),
        Err(SegmentError::CorruptFooter { reason, .. }) => {
            warn!(segment_id = id, reason = %reason, "footer unusable; scanning records");
            let mut seg = Segment::open_sealed(id, &inner.directory)?;
            seg.rebuild_from_records()?;
            Ok(seg)
        }
        Err(e) => Err(e),
    }
}

/// Handle to the background compaction thread.
pub(crate) struct CompactionWorker {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

impl CompactionWorker {
    fn spawn(inner: Arc<EngineInner>, index: Arc<dyn LiveIndex>) -> Result<Self> {
        let (tx, rx) = bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name("logkv-compaction".into())
            .spawn(move || {
                let interval = inner.config.compaction_interval;
                info!(?interval, "compaction worker started");
                loop {
                    match rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            if let Err(e) = Compactor::new(&inner, index.as_ref()).run() {
                                warn!(error = %e, "background compaction failed");
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("compaction worker stopped");
            })
            .context("failed to spawn compaction thread")?;

        Ok(Self {
            shutdown: tx,
            handle,
        })
    }

    fn stop(self) {
        let _ = self.shutdown.send(());
        if self.handle.join().is_err() {
            warn!("compaction worker panicked");
        }
    }
}
