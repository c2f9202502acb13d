//! Segment file naming, discovery and id allocation.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use record::DEFAULT_MAX_KEY_LEN;
use tracing::debug;

use crate::{SegmentError, SegmentId};

const PREFIX: &str = "log_";
const SEALED_SUFFIX: &str = ".kv";
const ACTIVE_SUFFIX: &str = "_active.kv";

/// Monotonic source of segment ids.
///
/// This is the only mutable state shared between the append path and the
/// compactor; both allocate new segments through the same counter.
#[derive(Debug, Default)]
pub struct SegmentIdAllocator {
    next: AtomicU64,
}

impl SegmentIdAllocator {
    /// Creates an allocator whose first id is `first`.
    #[must_use]
    pub fn new(first: SegmentId) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Returns a fresh id and advances the counter.
    pub fn next_id(&self) -> SegmentId {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Raises the counter to at least `hint`. Never moves it backwards.
    pub fn set_next_id(&self, hint: SegmentId) {
        self.next.fetch_max(hint, Ordering::SeqCst);
    }

    /// The id the next call to [`next_id`](Self::next_id) would return.
    #[must_use]
    pub fn peek(&self) -> SegmentId {
        self.next.load(Ordering::SeqCst)
    }
}

/// Per-directory write options applied to every segment it creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentOptions {
    /// Keys longer than this are rejected at encode time.
    pub max_key_len: usize,
    /// `fsync` after every append instead of flushing to the OS only.
    pub sync_writes: bool,
}

impl Default for SegmentOptions {
    fn default() -> Self {
        Self {
            max_key_len: DEFAULT_MAX_KEY_LEN,
            sync_writes: false,
        }
    }
}

/// What a startup scan of the data directory found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovery {
    /// Ids of `log_<id>.kv` files, ascending.
    pub sealed: Vec<SegmentId>,
    /// Ids of `log_<id>_active.kv` files, ascending. Normally at most one.
    pub active: Vec<SegmentId>,
}

impl Discovery {
    /// Highest id across sealed and active files.
    #[must_use]
    pub fn highest_id(&self) -> Option<SegmentId> {
        self.sealed
            .last()
            .copied()
            .into_iter()
            .chain(self.active.last().copied())
            .max()
    }
}

/// A data directory plus the id allocator shared by everything that creates
/// segments inside it. Cloning is cheap and shares the allocator.
#[derive(Debug, Clone)]
pub struct SegmentDirectory {
    root: PathBuf,
    ids: Arc<SegmentIdAllocator>,
    options: SegmentOptions,
}

impl SegmentDirectory {
    /// Opens `root`, creating it if needed, with a fresh allocator starting
    /// at id 0. Call [`discover`](Self::discover) before creating segments in
    /// a directory that may already hold some.
    pub fn open<P: AsRef<Path>>(root: P, options: SegmentOptions) -> Result<Self, SegmentError> {
        Self::with_allocator(root, options, Arc::new(SegmentIdAllocator::default()))
    }

    /// Like [`open`](Self::open) but shares an existing allocator.
    pub fn with_allocator<P: AsRef<Path>>(
        root: P,
        options: SegmentOptions,
        ids: Arc<SegmentIdAllocator>,
    ) -> Result<Self, SegmentError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|source| SegmentError::Open {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root, ids, options })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn ids(&self) -> &Arc<SegmentIdAllocator> {
        &self.ids
    }

    #[must_use]
    pub fn options(&self) -> SegmentOptions {
        self.options
    }

    /// `<root>/log_<id>.kv`
    #[must_use]
    pub fn sealed_path(&self, id: SegmentId) -> PathBuf {
        self.root.join(format!("{PREFIX}{id}{SEALED_SUFFIX}"))
    }

    /// `<root>/log_<id>_active.kv`
    #[must_use]
    pub fn active_path(&self, id: SegmentId) -> PathBuf {
        self.root.join(format!("{PREFIX}{id}{ACTIVE_SUFFIX}"))
    }

    /// Lists every segment file in the directory and seeds the allocator to
    /// one past the highest id found.
    ///
    /// Files that do not match either naming pattern are ignored.
    pub fn discover(&self) -> Result<Discovery, SegmentError> {
        let mut found = Discovery::default();

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            match parse_segment_name(name) {
                Some((id, false)) => found.sealed.push(id),
                Some((id, true)) => found.active.push(id),
                None => {}
            }
        }

        found.sealed.sort_unstable();
        found.active.sort_unstable();

        if let Some(max) = found.highest_id() {
            self.ids.set_next_id(max.saturating_add(1));
        }

        debug!(
            dir = %self.root.display(),
            sealed = found.sealed.len(),
            active = found.active.len(),
            next_id = self.ids.peek(),
            "segment discovery"
        );
        Ok(found)
    }
}

/// Parses a segment file name into `(id, is_active)`.
///
/// Accepts exactly `log_<digits>.kv` and `log_<digits>_active.kv`.
#[must_use]
pub fn parse_segment_name(name: &str) -> Option<(SegmentId, bool)> {
    let rest = name.strip_prefix(PREFIX)?;
    let (digits, active) = match rest.strip_suffix(ACTIVE_SUFFIX) {
        Some(d) => (d, true),
        None => (rest.strip_suffix(SEALED_SUFFIX)?, false),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().map(|id| (id, active))
}
