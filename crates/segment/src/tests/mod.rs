
use crate::{SegmentDirectory, SegmentOptions};
use tempfile::TempDir;

pub(crate) fn scratch_dir() -> (TempDir, SegmentDirectory) {
    let tmp = tempfile::tempdir().unwrap();
    let dir = SegmentDirectory::open(tmp.path(), SegmentOptions::default()).unwrap();
    (tmp, dir)
}
