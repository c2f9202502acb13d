use crate::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Size of a record with a one-byte key and a one-byte value.
pub const TINY_RECORD: u64 = 22;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn config(dir: &Path, max_segment_size: u64) -> EngineConfig {
    EngineConfig::builder()
        .data_dir(dir)
        .max_segment_size(max_segment_size)
        .compaction_interval(Duration::from_millis(20))
        .build()
        .unwrap()
}

pub fn open(dir: &Path, max_segment_size: u64) -> anyhow::Result<(Engine, Recovery)> {
    init_tracing();
    Engine::open(config(dir, max_segment_size))
}

pub fn sealed_path(dir: &Path, id: SegmentId) -> PathBuf {
    dir.join(format!("log_{id}.kv"))
}

pub fn active_path(dir: &Path, id: SegmentId) -> PathBuf {
    dir.join(format!("log_{id}_active.kv"))
}

/// `(sealed, active)` segment file counts.
pub fn count_segment_files(dir: &Path) -> (usize, usize) {
    let mut sealed = 0;
    let mut active = 0;
    for entry in fs::read_dir(dir).unwrap() {
        let name = entry.unwrap().file_name().into_string().unwrap();
        if name.ends_with("_active.kv") {
            active += 1;
        } else if name.starts_with("log_") && name.ends_with(".kv") {
            sealed += 1;
        }
    }
    (sealed, active)
}

/// Flips one byte of a file in place.
pub fn flip_byte(path: &Path, pos: u64) {
    let mut bytes = fs::read(path).unwrap();
    bytes[pos as usize] ^= 0xFF;
    fs::write(path, bytes).unwrap();
}

pub fn live_value(engine: &Engine, index: &KeyDir, key: &[u8]) -> Option<Vec<u8>> {
    let location = index.live_location(key)?;
    engine.get(location).unwrap().into_value()
}
