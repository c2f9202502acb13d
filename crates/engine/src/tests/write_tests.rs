use super::helpers::{active_path, count_segment_files, open, sealed_path, TINY_RECORD};
use crate::*;
use anyhow::Result;
use record::RecordError;
use std::fs;
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

fn encoding_error(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<SegmentError>(),
        Some(SegmentError::Record(RecordError::Encoding(_)))
    )
}

// --------------------- put / delete ---------------------

#[test]
fn put_returns_consecutive_locations() -> Result<()> {
    let dir = tempdir()?;
    let (engine, _) = open(dir.path(), 1 << 20)?;

    let a = engine.put(b"a", b"1")?;
    let b = engine.put(b"b", b"2")?;

    assert_eq!(a, Location::new(0, 0));
    assert_eq!(b, Location::new(0, TINY_RECORD as u32));
    assert_eq!(engine.last_seq(), 2);
    Ok(())
}

#[test]
fn delete_writes_tombstone() -> Result<()> {
    let dir = tempdir()?;
    let (engine, _) = open(dir.path(), 1 << 20)?;

    engine.put(b"k", b"v")?;
    let loc = engine.delete(b"k")?;

    assert_eq!(engine.get(loc)?, ValueState::Deleted);
    assert!(!engine.exists(loc)?);
    Ok(())
}

#[test]
fn delete_of_unknown_key_still_appends() -> Result<()> {
    let dir = tempdir()?;
    let (engine, _) = open(dir.path(), 1 << 20)?;

    let loc = engine.delete(b"never-written")?;
    assert_eq!(loc, Location::new(0, 0));
    assert_eq!(engine.last_seq(), 1);
    Ok(())
}

// --------------------- Validation ---------------------

#[test]
fn invalid_records_are_rejected_without_consuming_seq() -> Result<()> {
    let dir = tempdir()?;
    let (engine, _) = open(dir.path(), 1 << 20)?;
    let long_key = vec![b'k'; 1025];

    assert!(encoding_error(&engine.put(b"", b"v").unwrap_err()));
    assert!(encoding_error(&engine.put(b"k", b"").unwrap_err()));
    assert!(encoding_error(&engine.put(&long_key, b"v").unwrap_err()));
    assert!(encoding_error(&engine.delete(b"").unwrap_err()));

    assert_eq!(engine.last_seq(), 0);
    assert_eq!(engine.stats()?.active_write_offset, 0);

    // the next good write gets seq 1 at offset 0
    let index = KeyDir::new();
    let loc = engine.put_indexed(&index, b"k", b"v")?;
    assert_eq!(loc, Location::new(0, 0));
    assert_eq!(index.get(b"k").unwrap().seq, 1);
    Ok(())
}

#[test]
fn key_at_limit_is_accepted() -> Result<()> {
    let dir = tempdir()?;
    let (engine, _) = open(dir.path(), 1 << 20)?;

    let key = vec![b'k'; 1024];
    let loc = engine.put(&key, b"v")?;
    assert_eq!(engine.get(loc)?, ValueState::Live(b"v".to_vec()));
    Ok(())
}

// --------------------- Rotation ---------------------

#[test]
fn third_record_rotates_to_new_segment() -> Result<()> {
    let dir = tempdir()?;
    // room for two tiny records, not three
    let (engine, _) = open(dir.path(), 2 * TINY_RECORD + TINY_RECORD / 2)?;

    let a = engine.put(b"a", b"1")?;
    let b = engine.put(b"b", b"2")?;
    let c = engine.put(b"c", b"3")?;

    assert_eq!(a.segment_id, b.segment_id);
    assert_eq!(c, Location::new(a.segment_id + 1, 0));
    assert_eq!(engine.active_segment_id(), c.segment_id);
    assert_eq!(count_segment_files(dir.path()), (1, 1));

    // the rotated-out segment is readable through its footer-backed file
    assert_eq!(engine.get(a)?, ValueState::Live(b"1".to_vec()));
    assert_eq!(engine.get(c)?, ValueState::Live(b"3".to_vec()));
    Ok(())
}

#[test]
fn many_rotations_keep_every_value() -> Result<()> {
    let dir = tempdir()?;
    let (engine, _) = open(dir.path(), 128)?;

    let locs: Vec<_> = (0..50)
        .map(|i| engine.put(format!("key{i}").as_bytes(), format!("value{i}").as_bytes()))
        .collect::<Result<_>>()?;

    assert!(engine.stats()?.sealed_segments > 5);
    for (i, loc) in locs.into_iter().enumerate() {
        assert_eq!(engine.get(loc)?.into_value(), Some(format!("value{i}").into_bytes()));
    }
    Ok(())
}

// --------------------- Indexed writes ---------------------

#[test]
fn indexed_writes_keep_index_current() -> Result<()> {
    let dir = tempdir()?;
    let (engine, _) = open(dir.path(), 1 << 20)?;
    let index = KeyDir::new();

    engine.put_indexed(&index, b"a", b"1")?;
    let a2 = engine.put_indexed(&index, b"a", b"2")?;
    engine.put_indexed(&index, b"b", b"1")?;
    let del = engine.delete_indexed(&index, b"b")?;

    assert_eq!(index.live_location(b"a"), Some(a2));
    assert_eq!(index.live_location(b"b"), None);
    let b = index.get(b"b").unwrap();
    assert!(b.is_tombstone());
    assert_eq!(b.location, del);
    assert_eq!(b.seq, 4);
    Ok(())
}

// --------------------- Concurrency ---------------------

#[test]
fn concurrent_writers_get_distinct_locations_and_seqs() -> Result<()> {
    let dir = tempdir()?;
    let (engine, _) = open(dir.path(), 512)?;
    let engine = Arc::new(engine);
    let index = Arc::new(KeyDir::new());

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let engine = Arc::clone(&engine);
            let index = Arc::clone(&index);
            thread::spawn(move || {
                (0..50)
                    .map(|i| {
                        let key = format!("t{t}-k{i}");
                        engine.put_indexed(&index, key.as_bytes(), b"v").unwrap()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut all: Vec<Location> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    all.sort();
    all.dedup();

    assert_eq!(all.len(), 200);
    assert_eq!(engine.last_seq(), 200);

    let mut seqs: Vec<u64> = index.snapshot().into_iter().map(|(_, e)| e.seq).collect();
    seqs.sort_unstable();
    assert_eq!(seqs, (1..=200).collect::<Vec<_>>());
    Ok(())
}

// --------------------- Shutdown ---------------------

#[test]
fn writes_after_shutdown_fail() -> Result<()> {
    let dir = tempdir()?;
    let (engine, _) = open(dir.path(), 1 << 20)?;
    let loc = engine.put(b"k", b"v")?;

    engine.shutdown()?;
    assert!(engine.is_closed());
    assert_eq!(count_segment_files(dir.path()), (1, 0));

    let err = engine.put(b"k", b"v2").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SegmentError>(),
        Some(SegmentError::WriterClosed)
    ));

    // sealed data stays readable, and shutdown is idempotent
    assert_eq!(engine.get(loc)?, ValueState::Live(b"v".to_vec()));
    engine.shutdown()?;
    Ok(())
}

#[test]
fn failed_seal_on_shutdown_is_retried() -> Result<()> {
    let dir = tempdir()?;
    let (engine, _) = open(dir.path(), 1 << 20)?;
    let loc = engine.put(b"k", b"v")?;
    let id = engine.active_segment_id();

    // a non-empty directory under the sealed name makes the rename fail
    let blocker = sealed_path(dir.path(), id);
    fs::create_dir(&blocker)?;
    fs::write(blocker.join("keep"), b"x")?;

    assert!(engine.shutdown().is_err());
    assert!(engine.is_closed());
    assert!(active_path(dir.path(), id).exists());

    let err = engine.put(b"k", b"v2").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SegmentError>(),
        Some(SegmentError::WriterClosed)
    ));

    fs::remove_dir_all(&blocker)?;
    engine.shutdown()?;
    assert!(sealed_path(dir.path(), id).is_file());
    assert!(!active_path(dir.path(), id).exists());
    assert_eq!(engine.get(loc)?, ValueState::Live(b"v".to_vec()));
    drop(engine);

    let (_engine, recovery) = open(dir.path(), 1 << 20)?;
    assert_eq!(recovery.stats.sealed_loaded, 1);
    assert_eq!(recovery.entries.len(), 1);
    Ok(())
}
