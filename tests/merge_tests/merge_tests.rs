//! Tests for merge
//!
//! These tests verify:
//! - Merge keeps exactly the live pairs and drops overwritten/deleted ones
//! - Sources are retired and hint files written for every output
//! - Writes made during or after a merge survive it
//! - Corrupt source records are skipped without losing tombstones
//! - Keys changed while the copy runs keep their newer state
//! - Output planning matches the rotation rule

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;
use std::thread;

use caskkv::error::CaskError;
use caskkv::keydir::{IndexEntry, KeyDir, ShardedKeyDir};
use caskkv::merge::{plan_output_count, Compactor};
use caskkv::record::RecordCodec;
use caskkv::segment::{discover_segment_ids, hint_path, segment_path, SegmentManager};
use caskkv::{Config, Engine};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn config(temp: &TempDir, max_segment_size: u64) -> Config {
    Config::builder()
        .data_dir(temp.path())
        .max_segment_size(max_segment_size)
        .build()
}

fn setup_engine(max_segment_size: u64) -> (TempDir, Engine) {
    let temp = TempDir::new().unwrap();
    let engine = Engine::open(config(&temp, max_segment_size)).unwrap();
    (temp, engine)
}

fn value(i: usize, round: usize) -> Vec<u8> {
    format!("value-{}-round-{}", i, round).into_bytes()
}

fn entry(value_size: u32) -> IndexEntry {
    IndexEntry {
        segment_id: 1,
        offset: 0,
        value_size,
        timestamp: 0,
    }
}

/// Append a value and index it, the way the engine's put does
fn write_value(segments: &SegmentManager, keydir: &dyn KeyDir, key: &[u8], value: &[u8]) {
    let bytes = RecordCodec::default().encode_at(key, value, false, 1).unwrap();
    let (segment_id, offset) = segments.write(&bytes).unwrap();
    keydir.put(
        key.to_vec(),
        IndexEntry {
            segment_id,
            offset,
            value_size: value.len() as u32,
            timestamp: 1,
        },
    );
}

/// Append a tombstone and unindex the key, the way the engine's delete does
fn write_tombstone(segments: &SegmentManager, keydir: &dyn KeyDir, key: &[u8]) {
    let bytes = RecordCodec::default().encode_at(key, b"", true, 2).unwrap();
    segments.write(&bytes).unwrap();
    keydir.delete(key);
}

/// Flip one byte in a segment file behind the engine's back
fn corrupt_byte(temp: &TempDir, segment_id: u32, offset: u64) {
    let path = segment_path(temp.path(), segment_id);
    let mut file = OpenOptions::new().read(true).write(true).open(path).unwrap();
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(offset)).unwrap();
    std::io::Read::read_exact(&mut file, &mut byte).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&[byte[0] ^ 0xFF]).unwrap();
    file.sync_all().unwrap();
}

// =============================================================================
// Correctness Tests
// =============================================================================

#[test]
fn test_merge_keeps_only_live_pairs() {
    let (temp, engine) = setup_engine(512);

    for round in 0..3 {
        for i in 0..50 {
            engine.put(format!("key{}", i).as_bytes(), &value(i, round)).unwrap();
        }
    }
    for i in 40..50 {
        engine.delete(format!("key{}", i).as_bytes()).unwrap();
    }
    let before = engine.segment_count();

    let stats = engine.merge().unwrap();

    assert_eq!(stats.keys_copied, 40);
    assert_eq!(stats.keys_skipped, 0);
    assert_eq!(stats.segments_retired, stats.source_segments);
    assert!(engine.segment_count() < before);
    for i in 0..40 {
        assert_eq!(
            engine.get(format!("key{}", i).as_bytes()).unwrap(),
            Some(value(i, 2))
        );
    }
    for i in 40..50 {
        assert_eq!(engine.get(format!("key{}", i).as_bytes()).unwrap(), None);
    }

    engine.close().unwrap();
    let engine = Engine::open(config(&temp, 512)).unwrap();
    assert_eq!(engine.len(), 40);
    assert_eq!(engine.get(b"key45").unwrap(), None);
}

#[test]
fn test_merge_retires_sources_and_writes_hints() {
    let (temp, engine) = setup_engine(256);
    for i in 0..30 {
        engine.put(format!("key{}", i).as_bytes(), &value(i, 0)).unwrap();
    }
    let sources = discover_segment_ids(temp.path()).unwrap();

    let stats = engine.merge().unwrap();

    let remaining = discover_segment_ids(temp.path()).unwrap();
    for id in &sources {
        assert!(!remaining.contains(id), "source {} still on disk", id);
    }
    assert_eq!(stats.output_segments, remaining.len() - 1);
    for &id in &remaining[..remaining.len() - 1] {
        assert!(hint_path(temp.path(), id).exists(), "no hint for {}", id);
    }
    assert_eq!(*remaining.last().unwrap(), engine.active_segment_id());
}

#[test]
fn test_merge_on_empty_store() {
    let (_temp, engine) = setup_engine(1024);

    let stats = engine.merge().unwrap();

    assert_eq!(stats.keys_copied, 0);
    assert_eq!(stats.output_segments, 0);
    assert!(engine.is_empty());
    engine.put(b"after", b"merge").unwrap();
    assert_eq!(engine.get(b"after").unwrap(), Some(b"merge".to_vec()));
}

#[test]
fn test_merge_twice() {
    let (temp, engine) = setup_engine(256);
    for i in 0..20 {
        engine.put(format!("key{}", i).as_bytes(), &value(i, 0)).unwrap();
    }

    engine.merge().unwrap();
    for i in 0..10 {
        engine.put(format!("key{}", i).as_bytes(), &value(i, 1)).unwrap();
    }
    engine.merge().unwrap();

    for i in 0..20 {
        let expected = if i < 10 { value(i, 1) } else { value(i, 0) };
        assert_eq!(engine.get(format!("key{}", i).as_bytes()).unwrap(), Some(expected));
    }

    engine.close().unwrap();
    let engine = Engine::open(config(&temp, 256)).unwrap();
    assert_eq!(engine.len(), 20);
    assert_eq!(engine.get(b"key3").unwrap(), Some(value(3, 1)));
}

#[test]
fn test_writes_after_merge_win_on_reopen() {
    let (temp, engine) = setup_engine(256);
    engine.put(b"key", b"old").unwrap();
    engine.put(b"doomed", b"x").unwrap();
    engine.merge().unwrap();

    engine.put(b"key", b"new").unwrap();
    engine.delete(b"doomed").unwrap();
    engine.close().unwrap();

    let engine = Engine::open(config(&temp, 256)).unwrap();
    assert_eq!(engine.get(b"key").unwrap(), Some(b"new".to_vec()));
    assert_eq!(engine.get(b"doomed").unwrap(), None);
}

#[test]
fn test_merge_with_concurrent_writer() {
    let (temp, engine) = setup_engine(1024);
    for i in 0..200 {
        engine.put(format!("key{}", i).as_bytes(), &value(i, 0)).unwrap();
    }
    let engine = Arc::new(engine);

    let writer = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            for i in 0..200 {
                engine.put(format!("key{}", i).as_bytes(), &value(i, 1)).unwrap();
            }
        })
    };
    let stats = engine.merge().unwrap();
    writer.join().unwrap();

    assert_eq!(stats.keys_skipped, 0);
    for i in 0..200 {
        assert_eq!(
            engine.get(format!("key{}", i).as_bytes()).unwrap(),
            Some(value(i, 1))
        );
    }

    let engine = Arc::try_unwrap(engine).ok().unwrap();
    engine.close().unwrap();
    let engine = Engine::open(config(&temp, 1024)).unwrap();
    assert_eq!(engine.len(), 200);
    assert_eq!(engine.get(b"key123").unwrap(), Some(value(123, 1)));
}

#[test]
fn test_key_changed_during_copy_keeps_newer_state() {
    let temp = TempDir::new().unwrap();
    let segments = SegmentManager::open(temp.path(), 1024, false).unwrap();
    let keydir = ShardedKeyDir::new(4);
    write_value(&segments, &keydir, b"keep", b"v1");
    write_value(&segments, &keydir, b"gone", b"v1");
    write_value(&segments, &keydir, b"changed", b"v1");

    let snapshot: Vec<(Vec<u8>, IndexEntry)> = keydir.iter().collect();
    let reserved = plan_output_count(&snapshot, segments.max_segment_size());
    let window = segments.seal_for_merge(reserved).unwrap();
    let output = Compactor::new(&segments, &window).copy(snapshot).unwrap();

    // Both land after the copy read the snapshot, before the outputs exist
    write_tombstone(&segments, &keydir, b"gone");
    write_value(&segments, &keydir, b"changed", b"v2");

    let published = output.publish().unwrap();
    assert_eq!(published.relocations.len(), 3);
    let retired = published
        .install(&segments, &keydir, &window.sources)
        .unwrap();

    assert_eq!(retired, window.sources.len());
    assert_eq!(keydir.get(b"gone"), None);
    let keep = keydir.get(b"keep").unwrap();
    assert!(window.output_ids.contains(&keep.segment_id));
    let changed = keydir.get(b"changed").unwrap();
    assert_eq!(changed.segment_id, segments.active_id());
    assert_eq!(
        segments.read(changed.segment_id, changed.offset).unwrap().value,
        b"v2"
    );

    segments.close().unwrap();
    drop(segments);

    let engine = Engine::open(config(&temp, 1024)).unwrap();
    assert_eq!(engine.get(b"gone").unwrap(), None);
    assert_eq!(engine.get(b"changed").unwrap(), Some(b"v2".to_vec()));
    assert_eq!(engine.get(b"keep").unwrap(), Some(b"v1".to_vec()));
    assert_eq!(engine.len(), 2);
}

#[test]
fn test_merge_rejected_when_read_only() {
    let temp = TempDir::new().unwrap();
    {
        let engine = Engine::open(config(&temp, 1024)).unwrap();
        engine.put(b"k", b"v").unwrap();
        engine.close().unwrap();
    }

    let mut cfg = config(&temp, 1024);
    cfg.read_only = true;
    let engine = Engine::open(cfg).unwrap();

    assert!(matches!(engine.merge(), Err(CaskError::ReadOnlyViolation)));
    assert!(!engine.is_merging());
}

// =============================================================================
// Failure Handling Tests
// =============================================================================

#[test]
fn test_corrupt_source_record_is_skipped_and_source_kept() {
    // 21 header + 1 key + 50 value = 72 bytes: one record per segment
    let (temp, engine) = setup_engine(100);
    engine.put(b"a", &[b'a'; 50]).unwrap();
    engine.put(b"b", &[b'b'; 50]).unwrap();
    engine.put(b"c", &[b'c'; 50]).unwrap();
    assert_eq!(engine.segment_count(), 3);

    corrupt_byte(&temp, 2, 40);
    let stats = engine.merge().unwrap();

    assert_eq!(stats.source_segments, 3);
    assert_eq!(stats.keys_copied, 2);
    assert_eq!(stats.keys_skipped, 1);
    assert_eq!(stats.segments_retired, 2);
    assert!(!engine.is_merging());

    // 3 holds no tombstone and "c" moved out of it, so only 2 stays
    assert!(!segment_path(temp.path(), 1).exists());
    assert!(segment_path(temp.path(), 2).exists());
    assert!(!segment_path(temp.path(), 3).exists());

    assert_eq!(engine.get(b"a").unwrap(), Some(vec![b'a'; 50]));
    assert_eq!(engine.get(b"c").unwrap(), Some(vec![b'c'; 50]));
    assert!(matches!(
        engine.get(b"b"),
        Err(CaskError::ChecksumMismatch { .. })
    ));

    // The damaged segment is reported again, not fatal, on the next open
    engine.close().unwrap();
    let engine = Engine::open(config(&temp, 100)).unwrap();
    let report = engine.recovery_report();
    assert_eq!(report.corrupt_segments.len(), 1);
    assert_eq!(report.corrupt_segments[0].segment_id, 2);
    assert_eq!(engine.get(b"a").unwrap(), Some(vec![b'a'; 50]));
    assert_eq!(engine.get(b"c").unwrap(), Some(vec![b'c'; 50]));
}

#[test]
fn test_repeated_merges_after_corruption_stay_bounded() {
    // 72-byte records at a 100-byte limit: one record per segment
    let (temp, engine) = setup_engine(100);
    for key in [b"a", b"b", b"c", b"d", b"e"] {
        engine.put(key, &[key[0]; 50]).unwrap();
    }
    assert_eq!(engine.segment_count(), 5);
    corrupt_byte(&temp, 2, 40);

    let mut counts = Vec::new();
    for _ in 0..5 {
        let stats = engine.merge().unwrap();
        assert_eq!(stats.keys_copied, 4);
        assert_eq!(stats.keys_skipped, 1);
        counts.push(engine.segment_count());
    }

    // The damaged segment, four outputs and the active segment
    assert_eq!(counts, vec![6; 5]);
    assert_eq!(discover_segment_ids(temp.path()).unwrap().len(), 6);
    assert!(segment_path(temp.path(), 2).exists());

    engine.close().unwrap();
    let engine = Engine::open(config(&temp, 100)).unwrap();
    let report = engine.recovery_report();
    assert_eq!(report.corrupt_segments.len(), 1);
    assert_eq!(report.corrupt_segments[0].segment_id, 2);
    for key in [b"a", b"c", b"d", b"e"] {
        assert_eq!(engine.get(key).unwrap(), Some(vec![key[0]; 50]));
    }
}

#[test]
fn test_merge_flag_cleared_after_merge() {
    let (_temp, engine) = setup_engine(1024);
    engine.put(b"k", b"v").unwrap();

    engine.merge().unwrap();

    assert!(!engine.is_merging());
    engine.merge().unwrap();
}

#[test]
fn test_merge_leaves_no_temp_files() {
    let (temp, engine) = setup_engine(256);
    for i in 0..30 {
        engine.put(format!("key{}", i).as_bytes(), &value(i, 0)).unwrap();
    }

    engine.merge().unwrap();

    let leftovers: Vec<_> = fs::read_dir(temp.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().map_or(false, |ext| ext == "tmp"))
        .collect();
    assert!(leftovers.is_empty(), "{:?}", leftovers);
}

// =============================================================================
// Planning Tests
// =============================================================================

#[test]
fn test_plan_output_count() {
    // Each record: 21 + 4 + 25 = 50 bytes
    let snapshot: Vec<(Vec<u8>, IndexEntry)> =
        (0..5).map(|i| (format!("key{}", i).into_bytes(), entry(25))).collect();

    assert_eq!(plan_output_count(&[], 100), 0);
    assert_eq!(plan_output_count(&snapshot, 100), 3);
    assert_eq!(plan_output_count(&snapshot, 250), 1);
    assert_eq!(plan_output_count(&snapshot, 10), 5);
}
