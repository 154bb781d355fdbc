//! Tests for Recovery
//!
//! These tests verify:
//! - Reopen restores puts and deletes, last writer wins across segments
//! - Torn tails are truncated and later writes survive another reopen
//! - Interior corruption is reported but does not fail the open
//! - Hint files give the same keydir as a full scan
//! - Recovering twice gives the same result

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};

use caskkv::keydir;
use caskkv::record::RecordCodec;
use caskkv::recovery::recover;
use caskkv::segment::{discover_segment_ids, hint_path, segment_path, SegmentManager};
use caskkv::{Config, Engine, IndexKind};
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

fn open(temp: &TempDir, max_segment_size: u64) -> Engine {
    Engine::open(config(temp, max_segment_size)).unwrap()
}

/// Every live pair, sorted, for comparing two opens
fn contents(engine: &Engine) -> BTreeMap<Vec<u8>, Vec<u8>> {
    engine
        .fold(BTreeMap::new(), |mut map, key, value| {
            map.insert(key.to_vec(), value.to_vec());
            map
        })
        .unwrap()
}

fn append_raw(temp: &TempDir, segment_id: u32, bytes: &[u8]) {
    let mut file = OpenOptions::new()
        .append(true)
        .open(segment_path(temp.path(), segment_id))
        .unwrap();
    file.write_all(bytes).unwrap();
    file.sync_all().unwrap();
}

fn flip_byte(temp: &TempDir, segment_id: u32, offset: u64) {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(segment_path(temp.path(), segment_id))
        .unwrap();
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(offset)).unwrap();
    std::io::Read::read_exact(&mut file, &mut byte).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&[!byte[0]]).unwrap();
    file.sync_all().unwrap();
}

// =============================================================================
// Replay Tests
// =============================================================================

#[test]
fn test_reopen_restores_puts_and_deletes() {
    let temp = TempDir::new().unwrap();
    {
        let engine = open(&temp, 1024);
        engine.put(b"k1", b"v1").unwrap();
        engine.put(b"k2", b"v2").unwrap();
        engine.put(b"k1", b"v1-new").unwrap();
        engine.delete(b"k2").unwrap();
        engine.put(b"k3", b"").unwrap();
        engine.close().unwrap();
    }

    let engine = open(&temp, 1024);

    assert_eq!(engine.get(b"k1").unwrap(), Some(b"v1-new".to_vec()));
    assert_eq!(engine.get(b"k2").unwrap(), None);
    assert_eq!(engine.get(b"k3").unwrap(), Some(Vec::new()));
    assert_eq!(engine.len(), 2);

    let report = engine.recovery_report();
    assert_eq!(report.segments_scanned, 1);
    assert_eq!(report.records_applied, 5);
    assert!(!report.tail_truncated);
}

#[test]
fn test_last_writer_wins_across_segments() {
    let temp = TempDir::new().unwrap();
    {
        let engine = open(&temp, 64);
        for round in 0..5 {
            engine
                .put(b"shared", format!("round{}", round).as_bytes())
                .unwrap();
            engine.put(format!("filler{}", round).as_bytes(), b"x").unwrap();
        }
        assert!(engine.segment_count() > 1);
        engine.close().unwrap();
    }

    let engine = open(&temp, 64);

    assert_eq!(engine.get(b"shared").unwrap(), Some(b"round4".to_vec()));
}

#[test]
fn test_tombstone_in_later_segment_hides_value() {
    let temp = TempDir::new().unwrap();
    {
        let engine = open(&temp, 64);
        engine.put(b"gone", b"value").unwrap();
        for i in 0..5 {
            engine.put(format!("filler{}", i).as_bytes(), b"xxxxxxxx").unwrap();
        }
        engine.delete(b"gone").unwrap();
        engine.close().unwrap();
    }

    let engine = open(&temp, 64);

    assert_eq!(engine.get(b"gone").unwrap(), None);
    assert!(!engine.list_keys().contains(&b"gone".to_vec()));
}

#[test]
fn test_recover_directly_into_keydir() {
    let temp = TempDir::new().unwrap();
    {
        let manager = SegmentManager::open(temp.path(), 1024, false).unwrap();
        let codec = RecordCodec::default();
        manager.write(&codec.encode(b"a", b"1", false).unwrap()).unwrap();
        manager.write(&codec.encode(b"b", b"2", false).unwrap()).unwrap();
        manager.write(&codec.encode(b"a", b"", true).unwrap()).unwrap();
        manager.close().unwrap();
    }

    let manager = SegmentManager::open(temp.path(), 1024, false).unwrap();
    let kd = keydir::build(IndexKind::Ordered, 0).unwrap();
    let report = recover(&manager, kd.as_ref()).unwrap();

    assert_eq!(report.records_applied, 3);
    assert_eq!(kd.keys(), vec![b"b".to_vec()]);
    assert_eq!(kd.get(b"b").unwrap().offset, 23);
}

// =============================================================================
// Damage Handling Tests
// =============================================================================

#[test]
fn test_torn_tail_is_truncated() {
    let temp = TempDir::new().unwrap();
    let good_len = {
        let engine = open(&temp, 1024);
        engine.put(b"k1", b"v1").unwrap();
        engine.put(b"k2", b"v2").unwrap();
        engine.close().unwrap();
        fs::metadata(segment_path(temp.path(), 1)).unwrap().len()
    };
    let partial = RecordCodec::default().encode(b"k3", b"never made it", false).unwrap();
    append_raw(&temp, 1, &partial[..partial.len() - 3]);

    let engine = open(&temp, 1024);

    assert!(engine.recovery_report().tail_truncated);
    assert_eq!(engine.get(b"k1").unwrap(), Some(b"v1".to_vec()));
    assert_eq!(engine.get(b"k2").unwrap(), Some(b"v2".to_vec()));
    assert_eq!(engine.get(b"k3").unwrap(), None);
    assert_eq!(
        fs::metadata(segment_path(temp.path(), 1)).unwrap().len(),
        good_len
    );

    // Writes after the truncation are visible on the next open
    engine.put(b"k4", b"v4").unwrap();
    engine.close().unwrap();

    let engine = open(&temp, 1024);
    assert!(!engine.recovery_report().tail_truncated);
    assert_eq!(engine.get(b"k4").unwrap(), Some(b"v4".to_vec()));
    assert_eq!(engine.len(), 3);
}

#[test]
fn test_torn_tail_left_alone_when_read_only() {
    let temp = TempDir::new().unwrap();
    {
        let engine = open(&temp, 1024);
        engine.put(b"k1", b"v1").unwrap();
        engine.close().unwrap();
    }
    append_raw(&temp, 1, &[0xAB; 7]);
    let torn_len = fs::metadata(segment_path(temp.path(), 1)).unwrap().len();

    let mut cfg = config(&temp, 1024);
    cfg.read_only = true;
    let engine = Engine::open(cfg).unwrap();

    assert!(engine.recovery_report().tail_truncated);
    assert_eq!(engine.get(b"k1").unwrap(), Some(b"v1".to_vec()));
    assert_eq!(
        fs::metadata(segment_path(temp.path(), 1)).unwrap().len(),
        torn_len
    );
}

#[test]
fn test_interior_corruption_is_reported_not_fatal() {
    let temp = TempDir::new().unwrap();
    {
        // 21 + 2 + 50 = 73 bytes per record: one record per segment
        let engine = open(&temp, 100);
        engine.put(b"k1", &[1u8; 50]).unwrap();
        engine.put(b"k2", &[2u8; 50]).unwrap();
        engine.put(b"k3", &[3u8; 50]).unwrap();
        engine.close().unwrap();
    }
    flip_byte(&temp, 1, 30);

    let engine = open(&temp, 100);
    let report = engine.recovery_report();

    assert_eq!(report.corrupt_segments.len(), 1);
    assert_eq!(report.corrupt_segments[0].segment_id, 1);
    assert_eq!(report.corrupt_segments[0].offset, 0);
    assert!(!report.tail_truncated);
    assert_eq!(engine.get(b"k1").unwrap(), None);
    assert_eq!(engine.get(b"k2").unwrap(), Some(vec![2u8; 50]));
    assert_eq!(engine.get(b"k3").unwrap(), Some(vec![3u8; 50]));
}

#[test]
fn test_orphaned_merge_output_is_ignored() {
    let temp = TempDir::new().unwrap();
    {
        let engine = open(&temp, 1024);
        engine.put(b"k", b"live").unwrap();
        engine.close().unwrap();
    }
    // A merge that died before publishing leaves only temporaries
    let stale = RecordCodec::default().encode(b"k", b"stale", false).unwrap();
    let orphan = temp.path().join("0000000005.data.tmp");
    fs::write(&orphan, &stale).unwrap();

    let engine = open(&temp, 1024);

    assert!(!orphan.exists());
    assert_eq!(engine.get(b"k").unwrap(), Some(b"live".to_vec()));
    assert_eq!(discover_segment_ids(temp.path()).unwrap(), vec![1]);
}

// =============================================================================
// Hint Path Tests
// =============================================================================

#[test]
fn test_hint_path_matches_scan_path() {
    let temp = TempDir::new().unwrap();
    {
        let engine = open(&temp, 256);
        for i in 0..40 {
            engine.put(format!("key{}", i).as_bytes(), format!("v{}", i).as_bytes()).unwrap();
        }
        for i in 0..10 {
            engine.delete(format!("key{}", i).as_bytes()).unwrap();
        }
        engine.merge().unwrap();
        engine.put(b"key39", b"after-merge").unwrap();
        engine.close().unwrap();
    }

    let with_hints = {
        let engine = open(&temp, 256);
        assert!(engine.recovery_report().hints_loaded > 0);
        let snapshot = contents(&engine);
        engine.close().unwrap();
        snapshot
    };

    for id in discover_segment_ids(temp.path()).unwrap() {
        let _ = fs::remove_file(hint_path(temp.path(), id));
    }

    let engine = open(&temp, 256);
    assert_eq!(engine.recovery_report().hints_loaded, 0);
    assert_eq!(contents(&engine), with_hints);
    assert_eq!(with_hints.len(), 30);
    assert_eq!(with_hints[&b"key39".to_vec()], b"after-merge".to_vec());
}

#[test]
fn test_invalid_hint_falls_back_to_scan() {
    let temp = TempDir::new().unwrap();
    {
        let engine = open(&temp, 1024);
        engine.put(b"a", b"1").unwrap();
        engine.put(b"b", b"2").unwrap();
        engine.merge().unwrap();
        engine.close().unwrap();
    }
    let hinted: Vec<u32> = discover_segment_ids(temp.path())
        .unwrap()
        .into_iter()
        .filter(|&id| hint_path(temp.path(), id).exists())
        .collect();
    assert_eq!(hinted.len(), 1);
    fs::write(hint_path(temp.path(), hinted[0]), b"garbage").unwrap();

    let engine = open(&temp, 1024);

    assert_eq!(engine.recovery_report().hints_loaded, 0);
    assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(engine.get(b"b").unwrap(), Some(b"2".to_vec()));
}

// =============================================================================
// Idempotence Tests
// =============================================================================

#[test]
fn test_recovery_is_idempotent() {
    let temp = TempDir::new().unwrap();
    {
        let engine = open(&temp, 128);
        for i in 0..25 {
            engine.put(format!("k{}", i % 7).as_bytes(), format!("v{}", i).as_bytes()).unwrap();
        }
        engine.delete(b"k3").unwrap();
        engine.close().unwrap();
    }

    let first = {
        let engine = open(&temp, 128);
        let snapshot = contents(&engine);
        engine.close().unwrap();
        snapshot
    };
    let second = {
        let engine = open(&temp, 128);
        let snapshot = contents(&engine);
        engine.close().unwrap();
        snapshot
    };

    assert_eq!(first, second);
    assert_eq!(first.len(), 6);
    assert!(!first.contains_key(&b"k3".to_vec()));
}
