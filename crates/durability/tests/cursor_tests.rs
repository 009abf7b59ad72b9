//! Log cursor tests
//!
//! Positioning semantics of every cursor operation, across segment
//! boundaries, plus the closed-cursor and concurrent-reader contracts.

use std::sync::Arc;

use stratalog_core::{Error, Lsn, RecordType};
use stratalog_durability::{CursorOp, LogConfig, LogStore, SEGMENT_HEADER_SIZE};
use tempfile::TempDir;

/// Small segments so a handful of records spans several files.
fn small_config() -> LogConfig {
    LogConfig::new()
        .with_segment_size(1024)
        .with_max_record_size(256)
}

fn store_with_records(count: u64) -> (TempDir, Arc<LogStore>, Vec<Lsn>) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(LogStore::open(dir.path(), small_config()).unwrap());
    let lsns = (0..count)
        .map(|i| {
            store
                .append(Some(i), RecordType::Update, &i.to_le_bytes().repeat(20))
                .unwrap()
        })
        .collect();
    (dir, store, lsns)
}

// ============================================================================
// Forward and backward traversal
// ============================================================================

#[test]
fn test_next_walks_every_record_across_segments() {
    let (_dir, store, lsns) = store_with_records(25);
    assert!(store.segment_numbers().len() > 1);

    let mut cursor = store.cursor();
    let mut seen = Vec::new();
    loop {
        match cursor.get(CursorOp::Next) {
            Ok(record) => seen.push(record.lsn),
            Err(e) => {
                assert!(e.is_not_found());
                break;
            }
        }
    }
    assert_eq!(seen, lsns);
}

#[test]
fn test_prev_walks_every_record_backwards() {
    let (_dir, store, lsns) = store_with_records(25);

    let mut cursor = store.cursor();
    let mut seen = Vec::new();
    while let Ok(record) = cursor.get(CursorOp::Prev) {
        seen.push(record.lsn);
    }
    seen.reverse();
    assert_eq!(seen, lsns);
}

#[test]
fn test_first_and_last() {
    let (_dir, store, lsns) = store_with_records(10);
    let mut cursor = store.cursor();

    let first = cursor.get(CursorOp::First).unwrap();
    assert_eq!(first.lsn, lsns[0]);
    assert_eq!(first.txn_id, Some(0));

    let last = cursor.get(CursorOp::Last).unwrap();
    assert_eq!(last.lsn, *lsns.last().unwrap());
    assert_eq!(last.txn_id, Some(9));
}

#[test]
fn test_prev_at_first_record_is_not_found_and_keeps_position() {
    let (_dir, store, lsns) = store_with_records(3);
    let mut cursor = store.cursor();

    cursor.get(CursorOp::First).unwrap();
    let err = cursor.get(CursorOp::Prev).unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(cursor.position(), Some(lsns[0]));

    let current = cursor.get(CursorOp::Current).unwrap();
    assert_eq!(current.lsn, lsns[0]);
}

#[test]
fn test_next_at_last_record_is_not_found() {
    let (_dir, store, lsns) = store_with_records(3);
    let mut cursor = store.cursor();

    cursor.get(CursorOp::Last).unwrap();
    assert!(cursor.get(CursorOp::Next).unwrap_err().is_not_found());
    assert_eq!(cursor.position(), Some(lsns[2]));
}

// ============================================================================
// Positioned reads
// ============================================================================

#[test]
fn test_set_exact_position() {
    let (_dir, store, lsns) = store_with_records(12);
    let mut cursor = store.cursor();

    let record = cursor.get(CursorOp::Set(lsns[7])).unwrap();
    assert_eq!(record.lsn, lsns[7]);
    assert_eq!(record.txn_id, Some(7));

    let next = cursor.get(CursorOp::Next).unwrap();
    assert_eq!(next.lsn, lsns[8]);
    let prev = cursor.get(CursorOp::Prev).unwrap();
    assert_eq!(prev.lsn, lsns[7]);
}

#[test]
fn test_set_outside_log_is_not_found() {
    let (_dir, store, _lsns) = store_with_records(3);
    let mut cursor = store.cursor();

    assert!(cursor.get(CursorOp::Set(store.end_lsn())).unwrap_err().is_not_found());
    assert!(cursor.get(CursorOp::Set(Lsn::new(99, 0))).unwrap_err().is_not_found());
    assert!(cursor.position().is_none());
}

#[test]
fn test_set_inside_a_record_is_not_found() {
    let (_dir, store, lsns) = store_with_records(3);
    let mut cursor = store.cursor();
    cursor.get(CursorOp::Set(lsns[0])).unwrap();

    let inside = Lsn::new(lsns[1].file, lsns[1].offset + 4);
    assert!(cursor.get(CursorOp::Set(inside)).unwrap_err().is_not_found());
    assert_eq!(cursor.position(), Some(lsns[0]));
}

#[test]
fn test_set_on_damaged_record_is_corrupt() {
    let (_dir, store, lsns) = store_with_records(3);
    let path = store.segment_path(lsns[1]);
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[SEGMENT_HEADER_SIZE + lsns[1].offset as usize + 30] ^= 0xFF;
    std::fs::write(&path, bytes).unwrap();

    let mut cursor = store.cursor();
    assert!(cursor.get(CursorOp::Set(lsns[1])).unwrap_err().is_corrupt());
}

#[test]
fn test_set_range_finds_first_record_at_or_after() {
    let (_dir, store, lsns) = store_with_records(25);
    let mut cursor = store.cursor();

    // Exact hit
    assert_eq!(cursor.get(CursorOp::SetRange(lsns[4])).unwrap().lsn, lsns[4]);

    // Between two records
    let between = Lsn::new(lsns[4].file, lsns[4].offset + 1);
    assert_eq!(cursor.get(CursorOp::SetRange(between)).unwrap().lsn, lsns[5]);

    // Before the log
    assert_eq!(cursor.get(CursorOp::SetRange(Lsn::ZERO)).unwrap().lsn, lsns[0]);

    // Past the end of a segment lands on the next segment's first record
    let last_of_first_segment = lsns.iter().filter(|l| l.file == 1).last().unwrap();
    let past = Lsn::new(1, last_of_first_segment.offset + 1);
    let hit = cursor.get(CursorOp::SetRange(past)).unwrap();
    assert_eq!(hit.lsn, Lsn::new(2, 0));

    // Past the end of the log
    assert!(cursor
        .get(CursorOp::SetRange(store.end_lsn()))
        .unwrap_err()
        .is_not_found());
}

#[test]
fn test_current_on_unpositioned_cursor() {
    let (_dir, store, _lsns) = store_with_records(1);
    let mut cursor = store.cursor();
    assert!(cursor.get(CursorOp::Current).unwrap_err().is_not_found());
}

#[test]
fn test_empty_log() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(LogStore::open(dir.path(), small_config()).unwrap());
    let mut cursor = store.cursor();

    assert!(cursor.get(CursorOp::First).unwrap_err().is_not_found());
    assert!(cursor.get(CursorOp::Last).unwrap_err().is_not_found());
    assert!(cursor.get(CursorOp::Next).unwrap_err().is_not_found());
    assert!(cursor.get(CursorOp::Prev).unwrap_err().is_not_found());
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_closed_cursor_rejects_every_call() {
    let (_dir, store, lsns) = store_with_records(2);
    let mut cursor = store.cursor();
    cursor.get(CursorOp::First).unwrap();
    cursor.close().unwrap();

    assert!(cursor.is_closed());
    for op in [
        CursorOp::First,
        CursorOp::Last,
        CursorOp::Next,
        CursorOp::Prev,
        CursorOp::Current,
        CursorOp::Set(lsns[0]),
        CursorOp::SetRange(lsns[0]),
    ] {
        assert!(matches!(cursor.get(op), Err(Error::InvalidState(_))));
    }
    assert!(matches!(cursor.close(), Err(Error::InvalidState(_))));
}

#[test]
fn test_cursor_sees_records_appended_after_it_was_opened() {
    let (_dir, store, _lsns) = store_with_records(2);
    let mut cursor = store.cursor();
    cursor.get(CursorOp::Last).unwrap();
    assert!(cursor.get(CursorOp::Next).unwrap_err().is_not_found());

    let lsn = store.append(Some(50), RecordType::Update, b"late").unwrap();
    assert_eq!(cursor.get(CursorOp::Next).unwrap().lsn, lsn);
}

#[test]
fn test_concurrent_cursors_and_writer() {
    let (_dir, store, _lsns) = store_with_records(5);

    let writer = {
        let store = Arc::clone(&store);
        std::thread::spawn(move || {
            for i in 0..200u64 {
                store.append(Some(i), RecordType::Update, b"w").unwrap();
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                let mut cursor = store.cursor();
                let mut last = Lsn::ZERO;
                let mut count = 0;
                while let Ok(record) = cursor.get(CursorOp::Next) {
                    assert!(record.lsn > last || count == 0);
                    last = record.lsn;
                    count += 1;
                }
                count
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        assert!(reader.join().unwrap() >= 5);
    }

    let mut cursor = store.cursor();
    let mut total = 0;
    while cursor.get(CursorOp::Next).is_ok() {
        total += 1;
    }
    assert_eq!(total, 205);
}
