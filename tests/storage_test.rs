use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bookie::ledger::{
    BookieStorage, DeletedLedgers, Entry, EntryEnvelope, ErrorKind, LedgerDeletionSource,
    LedgerStorage, NoDeletions, StorageError, StorageOptions, LAST_ADD_CONFIRMED,
};
use bytes::Bytes;
use tempfile::TempDir;

fn options(temp: &TempDir) -> StorageOptions {
    StorageOptions::builder()
        .journal_dir(temp.path().join("journal"))
        .ledger_dirs(vec![temp.path().join("ledgers0"), temp.path().join("ledgers1")])
        .build()
}

fn start(options: StorageOptions, deletion: Arc<dyn LedgerDeletionSource>) -> BookieStorage {
    let storage = BookieStorage::new(options, deletion);
    storage.start().unwrap();
    storage
}

fn create_storage(temp: &TempDir) -> BookieStorage {
    start(options(temp), Arc::new(NoDeletions))
}

fn envelope(ledger_id: u64, entry_id: i64, lac: i64, key: &[u8], body: &[u8]) -> Bytes {
    EntryEnvelope::builder()
        .ledger_id(ledger_id)
        .entry_id(entry_id)
        .last_add_confirmed(lac)
        .master_key(Bytes::copy_from_slice(key))
        .body(Bytes::copy_from_slice(body))
        .build()
        .encode()
}

fn body_of(stored: Bytes) -> Bytes {
    Entry::decode(stored).unwrap().body
}

#[test]
fn test_ledger_42_scenario() {
    let temp = TempDir::new().unwrap();
    let storage = create_storage(&temp);

    storage.set_master_key(42, b"k").unwrap();
    assert_eq!(storage.add_entry(envelope(42, 0, 0, b"k", b"A")).unwrap(), 0);
    assert_eq!(storage.add_entry(envelope(42, 1, 1, b"k", b"B")).unwrap(), 1);

    assert_eq!(body_of(storage.get_entry(42, 0).unwrap()), "A");
    assert_eq!(body_of(storage.get_entry(42, 1).unwrap()), "B");
    assert_eq!(storage.get_last_add_confirmed(42).unwrap(), 1);

    let stored = Entry::decode(storage.get_entry(42, 1).unwrap()).unwrap();
    assert_eq!((stored.ledger_id, stored.entry_id), (42, 1));
}

#[test]
fn test_unknown_ledger_7() {
    let temp = TempDir::new().unwrap();
    let storage = create_storage(&temp);

    let err = storage.read_master_key(7).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoSuchLedger);
    let err = storage.get_entry(7, 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoSuchLedger);

    assert!(!storage.ledger_exists(7).unwrap());
    assert!(storage.get_last_add_confirmed(7).is_err());
    assert!(storage.set_fenced(7).is_err());
}

#[test]
fn test_entries_readable_before_any_flush() {
    let temp = TempDir::new().unwrap();
    let storage = create_storage(&temp);

    for ledger_id in 1..=3u64 {
        storage
            .add_entry(envelope(ledger_id, 0, -1, b"k", b"first"))
            .unwrap();
        storage
            .add_entry(envelope(ledger_id, 1, 0, b"k", b"second"))
            .unwrap();
    }
    for ledger_id in 1..=3u64 {
        assert_eq!(body_of(storage.get_entry(ledger_id, 0).unwrap()), "first");
        assert_eq!(body_of(storage.get_entry(ledger_id, 1).unwrap()), "second");
        assert_eq!(
            body_of(storage.get_entry(ledger_id, LAST_ADD_CONFIRMED).unwrap()),
            "second"
        );
    }
    assert!(storage.status().buffered_bytes > 0);
}

#[test]
fn test_entries_readable_after_flush_and_checkpoint() {
    let temp = TempDir::new().unwrap();
    let storage = create_storage(&temp);

    storage.add_entry(envelope(1, 0, -1, b"k", b"A")).unwrap();
    storage.flush().unwrap();
    assert_eq!(storage.status().buffered_bytes, 0);
    assert_eq!(body_of(storage.get_entry(1, 0).unwrap()), "A");

    storage.add_entry(envelope(1, 1, 0, b"k", b"B")).unwrap();
    let checkpoint = storage.new_checkpoint().unwrap();
    let outcome = storage.checkpoint(checkpoint).unwrap();
    assert_eq!(outcome.mark, checkpoint.mark());
    assert_eq!(body_of(storage.get_entry(1, 1).unwrap()), "B");
}

#[test]
fn test_missing_entry_is_not_found() {
    let temp = TempDir::new().unwrap();
    let storage = create_storage(&temp);
    storage.add_entry(envelope(1, 0, -1, b"k", b"A")).unwrap();

    let err = storage.get_entry(1, 5).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoSuchEntry);
    assert!(err.is_not_found());
    assert!(!err.is_storage_failure());
}

#[test]
fn test_master_key_is_immutable() {
    let temp = TempDir::new().unwrap();
    let storage = create_storage(&temp);

    storage.set_master_key(5, b"k1").unwrap();
    storage.set_master_key(5, b"k1").unwrap();
    let err = storage.set_master_key(5, b"k2").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
    assert!(err.is_policy_rejection());
    assert_eq!(storage.read_master_key(5).unwrap(), Bytes::from_static(b"k1"));

    let err = storage
        .add_entry(envelope(5, 0, -1, b"k2", b"A"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
    assert!(storage.add_entry(envelope(5, 0, -1, b"k1", b"A")).is_ok());
}

#[test]
fn test_first_entry_establishes_master_key() {
    let temp = TempDir::new().unwrap();
    let storage = create_storage(&temp);

    storage.add_entry(envelope(8, 0, -1, b"writer", b"A")).unwrap();
    assert!(storage.ledger_exists(8).unwrap());
    assert_eq!(
        storage.read_master_key(8).unwrap(),
        Bytes::from_static(b"writer")
    );
}

#[test]
fn test_fencing_is_terminal() {
    let temp = TempDir::new().unwrap();
    {
        let storage = create_storage(&temp);
        storage.set_master_key(9, b"k").unwrap();
        storage.add_entry(envelope(9, 0, -1, b"k", b"A")).unwrap();

        assert!(!storage.is_fenced(9).unwrap());
        assert!(storage.set_fenced(9).unwrap());
        assert!(!storage.set_fenced(9).unwrap());

        let err = storage.add_entry(envelope(9, 1, 0, b"k", b"B")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LedgerFenced);
        assert!(err.is_policy_rejection());
        assert!(storage.get_entry(9, 0).is_ok());
        // Simulated crash: no checkpoint, no shutdown.
    }

    let storage = create_storage(&temp);
    assert!(storage.is_fenced(9).unwrap());
    let err = storage.add_entry(envelope(9, 1, 0, b"k", b"B")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LedgerFenced);
    assert!(storage.set_master_key(9, b"k").is_ok());
}

#[test]
fn test_fencing_is_seen_by_concurrent_writers() {
    let temp = TempDir::new().unwrap();
    let storage = Arc::new(create_storage(&temp));
    storage.set_master_key(1, b"k").unwrap();

    let writers: Vec<_> = (0..4i64)
        .map(|writer| {
            let storage = storage.clone();
            thread::spawn(move || {
                let mut accepted = Vec::new();
                for n in 0..50i64 {
                    let entry_id = n * 4 + writer;
                    match storage.add_entry(envelope(1, entry_id, -1, b"k", b"x")) {
                        Ok(id) => accepted.push(id),
                        Err(err) => {
                            assert_eq!(err.kind(), ErrorKind::LedgerFenced);
                            break;
                        }
                    }
                }
                accepted
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(5));
    assert!(storage.set_fenced(1).unwrap());
    let err = storage.add_entry(envelope(1, 1000, -1, b"k", b"x")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LedgerFenced);

    let accepted: Vec<i64> = writers
        .into_iter()
        .flat_map(|writer| writer.join().unwrap())
        .collect();
    for entry_id in accepted {
        assert!(storage.get_entry(1, entry_id).is_ok());
    }
    assert!(storage.get_entry(1, 1000).unwrap_err().is_not_found());
}

/// Every third write carries a stale confirmation.
fn straggling_lac(entry_id: i64, round: i64) -> i64 {
    if round % 3 == 0 { entry_id / 2 } else { entry_id - 1 }
}

#[test]
fn test_lac_is_monotonic_under_concurrent_writers() {
    let temp = TempDir::new().unwrap();
    let storage = Arc::new(create_storage(&temp));
    storage.set_master_key(1, b"k").unwrap();

    let writers: Vec<_> = (0..4i64)
        .map(|writer| {
            let storage = storage.clone();
            thread::spawn(move || {
                for n in 0..100i64 {
                    let entry_id = n * 4 + writer;
                    let lac = straggling_lac(entry_id, n);
                    storage
                        .add_entry(envelope(1, entry_id, lac, b"k", b"x"))
                        .unwrap();
                }
            })
        })
        .collect();

    let reader = {
        let storage = storage.clone();
        thread::spawn(move || {
            let mut last = -1;
            for _ in 0..2000 {
                let lac = storage.get_last_add_confirmed(1).unwrap();
                assert!(lac >= last, "LAC went back from {} to {}", last, lac);
                last = lac;
            }
        })
    };

    for writer in writers {
        writer.join().unwrap();
    }
    reader.join().unwrap();
    let expected = (0..4i64)
        .flat_map(|writer| (0..100i64).map(move |n| straggling_lac(n * 4 + writer, n)))
        .max()
        .unwrap();
    assert_eq!(storage.get_last_add_confirmed(1).unwrap(), expected);
}

#[test]
fn test_concurrent_ledgers_read_their_writes() {
    let temp = TempDir::new().unwrap();
    let storage = Arc::new(create_storage(&temp));

    let handles: Vec<_> = (1..=8u64)
        .map(|ledger_id| {
            let storage = storage.clone();
            thread::spawn(move || {
                for entry_id in 0..100i64 {
                    let body = format!("{}:{}", ledger_id, entry_id);
                    storage
                        .add_entry(envelope(
                            ledger_id,
                            entry_id,
                            entry_id - 1,
                            b"k",
                            body.as_bytes(),
                        ))
                        .unwrap();
                    let stored = storage.get_entry(ledger_id, entry_id).unwrap();
                    assert_eq!(body_of(stored), body);
                    if entry_id % 25 == 0 {
                        storage.flush().unwrap();
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for ledger_id in 1..=8u64 {
        assert_eq!(storage.get_last_add_confirmed(ledger_id).unwrap(), 98);
        let info = storage.ledger_info(ledger_id).unwrap();
        assert_eq!(info.last_entry_id, Some(99));
    }
}

#[test]
fn test_crash_recovery_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let bodies: Vec<(u64, i64, String)> = (1..=3u64)
        .flat_map(|ledger_id| {
            (0..20i64).map(move |entry_id| (ledger_id, entry_id, format!("{}-{}", ledger_id, entry_id)))
        })
        .collect();

    {
        let storage = create_storage(&temp);
        for (ledger_id, entry_id, body) in &bodies {
            storage
                .add_entry(envelope(*ledger_id, *entry_id, entry_id - 1, b"k", body.as_bytes()))
                .unwrap();
            if *entry_id == 10 {
                // Part of the data reaches the entry log without moving the mark.
                storage.flush().unwrap();
            }
        }
        // Simulated crash before any checkpoint completes.
    }

    let snapshot = |storage: &BookieStorage| {
        let mut ledgers = Vec::new();
        let mut entries = Vec::new();
        for ledger_id in 1..=3u64 {
            let info = storage.ledger_info(ledger_id).unwrap();
            ledgers.push((ledger_id, info.last_add_confirmed, info.last_entry_id));
            for entry_id in 0..20i64 {
                entries.push(storage.get_entry(ledger_id, entry_id).unwrap());
            }
            assert!(storage.get_entry(ledger_id, 20).unwrap_err().is_not_found());
        }
        (ledgers, entries, storage.status().ledgers)
    };

    let first = {
        let storage = create_storage(&temp);
        snapshot(&storage)
        // Crash again: the same journal is replayed on the next start.
    };
    let second = {
        let storage = create_storage(&temp);
        let state = snapshot(&storage);
        storage.shutdown().unwrap();
        state
    };
    let third = snapshot(&create_storage(&temp));

    assert_eq!(first, second);
    assert_eq!(second, third);
    assert_eq!(first.2, 3);
    assert_eq!(first.0[0], (1, 18, Some(19)));
    for ((ledger_id, entry_id, body), stored) in bodies.iter().zip(&first.1) {
        let entry = Entry::decode(stored.clone()).unwrap();
        assert_eq!((entry.ledger_id, entry.entry_id), (*ledger_id, *entry_id));
        assert_eq!(entry.body, body.as_str());
    }
}

#[test]
fn test_shutdown_then_restart_needs_no_replay() {
    let temp = TempDir::new().unwrap();
    {
        let storage = create_storage(&temp);
        storage.add_entry(envelope(1, 0, 0, b"k", b"A")).unwrap();
        storage.shutdown().unwrap();
        assert_eq!(
            storage.get_entry(1, 0).unwrap_err().kind(),
            ErrorKind::Interrupted
        );
    }

    let storage = BookieStorage::new(options(&temp), Arc::new(NoDeletions));
    let stats = storage.start_with_stats().unwrap();
    assert_eq!(stats.entries_replayed, 0);
    assert_eq!(body_of(storage.get_entry(1, 0).unwrap()), "A");
}

#[test]
fn test_malformed_envelope_is_invalid_request() {
    let temp = TempDir::new().unwrap();
    let storage = create_storage(&temp);

    let err = storage
        .add_entry(Bytes::from_static(b"too short"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    assert!(!err.is_not_found());
    assert!(!err.is_policy_rejection());
}

#[test]
fn test_foreign_directory_is_refused() {
    let temp = TempDir::new().unwrap();
    create_storage(&temp).shutdown().unwrap();

    let other = TempDir::new().unwrap();
    create_storage(&other).shutdown().unwrap();

    let mut mixed = options(&temp);
    mixed.ledger_dirs[1] = other.path().join("ledgers1");
    let storage = BookieStorage::new(mixed, Arc::new(NoDeletions));
    let err = storage.start().unwrap_err();
    assert!(matches!(err, StorageError::CookieMismatch { .. }));
    assert!(err.is_storage_failure());
}

mod lac_wait {
    use super::*;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_one_write_triggers_exactly_one_notification() {
        let temp = TempDir::new().unwrap();
        let storage = create_storage(&temp);
        storage.add_entry(envelope(1, 0, 0, b"k", b"A")).unwrap();

        let mut watch = storage.wait_for_last_add_confirmed_update(1, 0).unwrap();
        assert_eq!(watch.try_recv().unwrap(), None);

        storage.add_entry(envelope(1, 1, 1, b"k", b"B")).unwrap();
        assert_eq!(watch.try_recv().unwrap(), Some(1));
        // The watch is spent; no second notification can arrive.
        assert!(watch.try_recv().is_err());

        storage.add_entry(envelope(1, 2, 2, b"k", b"C")).unwrap();
        assert!(watch.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_late_subscriber_is_notified_immediately() {
        let temp = TempDir::new().unwrap();
        let storage = create_storage(&temp);
        storage.add_entry(envelope(1, 0, 0, b"k", b"A")).unwrap();
        storage.add_entry(envelope(1, 1, 1, b"k", b"B")).unwrap();

        let watch = storage.wait_for_last_add_confirmed_update(1, 0).unwrap();
        let lac = timeout(WAIT, watch).await.unwrap().unwrap();
        assert_eq!(lac, 1);
    }

    #[tokio::test]
    async fn test_awaiting_a_future_write() {
        let temp = TempDir::new().unwrap();
        let storage = Arc::new(create_storage(&temp));
        storage.set_master_key(1, b"k").unwrap();
        assert_eq!(storage.get_last_add_confirmed(1).unwrap(), -1);

        let watch = storage.wait_for_last_add_confirmed_update(1, -1).unwrap();
        let writer = {
            let storage = storage.clone();
            tokio::task::spawn_blocking(move || {
                storage.add_entry(envelope(1, 0, 0, b"k", b"A")).unwrap();
            })
        };

        assert_eq!(timeout(WAIT, watch).await.unwrap().unwrap(), 0);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_multiple_waiters_with_different_thresholds() {
        let temp = TempDir::new().unwrap();
        let storage = create_storage(&temp);
        storage.add_entry(envelope(1, 0, 0, b"k", b"A")).unwrap();

        let mut near = storage.wait_for_last_add_confirmed_update(1, 0).unwrap();
        let mut also_near = storage.wait_for_last_add_confirmed_update(1, 0).unwrap();
        let mut far = storage.wait_for_last_add_confirmed_update(1, 1).unwrap();

        storage.add_entry(envelope(1, 1, 1, b"k", b"B")).unwrap();
        assert_eq!(near.try_recv().unwrap(), Some(1));
        assert_eq!(also_near.try_recv().unwrap(), Some(1));
        assert_eq!(far.try_recv().unwrap(), None);

        storage.add_entry(envelope(1, 2, 2, b"k", b"C")).unwrap();
        assert_eq!(far.try_recv().unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_stale_confirmation_does_not_notify() {
        let temp = TempDir::new().unwrap();
        let storage = create_storage(&temp);
        storage.add_entry(envelope(1, 0, 3, b"k", b"A")).unwrap();

        let mut watch = storage.wait_for_last_add_confirmed_update(1, 3).unwrap();
        storage.add_entry(envelope(1, 1, 2, b"k", b"B")).unwrap();
        assert_eq!(watch.try_recv().unwrap(), None);
        assert_eq!(storage.get_last_add_confirmed(1).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_watch_is_never_notified() {
        let temp = TempDir::new().unwrap();
        let storage = create_storage(&temp);
        storage.add_entry(envelope(1, 0, 0, b"k", b"A")).unwrap();

        let watch = storage.wait_for_last_add_confirmed_update(1, 0).unwrap();
        watch.cancel();
        let dropped = storage.wait_for_last_add_confirmed_update(1, 0).unwrap();
        drop(dropped);

        storage.add_entry(envelope(1, 1, 1, b"k", b"B")).unwrap();
        assert_eq!(storage.get_last_add_confirmed(1).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_waiters() {
        let temp = TempDir::new().unwrap();
        let storage = create_storage(&temp);
        storage.add_entry(envelope(1, 0, 0, b"k", b"A")).unwrap();

        let watch = storage.wait_for_last_add_confirmed_update(1, 0).unwrap();
        storage.shutdown().unwrap();
        let err = timeout(WAIT, watch).await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Interrupted);
    }

    #[test]
    fn test_blocking_wait_from_another_thread() {
        let temp = TempDir::new().unwrap();
        let storage = Arc::new(create_storage(&temp));
        storage.set_master_key(1, b"k").unwrap();

        let watch = storage.wait_for_last_add_confirmed_update(1, -1).unwrap();
        let waiter = thread::spawn(move || watch.blocking_recv());
        storage.add_entry(envelope(1, 0, 0, b"k", b"A")).unwrap();
        assert_eq!(waiter.join().unwrap().unwrap(), 0);
    }

    #[test]
    fn test_unknown_ledger_cannot_be_watched() {
        let temp = TempDir::new().unwrap();
        let storage = create_storage(&temp);
        let err = storage
            .wait_for_last_add_confirmed_update(7, -1)
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::NoSuchLedger);
    }
}

mod gc {
    use super::*;

    fn gc_options(temp: &TempDir) -> StorageOptions {
        StorageOptions::builder()
            .journal_dir(temp.path().join("journal"))
            .ledger_dirs(vec![temp.path().join("ledgers")])
            .entry_log_size_limit(4096)
            .compaction_threshold(0.6)
            .build()
    }

    fn body(ledger_id: u64, entry_id: i64) -> Vec<u8> {
        let mut body = format!("{}/{}:", ledger_id, entry_id).into_bytes();
        body.resize(400, b'.');
        body
    }

    /// Interleave two ledgers so they share every segment. A flush writes
    /// buffered entries in ledger order, so flush after each pair.
    fn fill(storage: &BookieStorage) {
        for entry_id in 0..30i64 {
            for ledger_id in [1u64, 2] {
                storage
                    .add_entry(envelope(
                        ledger_id,
                        entry_id,
                        entry_id - 1,
                        b"k",
                        &body(ledger_id, entry_id),
                    ))
                    .unwrap();
            }
            storage.flush().unwrap();
        }
        storage
            .checkpoint(storage.new_checkpoint().unwrap())
            .unwrap();
    }

    #[test]
    fn test_deleted_ledger_is_unreachable_and_neighbours_survive() {
        let temp = TempDir::new().unwrap();
        let deleted = Arc::new(DeletedLedgers::new());
        let storage = start(gc_options(&temp), deleted.clone());
        fill(&storage);
        assert!(storage.status().active_segment.unwrap() > 1);

        deleted.mark_deleted(1);
        let stats = storage.reclaim_disk_space().unwrap();
        assert_eq!(stats.ledgers_deleted, 1);
        assert!(stats.segments_deleted > 0);
        assert!(stats.entries_relocated > 0);
        assert!(stats.bytes_reclaimed > 0);

        for entry_id in 0..30i64 {
            assert!(storage.get_entry(1, entry_id).unwrap_err().is_not_found());
            let stored = storage.get_entry(2, entry_id).unwrap();
            assert_eq!(body_of(stored), body(2, entry_id));
        }
        assert!(!storage.ledger_exists(1).unwrap());
        assert_eq!(storage.get_last_add_confirmed(2).unwrap(), 28);

        let again = storage.reclaim_disk_space().unwrap();
        assert_eq!(again.ledgers_deleted, 0);
        for entry_id in 0..30i64 {
            assert_eq!(
                body_of(storage.get_entry(2, entry_id).unwrap()),
                body(2, entry_id)
            );
        }
    }

    #[test]
    fn test_gc_results_survive_restart() {
        let temp = TempDir::new().unwrap();
        let deleted = Arc::new(DeletedLedgers::new());
        {
            let storage = start(gc_options(&temp), deleted.clone());
            fill(&storage);
            deleted.mark_deleted(1);
            storage.reclaim_disk_space().unwrap();
            storage.shutdown().unwrap();
        }

        let storage = start(gc_options(&temp), deleted);
        for entry_id in 0..30i64 {
            assert!(storage.get_entry(1, entry_id).is_err());
            assert_eq!(
                body_of(storage.get_entry(2, entry_id).unwrap()),
                body(2, entry_id)
            );
        }
    }

    #[test]
    fn test_fence_and_key_survive_compaction_and_index_rebuild() {
        let temp = TempDir::new().unwrap();
        let deleted = Arc::new(DeletedLedgers::new());
        {
            let storage = start(gc_options(&temp), deleted.clone());
            fill(&storage);
            assert!(storage.set_fenced(2).unwrap());
            deleted.mark_deleted(1);
            storage.reclaim_disk_space().unwrap();
            storage.shutdown().unwrap();
        }
        // The next clean run truncates the journal records of the fence and key.
        start(gc_options(&temp), deleted.clone()).shutdown().unwrap();
        std::fs::remove_dir_all(gc_options(&temp).index_dir()).unwrap();

        let storage = BookieStorage::new(gc_options(&temp), deleted);
        let stats = storage.start_with_stats().unwrap();
        assert!(stats.rebuilt_index);
        assert_eq!(stats.records_replayed, 0);

        assert!(storage.is_fenced(2).unwrap());
        assert_eq!(storage.read_master_key(2).unwrap(), Bytes::from_static(b"k"));
        for entry_id in 0..30i64 {
            assert_eq!(
                body_of(storage.get_entry(2, entry_id).unwrap()),
                body(2, entry_id)
            );
        }
        let err = storage
            .add_entry(envelope(2, 30, 29, b"other", b"x"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        let err = storage
            .add_entry(envelope(2, 30, 29, b"k", b"x"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LedgerFenced);
    }

    #[test]
    fn test_buffered_entries_of_deleted_ledger_are_dropped() {
        let temp = TempDir::new().unwrap();
        let deleted = Arc::new(DeletedLedgers::new());
        let storage = start(gc_options(&temp), deleted.clone());
        storage.add_entry(envelope(1, 0, -1, b"k", b"A")).unwrap();
        storage.add_entry(envelope(2, 0, -1, b"k", b"B")).unwrap();

        deleted.mark_deleted(1);
        storage.reclaim_disk_space().unwrap();

        assert_eq!(
            storage.get_entry(1, 0).unwrap_err().kind(),
            ErrorKind::NoSuchLedger
        );
        assert_eq!(body_of(storage.get_entry(2, 0).unwrap()), "B");
        assert_eq!(storage.status().metrics.gc_runs, 1);
    }
}
