//! End-to-end crash and recovery scenarios.
//!
//! Crashes are simulated with `std::mem::forget`: the store's destructor
//! (snapshotter shutdown + final snapshot) never runs, leaving the data
//! directory exactly as an abrupt termination would.

use std::fs;
use std::mem;
use std::sync::Arc;
use std::thread;

use tempfile::TempDir;

use octet_core::{Config, OctetStore};

const JOURNAL: &str = "octet-operations.journal";
const SNAPSHOT: &str = "octet-data.snapshot";

// ---------------------------------------------------------------------------
// Clean shutdown
// ---------------------------------------------------------------------------

#[test]
fn test_basic_durability() {
    let dir = TempDir::new().unwrap();

    let id = {
        let store = OctetStore::open(dir.path(), Config::default()).unwrap();
        store.insert(b"hello").unwrap()
    };

    let store = OctetStore::open(dir.path(), Config::default()).unwrap();
    assert_eq!(store.get(&id), Some(b"hello".to_vec()));
}

#[test]
fn test_clean_shutdown_leaves_snapshot_and_checkpoint() {
    let dir = TempDir::new().unwrap();
    {
        let store = OctetStore::open(dir.path(), Config::default()).unwrap();
        store.insert(b"payload").unwrap();
    }

    assert!(dir.path().join(SNAPSHOT).exists());
    let journal = fs::read_to_string(dir.path().join(JOURNAL)).unwrap();
    assert!(journal.contains("CHECKPOINT|"));
}

// ---------------------------------------------------------------------------
// Crash recovery
// ---------------------------------------------------------------------------

#[test]
fn test_journal_only_recovery() {
    let dir = TempDir::new().unwrap();

    let store = OctetStore::open(dir.path(), Config::default()).unwrap();
    let u1 = store.insert(b"a").unwrap();
    let u2 = store.insert(b"b").unwrap();
    let u3 = store.insert(b"c").unwrap();

    // No snapshot may exist yet; the journal alone carries the state.
    assert!(!dir.path().join(SNAPSHOT).exists());
    mem::forget(store);

    let reopened = OctetStore::open(dir.path(), Config::default()).unwrap();
    assert_eq!(reopened.get(&u1), Some(b"a".to_vec()));
    assert_eq!(reopened.get(&u2), Some(b"b".to_vec()));
    assert_eq!(reopened.get(&u3), Some(b"c".to_vec()));
    assert_eq!(reopened.entries_count(), 3);
    mem::forget(reopened);
}

#[test]
fn test_post_checkpoint_replay() {
    let dir = TempDir::new().unwrap();

    let store = OctetStore::open(dir.path(), Config::default()).unwrap();
    let ux = store.insert(b"x").unwrap();
    store.create_snapshot().unwrap();
    let uy = store.insert(b"y").unwrap();
    mem::forget(store);

    let reopened = OctetStore::open(dir.path(), Config::default()).unwrap();
    assert_eq!(reopened.get(&ux), Some(b"x".to_vec()));
    assert_eq!(reopened.get(&uy), Some(b"y".to_vec()));
    assert_eq!(reopened.entries_count(), 2);
    mem::forget(reopened);
}

#[test]
fn test_crash_discards_unjournaled_nothing() {
    // Everything journaled before the crash must come back, including
    // updates and removes.
    let dir = TempDir::new().unwrap();

    let store = OctetStore::open(dir.path(), Config::default()).unwrap();
    let keep = store.insert(b"keep").unwrap();
    let drop_me = store.insert(b"drop").unwrap();
    store.update(&keep, b"kept-v2").unwrap();
    store.remove(&drop_me).unwrap();
    mem::forget(store);

    let reopened = OctetStore::open(dir.path(), Config::default()).unwrap();
    assert_eq!(reopened.get(&keep), Some(b"kept-v2".to_vec()));
    assert_eq!(reopened.get(&drop_me), None);
    assert_eq!(reopened.entries_count(), 1);
    mem::forget(reopened);
}

#[test]
fn test_stranded_snapshot() {
    // A crash between snapshot write and checkpoint append leaves a snapshot
    // with no matching CHECKPOINT line. Recovery keeps the snapshot state
    // and logs a warning.
    let dir = TempDir::new().unwrap();

    let store = OctetStore::open(dir.path(), Config::default()).unwrap();
    let ux = store.insert(b"x").unwrap();
    store.create_snapshot().unwrap();
    mem::forget(store);

    // Remove only the final CHECKPOINT line from the journal.
    let journal_path = dir.path().join(JOURNAL);
    let content = fs::read_to_string(&journal_path).unwrap();
    let mut lines: Vec<&str> = content.lines().collect();
    assert!(lines.last().unwrap().starts_with("CHECKPOINT|"));
    lines.pop();
    let mut truncated = lines.join("\n");
    truncated.push('\n');
    fs::write(&journal_path, truncated).unwrap();

    let reopened = OctetStore::open(dir.path(), Config::default()).unwrap();
    assert_eq!(reopened.get(&ux), Some(b"x".to_vec()));
    assert_eq!(reopened.entries_count(), 1);
    mem::forget(reopened);
}

#[test]
fn test_corrupt_journal_line_is_absorbed() {
    let dir = TempDir::new().unwrap();

    let journal = "\
# OCTET Journal Format v1.0
INSERT|00000000-0000-4000-8000-0000000000aa|2025-01-31T14:05:09.123Z|one
GARBAGE LINE
INSERT|00000000-0000-4000-8000-0000000000bb|2025-01-31T14:05:09.124Z|two
";
    fs::write(dir.path().join(JOURNAL), journal).unwrap();

    let store = OctetStore::open(dir.path(), Config::default()).unwrap();
    assert_eq!(store.entries_count(), 2);
    assert_eq!(
        store.get("00000000-0000-4000-8000-0000000000aa"),
        Some(b"one".to_vec())
    );
    assert_eq!(
        store.get("00000000-0000-4000-8000-0000000000bb"),
        Some(b"two".to_vec())
    );
}

#[test]
fn test_corrupt_snapshot_falls_back_to_journal() {
    let dir = TempDir::new().unwrap();

    let store = OctetStore::open(dir.path(), Config::default()).unwrap();
    let id = store.insert(b"resilient").unwrap();
    store.create_snapshot().unwrap();
    mem::forget(store);

    // Truncate the snapshot mid-record.
    let snapshot_path = dir.path().join(SNAPSHOT);
    let bytes = fs::read(&snapshot_path).unwrap();
    fs::write(&snapshot_path, &bytes[..bytes.len() / 2]).unwrap();

    // The snapshot is rejected whole; the journal still carries everything
    // from the beginning.
    let reopened = OctetStore::open(dir.path(), Config::default()).unwrap();
    assert_eq!(reopened.get(&id), Some(b"resilient".to_vec()));
    mem::forget(reopened);
}

#[test]
fn test_binary_values_survive_recovery() {
    let dir = TempDir::new().unwrap();

    let every_byte: Vec<u8> = (0u16..=255).map(|b| b as u8).collect();
    let tricky = b"pipe | backslash \\ lf \n cr \r mixed \\| end".to_vec();

    let store = OctetStore::open(dir.path(), Config::default()).unwrap();
    let id_bytes = store.insert(&every_byte).unwrap();
    let id_tricky = store.insert(&tricky).unwrap();
    store.create_snapshot().unwrap();
    let id_after = store.insert(&tricky).unwrap();
    mem::forget(store);

    // id_bytes and id_tricky come back through the snapshot, id_after
    // through journal replay; both paths must preserve every byte.
    let reopened = OctetStore::open(dir.path(), Config::default()).unwrap();
    assert_eq!(reopened.get(&id_bytes), Some(every_byte));
    assert_eq!(reopened.get(&id_tricky), Some(tricky.clone()));
    assert_eq!(reopened.get(&id_after), Some(tricky));
    mem::forget(reopened);
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[test]
fn test_concurrent_writers() {
    const THREADS: usize = 20;
    const INSERTS_PER_THREAD: usize = 30;

    let dir = TempDir::new().unwrap();
    let store = Arc::new(OctetStore::open(dir.path(), Config::default()).unwrap());

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let mut pairs = Vec::with_capacity(INSERTS_PER_THREAD);
                for i in 0..INSERTS_PER_THREAD {
                    let payload = format!("thread-{}-value-{}", t, i).into_bytes();
                    let id = store.insert(&payload).unwrap();
                    pairs.push((id, payload));
                }
                pairs
            })
        })
        .collect();

    let mut all_pairs = Vec::new();
    for handle in handles {
        all_pairs.extend(handle.join().unwrap());
    }

    assert_eq!(store.entries_count(), THREADS * INSERTS_PER_THREAD);
    for (id, payload) in &all_pairs {
        assert_eq!(store.get(id).as_ref(), Some(payload));
    }
}

#[test]
fn test_concurrent_writers_recover() {
    const THREADS: usize = 8;
    const INSERTS_PER_THREAD: usize = 25;

    let dir = TempDir::new().unwrap();
    let store = Arc::new(OctetStore::open(dir.path(), Config::default()).unwrap());

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                (0..INSERTS_PER_THREAD)
                    .map(|i| {
                        let payload = format!("t{}-i{}", t, i).into_bytes();
                        (store.insert(&payload).unwrap(), payload)
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut all_pairs = Vec::new();
    for handle in handles {
        all_pairs.extend(handle.join().unwrap());
    }
    drop(store);

    let reopened = OctetStore::open(dir.path(), Config::default()).unwrap();
    assert_eq!(reopened.entries_count(), THREADS * INSERTS_PER_THREAD);
    for (id, payload) in &all_pairs {
        assert_eq!(reopened.get(id).as_ref(), Some(payload));
    }
}
