//! Storage manager — the heart of the engine
//!
//! `OctetStore` combines the in-memory map with the write-ahead journal, the
//! snapshot file, and a background snapshotter thread.
//!
//! **Read path**: RAM only, under the shared side of an RwLock.
//! **Write path**: journal-first, then RAM. The exclusive map lock spans id
//! generation, journal append, and map mutation, which pins the order of
//! journal entries to the order of visible effects. If the journal append
//! fails, RAM is never modified.
//! **Background**: the snapshotter wakes on request or on a timer, copies the
//! map under a brief shared lock, writes the snapshot atomically, and appends
//! a CHECKPOINT entry.
//!
//! Recovery on open: load the snapshot if one decodes, then replay the
//! journal strictly after the last checkpoint (from the beginning when no
//! snapshot was loaded).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{StoreError, StoreResult};
use crate::fsio;
use crate::ident;
use crate::journal::Journal;
use crate::snapshot;

const SNAPSHOT_FILE_NAME: &str = "octet-data.snapshot";
const JOURNAL_FILE_NAME: &str = "octet-operations.journal";

/// Wait floor for a zero-minute time threshold, so the snapshotter does not
/// spin.
const MIN_SNAPSHOT_WAIT: Duration = Duration::from_millis(200);

#[derive(Default)]
struct WakeState {
    requested: bool,
    shutdown: bool,
}

/// State shared between the public surface and the snapshotter thread.
struct Inner {
    /// The in-memory map; the only read surface
    data: RwLock<HashMap<String, Vec<u8>>>,
    journal: Journal,
    snapshot_path: PathBuf,
    /// Serializes snapshot attempts from user threads and the snapshotter
    snapshot_gate: Mutex<()>,
    /// Snapshotter wake state; independent of the map lock so requests never
    /// block on I/O
    wake: Mutex<WakeState>,
    wake_cond: Condvar,
    ops_since_snapshot: AtomicUsize,
    ops_threshold: AtomicUsize,
    time_threshold_mins: AtomicU64,
    last_snapshot: Mutex<Instant>,
}

impl Inner {
    /// Copy the map under a shared lock, write the snapshot atomically, then
    /// append the CHECKPOINT and reset the counters.
    fn create_snapshot(&self) -> StoreResult<()> {
        // At most one snapshot attempt proceeds at a time; a concurrent
        // caller waits here and then takes its own snapshot.
        let _gate = self.snapshot_gate.lock();
        info!("creating snapshot");

        let copy = { self.data.read().clone() };
        let snapshot_id = ident::generate();

        let encoded = snapshot::encode_map(&copy);
        fsio::atomic_write(&self.snapshot_path, &encoded).map_err(|err| {
            error!(%err, "could not write snapshot file");
            err
        })?;

        self.journal.write_checkpoint(&snapshot_id).map_err(|err| {
            error!(%err, "snapshot written but checkpoint append failed");
            err
        })?;

        self.ops_since_snapshot.store(0, Ordering::Relaxed);
        *self.last_snapshot.lock() = Instant::now();

        info!(snapshot = %snapshot_id, records = copy.len(), "snapshot created");
        Ok(())
    }

    fn request_snapshot_async(&self) {
        let mut wake = self.wake.lock();
        wake.requested = true;
        self.wake_cond.notify_one();
        debug!("asynchronous snapshot requested");
    }

    /// Called after every successful mutation, outside the map lock.
    fn note_operation(&self) {
        let current = self.ops_since_snapshot.fetch_add(1, Ordering::Relaxed) + 1;
        let threshold = self.ops_threshold.load(Ordering::Relaxed);
        if current >= threshold {
            debug!(operations = current, "operation threshold reached, requesting snapshot");
            self.request_snapshot_async();
        }
    }

    fn snapshot_wait(&self) -> Duration {
        let mins = self.time_threshold_mins.load(Ordering::Relaxed);
        if mins == 0 {
            MIN_SNAPSHOT_WAIT
        } else {
            Duration::from_secs(mins * 60)
        }
    }
}

fn run_snapshotter(inner: Arc<Inner>) {
    info!("snapshotter started");

    loop {
        let requested;
        {
            let mut wake = inner.wake.lock();
            if wake.shutdown {
                break;
            }
            if !wake.requested {
                let wait = inner.snapshot_wait();
                let _ = inner.wake_cond.wait_for(&mut wake, wait);
            }
            if wake.shutdown {
                break;
            }
            requested = wake.requested;
            wake.requested = false;
            // The wake mutex is released here so new requests are never
            // blocked behind snapshot I/O.
        }

        let mins = inner.time_threshold_mins.load(Ordering::Relaxed);
        let pending = inner.ops_since_snapshot.load(Ordering::Relaxed);
        let timer_fired = pending > 0
            && inner.last_snapshot.lock().elapsed() >= Duration::from_secs(mins * 60);

        if requested || timer_fired {
            info!(pending, "creating automatic snapshot");
            if let Err(err) = inner.create_snapshot() {
                error!(%err, "automatic snapshot failed");
            }
        }
    }

    info!("snapshotter stopped");
}

/// Persistent, crash-safe key-value store.
///
/// All public methods take `&self`; readers run concurrently under the
/// shared side of the map lock, mutations serialize on the exclusive side.
pub struct OctetStore {
    inner: Arc<Inner>,
    snapshotter: Mutex<Option<thread::JoinHandle<()>>>,
    data_dir: PathBuf,
}

impl OctetStore {
    /// Open or create a store in `dir`.
    ///
    /// Creates the directory (and ancestors) as needed, opens or recreates
    /// the journal, loads the snapshot if one decodes, replays the journal
    /// tail, and starts the snapshotter thread.
    pub fn open<P: AsRef<Path>>(dir: P, config: Config) -> StoreResult<Self> {
        let data_dir = dir.as_ref().to_path_buf();
        info!(dir = %data_dir.display(), "opening store");

        config.validate().map_err(|message| StoreError::Init {
            path: data_dir.clone(),
            message,
        })?;

        fsio::ensure_dir(&data_dir).map_err(|err| StoreError::Init {
            path: data_dir.clone(),
            message: format!("could not create data directory: {}", err),
        })?;

        let journal = Journal::open(data_dir.join(JOURNAL_FILE_NAME))?;
        let snapshot_path = data_dir.join(SNAPSHOT_FILE_NAME);

        let (mut map, snapshot_loaded) = load_snapshot(&snapshot_path);

        let start_after = if snapshot_loaded {
            match journal.last_checkpoint_id() {
                Ok(checkpoint) => checkpoint,
                Err(err) => {
                    warn!(%err, "could not determine last checkpoint, replaying everything");
                    None
                }
            }
        } else {
            None
        };

        match journal.replay(&mut map, start_after.as_deref()) {
            Ok(stats) => {
                info!(applied = stats.applied, "journal tail replayed");
            }
            Err(err) => {
                // Typically the "journal truncated past the snapshot" case;
                // the snapshot state stands on its own.
                warn!(%err, "could not fully restore from journal");
            }
        }
        info!(records = map.len(), "recovery finished");

        let inner = Arc::new(Inner {
            data: RwLock::new(map),
            journal,
            snapshot_path,
            snapshot_gate: Mutex::new(()),
            wake: Mutex::new(WakeState::default()),
            wake_cond: Condvar::new(),
            ops_since_snapshot: AtomicUsize::new(0),
            ops_threshold: AtomicUsize::new(config.snapshot_ops_threshold),
            time_threshold_mins: AtomicU64::new(config.snapshot_time_threshold_mins),
            last_snapshot: Mutex::new(Instant::now()),
        });

        let thread_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("octet-snapshotter".to_string())
            .spawn(move || run_snapshotter(thread_inner))
            .map_err(|err| StoreError::Init {
                path: data_dir.clone(),
                message: format!("could not spawn snapshotter thread: {}", err),
            })?;

        info!(dir = %data_dir.display(), "store opened");
        Ok(Self {
            inner,
            snapshotter: Mutex::new(Some(handle)),
            data_dir,
        })
    }

    /// Store `data` under a freshly generated id and return the id.
    pub fn insert(&self, data: &[u8]) -> StoreResult<String> {
        let id = {
            let mut map = self.inner.data.write();
            let id = ident::generate();
            self.inner.journal.write_insert(&id, data)?;
            map.insert(id.clone(), data.to_vec());
            id
        };
        self.inner.note_operation();
        debug!(id = %id, bytes = data.len(), "inserted record");
        Ok(id)
    }

    /// Value for `id`, or `None` when absent. Absence is not an error.
    pub fn get(&self, id: &str) -> Option<Vec<u8>> {
        let map = self.inner.data.read();
        let value = map.get(id).cloned();
        if value.is_none() {
            debug!(id, "record not found");
        }
        value
    }

    /// Replace the value stored under `id`.
    pub fn update(&self, id: &str, data: &[u8]) -> StoreResult<()> {
        {
            let mut map = self.inner.data.write();
            if !map.contains_key(id) {
                warn!(id, "update of an absent id");
                return Err(StoreError::NotFound { id: id.to_string() });
            }
            self.inner.journal.write_update(id, data)?;
            map.insert(id.to_string(), data.to_vec());
        }
        self.inner.note_operation();
        debug!(id, bytes = data.len(), "updated record");
        Ok(())
    }

    /// Delete the record stored under `id`.
    pub fn remove(&self, id: &str) -> StoreResult<()> {
        {
            let mut map = self.inner.data.write();
            if !map.contains_key(id) {
                warn!(id, "remove of an absent id");
                return Err(StoreError::NotFound { id: id.to_string() });
            }
            self.inner.journal.write_remove(id)?;
            map.remove(id);
        }
        self.inner.note_operation();
        debug!(id, "removed record");
        Ok(())
    }

    /// Write a snapshot now, on the calling thread.
    pub fn create_snapshot(&self) -> StoreResult<()> {
        self.inner.create_snapshot()
    }

    /// Ask the background snapshotter for a snapshot. Never fails;
    /// idempotent between runs of the snapshotter.
    pub fn request_snapshot_async(&self) {
        self.inner.request_snapshot_async();
    }

    /// Number of records currently in the map.
    pub fn entries_count(&self) -> usize {
        self.inner.data.read().len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.inner.data.read().is_empty()
    }

    /// Mutation count after which a snapshot is requested.
    pub fn set_snapshot_ops_threshold(&self, threshold: usize) {
        self.inner.ops_threshold.store(threshold, Ordering::Relaxed);
        info!(threshold, "snapshot operations threshold updated");
    }

    /// Minutes after which accumulated mutations are snapshotted anyway.
    pub fn set_snapshot_time_threshold(&self, minutes: u64) {
        self.inner.time_threshold_mins.store(minutes, Ordering::Relaxed);
        info!(minutes, "snapshot time threshold updated");
    }

    /// Data directory this store lives in.
    pub fn path(&self) -> &Path {
        &self.data_dir
    }
}

impl Drop for OctetStore {
    fn drop(&mut self) {
        info!("shutting down store");

        {
            let mut wake = self.inner.wake.lock();
            wake.shutdown = true;
            self.inner.wake_cond.notify_all();
        }
        if let Some(handle) = self.snapshotter.lock().take() {
            let _ = handle.join();
        }

        // Best effort; a failure here is reported but cannot abort shutdown.
        info!("writing final snapshot");
        if let Err(err) = self.inner.create_snapshot() {
            warn!(%err, "final snapshot failed");
        }

        info!("store shut down");
    }
}

/// Load and decode the snapshot file. Returns the decoded map and whether a
/// snapshot was actually loaded; any failure degrades to an empty map.
fn load_snapshot(snapshot_path: &Path) -> (HashMap<String, Vec<u8>>, bool) {
    if !snapshot_path.exists() {
        info!("no snapshot file, continuing without one");
        return (HashMap::new(), false);
    }

    let bytes = match fsio::safe_read(snapshot_path) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(%err, "could not read snapshot, continuing without it");
            return (HashMap::new(), false);
        }
    };

    match snapshot::decode_map(&bytes) {
        Some(map) => {
            info!(records = map.len(), "snapshot loaded");
            (map, true)
        }
        None => {
            warn!(
                path = %snapshot_path.display(),
                "snapshot is corrupt or truncated, relying on the journal alone"
            );
            (HashMap::new(), false)
        }
    }
}
