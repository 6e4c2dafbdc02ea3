//! Advisory file locking scoped to a file path
//!
//! Two levels of protection compose here:
//!
//! 1. **In-process**: a process-wide registry keyed by lock path tracks the
//!    current holder(s), their thread identity, and the lock mode. Shared
//!    locks refcount across threads; an incompatible second acquisition on
//!    the same thread is reported as a potential deadlock and fails
//!    immediately.
//! 2. **Cross-process**: a sidecar file at `<target>.lock` is held with the
//!    OS's native advisory lock for the requested mode. The sidecar body
//!    stores the owner's PID, thread hash and mode, for diagnostics only.
//!
//! The last releaser unlocks the sidecar, closes it, and removes the file.
//! `FileLock` is a scoped guard: it releases on all exit paths, including
//! unwinding.

use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use fs2::FileExt;
use hashbrown::HashMap;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, warn};

use crate::error::{StoreError, StoreResult};

/// Default wait limit for `WaitStrategy::Timeout` callers that do not pick
/// their own.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between contention probes while the registry mutex is released.
const PROBE_INTERVAL: Duration = Duration::from_millis(5);

/// Lock modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Single writer, no other holders allowed
    Exclusive,
    /// Multiple concurrent readers
    Shared,
}

impl LockMode {
    fn label(self) -> &'static str {
        match self {
            LockMode::Exclusive => "EXCLUSIVE",
            LockMode::Shared => "SHARED",
        }
    }
}

/// What to do when the lock is contended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStrategy {
    /// Block indefinitely
    Standard,
    /// Fail immediately if any incompatible holder exists
    Instantly,
    /// Block up to the given duration, then fail
    Timeout(Duration),
}

/// Registry entry for one held lock path.
struct LockInfo {
    /// Open sidecar handle; holds the OS lock while alive
    file: File,
    mode: LockMode,
    /// Threads currently holding a reference (duplicates allowed for
    /// re-acquired shared locks)
    threads: Vec<ThreadId>,
    /// Shared-mode reference count
    refcount: usize,
}

/// Process-wide lock registry, keyed by the sidecar path string.
fn registry() -> &'static Mutex<HashMap<String, LockInfo>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, LockInfo>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// `<target>.lock`
fn sidecar_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".lock");
    PathBuf::from(os)
}

/// Scoped advisory lock on a file path.
pub struct FileLock {
    /// Path the caller asked to lock (for error context)
    target: PathBuf,
    /// Sidecar path
    lock_path: PathBuf,
    /// Registry key (sidecar path as a string)
    key: String,
    released: bool,
}

impl FileLock {
    /// Acquire with the default strategy: timeout after five seconds.
    pub fn acquire(path: &Path, mode: LockMode) -> StoreResult<Self> {
        Self::acquire_with(path, mode, WaitStrategy::Timeout(DEFAULT_LOCK_TIMEOUT))
    }

    /// Acquire an advisory lock on `path` with an explicit wait strategy.
    pub fn acquire_with(path: &Path, mode: LockMode, strategy: WaitStrategy) -> StoreResult<Self> {
        let lock_path = sidecar_path(path);
        let key = lock_path.to_string_lossy().into_owned();
        let me = thread::current().id();

        if let Some(parent) = lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| StoreError::io(parent, e, "creating lock file directory"))?;
            }
        }

        let mut table = registry().lock();

        // Resolve in-process contention first.
        let wait_started = Instant::now();
        loop {
            match table.get_mut(&key) {
                None => break,
                Some(info) => {
                    if mode == LockMode::Shared && info.mode == LockMode::Shared {
                        info.refcount += 1;
                        info.threads.push(me);
                        debug!(
                            path = %path.display(),
                            refcount = info.refcount,
                            "joined shared advisory lock"
                        );
                        return Ok(FileLock {
                            target: path.to_path_buf(),
                            lock_path,
                            key,
                            released: false,
                        });
                    }
                    if info.threads.contains(&me) {
                        error!(
                            path = %path.display(),
                            "incompatible re-acquisition on the owning thread"
                        );
                        return Err(StoreError::Deadlock { path: path.to_path_buf() });
                    }
                    match strategy {
                        WaitStrategy::Instantly => {
                            warn!(path = %path.display(), "lock held by another thread");
                            return Err(StoreError::LockTimeout { path: path.to_path_buf() });
                        }
                        WaitStrategy::Timeout(limit) if wait_started.elapsed() >= limit => {
                            warn!(path = %path.display(), "timed out waiting for in-process lock");
                            return Err(StoreError::LockTimeout { path: path.to_path_buf() });
                        }
                        _ => {}
                    }
                }
            }
            pause(&mut table);
        }

        // No in-process holder; take the OS lock on the sidecar.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&lock_path)
            .map_err(|e| StoreError::io(&lock_path, e, "opening lock file"))?;

        match strategy {
            WaitStrategy::Standard => {
                let locked = match mode {
                    LockMode::Exclusive => file.lock_exclusive(),
                    LockMode::Shared => file.lock_shared(),
                };
                locked.map_err(|e| StoreError::io(&lock_path, e, "acquiring OS lock"))?;
            }
            WaitStrategy::Instantly => {
                let locked = match mode {
                    LockMode::Exclusive => file.try_lock_exclusive(),
                    LockMode::Shared => fs2::FileExt::try_lock_shared(&file),
                };
                if let Err(err) = locked {
                    return if err.kind() == io::ErrorKind::WouldBlock {
                        warn!(path = %path.display(), "lock held by another process");
                        Err(StoreError::LockTimeout { path: path.to_path_buf() })
                    } else {
                        Err(StoreError::io(&lock_path, err, "acquiring OS lock"))
                    };
                }
            }
            WaitStrategy::Timeout(limit) => {
                let os_started = Instant::now();
                loop {
                    let locked = match mode {
                        LockMode::Exclusive => file.try_lock_exclusive(),
                        LockMode::Shared => fs2::FileExt::try_lock_shared(&file),
                    };
                    match locked {
                        Ok(()) => break,
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                            if os_started.elapsed() >= limit {
                                warn!(path = %path.display(), "timed out waiting for OS lock");
                                return Err(StoreError::LockTimeout {
                                    path: path.to_path_buf(),
                                });
                            }
                            pause(&mut table);
                        }
                        Err(err) => {
                            return Err(StoreError::io(&lock_path, err, "acquiring OS lock"))
                        }
                    }
                }
            }
        }

        // Diagnostic body; a write failure here does not invalidate the lock.
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        me.hash(&mut hasher);
        let body = format!(
            "PID: {} ThreadID: {} Mode: {}\n",
            std::process::id(),
            hasher.finish(),
            mode.label()
        );
        if let Err(err) = write_sidecar_body(&file, body.as_bytes()) {
            warn!(
                path = %lock_path.display(),
                %err,
                "could not record diagnostics in lock file"
            );
        }

        // A second shared waiter can register the path while this thread
        // polls the OS lock; join its entry rather than clobber it. An
        // incompatible entry cannot appear, the OS lock would have blocked.
        if let Some(info) = table.get_mut(&key) {
            if mode == LockMode::Shared && info.mode == LockMode::Shared {
                let _ = file.unlock();
                info.refcount += 1;
                info.threads.push(me);
                return Ok(FileLock {
                    target: path.to_path_buf(),
                    lock_path,
                    key,
                    released: false,
                });
            }
        }

        table.insert(
            key.clone(),
            LockInfo {
                file,
                mode,
                threads: vec![me],
                refcount: 1,
            },
        );

        debug!(path = %path.display(), mode = mode.label(), "acquired advisory lock");
        Ok(FileLock {
            target: path.to_path_buf(),
            lock_path,
            key,
            released: false,
        })
    }

    /// Whether this guard still holds its reference.
    pub fn is_locked(&self) -> bool {
        !self.released
    }

    /// Release this reference. The last releaser drops the OS lock and
    /// removes the sidecar file. Only the acquiring thread may release.
    pub fn release(&mut self) -> StoreResult<()> {
        if self.released {
            return Ok(());
        }
        let me = thread::current().id();
        let mut table = registry().lock();

        let info = match table.get_mut(&self.key) {
            Some(info) => info,
            None => {
                warn!(path = %self.target.display(), "releasing an unregistered lock");
                self.released = true;
                return Ok(());
            }
        };

        if !info.threads.contains(&me) {
            error!(path = %self.target.display(), "lock released from a non-owning thread");
            return Err(StoreError::Io {
                path: Some(self.target.clone()),
                kind: io::ErrorKind::Other,
                message: "advisory lock released from a thread that does not hold it".to_string(),
            });
        }

        if info.mode == LockMode::Shared && info.refcount > 1 {
            info.refcount -= 1;
            if let Some(pos) = info.threads.iter().position(|t| *t == me) {
                info.threads.remove(pos);
            }
            debug!(
                path = %self.target.display(),
                refcount = info.refcount,
                "left shared advisory lock"
            );
            self.released = true;
            return Ok(());
        }

        if let Err(err) = info.file.unlock() {
            error!(path = %self.lock_path.display(), %err, "could not release OS lock");
            return Err(StoreError::io(&self.lock_path, err, "releasing OS lock"));
        }
        // Closes the sidecar descriptor.
        table.remove(&self.key);

        if let Err(err) = fs::remove_file(&self.lock_path) {
            // The lock itself is gone; a leftover sidecar is only cosmetic.
            warn!(path = %self.lock_path.display(), %err, "could not remove lock file");
        }

        debug!(path = %self.target.display(), "released advisory lock");
        self.released = true;
        Ok(())
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.release();
        }
    }
}

/// Briefly release the registry so other threads can make progress, then
/// reacquire it.
fn pause(table: &mut MutexGuard<'_, HashMap<String, LockInfo>>) {
    MutexGuard::unlocked(table, || thread::sleep(PROBE_INTERVAL));
}

fn write_sidecar_body(mut file: &File, body: &[u8]) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(body)
}
