//! Crash-safe file primitives
//!
//! Every durable structure in the engine is maintained through four
//! operations: atomic whole-file replacement (temp file + rename), locked
//! append with fsync, locked whole-file read, and timestamped backups.
//! Writers follow the same sequence throughout: write, sync the file, rename,
//! sync the parent directory.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::Local;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::durability::{durable_sync, sync_dir};
use crate::error::{StoreError, StoreResult};
use crate::flock::{FileLock, LockMode};

/// Create `dir` and any missing ancestors. Fails if the path exists but is
/// not a directory.
pub fn ensure_dir(dir: &Path) -> StoreResult<()> {
    if dir.exists() {
        if dir.is_dir() {
            return Ok(());
        }
        return Err(StoreError::Io {
            path: Some(dir.to_path_buf()),
            kind: std::io::ErrorKind::AlreadyExists,
            message: "path exists but is not a directory".to_string(),
        });
    }
    fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e, "creating directory"))?;
    info!(path = %dir.display(), "created directory");
    Ok(())
}

/// Random 8-char alphanumeric tag for temp file names.
fn random_tag() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

/// `<path>.tmp.<8 random alphanumerics>`, in the same directory as `path`,
/// regenerated until the name is unused.
fn temp_path(path: &Path) -> PathBuf {
    loop {
        let mut os = path.as_os_str().to_os_string();
        os.push(format!(".tmp.{}", random_tag()));
        let candidate = PathBuf::from(os);
        if !candidate.exists() {
            return candidate;
        }
    }
}

/// `<path>.backup.<yyyymmdd_hhmmss_ms>`, guaranteed unused. Collisions only
/// happen at millisecond granularity, so probe again after a short sleep.
fn backup_path(path: &Path) -> PathBuf {
    loop {
        let now = Local::now();
        let stamp = format!("{}_{}", now.format("%Y%m%d_%H%M%S"), now.timestamp_subsec_millis());
        let mut os = path.as_os_str().to_os_string();
        os.push(format!(".backup.{}", stamp));
        let candidate = PathBuf::from(os);
        if !candidate.exists() {
            return candidate;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

/// Atomically replace the contents of `path` with `data`.
///
/// Holds an exclusive advisory lock on `path` for the duration. The data is
/// written to a same-directory temp file, synced, and renamed over the
/// destination. If the filesystem rejects the atomic replacement, the
/// destination is backed up, removed and the rename retried; on a second
/// failure the destination is restored from the backup. The parent directory
/// is fsynced last.
pub fn atomic_write(path: &Path, data: &[u8]) -> StoreResult<()> {
    debug!(path = %path.display(), bytes = data.len(), "atomic write");
    if path.is_dir() {
        return Err(StoreError::Io {
            path: Some(path.to_path_buf()),
            kind: std::io::ErrorKind::AlreadyExists,
            message: "target is a directory".to_string(),
        });
    }

    let _lock = FileLock::acquire(path, LockMode::Exclusive)?;

    let parent = parent_dir(path);
    ensure_dir(&parent)?;

    let tmp = temp_path(path);
    if let Err(err) = write_temp(&tmp, data) {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }

    if let Err(rename_err) = fs::rename(&tmp, path) {
        if !path.exists() {
            let _ = fs::remove_file(&tmp);
            return Err(StoreError::io(path, rename_err, "renaming temp file"));
        }

        // Some filesystems refuse to replace an existing destination. Keep a
        // backup, clear the destination, and rename again. The exclusive lock
        // on `path` is already held, so the backup must not take its own.
        debug!(path = %path.display(), "rename rejected, retrying after backup");
        let backup = match backup_unlocked(path) {
            Ok(backup) => backup,
            Err(err) => {
                let _ = fs::remove_file(&tmp);
                return Err(err);
            }
        };

        if let Err(err) = fs::remove_file(path) {
            let _ = fs::remove_file(&tmp);
            return Err(StoreError::io(path, err, "removing destination before retry"));
        }

        if let Err(err) = fs::rename(&tmp, path) {
            error!(
                path = %path.display(),
                %err,
                "second rename failed, restoring destination from backup"
            );
            if let Err(restore_err) = fs::copy(&backup, path) {
                error!(
                    backup = %backup.display(),
                    %restore_err,
                    "could not restore destination from backup"
                );
            }
            let _ = fs::remove_file(&tmp);
            return Err(StoreError::io(path, err, "renaming temp file after backup"));
        }
        // The backup of the replaced destination is retained on disk.
    }

    sync_dir(&parent).map_err(|e| StoreError::io(&parent, e, "syncing directory"))?;

    debug!(path = %path.display(), bytes = data.len(), "atomic write complete");
    Ok(())
}

/// Append `data` to `path` with an fsync on the file and on the containing
/// directory.
///
/// Holds an exclusive advisory lock on `path`. A missing file is created via
/// `atomic_write` (the lock is released first; `atomic_write` takes its own).
pub fn safe_append(path: &Path, data: &[u8]) -> StoreResult<()> {
    debug!(path = %path.display(), bytes = data.len(), "safe append");
    if path.is_dir() {
        return Err(StoreError::Io {
            path: Some(path.to_path_buf()),
            kind: std::io::ErrorKind::AlreadyExists,
            message: "target is a directory".to_string(),
        });
    }

    let mut lock = FileLock::acquire(path, LockMode::Exclusive)?;

    let parent = parent_dir(path);
    ensure_dir(&parent)?;

    if !path.exists() {
        debug!(path = %path.display(), "append target missing, creating it");
        lock.release()?;
        return atomic_write(path, data);
    }

    let mut file = OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(|e| StoreError::io(path, e, "opening for append"))?;
    file.write_all(data)
        .map_err(|e| StoreError::io(path, e, "appending"))?;
    file.flush().map_err(|e| StoreError::io(path, e, "flushing append"))?;
    durable_sync(&file).map_err(|e| StoreError::io(path, e, "syncing append"))?;

    sync_dir(&parent).map_err(|e| StoreError::io(&parent, e, "syncing directory"))?;
    Ok(())
}

/// Read the whole file under a shared advisory lock.
pub fn safe_read(path: &Path) -> StoreResult<Vec<u8>> {
    if path.is_dir() {
        return Err(StoreError::Io {
            path: Some(path.to_path_buf()),
            kind: std::io::ErrorKind::AlreadyExists,
            message: "target is a directory".to_string(),
        });
    }

    let _lock = FileLock::acquire(path, LockMode::Shared)?;
    let data = fs::read(path).map_err(|e| StoreError::io(path, e, "reading"))?;
    debug!(path = %path.display(), bytes = data.len(), "read file");
    Ok(data)
}

/// Copy `path` to a fresh `<path>.backup.<timestamp>` under a shared
/// advisory lock and return the backup path. Backups are never deleted by
/// the engine.
pub fn create_backup(path: &Path) -> StoreResult<PathBuf> {
    if path.is_dir() {
        return Err(StoreError::Io {
            path: Some(path.to_path_buf()),
            kind: std::io::ErrorKind::AlreadyExists,
            message: "target is a directory".to_string(),
        });
    }

    let _lock = FileLock::acquire(path, LockMode::Shared)?;
    backup_unlocked(path)
}

/// Backup for callers that already hold a lock on `path`.
fn backup_unlocked(path: &Path) -> StoreResult<PathBuf> {
    let backup = backup_path(path);
    info!(from = %path.display(), to = %backup.display(), "creating backup");

    fs::copy(path, &backup).map_err(|e| StoreError::io(path, e, "copying to backup"))?;

    let parent = parent_dir(path);
    if let Err(err) = sync_dir(&parent) {
        warn!(path = %path.display(), %err, "backup written but directory sync failed");
        return Err(StoreError::io(&parent, err, "syncing directory"));
    }

    Ok(backup)
}

fn write_temp(tmp: &Path, data: &[u8]) -> StoreResult<()> {
    let mut file = File::create(tmp).map_err(|e| StoreError::io(tmp, e, "creating temp file"))?;
    file.write_all(data)
        .map_err(|e| StoreError::io(tmp, e, "writing temp file"))?;
    file.flush().map_err(|e| StoreError::io(tmp, e, "flushing temp file"))?;
    durable_sync(&file).map_err(|e| StoreError::io(tmp, e, "syncing temp file"))?;
    Ok(())
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_creates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("target.bin");

        atomic_write(&path, b"first contents").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"first contents");
    }

    #[test]
    fn test_atomic_write_replaces_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("target.bin");

        atomic_write(&path, b"old").unwrap();
        atomic_write(&path, b"new contents").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new contents");
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("target.bin");

        atomic_write(&path, b"payload").unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind: {:?}", leftovers);
    }

    #[test]
    fn test_atomic_write_creates_missing_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a").join("b").join("target.bin");

        atomic_write(&path, b"nested").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"nested");
    }

    #[test]
    fn test_safe_append_creates_then_extends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.txt");

        safe_append(&path, b"one\n").unwrap();
        safe_append(&path, b"two\n").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"one\ntwo\n");
    }

    #[test]
    fn test_safe_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blob.bin");
        let payload: Vec<u8> = (0u16..=255).map(|b| b as u8).collect();

        atomic_write(&path, &payload).unwrap();
        assert_eq!(safe_read(&path).unwrap(), payload);
    }

    #[test]
    fn test_safe_read_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.bin");
        assert!(safe_read(&path).is_err());
    }

    #[test]
    fn test_create_backup_names_and_preserves() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        atomic_write(&path, b"precious").unwrap();

        let backup = create_backup(&path).unwrap();
        let name = backup.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("data.bin.backup."));
        assert_eq!(fs::read(&backup).unwrap(), b"precious");
        // The source file is untouched.
        assert_eq!(fs::read(&path).unwrap(), b"precious");
    }

    #[test]
    fn test_create_backup_unique_paths() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        atomic_write(&path, b"x").unwrap();

        let first = create_backup(&path).unwrap();
        let second = create_backup(&path).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_create_backup_missing_source_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.bin");
        assert!(create_backup(&path).is_err());
    }

    #[test]
    fn test_ensure_dir_rejects_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("occupied");
        fs::write(&path, b"not a dir").unwrap();
        assert!(ensure_dir(&path).is_err());
    }
}
