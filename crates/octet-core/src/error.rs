//! Error types for the OCTET storage engine
//!
//! All engine errors are represented by the StoreError enum, which carries
//! enough context (paths, io kinds, ids) for debugging and recovery.

use std::error::Error;
use std::fmt;
use std::path::PathBuf;

/// Storage engine error types with detailed context
#[derive(Debug, Clone)]
pub enum StoreError {
    /// The engine could not be constructed: data directory unusable, or the
    /// journal is corrupt and could not be backed up before recreation.
    Init {
        /// Path that made construction impossible
        path: PathBuf,
        /// Human-readable description
        message: String,
    },

    /// I/O operation failed during append, rename, fsync, or read
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// Operation refers to an absent id (update/remove only; get models
    /// absence as an empty result)
    NotFound {
        /// The id that was not present
        id: String,
    },

    /// On-disk state did not parse: snapshot decode failed, a journal entry
    /// was malformed, or a named checkpoint is missing from the journal
    Corrupt {
        /// File the corruption was detected in
        path: PathBuf,
        /// Description of what failed to parse
        reason: String,
    },

    /// Advisory lock could not be acquired within the requested time
    LockTimeout {
        /// Path the lock was requested for
        path: PathBuf,
    },

    /// The same thread requested an incompatible second lock on a path it
    /// already holds
    Deadlock {
        /// Path the lock was requested for
        path: PathBuf,
    },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Init { path, message } => {
                write!(f, "initialization failed at {}: {}", path.display(), message)
            }

            StoreError::Io { path, kind, message } => {
                if let Some(path) = path {
                    write!(f, "I/O error in {}: {} ({})", path.display(), message, kind)
                } else {
                    write!(f, "I/O error: {} ({})", message, kind)
                }
            }

            StoreError::NotFound { id } => {
                write!(f, "no record with id {}", id)
            }

            StoreError::Corrupt { path, reason } => {
                write!(f, "corrupt data in {}: {}", path.display(), reason)
            }

            StoreError::LockTimeout { path } => {
                write!(f, "timed out waiting for advisory lock on {}", path.display())
            }

            StoreError::Deadlock { path } => {
                write!(
                    f,
                    "potential deadlock: thread already holds an incompatible lock on {}",
                    path.display()
                )
            }
        }
    }
}

impl Error for StoreError {}

/// Convert std::io::Error to StoreError::Io (no path context)
impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl StoreError {
    /// Attach a path to an I/O error at the site that knows it.
    pub(crate) fn io(path: &std::path::Path, err: std::io::Error, what: &str) -> Self {
        StoreError::Io {
            path: Some(path.to_path_buf()),
            kind: err.kind(),
            message: format!("{}: {}", what, err),
        }
    }
}

/// Result type alias for storage engine operations
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::Corrupt {
            path: PathBuf::from("/tmp/octet-data.snapshot"),
            reason: "value length exceeds remaining bytes".to_string(),
        };

        let display = format!("{}", err);
        assert!(display.contains("corrupt data"));
        assert!(display.contains("octet-data.snapshot"));
        assert!(display.contains("value length"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: StoreError = io_err.into();

        match err {
            StoreError::Io { kind, path, .. } => {
                assert_eq!(kind, std::io::ErrorKind::NotFound);
                assert!(path.is_none());
            }
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_io_error_with_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = StoreError::io(std::path::Path::new("/tmp/x"), io_err, "append failed");

        let display = format!("{}", err);
        assert!(display.contains("/tmp/x"));
        assert!(display.contains("append failed"));
    }
}
