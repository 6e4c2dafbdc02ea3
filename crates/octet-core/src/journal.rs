//! Write-ahead journal — typed append-only log of mutations and checkpoints
//!
//! One logical entry per line-feed-terminated line:
//!
//! ```text
//! TYPE|ID|TIMESTAMP|ESCAPED_DATA
//! ```
//!
//! `TYPE` is one of INSERT, UPDATE, REMOVE, CHECKPOINT; `ID` is a non-empty
//! identifier without `|`; `TIMESTAMP` is ISO-8601 UTC with millisecond
//! precision. Values are arbitrary bytes, so lines are byte strings: exactly
//! four substitutions are applied on write (`\` → `\\`, `|` → `\|`, LF →
//! `\n`, CR → `\r`) and reversed on read; every other byte passes through
//! literally. Empty lines and lines starting with `#` are comments. The file
//! opens with the fixed header line, written once at creation and preserved
//! by every rewrite.
//!
//! Appends are serialized by an exclusive advisory lock on the journal path
//! (inside `fsio::safe_append`); truncation locks the distinct path
//! `<journal>.truncate` so appends queue behind it explicitly.

use std::path::{Path, PathBuf};

use chrono::Utc;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::flock::{FileLock, LockMode};
use crate::fsio;

/// Header line written at journal creation.
pub const JOURNAL_HEADER: &str = "# OCTET Journal Format v1.0\n";

const FIELD_SEPARATOR: u8 = b'|';
const ESCAPE_CHAR: u8 = b'\\';

/// Journal entry types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    /// Create a record (replay overwrites silently)
    Insert,
    /// Replace an existing record's value
    Update,
    /// Delete a record
    Remove,
    /// Mark that a snapshot covering all prior entries exists on disk
    Checkpoint,
}

impl OperationType {
    /// Uppercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            OperationType::Insert => "INSERT",
            OperationType::Update => "UPDATE",
            OperationType::Remove => "REMOVE",
            OperationType::Checkpoint => "CHECKPOINT",
        }
    }

    fn parse(field: &[u8]) -> Option<Self> {
        match field {
            b"INSERT" => Some(OperationType::Insert),
            b"UPDATE" => Some(OperationType::Update),
            b"REMOVE" => Some(OperationType::Remove),
            b"CHECKPOINT" => Some(OperationType::Checkpoint),
            _ => None,
        }
    }
}

/// Current time as ISO-8601 UTC with millisecond precision,
/// e.g. `2025-01-31T14:05:09.123Z`.
pub fn iso_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// One journal record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub op: OperationType,
    /// Record id for data operations; the snapshot id for CHECKPOINT
    pub id: String,
    /// Value bytes; empty for REMOVE and CHECKPOINT
    pub data: Vec<u8>,
    pub timestamp: String,
}

impl JournalEntry {
    /// Entry stamped with the current time.
    pub fn new(op: OperationType, id: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            op,
            id: id.into(),
            data,
            timestamp: iso_timestamp(),
        }
    }

    /// Serialize to one line-feed-terminated line.
    pub fn serialize(&self) -> Vec<u8> {
        let escaped = escape(&self.data);
        let mut line = Vec::with_capacity(
            self.op.as_str().len() + self.id.len() + self.timestamp.len() + escaped.len() + 4,
        );
        line.extend_from_slice(self.op.as_str().as_bytes());
        line.push(FIELD_SEPARATOR);
        line.extend_from_slice(self.id.as_bytes());
        line.push(FIELD_SEPARATOR);
        line.extend_from_slice(self.timestamp.as_bytes());
        line.push(FIELD_SEPARATOR);
        line.extend_from_slice(&escaped);
        line.push(b'\n');
        line
    }

    /// Parse one line (without its terminator). `None` for anything that is
    /// not a well-formed entry.
    pub fn deserialize(line: &[u8]) -> Option<Self> {
        let mut fields = line.splitn(4, |&b| b == FIELD_SEPARATOR);
        let op = OperationType::parse(fields.next()?)?;
        let id = fields.next()?;
        let timestamp = fields.next()?;
        let data = fields.next()?;

        if id.is_empty() || timestamp.is_empty() {
            return None;
        }
        let id = std::str::from_utf8(id).ok()?.to_string();
        let timestamp = std::str::from_utf8(timestamp).ok()?.to_string();

        Some(Self {
            op,
            id,
            data: unescape(data),
            timestamp,
        })
    }
}

fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &b in data {
        match b {
            ESCAPE_CHAR => out.extend_from_slice(b"\\\\"),
            FIELD_SEPARATOR => out.extend_from_slice(b"\\|"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut escaped = false;
    for &b in data {
        if escaped {
            match b {
                b'n' => out.push(b'\n'),
                b'r' => out.push(b'\r'),
                other => out.push(other),
            }
            escaped = false;
        } else if b == ESCAPE_CHAR {
            escaped = true;
        } else {
            out.push(b);
        }
    }
    out
}

/// Counters reported by a replay pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplayStats {
    /// Entries that parsed
    pub total: usize,
    /// Data operations applied to the map
    pub applied: usize,
}

/// The on-disk journal and its cached last-checkpoint id.
pub struct Journal {
    path: PathBuf,
    /// Outer `None`: not scanned yet. Inner value: last checkpoint id found
    /// by a scan or recorded by a successful checkpoint append. Refreshed by
    /// rewrite, which is the only way existing lines change.
    last_checkpoint: Mutex<Option<Option<String>>>,
}

impl Journal {
    /// Open the journal at `path`, creating a fresh header-only file when it
    /// is missing. An existing file that fails validation is backed up with
    /// a timestamp and replaced; when the backup cannot be created,
    /// construction fails rather than destroy data.
    pub fn open(path: PathBuf) -> StoreResult<Self> {
        info!(path = %path.display(), "opening journal");

        let journal = Self {
            path,
            last_checkpoint: Mutex::new(None),
        };

        let mut recreate = false;
        if !journal.path.exists() {
            info!(path = %journal.path.display(), "journal missing, creating a fresh one");
            recreate = true;
        } else if !journal.has_valid_header() {
            // Individual bad lines are absorbed during replay; only a file
            // that does not even carry the header is treated as foreign and
            // set aside.
            warn!(
                path = %journal.path.display(),
                "journal header missing or wrong, backing the file up and starting fresh"
            );
            match fsio::create_backup(&journal.path) {
                Ok(backup) => {
                    info!(backup = %backup.display(), "backed up invalid journal");
                }
                Err(err) => {
                    error!(
                        path = %journal.path.display(),
                        %err,
                        "could not back up invalid journal, refusing to destroy it"
                    );
                    return Err(StoreError::Init {
                        path: journal.path.clone(),
                        message: format!("could not back up invalid journal: {}", err),
                    });
                }
            }
            recreate = true;
        }

        if recreate {
            fsio::atomic_write(&journal.path, JOURNAL_HEADER.as_bytes()).map_err(|err| {
                StoreError::Init {
                    path: journal.path.clone(),
                    message: format!("could not create journal: {}", err),
                }
            })?;
            *journal.last_checkpoint.lock() = Some(None);
        }

        Ok(journal)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record an INSERT.
    pub fn write_insert(&self, id: &str, data: &[u8]) -> StoreResult<()> {
        self.write_operation(OperationType::Insert, id, data)
    }

    /// Record an UPDATE.
    pub fn write_update(&self, id: &str, data: &[u8]) -> StoreResult<()> {
        self.write_operation(OperationType::Update, id, data)
    }

    /// Record a REMOVE.
    pub fn write_remove(&self, id: &str) -> StoreResult<()> {
        self.write_operation(OperationType::Remove, id, &[])
    }

    /// Record a CHECKPOINT for the snapshot named by `snapshot_id`.
    pub fn write_checkpoint(&self, snapshot_id: &str) -> StoreResult<()> {
        self.write_operation(OperationType::Checkpoint, snapshot_id, &[])
    }

    fn write_operation(&self, op: OperationType, id: &str, data: &[u8]) -> StoreResult<()> {
        debug!(path = %self.path.display(), op = op.as_str(), id, "journal append");

        if id.is_empty() {
            return Err(StoreError::Io {
                path: Some(self.path.clone()),
                kind: std::io::ErrorKind::InvalidInput,
                message: "journal entry with an empty id".to_string(),
            });
        }

        if op == OperationType::Checkpoint {
            // The cache must change together with the file, so hold it
            // across the append.
            let mut cache = self.last_checkpoint.lock();
            self.append_entry(op, id, data)?;
            *cache = Some(Some(id.to_string()));
            Ok(())
        } else {
            self.append_entry(op, id, data)
        }
    }

    fn append_entry(&self, op: OperationType, id: &str, data: &[u8]) -> StoreResult<()> {
        let entry = JournalEntry::new(op, id, data.to_vec());
        fsio::safe_append(&self.path, &entry.serialize()).map_err(|err| {
            error!(
                path = %self.path.display(),
                op = op.as_str(),
                id,
                %err,
                "journal append failed"
            );
            err
        })
    }

    /// Replay the journal into `map`.
    ///
    /// With `start_after` set, every entry is ignored until a CHECKPOINT with
    /// that id is seen; subsequent data entries are applied. When the named
    /// checkpoint never appears the journal has been truncated past the
    /// snapshot: nothing is applied and `Corrupt` is reported. Malformed
    /// lines are logged and skipped; UPDATE/REMOVE of an absent id is logged
    /// and skipped.
    pub fn replay(
        &self,
        map: &mut HashMap<String, Vec<u8>>,
        start_after: Option<&str>,
    ) -> StoreResult<ReplayStats> {
        debug!(
            path = %self.path.display(),
            checkpoint = start_after.unwrap_or("[none]"),
            "replaying journal"
        );

        if start_after == Some("") {
            return Err(StoreError::Io {
                path: Some(self.path.clone()),
                kind: std::io::ErrorKind::InvalidInput,
                message: "empty checkpoint id".to_string(),
            });
        }

        let content = fsio::safe_read(&self.path)?;

        let mut stats = ReplayStats::default();
        let mut found_checkpoint = false;

        for line in content.split(|&b| b == b'\n') {
            let line = trim_carriage_return(line);
            if line.is_empty() || line[0] == b'#' {
                continue;
            }

            let entry = match JournalEntry::deserialize(line) {
                Some(entry) => entry,
                None => {
                    warn!(
                        path = %self.path.display(),
                        line = %String::from_utf8_lossy(line),
                        "skipping malformed journal line"
                    );
                    continue;
                }
            };
            stats.total += 1;

            if let Some(checkpoint) = start_after {
                if entry.op == OperationType::Checkpoint {
                    if entry.id == checkpoint {
                        found_checkpoint = true;
                        info!(checkpoint, "found replay checkpoint");
                    }
                    continue;
                }
                if !found_checkpoint {
                    continue;
                }
            }

            if apply_operation(&entry, map) {
                stats.applied += 1;
            }
        }

        info!(
            path = %self.path.display(),
            total = stats.total,
            applied = stats.applied,
            "journal replay finished"
        );

        if let Some(checkpoint) = start_after {
            if !found_checkpoint {
                warn!(
                    path = %self.path.display(),
                    checkpoint,
                    "checkpoint not found in journal"
                );
                return Err(StoreError::Corrupt {
                    path: self.path.clone(),
                    reason: format!("checkpoint {} not found in journal", checkpoint),
                });
            }
        }

        Ok(stats)
    }

    /// Id of the last CHECKPOINT entry, from cache or by scanning the file.
    pub fn last_checkpoint_id(&self) -> StoreResult<Option<String>> {
        let mut cache = self.last_checkpoint.lock();
        if let Some(known) = cache.as_ref() {
            return Ok(known.clone());
        }

        let content = fsio::safe_read(&self.path)?;
        let mut newest = None;
        for line in content.split(|&b| b == b'\n') {
            let line = trim_carriage_return(line);
            if line.is_empty() || line[0] == b'#' {
                continue;
            }
            if let Some(entry) = JournalEntry::deserialize(line) {
                if entry.op == OperationType::Checkpoint {
                    newest = Some(entry.id);
                }
            }
        }

        debug!(
            path = %self.path.display(),
            checkpoint = newest.as_deref().unwrap_or("[none]"),
            "scanned journal for last checkpoint"
        );
        *cache = Some(newest.clone());
        Ok(newest)
    }

    /// Rewrite the journal so its earliest entry is the CHECKPOINT with the
    /// given id, discarding all earlier entries. Fails without modification
    /// when the checkpoint is absent. Returns the number of dropped entries.
    pub fn truncate_to_checkpoint(&self, checkpoint_id: &str) -> StoreResult<usize> {
        if checkpoint_id.is_empty() {
            return Err(StoreError::Io {
                path: Some(self.path.clone()),
                kind: std::io::ErrorKind::InvalidInput,
                message: "empty checkpoint id".to_string(),
            });
        }

        info!(
            path = %self.path.display(),
            checkpoint = checkpoint_id,
            "truncating journal to checkpoint"
        );

        // A distinct lock path, so concurrent appends (which lock the journal
        // path itself) queue behind the rewrite explicitly.
        let truncate_lock_path = sibling_path(&self.path, ".truncate");
        let _lock = FileLock::acquire(&truncate_lock_path, LockMode::Exclusive)?;

        let entries = self.read_all_entries()?;
        let position = entries
            .iter()
            .position(|e| e.op == OperationType::Checkpoint && e.id == checkpoint_id);
        let index = match position {
            Some(index) => index,
            None => {
                error!(
                    path = %self.path.display(),
                    checkpoint = checkpoint_id,
                    "checkpoint not found, journal left unmodified"
                );
                return Err(StoreError::NotFound {
                    id: checkpoint_id.to_string(),
                });
            }
        };

        self.rewrite(&entries[index..])?;

        info!(
            path = %self.path.display(),
            dropped = index,
            "journal truncated"
        );
        Ok(index)
    }

    /// Number of data operations recorded after the last checkpoint (or in
    /// the whole journal when no checkpoint exists).
    pub fn ops_since_last_checkpoint(&self) -> StoreResult<usize> {
        // Reading the last checkpoint and counting behind it must see one
        // consistent file, hence a lock on a distinct path.
        let count_lock_path = sibling_path(&self.path, ".count");
        let _lock = FileLock::acquire(&count_lock_path, LockMode::Exclusive)?;

        let last = self.last_checkpoint_id()?;
        let entries = self.read_all_entries()?;

        let count = match last {
            Some(checkpoint) => {
                let mut seen = false;
                let mut count = 0usize;
                for entry in &entries {
                    if entry.op == OperationType::Checkpoint {
                        if entry.id == checkpoint {
                            seen = true;
                            count = 0;
                        }
                        continue;
                    }
                    if seen {
                        count += 1;
                    }
                }
                count
            }
            None => entries
                .iter()
                .filter(|e| e.op != OperationType::Checkpoint)
                .count(),
        };

        debug!(path = %self.path.display(), count, "operations since last checkpoint");
        Ok(count)
    }

    /// Whether the file starts with the fixed journal header line.
    fn has_valid_header(&self) -> bool {
        let content = match fsio::safe_read(&self.path) {
            Ok(content) => content,
            Err(err) => {
                error!(path = %self.path.display(), %err, "could not read journal");
                return false;
            }
        };
        let first_line = content.split(|&b| b == b'\n').next().unwrap_or(&[]);
        let header = JOURNAL_HEADER.trim_end_matches('\n').as_bytes();
        trim_carriage_return(first_line) == header
    }

    /// A journal is valid when every non-comment, non-empty line parses.
    pub fn is_valid(&self) -> bool {
        debug!(path = %self.path.display(), "validating journal");

        let content = match fsio::safe_read(&self.path) {
            Ok(content) => content,
            Err(err) => {
                error!(path = %self.path.display(), %err, "could not read journal");
                return false;
            }
        };

        for line in content.split(|&b| b == b'\n') {
            let line = trim_carriage_return(line);
            if line.is_empty() || line[0] == b'#' {
                continue;
            }
            if JournalEntry::deserialize(line).is_none() {
                warn!(
                    path = %self.path.display(),
                    line = %String::from_utf8_lossy(line),
                    "journal line failed validation"
                );
                return false;
            }
        }
        true
    }

    /// Every parseable entry in file order, checkpoints included. Malformed
    /// lines are logged and skipped.
    fn read_all_entries(&self) -> StoreResult<Vec<JournalEntry>> {
        let content = fsio::safe_read(&self.path)?;
        let mut entries = Vec::new();
        for line in content.split(|&b| b == b'\n') {
            let line = trim_carriage_return(line);
            if line.is_empty() || line[0] == b'#' {
                continue;
            }
            match JournalEntry::deserialize(line) {
                Some(entry) => entries.push(entry),
                None => {
                    warn!(
                        path = %self.path.display(),
                        line = %String::from_utf8_lossy(line),
                        "skipping malformed journal line"
                    );
                }
            }
        }
        Ok(entries)
    }

    /// Atomically replace the journal with `header + entries` and refresh
    /// the checkpoint cache.
    fn rewrite(&self, entries: &[JournalEntry]) -> StoreResult<()> {
        let mut content = Vec::with_capacity(JOURNAL_HEADER.len());
        content.extend_from_slice(JOURNAL_HEADER.as_bytes());

        let mut newest_checkpoint = None;
        for entry in entries {
            if entry.op == OperationType::Checkpoint {
                newest_checkpoint = Some(entry.id.clone());
            }
            content.extend_from_slice(&entry.serialize());
        }

        let mut cache = self.last_checkpoint.lock();
        fsio::atomic_write(&self.path, &content)?;
        *cache = Some(newest_checkpoint);
        Ok(())
    }
}

/// `<path><suffix>`, e.g. `octet-operations.journal.truncate`.
fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

/// Tolerate CRLF line endings in hand-edited journals.
fn trim_carriage_return(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

/// Apply one replayed entry to the map. Returns whether a data mutation took
/// effect.
fn apply_operation(entry: &JournalEntry, map: &mut HashMap<String, Vec<u8>>) -> bool {
    match entry.op {
        OperationType::Insert => {
            map.insert(entry.id.clone(), entry.data.clone());
            true
        }
        OperationType::Update => {
            if !map.contains_key(&entry.id) {
                warn!(id = %entry.id, "replayed UPDATE for an absent id, skipping");
                return false;
            }
            map.insert(entry.id.clone(), entry.data.clone());
            true
        }
        OperationType::Remove => {
            if map.remove(&entry.id).is_none() {
                warn!(id = %entry.id, "replayed REMOVE for an absent id, skipping");
                return false;
            }
            true
        }
        // Checkpoints are boundaries, not mutations.
        OperationType::Checkpoint => false,
    }
}
