//! OCTET Core — crash-safe in-memory key-value storage
//!
//! A key-value engine where RAM holds the whole working set and disk holds
//! what is needed to rebuild it bit-for-bit after an abrupt termination:
//!
//! - **Journal**: append-only log of INSERT/UPDATE/REMOVE/CHECKPOINT
//!   entries, fsynced per append
//! - **Snapshot**: atomically replaced point-in-time serialization of the
//!   map, paired with a CHECKPOINT entry in the journal
//! - **Recovery**: load the snapshot, then replay the journal tail after the
//!   last checkpoint
//!
//! A background snapshotter converts accumulated mutations into fresh
//! snapshots, driven by an operation counter and a wall-clock timer. All
//! file manipulation goes through crash-safe primitives (temp-file-plus-
//! rename, locked append with fsync, directory fsync) guarded by a two-level
//! advisory lock.

pub mod config;
pub mod durability;
pub mod error;
pub mod flock;
pub mod fsio;
pub mod ident;
pub mod journal;
pub mod snapshot;
pub mod store;

// Re-export key types for convenience
pub use config::Config;
pub use error::{StoreError, StoreResult};
pub use flock::{FileLock, LockMode, WaitStrategy};
pub use journal::{Journal, JournalEntry, OperationType};
pub use store::OctetStore;
