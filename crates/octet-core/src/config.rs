//! Engine configuration
//!
//! The two knobs drive the background snapshotter: how many mutations may
//! accumulate before a snapshot is requested, and how many idle minutes may
//! pass before accumulated mutations are snapshotted anyway. Both can also
//! be adjusted on a live store through the setters on `OctetStore`.

/// Snapshotter configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Mutation count after which a snapshot is requested
    pub snapshot_ops_threshold: usize,
    /// Minutes of idle-or-accumulating mutations after which a snapshot is
    /// requested
    pub snapshot_time_threshold_mins: u64,
}

impl Config {
    /// Validate all configuration parameters.
    pub fn validate(&self) -> Result<(), String> {
        if self.snapshot_ops_threshold == 0 {
            return Err("snapshot_ops_threshold must be > 0".into());
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            snapshot_ops_threshold: 100,
            snapshot_time_threshold_mins: 10,
        }
    }
}
