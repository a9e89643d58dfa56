use std::time::Duration;

use serde::Deserialize;

/// Tunables for the service manager's snapshot and compaction policy.
///
/// Durations are expressed in milliseconds so a config file stays flat:
///
/// ```toml
/// snapshot_interval_ms = 10000
/// free_disk_buffer = 0.2
/// dynamic_compaction = true
/// ```
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// How often the server context evaluates whether to snapshot.
    pub snapshot_interval_ms: u64,
    /// How often the completion check polls session `last_completed`
    /// watermarks after a snapshot was taken.
    pub completion_poll_interval_ms: u64,
    /// How long the completion check waits for sessions to catch up before
    /// the snapshot is abandoned and retried on a later cycle.
    pub completion_max_wait_ms: u64,
    /// Base delay before compacting under high load. The actual delay is
    /// randomized around this value to desynchronize peers.
    pub compaction_delay_ms: u64,
    /// Snapshot regardless of load when usable disk space falls below this
    /// fraction of the total.
    pub free_disk_buffer: f64,
    /// Snapshot regardless of load when free memory falls below this fraction
    /// of the total. Only consulted for in-memory and memory-mapped logs.
    pub free_memory_buffer: f64,
    /// When enabled, snapshots may be deferred while the monitor reports high
    /// load and no pressure signal is present.
    pub dynamic_compaction: bool,
    /// Width of the load monitor's sliding window.
    pub load_window_ms: u64,
    /// Number of events within the window above which the monitor reports
    /// high load.
    pub load_threshold: usize,
}

impl ManagerConfig {
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    pub fn completion_poll_interval(&self) -> Duration {
        Duration::from_millis(self.completion_poll_interval_ms)
    }

    pub fn completion_max_wait(&self) -> Duration {
        Duration::from_millis(self.completion_max_wait_ms)
    }

    pub fn compaction_delay(&self) -> Duration {
        Duration::from_millis(self.compaction_delay_ms)
    }

    pub fn load_window(&self) -> Duration {
        Duration::from_millis(self.load_window_ms)
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_ms: 10_000,
            completion_poll_interval_ms: 10_000,
            completion_max_wait_ms: 120_000,
            compaction_delay_ms: 10_000,
            free_disk_buffer: 0.2,
            free_memory_buffer: 0.2,
            dynamic_compaction: true,
            load_window_ms: 5_000,
            load_threshold: 1_000,
        }
    }
}
