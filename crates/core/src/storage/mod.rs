use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::entry::LogEntry;
use crate::error::LogError;

mod memory;

pub use memory::MemoryLog;

/// How a log implementation stores its segments. Drives which pressure
/// signals the snapshot scheduler consults.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StorageFlavor {
    Disk,
    MemoryMapped,
    Memory,
}

impl StorageFlavor {
    /// Memory-resident flavors are subject to the free-memory buffer policy.
    pub fn in_memory(self) -> bool {
        matches!(self, StorageFlavor::Memory | StorageFlavor::MemoryMapped)
    }
}

/// Static facts about a log the compaction policy needs.
#[derive(Clone, Debug)]
pub struct LogStats {
    pub max_segment_size: u64,
    pub flavor: StorageFlavor,
    /// Directory whose volume is probed for disk pressure. `None` for logs
    /// with no disk footprint.
    pub directory: Option<PathBuf>,
}

/// The compaction-facing interface of the replicated log.
///
/// Segment storage itself lives with the consensus layer; the service manager
/// only positions a reader, asks what can be compacted, and truncates the
/// prefix covered by a finalized snapshot.
pub trait StateLog: Send + 'static {
    /// Lowest retained index. Starts at 1 for a fresh log and moves up as the
    /// prefix is compacted away.
    fn first_index(&self) -> u64;

    /// One past the highest appended index.
    fn next_index(&self) -> u64;

    fn entry(&self, index: u64) -> Result<LogEntry, LogError>;

    /// Append an entry at exactly `next_index`.
    fn append(&mut self, entry: LogEntry) -> Result<(), LogError>;

    /// Whether any prefix up to `index` could be released.
    fn is_compactable(&self, index: u64) -> bool;

    /// Highest index that compaction up to `index` would actually release;
    /// segment-granular implementations round down to a boundary.
    fn compactable_index(&self, index: u64) -> u64;

    /// Drop every entry with index `<= index`.
    fn compact(&mut self, index: u64) -> Result<(), LogError>;

    fn stats(&self) -> LogStats;
}

/// A log shared between the consensus layer (which appends) and the service
/// manager (which reads and compacts).
pub type SharedLog<L> = Arc<Mutex<L>>;

pub fn shared<L: StateLog>(log: L) -> SharedLog<L> {
    Arc::new(Mutex::new(log))
}

/// The single consuming cursor over committed entries.
///
/// Owned exclusively by the service manager's server context; nothing else
/// moves it, which is what makes application single-consumer and gap-free.
pub struct LogReader<L> {
    log: SharedLog<L>,
    next: u64,
}

impl<L: StateLog> LogReader<L> {
    /// Position the cursor at the log's first retained index.
    pub fn new(log: SharedLog<L>) -> Self {
        let next = log.lock().first_index();
        Self { log, next }
    }

    pub fn next_index(&self) -> u64 {
        self.next
    }

    /// Read the entry at the cursor and advance. The cursor does not move on
    /// failure, so a transient error can be retried.
    pub fn read(&mut self) -> Result<LogEntry, LogError> {
        let entry = self.log.lock().entry(self.next)?;
        self.next += 1;
        Ok(entry)
    }
}
