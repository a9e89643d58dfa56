pub mod config;
pub mod entry;
pub mod error;
pub mod host;
pub mod load;
pub mod monitor;
pub mod service;
pub mod session;
pub mod snapshot;
pub mod storage;
pub mod util;

pub use config::ManagerConfig;
pub use entry::{EntryKind, LogEntry};
pub use error::{LogError, SnapshotError, StateError};
pub use host::{ApplyOutcome, ServiceManager};
pub use monitor::{DiskSpace, FsResourceMonitor, MemorySpace, NullResourceMonitor, ResourceMonitor};
pub use service::{Commit, Query, Service, ServiceCatalog, SessionInfo};
pub use session::{Session, SessionRegistry};
pub use snapshot::{MemorySnapshotStore, Snapshot, SnapshotStore};
pub use storage::{LogReader, LogStats, MemoryLog, SharedLog, StateLog, StorageFlavor};
