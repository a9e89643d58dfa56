use std::path::Path;

/// Usable and total bytes of the volume backing the log.
#[derive(Copy, Clone, Debug)]
pub struct DiskSpace {
    pub usable: u64,
    pub total: u64,
}

/// Free and total bytes of system memory.
#[derive(Copy, Clone, Debug)]
pub struct MemorySpace {
    pub free: u64,
    pub total: u64,
}

/// Source of the disk and memory pressure signals consulted by the snapshot
/// scheduler. Implementations returning `None` opt out of that signal.
pub trait ResourceMonitor: Send + Sync + 'static {
    fn disk(&self, path: &Path) -> Option<DiskSpace>;
    fn memory(&self) -> Option<MemorySpace>;
}

/// Reports no pressure at all. Useful for tests and embedders that schedule
/// compaction themselves.
pub struct NullResourceMonitor;

impl ResourceMonitor for NullResourceMonitor {
    fn disk(&self, _path: &Path) -> Option<DiskSpace> {
        None
    }

    fn memory(&self) -> Option<MemorySpace> {
        None
    }
}

/// Probes the filesystem holding the log directory.
///
/// Memory statistics are not probed here; supply a platform-specific
/// [`ResourceMonitor`] if the memory buffer policy should be active.
pub struct FsResourceMonitor;

impl ResourceMonitor for FsResourceMonitor {
    fn disk(&self, path: &Path) -> Option<DiskSpace> {
        let usable = fs2::available_space(path).ok()?;
        let total = fs2::total_space(path).ok()?;
        Some(DiskSpace { usable, total })
    }

    fn memory(&self) -> Option<MemorySpace> {
        None
    }
}
