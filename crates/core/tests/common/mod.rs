#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use quorum::snapshot::MemorySnapshotStore;
use quorum::storage::{shared, MemoryLog, SharedLog, StateLog as _};
use quorum::{
    ApplyOutcome, Commit, EntryKind, LogEntry, ManagerConfig, NullResourceMonitor, Query, Service, ServiceCatalog,
    ServiceManager, StateError,
};
use quorum_primitives::{ReadConsistency, SessionId, Timestamp};

pub fn enable_logging() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .format_timestamp(None)
        .is_test(true)
        .try_init();
}

/// Deterministic key-value machine used by the integration tests.
///
/// Commands: `put <key> <value>` and `note <message>` (publishes the message
/// as a session event). Queries: `get <key>`.
pub struct KvService {
    map: BTreeMap<String, String>,
    executions: Arc<AtomicUsize>,
}

impl KvService {
    pub fn new(executions: Arc<AtomicUsize>) -> Self {
        Self {
            map: BTreeMap::new(),
            executions,
        }
    }
}

impl Service for KvService {
    fn execute(&mut self, mut commit: Commit<'_>) -> anyhow::Result<Bytes> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let op = std::str::from_utf8(commit.operation)?;
        let mut parts = op.splitn(3, ' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("put"), Some(key), Some(value)) => {
                self.map.insert(key.to_owned(), value.to_owned());
                Ok(format!("ok {key}").into())
            }
            (Some("note"), Some(message), _) => {
                let message = message.to_owned();
                commit.publish(Bytes::from(message));
                Ok(Bytes::from_static(b"noted"))
            }
            _ => anyhow::bail!("bad command: {op}"),
        }
    }

    fn query(&mut self, query: Query<'_>) -> anyhow::Result<Bytes> {
        let op = std::str::from_utf8(query.operation)?;
        let key = op
            .strip_prefix("get ")
            .ok_or_else(|| anyhow::anyhow!("bad query: {op}"))?;
        Ok(self.map.get(key).cloned().unwrap_or_default().into())
    }

    fn take_snapshot(&mut self, out: &mut Vec<u8>) {
        for (key, value) in &self.map {
            out.extend_from_slice(format!("{key}={value}\n").as_bytes());
        }
    }

    fn install_snapshot(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.map.clear();
        for line in std::str::from_utf8(data)?.lines() {
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("bad snapshot line: {line}"))?;
            self.map.insert(key.to_owned(), value.to_owned());
        }
        Ok(())
    }
}

pub fn kv_catalog(executions: Arc<AtomicUsize>) -> ServiceCatalog {
    let mut catalog = ServiceCatalog::new();
    catalog.register("kv", move || KvService::new(executions.clone()));
    catalog
}

/// Snapshot timer parked far away; cycles are driven through `compact()`.
pub fn test_config() -> ManagerConfig {
    ManagerConfig {
        snapshot_interval_ms: 3_600_000,
        completion_poll_interval_ms: 10,
        completion_max_wait_ms: 500,
        compaction_delay_ms: 10,
        ..ManagerConfig::default()
    }
}

pub struct Fixture {
    pub log: SharedLog<MemoryLog>,
    pub store: Arc<MemorySnapshotStore>,
    pub manager: ServiceManager,
    pub executions: Arc<AtomicUsize>,
}

pub fn fixture() -> Fixture {
    enable_logging();
    let log = shared(MemoryLog::new());
    let store = Arc::new(MemorySnapshotStore::new());
    let executions = Arc::new(AtomicUsize::new(0));
    let manager = ServiceManager::spawn(
        log.clone(),
        kv_catalog(executions.clone()),
        store.clone(),
        Arc::new(NullResourceMonitor),
        test_config(),
    );
    Fixture {
        log,
        store,
        manager,
        executions,
    }
}

impl Fixture {
    pub fn append(&self, entry: LogEntry) {
        self.log.lock().append(entry).unwrap();
    }

    /// Append and apply a single entry, awaiting its result.
    pub async fn apply(&self, entry: LogEntry) -> Result<ApplyOutcome, StateError> {
        let index = entry.index;
        self.append(entry);
        self.manager.apply(index).await
    }

    /// A second manager over the same log and snapshot store, as after a
    /// process restart. Counts service executions separately.
    pub fn respawn(&self) -> (ServiceManager, Arc<AtomicUsize>) {
        let executions = Arc::new(AtomicUsize::new(0));
        let manager = ServiceManager::spawn(
            self.log.clone(),
            kv_catalog(executions.clone()),
            self.store.clone(),
            Arc::new(NullResourceMonitor),
            test_config(),
        );
        (manager, executions)
    }
}

pub fn entry(index: u64, timestamp_ms: u64, kind: EntryKind) -> LogEntry {
    LogEntry {
        index,
        timestamp: Timestamp::from_millis(timestamp_ms),
        kind,
    }
}

pub fn open_session(index: u64, name: &str) -> LogEntry {
    open_session_at(index, index, name, Duration::from_secs(60))
}

pub fn open_session_at(index: u64, timestamp_ms: u64, name: &str, timeout: Duration) -> LogEntry {
    entry(
        index,
        timestamp_ms,
        EntryKind::OpenSession {
            service_name: name.to_owned(),
            service_type: "kv".to_owned(),
            member: 0,
            read_consistency: ReadConsistency::Linearizable,
            timeout,
        },
    )
}

pub fn command(index: u64, session: u64, sequence: u64, op: impl Into<String>) -> LogEntry {
    entry(
        index,
        index,
        EntryKind::Command {
            session: SessionId(session),
            sequence,
            operation: op.into().into(),
        },
    )
}

/// `acks`: `(session, command_sequence, event_index)` triples.
pub fn keep_alive(index: u64, acks: &[(u64, u64, u64)]) -> LogEntry {
    keep_alive_at(index, index, acks)
}

pub fn keep_alive_at(index: u64, timestamp_ms: u64, acks: &[(u64, u64, u64)]) -> LogEntry {
    entry(
        index,
        timestamp_ms,
        EntryKind::KeepAlive {
            sessions: acks.iter().map(|&(s, _, _)| SessionId(s)).collect(),
            command_sequences: acks.iter().map(|&(_, c, _)| c).collect(),
            event_indexes: acks.iter().map(|&(_, _, e)| e).collect(),
        },
    )
}

pub fn close_session(index: u64, session: u64, delete: bool) -> LogEntry {
    entry(
        index,
        index,
        EntryKind::CloseSession {
            session: SessionId(session),
            expired: false,
            delete,
        },
    )
}

pub fn metadata(index: u64, session: Option<u64>) -> LogEntry {
    entry(
        index,
        index,
        EntryKind::Metadata {
            session: session.map(SessionId),
        },
    )
}
