use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use log::{debug, error, info, warn};
use quorum_primitives::{SessionId, Timestamp};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::config::ManagerConfig;
use crate::entry::EntryKind;
use crate::error::{LogError, StateError};
use crate::load::LoadMonitor;
use crate::monitor::ResourceMonitor;
use crate::service::ServiceCatalog;
use crate::session::SessionRegistry;
use crate::snapshot::SnapshotStore;
use crate::storage::{LogReader, LogStats, SharedLog, StateLog};
use crate::util::{JobThread, OrderedNotify};

use super::state::StateCore;
use super::ApplyOutcome;

type ApplyResult = Result<ApplyOutcome, StateError>;

enum ManagerCommand {
    Apply {
        index: u64,
        respond_to: Option<oneshot::Sender<ApplyResult>>,
    },
    Query {
        session: SessionId,
        sequence: u64,
        version: u64,
        operation: Bytes,
        respond_to: oneshot::Sender<Result<Bytes, StateError>>,
    },
    Compact {
        respond_to: oneshot::Sender<()>,
    },
    CompactionDone,
    CompactionAborted {
        index: u64,
    },
    Exit,
}

/// Handle to the replicated service manager.
///
/// The manager runs as a single actor task (the server context) that owns the
/// log reader, the per-index result promises, and the snapshot scheduler, and
/// a dedicated state thread that owns all service execution. The handle is
/// cheap to clone; dropping every clone shuts both down.
///
/// Must be spawned from within a tokio runtime.
#[derive(Clone)]
pub struct ServiceManager {
    tx: mpsc::UnboundedSender<ManagerCommand>,
}

impl ServiceManager {
    pub fn spawn<L: StateLog>(
        log: SharedLog<L>,
        catalog: ServiceCatalog,
        snapshots: Arc<dyn SnapshotStore>,
        monitor: Arc<dyn ResourceMonitor>,
        config: ManagerConfig,
    ) -> Self {
        let load = LoadMonitor::new(config.load_window(), config.load_threshold);
        let sessions = SessionRegistry::new();
        let state = {
            let sessions = sessions.clone();
            let snapshots = snapshots.clone();
            let load = load.clone();
            JobThread::spawn(move || StateCore::new(catalog, sessions, snapshots, load))
        };
        let reader = LogReader::new(log.clone());
        let first = reader.next_index();
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = ManagerActor {
            rx,
            tx: tx.clone(),
            log,
            reader,
            state,
            pending: HashMap::new(),
            last_enqueued: first.saturating_sub(1),
            last_applied: first.saturating_sub(1),
            last_compacted: first.saturating_sub(1),
            prev_compacted: first.saturating_sub(1),
            state_applied: 0,
            compaction: None,
            snapshots,
            load,
            monitor,
            config,
        };
        tokio::spawn(actor.run());
        ServiceManager { tx }
    }

    /// Drain and apply all committed entries up to and including `index`.
    /// Fire-and-forget; failures are logged.
    pub fn apply_all(&self, index: u64) {
        let _ = self.tx.send(ManagerCommand::Apply { index, respond_to: None });
    }

    /// Apply up to `index` and resolve with the result of that entry.
    pub async fn apply(&self, index: u64) -> ApplyResult {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ManagerCommand::Apply {
                index,
                respond_to: Some(tx),
            })
            .map_err(|_| StateError::Closed)?;
        rx.await.map_err(|_| StateError::Closed)?
    }

    /// Run a read-only query against a session's service.
    ///
    /// The query is held until `last_applied` reaches `version`, the highest
    /// index the client has observed, preserving monotonic reads across
    /// server switches.
    pub async fn query(
        &self,
        session: SessionId,
        sequence: u64,
        version: u64,
        operation: impl Into<Bytes>,
    ) -> Result<Bytes, StateError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ManagerCommand::Query {
                session,
                sequence,
                version,
                operation: operation.into(),
                respond_to: tx,
            })
            .map_err(|_| StateError::Closed)?;
        rx.await.map_err(|_| StateError::Closed)?
    }

    /// Force a snapshot + compaction cycle and wait for it to settle.
    ///
    /// Resolves once the in-flight (or newly started) cycle completes; also
    /// resolves immediately when there is nothing to compact.
    pub async fn compact(&self) -> Result<(), StateError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ManagerCommand::Compact { respond_to: tx })
            .map_err(|_| StateError::Closed)?;
        rx.await.map_err(|_| StateError::Closed)
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(ManagerCommand::Exit);
    }
}

struct ManagerActor<L> {
    rx: mpsc::UnboundedReceiver<ManagerCommand>,
    /// For self-sends from the completion task.
    tx: mpsc::UnboundedSender<ManagerCommand>,
    log: SharedLog<L>,
    reader: LogReader<L>,
    state: JobThread<StateCore>,
    pending: HashMap<u64, oneshot::Sender<ApplyResult>>,
    /// Highest index dispatched into the apply pipeline.
    last_enqueued: u64,
    /// Highest index whose application has completed.
    last_applied: u64,
    /// Index up to which a snapshot cycle has been started.
    last_compacted: u64,
    /// `last_compacted` before the in-flight cycle, restored if it aborts.
    prev_compacted: u64,
    /// Highest index the state context has observed, through application or
    /// snapshot install. Fresh state starts at 0.
    state_applied: u64,
    /// The in-flight compaction cycle, if any.
    compaction: Option<OrderedNotify>,
    snapshots: Arc<dyn SnapshotStore>,
    load: LoadMonitor,
    monitor: Arc<dyn ResourceMonitor>,
    config: ManagerConfig,
}

impl<L: StateLog> ManagerActor<L> {
    async fn run(mut self) {
        let mut timer = tokio::time::interval(self.config.snapshot_interval());
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(ManagerCommand::Apply { index, respond_to }) => {
                        self.handle_apply(index, respond_to).await;
                    }
                    Some(ManagerCommand::Query { session, sequence, version, operation, respond_to }) => {
                        let timestamp = Timestamp::now();
                        self.state
                            .run(move |core| core.submit_query(session, sequence, version, timestamp, operation, respond_to))
                            .await;
                    }
                    Some(ManagerCommand::Compact { respond_to }) => {
                        let notify = self.snapshot_services(true).await;
                        notify.on_complete(move || {
                            let _ = respond_to.send(());
                        });
                    }
                    Some(ManagerCommand::CompactionDone) => self.compaction_done().await,
                    Some(ManagerCommand::CompactionAborted { index }) => self.compaction_aborted(index),
                    Some(ManagerCommand::Exit) | None => break,
                },
                _ = timer.tick() => {
                    self.snapshot_services(false).await;
                }
            }
        }
    }

    async fn handle_apply(&mut self, index: u64, respond_to: Option<oneshot::Sender<ApplyResult>>) {
        if let Some(tx) = respond_to {
            if index <= self.last_enqueued {
                // Already dispatched; a promise armed this late can only be
                // out of range.
                let _ = tx.send(Err(StateError::IndexOutOfBounds {
                    index,
                    next: self.reader.next_index(),
                }));
            } else {
                self.pending.insert(index, tx);
            }
        }
        while self.last_enqueued < index {
            let next = self.last_enqueued + 1;
            if !self.apply_index(next).await {
                // Reader-level failure: stop draining, leave the cursor where
                // it is and retry on the next apply call.
                break;
            }
            self.last_enqueued = next;
        }
    }

    /// Apply one index. Returns false on a reader-level failure, which halts
    /// the drain; user-operation failures consume the entry and return true.
    async fn apply_index(&mut self, index: u64) -> bool {
        if self.reader.next_index() != index {
            let next = self.reader.next_index();
            warn!("cannot apply index {index}: reader is at {next}");
            self.resolve(index, Err(StateError::IndexOutOfBounds { index, next }));
            return false;
        }
        let entry = match self.reader.read() {
            Ok(entry) => entry,
            Err(LogError::OutOfRange { next, .. }) => {
                self.resolve(index, Err(StateError::IndexOutOfBounds { index, next }));
                return false;
            }
            Err(e) => {
                error!("failed to read log entry {index}: {e}");
                self.resolve(index, Err(e.into()));
                return false;
            }
        };
        debug_assert_eq!(entry.index, index);

        if matches!(entry.kind, EntryKind::Query { .. }) {
            // Queries are never replicated; consuming one from the log is a
            // deterministic protocol failure.
            warn!("query entry found in log at index {index}");
            self.state.run(move |core| core.advance(index)).await;
            self.mark_applied(index);
            self.resolve(index, Err(StateError::Protocol(index)));
            return true;
        }

        if let Some(snapshot) = self.snapshots.current() {
            if snapshot.index >= index {
                // Replay already covered by the snapshot. Note that only
                // `last_applied` moves: the state context has not observed
                // this entry's content, the snapshot carries it.
                self.state.run(move |core| core.advance(index)).await;
                self.last_applied = self.last_applied.max(index);
                self.resolve(index, Ok(ApplyOutcome::None));
                return true;
            }
            if snapshot.index + 1 == index && snapshot.index > self.state_applied {
                // The state machine is behind the snapshot; catch it up
                // before applying this entry.
                let snapshot_index = snapshot.index;
                match self.state.run(move |core| core.install_snapshot(snapshot)).await {
                    Ok(()) => self.state_applied = snapshot_index,
                    Err(e) => error!("failed to install snapshot at index {snapshot_index}: {e}"),
                }
            }
        }

        debug!("applying {} entry at index {index}", entry.kind.name());
        let result = self.state.run(move |core| core.apply_entry(entry)).await;
        self.mark_applied(index);
        self.resolve(index, result);
        true
    }

    fn mark_applied(&mut self, index: u64) {
        self.last_applied = self.last_applied.max(index);
        self.state_applied = self.state_applied.max(index);
    }

    fn resolve(&mut self, index: u64, result: ApplyResult) {
        match self.pending.remove(&index) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => {
                if let Err(e) = result {
                    debug!("apply of index {index} failed: {e}");
                }
            }
        }
    }

    /// Evaluate the snapshot policy and, when warranted, start a snapshot +
    /// compaction cycle. Returns a handle that completes when the cycle
    /// settles; an already-completed handle means nothing was started.
    async fn snapshot_services(&mut self, force: bool) -> OrderedNotify {
        if let Some(compaction) = &self.compaction {
            return compaction.clone();
        }
        let applied = self.last_applied;
        let (compactable, compactable_index, stats) = {
            let log = self.log.lock();
            (log.is_compactable(applied), log.compactable_index(applied), log.stats())
        };
        if !compactable || compactable_index <= self.last_compacted {
            return OrderedNotify::completed();
        }

        let disk_pressure = disk_pressure(&*self.monitor, &stats, self.config.free_disk_buffer);
        let memory_pressure = memory_pressure(&*self.monitor, &stats, self.config.free_memory_buffer);
        let high_load = self.load.is_under_high_load();

        if !force && !memory_pressure && self.config.dynamic_compaction && !disk_pressure && high_load {
            debug!("deferring snapshot at index {applied}: high load and no pressure");
            return OrderedNotify::completed();
        }

        self.prev_compacted = self.last_compacted;
        self.last_compacted = applied;
        let notify = OrderedNotify::new();
        self.compaction = Some(notify.clone());

        info!("taking snapshot at index {applied}");
        let timestamp = Timestamp::now();
        match self.state.run(move |core| core.take_snapshot(applied, timestamp)).await {
            Ok(()) => self.spawn_completion(applied),
            Err(e) => {
                error!("failed to take snapshot at index {applied}: {e}");
                self.last_compacted = self.prev_compacted;
                if let Some(compaction) = self.compaction.take() {
                    compaction.complete();
                }
            }
        }
        notify
    }

    /// Poll session watermarks until the snapshot at `index` can be
    /// finalized, then compact the log prefix it covers.
    fn spawn_completion(&self, index: u64) {
        let state = self.state.clone();
        let tx = self.tx.clone();
        let log = self.log.clone();
        let load = self.load.clone();
        let monitor = self.monitor.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            loop {
                if state.run(move |core| core.snapshot_caught_up(index)).await {
                    break;
                }
                if started.elapsed() >= config.completion_max_wait() {
                    warn!(
                        "abandoning snapshot at index {index}: sessions did not catch up within {:?}",
                        config.completion_max_wait()
                    );
                    let _ = tx.send(ManagerCommand::CompactionAborted { index });
                    return;
                }
                tokio::time::sleep(config.completion_poll_interval()).await;
            }

            if let Err(e) = state.run(move |core| core.finalize_snapshot(index)).await {
                warn!("failed to finalize snapshot at index {index}: {e}");
                let _ = tx.send(ManagerCommand::CompactionAborted { index });
                return;
            }
            info!("finalized snapshot at index {index}");

            let stats = log.lock().stats();
            let pressure = disk_pressure(&*monitor, &stats, config.free_disk_buffer)
                || memory_pressure(&*monitor, &stats, config.free_memory_buffer);
            if load.is_under_high_load() && !pressure {
                // Randomize the delay so peers do not all compact at once.
                let delay = config.compaction_delay().mul_f64(0.5 + rand::random::<f64>());
                debug!("delaying compaction of prefix {index} by {delay:?}");
                tokio::time::sleep(delay).await;
            }
            let result = log.lock().compact(index);
            match result {
                Ok(()) => info!("compacted log up to index {index}"),
                // The snapshot is finalized either way; unblock callers and
                // let the next cycle retry.
                Err(e) => warn!("failed to compact log up to index {index}: {e}"),
            }
            let _ = tx.send(ManagerCommand::CompactionDone);
        });
    }

    async fn compaction_done(&mut self) {
        if let Some(compaction) = self.compaction.take() {
            compaction.complete();
        }
        // Re-evaluate right away in case application ran ahead while the
        // cycle was in flight; this is a fresh invocation, not a recursion
        // into the completed cycle.
        self.snapshot_services(false).await;
    }

    fn compaction_aborted(&mut self, index: u64) {
        self.last_compacted = self.prev_compacted;
        self.snapshots.abandon(index);
        if let Some(compaction) = self.compaction.take() {
            compaction.complete();
        }
    }
}

fn disk_pressure(monitor: &dyn ResourceMonitor, stats: &LogStats, buffer: f64) -> bool {
    let Some(directory) = &stats.directory else {
        return false;
    };
    let Some(space) = monitor.disk(directory) else {
        return false;
    };
    space.usable < stats.max_segment_size.saturating_mul(5) || (space.usable as f64) < (space.total as f64) * buffer
}

fn memory_pressure(monitor: &dyn ResourceMonitor, stats: &LogStats, buffer: f64) -> bool {
    if !stats.flavor.in_memory() {
        return false;
    }
    let Some(memory) = monitor.memory() else {
        return false;
    };
    (memory.free as f64) < (memory.total as f64) * buffer
}
