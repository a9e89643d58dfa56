use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info};
use quorum_primitives::{ReadConsistency, ServiceId, SessionId, Timestamp};
use smallvec::SmallVec;
use tokio::sync::oneshot;

use crate::entry::{EntryKind, LogEntry};
use crate::error::{SnapshotError, StateError};
use crate::load::LoadMonitor;
use crate::service::{ParkedQuery, ServiceCatalog, ServiceRegistry, SessionInfo};
use crate::session::{Session, SessionRegistry};
use crate::snapshot::{Snapshot, SnapshotReader, SnapshotStore, SnapshotWriter};

use super::ApplyOutcome;

/// Owner of all state-context data: the service registry, the session
/// registry, and the snapshot store handle.
///
/// Every method runs on the state job thread, so services execute under a
/// single writer and never observe concurrent mutation.
pub(crate) struct StateCore {
    catalog: ServiceCatalog,
    services: ServiceRegistry,
    sessions: SessionRegistry,
    snapshots: Arc<dyn SnapshotStore>,
    load: LoadMonitor,
    last_applied: u64,
}

impl StateCore {
    pub fn new(
        catalog: ServiceCatalog,
        sessions: SessionRegistry,
        snapshots: Arc<dyn SnapshotStore>,
        load: LoadMonitor,
    ) -> Self {
        Self {
            catalog,
            services: ServiceRegistry::new(),
            sessions,
            snapshots,
            load,
            last_applied: 0,
        }
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    /// Apply one committed entry and advance `last_applied`.
    ///
    /// A failing user operation still advances: the failure is deterministic,
    /// so every replica consumed the entry the same way.
    pub fn apply_entry(&mut self, entry: LogEntry) -> Result<ApplyOutcome, StateError> {
        let LogEntry { index, timestamp, kind } = entry;
        let result = match kind {
            EntryKind::Command {
                session,
                sequence,
                operation,
            } => self.command(index, timestamp, session, sequence, operation),
            // Queries are never replicated through the log.
            EntryKind::Query { .. } => Err(StateError::Protocol(index)),
            EntryKind::OpenSession {
                service_name,
                service_type,
                member,
                read_consistency,
                timeout,
            } => self.open_session(index, timestamp, service_name, service_type, member, read_consistency, timeout),
            EntryKind::KeepAlive {
                sessions,
                command_sequences,
                event_indexes,
            } => self.keep_alive(index, timestamp, sessions, command_sequences, event_indexes),
            EntryKind::CloseSession {
                session,
                expired,
                delete,
            } => self.close_session(session, expired, delete),
            EntryKind::Metadata { session } => self.metadata(session),
            EntryKind::Initialize | EntryKind::Configuration { .. } => self.heartbeat(index, timestamp),
        };
        self.advance(index);
        result
    }

    /// Move `last_applied` forward (e.g. past an entry a snapshot already
    /// covered) and release any queries whose version gate is now satisfied.
    pub fn advance(&mut self, index: u64) {
        if index > self.last_applied {
            self.last_applied = index;
        }
        self.drain_queries();
    }

    fn command(
        &mut self,
        index: u64,
        timestamp: Timestamp,
        session_id: SessionId,
        sequence: u64,
        operation: Bytes,
    ) -> Result<ApplyOutcome, StateError> {
        self.load.record();
        let service = self
            .sessions
            .with_session(session_id, |s| s.service())
            .ok_or(StateError::UnknownSession(session_id))?;
        let ctx = self
            .services
            .get_mut(service)
            .ok_or(StateError::UnknownSession(session_id))?;
        ctx.execute_command(&self.sessions, index, sequence, timestamp, session_id, &operation)
            .map(ApplyOutcome::Output)
    }

    #[allow(clippy::too_many_arguments)]
    fn open_session(
        &mut self,
        index: u64,
        timestamp: Timestamp,
        service_name: String,
        service_type: String,
        member: u64,
        read_consistency: ReadConsistency,
        timeout: Duration,
    ) -> Result<ApplyOutcome, StateError> {
        let service = match self.services.id_by_name(&service_name) {
            Some(id) => id,
            None => {
                let instance = self
                    .catalog
                    .create(&service_type)
                    .ok_or_else(|| StateError::UnknownService(service_type.clone()))?;
                info!("materialized service `{service_name}` ({service_type})");
                self.services.register(service_name.clone(), service_type, instance)
            }
        };
        let session_id = SessionId(index);
        let session = Session::new(session_id, service, member, read_consistency, timeout, timestamp);
        if let Some(ctx) = self.services.get_mut(service) {
            ctx.session_opened(&session);
        }
        self.sessions.add(session);
        debug!("opened session {session_id} on `{service_name}`");
        Ok(ApplyOutcome::Session(session_id))
    }

    fn keep_alive(
        &mut self,
        index: u64,
        timestamp: Timestamp,
        ids: Vec<SessionId>,
        command_sequences: Vec<u64>,
        event_indexes: Vec<u64>,
    ) -> Result<ApplyOutcome, StateError> {
        let mut successful = Vec::new();
        let mut touched: SmallVec<[ServiceId; 4]> = SmallVec::new();
        for ((id, sequence), event_index) in ids.iter().zip(&command_sequences).zip(&event_indexes) {
            let service = self.sessions.with_session_mut(*id, |session| {
                session.acknowledge(index, timestamp, *sequence, *event_index);
                session.service()
            });
            if let Some(service) = service {
                successful.push(*id);
                if !touched.contains(&service) {
                    touched.push(service);
                }
            }
        }
        for service in touched {
            self.complete_keep_alive(service, index, timestamp);
        }
        self.sweep_orphaned(timestamp);
        Ok(ApplyOutcome::Sessions(successful))
    }

    /// Expire this service's sessions that have outlived their timeout,
    /// judged against the keep-alive entry's timestamp.
    fn complete_keep_alive(&mut self, service: ServiceId, _index: u64, now: Timestamp) {
        let Some(ctx) = self.services.get_mut(service) else {
            return;
        };
        for id in self.sessions.sessions_for(service) {
            let timed_out = self.sessions.with_session(id, |s| s.timed_out(now)).unwrap_or(false);
            if timed_out {
                if let Some(session) = self.sessions.remove(id) {
                    info!("session {id} expired");
                    ctx.session_closed(&session, true);
                }
            }
        }
    }

    /// Sessions whose service was deleted are swept once they time out.
    fn sweep_orphaned(&mut self, now: Timestamp) {
        for id in self.sessions.session_ids() {
            let Some((service, timed_out)) = self.sessions.with_session(id, |s| (s.service(), s.timed_out(now)))
            else {
                continue;
            };
            if timed_out && self.services.get(service).is_none() {
                self.sessions.remove(id);
                debug!("swept expired session {id} of deleted service {service}");
            }
        }
    }

    fn close_session(&mut self, id: SessionId, expired: bool, delete: bool) -> Result<ApplyOutcome, StateError> {
        let session = self.sessions.remove(id).ok_or(StateError::UnknownSession(id))?;
        if let Some(ctx) = self.services.get_mut(session.service()) {
            ctx.session_closed(&session, expired);
            if delete {
                info!("deleted service `{}` ({})", ctx.name(), ctx.id());
                self.services.unregister(session.service());
            }
        }
        Ok(ApplyOutcome::None)
    }

    fn metadata(&self, filter: Option<SessionId>) -> Result<ApplyOutcome, StateError> {
        let service_filter = match filter {
            Some(id) => Some(
                self.sessions
                    .with_session(id, |s| s.service())
                    .ok_or(StateError::UnknownSession(id))?,
            ),
            None => None,
        };
        let mut infos = Vec::new();
        for id in self.sessions.session_ids() {
            let Some(service) = self.sessions.with_session(id, |s| s.service()) else {
                continue;
            };
            if service_filter.is_some_and(|f| f != service) {
                continue;
            }
            if let Some(ctx) = self.services.get(service) {
                infos.push(SessionInfo {
                    session: id,
                    service_name: ctx.name().to_owned(),
                    service_type: ctx.type_name().to_owned(),
                });
            }
        }
        Ok(ApplyOutcome::Metadata(infos))
    }

    /// Initialize and configuration entries refresh session timing without
    /// any other side effect.
    fn heartbeat(&mut self, index: u64, timestamp: Timestamp) -> Result<ApplyOutcome, StateError> {
        for ctx in self.services.iter_mut() {
            ctx.keep_alive_sessions(&self.sessions, index, timestamp);
        }
        Ok(ApplyOutcome::None)
    }

    /// Run a query now if `last_applied` has reached the client's observed
    /// version, otherwise park it on the session's service.
    pub fn submit_query(
        &mut self,
        session: SessionId,
        sequence: u64,
        version: u64,
        timestamp: Timestamp,
        operation: Bytes,
        respond_to: oneshot::Sender<Result<Bytes, StateError>>,
    ) {
        let Some(service) = self.sessions.with_session(session, |s| s.service()) else {
            let _ = respond_to.send(Err(StateError::UnknownSession(session)));
            return;
        };
        let Some(ctx) = self.services.get_mut(service) else {
            let _ = respond_to.send(Err(StateError::UnknownSession(session)));
            return;
        };
        if version > self.last_applied {
            debug!("parking query for session {session} until index {version} applies");
            ctx.park_query(ParkedQuery {
                version,
                session,
                sequence,
                timestamp,
                operation,
                respond_to,
            });
            return;
        }
        let result = ctx.execute_query(&self.sessions, self.last_applied, sequence, timestamp, session, &operation);
        let _ = respond_to.send(result);
    }

    fn drain_queries(&mut self) {
        let last_applied = self.last_applied;
        for ctx in self.services.iter_mut() {
            for query in ctx.take_ready_queries(last_applied) {
                let result = ctx.execute_query(
                    &self.sessions,
                    last_applied,
                    query.sequence,
                    query.timestamp,
                    query.session,
                    &query.operation,
                );
                let _ = query.respond_to.send(result);
            }
        }
    }

    /// Serialize every service, in registration order, into one snapshot
    /// image and stage it with the store.
    pub fn take_snapshot(&mut self, index: u64, timestamp: Timestamp) -> Result<(), SnapshotError> {
        let mut writer = SnapshotWriter::new();
        let sessions = &self.sessions;
        for ctx in self.services.iter_mut() {
            let body = ctx.take_snapshot();
            writer.append(ctx.id(), ctx.type_name(), ctx.name(), &body, &sessions.snapshot_service(ctx.id()));
        }
        info!("captured snapshot of {} services at index {index}", self.services.len());
        self.snapshots.save(Snapshot {
            index,
            timestamp,
            data: writer.finish(),
        })
    }

    /// Whether every session has acknowledged all events up to `index`.
    pub fn snapshot_caught_up(&self, index: u64) -> bool {
        self.sessions.min_last_completed().map_or(true, |min| min >= index)
    }

    pub fn finalize_snapshot(&self, index: u64) -> Result<(), SnapshotError> {
        self.snapshots.complete(index).map(drop)
    }

    /// Replace service state from a snapshot stream. Rebinding a name purges
    /// the previous instance and all of its sessions, since the service id
    /// changes.
    pub fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<(), StateError> {
        info!("installing snapshot at index {}", snapshot.index);
        for record in SnapshotReader::new(&snapshot.data) {
            let record = record?;
            if let Some(previous) = self.services.id_by_name(&record.service_name) {
                self.services.unregister(previous);
                let purged = self.sessions.remove_service(previous);
                if !purged.is_empty() {
                    debug!(
                        "purged {} sessions of replaced service `{}`",
                        purged.len(),
                        record.service_name
                    );
                }
            }
            let instance = self
                .catalog
                .create(&record.service_type)
                .ok_or_else(|| StateError::UnknownService(record.service_type.clone()))?;
            for session in &record.sessions {
                self.sessions.add(Session::restore(record.service_id, session));
            }
            let ctx = self
                .services
                .adopt(record.service_id, record.service_name, record.service_type, instance);
            ctx.install_snapshot(&record.body).map_err(StateError::Service)?;
        }
        self.advance(snapshot.index);
        Ok(())
    }
}
