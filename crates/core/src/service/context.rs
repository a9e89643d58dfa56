use bytes::Bytes;
use log::debug;
use quorum_primitives::{ServiceId, SessionId, Timestamp};
use tokio::sync::oneshot;

use crate::error::StateError;
use crate::session::{Session, SessionRegistry};

use super::{Commit, Query, Service};

/// A read-only query waiting for `last_applied` to reach the version its
/// client has already observed elsewhere.
pub(crate) struct ParkedQuery {
    pub version: u64,
    pub session: SessionId,
    pub sequence: u64,
    pub timestamp: Timestamp,
    pub operation: Bytes,
    pub respond_to: oneshot::Sender<Result<Bytes, StateError>>,
}

/// Per-service execution envelope: owns the user [`Service`] instance and the
/// service's parked queries. All methods run on the state context.
pub struct ServiceContext {
    id: ServiceId,
    name: String,
    type_name: String,
    instance: Box<dyn Service>,
    parked: Vec<ParkedQuery>,
}

impl ServiceContext {
    pub(crate) fn new(id: ServiceId, name: String, type_name: String, instance: Box<dyn Service>) -> Self {
        Self {
            id,
            name,
            type_name,
            instance,
            parked: Vec::new(),
        }
    }

    pub fn id(&self) -> ServiceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Apply a command, deduplicating by client sequence number.
    ///
    /// A sequence at or below the session's watermark is a client retry: the
    /// cached result is returned and the service never sees the operation.
    pub(crate) fn execute_command(
        &mut self,
        sessions: &SessionRegistry,
        index: u64,
        sequence: u64,
        timestamp: Timestamp,
        session_id: SessionId,
        operation: &Bytes,
    ) -> Result<Bytes, StateError> {
        let instance = &mut self.instance;
        sessions
            .with_session_mut(session_id, |session| {
                if sequence <= session.command_sequence() {
                    return match session.cached_result(sequence) {
                        Some(Ok(output)) => Ok(output.clone()),
                        Some(Err(message)) => Err(StateError::Service(anyhow::anyhow!(message.clone()))),
                        None => {
                            // Already acknowledged and released; the client
                            // can no longer be waiting on this result.
                            debug!("session {session_id}: result for sequence {sequence} already released");
                            Ok(Bytes::new())
                        }
                    };
                }
                session.refresh(timestamp);
                let result = instance.execute(Commit {
                    index,
                    sequence,
                    timestamp,
                    operation: operation.as_ref(),
                    session,
                });
                let cached = match &result {
                    Ok(output) => Ok(output.clone()),
                    Err(e) => Err(format!("{e:#}")),
                };
                session.complete_command(sequence, cached);
                result.map_err(StateError::Service)
            })
            .ok_or(StateError::UnknownSession(session_id))?
    }

    pub(crate) fn execute_query(
        &mut self,
        sessions: &SessionRegistry,
        index: u64,
        sequence: u64,
        timestamp: Timestamp,
        session_id: SessionId,
        operation: &Bytes,
    ) -> Result<Bytes, StateError> {
        let instance = &mut self.instance;
        sessions
            .with_session(session_id, |session| {
                instance
                    .query(Query {
                        index,
                        sequence,
                        timestamp,
                        operation: operation.as_ref(),
                        session,
                    })
                    .map_err(StateError::Service)
            })
            .ok_or(StateError::UnknownSession(session_id))?
    }

    pub(crate) fn park_query(&mut self, query: ParkedQuery) {
        self.parked.push(query);
    }

    /// Take the parked queries whose version gate has been satisfied.
    pub(crate) fn take_ready_queries(&mut self, last_applied: u64) -> Vec<ParkedQuery> {
        let mut ready = Vec::new();
        let mut i = 0;
        while i < self.parked.len() {
            if self.parked[i].version <= last_applied {
                ready.push(self.parked.remove(i));
            } else {
                i += 1;
            }
        }
        ready
    }

    pub(crate) fn session_opened(&mut self, session: &Session) {
        self.instance.session_opened(session);
    }

    pub(crate) fn session_closed(&mut self, session: &Session, expired: bool) {
        self.instance.session_closed(session, expired);
    }

    /// Refresh every session of this service from a heartbeat entry.
    pub(crate) fn keep_alive_sessions(&mut self, sessions: &SessionRegistry, _index: u64, timestamp: Timestamp) {
        for id in sessions.sessions_for(self.id) {
            sessions.with_session_mut(id, |session| session.refresh(timestamp));
        }
    }

    pub(crate) fn take_snapshot(&mut self) -> Vec<u8> {
        let mut body = Vec::new();
        self.instance.take_snapshot(&mut body);
        body
    }

    pub(crate) fn install_snapshot(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.instance.install_snapshot(data)
    }
}
