use std::time::Duration;

use bytes::Bytes;
use quorum_primitives::{ReadConsistency, SessionId, Timestamp};

/// A committed log entry handed to the service manager.
///
/// `index` is authoritative: it is assigned by the log, strictly increasing
/// and gap-free, and no payload field overrides it.
#[derive(Clone, Debug)]
pub struct LogEntry {
    pub index: u64,
    /// Wall-clock time at the leader when the entry was appended.
    pub timestamp: Timestamp,
    pub kind: EntryKind,
}

/// One arm per entry kind; dispatch is a single match.
#[derive(Clone, Debug)]
pub enum EntryKind {
    /// A mutating operation replicated through the log.
    Command {
        session: SessionId,
        sequence: u64,
        operation: Bytes,
    },
    /// A read-only operation. Queries are never written to the log; this arm
    /// exists so the wire schema can round-trip them, and a query entry read
    /// back from the log is a protocol violation.
    Query {
        session: SessionId,
        sequence: u64,
        version: u64,
        operation: Bytes,
    },
    OpenSession {
        service_name: String,
        service_type: String,
        member: u64,
        read_consistency: ReadConsistency,
        timeout: Duration,
    },
    /// Parallel vectors: `sessions[i]` acknowledges commands up to
    /// `command_sequences[i]` and events up to `event_indexes[i]`.
    KeepAlive {
        sessions: Vec<SessionId>,
        command_sequences: Vec<u64>,
        event_indexes: Vec<u64>,
    },
    CloseSession {
        session: SessionId,
        /// The session is being closed because it expired, rather than by
        /// client request.
        expired: bool,
        /// Also delete the session's service.
        delete: bool,
    },
    Metadata {
        session: Option<SessionId>,
    },
    Initialize,
    /// Cluster membership change; payload is opaque to the state machine.
    Configuration {
        members: Bytes,
    },
}

impl EntryKind {
    pub fn name(&self) -> &'static str {
        match self {
            EntryKind::Command { .. } => "command",
            EntryKind::Query { .. } => "query",
            EntryKind::OpenSession { .. } => "open-session",
            EntryKind::KeepAlive { .. } => "keep-alive",
            EntryKind::CloseSession { .. } => "close-session",
            EntryKind::Metadata { .. } => "metadata",
            EntryKind::Initialize => "initialize",
            EntryKind::Configuration { .. } => "configuration",
        }
    }
}
