use quorum_primitives::SessionId;
use thiserror::Error;

/// Errors surfaced through the per-index apply future.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error("unknown service type `{0}`")]
    UnknownService(String),
    #[error("entry at index {0} cannot be applied to the state machine")]
    Protocol(u64),
    #[error("cannot apply index {index}, reader is at {next}")]
    IndexOutOfBounds { index: u64, next: u64 },
    #[error("log read failed: {0}")]
    Log(#[from] LogError),
    #[error("snapshot failed: {0}")]
    Snapshot(#[from] SnapshotError),
    /// A deterministic failure raised by the user service. The entry is still
    /// consumed and `last_applied` advances, since every replica fails the
    /// same way.
    #[error("service operation failed: {0}")]
    Service(#[source] anyhow::Error),
    #[error("service manager is shut down")]
    Closed,
}

/// Errors raised by a [`crate::storage::StateLog`] implementation.
#[derive(Error, Debug)]
pub enum LogError {
    #[error("index {index} out of range {first}..{next}")]
    OutOfRange { index: u64, first: u64, next: u64 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised by a [`crate::snapshot::SnapshotStore`] or while parsing a
/// snapshot stream.
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("no pending snapshot at index {0}")]
    NotFound(u64),
    #[error("truncated snapshot record at byte offset {0}")]
    Truncated(usize),
    #[error("malformed snapshot record: {0}")]
    Malformed(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
