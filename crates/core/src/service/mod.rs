use std::collections::HashMap;

use bytes::Bytes;
use quorum_primitives::{SessionId, Timestamp};

use crate::session::Session;

mod context;
mod registry;

pub(crate) use context::ParkedQuery;
pub use context::ServiceContext;
pub use registry::ServiceRegistry;

/// Execution context for a committed command.
pub struct Commit<'a> {
    /// Log index of the command entry.
    pub index: u64,
    /// Client-assigned sequence number.
    pub sequence: u64,
    /// Leader wall-clock time of the entry.
    pub timestamp: Timestamp,
    pub operation: &'a [u8],
    pub session: &'a mut Session,
}

impl Commit<'_> {
    /// Publish an event to the command's session. Events are retained until
    /// the client acknowledges them through a keep-alive.
    pub fn publish(&mut self, event: impl Into<Bytes>) {
        let index = self.index;
        self.session.publish(index, event.into());
    }
}

/// Execution context for a read-only query.
pub struct Query<'a> {
    /// Highest applied index at the time the query runs.
    pub index: u64,
    pub sequence: u64,
    pub timestamp: Timestamp,
    pub operation: &'a [u8],
    pub session: &'a Session,
}

/// A user-provided deterministic state machine.
///
/// Implementations must be deterministic functions of the entries applied to
/// them: identical entry streams on two replicas must produce identical
/// state, results, and snapshots. Failures count too; an operation that
/// errors must error identically everywhere.
pub trait Service: Send + 'static {
    /// Apply a replicated command, optionally publishing session events.
    fn execute(&mut self, commit: Commit<'_>) -> anyhow::Result<Bytes>;

    /// Answer a read-only query. Must not mutate observable state and never
    /// publishes events.
    fn query(&mut self, query: Query<'_>) -> anyhow::Result<Bytes>;

    /// Serialize the full service state into `out`.
    fn take_snapshot(&mut self, out: &mut Vec<u8>);

    /// Replace the service state with a previously taken snapshot.
    fn install_snapshot(&mut self, data: &[u8]) -> anyhow::Result<()>;

    /// A session was opened against this service.
    fn session_opened(&mut self, _session: &Session) {}

    /// A session was closed, either by the client or by expiration.
    fn session_closed(&mut self, _session: &Session, _expired: bool) {}
}

type ServiceFactory = Box<dyn Fn() -> Box<dyn Service> + Send>;

/// Named constructors for the service types this node can materialize.
///
/// An `OpenSession` entry naming a type absent from the catalog fails with
/// `UnknownService`, deterministically, since every replica runs the same
/// catalog.
#[derive(Default)]
pub struct ServiceCatalog {
    factories: HashMap<String, ServiceFactory>,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S, F>(&mut self, service_type: impl Into<String>, factory: F)
    where
        S: Service,
        F: Fn() -> S + Send + 'static,
    {
        self.factories
            .insert(service_type.into(), Box::new(move || Box::new(factory())));
    }

    pub fn create(&self, service_type: &str) -> Option<Box<dyn Service>> {
        self.factories.get(service_type).map(|factory| factory())
    }

    pub fn contains(&self, service_type: &str) -> bool {
        self.factories.contains_key(service_type)
    }
}

/// One row of a metadata listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionInfo {
    pub session: SessionId,
    pub service_name: String,
    pub service_type: String,
}
