use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use quorum_primitives::{ReadConsistency, ServiceId, SessionId, Timestamp};

use crate::snapshot::SessionSnapshot;

mod registry;

pub use registry::SessionRegistry;

/// A deterministic command result retained for duplicate detection, keyed by
/// client sequence number until the client acknowledges it.
pub type CachedResult = Result<Bytes, String>;

/// Events published to a session at one log index.
#[derive(Clone, Debug)]
pub struct EventBatch {
    pub index: u64,
    pub events: Vec<Bytes>,
}

/// A client's handle against one service.
///
/// Watermarks (`command_sequence`, `event_index`, `last_completed`) only ever
/// move forward; every mutator max-updates.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    service: ServiceId,
    member: u64,
    read_consistency: ReadConsistency,
    timeout: Duration,
    last_updated: Timestamp,
    trusted: bool,
    command_sequence: u64,
    results: HashMap<u64, CachedResult>,
    events: VecDeque<EventBatch>,
    event_index: u64,
    last_completed: u64,
}

impl Session {
    pub fn new(
        id: SessionId,
        service: ServiceId,
        member: u64,
        read_consistency: ReadConsistency,
        timeout: Duration,
        opened: Timestamp,
    ) -> Self {
        Self {
            id,
            service,
            member,
            read_consistency,
            timeout,
            last_updated: opened,
            trusted: false,
            command_sequence: 0,
            results: HashMap::new(),
            events: VecDeque::new(),
            // Everything up to the opening entry is trivially acknowledged.
            event_index: id.0,
            last_completed: id.0,
        }
    }

    /// Rebuild a session from its snapshotted watermarks. Cached command
    /// results and unacknowledged events are not restored.
    pub fn restore(service: ServiceId, snapshot: &SessionSnapshot) -> Self {
        Self {
            id: snapshot.session,
            service,
            member: snapshot.member,
            read_consistency: snapshot.read_consistency,
            timeout: snapshot.timeout,
            last_updated: snapshot.last_updated,
            trusted: false,
            command_sequence: snapshot.command_sequence,
            results: HashMap::new(),
            events: VecDeque::new(),
            event_index: snapshot.event_index,
            last_completed: snapshot.last_completed,
        }
    }

    /// Capture the watermarks that survive a snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session: self.id,
            member: self.member,
            read_consistency: self.read_consistency,
            timeout: self.timeout,
            last_updated: self.last_updated,
            command_sequence: self.command_sequence,
            event_index: self.event_index,
            last_completed: self.last_completed,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn service(&self) -> ServiceId {
        self.service
    }

    pub fn member(&self) -> u64 {
        self.member
    }

    pub fn read_consistency(&self) -> ReadConsistency {
        self.read_consistency
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn last_updated(&self) -> Timestamp {
        self.last_updated
    }

    /// Whether a keep-alive has been applied for this session, i.e. the
    /// client has proven it is still alive since the session was opened.
    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    /// Highest command sequence number applied for this session.
    pub fn command_sequence(&self) -> u64 {
        self.command_sequence
    }

    /// Highest event publication index the client has acknowledged.
    pub fn event_index(&self) -> u64 {
        self.event_index
    }

    /// Highest index for which all of this session's events have been
    /// acknowledged by the client.
    pub fn last_completed(&self) -> u64 {
        self.last_completed
    }

    pub fn pending_events(&self) -> usize {
        self.events.iter().map(|b| b.events.len()).sum()
    }

    /// Whether the session has gone longer than its timeout without being
    /// refreshed, judged against a log entry timestamp.
    pub fn timed_out(&self, now: Timestamp) -> bool {
        now.duration_since(self.last_updated) > self.timeout
    }

    pub fn refresh(&mut self, now: Timestamp) {
        self.last_updated = self.last_updated.max(now);
    }

    /// Queue an event published while applying the entry at `index`.
    pub fn publish(&mut self, index: u64, event: Bytes) {
        match self.events.back_mut() {
            Some(batch) if batch.index == index => batch.events.push(event),
            _ => self.events.push_back(EventBatch {
                index,
                events: vec![event],
            }),
        }
    }

    /// Record the outcome of the command with `sequence`, advancing the
    /// duplicate-detection watermark.
    pub fn complete_command(&mut self, sequence: u64, result: CachedResult) {
        self.command_sequence = self.command_sequence.max(sequence);
        self.results.insert(sequence, result);
    }

    pub fn cached_result(&self, sequence: u64) -> Option<&CachedResult> {
        self.results.get(&sequence)
    }

    /// Apply a keep-alive carried by the entry at `ack_index`: refresh the
    /// session, release cached command results up to `command_sequence` and
    /// events up to `event_index`, and advance `last_completed`.
    pub fn acknowledge(&mut self, ack_index: u64, now: Timestamp, command_sequence: u64, event_index: u64) {
        self.refresh(now);
        self.trusted = true;
        self.results.retain(|&sequence, _| sequence > command_sequence);
        self.event_index = self.event_index.max(event_index);
        while let Some(front) = self.events.front() {
            if front.index <= event_index {
                self.events.pop_front();
            } else {
                break;
            }
        }
        // With nothing outstanding, every event up to the acknowledging entry
        // itself has been seen; otherwise completion stops just short of the
        // oldest unacknowledged batch.
        let completed = match self.events.front() {
            Some(front) => front.index - 1,
            None => ack_index,
        };
        self.last_completed = self.last_completed.max(completed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(
            SessionId(5),
            ServiceId(1),
            0,
            ReadConsistency::Linearizable,
            Duration::from_millis(100),
            Timestamp::from_millis(0),
        )
    }

    #[test]
    fn expires_relative_to_entry_timestamps() {
        let mut s = session();
        assert!(!s.timed_out(Timestamp::from_millis(100)));
        assert!(s.timed_out(Timestamp::from_millis(101)));
        s.refresh(Timestamp::from_millis(80));
        assert!(!s.timed_out(Timestamp::from_millis(150)));
        // Refreshing never moves time backwards.
        s.refresh(Timestamp::from_millis(10));
        assert_eq!(s.last_updated(), Timestamp::from_millis(80));
    }

    #[test]
    fn acknowledge_releases_results_and_events() {
        let mut s = session();
        s.complete_command(1, Ok(Bytes::from_static(b"a")));
        s.complete_command(2, Ok(Bytes::from_static(b"b")));
        s.publish(6, Bytes::from_static(b"e1"));
        s.publish(7, Bytes::from_static(b"e2"));

        s.acknowledge(8, Timestamp::from_millis(50), 1, 6);
        assert!(s.cached_result(1).is_none());
        assert!(s.cached_result(2).is_some());
        assert_eq!(s.pending_events(), 1);
        // Batch at 7 is still outstanding.
        assert_eq!(s.last_completed(), 6);

        s.acknowledge(9, Timestamp::from_millis(60), 2, 7);
        assert_eq!(s.pending_events(), 0);
        assert_eq!(s.last_completed(), 9);
    }

    #[test]
    fn watermarks_never_regress() {
        let mut s = session();
        s.acknowledge(10, Timestamp::from_millis(10), 3, 9);
        let (seq, evt, completed) = (s.command_sequence(), s.event_index(), s.last_completed());
        s.acknowledge(10, Timestamp::from_millis(5), 1, 2);
        assert!(s.command_sequence() >= seq);
        assert!(s.event_index() >= evt);
        assert!(s.last_completed() >= completed);
    }

    #[test]
    fn events_batch_by_publication_index() {
        let mut s = session();
        s.publish(6, Bytes::from_static(b"x"));
        s.publish(6, Bytes::from_static(b"y"));
        s.publish(8, Bytes::from_static(b"z"));
        assert_eq!(s.pending_events(), 3);
        s.acknowledge(9, Timestamp::from_millis(1), 0, 6);
        assert_eq!(s.pending_events(), 1);
        assert_eq!(s.last_completed(), 7);
    }
}
