use std::fmt;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// Identifier of a client session.
///
/// Equal to the index of the log entry that opened the session, which makes it
/// unique across the cluster and never reused.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SessionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Identifier of a materialized service instance.
///
/// Assigned by the service registry when a service is first created. A name
/// bound again after deletion gets a fresh id.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ServiceId(pub u64);

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ServiceId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Wall-clock milliseconds since the unix epoch, as stamped by the leader when
/// an entry was appended.
///
/// All session timing decisions compare entry timestamps against each other,
/// never against the local clock, so replicas reach identical expiration
/// decisions.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        Self::from_systemtime(SystemTime::now())
    }

    pub fn from_systemtime(systime: SystemTime) -> Self {
        let dur = systime
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("system clock before unix epoch");
        Self(dur.as_millis() as u64)
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Time elapsed since `earlier`, saturating to zero when `earlier` is in
    /// the future.
    pub fn duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Consistency level a session requests for its queries.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadConsistency {
    /// Reads may lag behind the leader but never go backwards.
    Sequential,
    /// Linearizable reads served under a leader lease.
    LinearizableLease,
    /// Fully linearizable reads.
    #[default]
    Linearizable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_duration_since_saturates() {
        let earlier = Timestamp::from_millis(1_000);
        let later = Timestamp::from_millis(3_500);
        assert_eq!(later.duration_since(earlier), Duration::from_millis(2_500));
        assert_eq!(earlier.duration_since(later), Duration::ZERO);
    }

    #[test]
    fn ids_display_as_plain_numbers() {
        assert_eq!(SessionId(42).to_string(), "42");
        assert_eq!(ServiceId(7).to_string(), "7");
    }
}
