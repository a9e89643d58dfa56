use std::time::Duration;

use bytes::Bytes;
use quorum_primitives::{ReadConsistency, ServiceId, SessionId, Timestamp};

use crate::error::SnapshotError;

mod memory;

pub use memory::MemorySnapshotStore;

/// A serialized image of every service's state at a specific log index.
///
/// `data` is a concatenation of length-delimited per-service records in
/// service registration order; see [`SnapshotWriter`].
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub index: u64,
    pub timestamp: Timestamp,
    pub data: Bytes,
}

/// Owner of snapshot images. Persistence format is the store's business; the
/// service manager only stages, finalizes, and fetches whole images.
///
/// A staged snapshot becomes visible through [`Self::current`] only once it
/// is completed, which the manager does after every session's
/// `last_completed` watermark has passed the snapshot index.
pub trait SnapshotStore: Send + Sync + 'static {
    /// Stage a snapshot. Replaces any previously staged, uncompleted one.
    fn save(&self, snapshot: Snapshot) -> Result<(), SnapshotError>;

    /// Finalize the staged snapshot at `index`, making it current.
    fn complete(&self, index: u64) -> Result<Snapshot, SnapshotError>;

    /// Drop the staged snapshot at `index`, if any.
    fn abandon(&self, index: u64);

    /// The newest completed snapshot.
    fn current(&self) -> Option<Snapshot>;
}

/// Watermarks of one session, serialized alongside its service so that a
/// replica restoring from the snapshot reaches the same session decisions as
/// one that replayed the log.
///
/// Cached command results and unacknowledged events are not carried; the
/// duplicate-detection watermark is, so replayed duplicates are still
/// suppressed.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionSnapshot {
    pub session: SessionId,
    pub member: u64,
    pub read_consistency: ReadConsistency,
    pub timeout: Duration,
    pub last_updated: Timestamp,
    pub command_sequence: u64,
    pub event_index: u64,
    pub last_completed: u64,
}

/// Serialized size of one [`SessionSnapshot`].
const SESSION_SNAPSHOT_LEN: usize = 8 * 7 + 1;

fn consistency_code(consistency: ReadConsistency) -> u8 {
    match consistency {
        ReadConsistency::Sequential => 0,
        ReadConsistency::LinearizableLease => 1,
        ReadConsistency::Linearizable => 2,
    }
}

fn consistency_from_code(code: u8) -> Result<ReadConsistency, SnapshotError> {
    match code {
        0 => Ok(ReadConsistency::Sequential),
        1 => Ok(ReadConsistency::LinearizableLease),
        2 => Ok(ReadConsistency::Linearizable),
        _ => Err(SnapshotError::Malformed("unknown read consistency")),
    }
}

/// Builds a snapshot stream out of per-service records.
///
/// Record layout, all integers little-endian: a u32 record length, then
/// within the record a u64 service id, u16-prefixed service type, u16-prefixed
/// service name, a u32-prefixed opaque body, and a u32-counted session block.
/// Readers ignore bytes trailing the known fields inside a record, so fields
/// can be appended without breaking old readers.
#[derive(Default)]
pub struct SnapshotWriter {
    buf: Vec<u8>,
}

impl SnapshotWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(
        &mut self,
        service_id: ServiceId,
        service_type: &str,
        service_name: &str,
        body: &[u8],
        sessions: &[SessionSnapshot],
    ) {
        let record_len = 8
            + 2
            + service_type.len()
            + 2
            + service_name.len()
            + 4
            + body.len()
            + 4
            + sessions.len() * SESSION_SNAPSHOT_LEN;
        self.buf.extend_from_slice(&(record_len as u32).to_le_bytes());
        self.buf.extend_from_slice(&service_id.0.to_le_bytes());
        self.buf.extend_from_slice(&(service_type.len() as u16).to_le_bytes());
        self.buf.extend_from_slice(service_type.as_bytes());
        self.buf.extend_from_slice(&(service_name.len() as u16).to_le_bytes());
        self.buf.extend_from_slice(service_name.as_bytes());
        self.buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(body);
        self.buf.extend_from_slice(&(sessions.len() as u32).to_le_bytes());
        for session in sessions {
            self.buf.extend_from_slice(&session.session.0.to_le_bytes());
            self.buf.extend_from_slice(&session.member.to_le_bytes());
            self.buf.push(consistency_code(session.read_consistency));
            self.buf.extend_from_slice(&(session.timeout.as_millis() as u64).to_le_bytes());
            self.buf.extend_from_slice(&session.last_updated.as_millis().to_le_bytes());
            self.buf.extend_from_slice(&session.command_sequence.to_le_bytes());
            self.buf.extend_from_slice(&session.event_index.to_le_bytes());
            self.buf.extend_from_slice(&session.last_completed.to_le_bytes());
        }
    }

    pub fn finish(self) -> Bytes {
        self.buf.into()
    }
}

/// One parsed per-service record of a snapshot stream.
#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotRecord {
    pub service_id: ServiceId,
    pub service_type: String,
    pub service_name: String,
    pub body: Bytes,
    pub sessions: Vec<SessionSnapshot>,
}

/// Iterates the records of a snapshot stream. Tolerates trailing records and
/// unknown trailing fields within a record; a short read mid-field is an
/// error.
pub struct SnapshotReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SnapshotReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], SnapshotError> {
        if self.pos + n > self.data.len() {
            return Err(SnapshotError::Truncated(self.pos));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_u16(&mut self) -> Result<u16, SnapshotError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn take_u32(&mut self) -> Result<u32, SnapshotError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn take_u64(&mut self) -> Result<u64, SnapshotError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn take_str(&mut self, len: usize, what: &'static str) -> Result<String, SnapshotError> {
        std::str::from_utf8(self.take(len)?)
            .map(str::to_owned)
            .map_err(|_| SnapshotError::Malformed(what))
    }

    fn read_record(&mut self) -> Result<SnapshotRecord, SnapshotError> {
        let record_len = self.take_u32()? as usize;
        let record_end = self.pos + record_len;
        if record_end > self.data.len() {
            return Err(SnapshotError::Truncated(self.pos));
        }

        let service_id = ServiceId(self.take_u64()?);
        let type_len = self.take_u16()? as usize;
        let service_type = self.take_str(type_len, "service type is not utf-8")?;
        let name_len = self.take_u16()? as usize;
        let service_name = self.take_str(name_len, "service name is not utf-8")?;
        let body_len = self.take_u32()? as usize;
        let body = Bytes::copy_from_slice(self.take(body_len)?);

        let mut sessions = Vec::new();
        // Older streams end the record at the body.
        if self.pos < record_end {
            let count = self.take_u32()?;
            for _ in 0..count {
                sessions.push(SessionSnapshot {
                    session: SessionId(self.take_u64()?),
                    member: self.take_u64()?,
                    read_consistency: consistency_from_code(self.take(1)?[0])?,
                    timeout: Duration::from_millis(self.take_u64()?),
                    last_updated: Timestamp::from_millis(self.take_u64()?),
                    command_sequence: self.take_u64()?,
                    event_index: self.take_u64()?,
                    last_completed: self.take_u64()?,
                });
            }
        }

        if self.pos > record_end {
            return Err(SnapshotError::Malformed("record fields overrun record length"));
        }
        // Skip unknown trailing fields within the record.
        self.pos = record_end;

        Ok(SnapshotRecord {
            service_id,
            service_type,
            service_name,
            body,
            sessions,
        })
    }
}

impl Iterator for SnapshotReader<'_> {
    type Item = Result<SnapshotRecord, SnapshotError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }
        Some(self.read_record())
    }
}
