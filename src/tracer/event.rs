use std::fmt;
use std::time::Instant;

use crate::device::DeviceId;

/// Size in bytes of one [`LatencyRecord`] on the wire.
pub const RECORD_SIZE: usize = 16;

/// Identity of a monitored unit.
///
/// Keys are stable for the lifetime of the process and ordered so that
/// rendered tables come out in a deterministic order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKey {
    /// A block device, keyed by its kernel `major<<20 | minor` encoding.
    Device(DeviceId),
    /// A syscall, keyed by its architecture-specific number.
    Syscall(u32),
    /// A configured aggregate of several devices (queue mode only).
    Group(u16),
}

impl EntityKey {
    /// Builds the key for a raw `entity_key` field of the given source kind.
    pub fn from_raw(kind: SourceKind, raw: u32) -> Self {
        match kind {
            SourceKind::Block => Self::Device(DeviceId::from_raw(raw)),
            SourceKind::Syscall => Self::Syscall(raw),
        }
    }

    /// Returns the device id for device keys.
    pub fn device(&self) -> Option<DeviceId> {
        match self {
            Self::Device(dev) => Some(*dev),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(dev) => write!(f, "{dev}"),
            Self::Syscall(nr) => write!(f, "sys_{nr}"),
            Self::Group(id) => write!(f, "group_{id}"),
        }
    }
}

/// Which kernel subsystem produced a stream of latency records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Block,
    Syscall,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Syscall => "syscall",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded ring buffer record (matches `struct latency_record` in latency_record.h).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyRecord {
    pub entity_key: u32,
    pub elapsed_ns: u64,
}

impl LatencyRecord {
    /// Elapsed time in whole microseconds, clamped to at least 1us so a
    /// completed operation is never mistaken for an idle zero sample.
    pub fn elapsed_us(&self) -> u64 {
        (self.elapsed_ns / 1_000).max(1)
    }

    /// Converts the record into a sample stamped with the receive instant.
    pub fn into_sample(self, kind: SourceKind, observed_at: Instant) -> Sample {
        Sample {
            entity: EntityKey::from_raw(kind, self.entity_key),
            value: self.elapsed_us(),
            observed_at,
        }
    }
}

/// A single immutable measurement: latency in microseconds or a queue depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub entity: EntityKey,
    pub value: u64,
    pub observed_at: Instant,
}

impl Sample {
    pub fn new(entity: EntityKey, value: u64) -> Self {
        Self {
            entity,
            value,
            observed_at: Instant::now(),
        }
    }
}
