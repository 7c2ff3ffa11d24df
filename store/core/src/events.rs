//! Cache event bus collaborator.

use bytes::Bytes;

use crate::key::CacheKey;
use crate::version::Version;

/// Event kinds the entry layer can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Entry was read.
    Read,
    /// Entry was written.
    Put,
    /// Entry was removed.
    Removed,
    /// Entry expired.
    Expired,
    /// Entry lock was acquired.
    Locked,
    /// Entry lock was released.
    Unlocked,
}

/// A captured cache event.
#[derive(Debug, Clone)]
pub struct CacheEvent {
    /// Owning partition.
    pub partition: u32,
    /// Entry key.
    pub key: CacheKey,
    /// Node the triggering operation originated from.
    pub node_order: u32,
    /// Version associated with the event, when one applies.
    pub version: Option<Version>,
    /// Event kind.
    pub kind: EventKind,
    /// New value after the operation, if present.
    pub new_value: Option<Bytes>,
    /// Whether a new value exists after the operation.
    pub has_new_value: bool,
    /// Old value before the operation, if present.
    pub old_value: Option<Bytes>,
    /// Whether an old value existed before the operation.
    pub has_old_value: bool,
}

/// Event recorder collaborator.
///
/// `is_recordable` is checked first so that disabled kinds cost nothing on
/// the hot path.
pub trait EventRecorder: Send + Sync {
    /// Whether events of this kind should be recorded at all.
    fn is_recordable(&self, kind: EventKind) -> bool;

    /// Record an event.
    fn add_event(&self, event: CacheEvent);
}
