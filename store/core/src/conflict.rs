//! Cross-datacenter conflict resolution and replication collaborators.

use bytes::Bytes;

use crate::error::CacheResult;
use crate::key::CacheKey;
use crate::version::Version;

/// Versioned entry snapshot handed to the conflict resolver.
#[derive(Debug, Clone)]
pub struct VersionedEntry {
    /// Value, absent for tombstones and never-written entries.
    pub value: Option<Bytes>,
    /// TTL in milliseconds; zero when eternal.
    pub ttl: u64,
    /// Absolute expire time; zero when eternal.
    pub expire_time: u64,
    /// Conflict version: the embedded DR version when present, the entry
    /// version otherwise.
    pub version: Version,
    /// Whether the entry has never been written on this node.
    pub is_start: bool,
}

/// Resolver verdict for a conflicting pair of entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Keep the existing entry; the incoming update writes nothing.
    UseOld,
    /// Accept the incoming entry.
    UseNew,
    /// Write a merged value instead of either side.
    Merge(Bytes),
}

/// Cross-datacenter conflict resolver collaborator.
pub trait ConflictResolver: Send + Sync {
    /// Resolve a conflict between the stored and the incoming entry.
    ///
    /// `atomic_check` is set when the caller is the atomic update path's
    /// version check on a primary.
    fn resolve(
        &self,
        old: &VersionedEntry,
        new: &VersionedEntry,
        atomic_check: bool,
    ) -> ConflictResolution;
}

/// How a write participates in cross-datacenter replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrType {
    /// Not replicated.
    None,
    /// Replicated as a primary-side write.
    Primary,
    /// Replicated as a backup-side write.
    Backup,
    /// Written by preloading; not replicated.
    Preload,
}

/// Cross-datacenter replicator collaborator.
pub trait DrReplicator: Send + Sync {
    /// Enqueue a committed write for replication.
    #[allow(clippy::too_many_arguments)]
    fn replicate(
        &self,
        key: &CacheKey,
        val: Option<&Bytes>,
        ttl: u64,
        expire_time: u64,
        conflict_ver: Version,
        dr_type: DrType,
        topology_version: u32,
    ) -> CacheResult<()>;
}

impl DrType {
    /// Whether writes of this type flow to the replicator at all.
    #[inline]
    pub fn replicates(self) -> bool {
        matches!(self, Self::Primary | Self::Backup)
    }
}
