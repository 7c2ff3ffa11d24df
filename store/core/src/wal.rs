//! Write-ahead log collaborator.
//!
//! The entry layer appends one logical record per committed mutation; record
//! encoding and fsync policy belong to the log implementation. Logging is
//! disabled by leaving the collaborator unset on the context.

use bytes::Bytes;

use crate::error::CacheResult;
use crate::key::CacheKey;
use crate::version::Version;

/// One logical data record appended per committed entry mutation.
#[derive(Debug, Clone)]
pub enum DataRecord {
    /// First write of an entry (initial load, preload).
    Create {
        /// Entry key.
        key: CacheKey,
        /// Committed value.
        value: Bytes,
        /// Commit version.
        version: Version,
        /// Absolute expire time; zero when eternal.
        expire_time: u64,
        /// Owning partition.
        partition: u32,
        /// Partition update counter assigned to this write.
        update_counter: u64,
    },
    /// Value update.
    Update {
        /// Entry key.
        key: CacheKey,
        /// Committed value.
        value: Bytes,
        /// Commit version.
        version: Version,
        /// Absolute expire time; zero when eternal.
        expire_time: u64,
        /// Owning partition.
        partition: u32,
        /// Partition update counter assigned to this write.
        update_counter: u64,
    },
    /// Removal.
    Delete {
        /// Entry key.
        key: CacheKey,
        /// Commit version.
        version: Version,
        /// Owning partition.
        partition: u32,
        /// Partition update counter assigned to this write.
        update_counter: u64,
    },
}

impl DataRecord {
    /// The record's key.
    pub fn key(&self) -> &CacheKey {
        match self {
            Self::Create { key, .. } | Self::Update { key, .. } | Self::Delete { key, .. } => key,
        }
    }

    /// The record's commit version.
    pub fn version(&self) -> Version {
        match self {
            Self::Create { version, .. }
            | Self::Update { version, .. }
            | Self::Delete { version, .. } => *version,
        }
    }

    /// The update counter assigned to this write.
    pub fn update_counter(&self) -> u64 {
        match self {
            Self::Create { update_counter, .. }
            | Self::Update { update_counter, .. }
            | Self::Delete { update_counter, .. } => *update_counter,
        }
    }
}

/// Write-ahead log collaborator.
pub trait WalManager: Send + Sync {
    /// Append a record. Failures are fatal to the current operation.
    fn log(&self, record: DataRecord) -> CacheResult<()>;
}
