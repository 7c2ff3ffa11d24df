//! cairn-core: per-key cache entry state machine for a partitioned,
//! transactional key-value store.
//!
//! A [`CacheEntry`] owns the authoritative in-memory metadata for one key:
//! value handle, monotonic version, TTL and expire time, deletion and
//! obsolete markers, lock candidates, and the partition update counter slice
//! assigned to its writes. It mediates every mutation against the row store
//! through three pathways:
//!
//! - **Transactional** ([`CacheEntry::inner_set`] / [`CacheEntry::inner_remove`]) -
//!   the caller holds the logical lock recorded in the MVCC candidate set
//! - **Atomic** ([`CacheEntry::inner_update`]) - lock-free caches; an update
//!   closure plans the operation inside the row store's invoke, with version
//!   check or conflict resolution
//! - **Local** ([`CacheEntry::inner_update_local`]) - single-node atomic
//!   updates without version checks
//!
//! # Architecture
//!
//! ```text
//!        caller (tx manager / atomic coordinator)
//!                         |
//!                         v
//!     +------------------------------------------+
//!     |             CacheEntry (mutex)           |
//!     |  val / ver / extras(ttl,mvcc,obsolete)   |
//!     +------+----------+----------+-------------+
//!            |          |          |
//!            v          v          v
//!       RowStore   WalManager  collaborators
//!      (authority)   (log)     (events, CQ, DR,
//!                               interceptor, store)
//! ```
//!
//! Collaborators are narrow traits wired into a [`CacheContext`]; partitions
//! own the entries and hand out monotone update counters.

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core types
mod config;
mod error;
mod key;
mod sync;
mod version;

// Re-exports
pub use config::{CacheConfig, WriteOrderMode};
pub use error::{CacheError, CacheResult};
pub use key::CacheKey;
pub use version::{compare, Version, VersionClock};

// Entry metadata
mod expiry;
mod extras;
mod mvcc;

pub use expiry::{
    expire_time_in_past, initial_ttl_and_expire, is_expired, now_millis, to_expire_time,
    ConstantExpiry, ExpiryPolicy, Ttl, TTL_MINIMUM_MS,
};
pub use extras::{EntryExtras, Extras};
pub use mvcc::{MvccCandidate, MvccCandidateSet};

// Collaborator interfaces
mod conflict;
mod events;
mod interceptor;
mod query;
mod store;
mod wal;

pub use conflict::{ConflictResolution, ConflictResolver, DrReplicator, DrType, VersionedEntry};
pub use events::{CacheEvent, EventKind, EventRecorder};
pub use interceptor::{filter_passes, EntryFilter, EntryView, Interceptor};
pub use query::{ContinuousQueries, ListenerSet};
pub use store::{ExternalStore, InvokeClosure, MemRowStore, Row, RowStore, TreeOp};
pub use wal::{DataRecord, WalManager};

// Statistics
mod metrics;

pub use metrics::{CacheMetrics, MetricsSnapshot};

// Transactions and partitions
mod partition;
mod tx;

pub use partition::Partition;
pub use tx::TxContext;

// The entry state machine and its update closure
mod closure;
mod context;
mod entry;

pub use closure::{
    AtomicUpdateRequest, EntryProcessor, InvokeEntry, InvokeResult, ProcessorError,
    UpdateAtomicResult, UpdateOp, UpdateOutcome,
};
pub use context::{CacheContext, CacheContextBuilder};
pub use entry::{
    CacheEntry, GetRequest, LocalUpdateRequest, LocalUpdateResult, SwapEntrySnapshot,
    TxWriteRequest, UpdateTxResult,
};
