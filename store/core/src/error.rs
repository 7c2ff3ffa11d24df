//! Error types for entry operations.

use std::fmt;

/// Errors that can occur during entry operations.
///
/// Update outcomes that are part of normal control flow (stale version,
/// failed filter, interceptor veto) are reported through
/// [`UpdateOutcome`](crate::UpdateOutcome) result values, never as errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The operation reached an obsolete entry. The caller retries by
    /// re-looking-up the key in the partition map.
    EntryRemoved,

    /// Row store or write-ahead log failure. Fatal to the current operation;
    /// in-memory state is not rolled back.
    Storage(String),

    /// A user interceptor (`on_before_*`) failed. The operation is aborted.
    Interceptor(String),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EntryRemoved => write!(f, "entry is obsolete"),
            Self::Storage(msg) => write!(f, "storage failure: {msg}"),
            Self::Interceptor(msg) => write!(f, "interceptor failure: {msg}"),
        }
    }
}

impl std::error::Error for CacheError {}

/// Result type for entry operations.
pub type CacheResult<T> = Result<T, CacheError>;
