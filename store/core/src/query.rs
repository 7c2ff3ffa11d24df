//! Continuous-query registry collaborator.

use bytes::Bytes;

use crate::key::CacheKey;

/// Opaque handle to the listener set captured under the entry lock.
///
/// The registry mints the token (typically a generation number); the entry
/// hands it back with the committed `(old, new)` pair after the lock is
/// released, so notifications carry exactly the values committed, in commit
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerSet(pub u64);

/// Continuous-query registry collaborator.
pub trait ContinuousQueries: Send + Sync {
    /// The listener set to notify for an update, or `None` when nobody
    /// listens. Called under the entry lock.
    fn update_listeners(&self, internal: bool, primary: bool) -> Option<ListenerSet>;

    /// Deliver a committed update to a previously captured listener set.
    #[allow(clippy::too_many_arguments)]
    fn on_entry_updated(
        &self,
        listeners: ListenerSet,
        key: &CacheKey,
        new_val: Option<&Bytes>,
        old_val: Option<&Bytes>,
        partition: u32,
        primary: bool,
        update_counter: u64,
        topology_version: u32,
    );

    /// Deliver an expiration.
    fn on_entry_expired(&self, key: &CacheKey, val: &Bytes);
}
