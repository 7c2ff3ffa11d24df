//! Partitions: entry map, update counter, deferred-delete queue.
//!
//! A partition owns the live entries for its slice of the key space; entries
//! never outlive their partition. The update counter is the per-partition
//! monotone sequence handed out to committed writes. Deferred deletes are
//! queued here and drained by `flush_deferred`.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_deque::{Injector, Steal};
use parking_lot::Mutex;
use tracing::trace;

use crate::context::CacheContext;
use crate::entry::CacheEntry;
use crate::key::CacheKey;
use crate::sync::{AtomicU64, Ordering};
use crate::version::Version;

/// A queued deferred delete: obsolete the entry later iff its version is
/// still the one recorded at remove time.
#[derive(Debug)]
struct DeferredDelete {
    key: CacheKey,
    ver: Version,
}

/// One partition of the local cache map.
pub struct Partition {
    id: u32,
    update_counter: AtomicU64,
    entries: Mutex<HashMap<CacheKey, Arc<CacheEntry>>>,
    deferred: Injector<DeferredDelete>,
}

impl Partition {
    /// Create an empty partition.
    pub fn new(id: u32) -> Self {
        Self {
            id,
            update_counter: AtomicU64::new(0),
            entries: Mutex::new(HashMap::new()),
            deferred: Injector::new(),
        }
    }

    /// Partition id.
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Hand out the next update counter value. Monotone and gap-free for
    /// successful writes; a failed write that already drew a value leaves a
    /// documented gap.
    pub fn next_update_counter(&self) -> u64 {
        self.update_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// The last handed-out update counter value.
    pub fn update_counter(&self) -> u64 {
        self.update_counter.load(Ordering::Relaxed)
    }

    /// Number of entries currently mapped (including tombstones).
    pub fn size(&self) -> usize {
        self.entries.lock().len()
    }

    /// The live entry for a key, if mapped.
    pub fn entry(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.entries.lock().get(key).cloned()
    }

    /// The live entry for a key, creating a fresh one (or replacing an
    /// obsolete one) as needed.
    pub fn entry_or_create(&self, ctx: &CacheContext, key: &CacheKey) -> Arc<CacheEntry> {
        let mut entries = self.entries.lock();

        if let Some(existing) = entries.get(key) {
            if !existing.obsolete() {
                return Arc::clone(existing);
            }
        }

        let fresh = Arc::new(CacheEntry::new(
            key.clone(),
            self.id,
            ctx.versions().start_version(),
        ));
        entries.insert(key.clone(), Arc::clone(&fresh));

        fresh
    }

    /// Drop the mapping for a key iff its entry is obsolete. Returns whether
    /// a mapping was removed.
    pub fn remove_if_obsolete(&self, key: &CacheKey) -> bool {
        let mut entries = self.entries.lock();

        match entries.get(key) {
            Some(entry) if entry.obsolete() => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Queue a deferred delete recorded at `ver`.
    pub fn enqueue_deferred(&self, key: CacheKey, ver: Version) {
        trace!(partition = self.id, ?ver, "deferred delete queued");
        self.deferred.push(DeferredDelete { key, ver });
    }

    /// Drain the deferred-delete queue: entries whose version still matches
    /// the recorded one are obsoleted and unmapped. Returns how many entries
    /// were removed.
    pub fn flush_deferred(&self) -> usize {
        let mut removed = 0;

        loop {
            match self.deferred.steal() {
                Steal::Success(d) => {
                    if let Some(entry) = self.entry(&d.key) {
                        if entry.mark_obsolete_version(d.ver) && self.remove_if_obsolete(&d.key) {
                            removed += 1;
                        }
                    }
                }
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }

        removed
    }
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("id", &self.id)
            .field("size", &self.size())
            .field("update_counter", &self.update_counter())
            .finish()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn test_update_counter_is_monotone() {
        let part = Partition::new(0);

        let a = part.next_update_counter();
        let b = part.next_update_counter();
        let c = part.next_update_counter();

        assert_eq!((a, b, c), (1, 2, 3));
        assert_eq!(part.update_counter(), 3);
    }
}
