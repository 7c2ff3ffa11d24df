//! User interceptor collaborator and entry filters.

use bytes::Bytes;

use crate::key::CacheKey;

/// Read-only snapshot of an entry handed to interceptors and filters.
#[derive(Debug, Clone, Copy)]
pub struct EntryView<'a> {
    key: &'a CacheKey,
    value: Option<&'a Bytes>,
}

impl<'a> EntryView<'a> {
    /// Build a view from key and current value.
    pub fn new(key: &'a CacheKey, value: Option<&'a Bytes>) -> Self {
        Self { key, value }
    }

    /// The entry key.
    #[inline]
    pub fn key(&self) -> &CacheKey {
        self.key
    }

    /// The entry value at capture time.
    #[inline]
    pub fn value(&self) -> Option<&Bytes> {
        self.value
    }
}

/// User interceptor.
///
/// `on_before_*` runs under the entry lock and may veto or rewrite the
/// operation; a panic or error there aborts the operation. `on_after_*`
/// runs outside the lock after commit; its failures are logged and
/// swallowed.
pub trait Interceptor: Send + Sync {
    /// Called before a value is written. Return the value to store (possibly
    /// `new_val` unchanged, possibly rewritten) or `None` to cancel the
    /// write.
    fn on_before_put(&self, entry: EntryView<'_>, new_val: &Bytes) -> Option<Bytes>;

    /// Called before a removal. Returns `(cancel, value)`: with `cancel` set
    /// the removal is dropped and `value` is reported to the caller instead
    /// of the removed value.
    fn on_before_remove(&self, entry: EntryView<'_>) -> (bool, Option<Bytes>);

    /// Called after a committed write.
    fn on_after_put(&self, entry: EntryView<'_>);

    /// Called after a committed removal.
    fn on_after_remove(&self, entry: EntryView<'_>);
}

/// Entry predicate evaluated under the entry lock.
pub type EntryFilter = dyn Fn(&EntryView<'_>) -> bool + Send + Sync;

/// Evaluate a filter conjunction. An empty filter list always passes; it is
/// distinct from "no filter" only in intent, not behavior.
pub fn filter_passes(filter: &[&EntryFilter], view: &EntryView<'_>) -> bool {
    filter.iter().all(|f| f(view))
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn test_empty_filter_always_passes() {
        let key = CacheKey::from("k");
        let view = EntryView::new(&key, None);

        assert!(filter_passes(&[], &view));
    }

    #[test]
    fn test_filter_conjunction() {
        let key = CacheKey::from("k");
        let val = Bytes::from_static(b"v");
        let view = EntryView::new(&key, Some(&val));

        let has_value: &EntryFilter = &|v| v.value().is_some();
        let never: &EntryFilter = &|_| false;

        assert!(filter_passes(&[has_value], &view));
        assert!(!filter_passes(&[has_value, never], &view));
    }
}
