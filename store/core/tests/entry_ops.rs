//! End-to-end tests of the entry state machine against recording
//! collaborators: atomic updates, version checks, conflict resolution,
//! expiration, and the notification contracts.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;

use cairn_core::{
    AtomicUpdateRequest, CacheConfig, CacheContext, CacheKey, ConflictResolution, ConstantExpiry,
    EventKind, GetRequest, Ttl, TxWriteRequest, UpdateOutcome, Version, WriteOrderMode,
};

use common::{FixedResolver, MapStore, RecordingDr, RecordingEvents, RecordingQueries, RecordingWal};

fn bytes(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

#[test]
fn test_atomic_first_put() {
    let events = RecordingEvents::new();
    let queries = RecordingQueries::new();

    let ctx = CacheContext::builder(CacheConfig::new("atomic").with_partitions(1))
        .with_events(events.clone())
        .with_queries(queries.clone())
        .build();

    let key = CacheKey::from("a");
    let entry = ctx.entry(&key);

    let v1 = ctx.versions().next();
    let res = entry
        .inner_update(&ctx, AtomicUpdateRequest::put(bytes("1"), v1))
        .unwrap();

    assert_eq!(res.outcome, UpdateOutcome::Success);
    assert_eq!(res.update_counter, 1);
    assert_eq!(res.old_value, None);
    assert_eq!(res.new_value.as_deref(), Some(b"1".as_slice()));

    assert_eq!(entry.raw_get().unwrap(), "1");
    assert_eq!(entry.version().unwrap(), v1);
    assert_eq!(ctx.partition(0).update_counter(), 1);

    let puts = events.of_kind(EventKind::Put);
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0].new_value.as_deref(), Some(b"1".as_slice()));
    assert!(!puts[0].has_old_value);

    let updates = queries.updates.lock().clone();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].new_value.as_deref(), Some(b"1".as_slice()));
    assert_eq!(updates[0].old_value, None);
    assert_eq!(updates[0].update_counter, 1);
}

#[test]
fn test_stale_update_rejected() {
    let queries = RecordingQueries::new();
    let wal = RecordingWal::new();

    let ctx = CacheContext::builder(CacheConfig::new("atomic").with_partitions(1))
        .with_queries(queries.clone())
        .with_wal(wal.clone())
        .build();

    let key = CacheKey::from("k");
    let entry = ctx.entry(&key);

    let v1 = ctx.versions().next();
    let v2 = ctx.versions().next();

    entry
        .inner_update(&ctx, AtomicUpdateRequest::put(bytes("1"), v2))
        .unwrap();

    queries.clear();
    let wal_before = wal.len();

    let res = entry
        .inner_update(&ctx, AtomicUpdateRequest::put(bytes("0"), v1))
        .unwrap();

    assert_eq!(res.outcome, UpdateOutcome::VersionCheckFailed);
    assert_eq!(res.old_value.as_deref(), Some(b"1".as_slice()));

    // State untouched, nothing notified, nothing logged.
    assert_eq!(entry.raw_get().unwrap(), "1");
    assert_eq!(entry.version().unwrap(), v2);
    assert!(queries.updates.lock().is_empty());
    assert_eq!(wal.len(), wal_before);
}

#[test]
fn test_conflict_use_old_with_equal_versions_refreshes_store() {
    let store = MapStore::new();

    let ctx = CacheContext::builder(
        CacheConfig::new("dr")
            .with_partitions(1)
            .with_write_through(true),
    )
    .with_external_store(store.clone())
    .with_resolver(Arc::new(FixedResolver(ConflictResolution::UseOld)))
    .build();

    let key = CacheKey::from("k");
    let entry = ctx.entry(&key);

    let v = ctx.versions().next();

    entry
        .inner_set(&ctx, bytes("a"), TxWriteRequest::new().with_version(v))
        .unwrap();

    store.clear_log();

    let res = entry
        .inner_update(&ctx, AtomicUpdateRequest::put(bytes("b"), v))
        .unwrap();

    assert_eq!(res.outcome, UpdateOutcome::ConflictUseOld);

    // Existing state wins and the external store is refreshed with it.
    assert_eq!(entry.raw_get().unwrap(), "a");
    assert_eq!(entry.version().unwrap(), v);

    let puts = store.puts.lock().clone();
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0].0.as_ref(), b"a");
    assert_eq!(puts[0].1, v);
}

#[test]
fn test_expiring_read() {
    let events = RecordingEvents::new();
    let queries = RecordingQueries::new();

    let ctx = CacheContext::builder(CacheConfig::new("ttl").with_partitions(1))
        .with_events(events.clone())
        .with_queries(queries.clone())
        .build();

    let key = CacheKey::from("k");
    let entry = ctx.entry(&key);

    let v1 = ctx.versions().next();
    entry
        .inner_update(
            &ctx,
            AtomicUpdateRequest::put(bytes("1"), v1).with_ttl(Ttl::Millis(10)),
        )
        .unwrap();

    thread::sleep(Duration::from_millis(30));

    let read = entry.inner_get(&ctx, GetRequest::new()).unwrap();
    assert!(read.is_none());

    // Entry transitioned to obsolete and left the partition map.
    assert!(entry.obsolete());
    assert!(ctx.partition(0).entry(&key).is_none());

    let expired = events.of_kind(EventKind::Expired);
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].old_value.as_deref(), Some(b"1".as_slice()));

    assert_eq!(queries.expired.lock().clone(), vec![bytes("1")]);
}

#[test]
fn test_expiring_read_with_deferred_delete() {
    let ctx = CacheContext::new(
        CacheConfig::new("ttl")
            .with_partitions(1)
            .with_deferred_delete(true),
    );

    let key = CacheKey::from("k");
    let entry = ctx.entry(&key);

    let v1 = ctx.versions().next();
    entry
        .inner_update(
            &ctx,
            AtomicUpdateRequest::put(bytes("1"), v1).with_ttl(Ttl::Millis(10)),
        )
        .unwrap();

    thread::sleep(Duration::from_millis(30));

    assert!(entry.inner_get(&ctx, GetRequest::new()).unwrap().is_none());

    // Tombstoned, not obsolete; the deferred flush finishes the removal.
    assert!(entry.deleted());
    assert!(!entry.obsolete());

    assert_eq!(ctx.flush_deferred(), 1);
    assert!(entry.obsolete());
    assert!(ctx.partition(0).entry(&key).is_none());
}

#[test]
fn test_entry_processor_no_op() {
    use cairn_core::{EntryProcessor, InvokeEntry, ProcessorError};

    struct Inspect;

    impl EntryProcessor for Inspect {
        fn process(
            &self,
            entry: &mut InvokeEntry<'_>,
        ) -> Result<Option<Bytes>, ProcessorError> {
            // Reads the entry but leaves it unmodified.
            Ok(entry.value().cloned())
        }
    }

    let wal = RecordingWal::new();

    let ctx = CacheContext::builder(CacheConfig::new("atomic").with_partitions(1))
        .with_wal(wal.clone())
        .build();

    let key = CacheKey::from("k");
    let entry = ctx.entry(&key);

    let v1 = ctx.versions().next();
    entry
        .inner_update(&ctx, AtomicUpdateRequest::put(bytes("x"), v1))
        .unwrap();

    let wal_before = wal.len();

    let v2 = ctx.versions().next();
    let res = entry
        .inner_update(&ctx, AtomicUpdateRequest::transform(Arc::new(Inspect), v2))
        .unwrap();

    assert_eq!(res.outcome, UpdateOutcome::InvokeNoOp);
    assert_eq!(
        res.invoke_result.unwrap().computed.as_deref(),
        Some(b"x".as_slice())
    );

    // Version unchanged, no WAL record.
    assert_eq!(entry.version().unwrap(), v1);
    assert_eq!(wal.len(), wal_before);
}

#[test]
fn test_entry_processor_transform_writes() {
    use cairn_core::{EntryProcessor, InvokeEntry, ProcessorError};

    struct Append;

    impl EntryProcessor for Append {
        fn process(
            &self,
            entry: &mut InvokeEntry<'_>,
        ) -> Result<Option<Bytes>, ProcessorError> {
            let mut val = entry.value().map(|v| v.to_vec()).unwrap_or_default();
            val.extend_from_slice(b"+1");
            entry.set_value(Bytes::from(val));
            Ok(None)
        }
    }

    let ctx = CacheContext::new(CacheConfig::new("atomic").with_partitions(1));
    let entry = ctx.entry(&CacheKey::from("k"));

    let v1 = ctx.versions().next();
    entry
        .inner_update(&ctx, AtomicUpdateRequest::put(bytes("x"), v1))
        .unwrap();

    let v2 = ctx.versions().next();
    let res = entry
        .inner_update(&ctx, AtomicUpdateRequest::transform(Arc::new(Append), v2))
        .unwrap();

    assert_eq!(res.outcome, UpdateOutcome::Success);
    assert_eq!(entry.raw_get().unwrap(), "x+1");
    assert_eq!(entry.version().unwrap(), v2);
}

#[test]
fn test_entry_processor_error_is_captured() {
    use cairn_core::{EntryProcessor, InvokeEntry, ProcessorError};

    struct Fails;

    impl EntryProcessor for Fails {
        fn process(
            &self,
            _entry: &mut InvokeEntry<'_>,
        ) -> Result<Option<Bytes>, ProcessorError> {
            Err(ProcessorError("boom".into()))
        }
    }

    let ctx = CacheContext::new(CacheConfig::new("atomic").with_partitions(1));
    let entry = ctx.entry(&CacheKey::from("k"));

    let v1 = ctx.versions().next();
    entry
        .inner_update(&ctx, AtomicUpdateRequest::put(bytes("x"), v1))
        .unwrap();

    let v2 = ctx.versions().next();
    let res = entry
        .inner_update(&ctx, AtomicUpdateRequest::transform(Arc::new(Fails), v2))
        .unwrap();

    // The failure is reported to the caller; the entry is untouched.
    assert_eq!(res.outcome, UpdateOutcome::InvokeNoOp);
    assert_eq!(res.invoke_result.unwrap().error.unwrap().0, "boom");
    assert_eq!(entry.raw_get().unwrap(), "x");
    assert_eq!(entry.version().unwrap(), v1);
}

#[test]
fn test_zero_ttl_policy_demotes_put_to_delete() {
    let ctx = CacheContext::new(CacheConfig::new("ttl").with_partitions(1));
    let entry = ctx.entry(&CacheKey::from("k"));

    let v1 = ctx.versions().next();
    entry
        .inner_update(&ctx, AtomicUpdateRequest::put(bytes("a"), v1))
        .unwrap();

    let policy = ConstantExpiry::new().with_update(Ttl::Zero);

    let v2 = ctx.versions().next();
    let res = entry
        .inner_update(
            &ctx,
            AtomicUpdateRequest::put(bytes("b"), v2).with_expiry(&policy),
        )
        .unwrap();

    // The write became a removal of the existing value.
    assert_eq!(res.outcome, UpdateOutcome::Success);
    assert_eq!(res.new_value, None);
    assert_eq!(res.old_value.as_deref(), Some(b"a".as_slice()));
    assert!(!entry.has_value());
}

#[test]
fn test_remove_of_absent_value_reports_no_val() {
    let ctx = CacheContext::new(CacheConfig::new("atomic").with_partitions(1));
    let entry = ctx.entry(&CacheKey::from("k"));

    let v1 = ctx.versions().next();
    let res = entry
        .inner_update(&ctx, AtomicUpdateRequest::delete(v1))
        .unwrap();

    assert_eq!(res.outcome, UpdateOutcome::RemoveNoVal);
    assert_eq!(res.old_value, None);
}

#[test]
fn test_equal_versions_with_ignore_time_refresh_store() {
    let store = MapStore::new();

    let ctx = CacheContext::builder(
        CacheConfig::new("atomic")
            .with_partitions(1)
            .with_write_through(true)
            .with_write_order(WriteOrderMode::Primary),
    )
    .with_external_store(store.clone())
    .build();

    let key = CacheKey::from("k");
    let entry = ctx.entry(&key);

    let va = Version::new(1, 100, 50, 1, 0);
    entry
        .inner_update(&ctx, AtomicUpdateRequest::put(bytes("a"), va))
        .unwrap();

    store.clear_log();

    // Same logical version, different wall clock: a duplicate, not a write.
    let vb = Version::new(1, 999, 50, 1, 0);
    let res = entry
        .inner_update(&ctx, AtomicUpdateRequest::put(bytes("x"), vb))
        .unwrap();

    assert_eq!(res.outcome, UpdateOutcome::VersionCheckFailed);
    assert_eq!(entry.raw_get().unwrap(), "a");

    let puts = store.puts.lock().clone();
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0].0.as_ref(), b"a");
    assert_eq!(puts[0].1, va);
}

#[test]
fn test_filter_failure_is_a_no_op() {
    let ctx = CacheContext::new(CacheConfig::new("atomic").with_partitions(1));
    let entry = ctx.entry(&CacheKey::from("k"));

    let v1 = ctx.versions().next();
    entry
        .inner_update(&ctx, AtomicUpdateRequest::put(bytes("a"), v1))
        .unwrap();

    let only_missing: &cairn_core::EntryFilter = &|view| view.value().is_none();
    let filter = [only_missing];

    let v2 = ctx.versions().next();
    let res = entry
        .inner_update(
            &ctx,
            AtomicUpdateRequest::put(bytes("b"), v2).with_filter(&filter),
        )
        .unwrap();

    assert_eq!(res.outcome, UpdateOutcome::FilterFailed);
    assert_eq!(entry.raw_get().unwrap(), "a");
    assert_eq!(entry.version().unwrap(), v1);
}

#[test]
fn test_update_counters_strictly_increase_per_entry() {
    let queries = RecordingQueries::new();

    let ctx = CacheContext::builder(CacheConfig::new("tx").with_partitions(1))
        .with_queries(queries.clone())
        .build();

    let entry = ctx.entry(&CacheKey::from("k"));

    let mut counters = Vec::new();
    for i in 0..4 {
        let res = entry
            .inner_set(&ctx, bytes(&format!("v{i}")), TxWriteRequest::new())
            .unwrap();
        counters.push(res.update_counter);
    }

    assert_eq!(counters, vec![1, 2, 3, 4]);

    // Continuous queries observed the same counters, in commit order, with
    // the committed (old, new) pairs.
    let updates = queries.updates.lock().clone();
    assert_eq!(updates.len(), 4);

    for (i, update) in updates.iter().enumerate() {
        assert_eq!(update.update_counter, (i + 1) as u64);
        assert_eq!(
            update.new_value.as_deref(),
            Some(format!("v{i}").as_bytes())
        );

        let expected_old = if i == 0 {
            None
        } else {
            Some(format!("v{}", i - 1))
        };
        assert_eq!(
            update.old_value.as_deref(),
            expected_old.as_deref().map(str::as_bytes)
        );
    }
}

#[test]
fn test_read_through_installs_loaded_value() {
    let store = MapStore::new();
    store.seed("k", "from-store");

    let ctx = CacheContext::builder(
        CacheConfig::new("rt")
            .with_partitions(1)
            .with_read_through(true),
    )
    .with_external_store(store.clone())
    .build();

    let entry = ctx.entry(&CacheKey::from("k"));

    let read = entry
        .inner_get(&ctx, GetRequest::new().with_read_through(true))
        .unwrap();

    assert_eq!(read.unwrap(), "from-store");

    // Installed: a second read hits without the store.
    assert_eq!(entry.raw_get().unwrap(), "from-store");
    assert!(!entry.is_new(&ctx).unwrap());
}

#[test]
fn test_interceptor_rewrites_and_vetoes() {
    use cairn_core::{EntryView, Interceptor};

    struct Sanitizer;

    impl Interceptor for Sanitizer {
        fn on_before_put(&self, _entry: EntryView<'_>, new_val: &Bytes) -> Option<Bytes> {
            if new_val.as_ref() == b"forbidden" {
                return None;
            }

            let mut rewritten = new_val.to_vec();
            rewritten.extend_from_slice(b"!");
            Some(Bytes::from(rewritten))
        }

        fn on_before_remove(&self, _entry: EntryView<'_>) -> (bool, Option<Bytes>) {
            (true, Some(Bytes::from_static(b"kept")))
        }

        fn on_after_put(&self, _entry: EntryView<'_>) {}

        fn on_after_remove(&self, _entry: EntryView<'_>) {}
    }

    let ctx = CacheContext::builder(CacheConfig::new("icp").with_partitions(1))
        .with_interceptor(Arc::new(Sanitizer))
        .build();

    let entry = ctx.entry(&CacheKey::from("k"));

    // Rewrite on the way in.
    let res = entry
        .inner_set(&ctx, bytes("v"), TxWriteRequest::new())
        .unwrap();
    assert!(res.success);
    assert_eq!(entry.raw_get().unwrap(), "v!");

    // Veto leaves the entry untouched.
    let res = entry
        .inner_set(&ctx, bytes("forbidden"), TxWriteRequest::new())
        .unwrap();
    assert!(!res.success);
    assert_eq!(entry.raw_get().unwrap(), "v!");

    // Remove cancellation reports the interceptor's value.
    let res = entry.inner_remove(&ctx, TxWriteRequest::new()).unwrap();
    assert!(!res.success);
    assert_eq!(res.old_value.as_deref(), Some(b"kept".as_slice()));
    assert_eq!(entry.raw_get().unwrap(), "v!");
}

#[test]
fn test_atomic_interceptor_cancel_outcome() {
    use cairn_core::{EntryView, Interceptor};

    struct DenyAll;

    impl Interceptor for DenyAll {
        fn on_before_put(&self, _entry: EntryView<'_>, _new_val: &Bytes) -> Option<Bytes> {
            None
        }

        fn on_before_remove(&self, _entry: EntryView<'_>) -> (bool, Option<Bytes>) {
            (true, None)
        }

        fn on_after_put(&self, _entry: EntryView<'_>) {}

        fn on_after_remove(&self, _entry: EntryView<'_>) {}
    }

    let ctx = CacheContext::builder(CacheConfig::new("icp").with_partitions(1))
        .with_interceptor(Arc::new(DenyAll))
        .build();

    let entry = ctx.entry(&CacheKey::from("k"));

    let v1 = ctx.versions().next();
    let res = entry
        .inner_update(&ctx, AtomicUpdateRequest::put(bytes("a"), v1))
        .unwrap();

    assert_eq!(res.outcome, UpdateOutcome::InterceptorCancel);
    assert!(!entry.has_value());
}

#[test]
fn test_merge_conflict_writes_merged_value() {
    let ctx = CacheContext::builder(CacheConfig::new("dr").with_partitions(1))
        .with_resolver(Arc::new(FixedResolver(ConflictResolution::Merge(bytes(
            "merged",
        )))))
        .build();

    let entry = ctx.entry(&CacheKey::from("k"));

    let v1 = ctx.versions().next();
    entry
        .inner_set(&ctx, bytes("a"), TxWriteRequest::new().with_version(v1))
        .unwrap();

    let v2 = ctx.versions().next();
    let res = entry
        .inner_update(&ctx, AtomicUpdateRequest::put(bytes("b"), v2))
        .unwrap();

    assert_eq!(res.outcome, UpdateOutcome::Success);
    assert_eq!(entry.raw_get().unwrap(), "merged");
    assert_eq!(entry.version().unwrap(), v2);
}

#[test]
fn test_local_update_put_and_delete() {
    use cairn_core::{LocalUpdateRequest, UpdateOp};

    let ctx = CacheContext::new(CacheConfig::new("local").with_partitions(1));
    let entry = ctx.entry(&CacheKey::from("k"));

    let res = entry
        .inner_update_local(&ctx, LocalUpdateRequest::new(UpdateOp::Update(bytes("a"))))
        .unwrap();

    assert!(res.success);
    assert!(res.old_value.is_none());
    assert_eq!(entry.raw_get().unwrap(), "a");

    let res = entry
        .inner_update_local(&ctx, LocalUpdateRequest::new(UpdateOp::Delete))
        .unwrap();

    assert!(res.success);
    assert_eq!(res.old_value.as_deref(), Some(b"a".as_slice()));
    assert!(!entry.has_value());

    // Deleting again finds nothing to delete.
    let res = entry
        .inner_update_local(&ctx, LocalUpdateRequest::new(UpdateOp::Delete))
        .unwrap();
    assert!(!res.success);
}

#[test]
fn test_local_update_transform() {
    use cairn_core::{EntryProcessor, InvokeEntry, LocalUpdateRequest, ProcessorError, UpdateOp};

    struct Counter;

    impl EntryProcessor for Counter {
        fn process(
            &self,
            entry: &mut InvokeEntry<'_>,
        ) -> Result<Option<Bytes>, ProcessorError> {
            let next = match entry.value() {
                Some(v) => v.len() + 1,
                None => 1,
            };

            entry.set_value(Bytes::from(vec![b'x'; next]));
            Ok(Some(Bytes::from(next.to_string())))
        }
    }

    let ctx = CacheContext::new(CacheConfig::new("local").with_partitions(1));
    let entry = ctx.entry(&CacheKey::from("k"));

    let res = entry
        .inner_update_local(
            &ctx,
            LocalUpdateRequest::new(UpdateOp::Transform(Arc::new(Counter))),
        )
        .unwrap();

    assert!(res.success);
    assert_eq!(
        res.invoke_result.unwrap().computed.as_deref(),
        Some(b"1".as_slice())
    );
    assert_eq!(entry.raw_get().unwrap(), "x");

    let res = entry
        .inner_update_local(
            &ctx,
            LocalUpdateRequest::new(UpdateOp::Transform(Arc::new(Counter))),
        )
        .unwrap();

    assert!(res.success);
    assert_eq!(entry.raw_get().unwrap(), "xx");
}

#[test]
fn test_dr_replication_on_tx_writes() {
    use cairn_core::DrType;

    let dr = RecordingDr::new();

    let ctx = CacheContext::builder(CacheConfig::new("dr").with_partitions(1))
        .with_dr(dr.clone())
        .build();

    let entry = ctx.entry(&CacheKey::from("k"));

    entry
        .inner_set(
            &ctx,
            bytes("v"),
            TxWriteRequest::new().with_dr(DrType::Primary),
        )
        .unwrap();

    let ver = entry.version().unwrap();

    entry
        .inner_remove(&ctx, TxWriteRequest::new().with_dr(DrType::Primary))
        .unwrap();

    let replicated = dr.replicated.lock().clone();
    assert_eq!(replicated.len(), 2);

    assert_eq!(replicated[0].0.as_deref(), Some(b"v".as_slice()));
    assert_eq!(replicated[0].1, ver);
    assert_eq!(replicated[0].2, DrType::Primary);

    // The removal replicates a tombstone with the remove version.
    assert_eq!(replicated[1].0, None);
    assert!(replicated[1].1 > ver);
}

#[test]
fn test_partitioned_counters_are_independent() {
    let ctx = CacheContext::new(CacheConfig::new("parts").with_partitions(8));

    // Find two keys living in different partitions.
    let k1 = CacheKey::from("alpha");
    let mut k2 = None;
    for i in 0..64 {
        let candidate = CacheKey::from(format!("key-{i}").as_str());
        if ctx.partition_for(&candidate).id() != ctx.partition_for(&k1).id() {
            k2 = Some(candidate);
            break;
        }
    }
    let k2 = k2.expect("no key in another partition");

    let e1 = ctx.entry(&k1);
    let e2 = ctx.entry(&k2);

    let r1 = e1.inner_set(&ctx, bytes("a"), TxWriteRequest::new()).unwrap();
    let r2 = e2.inner_set(&ctx, bytes("b"), TxWriteRequest::new()).unwrap();

    // Each partition hands out its own sequence.
    assert_eq!(r1.update_counter, 1);
    assert_eq!(r2.update_counter, 1);
}
