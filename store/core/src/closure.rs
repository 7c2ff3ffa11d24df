//! Atomic update closure: the stateless planner executed under the entry
//! lock.
//!
//! The closure is handed the current row by [`RowStore::invoke`], decides the
//! resulting operation (put, remove, or no-op), computes the new TTL and
//! expire time, resolves cross-datacenter conflicts or performs the version
//! check, evaluates filter and interceptor, and stages the new row. First
//! matching rejection wins; the caller surfaces the outcome tag.
//!
//! [`RowStore::invoke`]: crate::store::RowStore::invoke

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::conflict::{ConflictResolution, DrType, VersionedEntry};
use crate::context::CacheContext;
use crate::entry::{CacheEntry, EntryState};
use crate::error::CacheResult;
use crate::expiry::{to_expire_time, ExpiryPolicy, Ttl};
use crate::interceptor::{filter_passes, EntryFilter, EntryView};
use crate::key::CacheKey;
use crate::store::{InvokeClosure, Row, TreeOp};
use crate::version::{compare, Version};

/// Error raised by an entry processor. Captured into the invoke result; the
/// update proceeds as if the processor left the entry unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorError(pub String);

impl fmt::Display for ProcessorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry processor failed: {}", self.0)
    }
}

impl std::error::Error for ProcessorError {}

/// User code invoked against an entry view under the lock.
pub trait EntryProcessor: Send + Sync {
    /// Inspect and optionally mutate the entry; the returned value is
    /// reported to the caller as the processor's computed result.
    fn process(&self, entry: &mut InvokeEntry<'_>) -> Result<Option<Bytes>, ProcessorError>;
}

/// Mutable entry view passed to an [`EntryProcessor`].
pub struct InvokeEntry<'a> {
    key: &'a CacheKey,
    val: Option<Bytes>,
    ver: Version,
    modified: bool,
}

impl<'a> InvokeEntry<'a> {
    pub(crate) fn new(key: &'a CacheKey, val: Option<Bytes>, ver: Version) -> Self {
        Self {
            key,
            val,
            ver,
            modified: false,
        }
    }

    /// The entry key.
    #[inline]
    pub fn key(&self) -> &CacheKey {
        self.key
    }

    /// The current value.
    #[inline]
    pub fn value(&self) -> Option<&Bytes> {
        self.val.as_ref()
    }

    /// The entry version at invocation time.
    #[inline]
    pub fn version(&self) -> Version {
        self.ver
    }

    /// Whether a value exists.
    #[inline]
    pub fn exists(&self) -> bool {
        self.val.is_some()
    }

    /// Replace the value; converts the invocation into an update.
    pub fn set_value(&mut self, val: Bytes) {
        self.val = Some(val);
        self.modified = true;
    }

    /// Remove the value; converts the invocation into a delete.
    pub fn remove(&mut self) {
        self.val = None;
        self.modified = true;
    }

    /// Whether the processor changed the entry.
    #[inline]
    pub fn modified(&self) -> bool {
        self.modified
    }

    pub(crate) fn into_value(self) -> Option<Bytes> {
        self.val
    }
}

/// Result of running the entry processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeResult {
    /// Value the processor returned.
    pub computed: Option<Bytes>,
    /// Error the processor raised, if any.
    pub error: Option<ProcessorError>,
}

/// Operation requested on an atomic update path.
#[derive(Clone)]
pub enum UpdateOp {
    /// Write this value.
    Update(Bytes),
    /// Remove the value.
    Delete,
    /// Run an entry processor and apply whatever it decides.
    Transform(Arc<dyn EntryProcessor>),
}

impl fmt::Debug for UpdateOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Update(val) => f.debug_tuple("Update").field(&val.len()).finish(),
            Self::Delete => write!(f, "Delete"),
            Self::Transform(_) => write!(f, "Transform"),
        }
    }
}

/// Outcome tag of an atomic update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The update committed.
    Success,
    /// A delete found no previous value; safe, nothing written.
    RemoveNoVal,
    /// The incoming version was not newer than the current one.
    VersionCheckFailed,
    /// The filter rejected the update.
    FilterFailed,
    /// The entry processor left the entry unchanged.
    InvokeNoOp,
    /// The conflict resolver kept the existing entry.
    ConflictUseOld,
    /// The interceptor vetoed the operation.
    InterceptorCancel,
}

/// Result of the atomic update path.
#[derive(Debug, Clone)]
pub struct UpdateAtomicResult {
    /// What happened.
    pub outcome: UpdateOutcome,
    /// Value before the update.
    pub old_value: Option<Bytes>,
    /// Committed value; `None` for removals and rejections.
    pub new_value: Option<Bytes>,
    /// Entry-processor result for `Transform` operations.
    pub invoke_result: Option<InvokeResult>,
    /// Committed TTL in milliseconds.
    pub new_ttl: u64,
    /// Committed absolute expire time.
    pub new_expire_time: u64,
    /// Version to drive deferred-delete enqueueing for removals.
    pub enqueue_version: Option<Version>,
    /// Partition update counter assigned to the write; zero for rejections.
    pub update_counter: u64,
}

impl UpdateAtomicResult {
    /// Whether the operation changed (or validly no-op removed) the entry.
    pub fn success(&self) -> bool {
        matches!(
            self.outcome,
            UpdateOutcome::Success | UpdateOutcome::RemoveNoVal
        )
    }
}

/// Parameters of an atomic update.
pub struct AtomicUpdateRequest<'a> {
    /// The operation to apply.
    pub op: UpdateOp,
    /// Version assigned to the update by its coordinator.
    pub new_ver: Version,
    /// Load a missing previous value from the external store.
    pub read_through: bool,
    /// Propagate the result to the external store (inside the row invoke).
    pub write_through: bool,
    /// Whether this node is the primary for the key.
    pub primary: bool,
    /// Reject updates whose version is not newer than the entry's.
    pub version_check: bool,
    /// Filter evaluated under the lock.
    pub filter: &'a [&'a EntryFilter],
    /// Explicit TTL decision.
    pub explicit_ttl: Ttl,
    /// Explicit expire time (conflict-driven writes carry one).
    pub explicit_expire_time: Option<u64>,
    /// Conflict version received from another data center.
    pub conflict_ver: Option<Version>,
    /// Expiry policy for this operation.
    pub expiry: Option<&'a dyn ExpiryPolicy>,
    /// Run the configured interceptor.
    pub intercept: bool,
    /// Pre-assigned update counter (backup replay).
    pub update_counter: Option<u64>,
    /// Emit events.
    pub record_event: bool,
    /// Maintain statistics.
    pub update_metrics: bool,
    /// DR participation of this write.
    pub dr_type: DrType,
    /// Topology version the update is mapped on.
    pub topology_version: u32,
}

impl<'a> AtomicUpdateRequest<'a> {
    fn base(op: UpdateOp, new_ver: Version) -> Self {
        Self {
            op,
            new_ver,
            read_through: false,
            write_through: false,
            primary: true,
            version_check: true,
            filter: &[],
            explicit_ttl: Ttl::NotChanged,
            explicit_expire_time: None,
            conflict_ver: None,
            expiry: None,
            intercept: true,
            update_counter: None,
            record_event: true,
            update_metrics: true,
            dr_type: DrType::None,
            topology_version: new_ver.topology_version,
        }
    }

    /// A value write.
    pub fn put(val: Bytes, new_ver: Version) -> Self {
        Self::base(UpdateOp::Update(val), new_ver)
    }

    /// A removal.
    pub fn delete(new_ver: Version) -> Self {
        Self::base(UpdateOp::Delete, new_ver)
    }

    /// An entry-processor invocation.
    pub fn transform(processor: Arc<dyn EntryProcessor>, new_ver: Version) -> Self {
        Self::base(UpdateOp::Transform(processor), new_ver)
    }

    /// Enable read-through for the previous value.
    pub fn with_read_through(mut self, enabled: bool) -> Self {
        self.read_through = enabled;
        self
    }

    /// Enable write-through.
    pub fn with_write_through(mut self, enabled: bool) -> Self {
        self.write_through = enabled;
        self
    }

    /// Mark this node primary or backup for the key.
    pub fn with_primary(mut self, primary: bool) -> Self {
        self.primary = primary;
        self
    }

    /// Enable or disable the version check.
    pub fn with_version_check(mut self, enabled: bool) -> Self {
        self.version_check = enabled;
        self
    }

    /// Evaluate this filter under the lock.
    pub fn with_filter(mut self, filter: &'a [&'a EntryFilter]) -> Self {
        self.filter = filter;
        self
    }

    /// Use an explicit TTL.
    pub fn with_ttl(mut self, ttl: Ttl) -> Self {
        self.explicit_ttl = ttl;
        self
    }

    /// Apply this expiry policy.
    pub fn with_expiry(mut self, expiry: &'a dyn ExpiryPolicy) -> Self {
        self.expiry = Some(expiry);
        self
    }

    /// Attach the conflict version received from another data center.
    pub fn with_conflict_version(mut self, ver: Version) -> Self {
        self.conflict_ver = Some(ver);
        self
    }

    /// Mark the write for DR replication.
    pub fn with_dr(mut self, dr_type: DrType) -> Self {
        self.dr_type = dr_type;
        self
    }
}

/// The planner itself. Borrows the locked entry state for the duration of
/// the row invoke.
pub(crate) struct UpdateClosure<'a> {
    entry: &'a CacheEntry,
    state: &'a mut EntryState,
    ctx: &'a CacheContext,
    op: UpdateOp,
    new_ver: Version,
    read_through: bool,
    write_through: bool,
    primary: bool,
    version_check: bool,
    filter: &'a [&'a EntryFilter],
    explicit_ttl: Ttl,
    explicit_expire_time: Option<u64>,
    conflict_ver: Option<Version>,
    conflict_expiration: Option<(u64, u64)>,
    expiry: Option<&'a dyn ExpiryPolicy>,
    intercept: bool,
    update_counter: Option<u64>,
    write_val: Option<Bytes>,
    tree_op: TreeOp,
    new_row: Option<Row>,
    result: Option<UpdateAtomicResult>,
}

impl<'a> UpdateClosure<'a> {
    pub(crate) fn new(
        entry: &'a CacheEntry,
        state: &'a mut EntryState,
        ctx: &'a CacheContext,
        req: AtomicUpdateRequest<'a>,
    ) -> Self {
        let tree_op = match &req.op {
            UpdateOp::Update(_) => TreeOp::Put,
            UpdateOp::Delete => TreeOp::Remove,
            UpdateOp::Transform(_) => TreeOp::Noop,
        };

        Self {
            entry,
            state,
            ctx,
            op: req.op,
            new_ver: req.new_ver,
            read_through: req.read_through,
            write_through: req.write_through,
            primary: req.primary,
            version_check: req.version_check,
            filter: req.filter,
            explicit_ttl: req.explicit_ttl,
            explicit_expire_time: req.explicit_expire_time,
            conflict_ver: req.conflict_ver,
            conflict_expiration: None,
            expiry: req.expiry,
            intercept: req.intercept,
            update_counter: req.update_counter,
            write_val: None,
            tree_op,
            new_row: None,
            result: None,
        }
    }

    pub(crate) fn into_result(self) -> UpdateAtomicResult {
        self.result
            .expect("update closure finished without a result")
    }

    fn reject(&mut self, outcome: UpdateOutcome, invoke_result: Option<InvokeResult>) {
        self.tree_op = TreeOp::Noop;

        self.result = Some(UpdateAtomicResult {
            outcome,
            old_value: self.state.val.clone(),
            new_value: None,
            invoke_result,
            new_ttl: 0,
            new_expire_time: 0,
            enqueue_version: None,
            update_counter: 0,
        });
    }

    /// Push the entry's current state back into the external store; used
    /// when a duplicate (same-version) update must still refresh a store
    /// that may have missed the first write.
    fn refresh_store(&self) -> CacheResult<()> {
        let Some(external) = self.ctx.external() else {
            return Ok(());
        };

        match &self.state.val {
            Some(val) => external.put(None, self.entry.key(), val, self.state.ver),
            None => external.remove(None, self.entry.key()),
        }
    }

    fn resolve_conflict(&mut self, invoke_result: Option<InvokeResult>) -> CacheResult<()> {
        let Some(resolver) = self.ctx.resolver() else {
            // Not conflict-enabled: drop the received conflict version so
            // regular versions drive subsequent updates.
            self.conflict_ver = None;
            return Ok(());
        };

        let is_start = self.entry.is_start(self.ctx, self.state);

        let old_entry = VersionedEntry {
            value: self.state.val.clone(),
            ttl: self.state.ttl(),
            expire_time: self.state.expire_time(),
            version: self.state.conflict_version(),
            is_start,
        };

        let (new_ttl, new_expire, _) = self.entry.ttl_and_expire_time(
            self.state,
            self.expiry,
            self.explicit_ttl,
            self.explicit_expire_time,
            is_start,
        );

        let new_conflict_ver = self.conflict_ver.unwrap_or(self.new_ver);

        let new_entry = VersionedEntry {
            value: self.write_val.clone(),
            ttl: new_ttl,
            expire_time: new_expire,
            version: new_conflict_ver,
            is_start: false,
        };

        match resolver.resolve(&old_entry, &new_entry, self.version_check) {
            ConflictResolution::UseOld => {
                let ignore_time = self.ctx.config().ignore_version_time();

                // A duplicate of the already-applied update: refresh the
                // store on the primary so write-through converges.
                if !is_start
                    && self.version_check
                    && old_entry.version.data_center_id == new_conflict_ver.data_center_id
                    && compare(&old_entry.version, &new_conflict_ver, ignore_time)
                        == Ordering::Equal
                    && self.ctx.write_through()
                    && self.primary
                {
                    self.refresh_store()?;
                }

                self.reject(UpdateOutcome::ConflictUseOld, invoke_result);
            }
            ConflictResolution::Merge(merged) => {
                self.write_val = Some(merged);
                self.conflict_ver = None;
                self.conflict_expiration = Some((new_ttl, new_expire));
            }
            ConflictResolution::UseNew => {
                self.conflict_expiration = Some((new_ttl, new_expire));
            }
        }

        Ok(())
    }

    fn version_check_step(&mut self, invoke_result: Option<InvokeResult>) -> CacheResult<()> {
        let ignore_time = self.ctx.config().ignore_version_time();
        let is_start = self.entry.is_start(self.ctx, self.state);

        if !self.version_check {
            debug_assert!(
                is_start
                    || compare(&self.state.ver, &self.new_ver, ignore_time) != Ordering::Greater,
                "stale version on a non-checking update path"
            );

            return Ok(());
        }

        if is_start {
            return Ok(());
        }

        match compare(&self.state.ver, &self.new_ver, ignore_time) {
            Ordering::Less => Ok(()),
            Ordering::Equal if self.ctx.write_through() && self.primary => {
                debug!(
                    cache = %self.ctx.config().name,
                    "received update with the current version, refreshing store"
                );

                self.refresh_store()?;
                self.reject(UpdateOutcome::VersionCheckFailed, invoke_result);

                Ok(())
            }
            _ => {
                debug!(
                    cache = %self.ctx.config().name,
                    "received update with a stale version, ignoring"
                );

                self.reject(UpdateOutcome::VersionCheckFailed, invoke_result);

                Ok(())
            }
        }
    }

    fn apply_update(&mut self, invoke_result: Option<InvokeResult>) -> CacheResult<()> {
        let Some(mut updated) = self.write_val.clone() else {
            return self.apply_remove(invoke_result);
        };

        let old_val = self.state.val.clone();

        let (new_ttl, new_expire) = match self.conflict_expiration {
            Some(expiration) => expiration,
            None => {
                let decision = if self.explicit_ttl != Ttl::NotChanged {
                    self.explicit_ttl
                } else {
                    match self.expiry {
                        Some(policy) => {
                            if self.state.has_value() {
                                policy.for_update()
                            } else {
                                policy.for_create()
                            }
                        }
                        None => Ttl::NotChanged,
                    }
                };

                match decision {
                    // A zero TTL demotes the write to a delete.
                    Ttl::Zero => {
                        self.write_val = None;
                        return self.apply_remove(invoke_result);
                    }
                    Ttl::NotChanged => (self.state.ttl(), self.state.expire_time()),
                    Ttl::Eternal => (0, self.explicit_expire_time.unwrap_or(0)),
                    Ttl::Millis(ms) => (
                        ms,
                        self.explicit_expire_time
                            .unwrap_or_else(|| to_expire_time(ms)),
                    ),
                }
            }
        };

        if self.intercept {
            if let Some(interceptor) = self.ctx.interceptor() {
                let adopted = {
                    let view = EntryView::new(self.entry.key(), self.state.val.as_ref());
                    interceptor.on_before_put(view, &updated)
                };

                match adopted {
                    None => {
                        self.reject(UpdateOutcome::InterceptorCancel, invoke_result);
                        return Ok(());
                    }
                    Some(val) => updated = val,
                }
            }
        }

        // Non-transactional mode persists inside the row invoke.
        if self.write_through && self.ctx.write_through() {
            if let Some(external) = self.ctx.external() {
                external.put(None, self.entry.key(), &updated, self.new_ver)?;
            }
        }

        if self.ctx.config().deferred_delete && self.state.is_deleted() {
            self.entry.set_deleted_flag(self.state, false);
        }

        let counter = self.update_counter.unwrap_or_else(|| {
            self.ctx
                .partition(self.entry.partition())
                .next_update_counter()
        });

        self.entry
            .log_update(self.ctx, Some(&updated), self.new_ver, new_expire, counter, false)?;

        self.new_row = Some(Row {
            value: updated.clone(),
            version: self.new_ver,
            expire_time: new_expire,
        });

        self.entry.apply(
            self.state,
            Some(updated.clone()),
            new_expire,
            new_ttl,
            self.new_ver,
        );

        self.state.conflict_ver = self.conflict_ver.filter(|cv| *cv != self.new_ver);

        self.tree_op = TreeOp::Put;

        self.result = Some(UpdateAtomicResult {
            outcome: UpdateOutcome::Success,
            old_value: old_val,
            new_value: Some(updated),
            invoke_result,
            new_ttl,
            new_expire_time: new_expire,
            enqueue_version: None,
            update_counter: counter,
        });

        Ok(())
    }

    fn apply_remove(&mut self, invoke_result: Option<InvokeResult>) -> CacheResult<()> {
        let old_val = self.state.val.clone();

        let mut intercept_val = None;

        if self.intercept {
            if let Some(interceptor) = self.ctx.interceptor() {
                let (cancel, val) = {
                    let view = EntryView::new(self.entry.key(), self.state.val.as_ref());
                    interceptor.on_before_remove(view)
                };

                if cancel {
                    self.reject(UpdateOutcome::InterceptorCancel, invoke_result);

                    if let Some(result) = &mut self.result {
                        result.old_value = val.or(result.old_value.take());
                    }

                    return Ok(());
                }

                intercept_val = val;
            }
        }

        if self.write_through && self.ctx.write_through() {
            if let Some(external) = self.ctx.external() {
                external.remove(None, self.entry.key())?;
            }
        }

        let counter = self.update_counter.unwrap_or_else(|| {
            self.ctx
                .partition(self.entry.partition())
                .next_update_counter()
        });

        if self.ctx.config().deferred_delete && !self.state.is_deleted() {
            // Both a removed value and a never-written entry leave a
            // tombstone until the deferred delete drains.
            if old_val.is_some() || self.entry.is_start(self.ctx, self.state) {
                self.state.val = None;
                self.entry.set_deleted_flag(self.state, true);
            }
        }

        self.entry
            .log_update(self.ctx, None, self.new_ver, 0, counter, false)?;

        self.entry.apply(self.state, None, 0, 0, self.new_ver);
        self.state.conflict_ver = None;

        self.tree_op = if old_val.is_some() {
            TreeOp::Remove
        } else {
            TreeOp::Noop
        };

        let outcome = if old_val.is_some() {
            UpdateOutcome::Success
        } else {
            UpdateOutcome::RemoveNoVal
        };

        self.result = Some(UpdateAtomicResult {
            outcome,
            old_value: intercept_val.or(old_val),
            new_value: None,
            invoke_result,
            new_ttl: 0,
            new_expire_time: 0,
            enqueue_version: Some(self.new_ver),
            update_counter: counter,
        });

        Ok(())
    }
}

impl InvokeClosure for UpdateClosure<'_> {
    fn call(&mut self, old_row: Option<Row>) -> CacheResult<()> {
        if let Some(row) = &old_row {
            self.entry.install_row(self.state, row);
        }

        let mut old_val = self.state.val.clone();

        // Load the previous value through the store of record if needed.
        if old_val.is_none() && self.read_through && self.ctx.read_through() {
            if let Some(external) = self.ctx.external() {
                if let Some(loaded) = external.load(None, self.entry.key())? {
                    old_val = Some(loaded.clone());
                    self.state.val = Some(loaded);

                    if self.state.is_deleted() {
                        self.entry.set_deleted_flag(self.state, false);
                    }
                }
            }
        }

        // Entry processor for transforms.
        let mut invoke_result = None;
        let mut transform = false;
        let mut transform_modified = false;

        if let UpdateOp::Transform(processor) = &self.op {
            transform = true;

            let mut invoke_entry =
                InvokeEntry::new(self.entry.key(), old_val.clone(), self.state.ver);

            match processor.process(&mut invoke_entry) {
                Ok(computed) => {
                    transform_modified = invoke_entry.modified();

                    invoke_result = computed.map(|c| InvokeResult {
                        computed: Some(c),
                        error: None,
                    });

                    self.write_val = if transform_modified {
                        invoke_entry.into_value()
                    } else {
                        old_val.clone()
                    };
                }
                Err(err) => {
                    invoke_result = Some(InvokeResult {
                        computed: None,
                        error: Some(err),
                    });

                    self.write_val = old_val.clone();
                }
            }
        } else {
            self.write_val = match &self.op {
                UpdateOp::Update(val) => Some(val.clone()),
                _ => None,
            };
        }

        // Conflict resolution when configured, version check otherwise.
        if self.ctx.resolver().is_some() {
            self.resolve_conflict(invoke_result.clone())?;
        } else {
            self.conflict_ver = None;
            self.version_check_step(invoke_result.clone())?;
        }

        if self.result.is_some() {
            return Ok(());
        }

        // Filter under the lock.
        if !self.filter.is_empty() {
            let passes = {
                let view = EntryView::new(self.entry.key(), self.state.val.as_ref());
                filter_passes(self.filter, &view)
            };

            if !passes {
                self.reject(UpdateOutcome::FilterFailed, invoke_result);
                return Ok(());
            }
        }

        // A processor that changed nothing produces no write.
        if transform && !transform_modified {
            self.reject(UpdateOutcome::InvokeNoOp, invoke_result);
            return Ok(());
        }

        if self.write_val.is_some() {
            self.apply_update(invoke_result)
        } else {
            self.apply_remove(invoke_result)
        }
    }

    fn operation(&self) -> TreeOp {
        self.tree_op
    }

    fn new_row(&self) -> Option<Row> {
        self.new_row.clone()
    }
}
