//! Per-key cache entry state machine.
//!
//! One [`CacheEntry`] owns the authoritative in-memory metadata for a key:
//! value handle, version, TTL and expire time, deletion and obsolete markers,
//! lock candidates, and its slice of the partition update counter stream. All
//! mutations run under the entry's mutex; store writes happen while the row
//! is being committed, while events, continuous-query notification, and
//! after-interceptors fire after the lock is released.
//!
//! # Lifecycle
//!
//! ```text
//!            put / remove(deferred) / load / invalidate
//!          +--------------------------------------------+
//!          v                                            |
//!   +-------------+   remove / expire / evict    +-------------+
//!   |   Active    |----------------------------->|  Obsolete   |
//!   | (val, ver)  |        (non-deferred)        | (terminal)  |
//!   +-------------+                              +-------------+
//!          |   ^
//!  remove  |   |  put (resurrect)
//! (deferred)   |
//!          v   |
//!   +-------------+
//!   |   Deleted   |  val == None, IS_DELETED
//!   | (tombstone) |
//!   +-------------+
//! ```
//!
//! Obsolete is terminal: every later operation fails with
//! [`CacheError::EntryRemoved`] and the partition map drops the entry.

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::closure::{AtomicUpdateRequest, InvokeEntry, InvokeResult, UpdateClosure, UpdateOp};
use crate::conflict::DrType;
use crate::context::CacheContext;
use crate::error::{CacheError, CacheResult};
use crate::events::{CacheEvent, EventKind};
use crate::expiry::{
    expire_time_in_past, initial_ttl_and_expire, is_expired, now_millis, to_expire_time,
    ExpiryPolicy, Ttl, TTL_MINIMUM_MS,
};
use crate::extras::{EntryExtras, Extras};
use crate::interceptor::{filter_passes, EntryFilter, EntryView};
use crate::key::CacheKey;
use crate::mvcc::{MvccCandidate, MvccCandidateSet};
use crate::query::ListenerSet;
use crate::store::Row;
use crate::tx::TxContext;
use crate::version::{compare, Version};
use crate::wal::DataRecord;

/// Deferred-deletion tombstone marker.
const IS_DELETED: u8 = 0b0000_0001;

/// Set once per lifetime, on the first row-store read.
const IS_UNSWAPPED: u8 = 0b0000_0010;

/// Mutable entry state, protected by the entry mutex.
pub(crate) struct EntryState {
    pub(crate) val: Option<Bytes>,
    pub(crate) ver: Version,
    pub(crate) conflict_ver: Option<Version>,
    pub(crate) flags: u8,
    pub(crate) extras: Extras,
}

impl EntryState {
    #[inline]
    pub(crate) fn ttl(&self) -> u64 {
        self.extras.as_deref().map(EntryExtras::ttl).unwrap_or(0)
    }

    #[inline]
    pub(crate) fn expire_time(&self) -> u64 {
        self.extras
            .as_deref()
            .map(EntryExtras::expire_time)
            .unwrap_or(0)
    }

    #[inline]
    pub(crate) fn mvcc(&self) -> Option<&MvccCandidateSet> {
        self.extras.as_deref().and_then(EntryExtras::mvcc)
    }

    #[inline]
    pub(crate) fn obsolete_version(&self) -> Option<Version> {
        self.extras
            .as_deref()
            .and_then(EntryExtras::obsolete_version)
    }

    /// The DR-visible version: the embedded conflict version when present,
    /// the entry version otherwise.
    #[inline]
    pub(crate) fn conflict_version(&self) -> Version {
        self.conflict_ver.unwrap_or(self.ver)
    }

    #[inline]
    pub(crate) fn is_deleted(&self) -> bool {
        self.flags & IS_DELETED != 0
    }

    #[inline]
    pub(crate) fn is_unswapped(&self) -> bool {
        self.flags & IS_UNSWAPPED != 0
    }

    #[inline]
    pub(crate) fn has_value(&self) -> bool {
        self.val.is_some()
    }
}

/// Result of a transactional set or remove.
#[derive(Debug, Clone)]
pub struct UpdateTxResult {
    /// Whether the write committed. `false` means a filter, interceptor, or
    /// precondition rejected it and nothing changed.
    pub success: bool,
    /// Previous value, when requested or produced by an interceptor.
    pub old_value: Option<Bytes>,
    /// Partition update counter assigned to the write; zero when nothing
    /// committed.
    pub update_counter: u64,
}

/// Result of a local (single-node) atomic update.
#[derive(Debug, Clone)]
pub struct LocalUpdateResult {
    /// Whether the update changed the entry.
    pub success: bool,
    /// Previous value, when requested.
    pub old_value: Option<Bytes>,
    /// Entry-processor result for `Transform` operations.
    pub invoke_result: Option<InvokeResult>,
}

/// Snapshot prepared for the batch swap writer before eviction clears the
/// entry.
#[derive(Debug, Clone)]
pub struct SwapEntrySnapshot {
    /// Entry key.
    pub key: CacheKey,
    /// Value bytes at eviction time.
    pub value: Bytes,
    /// Version at eviction time.
    pub version: Version,
    /// TTL in milliseconds.
    pub ttl: u64,
    /// Absolute expire time.
    pub expire_time: u64,
}

/// Parameters of a read.
#[derive(Clone, Copy)]
pub struct GetRequest<'a> {
    /// Transaction the read runs in, if any.
    pub tx: Option<&'a TxContext>,
    /// Consult the external store on a miss.
    pub read_through: bool,
    /// Maintain read statistics.
    pub update_metrics: bool,
    /// Emit a `READ` event.
    pub record_event: bool,
    /// Per-operation expiry policy; its for-access decision is applied on a
    /// hit.
    pub expiry: Option<&'a dyn ExpiryPolicy>,
}

impl<'a> GetRequest<'a> {
    /// A plain read: no read-through, metrics and events on.
    pub fn new() -> Self {
        Self {
            tx: None,
            read_through: false,
            update_metrics: true,
            record_event: true,
            expiry: None,
        }
    }

    /// Run the read inside a transaction.
    pub fn with_tx(mut self, tx: &'a TxContext) -> Self {
        self.tx = Some(tx);
        self
    }

    /// Enable read-through.
    pub fn with_read_through(mut self, enabled: bool) -> Self {
        self.read_through = enabled;
        self
    }

    /// Apply this expiry policy's for-access decision on a hit.
    pub fn with_expiry(mut self, expiry: &'a dyn ExpiryPolicy) -> Self {
        self.expiry = Some(expiry);
        self
    }

    /// Suppress events and metrics (internal reads).
    pub fn quiet(mut self) -> Self {
        self.update_metrics = false;
        self.record_event = false;
        self
    }
}

impl Default for GetRequest<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Parameters of a transactional set or remove.
#[derive(Clone, Copy)]
pub struct TxWriteRequest<'a> {
    /// The owning transaction; `None` for direct writes.
    pub tx: Option<&'a TxContext>,
    /// Explicit write version; preferred over the transaction's.
    pub explicit_ver: Option<Version>,
    /// Explicit TTL decision.
    pub ttl: Ttl,
    /// Explicit expire time from conflict resolution (DR).
    pub dr_expire_time: Option<u64>,
    /// Filter evaluated under the entry lock.
    pub filter: &'a [&'a EntryFilter],
    /// Return the previous value with the result.
    pub retval: bool,
    /// Emit `PUT` / `REMOVED` events.
    pub record_event: bool,
    /// Maintain write statistics.
    pub update_metrics: bool,
    /// DR participation of this write.
    pub dr_type: DrType,
    /// Topology version the write is mapped on.
    pub topology_version: u32,
    /// Pre-assigned partition update counter (backup replay).
    pub update_counter: Option<u64>,
}

impl<'a> TxWriteRequest<'a> {
    /// A plain write request.
    pub fn new() -> Self {
        Self {
            tx: None,
            explicit_ver: None,
            ttl: Ttl::NotChanged,
            dr_expire_time: None,
            filter: &[],
            retval: true,
            record_event: true,
            update_metrics: true,
            dr_type: DrType::None,
            topology_version: 0,
            update_counter: None,
        }
    }

    /// Attach the owning transaction.
    pub fn with_tx(mut self, tx: &'a TxContext) -> Self {
        self.tx = Some(tx);
        self
    }

    /// Use an explicit write version.
    pub fn with_version(mut self, ver: Version) -> Self {
        self.explicit_ver = Some(ver);
        self
    }

    /// Use an explicit TTL.
    pub fn with_ttl(mut self, ttl: Ttl) -> Self {
        self.ttl = ttl;
        self
    }

    /// Evaluate this filter under the lock.
    pub fn with_filter(mut self, filter: &'a [&'a EntryFilter]) -> Self {
        self.filter = filter;
        self
    }

    /// Mark the write for DR replication.
    pub fn with_dr(mut self, dr_type: DrType) -> Self {
        self.dr_type = dr_type;
        self
    }
}

impl Default for TxWriteRequest<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Parameters of a local (single-node) atomic update.
pub struct LocalUpdateRequest<'a> {
    /// The operation to apply.
    pub op: UpdateOp,
    /// Propagate the result to the external store.
    pub write_through: bool,
    /// Load the previous value from the external store when needed.
    pub read_through: bool,
    /// Return the previous value.
    pub retval: bool,
    /// Expiry policy for this operation.
    pub expiry: Option<&'a dyn ExpiryPolicy>,
    /// Emit events.
    pub record_event: bool,
    /// Maintain statistics.
    pub update_metrics: bool,
    /// Filter evaluated under the lock.
    pub filter: &'a [&'a EntryFilter],
    /// Run the configured interceptor.
    pub intercept: bool,
}

impl<'a> LocalUpdateRequest<'a> {
    /// A plain local update.
    pub fn new(op: UpdateOp) -> Self {
        Self {
            op,
            write_through: false,
            read_through: false,
            retval: true,
            expiry: None,
            record_event: true,
            update_metrics: true,
            filter: &[],
            intercept: true,
        }
    }
}

/// Notifications staged under the lock by an expiration and delivered after
/// it is released.
struct ExpiryAction {
    expired_val: Bytes,
    removed: bool,
    deferred_ver: Option<Version>,
    obsolete: bool,
}

/// Per-key cache entry.
///
/// The embedded mutex is the only synchronization protecting `val`, `ver`,
/// `extras`, and `flags`; entry operations never block while holding it.
pub struct CacheEntry {
    key: CacheKey,
    partition: u32,
    /// Order component of the version minted at construction. The entry is
    /// "new" while its version still equals this and was minted locally.
    start_ver: u64,
    state: Mutex<EntryState>,
}

impl CacheEntry {
    /// Create a fresh entry with its start version.
    pub fn new(key: CacheKey, partition: u32, start: Version) -> Self {
        Self {
            key,
            partition,
            start_ver: start.order,
            state: Mutex::new(EntryState {
                val: None,
                ver: start,
                conflict_ver: None,
                flags: 0,
                extras: None,
            }),
        }
    }

    /// The entry key.
    #[inline]
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// The owning partition id.
    #[inline]
    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// Order component of the construction version.
    #[inline]
    pub fn start_version(&self) -> u64 {
        self.start_ver
    }

    // =========================================================================
    // Unlocked peeks
    // =========================================================================

    /// Current value without obsolete or expiration checks.
    pub fn raw_get(&self) -> Option<Bytes> {
        self.state.lock().val.clone()
    }

    /// Whether a value is currently present.
    pub fn has_value(&self) -> bool {
        self.state.lock().has_value()
    }

    /// Current TTL in milliseconds.
    pub fn raw_ttl(&self) -> u64 {
        self.state.lock().ttl()
    }

    /// Current absolute expire time.
    pub fn raw_expire_time(&self) -> u64 {
        self.state.lock().expire_time()
    }

    /// Whether the entry is terminal.
    pub fn obsolete(&self) -> bool {
        self.state.lock().obsolete_version().is_some()
    }

    /// Whether the entry is terminal with a version other than `exclude`.
    pub fn obsolete_excluding(&self, exclude: Version) -> bool {
        self.state
            .lock()
            .obsolete_version()
            .map(|v| v != exclude)
            .unwrap_or(false)
    }

    /// The obsolete version, if terminal.
    pub fn obsolete_version(&self) -> Option<Version> {
        self.state.lock().obsolete_version()
    }

    /// Whether the deferred-deletion tombstone is set.
    pub fn deleted(&self) -> bool {
        self.state.lock().is_deleted()
    }

    /// Whether the entry is terminal or a tombstone.
    pub fn obsolete_or_deleted(&self) -> bool {
        let state = self.state.lock();
        state.obsolete_version().is_some() || state.is_deleted()
    }

    /// Current version.
    pub fn version(&self) -> CacheResult<Version> {
        let state = self.state.lock();
        Self::check_obsolete(&state)?;
        Ok(state.ver)
    }

    /// The DR-visible conflict version.
    pub fn conflict_version(&self) -> CacheResult<Version> {
        let state = self.state.lock();
        Self::check_obsolete(&state)?;
        Ok(state.conflict_version())
    }

    /// Whether the entry has never been written.
    pub fn is_new(&self, ctx: &CacheContext) -> CacheResult<bool> {
        let state = self.state.lock();
        Self::check_obsolete(&state)?;
        Ok(self.is_start(ctx, &state))
    }

    /// Non-expired value without read-through or side effects beyond the
    /// obsolete check.
    pub fn peek(&self) -> CacheResult<Option<Bytes>> {
        let state = self.state.lock();
        Self::check_obsolete(&state)?;

        if is_expired(state.expire_time(), now_millis()) {
            return Ok(None);
        }

        Ok(state.val.clone())
    }

    // =========================================================================
    // Read path
    // =========================================================================

    /// Read the entry value.
    ///
    /// Performs the first row-store read for start-version entries, detects
    /// expiration, and consults the external store on a miss when
    /// read-through is requested and configured.
    pub fn inner_get(&self, ctx: &CacheContext, req: GetRequest<'_>) -> CacheResult<Option<Bytes>> {
        Ok(self.inner_get0(ctx, req, false)?.map(|(v, _)| v))
    }

    /// Read the entry value together with its version. Never read-through.
    pub fn inner_get_versioned(
        &self,
        ctx: &CacheContext,
        mut req: GetRequest<'_>,
    ) -> CacheResult<Option<(Bytes, Version)>> {
        req.read_through = false;
        self.inner_get0(ctx, req, true)
    }

    fn inner_get0(
        &self,
        ctx: &CacheContext,
        req: GetRequest<'_>,
        return_ver: bool,
    ) -> CacheResult<Option<(Bytes, Version)>> {
        let mut expiry_action = None;
        let mut staged_event = None;

        let ret;
        let res_ver;
        let start_snapshot;

        {
            let mut state = self.state.lock();
            Self::check_obsolete(&state)?;

            if state.val.is_none() && self.is_start(ctx, &state) && !state.is_unswapped() {
                self.unswap_locked(ctx, &mut state)?;
            }

            let mut val = state.val.clone();

            if val.is_some() && is_expired(state.expire_time(), now_millis()) {
                expiry_action = self.on_expired_locked(ctx, &mut state, None)?;
                val = None;
            }

            ret = val;

            if req.update_metrics && ctx.config().statistics_enabled {
                ctx.metrics().on_read(ret.is_some());
            }

            if req.record_event && ctx.is_recordable(EventKind::Read) {
                staged_event = Some(self.event(
                    ctx,
                    Some(state.ver),
                    EventKind::Read,
                    ret.clone(),
                    ret.is_some(),
                    ret.clone(),
                    ret.is_some(),
                ));
            }

            if ret.is_some() {
                if let Some(policy) = req.expiry {
                    self.update_ttl_locked(ctx, &mut state, policy.for_access())?;
                }
            }

            res_ver = state.ver;
            start_snapshot = state.ver;
        }

        if let Some(action) = expiry_action {
            self.finish_expiry(ctx, action);
        }

        // The READ event fires at most once per call, even when a
        // read-through install follows the miss.
        let read_event_fired = staged_event.is_some();

        if let Some(event) = staged_event {
            ctx.add_event(event);
        }

        if let Some(v) = ret {
            return Ok(Some((v, res_ver)));
        }

        if return_ver || !req.read_through || !ctx.read_through() {
            return Ok(None);
        }

        let Some(external) = ctx.external() else {
            return Ok(None);
        };

        let Some(loaded) = external.load(req.tx, &self.key)? else {
            return Ok(None);
        };

        let mut installed_event = None;

        {
            let mut state = self.state.lock();

            // Install only if nothing moved the entry while the lock was
            // released; a losing load result is simply discarded.
            if state.obsolete_version().is_none() && state.ver == start_snapshot {
                let next = ctx.versions().next_for_load(state.ver);

                let (ttl, expire) = match req.expiry {
                    Some(policy) => initial_ttl_and_expire(policy),
                    None => {
                        let ttl = state.ttl();
                        (ttl, to_expire_time(ttl))
                    }
                };

                ctx.store().update(
                    &self.key,
                    self.partition,
                    Row {
                        value: loaded.clone(),
                        version: next,
                        expire_time: expire,
                    },
                )?;

                self.apply(&mut state, Some(loaded.clone()), expire, ttl, next);

                if ctx.config().deferred_delete && state.is_deleted() {
                    self.set_deleted_flag(&mut state, false);
                }

                if req.record_event && !read_event_fired && ctx.is_recordable(EventKind::Read) {
                    installed_event = Some(self.event(
                        ctx,
                        Some(state.ver),
                        EventKind::Read,
                        Some(loaded.clone()),
                        true,
                        None,
                        false,
                    ));
                }
            }
        }

        if let Some(event) = installed_event {
            ctx.add_event(event);
        }

        Ok(Some((loaded, res_ver)))
    }

    /// Pull the authoritative row into the entry if this is its first read.
    /// Returns the value afterwards, loaded or not.
    pub fn unswap(&self, ctx: &CacheContext) -> CacheResult<Option<Bytes>> {
        let mut state = self.state.lock();
        Self::check_obsolete(&state)?;

        self.unswap_locked(ctx, &mut state)?;

        Ok(state.val.clone())
    }

    /// Reload the entry from the external store, installing the result under
    /// an optimistic version check.
    pub fn inner_reload(&self, ctx: &CacheContext) -> CacheResult<Option<Bytes>> {
        let external = ctx
            .external()
            .ok_or_else(|| CacheError::Storage("external store is not configured".into()))?;

        let start_snapshot;
        let was_new;

        {
            let state = self.state.lock();
            Self::check_obsolete(&state)?;

            start_snapshot = state.ver;
            was_new = self.is_start(ctx, &state);
        }

        let loaded = external.load(None, &self.key)?;

        let mut state = self.state.lock();

        // Loaded by somebody else while we were reading.
        if was_new && !self.is_start(ctx, &state) {
            return Ok(loaded);
        }

        if state.obsolete_version().is_none() && state.ver == start_snapshot {
            let ttl = state.ttl();
            let next = ctx.versions().next_for_load(state.ver);

            match &loaded {
                Some(val) => {
                    let expire = to_expire_time(ttl);

                    ctx.store().update(
                        &self.key,
                        self.partition,
                        Row {
                            value: val.clone(),
                            version: next,
                            expire_time: expire,
                        },
                    )?;

                    self.apply(&mut state, Some(val.clone()), expire, ttl, next);

                    if ctx.config().deferred_delete && state.is_deleted() {
                        self.set_deleted_flag(&mut state, false);
                    }
                }
                None => {
                    ctx.store().remove(&self.key, self.partition)?;

                    self.apply(&mut state, None, 0, 0, next);

                    if ctx.config().deferred_delete && !state.is_deleted() {
                        self.set_deleted_flag(&mut state, true);
                    }
                }
            }
        }

        Ok(loaded)
    }

    // =========================================================================
    // Transactional write path
    // =========================================================================

    /// Commit a transactional write of `val`.
    ///
    /// The caller is expected to hold the logical lock (recorded in the MVCC
    /// candidate set) unless it is a remote one-phase-commit transaction.
    /// Events, continuous-query notification, write-through, and the
    /// after-interceptor run outside the entry lock, before this method
    /// returns.
    pub fn inner_set(
        &self,
        ctx: &CacheContext,
        val: Bytes,
        req: TxWriteRequest<'_>,
    ) -> CacheResult<UpdateTxResult> {
        let mut staged_event = None;
        let mut staged_cq = None;

        let committed;
        let old;
        let counter;
        let new_ver;

        {
            let mut state = self.state.lock();
            Self::check_obsolete(&state)?;

            self.assert_lock_held(&state, req.tx);

            {
                let view = EntryView::new(&self.key, state.val.as_ref());
                if !filter_passes(req.filter, &view) {
                    return Ok(UpdateTxResult {
                        success: false,
                        old_value: None,
                        update_counter: 0,
                    });
                }
            }

            let listeners = ctx
                .queries()
                .and_then(|q| q.update_listeners(false, false));

            let intercept = ctx.interceptor().is_some();

            if self.is_start(ctx, &state)
                && !state.is_unswapped()
                && (req.retval || intercept || listeners.is_some())
            {
                self.unswap_locked(ctx, &mut state)?;
            }

            new_ver = req
                .explicit_ver
                .or_else(|| req.tx.map(|tx| tx.write_version()))
                .unwrap_or_else(|| ctx.versions().next_after(state.ver));

            old = state.val.clone();

            let mut val = val;

            if let Some(interceptor) = ctx.interceptor() {
                let view = EntryView::new(&self.key, old.as_ref());

                match interceptor.on_before_put(view, &val) {
                    None => {
                        return Ok(UpdateTxResult {
                            success: false,
                            old_value: old,
                            update_counter: 0,
                        });
                    }
                    Some(adopted) => val = adopted,
                }
            }

            let (ttl, expire) = if let Some(dr_expire) = req.dr_expire_time {
                let ttl = match req.ttl {
                    Ttl::Millis(ms) => ms,
                    _ => 0,
                };
                (ttl, dr_expire)
            } else {
                match req.ttl {
                    Ttl::NotChanged => (state.ttl(), state.expire_time()),
                    Ttl::Eternal => (0, 0),
                    Ttl::Zero => (TTL_MINIMUM_MS, expire_time_in_past()),
                    Ttl::Millis(ms) => (ms, to_expire_time(ms)),
                }
            };

            ctx.store().update(
                &self.key,
                self.partition,
                Row {
                    value: val.clone(),
                    version: new_ver,
                    expire_time: expire,
                },
            )?;

            if ctx.config().deferred_delete && state.is_deleted() {
                self.set_deleted_flag(&mut state, false);
            }

            counter = req
                .update_counter
                .unwrap_or_else(|| ctx.partition(self.partition).next_update_counter());

            self.apply(&mut state, Some(val.clone()), expire, ttl, new_ver);

            self.log_update(ctx, Some(&val), new_ver, expire, counter, false)?;

            self.dr_replicate_locked(ctx, &state, req.dr_type, Some(&val), req.topology_version)?;

            if req.update_metrics && ctx.config().statistics_enabled {
                ctx.metrics().on_write();
            }

            if req.record_event && ctx.is_recordable(EventKind::Put) {
                staged_event = Some(self.event(
                    ctx,
                    Some(new_ver),
                    EventKind::Put,
                    Some(val.clone()),
                    true,
                    old.clone(),
                    old.is_some(),
                ));
            }

            if let Some(listeners) = listeners {
                staged_cq = Some((listeners, Some(val.clone()), old.clone(), counter));
            }

            committed = val;
        }

        self.deliver_write_notifications(ctx, staged_event, staged_cq, req.topology_version);

        // Persist outside of the lock; the transaction layer owns recovery
        // if the store write fails after the in-memory commit.
        if ctx.write_through() {
            if let Some(external) = ctx.external() {
                external.put(req.tx, &self.key, &committed, new_ver)?;
            }
        }

        self.after_put(ctx, &committed);

        debug!(
            cache = %ctx.config().name,
            counter,
            "committed transactional write"
        );

        Ok(UpdateTxResult {
            success: true,
            old_value: if req.retval { old } else { None },
            update_counter: counter,
        })
    }

    /// Commit a transactional removal.
    ///
    /// With deferred deletion the entry becomes a tombstone and a deferred
    /// delete is queued; otherwise the entry is marked obsolete immediately,
    /// provided no other lock candidates hold it.
    pub fn inner_remove(
        &self,
        ctx: &CacheContext,
        req: TxWriteRequest<'_>,
    ) -> CacheResult<UpdateTxResult> {
        let mut staged_event = None;
        let mut staged_cq = None;

        let old;
        let ret_val;
        let counter;
        let new_ver;
        let mut deferred = false;
        let mut marked = false;

        {
            let mut state = self.state.lock();
            Self::check_obsolete(&state)?;

            self.assert_lock_held(&state, req.tx);

            {
                let view = EntryView::new(&self.key, state.val.as_ref());
                if !filter_passes(req.filter, &view) {
                    return Ok(UpdateTxResult {
                        success: false,
                        old_value: None,
                        update_counter: 0,
                    });
                }
            }

            let listeners = ctx
                .queries()
                .and_then(|q| q.update_listeners(false, false));

            let intercept = ctx.interceptor().is_some();

            if self.is_start(ctx, &state)
                && !state.is_unswapped()
                && (req.retval || intercept || listeners.is_some())
            {
                self.unswap_locked(ctx, &mut state)?;
            }

            new_ver = req
                .explicit_ver
                .or_else(|| req.tx.map(|tx| tx.write_version()))
                .unwrap_or_else(|| ctx.versions().next_after(state.ver));

            old = state.val.clone();

            let mut intercept_val = None;

            if let Some(interceptor) = ctx.interceptor() {
                let view = EntryView::new(&self.key, old.as_ref());
                let (cancel, val) = interceptor.on_before_remove(view);

                if cancel {
                    return Ok(UpdateTxResult {
                        success: false,
                        old_value: val.or(old),
                        update_counter: 0,
                    });
                }

                intercept_val = val;
            }

            ctx.store().remove(&self.key, self.partition)?;

            self.apply(&mut state, None, 0, 0, new_ver);

            if ctx.config().deferred_delete {
                if !state.is_deleted() {
                    self.set_deleted_flag(&mut state, true);
                }

                deferred = true;
            }

            counter = req
                .update_counter
                .unwrap_or_else(|| ctx.partition(self.partition).next_update_counter());

            self.log_update(ctx, None, new_ver, 0, counter, false)?;

            self.dr_replicate_locked(ctx, &state, req.dr_type, None, req.topology_version)?;

            if req.update_metrics && ctx.config().statistics_enabled {
                ctx.metrics().on_remove();
            }

            if !deferred {
                // Only obsolete right away if the removing transaction is the
                // lock owner (or the remove is untracked); an explicit foreign
                // lock keeps the entry alive.
                let obsolete_ver = match req.tx {
                    None => Some(new_ver),
                    Some(tx) => {
                        if state
                            .mvcc()
                            .map(|m| m.owned_by(tx.xid()))
                            .unwrap_or(true)
                        {
                            Some(tx.xid())
                        } else {
                            None
                        }
                    }
                };

                match obsolete_ver {
                    Some(ver) => {
                        marked = Self::mark_obsolete0(&mut state, ver, true);

                        if !marked {
                            debug!(
                                cache = %ctx.config().name,
                                "entry could not be marked obsolete (still locked)"
                            );
                        }
                    }
                    None => debug!(
                        cache = %ctx.config().name,
                        "obsolete version not set, lock is explicit"
                    ),
                }
            }

            if req.record_event && ctx.is_recordable(EventKind::Removed) {
                staged_event = Some(self.event(
                    ctx,
                    Some(new_ver),
                    EventKind::Removed,
                    None,
                    false,
                    old.clone(),
                    old.is_some(),
                ));
            }

            if let Some(listeners) = listeners {
                staged_cq = Some((listeners, None, old.clone(), counter));
            }

            ret_val = intercept_val;
        }

        if deferred {
            ctx.partition(self.partition)
                .enqueue_deferred(self.key.clone(), new_ver);
        }

        if marked {
            ctx.partition(self.partition).remove_if_obsolete(&self.key);
        }

        self.deliver_write_notifications(ctx, staged_event, staged_cq, req.topology_version);

        if ctx.write_through() {
            if let Some(external) = ctx.external() {
                external.remove(req.tx, &self.key)?;
            }
        }

        self.after_remove(ctx, old.as_ref());

        Ok(UpdateTxResult {
            success: true,
            old_value: if req.retval { ret_val.or(old) } else { None },
            update_counter: counter,
        })
    }

    // =========================================================================
    // Atomic update path
    // =========================================================================

    /// Apply a lock-free atomic update through the row store's invoke.
    ///
    /// The update closure plans the operation under the entry lock: version
    /// check or conflict resolution, entry-processor evaluation, filter,
    /// interceptor, TTL computation, and the resulting row-store operation.
    pub fn inner_update(
        &self,
        ctx: &CacheContext,
        req: AtomicUpdateRequest<'_>,
    ) -> CacheResult<crate::closure::UpdateAtomicResult> {
        let record_event = req.record_event;
        let update_metrics = req.update_metrics;
        let dr_type = req.dr_type;
        let topology_version = req.topology_version;
        let primary = req.primary;

        let mut staged_event = None;
        let mut staged_cq = None;
        let mut deferred_ver = None;
        let mut marked = false;

        let result;

        {
            let mut state = self.state.lock();
            Self::check_obsolete(&state)?;

            let listeners = ctx
                .queries()
                .and_then(|q| q.update_listeners(false, primary));

            let mut closure = UpdateClosure::new(self, &mut state, ctx, req);
            ctx.store().invoke(&self.key, self.partition, &mut closure)?;
            result = closure.into_result();

            if result.success() {
                let removal = result.new_value.is_none();

                self.dr_replicate_locked(
                    ctx,
                    &state,
                    dr_type,
                    result.new_value.as_ref(),
                    topology_version,
                )?;

                if update_metrics && ctx.config().statistics_enabled {
                    if removal {
                        ctx.metrics().on_remove();
                    } else {
                        ctx.metrics().on_write();
                    }
                }

                if removal {
                    if ctx.config().deferred_delete {
                        deferred_ver = result.enqueue_version;
                    } else if let Some(ver) = result.enqueue_version {
                        marked = Self::mark_obsolete0(&mut state, ver, true);
                    }
                }

                if record_event {
                    let kind = if removal {
                        EventKind::Removed
                    } else {
                        EventKind::Put
                    };

                    if ctx.is_recordable(kind) {
                        staged_event = Some(self.event(
                            ctx,
                            Some(state.ver),
                            kind,
                            result.new_value.clone(),
                            result.new_value.is_some(),
                            result.old_value.clone(),
                            result.old_value.is_some(),
                        ));
                    }
                }

                if let Some(listeners) = listeners {
                    staged_cq = Some((
                        listeners,
                        result.new_value.clone(),
                        result.old_value.clone(),
                        result.update_counter,
                    ));
                }
            }
        }

        if let Some(ver) = deferred_ver {
            ctx.partition(self.partition)
                .enqueue_deferred(self.key.clone(), ver);
        }

        if marked {
            ctx.partition(self.partition).remove_if_obsolete(&self.key);
        }

        self.deliver_write_notifications(ctx, staged_event, staged_cq, topology_version);

        if result.success() {
            match &result.new_value {
                Some(val) => self.after_put(ctx, val),
                None => self.after_remove(ctx, result.old_value.as_ref()),
            }
        }

        Ok(result)
    }

    /// Apply a single-node atomic update: no version check, no conflict
    /// resolution, version minted locally.
    pub fn inner_update_local(
        &self,
        ctx: &CacheContext,
        req: LocalUpdateRequest<'_>,
    ) -> CacheResult<LocalUpdateResult> {
        let mut staged_event = None;
        let mut staged_cq = None;

        let old;
        let success;
        let mut invoke_result = None;
        let committed;

        {
            let mut state = self.state.lock();
            Self::check_obsolete(&state)?;

            let listeners = ctx
                .queries()
                .and_then(|q| q.update_listeners(false, true));

            let is_transform = matches!(req.op, UpdateOp::Transform(_));

            let need_val = req.retval
                || req.intercept
                || is_transform
                || !req.filter.is_empty()
                || listeners.is_some();

            if self.is_start(ctx, &state) && !state.is_unswapped() && need_val {
                self.unswap_locked(ctx, &mut state)?;
            }

            let ver = ctx.versions().next_after(state.ver);

            old = state.val.clone();

            // Optionally load the previous value from the store of record.
            if state.val.is_none()
                && req.read_through
                && ctx.read_through()
                && need_val
                && (is_transform || ctx.config().load_previous_value)
            {
                if let Some(external) = ctx.external() {
                    if let Some(loaded) = external.load(None, &self.key)? {
                        let (ttl, expire) = match req.expiry {
                            Some(policy) => initial_ttl_and_expire(policy),
                            None => (0, 0),
                        };

                        ctx.store().update(
                            &self.key,
                            self.partition,
                            Row {
                                value: loaded.clone(),
                                version: ver,
                                expire_time: expire,
                            },
                        )?;

                        self.apply(&mut state, Some(loaded), expire, ttl, ver);
                    }
                }
            }

            let old_loaded = state.val.clone();

            if req.update_metrics && ctx.config().statistics_enabled && need_val {
                ctx.metrics().on_read(old_loaded.is_some());
            }

            {
                let view = EntryView::new(&self.key, state.val.as_ref());
                if !filter_passes(req.filter, &view) {
                    if let Some(policy) = req.expiry {
                        if state.has_value() {
                            self.update_ttl_locked(ctx, &mut state, policy.for_access())?;
                        }
                    }

                    return Ok(LocalUpdateResult {
                        success: false,
                        old_value: if req.retval { old_loaded } else { None },
                        invoke_result: None,
                    });
                }
            }

            // Compute the new value.
            let mut updated = match &req.op {
                UpdateOp::Update(val) => Some(val.clone()),
                UpdateOp::Delete => None,
                UpdateOp::Transform(processor) => {
                    let mut invoke_entry =
                        InvokeEntry::new(&self.key, old_loaded.clone(), state.ver);

                    let mut modified = false;

                    let value = match processor.process(&mut invoke_entry) {
                        Ok(computed) => {
                            modified = invoke_entry.modified();

                            invoke_result = computed.map(|c| InvokeResult {
                                computed: Some(c),
                                error: None,
                            });

                            if modified {
                                invoke_entry.into_value()
                            } else {
                                old_loaded.clone()
                            }
                        }
                        Err(err) => {
                            invoke_result = Some(InvokeResult {
                                computed: None,
                                error: Some(err),
                            });

                            old_loaded.clone()
                        }
                    };

                    if !modified {
                        if let Some(policy) = req.expiry {
                            if state.has_value() {
                                self.update_ttl_locked(ctx, &mut state, policy.for_access())?;
                            }
                        }

                        return Ok(LocalUpdateResult {
                            success: false,
                            old_value: None,
                            invoke_result,
                        });
                    }

                    value
                }
            };

            // Interceptor may veto or rewrite.
            if req.intercept {
                if let Some(interceptor) = ctx.interceptor() {
                    let view = EntryView::new(&self.key, old_loaded.as_ref());

                    match &updated {
                        Some(val) => match interceptor.on_before_put(view, val) {
                            None => {
                                return Ok(LocalUpdateResult {
                                    success: false,
                                    old_value: old_loaded,
                                    invoke_result,
                                });
                            }
                            Some(adopted) => updated = Some(adopted),
                        },
                        None => {
                            let (cancel, val) = interceptor.on_before_remove(view);

                            if cancel {
                                return Ok(LocalUpdateResult {
                                    success: false,
                                    old_value: val.or(old_loaded),
                                    invoke_result,
                                });
                            }
                        }
                    }
                }
            }

            let had_val = state.has_value();

            // TTL for the update path; a Zero decision demotes to delete.
            let (ttl, expire) = if updated.is_some() {
                let decision = match req.expiry {
                    Some(policy) => {
                        if had_val {
                            policy.for_update()
                        } else {
                            policy.for_create()
                        }
                    }
                    None => Ttl::NotChanged,
                };

                match decision {
                    Ttl::NotChanged => (state.ttl(), state.expire_time()),
                    Ttl::Eternal => (0, 0),
                    Ttl::Zero => {
                        updated = None;
                        (0, 0)
                    }
                    Ttl::Millis(ms) => (ms, to_expire_time(ms)),
                }
            } else {
                (0, 0)
            };

            match &updated {
                Some(val) => {
                    if req.write_through && ctx.write_through() {
                        if let Some(external) = ctx.external() {
                            external.put(None, &self.key, val, ver)?;
                        }
                    }

                    ctx.store().update(
                        &self.key,
                        self.partition,
                        Row {
                            value: val.clone(),
                            version: ver,
                            expire_time: expire,
                        },
                    )?;

                    self.apply(&mut state, Some(val.clone()), expire, ttl, ver);

                    success = true;

                    if req.record_event && ctx.is_recordable(EventKind::Put) {
                        staged_event = Some(self.event(
                            ctx,
                            None,
                            EventKind::Put,
                            Some(val.clone()),
                            true,
                            old_loaded.clone(),
                            old_loaded.is_some() || had_val,
                        ));
                    }
                }
                None => {
                    if req.write_through && ctx.write_through() {
                        if let Some(external) = ctx.external() {
                            external.remove(None, &self.key)?;
                        }
                    }

                    ctx.store().remove(&self.key, self.partition)?;

                    self.apply(&mut state, None, 0, 0, ver);

                    success = had_val;

                    if req.record_event && ctx.is_recordable(EventKind::Removed) {
                        staged_event = Some(self.event(
                            ctx,
                            None,
                            EventKind::Removed,
                            None,
                            false,
                            old_loaded.clone(),
                            old_loaded.is_some() || had_val,
                        ));
                    }
                }
            }

            if success && req.update_metrics && ctx.config().statistics_enabled {
                if updated.is_some() {
                    ctx.metrics().on_write();
                } else {
                    ctx.metrics().on_remove();
                }
            }

            if let Some(listeners) = listeners {
                let counter = ctx.partition(self.partition).next_update_counter();
                staged_cq = Some((listeners, updated.clone(), old_loaded.clone(), counter));
            }

            committed = updated;
        }

        self.deliver_write_notifications(ctx, staged_event, staged_cq, 0);

        match &committed {
            Some(val) => self.after_put(ctx, val),
            None => self.after_remove(ctx, old.as_ref()),
        }

        Ok(LocalUpdateResult {
            success,
            old_value: if req.retval { old } else { None },
            invoke_result,
        })
    }

    // =========================================================================
    // Expiration
    // =========================================================================

    /// TTL-scanner callback: expire the entry if its time has come.
    ///
    /// Returns `true` when the entry was expired by this call.
    pub fn on_ttl_expired(&self, ctx: &CacheContext, obsolete_ver: Version) -> CacheResult<bool> {
        let action;

        {
            let mut state = self.state.lock();
            Self::check_obsolete(&state)?;

            if self.is_start(ctx, &state) && !state.is_unswapped() {
                self.unswap_locked(ctx, &mut state)?;
            }

            let expire = state.expire_time();

            if !is_expired(expire, now_millis()) {
                return Ok(false);
            }

            if state.val.is_none() {
                return Ok(false);
            }

            action = self.on_expired_locked(ctx, &mut state, Some(obsolete_ver))?;
        }

        match action {
            Some(action) => {
                self.finish_expiry(ctx, action);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Shared expiration transition. Runs under the lock; the caller
    /// delivers the returned notifications after releasing it.
    ///
    /// No-op while lock candidates are present.
    fn on_expired_locked(
        &self,
        ctx: &CacheContext,
        state: &mut EntryState,
        obsolete_ver: Option<Version>,
    ) -> CacheResult<Option<ExpiryAction>> {
        let Some(expired_val) = state.val.clone() else {
            return Ok(None);
        };

        if state.mvcc().map(|m| !m.is_empty()).unwrap_or(false) {
            return Ok(None);
        }

        let mut removed = false;
        let mut deferred_ver = None;
        let mut obsolete = false;

        if ctx.config().deferred_delete {
            if !state.is_deleted() && !self.is_start(ctx, state) {
                let ver = state.ver;
                self.apply(state, None, 0, 0, ver);
                self.set_deleted_flag(state, true);

                removed = true;
                deferred_ver = Some(ver);
            }
        } else {
            let ver = obsolete_ver.unwrap_or_else(|| ctx.versions().next_after(state.ver));

            if Self::mark_obsolete0(state, ver, true) {
                removed = true;
                obsolete = true;
            }
        }

        trace!(cache = %ctx.config().name, "entry expired");

        ctx.store().remove(&self.key, self.partition)?;

        Ok(Some(ExpiryAction {
            expired_val,
            removed,
            deferred_ver,
            obsolete,
        }))
    }

    /// Deliver expiration notifications staged under the lock.
    fn finish_expiry(&self, ctx: &CacheContext, action: ExpiryAction) {
        if ctx.is_recordable(EventKind::Expired) {
            ctx.add_event(self.event(
                ctx,
                None,
                EventKind::Expired,
                None,
                false,
                Some(action.expired_val.clone()),
                true,
            ));
        }

        if let Some(queries) = ctx.queries() {
            queries.on_entry_expired(&self.key, &action.expired_val);
        }

        if action.removed && ctx.config().statistics_enabled {
            ctx.metrics().on_expired();
        }

        if let Some(ver) = action.deferred_ver {
            ctx.partition(self.partition)
                .enqueue_deferred(self.key.clone(), ver);
        }

        if action.obsolete {
            ctx.partition(self.partition).remove_if_obsolete(&self.key);
        }
    }

    // =========================================================================
    // Eviction
    // =========================================================================

    /// Try to evict the entry: mark it obsolete provided it has no lock
    /// candidates and, under deferred deletion, is not a tombstone.
    ///
    /// Returns whether the entry is gone (evicted now or already obsolete).
    pub fn evict_internal(
        &self,
        ctx: &CacheContext,
        obsolete_ver: Version,
        filter: &[&EntryFilter],
    ) -> bool {
        let mut marked = false;

        if filter.is_empty() {
            let mut state = self.state.lock();

            if state.obsolete_version().is_some() {
                return true;
            }

            if ctx.config().deferred_delete && state.is_deleted() {
                return false;
            }

            if Self::mark_obsolete0(&mut state, obsolete_ver, false) {
                state.val = None;
                marked = true;
            }

            drop(state);
        } else {
            loop {
                let snapshot = {
                    let state = self.state.lock();

                    if state.obsolete_version().is_some() {
                        return true;
                    }

                    (state.ver, state.val.clone())
                };

                {
                    let view = EntryView::new(&self.key, snapshot.1.as_ref());
                    if !filter_passes(filter, &view) {
                        return false;
                    }
                }

                let mut state = self.state.lock();

                if state.obsolete_version().is_some() {
                    return true;
                }

                // Version moved since the filter saw the entry; evaluate again.
                if state.ver != snapshot.0 {
                    continue;
                }

                if ctx.config().deferred_delete && state.is_deleted() {
                    return false;
                }

                if Self::mark_obsolete0(&mut state, obsolete_ver, false) {
                    state.val = None;
                    marked = true;
                }

                break;
            }
        }

        if marked {
            if ctx.config().statistics_enabled {
                ctx.metrics().on_evict();
            }

            ctx.partition(self.partition).remove_if_obsolete(&self.key);
        }

        marked
    }

    /// Batch eviction: mark obsolete and return the swap-entry snapshot for
    /// the batch swap writer. The caller unmaps the entry afterwards.
    pub fn evict_in_batch_internal(
        &self,
        ctx: &CacheContext,
        obsolete_ver: Version,
    ) -> Option<SwapEntrySnapshot> {
        let mut state = self.state.lock();

        if state.obsolete_version().is_some() {
            return None;
        }

        if !Self::mark_obsolete0(&mut state, obsolete_ver, false) {
            return None;
        }

        let snapshot = match (&state.val, self.is_start(ctx, &state)) {
            (Some(val), false) => Some(SwapEntrySnapshot {
                key: self.key.clone(),
                value: val.clone(),
                version: state.ver,
                ttl: state.ttl(),
                expire_time: state.expire_time(),
            }),
            _ => None,
        };

        state.val = None;

        if ctx.config().statistics_enabled {
            ctx.metrics().on_evict();
        }

        snapshot
    }

    // =========================================================================
    // Initial load and invalidation
    // =========================================================================

    /// Install a value from preload or persistence.
    ///
    /// Installs iff the entry has never been written, or the incoming version
    /// is strictly greater under the configured comparator. Logs a WAL create
    /// record and notifies continuous queries unless the value is absent.
    pub fn initial_value(
        &self,
        ctx: &CacheContext,
        val: Option<Bytes>,
        ver: Version,
        ttl: u64,
        expire_time: u64,
    ) -> CacheResult<bool> {
        let mut staged_cq = None;

        {
            let mut state = self.state.lock();
            Self::check_obsolete(&state)?;

            let update = self.is_start(ctx, &state)
                || compare(&ver, &state.ver, ctx.config().ignore_version_time())
                    == std::cmp::Ordering::Greater;

            if !update {
                return Ok(false);
            }

            if let Some(val) = &val {
                ctx.store().update(
                    &self.key,
                    self.partition,
                    Row {
                        value: val.clone(),
                        version: ver,
                        expire_time,
                    },
                )?;
            }

            self.apply(&mut state, val.clone(), expire_time, ttl, ver);

            if ctx.config().deferred_delete && state.is_deleted() && val.is_some() {
                self.set_deleted_flag(&mut state, false);
            }

            if let Some(val) = &val {
                let counter = ctx.partition(self.partition).next_update_counter();

                self.log_update(ctx, Some(val), ver, expire_time, counter, true)?;

                if let Some(listeners) =
                    ctx.queries().and_then(|q| q.update_listeners(false, true))
                {
                    staged_cq = Some((listeners, Some(val.clone()), None, counter));
                }
            }
        }

        self.deliver_write_notifications(ctx, None, staged_cq, 0);

        Ok(true)
    }

    /// Install a loaded value iff the current version matches `cur_ver`,
    /// minting a load version when none is supplied. Returns the installed
    /// version, or `None` when the entry moved or is locked.
    pub fn versioned_value(
        &self,
        ctx: &CacheContext,
        val: Bytes,
        cur_ver: Option<Version>,
        new_ver: Option<Version>,
        load_expiry: Option<&dyn ExpiryPolicy>,
    ) -> CacheResult<Option<Version>> {
        let mut state = self.state.lock();
        Self::check_obsolete(&state)?;

        if let Some(cur) = cur_ver {
            if cur != state.ver {
                return Ok(None);
            }
        }

        if state.val.as_ref() == Some(&val) {
            return Ok(None);
        }

        if state.mvcc().map(|m| !m.is_empty()).unwrap_or(false) {
            return Ok(None);
        }

        let new_ver = new_ver.unwrap_or_else(|| ctx.versions().next_for_load(state.ver));

        let (ttl, expire) = match load_expiry {
            Some(policy) => initial_ttl_and_expire(policy),
            None => (state.ttl(), state.expire_time()),
        };

        ctx.store().update(
            &self.key,
            self.partition,
            Row {
                value: val.clone(),
                version: new_ver,
                expire_time: expire,
            },
        )?;

        if ctx.config().deferred_delete && state.is_deleted() {
            self.set_deleted_flag(&mut state, false);
        }

        self.apply(&mut state, Some(val), expire, ttl, new_ver);

        Ok(Some(new_ver))
    }

    /// Clear the value and advance the version, iff the current version
    /// matches `cur_ver` (or unconditionally when `None`). Returns whether
    /// the entry is obsolete afterwards.
    pub fn invalidate(
        &self,
        ctx: &CacheContext,
        cur_ver: Option<Version>,
        new_ver: Version,
    ) -> CacheResult<bool> {
        let mut state = self.state.lock();

        if cur_ver.map(|v| v == state.ver).unwrap_or(true) {
            state.val = None;
            state.ver = new_ver;
            state.conflict_ver = None;

            ctx.store().remove(&self.key, self.partition)?;
        }

        Ok(state.obsolete_version().is_some())
    }

    /// Filtered invalidate with the optimistic retry loop: re-evaluates the
    /// filter whenever the version moves while the lock is released.
    pub fn invalidate_filtered(
        &self,
        ctx: &CacheContext,
        filter: &[&EntryFilter],
    ) -> CacheResult<bool> {
        loop {
            let snapshot = {
                let state = self.state.lock();
                Self::check_obsolete(&state)?;

                if filter.is_empty() {
                    let ver = ctx.versions().next_after(state.ver);
                    drop(state);
                    self.invalidate(ctx, None, ver)?;
                    return Ok(true);
                }

                (state.ver, state.val.clone())
            };

            {
                let view = EntryView::new(&self.key, snapshot.1.as_ref());
                if !filter_passes(filter, &view) {
                    return Ok(false);
                }
            }

            let state = self.state.lock();
            Self::check_obsolete(&state)?;

            if state.ver == snapshot.0 {
                let ver = ctx.versions().next_after(state.ver);
                drop(state);
                self.invalidate(ctx, Some(snapshot.0), ver)?;
                return Ok(true);
            }

            // Version changed while unlocked; evaluate the filter again.
        }
    }

    // =========================================================================
    // Obsolete transitions
    // =========================================================================

    /// Mark the entry obsolete with the given version. The caller unmaps the
    /// entry from its partition when this returns `true`.
    pub fn mark_obsolete(&self, ver: Version) -> bool {
        let mut state = self.state.lock();
        Self::mark_obsolete0(&mut state, ver, true)
    }

    /// Deferred-delete callback: mark obsolete iff the entry version still
    /// equals the version recorded at remove time.
    pub fn mark_obsolete_version(&self, ver: Version) -> bool {
        let mut state = self.state.lock();

        if state.obsolete_version().is_some() {
            return true;
        }

        if state.ver != ver {
            return false;
        }

        Self::mark_obsolete0(&mut state, ver, true)
    }

    /// Mark obsolete iff the entry holds no value and no lock candidates.
    pub fn mark_obsolete_if_empty(
        &self,
        ctx: &CacheContext,
        ver: Option<Version>,
    ) -> CacheResult<bool> {
        let mut state = self.state.lock();

        if state.obsolete_version().is_some() {
            return Ok(false);
        }

        if state.has_value() || state.mvcc().map(|m| !m.is_empty()).unwrap_or(false) {
            return Ok(false);
        }

        let ver = ver.unwrap_or_else(|| ctx.versions().next_after(state.ver));

        Ok(Self::mark_obsolete0(&mut state, ver, true))
    }

    fn mark_obsolete0(state: &mut EntryState, ver: Version, clear: bool) -> bool {
        if state.obsolete_version().is_some() {
            return true;
        }

        let lockable = state
            .mvcc()
            .map(|m| m.is_empty_excluding(&[ver]))
            .unwrap_or(true);

        if !lockable {
            return false;
        }

        state.extras = EntryExtras::with_obsolete(state.extras.take(), Some(ver));

        if clear {
            state.val = None;
        }

        trace!(clear, "entry marked obsolete");

        true
    }

    // =========================================================================
    // TTL updates
    // =========================================================================

    /// Apply a TTL decision iff the version matches (or unconditionally when
    /// `None`), rewriting the stored row's expire time.
    pub fn update_ttl(
        &self,
        ctx: &CacheContext,
        ver: Option<Version>,
        ttl: Ttl,
    ) -> CacheResult<()> {
        let mut state = self.state.lock();
        Self::check_obsolete(&state)?;

        if ver.map(|v| v == state.ver).unwrap_or(true) {
            self.update_ttl_locked(ctx, &mut state, ttl)?;
        }

        Ok(())
    }

    fn update_ttl_locked(
        &self,
        ctx: &CacheContext,
        state: &mut EntryState,
        ttl: Ttl,
    ) -> CacheResult<()> {
        let (ttl, expire) = match ttl {
            Ttl::NotChanged => return Ok(()),
            Ttl::Eternal => (0, 0),
            Ttl::Zero => (TTL_MINIMUM_MS, expire_time_in_past()),
            Ttl::Millis(ms) => (ms, to_expire_time(ms)),
        };

        state.extras = EntryExtras::with_ttl(state.extras.take(), ttl, expire);

        if let Some(val) = &state.val {
            ctx.store().update(
                &self.key,
                self.partition,
                Row {
                    value: val.clone(),
                    version: state.ver,
                    expire_time: expire,
                },
            )?;
        }

        Ok(())
    }

    // =========================================================================
    // Lock candidates
    // =========================================================================

    /// Record a local lock candidate; emits `LOCKED` when it becomes owner.
    pub fn add_local_lock(
        &self,
        ctx: &CacheContext,
        lock_ver: Version,
        thread_id: u64,
    ) -> CacheResult<()> {
        let (prev, cur, val);

        {
            let mut state = self.state.lock();
            Self::check_obsolete(&state)?;

            let mut mvcc = state.mvcc().cloned().unwrap_or_default();
            prev = mvcc.any_owner();

            mvcc.add_local(lock_ver, ctx.node_order(), thread_id);

            cur = mvcc.any_owner();
            val = state.val.clone();

            state.extras = EntryExtras::with_mvcc(state.extras.take(), Some(mvcc));
        }

        self.check_owner_changed(ctx, prev, cur, val);

        Ok(())
    }

    /// Record a remote lock candidate.
    pub fn add_remote_lock(
        &self,
        ctx: &CacheContext,
        lock_ver: Version,
        node_order: u32,
        thread_id: u64,
    ) -> CacheResult<()> {
        let (prev, cur, val);

        {
            let mut state = self.state.lock();
            Self::check_obsolete(&state)?;

            let mut mvcc = state.mvcc().cloned().unwrap_or_default();
            prev = mvcc.any_owner();

            mvcc.add_remote(lock_ver, node_order, thread_id);

            cur = mvcc.any_owner();
            val = state.val.clone();

            state.extras = EntryExtras::with_mvcc(state.extras.take(), Some(mvcc));
        }

        self.check_owner_changed(ctx, prev, cur, val);

        Ok(())
    }

    /// Release a lock candidate; the next candidate, if any, is promoted.
    /// Emits `UNLOCKED` / `LOCKED` events on owner changes.
    pub fn remove_lock(&self, ctx: &CacheContext, lock_ver: Version) -> CacheResult<bool> {
        let (prev, cur, val, removed);

        {
            let mut state = self.state.lock();
            Self::check_obsolete(&state)?;

            let mut mvcc = state.mvcc().cloned().unwrap_or_default();
            prev = mvcc.any_owner();

            removed = mvcc.has_candidate(lock_ver);
            mvcc.remove(lock_ver);

            cur = mvcc.any_owner();
            val = state.val.clone();

            let mvcc = if mvcc.is_empty() { None } else { Some(mvcc) };
            state.extras = EntryExtras::with_mvcc(state.extras.take(), mvcc);
        }

        self.check_owner_changed(ctx, prev, cur, val);

        Ok(removed)
    }

    /// Whether the lock is owned by this version.
    pub fn locked_by(&self, lock_ver: Version) -> CacheResult<bool> {
        let state = self.state.lock();
        Self::check_obsolete(&state)?;

        Ok(state.mvcc().map(|m| m.owned_by(lock_ver)).unwrap_or(false))
    }

    /// Whether the lock is owned locally by this thread.
    pub fn locked_by_thread(&self, thread_id: u64) -> CacheResult<bool> {
        let state = self.state.lock();
        Self::check_obsolete(&state)?;

        Ok(state
            .mvcc()
            .map(|m| m.owned_by_thread(thread_id))
            .unwrap_or(false))
    }

    /// Whether any candidate outside `exclude` holds or awaits the lock.
    pub fn locked_by_any(&self, exclude: &[Version]) -> CacheResult<bool> {
        let state = self.state.lock();
        Self::check_obsolete(&state)?;

        Ok(state
            .mvcc()
            .map(|m| !m.is_empty_excluding(exclude))
            .unwrap_or(false))
    }

    /// Whether a candidate with this lock version exists.
    pub fn has_lock_candidate(&self, lock_ver: Version) -> CacheResult<bool> {
        let state = self.state.lock();
        Self::check_obsolete(&state)?;

        Ok(state
            .mvcc()
            .map(|m| m.has_candidate(lock_ver))
            .unwrap_or(false))
    }

    /// The candidate with this lock version.
    pub fn lock_candidate(&self, lock_ver: Version) -> CacheResult<Option<MvccCandidate>> {
        let state = self.state.lock();
        Self::check_obsolete(&state)?;

        Ok(state.mvcc().and_then(|m| m.candidate(lock_ver).cloned()))
    }

    /// Local candidates outside `exclude`.
    pub fn local_candidates(&self, exclude: &[Version]) -> CacheResult<Vec<MvccCandidate>> {
        let state = self.state.lock();
        Self::check_obsolete(&state)?;

        Ok(state
            .mvcc()
            .map(|m| m.local_candidates(exclude))
            .unwrap_or_default())
    }

    /// Emit lock-owner change events; called outside the entry lock.
    fn check_owner_changed(
        &self,
        ctx: &CacheContext,
        prev: Option<MvccCandidate>,
        cur: Option<MvccCandidate>,
        val: Option<Bytes>,
    ) {
        let has_val = val.is_some();

        if let Some(prev) = &prev {
            if cur.is_none() && ctx.is_recordable(EventKind::Unlocked) {
                let mut event = self.event(
                    ctx,
                    Some(prev.version()),
                    EventKind::Unlocked,
                    val.clone(),
                    has_val,
                    val.clone(),
                    has_val,
                );
                event.node_order = prev.node_order();
                ctx.add_event(event);
            }
        }

        if let Some(cur) = &cur {
            let changed = prev
                .as_ref()
                .map(|p| p.version() != cur.version())
                .unwrap_or(true);

            if changed && ctx.is_recordable(EventKind::Locked) {
                let mut event = self.event(
                    ctx,
                    Some(cur.version()),
                    EventKind::Locked,
                    val.clone(),
                    has_val,
                    val,
                    has_val,
                );
                event.node_order = cur.node_order();
                ctx.add_event(event);
            }
        }
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Versioned snapshot for conflict resolution.
    pub fn versioned_entry(
        &self,
        ctx: &CacheContext,
    ) -> CacheResult<crate::conflict::VersionedEntry> {
        let mut state = self.state.lock();
        Self::check_obsolete(&state)?;

        let is_start = self.is_start(ctx, &state);

        if is_start && !state.is_unswapped() {
            self.unswap_locked(ctx, &mut state)?;
        }

        Ok(crate::conflict::VersionedEntry {
            value: state.val.clone(),
            ttl: state.ttl(),
            expire_time: state.expire_time(),
            version: state.conflict_version(),
            is_start,
        })
    }

    // =========================================================================
    // Internals shared with the update closure
    // =========================================================================

    pub(crate) fn is_start(&self, ctx: &CacheContext, state: &EntryState) -> bool {
        state.ver.node_order == ctx.node_order() && state.ver.order == self.start_ver
    }

    pub(crate) fn check_obsolete(state: &EntryState) -> CacheResult<()> {
        if state.obsolete_version().is_some() {
            return Err(CacheError::EntryRemoved);
        }

        Ok(())
    }

    /// Commit value, TTL pair, and version. The version must advance under
    /// the comparator except on load/install paths that pin it explicitly.
    pub(crate) fn apply(
        &self,
        state: &mut EntryState,
        val: Option<Bytes>,
        expire_time: u64,
        ttl: u64,
        ver: Version,
    ) {
        state.val = val;
        state.extras = EntryExtras::with_ttl(state.extras.take(), ttl, expire_time);
        state.ver = ver;
    }

    pub(crate) fn set_deleted_flag(&self, state: &mut EntryState, deleted: bool) {
        debug_assert!(!deleted || state.val.is_none());

        if deleted {
            state.flags |= IS_DELETED;
        } else {
            state.flags &= !IS_DELETED;
        }
    }

    /// First read of the authoritative row: installs value, version, and
    /// expire time, and sets `IS_UNSWAPPED` exactly once.
    pub(crate) fn unswap_locked(
        &self,
        ctx: &CacheContext,
        state: &mut EntryState,
    ) -> CacheResult<Option<Row>> {
        if !self.is_start(ctx, state) || state.is_unswapped() {
            return Ok(None);
        }

        let row = ctx.store().read(&self.key)?;

        state.flags |= IS_UNSWAPPED;

        if let Some(row) = &row {
            self.apply(
                state,
                Some(row.value.clone()),
                row.expire_time,
                0,
                row.version,
            );
        }

        Ok(row)
    }

    /// Install the authoritative row supplied by an invoke, marking the
    /// first read.
    pub(crate) fn install_row(&self, state: &mut EntryState, row: &Row) {
        state.flags |= IS_UNSWAPPED;
        self.apply(
            state,
            Some(row.value.clone()),
            row.expire_time,
            0,
            row.version,
        );
    }

    /// Append the WAL record for a committed mutation, when logging is
    /// enabled.
    pub(crate) fn log_update(
        &self,
        ctx: &CacheContext,
        val: Option<&Bytes>,
        ver: Version,
        expire_time: u64,
        update_counter: u64,
        create: bool,
    ) -> CacheResult<()> {
        let Some(wal) = ctx.wal() else {
            return Ok(());
        };

        let record = match val {
            Some(val) if create => DataRecord::Create {
                key: self.key.clone(),
                value: val.clone(),
                version: ver,
                expire_time,
                partition: self.partition,
                update_counter,
            },
            Some(val) => DataRecord::Update {
                key: self.key.clone(),
                value: val.clone(),
                version: ver,
                expire_time,
                partition: self.partition,
                update_counter,
            },
            None => DataRecord::Delete {
                key: self.key.clone(),
                version: ver,
                partition: self.partition,
                update_counter,
            },
        };

        wal.log(record)
    }

    /// TTL, expire time, and remove flag for a prospective write, combining
    /// explicit inputs, the policy, and the entry's current pair.
    pub(crate) fn ttl_and_expire_time(
        &self,
        state: &EntryState,
        expiry: Option<&dyn ExpiryPolicy>,
        explicit_ttl: Ttl,
        explicit_expire: Option<u64>,
        is_start: bool,
    ) -> (u64, u64, bool) {
        let mut decision = explicit_ttl;

        if decision == Ttl::NotChanged {
            if let Some(policy) = expiry {
                decision = if state.has_value() {
                    policy.for_update()
                } else {
                    policy.for_create()
                };
            }
        }

        let mut remove = false;

        let (ttl, expire) = match decision {
            Ttl::Zero => {
                remove = true;
                (0, 0)
            }
            Ttl::NotChanged => {
                if is_start {
                    (0, 0)
                } else {
                    return (state.ttl(), state.expire_time(), false);
                }
            }
            Ttl::Eternal => (0, 0),
            Ttl::Millis(ms) => (ms, explicit_expire.unwrap_or_else(|| to_expire_time(ms))),
        };

        (ttl, expire, remove)
    }

    pub(crate) fn dr_replicate_locked(
        &self,
        ctx: &CacheContext,
        state: &EntryState,
        dr_type: DrType,
        val: Option<&Bytes>,
        topology_version: u32,
    ) -> CacheResult<()> {
        if !dr_type.replicates() {
            return Ok(());
        }

        let Some(dr) = ctx.dr() else {
            return Ok(());
        };

        dr.replicate(
            &self.key,
            val,
            state.ttl(),
            state.expire_time(),
            state.conflict_version(),
            dr_type,
            topology_version,
        )
    }

    fn event(
        &self,
        ctx: &CacheContext,
        ver: Option<Version>,
        kind: EventKind,
        new_value: Option<Bytes>,
        has_new_value: bool,
        old_value: Option<Bytes>,
        has_old_value: bool,
    ) -> CacheEvent {
        CacheEvent {
            partition: self.partition,
            key: self.key.clone(),
            node_order: ctx.node_order(),
            version: ver,
            kind,
            new_value,
            has_new_value,
            old_value,
            has_old_value,
        }
    }

    /// Emit staged event and continuous-query notification, in that order,
    /// outside the entry lock.
    fn deliver_write_notifications(
        &self,
        ctx: &CacheContext,
        staged_event: Option<CacheEvent>,
        staged_cq: Option<(ListenerSet, Option<Bytes>, Option<Bytes>, u64)>,
        topology_version: u32,
    ) {
        if let Some(event) = staged_event {
            ctx.add_event(event);
        }

        if let Some((listeners, new_val, old_val, counter)) = staged_cq {
            if let Some(queries) = ctx.queries() {
                queries.on_entry_updated(
                    listeners,
                    &self.key,
                    new_val.as_ref(),
                    old_val.as_ref(),
                    self.partition,
                    true,
                    counter,
                    topology_version,
                );
            }
        }
    }

    /// After-put interceptor, outside the lock; failures are logged and
    /// swallowed.
    fn after_put(&self, ctx: &CacheContext, val: &Bytes) {
        if let Some(interceptor) = ctx.interceptor() {
            let view = EntryView::new(&self.key, Some(val));

            let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                interceptor.on_after_put(view);
            }));

            if res.is_err() {
                warn!(cache = %ctx.config().name, "on_after_put interceptor failed, ignoring");
            }
        }
    }

    /// After-remove interceptor, outside the lock; failures are logged and
    /// swallowed.
    fn after_remove(&self, ctx: &CacheContext, old: Option<&Bytes>) {
        if let Some(interceptor) = ctx.interceptor() {
            let view = EntryView::new(&self.key, old);

            let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                interceptor.on_after_remove(view);
            }));

            if res.is_err() {
                warn!(cache = %ctx.config().name, "on_after_remove interceptor failed, ignoring");
            }
        }
    }

    fn assert_lock_held(&self, state: &EntryState, tx: Option<&TxContext>) {
        if let Some(tx) = tx {
            debug_assert!(
                (!tx.is_local() && tx.is_one_phase_commit())
                    || state
                        .mvcc()
                        .map(|m| m.has_candidate(tx.xid()))
                        .unwrap_or(false),
                "transaction does not own the entry lock"
            );
        }

        let _ = state;
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();

        f.debug_struct("CacheEntry")
            .field("partition", &self.partition)
            .field("ver", &state.ver)
            .field("has_value", &state.has_value())
            .field("deleted", &state.is_deleted())
            .field("obsolete", &state.obsolete_version().is_some())
            .finish()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use std::sync::Arc;

    fn ctx() -> CacheContext {
        CacheContext::new(CacheConfig::new("test").with_partitions(1))
    }

    fn put(ctx: &CacheContext, entry: &Arc<CacheEntry>, val: &str) -> UpdateTxResult {
        entry
            .inner_set(
                ctx,
                Bytes::copy_from_slice(val.as_bytes()),
                TxWriteRequest::new(),
            )
            .unwrap()
    }

    #[test]
    fn test_fresh_entry_is_new_and_empty() {
        let ctx = ctx();
        let entry = ctx.entry(&CacheKey::from("k"));

        assert!(entry.is_new(&ctx).unwrap());
        assert!(!entry.has_value());
        assert!(entry.inner_get(&ctx, GetRequest::new()).unwrap().is_none());
    }

    #[test]
    fn test_put_then_get() {
        let ctx = ctx();
        let entry = ctx.entry(&CacheKey::from("k"));

        let res = put(&ctx, &entry, "v1");
        assert!(res.success);
        assert_eq!(res.update_counter, 1);

        assert_eq!(
            entry.inner_get(&ctx, GetRequest::new()).unwrap().unwrap(),
            "v1"
        );
        assert!(!entry.is_new(&ctx).unwrap());
    }

    #[test]
    fn test_version_advances_per_write() {
        let ctx = ctx();
        let entry = ctx.entry(&CacheKey::from("k"));

        put(&ctx, &entry, "v1");
        let v1 = entry.version().unwrap();

        put(&ctx, &entry, "v2");
        let v2 = entry.version().unwrap();

        assert!(v2 > v1);
    }

    #[test]
    fn test_remove_marks_obsolete_without_deferred_delete() {
        let ctx = ctx();
        let key = CacheKey::from("k");
        let entry = ctx.entry(&key);

        put(&ctx, &entry, "v1");

        let res = entry.inner_remove(&ctx, TxWriteRequest::new()).unwrap();
        assert!(res.success);
        assert_eq!(res.old_value.unwrap(), "v1");

        assert!(entry.obsolete());
        assert!(matches!(
            entry.inner_get(&ctx, GetRequest::new()),
            Err(CacheError::EntryRemoved)
        ));

        // The partition no longer maps the obsolete entry.
        assert!(ctx.partition(0).entry(&key).is_none());
    }

    #[test]
    fn test_deferred_remove_leaves_tombstone() {
        let ctx = CacheContext::new(
            CacheConfig::new("test")
                .with_partitions(1)
                .with_deferred_delete(true),
        );
        let key = CacheKey::from("k");
        let entry = ctx.entry(&key);

        put(&ctx, &entry, "v1");
        entry.inner_remove(&ctx, TxWriteRequest::new()).unwrap();

        assert!(!entry.obsolete());
        assert!(entry.deleted());
        assert!(!entry.has_value());

        // Resurrect by put.
        put(&ctx, &entry, "v2");
        assert!(!entry.deleted());
        assert_eq!(
            entry.inner_get(&ctx, GetRequest::new()).unwrap().unwrap(),
            "v2"
        );

        // The stale deferred delete no longer applies: version moved on.
        assert_eq!(ctx.flush_deferred(), 0);
        assert!(ctx.partition(0).entry(&key).is_some());
    }

    #[test]
    fn test_deferred_delete_flush_unmaps() {
        let ctx = CacheContext::new(
            CacheConfig::new("test")
                .with_partitions(1)
                .with_deferred_delete(true),
        );
        let key = CacheKey::from("k");
        let entry = ctx.entry(&key);

        put(&ctx, &entry, "v1");
        entry.inner_remove(&ctx, TxWriteRequest::new()).unwrap();

        assert_eq!(ctx.flush_deferred(), 1);
        assert!(entry.obsolete());
        assert!(ctx.partition(0).entry(&key).is_none());
    }

    #[test]
    fn test_obsolete_is_terminal() {
        let ctx = ctx();
        let entry = ctx.entry(&CacheKey::from("k"));

        put(&ctx, &entry, "v1");
        let over = ctx.versions().next();
        assert!(entry.mark_obsolete(over));

        assert!(matches!(entry.version(), Err(CacheError::EntryRemoved)));
        assert!(matches!(entry.peek(), Err(CacheError::EntryRemoved)));
        assert!(matches!(
            entry.inner_set(&ctx, Bytes::from_static(b"x"), TxWriteRequest::new()),
            Err(CacheError::EntryRemoved)
        ));
    }

    #[test]
    fn test_filter_failure_rejects_write() {
        let ctx = ctx();
        let entry = ctx.entry(&CacheKey::from("k"));

        let only_existing: &EntryFilter = &|view| view.value().is_some();
        let filter = [only_existing];

        let res = entry
            .inner_set(
                &ctx,
                Bytes::from_static(b"v"),
                TxWriteRequest::new().with_filter(&filter),
            )
            .unwrap();

        assert!(!res.success);
        assert!(!entry.has_value());
    }

    #[test]
    fn test_remove_of_missing_value_still_succeeds() {
        let ctx = ctx();
        let entry = ctx.entry(&CacheKey::from("k"));

        let res = entry.inner_remove(&ctx, TxWriteRequest::new()).unwrap();
        assert!(res.success);
        assert!(res.old_value.is_none());
    }

    #[test]
    fn test_evict_internal() {
        let ctx = ctx();
        let key = CacheKey::from("k");
        let entry = ctx.entry(&key);

        put(&ctx, &entry, "v1");

        let over = ctx.versions().next();
        assert!(entry.evict_internal(&ctx, over, &[]));
        assert!(entry.obsolete());
        assert!(ctx.partition(0).entry(&key).is_none());
        assert_eq!(ctx.metrics().snapshot().evictions, 1);
    }

    #[test]
    fn test_evict_blocked_by_lock_candidate() {
        let ctx = ctx();
        let entry = ctx.entry(&CacheKey::from("k"));

        put(&ctx, &entry, "v1");

        let lock_ver = ctx.versions().next();
        entry.add_local_lock(&ctx, lock_ver, 7).unwrap();

        let over = ctx.versions().next();
        assert!(!entry.evict_internal(&ctx, over, &[]));
        assert!(!entry.obsolete());

        entry.remove_lock(&ctx, lock_ver).unwrap();
        assert!(entry.evict_internal(&ctx, over, &[]));
    }

    #[test]
    fn test_evict_in_batch_produces_snapshot() {
        let ctx = ctx();
        let entry = ctx.entry(&CacheKey::from("k"));

        put(&ctx, &entry, "v1");
        let ver = entry.version().unwrap();

        let over = ctx.versions().next();
        let snap = entry.evict_in_batch_internal(&ctx, over).unwrap();

        assert_eq!(snap.value, "v1");
        assert_eq!(snap.version, ver);
        assert!(entry.obsolete());
        assert!(!entry.has_value());
    }

    #[test]
    fn test_initial_value_only_upgrades() {
        let ctx = ctx();
        let entry = ctx.entry(&CacheKey::from("k"));

        let v1 = ctx.versions().next();

        assert!(entry
            .initial_value(&ctx, Some(Bytes::from_static(b"a")), v1, 0, 0)
            .unwrap());
        assert_eq!(entry.raw_get().unwrap(), "a");

        // Stale preload version is rejected.
        assert!(!entry
            .initial_value(&ctx, Some(Bytes::from_static(b"stale")), v1, 0, 0)
            .unwrap());
        assert_eq!(entry.raw_get().unwrap(), "a");

        // Newer preload version wins.
        let v2 = ctx.versions().next();
        assert!(entry
            .initial_value(&ctx, Some(Bytes::from_static(b"b")), v2, 0, 0)
            .unwrap());
        assert_eq!(entry.raw_get().unwrap(), "b");
    }

    #[test]
    fn test_invalidate_clears_value_and_bumps_version() {
        let ctx = ctx();
        let entry = ctx.entry(&CacheKey::from("k"));

        put(&ctx, &entry, "v1");
        let v1 = entry.version().unwrap();

        let next = ctx.versions().next();
        entry.invalidate(&ctx, None, next).unwrap();

        assert!(!entry.has_value());
        assert!(entry.version().unwrap() > v1);
    }

    #[test]
    fn test_update_ttl_and_peek_expired() {
        let ctx = ctx();
        let entry = ctx.entry(&CacheKey::from("k"));

        put(&ctx, &entry, "v1");

        entry.update_ttl(&ctx, None, Ttl::Zero).unwrap();
        assert!(entry.peek().unwrap().is_none());

        entry.update_ttl(&ctx, None, Ttl::Millis(60_000)).unwrap();
        assert_eq!(entry.peek().unwrap().unwrap(), "v1");
        assert_eq!(entry.raw_ttl(), 60_000);
    }

    #[test]
    fn test_mark_obsolete_version_requires_match() {
        let ctx = ctx();
        let entry = ctx.entry(&CacheKey::from("k"));

        put(&ctx, &entry, "v1");
        let stale = ctx.versions().next();

        put(&ctx, &entry, "v2");

        assert!(!entry.mark_obsolete_version(stale));
        assert!(!entry.obsolete());

        let current = entry.version().unwrap();
        assert!(entry.mark_obsolete_version(current));
        assert!(entry.obsolete());
    }

    #[test]
    fn test_versioned_value_installs_on_version_match() {
        let ctx = ctx();
        let entry = ctx.entry(&CacheKey::from("k"));

        put(&ctx, &entry, "v1");
        let cur = entry.version().unwrap();

        let installed = entry
            .versioned_value(&ctx, Bytes::from_static(b"loaded"), Some(cur), None, None)
            .unwrap();

        assert!(installed.is_some());
        assert_eq!(entry.raw_get().unwrap(), "loaded");

        // Mismatched current version installs nothing.
        let res = entry
            .versioned_value(&ctx, Bytes::from_static(b"x"), Some(cur), None, None)
            .unwrap();
        assert!(res.is_none());
        assert_eq!(entry.raw_get().unwrap(), "loaded");
    }
}
