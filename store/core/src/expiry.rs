//! TTL arithmetic and the expiry policy collaborator.
//!
//! An entry stores a concrete `(ttl, expire_time)` pair in milliseconds where
//! zero means "eternal". Policies and explicit per-operation inputs speak in
//! [`Ttl`] decisions, which also carry the `NotChanged` and `Zero` sentinels:
//! `NotChanged` keeps whatever the entry has, `Zero` on a write demotes the
//! operation to a delete.

use std::time::{SystemTime, UNIX_EPOCH};

/// Smallest representable TTL, used when a `Zero` decision still has to
/// produce a concrete already-expired pair.
pub const TTL_MINIMUM_MS: u64 = 1;

/// Current wall clock in milliseconds since the epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A TTL decision from a policy or an explicit operation input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// The value never expires.
    Eternal,
    /// Keep the TTL the entry currently has.
    NotChanged,
    /// Expire immediately; on a write this demotes the operation to a delete.
    Zero,
    /// Concrete time-to-live in milliseconds (always non-zero).
    Millis(u64),
}

impl Ttl {
    /// Build a decision from raw milliseconds, mapping zero to `Eternal`.
    pub fn from_millis(ms: u64) -> Self {
        if ms == 0 { Self::Eternal } else { Self::Millis(ms) }
    }
}

/// Expiry policy collaborator, configured per cache or supplied per
/// operation.
pub trait ExpiryPolicy: Send + Sync {
    /// TTL for an entry created by this operation.
    fn for_create(&self) -> Ttl;

    /// TTL for an entry updated by this operation.
    fn for_update(&self) -> Ttl;

    /// TTL applied when an entry is read.
    fn for_access(&self) -> Ttl;
}

/// Fixed-decision policy, mostly useful in tests and as a building block.
#[derive(Debug, Clone, Copy)]
pub struct ConstantExpiry {
    create: Ttl,
    update: Ttl,
    access: Ttl,
}

impl ConstantExpiry {
    /// Policy that never changes TTLs.
    pub fn new() -> Self {
        Self {
            create: Ttl::NotChanged,
            update: Ttl::NotChanged,
            access: Ttl::NotChanged,
        }
    }

    /// Set the creation decision.
    pub fn with_create(mut self, ttl: Ttl) -> Self {
        self.create = ttl;
        self
    }

    /// Set the update decision.
    pub fn with_update(mut self, ttl: Ttl) -> Self {
        self.update = ttl;
        self
    }

    /// Set the access decision.
    pub fn with_access(mut self, ttl: Ttl) -> Self {
        self.access = ttl;
        self
    }
}

impl Default for ConstantExpiry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpiryPolicy for ConstantExpiry {
    fn for_create(&self) -> Ttl {
        self.create
    }

    fn for_update(&self) -> Ttl {
        self.update
    }

    fn for_access(&self) -> Ttl {
        self.access
    }
}

/// Absolute expire time for a concrete TTL; zero TTL means eternal.
#[inline]
pub fn to_expire_time(ttl_ms: u64) -> u64 {
    if ttl_ms == 0 {
        0
    } else {
        now_millis().saturating_add(ttl_ms)
    }
}

/// An expire time guaranteed to already be in the past.
#[inline]
pub fn expire_time_in_past() -> u64 {
    now_millis().saturating_sub(1)
}

/// Whether a stored expire time has passed. Zero never expires; an expire
/// time reached exactly at the observation moment counts as expired.
#[inline]
pub fn is_expired(expire_time: u64, now: u64) -> bool {
    expire_time > 0 && expire_time <= now
}

/// Concrete `(ttl, expire_time)` for a freshly loaded value under the
/// policy's for-create decision.
pub fn initial_ttl_and_expire(policy: &dyn ExpiryPolicy) -> (u64, u64) {
    match policy.for_create() {
        Ttl::Zero => (TTL_MINIMUM_MS, expire_time_in_past()),
        Ttl::NotChanged | Ttl::Eternal => (0, 0),
        Ttl::Millis(ms) => (ms, to_expire_time(ms)),
    }
}
