//! Entry versions, version ordering, and the per-node version clock.
//!
//! A [`Version`] is the monotonic logical timestamp attached to every entry
//! write. Versions are totally ordered by
//! `(topology_version, global_time, order, node_order)`; the comparator also
//! supports an ignore-time mode that skips the physical-time component so
//! that equivalent logical events minted on different nodes compare equal.

use std::cmp::Ordering as CmpOrdering;

use crate::expiry::now_millis;
use crate::sync::{AtomicU32, AtomicU64, Ordering};

/// Monotonic logical version.
///
/// `order` is a per-node monotonic counter and `node_order` identifies the
/// originating node, which makes versions unique cluster-wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    /// Discovery topology major version at mint time.
    pub topology_version: u32,
    /// Physical wall-clock millis at mint time. Skipped in ignore-time
    /// comparisons.
    pub global_time: u64,
    /// Per-node monotonic counter.
    pub order: u64,
    /// Order of the originating node in the topology.
    pub node_order: u32,
    /// Data center the version was minted in.
    pub data_center_id: u8,
}

impl Version {
    /// Create a version from its components.
    pub fn new(
        topology_version: u32,
        global_time: u64,
        order: u64,
        node_order: u32,
        data_center_id: u8,
    ) -> Self {
        Self {
            topology_version,
            global_time,
            order,
            node_order,
            data_center_id,
        }
    }
}

/// Compare two versions.
///
/// With `ignore_time` set, versions differing only in `global_time` compare
/// equal. This mode is used by the atomic update path on primaries so that
/// the same logical update arriving twice is detected as a duplicate rather
/// than reordered by clock skew.
#[inline]
pub fn compare(a: &Version, b: &Version, ignore_time: bool) -> CmpOrdering {
    a.topology_version
        .cmp(&b.topology_version)
        .then_with(|| {
            if ignore_time {
                CmpOrdering::Equal
            } else {
                a.global_time.cmp(&b.global_time)
            }
        })
        .then_with(|| a.order.cmp(&b.order))
        .then_with(|| a.node_order.cmp(&b.node_order))
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        compare(self, other, false)
    }
}

/// Per-node version generator.
///
/// Guarantees that versions minted on this node are strictly increasing
/// under the comparator. All mint paths share one order counter so no two
/// local versions ever carry the same order.
#[derive(Debug)]
pub struct VersionClock {
    node_order: u32,
    data_center_id: u8,
    topology_version: AtomicU32,
    order: AtomicU64,
}

impl VersionClock {
    /// Create a clock for the given node identity.
    pub fn new(node_order: u32, data_center_id: u8) -> Self {
        Self {
            node_order,
            data_center_id,
            topology_version: AtomicU32::new(1),
            order: AtomicU64::new(0),
        }
    }

    /// The node order this clock mints versions for.
    #[inline]
    pub fn node_order(&self) -> u32 {
        self.node_order
    }

    /// The configured data center id.
    #[inline]
    pub fn data_center_id(&self) -> u8 {
        self.data_center_id
    }

    /// Current topology major version.
    pub fn topology_version(&self) -> u32 {
        self.topology_version.load(Ordering::Relaxed)
    }

    /// Advance the topology version (discovery callback).
    pub fn on_topology_changed(&self, topology_version: u32) {
        self.topology_version
            .fetch_max(topology_version, Ordering::Relaxed);
    }

    /// Mint the next version at the current topology version.
    pub fn next(&self) -> Version {
        self.mint(self.topology_version())
    }

    /// Mint the next version, keeping the topology version of `prev`.
    ///
    /// Used when a write must not observe a topology change that happened
    /// after its transaction was mapped.
    pub fn next_after(&self, prev: Version) -> Version {
        self.mint(prev.topology_version)
    }

    /// Mint a version for a load operation, keeping the topology version of
    /// `prev`. Loads advance the same order stream as writes so an installed
    /// load can never be mistaken for a start version.
    pub fn next_for_load(&self, prev: Version) -> Version {
        self.mint(prev.topology_version)
    }

    /// Mint a start version for a freshly created entry.
    pub fn start_version(&self) -> Version {
        self.next()
    }

    fn mint(&self, topology_version: u32) -> Version {
        let order = self.order.fetch_add(1, Ordering::Relaxed) + 1;

        Version::new(
            topology_version,
            now_millis(),
            order,
            self.node_order,
            self.data_center_id,
        )
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    fn ver(top: u32, time: u64, order: u64, node: u32) -> Version {
        Version::new(top, time, order, node, 0)
    }

    #[test]
    fn test_order_is_lexicographic() {
        assert!(ver(2, 0, 0, 0) > ver(1, 99, 99, 99));
        assert!(ver(1, 5, 0, 0) > ver(1, 4, 99, 99));
        assert!(ver(1, 5, 7, 0) > ver(1, 5, 6, 99));
        assert!(ver(1, 5, 7, 3) > ver(1, 5, 7, 2));
        assert_eq!(ver(1, 5, 7, 3), ver(1, 5, 7, 3));
    }

    #[test]
    fn test_ignore_time_skips_clock() {
        let a = ver(1, 100, 7, 3);
        let b = ver(1, 999, 7, 3);

        assert_ne!(compare(&a, &b, false), CmpOrdering::Equal);
        assert_eq!(compare(&a, &b, true), CmpOrdering::Equal);
    }

    #[test]
    fn test_ignore_time_still_orders_by_counter() {
        let a = ver(1, 999, 7, 3);
        let b = ver(1, 100, 8, 3);

        assert_eq!(compare(&a, &b, true), CmpOrdering::Less);
    }

    #[test]
    fn test_clock_is_monotonic() {
        let clock = VersionClock::new(1, 0);

        let mut prev = clock.next();
        for _ in 0..100 {
            let next = clock.next();
            assert!(next > prev, "clock went backwards: {next:?} <= {prev:?}");
            prev = next;
        }
    }

    #[test]
    fn test_next_after_keeps_topology() {
        let clock = VersionClock::new(1, 0);
        clock.on_topology_changed(5);

        let pinned = Version::new(3, 0, 1, 1, 0);
        let next = clock.next_after(pinned);

        assert_eq!(next.topology_version, 3);
        assert!(compare(&next, &pinned, true) == CmpOrdering::Greater);
    }

    #[test]
    fn test_topology_only_advances() {
        let clock = VersionClock::new(1, 0);
        clock.on_topology_changed(4);
        clock.on_topology_changed(2);

        assert_eq!(clock.topology_version(), 4);
    }
}
