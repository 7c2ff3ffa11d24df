//! Cache configuration.

/// Ordering mode for atomic-cache version comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteOrderMode {
    /// Versions are ordered by their physical-time component as well.
    #[default]
    Clock,
    /// The primary assigns order; physical time is ignored when comparing,
    /// so the same logical update observed twice compares equal.
    Primary,
}

/// Static cache configuration - behavior switches for the entry layer.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Cache name, used in logging.
    pub name: String,

    /// Number of partitions in the local map.
    pub partitions: u32,

    /// Order of the local node in the topology. Start-version detection
    /// compares against this.
    pub node_order: u32,

    /// Data center this node mints versions in.
    pub data_center_id: u8,

    /// Removes leave a tombstone (`IS_DELETED`) instead of immediately
    /// obsoleting the entry, preserving ordering against concurrent gets.
    pub deferred_delete: bool,

    /// Misses consult the external store.
    pub read_through: bool,

    /// Writes propagate to the external store.
    pub write_through: bool,

    /// Local atomic updates load the previous value from the external store
    /// when an operation needs it.
    pub load_previous_value: bool,

    /// Maintain the in-crate metrics counters.
    pub statistics_enabled: bool,

    /// Version ordering mode for the atomic update path.
    pub write_order: WriteOrderMode,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            partitions: 16,
            node_order: 1,
            data_center_id: 0,
            deferred_delete: false,
            read_through: false,
            write_through: false,
            load_previous_value: false,
            statistics_enabled: true,
            write_order: WriteOrderMode::Clock,
        }
    }
}

impl CacheConfig {
    /// Create a config with default values.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the partition count.
    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions.max(1);
        self
    }

    /// Set the local node order.
    pub fn with_node_order(mut self, node_order: u32) -> Self {
        self.node_order = node_order;
        self
    }

    /// Set the data center id.
    pub fn with_data_center(mut self, data_center_id: u8) -> Self {
        self.data_center_id = data_center_id;
        self
    }

    /// Enable deferred deletion.
    pub fn with_deferred_delete(mut self, enabled: bool) -> Self {
        self.deferred_delete = enabled;
        self
    }

    /// Enable read-through.
    pub fn with_read_through(mut self, enabled: bool) -> Self {
        self.read_through = enabled;
        self
    }

    /// Enable write-through.
    pub fn with_write_through(mut self, enabled: bool) -> Self {
        self.write_through = enabled;
        self
    }

    /// Enable previous-value loading for local atomic updates.
    pub fn with_load_previous_value(mut self, enabled: bool) -> Self {
        self.load_previous_value = enabled;
        self
    }

    /// Enable or disable statistics.
    pub fn with_statistics(mut self, enabled: bool) -> Self {
        self.statistics_enabled = enabled;
        self
    }

    /// Set the atomic write-order mode.
    pub fn with_write_order(mut self, mode: WriteOrderMode) -> Self {
        self.write_order = mode;
        self
    }

    /// Whether version comparisons on the atomic path skip physical time.
    #[inline]
    pub fn ignore_version_time(&self) -> bool {
        self.write_order == WriteOrderMode::Primary
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn test_builder_chain() {
        let cfg = CacheConfig::new("tx-cache")
            .with_partitions(4)
            .with_deferred_delete(true)
            .with_write_order(WriteOrderMode::Primary);

        assert_eq!(cfg.name, "tx-cache");
        assert_eq!(cfg.partitions, 4);
        assert!(cfg.deferred_delete);
        assert!(cfg.ignore_version_time());
    }

    #[test]
    fn test_partitions_clamped_to_one() {
        assert_eq!(CacheConfig::default().with_partitions(0).partitions, 1);
    }
}
