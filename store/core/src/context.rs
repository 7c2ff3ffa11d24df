//! Cache context: configuration, version clock, collaborators, partitions.
//!
//! The context owns the partitions (which own the entries) and the wired-in
//! collaborator implementations. Entries hold no back-references; every
//! operation takes `&CacheContext`, which keeps ownership acyclic.

use std::sync::Arc;

use crate::config::CacheConfig;
use crate::conflict::{ConflictResolver, DrReplicator};
use crate::entry::CacheEntry;
use crate::events::{CacheEvent, EventKind, EventRecorder};
use crate::interceptor::Interceptor;
use crate::key::CacheKey;
use crate::metrics::CacheMetrics;
use crate::partition::Partition;
use crate::query::ContinuousQueries;
use crate::store::{ExternalStore, MemRowStore, RowStore};
use crate::version::VersionClock;
use crate::wal::WalManager;

/// Shared cache state and collaborators for one cache.
pub struct CacheContext {
    config: CacheConfig,
    versions: VersionClock,
    metrics: CacheMetrics,
    store: Arc<dyn RowStore>,
    external: Option<Arc<dyn ExternalStore>>,
    interceptor: Option<Arc<dyn Interceptor>>,
    queries: Option<Arc<dyn ContinuousQueries>>,
    wal: Option<Arc<dyn WalManager>>,
    events: Option<Arc<dyn EventRecorder>>,
    resolver: Option<Arc<dyn ConflictResolver>>,
    dr: Option<Arc<dyn DrReplicator>>,
    partitions: Vec<Partition>,
}

impl CacheContext {
    /// Start building a context for the given configuration.
    pub fn builder(config: CacheConfig) -> CacheContextBuilder {
        CacheContextBuilder {
            config,
            store: None,
            external: None,
            interceptor: None,
            queries: None,
            wal: None,
            events: None,
            resolver: None,
            dr: None,
        }
    }

    /// A context with default collaborators (in-memory row store, nothing
    /// else wired).
    pub fn new(config: CacheConfig) -> Self {
        Self::builder(config).build()
    }

    /// The cache configuration.
    #[inline]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The per-node version clock.
    #[inline]
    pub fn versions(&self) -> &VersionClock {
        &self.versions
    }

    /// Statistics counters.
    #[inline]
    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// The authoritative row store.
    #[inline]
    pub fn store(&self) -> &dyn RowStore {
        self.store.as_ref()
    }

    /// The external store of record, if configured.
    #[inline]
    pub fn external(&self) -> Option<&dyn ExternalStore> {
        self.external.as_deref()
    }

    /// The user interceptor, if configured.
    #[inline]
    pub fn interceptor(&self) -> Option<&dyn Interceptor> {
        self.interceptor.as_deref()
    }

    /// The continuous-query registry, if configured.
    #[inline]
    pub fn queries(&self) -> Option<&dyn ContinuousQueries> {
        self.queries.as_deref()
    }

    /// The write-ahead log, if enabled.
    #[inline]
    pub fn wal(&self) -> Option<&dyn WalManager> {
        self.wal.as_deref()
    }

    /// The conflict resolver, if configured.
    #[inline]
    pub fn resolver(&self) -> Option<&dyn ConflictResolver> {
        self.resolver.as_deref()
    }

    /// The DR replicator, if configured.
    #[inline]
    pub fn dr(&self) -> Option<&dyn DrReplicator> {
        self.dr.as_deref()
    }

    /// Whether read-through applies: enabled and a store is configured.
    pub fn read_through(&self) -> bool {
        self.config.read_through && self.external.is_some()
    }

    /// Whether write-through applies: enabled and a store is configured.
    pub fn write_through(&self) -> bool {
        self.config.write_through && self.external.is_some()
    }

    /// Whether events of this kind should be recorded.
    pub fn is_recordable(&self, kind: EventKind) -> bool {
        self.events
            .as_deref()
            .map(|e| e.is_recordable(kind))
            .unwrap_or(false)
    }

    /// Record an event if a recorder is wired.
    pub fn add_event(&self, event: CacheEvent) {
        if let Some(events) = self.events.as_deref() {
            events.add_event(event);
        }
    }

    /// Local node order (for start-version detection and event stamping).
    #[inline]
    pub fn node_order(&self) -> u32 {
        self.config.node_order
    }

    /// The partition with the given id.
    ///
    /// # Panics
    /// Panics if the id is out of range; partition ids come from entries,
    /// which are created by partitions of this context.
    pub fn partition(&self, id: u32) -> &Partition {
        &self.partitions[id as usize]
    }

    /// The partition owning this key.
    pub fn partition_for(&self, key: &CacheKey) -> &Partition {
        let idx = key.hash() % self.partitions.len() as u64;
        &self.partitions[idx as usize]
    }

    /// The live entry for a key, creating it in its owning partition if
    /// absent or obsolete.
    pub fn entry(&self, key: &CacheKey) -> Arc<CacheEntry> {
        self.partition_for(key).entry_or_create(self, key)
    }

    /// The live entry for a key, without creating one.
    pub fn peek_entry(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.partition_for(key).entry(key)
    }

    /// Drain all partitions' deferred-delete queues. Returns how many
    /// entries were unmapped.
    pub fn flush_deferred(&self) -> usize {
        self.partitions.iter().map(Partition::flush_deferred).sum()
    }
}

impl std::fmt::Debug for CacheContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheContext")
            .field("name", &self.config.name)
            .field("partitions", &self.partitions.len())
            .finish()
    }
}

/// Builder wiring collaborators into a [`CacheContext`].
pub struct CacheContextBuilder {
    config: CacheConfig,
    store: Option<Arc<dyn RowStore>>,
    external: Option<Arc<dyn ExternalStore>>,
    interceptor: Option<Arc<dyn Interceptor>>,
    queries: Option<Arc<dyn ContinuousQueries>>,
    wal: Option<Arc<dyn WalManager>>,
    events: Option<Arc<dyn EventRecorder>>,
    resolver: Option<Arc<dyn ConflictResolver>>,
    dr: Option<Arc<dyn DrReplicator>>,
}

impl CacheContextBuilder {
    /// Use this row store instead of the in-memory default.
    pub fn with_store(mut self, store: Arc<dyn RowStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Wire an external store of record.
    pub fn with_external_store(mut self, external: Arc<dyn ExternalStore>) -> Self {
        self.external = Some(external);
        self
    }

    /// Wire a user interceptor.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    /// Wire a continuous-query registry.
    pub fn with_queries(mut self, queries: Arc<dyn ContinuousQueries>) -> Self {
        self.queries = Some(queries);
        self
    }

    /// Enable write-ahead logging through this manager.
    pub fn with_wal(mut self, wal: Arc<dyn WalManager>) -> Self {
        self.wal = Some(wal);
        self
    }

    /// Wire an event recorder.
    pub fn with_events(mut self, events: Arc<dyn EventRecorder>) -> Self {
        self.events = Some(events);
        self
    }

    /// Wire a conflict resolver; its presence enables conflict resolution.
    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Wire a DR replicator.
    pub fn with_dr(mut self, dr: Arc<dyn DrReplicator>) -> Self {
        self.dr = Some(dr);
        self
    }

    /// Build the context, creating the partitions and version clock.
    pub fn build(self) -> CacheContext {
        let partitions = (0..self.config.partitions).map(Partition::new).collect();

        CacheContext {
            versions: VersionClock::new(self.config.node_order, self.config.data_center_id),
            metrics: CacheMetrics::new(),
            store: self
                .store
                .unwrap_or_else(|| Arc::new(MemRowStore::new()) as Arc<dyn RowStore>),
            external: self.external,
            interceptor: self.interceptor,
            queries: self.queries,
            wal: self.wal,
            events: self.events,
            resolver: self.resolver,
            dr: self.dr,
            partitions,
            config: self.config,
        }
    }
}
