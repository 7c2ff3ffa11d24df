//! Recording collaborator fakes shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use cairn_core::{
    CacheEvent, CacheKey, CacheResult, ConflictResolution, ConflictResolver, ContinuousQueries,
    DataRecord, DrReplicator, DrType, EventKind, EventRecorder, ExternalStore, ListenerSet,
    TxContext, Version, VersionedEntry, WalManager,
};

/// Captures every event the entry layer emits.
#[derive(Default)]
pub struct RecordingEvents {
    pub events: Mutex<Vec<CacheEvent>>,
}

impl RecordingEvents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().iter().map(|e| e.kind).collect()
    }

    pub fn of_kind(&self, kind: EventKind) -> Vec<CacheEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventRecorder for RecordingEvents {
    fn is_recordable(&self, _kind: EventKind) -> bool {
        true
    }

    fn add_event(&self, event: CacheEvent) {
        self.events.lock().push(event);
    }
}

/// A committed update delivered to continuous queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CqUpdate {
    pub new_value: Option<Bytes>,
    pub old_value: Option<Bytes>,
    pub update_counter: u64,
}

/// Captures continuous-query notifications in delivery order.
#[derive(Default)]
pub struct RecordingQueries {
    pub updates: Mutex<Vec<CqUpdate>>,
    pub expired: Mutex<Vec<Bytes>>,
}

impl RecordingQueries {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn clear(&self) {
        self.updates.lock().clear();
        self.expired.lock().clear();
    }
}

impl ContinuousQueries for RecordingQueries {
    fn update_listeners(&self, _internal: bool, _primary: bool) -> Option<ListenerSet> {
        Some(ListenerSet(1))
    }

    fn on_entry_updated(
        &self,
        _listeners: ListenerSet,
        _key: &CacheKey,
        new_val: Option<&Bytes>,
        old_val: Option<&Bytes>,
        _partition: u32,
        _primary: bool,
        update_counter: u64,
        _topology_version: u32,
    ) {
        self.updates.lock().push(CqUpdate {
            new_value: new_val.cloned(),
            old_value: old_val.cloned(),
            update_counter,
        });
    }

    fn on_entry_expired(&self, _key: &CacheKey, val: &Bytes) {
        self.expired.lock().push(val.clone());
    }
}

/// Captures appended WAL records.
#[derive(Default)]
pub struct RecordingWal {
    pub records: Mutex<Vec<DataRecord>>,
}

impl RecordingWal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }
}

impl WalManager for RecordingWal {
    fn log(&self, record: DataRecord) -> CacheResult<()> {
        self.records.lock().push(record);
        Ok(())
    }
}

/// In-memory external store of record that also records every write-through.
#[derive(Default)]
pub struct MapStore {
    map: Mutex<HashMap<Vec<u8>, Bytes>>,
    pub puts: Mutex<Vec<(Bytes, Version)>>,
    pub removes: Mutex<Vec<Vec<u8>>>,
}

impl MapStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed(&self, key: &str, val: &str) {
        self.map.lock().insert(
            key.as_bytes().to_vec(),
            Bytes::copy_from_slice(val.as_bytes()),
        );
    }

    pub fn clear_log(&self) {
        self.puts.lock().clear();
        self.removes.lock().clear();
    }
}

impl ExternalStore for MapStore {
    fn load(&self, _tx: Option<&TxContext>, key: &CacheKey) -> CacheResult<Option<Bytes>> {
        Ok(self.map.lock().get(key.as_bytes()).cloned())
    }

    fn put(
        &self,
        _tx: Option<&TxContext>,
        key: &CacheKey,
        val: &Bytes,
        ver: Version,
    ) -> CacheResult<()> {
        self.map.lock().insert(key.as_bytes().to_vec(), val.clone());
        self.puts.lock().push((val.clone(), ver));
        Ok(())
    }

    fn remove(&self, _tx: Option<&TxContext>, key: &CacheKey) -> CacheResult<()> {
        self.map.lock().remove(key.as_bytes());
        self.removes.lock().push(key.as_bytes().to_vec());
        Ok(())
    }
}

/// Captures replication calls.
#[derive(Default)]
pub struct RecordingDr {
    pub replicated: Mutex<Vec<(Option<Bytes>, Version, DrType)>>,
}

impl RecordingDr {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl DrReplicator for RecordingDr {
    fn replicate(
        &self,
        _key: &CacheKey,
        val: Option<&Bytes>,
        _ttl: u64,
        _expire_time: u64,
        conflict_ver: Version,
        dr_type: DrType,
        _topology_version: u32,
    ) -> CacheResult<()> {
        self.replicated
            .lock()
            .push((val.cloned(), conflict_ver, dr_type));
        Ok(())
    }
}

/// Resolver that always returns the same verdict.
pub struct FixedResolver(pub ConflictResolution);

impl ConflictResolver for FixedResolver {
    fn resolve(
        &self,
        _old: &VersionedEntry,
        _new: &VersionedEntry,
        _atomic_check: bool,
    ) -> ConflictResolution {
        self.0.clone()
    }
}
