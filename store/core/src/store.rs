//! Row store and external store collaborators.
//!
//! The row store is the authoritative off-heap side of an entry: the entry
//! holds the hot metadata, the row store holds the durable row. `invoke`
//! supplies the current row to a closure executed under the entry lock and
//! applies the closure's returned operation atomically with the row lookup.
//!
//! The external store is the optional system of record behind read-through /
//! write-through.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::CacheResult;
use crate::key::CacheKey;
use crate::tx::TxContext;
use crate::version::Version;

/// A materialized row read from or written to the row store.
#[derive(Debug, Clone)]
pub struct Row {
    /// Row value bytes.
    pub value: Bytes,
    /// Version the row was written with.
    pub version: Version,
    /// Absolute expire time in milliseconds; zero when eternal.
    pub expire_time: u64,
}

/// Operation an invoke closure asks the row store to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeOp {
    /// Write the closure's new row.
    Put,
    /// Remove the current row.
    Remove,
    /// Leave the store untouched.
    Noop,
}

/// A planner executed by [`RowStore::invoke`] against the current row.
///
/// The row store calls [`call`](Self::call) with the current row (if any),
/// then applies [`operation`](Self::operation) with
/// [`new_row`](Self::new_row) atomically with the lookup.
pub trait InvokeClosure {
    /// Plan the update given the current row.
    fn call(&mut self, old_row: Option<Row>) -> CacheResult<()>;

    /// The operation to apply after [`call`](Self::call) returns.
    fn operation(&self) -> TreeOp;

    /// The row to write for [`TreeOp::Put`].
    fn new_row(&self) -> Option<Row>;
}

/// Authoritative row store collaborator.
pub trait RowStore: Send + Sync {
    /// Read the current row for a key.
    fn read(&self, key: &CacheKey) -> CacheResult<Option<Row>>;

    /// Write a row.
    fn update(&self, key: &CacheKey, partition: u32, row: Row) -> CacheResult<()>;

    /// Remove a row. Removing a missing row is a no-op.
    fn remove(&self, key: &CacheKey, partition: u32) -> CacheResult<()>;

    /// Run `closure` against the current row and apply its operation
    /// atomically with the lookup.
    fn invoke(
        &self,
        key: &CacheKey,
        partition: u32,
        closure: &mut dyn InvokeClosure,
    ) -> CacheResult<()>;
}

/// External store of record collaborator (read-through / write-through).
pub trait ExternalStore: Send + Sync {
    /// Load the value for a key.
    fn load(&self, tx: Option<&TxContext>, key: &CacheKey) -> CacheResult<Option<Bytes>>;

    /// Propagate a write.
    fn put(&self, tx: Option<&TxContext>, key: &CacheKey, val: &Bytes, ver: Version)
        -> CacheResult<()>;

    /// Propagate a removal.
    fn remove(&self, tx: Option<&TxContext>, key: &CacheKey) -> CacheResult<()>;
}

/// Hash-map row store.
///
/// Stands in for the off-heap page store: a single latch per store keeps
/// row invocation atomic with the lookup, while the entry monitor remains
/// the outer lock for metadata consistency.
#[derive(Debug, Default)]
pub struct MemRowStore {
    rows: Mutex<HashMap<CacheKey, Row>>,
}

impl MemRowStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows currently stored.
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    /// Whether the store holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

impl RowStore for MemRowStore {
    fn read(&self, key: &CacheKey) -> CacheResult<Option<Row>> {
        Ok(self.rows.lock().get(key).cloned())
    }

    fn update(&self, key: &CacheKey, _partition: u32, row: Row) -> CacheResult<()> {
        self.rows.lock().insert(key.clone(), row);
        Ok(())
    }

    fn remove(&self, key: &CacheKey, _partition: u32) -> CacheResult<()> {
        self.rows.lock().remove(key);
        Ok(())
    }

    fn invoke(
        &self,
        key: &CacheKey,
        _partition: u32,
        closure: &mut dyn InvokeClosure,
    ) -> CacheResult<()> {
        let mut rows = self.rows.lock();

        closure.call(rows.get(key).cloned())?;

        match closure.operation() {
            TreeOp::Put => {
                if let Some(row) = closure.new_row() {
                    rows.insert(key.clone(), row);
                }
            }
            TreeOp::Remove => {
                rows.remove(key);
            }
            TreeOp::Noop => {}
        }

        Ok(())
    }
}
