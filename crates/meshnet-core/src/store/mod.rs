//! Key/value persistence boundary
//!
//! A mesh base only touches its store at commit time and on cache misses.
//! Values are opaque byte payloads with four timestamps; the mesh base owns
//! the encoding.
//!
//! Two implementations are provided:
//! - [`MemoryStore`]: ordered in-memory map, used for tests and ephemeral bases
//! - [`LmdbStore`]: durable store on an LMDB environment (heed)

mod lmdb;
mod memory;

pub use lmdb::LmdbStore;
pub use memory::MemoryStore;

use crate::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One stored value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreValue {
    /// Key this value is stored under
    pub key: String,
    /// Identifies the encoding of `data`
    pub encoding_id: String,
    /// Creation time
    pub time_created: i64,
    /// Last update time
    pub time_updated: i64,
    /// Last read time
    pub time_read: i64,
    /// Expiry time, `-1` for never
    pub time_expires: i64,
    /// Opaque payload
    pub data: Vec<u8>,
}

/// One operation of an atomic batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Insert or replace a value
    PutOrUpdate(StoreValue),
    /// Remove a key; fails the batch if absent
    Delete(String),
}

/// Observer of store activity
///
/// All hooks default to doing nothing.
pub trait StoreListener: Send + Sync {
    /// A new value was stored
    fn put_performed(&self, _value: &StoreValue) {}

    /// An existing value was replaced
    fn update_performed(&self, _value: &StoreValue) {}

    /// A value was read
    fn get_performed(&self, _value: &StoreValue) {}

    /// A read found nothing
    fn get_failed(&self, _key: &str) {}

    /// A value was removed
    fn delete_performed(&self, _key: &str) {}

    /// All values under a prefix were removed
    fn delete_all_performed(&self, _prefix: &str) {}
}

/// Durable key/value store
pub trait Store: Send + Sync {
    /// Store a new value; fails with `StoreKeyExistsAlready`
    fn put(&self, value: StoreValue) -> Result<()>;

    /// Replace an existing value; fails with `StoreKeyDoesNotExist`
    fn update(&self, value: StoreValue) -> Result<()>;

    /// Store or replace; returns true if a value was replaced
    fn put_or_update(&self, value: StoreValue) -> Result<bool>;

    /// Read a value; fails with `StoreKeyDoesNotExist`
    fn get(&self, key: &str) -> Result<StoreValue>;

    /// Remove a value; fails with `StoreKeyDoesNotExist`
    fn delete(&self, key: &str) -> Result<()>;

    /// Remove every value whose key starts with `prefix`, returning the count
    fn delete_all(&self, prefix: &str) -> Result<usize>;

    /// All keys, sorted
    fn keys(&self) -> Result<Vec<String>>;

    /// Whether a key is present
    fn contains(&self, key: &str) -> Result<bool>;

    /// Apply a batch atomically: either every operation is applied or none
    fn write_batch(&self, ops: Vec<StoreOp>) -> Result<()>;

    /// Register a listener
    fn add_listener(&self, listener: Arc<dyn StoreListener>);
}

/// Listener registry shared by the store implementations
#[derive(Default)]
pub(crate) struct ListenerSet {
    listeners: RwLock<Vec<Arc<dyn StoreListener>>>,
}

impl ListenerSet {
    pub(crate) fn add(&self, listener: Arc<dyn StoreListener>) {
        self.listeners.write().push(listener);
    }

    pub(crate) fn each(&self, f: impl Fn(&dyn StoreListener)) {
        for listener in self.listeners.read().iter() {
            f(listener.as_ref());
        }
    }
}

/// Fire the listeners for a batch that has been applied
pub(crate) fn notify_batch(listeners: &ListenerSet, applied: &[(StoreOp, bool)]) {
    for (op, existed) in applied {
        match op {
            StoreOp::PutOrUpdate(value) if *existed => {
                listeners.each(|l| l.update_performed(value))
            }
            StoreOp::PutOrUpdate(value) => listeners.each(|l| l.put_performed(value)),
            StoreOp::Delete(key) => listeners.each(|l| l.delete_performed(key)),
        }
    }
}
