//! Testing infrastructure
//!
//! Shared helpers for unit and integration tests: a temporary directory
//! context for LMDB-backed stores, the test model and a store listener
//! that counts store traffic.
//!
//! ```rust,no_run
//! use meshnet_core::testing::{fixtures, memory_mesh_base};
//!
//! let base = memory_mesh_base("MB1");
//! base.execute(|tx| {
//!     let id = "obj1".into();
//!     tx.create_mesh_object(id)?;
//!     tx.bless(&"obj1".into(), &fixtures::AA.into())
//! })
//! .unwrap();
//! ```

mod context;
pub mod fixtures;

pub use context::TestContext;

use crate::config::MeshBaseConfig;
use crate::meshbase::MeshBase;
use crate::model::ModelBase;
use crate::store::{StoreListener, StoreValue};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// The test model of [`fixtures`]
pub fn test_model() -> Arc<ModelBase> {
    Arc::new(ModelBase::from_json(fixtures::MODEL_JSON).expect("Test model must load"))
}

/// Mesh base on an in-memory store with the test model
pub fn memory_mesh_base(id: &str) -> MeshBase {
    MeshBase::open(MeshBaseConfig::new(id), test_model()).expect("Failed to open mesh base")
}

/// Store listener counting operations
#[derive(Debug, Default)]
pub struct CountingStoreListener {
    puts: AtomicUsize,
    updates: AtomicUsize,
    deletes: AtomicUsize,
    gets: AtomicUsize,
    get_failures: AtomicUsize,
}

impl CountingStoreListener {
    /// Puts, updates and deletes
    pub fn writes(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
            + self.updates.load(Ordering::SeqCst)
            + self.deletes.load(Ordering::SeqCst)
    }

    /// Successful gets
    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    /// Gets of missing keys
    pub fn get_failures(&self) -> usize {
        self.get_failures.load(Ordering::SeqCst)
    }

    /// Deletes
    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

impl StoreListener for CountingStoreListener {
    fn put_performed(&self, _value: &StoreValue) {
        self.puts.fetch_add(1, Ordering::SeqCst);
    }

    fn update_performed(&self, _value: &StoreValue) {
        self.updates.fetch_add(1, Ordering::SeqCst);
    }

    fn get_performed(&self, _value: &StoreValue) {
        self.gets.fetch_add(1, Ordering::SeqCst);
    }

    fn get_failed(&self, _key: &str) {
        self.get_failures.fetch_add(1, Ordering::SeqCst);
    }

    fn delete_performed(&self, _key: &str) {
        self.deletes.fetch_add(1, Ordering::SeqCst);
    }
}
