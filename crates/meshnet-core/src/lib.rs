//! MeshNet Core - Replicated Graph Store
//!
//! This crate provides the core of MeshNet, a graph store whose nodes
//! ("mesh objects") are replicated across independent peers ("mesh bases"):
//! - Typed graph model (entity types, properties, relationship role types)
//! - Replicas with lock and home pointers; one lock holder per node
//! - Transactions as the only way to mutate a mesh base
//! - Typed, invertible change events with apply and forwarding rules
//! - Policy-driven sweeper evicting replicas with cascading edge cleanup
//! - Differencer turning one mesh base's state into another's
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              Transaction                     │
//! │   (create, bless, relate, delete, apply)    │
//! └──────────────┬──────────────────────────────┘
//!                │ commit: ChangeSet
//! ┌──────────────┴──────────────────────────────┐
//! │          Propagation Engine                  │
//! │  (away from lock, replica in direction)     │
//! └──────────────┬──────────────────────────────┘
//!                │ ProxyMessage
//! ┌──────────────┴──────────────────────────────┐
//! │               Proxies                        │
//! │   (outbound queues, framed wire codec)      │
//! └─────────────────────────────────────────────┘
//!
//!      MeshBase: cache ──► Store (memory / LMDB)
//!      Sweeper:  policy ──► delete transactions
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use meshnet_core::testing::{fixtures, memory_mesh_base};
//!
//! let base = memory_mesh_base("MB1");
//! base.execute(|tx| {
//!     tx.create_mesh_object("a".into())?;
//!     tx.create_mesh_object("b".into())?;
//!     tx.bless_relationship(&"a".into(), &fixtures::RR_S.into(), &"b".into())
//! })
//! .unwrap();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod change;
pub mod clock;
pub mod config;
pub mod differencer;
pub mod error;
pub mod identifier;
pub mod mesh;
pub mod meshbase;
pub mod model;
pub mod propagation;
pub mod proxy;
pub mod store;
pub mod sweeper;
pub mod testing;
pub mod transaction;
pub mod transport;

pub use change::{ApplyOutcome, Change, ChangeKind, ChangeSet, Tolerance};
pub use config::{MeshBaseConfig, StoreConfig};
pub use differencer::MeshBaseDifferencer;
pub use error::{Error, Result};
pub use identifier::{MeshBaseIdentifier, MeshObjectIdentifier, MeshTypeIdentifier};
pub use mesh::{MeshObject, MeshObjectTimes, NetMeshObject, ReplicaInfo, RoleSet};
pub use meshbase::{Diagnostics, MeshBase};
pub use model::{ModelBase, PropertyValue};
pub use propagation::PropagationEngine;
pub use proxy::{Proxy, ProxyMessage};
pub use store::{LmdbStore, MemoryStore, Store, StoreListener, StoreValue};
pub use sweeper::{ExpiresSweepPolicy, NotReadForLongerThan, SweepPolicy, SweepReport, Sweeper};
pub use transaction::{Transaction, TxState};
pub use transport::LocalNetwork;
