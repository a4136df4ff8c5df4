//! Shared helpers for integration tests

#![allow(dead_code)]

use meshnet_core::testing::{fixtures, memory_mesh_base};
use meshnet_core::{LocalNetwork, MeshBase, MeshBaseIdentifier, MeshObjectIdentifier};
use std::sync::{Arc, Once};

static TRACING: Once = Once::new();

/// Install a tracing subscriber once per test binary
///
/// Honors `RUST_LOG`; defaults to warnings only.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "meshnet_core=warn".into());
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// In-memory mesh bases registered on one network, without connections
pub fn network(ids: &[&str]) -> (LocalNetwork, Vec<Arc<MeshBase>>) {
    init_tracing();
    let network = LocalNetwork::new();
    let mut bases = Vec::with_capacity(ids.len());
    for id in ids {
        let base = Arc::new(memory_mesh_base(id));
        network.register(base.clone()).unwrap();
        bases.push(base);
    }
    (network, bases)
}

/// Connect two mesh bases by name
pub fn connect(network: &LocalNetwork, a: &str, b: &str) {
    network
        .connect(&MeshBaseIdentifier::from(a), &MeshBaseIdentifier::from(b))
        .unwrap();
}

/// Identifier shorthand
pub fn id(name: &str) -> MeshObjectIdentifier {
    MeshObjectIdentifier::from(name)
}

/// Mesh base identifier shorthand
pub fn mb(name: &str) -> MeshBaseIdentifier {
    MeshBaseIdentifier::from(name)
}

/// Create nodes blessed with `AA`, in one transaction
pub fn create_aa(base: &MeshBase, names: &[&str]) {
    base.execute(|tx| {
        for name in names {
            tx.create_mesh_object(id(name))?;
            tx.bless(&id(name), &fixtures::AA.into())?;
        }
        Ok(())
    })
    .unwrap();
}
