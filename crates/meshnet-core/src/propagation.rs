//! Propagation rules
//!
//! Decides, per change and per outgoing proxy, whether a committed change
//! must be forwarded. Two rules cover every change kind:
//!
//! - *away from lock*: lock-authoritative changes travel only outwards from
//!   the replica holding the lock, never back towards it.
//! - *replica in direction*: relationship changes go wherever another
//!   replica lives, except back to the partner they arrived from.

use crate::change::{Change, ChangeSet};
use crate::identifier::{MeshBaseIdentifier, MeshObjectIdentifier};
use crate::mesh::ReplicaInfo;
use std::collections::{BTreeMap, HashMap};

/// Whether `proxy` leads away from the lock of a replica
///
/// A replica with no known proxies has nowhere to forward to.
pub fn away_from_lock(replica: &ReplicaInfo, proxy: &MeshBaseIdentifier) -> bool {
    if replica.proxies.is_empty() {
        return false;
    }
    replica.proxies.contains(proxy) && replica.proxy_towards_lock.as_ref() != Some(proxy)
}

/// Whether another replica lives in the direction of `proxy`
pub fn has_replica_in_direction(replica: &ReplicaInfo, proxy: &MeshBaseIdentifier) -> bool {
    replica.has_replica_towards(proxy)
}

/// Whether `change` must be forwarded on `proxy`
pub fn should_be_sent(change: &Change, replica: &ReplicaInfo, proxy: &MeshBaseIdentifier) -> bool {
    if change.is_lock_authoritative() {
        away_from_lock(replica, proxy)
    } else {
        change.origin() != Some(proxy) && has_replica_in_direction(replica, proxy)
    }
}

/// Splits committed change sets into per-partner batches
pub struct PropagationEngine;

impl PropagationEngine {
    /// Route `changes` to the partners that must see them
    ///
    /// `replicas` holds the bookkeeping of every affected node as of commit;
    /// for purged nodes that is the state before the purge. Changes keep
    /// their commit order within each batch, and partners with nothing to
    /// receive are left out.
    pub fn route(
        changes: &ChangeSet,
        replicas: &HashMap<MeshObjectIdentifier, ReplicaInfo>,
        partners: &[MeshBaseIdentifier],
    ) -> BTreeMap<MeshBaseIdentifier, ChangeSet> {
        let mut routed: BTreeMap<MeshBaseIdentifier, ChangeSet> = BTreeMap::new();
        for change in changes {
            let Some(replica) = replicas.get(change.affected()) else {
                tracing::trace!("No replica info for {}, not forwarding", change.affected());
                continue;
            };
            for partner in partners {
                if should_be_sent(change, replica, partner) {
                    routed.entry(partner.clone()).or_default().push(change.clone());
                }
            }
        }
        routed
    }
}
