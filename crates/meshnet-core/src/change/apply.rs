//! Applying changes to another replica
//!
//! Application is idempotent-tolerant: a change whose target state is
//! already reached yields [`ApplyOutcome::Tolerated`] and records nothing,
//! so re-delivered or reflected changes die out instead of looping.
//!
//! A relationship change also updates the neighbor's side when the
//! neighbor is replicated here. That update is recorded as the neighbor's
//! own change with the same origin, so replicas holding only the neighbor
//! learn of it.

use super::{Change, ChangeKind};
use crate::identifier::{MeshBaseIdentifier, MeshObjectIdentifier};
use crate::mesh::{MeshObject, NetMeshObject, ReplicaInfo, RoleSet};
use crate::meshbase::MeshBase;
use crate::transaction::Transaction;
use crate::{Error, Result};

/// Why an application was a no-op
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tolerance {
    /// The added node, edge, role, type or value is present already
    AlreadyPresent,
    /// The removed node or type is absent already
    AlreadyAbsent,
    /// The two nodes are not related, and the neighbor is known here
    NotRelated,
    /// The two nodes are not related, and the neighbor was never replicated here
    NeighborUnknown,
    /// None of the removed role types are present
    RoleTypeAbsent,
}

/// Result of applying one change to a replica
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// Applied; the replica's new state
    Applied(NetMeshObject),
    /// The replica was purged
    Purged(MeshObjectIdentifier),
    /// Target state already reached; nothing was recorded
    Tolerated {
        /// Affected node
        object: MeshObjectIdentifier,
        /// Which state was already reached
        reason: Tolerance,
    },
    /// Lock-authoritative change not arriving from the lock; the replica is unchanged
    NotFromLock(NetMeshObject),
}

impl ApplyOutcome {
    fn tolerated(object: &MeshObjectIdentifier, reason: Tolerance) -> Self {
        Self::Tolerated {
            object: object.clone(),
            reason,
        }
    }

    /// Whether the replica was changed
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_) | Self::Purged(_))
    }
}

impl Change {
    /// Apply this change to `base`'s local replica of the affected node
    ///
    /// Runs inside `tx` when given, otherwise inside a transaction of its
    /// own. `incoming` names the partner the change arrived from; `None`
    /// applies it as if originated locally.
    ///
    /// Relationship and role changes apply regardless of the lock.
    /// Lock-authoritative changes apply only when the replica's lock
    /// pointer names `incoming`.
    pub fn potentially_apply_to_replica_in(
        &self,
        base: &MeshBase,
        tx: Option<&mut Transaction<'_>>,
        incoming: Option<&MeshBaseIdentifier>,
    ) -> Result<ApplyOutcome> {
        match tx {
            Some(tx) => {
                if tx.mesh_base().identifier() != base.identifier() {
                    return Err(Error::transaction(format!(
                        "Transaction belongs to {}, not {}",
                        tx.mesh_base().identifier(),
                        base.identifier()
                    )));
                }
                self.apply_in(tx, incoming)
            }
            None => base.execute(|tx| self.apply_in(tx, incoming)),
        }
    }

    fn apply_in(
        &self,
        tx: &mut Transaction<'_>,
        incoming: Option<&MeshBaseIdentifier>,
    ) -> Result<ApplyOutcome> {
        let id = self.affected();

        if let ChangeKind::Created { state } = self.kind() {
            return self.apply_created(tx, incoming, state);
        }

        let Some(current) = tx.find(id)? else {
            if matches!(self.kind(), ChangeKind::Purged { .. }) {
                return Ok(ApplyOutcome::tolerated(id, Tolerance::AlreadyAbsent));
            }
            return Err(Error::cannot_apply(
                id,
                format!("{} needs a local replica", self.kind().name()),
            ));
        };

        if self.is_lock_authoritative() && current.replica().proxy_towards_lock.as_ref() != incoming
        {
            tracing::debug!(
                "Ignoring {} for {} from {:?}: lock is towards {:?}",
                self.kind().name(),
                id,
                incoming,
                current.replica().proxy_towards_lock
            );
            return Ok(ApplyOutcome::NotFromLock(current));
        }

        let mut mirror = Mirror::Nothing;
        match self.kind() {
            ChangeKind::Created { .. } => {
                return Err(Error::internal("creation reached the update path"));
            }
            ChangeKind::Purged { .. } => {
                let state = tx
                    .purge_local(id, incoming)?
                    .map(|removed| removed.into_parts().0);
                let recorded = Change::at(
                    id.clone(),
                    ChangeKind::Purged { state },
                    self.time_event_occurred(),
                );
                tx.record(recorded.with_origin(incoming.cloned()))?;
                return Ok(ApplyOutcome::Purged(id.clone()));
            }
            ChangeKind::NeighborAdded {
                neighbor,
                role_types,
                ..
            } => {
                if neighbor == id {
                    return Err(Error::CannotRelateToItself(id.clone()));
                }
                let inverse = tx.inverse_roles(role_types)?;
                let object = existing(tx, id)?.object_mut();
                let edge_added = object.add_neighbor(neighbor);
                let roles_added = object.add_roles(neighbor, role_types);
                if !edge_added && roles_added.is_empty() {
                    return Ok(ApplyOutcome::tolerated(id, Tolerance::AlreadyPresent));
                }
                mirror = Mirror::Add(inverse);
            }
            ChangeKind::NeighborRemoved { neighbor, .. } => {
                if !current.is_related_to(neighbor) {
                    return Ok(ApplyOutcome::tolerated(id, not_related(tx, neighbor)?));
                }
                existing(tx, id)?.object_mut().remove_neighbor(neighbor);
                mirror = Mirror::RemoveEdge;
            }
            ChangeKind::RoleAdded {
                neighbor, delta, ..
            } => {
                if neighbor == id {
                    return Err(Error::CannotRelateToItself(id.clone()));
                }
                let inverse = tx.inverse_roles(delta)?;
                let object = existing(tx, id)?.object_mut();
                let edge_added = object.add_neighbor(neighbor);
                let roles_added = object.add_roles(neighbor, delta);
                if !edge_added && roles_added.is_empty() {
                    return Ok(ApplyOutcome::tolerated(id, Tolerance::AlreadyPresent));
                }
                mirror = Mirror::Add(inverse);
            }
            ChangeKind::RoleRemoved {
                neighbor, delta, ..
            } => {
                if !current.is_related_to(neighbor) {
                    return Ok(ApplyOutcome::tolerated(id, not_related(tx, neighbor)?));
                }
                let inverse = tx.inverse_roles(delta).map_err(|e| match e {
                    Error::UnresolvedReference(what) => Error::cannot_apply(id, what),
                    other => other,
                })?;
                let removed = existing(tx, id)?
                    .object_mut()
                    .remove_roles(neighbor, delta);
                if removed.is_empty() {
                    return Ok(ApplyOutcome::tolerated(id, Tolerance::RoleTypeAbsent));
                }
                mirror = Mirror::RemoveRoles(inverse);
            }
            ChangeKind::TypeAdded { delta, .. } => {
                for entity_type in delta {
                    tx.model().entity_type(entity_type)?;
                }
                let types = existing(tx, id)?.object_mut().types_mut();
                let before = types.len();
                types.extend(delta.iter().cloned());
                if types.len() == before {
                    return Ok(ApplyOutcome::tolerated(id, Tolerance::AlreadyPresent));
                }
            }
            ChangeKind::TypeRemoved { delta, .. } => {
                let types = existing(tx, id)?.object_mut().types_mut();
                let before = types.len();
                types.retain(|t| !delta.contains(t));
                if types.len() == before {
                    return Ok(ApplyOutcome::tolerated(id, Tolerance::AlreadyAbsent));
                }
            }
            ChangeKind::PropertyChanged { property, new, .. } => {
                if current.property(property) == new.as_ref() {
                    return Ok(ApplyOutcome::tolerated(id, Tolerance::AlreadyPresent));
                }
                if let Some(value) = new {
                    let model = tx.model();
                    let property_type = model.property_type(property)?;
                    if !property_type.data_type.accepts(value) {
                        return Err(Error::IllegalPropertyValue {
                            property: property.clone(),
                            reason: format!("expected {:?}, got {}", property_type.data_type, value),
                        });
                    }
                    if !model.satisfies(current.types(), &property_type.entity_type) {
                        return Err(Error::IllegalPropertyType {
                            object: id.clone(),
                            property: property.clone(),
                        });
                    }
                }
                existing(tx, id)?
                    .object_mut()
                    .put_property(property, new.clone());
            }
            ChangeKind::AutoExpiresChanged { new, .. } => {
                if current.time_auto_expires() == *new {
                    return Ok(ApplyOutcome::tolerated(id, Tolerance::AlreadyPresent));
                }
                existing(tx, id)?.object_mut().set_time_auto_expires(*new);
            }
        }

        tx.record(self.clone().with_origin(incoming.cloned()))?;
        if let Some(neighbor) = self.kind().neighbor() {
            match mirror {
                Mirror::Nothing => {}
                Mirror::Add(inverse) => tx.mirror_add(neighbor, id, &inverse, incoming)?,
                Mirror::RemoveEdge => tx.mirror_remove_edge(neighbor, id, incoming)?,
                Mirror::RemoveRoles(inverse) => {
                    tx.mirror_remove_roles(neighbor, id, &inverse, incoming)?
                }
            }
        }
        let applied = tx
            .find(id)?
            .ok_or_else(|| Error::internal(format!("{} vanished while applying", id)))?;
        Ok(ApplyOutcome::Applied(applied))
    }

    fn apply_created(
        &self,
        tx: &mut Transaction<'_>,
        incoming: Option<&MeshBaseIdentifier>,
        state: &MeshObject,
    ) -> Result<ApplyOutcome> {
        let id = self.affected();
        if state.identifier() != id {
            return Err(Error::cannot_apply(
                id,
                format!("creation carries the state of {}", state.identifier()),
            ));
        }
        if tx.contains(id)? {
            return Ok(ApplyOutcome::tolerated(id, Tolerance::AlreadyPresent));
        }

        let mut mirrored = Vec::with_capacity(state.neighbors().len());
        for (neighbor, roles) in state.neighbors() {
            mirrored.push((neighbor, tx.inverse_roles(roles)?));
        }

        let replica = match incoming {
            Some(partner) => ReplicaInfo::obtained_from(partner),
            None => ReplicaInfo::default(),
        };
        let object = NetMeshObject::new(state.clone(), replica);
        tx.insert_object(object.clone())?;
        tx.record(self.clone().with_origin(incoming.cloned()))?;
        for (neighbor, inverse) in mirrored {
            tx.mirror_add(neighbor, id, &inverse, incoming)?;
        }
        Ok(ApplyOutcome::Applied(object))
    }
}

/// What the neighbor's side of an applied relationship change needs
enum Mirror {
    Nothing,
    Add(RoleSet),
    RemoveEdge,
    RemoveRoles(RoleSet),
}

fn existing<'t>(
    tx: &'t mut Transaction<'_>,
    id: &MeshObjectIdentifier,
) -> Result<&'t mut NetMeshObject> {
    tx.object_mut(id)?
        .ok_or_else(|| Error::cannot_apply(id, "replica disappeared"))
}

fn not_related(tx: &mut Transaction<'_>, neighbor: &MeshObjectIdentifier) -> Result<Tolerance> {
    Ok(if tx.contains(neighbor)? {
        Tolerance::NotRelated
    } else {
        Tolerance::NeighborUnknown
    })
}
