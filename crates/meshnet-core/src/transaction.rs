//! Transactions
//!
//! Every mutation of a mesh base goes through exactly one active
//! [`Transaction`]. A transaction works on private copies of the nodes it
//! touches: nothing it does is visible through the mesh base, and nothing
//! reaches the store, until [`Transaction::commit`] returns. Commit persists
//! every touched node in one atomic store batch, installs the new states in
//! the cache and then hands the change set to propagation. Rollback (or
//! dropping an active transaction) discards the copies.

use crate::change::{ApplyOutcome, Change, ChangeKind, ChangeSet};
use crate::clock::now_millis;
use crate::identifier::{MeshBaseIdentifier, MeshObjectIdentifier, MeshTypeIdentifier};
use crate::mesh::{MeshObject, MeshObjectTimes, NetMeshObject, ReplicaInfo, RoleSet};
use crate::meshbase::{MeshBase, encode_object};
use crate::model::{ModelBase, PropertyValue};
use crate::store::StoreOp;
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Transaction lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Accepting changes
    Active,
    /// Committed; terminal
    Committed,
    /// Rolled back; terminal
    RolledBack,
}

/// The unit of mutation on one mesh base
pub struct Transaction<'a> {
    base: &'a MeshBase,
    id: u64,
    state: TxState,
    changes: ChangeSet,
    /// Private node copies; `None` marks a node deleted in this transaction
    working: BTreeMap<MeshObjectIdentifier, Option<NetMeshObject>>,
    dirty: BTreeSet<MeshObjectIdentifier>,
    /// Replica bookkeeping of touched nodes as last committed
    replica_before: HashMap<MeshObjectIdentifier, ReplicaInfo>,
    time_started: i64,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(base: &'a MeshBase, id: u64) -> Self {
        Self {
            base,
            id,
            state: TxState::Active,
            changes: ChangeSet::new(),
            working: BTreeMap::new(),
            dirty: BTreeSet::new(),
            replica_before: HashMap::new(),
            time_started: now_millis(),
        }
    }

    /// Transaction number, unique per mesh base
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Lifecycle state
    pub fn state(&self) -> TxState {
        self.state
    }

    /// When the transaction began
    pub fn time_started(&self) -> i64 {
        self.time_started
    }

    /// The owning mesh base
    pub fn mesh_base(&self) -> &'a MeshBase {
        self.base
    }

    /// Changes recorded so far
    pub fn changes(&self) -> &ChangeSet {
        &self.changes
    }

    pub(crate) fn model(&self) -> &'a ModelBase {
        self.base.model()
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state {
            TxState::Active => Ok(()),
            state => Err(Error::transaction(format!(
                "Transaction {} on {} is {:?}",
                self.id,
                self.base.identifier(),
                state
            ))),
        }
    }

    /// Append a change to the pending set
    pub fn record(&mut self, change: Change) -> Result<()> {
        self.ensure_active()?;
        let time = change.time_event_occurred();
        if let Some(Some(object)) = self.working.get_mut(change.affected()) {
            object.object_mut().set_time_updated(time);
        }
        self.changes.push(change);
        Ok(())
    }

    // ---- node access ----

    fn load(&mut self, id: &MeshObjectIdentifier) -> Result<()> {
        if !self.working.contains_key(id) {
            let loaded = self.base.load(id)?;
            if let Some(object) = &loaded {
                self.replica_before
                    .insert(id.clone(), object.replica().clone());
            }
            self.working.insert(id.clone(), loaded);
        }
        Ok(())
    }

    /// Current state of a node as seen by this transaction
    pub fn find(&mut self, id: &MeshObjectIdentifier) -> Result<Option<NetMeshObject>> {
        self.ensure_active()?;
        self.load(id)?;
        Ok(self.working.get(id).cloned().flatten())
    }

    pub(crate) fn contains(&mut self, id: &MeshObjectIdentifier) -> Result<bool> {
        self.load(id)?;
        Ok(matches!(self.working.get(id), Some(Some(_))))
    }

    pub(crate) fn object_mut(
        &mut self,
        id: &MeshObjectIdentifier,
    ) -> Result<Option<&mut NetMeshObject>> {
        self.ensure_active()?;
        self.load(id)?;
        match self.working.get_mut(id) {
            Some(Some(object)) => {
                self.dirty.insert(id.clone());
                Ok(Some(object))
            }
            _ => Ok(None),
        }
    }

    fn existing_mut(&mut self, id: &MeshObjectIdentifier) -> Result<&mut NetMeshObject> {
        self.object_mut(id)?
            .ok_or_else(|| Error::unresolved(format!("mesh object {}", id)))
    }

    fn existing(&mut self, id: &MeshObjectIdentifier) -> Result<NetMeshObject> {
        self.find(id)?
            .ok_or_else(|| Error::unresolved(format!("mesh object {}", id)))
    }

    fn require_lock(&mut self, id: &MeshObjectIdentifier) -> Result<NetMeshObject> {
        let object = self.existing(id)?;
        if !object.replica().is_lock_owner() {
            return Err(Error::NotLockOwner(id.clone()));
        }
        Ok(object)
    }

    pub(crate) fn insert_object(&mut self, object: NetMeshObject) -> Result<()> {
        self.ensure_active()?;
        let id = object.identifier().clone();
        self.load(&id)?;
        self.dirty.insert(id.clone());
        self.working.insert(id, Some(object));
        Ok(())
    }

    pub(crate) fn remove_object(
        &mut self,
        id: &MeshObjectIdentifier,
    ) -> Result<Option<NetMeshObject>> {
        self.ensure_active()?;
        self.load(id)?;
        let removed = self.working.insert(id.clone(), None).flatten();
        if removed.is_some() {
            self.dirty.insert(id.clone());
        }
        Ok(removed)
    }

    /// Remove a node, first detaching every local neighbor from it
    ///
    /// Each detachment is recorded as the neighbor's own change, carrying
    /// `origin`, so it reaches the neighbor's other replicas.
    pub(crate) fn purge_local(
        &mut self,
        id: &MeshObjectIdentifier,
        origin: Option<&MeshBaseIdentifier>,
    ) -> Result<Option<NetMeshObject>> {
        let Some(object) = self.find(id)? else {
            return Ok(None);
        };
        for neighbor in object.neighbors().keys() {
            let Some(other) = self.find(neighbor)? else {
                continue;
            };
            if let Some(reverse) = other.roles_towards(id).cloned() {
                self.mirror_remove_roles(neighbor, id, &reverse, origin)?;
                self.mirror_remove_edge(neighbor, id, origin)?;
            }
        }
        self.remove_object(id)
    }

    // ---- relationship primitives ----

    pub(crate) fn inverse_roles(&self, roles: &RoleSet) -> Result<RoleSet> {
        roles
            .iter()
            .map(|role| Ok(self.model().inverse_role(role)?.identifier.clone()))
            .collect()
    }

    /// Add the edge and roles `neighbor` holds towards `object`
    ///
    /// A no-op when the neighbor has no local replica or has them already.
    /// Otherwise records a `NeighborAdded` or `RoleAdded` change on the
    /// neighbor, as having arrived from `origin`.
    pub(crate) fn mirror_add(
        &mut self,
        neighbor: &MeshObjectIdentifier,
        object: &MeshObjectIdentifier,
        inverse_roles: &RoleSet,
        origin: Option<&MeshBaseIdentifier>,
    ) -> Result<()> {
        let Some(other) = self.object_mut(neighbor)? else {
            return Ok(());
        };
        let old_neighbors = other.neighbor_identifiers();
        let old_roles = other.roles_towards(object).cloned().unwrap_or_default();
        let edge_added = other.object_mut().add_neighbor(object);
        let delta = other.object_mut().add_roles(object, inverse_roles);

        let kind = if edge_added {
            ChangeKind::NeighborAdded {
                neighbor: object.clone(),
                role_types: delta,
                old_neighbors: Some(old_neighbors),
                new_neighbors: Some(other.neighbor_identifiers()),
            }
        } else if !delta.is_empty() {
            ChangeKind::RoleAdded {
                neighbor: object.clone(),
                old: Some(old_roles),
                delta,
                new: other.roles_towards(object).cloned(),
            }
        } else {
            return Ok(());
        };
        self.record(Change::new(neighbor.clone(), kind).with_origin(origin.cloned()))
    }

    /// Remove the edge `neighbor` holds towards `object`, recording it
    pub(crate) fn mirror_remove_edge(
        &mut self,
        neighbor: &MeshObjectIdentifier,
        object: &MeshObjectIdentifier,
        origin: Option<&MeshBaseIdentifier>,
    ) -> Result<()> {
        let Some(other) = self.object_mut(neighbor)? else {
            return Ok(());
        };
        let old_neighbors = other.neighbor_identifiers();
        let Some(role_types) = other.object_mut().remove_neighbor(object) else {
            return Ok(());
        };
        let kind = ChangeKind::NeighborRemoved {
            neighbor: object.clone(),
            role_types,
            old_neighbors: Some(old_neighbors),
            new_neighbors: Some(other.neighbor_identifiers()),
        };
        self.record(Change::new(neighbor.clone(), kind).with_origin(origin.cloned()))
    }

    /// Remove roles `neighbor` plays towards `object`, recording it
    pub(crate) fn mirror_remove_roles(
        &mut self,
        neighbor: &MeshObjectIdentifier,
        object: &MeshObjectIdentifier,
        inverse_roles: &RoleSet,
        origin: Option<&MeshBaseIdentifier>,
    ) -> Result<()> {
        let Some(other) = self.object_mut(neighbor)? else {
            return Ok(());
        };
        let Some(old) = other.roles_towards(object).cloned() else {
            return Ok(());
        };
        let delta = other.object_mut().remove_roles(object, inverse_roles);
        if delta.is_empty() {
            return Ok(());
        }
        let kind = ChangeKind::RoleRemoved {
            neighbor: object.clone(),
            old: Some(old),
            delta,
            new: other.roles_towards(object).cloned(),
        };
        self.record(Change::new(neighbor.clone(), kind).with_origin(origin.cloned()))
    }

    // ---- mutations ----

    /// Create a node held and homed here, with all timestamps set to now
    pub fn create_mesh_object(&mut self, id: MeshObjectIdentifier) -> Result<NetMeshObject> {
        self.create_mesh_object_with(id, MeshObjectTimes::at(now_millis()))
    }

    /// Create a node with explicit timestamps
    pub fn create_mesh_object_with(
        &mut self,
        id: MeshObjectIdentifier,
        times: MeshObjectTimes,
    ) -> Result<NetMeshObject> {
        self.ensure_active()?;
        if self.contains(&id)? {
            return Err(Error::MeshObjectExistsAlready(id));
        }
        let state = MeshObject::new(id.clone(), times);
        let object = NetMeshObject::new(state.clone(), ReplicaInfo::default());
        self.insert_object(object.clone())?;
        self.record(Change::new(id, ChangeKind::Created { state }))?;
        Ok(object)
    }

    /// Set or clear the automatic expiry of a node
    pub fn set_auto_expires(&mut self, id: &MeshObjectIdentifier, expires: Option<i64>) -> Result<()> {
        let object = self.require_lock(id)?;
        let old = object.time_auto_expires();
        if old == expires {
            return Ok(());
        }
        self.existing_mut(id)?
            .object_mut()
            .set_time_auto_expires(expires);
        self.record(Change::new(
            id.clone(),
            ChangeKind::AutoExpiresChanged { old, new: expires },
        ))
    }

    /// Bless a node with an entity type
    pub fn bless(&mut self, id: &MeshObjectIdentifier, entity_type: &MeshTypeIdentifier) -> Result<()> {
        let object = self.require_lock(id)?;
        let resolved = self.model().entity_type(entity_type)?;
        if resolved.is_abstract {
            return Err(Error::model(format!(
                "Cannot bless {} with abstract type {}",
                id, entity_type
            )));
        }
        if object.is_blessed_by(entity_type) {
            return Err(Error::BlessedAlready {
                object: id.clone(),
                mesh_type: entity_type.clone(),
            });
        }

        let old = object.types().clone();
        let target = self.existing_mut(id)?;
        target.object_mut().types_mut().insert(entity_type.clone());
        let new = target.types().clone();

        self.record(Change::new(
            id.clone(),
            ChangeKind::TypeAdded {
                old: Some(old),
                delta: BTreeSet::from([entity_type.clone()]),
                new: Some(new),
            },
        ))
    }

    /// Unbless a node from an entity type
    ///
    /// Properties that no remaining type declares are cleared first, each
    /// recorded as its own change.
    pub fn unbless(&mut self, id: &MeshObjectIdentifier, entity_type: &MeshTypeIdentifier) -> Result<()> {
        let object = self.require_lock(id)?;
        if !object.is_blessed_by(entity_type) {
            return Err(Error::NotBlessed {
                object: id.clone(),
                mesh_type: entity_type.clone(),
            });
        }
        let model = self.model();
        let remaining: BTreeSet<_> = object
            .types()
            .iter()
            .filter(|t| *t != entity_type)
            .cloned()
            .collect();

        for roles in object.neighbors().values() {
            for role in roles {
                let role_type = model.role_type(role)?;
                if let Some(required) = &role_type.entity_type {
                    if !model.satisfies(&remaining, required) {
                        return Err(Error::RoleTypeRequiresEntityType {
                            object: id.clone(),
                            role_type: role.clone(),
                            entity_type: required.clone(),
                        });
                    }
                }
            }
        }

        let orphaned: Vec<MeshTypeIdentifier> = object
            .properties()
            .keys()
            .filter(|property| match model.property_type(property) {
                Ok(pt) => !model.satisfies(&remaining, &pt.entity_type),
                Err(_) => false,
            })
            .cloned()
            .collect();
        for property in orphaned {
            let old = self
                .existing_mut(id)?
                .object_mut()
                .put_property(&property, None);
            self.record(Change::new(
                id.clone(),
                ChangeKind::PropertyChanged {
                    property,
                    old,
                    new: None,
                },
            ))?;
        }

        let old = object.types().clone();
        self.existing_mut(id)?
            .object_mut()
            .types_mut()
            .remove(entity_type);
        self.record(Change::new(
            id.clone(),
            ChangeKind::TypeRemoved {
                old: Some(old),
                delta: BTreeSet::from([entity_type.clone()]),
                new: Some(remaining),
            },
        ))
    }

    /// Set a property value
    pub fn set_property(
        &mut self,
        id: &MeshObjectIdentifier,
        property: &MeshTypeIdentifier,
        value: impl Into<PropertyValue>,
    ) -> Result<()> {
        self.change_property(id, property, Some(value.into()))
    }

    /// Clear a property value; fails for mandatory properties
    pub fn clear_property(&mut self, id: &MeshObjectIdentifier, property: &MeshTypeIdentifier) -> Result<()> {
        self.change_property(id, property, None)
    }

    fn change_property(
        &mut self,
        id: &MeshObjectIdentifier,
        property: &MeshTypeIdentifier,
        value: Option<PropertyValue>,
    ) -> Result<()> {
        let object = self.require_lock(id)?;
        let model = self.model();
        let property_type = model.property_type(property)?;
        if !model.satisfies(object.types(), &property_type.entity_type) {
            return Err(Error::IllegalPropertyType {
                object: id.clone(),
                property: property.clone(),
            });
        }
        match &value {
            Some(v) if !property_type.data_type.accepts(v) => {
                return Err(Error::IllegalPropertyValue {
                    property: property.clone(),
                    reason: format!("expected {:?}, got {}", property_type.data_type, v),
                });
            }
            None if !property_type.optional => {
                return Err(Error::IllegalPropertyValue {
                    property: property.clone(),
                    reason: "property is mandatory".to_string(),
                });
            }
            _ => {}
        }
        if object.property(property) == value.as_ref() {
            return Ok(());
        }

        let old = self
            .existing_mut(id)?
            .object_mut()
            .put_property(property, value.clone());
        self.record(Change::new(
            id.clone(),
            ChangeKind::PropertyChanged {
                property: property.clone(),
                old,
                new: value,
            },
        ))
    }

    /// Value of a property, falling back to the declared default
    pub fn property(
        &mut self,
        id: &MeshObjectIdentifier,
        property: &MeshTypeIdentifier,
    ) -> Result<Option<PropertyValue>> {
        let object = self.existing(id)?;
        let property_type = self.model().property_type(property)?;
        if !self.model().satisfies(object.types(), &property_type.entity_type) {
            return Err(Error::IllegalPropertyType {
                object: id.clone(),
                property: property.clone(),
            });
        }
        Ok(object
            .property(property)
            .cloned()
            .or_else(|| property_type.default_value.clone()))
    }

    /// Relate two nodes without any role types
    pub fn relate(&mut self, a: &MeshObjectIdentifier, b: &MeshObjectIdentifier) -> Result<()> {
        if a == b {
            return Err(Error::CannotRelateToItself(a.clone()));
        }
        let first = self.existing(a)?;
        self.existing(b)?;
        if first.is_related_to(b) {
            return Err(Error::RelatedAlready {
                object: a.clone(),
                neighbor: b.clone(),
            });
        }
        self.add_edge_recorded(a, b)?;
        self.add_edge_recorded(b, a)
    }

    fn add_edge_recorded(&mut self, a: &MeshObjectIdentifier, b: &MeshObjectIdentifier) -> Result<()> {
        let target = self.existing_mut(a)?;
        let old = target.neighbor_identifiers();
        target.object_mut().add_neighbor(b);
        let new = target.neighbor_identifiers();
        self.record(Change::new(
            a.clone(),
            ChangeKind::NeighborAdded {
                neighbor: b.clone(),
                role_types: RoleSet::new(),
                old_neighbors: Some(old),
                new_neighbors: Some(new),
            },
        ))
    }

    /// Remove the relationship between two nodes, with all its role types
    pub fn unrelate(&mut self, a: &MeshObjectIdentifier, b: &MeshObjectIdentifier) -> Result<()> {
        let first = self.existing(a)?;
        let Some(roles) = first.roles_towards(b).cloned() else {
            return Err(Error::NotRelated {
                object: a.clone(),
                neighbor: b.clone(),
            });
        };
        let second = self.find(b)?;

        if !roles.is_empty() {
            self.remove_roles_recorded(a, b, &roles)?;
        }
        if let Some(other) = &second {
            if let Some(reverse) = other.roles_towards(a).cloned() {
                if !reverse.is_empty() {
                    self.remove_roles_recorded(b, a, &reverse)?;
                }
            }
        }
        self.remove_edge_recorded(a, b)?;
        if second.is_some_and(|o| o.is_related_to(a)) {
            self.remove_edge_recorded(b, a)?;
        }
        Ok(())
    }

    fn remove_edge_recorded(&mut self, a: &MeshObjectIdentifier, b: &MeshObjectIdentifier) -> Result<()> {
        let target = self.existing_mut(a)?;
        let old = target.neighbor_identifiers();
        let role_types = target.object_mut().remove_neighbor(b).unwrap_or_default();
        let new = target.neighbor_identifiers();
        self.record(Change::new(
            a.clone(),
            ChangeKind::NeighborRemoved {
                neighbor: b.clone(),
                role_types,
                old_neighbors: Some(old),
                new_neighbors: Some(new),
            },
        ))
    }

    fn add_roles_recorded(
        &mut self,
        a: &MeshObjectIdentifier,
        b: &MeshObjectIdentifier,
        roles: &RoleSet,
    ) -> Result<()> {
        let target = self.existing_mut(a)?;
        let old = target.roles_towards(b).cloned().unwrap_or_default();
        let delta = target.object_mut().add_roles(b, roles);
        let new = target.roles_towards(b).cloned().unwrap_or_default();
        self.record(Change::new(
            a.clone(),
            ChangeKind::RoleAdded {
                neighbor: b.clone(),
                old: Some(old),
                delta,
                new: Some(new),
            },
        ))
    }

    fn remove_roles_recorded(
        &mut self,
        a: &MeshObjectIdentifier,
        b: &MeshObjectIdentifier,
        roles: &RoleSet,
    ) -> Result<()> {
        let target = self.existing_mut(a)?;
        let old = target.roles_towards(b).cloned().unwrap_or_default();
        let delta = target.object_mut().remove_roles(b, roles);
        let new = target.roles_towards(b).cloned().unwrap_or_default();
        self.record(Change::new(
            a.clone(),
            ChangeKind::RoleRemoved {
                neighbor: b.clone(),
                old: Some(old),
                delta,
                new: Some(new),
            },
        ))
    }

    /// Bless the relationship from `a` to `b` with a role type
    ///
    /// Relates the two nodes first if they are not related yet. `a` plays
    /// `role_type`, `b` plays its inverse.
    pub fn bless_relationship(
        &mut self,
        a: &MeshObjectIdentifier,
        role_type: &MeshTypeIdentifier,
        b: &MeshObjectIdentifier,
    ) -> Result<()> {
        if a == b {
            return Err(Error::CannotRelateToItself(a.clone()));
        }
        let model = self.model();
        let role = model.role_type(role_type)?;
        let inverse = model.inverse_role(role_type)?;
        let first = self.existing(a)?;
        let second = self.existing(b)?;

        for (object, role) in [(&first, role), (&second, inverse)] {
            if let Some(required) = &role.entity_type {
                if !model.satisfies(object.types(), required) {
                    return Err(Error::RoleTypeRequiresEntityType {
                        object: object.identifier().clone(),
                        role_type: role.identifier.clone(),
                        entity_type: required.clone(),
                    });
                }
            }
        }
        if first
            .roles_towards(b)
            .is_some_and(|roles| roles.contains(role_type))
        {
            return Err(Error::BlessedAlready {
                object: a.clone(),
                mesh_type: role_type.clone(),
            });
        }

        if !first.is_related_to(b) {
            self.add_edge_recorded(a, b)?;
            self.add_edge_recorded(b, a)?;
        }
        self.add_roles_recorded(a, b, &RoleSet::from([role_type.clone()]))?;
        self.add_roles_recorded(b, a, &RoleSet::from([inverse.identifier.clone()]))
    }

    /// Remove a role type from the relationship from `a` to `b`
    pub fn unbless_relationship(
        &mut self,
        a: &MeshObjectIdentifier,
        role_type: &MeshTypeIdentifier,
        b: &MeshObjectIdentifier,
    ) -> Result<()> {
        let inverse = self.model().inverse_role(role_type)?.identifier.clone();
        let first = self.existing(a)?;
        let Some(roles) = first.roles_towards(b) else {
            return Err(Error::NotRelated {
                object: a.clone(),
                neighbor: b.clone(),
            });
        };
        if !roles.contains(role_type) {
            return Err(Error::NotBlessed {
                object: a.clone(),
                mesh_type: role_type.clone(),
            });
        }
        self.remove_roles_recorded(a, b, &RoleSet::from([role_type.clone()]))?;
        if self.contains(b)? {
            self.remove_roles_recorded(b, a, &RoleSet::from([inverse]))?;
        }
        Ok(())
    }

    /// Delete a node, removing every relationship local neighbors hold to it
    pub fn delete_mesh_object(&mut self, id: &MeshObjectIdentifier) -> Result<()> {
        self.require_lock(id)?;
        let state = self
            .purge_local(id, None)?
            .map(|removed| removed.into_parts().0);
        self.record(Change::new(id.clone(), ChangeKind::Purged { state }))
    }

    /// Apply a change from elsewhere to this transaction's replica
    pub fn apply_change(
        &mut self,
        change: &Change,
        incoming: Option<&MeshBaseIdentifier>,
    ) -> Result<ApplyOutcome> {
        let base = self.base;
        change.potentially_apply_to_replica_in(base, Some(self), incoming)
    }

    // ---- reassigning replica bookkeeping ----

    pub(crate) fn replica_mut(&mut self, id: &MeshObjectIdentifier) -> Result<&mut ReplicaInfo> {
        Ok(self.existing_mut(id)?.replica_mut())
    }

    // ---- lifecycle ----

    /// Commit: persist, install and propagate
    ///
    /// A full outbound queue towards any receiving partner, or a store
    /// failure, rolls the transaction back and is returned.
    pub fn commit(mut self) -> Result<ChangeSet> {
        self.ensure_active()?;

        let mut ops = Vec::with_capacity(self.dirty.len());
        let mut installed = Vec::with_capacity(self.dirty.len());
        for id in std::mem::take(&mut self.dirty) {
            match self.working.remove(&id).flatten() {
                Some(object) => {
                    ops.push(StoreOp::PutOrUpdate(encode_object(&object)?));
                    installed.push((id, Some(object)));
                }
                None => {
                    if self.base.store().contains(id.as_str())? {
                        ops.push(StoreOp::Delete(id.to_string()));
                    }
                    installed.push((id, None));
                }
            }
        }

        let mut replicas = std::mem::take(&mut self.replica_before);
        for (id, object) in &installed {
            if let Some(object) = object {
                replicas.insert(id.clone(), object.replica().clone());
            }
        }
        let planned = match self.base.plan_propagation(&self.changes, &replicas) {
            Ok(planned) => planned,
            Err(e) => {
                self.rollback_internal(&e.to_string());
                return Err(e);
            }
        };

        if let Err(e) = self.base.store().write_batch(ops) {
            self.rollback_internal(&e.to_string());
            return Err(e);
        }

        self.base.install(installed);
        self.state = TxState::Committed;
        self.base.release_slot(self.id, true);

        let changes = std::mem::take(&mut self.changes);
        tracing::debug!(
            "Committed transaction {} on {} with {} changes",
            self.id,
            self.base.identifier(),
            changes.len()
        );
        self.base.dispatch(planned);
        Ok(changes)
    }

    /// Discard every change made in this transaction
    pub fn rollback(mut self, cause: &str) {
        self.rollback_internal(cause);
    }

    fn rollback_internal(&mut self, cause: &str) {
        if self.state != TxState::Active {
            return;
        }
        self.working.clear();
        self.dirty.clear();
        self.changes = ChangeSet::new();
        self.state = TxState::RolledBack;
        self.base.release_slot(self.id, false);
        tracing::debug!(
            "Rolled back transaction {} on {}: {}",
            self.id,
            self.base.identifier(),
            cause
        );
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.state == TxState::Active {
            self.rollback_internal("dropped while active");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixtures, memory_mesh_base};

    #[test]
    fn test_second_transaction_fails_while_active() {
        let base = memory_mesh_base("MB1");
        let tx = base.begin().unwrap();
        assert!(matches!(
            base.begin(),
            Err(Error::TransactionAlreadyActive(_))
        ));
        tx.rollback("test");
        assert!(base.begin().is_ok());
    }

    #[test]
    fn test_dropping_active_transaction_releases_slot() {
        let base = memory_mesh_base("MB1");
        {
            let mut tx = base.begin().unwrap();
            tx.create_mesh_object("obj1".into()).unwrap();
        }
        assert!(base.find_mesh_object_by_identifier(&"obj1".into()).unwrap().is_none());
        assert!(base.begin().is_ok());
    }

    #[test]
    fn test_bless_and_property_validation() {
        let base = memory_mesh_base("MB1");
        let id = MeshObjectIdentifier::from("obj1");
        let mut tx = base.begin().unwrap();
        tx.create_mesh_object(id.clone()).unwrap();

        assert!(matches!(
            tx.set_property(&id, &fixtures::AA_X.into(), "x"),
            Err(Error::IllegalPropertyType { .. })
        ));
        assert!(matches!(
            tx.bless(&id, &fixtures::ABSTRACT.into()),
            Err(Error::Model(_))
        ));

        tx.bless(&id, &fixtures::BB.into()).unwrap();
        assert!(matches!(
            tx.bless(&id, &fixtures::BB.into()),
            Err(Error::BlessedAlready { .. })
        ));

        // BB inherits AA's properties
        tx.set_property(&id, &fixtures::AA_X.into(), "x").unwrap();
        assert!(matches!(
            tx.set_property(&id, &fixtures::AA_Y.into(), "not a number"),
            Err(Error::IllegalPropertyValue { .. })
        ));
        assert_eq!(
            tx.property(&id, &fixtures::AA_Y.into()).unwrap(),
            Some(PropertyValue::Integer(0))
        );
        tx.commit().unwrap();
    }

    #[test]
    fn test_unbless_clears_properties_first() {
        let base = memory_mesh_base("MB1");
        let id = MeshObjectIdentifier::from("obj1");
        let mut tx = base.begin().unwrap();
        tx.create_mesh_object(id.clone()).unwrap();
        tx.bless(&id, &fixtures::AA.into()).unwrap();
        tx.set_property(&id, &fixtures::AA_X.into(), "hello").unwrap();
        tx.commit().unwrap();

        let mut tx = base.begin().unwrap();
        tx.unbless(&id, &fixtures::AA.into()).unwrap();
        let changes = tx.commit().unwrap();
        let kinds: Vec<_> = changes.iter().map(|c| c.kind().name()).collect();
        assert_eq!(kinds, vec!["PropertyChanged", "TypeRemoved"]);

        let object = base.find_mesh_object_by_identifier(&id).unwrap().unwrap();
        assert!(object.types().is_empty());
        assert!(object.properties().is_empty());
    }

    #[test]
    fn test_relationship_is_symmetric() {
        let base = memory_mesh_base("MB1");
        let (a, b) = (MeshObjectIdentifier::from("a"), MeshObjectIdentifier::from("b"));
        let role = MeshTypeIdentifier::from(fixtures::AR1A_S);

        let mut tx = base.begin().unwrap();
        for id in [&a, &b] {
            tx.create_mesh_object(id.clone()).unwrap();
            tx.bless(id, &fixtures::AA.into()).unwrap();
        }
        tx.bless_relationship(&a, &role, &b).unwrap();
        tx.commit().unwrap();

        let a_obj = base.find_mesh_object_by_identifier(&a).unwrap().unwrap();
        let b_obj = base.find_mesh_object_by_identifier(&b).unwrap().unwrap();
        assert!(a_obj.roles_towards(&b).unwrap().contains(&role));
        assert!(
            b_obj
                .roles_towards(&a)
                .unwrap()
                .contains(&MeshTypeIdentifier::from(fixtures::AR1A_D))
        );

        let mut tx = base.begin().unwrap();
        assert!(matches!(
            tx.unbless(&a, &fixtures::AA.into()),
            Err(Error::RoleTypeRequiresEntityType { .. })
        ));
        tx.unrelate(&a, &b).unwrap();
        assert!(matches!(tx.unrelate(&a, &b), Err(Error::NotRelated { .. })));
        tx.commit().unwrap();

        let a_obj = base.find_mesh_object_by_identifier(&a).unwrap().unwrap();
        let b_obj = base.find_mesh_object_by_identifier(&b).unwrap().unwrap();
        assert!(!a_obj.is_related_to(&b));
        assert!(!b_obj.is_related_to(&a));
    }

    #[test]
    fn test_role_type_requires_entity_type() {
        let base = memory_mesh_base("MB1");
        let (a, b) = (MeshObjectIdentifier::from("a"), MeshObjectIdentifier::from("b"));
        let mut tx = base.begin().unwrap();
        tx.create_mesh_object(a.clone()).unwrap();
        tx.create_mesh_object(b.clone()).unwrap();
        tx.bless(&a, &fixtures::AA.into()).unwrap();

        assert!(matches!(
            tx.bless_relationship(&a, &fixtures::AR1A_S.into(), &b),
            Err(Error::RoleTypeRequiresEntityType { .. })
        ));
        // RR has no entity type requirements
        tx.bless_relationship(&a, &fixtures::RR_S.into(), &b).unwrap();
        assert!(matches!(
            tx.relate(&a, &b),
            Err(Error::RelatedAlready { .. })
        ));
        assert!(matches!(
            tx.relate(&a, &a),
            Err(Error::CannotRelateToItself(_))
        ));
        tx.commit().unwrap();
    }

    #[test]
    fn test_delete_cascades_to_neighbors() {
        let base = memory_mesh_base("MB1");
        let (a, b) = (MeshObjectIdentifier::from("a"), MeshObjectIdentifier::from("b"));
        let mut tx = base.begin().unwrap();
        tx.create_mesh_object(a.clone()).unwrap();
        tx.create_mesh_object(b.clone()).unwrap();
        tx.bless_relationship(&a, &fixtures::RR_S.into(), &b).unwrap();
        tx.commit().unwrap();

        let mut tx = base.begin().unwrap();
        tx.delete_mesh_object(&a).unwrap();
        let changes = tx.commit().unwrap();
        assert_eq!(
            changes.iter().map(|c| c.kind().name()).collect::<Vec<_>>(),
            vec!["RoleRemoved", "NeighborRemoved", "Purged"]
        );

        assert!(base.find_mesh_object_by_identifier(&a).unwrap().is_none());
        let b_obj = base.find_mesh_object_by_identifier(&b).unwrap().unwrap();
        assert!(b_obj.neighbors().is_empty());
    }

    #[test]
    fn test_finished_transaction_rejects_use() {
        let base = memory_mesh_base("MB1");
        let mut tx = base.begin().unwrap();
        tx.rollback_internal("test");
        assert!(matches!(
            tx.create_mesh_object("x".into()),
            Err(Error::Transaction(_))
        ));
    }
}
