//! Mesh object state
//!
//! A [`MeshObject`] is plain node state: identity, timestamps, blessings,
//! property values and the relationship adjacency keyed by neighbor
//! identifier. A [`NetMeshObject`] adds the replica bookkeeping of one
//! mesh base's copy of that node.

use crate::identifier::{MeshBaseIdentifier, MeshObjectIdentifier, MeshTypeIdentifier};
use crate::model::PropertyValue;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Deref;

/// Set of role types played towards one neighbor
pub type RoleSet = BTreeSet<MeshTypeIdentifier>;

/// Timestamps of a mesh object, in milliseconds since the epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshObjectTimes {
    /// Creation time
    pub created: i64,
    /// Last update
    pub updated: i64,
    /// Last read
    pub read: i64,
    /// Automatic expiry, if any
    pub auto_expires: Option<i64>,
}

impl MeshObjectTimes {
    /// All timestamps set to `now`, never expiring
    pub fn at(now: i64) -> Self {
        Self {
            created: now,
            updated: now,
            read: now,
            auto_expires: None,
        }
    }

    /// Set the expiry
    pub fn with_auto_expires(mut self, expires: i64) -> Self {
        self.auto_expires = Some(expires);
        self
    }
}

/// State of one graph node
///
/// This is also the externalized form: it is what gets persisted and what
/// travels between mesh bases when a replica is granted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshObject {
    identifier: MeshObjectIdentifier,
    times: MeshObjectTimes,
    types: BTreeSet<MeshTypeIdentifier>,
    properties: BTreeMap<MeshTypeIdentifier, PropertyValue>,
    neighbors: BTreeMap<MeshObjectIdentifier, RoleSet>,
}

impl MeshObject {
    /// A new, unblessed and unrelated node
    pub fn new(identifier: MeshObjectIdentifier, times: MeshObjectTimes) -> Self {
        Self {
            identifier,
            times,
            types: BTreeSet::new(),
            properties: BTreeMap::new(),
            neighbors: BTreeMap::new(),
        }
    }

    /// Identifier
    pub fn identifier(&self) -> &MeshObjectIdentifier {
        &self.identifier
    }

    /// All timestamps
    pub fn times(&self) -> MeshObjectTimes {
        self.times
    }

    /// Creation time
    pub fn time_created(&self) -> i64 {
        self.times.created
    }

    /// Last update time
    pub fn time_updated(&self) -> i64 {
        self.times.updated
    }

    /// Last read time
    pub fn time_read(&self) -> i64 {
        self.times.read
    }

    /// Automatic expiry time, if any
    pub fn time_auto_expires(&self) -> Option<i64> {
        self.times.auto_expires
    }

    /// Entity types this node is blessed with
    pub fn types(&self) -> &BTreeSet<MeshTypeIdentifier> {
        &self.types
    }

    /// Whether the node carries exactly this entity type
    pub fn is_blessed_by(&self, entity_type: &MeshTypeIdentifier) -> bool {
        self.types.contains(entity_type)
    }

    /// Explicitly set property values
    pub fn properties(&self) -> &BTreeMap<MeshTypeIdentifier, PropertyValue> {
        &self.properties
    }

    /// Explicitly set value of a property
    pub fn property(&self, property: &MeshTypeIdentifier) -> Option<&PropertyValue> {
        self.properties.get(property)
    }

    /// Relationship adjacency: neighbor to the role types played towards it
    pub fn neighbors(&self) -> &BTreeMap<MeshObjectIdentifier, RoleSet> {
        &self.neighbors
    }

    /// Identifiers of all neighbors
    pub fn neighbor_identifiers(&self) -> BTreeSet<MeshObjectIdentifier> {
        self.neighbors.keys().cloned().collect()
    }

    /// Whether the node is related to `neighbor`
    pub fn is_related_to(&self, neighbor: &MeshObjectIdentifier) -> bool {
        self.neighbors.contains_key(neighbor)
    }

    /// Role types played towards `neighbor`, if related
    pub fn roles_towards(&self, neighbor: &MeshObjectIdentifier) -> Option<&RoleSet> {
        self.neighbors.get(neighbor)
    }

    /// Compare node content, ignoring timestamps
    pub fn content_eq(&self, other: &MeshObject) -> bool {
        self.identifier == other.identifier
            && self.types == other.types
            && self.properties == other.properties
            && self.neighbors == other.neighbors
    }

    /// Copy with identity and timestamps only
    pub(crate) fn bare(&self) -> Self {
        Self::new(self.identifier.clone(), self.times)
    }

    pub(crate) fn set_time_updated(&mut self, time: i64) {
        self.times.updated = time;
    }

    pub(crate) fn set_time_read(&mut self, time: i64) {
        self.times.read = time;
    }

    pub(crate) fn set_time_auto_expires(&mut self, time: Option<i64>) {
        self.times.auto_expires = time;
    }

    pub(crate) fn types_mut(&mut self) -> &mut BTreeSet<MeshTypeIdentifier> {
        &mut self.types
    }

    /// Set or clear a property, returning the previous value
    pub(crate) fn put_property(
        &mut self,
        property: &MeshTypeIdentifier,
        value: Option<PropertyValue>,
    ) -> Option<PropertyValue> {
        match value {
            Some(value) => self.properties.insert(property.clone(), value),
            None => self.properties.remove(property),
        }
    }

    /// Add an edge towards `neighbor`; returns false if it existed
    pub(crate) fn add_neighbor(&mut self, neighbor: &MeshObjectIdentifier) -> bool {
        if self.neighbors.contains_key(neighbor) {
            return false;
        }
        self.neighbors.insert(neighbor.clone(), RoleSet::new());
        true
    }

    /// Remove the edge towards `neighbor` with all its roles
    pub(crate) fn remove_neighbor(&mut self, neighbor: &MeshObjectIdentifier) -> Option<RoleSet> {
        self.neighbors.remove(neighbor)
    }

    /// Add roles towards an existing neighbor; returns the roles actually added
    pub(crate) fn add_roles(&mut self, neighbor: &MeshObjectIdentifier, roles: &RoleSet) -> RoleSet {
        let Some(current) = self.neighbors.get_mut(neighbor) else {
            return RoleSet::new();
        };
        roles
            .iter()
            .filter(|role| current.insert((*role).clone()))
            .cloned()
            .collect()
    }

    /// Remove roles towards a neighbor; returns the roles actually removed
    pub(crate) fn remove_roles(
        &mut self,
        neighbor: &MeshObjectIdentifier,
        roles: &RoleSet,
    ) -> RoleSet {
        let Some(current) = self.neighbors.get_mut(neighbor) else {
            return RoleSet::new();
        };
        roles
            .iter()
            .filter(|role| current.remove(*role))
            .cloned()
            .collect()
    }
}

/// Replica bookkeeping of one mesh base's copy of a node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    /// Partners holding other replicas, adjacent to this one
    pub proxies: BTreeSet<MeshBaseIdentifier>,
    /// Partner in the direction of the lock; `None` means this replica holds it
    pub proxy_towards_lock: Option<MeshBaseIdentifier>,
    /// Partner in the direction of home; `None` means this replica is home
    pub proxy_towards_home: Option<MeshBaseIdentifier>,
}

impl ReplicaInfo {
    /// Bookkeeping for a replica obtained from `partner`
    pub fn obtained_from(partner: &MeshBaseIdentifier) -> Self {
        Self {
            proxies: BTreeSet::from([partner.clone()]),
            proxy_towards_lock: Some(partner.clone()),
            proxy_towards_home: Some(partner.clone()),
        }
    }

    /// Whether this replica holds the lock
    pub fn is_lock_owner(&self) -> bool {
        self.proxy_towards_lock.is_none()
    }

    /// Whether this replica is the home replica
    pub fn is_home_replica(&self) -> bool {
        self.proxy_towards_home.is_none()
    }

    /// Whether there is a replica in the direction of `partner`
    pub fn has_replica_towards(&self, partner: &MeshBaseIdentifier) -> bool {
        self.proxies.contains(partner)
    }
}

/// One mesh base's replica of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetMeshObject {
    object: MeshObject,
    replica: ReplicaInfo,
}

impl NetMeshObject {
    /// Combine node state and replica bookkeeping
    pub fn new(object: MeshObject, replica: ReplicaInfo) -> Self {
        Self { object, replica }
    }

    /// Node state
    pub fn object(&self) -> &MeshObject {
        &self.object
    }

    /// Replica bookkeeping
    pub fn replica(&self) -> &ReplicaInfo {
        &self.replica
    }

    pub(crate) fn object_mut(&mut self) -> &mut MeshObject {
        &mut self.object
    }

    pub(crate) fn replica_mut(&mut self) -> &mut ReplicaInfo {
        &mut self.replica
    }

    /// Split into node state and replica bookkeeping
    pub fn into_parts(self) -> (MeshObject, ReplicaInfo) {
        (self.object, self.replica)
    }
}

impl Deref for NetMeshObject {
    type Target = MeshObject;

    fn deref(&self) -> &MeshObject {
        &self.object
    }
}
