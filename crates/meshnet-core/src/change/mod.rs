//! Change events
//!
//! Every mutation of a mesh base is captured as a [`Change`]: the affected
//! node, one [`ChangeKind`] carrying exactly the old/delta/new values that
//! kind needs, the mesh base the change arrived from (if any) and the time
//! it occurred. Changes are immutable once built.
//!
//! Three operations are defined over all kinds:
//! - [`Change::inverse`]: the compensating change, if enough was captured
//! - [`Change::potentially_apply_to_replica_in`]: re-apply to another replica
//! - [`Change::should_be_sent`]: forwarding decision for one outgoing proxy

mod apply;

pub use apply::{ApplyOutcome, Tolerance};

use crate::clock::now_millis;
use crate::identifier::{MeshBaseIdentifier, MeshObjectIdentifier, MeshTypeIdentifier};
use crate::mesh::{MeshObject, ReplicaInfo, RoleSet};
use crate::model::PropertyValue;
use crate::propagation;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Set of neighbor identifiers
pub type NeighborSet = BTreeSet<MeshObjectIdentifier>;

/// Set of entity type identifiers
pub type TypeSet = BTreeSet<MeshTypeIdentifier>;

/// What changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// Node was created with this state
    Created {
        /// Full state at creation
        state: MeshObject,
    },

    /// Node became dead and was purged
    Purged {
        /// State just before the purge; needed to invert
        state: Option<MeshObject>,
    },

    /// Relationship to a neighbor was added
    NeighborAdded {
        /// New neighbor
        neighbor: MeshObjectIdentifier,
        /// Roles played towards the neighbor from the start
        role_types: RoleSet,
        /// Neighbors before
        old_neighbors: Option<NeighborSet>,
        /// Neighbors after
        new_neighbors: Option<NeighborSet>,
    },

    /// Relationship to a neighbor was removed
    NeighborRemoved {
        /// Former neighbor
        neighbor: MeshObjectIdentifier,
        /// Roles played towards the neighbor at removal
        role_types: RoleSet,
        /// Neighbors before
        old_neighbors: Option<NeighborSet>,
        /// Neighbors after
        new_neighbors: Option<NeighborSet>,
    },

    /// Role types towards a neighbor were added
    RoleAdded {
        /// Neighbor
        neighbor: MeshObjectIdentifier,
        /// Roles before
        old: Option<RoleSet>,
        /// Added roles
        delta: RoleSet,
        /// Roles after
        new: Option<RoleSet>,
    },

    /// Role types towards a neighbor were removed
    RoleRemoved {
        /// Neighbor
        neighbor: MeshObjectIdentifier,
        /// Roles before
        old: Option<RoleSet>,
        /// Removed roles
        delta: RoleSet,
        /// Roles after
        new: Option<RoleSet>,
    },

    /// Entity types were blessed
    TypeAdded {
        /// Types before
        old: Option<TypeSet>,
        /// Added types
        delta: TypeSet,
        /// Types after
        new: Option<TypeSet>,
    },

    /// Entity types were unblessed
    TypeRemoved {
        /// Types before
        old: Option<TypeSet>,
        /// Removed types
        delta: TypeSet,
        /// Types after
        new: Option<TypeSet>,
    },

    /// A property value changed; `None` means unset
    PropertyChanged {
        /// Property type
        property: MeshTypeIdentifier,
        /// Value before
        old: Option<PropertyValue>,
        /// Value after
        new: Option<PropertyValue>,
    },

    /// The automatic expiry was set or cleared; `None` means never
    AutoExpiresChanged {
        /// Expiry before
        old: Option<i64>,
        /// Expiry after
        new: Option<i64>,
    },
}

impl ChangeKind {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Created { .. } => "Created",
            Self::Purged { .. } => "Purged",
            Self::NeighborAdded { .. } => "NeighborAdded",
            Self::NeighborRemoved { .. } => "NeighborRemoved",
            Self::RoleAdded { .. } => "RoleAdded",
            Self::RoleRemoved { .. } => "RoleRemoved",
            Self::TypeAdded { .. } => "TypeAdded",
            Self::TypeRemoved { .. } => "TypeRemoved",
            Self::PropertyChanged { .. } => "PropertyChanged",
            Self::AutoExpiresChanged { .. } => "AutoExpiresChanged",
        }
    }

    /// Whether only the lock holder may originate this kind of change
    ///
    /// Lock-authoritative changes flow outward from the lock; all others
    /// are peer-symmetric.
    pub fn is_lock_authoritative(&self) -> bool {
        matches!(
            self,
            Self::Purged { .. }
                | Self::TypeAdded { .. }
                | Self::TypeRemoved { .. }
                | Self::PropertyChanged { .. }
                | Self::AutoExpiresChanged { .. }
        )
    }

    /// The other node touched by a relationship change
    pub fn neighbor(&self) -> Option<&MeshObjectIdentifier> {
        match self {
            Self::NeighborAdded { neighbor, .. }
            | Self::NeighborRemoved { neighbor, .. }
            | Self::RoleAdded { neighbor, .. }
            | Self::RoleRemoved { neighbor, .. } => Some(neighbor),
            _ => None,
        }
    }

    fn inverse(&self) -> Option<Self> {
        let inverse = match self {
            Self::Created { state } => Self::Purged {
                state: Some(state.clone()),
            },
            Self::Purged { state } => Self::Created {
                state: state.clone()?,
            },
            Self::NeighborAdded {
                neighbor,
                role_types,
                old_neighbors,
                new_neighbors,
            } => Self::NeighborRemoved {
                neighbor: neighbor.clone(),
                role_types: role_types.clone(),
                old_neighbors: Some(new_neighbors.clone()?),
                new_neighbors: Some(old_neighbors.clone()?),
            },
            Self::NeighborRemoved {
                neighbor,
                role_types,
                old_neighbors,
                new_neighbors,
            } => Self::NeighborAdded {
                neighbor: neighbor.clone(),
                role_types: role_types.clone(),
                old_neighbors: Some(new_neighbors.clone()?),
                new_neighbors: Some(old_neighbors.clone()?),
            },
            Self::RoleAdded {
                neighbor,
                old,
                delta,
                new,
            } => Self::RoleRemoved {
                neighbor: neighbor.clone(),
                old: Some(new.clone()?),
                delta: delta.clone(),
                new: Some(old.clone()?),
            },
            Self::RoleRemoved {
                neighbor,
                old,
                delta,
                new,
            } => Self::RoleAdded {
                neighbor: neighbor.clone(),
                old: Some(new.clone()?),
                delta: delta.clone(),
                new: Some(old.clone()?),
            },
            Self::TypeAdded { old, delta, new } => Self::TypeRemoved {
                old: Some(new.clone()?),
                delta: delta.clone(),
                new: Some(old.clone()?),
            },
            Self::TypeRemoved { old, delta, new } => Self::TypeAdded {
                old: Some(new.clone()?),
                delta: delta.clone(),
                new: Some(old.clone()?),
            },
            Self::PropertyChanged { property, old, new } => Self::PropertyChanged {
                property: property.clone(),
                old: new.clone(),
                new: old.clone(),
            },
            Self::AutoExpiresChanged { old, new } => Self::AutoExpiresChanged {
                old: *new,
                new: *old,
            },
        };
        Some(inverse)
    }
}

/// One immutable change event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    affected: MeshObjectIdentifier,
    kind: ChangeKind,
    origin: Option<MeshBaseIdentifier>,
    time_event_occurred: i64,
}

impl Change {
    /// A locally originated change, occurring now
    pub fn new(affected: MeshObjectIdentifier, kind: ChangeKind) -> Self {
        Self::at(affected, kind, now_millis())
    }

    /// A locally originated change with an explicit event time
    pub fn at(affected: MeshObjectIdentifier, kind: ChangeKind, time_event_occurred: i64) -> Self {
        Self {
            affected,
            kind,
            origin: None,
            time_event_occurred,
        }
    }

    /// The same change, as having arrived from `origin`
    pub fn with_origin(mut self, origin: Option<MeshBaseIdentifier>) -> Self {
        self.origin = origin;
        self
    }

    /// Identifier of the affected node
    pub fn affected(&self) -> &MeshObjectIdentifier {
        &self.affected
    }

    /// What changed
    pub fn kind(&self) -> &ChangeKind {
        &self.kind
    }

    /// Mesh base the change arrived from; `None` if originated locally
    pub fn origin(&self) -> Option<&MeshBaseIdentifier> {
        self.origin.as_ref()
    }

    /// When the change occurred
    pub fn time_event_occurred(&self) -> i64 {
        self.time_event_occurred
    }

    /// Whether only the lock holder may originate this change
    pub fn is_lock_authoritative(&self) -> bool {
        self.kind.is_lock_authoritative()
    }

    /// The compensating change
    ///
    /// Returns `None` when the old or new value was never captured. A
    /// missing inverse means the change cannot be undone.
    pub fn inverse(&self) -> Option<Change> {
        Some(Change::new(self.affected.clone(), self.kind.inverse()?))
    }

    /// Whether this change must be forwarded to `proxy`
    ///
    /// `replica` is the affected node's replica bookkeeping at the time
    /// the change was committed.
    pub fn should_be_sent(&self, replica: &ReplicaInfo, proxy: &MeshBaseIdentifier) -> bool {
        propagation::should_be_sent(self, replica, proxy)
    }
}

/// Ordered set of changes from one transaction or one diff
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    changes: Vec<Change>,
}

impl ChangeSet {
    /// Empty change set
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a change
    pub fn push(&mut self, change: Change) {
        self.changes.push(change);
    }

    /// Changes in order
    pub fn iter(&self) -> std::slice::Iter<'_, Change> {
        self.changes.iter()
    }

    /// Number of changes
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Whether there are no changes
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Changes as a slice
    pub fn as_slice(&self) -> &[Change] {
        &self.changes
    }

    /// Identifiers of all affected nodes
    pub fn affected(&self) -> BTreeSet<MeshObjectIdentifier> {
        self.changes.iter().map(|c| c.affected.clone()).collect()
    }

    /// The inverse of every change, in reverse order
    ///
    /// Returns `None` if any member cannot be inverted.
    pub fn inverse(&self) -> Option<ChangeSet> {
        let changes = self
            .changes
            .iter()
            .rev()
            .map(Change::inverse)
            .collect::<Option<Vec<_>>>()?;
        Some(Self { changes })
    }
}

impl From<Vec<Change>> for ChangeSet {
    fn from(changes: Vec<Change>) -> Self {
        Self { changes }
    }
}

impl IntoIterator for ChangeSet {
    type Item = Change;
    type IntoIter = std::vec::IntoIter<Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.into_iter()
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = &'a Change;
    type IntoIter = std::slice::Iter<'a, Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::MeshObjectTimes;

    fn id(s: &str) -> MeshObjectIdentifier {
        MeshObjectIdentifier::from(s)
    }

    fn roles(names: &[&str]) -> RoleSet {
        names.iter().map(|n| MeshTypeIdentifier::from(*n)).collect()
    }

    #[test]
    fn test_role_added_inverse_swaps_old_and_new() {
        let change = Change::new(
            id("a"),
            ChangeKind::RoleAdded {
                neighbor: id("b"),
                old: Some(roles(&[])),
                delta: roles(&["test/R-S"]),
                new: Some(roles(&["test/R-S"])),
            },
        );
        let inverse = change.inverse().unwrap();
        assert_eq!(
            inverse.kind(),
            &ChangeKind::RoleRemoved {
                neighbor: id("b"),
                old: Some(roles(&["test/R-S"])),
                delta: roles(&["test/R-S"]),
                new: Some(roles(&[])),
            }
        );
        assert_eq!(inverse.inverse().unwrap().kind(), change.kind());
    }

    #[test]
    fn test_delta_only_change_has_no_inverse() {
        let change = Change::new(
            id("a"),
            ChangeKind::RoleRemoved {
                neighbor: id("b"),
                old: None,
                delta: roles(&["test/R-S"]),
                new: None,
            },
        );
        assert!(change.inverse().is_none());

        let purged = Change::new(id("a"), ChangeKind::Purged { state: None });
        assert!(purged.inverse().is_none());

        let set = ChangeSet::from(vec![purged]);
        assert!(set.inverse().is_none());
    }

    #[test]
    fn test_auto_expires_inverse_restores_never() {
        let change = Change::new(
            id("a"),
            ChangeKind::AutoExpiresChanged {
                old: None,
                new: Some(500),
            },
        );
        assert_eq!(
            change.inverse().unwrap().kind(),
            &ChangeKind::AutoExpiresChanged {
                old: Some(500),
                new: None
            }
        );
    }

    #[test]
    fn test_created_and_purged_are_inverses() {
        let state = MeshObject::new(id("a"), MeshObjectTimes::at(5));
        let created = Change::new(id("a"), ChangeKind::Created { state: state.clone() });
        let purged = created.inverse().unwrap();
        assert_eq!(purged.kind(), &ChangeKind::Purged { state: Some(state) });
        assert_eq!(purged.inverse().unwrap().kind(), created.kind());
    }

    #[test]
    fn test_change_set_inverse_reverses_order() {
        let set = ChangeSet::from(vec![
            Change::new(
                id("a"),
                ChangeKind::PropertyChanged {
                    property: "test/X".into(),
                    old: None,
                    new: Some("one".into()),
                },
            ),
            Change::new(
                id("b"),
                ChangeKind::PropertyChanged {
                    property: "test/X".into(),
                    old: None,
                    new: Some("two".into()),
                },
            ),
        ]);
        let inverse = set.inverse().unwrap();
        assert_eq!(inverse.len(), 2);
        assert_eq!(inverse.as_slice()[0].affected(), &id("b"));
        assert_eq!(inverse.as_slice()[1].affected(), &id("a"));
    }

    #[test]
    fn test_lock_authoritative_kinds() {
        assert!(ChangeKind::Purged { state: None }.is_lock_authoritative());
        assert!(
            ChangeKind::AutoExpiresChanged {
                old: None,
                new: Some(10)
            }
            .is_lock_authoritative()
        );
        assert!(
            ChangeKind::PropertyChanged {
                property: "test/X".into(),
                old: None,
                new: None
            }
            .is_lock_authoritative()
        );
        assert!(
            !ChangeKind::RoleRemoved {
                neighbor: id("b"),
                old: None,
                delta: RoleSet::new(),
                new: None
            }
            .is_lock_authoritative()
        );
    }
}
