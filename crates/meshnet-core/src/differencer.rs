//! Mesh base differencer
//!
//! Computes the change set that turns one mesh base's replicas into
//! another's, and applies such a set. Every difference becomes exactly one
//! typed change. Changes are emitted in four phases, each in identifier
//! order, so equal inputs always produce equal output:
//!
//! 1. entities: purges, creations, type additions, property changes, type
//!    removals
//! 2. graph: neighbor removals, then neighbor additions
//! 3. role additions
//! 4. role removals

use crate::change::{ApplyOutcome, Change, ChangeKind, ChangeSet};
use crate::identifier::MeshObjectIdentifier;
use crate::mesh::{MeshObject, RoleSet};
use crate::meshbase::MeshBase;
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};

/// Compares a baseline mesh base with others
pub struct MeshBaseDifferencer<'a> {
    baseline: &'a MeshBase,
}

type Snapshot = BTreeMap<MeshObjectIdentifier, MeshObject>;

fn snapshot(base: &MeshBase) -> Result<Snapshot> {
    let mut objects = BTreeMap::new();
    for id in base.iter_identifiers()? {
        if let Some(object) = base.peek(&id)? {
            objects.insert(id, object.into_parts().0);
        }
    }
    Ok(objects)
}

impl<'a> MeshBaseDifferencer<'a> {
    /// Differencer against `baseline`
    pub fn new(baseline: &'a MeshBase) -> Self {
        Self { baseline }
    }

    /// Changes that turn the baseline into `comparison`
    pub fn determine_change_set(&self, comparison: &MeshBase) -> Result<ChangeSet> {
        let before = snapshot(self.baseline)?;
        let after = snapshot(comparison)?;
        let mut changes = ChangeSet::new();

        entity_changes(&before, &after, &mut changes);
        graph_changes(&before, &after, &mut changes);
        role_changes(&before, &after, &mut changes);

        tracing::debug!(
            "{} differs from {} by {} changes",
            comparison.identifier(),
            self.baseline.identifier(),
            changes.len()
        );
        Ok(changes)
    }

    /// Apply `changes` to the baseline in one transaction
    ///
    /// Changes whose target state is reached already are skipped. Returns
    /// the number of changes applied.
    pub fn apply_change_set(&self, changes: &ChangeSet) -> Result<usize> {
        self.baseline.execute(|tx| {
            let mut applied = 0;
            for change in changes {
                match tx.apply_change(change, None)? {
                    ApplyOutcome::Applied(_) | ApplyOutcome::Purged(_) => applied += 1,
                    ApplyOutcome::Tolerated { .. } => {}
                    ApplyOutcome::NotFromLock(_) => {
                        return Err(Error::NotLockOwner(change.affected().clone()));
                    }
                }
            }
            Ok(applied)
        })
    }
}

fn entity_changes(before: &Snapshot, after: &Snapshot, changes: &mut ChangeSet) {
    let ids: BTreeSet<_> = before.keys().chain(after.keys()).collect();
    for id in ids {
        match (before.get(id), after.get(id)) {
            (Some(old), None) => changes.push(Change::new(
                id.clone(),
                ChangeKind::Purged {
                    state: Some(old.clone()),
                },
            )),
            (None, Some(new)) => {
                let bare = new.bare();
                changes.push(Change::new(id.clone(), ChangeKind::Created { state: bare.clone() }));
                object_changes(&bare, new, changes);
            }
            (Some(old), Some(new)) => object_changes(old, new, changes),
            (None, None) => {}
        }
    }
}

fn object_changes(old: &MeshObject, new: &MeshObject, changes: &mut ChangeSet) {
    let id = new.identifier();

    let added: BTreeSet<_> = new.types().difference(old.types()).cloned().collect();
    if !added.is_empty() {
        let mut with_added = old.types().clone();
        with_added.extend(added.iter().cloned());
        changes.push(Change::new(
            id.clone(),
            ChangeKind::TypeAdded {
                old: Some(old.types().clone()),
                delta: added,
                new: Some(with_added),
            },
        ));
    }

    let properties: BTreeSet<_> = old
        .properties()
        .keys()
        .chain(new.properties().keys())
        .collect();
    for property in properties {
        let (was, is) = (old.property(property), new.property(property));
        if was != is {
            changes.push(Change::new(
                id.clone(),
                ChangeKind::PropertyChanged {
                    property: property.clone(),
                    old: was.cloned(),
                    new: is.cloned(),
                },
            ));
        }
    }

    if old.time_auto_expires() != new.time_auto_expires() {
        changes.push(Change::new(
            id.clone(),
            ChangeKind::AutoExpiresChanged {
                old: old.time_auto_expires(),
                new: new.time_auto_expires(),
            },
        ));
    }

    let removed: BTreeSet<_> = old.types().difference(new.types()).cloned().collect();
    if !removed.is_empty() {
        let mut union = old.types().clone();
        union.extend(new.types().iter().cloned());
        changes.push(Change::new(
            id.clone(),
            ChangeKind::TypeRemoved {
                old: Some(union),
                delta: removed,
                new: Some(new.types().clone()),
            },
        ));
    }
}

fn graph_changes(before: &Snapshot, after: &Snapshot, changes: &mut ChangeSet) {
    // Purges remove their edges themselves
    let purged = |id: &MeshObjectIdentifier| before.contains_key(id) && !after.contains_key(id);

    for (id, old) in before {
        let Some(new) = after.get(id) else {
            continue;
        };
        let mut current = old.neighbor_identifiers();
        for (neighbor, roles) in old.neighbors() {
            if new.is_related_to(neighbor) || purged(neighbor) {
                continue;
            }
            let previous = current.clone();
            current.remove(neighbor);
            changes.push(Change::new(
                id.clone(),
                ChangeKind::NeighborRemoved {
                    neighbor: neighbor.clone(),
                    role_types: roles.clone(),
                    old_neighbors: Some(previous),
                    new_neighbors: Some(current.clone()),
                },
            ));
        }
    }

    for (id, new) in after {
        let old = before.get(id);
        let mut current: BTreeSet<_> = new
            .neighbor_identifiers()
            .into_iter()
            .filter(|n| old.is_some_and(|o| o.is_related_to(n)))
            .collect();
        for (neighbor, roles) in new.neighbors() {
            if old.is_some_and(|o| o.is_related_to(neighbor)) {
                continue;
            }
            let previous = current.clone();
            current.insert(neighbor.clone());
            changes.push(Change::new(
                id.clone(),
                ChangeKind::NeighborAdded {
                    neighbor: neighbor.clone(),
                    role_types: roles.clone(),
                    old_neighbors: Some(previous),
                    new_neighbors: Some(current.clone()),
                },
            ));
        }
    }
}

/// Role types of edges present on both sides, additions first
fn role_changes(before: &Snapshot, after: &Snapshot, changes: &mut ChangeSet) {
    let mut removals = Vec::new();
    for (id, old) in before {
        let Some(new) = after.get(id) else {
            continue;
        };
        for (neighbor, old_roles) in old.neighbors() {
            let Some(new_roles) = new.roles_towards(neighbor) else {
                continue;
            };
            let added: RoleSet = new_roles.difference(old_roles).cloned().collect();
            let removed: RoleSet = old_roles.difference(new_roles).cloned().collect();
            let mut current = old_roles.clone();
            if !added.is_empty() {
                current.extend(added.iter().cloned());
                changes.push(Change::new(
                    id.clone(),
                    ChangeKind::RoleAdded {
                        neighbor: neighbor.clone(),
                        old: Some(old_roles.clone()),
                        delta: added,
                        new: Some(current.clone()),
                    },
                ));
            }
            if !removed.is_empty() {
                removals.push(Change::new(
                    id.clone(),
                    ChangeKind::RoleRemoved {
                        neighbor: neighbor.clone(),
                        old: Some(current),
                        delta: removed,
                        new: Some(new_roles.clone()),
                    },
                ));
            }
        }
    }
    for change in removals {
        changes.push(change);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::MeshTypeIdentifier;
    use crate::model::PropertyValue;
    use crate::testing::{fixtures, memory_mesh_base};

    fn ids(names: &[&str]) -> Vec<MeshObjectIdentifier> {
        names.iter().map(|n| MeshObjectIdentifier::from(*n)).collect()
    }

    #[test]
    fn test_identical_bases_have_no_difference() {
        let (one, two) = (memory_mesh_base("MB1"), memory_mesh_base("MB2"));
        for base in [&one, &two] {
            base.execute(|tx| {
                tx.create_mesh_object("a".into())?;
                tx.bless(&"a".into(), &fixtures::AA.into())
            })
            .unwrap();
        }
        let changes = MeshBaseDifferencer::new(&one)
            .determine_change_set(&two)
            .unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn test_phases_are_ordered() {
        let baseline = memory_mesh_base("MB1");
        let comparison = memory_mesh_base("MB2");
        let [a, b, c] = <[MeshObjectIdentifier; 3]>::try_from(ids(&["a", "b", "c"])).unwrap();

        baseline
            .execute(|tx| {
                tx.create_mesh_object(a.clone())?;
                tx.create_mesh_object(c.clone())?;
                tx.relate(&a, &c)
            })
            .unwrap();
        comparison
            .execute(|tx| {
                tx.create_mesh_object(a.clone())?;
                tx.create_mesh_object(b.clone())?;
                tx.bless(&b, &fixtures::AA.into())?;
                tx.set_property(&b, &fixtures::AA_X.into(), "hello")?;
                tx.bless_relationship(&a, &fixtures::RR_S.into(), &b)
            })
            .unwrap();

        let changes = MeshBaseDifferencer::new(&baseline)
            .determine_change_set(&comparison)
            .unwrap();
        let kinds: Vec<_> = changes
            .iter()
            .map(|c| (c.kind().name(), c.affected().to_string()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("Created", "b".to_string()),
                ("TypeAdded", "b".to_string()),
                ("PropertyChanged", "b".to_string()),
                ("Purged", "c".to_string()),
                ("NeighborAdded", "a".to_string()),
                ("NeighborAdded", "b".to_string()),
            ]
        );
    }

    #[test]
    fn test_applying_difference_converges() {
        let baseline = memory_mesh_base("MB1");
        let comparison = memory_mesh_base("MB2");
        let [a, b, c] = <[MeshObjectIdentifier; 3]>::try_from(ids(&["a", "b", "c"])).unwrap();
        let ar1a = MeshTypeIdentifier::from(fixtures::AR1A_S);

        baseline
            .execute(|tx| {
                for id in [&a, &b, &c] {
                    tx.create_mesh_object(id.clone())?;
                    tx.bless(id, &fixtures::AA.into())?;
                }
                tx.set_property(&a, &fixtures::AA_X.into(), "old")?;
                tx.bless_relationship(&a, &ar1a, &b)?;
                tx.relate(&b, &c)
            })
            .unwrap();
        comparison
            .execute(|tx| {
                for id in [&a, &b] {
                    tx.create_mesh_object(id.clone())?;
                }
                tx.bless(&a, &fixtures::BB.into())?;
                tx.set_property(&a, &fixtures::AA_Y.into(), PropertyValue::Integer(7))?;
                tx.bless(&b, &fixtures::AA.into())?;
                tx.bless_relationship(&a, &fixtures::RR_S.into(), &b)
            })
            .unwrap();

        let differencer = MeshBaseDifferencer::new(&baseline);
        let changes = differencer.determine_change_set(&comparison).unwrap();
        assert!(differencer.apply_change_set(&changes).unwrap() > 0);

        assert_eq!(baseline.iter_identifiers().unwrap(), ids(&["a", "b"]));
        for id in [&a, &b] {
            let ours = baseline.peek(id).unwrap().unwrap();
            let theirs = comparison.peek(id).unwrap().unwrap();
            assert!(ours.content_eq(&theirs), "{} differs: {:?} vs {:?}", id, ours, theirs);
        }
        assert!(
            differencer
                .determine_change_set(&comparison)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_expiry_difference_is_carried() {
        let baseline = memory_mesh_base("MB1");
        let comparison = memory_mesh_base("MB2");
        let a = MeshObjectIdentifier::from("a");
        baseline
            .execute(|tx| tx.create_mesh_object(a.clone()).map(|_| ()))
            .unwrap();
        comparison
            .execute(|tx| {
                tx.create_mesh_object(a.clone())?;
                tx.set_auto_expires(&a, Some(500))
            })
            .unwrap();

        let differencer = MeshBaseDifferencer::new(&baseline);
        let changes = differencer.determine_change_set(&comparison).unwrap();
        let names: Vec<_> = changes.iter().map(|c| c.kind().name()).collect();
        assert_eq!(names, vec!["AutoExpiresChanged"]);

        differencer.apply_change_set(&changes).unwrap();
        let ours = baseline.peek(&a).unwrap().unwrap();
        assert_eq!(ours.time_auto_expires(), Some(500));
    }
}
