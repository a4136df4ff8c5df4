//! Replication tests over the in-process network
//!
//! Covers replica acquisition, relationship changes travelling in every
//! direction without echoing back, lock-authoritative changes travelling
//! only away from the lock, lock and home transfer, replica cancellation
//! and delivery under backpressure.

mod common;

use common::{connect, create_aa, id, init_tracing, mb, network};
use meshnet_core::testing::{fixtures, memory_mesh_base, test_model};
use meshnet_core::{
    Change, ChangeKind, ChangeSet, Error, LocalNetwork, MeshBase, MeshBaseConfig,
    MeshTypeIdentifier, PropertyValue, ProxyMessage, RoleSet,
};
use std::sync::Arc;

#[test]
fn test_obtain_replica_points_towards_source() {
    let (network, bases) = network(&["MB1", "MB2"]);
    connect(&network, "MB1", "MB2");
    let (mb1, mb2) = (&bases[0], &bases[1]);
    create_aa(mb1, &["a"]);

    mb2.obtain_replica(&mb("MB1"), [id("a")]).unwrap();
    assert_eq!(network.pump().unwrap(), 2);

    let replica = mb2.peek(&id("a")).unwrap().unwrap();
    assert!(replica.is_blessed_by(&fixtures::AA.into()));
    assert_eq!(replica.replica().proxy_towards_lock, Some(mb("MB1")));
    assert_eq!(replica.replica().proxy_towards_home, Some(mb("MB1")));
    assert!(!replica.replica().is_lock_owner());

    let original = mb1.peek(&id("a")).unwrap().unwrap();
    assert!(original.replica().is_lock_owner());
    assert!(original.replica().has_replica_towards(&mb("MB2")));
}

#[test]
fn test_relationship_changes_propagate_without_echo() {
    let (network, bases) = network(&["MB1", "MB2"]);
    connect(&network, "MB1", "MB2");
    let (mb1, mb2) = (&bases[0], &bases[1]);
    create_aa(mb1, &["a", "b"]);
    mb2.obtain_replica(&mb("MB1"), [id("a"), id("b")]).unwrap();
    network.pump().unwrap();

    let source = MeshTypeIdentifier::from(fixtures::AR1A_S);
    let destination = MeshTypeIdentifier::from(fixtures::AR1A_D);
    mb1.execute(|tx| tx.bless_relationship(&id("a"), &source, &id("b")))
        .unwrap();
    assert_eq!(network.pump().unwrap(), 1);

    let a = mb2.peek(&id("a")).unwrap().unwrap();
    let b = mb2.peek(&id("b")).unwrap().unwrap();
    assert!(a.roles_towards(&id("b")).unwrap().contains(&source));
    assert!(b.roles_towards(&id("a")).unwrap().contains(&destination));

    // The mirrored halves were reached already by the first halves
    let diagnostics = mb2.diagnostics();
    assert_eq!(diagnostics.changes_applied, 2);
    assert_eq!(diagnostics.changes_tolerated, 2);
    assert_eq!(diagnostics.changes_failed, 0);

    // Nothing came back to MB1
    assert_eq!(mb1.diagnostics().messages_received, 1);

    // Relationship changes do not need the lock
    mb2.execute(|tx| tx.unbless_relationship(&id("a"), &source, &id("b")))
        .unwrap();
    assert_eq!(network.pump().unwrap(), 1);
    let a = mb1.peek(&id("a")).unwrap().unwrap();
    let b = mb1.peek(&id("b")).unwrap().unwrap();
    assert!(a.roles_towards(&id("b")).unwrap().is_empty());
    assert!(b.roles_towards(&id("a")).unwrap().is_empty());
}

#[test]
fn test_purge_travels_away_from_lock() {
    let (network, bases) = network(&["MB1", "MB2"]);
    connect(&network, "MB1", "MB2");
    let (mb1, mb2) = (&bases[0], &bases[1]);
    create_aa(mb1, &["a", "b"]);
    mb1.execute(|tx| tx.bless_relationship(&id("a"), &fixtures::RR_S.into(), &id("b")))
        .unwrap();
    mb2.obtain_replica(&mb("MB1"), [id("a"), id("b")]).unwrap();
    network.pump().unwrap();

    // Deletion needs the lock
    let result = mb2.execute(|tx| tx.delete_mesh_object(&id("a")));
    assert!(matches!(result, Err(Error::NotLockOwner(_))));

    mb1.execute(|tx| tx.delete_mesh_object(&id("a"))).unwrap();
    network.pump().unwrap();

    assert!(mb2.peek(&id("a")).unwrap().is_none());
    let b = mb2.peek(&id("b")).unwrap().unwrap();
    assert!(b.neighbors().is_empty());
    assert_eq!(mb2.diagnostics().changes_failed, 0);
}

#[test]
fn test_purge_from_wrong_direction_is_ignored() {
    let (network, bases) = network(&["MB1", "MB2"]);
    connect(&network, "MB1", "MB2");
    let (mb1, mb2) = (&bases[0], &bases[1]);
    create_aa(mb1, &["a"]);
    mb2.obtain_replica(&mb("MB1"), [id("a")]).unwrap();
    network.pump().unwrap();

    // MB1 holds the lock, so a purge claiming to come from MB2 is ignored
    let forged = ChangeSet::from(vec![Change::new(id("a"), ChangeKind::Purged { state: None })]);
    mb1.receive(&mb("MB2"), ProxyMessage::Changes { changes: forged })
        .unwrap();

    assert!(mb1.peek(&id("a")).unwrap().is_some());
    assert_eq!(mb1.diagnostics().changes_not_from_lock, 1);
}

#[test]
fn test_lock_transfer_moves_authority() {
    let (network, bases) = network(&["MB1", "MB2"]);
    connect(&network, "MB1", "MB2");
    let (mb1, mb2) = (&bases[0], &bases[1]);
    create_aa(mb1, &["a"]);
    mb2.obtain_replica(&mb("MB1"), [id("a")]).unwrap();
    network.pump().unwrap();

    network.transfer_lock(&id("a"), &mb("MB1"), &mb("MB2")).unwrap();
    let owners = bases
        .iter()
        .filter(|base| base.peek(&id("a")).unwrap().unwrap().replica().is_lock_owner())
        .count();
    assert_eq!(owners, 1);

    let result = mb1.execute(|tx| tx.set_property(&id("a"), &fixtures::AA_X.into(), "mb1"));
    assert!(matches!(result, Err(Error::NotLockOwner(_))));

    mb2.execute(|tx| tx.set_property(&id("a"), &fixtures::AA_X.into(), "mb2"))
        .unwrap();
    network.pump().unwrap();
    let a = mb1.peek(&id("a")).unwrap().unwrap();
    assert_eq!(
        a.property(&fixtures::AA_X.into()),
        Some(&PropertyValue::from("mb2"))
    );
}

#[test]
fn test_changes_hop_along_a_chain() {
    let (network, bases) = network(&["MB1", "MB2", "MB3"]);
    connect(&network, "MB1", "MB2");
    connect(&network, "MB2", "MB3");
    let (mb1, mb2, mb3) = (&bases[0], &bases[1], &bases[2]);
    create_aa(mb1, &["a"]);
    mb2.obtain_replica(&mb("MB1"), [id("a")]).unwrap();
    network.pump().unwrap();
    mb3.obtain_replica(&mb("MB2"), [id("a")]).unwrap();
    network.pump().unwrap();

    let middle = mb2.peek(&id("a")).unwrap().unwrap();
    assert!(middle.replica().has_replica_towards(&mb("MB1")));
    assert!(middle.replica().has_replica_towards(&mb("MB3")));

    mb1.execute(|tx| tx.set_property(&id("a"), &fixtures::AA_Y.into(), 42i64))
        .unwrap();
    network.pump().unwrap();

    let far = mb3.peek(&id("a")).unwrap().unwrap();
    assert_eq!(far.replica().proxy_towards_lock, Some(mb("MB2")));
    assert_eq!(
        far.property(&fixtures::AA_Y.into()),
        Some(&PropertyValue::Integer(42))
    );
    // Forwarded by MB2, never sent back
    assert_eq!(mb1.diagnostics().changes_applied, 0);
    assert_eq!(mb3.diagnostics().changes_applied, 1);
}

#[test]
fn test_failed_change_does_not_stop_batch() {
    let (network, bases) = network(&["MB1", "MB2"]);
    connect(&network, "MB1", "MB2");
    let (mb1, mb2) = (&bases[0], &bases[1]);
    create_aa(mb1, &["a"]);
    mb2.obtain_replica(&mb("MB1"), [id("a")]).unwrap();
    network.pump().unwrap();

    let batch = ChangeSet::from(vec![
        // No replica of this node here
        Change::new(
            id("ghost"),
            ChangeKind::PropertyChanged {
                property: fixtures::AA_X.into(),
                old: None,
                new: Some("boo".into()),
            },
        ),
        // Neighbor never replicated here
        Change::new(
            id("a"),
            ChangeKind::RoleRemoved {
                neighbor: id("elsewhere"),
                old: None,
                delta: RoleSet::from([fixtures::RR_S.into()]),
                new: None,
            },
        ),
        Change::new(
            id("a"),
            ChangeKind::PropertyChanged {
                property: fixtures::AA_X.into(),
                old: None,
                new: Some("ok".into()),
            },
        ),
    ]);
    mb2.receive(&mb("MB1"), ProxyMessage::Changes { changes: batch })
        .unwrap();

    let diagnostics = mb2.diagnostics();
    assert_eq!(diagnostics.changes_failed, 1);
    assert_eq!(diagnostics.neighbor_unknown, 1);
    assert_eq!(diagnostics.not_related, 0);
    assert_eq!(diagnostics.changes_applied, 1);

    let a = mb2.peek(&id("a")).unwrap().unwrap();
    assert_eq!(
        a.property(&fixtures::AA_X.into()),
        Some(&PropertyValue::from("ok"))
    );
}

#[test]
fn test_cancel_replica() {
    let (network, bases) = network(&["MB1", "MB2"]);
    connect(&network, "MB1", "MB2");
    let (mb1, mb2) = (&bases[0], &bases[1]);
    create_aa(mb1, &["a"]);
    mb2.obtain_replica(&mb("MB1"), [id("a")]).unwrap();
    network.pump().unwrap();

    mb2.cancel_replica(&id("a")).unwrap();
    assert!(mb2.peek(&id("a")).unwrap().is_none());
    network.pump().unwrap();

    let original = mb1.peek(&id("a")).unwrap().unwrap();
    assert!(original.replica().proxies.is_empty());

    // With no replicas left the purge goes nowhere
    mb1.execute(|tx| tx.delete_mesh_object(&id("a"))).unwrap();
    assert_eq!(network.pump().unwrap(), 0);
}

#[test]
fn test_relationship_reaches_replica_holding_only_one_side() {
    let (network, bases) = network(&["MB1", "MB2", "MB3"]);
    connect(&network, "MB1", "MB2");
    connect(&network, "MB2", "MB3");
    let (mb1, mb2, mb3) = (&bases[0], &bases[1], &bases[2]);
    create_aa(mb1, &["a", "b"]);
    mb2.obtain_replica(&mb("MB1"), [id("a"), id("b")]).unwrap();
    network.pump().unwrap();
    mb3.obtain_replica(&mb("MB2"), [id("b")]).unwrap();
    network.pump().unwrap();

    mb1.execute(|tx| tx.bless_relationship(&id("a"), &fixtures::RR_S.into(), &id("b")))
        .unwrap();
    network.pump().unwrap();

    // MB2 forwards its side of b although MB1 only sent it to MB2
    let destination = MeshTypeIdentifier::from(fixtures::RR_D);
    let middle = mb2.peek(&id("b")).unwrap().unwrap();
    let far = mb3.peek(&id("b")).unwrap().unwrap();
    assert!(far.roles_towards(&id("a")).unwrap().contains(&destination));
    assert_eq!(far.roles_towards(&id("a")), middle.roles_towards(&id("a")));
    assert!(mb3.peek(&id("a")).unwrap().is_none());
    assert_eq!(mb3.diagnostics().changes_failed, 0);

    // Nothing echoed back to the origin
    assert_eq!(mb1.diagnostics().changes_applied, 0);

    mb1.execute(|tx| tx.unbless_relationship(&id("a"), &fixtures::RR_S.into(), &id("b")))
        .unwrap();
    network.pump().unwrap();
    let far = mb3.peek(&id("b")).unwrap().unwrap();
    assert!(far.roles_towards(&id("a")).unwrap().is_empty());
}

#[test]
fn test_busy_receiver_gets_the_message_later() {
    let (network, bases) = network(&["MB1", "MB2"]);
    connect(&network, "MB1", "MB2");
    let (mb1, mb2) = (&bases[0], &bases[1]);
    create_aa(mb1, &["a"]);
    mb2.obtain_replica(&mb("MB1"), [id("a")]).unwrap();
    network.pump().unwrap();

    mb1.execute(|tx| tx.set_property(&id("a"), &fixtures::AA_X.into(), "hello"))
        .unwrap();
    let busy = mb2.begin().unwrap();
    assert!(matches!(
        network.pump(),
        Err(Error::TransactionAlreadyActive(_))
    ));
    busy.rollback("still busy");

    assert_eq!(network.pump().unwrap(), 1);
    let a = mb2.peek(&id("a")).unwrap().unwrap();
    assert_eq!(
        a.property(&fixtures::AA_X.into()),
        Some(&PropertyValue::from("hello"))
    );
}

#[test]
fn test_full_outbound_queue_refuses_commit() {
    init_tracing();
    let network = LocalNetwork::new();
    let mb1 = Arc::new(
        MeshBase::open(
            MeshBaseConfig::new("MB1").with_max_outbound_queue(1),
            test_model(),
        )
        .unwrap(),
    );
    let mb2 = Arc::new(memory_mesh_base("MB2"));
    network.register(mb1.clone()).unwrap();
    network.register(mb2.clone()).unwrap();
    connect(&network, "MB1", "MB2");
    create_aa(&mb1, &["a"]);
    mb2.obtain_replica(&mb("MB1"), [id("a")]).unwrap();
    network.pump().unwrap();

    let property = MeshTypeIdentifier::from(fixtures::AA_X);
    mb1.execute(|tx| tx.set_property(&id("a"), &property, "one"))
        .unwrap();
    let result = mb1.execute(|tx| tx.set_property(&id("a"), &property, "two"));
    assert!(matches!(result, Err(Error::OutboundQueueFull { .. })));
    assert_eq!(mb1.diagnostics().commits_refused, 1);

    // The refused commit left no trace; the queued one is still there
    let a = mb1.peek(&id("a")).unwrap().unwrap();
    assert_eq!(a.property(&property), Some(&PropertyValue::from("one")));
    assert_eq!(network.pump().unwrap(), 1);
    let a = mb2.peek(&id("a")).unwrap().unwrap();
    assert_eq!(a.property(&property), Some(&PropertyValue::from("one")));

    mb1.execute(|tx| tx.set_property(&id("a"), &property, "two"))
        .unwrap();
    network.pump().unwrap();
    let a = mb2.peek(&id("a")).unwrap().unwrap();
    assert_eq!(a.property(&property), Some(&PropertyValue::from("two")));
}

#[test]
fn test_auto_expiry_travels_away_from_lock() {
    let (network, bases) = network(&["MB1", "MB2"]);
    connect(&network, "MB1", "MB2");
    let (mb1, mb2) = (&bases[0], &bases[1]);
    create_aa(mb1, &["a"]);
    mb2.obtain_replica(&mb("MB1"), [id("a")]).unwrap();
    network.pump().unwrap();

    let result = mb2.execute(|tx| tx.set_auto_expires(&id("a"), Some(5_000)));
    assert!(matches!(result, Err(Error::NotLockOwner(_))));

    let changes = mb1
        .execute(|tx| {
            tx.set_auto_expires(&id("a"), Some(5_000))?;
            Ok(tx.changes().clone())
        })
        .unwrap();
    assert_eq!(changes.len(), 1);
    network.pump().unwrap();
    let a = mb2.peek(&id("a")).unwrap().unwrap();
    assert_eq!(a.time_auto_expires(), Some(5_000));

    mb1.execute(|tx| tx.set_auto_expires(&id("a"), None)).unwrap();
    network.pump().unwrap();
    let a = mb2.peek(&id("a")).unwrap().unwrap();
    assert_eq!(a.time_auto_expires(), None);
    assert_eq!(mb2.diagnostics().changes_applied, 2);
}

#[test]
fn test_home_transfer_leaves_lock_in_place() {
    let (network, bases) = network(&["MB1", "MB2"]);
    connect(&network, "MB1", "MB2");
    let (mb1, mb2) = (&bases[0], &bases[1]);
    create_aa(mb1, &["a"]);
    mb2.obtain_replica(&mb("MB1"), [id("a")]).unwrap();
    network.pump().unwrap();

    network.transfer_home(&id("a"), &mb("MB1"), &mb("MB2")).unwrap();
    let homes = bases
        .iter()
        .filter(|base| base.peek(&id("a")).unwrap().unwrap().replica().is_home_replica())
        .count();
    assert_eq!(homes, 1);
    assert!(mb2.peek(&id("a")).unwrap().unwrap().replica().is_home_replica());
    assert_eq!(
        mb1.peek(&id("a")).unwrap().unwrap().replica().proxy_towards_home,
        Some(mb("MB2"))
    );

    // Writes still go through the lock on MB1
    mb1.execute(|tx| tx.set_property(&id("a"), &fixtures::AA_X.into(), "still mine"))
        .unwrap();
    let result = mb2.execute(|tx| tx.set_property(&id("a"), &fixtures::AA_X.into(), "mine"));
    assert!(matches!(result, Err(Error::NotLockOwner(_))));

    // A second transfer from the old home is refused
    assert!(
        network
            .transfer_home(&id("a"), &mb("MB1"), &mb("MB2"))
            .is_err()
    );
}
