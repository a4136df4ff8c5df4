//! Sweeper tests: background task lifecycle and evictions seen by replicas

mod common;

use common::{connect, id, mb, network};
use meshnet_core::clock::now_millis;
use meshnet_core::testing::{fixtures, memory_mesh_base};
use meshnet_core::{ExpiresSweepPolicy, MeshBase, MeshObjectTimes, Sweeper};
use std::sync::Arc;
use std::time::Duration;

fn create_expiring(base: &MeshBase) {
    base.execute(|tx| {
        tx.create_mesh_object_with(id("a"), MeshObjectTimes::at(0).with_auto_expires(10))?;
        tx.create_mesh_object(id("b"))?;
        tx.bless_relationship(&id("a"), &fixtures::RR_S.into(), &id("b"))
    })
    .unwrap();
}

#[tokio::test]
async fn test_background_sweeper_start_stop() {
    common::init_tracing();
    let base = Arc::new(memory_mesh_base("MB1"));
    create_expiring(&base);

    let sweeper = Arc::new(Sweeper::new(base.clone(), Arc::new(ExpiresSweepPolicy)));
    sweeper.start(Duration::from_millis(10)).unwrap();
    assert!(sweeper.is_running());
    assert!(sweeper.start(Duration::from_millis(10)).is_err());

    tokio::time::sleep(Duration::from_millis(100)).await;
    sweeper.stop().await;
    assert!(!sweeper.is_running());

    let stats = sweeper.stats();
    assert!(stats.sweeps >= 1);
    assert_eq!(stats.evicted, 1);
    assert!(base.peek(&id("a")).unwrap().is_none());
    assert!(base.peek(&id("b")).unwrap().unwrap().neighbors().is_empty());

    // Stopping twice is harmless
    sweeper.stop().await;
}

#[test]
fn test_eviction_reaches_replicas() {
    let (network, bases) = network(&["MB1", "MB2"]);
    connect(&network, "MB1", "MB2");
    let (mb1, mb2) = (&bases[0], &bases[1]);
    create_expiring(mb1);
    mb2.obtain_replica(&mb("MB1"), [id("a"), id("b")]).unwrap();
    network.pump().unwrap();

    // The replica has the same expiry but not the lock
    let replica_sweeper = Sweeper::new(mb2.clone(), Arc::new(ExpiresSweepPolicy));
    let report = replica_sweeper.sweep_all(now_millis()).unwrap();
    assert!(report.evicted.is_empty());
    assert_eq!(report.skipped_not_lock_owner, 1);

    let sweeper = Sweeper::new(mb1.clone(), Arc::new(ExpiresSweepPolicy));
    let report = sweeper.sweep_all(now_millis()).unwrap();
    assert_eq!(report.evicted, vec![id("a")]);
    network.pump().unwrap();

    assert!(mb2.peek(&id("a")).unwrap().is_none());
    let b = mb2.peek(&id("b")).unwrap().unwrap();
    assert!(!b.is_related_to(&id("a")));
    assert_eq!(mb2.diagnostics().changes_failed, 0);
}
