//! Sweeper - policy-driven eviction of replicas
//!
//! A sweep walks a snapshot of the mesh base's identifiers, asks the
//! [`SweepPolicy`] about each node and deletes the selected ones, each in
//! its own transaction. Deletion cascades to the neighbors' edges and the
//! resulting changes propagate like any other commit. Only nodes whose
//! lock this replica holds are evicted.
//!
//! ```text
//! Idle ──sweep──> Scanning ──selected──> Evicting
//!   ^                │  ^                    │
//!   └────done────────┘  └──────next node─────┘
//! ```

use crate::clock::now_millis;
use crate::identifier::MeshObjectIdentifier;
use crate::mesh::NetMeshObject;
use crate::meshbase::MeshBase;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Decides which nodes a sweep deletes
pub trait SweepPolicy: Send + Sync {
    /// Whether `object` should be deleted at time `now`
    fn should_delete(&self, object: &NetMeshObject, now: i64) -> bool;
}

/// Deletes nodes not read for longer than a maximum age
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotReadForLongerThan {
    /// Maximum age in milliseconds
    pub max_age_millis: i64,
}

impl NotReadForLongerThan {
    /// Policy for the given maximum age
    pub fn new(max_age: Duration) -> Self {
        Self {
            max_age_millis: i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX),
        }
    }
}

impl SweepPolicy for NotReadForLongerThan {
    fn should_delete(&self, object: &NetMeshObject, now: i64) -> bool {
        now.saturating_sub(object.time_read()) > self.max_age_millis
    }
}

/// Deletes nodes whose automatic expiry has passed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpiresSweepPolicy;

impl SweepPolicy for ExpiresSweepPolicy {
    fn should_delete(&self, object: &NetMeshObject, now: i64) -> bool {
        matches!(object.time_auto_expires(), Some(expires) if expires >= 0 && now >= expires)
    }
}

/// Sweeper state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweeperState {
    /// No sweep running
    Idle,
    /// Consulting the policy
    Scanning,
    /// Deleting a selected node
    Evicting,
}

/// Result of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Nodes examined
    pub scanned: usize,
    /// Nodes deleted, in sweep order
    pub evicted: Vec<MeshObjectIdentifier>,
    /// Selected nodes left alone because another replica holds their lock
    pub skipped_not_lock_owner: usize,
    /// Selected nodes whose deletion failed
    pub failed: usize,
}

/// Sweeper statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweeperStats {
    /// Completed sweeps
    pub sweeps: u64,
    /// Nodes deleted over all sweeps
    pub evicted: u64,
    /// Failed deletions over all sweeps
    pub failed: u64,
}

/// Policy-driven eviction of one mesh base's replicas
pub struct Sweeper {
    base: Arc<MeshBase>,
    policy: Arc<dyn SweepPolicy>,
    state: Mutex<SweeperState>,
    stats: Mutex<SweeperStats>,
    running: AtomicBool,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Sweeper {
    /// Create a sweeper for `base` using `policy`
    pub fn new(base: Arc<MeshBase>, policy: Arc<dyn SweepPolicy>) -> Self {
        Self {
            base,
            policy,
            state: Mutex::new(SweeperState::Idle),
            stats: Mutex::new(SweeperStats::default()),
            running: AtomicBool::new(false),
            shutdown_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Current state
    pub fn state(&self) -> SweeperState {
        *self.state.lock()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> SweeperStats {
        self.stats.lock().clone()
    }

    /// Whether the background task is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: SweeperState) {
        *self.state.lock() = state;
    }

    /// Run one sweep over every node, as of `now`
    pub fn sweep_all(&self, now: i64) -> Result<SweepReport> {
        {
            let mut state = self.state.lock();
            if *state != SweeperState::Idle {
                return Err(Error::internal(format!(
                    "Sweep of {} already in progress",
                    self.base.identifier()
                )));
            }
            *state = SweeperState::Scanning;
        }
        let result = self.scan(now);
        self.set_state(SweeperState::Idle);

        let report = result?;
        let mut stats = self.stats.lock();
        stats.sweeps += 1;
        stats.evicted += report.evicted.len() as u64;
        stats.failed += report.failed as u64;
        drop(stats);

        if !report.evicted.is_empty() || report.failed > 0 {
            tracing::info!(
                "Sweep of {}: scanned {}, evicted {}, failed {}",
                self.base.identifier(),
                report.scanned,
                report.evicted.len(),
                report.failed
            );
        }
        Ok(report)
    }

    fn scan(&self, now: i64) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        for id in self.base.iter_identifiers()? {
            // Gone already, e.g. deleted by an earlier eviction's cascade
            let Some(object) = self.base.peek(&id)? else {
                continue;
            };
            report.scanned += 1;
            if !self.policy.should_delete(&object, now) {
                continue;
            }
            if !object.replica().is_lock_owner() {
                tracing::debug!("Not sweeping {}: lock held elsewhere", id);
                report.skipped_not_lock_owner += 1;
                continue;
            }

            self.set_state(SweeperState::Evicting);
            let result = self.base.execute(|tx| tx.delete_mesh_object(&id));
            self.set_state(SweeperState::Scanning);
            match result {
                Ok(()) => report.evicted.push(id),
                Err(e) => {
                    tracing::warn!("Failed to sweep {} on {}: {}", id, self.base.identifier(), e);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Start sweeping every `interval` on the tokio runtime
    pub fn start(self: &Arc<Self>, interval: Duration) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::internal("Sweeper already running"));
        }

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        let sweeper = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            // The first tick completes immediately
            timer.tick().await;
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = sweeper.sweep_all(now_millis()) {
                            tracing::error!("Sweep of {} failed: {}", sweeper.base.identifier(), e);
                        }
                    }
                    _ = &mut shutdown_rx => {
                        tracing::info!("Sweeper of {} shutting down", sweeper.base.identifier());
                        break;
                    }
                }
            }
            sweeper.running.store(false, Ordering::SeqCst);
        });
        *self.task.lock() = Some(handle);

        tracing::info!(
            "Sweeper of {} started, interval {:?}",
            self.base.identifier(),
            interval
        );
        Ok(())
    }

    /// Stop the background task and wait for it to finish
    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("Sweeper task of {} failed: {}", self.base.identifier(), e);
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{MeshObject, MeshObjectTimes, ReplicaInfo};
    use crate::testing::{fixtures, memory_mesh_base};

    fn object(times: MeshObjectTimes) -> NetMeshObject {
        NetMeshObject::new(MeshObject::new("obj1".into(), times), ReplicaInfo::default())
    }

    #[test]
    fn test_not_read_policy() {
        let policy = NotReadForLongerThan::new(Duration::from_millis(100));
        let node = object(MeshObjectTimes::at(1_000));
        assert!(!policy.should_delete(&node, 1_100));
        assert!(policy.should_delete(&node, 1_101));
    }

    #[test]
    fn test_expires_policy() {
        let policy = ExpiresSweepPolicy;
        assert!(!policy.should_delete(&object(MeshObjectTimes::at(0)), i64::MAX));

        let expiring = object(MeshObjectTimes::at(0).with_auto_expires(500));
        assert!(!policy.should_delete(&expiring, 499));
        assert!(policy.should_delete(&expiring, 500));

        let never = object(MeshObjectTimes::at(0).with_auto_expires(-1));
        assert!(!policy.should_delete(&never, i64::MAX));
    }

    #[test]
    fn test_sweep_cascades_to_neighbors() {
        let base = Arc::new(memory_mesh_base("MB1"));
        let (a, b) = (MeshObjectIdentifier::from("a"), MeshObjectIdentifier::from("b"));
        base.execute(|tx| {
            tx.create_mesh_object_with(a.clone(), MeshObjectTimes::at(0).with_auto_expires(10))?;
            tx.create_mesh_object(b.clone())?;
            tx.bless_relationship(&a, &fixtures::RR_S.into(), &b)
        })
        .unwrap();

        let sweeper = Sweeper::new(base.clone(), Arc::new(ExpiresSweepPolicy));
        let report = sweeper.sweep_all(now_millis()).unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.evicted, vec![a.clone()]);
        assert_eq!(sweeper.state(), SweeperState::Idle);

        assert!(base.peek(&a).unwrap().is_none());
        let remaining = base.peek(&b).unwrap().unwrap();
        assert!(!remaining.is_related_to(&a));
        assert_eq!(sweeper.stats().evicted, 1);
    }

    #[test]
    fn test_sweep_skips_foreign_locks() {
        let base = Arc::new(memory_mesh_base("MB1"));
        base.execute(|tx| {
            tx.create_mesh_object("obj1".into())?;
            tx.replica_mut(&"obj1".into())?.proxy_towards_lock = Some("MB2".into());
            Ok(())
        })
        .unwrap();

        let sweeper = Sweeper::new(
            base.clone(),
            Arc::new(NotReadForLongerThan { max_age_millis: 0 }),
        );
        let report = sweeper.sweep_all(i64::MAX).unwrap();
        assert!(report.evicted.is_empty());
        assert_eq!(report.skipped_not_lock_owner, 1);
        assert!(base.peek(&"obj1".into()).unwrap().is_some());
    }

    #[test]
    fn test_sweep_with_active_transaction_counts_failure() {
        let base = Arc::new(memory_mesh_base("MB1"));
        base.execute(|tx| tx.create_mesh_object("obj1".into()).map(|_| ()))
            .unwrap();
        let sweeper = Sweeper::new(
            base.clone(),
            Arc::new(NotReadForLongerThan { max_age_millis: 0 }),
        );

        let tx = base.begin().unwrap();
        let report = sweeper.sweep_all(i64::MAX).unwrap();
        assert_eq!(report.failed, 1);
        drop(tx);
        assert_eq!(sweeper.sweep_all(i64::MAX).unwrap().evicted.len(), 1);
    }
}
