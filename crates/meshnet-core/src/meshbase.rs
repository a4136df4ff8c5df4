//! Mesh base - one peer's store of mesh objects
//!
//! A mesh base owns:
//! - a cache of committed replicas in front of its [`Store`]
//! - one [`Proxy`] per partner mesh base it exchanges changes with
//! - the slot for its single active [`Transaction`]
//! - a [`Diagnostics`] record of what happened to incoming changes
//!
//! Nodes are always addressed by identifier and resolved here; nothing in
//! the graph holds a reference to another node.

use crate::change::{ApplyOutcome, ChangeSet, Tolerance};
use crate::clock::{expires_to_store, now_millis};
use crate::config::MeshBaseConfig;
use crate::identifier::{MeshBaseIdentifier, MeshObjectIdentifier};
use crate::mesh::{MeshObject, NetMeshObject, ReplicaInfo};
use crate::model::ModelBase;
use crate::propagation::PropagationEngine;
use crate::proxy::{Proxy, ProxyMessage};
use crate::store::{LmdbStore, MemoryStore, Store, StoreValue};
use crate::transaction::Transaction;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Encoding identifier of persisted replicas
pub const ENCODING_ID: &str = "meshnet.netmeshobject.bincode.v1";

/// Counters of what happened on a mesh base
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics {
    /// Transactions committed
    pub transactions_committed: u64,
    /// Transactions rolled back
    pub transactions_rolled_back: u64,
    /// Incoming changes applied
    pub changes_applied: u64,
    /// Incoming changes whose target state was reached already
    pub changes_tolerated: u64,
    /// Tolerated removals between known but unrelated nodes
    pub not_related: u64,
    /// Tolerated removals naming a neighbor never replicated here
    pub neighbor_unknown: u64,
    /// Lock-authoritative changes ignored for not coming from the lock
    pub changes_not_from_lock: u64,
    /// Incoming changes that failed
    pub changes_failed: u64,
    /// Proxy messages received
    pub messages_received: u64,
    /// Proxy messages enqueued for partners
    pub messages_sent: u64,
    /// Commits refused because a partner's outbound queue was full
    pub commits_refused: u64,
}

/// One peer's store of mesh objects
pub struct MeshBase {
    identifier: MeshBaseIdentifier,
    config: MeshBaseConfig,
    model: Arc<ModelBase>,
    store: Arc<dyn Store>,
    cache: RwLock<HashMap<MeshObjectIdentifier, NetMeshObject>>,
    proxies: RwLock<BTreeMap<MeshBaseIdentifier, Arc<Proxy>>>,
    active: Mutex<Option<u64>>,
    next_transaction: AtomicU64,
    diagnostics: Mutex<Diagnostics>,
}

impl MeshBase {
    /// Open a mesh base with the store its configuration names
    pub fn open(config: MeshBaseConfig, model: Arc<ModelBase>) -> Result<Self> {
        config.validate()?;
        let store: Arc<dyn Store> = match &config.store.path {
            Some(path) => Arc::new(LmdbStore::open(path, &config.store)?),
            None => Arc::new(MemoryStore::new()),
        };
        Self::with_store(config, model, store)
    }

    /// Open a mesh base on an existing store
    pub fn with_store(
        config: MeshBaseConfig,
        model: Arc<ModelBase>,
        store: Arc<dyn Store>,
    ) -> Result<Self> {
        config.validate()?;
        tracing::info!("Opening mesh base {}", config.identifier);
        Ok(Self {
            identifier: config.identifier.clone(),
            config,
            model,
            store,
            cache: RwLock::new(HashMap::new()),
            proxies: RwLock::new(BTreeMap::new()),
            active: Mutex::new(None),
            next_transaction: AtomicU64::new(1),
            diagnostics: Mutex::new(Diagnostics::default()),
        })
    }

    /// Identifier of this mesh base
    pub fn identifier(&self) -> &MeshBaseIdentifier {
        &self.identifier
    }

    /// Configuration
    pub fn config(&self) -> &MeshBaseConfig {
        &self.config
    }

    /// Model base resolving mesh types
    pub fn model(&self) -> &ModelBase {
        &self.model
    }

    /// Backing store
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Snapshot of the diagnostics counters
    pub fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.lock().clone()
    }

    pub(crate) fn note(&self, f: impl FnOnce(&mut Diagnostics)) {
        f(&mut self.diagnostics.lock());
    }

    // ---- lookup ----

    /// Committed replica from cache or store, without touching the read time
    pub(crate) fn load(&self, id: &MeshObjectIdentifier) -> Result<Option<NetMeshObject>> {
        if let Some(object) = self.cache.read().get(id) {
            return Ok(Some(object.clone()));
        }
        match self.store.get(id.as_str()) {
            Ok(value) => {
                let object = decode_object(&value)?;
                let mut cache = self.cache.write();
                Ok(Some(cache.entry(id.clone()).or_insert(object).clone()))
            }
            Err(Error::StoreKeyDoesNotExist(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Find a committed replica by identifier
    ///
    /// The read time is updated in memory only; a lookup never writes to
    /// the store.
    pub fn find_mesh_object_by_identifier(
        &self,
        id: &MeshObjectIdentifier,
    ) -> Result<Option<NetMeshObject>> {
        if self.load(id)?.is_none() {
            return Ok(None);
        }
        if !self.config.read_updates_time_read {
            return self.load(id);
        }
        let now = now_millis();
        let mut cache = self.cache.write();
        Ok(cache.get_mut(id).map(|object| {
            object.object_mut().set_time_read(now);
            object.clone()
        }))
    }

    /// Committed replica without updating its read time
    pub fn peek(&self, id: &MeshObjectIdentifier) -> Result<Option<NetMeshObject>> {
        self.load(id)
    }

    /// Sorted identifiers of every committed replica
    pub fn iter_identifiers(&self) -> Result<Vec<MeshObjectIdentifier>> {
        let mut ids: BTreeSet<MeshObjectIdentifier> = self.cache.read().keys().cloned().collect();
        ids.extend(self.store.keys()?.into_iter().map(MeshObjectIdentifier::from));
        Ok(ids.into_iter().collect())
    }

    /// Number of replicas held in memory
    pub fn cached_count(&self) -> usize {
        self.cache.read().len()
    }

    /// Drop every cached replica; later lookups reload from the store
    pub fn clear_memory_cache(&self) -> Result<()> {
        if let Some(tx) = *self.active.lock() {
            return Err(Error::transaction(format!(
                "Cannot clear the cache of {} while transaction {} is active",
                self.identifier, tx
            )));
        }
        self.cache.write().clear();
        tracing::debug!("Cleared memory cache of {}", self.identifier);
        Ok(())
    }

    // ---- transactions ----

    /// Begin a transaction; fails if one is active already
    pub fn begin(&self) -> Result<Transaction<'_>> {
        let mut active = self.active.lock();
        if active.is_some() {
            return Err(Error::TransactionAlreadyActive(self.identifier.to_string()));
        }
        let id = self.next_transaction.fetch_add(1, Ordering::SeqCst);
        *active = Some(id);
        Ok(Transaction::new(self, id))
    }

    /// Run `f` in a transaction, committing on success and rolling back on error
    pub fn execute<T>(&self, f: impl FnOnce(&mut Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut tx = self.begin()?;
        match f(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                tx.rollback(&e.to_string());
                Err(e)
            }
        }
    }

    pub(crate) fn release_slot(&self, tx: u64, committed: bool) {
        let mut active = self.active.lock();
        if *active == Some(tx) {
            *active = None;
        }
        drop(active);
        self.note(|d| {
            if committed {
                d.transactions_committed += 1;
            } else {
                d.transactions_rolled_back += 1;
            }
        });
    }

    pub(crate) fn install(&self, objects: Vec<(MeshObjectIdentifier, Option<NetMeshObject>)>) {
        let mut cache = self.cache.write();
        for (id, object) in objects {
            match object {
                Some(object) => {
                    cache.insert(id, object);
                }
                None => {
                    cache.remove(&id);
                }
            }
        }
    }

    // ---- proxies ----

    /// Proxy towards `partner`, if one exists
    pub fn proxy_for(&self, partner: &MeshBaseIdentifier) -> Option<Arc<Proxy>> {
        self.proxies.read().get(partner).cloned()
    }

    /// Proxy towards `partner`, created on first use
    pub fn obtain_proxy(&self, partner: &MeshBaseIdentifier) -> Arc<Proxy> {
        if let Some(proxy) = self.proxy_for(partner) {
            return proxy;
        }
        self.proxies
            .write()
            .entry(partner.clone())
            .or_insert_with(|| {
                tracing::debug!("Creating proxy {} -> {}", self.identifier, partner);
                Arc::new(Proxy::new(
                    self.identifier.clone(),
                    partner.clone(),
                    self.config.max_outbound_queue,
                ))
            })
            .clone()
    }

    /// All proxies, ordered by partner
    pub fn proxies(&self) -> Vec<Arc<Proxy>> {
        self.proxies.read().values().cloned().collect()
    }

    fn send(&self, partner: &MeshBaseIdentifier, message: ProxyMessage) -> Result<()> {
        self.obtain_proxy(partner).enqueue(message)?;
        self.note(|d| d.messages_sent += 1);
        Ok(())
    }

    /// Split committed changes per partner and check every queue has room
    ///
    /// Runs before the store write, so a full queue fails the commit
    /// instead of losing the batch.
    pub(crate) fn plan_propagation(
        &self,
        changes: &ChangeSet,
        replicas: &HashMap<MeshObjectIdentifier, ReplicaInfo>,
    ) -> Result<Vec<(Arc<Proxy>, ChangeSet)>> {
        if changes.is_empty() {
            return Ok(Vec::new());
        }
        let partners: Vec<MeshBaseIdentifier> = self.proxies.read().keys().cloned().collect();
        let mut planned = Vec::new();
        for (partner, outgoing) in PropagationEngine::route(changes, replicas, &partners) {
            let proxy = self.obtain_proxy(&partner);
            if !proxy.has_room(1) {
                self.note(|d| d.commits_refused += 1);
                return Err(proxy.full());
            }
            planned.push((proxy, outgoing));
        }
        Ok(planned)
    }

    /// Enqueue the batches of a durable transaction
    pub(crate) fn dispatch(&self, planned: Vec<(Arc<Proxy>, ChangeSet)>) {
        for (proxy, outgoing) in planned {
            tracing::debug!(
                "Forwarding {} changes from {} to {}",
                outgoing.len(),
                self.identifier,
                proxy.partner()
            );
            proxy.enqueue_committed(ProxyMessage::Changes { changes: outgoing });
            self.note(|d| d.messages_sent += 1);
        }
    }

    // ---- replica protocol ----

    /// Handle one message arriving from `from`
    ///
    /// Incoming changes apply in order within one transaction. A change
    /// that fails is logged and counted; the rest of the batch still applies.
    pub fn receive(&self, from: &MeshBaseIdentifier, message: ProxyMessage) -> Result<()> {
        let result = match message {
            ProxyMessage::Changes { changes } => self.receive_changes(from, changes),
            ProxyMessage::RequestReplicas { ids } => self.grant_replicas(from, ids),
            ProxyMessage::ReplicaGranted { objects } => self.install_replicas(from, objects),
            ProxyMessage::CancelReplicas { ids } => self.execute(|tx| {
                for id in &ids {
                    if tx.find(id)?.is_some() {
                        tx.replica_mut(id)?.proxies.remove(from);
                    }
                }
                tracing::debug!("{} cancelled {} replicas on {}", from, ids.len(), self.identifier);
                Ok(())
            }),
        };
        // A refused message stays with the sender and is counted when it lands
        if result.is_ok() {
            self.obtain_proxy(from).mark_received();
            self.note(|d| d.messages_received += 1);
        }
        result
    }

    fn receive_changes(&self, from: &MeshBaseIdentifier, changes: ChangeSet) -> Result<()> {
        let mut tx = self.begin()?;
        for change in changes.iter() {
            match change.potentially_apply_to_replica_in(self, Some(&mut tx), Some(from)) {
                Ok(ApplyOutcome::Applied(_)) | Ok(ApplyOutcome::Purged(_)) => {
                    self.note(|d| d.changes_applied += 1);
                }
                Ok(ApplyOutcome::Tolerated { object, reason }) => {
                    tracing::debug!(
                        "Tolerated {} on {} from {}: {:?}",
                        change.kind().name(),
                        object,
                        from,
                        reason
                    );
                    self.note(|d| {
                        d.changes_tolerated += 1;
                        match reason {
                            Tolerance::NotRelated => d.not_related += 1,
                            Tolerance::NeighborUnknown => d.neighbor_unknown += 1,
                            _ => {}
                        }
                    });
                }
                Ok(ApplyOutcome::NotFromLock(_)) => {
                    self.note(|d| d.changes_not_from_lock += 1);
                }
                Err(e) if e.is_tolerable() => {
                    tracing::debug!("Tolerated {} from {}: {}", change.kind().name(), from, e);
                    self.note(|d| d.changes_tolerated += 1);
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to apply {} on {} from {}: {}",
                        change.kind().name(),
                        change.affected(),
                        from,
                        e
                    );
                    self.note(|d| d.changes_failed += 1);
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn grant_replicas(&self, from: &MeshBaseIdentifier, ids: Vec<MeshObjectIdentifier>) -> Result<()> {
        let objects = self.execute(|tx| {
            let mut objects = Vec::with_capacity(ids.len());
            for id in &ids {
                if tx.find(id)?.is_none() {
                    tracing::warn!("{} requested unknown replica {} from {}", from, id, self.identifier);
                    continue;
                }
                let replica = tx.replica_mut(id)?;
                replica.proxies.insert(from.clone());
                if let Some(object) = tx.find(id)? {
                    objects.push(object.into_parts().0);
                }
            }
            Ok(objects)
        })?;
        if !objects.is_empty() {
            tracing::debug!("Granting {} replicas from {} to {}", objects.len(), self.identifier, from);
            self.send(from, ProxyMessage::ReplicaGranted { objects })?;
        }
        Ok(())
    }

    fn install_replicas(&self, from: &MeshBaseIdentifier, objects: Vec<MeshObject>) -> Result<()> {
        self.execute(|tx| {
            for object in objects {
                let id = object.identifier().clone();
                if tx.find(&id)?.is_some() {
                    tracing::debug!("{} holds a replica of {} already", self.identifier, id);
                    continue;
                }
                tx.insert_object(NetMeshObject::new(object, ReplicaInfo::obtained_from(from)))?;
            }
            Ok(())
        })
    }

    /// Ask `partner` for replicas of the given nodes
    ///
    /// The partner answers asynchronously; each new replica points towards
    /// `partner` for both lock and home.
    pub fn obtain_replica(
        &self,
        partner: &MeshBaseIdentifier,
        ids: impl IntoIterator<Item = MeshObjectIdentifier>,
    ) -> Result<()> {
        let ids: Vec<_> = ids.into_iter().collect();
        tracing::debug!("{} requesting {} replicas from {}", self.identifier, ids.len(), partner);
        self.send(partner, ProxyMessage::RequestReplicas { ids })
    }

    /// Drop the local replica of a node without deleting the node
    ///
    /// Only a leaf replica that does not hold the lock can be cancelled. The
    /// partner towards the lock is told to forget this replica.
    pub fn cancel_replica(&self, id: &MeshObjectIdentifier) -> Result<()> {
        let towards_lock = self.execute(|tx| {
            let object = tx
                .find(id)?
                .ok_or_else(|| Error::unresolved(format!("mesh object {}", id)))?;
            let replica = object.replica();
            let Some(towards_lock) = replica.proxy_towards_lock.clone() else {
                return Err(Error::ReplicaIsLockOwner(id.clone()));
            };
            if replica.proxies.iter().any(|p| *p != towards_lock) {
                return Err(Error::cannot_apply(id, "other replicas depend on this one"));
            }
            tx.remove_object(id)?;
            Ok(towards_lock)
        })?;
        self.send(
            &towards_lock,
            ProxyMessage::CancelReplicas {
                ids: vec![id.clone()],
            },
        )
    }

    /// Point the lock of a node at `towards`, or at this replica for `None`
    ///
    /// This is the local half of a lock transfer; the partner's half must
    /// be applied together with it.
    pub fn reassign_lock(
        &self,
        id: &MeshObjectIdentifier,
        towards: Option<MeshBaseIdentifier>,
    ) -> Result<()> {
        self.reassign(id, towards, "Lock", |replica| &mut replica.proxy_towards_lock)
    }

    /// Point the home of a node at `towards`, or at this replica for `None`
    ///
    /// The local half of a home transfer, as with [`MeshBase::reassign_lock`].
    pub fn reassign_home(
        &self,
        id: &MeshObjectIdentifier,
        towards: Option<MeshBaseIdentifier>,
    ) -> Result<()> {
        self.reassign(id, towards, "Home", |replica| &mut replica.proxy_towards_home)
    }

    fn reassign(
        &self,
        id: &MeshObjectIdentifier,
        towards: Option<MeshBaseIdentifier>,
        what: &str,
        pointer: impl FnOnce(&mut ReplicaInfo) -> &mut Option<MeshBaseIdentifier>,
    ) -> Result<()> {
        self.execute(|tx| {
            let replica = tx.replica_mut(id)?;
            if let Some(partner) = &towards {
                if !replica.proxies.contains(partner) {
                    return Err(Error::unresolved(format!(
                        "no replica of {} towards {}",
                        id, partner
                    )));
                }
            }
            *pointer(replica) = towards.clone();
            Ok(())
        })?;
        tracing::debug!("{} of {} on {} now towards {:?}", what, id, self.identifier, towards);
        Ok(())
    }
}

/// Encode a replica for the store
pub(crate) fn encode_object(object: &NetMeshObject) -> Result<StoreValue> {
    let data = bincode::serialize(object)
        .map_err(|e| Error::serialization(format!("Failed to encode {}: {}", object.identifier(), e)))?;
    Ok(StoreValue {
        key: object.identifier().to_string(),
        encoding_id: ENCODING_ID.to_string(),
        time_created: object.time_created(),
        time_updated: object.time_updated(),
        time_read: object.time_read(),
        time_expires: expires_to_store(object.time_auto_expires()),
        data,
    })
}

/// Decode a replica from the store
pub(crate) fn decode_object(value: &StoreValue) -> Result<NetMeshObject> {
    if value.encoding_id != ENCODING_ID {
        return Err(Error::serialization(format!(
            "Unknown encoding {} for {}",
            value.encoding_id, value.key
        )));
    }
    let object: NetMeshObject = bincode::deserialize(&value.data)
        .map_err(|e| Error::serialization(format!("Failed to decode {}: {}", value.key, e)))?;
    if object.identifier().as_str() != value.key {
        return Err(Error::serialization(format!(
            "Store key {} holds {}",
            value.key,
            object.identifier()
        )));
    }
    Ok(object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CountingStoreListener, fixtures, memory_mesh_base, test_model};

    #[test]
    fn test_encoding_roundtrip_keeps_replica_info() {
        let mut object = NetMeshObject::new(
            MeshObject::new("obj1".into(), crate::mesh::MeshObjectTimes::at(10)),
            ReplicaInfo::obtained_from(&"MB2".into()),
        );
        object.object_mut().types_mut().insert(fixtures::AA.into());
        let value = encode_object(&object).unwrap();
        assert_eq!(value.key, "obj1");
        assert_eq!(value.time_expires, crate::clock::NEVER);
        assert_eq!(decode_object(&value).unwrap(), object);

        let mut foreign = value.clone();
        foreign.encoding_id = "other".to_string();
        assert!(matches!(decode_object(&foreign), Err(Error::Serialization(_))));
    }

    #[test]
    fn test_lookup_does_not_write() {
        let store = Arc::new(MemoryStore::new());
        let listener = Arc::new(CountingStoreListener::default());
        store.add_listener(listener.clone());
        let base = MeshBase::with_store(MeshBaseConfig::new("MB1"), test_model(), store).unwrap();

        base.execute(|tx| tx.create_mesh_object("obj1".into()).map(|_| ()))
            .unwrap();
        assert_eq!(listener.writes(), 1);
        let failures = listener.get_failures();

        base.clear_memory_cache().unwrap();
        let first = base.find_mesh_object_by_identifier(&"obj1".into()).unwrap();
        assert!(first.is_some());
        assert!(base.find_mesh_object_by_identifier(&"nope".into()).unwrap().is_none());
        assert_eq!(listener.writes(), 1);
        assert_eq!(listener.gets(), 1);
        assert_eq!(listener.get_failures(), failures + 1);
    }

    #[test]
    fn test_clear_cache_fails_during_transaction() {
        let base = memory_mesh_base("MB1");
        let tx = base.begin().unwrap();
        assert!(matches!(base.clear_memory_cache(), Err(Error::Transaction(_))));
        drop(tx);
        assert!(base.clear_memory_cache().is_ok());
    }

    #[test]
    fn test_iter_identifiers_is_sorted() {
        let base = memory_mesh_base("MB1");
        base.execute(|tx| {
            for id in ["c", "a", "b"] {
                tx.create_mesh_object(id.into())?;
            }
            Ok(())
        })
        .unwrap();
        base.clear_memory_cache().unwrap();
        base.find_mesh_object_by_identifier(&"b".into()).unwrap();
        let ids: Vec<String> = base
            .iter_identifiers()
            .unwrap()
            .into_iter()
            .map(|id| id.to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_reassign_lock_requires_known_proxy() {
        let base = memory_mesh_base("MB1");
        base.execute(|tx| tx.create_mesh_object("obj1".into()).map(|_| ()))
            .unwrap();
        assert!(matches!(
            base.reassign_lock(&"obj1".into(), Some("MB9".into())),
            Err(Error::UnresolvedReference(_))
        ));
        base.reassign_lock(&"obj1".into(), None).unwrap();
    }

    #[test]
    fn test_cancel_lock_owner_fails() {
        let base = memory_mesh_base("MB1");
        base.execute(|tx| tx.create_mesh_object("obj1".into()).map(|_| ()))
            .unwrap();
        assert!(matches!(
            base.cancel_replica(&"obj1".into()),
            Err(Error::ReplicaIsLockOwner(_))
        ));
    }
}
