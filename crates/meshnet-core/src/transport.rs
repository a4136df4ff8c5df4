//! In-process transport
//!
//! [`LocalNetwork`] connects mesh bases living in one process. Each
//! `pump` takes queued messages one at a time, pushes each through the wire
//! codec and hands it to the partner, repeating until no messages remain.
//! Messages between one pair of mesh bases are delivered in the order
//! they were enqueued; a refused message keeps its place at the front.

use crate::identifier::{MeshBaseIdentifier, MeshObjectIdentifier};
use crate::mesh::ReplicaInfo;
use crate::meshbase::MeshBase;
use crate::proxy::{Proxy, ProxyMessage};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Upper bound of delivery rounds in one pump
pub const DEFAULT_MAX_ROUNDS: usize = 64;

/// Mesh bases connected in one process
pub struct LocalNetwork {
    bases: RwLock<BTreeMap<MeshBaseIdentifier, Arc<MeshBase>>>,
    max_rounds: usize,
}

impl Default for LocalNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self {
            bases: RwLock::new(BTreeMap::new()),
            max_rounds: DEFAULT_MAX_ROUNDS,
        }
    }

    /// Add a mesh base; identifiers must be unique
    pub fn register(&self, base: Arc<MeshBase>) -> Result<()> {
        let mut bases = self.bases.write();
        if bases.contains_key(base.identifier()) {
            return Err(Error::config(format!(
                "Mesh base {} is registered already",
                base.identifier()
            )));
        }
        tracing::debug!("Registered mesh base {}", base.identifier());
        bases.insert(base.identifier().clone(), base);
        Ok(())
    }

    /// Registered mesh base
    pub fn base(&self, id: &MeshBaseIdentifier) -> Option<Arc<MeshBase>> {
        self.bases.read().get(id).cloned()
    }

    fn require(&self, id: &MeshBaseIdentifier) -> Result<Arc<MeshBase>> {
        self.base(id)
            .ok_or_else(|| Error::unresolved(format!("mesh base {}", id)))
    }

    /// Create the pair of proxies between two registered mesh bases
    pub fn connect(&self, a: &MeshBaseIdentifier, b: &MeshBaseIdentifier) -> Result<()> {
        if a == b {
            return Err(Error::config(format!("Cannot connect {} to itself", a)));
        }
        let (first, second) = (self.require(a)?, self.require(b)?);
        let forward = first.obtain_proxy(b);
        let backward = second.obtain_proxy(a);
        Proxy::link(&forward, &backward);
        tracing::info!("Connected {} <-> {}", a, b);
        Ok(())
    }

    /// Deliver queued messages until every queue is empty
    ///
    /// Returns the number of messages delivered. A message the receiver
    /// refuses goes back to the front of its queue and the error is
    /// returned, so a later pump retries it in order. Fails as well if the
    /// network is still busy after the maximum number of rounds.
    pub fn pump(&self) -> Result<usize> {
        let mut delivered = 0;
        for round in 0..self.max_rounds {
            let proxies = self.proxies();
            let mut moved = 0;
            for proxy in proxies {
                // Only what was queued when the round reached this proxy
                for _ in 0..proxy.pending() {
                    let Some(message) = proxy.take_next() else {
                        break;
                    };
                    if self.deliver(&proxy, message)? {
                        moved += 1;
                    }
                }
            }
            if moved == 0 && self.is_idle() {
                return Ok(delivered);
            }
            tracing::trace!("Pump round {}: {} messages", round, moved);
            delivered += moved;
        }
        Err(Error::internal(format!(
            "Network still busy after {} rounds",
            self.max_rounds
        )))
    }

    /// Hand one taken message to its receiver; `false` if nobody is there
    fn deliver(&self, proxy: &Proxy, message: ProxyMessage) -> Result<bool> {
        let (from, to) = (proxy.owner(), proxy.partner());
        let Some(target) = self.base(to) else {
            tracing::warn!(
                "Dropping {:?} message from {} to unknown mesh base {}",
                message.message_type(),
                from,
                to
            );
            return Ok(false);
        };
        // Every message crosses the wire codec
        let result = message
            .encode()
            .and_then(|frame| ProxyMessage::decode(&frame))
            .and_then(|decoded| target.receive(from, decoded));
        match result {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::debug!(
                    "{} refused {:?} message from {}: {}",
                    to,
                    message.message_type(),
                    from,
                    e
                );
                proxy.requeue_front(message);
                Err(e)
            }
        }
    }

    fn proxies(&self) -> Vec<Arc<Proxy>> {
        let bases: Vec<_> = self.bases.read().values().cloned().collect();
        bases.iter().flat_map(|base| base.proxies()).collect()
    }

    fn is_idle(&self) -> bool {
        self.proxies().iter().all(|proxy| proxy.pending() == 0)
    }

    /// Move the lock of a node from one mesh base to an adjacent one
    ///
    /// `from` must hold the lock and know a replica towards `to`, and `to`
    /// must point its lock at `from`. Both halves are applied together.
    pub fn transfer_lock(
        &self,
        id: &MeshObjectIdentifier,
        from: &MeshBaseIdentifier,
        to: &MeshBaseIdentifier,
    ) -> Result<()> {
        let (source, target) = self.check_transfer(
            id,
            from,
            to,
            |held| {
                if held.is_lock_owner() {
                    Ok(())
                } else {
                    Err(Error::NotLockOwner(id.clone()))
                }
            },
            |wanted| wanted.proxy_towards_lock.as_ref(),
        )?;

        source.reassign_lock(id, Some(to.clone()))?;
        if let Err(e) = target.reassign_lock(id, None) {
            source.reassign_lock(id, None)?;
            return Err(e);
        }
        tracing::info!("Lock of {} moved from {} to {}", id, from, to);
        Ok(())
    }

    /// Move the home of a node from one mesh base to an adjacent one
    ///
    /// `from` must be the home replica and `to` must point its home at
    /// `from`. The lock stays where it is.
    pub fn transfer_home(
        &self,
        id: &MeshObjectIdentifier,
        from: &MeshBaseIdentifier,
        to: &MeshBaseIdentifier,
    ) -> Result<()> {
        let (source, target) = self.check_transfer(
            id,
            from,
            to,
            |held| {
                if held.is_home_replica() {
                    Ok(())
                } else {
                    Err(Error::cannot_apply(id, format!("{} is not the home replica", from)))
                }
            },
            |wanted| wanted.proxy_towards_home.as_ref(),
        )?;

        source.reassign_home(id, Some(to.clone()))?;
        if let Err(e) = target.reassign_home(id, None) {
            source.reassign_home(id, None)?;
            return Err(e);
        }
        tracing::info!("Home of {} moved from {} to {}", id, from, to);
        Ok(())
    }

    /// Both mesh bases hold the node, `from` passes `held` and `to` points
    /// at `from`
    fn check_transfer(
        &self,
        id: &MeshObjectIdentifier,
        from: &MeshBaseIdentifier,
        to: &MeshBaseIdentifier,
        held: impl FnOnce(&ReplicaInfo) -> Result<()>,
        pointer: impl FnOnce(&ReplicaInfo) -> Option<&MeshBaseIdentifier>,
    ) -> Result<(Arc<MeshBase>, Arc<MeshBase>)> {
        let (source, target) = (self.require(from)?, self.require(to)?);
        let object = source
            .peek(id)?
            .ok_or_else(|| Error::unresolved(format!("mesh object {} on {}", id, from)))?;
        held(object.replica())?;
        let wanted = target
            .peek(id)?
            .ok_or_else(|| Error::unresolved(format!("mesh object {} on {}", id, to)))?;
        if pointer(wanted.replica()) != Some(from) {
            return Err(Error::cannot_apply(
                id,
                format!("replica on {} does not point at {}", to, from),
            ));
        }
        Ok((source, target))
    }
}
