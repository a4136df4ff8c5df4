//! Proxies - directed channels between two mesh bases
//!
//! A mesh base owns one [`Proxy`] per partner. The proxy holds the bounded
//! queue of messages not yet delivered to the partner, communication
//! timestamps and a non-owning link to the partner's matching proxy.
//! Delivery itself belongs to the transport.

mod message;

pub use message::{MAX_PAYLOAD_LEN, ProxyMessage, ProxyMessageType};

use crate::clock::{NEVER, now_millis};
use crate::identifier::MeshBaseIdentifier;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

/// Proxy statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyStats {
    /// Messages enqueued
    pub messages_enqueued: u64,
    /// Messages refused because the queue was full
    pub messages_rejected: u64,
    /// Messages handed to the transport
    pub messages_sent: u64,
    /// Messages received from the partner
    pub messages_received: u64,
}

/// Channel from one mesh base to one partner
pub struct Proxy {
    owner: MeshBaseIdentifier,
    partner: MeshBaseIdentifier,
    outbound: Mutex<VecDeque<ProxyMessage>>,
    max_outbound: usize,
    time_created: i64,
    last_sent: AtomicI64,
    last_received: AtomicI64,
    partner_proxy: RwLock<Weak<Proxy>>,
    stats: Mutex<ProxyStats>,
}

impl Proxy {
    /// Create a proxy from `owner` to `partner`
    pub fn new(owner: MeshBaseIdentifier, partner: MeshBaseIdentifier, max_outbound: usize) -> Self {
        Self {
            owner,
            partner,
            outbound: Mutex::new(VecDeque::new()),
            max_outbound,
            time_created: now_millis(),
            last_sent: AtomicI64::new(NEVER),
            last_received: AtomicI64::new(NEVER),
            partner_proxy: RwLock::new(Weak::new()),
            stats: Mutex::new(ProxyStats::default()),
        }
    }

    /// Mesh base owning this proxy
    pub fn owner(&self) -> &MeshBaseIdentifier {
        &self.owner
    }

    /// Mesh base at the other end
    pub fn partner(&self) -> &MeshBaseIdentifier {
        &self.partner
    }

    /// Creation time in milliseconds
    pub fn time_created(&self) -> i64 {
        self.time_created
    }

    /// Last time messages were handed to the transport; `-1` if never
    pub fn time_last_sent(&self) -> i64 {
        self.last_sent.load(Ordering::SeqCst)
    }

    /// Last time a message arrived from the partner; `-1` if never
    pub fn time_last_received(&self) -> i64 {
        self.last_received.load(Ordering::SeqCst)
    }

    /// Queue a message for the partner
    ///
    /// A full queue refuses the message with [`Error::OutboundQueueFull`];
    /// queued messages are never evicted.
    pub fn enqueue(&self, message: ProxyMessage) -> Result<()> {
        {
            let mut outbound = self.outbound.lock();
            if outbound.len() < self.max_outbound {
                outbound.push_back(message);
                self.stats.lock().messages_enqueued += 1;
                return Ok(());
            }
        }
        self.stats.lock().messages_rejected += 1;
        tracing::warn!(
            "Outbound queue {} -> {} full, refused {:?} message",
            self.owner,
            self.partner,
            message.message_type()
        );
        Err(self.full())
    }

    /// Queue a message that must not be refused, even beyond the bound
    ///
    /// Used for batches of a transaction that is already durable; admission
    /// was checked with [`Proxy::has_room`] before the store write.
    pub(crate) fn enqueue_committed(&self, message: ProxyMessage) {
        let len = {
            let mut outbound = self.outbound.lock();
            outbound.push_back(message);
            outbound.len()
        };
        self.stats.lock().messages_enqueued += 1;
        if len > self.max_outbound {
            tracing::warn!(
                "Outbound queue {} -> {} over its bound of {}",
                self.owner,
                self.partner,
                self.max_outbound
            );
        }
    }

    /// Whether `count` more messages fit into the queue
    pub fn has_room(&self, count: usize) -> bool {
        self.outbound.lock().len() + count <= self.max_outbound
    }

    pub(crate) fn full(&self) -> Error {
        Error::OutboundQueueFull {
            owner: self.owner.clone(),
            partner: self.partner.clone(),
        }
    }

    /// Take the oldest queued message
    pub fn take_next(&self) -> Option<ProxyMessage> {
        let message = self.outbound.lock().pop_front()?;
        self.last_sent.store(now_millis(), Ordering::SeqCst);
        self.stats.lock().messages_sent += 1;
        Some(message)
    }

    /// Put back a message the transport could not deliver, ahead of the rest
    pub fn requeue_front(&self, message: ProxyMessage) {
        self.outbound.lock().push_front(message);
        let mut stats = self.stats.lock();
        stats.messages_sent = stats.messages_sent.saturating_sub(1);
    }

    /// Number of queued messages
    pub fn pending(&self) -> usize {
        self.outbound.lock().len()
    }

    pub(crate) fn mark_received(&self) {
        self.last_received.store(now_millis(), Ordering::SeqCst);
        self.stats.lock().messages_received += 1;
    }

    /// The partner's matching proxy, while it is alive
    pub fn partner_proxy(&self) -> Option<Arc<Proxy>> {
        self.partner_proxy.read().upgrade()
    }

    /// Link two matching proxies to each other without owning either
    pub fn link(a: &Arc<Proxy>, b: &Arc<Proxy>) {
        *a.partner_proxy.write() = Arc::downgrade(b);
        *b.partner_proxy.write() = Arc::downgrade(a);
    }

    /// Statistics snapshot
    pub fn stats(&self) -> ProxyStats {
        self.stats.lock().clone()
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("owner", &self.owner)
            .field("partner", &self.partner)
            .field("pending", &self.pending())
            .finish()
    }
}
