//! Connection-layer abstraction consumed by the gossip node and the tracker.
//!
//! A [`Transport`] carries opaque frames between peers identified by
//! [`NodeId`]. Inbound traffic and connection lifecycle changes arrive on the
//! [`TransportEvents`] channel handed out alongside the transport. Within one
//! connection frames are delivered in order; reliability and reconnection
//! policy belong to the implementation.
//!
//! [`MemoryNetwork`] is an in-process implementation used by tests and
//! simulations; [`crate::net::IrohTransport`] runs over QUIC.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::identity::{short_id, Contact, NodeId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Connected(NodeId),
    Received(NodeId, Vec<u8>),
    Disconnected(NodeId),
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// How peers reach this endpoint.
    fn local_contact(&self) -> &Contact;

    /// Open (or reuse) a connection to `addr` and return the remote id.
    async fn connect(&self, addr: &str) -> Result<NodeId>;

    /// Queue a frame for `peer`. Fails when there is no connection.
    async fn send(&self, peer: &NodeId, bytes: Vec<u8>) -> Result<()>;

    /// Close the connection to `peer`. Both sides observe `Disconnected`.
    async fn disconnect(&self, peer: &NodeId);

    async fn is_connected(&self, peer: &NodeId) -> bool;
}

// ─────────────────────────────────────────────────────────────────────────────
// In-process transport
// ─────────────────────────────────────────────────────────────────────────────

struct Endpoint {
    id: NodeId,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

#[derive(Default)]
struct Hub {
    endpoints: HashMap<String, Endpoint>,
    addrs: HashMap<NodeId, String>,
    links: HashSet<(NodeId, NodeId)>,
}

impl Hub {
    fn sender(&self, id: &NodeId) -> Option<&mpsc::UnboundedSender<TransportEvent>> {
        self.addrs
            .get(id)
            .and_then(|addr| self.endpoints.get(addr))
            .map(|e| &e.tx)
    }

    fn notify(&self, to: &NodeId, event: TransportEvent) {
        if let Some(tx) = self.sender(to) {
            let _ = tx.send(event);
        }
    }

    fn unlink(&mut self, a: &NodeId, b: &NodeId) -> bool {
        if !self.links.remove(&link_key(a, b)) {
            return false;
        }
        self.notify(a, TransportEvent::Disconnected(*b));
        self.notify(b, TransportEvent::Disconnected(*a));
        true
    }
}

fn link_key(a: &NodeId, b: &NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (*a, *b)
    } else {
        (*b, *a)
    }
}

/// A switchboard connecting [`MemoryTransport`]s by address.
#[derive(Default)]
pub struct MemoryNetwork {
    hub: Mutex<Hub>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register an endpoint reachable at `contact.addr`.
    pub async fn bind(self: &Arc<Self>, contact: Contact) -> Result<(MemoryTransport, TransportEvents)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut hub = self.hub.lock().await;
        if hub.endpoints.contains_key(&contact.addr) {
            bail!("address {} already bound", contact.addr);
        }
        hub.endpoints.insert(
            contact.addr.clone(),
            Endpoint {
                id: contact.id,
                tx,
            },
        );
        hub.addrs.insert(contact.id, contact.addr.clone());
        drop(hub);
        Ok((
            MemoryTransport {
                network: self.clone(),
                contact,
            },
            rx,
        ))
    }

    /// Simulate a crash: the endpoint disappears and all its links drop.
    pub async fn shutdown(&self, addr: &str) {
        let mut hub = self.hub.lock().await;
        let Some(id) = hub.endpoints.get(addr).map(|e| e.id) else {
            return;
        };
        let peers: Vec<NodeId> = hub
            .links
            .iter()
            .filter_map(|(a, b)| {
                if a == &id {
                    Some(*b)
                } else if b == &id {
                    Some(*a)
                } else {
                    None
                }
            })
            .collect();
        for peer in peers {
            hub.unlink(&id, &peer);
        }
        hub.endpoints.remove(addr);
        hub.addrs.remove(&id);
        debug!(peer = %short_id(&id), "memory endpoint shut down");
    }

    /// Drop the connection between two endpoints, as a network fault would.
    pub async fn sever(&self, a: &NodeId, b: &NodeId) -> bool {
        let mut hub = self.hub.lock().await;
        hub.unlink(a, b)
    }

    pub async fn is_linked(&self, a: &NodeId, b: &NodeId) -> bool {
        let hub = self.hub.lock().await;
        hub.links.contains(&link_key(a, b))
    }

    pub async fn link_count(&self) -> usize {
        let hub = self.hub.lock().await;
        hub.links.len()
    }
}

#[derive(Clone)]
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    contact: Contact,
}

impl MemoryTransport {
    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_contact(&self) -> &Contact {
        &self.contact
    }

    async fn connect(&self, addr: &str) -> Result<NodeId> {
        let mut hub = self.network.hub.lock().await;
        if !hub.addrs.contains_key(&self.contact.id) {
            bail!("local endpoint is shut down");
        }
        let remote = hub
            .endpoints
            .get(addr)
            .map(|e| e.id)
            .ok_or_else(|| anyhow!("no endpoint at {addr}"))?;
        if remote == self.contact.id {
            bail!("refusing to connect to self");
        }
        if hub.links.insert(link_key(&self.contact.id, &remote)) {
            hub.notify(&self.contact.id, TransportEvent::Connected(remote));
            hub.notify(&remote, TransportEvent::Connected(self.contact.id));
        }
        Ok(remote)
    }

    async fn send(&self, peer: &NodeId, bytes: Vec<u8>) -> Result<()> {
        let hub = self.network.hub.lock().await;
        if !hub.links.contains(&link_key(&self.contact.id, peer)) {
            bail!("not connected to {}", short_id(peer));
        }
        let tx = hub
            .sender(peer)
            .ok_or_else(|| anyhow!("peer {} is gone", short_id(peer)))?;
        tx.send(TransportEvent::Received(self.contact.id, bytes))
            .map_err(|_| anyhow!("peer {} stopped receiving", short_id(peer)))
    }

    async fn disconnect(&self, peer: &NodeId) {
        let mut hub = self.network.hub.lock().await;
        hub.unlink(&self.contact.id, peer);
    }

    async fn is_connected(&self, peer: &NodeId) -> bool {
        self.network.is_linked(&self.contact.id, peer).await
    }
}
