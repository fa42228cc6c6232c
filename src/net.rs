//! Network implementations using iroh QUIC transport.
//!
//! Two ALPNs are spoken:
//!
//! - [`GOSSIP_ALPN`]: long-lived node-to-node and node-to-tracker links. Each
//!   link is one QUIC connection carrying one ordered bidirectional stream of
//!   length-prefixed frames. The dialer opens the stream and sends its
//!   [`Contact`] as the first frame so the acceptor learns how to reach it.
//!   The claimed id must match the one derived from the authenticated
//!   endpoint key. When both sides dial at once, the link dialed by the lower
//!   id survives on both ends.
//! - [`DHT_ALPN`]: one request/response exchange per connection, used by
//!   [`IrohDhtNetwork`].
//!
//! Contact addresses are JSON-serialized [`EndpointAddr`]s.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use iroh::endpoint::{Connection, RecvStream, SendStream};
use iroh::{Endpoint, EndpointAddr};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace};

use crate::dht::DhtNetwork;
use crate::framing::{read_frame, write_frame};
use crate::identity::{derive_node_id, short_id, Contact, NodeId};
use crate::protocol::{self, DhtRequest, DhtResponse, GetClosestNodesRequest, PingRequest};
use crate::transport::{Transport, TransportEvent, TransportEvents};

/// ALPN protocol identifier for DHT connections.
pub const DHT_ALPN: &[u8] = b"streamnet/dht/1";

/// ALPN protocol identifier for gossip and tracker links.
pub const GOSSIP_ALPN: &[u8] = b"streamnet/gossip/1";

/// Parse a contact address into an iroh [`EndpointAddr`].
pub fn parse_addr(addr: &str) -> Result<EndpointAddr> {
    Ok(serde_json::from_str(addr)?)
}

/// Derive the overlay id of an iroh endpoint.
pub fn endpoint_node_id(endpoint: &Endpoint) -> NodeId {
    derive_node_id(endpoint.id().as_bytes())
}

/// Build the local [`Contact`] for `endpoint`.
pub fn local_contact(endpoint: &Endpoint) -> Result<Contact> {
    let addr = serde_json::to_string(&endpoint.addr())?;
    Ok(Contact::new(endpoint_node_id(endpoint), addr))
}

// ─────────────────────────────────────────────────────────────────────────────
// Gossip transport
// ─────────────────────────────────────────────────────────────────────────────

struct Link {
    conn: Connection,
    outbox: mpsc::UnboundedSender<Vec<u8>>,
    generation: u64,
    dialer: NodeId,
}

/// Check a dialer's hello frame against the id its TLS key proves.
fn verify_hello(authenticated: &NodeId, claimed: &Contact, local: &NodeId) -> Result<()> {
    if &claimed.id != authenticated {
        bail!(
            "peer {} introduced itself as {}",
            short_id(authenticated),
            short_id(&claimed.id)
        );
    }
    if authenticated == local {
        bail!("refusing link to self");
    }
    Ok(())
}

/// Whether a live link survives a second one to the same peer.
///
/// A redial from the same side replaces the old link. Crossed dials keep the
/// one opened by the lower id, which both ends agree on.
fn keep_existing(existing_dialer: &NodeId, new_dialer: &NodeId) -> bool {
    // Equal dialers compare as not-less, so a redial always replaces.
    existing_dialer < new_dialer
}

struct Shared {
    endpoint: Endpoint,
    contact: Contact,
    links: Mutex<HashMap<NodeId, Link>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    generation: AtomicU64,
}

impl Shared {
    async fn drop_link(&self, peer: NodeId, generation: u64) {
        let mut links = self.links.lock().await;
        if links.get(&peer).map(|l| l.generation) != Some(generation) {
            return;
        }
        if let Some(link) = links.remove(&peer) {
            link.conn.close(0u32.into(), b"closed");
            drop(links);
            debug!(peer = %short_id(&peer), "gossip link closed");
            let _ = self.events.send(TransportEvent::Disconnected(peer));
        }
    }
}

/// [`Transport`] over iroh QUIC connections.
///
/// Inbound links arrive through [`crate::server::GossipProtocolHandler`],
/// which hands accepted connections to [`IrohTransport::accept`].
#[derive(Clone)]
pub struct IrohTransport {
    shared: Arc<Shared>,
}

impl IrohTransport {
    pub fn new(endpoint: Endpoint, contact: Contact) -> (Self, TransportEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Shared {
            endpoint,
            contact,
            links: Mutex::new(HashMap::new()),
            events,
            generation: AtomicU64::new(0),
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            rx,
        )
    }

    /// Take over an inbound connection: read the dialer's contact and start
    /// exchanging frames.
    pub async fn accept(&self, conn: Connection) -> Result<NodeId> {
        let (send, mut recv) = conn.accept_bi().await?;
        let hello = read_frame(&mut recv)
            .await?
            .ok_or_else(|| anyhow!("peer closed before introducing itself"))?;
        let remote: Contact = protocol::decode(&hello)?;
        let authenticated = derive_node_id(conn.remote_id().as_bytes());
        if let Err(err) = verify_hello(&authenticated, &remote, &self.shared.contact.id) {
            conn.close(1u32.into(), b"bad hello");
            return Err(err);
        }
        self.install(remote.id, remote.id, conn, send, recv).await;
        Ok(remote.id)
    }

    /// Register a fresh connection to `peer`. Returns `false` when an existing
    /// link wins and the new connection is closed instead.
    async fn install(
        &self,
        peer: NodeId,
        dialer: NodeId,
        conn: Connection,
        mut send: SendStream,
        mut recv: RecvStream,
    ) -> bool {
        let generation = self.shared.generation.fetch_add(1, Ordering::Relaxed);
        let (outbox, mut queued) = mpsc::unbounded_channel::<Vec<u8>>();

        let replaced = {
            let mut links = self.shared.links.lock().await;
            if let Some(existing) = links.get(&peer) {
                if keep_existing(&existing.dialer, &dialer) {
                    drop(links);
                    trace!(peer = %short_id(&peer), "crossed dial, keeping existing link");
                    conn.close(0u32.into(), b"superseded");
                    return false;
                }
            }
            links.insert(
                peer,
                Link {
                    conn,
                    outbox,
                    generation,
                    dialer,
                },
            )
        };
        match replaced {
            Some(old) => old.conn.close(0u32.into(), b"superseded"),
            None => {
                debug!(peer = %short_id(&peer), "gossip link established");
                let _ = self.shared.events.send(TransportEvent::Connected(peer));
            }
        }

        let writer = self.shared.clone();
        tokio::spawn(async move {
            while let Some(bytes) = queued.recv().await {
                if let Err(err) = write_frame(&mut send, &bytes).await {
                    debug!(peer = %short_id(&peer), "gossip write failed: {err:?}");
                    break;
                }
            }
            let _ = send.finish();
            writer.drop_link(peer, generation).await;
        });

        let reader = self.shared.clone();
        tokio::spawn(async move {
            loop {
                match read_frame(&mut recv).await {
                    Ok(Some(bytes)) => {
                        trace!(peer = %short_id(&peer), len = bytes.len(), "frame received");
                        if reader
                            .events
                            .send(TransportEvent::Received(peer, bytes))
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        debug!(peer = %short_id(&peer), "gossip read failed: {err:?}");
                        break;
                    }
                }
            }
            reader.drop_link(peer, generation).await;
        });
        true
    }
}

#[async_trait]
impl Transport for IrohTransport {
    fn local_contact(&self) -> &Contact {
        &self.shared.contact
    }

    async fn connect(&self, addr: &str) -> Result<NodeId> {
        let endpoint_addr = parse_addr(addr)?;
        let peer = derive_node_id(endpoint_addr.id.as_bytes());
        if peer == self.shared.contact.id {
            bail!("refusing to connect to self");
        }
        if self.shared.links.lock().await.contains_key(&peer) {
            return Ok(peer);
        }
        let conn = self.shared.endpoint.connect(endpoint_addr, GOSSIP_ALPN).await?;
        let (mut send, recv) = conn.open_bi().await?;
        write_frame(&mut send, &protocol::encode(&self.shared.contact)?).await?;
        // Another dial may have finished meanwhile; either way a link to `peer` is up.
        let local = self.shared.contact.id;
        self.install(peer, local, conn, send, recv).await;
        Ok(peer)
    }

    async fn send(&self, peer: &NodeId, bytes: Vec<u8>) -> Result<()> {
        let links = self.shared.links.lock().await;
        let link = links
            .get(peer)
            .ok_or_else(|| anyhow!("not connected to {}", short_id(peer)))?;
        link.outbox
            .send(bytes)
            .map_err(|_| anyhow!("link to {} is closing", short_id(peer)))
    }

    async fn disconnect(&self, peer: &NodeId) {
        let generation = self.shared.links.lock().await.get(peer).map(|l| l.generation);
        if let Some(generation) = generation {
            self.shared.drop_link(*peer, generation).await;
        }
    }

    async fn is_connected(&self, peer: &NodeId) -> bool {
        self.shared.links.lock().await.contains_key(peer)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// DHT client
// ─────────────────────────────────────────────────────────────────────────────

/// [`DhtNetwork`] implementation issuing one QUIC connection per RPC.
pub struct IrohDhtNetwork {
    /// The iroh endpoint used for QUIC connections.
    pub endpoint: Endpoint,
    /// Contact info for the local node, included in every request.
    pub self_contact: Contact,
}

impl IrohDhtNetwork {
    async fn call(&self, to: &Contact, request: &DhtRequest) -> Result<DhtResponse> {
        let addr = parse_addr(&to.addr)?;
        let conn = self.endpoint.connect(addr, DHT_ALPN).await?;
        let (mut send, mut recv) = conn.open_bi().await?;
        write_frame(&mut send, &protocol::encode(request)?).await?;
        send.finish()?;
        let bytes = read_frame(&mut recv)
            .await?
            .ok_or_else(|| anyhow!("{} closed without replying", short_id(&to.id)))?;
        let response = protocol::decode(&bytes)?;
        // The reader closes, so the responder's final frame is never cut off.
        conn.close(0u32.into(), b"done");
        Ok(response)
    }
}

#[async_trait]
impl DhtNetwork for IrohDhtNetwork {
    async fn get_closest_nodes(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>> {
        let request = DhtRequest::GetClosestNodes(GetClosestNodesRequest {
            from: self.self_contact.clone(),
            target,
        });
        match self.call(to, &request).await? {
            DhtResponse::GetClosestNodesResponse(response) => Ok(response.nodes),
            DhtResponse::Pong => bail!("unexpected pong to closest-nodes request"),
        }
    }

    async fn ping(&self, to: &Contact) -> Result<()> {
        let request = DhtRequest::Ping(PingRequest {
            from: self.self_contact.clone(),
        });
        match self.call(to, &request).await? {
            DhtResponse::Pong => Ok(()),
            other => bail!("unexpected reply to ping: {other:?}"),
        }
    }
}
