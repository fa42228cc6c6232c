//! Rendezvous service brokering neighbor introductions per stream partition.
//!
//! The tracker is not a routing participant. It records which nodes are on
//! which partition and answers "who else is on P?" with a random sample that
//! excludes the asker.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::TrackerConfig;
use crate::error::TrackerError;
use crate::identity::{short_id, Contact, NodeId};
use crate::message::StreamPartId;
use crate::protocol::{self, ControlMessage, NeighborsResponse};
use crate::transport::{Transport, TransportEvent, TransportEvents};

/// Who is subscribed to what.
pub struct TrackerRegistry {
    streams: HashMap<StreamPartId, HashMap<NodeId, Contact>>,
    nodes: HashMap<NodeId, HashSet<StreamPartId>>,
    max_returned: usize,
    rng: StdRng,
}

impl TrackerRegistry {
    pub fn new(config: &TrackerConfig) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            streams: HashMap::new(),
            nodes: HashMap::new(),
            max_returned: config.max_neighbors_returned.max(1),
            rng,
        }
    }

    /// Record `contact` on `stream`. Returns `false` if it was already there;
    /// the stored address is refreshed either way.
    pub fn register(&mut self, contact: Contact, stream: StreamPartId) -> bool {
        let id = contact.id;
        let fresh = self
            .streams
            .entry(stream.clone())
            .or_default()
            .insert(id, contact)
            .is_none();
        self.nodes.entry(id).or_default().insert(stream);
        fresh
    }

    pub fn unregister(&mut self, node: &NodeId, stream: &StreamPartId) -> bool {
        let removed = match self.streams.get_mut(stream) {
            Some(members) => {
                let removed = members.remove(node).is_some();
                if members.is_empty() {
                    self.streams.remove(stream);
                }
                removed
            }
            None => false,
        };
        if let Some(streams) = self.nodes.get_mut(node) {
            streams.remove(stream);
            if streams.is_empty() {
                self.nodes.remove(node);
            }
        }
        removed
    }

    /// Forget every partition `node` was on.
    pub fn unregister_all(&mut self, node: &NodeId) -> Vec<StreamPartId> {
        let streams: Vec<StreamPartId> = self
            .nodes
            .get(node)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        for stream in &streams {
            self.unregister(node, stream);
        }
        streams
    }

    /// Up to `count` other nodes on `stream`, sampled at random.
    ///
    /// `NoCandidates` means the requester is alone on the partition.
    pub fn get_neighbors(
        &mut self,
        node: &NodeId,
        stream: &StreamPartId,
        count: usize,
    ) -> Result<Vec<Contact>, TrackerError> {
        let mut candidates: Vec<&Contact> = self
            .streams
            .get(stream)
            .map(|members| members.values().filter(|c| &c.id != node).collect())
            .unwrap_or_default();
        if candidates.is_empty() {
            return Err(TrackerError::NoCandidates {
                stream: stream.clone(),
            });
        }
        // Map iteration order is random; sort so a seeded rng is reproducible.
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        let amount = count.min(self.max_returned);
        Ok(candidates
            .choose_multiple(&mut self.rng, amount)
            .map(|c| (*c).clone())
            .collect())
    }

    /// Ids registered on `stream`, sorted.
    pub fn subscribers(&self, stream: &StreamPartId) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .streams
            .get(stream)
            .map(|members| members.keys().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn streams_of(&self, node: &NodeId) -> Vec<StreamPartId> {
        let mut streams: Vec<StreamPartId> = self
            .nodes
            .get(node)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        streams.sort();
        streams
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }
}

/// Tracker service bound to a transport endpoint.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct Tracker {
    contact: Contact,
    registry: Arc<Mutex<TrackerRegistry>>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Tracker {
    /// Serve tracker requests arriving on `events` until the channel closes
    /// or [`shutdown`](Self::shutdown) is called.
    pub fn start<T: Transport>(transport: T, events: TransportEvents, config: TrackerConfig) -> Self {
        let contact = transport.local_contact().clone();
        let registry = Arc::new(Mutex::new(TrackerRegistry::new(&config)));
        let task = tokio::spawn(serve(transport, events, registry.clone()));
        info!(tracker = %short_id(&contact.id), addr = %contact.addr, "tracker started");
        Self {
            contact,
            registry,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    pub fn contact(&self) -> &Contact {
        &self.contact
    }

    pub async fn subscribers(&self, stream: &StreamPartId) -> Vec<NodeId> {
        self.registry.lock().await.subscribers(stream)
    }

    pub async fn streams_of(&self, node: &NodeId) -> Vec<StreamPartId> {
        self.registry.lock().await.streams_of(node)
    }

    pub async fn node_count(&self) -> usize {
        self.registry.lock().await.node_count()
    }

    pub async fn shutdown(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
    }
}

async fn serve<T: Transport>(
    transport: T,
    mut events: TransportEvents,
    registry: Arc<Mutex<TrackerRegistry>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Connected(peer) => {
                debug!(peer = %short_id(&peer), "node connected to tracker");
            }
            TransportEvent::Disconnected(peer) => {
                let dropped = registry.lock().await.unregister_all(&peer);
                if !dropped.is_empty() {
                    info!(
                        peer = %short_id(&peer),
                        streams = dropped.len(),
                        "node left, registrations dropped"
                    );
                }
            }
            TransportEvent::Received(peer, bytes) => {
                let message = match protocol::decode::<ControlMessage>(&bytes) {
                    Ok(message) => message,
                    Err(err) => {
                        warn!(peer = %short_id(&peer), "dropping malformed tracker frame: {err}");
                        continue;
                    }
                };
                if let Some(reply) = handle_message(&registry, peer, message).await {
                    let sent = match protocol::encode(&reply) {
                        Ok(bytes) => transport.send(&peer, bytes).await,
                        Err(err) => Err(err),
                    };
                    if let Err(err) = sent {
                        debug!(peer = %short_id(&peer), "failed to answer node: {err:?}");
                    }
                }
            }
        }
    }
    debug!("tracker event stream closed");
}

async fn handle_message(
    registry: &Mutex<TrackerRegistry>,
    peer: NodeId,
    message: ControlMessage,
) -> Option<ControlMessage> {
    match message {
        ControlMessage::TrackerRegister(req) => {
            // Trust the transport for identity, the message for reachability.
            let contact = Contact::new(peer, req.contact.addr);
            let fresh = registry.lock().await.register(contact, req.stream.clone());
            if fresh {
                info!(peer = %short_id(&peer), stream = %req.stream, "node registered");
            }
            None
        }
        ControlMessage::TrackerUnregister(req) => {
            if registry.lock().await.unregister(&peer, &req.stream) {
                info!(peer = %short_id(&peer), stream = %req.stream, "node unregistered");
            }
            None
        }
        ControlMessage::NeighborsRequest(req) => {
            let result = registry
                .lock()
                .await
                .get_neighbors(&peer, &req.stream, req.count);
            let neighbors = match result {
                Ok(neighbors) => neighbors,
                Err(TrackerError::NoCandidates { stream }) => {
                    debug!(peer = %short_id(&peer), %stream, "first node on partition");
                    Vec::new()
                }
            };
            debug!(
                peer = %short_id(&peer),
                stream = %req.stream,
                returned = neighbors.len(),
                "neighbors requested"
            );
            Some(ControlMessage::NeighborsResponse(NeighborsResponse {
                request_id: req.request_id,
                stream: req.stream,
                neighbors,
            }))
        }
        other => {
            debug!(peer = %short_id(&peer), kind = other.name(), "ignoring message sent to tracker");
            None
        }
    }
}
