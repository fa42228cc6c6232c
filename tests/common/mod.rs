#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::{sleep, timeout, Duration};

use iroh_streamnet::protocol::{self, ControlMessage};
use iroh_streamnet::{
    Contact, DhtConfig, DhtNetwork, DhtNode, MemoryNetwork, MemoryTransport, Node, NodeConfig,
    NodeEvent, NodeId, Tracker, TrackerConfig, Transport, TransportEvent, TransportEvents,
};

pub const TRACKER_ADDR: &str = "tracker";

// ─────────────────────────────────────────────────────────────────────────────
// DHT harness
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct TestNetwork {
    registry: Arc<NetworkRegistry>,
    self_contact: Contact,
    latencies: Arc<Mutex<HashMap<NodeId, Duration>>>,
    failures: Arc<Mutex<HashSet<NodeId>>>,
    lookups: Arc<Mutex<Vec<NodeId>>>,
    pings: Arc<Mutex<Vec<NodeId>>>,
}

impl TestNetwork {
    pub fn new(registry: Arc<NetworkRegistry>, self_contact: Contact) -> Self {
        Self {
            registry,
            self_contact,
            latencies: Arc::new(Mutex::new(HashMap::new())),
            failures: Arc::new(Mutex::new(HashSet::new())),
            lookups: Arc::new(Mutex::new(Vec::new())),
            pings: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn set_latency(&self, node: NodeId, latency: Duration) {
        self.latencies.lock().await.insert(node, latency);
    }

    pub async fn set_failure(&self, node: NodeId, fail: bool) {
        let mut failures = self.failures.lock().await;
        if fail {
            failures.insert(node);
        } else {
            failures.remove(&node);
        }
    }

    /// Peers asked for closest nodes, in call order.
    pub async fn lookup_calls(&self) -> Vec<NodeId> {
        self.lookups.lock().await.clone()
    }

    pub async fn ping_calls(&self) -> Vec<NodeId> {
        self.pings.lock().await.clone()
    }

    async fn should_fail(&self, node: &NodeId) -> bool {
        self.failures.lock().await.contains(node)
    }

    async fn maybe_sleep(&self, node: &NodeId) {
        let latency = self.latencies.lock().await.get(node).copied();
        if let Some(delay) = latency {
            sleep(delay).await;
        }
    }
}

#[derive(Default)]
pub struct NetworkRegistry {
    peers: RwLock<HashMap<NodeId, Arc<DhtNode<TestNetwork>>>>,
}

impl NetworkRegistry {
    pub async fn register(&self, node: &Arc<DhtNode<TestNetwork>>) {
        self.peers.write().await.insert(node.id(), node.clone());
    }

    pub async fn get(&self, id: &NodeId) -> Option<Arc<DhtNode<TestNetwork>>> {
        self.peers.read().await.get(id).cloned()
    }
}

#[async_trait::async_trait]
impl DhtNetwork for TestNetwork {
    async fn get_closest_nodes(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>> {
        self.lookups.lock().await.push(to.id);
        if self.should_fail(&to.id).await {
            return Err(anyhow!("injected network failure"));
        }
        self.maybe_sleep(&to.id).await;
        match self.registry.get(&to.id).await {
            Some(peer) => Ok(peer.handle_get_closest_nodes(&self.self_contact, target).await),
            None => Err(anyhow!("peer not reachable")),
        }
    }

    async fn ping(&self, to: &Contact) -> Result<()> {
        self.pings.lock().await.push(to.id);
        if self.should_fail(&to.id).await {
            return Err(anyhow!("injected network failure"));
        }
        self.maybe_sleep(&to.id).await;
        match self.registry.get(&to.id).await {
            Some(peer) => {
                peer.handle_ping(&self.self_contact).await;
                Ok(())
            }
            None => Err(anyhow!("peer not reachable")),
        }
    }
}

pub struct TestNode {
    pub node: Arc<DhtNode<TestNetwork>>,
    pub network: TestNetwork,
}

impl TestNode {
    pub async fn new(registry: Arc<NetworkRegistry>, index: u32, config: DhtConfig) -> Self {
        Self::with_id(registry, make_node_id(index), config).await
    }

    pub async fn with_id(registry: Arc<NetworkRegistry>, id: NodeId, config: DhtConfig) -> Self {
        let contact = Contact::new(id, format!("node-{}", hex::encode(&id[..4])));
        let network = TestNetwork::new(registry.clone(), contact.clone());
        let node = Arc::new(DhtNode::new(contact, network.clone(), config));
        registry.register(&node).await;
        Self { node, network }
    }

    pub fn contact(&self) -> Contact {
        self.node.contact()
    }

    pub fn id(&self) -> NodeId {
        self.node.id()
    }
}

/// Make every pair of `nodes` know about each other.
pub async fn introduce_all(nodes: &[&TestNode]) {
    for a in nodes {
        for b in nodes {
            if a.id() != b.id() {
                a.node.observe_contact(b.contact()).await;
            }
        }
    }
}

pub fn make_node_id(index: u32) -> NodeId {
    let mut id = [0u8; 32];
    id[..4].copy_from_slice(&index.to_be_bytes());
    id
}

/// An id whose first byte is `byte` and the rest zero.
pub fn prefix_id(byte: u8) -> NodeId {
    let mut id = [0u8; 32];
    id[0] = byte;
    id
}

// ─────────────────────────────────────────────────────────────────────────────
// Gossip harness
// ─────────────────────────────────────────────────────────────────────────────

pub fn node_contact(index: u32) -> Contact {
    Contact::new(make_node_id(index), format!("node-{index}"))
}

pub fn gossip_config() -> NodeConfig {
    NodeConfig {
        tracker_timeout: Duration::from_secs(2),
        ..NodeConfig::default().with_tracker(TRACKER_ADDR)
    }
}

/// An in-memory network with a tracker listening at [`TRACKER_ADDR`].
pub struct Cluster {
    pub network: Arc<MemoryNetwork>,
    pub tracker: Tracker,
}

impl Cluster {
    pub async fn new() -> Self {
        let network = MemoryNetwork::new();
        let (transport, events) = network
            .bind(Contact::new([0xFF; 32], TRACKER_ADDR))
            .await
            .expect("bind tracker");
        let tracker = Tracker::start(
            transport,
            events,
            TrackerConfig {
                rng_seed: Some(7),
                ..TrackerConfig::default()
            },
        );
        Self { network, tracker }
    }

    pub async fn spawn_node(&self, index: u32) -> Node<MemoryTransport> {
        self.spawn_node_with(index, gossip_config()).await
    }

    pub async fn spawn_node_with(&self, index: u32, config: NodeConfig) -> Node<MemoryTransport> {
        let (transport, events) = self
            .network
            .bind(node_contact(index))
            .await
            .expect("bind node");
        Node::start(transport, events, config)
    }

    pub async fn wire_peer(&self, index: u32) -> WirePeer {
        let (transport, events) = self
            .network
            .bind(node_contact(index))
            .await
            .expect("bind wire peer");
        WirePeer { transport, events }
    }
}

/// A raw endpoint speaking the wire protocol by hand.
pub struct WirePeer {
    pub transport: MemoryTransport,
    pub events: TransportEvents,
}

impl WirePeer {
    pub fn id(&self) -> NodeId {
        self.transport.local_contact().id
    }

    pub async fn connect(&self, addr: &str) -> NodeId {
        self.transport.connect(addr).await.expect("wire peer connect")
    }

    pub async fn send(&self, peer: &NodeId, message: &ControlMessage) {
        let bytes = protocol::encode(message).expect("encode");
        self.transport.send(peer, bytes).await.expect("wire peer send");
    }

    pub async fn send_raw(&self, peer: &NodeId, bytes: &[u8]) {
        self.transport
            .send(peer, bytes.to_vec())
            .await
            .expect("wire peer send");
    }

    /// Next decoded control message, skipping connection events.
    pub async fn next_message(&mut self, wait: Duration) -> Option<ControlMessage> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .ok()??;
            if let TransportEvent::Received(_, bytes) = event {
                return protocol::decode(&bytes).ok();
            }
        }
    }

    /// Every event already queued.
    pub fn drain(&mut self) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Control messages among the queued events.
    pub fn drain_messages(&mut self) -> Vec<ControlMessage> {
        self.drain()
            .into_iter()
            .filter_map(|event| match event {
                TransportEvent::Received(_, bytes) => protocol::decode(&bytes).ok(),
                _ => None,
            })
            .collect()
    }
}

/// Wait for the first event matching `pred`, skipping the others.
pub async fn expect_event<F>(
    rx: &mut broadcast::Receiver<NodeEvent>,
    wait: Duration,
    mut pred: F,
) -> NodeEvent
where
    F: FnMut(&NodeEvent) -> bool,
{
    let found = timeout(wait, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await;
    found.expect("timed out waiting for event")
}

/// Poll `check` until it holds or `wait` runs out.
pub async fn eventually<F, Fut>(wait: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
}
