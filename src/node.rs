//! Per-partition gossip overlay.
//!
//! A [`Node`] keeps, for every stream partition it is on, the set of
//! neighbors carrying that partition's traffic. Neighbors are found through
//! the tracker and negotiated with `SubscribeRequest`/`SubscribeResponse`.
//! Data messages pass a duplicate filter and are then forwarded to every
//! neighbor on the partition except the one they came from.
//!
//! One background task owns the transport event stream and a maintenance
//! tick. Public operations run on the caller's task. Both sides share one
//! mutex over the node state, and no lock is held while talking to the
//! transport.
//!
//! # Subscription states
//!
//! ```text
//! Unsubscribed ──subscribe──▶ Subscribing ──first ack──▶ Subscribed
//!       ▲                                                    │
//!       └──────────────── Unsubscribing ◀──unsubscribe───────┘
//! ```
//!
//! With `require_subscribe_ack` (the default) a requested peer only becomes a
//! neighbor once it accepts. The first node on a partition is `Subscribed`
//! as soon as the tracker reports no other candidates.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, timeout, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::NodeConfig;
use crate::dedup::DuplicateDetector;
use crate::error::NodeError;
use crate::events::{EventBus, NodeEvent};
use crate::identity::{short_id, Contact, NodeId};
use crate::message::{StreamMessage, StreamPartId};
use crate::protocol::{
    self, ControlMessage, NeighborsRequest, NeighborsResponse, SubscribeRequest,
    SubscribeResponse, TrackerRegister, TrackerUnregister, UnsubscribeRequest,
};
use crate::transport::{Transport, TransportEvent, TransportEvents};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Subscribed,
    Unsubscribing,
}

impl SubscriptionState {
    /// Whether the node takes part in the partition's traffic.
    pub fn is_active(self) -> bool {
        matches!(self, SubscriptionState::Subscribing | SubscriptionState::Subscribed)
    }
}

#[derive(Debug)]
struct StreamState {
    status: SubscriptionState,
    neighbors: BTreeSet<NodeId>,
    /// Sent a `SubscribeRequest` at the given time, no answer yet.
    pending: HashMap<NodeId, Instant>,
}

impl StreamState {
    fn new() -> Self {
        Self {
            status: SubscriptionState::Unsubscribed,
            neighbors: BTreeSet::new(),
            pending: HashMap::new(),
        }
    }

    fn involves(&self, peer: &NodeId) -> bool {
        self.neighbors.contains(peer) || self.pending.contains_key(peer)
    }
}

struct NodeState {
    streams: HashMap<StreamPartId, StreamState>,
    connections: HashSet<NodeId>,
    dedup: DuplicateDetector,
    violations: HashMap<NodeId, u32>,
    tracker: Option<NodeId>,
    tracker_requests: HashMap<u64, oneshot::Sender<NeighborsResponse>>,
}

impl NodeState {
    fn shares_partition(&self, peer: &NodeId) -> bool {
        self.streams.values().any(|s| s.involves(peer))
    }

    fn active_streams(&self) -> Vec<StreamPartId> {
        let mut streams: Vec<StreamPartId> = self
            .streams
            .iter()
            .filter(|(_, s)| s.status.is_active())
            .map(|(id, _)| id.clone())
            .collect();
        streams.sort();
        streams
    }
}

enum Command {
    ConnectTracker(oneshot::Sender<Result<Option<NodeId>, NodeError>>),
    Shutdown,
}

/// Snapshot of a node's overlay state for diagnostics.
#[derive(Clone, Debug, Default)]
pub struct NodeTelemetry {
    pub streams: usize,
    pub neighbors: usize,
    pub connections: usize,
    pub dedup_entries: usize,
    pub tracker_connected: bool,
}

struct Inner<T: Transport> {
    contact: Contact,
    config: NodeConfig,
    transport: T,
    state: Mutex<NodeState>,
    events: EventBus<NodeEvent>,
    messages: EventBus<Arc<StreamMessage>>,
    topology: watch::Sender<u64>,
    commands: mpsc::UnboundedSender<Command>,
    next_request_id: AtomicU64,
    refreshing: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running gossip node. Cheap to clone.
pub struct Node<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for Node<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> Node<T> {
    /// Start a node on `transport` and spawn its event loop.
    pub fn start(transport: T, events: TransportEvents, config: NodeConfig) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (topology, _) = watch::channel(0u64);
        let state = NodeState {
            streams: HashMap::new(),
            connections: HashSet::new(),
            dedup: DuplicateDetector::new(config.dedup_capacity, config.dedup_ttl),
            violations: HashMap::new(),
            tracker: None,
            tracker_requests: HashMap::new(),
        };
        let node = Self {
            inner: Arc::new(Inner {
                contact: transport.local_contact().clone(),
                events: EventBus::new(config.event_capacity),
                messages: EventBus::new(config.event_capacity),
                config,
                transport,
                state: Mutex::new(state),
                topology,
                commands,
                next_request_id: AtomicU64::new(1),
                refreshing: AtomicBool::new(false),
                task: Mutex::new(None),
            }),
        };
        let task = tokio::spawn(Self::run(Arc::downgrade(&node.inner), events, command_rx));
        if let Ok(mut slot) = node.inner.task.try_lock() {
            *slot = Some(task);
        }
        info!(
            node = %short_id(&node.inner.contact.id),
            addr = %node.inner.contact.addr,
            "node started"
        );
        node
    }

    pub fn id(&self) -> NodeId {
        self.inner.contact.id
    }

    pub fn contact(&self) -> &Contact {
        &self.inner.contact
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Lifecycle events emitted from now on.
    pub fn events(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    /// Deduplicated messages on partitions this node is subscribed to.
    pub fn message_listener(&self) -> broadcast::Receiver<Arc<StreamMessage>> {
        self.inner.messages.subscribe()
    }

    /// Run `callback` for every delivered message. Abort the returned task to
    /// stop listening.
    pub fn add_message_listener<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(Arc<StreamMessage>) + Send + 'static,
    {
        let mut rx = self.message_listener();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => callback(message),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "message listener lagging");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Subscriptions
    // ─────────────────────────────────────────────────────────────────────

    /// Join `stream`'s overlay.
    ///
    /// Returns once subscribe requests have been sent to the tracker's
    /// candidates; use [`wait_for_neighbors`](Self::wait_for_neighbors) to
    /// wait for acceptance. A tracker failure is reported but leaves the
    /// partition `Subscribing`, and the maintenance tick keeps retrying.
    pub async fn subscribe(&self, stream: StreamPartId) -> Result<(), NodeError> {
        if !stream.is_valid() {
            return Err(NodeError::InvalidMessage(format!(
                "invalid stream id {:?}",
                stream.stream_id
            )));
        }
        {
            let mut state = self.inner.state.lock().await;
            let entry = state
                .streams
                .entry(stream.clone())
                .or_insert_with(StreamState::new);
            if entry.status.is_active() {
                return Ok(());
            }
            entry.status = SubscriptionState::Subscribing;
        }
        info!(node = %short_id(&self.id()), %stream, "subscribing");
        self.bump_topology();

        let candidates = self.request_neighbors(&stream).await?;
        self.connect_candidates(&stream, candidates).await;
        Ok(())
    }

    /// Leave `stream`'s overlay.
    ///
    /// Neighbors are told to drop us, and connections that no longer share a
    /// partition are closed.
    pub async fn unsubscribe(&self, stream: &StreamPartId) -> Result<(), NodeError> {
        let peers: Vec<NodeId> = {
            let mut state = self.inner.state.lock().await;
            let Some(entry) = state.streams.get_mut(stream) else {
                return Ok(());
            };
            if !entry.status.is_active() {
                return Ok(());
            }
            entry.status = SubscriptionState::Unsubscribing;
            let neighbors = std::mem::take(&mut entry.neighbors);
            let pending = std::mem::take(&mut entry.pending);
            for peer in &neighbors {
                self.inner.events.emit(NodeEvent::NodeUnsubscribed {
                    peer: *peer,
                    stream: stream.clone(),
                });
            }
            neighbors.into_iter().chain(pending.into_keys()).collect()
        };
        info!(node = %short_id(&self.id()), %stream, neighbors = peers.len(), "unsubscribing");

        let request = ControlMessage::UnsubscribeRequest(UnsubscribeRequest {
            stream: stream.clone(),
        });
        for peer in &peers {
            if let Err(err) = self.send_control(peer, &request).await {
                debug!(peer = %short_id(peer), "unsubscribe not delivered: {err:?}");
            }
        }
        if let Some(tracker) = self.tracker_peer().await {
            let unregister = ControlMessage::TrackerUnregister(TrackerUnregister {
                stream: stream.clone(),
            });
            if let Err(err) = self.send_control(&tracker, &unregister).await {
                debug!("tracker unregister failed: {err:?}");
            }
        }

        let orphaned: Vec<NodeId> = {
            let mut state = self.inner.state.lock().await;
            // A subscribe that raced with us wins.
            if state
                .streams
                .get(stream)
                .is_some_and(|s| s.status == SubscriptionState::Unsubscribing)
            {
                state.streams.remove(stream);
            }
            peers
                .into_iter()
                .filter(|peer| !state.shares_partition(peer))
                .collect()
        };
        self.bump_topology();
        for peer in orphaned {
            debug!(peer = %short_id(&peer), "no shared partitions left, disconnecting");
            self.inner.transport.disconnect(&peer).await;
        }
        Ok(())
    }

    /// Wait until `stream` has at least `count` neighbors.
    pub async fn wait_for_neighbors(
        &self,
        stream: &StreamPartId,
        count: usize,
        limit: Duration,
    ) -> Result<(), NodeError> {
        let mut changes = self.inner.topology.subscribe();
        let wait = async {
            loop {
                if self.neighbor_count(stream).await >= count {
                    return Ok(());
                }
                if changes.changed().await.is_err() {
                    return Err(NodeError::Closed);
                }
            }
        };
        match timeout(limit, wait).await {
            Ok(result) => result,
            Err(_) => Err(NodeError::NeighborTimeout {
                stream: stream.clone(),
                wanted: count,
                have: self.neighbor_count(stream).await,
            }),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Data
    // ─────────────────────────────────────────────────────────────────────

    /// Inject a locally published message. Returns whether it was novel.
    pub async fn publish(&self, message: StreamMessage) -> Result<bool, NodeError> {
        self.handle_data(message, None).await
    }

    async fn handle_data(
        &self,
        message: StreamMessage,
        from: Option<NodeId>,
    ) -> Result<bool, NodeError> {
        message
            .validate(self.inner.config.max_message_size)
            .map_err(NodeError::InvalidMessage)?;

        let (deliver, targets) = {
            let mut state = self.inner.state.lock().await;
            if let Some(peer) = from {
                // Frames sent just before an unsubscribe landed are expected here.
                if !state
                    .streams
                    .get(message.stream())
                    .is_some_and(|entry| entry.involves(&peer))
                {
                    debug!(
                        peer = %short_id(&peer),
                        stream = %message.stream(),
                        "data from a peer outside the partition dropped"
                    );
                    return Ok(false);
                }
            }
            if !state.dedup.check_and_insert(&message.id) {
                trace!(id = %message.id, "duplicate dropped");
                self.inner.events.emit(NodeEvent::DuplicateMessageReceived {
                    id: message.id.clone(),
                    from,
                });
                return Ok(false);
            }
            match state.streams.get(message.stream()) {
                Some(entry) => (
                    entry.status.is_active(),
                    entry
                        .neighbors
                        .iter()
                        .filter(|peer| Some(**peer) != from)
                        .copied()
                        .collect::<Vec<_>>(),
                ),
                None => (false, Vec::new()),
            }
        };

        let message = Arc::new(message);
        self.inner.events.emit(NodeEvent::UnseenMessageReceived {
            message: message.clone(),
            from,
        });
        if deliver {
            self.inner.messages.emit(message.clone());
        }
        if !targets.is_empty() {
            let bytes = protocol::encode(&ControlMessage::Data((*message).clone()))?;
            for peer in &targets {
                if let Err(err) = self.inner.transport.send(peer, bytes.clone()).await {
                    debug!(peer = %short_id(peer), "forward failed: {err:?}");
                }
            }
        }
        trace!(id = %message.id, forwarded = targets.len(), deliver, "message propagated");
        Ok(true)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Inspection
    // ─────────────────────────────────────────────────────────────────────

    pub async fn neighbors(&self, stream: &StreamPartId) -> Vec<NodeId> {
        let state = self.inner.state.lock().await;
        state
            .streams
            .get(stream)
            .map(|s| s.neighbors.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn neighbor_count(&self, stream: &StreamPartId) -> usize {
        let state = self.inner.state.lock().await;
        state.streams.get(stream).map_or(0, |s| s.neighbors.len())
    }

    pub async fn subscription_state(&self, stream: &StreamPartId) -> SubscriptionState {
        let state = self.inner.state.lock().await;
        state
            .streams
            .get(stream)
            .map_or(SubscriptionState::Unsubscribed, |s| s.status)
    }

    /// Partitions the node is subscribing or subscribed to.
    pub async fn streams(&self) -> Vec<StreamPartId> {
        self.inner.state.lock().await.active_streams()
    }

    pub async fn connections(&self) -> Vec<NodeId> {
        let state = self.inner.state.lock().await;
        let mut peers: Vec<NodeId> = state.connections.iter().copied().collect();
        peers.sort();
        peers
    }

    pub async fn telemetry(&self) -> NodeTelemetry {
        let state = self.inner.state.lock().await;
        NodeTelemetry {
            streams: state.streams.len(),
            neighbors: state.streams.values().map(|s| s.neighbors.len()).sum(),
            connections: state.connections.len(),
            dedup_entries: state.dedup.len(),
            tracker_connected: state.tracker.is_some(),
        }
    }

    /// Stop the event loop and close every connection.
    pub async fn shutdown(&self) {
        let _ = self.inner.commands.send(Command::Shutdown);
        if let Some(task) = self.inner.task.lock().await.take() {
            let _ = task.await;
        }
        let peers: Vec<NodeId> = {
            let mut state = self.inner.state.lock().await;
            state.streams.clear();
            state.tracker_requests.clear();
            let mut peers: Vec<NodeId> = state.connections.drain().collect();
            peers.extend(state.tracker.take());
            peers
        };
        for peer in peers {
            self.inner.transport.disconnect(&peer).await;
        }
        info!(node = %short_id(&self.id()), "node stopped");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Tracker exchange
    // ─────────────────────────────────────────────────────────────────────

    async fn tracker_peer(&self) -> Option<NodeId> {
        self.inner.state.lock().await.tracker
    }

    /// Connect to the tracker if needed. `None` when no tracker is configured.
    async fn ensure_tracker(&self) -> Result<Option<NodeId>, NodeError> {
        if self.inner.config.tracker.is_none() {
            return Ok(None);
        }
        if let Some(peer) = self.tracker_peer().await {
            return Ok(Some(peer));
        }
        let (reply, rx) = oneshot::channel();
        self.inner
            .commands
            .send(Command::ConnectTracker(reply))
            .map_err(|_| NodeError::Closed)?;
        rx.await.map_err(|_| NodeError::Closed)?
    }

    /// Register on `stream` and ask the tracker for neighbor candidates.
    async fn request_neighbors(&self, stream: &StreamPartId) -> Result<Vec<Contact>, NodeError> {
        let Some(tracker) = self.ensure_tracker().await? else {
            return Ok(Vec::new());
        };
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner
            .state
            .lock()
            .await
            .tracker_requests
            .insert(request_id, tx);

        let register = ControlMessage::TrackerRegister(TrackerRegister {
            contact: self.inner.contact.clone(),
            stream: stream.clone(),
        });
        let request = ControlMessage::NeighborsRequest(NeighborsRequest {
            request_id,
            stream: stream.clone(),
            count: self.inner.config.target_neighbors,
        });
        let sent = match self.send_control(&tracker, &register).await {
            Ok(()) => self.send_control(&tracker, &request).await,
            Err(err) => Err(err),
        };
        if let Err(err) = sent {
            self.inner
                .state
                .lock()
                .await
                .tracker_requests
                .remove(&request_id);
            debug!("tracker request failed: {err:?}");
            return Err(NodeError::TrackerUnavailable);
        }

        match timeout(self.inner.config.tracker_timeout, rx).await {
            Ok(Ok(response)) => {
                debug!(
                    %stream,
                    candidates = response.neighbors.len(),
                    "tracker answered"
                );
                Ok(response.neighbors)
            }
            Ok(Err(_)) => Err(NodeError::TrackerUnavailable),
            Err(_) => {
                self.inner
                    .state
                    .lock()
                    .await
                    .tracker_requests
                    .remove(&request_id);
                Err(NodeError::TrackerTimeout)
            }
        }
    }

    /// Open connections to `candidates` and ask each to become a neighbor.
    async fn connect_candidates(&self, stream: &StreamPartId, candidates: Vec<Contact>) {
        if candidates.is_empty() {
            let mut state = self.inner.state.lock().await;
            if let Some(entry) = state.streams.get_mut(stream) {
                if entry.status == SubscriptionState::Subscribing && entry.pending.is_empty() {
                    entry.status = SubscriptionState::Subscribed;
                    info!(node = %short_id(&self.id()), %stream, "first node on partition");
                }
            }
            drop(state);
            self.bump_topology();
            return;
        }

        let request = ControlMessage::SubscribeRequest(SubscribeRequest {
            stream: stream.clone(),
        });
        for candidate in candidates {
            if candidate.id == self.id() {
                continue;
            }
            {
                let state = self.inner.state.lock().await;
                match state.streams.get(stream) {
                    Some(entry) if entry.status.is_active() => {
                        if entry.involves(&candidate.id) {
                            continue;
                        }
                    }
                    _ => return,
                }
            }
            let peer = match self.inner.transport.connect(&candidate.addr).await {
                Ok(peer) => peer,
                Err(err) => {
                    debug!(peer = %short_id(&candidate.id), "candidate unreachable: {err:?}");
                    continue;
                }
            };
            let optimistic = !self.inner.config.require_subscribe_ack;
            {
                let mut state = self.inner.state.lock().await;
                let Some(entry) = state.streams.get_mut(stream) else {
                    return;
                };
                if optimistic {
                    if entry.neighbors.insert(peer) {
                        self.inner.events.emit(NodeEvent::NodeSubscribed {
                            peer,
                            stream: stream.clone(),
                        });
                    }
                    entry.status = SubscriptionState::Subscribed;
                } else {
                    entry.pending.insert(peer, Instant::now());
                }
            }
            if optimistic {
                self.bump_topology();
            }
            if let Err(err) = self.send_control(&peer, &request).await {
                debug!(peer = %short_id(&peer), "subscribe request not delivered: {err:?}");
            } else {
                debug!(peer = %short_id(&peer), %stream, "subscribe requested");
            }
        }
    }

    /// Reconnect to the tracker if needed and top up partitions below the
    /// target neighbor count.
    async fn refresh(self) {
        let active = !self.inner.state.lock().await.active_streams().is_empty();
        if active {
            if let Err(err) = self.ensure_tracker().await {
                debug!("tracker reconnect failed: {err}");
            }
        }
        let wanted: Vec<StreamPartId> = {
            let state = self.inner.state.lock().await;
            state
                .streams
                .iter()
                .filter(|(_, s)| {
                    s.status.is_active()
                        && s.neighbors.len() + s.pending.len() < self.inner.config.target_neighbors
                })
                .map(|(id, _)| id.clone())
                .collect()
        };
        for stream in wanted {
            match self.request_neighbors(&stream).await {
                Ok(candidates) => self.connect_candidates(&stream, candidates).await,
                Err(err) => debug!(%stream, "neighbor refresh failed: {err}"),
            }
        }
        self.inner.refreshing.store(false, Ordering::Release);
    }

    fn schedule_refresh(&self) {
        if self.inner.config.tracker.is_none() {
            return;
        }
        if self.inner.refreshing.swap(true, Ordering::AcqRel) {
            return;
        }
        tokio::spawn(self.clone().refresh());
    }

    // ─────────────────────────────────────────────────────────────────────
    // Event loop
    // ─────────────────────────────────────────────────────────────────────

    /// Holds only a weak handle, so dropping the last [`Node`] ends the loop.
    async fn run(
        inner: Weak<Inner<T>>,
        mut events: TransportEvents,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let Some(period) = inner.upgrade().map(|inner| inner.config.refresh_interval) else {
            return;
        };
        let mut tick = time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;

        loop {
            tokio::select! {
                event = events.recv() => {
                    let (Some(event), Some(node)) = (event, Self::upgrade(&inner)) else {
                        break;
                    };
                    node.handle_event(event).await;
                }
                command = commands.recv() => match command {
                    Some(Command::ConnectTracker(reply)) => {
                        let Some(node) = Self::upgrade(&inner) else {
                            break;
                        };
                        let _ = reply.send(node.connect_tracker().await);
                    }
                    Some(Command::Shutdown) | None => break,
                },
                _ = tick.tick() => {
                    let Some(node) = Self::upgrade(&inner) else {
                        break;
                    };
                    node.maintain().await;
                }
            }
        }
        debug!("event loop stopped");
    }

    fn upgrade(inner: &Weak<Inner<T>>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    async fn maintain(&self) {
        let purged = self.inner.state.lock().await.dedup.purge_expired();
        if purged > 0 {
            trace!(purged, "expired dedup entries");
        }
        self.expire_pending().await;
        self.schedule_refresh();
    }

    /// Give up on subscribe requests older than `subscribe_timeout`.
    async fn expire_pending(&self) {
        let limit = self.inner.config.subscribe_timeout;
        let (expired, orphaned) = {
            let mut state = self.inner.state.lock().await;
            let mut expired = Vec::new();
            for (stream, entry) in state.streams.iter_mut() {
                entry.pending.retain(|peer, since| {
                    let keep = since.elapsed() < limit;
                    if !keep {
                        expired.push((stream.clone(), *peer));
                    }
                    keep
                });
            }
            let orphaned: HashSet<NodeId> = expired
                .iter()
                .map(|(_, peer)| *peer)
                .filter(|peer| !state.shares_partition(peer))
                .collect();
            (expired, orphaned)
        };
        if expired.is_empty() {
            return;
        }
        for (stream, peer) in expired {
            debug!(peer = %short_id(&peer), %stream, "subscribe request timed out");
            if orphaned.contains(&peer) {
                continue;
            }
            // Still connected for another partition; make sure a late ack is withdrawn.
            let undo = ControlMessage::UnsubscribeRequest(UnsubscribeRequest { stream });
            if let Err(err) = self.send_control(&peer, &undo).await {
                debug!(peer = %short_id(&peer), "unsubscribe not delivered: {err:?}");
            }
        }
        for peer in orphaned {
            self.inner.transport.disconnect(&peer).await;
        }
        self.bump_topology();
    }

    /// Runs on the event loop so the tracker id is known before its
    /// `Connected` event is processed.
    async fn connect_tracker(&self) -> Result<Option<NodeId>, NodeError> {
        let Some(addr) = self.inner.config.tracker.clone() else {
            return Ok(None);
        };
        if let Some(peer) = self.tracker_peer().await {
            return Ok(Some(peer));
        }
        let peer = match self.inner.transport.connect(&addr).await {
            Ok(peer) => peer,
            Err(err) => {
                warn!(%addr, "tracker unreachable: {err:?}");
                return Err(NodeError::TrackerUnavailable);
            }
        };
        let streams = {
            let mut state = self.inner.state.lock().await;
            state.tracker = Some(peer);
            state.active_streams()
        };
        info!(tracker = %short_id(&peer), streams = streams.len(), "connected to tracker");
        for stream in streams {
            let register = ControlMessage::TrackerRegister(TrackerRegister {
                contact: self.inner.contact.clone(),
                stream,
            });
            if let Err(err) = self.send_control(&peer, &register).await {
                debug!("re-register failed: {err:?}");
            }
        }
        Ok(Some(peer))
    }

    async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected(peer) => {
                let fresh = {
                    let mut state = self.inner.state.lock().await;
                    state.tracker != Some(peer) && state.connections.insert(peer)
                };
                if fresh {
                    debug!(peer = %short_id(&peer), "peer connected");
                    self.inner.events.emit(NodeEvent::NodeConnected { peer });
                }
            }
            TransportEvent::Disconnected(peer) => self.handle_disconnect(peer).await,
            TransportEvent::Received(peer, bytes) => match protocol::decode::<ControlMessage>(&bytes) {
                Ok(message) => self.handle_control(peer, message).await,
                Err(err) => self.record_violation(peer, &err.to_string()).await,
            },
        }
    }

    async fn handle_disconnect(&self, peer: NodeId) {
        let (was_connected, affected) = {
            let mut state = self.inner.state.lock().await;
            if state.tracker == Some(peer) {
                state.tracker = None;
                // Dropping the senders fails every in-flight request.
                state.tracker_requests.clear();
                drop(state);
                warn!(tracker = %short_id(&peer), "tracker connection lost");
                return;
            }
            state.violations.remove(&peer);
            let was_connected = state.connections.remove(&peer);
            let mut affected = 0;
            for entry in state.streams.values_mut() {
                let dropped = entry.neighbors.remove(&peer);
                entry.pending.remove(&peer);
                if dropped && entry.status.is_active() {
                    affected += 1;
                }
            }
            (was_connected, affected)
        };
        if was_connected {
            info!(peer = %short_id(&peer), partitions = affected, "peer disconnected");
            self.inner.events.emit(NodeEvent::NodeDisconnected { peer });
        }
        if affected > 0 {
            self.bump_topology();
            self.schedule_refresh();
        }
    }

    async fn handle_control(&self, peer: NodeId, message: ControlMessage) {
        let from_tracker = self.tracker_peer().await == Some(peer);
        match message {
            ControlMessage::NeighborsResponse(response) if from_tracker => {
                let waiter = self
                    .inner
                    .state
                    .lock()
                    .await
                    .tracker_requests
                    .remove(&response.request_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => debug!(request_id = response.request_id, "late tracker response"),
                }
            }
            ControlMessage::SubscribeRequest(req) => self.on_subscribe_request(peer, req.stream).await,
            ControlMessage::SubscribeResponse(resp) => self.on_subscribe_response(peer, resp).await,
            ControlMessage::UnsubscribeRequest(req) => self.on_unsubscribe_request(peer, req.stream).await,
            ControlMessage::Data(message) => {
                if let Err(err) = self.handle_data(message, Some(peer)).await {
                    match err {
                        NodeError::InvalidMessage(reason) => self.record_violation(peer, &reason).await,
                        other => debug!(peer = %short_id(&peer), "data handling failed: {other}"),
                    }
                }
            }
            other => {
                debug!(peer = %short_id(&peer), kind = other.name(), "ignoring unexpected message");
            }
        }
    }

    async fn on_subscribe_request(&self, peer: NodeId, stream: StreamPartId) {
        let accepted = {
            let mut state = self.inner.state.lock().await;
            match state.streams.get_mut(&stream) {
                Some(entry) if entry.status.is_active() => {
                    if entry.neighbors.contains(&peer) {
                        true
                    } else if entry.neighbors.len() < self.inner.config.max_neighbors {
                        entry.neighbors.insert(peer);
                        entry.pending.remove(&peer);
                        entry.status = SubscriptionState::Subscribed;
                        self.inner.events.emit(NodeEvent::NodeSubscribed {
                            peer,
                            stream: stream.clone(),
                        });
                        true
                    } else {
                        false
                    }
                }
                _ => false,
            }
        };
        debug!(peer = %short_id(&peer), %stream, accepted, "subscribe request");
        if accepted {
            self.bump_topology();
        }
        let response = ControlMessage::SubscribeResponse(SubscribeResponse { stream, accepted });
        if let Err(err) = self.send_control(&peer, &response).await {
            debug!(peer = %short_id(&peer), "subscribe response not delivered: {err:?}");
        }
    }

    async fn on_subscribe_response(&self, peer: NodeId, response: SubscribeResponse) {
        let stream = response.stream;
        enum Followup {
            None,
            Undo,
            Release,
        }
        let (followup, unsolicited) = {
            let mut state = self.inner.state.lock().await;
            let max_neighbors = self.inner.config.max_neighbors;
            let mut unsolicited = false;
            let followup = match state.streams.get_mut(&stream) {
                Some(entry) if entry.status.is_active() => {
                    // Optimistic mode counts the peer before its answer arrives.
                    let requested =
                        entry.pending.remove(&peer).is_some() || entry.neighbors.contains(&peer);
                    if !requested {
                        unsolicited = response.accepted;
                        if response.accepted {
                            Followup::Undo
                        } else {
                            Followup::Release
                        }
                    } else if response.accepted {
                        if entry.neighbors.contains(&peer) {
                            entry.status = SubscriptionState::Subscribed;
                            Followup::None
                        } else if entry.neighbors.len() < max_neighbors {
                            entry.neighbors.insert(peer);
                            self.inner.events.emit(NodeEvent::NodeSubscribed {
                                peer,
                                stream: stream.clone(),
                            });
                            entry.status = SubscriptionState::Subscribed;
                            Followup::None
                        } else {
                            Followup::Undo
                        }
                    } else {
                        if entry.neighbors.remove(&peer) {
                            self.inner.events.emit(NodeEvent::NodeUnsubscribed {
                                peer,
                                stream: stream.clone(),
                            });
                        }
                        Followup::Release
                    }
                }
                _ if response.accepted => Followup::Undo,
                _ => Followup::Release,
            };
            let followup = match followup {
                Followup::Release if state.shares_partition(&peer) => Followup::None,
                other => other,
            };
            (followup, unsolicited)
        };
        debug!(peer = %short_id(&peer), %stream, accepted = response.accepted, "subscribe response");
        self.bump_topology();
        if unsolicited {
            self.record_violation(peer, "acknowledged a subscription nobody requested")
                .await;
        }
        match followup {
            Followup::None => {}
            Followup::Undo => {
                let undo = ControlMessage::UnsubscribeRequest(UnsubscribeRequest { stream });
                if let Err(err) = self.send_control(&peer, &undo).await {
                    debug!(peer = %short_id(&peer), "late unsubscribe not delivered: {err:?}");
                }
                if !self.inner.state.lock().await.shares_partition(&peer) {
                    self.inner.transport.disconnect(&peer).await;
                }
            }
            Followup::Release => {
                self.inner.transport.disconnect(&peer).await;
            }
        }
    }

    async fn on_unsubscribe_request(&self, peer: NodeId, stream: StreamPartId) {
        let (removed, orphaned) = {
            let mut state = self.inner.state.lock().await;
            let mut removed = false;
            if let Some(entry) = state.streams.get_mut(&stream) {
                removed = entry.neighbors.remove(&peer);
                entry.pending.remove(&peer);
            }
            if removed {
                self.inner.events.emit(NodeEvent::NodeUnsubscribed {
                    peer,
                    stream: stream.clone(),
                });
            }
            (removed, !state.shares_partition(&peer))
        };
        debug!(peer = %short_id(&peer), %stream, removed, "peer unsubscribed");
        if removed {
            self.bump_topology();
        }
        if orphaned {
            self.inner.transport.disconnect(&peer).await;
        } else if removed {
            self.schedule_refresh();
        }
    }

    async fn record_violation(&self, peer: NodeId, reason: &str) {
        let count = {
            let mut state = self.inner.state.lock().await;
            let count = state.violations.entry(peer).or_insert(0);
            *count += 1;
            *count
        };
        warn!(peer = %short_id(&peer), count, "protocol violation: {reason}");
        if count >= self.inner.config.max_protocol_violations {
            warn!(peer = %short_id(&peer), "too many protocol violations, disconnecting");
            self.inner.state.lock().await.violations.remove(&peer);
            self.inner.transport.disconnect(&peer).await;
        }
    }

    async fn send_control(&self, peer: &NodeId, message: &ControlMessage) -> anyhow::Result<()> {
        let bytes = protocol::encode(message)?;
        self.inner.transport.send(peer, bytes).await
    }

    fn bump_topology(&self) {
        self.inner.topology.send_modify(|version| *version += 1);
    }
}
