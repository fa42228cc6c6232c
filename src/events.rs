//! Typed lifecycle events emitted by a [`Node`](crate::node::Node).
//!
//! Events are published on a broadcast bus owned by the node. Each receiver
//! sees every event emitted after it subscribed, in emission order, which lets
//! tests assert on them with `try_recv` once an operation has completed.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::identity::NodeId;
use crate::message::{MessageId, StreamMessage, StreamPartId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeEvent {
    /// A transport connection to `peer` was established.
    NodeConnected { peer: NodeId },
    /// The connection to `peer` is gone.
    NodeDisconnected { peer: NodeId },
    /// `peer` became a neighbor on `stream`.
    NodeSubscribed { peer: NodeId, stream: StreamPartId },
    /// `peer` stopped being a neighbor on `stream`.
    NodeUnsubscribed { peer: NodeId, stream: StreamPartId },
    /// A message passed the duplicate filter. `from` is `None` for local publishes.
    UnseenMessageReceived {
        message: Arc<StreamMessage>,
        from: Option<NodeId>,
    },
    DuplicateMessageReceived { id: MessageId, from: Option<NodeId> },
}

impl NodeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            NodeEvent::NodeConnected { .. } => "NODE_CONNECTED",
            NodeEvent::NodeDisconnected { .. } => "NODE_DISCONNECTED",
            NodeEvent::NodeSubscribed { .. } => "NODE_SUBSCRIBED",
            NodeEvent::NodeUnsubscribed { .. } => "NODE_UNSUBSCRIBED",
            NodeEvent::UnseenMessageReceived { .. } => "UNSEEN_MESSAGE_RECEIVED",
            NodeEvent::DuplicateMessageReceived { .. } => "DUPLICATE_MESSAGE_RECEIVED",
        }
    }
}

/// Broadcast bus for a single event type.
///
/// Emitting never blocks; with no receivers the event is dropped, and a
/// receiver that falls more than `capacity` events behind observes `Lagged`.
#[derive(Clone, Debug)]
pub struct EventBus<E: Clone> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: E) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
