//! # Iroh streamnet
//!
//! A peer-to-peer message propagation layer built on top of the
//! [`iroh`](https://crates.io/crates/iroh) transport stack. Nodes organize into
//! a gossip topology per stream partition, coordinated by a tracker that
//! introduces neighbors, and forward deduplicated stream messages along the
//! partition's edges.
//!
//! The crate is split into modules that can be reused independently:
//!
//! - [`contact_list`] and [`dht`]: the Kademlia-style bootstrap. A [`DhtNode`]
//!   joins an overlay by iterative closest-node lookups and fills a routing
//!   bucket.
//! - [`node`]: the per-partition gossip overlay ([`Node`]), with subscription
//!   negotiation, duplicate suppression and lifecycle events.
//! - [`tracker`]: the rendezvous service ([`Tracker`]) answering "who else is
//!   on this partition?".
//! - [`transport`]: the connection-layer seam ([`Transport`]) plus an
//!   in-process [`MemoryNetwork`] for tests and simulations.
//! - [`net`] and [`server`]: iroh QUIC implementations of the transport and
//!   the DHT RPCs, and the router handlers for inbound connections.
//! - [`protocol`] and [`framing`]: versioned JSON wire messages and the
//!   length-prefixed frames that carry them.
//!
//! ## Getting started
//!
//! ```no_run
//! use anyhow::Result;
//! use iroh_streamnet::{
//!     Contact, MemoryNetwork, MessageChain, Node, NodeConfig, StreamPartId, Tracker,
//!     TrackerConfig,
//! };
//!
//! # async fn demo() -> Result<()> {
//! let network = MemoryNetwork::new();
//! let (transport, events) = network.bind(Contact::new([0; 32], "tracker")).await?;
//! let _tracker = Tracker::start(transport, events, TrackerConfig::default());
//!
//! let (transport, events) = network.bind(Contact::new([1; 32], "node-1")).await?;
//! let node = Node::start(transport, events, NodeConfig::default().with_tracker("tracker"));
//!
//! let stream = StreamPartId::new("sensors", 0);
//! node.subscribe(stream.clone()).await?;
//! let mut chain = MessageChain::new(stream, &node.id());
//! node.publish(chain.next(1, b"hello".to_vec())).await?;
//! # Ok(())
//! # }
//! ```
//!
//! The binary in `src/main.rs` wires the same pieces to iroh endpoints.

pub mod config;
pub mod contact_list;
pub mod dedup;
pub mod dht;
pub mod error;
pub mod events;
pub mod framing;
pub mod identity;
pub mod message;
pub mod net;
pub mod node;
pub mod protocol;
pub mod server;
pub mod tracker;
pub mod transport;

pub use config::{DhtConfig, NodeConfig, TrackerConfig};
pub use contact_list::{ContactEntry, SortedContactList};
pub use dht::{DhtNetwork, DhtNode, JoinOutcome, JoinTermination, KBucket, RpcCounters};
pub use error::{DecodeError, DhtError, NodeError, TrackerError};
pub use events::{EventBus, NodeEvent};
pub use identity::{derive_node_id, xor_distance, Contact, NodeId};
pub use message::{MessageChain, MessageId, StreamMessage, StreamPartId};
pub use net::{IrohDhtNetwork, IrohTransport, DHT_ALPN, GOSSIP_ALPN};
pub use node::{Node, SubscriptionState};
pub use server::{handle_connection, DhtProtocolHandler, GossipProtocolHandler};
pub use tracker::{Tracker, TrackerRegistry};
pub use transport::{MemoryNetwork, MemoryTransport, Transport, TransportEvent, TransportEvents};
