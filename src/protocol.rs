//! Wire message definitions.
//!
//! Every frame carries a versioned JSON envelope. Gossip and tracker traffic
//! uses [`ControlMessage`]; the DHT bootstrap uses the [`DhtRequest`] /
//! [`DhtResponse`] pair over its own request/response exchange.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::identity::{Contact, NodeId};
use crate::message::{StreamMessage, StreamPartId};

/// Current wire version. Frames with any other version are rejected.
pub const PROTOCOL_VERSION: u8 = 1;

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    version: u8,
    body: T,
}

#[derive(Deserialize)]
struct VersionHeader {
    version: u8,
}

/// Ask a peer to become a neighbor on a partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub stream: StreamPartId,
}

/// Answer to a [`SubscribeRequest`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeResponse {
    pub stream: StreamPartId,
    /// `false` when the responder is not on the partition or has no room.
    pub accepted: bool,
}

/// Stop being neighbors on a partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    pub stream: StreamPartId,
}

/// Announce to the tracker that the sender is on a partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerRegister {
    /// How other nodes can reach the sender.
    pub contact: Contact,
    pub stream: StreamPartId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerUnregister {
    pub stream: StreamPartId,
}

/// Ask the tracker for neighbor candidates on a partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborsRequest {
    /// Correlates the response; chosen by the requester.
    pub request_id: u64,
    pub stream: StreamPartId,
    pub count: usize,
}

/// Candidates for a partition. Empty when the requester is the first node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborsResponse {
    pub request_id: u64,
    pub stream: StreamPartId,
    pub neighbors: Vec<Contact>,
}

/// Messages exchanged over node-to-node and node-to-tracker connections.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    SubscribeRequest(SubscribeRequest),
    SubscribeResponse(SubscribeResponse),
    UnsubscribeRequest(UnsubscribeRequest),
    /// Stream data being gossiped along partition edges.
    Data(StreamMessage),
    TrackerRegister(TrackerRegister),
    TrackerUnregister(TrackerUnregister),
    NeighborsRequest(NeighborsRequest),
    NeighborsResponse(NeighborsResponse),
}

impl ControlMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::SubscribeRequest(_) => "SubscribeRequest",
            ControlMessage::SubscribeResponse(_) => "SubscribeResponse",
            ControlMessage::UnsubscribeRequest(_) => "UnsubscribeRequest",
            ControlMessage::Data(_) => "Data",
            ControlMessage::TrackerRegister(_) => "TrackerRegister",
            ControlMessage::TrackerUnregister(_) => "TrackerUnregister",
            ControlMessage::NeighborsRequest(_) => "NeighborsRequest",
            ControlMessage::NeighborsResponse(_) => "NeighborsResponse",
        }
    }
}

/// Find nodes closest to a target id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetClosestNodesRequest {
    /// The caller, so the responder can learn about it.
    pub from: Contact,
    pub target: NodeId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetClosestNodesResponse {
    pub nodes: Vec<Contact>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRequest {
    pub from: Contact,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DhtRequest {
    GetClosestNodes(GetClosestNodesRequest),
    Ping(PingRequest),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DhtResponse {
    GetClosestNodesResponse(GetClosestNodesResponse),
    Pong,
}

/// Serialize a message inside a versioned envelope.
pub fn encode<T: Serialize>(body: &T) -> anyhow::Result<Vec<u8>> {
    let envelope = Envelope {
        version: PROTOCOL_VERSION,
        body,
    };
    Ok(serde_json::to_vec(&envelope)?)
}

/// Parse a versioned envelope, rejecting unknown versions and message types.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DecodeError> {
    let header: VersionHeader = serde_json::from_slice(bytes)?;
    if header.version != PROTOCOL_VERSION {
        return Err(DecodeError::UnsupportedVersion {
            found: header.version,
            expected: PROTOCOL_VERSION,
        });
    }
    let envelope: Envelope<T> = serde_json::from_slice(bytes)?;
    Ok(envelope.body)
}
