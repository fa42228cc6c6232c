//! Stream data messages and the identity used to deduplicate them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::{short_id, NodeId};

/// Longest accepted stream id in bytes.
pub const MAX_STREAM_ID_LENGTH: usize = 255;

/// A single partition of a stream. Gossip topology is kept per partition.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamPartId {
    pub stream_id: String,
    pub partition: u32,
}

impl StreamPartId {
    pub fn new(stream_id: impl Into<String>, partition: u32) -> Self {
        Self {
            stream_id: stream_id.into(),
            partition,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.stream_id.is_empty() && self.stream_id.len() <= MAX_STREAM_ID_LENGTH
    }
}

impl fmt::Display for StreamPartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.stream_id, self.partition)
    }
}

/// Position of a message inside its publisher's message chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    pub timestamp: u64,
    pub sequence_number: u32,
}

/// Identity of a message; two messages with the same id are the same message.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId {
    pub stream: StreamPartId,
    pub publisher_id: String,
    pub msg_chain_id: String,
    pub timestamp: u64,
    pub sequence_number: u32,
}

impl MessageId {
    pub fn message_ref(&self) -> MessageRef {
        MessageRef {
            timestamp: self.timestamp,
            sequence_number: self.sequence_number,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.stream, self.publisher_id, self.msg_chain_id, self.timestamp, self.sequence_number
        )
    }
}

/// An immutable unit of stream data. Nodes forward it unchanged.
///
/// Ordering along a message chain (`prev_msg_ref`) and the signature are
/// interpreted by higher layers; the overlay only carries them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMessage {
    pub id: MessageId,
    pub prev_msg_ref: Option<MessageRef>,
    pub content: Vec<u8>,
    pub signature: Option<String>,
}

impl StreamMessage {
    pub fn stream(&self) -> &StreamPartId {
        &self.id.stream
    }

    /// Check the structural limits a node enforces before forwarding.
    pub fn validate(&self, max_size: usize) -> Result<(), String> {
        if !self.id.stream.is_valid() {
            return Err(format!("invalid stream id {:?}", self.id.stream.stream_id));
        }
        if self.content.len() > max_size {
            return Err(format!(
                "payload of {} bytes exceeds limit of {max_size}",
                self.content.len()
            ));
        }
        Ok(())
    }
}

/// Builder for messages published from a single chain, tracking the
/// previous reference and sequence numbers.
#[derive(Clone, Debug)]
pub struct MessageChain {
    stream: StreamPartId,
    publisher_id: String,
    msg_chain_id: String,
    last: Option<MessageRef>,
}

impl MessageChain {
    pub fn new(stream: StreamPartId, publisher: &NodeId) -> Self {
        Self {
            stream,
            publisher_id: hex::encode(publisher),
            msg_chain_id: short_id(publisher),
            last: None,
        }
    }

    /// Create the next message. Messages within the same millisecond get
    /// increasing sequence numbers.
    pub fn next(&mut self, timestamp: u64, content: Vec<u8>) -> StreamMessage {
        let sequence_number = match self.last {
            Some(prev) if prev.timestamp == timestamp => prev.sequence_number + 1,
            _ => 0,
        };
        let id = MessageId {
            stream: self.stream.clone(),
            publisher_id: self.publisher_id.clone(),
            msg_chain_id: self.msg_chain_id.clone(),
            timestamp,
            sequence_number,
        };
        let message = StreamMessage {
            prev_msg_ref: self.last,
            id,
            content,
            signature: None,
        };
        self.last = Some(message.id.message_ref());
        message
    }
}
