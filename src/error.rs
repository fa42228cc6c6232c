//! Error types for the public API seams.
//!
//! Transport and RPC plumbing report failures through [`anyhow::Error`]; the
//! enums below name the conditions callers are expected to match on.

use thiserror::Error;

use crate::message::StreamPartId;

/// A frame that could not be turned into a protocol message.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unsupported protocol version {found} (expected {expected})")]
    UnsupportedVersion { found: u8, expected: u8 },
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame of {len} bytes exceeds limit of {limit}")]
    FrameTooLarge { len: usize, limit: usize },
}

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("join did not complete in time ({active} active contacts)")]
    JoinTimeout { active: usize },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackerError {
    /// Nobody else is registered on the partition yet.
    #[error("no other nodes registered on {stream}")]
    NoCandidates { stream: StreamPartId },
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("timed out waiting for {wanted} neighbors on {stream} (have {have})")]
    NeighborTimeout {
        stream: StreamPartId,
        wanted: usize,
        have: usize,
    },
    #[error("tracker did not answer in time")]
    TrackerTimeout,
    #[error("no tracker connection")]
    TrackerUnavailable,
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("node has shut down")]
    Closed,
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}
