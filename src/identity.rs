//! Node identity and the XOR distance metric used for overlay routing.
//!
//! - **Identity**: [`NodeId`], [`derive_node_id`]
//! - **Distance**: [`xor_distance`], [`distance_cmp`], [`closer_to`]
//! - **Peers**: [`Contact`] pairs an id with an opaque transport address

use std::cmp::Ordering;
use std::fmt;

use iroh_blake3::Hasher;
use serde::{Deserialize, Serialize};

/// A 256-bit identifier for overlay participants.
///
/// Ids are derived from the participant's public key with BLAKE3, which gives a
/// uniform distribution over the identifier space. Once assigned an id never changes.
pub type NodeId = [u8; 32];

/// Derive a stable [`NodeId`] by hashing arbitrary input with BLAKE3.
///
/// ```
/// use iroh_streamnet::derive_node_id;
///
/// let id = derive_node_id(b"example-public-key-bytes");
/// assert_eq!(id, derive_node_id(b"example-public-key-bytes"));
/// ```
pub fn derive_node_id(data: &[u8]) -> NodeId {
    let mut hasher = Hasher::new();
    hasher.update(data);
    let digest = hasher.finalize();

    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_bytes());
    out
}

/// Compute the XOR distance between two node ids.
///
/// The result is read as a big-endian unsigned integer, so
/// `xor_distance(a, a)` is zero and the metric is symmetric.
pub fn xor_distance(a: &NodeId, b: &NodeId) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (slot, (x, y)) in out.iter_mut().zip(a.iter().zip(b.iter())) {
        *slot = x ^ y;
    }
    out
}

/// Compare two XOR distances as unsigned integers.
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> Ordering {
    a.cmp(b)
}

/// Order `a` and `b` by their distance to `target`.
pub fn closer_to(target: &NodeId, a: &NodeId, b: &NodeId) -> Ordering {
    distance_cmp(&xor_distance(a, target), &xor_distance(b, target))
}

/// Render the first four bytes of an id as hex for log lines.
pub fn short_id(id: &NodeId) -> String {
    hex::encode(&id[..4])
}

/// A known peer: its identity plus an opaque handle for reaching it.
///
/// For the iroh transport `addr` is a JSON-serialised `EndpointAddr`; for the
/// in-process transport it is any unique name. A contact does not own the
/// connection to the peer, only its identity.
#[derive(Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Contact {
    pub id: NodeId,
    pub addr: String,
}

impl Contact {
    pub fn new(id: NodeId, addr: impl Into<String>) -> Self {
        Self {
            id,
            addr: addr.into(),
        }
    }

    /// XOR distance from this contact to `target`.
    pub fn distance_to(&self, target: &NodeId) -> [u8; 32] {
        xor_distance(&self.id, target)
    }
}

impl fmt::Debug for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Contact")
            .field("id", &short_id(&self.id))
            .field("addr", &self.addr)
            .finish()
    }
}
