//! Tunables for the DHT bootstrap, the gossip node, and the tracker.

use std::time::Duration;

/// Bucket size and neighbor-list bound.
pub const DEFAULT_K: usize = 8;

/// Lookup parallelism for the narrow probe phase.
pub const DEFAULT_ALPHA: usize = 3;

/// Hard cap on probe rounds per join.
pub const DEFAULT_MAX_ROUNDS: usize = 32;

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_TARGET_NEIGHBORS: usize = 4;
pub const DEFAULT_MAX_NEIGHBORS: usize = 8;
pub const DEFAULT_TRACKER_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Dedup entries only need to outlive network propagation delay.
pub const DEFAULT_DEDUP_CAPACITY: usize = 10_000;
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(60);

pub const DEFAULT_MAX_PROTOCOL_VIOLATIONS: u32 = 5;

/// Maximum message payload size (64 KiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
pub struct DhtConfig {
    pub k: usize,
    pub alpha: usize,
    pub max_rounds: usize,
    pub rpc_timeout: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            max_rounds: DEFAULT_MAX_ROUNDS,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }
}

#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Transport address of the tracker. Without one every subscription starts
    /// as the first node on its partition.
    pub tracker: Option<String>,
    /// Neighbor count the node tries to reach per partition.
    pub target_neighbors: usize,
    /// Inbound subscribe requests beyond this are rejected.
    pub max_neighbors: usize,
    /// Wait for `SubscribeResponse` before counting a peer as neighbor.
    pub require_subscribe_ack: bool,
    pub tracker_timeout: Duration,
    pub refresh_interval: Duration,
    /// Unanswered subscribe requests are dropped after this long.
    pub subscribe_timeout: Duration,
    pub dedup_capacity: usize,
    pub dedup_ttl: Duration,
    /// Malformed frames tolerated per peer before the connection is closed.
    pub max_protocol_violations: u32,
    pub max_message_size: usize,
    pub event_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            tracker: None,
            target_neighbors: DEFAULT_TARGET_NEIGHBORS,
            max_neighbors: DEFAULT_MAX_NEIGHBORS,
            require_subscribe_ack: true,
            tracker_timeout: DEFAULT_TRACKER_TIMEOUT,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            subscribe_timeout: DEFAULT_SUBSCRIBE_TIMEOUT,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            dedup_ttl: DEFAULT_DEDUP_TTL,
            max_protocol_violations: DEFAULT_MAX_PROTOCOL_VIOLATIONS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl NodeConfig {
    pub fn with_tracker(mut self, addr: impl Into<String>) -> Self {
        self.tracker = Some(addr.into());
        self
    }
}

#[derive(Clone, Debug)]
pub struct TrackerConfig {
    /// Upper bound on candidates returned per neighbor request.
    pub max_neighbors_returned: usize,
    /// Seed for candidate sampling; random when unset.
    pub rng_seed: Option<u64>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_neighbors_returned: DEFAULT_MAX_NEIGHBORS,
            rng_seed: None,
        }
    }
}
