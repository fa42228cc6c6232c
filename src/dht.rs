//! Kademlia-style bootstrap: iterative closest-node discovery and the
//! routing bucket it populates.
//!
//! A [`DhtNode`] joins the overlay by repeatedly asking the closest contacts it
//! knows for contacts closer to its own id. Probing starts `alpha` wide and
//! widens to `k` once a round stops improving the closest known contact; the
//! join ends when the widened search converges too, when `k` contacts have
//! answered, or when the hard round cap is hit.
//!
//! The node is generic over [`DhtNetwork`] so tests can drive it through an
//! in-memory registry while production uses [`crate::net::IrohDhtNetwork`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, trace};

use crate::config::DhtConfig;
use crate::contact_list::{ContactEntry, SortedContactList};
use crate::error::DhtError;
use crate::identity::{closer_to, short_id, xor_distance, Contact, NodeId};

// ─────────────────────────────────────────────────────────────────────────────
// Routing bucket
// ─────────────────────────────────────────────────────────────────────────────

/// Row of the bucket a contact belongs to: the length of the common prefix
/// between its id and ours.
fn row_index(self_id: &NodeId, other: &NodeId) -> usize {
    let dist = xor_distance(self_id, other);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    255
}

/// Outcome of offering a contact to the bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Already known; moved to the most-recently-seen position.
    Refreshed,
    /// The row is full. The caller should ping `oldest` and evict it only if dead.
    Full { oldest: Contact, candidate: Contact },
    /// Our own id.
    Ignored,
}

/// Bounded set of known peers used for steady-state routing.
///
/// Contacts are grouped by shared-prefix length with at most `k` per row,
/// each row ordered oldest first so long-lived peers are preferred.
#[derive(Debug, Clone)]
pub struct KBucket {
    self_id: NodeId,
    k: usize,
    rows: BTreeMap<usize, Vec<Contact>>,
}

impl KBucket {
    pub fn new(self_id: NodeId, k: usize) -> Self {
        Self {
            self_id,
            k: k.max(1),
            rows: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, contact: Contact) -> InsertOutcome {
        if contact.id == self.self_id {
            return InsertOutcome::Ignored;
        }
        let row = self
            .rows
            .entry(row_index(&self.self_id, &contact.id))
            .or_default();
        if let Some(pos) = row.iter().position(|c| c.id == contact.id) {
            row.remove(pos);
            row.push(contact);
            return InsertOutcome::Refreshed;
        }
        if row.len() < self.k {
            row.push(contact);
            return InsertOutcome::Inserted;
        }
        match row.first() {
            Some(oldest) => InsertOutcome::Full {
                oldest: oldest.clone(),
                candidate: contact,
            },
            None => InsertOutcome::Ignored,
        }
    }

    /// Settle a full row once the oldest contact has been pinged.
    pub fn apply_ping_result(&mut self, oldest: &Contact, candidate: Contact, oldest_alive: bool) {
        let idx = row_index(&self.self_id, &oldest.id);
        let Some(row) = self.rows.get_mut(&idx) else {
            return;
        };
        if oldest_alive {
            if let Some(pos) = row.iter().position(|c| c.id == oldest.id) {
                let alive = row.remove(pos);
                row.push(alive);
            }
            return;
        }
        row.retain(|c| c.id != oldest.id);
        if row.len() < self.k && !row.iter().any(|c| c.id == candidate.id) {
            row.push(candidate);
        }
    }

    pub fn remove(&mut self, id: &NodeId) -> bool {
        let idx = row_index(&self.self_id, id);
        let Some(row) = self.rows.get_mut(&idx) else {
            return false;
        };
        let before = row.len();
        row.retain(|c| &c.id != id);
        let removed = row.len() != before;
        if row.is_empty() {
            self.rows.remove(&idx);
        }
        removed
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.rows
            .get(&row_index(&self.self_id, id))
            .is_some_and(|row| row.iter().any(|c| &c.id == id))
    }

    /// Up to `n` known contacts closest to `target`, skipping `exclude`.
    pub fn closest(&self, target: &NodeId, n: usize, exclude: Option<&NodeId>) -> Vec<Contact> {
        let mut all: Vec<Contact> = self
            .rows
            .values()
            .flatten()
            .filter(|c| Some(&c.id) != exclude)
            .cloned()
            .collect();
        all.sort_by(|a, b| closer_to(target, &a.id, &b.id));
        all.truncate(n);
        all
    }

    pub fn len(&self) -> usize {
        self.rows.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.rows.values().flatten().cloned().collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Network trait
// ─────────────────────────────────────────────────────────────────────────────

/// Outbound RPCs a [`DhtNode`] issues. Implementations identify the caller to
/// the remote side so the responder can learn about it.
#[async_trait]
pub trait DhtNetwork: Send + Sync + 'static {
    /// Ask `to` for the contacts it knows closest to `target`.
    async fn get_closest_nodes(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>>;

    /// Liveness check used before evicting the oldest contact of a full row.
    async fn ping(&self, to: &Contact) -> Result<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Join bookkeeping
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinTermination {
    /// The entry point was ourselves.
    SelfJoin,
    /// A widened round did not find anything closer.
    Converged,
    /// `k` contacts answered.
    ActiveTarget,
    /// No uncontacted candidates were left.
    Exhausted,
    /// The round cap was reached.
    RoundLimit,
}

/// Summary of a completed join.
#[derive(Clone, Debug)]
pub struct JoinOutcome {
    pub rounds: usize,
    /// Closest known contact before the first round and after every round.
    pub closest_trace: Vec<Option<NodeId>>,
    /// Probe width (alpha or k) of each round, in order.
    pub round_widths: Vec<usize>,
    pub widened: bool,
    pub active_contacts: usize,
    pub termination: JoinTermination,
}

impl JoinOutcome {
    fn self_join() -> Self {
        Self {
            rounds: 0,
            closest_trace: Vec::new(),
            round_widths: Vec::new(),
            widened: false,
            active_contacts: 0,
            termination: JoinTermination::SelfJoin,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Narrow,
    Wide,
}

/// RPC counters kept for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RpcCounters {
    pub incoming: u64,
    pub outgoing: u64,
}

#[derive(Clone, Debug, Default)]
pub struct DhtTelemetry {
    pub bucket_size: usize,
    pub neighbor_list_size: usize,
    pub active_contacts: usize,
    pub closest: Option<NodeId>,
    pub rpcs: RpcCounters,
    pub k: usize,
    pub alpha: usize,
}

struct DhtState {
    bucket: KBucket,
    neighbors: SortedContactList,
}

// ─────────────────────────────────────────────────────────────────────────────
// DHT node
// ─────────────────────────────────────────────────────────────────────────────

/// Overlay participant performing bootstrap lookups and answering them.
///
/// The bucket and the neighbor list live behind one mutex that is never held
/// across an RPC, so inbound requests are served while a join is in flight.
pub struct DhtNode<N: DhtNetwork> {
    contact: Contact,
    config: DhtConfig,
    state: Arc<Mutex<DhtState>>,
    network: Arc<N>,
    incoming_rpcs: AtomicU64,
    outgoing_rpcs: AtomicU64,
}

impl<N: DhtNetwork> DhtNode<N> {
    pub fn new(contact: Contact, network: N, config: DhtConfig) -> Self {
        let state = DhtState {
            bucket: KBucket::new(contact.id, config.k),
            neighbors: SortedContactList::new(contact.id, config.k),
        };
        Self {
            contact,
            config,
            state: Arc::new(Mutex::new(state)),
            network: Arc::new(network),
            incoming_rpcs: AtomicU64::new(0),
            outgoing_rpcs: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> NodeId {
        self.contact.id
    }

    pub fn contact(&self) -> Contact {
        self.contact.clone()
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    /// Learn about a contact outside of a lookup.
    pub async fn observe_contact(&self, contact: Contact) {
        let outcome = {
            let mut state = self.state.lock().await;
            state.bucket.insert(contact)
        };
        self.settle_full_row(outcome);
    }

    /// Forget a contact that stopped answering.
    pub async fn remove_contact(&self, id: &NodeId) {
        let mut state = self.state.lock().await;
        state.bucket.remove(id);
    }

    /// Answer a `GetClosestNodes` RPC.
    ///
    /// Returns the `k` bucket contacts closest to `target` and learns about the
    /// caller if it was unknown, which is how callers become discoverable.
    pub async fn handle_get_closest_nodes(&self, caller: &Contact, target: NodeId) -> Vec<Contact> {
        self.incoming_rpcs.fetch_add(1, AtomicOrdering::Relaxed);
        let (closest, outcome) = {
            let mut state = self.state.lock().await;
            let closest = state.bucket.closest(&target, self.config.k, Some(&caller.id));
            let outcome = if caller.id != self.contact.id && !state.bucket.contains(&caller.id) {
                state.neighbors.add_contact(caller.clone());
                Some(state.bucket.insert(caller.clone()))
            } else {
                None
            };
            (closest, outcome)
        };
        if let Some(outcome) = outcome {
            self.settle_full_row(outcome);
        }
        trace!(
            caller = %short_id(&caller.id),
            returned = closest.len(),
            "served closest nodes"
        );
        closest
    }

    /// Answer a `Ping` RPC.
    pub async fn handle_ping(&self, caller: &Contact) {
        self.incoming_rpcs.fetch_add(1, AtomicOrdering::Relaxed);
        self.observe_contact(caller.clone()).await;
    }

    /// Join the overlay through `entry_point`.
    ///
    /// Joining through ourselves is a no-op. A network smaller than `k`
    /// finishes with fewer active contacts, which is not an error.
    pub async fn join_dht(&self, entry_point: Contact) -> JoinOutcome {
        if entry_point.id == self.contact.id {
            debug!("join via self ignored");
            return JoinOutcome::self_join();
        }

        let k = self.config.k;
        let alpha = self.config.alpha.max(1);
        let initial = {
            let mut state = self.state.lock().await;
            let outcome = state.bucket.insert(entry_point.clone());
            let seeds = state.bucket.closest(&self.contact.id, alpha, None);
            state.neighbors.add_contacts(seeds);
            state.neighbors.add_contact(entry_point.clone());
            drop(state);
            self.settle_full_row(outcome);
            self.closest_and_active().await.0
        };

        let mut outcome = JoinOutcome {
            rounds: 0,
            closest_trace: vec![initial],
            round_widths: Vec::new(),
            widened: false,
            active_contacts: 0,
            termination: JoinTermination::RoundLimit,
        };
        let mut phase = Phase::Narrow;
        let mut width = alpha;

        for round in 1..=self.config.max_rounds {
            let (before, batch) = {
                let state = self.state.lock().await;
                (
                    state.neighbors.get_closest_contact_id(),
                    state.neighbors.get_uncontacted_contacts(width),
                )
            };
            if batch.is_empty() {
                outcome.termination = JoinTermination::Exhausted;
                break;
            }

            outcome.rounds = round;
            outcome.round_widths.push(width);
            self.probe(batch).await;

            let (after, active) = self.closest_and_active().await;
            outcome.closest_trace.push(after);
            outcome.active_contacts = active;
            let improved = after != before;
            debug!(
                round,
                width,
                improved,
                active,
                closest = ?after.as_ref().map(short_id),
                "probe round finished"
            );

            if active >= k {
                outcome.termination = JoinTermination::ActiveTarget;
                break;
            }
            match (phase, improved) {
                (Phase::Narrow, true) => {}
                (Phase::Narrow, false) => {
                    phase = Phase::Wide;
                    outcome.widened = true;
                    width = k;
                }
                // Found someone closer: back to alpha, and the next stall widens again.
                (Phase::Wide, true) => {
                    phase = Phase::Narrow;
                    width = alpha;
                }
                (Phase::Wide, false) => {
                    outcome.termination = JoinTermination::Converged;
                    break;
                }
            }
        }

        let (_, active) = self.closest_and_active().await;
        outcome.active_contacts = active;
        info!(
            rounds = outcome.rounds,
            active,
            termination = ?outcome.termination,
            "dht join finished"
        );
        outcome
    }

    /// [`join_dht`](Self::join_dht) bounded by `limit`.
    ///
    /// Probes that completed before the deadline keep their effect on the
    /// neighbor list; the rest are dropped.
    pub async fn join_dht_with_timeout(
        &self,
        entry_point: Contact,
        limit: Duration,
    ) -> Result<JoinOutcome, DhtError> {
        match timeout(limit, self.join_dht(entry_point)).await {
            Ok(outcome) => Ok(outcome),
            Err(_) => {
                let (_, active) = self.closest_and_active().await;
                Err(DhtError::JoinTimeout { active })
            }
        }
    }

    /// Contact every member of `batch` in parallel.
    ///
    /// Each response is merged as soon as it arrives so a cancelled round
    /// keeps whatever already completed.
    async fn probe(&self, batch: Vec<Contact>) {
        {
            let mut state = self.state.lock().await;
            for contact in &batch {
                state.neighbors.set_contacted(&contact.id);
            }
        }
        let target = self.contact.id;
        let calls = batch.into_iter().map(|contact| async move {
            self.outgoing_rpcs.fetch_add(1, AtomicOrdering::Relaxed);
            let call = self.network.get_closest_nodes(&contact, target);
            match timeout(self.config.rpc_timeout, call).await {
                Ok(Ok(nodes)) => self.absorb_response(&contact, nodes).await,
                Ok(Err(err)) => {
                    debug!(peer = %short_id(&contact.id), "closest-nodes rpc failed: {err:?}");
                    self.remove_contact(&contact.id).await;
                }
                Err(_) => {
                    debug!(peer = %short_id(&contact.id), "closest-nodes rpc timed out");
                    self.remove_contact(&contact.id).await;
                }
            }
        });
        join_all(calls).await;
    }

    async fn absorb_response(&self, responder: &Contact, nodes: Vec<Contact>) {
        let outcomes = {
            let mut state = self.state.lock().await;
            state.neighbors.set_active(&responder.id);
            let mut outcomes = vec![state.bucket.insert(responder.clone())];
            for node in nodes {
                if node.id == self.contact.id {
                    continue;
                }
                outcomes.push(state.bucket.insert(node.clone()));
                state.neighbors.add_contact(node);
            }
            outcomes
        };
        for outcome in outcomes {
            self.settle_full_row(outcome);
        }
    }

    /// Ping the oldest contact of a full row in the background and keep
    /// whichever of the two contacts is alive.
    fn settle_full_row(&self, outcome: InsertOutcome) {
        let InsertOutcome::Full { oldest, candidate } = outcome else {
            return;
        };
        let network = self.network.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            let alive = match network.ping(&oldest).await {
                Ok(()) => true,
                Err(err) => {
                    debug!(peer = %short_id(&oldest.id), "ping failed: {err:?}");
                    false
                }
            };
            let mut state = state.lock().await;
            state.bucket.apply_ping_result(&oldest, candidate, alive);
        });
    }

    async fn closest_and_active(&self) -> (Option<NodeId>, usize) {
        let state = self.state.lock().await;
        (
            state.neighbors.get_closest_contact_id(),
            state.neighbors.active_count(),
        )
    }

    pub async fn bucket_contacts(&self) -> Vec<Contact> {
        let state = self.state.lock().await;
        state.bucket.contacts()
    }

    pub async fn neighbor_list(&self) -> Vec<ContactEntry> {
        let state = self.state.lock().await;
        state.neighbors.entries().to_vec()
    }

    pub fn rpc_counters(&self) -> RpcCounters {
        RpcCounters {
            incoming: self.incoming_rpcs.load(AtomicOrdering::Relaxed),
            outgoing: self.outgoing_rpcs.load(AtomicOrdering::Relaxed),
        }
    }

    pub async fn telemetry(&self) -> DhtTelemetry {
        let state = self.state.lock().await;
        DhtTelemetry {
            bucket_size: state.bucket.len(),
            neighbor_list_size: state.neighbors.len(),
            active_contacts: state.neighbors.active_count(),
            closest: state.neighbors.get_closest_contact_id(),
            rpcs: self.rpc_counters(),
            k: self.config.k,
            alpha: self.config.alpha,
        }
    }
}
