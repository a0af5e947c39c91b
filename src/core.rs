//! Core Chord logic: transport-agnostic ring membership and key routing.
//!
//! This module contains the fundamental building blocks of the overlay:
//!
//! - **Identity & Hashing**: [`NodeId`], [`Key`], [`NodeInfo`], [`derive_node_id`]
//! - **Ring Arithmetic**: [`between`] and friends on the circular identifier space
//! - **Membership**: [`FingerTable`] — predecessor, fingers, bounded successor list
//! - **Lookup Engine**: deduplicated key lookups riding on [`ChordNetwork`]
//! - **Stabilization**: the periodic protocol that heals the ring under churn
//! - **Node State Machine**: [`ChordNode`] and the [`OverlayNode`] facade

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use iroh_blake3::Hasher;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::protocol::{
    Deliver, LookupRequest, LookupResult, Notify, Operation, PredecessorResponse,
    RequestPredecessor,
};

// ============================================================================
// Type Aliases
// ============================================================================

/// A ring identifier in `[0, RING_SIZE)`.
///
/// Node ids are derived from the node's serialized endpoint address with
/// BLAKE3, reduced onto the ring, so that placement is stable across restarts
/// of the same endpoint.
pub type NodeId = u64;

/// A routing key of arbitrary value.
///
/// Only `key % RING_SIZE` matters for placement; see [`position`].
pub type Key = u64;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Number of bits in a ring identifier (`m`).
pub const RING_BITS: usize = 7;

/// Size of the identifier ring (`M = 2^m`).
pub const RING_SIZE: u64 = 1 << RING_BITS;

/// Entries kept in the successor list (`R`).
const SUCCESSOR_LIST_SIZE: usize = 5;

/// Delay between stabilization rounds.
const STABILIZATION_PERIOD: Duration = Duration::from_secs(5);

/// Deadline for lookups and predecessor probes.
const LOOKUP_TIMEOUT: Duration = Duration::from_millis(400);

/// Hop budget carried by a lookup; routing cycles die when it runs out.
const MAXIMUM_HOPS: i32 = (4 * RING_BITS) as i32;

/// Capacity of the inbound payload queue handed to the layer above.
const DELIVERY_QUEUE_DEPTH: usize = 256;

// ============================================================================
// Hashing Functions
// ============================================================================

/// Compute a 32-byte BLAKE3 digest of the input data.
fn blake3_digest(data: &[u8]) -> [u8; 32] {
    let mut hasher = Hasher::new();
    hasher.update(data);
    let digest = hasher.finalize();

    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_bytes());
    out
}

/// Derive a stable ring identifier by hashing arbitrary input with BLAKE3.
///
/// Used to place a node on the ring from its serialized endpoint address:
///
/// ```
/// use iroh_chord::{derive_node_id, RING_SIZE};
///
/// let id = derive_node_id(b"203.0.113.7:4530");
/// assert!(id < RING_SIZE);
/// assert_eq!(id, derive_node_id(b"203.0.113.7:4530"));
/// ```
pub fn derive_node_id(data: &[u8]) -> NodeId {
    let digest = blake3_digest(data);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix) % RING_SIZE
}

/// Hash content bytes into a routing [`Key`].
///
/// The layer above the core uses this to derive the key under which a blob is
/// placed; the core itself only ever looks at the key's ring [`position`]:
///
/// ```
/// use iroh_chord::{key_for, position, RING_SIZE};
///
/// let key = key_for(b"backup blob");
/// assert_eq!(key, key_for(b"backup blob"));
/// assert!(position(key) < RING_SIZE);
/// ```
pub fn key_for(data: &[u8]) -> Key {
    let digest = blake3_digest(data);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// The position of a key on the ring.
pub fn position(key: Key) -> NodeId {
    key % RING_SIZE
}

// ============================================================================
// Ring Arithmetic
// ============================================================================

/// True iff `x` lies on the open clockwise arc `(lower, upper)`.
///
/// When `lower == upper` the arc is the entire ring excluding that point.
/// Equality with either endpoint is exclusive; use the half-open variants
/// where a bound belongs to the arc.
pub fn between(lower: NodeId, upper: NodeId, x: NodeId) -> bool {
    if lower < upper {
        lower < x && x < upper
    } else if lower > upper {
        x > lower || x < upper
    } else {
        x != lower
    }
}

/// True iff `x` lies on the clockwise arc `(lower, upper]`.
pub fn between_right_inclusive(lower: NodeId, upper: NodeId, x: NodeId) -> bool {
    x == upper || between(lower, upper, x)
}

/// True iff `x` lies on the clockwise arc `[lower, upper)`.
pub fn between_left_inclusive(lower: NodeId, upper: NodeId, x: NodeId) -> bool {
    x == lower || between(lower, upper, x)
}

/// Move `delta` steps around the ring, wrapping in either direction.
pub fn add_to_node_id(id: NodeId, delta: i64) -> NodeId {
    (id as i64 + delta).rem_euclid(RING_SIZE as i64) as NodeId
}

/// Clockwise steps from `from` to `to`; zero only when they coincide.
fn clockwise_distance(from: NodeId, to: NodeId) -> u64 {
    (to + RING_SIZE - from) % RING_SIZE
}

// ============================================================================
// Node Identity
// ============================================================================

/// A peer on the ring: its ring id plus the serialized endpoint address
/// (which carries the transport address and port) needed to reach it.
///
/// `NodeInfo` values are immutable once created. Two of them are equal iff
/// their ids are equal; the address is transport detail.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Ring identifier, derived from `addr`.
    pub id: NodeId,
    /// Serialized endpoint address (JSON) used by the dispatcher.
    pub addr: String,
}

impl NodeInfo {
    /// Place an endpoint on the ring by hashing its serialized address.
    pub fn new(addr: String) -> Self {
        let id = derive_node_id(addr.as_bytes());
        Self { id, addr }
    }
}

impl PartialEq for NodeInfo {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeInfo {}

impl std::hash::Hash for NodeInfo {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.id)
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Terminal outcome of a failed lookup, shared by every waiter on the handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    /// No responsible node answered before the deadline.
    #[error("no responsible node found for the key")]
    KeyNotFound,
}

// ============================================================================
// Configuration
// ============================================================================

/// Tuning knobs for a [`ChordNode`].
///
/// The defaults are the reference deployment values; tests shrink the timers.
#[derive(Clone, Debug)]
pub struct ChordConfig {
    /// Maximum entries kept in the successor list.
    pub successor_list_size: usize,
    /// Delay between stabilization rounds (fixed delay, not fixed rate).
    pub stabilization_period: Duration,
    /// Deadline applied to lookups and predecessor probes.
    pub lookup_timeout: Duration,
    /// Hop budget for routed lookups.
    pub maximum_hops: i32,
}

impl Default for ChordConfig {
    fn default() -> Self {
        Self {
            successor_list_size: SUCCESSOR_LIST_SIZE,
            stabilization_period: STABILIZATION_PERIOD,
            lookup_timeout: LOOKUP_TIMEOUT,
            maximum_hops: MAXIMUM_HOPS,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Finger Table
// ─────────────────────────────────────────────────────────────────────────────

/// What a node must do after a peer was declared dead.
///
/// [`FingerTable::inform_failure`] strips the dead reference synchronously and
/// reports the lookups the owner should schedule to repair the table.
#[derive(Debug, Default)]
pub struct FailureFallout {
    /// The failed peer was our predecessor; the slot is now empty.
    pub cleared_predecessor: bool,
    /// Start keys of finger slots that were reset and want a fresh lookup.
    pub finger_refresh: Vec<Key>,
    /// Key whose lookup extends a successor list that fell below capacity.
    pub successor_refill: Option<Key>,
}

/// Per-node routing state: predecessor, `m` fingers, and a bounded successor
/// list kept in clockwise order starting just after the local node.
///
/// `fingers[i]` is the node believed responsible for `(self.id + 2^i) mod M`.
/// `successors[0]`, when the list is non-empty, shadows `fingers[0]` and is
/// the authoritative successor.
///
/// The table is plain synchronous state; [`ChordNode`] owns it behind a mutex
/// that is never held across a suspension point.
pub struct FingerTable {
    local: NodeInfo,
    predecessor: Option<NodeInfo>,
    fingers: Vec<NodeInfo>,
    successors: Vec<NodeInfo>,
    capacity: usize,
}

impl FingerTable {
    /// Create the table of a node that knows nobody: every finger points at
    /// the local node and the predecessor is the local node itself (meaning
    /// "never learned one", distinct from an evicted, absent predecessor).
    pub fn new(local: NodeInfo, capacity: usize) -> Self {
        let fingers = vec![local.clone(); RING_BITS];
        Self {
            predecessor: Some(local.clone()),
            local,
            fingers,
            successors: Vec::new(),
            capacity,
        }
    }

    pub fn local(&self) -> &NodeInfo {
        &self.local
    }

    pub fn predecessor(&self) -> Option<&NodeInfo> {
        self.predecessor.as_ref()
    }

    /// Overwrite the predecessor without the usual closeness check.
    ///
    /// `None` records an evicted predecessor; stabilization repopulates it.
    pub fn set_predecessor(&mut self, predecessor: Option<NodeInfo>) {
        self.predecessor = predecessor;
    }

    /// The authoritative successor: head of the successor list, falling back
    /// to `fingers[0]` (the local node itself on a fresh table).
    pub fn successor(&self) -> NodeInfo {
        self.successors
            .first()
            .cloned()
            .unwrap_or_else(|| self.fingers[0].clone())
    }

    pub fn successors(&self) -> &[NodeInfo] {
        &self.successors
    }

    pub fn fingers(&self) -> &[NodeInfo] {
        &self.fingers
    }

    /// The key `(self.id + 2^i) mod M` that finger `i` is responsible for.
    pub fn finger_start(&self, index: usize) -> NodeId {
        add_to_node_id(self.local.id, 1 << index)
    }

    pub fn set_finger(&mut self, index: usize, node: NodeInfo) {
        self.fingers[index] = node;
    }

    /// True iff the key lives on the arc `(self, successor]`, i.e. our
    /// successor is responsible for it. On a single-node ring every key does.
    pub fn key_belongs_to_successor(&self, key_pos: NodeId) -> bool {
        between_right_inclusive(self.local.id, self.successor().id, key_pos)
    }

    /// The farthest finger strictly preceding the key, scanning fingers from
    /// the widest span down. Falls back to the successor when no finger
    /// qualifies, and to the local node when nobody else is known at all.
    pub fn next_best_node(&self, key_pos: NodeId) -> NodeInfo {
        for finger in self.fingers.iter().rev() {
            if *finger != self.local && between(self.local.id, key_pos, finger.id) {
                return finger.clone();
            }
        }

        self.successors
            .first()
            .cloned()
            .unwrap_or_else(|| self.local.clone())
    }

    /// Accept `node` as predecessor iff it is strictly closer behind us than
    /// the current one (always, when the slot is empty). Returns whether the
    /// predecessor changed; a repeated call with the same node returns false.
    pub fn update_predecessor(&mut self, node: &NodeInfo) -> bool {
        if *node == self.local {
            return false;
        }

        match &self.predecessor {
            None => {
                self.predecessor = Some(node.clone());
                true
            }
            Some(current) => {
                if between(current.id, self.local.id, node.id) {
                    self.predecessor = Some(node.clone());
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Insert `node` into the successor list at its clockwise position.
    ///
    /// Idempotent; keeps the list ordered, free of the local node, and
    /// truncated to capacity by dropping the farthest entry.
    pub fn update_successors(&mut self, node: &NodeInfo) {
        if *node != self.local && !self.successors.contains(node) {
            let arc = clockwise_distance(self.local.id, node.id);
            let slot = self
                .successors
                .iter()
                .position(|s| clockwise_distance(self.local.id, s.id) > arc)
                .unwrap_or(self.successors.len());
            self.successors.insert(slot, node.clone());
            self.successors.truncate(self.capacity);
            self.assert_successor_invariants();
        }

        if let Some(head) = self.successors.first() {
            self.fingers[0] = head.clone();
        }
    }

    /// Let `node` take over every finger slot whose arc it falls into:
    /// slot `i` is replaced when `node` lies in `(self + 2^i, fingers[i]]`.
    /// A replacement of slot 0 also enters the successor list.
    pub fn update_finger_table(&mut self, node: &NodeInfo) {
        if *node == self.local {
            return;
        }

        for index in 0..self.fingers.len() {
            let start = self.finger_start(index);
            if between_right_inclusive(start, self.fingers[index].id, node.id) {
                if index == 0 {
                    self.update_successors(node);
                } else {
                    self.fingers[index] = node.clone();
                }
            }
        }
    }

    /// A peer was observed alive: fold it into successors, fingers and the
    /// predecessor slot in one step.
    pub fn inform_existence(&mut self, node: &NodeInfo) {
        if *node == self.local {
            return;
        }
        self.update_successors(node);
        self.update_finger_table(node);
        self.update_predecessor(node);
    }

    /// A peer was declared dead: strip every reference to it and report which
    /// lookups would repair the holes it left.
    pub fn inform_failure(&mut self, node: &NodeInfo) -> FailureFallout {
        let mut fallout = FailureFallout::default();

        let removed = if let Some(slot) = self.successors.iter().position(|s| s == node) {
            self.successors.remove(slot);
            true
        } else {
            false
        };

        if self.predecessor.as_ref() == Some(node) {
            self.predecessor = None;
            fallout.cleared_predecessor = true;
        }

        for index in 0..self.fingers.len() {
            if self.fingers[index] == *node {
                self.fingers[index] = self.local.clone();
                fallout.finger_refresh.push(self.finger_start(index));
            }
        }

        if let Some(head) = self.successors.first() {
            self.fingers[0] = head.clone();
        }

        if removed && self.successors.len() < self.capacity {
            let after = self.successors.last().map(|s| s.id).unwrap_or(self.local.id);
            fallout.successor_refill = Some(add_to_node_id(after, 1));
        }

        fallout
    }

    /// The first listed successor whose arc covers `key_pos`, if any.
    ///
    /// Successor `j` covers the arc `(successor[j-1], successor[j]]`, with the
    /// local node bounding the first arc.
    pub fn successor_covering(&self, key_pos: NodeId) -> Option<NodeInfo> {
        let mut lower = self.local.id;
        for successor in &self.successors {
            if between_right_inclusive(lower, successor.id, key_pos) {
                return Some(successor.clone());
            }
            lower = successor.id;
        }
        None
    }

    // A broken successor list is programmer error, not churn.
    fn assert_successor_invariants(&self) {
        assert!(
            self.successors.len() <= self.capacity,
            "successor list exceeds capacity"
        );
        let mut previous = 0;
        for successor in &self.successors {
            let arc = clockwise_distance(self.local.id, successor.id);
            assert!(
                arc > previous,
                "successor list out of clockwise order (or contains self or a duplicate)"
            );
            previous = arc;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Network Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Transport abstraction for the dispatcher's outbound half.
///
/// Every inter-node message is a self-contained one-way [`Operation`];
/// replies are operations themselves. The core works with any implementation
/// (iroh QUIC in production, an in-memory registry in tests).
#[async_trait]
pub trait ChordNetwork: Send + Sync + 'static {
    /// Deliver one operation to the peer. An error means the peer is
    /// unreachable; callers turn that into a membership update, never a crash.
    async fn send(&self, to: &NodeInfo, operation: Operation) -> Result<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Chord Node
// ─────────────────────────────────────────────────────────────────────────────

/// An opaque payload delivered by a peer via [`OverlayNode::send`].
#[derive(Clone, Debug)]
pub struct Delivery {
    pub from: NodeInfo,
    pub payload: Vec<u8>,
}

/// Copy of a node's membership state, for diagnostics and tests.
#[derive(Clone, Debug)]
pub struct RingSnapshot {
    pub local: NodeInfo,
    pub predecessor: Option<NodeInfo>,
    pub successors: Vec<NodeInfo>,
    pub fingers: Vec<NodeInfo>,
}

type LookupWaiter = oneshot::Sender<std::result::Result<NodeInfo, LookupError>>;

/// The per-node overlay state machine.
///
/// A `ChordNode` owns the finger table, the in-flight lookup map and the
/// [`ChordNetwork`] used to reach peers. It is `Arc`-friendly and shared
/// between the inbound dispatcher workers and the stabilization task; all
/// locks are released before any suspension point.
///
/// Applications normally hold the clonable [`OverlayNode`] facade instead.
pub struct ChordNode<N: ChordNetwork> {
    info: NodeInfo,
    config: ChordConfig,
    table: Mutex<FingerTable>,
    /// In-flight lookups by ring position; all waiters of a position share
    /// the single dispatched request.
    lookups: Mutex<HashMap<NodeId, Vec<LookupWaiter>>>,
    /// Waiters of the one outstanding `RequestPredecessor`, if any.
    predecessor_waiters: Mutex<Vec<oneshot::Sender<Option<NodeInfo>>>>,
    network: N,
    delivery_tx: mpsc::Sender<Delivery>,
    delivery_rx: Mutex<Option<mpsc::Receiver<Delivery>>>,
    /// Keys whose lookup repairs a hole left by a failed peer; drained by a
    /// background worker so evictions never block on routing.
    repairs: mpsc::UnboundedSender<Key>,
}

impl<N: ChordNetwork> ChordNode<N> {
    /// Create a node that initially forms a one-element ring.
    ///
    /// Must run inside a tokio runtime: the node spawns its repair-lookup
    /// worker here.
    pub fn new(info: NodeInfo, network: N, config: ChordConfig) -> Arc<Self> {
        let (delivery_tx, delivery_rx) = mpsc::channel(DELIVERY_QUEUE_DEPTH);
        let (repair_tx, mut repair_rx) = mpsc::unbounded_channel();
        let node = Arc::new(Self {
            table: Mutex::new(FingerTable::new(info.clone(), config.successor_list_size)),
            info,
            config,
            lookups: Mutex::new(HashMap::new()),
            predecessor_waiters: Mutex::new(Vec::new()),
            network,
            delivery_tx,
            delivery_rx: Mutex::new(Some(delivery_rx)),
            repairs: repair_tx,
        });

        let worker = Arc::downgrade(&node);
        tokio::spawn(async move {
            while let Some(key) = repair_rx.recv().await {
                let Some(node) = worker.upgrade() else { break };
                let _ = node.lookup(key).await;
            }
        });

        node
    }

    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    /// Copy out the membership state.
    pub async fn ring_snapshot(&self) -> RingSnapshot {
        let table = self.table.lock().await;
        RingSnapshot {
            local: table.local().clone(),
            predecessor: table.predecessor().cloned(),
            successors: table.successors().to_vec(),
            fingers: table.fingers().to_vec(),
        }
    }

    /// A peer was observed alive; fold it into the membership state.
    pub async fn inform_existence(&self, peer: &NodeInfo) {
        if *peer == self.info {
            return;
        }
        let mut table = self.table.lock().await;
        table.inform_existence(peer);
    }

    /// A peer is unreachable: evict it everywhere and schedule the repair
    /// lookups the eviction calls for.
    pub async fn inform_failure(&self, peer: &NodeInfo) {
        if *peer == self.info {
            return;
        }
        let fallout = {
            let mut table = self.table.lock().await;
            table.inform_failure(peer)
        };
        if fallout.cleared_predecessor {
            debug!(peer = peer.id, "dropped failed predecessor");
        }

        let mut repairs = fallout.finger_refresh;
        repairs.extend(fallout.successor_refill);
        for key in repairs {
            let _ = self.repairs.send(key);
        }
    }

    // ------------------------------------------------------------------
    // Lookup engine
    // ------------------------------------------------------------------

    /// Resolve the node responsible for `key` on the current ring view.
    ///
    /// Concurrent lookups of the same ring position share one in-flight
    /// request and complete with identical outcomes. The wait is bounded by
    /// the configured timeout; expiry fails every waiter with
    /// [`LookupError::KeyNotFound`].
    pub async fn lookup(&self, key: Key) -> std::result::Result<NodeInfo, LookupError> {
        let rx = self.lookup_handle(key, None).await;
        self.await_lookup(key, rx).await
    }

    async fn await_lookup(
        &self,
        key: Key,
        rx: oneshot::Receiver<std::result::Result<NodeInfo, LookupError>>,
    ) -> std::result::Result<NodeInfo, LookupError> {
        match time::timeout(self.config.lookup_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // The handle was torn down elsewhere; the lookup is dead either way.
            Ok(Err(_)) => Err(LookupError::KeyNotFound),
            Err(_) => {
                self.fail_lookup(position(key)).await;
                Err(LookupError::KeyNotFound)
            }
        }
    }

    /// Register a waiter for the key's position. The first waiter dispatches
    /// the wire request — toward `via` when given (bootstrap), otherwise to
    /// whatever the finger table suggests.
    async fn lookup_handle(
        &self,
        key: Key,
        via: Option<&NodeInfo>,
    ) -> oneshot::Receiver<std::result::Result<NodeInfo, LookupError>> {
        let pos = position(key);
        let (tx, rx) = oneshot::channel();
        let first = {
            let mut lookups = self.lookups.lock().await;
            match lookups.entry(pos) {
                Entry::Occupied(mut entry) => {
                    entry.get_mut().push(tx);
                    false
                }
                Entry::Vacant(entry) => {
                    entry.insert(vec![tx]);
                    true
                }
            }
        };
        if first {
            self.dispatch_lookup(pos, via).await;
        }
        rx
    }

    async fn dispatch_lookup(&self, pos: NodeId, via: Option<&NodeInfo>) {
        let (target, reached_destination) = match via {
            Some(seed) => (seed.clone(), false),
            None => {
                let table = self.table.lock().await;
                if table.key_belongs_to_successor(pos) {
                    (table.successor(), true)
                } else {
                    (table.next_best_node(pos), false)
                }
            }
        };

        if target == self.info {
            // Single-node ring: the key is ours.
            self.finish_lookup(pos, self.info.clone()).await;
            return;
        }

        let request = LookupRequest {
            origin: self.info.clone(),
            key: pos,
            last_node: self.info.clone(),
            time_to_live: self.config.maximum_hops,
            reached_destination,
        };
        trace!(key = pos, target = target.id, "dispatching lookup");
        if let Err(err) = self.network.send(&target, Operation::Lookup(request)).await {
            debug!(target = target.id, "lookup dispatch failed: {err:#}");
            self.inform_failure(&target).await;
        }
    }

    /// A responder was found: tear down the handle, learn about the
    /// responder, and wake every waiter.
    async fn finish_lookup(&self, pos: NodeId, responder: NodeInfo) {
        let waiters = {
            let mut lookups = self.lookups.lock().await;
            lookups.remove(&pos)
        };
        self.inform_existence(&responder).await;
        let Some(waiters) = waiters else { return };
        trace!(
            key = pos,
            responder = responder.id,
            waiters = waiters.len(),
            "lookup finished"
        );
        for tx in waiters {
            let _ = tx.send(Ok(responder.clone()));
        }
    }

    /// Give up on a lookup: every waiter sees `KeyNotFound`.
    async fn fail_lookup(&self, pos: NodeId) {
        let waiters = {
            let mut lookups = self.lookups.lock().await;
            lookups.remove(&pos)
        };
        let Some(waiters) = waiters else { return };
        debug!(key = pos, waiters = waiters.len(), "lookup abandoned");
        for tx in waiters {
            let _ = tx.send(Err(LookupError::KeyNotFound));
        }
    }

    // ------------------------------------------------------------------
    // Operation handlers (inbound dispatch)
    // ------------------------------------------------------------------

    /// Execute one inbound operation against this node.
    ///
    /// Operations arrive off the wire carrying their full resume state; the
    /// local node is supplied here, never embedded in the message.
    pub async fn execute(&self, operation: Operation) {
        trace!(
            kind = operation.kind(),
            origin = operation.origin().id,
            "executing operation"
        );
        match operation {
            Operation::Lookup(request) => self.handle_lookup(request).await,
            Operation::LookupResult(result) => self.handle_lookup_result(result).await,
            Operation::RequestPredecessor(request) => {
                self.handle_request_predecessor(request).await
            }
            Operation::PredecessorResponse(response) => {
                self.handle_predecessor_response(response).await
            }
            Operation::Notify(notify) => self.handle_notify(notify).await,
            Operation::Deliver(deliver) => self.handle_deliver(deliver).await,
        }
    }

    /// One hop of the routed lookup walk.
    async fn handle_lookup(&self, mut request: LookupRequest) {
        request.time_to_live -= 1;
        if request.time_to_live < 0 {
            trace!(key = request.key, "lookup dropped: hop budget exhausted");
            return;
        }
        request.key = position(request.key);

        let previous = std::mem::replace(&mut request.last_node, self.info.clone());

        if request.reached_destination {
            self.respond_as_destination(&request).await;
            self.inform_existence(&previous).await;
            return;
        }

        let next = {
            let table = self.table.lock().await;
            request.reached_destination = table.key_belongs_to_successor(request.key);
            let mut next = table.next_best_node(request.key);
            if next == self.info {
                next = table.successor();
            }
            next
        };

        if next == self.info {
            // Fingers and successors all point back here. Answer if the key
            // is ours; otherwise the origin times out.
            if request.reached_destination {
                self.respond_as_destination(&request).await;
            } else {
                trace!(key = request.key, "lookup stalled: no forwarding candidate");
            }
        } else {
            trace!(
                key = request.key,
                next = next.id,
                ttl = request.time_to_live,
                "forwarding lookup"
            );
            if let Err(err) = self
                .network
                .send(&next, Operation::Lookup(request.clone()))
                .await
            {
                debug!(next = next.id, "lookup forward failed: {err:#}");
                self.inform_failure(&next).await;
            }
        }

        self.inform_existence(&request.origin).await;
        self.inform_existence(&previous).await;
    }

    /// The previous hop decided the key belongs to this node's arc: answer
    /// the origin (or our own handle, when the walk looped back home).
    async fn respond_as_destination(&self, request: &LookupRequest) {
        if request.origin == self.info {
            self.finish_lookup(request.key, self.info.clone()).await;
            return;
        }

        let result = Operation::LookupResult(LookupResult {
            origin: request.origin.clone(),
            responder: self.info.clone(),
            key: request.key,
        });
        match self.network.send(&request.origin, result).await {
            Ok(()) => self.inform_existence(&request.origin).await,
            Err(err) => {
                debug!(
                    origin = request.origin.id,
                    "lookup result undeliverable: {err:#}"
                );
                self.inform_failure(&request.origin).await;
            }
        }
    }

    async fn handle_lookup_result(&self, result: LookupResult) {
        self.finish_lookup(position(result.key), result.responder)
            .await;
    }

    async fn handle_request_predecessor(&self, request: RequestPredecessor) {
        let predecessor = {
            let table = self.table.lock().await;
            table.predecessor().cloned()
        };
        let reply = Operation::PredecessorResponse(PredecessorResponse {
            origin: self.info.clone(),
            predecessor,
        });
        if let Err(err) = self.network.send(&request.origin, reply).await {
            debug!(
                origin = request.origin.id,
                "predecessor reply undeliverable: {err:#}"
            );
            self.inform_failure(&request.origin).await;
        }
    }

    async fn handle_predecessor_response(&self, response: PredecessorResponse) {
        self.inform_existence(&response.origin).await;
        let waiters: Vec<_> = {
            let mut waiters = self.predecessor_waiters.lock().await;
            waiters.drain(..).collect()
        };
        trace!(
            origin = response.origin.id,
            waiters = waiters.len(),
            "predecessor response"
        );
        for tx in waiters {
            let _ = tx.send(response.predecessor.clone());
        }
    }

    async fn handle_notify(&self, notify: Notify) {
        let changed = {
            let mut table = self.table.lock().await;
            table.update_predecessor(&notify.origin)
        };
        if changed {
            debug!(
                predecessor = notify.origin.id,
                "adopted notified predecessor"
            );
        }
    }

    async fn handle_deliver(&self, deliver: Deliver) {
        self.inform_existence(&deliver.origin).await;
        let delivery = Delivery {
            from: deliver.origin,
            payload: deliver.payload,
        };
        if self.delivery_tx.try_send(delivery).is_err() {
            warn!("inbound payload dropped: delivery queue full");
        }
    }

    // ------------------------------------------------------------------
    // Stabilization
    // ------------------------------------------------------------------

    /// Spawn the periodic stabilization task.
    ///
    /// Ticks run with fixed delay: a slow round pushes the next one back
    /// instead of piling up, so rounds never overlap.
    pub fn start_stabilization(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.config.stabilization_period;
            let mut ticks = time::interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                self.run_stabilization_round().await;
            }
        })
    }

    /// One full stabilization round. A failure in one sub-protocol never
    /// aborts the others.
    pub async fn run_stabilization_round(&self) {
        if let Err(err) = self.stabilize_successor().await {
            debug!("successor stabilization incomplete: {err:#}");
        }
        self.stabilize_predecessor().await;
        self.fill_finger_table().await;
    }

    /// Ask the successor for its predecessor; a node that slipped in between
    /// becomes the new successor. Finish by notifying the successor of us.
    async fn stabilize_successor(&self) -> Result<()> {
        let successor = {
            let table = self.table.lock().await;
            table.successor()
        };
        if successor == self.info {
            return Ok(());
        }

        match self.request_predecessor(&successor).await {
            Ok(Some(candidate))
                if candidate != self.info && between(self.info.id, successor.id, candidate.id) =>
            {
                debug!(successor = candidate.id, "adopting closer successor");
                self.inform_existence(&candidate).await;
            }
            Ok(_) => {}
            Err(err) => {
                self.inform_failure(&successor).await;
                return Err(err.context("successor did not answer a predecessor request"));
            }
        }

        let current = {
            let table = self.table.lock().await;
            table.successor()
        };
        if current == self.info {
            return Ok(());
        }
        let notify = Operation::Notify(Notify {
            origin: self.info.clone(),
        });
        if let Err(err) = self.network.send(&current, notify).await {
            debug!(successor = current.id, "notify undeliverable: {err:#}");
            self.inform_failure(&current).await;
        }
        Ok(())
    }

    /// Probe the predecessor with a routed lookup of its own id. An answer
    /// refreshes the slot; a timeout means the predecessor is presumed dead
    /// and the slot empties until someone notifies us.
    async fn stabilize_predecessor(&self) {
        let predecessor = {
            let table = self.table.lock().await;
            table.predecessor().cloned()
        };
        let Some(predecessor) = predecessor else { return };
        if predecessor == self.info {
            return;
        }

        match self.lookup(predecessor.id).await {
            Ok(owner) => {
                let mut table = self.table.lock().await;
                table.set_predecessor(Some(owner));
            }
            Err(_) => {
                debug!(
                    predecessor = predecessor.id,
                    "predecessor not responding, dropping reference"
                );
                let mut table = self.table.lock().await;
                table.set_predecessor(None);
            }
        }
    }

    /// Repoint every finger at the best currently known owner of its start
    /// key, looking owners up over the ring where the successor list cannot
    /// answer. A timed-out lookup leaves its slot untouched.
    async fn fill_finger_table(&self) {
        for index in 1..RING_BITS {
            let pending = {
                let mut table = self.table.lock().await;
                let start = table.finger_start(index);
                if let Some(covering) = table.successor_covering(start) {
                    table.set_finger(index, covering);
                    None
                } else {
                    let head = table.successor();
                    if head != *table.local()
                        && between_right_inclusive(table.local().id, head.id, start)
                    {
                        table.set_finger(index, head);
                        None
                    } else {
                        Some(start)
                    }
                }
            };

            if let Some(key) = pending {
                match self.lookup(key).await {
                    Ok(owner) => {
                        let mut table = self.table.lock().await;
                        table.set_finger(index, owner);
                    }
                    Err(_) => trace!(index, key, "finger refresh timed out"),
                }
            }
        }
    }

    /// Fetch the successor's predecessor, sharing the one outstanding
    /// request among concurrent callers.
    async fn request_predecessor(
        &self,
        successor: &NodeInfo,
    ) -> Result<Option<NodeInfo>> {
        let (tx, rx) = oneshot::channel();
        let first = {
            let mut waiters = self.predecessor_waiters.lock().await;
            waiters.push(tx);
            waiters.len() == 1
        };
        if first {
            let request = Operation::RequestPredecessor(RequestPredecessor {
                origin: self.info.clone(),
            });
            if let Err(err) = self.network.send(successor, request).await {
                self.predecessor_waiters.lock().await.clear();
                self.inform_failure(successor).await;
                return Err(err.context("predecessor request undeliverable"));
            }
        }

        match time::timeout(self.config.lookup_timeout, rx).await {
            Ok(Ok(predecessor)) => Ok(predecessor),
            Ok(Err(_)) => Err(anyhow!("predecessor request abandoned")),
            Err(_) => {
                self.predecessor_waiters.lock().await.clear();
                Err(anyhow!("predecessor request timed out"))
            }
        }
    }

    // ------------------------------------------------------------------
    // Core-facing interface
    // ------------------------------------------------------------------

    /// Join the ring known to `seed`: learn our successor by looking up the
    /// key just past our own id, fill the finger table, then adopt the
    /// successor's predecessor as ours.
    pub async fn bootstrap(&self, seed: &NodeInfo) -> Result<()> {
        let successor_key = add_to_node_id(self.info.id, 1);
        let rx = self.lookup_handle(successor_key, Some(seed)).await;
        let successor = self
            .await_lookup(successor_key, rx)
            .await
            .context("seed node did not resolve a successor")?;
        debug!(successor = successor.id, "joined ring");
        {
            let mut table = self.table.lock().await;
            table.set_finger(0, successor.clone());
            table.update_successors(&successor);
        }

        self.fill_finger_table().await;

        let successor = {
            let table = self.table.lock().await;
            table.successor()
        };
        if successor == self.info {
            return Ok(());
        }
        let predecessor = self
            .request_predecessor(&successor)
            .await
            .context("successor did not reveal its predecessor")?;
        if let Some(predecessor) = predecessor {
            let mut table = self.table.lock().await;
            table.update_predecessor(&predecessor);
        }
        Ok(())
    }

    /// Ship opaque bytes to a specific peer (the layer above routes first,
    /// then delivers value bytes here).
    pub async fn send_payload(&self, target: &NodeInfo, payload: Vec<u8>) -> Result<()> {
        let operation = Operation::Deliver(Deliver {
            origin: self.info.clone(),
            payload,
        });
        if let Err(err) = self.network.send(target, operation).await {
            self.inform_failure(target).await;
            return Err(err.context("payload delivery failed"));
        }
        Ok(())
    }

    /// Take the receiving end of inbound payloads. Yields `Some` once.
    pub async fn take_deliveries(&self) -> Option<mpsc::Receiver<Delivery>> {
        let mut slot = self.delivery_rx.lock().await;
        slot.take()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Overlay Node (Public API)
// ─────────────────────────────────────────────────────────────────────────────

/// Clonable handle to a [`ChordNode`].
///
/// This is the surface external collaborators program against: `route` a key
/// to its responsible node, `send` bytes to a peer, `bootstrap` into an
/// existing ring and keep it healthy with `start_stabilization`. The handle
/// is cheap to clone and can be shared between tasks.
///
/// # Example
///
/// ```ignore
/// let node = OverlayNode::new(info, network, ChordConfig::default());
/// node.bootstrap(&seed).await?;
/// node.start_stabilization();
/// let owner = node.route(key).await?;
/// node.send(&owner, value_bytes).await?;
/// ```
pub struct OverlayNode<N: ChordNetwork> {
    inner: Arc<ChordNode<N>>,
}

impl<N: ChordNetwork> Clone for OverlayNode<N> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<N: ChordNetwork> OverlayNode<N> {
    /// Create a node that initially forms a one-element ring.
    pub fn new(info: NodeInfo, network: N, config: ChordConfig) -> Self {
        Self {
            inner: ChordNode::new(info, network, config),
        }
    }

    /// This node's own identity.
    pub fn info(&self) -> NodeInfo {
        self.inner.info().clone()
    }

    /// The node currently responsible for `key` on this node's ring view.
    pub async fn route(&self, key: Key) -> std::result::Result<NodeInfo, LookupError> {
        self.inner.lookup(key).await
    }

    /// Deliver opaque bytes to a specific peer.
    pub async fn send(&self, target: &NodeInfo, payload: Vec<u8>) -> Result<()> {
        self.inner.send_payload(target, payload).await
    }

    /// Take the receiver of inbound payloads. Yields `Some` once.
    pub async fn deliveries(&self) -> Option<mpsc::Receiver<Delivery>> {
        self.inner.take_deliveries().await
    }

    /// Join the ring known to `seed`.
    pub async fn bootstrap(&self, seed: &NodeInfo) -> Result<()> {
        self.inner.bootstrap(seed).await
    }

    /// Spawn the periodic stabilization task.
    pub fn start_stabilization(&self) -> JoinHandle<()> {
        self.inner.clone().start_stabilization()
    }

    /// Run one stabilization round now (tests pace the protocol manually).
    pub async fn run_stabilization_round(&self) {
        self.inner.run_stabilization_round().await
    }

    /// Execute one inbound operation against this node.
    pub async fn execute(&self, operation: Operation) {
        self.inner.execute(operation).await
    }

    /// Hint that a peer was observed alive.
    pub async fn observe(&self, peer: &NodeInfo) {
        self.inner.inform_existence(peer).await
    }

    /// Copy of the membership state, for diagnostics and tests.
    pub async fn ring_snapshot(&self) -> RingSnapshot {
        self.inner.ring_snapshot().await
    }
}
