//! Worker-node leasing with per-node memory accounting.
//!
//! Contract:
//! - granted leases satisfy the task's [`NodeRequirements`];
//! - a node never holds concurrent leases past its memory budget;
//! - requests are granted in FIFO order among the requests a node can
//!   satisfy; a request no node can currently satisfy stays pending (never
//!   an error) until memory frees up or the allocator closes;
//! - closing the allocator resolves every pending lease with no node.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use floq_common::metrics::global_metrics;
use floq_common::{DataSize, QueryId};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::debug;

use crate::node::{FailureDetector, InternalNode, NodeInventory};
use crate::task::NodeRequirements;

/// Future resolving to the leased node, or `None` when the lease was
/// cancelled before a grant.
pub type NodeFuture = Shared<BoxFuture<'static, Option<Arc<InternalNode>>>>;

/// One grant (or pending grant) of a worker node.
pub struct NodeLease {
    node: NodeFuture,
    release: Arc<dyn Fn() + Send + Sync>,
    released: AtomicBool,
}

impl NodeLease {
    /// Construct a lease from a node future and a release action.
    pub fn new(node: NodeFuture, release: Arc<dyn Fn() + Send + Sync>) -> Self {
        Self {
            node,
            release,
            released: AtomicBool::new(false),
        }
    }

    /// Future completing once a node is granted.
    pub fn node(&self) -> NodeFuture {
        self.node.clone()
    }

    /// Return the node (or cancel the pending request); idempotent.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            (self.release)();
        }
    }
}

impl std::fmt::Debug for NodeLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeLease")
            .field("released", &self.released.load(Ordering::Acquire))
            .finish()
    }
}

impl Drop for NodeLease {
    fn drop(&mut self) {
        self.release();
    }
}

/// Grants and reclaims worker leases for one query.
pub trait NodeAllocator: Send + Sync {
    /// Request a node satisfying `requirements` with `memory` reserved.
    fn acquire(&self, requirements: &NodeRequirements, memory: DataSize) -> NodeLease;

    /// Cancel all pending leases; idempotent.
    fn close(&self);
}

struct PendingAcquire {
    lease_id: u64,
    requirements: NodeRequirements,
    memory: u64,
    grant: Option<oneshot::Sender<Option<Arc<InternalNode>>>>,
}

struct NodeSlot {
    node: Arc<InternalNode>,
    reserved_bytes: u64,
}

struct AllocatorState {
    nodes: Vec<NodeSlot>,
    pending: VecDeque<PendingAcquire>,
    granted: HashMap<u64, (usize, u64)>,
    next_lease_id: u64,
    closed: bool,
}

/// Memory-bin-packing allocator over a static node inventory.
pub struct BinPackingNodeAllocator {
    query_id: QueryId,
    failure_detector: Arc<dyn FailureDetector>,
    state: Arc<Mutex<AllocatorState>>,
}

impl BinPackingNodeAllocator {
    /// Construct for one query over a membership snapshot.
    pub fn new(
        query_id: QueryId,
        inventory: &NodeInventory,
        failure_detector: Arc<dyn FailureDetector>,
    ) -> Self {
        let nodes = inventory
            .nodes
            .iter()
            .map(|node| NodeSlot {
                node: node.clone(),
                reserved_bytes: 0,
            })
            .collect();
        Self {
            query_id,
            failure_detector,
            state: Arc::new(Mutex::new(AllocatorState {
                nodes,
                pending: VecDeque::new(),
                granted: HashMap::new(),
                next_lease_id: 0,
                closed: false,
            })),
        }
    }

    fn matches(&self, slot: &NodeSlot, requirements: &NodeRequirements, memory: u64) -> bool {
        if self.failure_detector.is_failed(&slot.node) {
            return false;
        }
        if let Some(catalog) = &requirements.catalog {
            if !slot.node.hosts_catalog(catalog) {
                return false;
            }
        }
        if !requirements.addresses.is_empty()
            && !requirements.addresses.contains(&slot.node.address)
        {
            return false;
        }
        slot.reserved_bytes.saturating_add(memory) <= slot.node.memory.bytes()
    }

    // Grant every pending request some node can satisfy, oldest first. A
    // request nothing can satisfy right now stays queued; it does not block
    // younger satisfiable requests.
    fn try_grant(&self, state: &mut AllocatorState) {
        let mut still_pending = VecDeque::new();
        while let Some(mut pending) = state.pending.pop_front() {
            let slot_index = state
                .nodes
                .iter()
                .position(|slot| self.matches(slot, &pending.requirements, pending.memory));
            match slot_index {
                Some(index) => {
                    state.nodes[index].reserved_bytes = state.nodes[index]
                        .reserved_bytes
                        .saturating_add(pending.memory);
                    state
                        .granted
                        .insert(pending.lease_id, (index, pending.memory));
                    let node = state.nodes[index].node.clone();
                    global_metrics()
                        .set_allocator_reserved_bytes(&node.node_id, state.nodes[index].reserved_bytes);
                    debug!(
                        query_id = %self.query_id,
                        node_id = %node.node_id,
                        memory = %DataSize::of_bytes(pending.memory),
                        operator = "NodeAllocator",
                        "granted node lease"
                    );
                    if let Some(grant) = pending.grant.take() {
                        let _ = grant.send(Some(node));
                    }
                }
                None => still_pending.push_back(pending),
            }
        }
        state.pending = still_pending;
        global_metrics()
            .set_allocator_pending_leases(&self.query_id.to_string(), state.pending.len() as u64);
    }

    fn release_lease(&self, lease_id: u64) {
        let mut state = self.state.lock().expect("allocator lock");
        if let Some((index, memory)) = state.granted.remove(&lease_id) {
            state.nodes[index].reserved_bytes =
                state.nodes[index].reserved_bytes.saturating_sub(memory);
            global_metrics().set_allocator_reserved_bytes(
                &state.nodes[index].node.node_id,
                state.nodes[index].reserved_bytes,
            );
        } else {
            // Pending request cancelled before a grant; dropping the sender
            // resolves the node future with None.
            state.pending.retain(|pending| pending.lease_id != lease_id);
        }
        self.try_grant(&mut state);
    }
}

impl NodeAllocator for BinPackingNodeAllocator {
    fn acquire(&self, requirements: &NodeRequirements, memory: DataSize) -> NodeLease {
        let (tx, rx) = oneshot::channel::<Option<Arc<InternalNode>>>();
        let node_future: NodeFuture = rx.map(|result| result.ok().flatten()).boxed().shared();

        let mut state = self.state.lock().expect("allocator lock");
        let lease_id = state.next_lease_id;
        state.next_lease_id += 1;
        if state.closed {
            drop(tx);
        } else {
            state.pending.push_back(PendingAcquire {
                lease_id,
                requirements: requirements.clone(),
                memory: memory.bytes(),
                grant: Some(tx),
            });
            self.try_grant(&mut state);
        }
        drop(state);

        let state = self.state.clone();
        let query_id = self.query_id;
        let failure_detector = self.failure_detector.clone();
        let this = BinPackingNodeAllocator {
            query_id,
            failure_detector,
            state,
        };
        NodeLease::new(node_future, Arc::new(move || this.release_lease(lease_id)))
    }

    fn close(&self) {
        let mut state = self.state.lock().expect("allocator lock");
        if state.closed {
            return;
        }
        state.closed = true;
        for mut pending in state.pending.drain(..) {
            if let Some(grant) = pending.grant.take() {
                let _ = grant.send(None);
            }
        }
        global_metrics().set_allocator_pending_leases(&self.query_id.to_string(), 0);
    }
}
