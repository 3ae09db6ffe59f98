//! Worker-node identity and liveness contracts.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use floq_common::DataSize;
use serde::{Deserialize, Serialize};

use crate::split::CatalogHandle;

/// Host/port pair identifying a worker endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostAddress {
    /// Host name or address literal.
    pub host: String,
    /// Service port.
    pub port: u16,
}

impl HostAddress {
    /// Construct from host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One cluster member the allocator can lease tasks to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalNode {
    /// Stable node identifier.
    pub node_id: String,
    /// Task endpoint of the node.
    pub address: HostAddress,
    /// Memory available for leased task attempts.
    pub memory: DataSize,
    /// Catalogs hosted by this node; empty means all catalogs.
    pub catalogs: BTreeSet<CatalogHandle>,
    /// Whether this node is the coordinator.
    pub coordinator: bool,
}

impl InternalNode {
    /// Construct a worker node hosting every catalog.
    pub fn new(node_id: impl Into<String>, address: HostAddress, memory: DataSize) -> Self {
        Self {
            node_id: node_id.into(),
            address,
            memory,
            catalogs: BTreeSet::new(),
            coordinator: false,
        }
    }

    /// Mark this node as the coordinator.
    pub fn with_coordinator(mut self, coordinator: bool) -> Self {
        self.coordinator = coordinator;
        self
    }

    /// Restrict the catalogs hosted by this node.
    pub fn with_catalogs(mut self, catalogs: impl IntoIterator<Item = CatalogHandle>) -> Self {
        self.catalogs = catalogs.into_iter().collect();
        self
    }

    /// Whether this node can serve splits of `catalog`.
    pub fn hosts_catalog(&self, catalog: &CatalogHandle) -> bool {
        self.catalogs.is_empty() || self.catalogs.contains(catalog)
    }
}

/// Liveness oracle consulted before leases are granted.
pub trait FailureDetector: Send + Sync {
    /// Whether the node is currently considered failed.
    fn is_failed(&self, node: &InternalNode) -> bool;
}

/// Failure detector that considers every node healthy.
#[derive(Debug, Default)]
pub struct NoOpFailureDetector;

impl FailureDetector for NoOpFailureDetector {
    fn is_failed(&self, _node: &InternalNode) -> bool {
        false
    }
}

/// Immutable snapshot of cluster membership used to build a query's scheduler.
#[derive(Debug, Clone)]
pub struct NodeInventory {
    /// All schedulable nodes, coordinator included.
    pub nodes: Vec<Arc<InternalNode>>,
}

impl NodeInventory {
    /// Construct from a node list.
    pub fn new(nodes: Vec<InternalNode>) -> Self {
        Self {
            nodes: nodes.into_iter().map(Arc::new).collect(),
        }
    }

    /// The coordinator node, if the snapshot contains one.
    pub fn coordinator(&self) -> Option<&Arc<InternalNode>> {
        self.nodes.iter().find(|node| node.coordinator)
    }
}
