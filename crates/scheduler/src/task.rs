//! Task descriptor and node-requirement value objects.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::node::HostAddress;
use crate::split::{CatalogHandle, SplitsByNode};

/// Placement constraints for one task attempt.
///
/// An empty address set allows any node; a non-empty set requires one of the
/// listed addresses. A present catalog handle requires a node hosting that
/// catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRequirements {
    /// Catalog the node must host, if any.
    pub catalog: Option<CatalogHandle>,
    /// Allowed host addresses; empty means unconstrained.
    pub addresses: BTreeSet<HostAddress>,
}

impl NodeRequirements {
    /// Construct requirements from parts.
    pub fn new(
        catalog: Option<CatalogHandle>,
        addresses: impl IntoIterator<Item = HostAddress>,
    ) -> Self {
        Self {
            catalog,
            addresses: addresses.into_iter().collect(),
        }
    }

    /// Requirements satisfied by any node.
    pub fn any() -> Self {
        Self::default()
    }
}

/// Immutable description of one schedulable task.
///
/// Splits retain their original ordering within each plan node. Two
/// descriptors with the same partition id in the same stage describe
/// successive attempts of the same partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Output partition the task computes.
    pub partition_id: u32,
    /// Input splits grouped by consuming plan node.
    pub splits: SplitsByNode,
    /// Placement constraints.
    pub node_requirements: NodeRequirements,
}

impl TaskDescriptor {
    /// Construct a descriptor.
    pub fn new(partition_id: u32, splits: SplitsByNode, node_requirements: NodeRequirements) -> Self {
        Self {
            partition_id,
            splits,
            node_requirements,
        }
    }

    /// Total split count across all plan nodes.
    pub fn split_count(&self) -> usize {
        self.splits.values().map(Vec::len).sum()
    }

    /// Rough retained size used for descriptor-storage accounting.
    pub fn retained_bytes(&self) -> u64 {
        let splits = self
            .splits
            .values()
            .flatten()
            .map(|split| split.retained_bytes())
            .sum::<u64>();
        let addresses = self
            .node_requirements
            .addresses
            .iter()
            .map(|address| address.host.len() as u64 + 8)
            .sum::<u64>();
        64 + splits + addresses
    }
}
