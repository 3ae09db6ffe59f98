//! Plan-fragment value types handed to the scheduler by the planner.
//!
//! Contract:
//! - a fragment's `partitioning` decides which task-source variant drives it;
//! - remote sources name the child fragments a stage reads through the
//!   exchange and whether their output is replicated to every task;
//! - source-distributed fragments carry exactly one table scan.

use std::sync::Arc;

use floq_common::{FloqError, PlanFragmentId, PlanNodeId, Result};
use serde::{Deserialize, Serialize};

use crate::split::CatalogHandle;

/// How a fragment's work is distributed across tasks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitioningHandle {
    /// One task holding all input.
    Single,
    /// One task pinned to the coordinator.
    Coordinator,
    /// Fixed hash fan-out over the configured partition count.
    FixedHash,
    /// Greedy packing of exchange output by byte size.
    Arbitrary,
    /// Driven by a connector split source.
    Source,
    /// Hash fan-out bucketed by a connector's bucket-node map.
    CatalogBucketed {
        /// Catalog owning the bucket map.
        catalog: CatalogHandle,
        /// Connector-specific partitioning discriminator.
        token: u64,
    },
}

/// Whether a remote source is fanned out per partition or broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteSourceDistribution {
    /// Handles are partitioned by downstream partition id.
    Partitioned,
    /// Handles are appended to every emitted task.
    Replicated,
}

/// One upstream exchange read by a fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSource {
    /// Plan node consuming the exchange output.
    pub plan_node_id: PlanNodeId,
    /// Child fragments feeding this source.
    pub source_fragments: Vec<PlanFragmentId>,
    /// Partitioned vs replicated delivery.
    pub distribution: RemoteSourceDistribution,
}

/// One table scan feeding a fragment from a connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableScanSource {
    /// Scan plan node id.
    pub plan_node_id: PlanNodeId,
    /// Catalog the scan reads.
    pub catalog: CatalogHandle,
}

/// A planned unit of parallel work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanFragment {
    /// Fragment identity within the query plan.
    pub id: PlanFragmentId,
    /// Task distribution policy.
    pub partitioning: PartitioningHandle,
    /// Upstream exchanges read by this fragment.
    pub remote_sources: Vec<RemoteSource>,
    /// Connector table scans read by this fragment.
    pub table_scans: Vec<TableScanSource>,
}

impl PlanFragment {
    /// Construct a fragment without sources; extend with the builder methods.
    pub fn new(id: PlanFragmentId, partitioning: PartitioningHandle) -> Self {
        Self {
            id,
            partitioning,
            remote_sources: Vec::new(),
            table_scans: Vec::new(),
        }
    }

    /// Add one upstream exchange read.
    pub fn with_remote_source(
        mut self,
        plan_node_id: PlanNodeId,
        source_fragments: Vec<PlanFragmentId>,
        distribution: RemoteSourceDistribution,
    ) -> Self {
        self.remote_sources.push(RemoteSource {
            plan_node_id,
            source_fragments,
            distribution,
        });
        self
    }

    /// Add one connector table scan.
    pub fn with_table_scan(mut self, plan_node_id: PlanNodeId, catalog: CatalogHandle) -> Self {
        self.table_scans.push(TableScanSource {
            plan_node_id,
            catalog,
        });
        self
    }

    /// All child fragment ids in remote-source order.
    pub fn source_fragment_ids(&self) -> Vec<PlanFragmentId> {
        self.remote_sources
            .iter()
            .flat_map(|source| source.source_fragments.iter().copied())
            .collect()
    }

    /// The single table scan of a source-distributed fragment.
    pub fn source_distribution_scan(&self) -> Result<&TableScanSource> {
        match self.table_scans.as_slice() {
            [scan] => Ok(scan),
            scans => Err(FloqError::Planning(format!(
                "source-distributed fragment {} must have exactly one table scan, found {}",
                self.id,
                scans.len()
            ))),
        }
    }

    /// Catalog shared by this fragment's table scans, if any.
    pub fn scan_catalog(&self) -> Option<CatalogHandle> {
        self.table_scans.first().map(|scan| scan.catalog.clone())
    }
}

/// A fragment tree rooted at the query output.
#[derive(Debug, Clone)]
pub struct SubPlan {
    /// Fragment at this node.
    pub fragment: Arc<PlanFragment>,
    /// Child plans producing this fragment's exchange input.
    pub children: Vec<SubPlan>,
}

impl SubPlan {
    /// Construct a leaf plan.
    pub fn leaf(fragment: PlanFragment) -> Self {
        Self {
            fragment: Arc::new(fragment),
            children: Vec::new(),
        }
    }

    /// Construct an inner plan node.
    pub fn new(fragment: PlanFragment, children: Vec<SubPlan>) -> Self {
        Self {
            fragment: Arc::new(fragment),
            children,
        }
    }

    /// Number of fragments in the tree.
    pub fn fragment_count(&self) -> usize {
        1 + self
            .children
            .iter()
            .map(SubPlan::fragment_count)
            .sum::<usize>()
    }
}
