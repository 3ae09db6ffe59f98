//! Split model and connector split-source contracts.
//!
//! A split is a unit of input work: either a connector-backed data split or a
//! remote reference to spooled exchange output. Splits are immutable;
//! ordering within one plan node is preserved end to end.

use std::collections::BTreeMap;

use async_trait::async_trait;
use floq_common::{PlanNodeId, QueryId, Result, SplitWeight};
use floq_exchange::{ExchangeSourceHandle, SpoolingExchangeInput};
use serde::{Deserialize, Serialize};

use crate::fragment::{PlanFragment, TableScanSource};
use crate::node::HostAddress;

/// Catalog identity a connector split belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CatalogHandle(
    /// Catalog name.
    pub String,
);

impl CatalogHandle {
    /// Reserved sentinel catalog carried by remote (exchange) splits.
    pub const REMOTE_NAME: &'static str = "$remote";

    /// Construct a catalog handle from a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The reserved remote sentinel.
    pub fn remote() -> Self {
        Self(Self::REMOTE_NAME.to_string())
    }

    /// Whether this is the remote sentinel.
    pub fn is_remote(&self) -> bool {
        self.0 == Self::REMOTE_NAME
    }
}

/// A connector-backed data split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorSplit {
    /// Catalog the split belongs to.
    pub catalog: CatalogHandle,
    /// Opaque connector payload.
    pub payload: serde_json::Value,
    /// Relative cost weight.
    pub weight: SplitWeight,
    /// Host affinity; empty means remotely accessible from any node.
    pub addresses: Vec<HostAddress>,
    /// Hash bucket for bucketed table scans.
    pub bucket: Option<u32>,
}

impl ConnectorSplit {
    /// Construct a standard-weight split with no affinity.
    pub fn new(catalog: CatalogHandle, payload: serde_json::Value) -> Self {
        Self {
            catalog,
            payload,
            weight: SplitWeight::standard(),
            addresses: Vec::new(),
            bucket: None,
        }
    }

    /// Override the split weight.
    pub fn with_weight(mut self, weight: SplitWeight) -> Self {
        self.weight = weight;
        self
    }

    /// Pin the split to a set of hosts.
    pub fn with_addresses(mut self, addresses: Vec<HostAddress>) -> Self {
        self.addresses = addresses;
        self
    }

    /// Assign the split to a hash bucket.
    pub fn with_bucket(mut self, bucket: u32) -> Self {
        self.bucket = Some(bucket);
        self
    }

    /// Whether any node may run this split.
    pub fn is_remotely_accessible(&self) -> bool {
        self.addresses.is_empty()
    }
}

/// A synthetic split wrapping spooled exchange output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSplit {
    /// Exchange input the consumer task reads.
    pub exchange_input: SpoolingExchangeInput,
}

impl RemoteSplit {
    /// Wrap an exchange input.
    pub fn new(exchange_input: SpoolingExchangeInput) -> Self {
        Self { exchange_input }
    }
}

/// A unit of input work assigned to one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Split {
    /// Connector-backed data split.
    Connector(ConnectorSplit),
    /// Remote reference to exchange output.
    Remote(RemoteSplit),
}

impl Split {
    /// Catalog handle of the split; remote splits carry the reserved sentinel.
    pub fn catalog_handle(&self) -> CatalogHandle {
        match self {
            Split::Connector(split) => split.catalog.clone(),
            Split::Remote(_) => CatalogHandle::remote(),
        }
    }

    /// Split weight; remote splits weigh one standard unit.
    pub fn weight(&self) -> SplitWeight {
        match self {
            Split::Connector(split) => split.weight,
            Split::Remote(_) => SplitWeight::standard(),
        }
    }

    /// The connector split, if this is one.
    pub fn as_connector(&self) -> Option<&ConnectorSplit> {
        match self {
            Split::Connector(split) => Some(split),
            Split::Remote(_) => None,
        }
    }

    /// The remote split, if this is one.
    pub fn as_remote(&self) -> Option<&RemoteSplit> {
        match self {
            Split::Connector(_) => None,
            Split::Remote(split) => Some(split),
        }
    }

    /// Rough retained size used for descriptor-storage accounting.
    pub fn retained_bytes(&self) -> u64 {
        match self {
            Split::Connector(split) => {
                64 + split.payload.to_string().len() as u64
                    + split
                        .addresses
                        .iter()
                        .map(|address| address.host.len() as u64 + 8)
                        .sum::<u64>()
            }
            Split::Remote(split) => {
                32 + split.exchange_input.source_handles.len() as u64 * 24
            }
        }
    }
}

/// Splits grouped by the plan node consuming them.
pub type SplitsByNode = BTreeMap<PlanNodeId, Vec<Split>>;

/// One batch pulled from a connector split source.
#[derive(Debug, Default)]
pub struct SplitBatch {
    /// Splits in source order.
    pub splits: Vec<ConnectorSplit>,
    /// Whether the source is exhausted after this batch.
    pub no_more_splits: bool,
}

/// Asynchronous stream of connector splits for one table scan.
#[async_trait]
pub trait SplitSource: Send {
    /// Pull up to `max_size` splits.
    ///
    /// An empty batch with `no_more_splits == false` means the source is
    /// still discovering work and must be polled again.
    async fn next_batch(&mut self, max_size: usize) -> Result<SplitBatch>;

    /// Release any pending discovery work; idempotent.
    fn close(&mut self);
}

/// Supplies connector split sources for the table scans of a fragment.
pub trait SplitSourceProvider: Send + Sync {
    /// Open a split source for one table-scan node.
    fn open_split_source(
        &self,
        query_id: QueryId,
        fragment: &PlanFragment,
        scan: &TableScanSource,
    ) -> Result<Box<dyn SplitSource>>;
}

/// Exchange source handles grouped by the consuming plan node.
pub type HandlesByNode = BTreeMap<PlanNodeId, Vec<ExchangeSourceHandle>>;

/// Wrap per-node exchange handles into one remote split per plan node.
///
/// Each consuming plan node receives a single remote split carrying every
/// handle destined for it, preserving handle order.
pub fn create_remote_splits(handles: &HandlesByNode) -> SplitsByNode {
    handles
        .iter()
        .filter(|(_, node_handles)| !node_handles.is_empty())
        .map(|(plan_node_id, node_handles)| {
            (
                *plan_node_id,
                vec![Split::Remote(RemoteSplit::new(SpoolingExchangeInput::new(
                    node_handles.clone(),
                )))],
            )
        })
        .collect()
}

/// Flatten handles grouped by node into `(node, handle)` pairs preserving
/// per-node insertion order.
pub fn flatten_handles(handles: &HandlesByNode) -> Vec<(PlanNodeId, ExchangeSourceHandle)> {
    handles
        .iter()
        .flat_map(|(plan_node_id, node_handles)| {
            node_handles
                .iter()
                .map(move |handle| (*plan_node_id, handle.clone()))
        })
        .collect()
}
