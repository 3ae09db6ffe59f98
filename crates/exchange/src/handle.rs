//! Value types crossing the exchange boundary.

use floq_common::{DataSize, QueryId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of one external exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExchangeId(
    /// Raw id value, unique within the exchange service.
    pub String,
);

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity passed to the exchange service when an exchange is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeContext {
    /// Query the exchange belongs to.
    pub query_id: QueryId,
    /// Exchange identity within the service.
    pub exchange_id: ExchangeId,
}

impl ExchangeContext {
    /// Construct a context for one query-scoped exchange.
    pub fn new(query_id: QueryId, exchange_id: ExchangeId) -> Self {
        Self {
            query_id,
            exchange_id,
        }
    }
}

/// Reference to spooled data for one downstream partition.
///
/// Handles are revealed by [`crate::Exchange::get_source_handles`] once the
/// producing stage has finished all partitions; for an ordered exchange they
/// are emitted in producer order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExchangeSourceHandle {
    /// Downstream partition index this handle targets.
    pub partition_id: u32,
    /// Spooled payload size.
    pub data_size: DataSize,
    /// Opaque discriminator assigned by the exchange service.
    pub token: u64,
}

impl ExchangeSourceHandle {
    /// Construct a handle.
    pub fn new(partition_id: u32, data_size: DataSize, token: u64) -> Self {
        Self {
            partition_id,
            data_size,
            token,
        }
    }
}

/// Reference to one writer sink created for a task attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExchangeSinkHandle {
    /// Output partition the sink writes.
    pub partition_id: u32,
    /// Sink instance id; distinct per attempt.
    pub sink_id: u64,
}

/// Exchange input handed to a consumer task or to the client as final results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpoolingExchangeInput {
    /// Source handles the consumer should read, in reveal order.
    pub source_handles: Vec<ExchangeSourceHandle>,
}

impl SpoolingExchangeInput {
    /// Wrap a list of source handles.
    pub fn new(source_handles: Vec<ExchangeSourceHandle>) -> Self {
        Self { source_handles }
    }

    /// Total spooled size across all handles.
    pub fn total_size(&self) -> DataSize {
        self.source_handles
            .iter()
            .fold(DataSize::ZERO, |acc, handle| {
                acc.saturating_add(handle.data_size)
            })
    }
}
