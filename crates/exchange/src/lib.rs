#![deny(missing_docs)]

//! External exchange contract consumed by the floq scheduler.
//!
//! The exchange is the shuffle service decoupling producer stages from
//! consumer stages. The scheduler only ever talks to it through the
//! [`Exchange`] trait:
//! - writers obtain one sink per task attempt, keyed by output partition;
//! - readers obtain a finite list of [`ExchangeSourceHandle`]s via a future
//!   that completes once the producing stage has finished all partitions;
//! - a `preserve_order` exchange reveals handles in producer order.
//!
//! Key modules:
//! - [`handle`]

/// Value types crossing the exchange boundary.
pub mod handle;

use std::fmt;
use std::sync::Arc;

use floq_common::Result;
use futures::future::BoxFuture;

pub use handle::{
    ExchangeContext, ExchangeId, ExchangeSinkHandle, ExchangeSourceHandle, SpoolingExchangeInput,
};

/// Future resolving to the complete source-handle list of one exchange.
pub type SourceHandlesFuture = BoxFuture<'static, Result<Vec<ExchangeSourceHandle>>>;

/// One external exchange instance, scoped to a single producing stage.
///
/// Contract:
/// - `add_sink` may be called once per task attempt; only sinks later passed
///   to `sink_finished` contribute data to source handles;
/// - `no_more_sinks` is raised exactly once, when the producing stage has
///   finished; the source-handle future must not complete before it;
/// - `close` releases spooled data and fails pending futures; idempotent.
pub trait Exchange: Send + Sync + fmt::Debug {
    /// Create a writer sink for one output partition.
    fn add_sink(&self, partition_id: u32) -> ExchangeSinkHandle;

    /// Commit one sink after its task attempt finished successfully.
    fn sink_finished(&self, handle: &ExchangeSinkHandle);

    /// Signal that no further sinks will be added or finished.
    fn no_more_sinks(&self);

    /// Future completing with every source handle of this exchange.
    fn get_source_handles(&self) -> SourceHandlesFuture;

    /// Release all resources held by this exchange.
    fn close(&self);
}

/// Factory for query-scoped exchanges.
pub trait ExchangeManager: Send + Sync {
    /// Create one exchange with a fixed output partition count.
    ///
    /// `preserve_order` pins source-handle reveal order to producer order;
    /// it is set for exchanges consumed directly by the client.
    fn create_exchange(
        &self,
        context: ExchangeContext,
        output_partition_count: u32,
        preserve_order: bool,
    ) -> Arc<dyn Exchange>;
}
