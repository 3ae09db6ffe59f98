#![deny(missing_docs)]

//! Fault-tolerant query scheduler core for a distributed SQL engine.
//!
//! Architecture role:
//! - decomposes plan-fragment stages into independently retriable tasks
//!   under five distribution policies;
//! - leases worker nodes with memory accounting and adaptive post-failure
//!   estimates;
//! - drives each stage through a retry protocol and the query through its
//!   state machine, decoupled from producers by an external exchange.
//!
//! Key modules:
//! - [`task_source`]: stage input -> task descriptors
//! - [`stage_scheduler`]: per-stage scheduling, retries, sink publication
//! - [`query_scheduler`]: exchange wiring and the cooperative loop
//! - [`allocator`], [`estimator`], [`storage`]: shared per-query services
//!
//! External collaborators (exchange, connector split sources, the worker
//! runtime, failure detection, bucket-node maps) are consumed behind traits
//! and never implemented here.

/// Worker-node leasing with memory accounting.
pub mod allocator;
/// Per-partition task memory estimation.
pub mod estimator;
/// Failure classification for the retry protocol.
pub mod failure;
/// Plan-fragment value types.
pub mod fragment;
/// Worker-node identity and liveness contracts.
pub mod node;
/// Bucket-to-partition mapping shared across stages.
pub mod partitioning;
/// Query lifecycle state machine.
pub mod query_state;
/// Query-level orchestration.
pub mod query_scheduler;
/// Worker-runtime contract for task attempts.
pub mod remote_task;
/// Split model and connector split-source contracts.
pub mod split;
/// Runtime stages and the stage manager.
pub mod stage;
/// Per-stage fault-tolerant scheduling.
pub mod stage_scheduler;
/// Bounded task-descriptor storage.
pub mod storage;
/// Task descriptor and node-requirement value objects.
pub mod task;
/// Task enumeration under the distribution policies.
pub mod task_source;

pub use allocator::{BinPackingNodeAllocator, NodeAllocator, NodeLease};
pub use estimator::{
    ExponentialGrowthPartitionMemoryEstimator, PartitionMemoryEstimator,
    PartitionMemoryEstimatorFactory,
};
pub use failure::{ExecutionFailure, FailureKind};
pub use fragment::{
    PartitioningHandle, PlanFragment, RemoteSource, RemoteSourceDistribution, SubPlan,
    TableScanSource,
};
pub use node::{FailureDetector, HostAddress, InternalNode, NoOpFailureDetector, NodeInventory};
pub use partitioning::{
    BucketToPartitionCache, FaultTolerantPartitioningScheme, NodePartitioningManager,
};
pub use query_scheduler::FaultTolerantQueryScheduler;
pub use query_state::{QueryState, QueryStateMachine};
pub use remote_task::{RemoteTask, RemoteTaskFactory, TaskState, TaskStatus};
pub use split::{
    create_remote_splits, CatalogHandle, ConnectorSplit, HandlesByNode, RemoteSplit, Split,
    SplitBatch, SplitSource, SplitSourceProvider, SplitsByNode,
};
pub use stage::{Stage, StageExecutionStats, StageManager, StageState};
pub use stage_scheduler::FaultTolerantStageScheduler;
pub use storage::TaskDescriptorStorage;
pub use task::{NodeRequirements, TaskDescriptor};
pub use task_source::{
    create_task_source, ArbitraryDistributionTaskSource, HashDistributionTaskSource,
    SingleDistributionTaskSource, SourceDistributionTaskSource, StageTaskSource,
};
