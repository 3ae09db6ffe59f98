//! Stage task enumeration under the four distribution policies.
//!
//! A task source turns a stage's input splits and upstream exchange handles
//! into a lazy sequence of task descriptors:
//! - `more_tasks` completes when at least one new task is ready or the
//!   source is exhausted (possibly with an empty final batch);
//! - `is_finished` flips to true exactly once, after the last batch has been
//!   observed;
//! - `close` releases split sources; idempotent.
//!
//! Dispatch over the variants is a tagged enum; each variant owns its
//! packing algorithm.

use std::collections::BTreeMap;

use floq_common::{
    DataSize, FloqError, PlanNodeId, QueryId, Result, SchedulerConfig, SplitWeight,
};
use floq_exchange::ExchangeSourceHandle;
use tracing::debug;

use crate::fragment::{PartitioningHandle, PlanFragment};
use crate::node::{HostAddress, InternalNode};
use crate::partitioning::FaultTolerantPartitioningScheme;
use crate::split::{
    create_remote_splits, flatten_handles, CatalogHandle, ConnectorSplit, HandlesByNode, Split,
    SplitSource, SplitsByNode,
};
use crate::task::{NodeRequirements, TaskDescriptor};

/// Stateful producer of task descriptors for one stage.
pub enum StageTaskSource {
    /// All input in one task.
    Single(SingleDistributionTaskSource),
    /// Exchange output packed greedily by byte size.
    Arbitrary(ArbitraryDistributionTaskSource),
    /// Bucketed fan-out with adaptive partition joining.
    Hash(HashDistributionTaskSource),
    /// Driven by a connector split source.
    Source(SourceDistributionTaskSource),
}

impl StageTaskSource {
    /// Produce the next batch of task descriptors.
    pub async fn more_tasks(&mut self) -> Result<Vec<TaskDescriptor>> {
        match self {
            StageTaskSource::Single(source) => source.more_tasks(),
            StageTaskSource::Arbitrary(source) => source.more_tasks(),
            StageTaskSource::Hash(source) => source.more_tasks().await,
            StageTaskSource::Source(source) => source.more_tasks().await,
        }
    }

    /// Whether the last batch has been observed.
    pub fn is_finished(&self) -> bool {
        match self {
            StageTaskSource::Single(source) => source.finished,
            StageTaskSource::Arbitrary(source) => source.finished,
            StageTaskSource::Hash(source) => source.finished,
            StageTaskSource::Source(source) => source.finished,
        }
    }

    /// Release split sources and pending work; idempotent.
    pub fn close(&mut self) {
        match self {
            StageTaskSource::Single(_) | StageTaskSource::Arbitrary(_) => {}
            StageTaskSource::Hash(source) => source.close(),
            StageTaskSource::Source(source) => source.close(),
        }
    }
}

/// Build the task source matching a fragment's distribution policy.
#[allow(clippy::too_many_arguments)]
pub fn create_task_source(
    query_id: QueryId,
    fragment: &PlanFragment,
    partitioned_handles: HandlesByNode,
    replicated_handles: HandlesByNode,
    mut split_sources: BTreeMap<PlanNodeId, Box<dyn SplitSource>>,
    scheme: FaultTolerantPartitioningScheme,
    coordinator: Option<&InternalNode>,
    config: &SchedulerConfig,
) -> Result<StageTaskSource> {
    match &fragment.partitioning {
        PartitioningHandle::Single | PartitioningHandle::Coordinator => {
            let coordinator_only =
                matches!(fragment.partitioning, PartitioningHandle::Coordinator);
            let pinned = if coordinator_only {
                let node = coordinator.ok_or_else(|| {
                    FloqError::Planning(format!(
                        "fragment {} is coordinator-distributed but the cluster has no coordinator",
                        fragment.id
                    ))
                })?;
                Some(node.address.clone())
            } else {
                None
            };
            let mut handles = partitioned_handles;
            for (plan_node_id, node_handles) in replicated_handles {
                handles.entry(plan_node_id).or_default().extend(node_handles);
            }
            Ok(StageTaskSource::Single(SingleDistributionTaskSource::new(
                &handles, pinned,
            )))
        }
        PartitioningHandle::Arbitrary => Ok(StageTaskSource::Arbitrary(
            ArbitraryDistributionTaskSource::new(
                flatten_handles(&partitioned_handles),
                &replicated_handles,
                config.target_partition_size,
            ),
        )),
        PartitioningHandle::FixedHash | PartitioningHandle::CatalogBucketed { .. } => {
            Ok(StageTaskSource::Hash(HashDistributionTaskSource::new(
                split_sources,
                partitioned_handles,
                &replicated_handles,
                config.split_batch_size,
                scheme,
                fragment.scan_catalog(),
                config.target_partition_split_weight,
                config.target_partition_source_size,
            )))
        }
        PartitioningHandle::Source => {
            let scan = fragment.source_distribution_scan()?;
            let split_source = split_sources.remove(&scan.plan_node_id).ok_or_else(|| {
                FloqError::Planning(format!(
                    "no split source opened for scan node {} of fragment {}",
                    scan.plan_node_id, fragment.id
                ))
            })?;
            Ok(StageTaskSource::Source(SourceDistributionTaskSource::new(
                query_id,
                scan.plan_node_id,
                Some(scan.catalog.clone()),
                split_source,
                &replicated_handles,
                config.split_batch_size,
                config.min_splits_per_task,
                config.split_weight_per_task,
                config.max_splits_per_task,
            )))
        }
    }
}

/// Emits exactly one task carrying every split.
pub struct SingleDistributionTaskSource {
    splits: SplitsByNode,
    pinned: Option<HostAddress>,
    finished: bool,
}

impl SingleDistributionTaskSource {
    /// Construct from the full handle set; `pinned` restricts placement to
    /// the coordinator.
    pub fn new(handles: &HandlesByNode, pinned: Option<HostAddress>) -> Self {
        Self {
            splits: create_remote_splits(handles),
            pinned,
            finished: false,
        }
    }

    fn more_tasks(&mut self) -> Result<Vec<TaskDescriptor>> {
        if self.finished {
            return Ok(Vec::new());
        }
        self.finished = true;
        let requirements = NodeRequirements::new(None, self.pinned.iter().cloned());
        Ok(vec![TaskDescriptor::new(
            0,
            std::mem::take(&mut self.splits),
            requirements,
        )])
    }
}

/// Packs non-replicated exchange handles greedily into partitions by size.
pub struct ArbitraryDistributionTaskSource {
    partitioned: Vec<(PlanNodeId, ExchangeSourceHandle)>,
    replicated_splits: SplitsByNode,
    target_size: DataSize,
    finished: bool,
}

impl ArbitraryDistributionTaskSource {
    /// Construct from handles in insertion order.
    pub fn new(
        partitioned: Vec<(PlanNodeId, ExchangeSourceHandle)>,
        replicated: &HandlesByNode,
        target_size: DataSize,
    ) -> Self {
        Self {
            partitioned,
            replicated_splits: create_remote_splits(replicated),
            target_size,
            finished: false,
        }
    }

    fn more_tasks(&mut self) -> Result<Vec<TaskDescriptor>> {
        if self.finished {
            return Ok(Vec::new());
        }
        self.finished = true;

        let mut tasks = Vec::new();
        let mut open: HandlesByNode = BTreeMap::new();
        let mut open_bytes = 0_u64;
        let target = self.target_size.bytes();
        let partitioned = std::mem::take(&mut self.partitioned);

        fn seal(
            open: &mut HandlesByNode,
            open_bytes: &mut u64,
            replicated_splits: &SplitsByNode,
            tasks: &mut Vec<TaskDescriptor>,
        ) {
            if open.is_empty() {
                return;
            }
            let mut splits = create_remote_splits(open);
            for (plan_node_id, replicated) in replicated_splits {
                splits
                    .entry(*plan_node_id)
                    .or_default()
                    .extend(replicated.iter().cloned());
            }
            tasks.push(TaskDescriptor::new(
                tasks.len() as u32,
                splits,
                NodeRequirements::any(),
            ));
            open.clear();
            *open_bytes = 0;
        }

        for (plan_node_id, handle) in partitioned {
            let size = handle.data_size.bytes();
            if open_bytes > 0 && open_bytes.saturating_add(size) > target {
                seal(&mut open, &mut open_bytes, &self.replicated_splits, &mut tasks);
            }
            open.entry(plan_node_id).or_default().push(handle);
            open_bytes = open_bytes.saturating_add(size);
            if open_bytes >= target {
                seal(&mut open, &mut open_bytes, &self.replicated_splits, &mut tasks);
            }
        }
        seal(&mut open, &mut open_bytes, &self.replicated_splits, &mut tasks);
        Ok(tasks)
    }
}

#[derive(Default)]
struct PartitionInputs {
    splits: SplitsByNode,
    handles: HandlesByNode,
    weight: u64,
    handle_bytes: u64,
}

struct StagedTask {
    splits: SplitsByNode,
    handles: HandlesByNode,
    weight: u64,
    handle_bytes: u64,
    affinity: Option<std::sync::Arc<InternalNode>>,
}

/// Groups bucketed splits and partitioned handles by partition, joining
/// adjacent small partitions under the configured caps.
pub struct HashDistributionTaskSource {
    split_sources: BTreeMap<PlanNodeId, Box<dyn SplitSource>>,
    partitioned_handles: HandlesByNode,
    replicated_splits: SplitsByNode,
    split_batch_size: usize,
    scheme: FaultTolerantPartitioningScheme,
    catalog: Option<CatalogHandle>,
    target_partition_split_weight: u64,
    target_partition_source_size: u64,
    finished: bool,
    closed: bool,
}

impl HashDistributionTaskSource {
    /// Construct over bucketed split sources and partitioned handles.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        split_sources: BTreeMap<PlanNodeId, Box<dyn SplitSource>>,
        partitioned_handles: HandlesByNode,
        replicated_handles: &HandlesByNode,
        split_batch_size: usize,
        scheme: FaultTolerantPartitioningScheme,
        catalog: Option<CatalogHandle>,
        target_partition_split_weight: SplitWeight,
        target_partition_source_size: DataSize,
    ) -> Self {
        Self {
            split_sources,
            partitioned_handles,
            replicated_splits: create_remote_splits(replicated_handles),
            split_batch_size,
            scheme,
            catalog,
            target_partition_split_weight: target_partition_split_weight.raw(),
            target_partition_source_size: target_partition_source_size.bytes(),
            finished: false,
            closed: false,
        }
    }

    async fn more_tasks(&mut self) -> Result<Vec<TaskDescriptor>> {
        if self.finished {
            return Ok(Vec::new());
        }

        let mut partitions: BTreeMap<u32, PartitionInputs> = BTreeMap::new();

        // All split sources drain to completion before any task is formed;
        // hash tasks are only correct once every bucket's input is known.
        for (plan_node_id, source) in &mut self.split_sources {
            loop {
                let batch = source.next_batch(self.split_batch_size).await?;
                for split in batch.splits {
                    let partition_id = self.scheme.split_partition(&split)?;
                    let inputs = partitions.entry(partition_id).or_default();
                    inputs.weight = inputs.weight.saturating_add(split.weight.raw());
                    inputs
                        .splits
                        .entry(*plan_node_id)
                        .or_default()
                        .push(Split::Connector(split));
                }
                if batch.no_more_splits {
                    break;
                }
            }
        }

        for (plan_node_id, handles) in &self.partitioned_handles {
            for handle in handles {
                let partition_id = self.scheme.handle_partition(handle.partition_id);
                let inputs = partitions.entry(partition_id).or_default();
                inputs.handle_bytes = inputs.handle_bytes.saturating_add(handle.data_size.bytes());
                inputs
                    .handles
                    .entry(*plan_node_id)
                    .or_default()
                    .push(handle.clone());
            }
        }

        let mut tasks: Vec<TaskDescriptor> = Vec::new();
        let mut staged: Option<StagedTask> = None;
        for (partition_id, inputs) in partitions {
            let affinity = self.scheme.partition_node(partition_id);
            let seal = staged.as_ref().is_some_and(|current| {
                current.weight.saturating_add(inputs.weight) > self.target_partition_split_weight
                    || current.handle_bytes.saturating_add(inputs.handle_bytes)
                        > self.target_partition_source_size
                    || affinity_key(&current.affinity) != affinity_key(&affinity)
            });
            if seal {
                if let Some(current) = staged.take() {
                    tasks.push(self.emit(current, tasks.len() as u32));
                }
            }
            let current = staged.get_or_insert_with(|| StagedTask {
                splits: SplitsByNode::new(),
                handles: HandlesByNode::new(),
                weight: 0,
                handle_bytes: 0,
                affinity: affinity.clone(),
            });
            for (plan_node_id, splits) in inputs.splits {
                current.splits.entry(plan_node_id).or_default().extend(splits);
            }
            for (plan_node_id, handles) in inputs.handles {
                current
                    .handles
                    .entry(plan_node_id)
                    .or_default()
                    .extend(handles);
            }
            current.weight = current.weight.saturating_add(inputs.weight);
            current.handle_bytes = current.handle_bytes.saturating_add(inputs.handle_bytes);
        }
        if let Some(current) = staged.take() {
            tasks.push(self.emit(current, tasks.len() as u32));
        }

        self.finished = true;
        Ok(tasks)
    }

    fn emit(&self, staged: StagedTask, partition_id: u32) -> TaskDescriptor {
        let mut splits = staged.splits;
        for (plan_node_id, node_splits) in create_remote_splits(&staged.handles) {
            splits.entry(plan_node_id).or_default().extend(node_splits);
        }
        for (plan_node_id, replicated) in &self.replicated_splits {
            splits
                .entry(*plan_node_id)
                .or_default()
                .extend(replicated.iter().cloned());
        }
        let addresses = staged
            .affinity
            .as_ref()
            .map(|node| vec![node.address.clone()])
            .unwrap_or_default();
        TaskDescriptor::new(
            partition_id,
            splits,
            NodeRequirements::new(self.catalog.clone(), addresses),
        )
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for source in self.split_sources.values_mut() {
            source.close();
        }
    }
}

fn affinity_key(node: &Option<std::sync::Arc<InternalNode>>) -> Option<&str> {
    node.as_ref().map(|node| node.node_id.as_str())
}

/// Streams tasks off a single connector split source.
pub struct SourceDistributionTaskSource {
    query_id: QueryId,
    plan_node_id: PlanNodeId,
    catalog: Option<CatalogHandle>,
    split_source: Box<dyn SplitSource>,
    replicated_splits: SplitsByNode,
    split_batch_size: usize,
    min_splits_per_task: usize,
    split_weight_per_task: u64,
    max_splits_per_task: usize,

    arena: BTreeMap<u64, ConnectorSplit>,
    next_seq: u64,
    remote_queue: Vec<u64>,
    address_queues: BTreeMap<HostAddress, Vec<u64>>,
    next_partition_id: u32,
    no_more_splits: bool,
    finished: bool,
    closed: bool,
}

impl SourceDistributionTaskSource {
    /// Construct over one split source.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        query_id: QueryId,
        plan_node_id: PlanNodeId,
        catalog: Option<CatalogHandle>,
        split_source: Box<dyn SplitSource>,
        replicated_handles: &HandlesByNode,
        split_batch_size: usize,
        min_splits_per_task: usize,
        split_weight_per_task: SplitWeight,
        max_splits_per_task: usize,
    ) -> Self {
        Self {
            query_id,
            plan_node_id,
            catalog,
            split_source,
            replicated_splits: create_remote_splits(replicated_handles),
            split_batch_size,
            min_splits_per_task,
            split_weight_per_task: split_weight_per_task.raw(),
            max_splits_per_task,
            arena: BTreeMap::new(),
            next_seq: 0,
            remote_queue: Vec::new(),
            address_queues: BTreeMap::new(),
            next_partition_id: 0,
            no_more_splits: false,
            finished: false,
            closed: false,
        }
    }

    async fn more_tasks(&mut self) -> Result<Vec<TaskDescriptor>> {
        if self.finished {
            return Ok(Vec::new());
        }
        let mut tasks = Vec::new();
        loop {
            if self.no_more_splits {
                self.drain_final(&mut tasks);
                self.finished = true;
                debug!(
                    query_id = %self.query_id,
                    plan_node_id = %self.plan_node_id,
                    tasks = tasks.len(),
                    operator = "SourceDistributionTaskSource",
                    "split source exhausted"
                );
                return Ok(tasks);
            }
            let batch = self.split_source.next_batch(self.split_batch_size).await?;
            if batch.no_more_splits {
                self.no_more_splits = true;
            }
            for split in batch.splits {
                self.ingest(split);
            }
            self.drain_ready(&mut tasks);
            if !tasks.is_empty() {
                return Ok(tasks);
            }
        }
    }

    fn ingest(&mut self, split: ConnectorSplit) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if split.is_remotely_accessible() {
            self.remote_queue.push(seq);
        } else {
            for address in &split.addresses {
                self.address_queues
                    .entry(address.clone())
                    .or_default()
                    .push(seq);
            }
        }
        self.arena.insert(seq, split);
    }

    fn live(&self, queue: &[u64]) -> Vec<u64> {
        queue
            .iter()
            .copied()
            .filter(|seq| self.arena.contains_key(seq))
            .collect()
    }

    // Length of the arrival-order prefix forming a complete task, or None
    // while thresholds are not met.
    fn ready_prefix(&self, live: &[u64]) -> Option<usize> {
        let mut weight = 0_u64;
        for (index, seq) in live.iter().enumerate() {
            let count = index + 1;
            weight = weight.saturating_add(self.arena[seq].weight.raw());
            if count >= self.max_splits_per_task {
                return Some(count);
            }
            if weight >= self.split_weight_per_task && count >= self.min_splits_per_task {
                return Some(count);
            }
        }
        None
    }

    fn drain_ready(&mut self, tasks: &mut Vec<TaskDescriptor>) {
        loop {
            let live = self.live(&self.remote_queue);
            match self.ready_prefix(&live) {
                Some(len) => self.emit(&live[..len], None, tasks),
                None => break,
            }
        }
        // Among address groups meeting their threshold, anchor the task at
        // the address holding the most pending splits.
        loop {
            let mut best: Option<(HostAddress, Vec<u64>, usize)> = None;
            for (address, queue) in &self.address_queues {
                let live = self.live(queue);
                if let Some(len) = self.ready_prefix(&live) {
                    let replace = match &best {
                        Some((_, existing, _)) => live.len() > existing.len(),
                        None => true,
                    };
                    if replace {
                        best = Some((address.clone(), live, len));
                    }
                }
            }
            match best {
                Some((address, live, len)) => self.emit(&live[..len], Some(address), tasks),
                None => break,
            }
        }
        // Drop seqs consumed through another queue.
        let arena = &self.arena;
        self.remote_queue.retain(|seq| arena.contains_key(seq));
        for queue in self.address_queues.values_mut() {
            queue.retain(|seq| arena.contains_key(seq));
        }
        self.address_queues.retain(|_, queue| !queue.is_empty());
    }

    fn drain_final(&mut self, tasks: &mut Vec<TaskDescriptor>) {
        self.drain_ready(tasks);
        // Remainders go out even below the weight and min-splits thresholds.
        let live = self.live(&self.remote_queue);
        for chunk in live.chunks(self.max_splits_per_task.max(1)) {
            if !chunk.is_empty() {
                self.emit(chunk, None, tasks);
            }
        }
        self.remote_queue.clear();
        loop {
            let best = self
                .address_queues
                .iter()
                .map(|(address, queue)| (address.clone(), self.live(queue)))
                .filter(|(_, live)| !live.is_empty())
                .max_by(|(left_address, left), (right_address, right)| {
                    left.len()
                        .cmp(&right.len())
                        .then_with(|| right_address.cmp(left_address))
                });
            let Some((address, live)) = best else {
                break;
            };
            let take = live.len().min(self.max_splits_per_task.max(1));
            self.emit(&live[..take], Some(address), tasks);
        }
        self.address_queues.clear();
    }

    fn emit(&mut self, seqs: &[u64], anchor: Option<HostAddress>, tasks: &mut Vec<TaskDescriptor>) {
        let mut splits = Vec::with_capacity(seqs.len());
        for seq in seqs {
            if let Some(split) = self.arena.remove(seq) {
                splits.push(Split::Connector(split));
            }
        }
        if splits.is_empty() {
            return;
        }
        let mut by_node = SplitsByNode::new();
        by_node.insert(self.plan_node_id, splits);
        for (plan_node_id, replicated) in &self.replicated_splits {
            by_node
                .entry(*plan_node_id)
                .or_default()
                .extend(replicated.iter().cloned());
        }
        let partition_id = self.next_partition_id;
        self.next_partition_id += 1;
        tasks.push(TaskDescriptor::new(
            partition_id,
            by_node,
            NodeRequirements::new(self.catalog.clone(), anchor),
        ));
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.split_source.close();
    }
}
