//! Fault-tolerant scheduling of one stage.
//!
//! Responsibilities:
//! - drain the stage's task source and persist descriptors for recovery;
//! - acquire node leases (bounded per stage) and launch task attempts;
//! - observe attempt outcomes, applying per-partition and per-query retry
//!   budgets with adaptive memory estimates;
//! - publish finished partitions to the stage's output exchange.
//!
//! Concurrency model: the per-query scheduling loop is the single writer.
//! `schedule` is non-blocking; long waits (task-source batches, exchange
//! handles, node grants) are stored futures polled with a waker that only
//! signals the readiness future returned by `is_blocked`. External callbacks
//! (remote-task listeners) publish one status and signal the same future.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use floq_common::metrics::global_metrics;
use floq_common::{
    DataSize, FloqError, PlanFragmentId, QueryId, Result, SchedulerConfig, StageId, TaskId,
};
use floq_exchange::{Exchange, ExchangeSinkHandle};
use futures::future::BoxFuture;
use futures::task::ArcWake;
use futures::FutureExt;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::allocator::{NodeAllocator, NodeFuture, NodeLease};
use crate::estimator::PartitionMemoryEstimator;
use crate::failure::{ExecutionFailure, FailureKind};
use crate::fragment::RemoteSourceDistribution;
use crate::node::InternalNode;
use crate::partitioning::FaultTolerantPartitioningScheme;
use crate::remote_task::{RemoteTask, RemoteTaskFactory, TaskState, TaskStatus};
use crate::split::{HandlesByNode, SplitSourceProvider};
use crate::stage::Stage;
use crate::task::TaskDescriptor;
use crate::task_source::{create_task_source, StageTaskSource};

/// Shared readiness signal: wakes the scheduling loop and carries remote-task
/// status events into the single-writer `schedule` call.
pub(crate) struct SchedulerSignal {
    notify: Notify,
    events: Mutex<Vec<TaskStatus>>,
}

impl SchedulerSignal {
    fn new() -> Arc<Self> {
        let signal = Arc::new(Self {
            notify: Notify::new(),
            events: Mutex::new(Vec::new()),
        });
        // Pre-arm so the first readiness check lets the loop call schedule.
        signal.notify();
        signal
    }

    fn publish(&self, status: TaskStatus) {
        self.events.lock().expect("signal events lock").push(status);
        self.notify.notify_one();
    }

    fn drain_events(&self) -> Vec<TaskStatus> {
        std::mem::take(&mut *self.events.lock().expect("signal events lock"))
    }

    fn notify(&self) {
        self.notify.notify_one();
    }

    async fn notified(&self) {
        self.notify.notified().await;
    }
}

impl ArcWake for SchedulerSignal {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.notify.notify_one();
    }
}

type GatherFuture = BoxFuture<'static, Result<(HandlesByNode, HandlesByNode)>>;
type FetchFuture = BoxFuture<'static, (StageTaskSource, Result<Vec<TaskDescriptor>>)>;

enum SourceSlot {
    /// Waiting on upstream exchange source handles.
    Gathering(GatherFuture),
    /// Source built and idle between fetches.
    Idle(StageTaskSource),
    /// A `more_tasks` call is in flight.
    Fetching(FetchFuture),
    /// Source closed by cancel/abort.
    Closed,
    /// Internal placeholder while moving between states.
    Transitioning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartitionStatus {
    Pending,
    Acquiring,
    Running,
    Finished,
}

struct PartitionExecution {
    attempts: u32,
    remaining_retries: u32,
    memory_estimate: DataSize,
    status: PartitionStatus,
}

struct PendingLease {
    partition_id: u32,
    lease: NodeLease,
    node_future: NodeFuture,
}

struct RunningAttempt {
    partition_id: u32,
    lease: NodeLease,
    task: Arc<dyn RemoteTask>,
    sink: ExchangeSinkHandle,
}

/// Drives one stage to completion through retries.
pub struct FaultTolerantStageScheduler {
    query_id: QueryId,
    stage: Arc<Stage>,
    node_allocator: Arc<dyn NodeAllocator>,
    descriptor_storage: Arc<crate::storage::TaskDescriptorStorage>,
    memory_estimator: Box<dyn PartitionMemoryEstimator>,
    remote_task_factory: Arc<dyn RemoteTaskFactory>,
    split_source_provider: Arc<dyn SplitSourceProvider>,
    sink_exchange: Arc<dyn Exchange>,
    scheme: FaultTolerantPartitioningScheme,
    coordinator: Option<Arc<InternalNode>>,
    remaining_retry_attempts_overall: Arc<AtomicU64>,
    config: SchedulerConfig,

    signal: Arc<SchedulerSignal>,
    source_slot: SourceSlot,
    partitions: BTreeMap<u32, PartitionExecution>,
    queued: VecDeque<u32>,
    waiting_for_node: Vec<PendingLease>,
    running: HashMap<TaskId, RunningAttempt>,
    task_source_finished: bool,
    no_more_sinks_sent: bool,
    finished: bool,
    cancelled: bool,
    aborted: bool,
    failure: Option<FloqError>,
}

impl FaultTolerantStageScheduler {
    /// Construct a scheduler for `stage`, wiring its source exchanges.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        query_id: QueryId,
        stage: Arc<Stage>,
        node_allocator: Arc<dyn NodeAllocator>,
        descriptor_storage: Arc<crate::storage::TaskDescriptorStorage>,
        memory_estimator: Box<dyn PartitionMemoryEstimator>,
        remote_task_factory: Arc<dyn RemoteTaskFactory>,
        split_source_provider: Arc<dyn SplitSourceProvider>,
        sink_exchange: Arc<dyn Exchange>,
        source_exchanges: BTreeMap<PlanFragmentId, Arc<dyn Exchange>>,
        scheme: FaultTolerantPartitioningScheme,
        coordinator: Option<Arc<InternalNode>>,
        remaining_retry_attempts_overall: Arc<AtomicU64>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        let gather = gather_source_handles(&stage, &source_exchanges)?;
        Ok(Self {
            query_id,
            stage,
            node_allocator,
            descriptor_storage,
            memory_estimator,
            remote_task_factory,
            split_source_provider,
            sink_exchange,
            scheme,
            coordinator,
            remaining_retry_attempts_overall,
            config,
            signal: SchedulerSignal::new(),
            source_slot: SourceSlot::Gathering(gather),
            partitions: BTreeMap::new(),
            queued: VecDeque::new(),
            waiting_for_node: Vec::new(),
            running: HashMap::new(),
            task_source_finished: false,
            no_more_sinks_sent: false,
            finished: false,
            cancelled: false,
            aborted: false,
            failure: None,
        })
    }

    /// Stage driven by this scheduler.
    pub fn stage_id(&self) -> StageId {
        self.stage.stage_id()
    }

    /// Whether every partition finished and the task source is exhausted.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Future completing when new work may be available.
    pub fn is_blocked(&self) -> BoxFuture<'static, ()> {
        let signal = self.signal.clone();
        async move { signal.notified().await }.boxed()
    }

    /// Advance the stage without blocking; idempotent.
    ///
    /// A returned error is sticky and must fail the query.
    pub fn schedule(&mut self) -> Result<()> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        if self.finished || self.cancelled || self.aborted {
            return Ok(());
        }
        let waker = futures::task::waker(self.signal.clone());
        let result = self.run_schedule(&waker);
        if let Err(error) = &result {
            self.failure = Some(error.clone());
            warn!(
                query_id = %self.query_id,
                stage_id = %self.stage_id(),
                error = %error,
                operator = "FaultTolerantStageScheduler",
                "stage scheduling failed"
            );
        }
        result
    }

    /// Graceful teardown: no new attempts, leases released; idempotent.
    pub fn cancel(&mut self) {
        if self.cancelled || self.aborted {
            return;
        }
        self.cancelled = true;
        self.close_task_source();
        for pending in self.waiting_for_node.drain(..) {
            pending.lease.release();
        }
        self.queued.clear();
        for (_, attempt) in self.running.drain() {
            attempt.task.cancel();
            attempt.lease.release();
        }
        self.signal.notify();
        info!(
            query_id = %self.query_id,
            stage_id = %self.stage_id(),
            operator = "FaultTolerantStageScheduler",
            "stage cancelled"
        );
    }

    /// Forceful teardown: attempts are killed, the sink exchange closed;
    /// idempotent, and safe after `cancel`.
    pub fn abort(&mut self) {
        if self.aborted {
            return;
        }
        self.aborted = true;
        self.cancelled = true;
        self.close_task_source();
        for pending in self.waiting_for_node.drain(..) {
            pending.lease.release();
        }
        self.queued.clear();
        for (_, attempt) in self.running.drain() {
            attempt.task.abort();
            attempt.lease.release();
        }
        self.sink_exchange.close();
        self.signal.notify();
    }

    fn run_schedule(&mut self, waker: &Waker) -> Result<()> {
        self.process_task_events()?;
        self.poll_task_source(waker)?;
        loop {
            let granted = self.poll_pending_leases(waker)?;
            let started = self.start_acquisitions()?;
            if granted == 0 && started == 0 {
                break;
            }
        }
        self.maybe_finish();
        self.publish_metrics();
        Ok(())
    }

    fn process_task_events(&mut self) -> Result<()> {
        for status in self.signal.drain_events() {
            if self.cancelled || self.aborted {
                continue;
            }
            if !self.running.contains_key(&status.task_id) {
                debug!(
                    query_id = %self.query_id,
                    task_id = %status.task_id,
                    operator = "FaultTolerantStageScheduler",
                    "discarding status for unknown or stale attempt"
                );
                continue;
            }
            match status.state {
                TaskState::Pending | TaskState::Running | TaskState::Finishing => {}
                TaskState::Finished => self.handle_attempt_success(&status)?,
                TaskState::Failed | TaskState::Aborted => self.handle_attempt_failure(&status)?,
            }
        }
        Ok(())
    }

    fn handle_attempt_success(&mut self, status: &TaskStatus) -> Result<()> {
        let Some(attempt) = self.running.remove(&status.task_id) else {
            return Ok(());
        };
        attempt.lease.release();
        self.sink_exchange.sink_finished(&attempt.sink);
        let stage_id = self.stage_id();
        self.descriptor_storage
            .remove(self.query_id, stage_id, attempt.partition_id);
        let partition = self
            .partitions
            .get_mut(&attempt.partition_id)
            .ok_or_else(|| {
                FloqError::Scheduling(format!(
                    "finished attempt {} for unknown partition {}",
                    status.task_id, attempt.partition_id
                ))
            })?;
        if partition.status == PartitionStatus::Finished {
            return Err(FloqError::Scheduling(format!(
                "partition {} of stage {} finished twice",
                attempt.partition_id, stage_id
            )));
        }
        partition.status = PartitionStatus::Finished;
        self.stage.update_stats(|stats| {
            stats.running_attempts = stats.running_attempts.saturating_sub(1);
            stats.finished_attempts += 1;
            stats.cpu_time_millis += status.cpu_time_millis;
            stats.peak_memory = stats.peak_memory.max(status.peak_memory);
        });
        info!(
            query_id = %self.query_id,
            task_id = %status.task_id,
            operator = "FaultTolerantStageScheduler",
            "task attempt finished"
        );
        Ok(())
    }

    fn handle_attempt_failure(&mut self, status: &TaskStatus) -> Result<()> {
        let Some(attempt) = self.running.remove(&status.task_id) else {
            return Ok(());
        };
        attempt.lease.release();
        let failure = status.failure.clone().unwrap_or_else(|| {
            ExecutionFailure::new(
                FailureKind::WorkerFailure,
                "task attempt ended without a reported cause",
            )
        });
        self.stage.update_stats(|stats| {
            stats.running_attempts = stats.running_attempts.saturating_sub(1);
            stats.failed_attempts += 1;
            stats.cpu_time_millis += status.cpu_time_millis;
            stats.peak_memory = stats.peak_memory.max(status.peak_memory);
        });
        if !failure.kind.is_retriable() {
            return Err(failure.into_error());
        }
        let stage_id = self.stage_id();
        let partition = self
            .partitions
            .get_mut(&attempt.partition_id)
            .ok_or_else(|| {
                FloqError::Scheduling(format!(
                    "failed attempt {} for unknown partition {}",
                    status.task_id, attempt.partition_id
                ))
            })?;
        if failure.kind.is_counted() {
            if partition.remaining_retries == 0 {
                return Err(FloqError::Execution(format!(
                    "partition {} of stage {stage_id} exhausted its retry budget: {failure}",
                    attempt.partition_id
                )));
            }
            if !decrement_if_positive(&self.remaining_retry_attempts_overall) {
                return Err(FloqError::Execution(format!(
                    "query retry budget exhausted: {failure}"
                )));
            }
            partition.remaining_retries -= 1;
            partition.memory_estimate = self
                .memory_estimator
                .on_failure(partition.memory_estimate, failure.kind);
            self.stage.update_stats(|stats| stats.retried_attempts += 1);
            global_metrics().inc_scheduler_retries(&self.query_id.to_string(), stage_id.0);
        }
        partition.status = PartitionStatus::Pending;
        self.queued.push_back(attempt.partition_id);
        warn!(
            query_id = %self.query_id,
            task_id = %status.task_id,
            failure = %failure,
            counted = failure.kind.is_counted(),
            operator = "FaultTolerantStageScheduler",
            "task attempt failed; resubmitting partition"
        );
        Ok(())
    }

    fn poll_task_source(&mut self, waker: &Waker) -> Result<()> {
        loop {
            let slot = std::mem::replace(&mut self.source_slot, SourceSlot::Transitioning);
            match slot {
                SourceSlot::Gathering(mut gather) => match poll_future(&mut gather, waker) {
                    Poll::Ready(Ok((partitioned, replicated))) => {
                        let source = match self.create_source(partitioned, replicated) {
                            Ok(source) => source,
                            Err(error) => {
                                self.source_slot = SourceSlot::Closed;
                                return Err(error);
                            }
                        };
                        self.source_slot = SourceSlot::Idle(source);
                    }
                    Poll::Ready(Err(error)) => {
                        self.source_slot = SourceSlot::Closed;
                        return Err(error);
                    }
                    Poll::Pending => {
                        self.source_slot = SourceSlot::Gathering(gather);
                        return Ok(());
                    }
                },
                SourceSlot::Idle(mut source) => {
                    if source.is_finished() {
                        self.task_source_finished = true;
                        self.source_slot = SourceSlot::Idle(source);
                        return Ok(());
                    }
                    let fetch = async move {
                        let batch = source.more_tasks().await;
                        (source, batch)
                    }
                    .boxed();
                    self.source_slot = SourceSlot::Fetching(fetch);
                }
                SourceSlot::Fetching(mut fetch) => match poll_future(&mut fetch, waker) {
                    Poll::Ready((source, Ok(batch))) => {
                        self.source_slot = SourceSlot::Idle(source);
                        self.enqueue_descriptors(batch)?;
                    }
                    Poll::Ready((source, Err(error))) => {
                        self.source_slot = SourceSlot::Idle(source);
                        return Err(error);
                    }
                    Poll::Pending => {
                        self.source_slot = SourceSlot::Fetching(fetch);
                        return Ok(());
                    }
                },
                other => {
                    self.source_slot = other;
                    return Ok(());
                }
            }
        }
    }

    fn create_source(
        &self,
        partitioned: HandlesByNode,
        replicated: HandlesByNode,
    ) -> Result<StageTaskSource> {
        let fragment = self.stage.fragment();
        let mut split_sources = BTreeMap::new();
        for scan in &fragment.table_scans {
            let source =
                self.split_source_provider
                    .open_split_source(self.query_id, fragment, scan)?;
            split_sources.insert(scan.plan_node_id, source);
        }
        create_task_source(
            self.query_id,
            fragment,
            partitioned,
            replicated,
            split_sources,
            self.scheme.clone(),
            self.coordinator.as_deref(),
            &self.config,
        )
    }

    fn enqueue_descriptors(&mut self, batch: Vec<TaskDescriptor>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.stage.begin_scheduling();
        let stage_id = self.stage_id();
        let count = batch.len() as u64;
        for descriptor in batch {
            let partition_id = descriptor.partition_id;
            if self.partitions.contains_key(&partition_id) {
                return Err(FloqError::Scheduling(format!(
                    "task source emitted duplicate partition {partition_id} for stage {stage_id}"
                )));
            }
            self.descriptor_storage
                .put(self.query_id, stage_id, descriptor)?;
            self.partitions.insert(
                partition_id,
                PartitionExecution {
                    attempts: 0,
                    remaining_retries: self.config.task_retry_attempts_per_task,
                    memory_estimate: self.memory_estimator.initial_estimate(partition_id),
                    status: PartitionStatus::Pending,
                },
            );
            self.queued.push_back(partition_id);
        }
        self.stage
            .update_stats(|stats| stats.emitted_tasks += count);
        global_metrics().inc_scheduler_tasks_emitted(&self.query_id.to_string(), stage_id.0, count);
        Ok(())
    }

    fn start_acquisitions(&mut self) -> Result<usize> {
        let mut started = 0;
        while self.waiting_for_node.len() < self.config.max_tasks_waiting_for_node_per_stage {
            let Some(partition_id) = self.queued.pop_front() else {
                break;
            };
            let stage_id = self.stage_id();
            let Some(partition) = self.partitions.get_mut(&partition_id) else {
                continue;
            };
            if partition.status != PartitionStatus::Pending {
                continue;
            }
            let memory = partition.memory_estimate;
            partition.status = PartitionStatus::Acquiring;
            let descriptor = self
                .descriptor_storage
                .get(self.query_id, stage_id, partition_id)
                .ok_or_else(|| {
                    FloqError::Scheduling(format!(
                        "no stored descriptor for partition {partition_id} of stage {stage_id}"
                    ))
                })?;
            let lease = self
                .node_allocator
                .acquire(&descriptor.node_requirements, memory);
            let node_future = lease.node();
            self.waiting_for_node.push(PendingLease {
                partition_id,
                lease,
                node_future,
            });
            started += 1;
        }
        Ok(started)
    }

    fn poll_pending_leases(&mut self, waker: &Waker) -> Result<usize> {
        let mut granted = 0;
        let mut index = 0;
        while index < self.waiting_for_node.len() {
            let mut context = Context::from_waker(waker);
            let poll = Pin::new(&mut self.waiting_for_node[index].node_future).poll(&mut context);
            match poll {
                Poll::Ready(Some(node)) => {
                    let pending = self.waiting_for_node.swap_remove(index);
                    self.start_attempt(pending.partition_id, node, pending.lease)?;
                    granted += 1;
                }
                Poll::Ready(None) => {
                    // Allocator shut down underneath us; the lease loss is
                    // uncounted and the partition stays pending for teardown.
                    let pending = self.waiting_for_node.swap_remove(index);
                    pending.lease.release();
                    if let Some(partition) = self.partitions.get_mut(&pending.partition_id) {
                        partition.status = PartitionStatus::Pending;
                    }
                    debug!(
                        query_id = %self.query_id,
                        stage_id = %self.stage_id(),
                        partition_id = pending.partition_id,
                        operator = "FaultTolerantStageScheduler",
                        "node lease cancelled before grant"
                    );
                }
                Poll::Pending => index += 1,
            }
        }
        Ok(granted)
    }

    fn start_attempt(
        &mut self,
        partition_id: u32,
        node: Arc<InternalNode>,
        lease: NodeLease,
    ) -> Result<()> {
        let stage_id = self.stage_id();
        let partition = self.partitions.get_mut(&partition_id).ok_or_else(|| {
            FloqError::Scheduling(format!(
                "granted lease for unknown partition {partition_id} of stage {stage_id}"
            ))
        })?;
        let attempt = partition.attempts;
        partition.attempts += 1;
        partition.status = PartitionStatus::Running;
        let memory = partition.memory_estimate;
        let task_id = TaskId::new(stage_id, partition_id, attempt);
        let descriptor = self
            .descriptor_storage
            .get(self.query_id, stage_id, partition_id)
            .ok_or_else(|| {
                FloqError::Scheduling(format!(
                    "no stored descriptor for partition {partition_id} of stage {stage_id}"
                ))
            })?;
        let sink = self.sink_exchange.add_sink(partition_id);
        let task = self.remote_task_factory.create_remote_task(
            self.query_id,
            task_id,
            node.clone(),
            self.stage.fragment().clone(),
            descriptor.splits,
            sink.clone(),
            memory,
        )?;
        self.running.insert(
            task_id,
            RunningAttempt {
                partition_id,
                lease,
                task: task.clone(),
                sink,
            },
        );
        let signal = self.signal.clone();
        task.add_state_change_listener(Box::new(move |status| signal.publish(status.clone())));
        self.stage.transition_to_running();
        self.stage
            .update_stats(|stats| stats.running_attempts += 1);
        task.start();
        info!(
            query_id = %self.query_id,
            task_id = %task_id,
            node_id = %node.node_id,
            memory = %memory,
            operator = "FaultTolerantStageScheduler",
            "task attempt started"
        );
        Ok(())
    }

    fn maybe_finish(&mut self) {
        if self.finished
            || !self.task_source_finished
            || !self.queued.is_empty()
            || !self.waiting_for_node.is_empty()
            || !self.running.is_empty()
        {
            return;
        }
        let all_finished = self
            .partitions
            .values()
            .all(|partition| partition.status == PartitionStatus::Finished);
        if !all_finished {
            return;
        }
        self.finished = true;
        if !self.no_more_sinks_sent {
            self.no_more_sinks_sent = true;
            self.sink_exchange.no_more_sinks();
        }
        self.signal.notify();
        info!(
            query_id = %self.query_id,
            stage_id = %self.stage_id(),
            partitions = self.partitions.len(),
            operator = "FaultTolerantStageScheduler",
            "stage finished"
        );
    }

    fn close_task_source(&mut self) {
        let slot = std::mem::replace(&mut self.source_slot, SourceSlot::Closed);
        if let SourceSlot::Idle(mut source) = slot {
            source.close();
        }
    }

    fn publish_metrics(&self) {
        let query = self.query_id.to_string();
        let stage_id = self.stage_id().0;
        global_metrics().set_scheduler_queued_tasks(
            &query,
            stage_id,
            (self.queued.len() + self.waiting_for_node.len()) as u64,
        );
        global_metrics().set_scheduler_running_tasks(&query, stage_id, self.running.len() as u64);
    }
}

impl Drop for FaultTolerantStageScheduler {
    fn drop(&mut self) {
        self.close_task_source();
    }
}

fn gather_source_handles(
    stage: &Arc<Stage>,
    source_exchanges: &BTreeMap<PlanFragmentId, Arc<dyn Exchange>>,
) -> Result<GatherFuture> {
    let mut parts = Vec::new();
    for remote_source in &stage.fragment().remote_sources {
        let mut handle_futures = Vec::new();
        for fragment_id in &remote_source.source_fragments {
            let exchange = source_exchanges.get(fragment_id).ok_or_else(|| {
                FloqError::Planning(format!(
                    "no exchange wired for source fragment {fragment_id} of stage {}",
                    stage.stage_id()
                ))
            })?;
            handle_futures.push(exchange.get_source_handles());
        }
        parts.push((
            remote_source.plan_node_id,
            remote_source.distribution,
            handle_futures,
        ));
    }
    Ok(async move {
        let mut partitioned = HandlesByNode::new();
        let mut replicated = HandlesByNode::new();
        for (plan_node_id, distribution, handle_futures) in parts {
            for handle_future in handle_futures {
                let handles = handle_future.await?;
                let target = match distribution {
                    RemoteSourceDistribution::Partitioned => &mut partitioned,
                    RemoteSourceDistribution::Replicated => &mut replicated,
                };
                target.entry(plan_node_id).or_default().extend(handles);
            }
        }
        Ok((partitioned, replicated))
    }
    .boxed())
}

fn poll_future<T>(future: &mut BoxFuture<'static, T>, waker: &Waker) -> Poll<T> {
    let mut context = Context::from_waker(waker);
    future.as_mut().poll(&mut context)
}

fn decrement_if_positive(counter: &AtomicU64) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |value| {
            value.checked_sub(1)
        })
        .is_ok()
}
