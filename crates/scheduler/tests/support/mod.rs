//! Testing doubles shared by the scheduler integration suites.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use floq_common::{DataSize, FloqError, PlanNodeId, QueryId, Result, SplitWeight, TaskId};
use floq_exchange::{
    Exchange, ExchangeContext, ExchangeManager, ExchangeSinkHandle, ExchangeSourceHandle,
    SourceHandlesFuture, SpoolingExchangeInput,
};
use floq_scheduler::{
    CatalogHandle, ConnectorSplit, ExecutionFailure, FailureKind, HandlesByNode, HostAddress,
    InternalNode, NodeInventory, PartitionMemoryEstimator, PartitionMemoryEstimatorFactory,
    PlanFragment, RemoteTask, RemoteTaskFactory, Split, SplitBatch, SplitSource,
    SplitSourceProvider, SplitsByNode, TableScanSource, TaskDescriptor, TaskState, TaskStatus,
};
use futures::FutureExt;
use tokio::sync::oneshot;

pub const STANDARD_WEIGHT: u64 = SplitWeight::STANDARD_RAW;

pub fn test_catalog() -> CatalogHandle {
    CatalogHandle::new("test_catalog")
}

pub fn address(host: &str) -> HostAddress {
    let (name, port) = host.split_once(':').unwrap_or((host, "8080"));
    HostAddress::new(name, port.parse().unwrap_or(8080))
}

pub fn split(id: u64) -> ConnectorSplit {
    ConnectorSplit::new(test_catalog(), serde_json::json!({ "id": id }))
}

pub fn weighted_split(id: u64, weight: u64) -> ConnectorSplit {
    split(id).with_weight(SplitWeight::from_raw(weight))
}

pub fn addressed_split(id: u64, weight: u64, hosts: &[&str]) -> ConnectorSplit {
    weighted_split(id, weight).with_addresses(hosts.iter().map(|host| address(host)).collect())
}

pub fn bucketed_split(id: u64, bucket: u32) -> ConnectorSplit {
    split(id).with_bucket(bucket)
}

pub fn handle(partition_id: u32, size_bytes: u64) -> ExchangeSourceHandle {
    ExchangeSourceHandle::new(partition_id, DataSize::of_bytes(size_bytes), size_bytes)
}

pub fn handles_by_node(
    entries: &[(PlanNodeId, ExchangeSourceHandle)],
) -> HandlesByNode {
    let mut out = HandlesByNode::new();
    for (plan_node_id, handle) in entries {
        out.entry(*plan_node_id).or_default().push(handle.clone());
    }
    out
}

pub fn worker_inventory(count: usize, memory: DataSize) -> NodeInventory {
    let mut nodes = Vec::new();
    for index in 0..count {
        nodes.push(InternalNode::new(
            format!("worker{index}"),
            HostAddress::new(format!("host{index}"), 8080),
            memory,
        ));
    }
    NodeInventory::new(nodes)
}

/// Pull the handles back out of a descriptor's remote splits.
pub fn extract_source_handles(task: &TaskDescriptor) -> HandlesByNode {
    let mut out = HandlesByNode::new();
    for (plan_node_id, splits) in &task.splits {
        for split in splits {
            if let Split::Remote(remote) = split {
                out.entry(*plan_node_id)
                    .or_default()
                    .extend(remote.exchange_input.source_handles.iter().cloned());
            }
        }
    }
    out.retain(|_, handles| !handles.is_empty());
    out
}

/// Pull the connector splits out of a descriptor.
pub fn extract_connector_splits(task: &TaskDescriptor) -> SplitsByNode {
    let mut out = SplitsByNode::new();
    for (plan_node_id, splits) in &task.splits {
        let connector: Vec<Split> = splits
            .iter()
            .filter(|split| split.as_connector().is_some())
            .cloned()
            .collect();
        if !connector.is_empty() {
            out.insert(*plan_node_id, connector);
        }
    }
    out
}

/// In-memory split source with optional delayed finish and async input.
pub struct TestingSplitSource {
    pending_input: Option<oneshot::Receiver<Vec<ConnectorSplit>>>,
    splits: VecDeque<ConnectorSplit>,
    finish_delay_iterations: usize,
    closed: bool,
}

impl TestingSplitSource {
    pub fn new(splits: Vec<ConnectorSplit>) -> Self {
        Self::with_finish_delay(splits, 0)
    }

    pub fn with_finish_delay(splits: Vec<ConnectorSplit>, finish_delay_iterations: usize) -> Self {
        Self {
            pending_input: None,
            splits: splits.into(),
            finish_delay_iterations,
            closed: false,
        }
    }

    /// Source blocked until the sender provides the split list.
    pub fn pending() -> (oneshot::Sender<Vec<ConnectorSplit>>, Self) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Self {
                pending_input: Some(rx),
                splits: VecDeque::new(),
                finish_delay_iterations: 0,
                closed: false,
            },
        )
    }
}

#[async_trait]
impl SplitSource for TestingSplitSource {
    async fn next_batch(&mut self, max_size: usize) -> Result<SplitBatch> {
        if let Some(input) = self.pending_input.take() {
            let splits = input
                .await
                .map_err(|_| FloqError::Execution("split source input dropped".to_string()))?;
            self.splits.extend(splits);
        }
        let take = max_size.min(self.splits.len());
        let splits: Vec<ConnectorSplit> = self.splits.drain(..take).collect();
        let no_more_splits = if self.splits.is_empty() {
            if self.finish_delay_iterations == 0 {
                true
            } else {
                self.finish_delay_iterations -= 1;
                false
            }
        } else {
            false
        };
        Ok(SplitBatch {
            splits,
            no_more_splits,
        })
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Provider handing each scan node a canned split list.
#[derive(Default)]
pub struct TestingSplitSourceProvider {
    splits: Mutex<std::collections::HashMap<PlanNodeId, Vec<ConnectorSplit>>>,
}

impl TestingSplitSourceProvider {
    pub fn with_splits(plan_node_id: PlanNodeId, splits: Vec<ConnectorSplit>) -> Self {
        let provider = Self::default();
        provider
            .splits
            .lock()
            .expect("provider lock")
            .insert(plan_node_id, splits);
        provider
    }
}

impl SplitSourceProvider for TestingSplitSourceProvider {
    fn open_split_source(
        &self,
        _query_id: QueryId,
        _fragment: &PlanFragment,
        scan: &TableScanSource,
    ) -> Result<Box<dyn SplitSource>> {
        let splits = self
            .splits
            .lock()
            .expect("provider lock")
            .remove(&scan.plan_node_id)
            .unwrap_or_default();
        Ok(Box::new(TestingSplitSource::new(splits)))
    }
}

#[derive(Debug, Default)]
struct TestingExchangeState {
    next_sink_id: u64,
    finished_sinks: Vec<ExchangeSinkHandle>,
    no_more_sinks: bool,
    closed: bool,
    waiters: Vec<oneshot::Sender<Result<Vec<ExchangeSourceHandle>>>>,
}

/// Exchange double producing one standard-size handle per finished sink.
#[derive(Debug)]
pub struct TestingExchange {
    handle_size: DataSize,
    state: Mutex<TestingExchangeState>,
}

impl TestingExchange {
    pub fn new() -> Self {
        Self {
            handle_size: DataSize::of_bytes(STANDARD_WEIGHT),
            state: Mutex::new(TestingExchangeState::default()),
        }
    }

    fn handles(state: &TestingExchangeState, handle_size: DataSize) -> Vec<ExchangeSourceHandle> {
        state
            .finished_sinks
            .iter()
            .map(|sink| ExchangeSourceHandle::new(sink.partition_id, handle_size, sink.sink_id))
            .collect()
    }

    pub fn finished_sink_count(&self) -> usize {
        self.state.lock().expect("exchange lock").finished_sinks.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("exchange lock").closed
    }
}

impl Exchange for TestingExchange {
    fn add_sink(&self, partition_id: u32) -> ExchangeSinkHandle {
        let mut state = self.state.lock().expect("exchange lock");
        let sink_id = state.next_sink_id;
        state.next_sink_id += 1;
        ExchangeSinkHandle {
            partition_id,
            sink_id,
        }
    }

    fn sink_finished(&self, handle: &ExchangeSinkHandle) {
        let mut state = self.state.lock().expect("exchange lock");
        state.finished_sinks.push(handle.clone());
    }

    fn no_more_sinks(&self) {
        let mut state = self.state.lock().expect("exchange lock");
        state.no_more_sinks = true;
        let handles = Self::handles(&state, self.handle_size);
        for waiter in state.waiters.drain(..) {
            let _ = waiter.send(Ok(handles.clone()));
        }
    }

    fn get_source_handles(&self) -> SourceHandlesFuture {
        let mut state = self.state.lock().expect("exchange lock");
        if state.no_more_sinks {
            let handles = Self::handles(&state, self.handle_size);
            return async move { Ok(handles) }.boxed();
        }
        if state.closed {
            return async move {
                Err(FloqError::Execution(
                    "exchange closed before source handles were available".to_string(),
                ))
            }
            .boxed();
        }
        let (tx, rx) = oneshot::channel();
        state.waiters.push(tx);
        async move {
            rx.await.unwrap_or_else(|_| {
                Err(FloqError::Execution(
                    "exchange closed before source handles were available".to_string(),
                ))
            })
        }
        .boxed()
    }

    fn close(&self) {
        let mut state = self.state.lock().expect("exchange lock");
        state.closed = true;
        for waiter in state.waiters.drain(..) {
            let _ = waiter.send(Err(FloqError::Execution(
                "exchange closed before source handles were available".to_string(),
            )));
        }
    }
}

/// Records every created exchange for assertions.
#[derive(Default)]
pub struct TestingExchangeManager {
    created: Mutex<Vec<(ExchangeContext, Arc<TestingExchange>)>>,
}

impl TestingExchangeManager {
    pub fn exchanges(&self) -> Vec<(ExchangeContext, Arc<TestingExchange>)> {
        self.created.lock().expect("manager lock").clone()
    }
}

impl ExchangeManager for TestingExchangeManager {
    fn create_exchange(
        &self,
        context: ExchangeContext,
        _output_partition_count: u32,
        _preserve_order: bool,
    ) -> Arc<dyn Exchange> {
        let exchange = Arc::new(TestingExchange::new());
        self.created
            .lock()
            .expect("manager lock")
            .push((context, exchange.clone()));
        exchange
    }
}

type Listener = Box<dyn Fn(&TaskStatus) + Send + Sync>;

#[derive(Default)]
struct TaskListeners {
    listeners: Vec<Listener>,
    history: Vec<TaskStatus>,
}

/// Remote-task double driven by the test body.
pub struct TestingRemoteTask {
    task_id: TaskId,
    node_id: String,
    splits: SplitsByNode,
    sink: ExchangeSinkHandle,
    memory: DataSize,
    state: Mutex<TaskState>,
    listeners: Mutex<TaskListeners>,
    started: AtomicBool,
    cancelled: AtomicBool,
    aborted: AtomicBool,
}

impl TestingRemoteTask {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn splits(&self) -> &SplitsByNode {
        &self.splits
    }

    pub fn memory(&self) -> DataSize {
        self.memory
    }

    pub fn attempt(&self) -> u32 {
        self.task_id.attempt
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn finish(&self) {
        *self.state.lock().expect("task state lock") = TaskState::Finished;
        self.fire(TaskStatus::new(self.task_id, TaskState::Finished));
    }

    pub fn fail(&self, kind: FailureKind, message: &str) {
        *self.state.lock().expect("task state lock") = TaskState::Failed;
        self.fire(
            TaskStatus::new(self.task_id, TaskState::Failed)
                .with_failure(ExecutionFailure::new(kind, message)),
        );
    }

    fn fire(&self, status: TaskStatus) {
        let mut listeners = self.listeners.lock().expect("task listeners lock");
        listeners.history.push(status.clone());
        for listener in &listeners.listeners {
            listener(&status);
        }
    }
}

impl std::fmt::Debug for TestingRemoteTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestingRemoteTask")
            .field("task_id", &self.task_id)
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl RemoteTask for TestingRemoteTask {
    fn task_id(&self) -> TaskId {
        self.task_id
    }

    fn start(&self) {
        self.started.store(true, Ordering::Release);
        *self.state.lock().expect("task state lock") = TaskState::Running;
        self.fire(TaskStatus::new(self.task_id, TaskState::Running));
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        *self.state.lock().expect("task state lock") = TaskState::Aborted;
    }

    fn add_state_change_listener(&self, listener: Listener) {
        let mut listeners = self.listeners.lock().expect("task listeners lock");
        // Replay transitions fired before registration so no state is lost.
        for status in &listeners.history {
            listener(status);
        }
        listeners.listeners.push(listener);
    }
}

/// Collects every created remote task for the test body to drive.
#[derive(Default)]
pub struct TestingRemoteTaskFactory {
    tasks: Mutex<Vec<Arc<TestingRemoteTask>>>,
}

impl TestingRemoteTaskFactory {
    pub fn tasks(&self) -> Vec<Arc<TestingRemoteTask>> {
        self.tasks.lock().expect("factory lock").clone()
    }

    pub async fn wait_for_tasks(&self, count: usize) -> Vec<Arc<TestingRemoteTask>> {
        wait_until(
            || self.tasks.lock().expect("factory lock").len() >= count,
            "remote tasks to be created",
        )
        .await;
        self.tasks()
    }
}

impl RemoteTaskFactory for TestingRemoteTaskFactory {
    fn create_remote_task(
        &self,
        _query_id: QueryId,
        task_id: TaskId,
        node: Arc<InternalNode>,
        _fragment: Arc<PlanFragment>,
        splits: SplitsByNode,
        output_sink: ExchangeSinkHandle,
        memory_limit: DataSize,
    ) -> Result<Arc<dyn RemoteTask>> {
        let task = Arc::new(TestingRemoteTask {
            task_id,
            node_id: node.node_id.clone(),
            splits,
            sink: output_sink,
            memory: memory_limit,
            state: Mutex::new(TaskState::Pending),
            listeners: Mutex::new(TaskListeners::default()),
            started: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
        });
        self.tasks.lock().expect("factory lock").push(task.clone());
        Ok(task)
    }
}

/// Estimator factory counting `on_failure` invocations.
pub struct CountingEstimatorFactory {
    initial: DataSize,
    growth_factor: f64,
    on_failure_calls: Arc<AtomicUsize>,
}

impl CountingEstimatorFactory {
    pub fn new(initial: DataSize, growth_factor: f64) -> Self {
        Self {
            initial,
            growth_factor,
            on_failure_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn on_failure_calls(&self) -> usize {
        self.on_failure_calls.load(Ordering::Acquire)
    }

    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        self.on_failure_calls.clone()
    }
}

struct CountingEstimator {
    initial: DataSize,
    growth_factor: f64,
    on_failure_calls: Arc<AtomicUsize>,
}

impl PartitionMemoryEstimator for CountingEstimator {
    fn initial_estimate(&self, _partition_id: u32) -> DataSize {
        self.initial
    }

    fn on_failure(&self, previous: DataSize, kind: FailureKind) -> DataSize {
        self.on_failure_calls.fetch_add(1, Ordering::AcqRel);
        match kind {
            FailureKind::OutOfMemory => {
                let grown = (previous.bytes() as f64 * self.growth_factor).ceil() as u64;
                DataSize::of_bytes(grown.max(previous.bytes() + 1))
            }
            _ => previous,
        }
    }
}

impl PartitionMemoryEstimatorFactory for CountingEstimatorFactory {
    fn create_estimator(&self) -> Box<dyn PartitionMemoryEstimator> {
        Box::new(CountingEstimator {
            initial: self.initial,
            growth_factor: self.growth_factor,
            on_failure_calls: self.on_failure_calls.clone(),
        })
    }
}

/// Bucket-node-map stub for queries without catalog-bucketed handles.
pub struct UnsupportedPartitioningManager;

impl floq_scheduler::NodePartitioningManager for UnsupportedPartitioningManager {
    fn bucket_node_map(
        &self,
        handle: &floq_scheduler::PartitioningHandle,
    ) -> Result<Vec<Arc<InternalNode>>> {
        Err(FloqError::Unsupported(format!(
            "no bucket node map for {handle:?}"
        )))
    }
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(condition: impl Fn() -> bool, what: &str) {
    let deadline = Duration::from_secs(5);
    let poll = async {
        loop {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(deadline, poll)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

/// Spooled inputs published as the query's final results.
pub fn total_result_handles(inputs: &[SpoolingExchangeInput]) -> usize {
    inputs
        .iter()
        .map(|input| input.source_handles.len())
        .sum()
}

pub fn overall_retry_counter(value: u32) -> Arc<AtomicU64> {
    Arc::new(AtomicU64::new(value as u64))
}
