//! Worker-runtime contract for one task attempt.

use std::fmt;
use std::sync::Arc;

use floq_common::{DataSize, QueryId, Result, TaskId};
use floq_exchange::ExchangeSinkHandle;
use serde::{Deserialize, Serialize};

use crate::failure::ExecutionFailure;
use crate::fragment::PlanFragment;
use crate::node::InternalNode;
use crate::split::SplitsByNode;

/// Lifecycle of one task attempt on a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Created but not yet running.
    Pending,
    /// Executing on the worker.
    Running,
    /// Draining output before completion.
    Finishing,
    /// Completed successfully.
    Finished,
    /// Ended with a failure.
    Failed,
    /// Forcefully terminated.
    Aborted,
}

impl TaskState {
    /// Whether the state is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Failed | TaskState::Aborted
        )
    }
}

/// One status observation published by a remote task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    /// Attempt identity.
    pub task_id: TaskId,
    /// Observed state.
    pub state: TaskState,
    /// Failure details when `state == Failed`.
    pub failure: Option<ExecutionFailure>,
    /// CPU time consumed so far.
    pub cpu_time_millis: u64,
    /// Peak memory observed on the worker.
    pub peak_memory: DataSize,
}

impl TaskStatus {
    /// Status for a state change without failure details.
    pub fn new(task_id: TaskId, state: TaskState) -> Self {
        Self {
            task_id,
            state,
            failure: None,
            cpu_time_millis: 0,
            peak_memory: DataSize::ZERO,
        }
    }

    /// Attach failure details.
    pub fn with_failure(mut self, failure: ExecutionFailure) -> Self {
        self.failure = Some(failure);
        self
    }
}

/// Callback invoked on every remote-task state change.
///
/// Listeners run on an unspecified thread and must only publish a single
/// atomic state change plus signal a readiness future.
pub type TaskStateListener = Box<dyn Fn(&TaskStatus) + Send + Sync>;

/// Handle to one task attempt running (or about to run) on a worker.
pub trait RemoteTask: Send + Sync + fmt::Debug {
    /// Attempt identity.
    fn task_id(&self) -> TaskId;

    /// Begin execution.
    fn start(&self);

    /// Ask the attempt to finish current work and stop; graceful.
    fn cancel(&self);

    /// Terminate the attempt immediately.
    fn abort(&self);

    /// Register a state-change listener; fired for every transition.
    fn add_state_change_listener(&self, listener: TaskStateListener);
}

/// Factory creating worker-side task attempts.
pub trait RemoteTaskFactory: Send + Sync {
    /// Create one task attempt on `node`.
    #[allow(clippy::too_many_arguments)]
    fn create_remote_task(
        &self,
        query_id: QueryId,
        task_id: TaskId,
        node: Arc<InternalNode>,
        fragment: Arc<PlanFragment>,
        splits: SplitsByNode,
        output_sink: ExchangeSinkHandle,
        memory_limit: DataSize,
    ) -> Result<Arc<dyn RemoteTask>>;
}
