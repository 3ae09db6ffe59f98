//! Runtime stages and the per-query stage manager.
//!
//! Contract:
//! - stages live in topological order, root (output stage) first;
//! - state moves `Planned -> Scheduling -> Running -> terminal` and never
//!   leaves a terminal state;
//! - `finish`/`abort` broadcasts reach each stage at most once (terminal
//!   states swallow repeats).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use floq_common::{DataSize, FloqError, PlanFragmentId, QueryId, Result, StageId};
use tracing::debug;

use crate::fragment::{PlanFragment, SubPlan};

/// Lifecycle of one runtime stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    /// Created, no tasks emitted yet.
    Planned,
    /// First task descriptors observed.
    Scheduling,
    /// At least one attempt started on a worker.
    Running,
    /// Every partition finished and the task source is exhausted.
    Finished,
    /// Failed terminally; cause recorded.
    Failed,
    /// Torn down without completing.
    Aborted,
}

impl StageState {
    /// Whether the state is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StageState::Finished | StageState::Failed | StageState::Aborted
        )
    }
}

/// Aggregated per-stage attempt accounting.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageExecutionStats {
    /// Task descriptors emitted by the task source.
    pub emitted_tasks: u64,
    /// Attempts currently running.
    pub running_attempts: u64,
    /// Attempts that finished successfully.
    pub finished_attempts: u64,
    /// Attempts that failed (counted and uncounted).
    pub failed_attempts: u64,
    /// Attempts resubmitted by the retry protocol.
    pub retried_attempts: u64,
    /// CPU time accumulated by terminal attempts.
    pub cpu_time_millis: u64,
    /// Largest peak memory observed across attempts.
    pub peak_memory: DataSize,
}

/// One runtime instance of a plan fragment.
#[derive(Debug)]
pub struct Stage {
    stage_id: StageId,
    fragment: Arc<PlanFragment>,
    state: Mutex<StageState>,
    stats: Mutex<StageExecutionStats>,
    failure: Mutex<Option<FloqError>>,
}

impl Stage {
    fn new(stage_id: StageId, fragment: Arc<PlanFragment>) -> Self {
        Self {
            stage_id,
            fragment,
            state: Mutex::new(StageState::Planned),
            stats: Mutex::new(StageExecutionStats::default()),
            failure: Mutex::new(None),
        }
    }

    /// Stage identity.
    pub fn stage_id(&self) -> StageId {
        self.stage_id
    }

    /// Fragment this stage executes.
    pub fn fragment(&self) -> &Arc<PlanFragment> {
        &self.fragment
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StageState {
        *self.state.lock().expect("stage state lock")
    }

    /// Terminal failure cause, if the stage failed.
    pub fn failure(&self) -> Option<FloqError> {
        self.failure.lock().expect("stage failure lock").clone()
    }

    /// Snapshot of attempt accounting.
    pub fn stats(&self) -> StageExecutionStats {
        *self.stats.lock().expect("stage stats lock")
    }

    /// Mutate attempt accounting.
    pub fn update_stats(&self, update: impl FnOnce(&mut StageExecutionStats)) {
        update(&mut self.stats.lock().expect("stage stats lock"));
    }

    /// First task descriptors observed.
    pub fn begin_scheduling(&self) {
        let mut state = self.state.lock().expect("stage state lock");
        if *state == StageState::Planned {
            *state = StageState::Scheduling;
        }
    }

    /// First attempt started on a worker.
    pub fn transition_to_running(&self) {
        let mut state = self.state.lock().expect("stage state lock");
        if matches!(*state, StageState::Planned | StageState::Scheduling) {
            *state = StageState::Running;
        }
    }

    /// Complete the stage; no-op once terminal.
    pub fn finish(&self) {
        let mut state = self.state.lock().expect("stage state lock");
        if !state.is_terminal() {
            *state = StageState::Finished;
        }
    }

    /// Fail the stage with a cause; no-op once terminal.
    pub fn fail(&self, cause: FloqError) {
        let mut state = self.state.lock().expect("stage state lock");
        if !state.is_terminal() {
            *state = StageState::Failed;
            *self.failure.lock().expect("stage failure lock") = Some(cause);
        }
    }

    /// Abort the stage; no-op once terminal.
    pub fn abort(&self) {
        let mut state = self.state.lock().expect("stage state lock");
        if !state.is_terminal() {
            *state = StageState::Aborted;
        }
    }
}

/// Query-wide stats aggregated over all stages.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryExecutionStats {
    /// CPU time accumulated across stages.
    pub cpu_time_millis: u64,
    /// Largest peak memory observed across stages.
    pub peak_memory: DataSize,
    /// Finished attempts across stages.
    pub finished_attempts: u64,
    /// Failed attempts across stages.
    pub failed_attempts: u64,
    /// Retried attempts across stages.
    pub retried_attempts: u64,
}

/// Holds a query's stages in topological order and fans out lifecycle calls.
#[derive(Debug)]
pub struct StageManager {
    query_id: QueryId,
    stages: HashMap<StageId, Arc<Stage>>,
    topological: Vec<StageId>,
    stage_by_fragment: HashMap<PlanFragmentId, StageId>,
    children_by_fragment: HashMap<PlanFragmentId, Vec<StageId>>,
    output_stage: StageId,
}

impl StageManager {
    /// Materialize stages from a plan tree; the root fragment becomes the
    /// output stage with id 0.
    pub fn create(query_id: QueryId, plan: &SubPlan) -> Result<Self> {
        let mut stages = HashMap::new();
        let mut topological = Vec::new();
        let mut stage_by_fragment = HashMap::new();
        let mut children_by_fragment: HashMap<PlanFragmentId, Vec<StageId>> = HashMap::new();

        let mut frontier = vec![plan];
        while let Some(node) = frontier.pop() {
            let stage_id = StageId(topological.len() as u64);
            let fragment_id = node.fragment.id;
            if stage_by_fragment.contains_key(&fragment_id) {
                return Err(FloqError::Planning(format!(
                    "fragment {fragment_id} appears twice in the plan tree"
                )));
            }
            stages.insert(stage_id, Arc::new(Stage::new(stage_id, node.fragment.clone())));
            topological.push(stage_id);
            stage_by_fragment.insert(fragment_id, stage_id);
            // Children are visited after their parent, so ids grow root to
            // leaves and `topological` is already in topological order.
            for child in node.children.iter().rev() {
                frontier.push(child);
            }
        }

        for stage_id in &topological {
            let stage = &stages[stage_id];
            for source_fragment in stage.fragment().source_fragment_ids() {
                let child_stage = *stage_by_fragment.get(&source_fragment).ok_or_else(|| {
                    FloqError::Planning(format!(
                        "remote source references unknown fragment {source_fragment}"
                    ))
                })?;
                children_by_fragment
                    .entry(stage.fragment().id)
                    .or_default()
                    .push(child_stage);
            }
        }

        let output_stage = *topological.first().ok_or_else(|| {
            FloqError::Planning("plan tree has no fragments".to_string())
        })?;
        debug!(
            query_id = %query_id,
            stages = topological.len(),
            operator = "StageManager",
            "materialized stages"
        );
        Ok(Self {
            query_id,
            stages,
            topological,
            stage_by_fragment,
            children_by_fragment,
            output_stage,
        })
    }

    /// Query these stages belong to.
    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    /// Stage by id.
    pub fn get(&self, stage_id: StageId) -> Result<&Arc<Stage>> {
        self.stages.get(&stage_id).ok_or_else(|| {
            FloqError::Scheduling(format!("unknown stage: {stage_id}"))
        })
    }

    /// Stage executing a fragment.
    pub fn stage_for_fragment(&self, fragment_id: PlanFragmentId) -> Result<&Arc<Stage>> {
        let stage_id = self.stage_by_fragment.get(&fragment_id).ok_or_else(|| {
            FloqError::Scheduling(format!("no stage for fragment: {fragment_id}"))
        })?;
        self.get(*stage_id)
    }

    /// Child stages feeding a fragment's exchanges.
    pub fn children(&self, fragment_id: PlanFragmentId) -> Vec<Arc<Stage>> {
        self.children_by_fragment
            .get(&fragment_id)
            .map(|stage_ids| {
                stage_ids
                    .iter()
                    .filter_map(|stage_id| self.stages.get(stage_id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All stages, root first.
    pub fn stages_in_topological_order(&self) -> Vec<Arc<Stage>> {
        self.topological
            .iter()
            .filter_map(|stage_id| self.stages.get(stage_id).cloned())
            .collect()
    }

    /// The stage whose output the client consumes.
    pub fn output_stage(&self) -> &Arc<Stage> {
        &self.stages[&self.output_stage]
    }

    /// Broadcast completion to all non-terminal stages.
    pub fn finish(&self) {
        for stage in self.stages.values() {
            stage.finish();
        }
    }

    /// Broadcast abort to all non-terminal stages.
    pub fn abort(&self) {
        for stage in self.stages.values() {
            stage.abort();
        }
    }

    /// Aggregate attempt accounting across stages.
    pub fn aggregated_stats(&self) -> QueryExecutionStats {
        let mut total = QueryExecutionStats::default();
        for stage in self.stages.values() {
            let stats = stage.stats();
            total.cpu_time_millis += stats.cpu_time_millis;
            total.peak_memory = total.peak_memory.max(stats.peak_memory);
            total.finished_attempts += stats.finished_attempts;
            total.failed_attempts += stats.failed_attempts;
            total.retried_attempts += stats.retried_attempts;
        }
        total
    }
}
