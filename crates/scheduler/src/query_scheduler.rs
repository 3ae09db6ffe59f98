//! Query-level orchestration of fault-tolerant stage schedulers.
//!
//! Construction wires one external exchange per stage (children before
//! parents, so every parent finds its source exchanges), builds the
//! per-query bucket-to-partition cache, and hooks final-result publication
//! to the output exchange. Scheduling runs as one cooperative loop: the
//! single writer to every stage scheduler.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use floq_common::{FloqError, Result, SchedulerConfig, StageId};
use floq_exchange::{
    Exchange, ExchangeContext, ExchangeId, ExchangeManager, SpoolingExchangeInput,
};
use futures::future::select_all;
use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::allocator::{BinPackingNodeAllocator, NodeAllocator};
use crate::estimator::PartitionMemoryEstimatorFactory;
use crate::fragment::SubPlan;
use crate::node::{FailureDetector, NodeInventory};
use crate::partitioning::{BucketToPartitionCache, NodePartitioningManager};
use crate::query_state::{QueryState, QueryStateMachine};
use crate::remote_task::RemoteTaskFactory;
use crate::split::SplitSourceProvider;
use crate::stage::StageManager;
use crate::stage_scheduler::FaultTolerantStageScheduler;
use crate::storage::TaskDescriptorStorage;

/// Schedules one query across the cluster with task-level retries.
pub struct FaultTolerantQueryScheduler {
    state_machine: Arc<QueryStateMachine>,
    stage_manager: Arc<StageManager>,
    node_allocator: Arc<dyn NodeAllocator>,
    output_exchange: Arc<dyn Exchange>,
    exchanges: Vec<Arc<dyn Exchange>>,
    schedulers: Mutex<Option<Vec<FaultTolerantStageScheduler>>>,
    started: AtomicBool,
}

impl FaultTolerantQueryScheduler {
    /// Wire exchanges and stage schedulers for `plan`, leaves first.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state_machine: Arc<QueryStateMachine>,
        plan: &SubPlan,
        config: SchedulerConfig,
        inventory: &NodeInventory,
        failure_detector: Arc<dyn FailureDetector>,
        exchange_manager: Arc<dyn ExchangeManager>,
        partitioning_manager: Arc<dyn NodePartitioningManager>,
        split_source_provider: Arc<dyn SplitSourceProvider>,
        remote_task_factory: Arc<dyn RemoteTaskFactory>,
        descriptor_storage: Arc<TaskDescriptorStorage>,
        memory_estimator_factory: Arc<dyn PartitionMemoryEstimatorFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let query_id = state_machine.query_id();
        let stage_manager = Arc::new(StageManager::create(query_id, plan)?);

        descriptor_storage.initialize(query_id);
        {
            let storage = descriptor_storage.clone();
            state_machine.add_state_change_listener(Box::new(move |state| {
                if state.is_done() {
                    storage.destroy(query_id);
                }
            }));
        }

        let node_allocator: Arc<dyn NodeAllocator> = Arc::new(BinPackingNodeAllocator::new(
            query_id,
            inventory,
            failure_detector,
        ));
        let coordinator = inventory.coordinator().cloned();
        let mut bucket_cache =
            BucketToPartitionCache::new(config.partition_count, partitioning_manager);
        let remaining_retry_attempts_overall =
            Arc::new(AtomicU64::new(config.task_retry_attempts_overall as u64));

        let output_stage_id = stage_manager.output_stage().stage_id();
        let mut exchanges: HashMap<_, Arc<dyn Exchange>> = HashMap::new();
        let mut schedulers: Vec<FaultTolerantStageScheduler> = Vec::new();
        let mut output_exchange: Option<Arc<dyn Exchange>> = None;

        // Children before parents, so a parent's source exchanges exist by
        // the time its scheduler is constructed.
        let stages_reverse_topological = {
            let mut stages = stage_manager.stages_in_topological_order();
            stages.reverse();
            stages
        };
        let build = (|| -> Result<()> {
            for stage in &stages_reverse_topological {
                let fragment = stage.fragment().clone();
                let is_output_stage = stage.stage_id() == output_stage_id;
                let context = ExchangeContext::new(
                    query_id,
                    ExchangeId(format!("external-exchange-{}", stage.stage_id())),
                );
                // Client-consumed output may be globally sorted; its reveal
                // order must match producer order.
                let exchange = exchange_manager.create_exchange(
                    context,
                    config.partition_count,
                    is_output_stage,
                );
                exchanges.insert(fragment.id, exchange.clone());
                if is_output_stage {
                    output_exchange = Some(exchange.clone());
                }

                let mut source_exchanges = BTreeMap::new();
                for child in stage_manager.children(fragment.id) {
                    let child_fragment_id = child.fragment().id;
                    let source = exchanges.get(&child_fragment_id).ok_or_else(|| {
                        FloqError::Scheduling(format!(
                            "exchange not found for fragment {child_fragment_id}"
                        ))
                    })?;
                    source_exchanges.insert(child_fragment_id, source.clone());
                }

                let scheme = bucket_cache.get(&fragment.partitioning)?;
                let scheduler = FaultTolerantStageScheduler::new(
                    query_id,
                    stage.clone(),
                    node_allocator.clone(),
                    descriptor_storage.clone(),
                    memory_estimator_factory.create_estimator(),
                    remote_task_factory.clone(),
                    split_source_provider.clone(),
                    exchange,
                    source_exchanges,
                    scheme,
                    coordinator.clone(),
                    remaining_retry_attempts_overall.clone(),
                    config.clone(),
                )?;
                schedulers.push(scheduler);
            }
            Ok(())
        })();
        if let Err(error) = build {
            for mut scheduler in schedulers {
                scheduler.abort();
            }
            node_allocator.close();
            for exchange in exchanges.values() {
                exchange.close();
            }
            return Err(error);
        }

        let output_exchange = output_exchange.ok_or_else(|| {
            FloqError::Scheduling("no exchange created for the output stage".to_string())
        })?;
        info!(
            query_id = %query_id,
            stages = schedulers.len(),
            operator = "FaultTolerantQueryScheduler",
            "query scheduler constructed"
        );
        Ok(Self {
            state_machine,
            stage_manager,
            node_allocator,
            output_exchange,
            exchanges: exchanges.into_values().collect(),
            schedulers: Mutex::new(Some(schedulers)),
            started: AtomicBool::new(false),
        })
    }

    /// Query state machine driven by this scheduler.
    pub fn state_machine(&self) -> &Arc<QueryStateMachine> {
        &self.state_machine
    }

    /// Stage manager holding this query's stages.
    pub fn stage_manager(&self) -> &Arc<StageManager> {
        &self.stage_manager
    }

    /// Begin scheduling; idempotent. Spawns the cooperative loop and the
    /// final-result publication hook on the current tokio runtime.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.state_machine.is_done() {
            return;
        }

        // Publish output-stage handles as the query's final result inputs.
        let state_machine = self.state_machine.clone();
        let handles_future = self.output_exchange.get_source_handles();
        tokio::spawn(async move {
            if let Ok(handles) = handles_future.await {
                let inputs = if handles.is_empty() {
                    Vec::new()
                } else {
                    vec![SpoolingExchangeInput::new(handles)]
                };
                state_machine.set_query_results(inputs);
            }
        });

        let Some(schedulers) = self.schedulers.lock().expect("schedulers lock").take() else {
            return;
        };
        let scheduling = SchedulerLoop {
            state_machine: self.state_machine.clone(),
            stage_manager: self.stage_manager.clone(),
            node_allocator: self.node_allocator.clone(),
            exchanges: self.exchanges.clone(),
            schedulers,
        };
        tokio::spawn(scheduling.run());
    }

    /// Fail the query with a cancellation cause; the loop tears down stages.
    pub fn cancel(&self, reason: &str) {
        self.state_machine
            .transition_to_failed(FloqError::Execution(format!("query cancelled: {reason}")));
    }
}

struct SchedulerLoop {
    state_machine: Arc<QueryStateMachine>,
    stage_manager: Arc<StageManager>,
    node_allocator: Arc<dyn NodeAllocator>,
    exchanges: Vec<Arc<dyn Exchange>>,
    schedulers: Vec<FaultTolerantStageScheduler>,
}

impl SchedulerLoop {
    async fn run(mut self) {
        if self.schedulers.is_empty() {
            self.state_machine.transition_to_finishing();
            return;
        }
        self.state_machine.transition_to_running();

        while !self.state_machine.is_finishing_or_done() {
            let mut blocked = Vec::new();
            let mut progressed = false;
            let mut all_finished = true;
            for scheduler in &mut self.schedulers {
                if scheduler.is_finished() {
                    if let Ok(stage) = self.stage_manager.get(scheduler.stage_id()) {
                        stage.finish();
                    }
                    continue;
                }
                all_finished = false;
                if scheduler.is_blocked().now_or_never().is_none() {
                    blocked.push(scheduler.is_blocked());
                    continue;
                }
                if let Err(error) = scheduler.schedule() {
                    let failed_stage = scheduler.stage_id();
                    self.fail(error, Some(failed_stage));
                    return;
                }
                if scheduler.is_blocked().now_or_never().is_none() {
                    blocked.push(scheduler.is_blocked());
                } else {
                    progressed = true;
                }
            }
            if all_finished {
                self.state_machine.transition_to_finishing();
                break;
            }
            if !progressed && !blocked.is_empty() {
                // Cap the wait so a missed signal or an external state
                // change stalls scheduling for at most one second.
                let _ = tokio::time::timeout(Duration::from_secs(1), select_all(blocked)).await;
            }
        }

        self.finalize();
    }

    fn fail(&mut self, error: FloqError, failed_stage: Option<StageId>) {
        warn!(
            query_id = %self.state_machine.query_id(),
            error = %error,
            operator = "FaultTolerantQueryScheduler",
            "query scheduling failed"
        );
        for scheduler in &mut self.schedulers {
            scheduler.abort();
        }
        for stage in self.stage_manager.stages_in_topological_order() {
            if failed_stage == Some(stage.stage_id()) {
                stage.fail(error.clone());
            } else {
                stage.abort();
            }
        }
        self.node_allocator.close();
        self.close_exchanges();
        self.state_machine.transition_to_failed(error);
    }

    fn finalize(&mut self) {
        match self.state_machine.state() {
            QueryState::Finishing | QueryState::Finished => {
                for scheduler in &mut self.schedulers {
                    scheduler.cancel();
                }
                self.stage_manager.finish();
                self.node_allocator.close();
                self.close_exchanges();
                debug!(
                    query_id = %self.state_machine.query_id(),
                    operator = "FaultTolerantQueryScheduler",
                    "scheduling loop finished"
                );
            }
            QueryState::Failed => {
                for scheduler in &mut self.schedulers {
                    scheduler.abort();
                }
                self.stage_manager.abort();
                self.node_allocator.close();
                self.close_exchanges();
            }
            _ => {}
        }
    }

    fn close_exchanges(&self) {
        for exchange in &self.exchanges {
            exchange.close();
        }
    }
}
