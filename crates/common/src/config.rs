use serde::{Deserialize, Serialize};

use crate::error::{FloqError, Result};
use crate::units::{DataSize, SplitWeight};

/// Fault-tolerant scheduler configuration shared across one query.
///
/// All thresholds are soft targets except the retry budgets and the
/// descriptor-storage cap, which are hard limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Per-query counted-failure retry budget shared by all stages.
    pub task_retry_attempts_overall: u32,
    /// Per-partition retry budget.
    pub task_retry_attempts_per_task: u32,
    /// Bound on concurrent node-lease requests per stage.
    pub max_tasks_waiting_for_node_per_stage: usize,
    /// Hash fan-out and exchange output partition count.
    pub partition_count: u32,

    /// Adaptive-join split-weight cap for hash-distributed stages.
    pub target_partition_split_weight: SplitWeight,
    /// Adaptive-join exchange-byte cap for hash-distributed stages.
    pub target_partition_source_size: DataSize,
    /// Packing target for arbitrary-distributed stages.
    pub target_partition_size: DataSize,

    /// Pull size for connector split source batches.
    pub split_batch_size: usize,
    /// Minimum splits per source-distributed task while the source is open.
    pub min_splits_per_task: usize,
    /// Maximum splits per source-distributed task.
    pub max_splits_per_task: usize,
    /// Split-weight threshold sealing a source-distributed task.
    pub split_weight_per_task: SplitWeight,

    /// Byte cap for the shared task-descriptor storage.
    pub task_descriptor_storage_max_bytes: DataSize,
    /// Initial per-partition task memory estimate.
    pub initial_task_memory: DataSize,
    /// Estimate multiplier applied after an out-of-memory failure.
    pub task_memory_growth_factor: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            task_retry_attempts_overall: 64,
            task_retry_attempts_per_task: 4,
            max_tasks_waiting_for_node_per_stage: 5,
            partition_count: 50,
            target_partition_split_weight: SplitWeight::from_raw(64 * SplitWeight::STANDARD_RAW),
            target_partition_source_size: DataSize::of_gib(4),
            target_partition_size: DataSize::of_gib(4),
            split_batch_size: 1024,
            min_splits_per_task: 16,
            max_splits_per_task: 256,
            split_weight_per_task: SplitWeight::from_raw(64 * SplitWeight::STANDARD_RAW),
            task_descriptor_storage_max_bytes: DataSize::of_gib(15),
            initial_task_memory: DataSize::of_gib(5),
            task_memory_growth_factor: 3.0,
        }
    }
}

impl SchedulerConfig {
    /// Validate cross-field contracts before a query is constructed with this config.
    pub fn validate(&self) -> Result<()> {
        if self.partition_count == 0 {
            return Err(FloqError::InvalidConfig(
                "partition_count must be greater than or equal to 1".to_string(),
            ));
        }
        if self.max_tasks_waiting_for_node_per_stage == 0 {
            return Err(FloqError::InvalidConfig(
                "max_tasks_waiting_for_node_per_stage must be greater than or equal to 1"
                    .to_string(),
            ));
        }
        if self.split_batch_size == 0 {
            return Err(FloqError::InvalidConfig(
                "split_batch_size must be greater than or equal to 1".to_string(),
            ));
        }
        if self.max_splits_per_task == 0 || self.min_splits_per_task > self.max_splits_per_task {
            return Err(FloqError::InvalidConfig(format!(
                "split-per-task bounds are inconsistent: min={} max={}",
                self.min_splits_per_task, self.max_splits_per_task
            )));
        }
        if self.task_memory_growth_factor <= 1.0 {
            return Err(FloqError::InvalidConfig(format!(
                "task_memory_growth_factor must be greater than 1.0: {}",
                self.task_memory_growth_factor
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        SchedulerConfig::default().validate().expect("valid default");
    }

    #[test]
    fn rejects_zero_partition_count() {
        let config = SchedulerConfig {
            partition_count: 0,
            ..SchedulerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(FloqError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_inverted_split_bounds() {
        let config = SchedulerConfig {
            min_splits_per_task: 10,
            max_splits_per_task: 5,
            ..SchedulerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(FloqError::InvalidConfig(_))
        ));
    }
}
