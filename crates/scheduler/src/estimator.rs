//! Per-partition task memory estimation.

use floq_common::DataSize;

use crate::failure::FailureKind;

/// Predicts initial and post-failure memory requirements per partition.
pub trait PartitionMemoryEstimator: Send {
    /// Estimate for the first attempt of a partition.
    fn initial_estimate(&self, partition_id: u32) -> DataSize;

    /// Estimate for the next attempt after a failure.
    ///
    /// After an out-of-memory failure the returned estimate is strictly
    /// larger than `previous`; other failure kinds keep it unchanged.
    fn on_failure(&self, previous: DataSize, kind: FailureKind) -> DataSize;
}

/// Creates one estimator per stage.
pub trait PartitionMemoryEstimatorFactory: Send + Sync {
    /// Create a fresh estimator.
    fn create_estimator(&self) -> Box<dyn PartitionMemoryEstimator>;
}

/// Estimator growing the estimate geometrically on out-of-memory failures.
#[derive(Debug, Clone)]
pub struct ExponentialGrowthPartitionMemoryEstimator {
    initial: DataSize,
    growth_factor: f64,
}

impl ExponentialGrowthPartitionMemoryEstimator {
    /// Construct with an initial estimate and a growth factor above 1.0.
    pub fn new(initial: DataSize, growth_factor: f64) -> Self {
        Self {
            initial,
            growth_factor,
        }
    }
}

impl PartitionMemoryEstimator for ExponentialGrowthPartitionMemoryEstimator {
    fn initial_estimate(&self, _partition_id: u32) -> DataSize {
        self.initial
    }

    fn on_failure(&self, previous: DataSize, kind: FailureKind) -> DataSize {
        match kind {
            FailureKind::OutOfMemory => {
                let grown = (previous.bytes() as f64 * self.growth_factor).ceil() as u64;
                DataSize::of_bytes(grown.max(previous.bytes().saturating_add(1)))
            }
            _ => previous,
        }
    }
}

impl PartitionMemoryEstimatorFactory for ExponentialGrowthPartitionMemoryEstimator {
    fn create_estimator(&self) -> Box<dyn PartitionMemoryEstimator> {
        Box::new(self.clone())
    }
}
