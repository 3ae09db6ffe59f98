//! Bucket-to-partition mapping shared by every stage of one query.
//!
//! Contract:
//! - a hash bucket maps to the same partition id in every stage that shares
//!   a partitioning handle, so locality caches stay valid across the query;
//! - for the fixed hash distribution the map is identity over
//!   `[0, partition_count)`;
//! - for a catalog-bound handle every node of the bucket-node map receives
//!   one partition, in stable first-appearance order.

use std::collections::HashMap;
use std::sync::Arc;

use floq_common::{FloqError, Result};

use crate::fragment::PartitioningHandle;
use crate::node::InternalNode;
use crate::split::ConnectorSplit;

/// Resolves catalog-bound partitioning handles to their bucket-node maps.
pub trait NodePartitioningManager: Send + Sync {
    /// The node assigned to each bucket, indexed by bucket id.
    fn bucket_node_map(&self, handle: &PartitioningHandle) -> Result<Vec<Arc<InternalNode>>>;
}

/// Partition layout of one fault-tolerant stage.
#[derive(Debug, Clone)]
pub struct FaultTolerantPartitioningScheme {
    partition_count: u32,
    bucket_to_partition: Option<Vec<u32>>,
    partition_to_node: Option<Vec<Arc<InternalNode>>>,
}

impl FaultTolerantPartitioningScheme {
    /// Layout without bucketing or node affinity.
    pub fn simple(partition_count: u32) -> Self {
        Self {
            partition_count,
            bucket_to_partition: None,
            partition_to_node: None,
        }
    }

    /// Layout with an explicit bucket map and optional per-partition affinity.
    pub fn bucketed(
        partition_count: u32,
        bucket_to_partition: Vec<u32>,
        partition_to_node: Option<Vec<Arc<InternalNode>>>,
    ) -> Self {
        Self {
            partition_count,
            bucket_to_partition: Some(bucket_to_partition),
            partition_to_node,
        }
    }

    /// Number of output partitions.
    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    /// Partition of a bucketed connector split.
    pub fn split_partition(&self, split: &ConnectorSplit) -> Result<u32> {
        let bucket = split.bucket.ok_or_else(|| {
            FloqError::Scheduling(
                "split without a bucket routed to a hash-distributed stage".to_string(),
            )
        })?;
        self.bucket_partition(bucket)
    }

    /// Partition a bucket collapses into.
    pub fn bucket_partition(&self, bucket: u32) -> Result<u32> {
        match &self.bucket_to_partition {
            Some(map) => map.get(bucket as usize).copied().ok_or_else(|| {
                FloqError::Scheduling(format!(
                    "bucket {bucket} outside bucket map of length {}",
                    map.len()
                ))
            }),
            None => Ok(bucket % self.partition_count),
        }
    }

    /// Partition targeted by an exchange source handle.
    ///
    /// Handle partition ids inside the bucket map range are collapsed the
    /// same way buckets are; ids already in partition space pass through.
    pub fn handle_partition(&self, handle_partition_id: u32) -> u32 {
        match &self.bucket_to_partition {
            Some(map) => map
                .get(handle_partition_id as usize)
                .copied()
                .unwrap_or(handle_partition_id),
            None => handle_partition_id,
        }
    }

    /// Node affinity of one partition, when the layout pins partitions.
    pub fn partition_node(&self, partition_id: u32) -> Option<Arc<InternalNode>> {
        self.partition_to_node
            .as_ref()
            .and_then(|nodes| nodes.get(partition_id as usize).cloned())
    }
}

/// Per-query cache mapping partitioning handles to partition layouts.
///
/// Scoped to one query with explicit construction; never a singleton.
pub struct BucketToPartitionCache {
    partition_count: u32,
    partitioning_manager: Arc<dyn NodePartitioningManager>,
    cache: HashMap<PartitioningHandle, FaultTolerantPartitioningScheme>,
}

impl BucketToPartitionCache {
    /// Construct an empty cache for one query.
    pub fn new(partition_count: u32, partitioning_manager: Arc<dyn NodePartitioningManager>) -> Self {
        Self {
            partition_count,
            partitioning_manager,
            cache: HashMap::new(),
        }
    }

    /// Layout for a partitioning handle, computed once per query.
    pub fn get(&mut self, handle: &PartitioningHandle) -> Result<FaultTolerantPartitioningScheme> {
        if let Some(scheme) = self.cache.get(handle) {
            return Ok(scheme.clone());
        }
        let scheme = self.build(handle)?;
        self.cache.insert(handle.clone(), scheme.clone());
        Ok(scheme)
    }

    fn build(&self, handle: &PartitioningHandle) -> Result<FaultTolerantPartitioningScheme> {
        match handle {
            PartitioningHandle::FixedHash => Ok(FaultTolerantPartitioningScheme::bucketed(
                self.partition_count,
                (0..self.partition_count).collect(),
                None,
            )),
            PartitioningHandle::CatalogBucketed { .. } => {
                let bucket_node_map = self.partitioning_manager.bucket_node_map(handle)?;
                if bucket_node_map.is_empty() {
                    return Err(FloqError::Planning(format!(
                        "empty bucket-node map for partitioning handle {handle:?}"
                    )));
                }
                // All buckets assigned to one node collapse into one partition
                // so locality requirements survive scheduling.
                let mut node_to_partition = HashMap::<String, u32>::new();
                let mut partition_to_node = Vec::new();
                let mut bucket_to_partition = Vec::with_capacity(bucket_node_map.len());
                for node in &bucket_node_map {
                    let next_id = partition_to_node.len() as u32;
                    let partition_id = *node_to_partition
                        .entry(node.node_id.clone())
                        .or_insert_with(|| {
                            partition_to_node.push(node.clone());
                            next_id
                        });
                    bucket_to_partition.push(partition_id);
                }
                let partition_count = partition_to_node.len() as u32;
                Ok(FaultTolerantPartitioningScheme::bucketed(
                    partition_count,
                    bucket_to_partition,
                    Some(partition_to_node),
                ))
            }
            PartitioningHandle::Single
            | PartitioningHandle::Coordinator
            | PartitioningHandle::Arbitrary
            | PartitioningHandle::Source => {
                Ok(FaultTolerantPartitioningScheme::simple(self.partition_count))
            }
        }
    }
}
