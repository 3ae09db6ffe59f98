//! Bounded in-memory index of in-flight task descriptors.
//!
//! Shared across queries; state is partitioned by query id so queries never
//! observe each other's descriptors. The byte cap is global: once reached,
//! inserts are rejected with [`FloqError::ResourceExhausted`], which the
//! stage scheduler translates into a query-level failure.

use std::collections::HashMap;
use std::sync::Mutex;

use floq_common::metrics::global_metrics;
use floq_common::{DataSize, FloqError, QueryId, Result, StageId};
use tracing::debug;

use crate::task::TaskDescriptor;

#[derive(Debug, Default)]
struct QueryDescriptors {
    reserved_bytes: u64,
    descriptors: HashMap<(StageId, u32), TaskDescriptor>,
}

/// Thread-safe descriptor store with a global memory cap.
#[derive(Debug)]
pub struct TaskDescriptorStorage {
    max_bytes: u64,
    inner: Mutex<StorageInner>,
}

#[derive(Debug, Default)]
struct StorageInner {
    total_reserved_bytes: u64,
    queries: HashMap<QueryId, QueryDescriptors>,
}

impl TaskDescriptorStorage {
    /// Construct with a byte cap.
    pub fn new(max_bytes: DataSize) -> Self {
        Self {
            max_bytes: max_bytes.bytes(),
            inner: Mutex::new(StorageInner::default()),
        }
    }

    /// Open storage for a query; inserts before this call are dropped.
    pub fn initialize(&self, query_id: QueryId) {
        let mut inner = self.inner.lock().expect("storage lock");
        inner.queries.entry(query_id).or_default();
    }

    /// Store one descriptor.
    ///
    /// A put for a query that was never initialized (or already destroyed)
    /// is silently dropped: the query is finished and no longer needs
    /// recovery state.
    pub fn put(
        &self,
        query_id: QueryId,
        stage_id: StageId,
        descriptor: TaskDescriptor,
    ) -> Result<()> {
        let mut inner = self.inner.lock().expect("storage lock");
        let retained = descriptor.retained_bytes();
        if inner.total_reserved_bytes.saturating_add(retained) > self.max_bytes {
            return Err(FloqError::ResourceExhausted(format!(
                "task descriptor storage capacity exceeded: reserved {} + descriptor {} > cap {}",
                DataSize::of_bytes(inner.total_reserved_bytes),
                DataSize::of_bytes(retained),
                DataSize::of_bytes(self.max_bytes)
            )));
        }
        let Some(query) = inner.queries.get_mut(&query_id) else {
            debug!(
                query_id = %query_id,
                stage_id = %stage_id,
                operator = "TaskDescriptorStorage",
                "dropping descriptor for unknown query"
            );
            return Ok(());
        };
        let key = (stage_id, descriptor.partition_id);
        let replaced = query
            .descriptors
            .insert(key, descriptor)
            .map(|old| old.retained_bytes())
            .unwrap_or(0);
        query.reserved_bytes = query.reserved_bytes.saturating_sub(replaced) + retained;
        inner.total_reserved_bytes =
            inner.total_reserved_bytes.saturating_sub(replaced) + retained;
        self.publish_metrics(&inner, query_id);
        Ok(())
    }

    /// Fetch a descriptor by stage and partition.
    pub fn get(
        &self,
        query_id: QueryId,
        stage_id: StageId,
        partition_id: u32,
    ) -> Option<TaskDescriptor> {
        let inner = self.inner.lock().expect("storage lock");
        inner
            .queries
            .get(&query_id)
            .and_then(|query| query.descriptors.get(&(stage_id, partition_id)))
            .cloned()
    }

    /// Drop a descriptor once its attempt is terminal.
    pub fn remove(&self, query_id: QueryId, stage_id: StageId, partition_id: u32) {
        let mut inner = self.inner.lock().expect("storage lock");
        let Some(query) = inner.queries.get_mut(&query_id) else {
            return;
        };
        if let Some(removed) = query.descriptors.remove(&(stage_id, partition_id)) {
            let retained = removed.retained_bytes();
            query.reserved_bytes = query.reserved_bytes.saturating_sub(retained);
            inner.total_reserved_bytes = inner.total_reserved_bytes.saturating_sub(retained);
            self.publish_metrics(&inner, query_id);
        }
    }

    /// Release all state of one query; idempotent.
    pub fn destroy(&self, query_id: QueryId) {
        let mut inner = self.inner.lock().expect("storage lock");
        if let Some(query) = inner.queries.remove(&query_id) {
            inner.total_reserved_bytes = inner
                .total_reserved_bytes
                .saturating_sub(query.reserved_bytes);
            global_metrics().set_descriptor_storage_reserved_bytes(&query_id.to_string(), 0);
        }
    }

    /// Bytes currently retained across all queries.
    pub fn reserved_bytes(&self) -> DataSize {
        let inner = self.inner.lock().expect("storage lock");
        DataSize::of_bytes(inner.total_reserved_bytes)
    }

    fn publish_metrics(&self, inner: &StorageInner, query_id: QueryId) {
        let reserved = inner
            .queries
            .get(&query_id)
            .map(|query| query.reserved_bytes)
            .unwrap_or(0);
        global_metrics().set_descriptor_storage_reserved_bytes(&query_id.to_string(), reserved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::split::{CatalogHandle, ConnectorSplit, Split, SplitsByNode};
    use crate::task::NodeRequirements;
    use floq_common::PlanNodeId;

    fn descriptor(partition_id: u32) -> TaskDescriptor {
        let mut splits = SplitsByNode::new();
        splits.insert(
            PlanNodeId(1),
            vec![Split::Connector(ConnectorSplit::new(
                CatalogHandle::new("hive"),
                serde_json::json!({"file": format!("f{partition_id}")}),
            ))],
        );
        TaskDescriptor::new(partition_id, splits, NodeRequirements::any())
    }

    #[test]
    fn put_get_remove_roundtrip() {
        let storage = TaskDescriptorStorage::new(DataSize::of_mib(1));
        let query = QueryId(1);
        storage.initialize(query);
        storage
            .put(query, StageId(0), descriptor(3))
            .expect("put fits");
        let fetched = storage.get(query, StageId(0), 3).expect("stored");
        assert_eq!(fetched.partition_id, 3);
        storage.remove(query, StageId(0), 3);
        assert!(storage.get(query, StageId(0), 3).is_none());
        assert_eq!(storage.reserved_bytes(), DataSize::ZERO);
    }

    #[test]
    fn rejects_insert_over_cap() {
        let storage = TaskDescriptorStorage::new(DataSize::of_bytes(16));
        let query = QueryId(1);
        storage.initialize(query);
        let result = storage.put(query, StageId(0), descriptor(0));
        assert!(matches!(result, Err(FloqError::ResourceExhausted(_))));
    }

    #[test]
    fn uninitialized_query_puts_are_dropped() {
        let storage = TaskDescriptorStorage::new(DataSize::of_mib(1));
        storage
            .put(QueryId(9), StageId(0), descriptor(0))
            .expect("dropped, not an error");
        assert!(storage.get(QueryId(9), StageId(0), 0).is_none());
    }

    #[test]
    fn destroy_is_idempotent_and_releases_bytes() {
        let storage = TaskDescriptorStorage::new(DataSize::of_mib(1));
        let query = QueryId(1);
        storage.initialize(query);
        storage.put(query, StageId(0), descriptor(0)).expect("put");
        assert!(storage.reserved_bytes() > DataSize::ZERO);
        storage.destroy(query);
        storage.destroy(query);
        assert_eq!(storage.reserved_bytes(), DataSize::ZERO);
    }
}
