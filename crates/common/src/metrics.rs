use std::sync::{Arc, OnceLock};

use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};

/// Cheaply cloneable scheduler metrics registry.
#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    scheduler_queued_tasks: GaugeVec,
    scheduler_running_tasks: GaugeVec,
    scheduler_retries: CounterVec,
    scheduler_tasks_emitted: CounterVec,
    allocator_pending_leases: GaugeVec,
    allocator_reserved_bytes: GaugeVec,
    descriptor_storage_reserved_bytes: GaugeVec,
}

impl MetricsRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// Set queued-attempt gauge for one stage.
    pub fn set_scheduler_queued_tasks(&self, query_id: &str, stage_id: u64, queued: u64) {
        let labels = [query_id, &stage_id.to_string()];
        self.inner
            .scheduler_queued_tasks
            .with_label_values(&labels)
            .set(queued as f64);
    }

    /// Set running-attempt gauge for one stage.
    pub fn set_scheduler_running_tasks(&self, query_id: &str, stage_id: u64, running: u64) {
        let labels = [query_id, &stage_id.to_string()];
        self.inner
            .scheduler_running_tasks
            .with_label_values(&labels)
            .set(running as f64);
    }

    /// Count one retried attempt for one stage.
    pub fn inc_scheduler_retries(&self, query_id: &str, stage_id: u64) {
        let labels = [query_id, &stage_id.to_string()];
        self.inner
            .scheduler_retries
            .with_label_values(&labels)
            .inc();
    }

    /// Count task descriptors emitted by one stage's task source.
    pub fn inc_scheduler_tasks_emitted(&self, query_id: &str, stage_id: u64, count: u64) {
        let labels = [query_id, &stage_id.to_string()];
        self.inner
            .scheduler_tasks_emitted
            .with_label_values(&labels)
            .inc_by(count as f64);
    }

    /// Set pending-lease gauge for the per-query node allocator.
    pub fn set_allocator_pending_leases(&self, query_id: &str, pending: u64) {
        self.inner
            .allocator_pending_leases
            .with_label_values(&[query_id])
            .set(pending as f64);
    }

    /// Set reserved-memory gauge for one worker node.
    pub fn set_allocator_reserved_bytes(&self, node_id: &str, bytes: u64) {
        self.inner
            .allocator_reserved_bytes
            .with_label_values(&[node_id])
            .set(bytes as f64);
    }

    /// Set retained-byte gauge for one query's descriptor storage.
    pub fn set_descriptor_storage_reserved_bytes(&self, query_id: &str, bytes: u64) {
        self.inner
            .descriptor_storage_reserved_bytes
            .with_label_values(&[query_id])
            .set(bytes as f64);
    }

    /// Render all registered metrics in Prometheus text format.
    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let scheduler_queued_tasks = gauge_vec(
            &registry,
            "floq_scheduler_queued_tasks",
            "Task attempts waiting to be scheduled",
            &["query_id", "stage_id"],
        );
        let scheduler_running_tasks = gauge_vec(
            &registry,
            "floq_scheduler_running_tasks",
            "Task attempts currently running on workers",
            &["query_id", "stage_id"],
        );
        let scheduler_retries = counter_vec(
            &registry,
            "floq_scheduler_retries_total",
            "Retried task attempts",
            &["query_id", "stage_id"],
        );
        let scheduler_tasks_emitted = counter_vec(
            &registry,
            "floq_scheduler_tasks_emitted_total",
            "Task descriptors emitted by stage task sources",
            &["query_id", "stage_id"],
        );
        let allocator_pending_leases = gauge_vec(
            &registry,
            "floq_allocator_pending_leases",
            "Node-lease requests not yet granted",
            &["query_id"],
        );
        let allocator_reserved_bytes = gauge_vec(
            &registry,
            "floq_allocator_reserved_bytes",
            "Memory reserved on a worker node by granted leases",
            &["node_id"],
        );
        let descriptor_storage_reserved_bytes = gauge_vec(
            &registry,
            "floq_descriptor_storage_reserved_bytes",
            "Bytes retained by task-descriptor storage per query",
            &["query_id"],
        );

        Self {
            registry,
            scheduler_queued_tasks,
            scheduler_running_tasks,
            scheduler_retries,
            scheduler_tasks_emitted,
            allocator_pending_leases,
            allocator_reserved_bytes,
            descriptor_storage_reserved_bytes,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let metric = CounterVec::new(Opts::new(name, help), labels).expect("valid counter opts");
    registry
        .register(Box::new(metric.clone()))
        .expect("unique metric name");
    metric
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let metric = GaugeVec::new(Opts::new(name, help), labels).expect("valid gauge opts");
    registry
        .register(Box::new(metric.clone()))
        .expect("unique metric name");
    metric
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

/// Process-wide metrics registry.
pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}
