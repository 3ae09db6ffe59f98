//! Failure classification driving the retry protocol.

use std::fmt;

use floq_common::FloqError;
use serde::{Deserialize, Serialize};

/// Why a task attempt (or its lease) ended unsuccessfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// Plan or input error surfaced by the worker; never retried.
    UserError,
    /// Transient worker failure (network, process crash).
    WorkerFailure,
    /// The node running the attempt left the cluster.
    NodeLost,
    /// The attempt exceeded its memory estimate on the worker.
    OutOfMemory,
    /// The node lease was cancelled by scheduler shutdown.
    LeaseCancelled,
    /// Scheduler-internal invariant violation; fatal and uncounted.
    Internal,
}

impl FailureKind {
    /// Whether the retry protocol may resubmit after this failure.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            FailureKind::WorkerFailure
                | FailureKind::NodeLost
                | FailureKind::OutOfMemory
                | FailureKind::LeaseCancelled
        )
    }

    /// Whether this failure consumes retry budget.
    ///
    /// Lease cancellations come from scheduler shutdown, not from the task,
    /// and are never counted.
    pub fn is_counted(self) -> bool {
        self.is_retriable() && self != FailureKind::LeaseCancelled
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::UserError => "user error",
            FailureKind::WorkerFailure => "worker failure",
            FailureKind::NodeLost => "node lost",
            FailureKind::OutOfMemory => "out of memory",
            FailureKind::LeaseCancelled => "lease cancelled",
            FailureKind::Internal => "internal",
        };
        write!(f, "{name}")
    }
}

/// One observed attempt failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    /// Failure classification.
    pub kind: FailureKind,
    /// Worker- or scheduler-supplied message.
    pub message: String,
}

impl ExecutionFailure {
    /// Construct a failure.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Convert into the query-level error surfaced to the client.
    pub fn into_error(self) -> FloqError {
        match self.kind {
            FailureKind::UserError => FloqError::Planning(self.message),
            FailureKind::Internal => FloqError::Scheduling(self.message),
            _ => FloqError::Execution(format!("{}: {}", self.kind, self.message)),
        }
    }
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
