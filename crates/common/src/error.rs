use thiserror::Error;

/// Canonical floq error taxonomy used across crates.
///
/// Classification guidance:
/// - [`FloqError::Planning`]: query/fragment shape issues discovered before execution
/// - [`FloqError::Execution`]: task execution, exchange, or worker-reported failures
/// - [`FloqError::Scheduling`]: scheduler-internal invariant violations (never retried)
/// - [`FloqError::ResourceExhausted`]: hard caps such as the task-descriptor storage limit
/// - [`FloqError::InvalidConfig`]: configuration contract violations
/// - [`FloqError::Io`]: raw IO failures from std APIs
#[derive(Debug, Error)]
pub enum FloqError {
    /// Invalid or inconsistent configuration.
    ///
    /// Examples:
    /// - `partition_count` of zero
    /// - memory growth factor not greater than one
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Plan/fragment-level failures surfaced before or during stage construction.
    ///
    /// Examples:
    /// - source-distributed fragment without a table scan
    /// - unknown source fragment referenced by a remote source
    #[error("planning error: {0}")]
    Planning(String),

    /// Runtime execution failures reported by workers or the exchange.
    ///
    /// Examples:
    /// - task attempt failed after exhausting its retry budget
    /// - exchange closed while source handles were still pending
    #[error("execution error: {0}")]
    Execution(String),

    /// Scheduler-internal invariant violations.
    ///
    /// These are uncounted, fatal, and always transition the query to FAILED.
    #[error("scheduling error: {0}")]
    Scheduling(String),

    /// A hard resource cap was reached.
    ///
    /// Examples:
    /// - task-descriptor storage exceeded its configured byte cap
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Valid request for behavior intentionally outside the scheduler core.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl Clone for FloqError {
    fn clone(&self) -> Self {
        match self {
            Self::InvalidConfig(m) => Self::InvalidConfig(m.clone()),
            Self::Planning(m) => Self::Planning(m.clone()),
            Self::Execution(m) => Self::Execution(m.clone()),
            Self::Scheduling(m) => Self::Scheduling(m.clone()),
            Self::ResourceExhausted(m) => Self::ResourceExhausted(m.clone()),
            Self::Io(e) => Self::Execution(format!("io error: {e}")),
            Self::Unsupported(m) => Self::Unsupported(m.clone()),
        }
    }
}

/// Standard floq result alias.
pub type Result<T> = std::result::Result<T, FloqError>;
