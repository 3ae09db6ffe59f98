#![deny(missing_docs)]

//! Shared configuration, error types, IDs, units, and observability
//! primitives for floq crates.
//!
//! Architecture role:
//! - defines the scheduler configuration passed across layers
//! - provides common [`FloqError`] / [`Result`] contracts
//! - hosts typed identifiers and size/weight units
//! - hosts the Prometheus metrics registry
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]
//! - [`units`]

/// Scheduler configuration types.
pub mod config;
/// Shared error taxonomy.
pub mod error;
/// Strongly-typed identifier wrappers.
pub mod ids;
/// Metrics registry and Prometheus rendering helpers.
pub mod metrics;
/// Byte-size and split-weight units.
pub mod units;

pub use config::SchedulerConfig;
pub use error::{FloqError, Result};
pub use ids::*;
pub use metrics::MetricsRegistry;
pub use units::{DataSize, SplitWeight};
