//! Shared simulation state: the logical clock, the machine roster and the
//! process-wide metrics.
//!
//! The [`Environment`] is handed to every agent as an `Arc`. Only the
//! coordinator calls [`Environment::tick`]; everything else reads the clock
//! and bumps atomic counters.

pub mod environment;
pub mod metrics;

pub use environment::{Environment, EnvironmentConfig, RepairTick, Schedulable};
pub use metrics::{Counter, Metrics, MetricsSnapshot};
