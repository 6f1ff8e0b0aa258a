//! Bakery production simulation: configuration, tick runtime, supervisor
//! hooks and run reports.

pub mod config;
pub mod report;
pub mod runtime;
pub mod supervisor;

pub use config::{ConfigError, SimConfig};
pub use report::RunReport;
pub use runtime::{RoundAgent, SimError, Simulation, MAINTENANCE_ID};
pub use supervisor::{RefillPlan, Supervisor};
