//! Fab Plant - machines and what happens on the shop floor
//!
//! - [`machine`]: the machine cell, its job slots and failure/repair state
//! - [`pipeline`]: per-round stage advancement
//! - [`delegation`]: moving a running job off a failed machine, between ticks
//! - [`maintenance`]: FIFO repair scheduling
//! - [`negotiator`]: the machine agent that procures materials

pub mod delegation;
pub mod machine;
pub mod maintenance;
pub mod negotiator;
pub mod pipeline;

pub use delegation::{delegate, handle_failure, DelegationOutcome, DelegationQueue, FailureOutcome};
pub use machine::{FailureTransition, Machine, MachineSpec, MachineStatus};
pub use maintenance::{FailureNotice, MaintenanceHandle, MaintenanceScheduler, RepairAssignment, RepairPolicy};
pub use negotiator::{MachineAgent, ProcurementSettings};
pub use pipeline::{run_round, JobPipeline, PipelineStep};

use fab_protocol::{AgentId, ProtocolError, Stage};
use thiserror::Error;

/// Stage duration used when a machine's config leaves one out.
pub const DEFAULT_STAGE_TICKS: u32 = 2;

#[derive(Debug, Error)]
pub enum PlantError {
    #[error("Machine {0} has no capabilities")]
    EmptyCapabilities(AgentId),

    #[error("Machine {machine} has a zero duration for stage {stage}")]
    ZeroDuration { machine: AgentId, stage: Stage },

    #[error("Machine {machine} failure rate {rate} is outside [0, 1]")]
    InvalidFailureRate { machine: AgentId, rate: f64 },

    #[error("Invalid repair range {min}..={max}")]
    InvalidRepairRange { min: u32, max: u32 },

    #[error("Invalid {name} range {min}..={max}")]
    InvalidRange { name: &'static str, min: u64, max: u64 },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
