//! Clock and machine roster.
//!
//! Each [`Environment::tick`]:
//! 1. advances global time by one,
//! 2. charges one downtime tick per failed machine,
//! 3. counts down every running repair and clears the failure flag of
//!    machines whose countdown hits zero,
//! 4. optionally injects environment-detected faults into healthy machines.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use fab_protocol::{AgentId, Job, Stage, Tick};

use crate::metrics::{Metrics, MetricsSnapshot};

/// Result of one repair countdown step on a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairTick {
    /// Not failed.
    Healthy,
    /// Failed, waiting in the maintenance queue.
    AwaitingRepair,
    /// Failed, `remaining` repair ticks left after this tick.
    InRepair { remaining: u32 },
    /// Countdown reached zero on this tick; the failure flag is cleared.
    Repaired,
}

/// What delegation and maintenance need to know about a machine.
///
/// Implementors must make `try_acquire_job` a single critical section:
/// the idle check and the assignment happen under the same lock, so two
/// concurrent callers can never both install a job.
pub trait Schedulable: Send + Sync {
    fn id(&self) -> &AgentId;

    fn is_failed(&self) -> bool;

    /// No current job.
    fn is_idle(&self) -> bool;

    fn can_handle(&self, stage: Stage) -> bool;

    /// Install `job` as the current job if this machine is healthy, idle and
    /// supports the job's current stage. On refusal the job is handed back.
    fn try_acquire_job(&self, job: Job) -> Result<(), Job>;

    fn repair_ticks_remaining(&self) -> u32;

    /// Start a repair countdown. Returns false if the machine is not failed
    /// or is already counting down.
    fn begin_repair(&self, ticks: u32) -> bool;

    /// One clock step of the repair countdown.
    fn tick_repair(&self) -> RepairTick;

    /// Flag an externally detected fault, handled on the machine's next
    /// round. Returns false if the machine is already failed or flagged.
    fn inject_fault(&self) -> bool;
}

#[derive(Debug, Clone, Default)]
pub struct EnvironmentConfig {
    /// Per-tick probability that the environment breaks a healthy machine.
    pub external_failure_rate: f64,
    /// Seed for the environment's own randomness (None = entropy).
    pub seed: Option<u64>,
}

pub struct Environment {
    time: AtomicU64,
    metrics: Metrics,
    roster: RwLock<Vec<Arc<dyn Schedulable>>>,
    external_failure_rate: f64,
    rng: Mutex<StdRng>,
}

impl Environment {
    pub fn new(config: EnvironmentConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            time: AtomicU64::new(0),
            metrics: Metrics::default(),
            roster: RwLock::new(Vec::new()),
            external_failure_rate: config.external_failure_rate.clamp(0.0, 1.0),
            rng: Mutex::new(rng),
        }
    }

    pub fn now(&self) -> Tick {
        self.time.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.now())
    }

    /// Add a machine to the roster. Roster order is the delegation scan order.
    pub fn register(&self, machine: Arc<dyn Schedulable>) {
        let mut roster = self.roster.write().unwrap_or_else(PoisonError::into_inner);
        tracing::debug!(machine = %machine.id(), "Machine registered");
        roster.push(machine);
    }

    pub fn machines(&self) -> Vec<Arc<dyn Schedulable>> {
        self.roster
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn machine(&self, id: &AgentId) -> Option<Arc<dyn Schedulable>> {
        self.roster
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|m| m.id() == id)
            .cloned()
    }

    /// Advance global time by one tick and return the updated metrics.
    ///
    /// Must only be called by the single coordinator driving the simulation.
    pub fn tick(&self) -> MetricsSnapshot {
        let now = self.time.fetch_add(1, Ordering::AcqRel) + 1;

        for machine in self.machines() {
            if machine.is_failed() {
                self.metrics.machine_downtime_ticks.incr();
            }

            match machine.tick_repair() {
                RepairTick::Repaired => {
                    self.metrics.repairs_finished.incr();
                    tracing::info!(
                        machine = %machine.id(),
                        tick = now,
                        "Repair finished, machine operational"
                    );
                }
                RepairTick::InRepair { remaining } => {
                    tracing::debug!(machine = %machine.id(), remaining, "Repair in progress");
                }
                RepairTick::Healthy | RepairTick::AwaitingRepair => {}
            }

            if self.external_failure_rate > 0.0 && !machine.is_failed() {
                let roll: f64 = self
                    .rng
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .gen();
                if roll < self.external_failure_rate && machine.inject_fault() {
                    tracing::warn!(
                        machine = %machine.id(),
                        tick = now,
                        "Environment detected a machine fault"
                    );
                }
            }
        }

        self.metrics.snapshot(now)
    }
}
