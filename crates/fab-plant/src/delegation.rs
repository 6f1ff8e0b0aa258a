//! Failure handling: park the running job, then ask for a repair.
//!
//! A machine that fails mid-tick does not touch its peers. Its running job
//! goes to the [`DelegationQueue`], and the coordinator delegates every
//! queued job once all agents have finished the tick, in roster order of
//! the failed machines. Peers are therefore only ever written between
//! ticks, and a seeded run delegates the same way every time.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use fab_protocol::{AgentId, Job, JobId, Stage, Tick};
use fab_state::{Environment, Metrics, Schedulable};

use crate::machine::{FailureTransition, Machine};
use crate::maintenance::MaintenanceHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelegationOutcome {
    /// The job now runs on `to`, at the same stage.
    Delegated {
        job: JobId,
        to: AgentId,
        stage: Stage,
        carried_ticks: u32,
    },
    /// No peer could take it; the job is gone.
    Lost { job: JobId, stage: Stage },
}

/// Offer `job` to peers in roster order. The first healthy, idle peer
/// that supports the job's current stage takes it.
pub fn delegate(
    job: Job,
    origin: &AgentId,
    peers: &[Arc<dyn Schedulable>],
    metrics: &Metrics,
) -> DelegationOutcome {
    let id = job.id.clone();
    let stage = job.current_stage();
    let carried_ticks = job.remaining_ticks();

    let mut job = job;
    for peer in peers {
        if peer.id() == origin || peer.is_failed() || !peer.is_idle() || !peer.can_handle(stage) {
            continue;
        }
        // The checks above can go stale; the peer re-checks under its lock.
        match peer.try_acquire_job(job) {
            Ok(()) => {
                metrics.jobs_delegated.incr();
                tracing::info!(
                    job = %id,
                    from = %origin,
                    to = %peer.id(),
                    %stage,
                    carried_ticks,
                    "Job delegated"
                );
                return DelegationOutcome::Delegated {
                    job: id,
                    to: peer.id().clone(),
                    stage,
                    carried_ticks,
                };
            }
            Err(returned) => job = returned,
        }
    }

    metrics.jobs_lost.incr();
    tracing::warn!(job = %id, from = %origin, %stage, "No compatible idle peer, job lost");
    DelegationOutcome::Lost { job: id, stage }
}

// ---------------------------------------------------------------------------
// Deferred delegation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Orphan {
    origin: AgentId,
    job: Job,
    failed_at: Tick,
}

/// Jobs taken off failed machines during the current tick.
#[derive(Debug, Clone, Default)]
pub struct DelegationQueue {
    orphans: Arc<Mutex<Vec<Orphan>>>,
}

impl DelegationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Orphan>> {
        self.orphans.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, origin: AgentId, job: Job, failed_at: Tick) {
        tracing::debug!(job = %job.id, origin = %origin, tick = failed_at, "Job parked for delegation");
        self.lock().push(Orphan { origin, job, failed_at });
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Delegate every parked job to the machines registered in `env`.
    /// Orphans are handled in roster order of their failed machine, so the
    /// outcome does not depend on which agent task failed first.
    pub fn dispatch(&self, env: &Environment) -> Vec<DelegationOutcome> {
        let mut orphans = std::mem::take(&mut *self.lock());
        if orphans.is_empty() {
            return Vec::new();
        }
        let roster = env.machines();
        let rank = |origin: &AgentId| {
            roster
                .iter()
                .position(|m| m.id() == origin)
                .unwrap_or(usize::MAX)
        };
        orphans.sort_by_key(|o| (rank(&o.origin), o.failed_at, o.job.id.clone()));
        orphans
            .into_iter()
            .map(|orphan| delegate(orphan.job, &orphan.origin, &roster, env.metrics()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Failure
// ---------------------------------------------------------------------------

/// Result of taking a healthy machine down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureOutcome {
    /// Job parked for delegation; `None` when the machine was idle.
    pub orphaned: Option<JobId>,
}

/// Take `machine` down: count the failure, park whatever it was running on
/// `delegations` and notify maintenance. Returns `None` if it was already
/// down.
pub fn handle_failure(
    machine: &Machine,
    env: &Environment,
    maintenance: &MaintenanceHandle,
    delegations: &DelegationQueue,
    now: Tick,
) -> Option<FailureOutcome> {
    let FailureTransition::Failed { running } = machine.fail() else {
        return None;
    };

    env.metrics().machine_failures.incr();
    tracing::warn!(
        machine = %machine.id(),
        tick = now,
        running = ?running.as_ref().map(|job| job.id.to_string()),
        "Machine failed"
    );

    let orphaned = running.map(|job| {
        let id = job.id.clone();
        delegations.push(machine.id().clone(), job, now);
        id
    });
    maintenance.notify(machine.id().clone(), now);
    Some(FailureOutcome { orphaned })
}
