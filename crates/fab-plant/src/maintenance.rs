//! Maintenance scheduler.
//!
//! Failed machines report through a [`MaintenanceHandle`]. The scheduler
//! keeps them in FIFO order and starts at most one repair per round, with a
//! random duration drawn from the [`RepairPolicy`] range. The countdown
//! itself is run by the environment clock.

use std::collections::VecDeque;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

use fab_protocol::{AgentId, Tick, DEFAULT_REPAIR_TICKS_MAX, DEFAULT_REPAIR_TICKS_MIN};
use fab_state::Environment;

use crate::PlantError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureNotice {
    pub machine: AgentId,
    pub at: Tick,
}

/// Sending side given to every machine agent.
#[derive(Debug, Clone)]
pub struct MaintenanceHandle {
    tx: mpsc::UnboundedSender<FailureNotice>,
}

impl MaintenanceHandle {
    pub fn notify(&self, machine: AgentId, at: Tick) {
        if self.tx.send(FailureNotice { machine: machine.clone(), at }).is_err() {
            tracing::warn!(machine = %machine, "Maintenance scheduler gone, failure not reported");
        }
    }
}

/// Inclusive bounds of a repair duration, in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairPolicy {
    pub min_ticks: u32,
    pub max_ticks: u32,
}

impl Default for RepairPolicy {
    fn default() -> Self {
        Self {
            min_ticks: DEFAULT_REPAIR_TICKS_MIN,
            max_ticks: DEFAULT_REPAIR_TICKS_MAX,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairAssignment {
    pub machine: AgentId,
    pub ticks: u32,
    pub at: Tick,
}

pub struct MaintenanceScheduler {
    id: AgentId,
    rx: mpsc::UnboundedReceiver<FailureNotice>,
    held: Vec<FailureNotice>,
    queue: VecDeque<AgentId>,
    policy: RepairPolicy,
    rng: StdRng,
    env: Arc<Environment>,
}

impl MaintenanceScheduler {
    pub fn new(
        id: AgentId,
        policy: RepairPolicy,
        seed: Option<u64>,
        env: Arc<Environment>,
    ) -> Result<(Self, MaintenanceHandle), PlantError> {
        if policy.min_ticks == 0 || policy.min_ticks > policy.max_ticks {
            return Err(PlantError::InvalidRepairRange {
                min: policy.min_ticks,
                max: policy.max_ticks,
            });
        }
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            id,
            rx,
            held: Vec::new(),
            queue: VecDeque::new(),
            policy,
            rng,
            env,
        };
        Ok((scheduler, MaintenanceHandle { tx }))
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    /// Machines waiting for a repair slot, oldest first.
    pub fn queued(&self) -> Vec<AgentId> {
        self.queue.iter().cloned().collect()
    }

    /// Queue a failed machine. Ignored if it is already queued, already
    /// under repair, or not failed at all.
    pub fn enqueue(&mut self, machine: AgentId) -> bool {
        if self.queue.contains(&machine) {
            tracing::debug!(machine = %machine, "Duplicate failure notice, already queued");
            return false;
        }
        let Some(target) = self.env.machine(&machine) else {
            tracing::warn!(machine = %machine, "Failure notice for unknown machine");
            return false;
        };
        if target.repair_ticks_remaining() > 0 {
            tracing::debug!(machine = %machine, "Duplicate failure notice, repair under way");
            return false;
        }
        if !target.is_failed() {
            return false;
        }
        tracing::info!(machine = %machine, queue_len = self.queue.len() + 1, "Machine queued for repair");
        self.queue.push_back(machine);
        true
    }

    /// One scheduling round: take in notices sent before `now`, then start
    /// at most one repair.
    pub fn on_round(&mut self, now: Tick) -> Option<RepairAssignment> {
        while let Ok(notice) = self.rx.try_recv() {
            self.held.push(notice);
        }
        let (ready, later): (Vec<_>, Vec<_>) = std::mem::take(&mut self.held)
            .into_iter()
            .partition(|notice| notice.at < now);
        self.held = later;

        let mut ready = ready;
        ready.sort_by(|a, b| (a.at, &a.machine).cmp(&(b.at, &b.machine)));
        for notice in ready {
            self.enqueue(notice.machine);
        }

        while let Some(machine) = self.queue.pop_front() {
            let Some(target) = self.env.machine(&machine) else {
                continue;
            };
            let ticks = self.rng.gen_range(self.policy.min_ticks..=self.policy.max_ticks);
            if !target.begin_repair(ticks) {
                continue;
            }
            self.env.metrics().repairs_started.incr();
            tracing::info!(
                scheduler = %self.id,
                machine = %machine,
                ticks,
                tick = now,
                "Repair started"
            );
            return Some(RepairAssignment { machine, ticks, at: now });
        }
        None
    }
}
