//! Machine cell.
//!
//! All mutable state of a machine (job slots, failure flag, repair
//! countdown, pending external fault, job sequence) sits behind one mutex.
//! The checks in [`Schedulable::try_acquire_job`] and the assignment happen
//! under that lock, so a delegated job can never land on two machines.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use fab_protocol::{pipeline_for, AgentId, Batch, Job, JobId, Stage, Tick};
use fab_state::{RepairTick, Schedulable};

use crate::pipeline::JobPipeline;
use crate::{PlantError, DEFAULT_STAGE_TICKS};

/// Static description of a machine.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineSpec {
    pub id: AgentId,
    /// Stages the machine can run; jobs follow them in canonical order.
    pub capabilities: BTreeSet<Stage>,
    /// Ticks per stage. Stages left out use [`DEFAULT_STAGE_TICKS`].
    pub durations: BTreeMap<Stage, u32>,
    /// Probability of failing in any given round.
    pub failure_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureTransition {
    AlreadyFailed,
    /// The machine went down; `running` is the job it was working on.
    Failed { running: Option<Job> },
}

/// Point-in-time view of a machine for reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineStatus {
    pub id: AgentId,
    pub failed: bool,
    /// 0 while failed means waiting for a repair slot.
    pub repair_ticks_remaining: u32,
    pub current_job: Option<JobId>,
    pub current_stage: Option<Stage>,
    pub stage_ticks_remaining: u32,
    /// Jobs waiting behind the current one.
    pub queued: usize,
}

#[derive(Debug, Default)]
struct MachineState {
    pipeline: JobPipeline,
    is_failed: bool,
    repair_ticks_remaining: u32,
    fault_pending: bool,
    next_seq: u64,
}

#[derive(Debug)]
pub struct Machine {
    id: AgentId,
    template: Vec<Stage>,
    durations: BTreeMap<Stage, u32>,
    failure_rate: f64,
    state: Mutex<MachineState>,
}

impl Machine {
    pub fn new(spec: MachineSpec) -> Result<Self, PlantError> {
        if spec.capabilities.is_empty() {
            return Err(PlantError::EmptyCapabilities(spec.id));
        }
        if !(0.0..=1.0).contains(&spec.failure_rate) {
            return Err(PlantError::InvalidFailureRate {
                machine: spec.id,
                rate: spec.failure_rate,
            });
        }

        let template = pipeline_for(&spec.capabilities);
        let mut durations = BTreeMap::new();
        for stage in &template {
            let ticks = spec.durations.get(stage).copied().unwrap_or(DEFAULT_STAGE_TICKS);
            if ticks == 0 {
                return Err(PlantError::ZeroDuration {
                    machine: spec.id,
                    stage: *stage,
                });
            }
            durations.insert(*stage, ticks);
        }

        Ok(Self {
            id: spec.id,
            template,
            durations,
            failure_rate: spec.failure_rate,
            state: Mutex::new(MachineState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MachineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn template(&self) -> &[Stage] {
        &self.template
    }

    pub fn failure_rate(&self) -> f64 {
        self.failure_rate
    }

    pub fn duration(&self, stage: Stage) -> u32 {
        self.durations.get(&stage).copied().unwrap_or(DEFAULT_STAGE_TICKS)
    }

    /// Create a job for a delivered batch and queue it. Ids are
    /// `<machine>#<seq>` with `seq` starting at 1.
    pub fn create_job(&self, batch: Batch, now: Tick) -> Result<JobId, PlantError> {
        let mut state = self.lock();
        let seq = state.next_seq + 1;
        let job = Job::new(JobId::new(self.id.clone(), seq), self.template.clone(), batch, now)?;
        state.next_seq = seq;
        let id = job.id.clone();
        state.pipeline.enqueue(job);
        Ok(id)
    }

    /// Run `f` on the pipeline unless the machine is failed.
    pub fn with_pipeline<R>(&self, f: impl FnOnce(&mut JobPipeline) -> R) -> Option<R> {
        let mut state = self.lock();
        if state.is_failed {
            return None;
        }
        Some(f(&mut state.pipeline))
    }

    pub fn queue_len(&self) -> usize {
        self.lock().pipeline.queue_len()
    }

    pub fn current_job(&self) -> Option<Job> {
        self.lock().pipeline.current().cloned()
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        self.lock().pipeline.job_ids()
    }

    pub fn holds(&self, id: &JobId) -> bool {
        self.lock().pipeline.holds(id)
    }

    pub fn status(&self) -> MachineStatus {
        let state = self.lock();
        let current = state.pipeline.current();
        MachineStatus {
            id: self.id.clone(),
            failed: state.is_failed,
            repair_ticks_remaining: state.repair_ticks_remaining,
            current_job: current.map(|job| job.id.clone()),
            current_stage: current.map(Job::current_stage),
            stage_ticks_remaining: current.map_or(0, Job::remaining_ticks),
            queued: state.pipeline.queue_len(),
        }
    }

    /// Consume an externally injected fault, if any.
    pub fn take_fault(&self) -> bool {
        std::mem::take(&mut self.lock().fault_pending)
    }

    /// Mark the machine failed and hand out its running job. Queued jobs
    /// stay queued until the repair finishes.
    pub fn fail(&self) -> FailureTransition {
        let mut state = self.lock();
        if state.is_failed {
            return FailureTransition::AlreadyFailed;
        }
        state.is_failed = true;
        state.fault_pending = false;
        let running = state.pipeline.take_current();
        FailureTransition::Failed { running }
    }
}

impl Schedulable for Machine {
    fn id(&self) -> &AgentId {
        &self.id
    }

    fn is_failed(&self) -> bool {
        self.lock().is_failed
    }

    fn is_idle(&self) -> bool {
        self.lock().pipeline.is_idle()
    }

    fn can_handle(&self, stage: Stage) -> bool {
        self.template.contains(&stage)
    }

    fn try_acquire_job(&self, mut job: Job) -> Result<(), Job> {
        let mut state = self.lock();
        if state.is_failed || state.fault_pending || !state.pipeline.is_idle() {
            return Err(job);
        }
        if job.rebase(&self.template).is_err() {
            return Err(job);
        }
        job.start(self.duration(job.current_stage()));
        state.pipeline.install(job);
        Ok(())
    }

    fn repair_ticks_remaining(&self) -> u32 {
        self.lock().repair_ticks_remaining
    }

    fn begin_repair(&self, ticks: u32) -> bool {
        let mut state = self.lock();
        if !state.is_failed || state.repair_ticks_remaining > 0 {
            return false;
        }
        state.repair_ticks_remaining = ticks.max(1);
        true
    }

    fn tick_repair(&self) -> RepairTick {
        let mut state = self.lock();
        if !state.is_failed {
            return RepairTick::Healthy;
        }
        if state.repair_ticks_remaining == 0 {
            return RepairTick::AwaitingRepair;
        }
        state.repair_ticks_remaining -= 1;
        if state.repair_ticks_remaining == 0 {
            state.is_failed = false;
            RepairTick::Repaired
        } else {
            RepairTick::InRepair {
                remaining: state.repair_ticks_remaining,
            }
        }
    }

    fn inject_fault(&self) -> bool {
        let mut state = self.lock();
        if state.is_failed || state.fault_pending {
            return false;
        }
        state.fault_pending = true;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str, stages: &[Stage]) -> MachineSpec {
        MachineSpec {
            id: AgentId::new(id.into()),
            capabilities: stages.iter().copied().collect(),
            durations: BTreeMap::new(),
            failure_rate: 0.0,
        }
    }

    #[test]
    fn test_template_follows_canonical_order() {
        let machine = Machine::new(spec("m1", &[Stage::Baking, Stage::Cutting])).unwrap();
        assert_eq!(machine.template(), &[Stage::Cutting, Stage::Baking]);
        assert_eq!(machine.duration(Stage::Baking), DEFAULT_STAGE_TICKS);
    }

    #[test]
    fn test_invalid_specs_rejected() {
        assert!(matches!(
            Machine::new(spec("m1", &[])),
            Err(PlantError::EmptyCapabilities(_))
        ));

        let mut zero = spec("m2", &[Stage::Mixing]);
        zero.durations.insert(Stage::Mixing, 0);
        assert!(matches!(Machine::new(zero), Err(PlantError::ZeroDuration { .. })));

        let mut flaky = spec("m3", &[Stage::Mixing]);
        flaky.failure_rate = 1.5;
        assert!(matches!(
            Machine::new(flaky),
            Err(PlantError::InvalidFailureRate { .. })
        ));
    }

    #[test]
    fn test_job_ids_unique_and_monotonic() {
        let machine = Machine::new(spec("m1", &[Stage::Mixing])).unwrap();
        let ids: Vec<JobId> = (0..3)
            .map(|t| machine.create_job(Batch::default(), t).unwrap())
            .collect();
        let seqs: Vec<u64> = ids.iter().map(|id| id.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(ids[0].to_string(), "m1#1");
    }

    #[test]
    fn test_fail_is_idempotent() {
        let machine = Machine::new(spec("m1", &[Stage::Mixing])).unwrap();
        assert!(matches!(machine.fail(), FailureTransition::Failed { running: None }));
        assert_eq!(machine.fail(), FailureTransition::AlreadyFailed);
    }

    #[test]
    fn test_failed_machine_refuses_jobs() {
        let machine = Machine::new(spec("m1", &[Stage::Mixing])).unwrap();
        let job = Job::new(
            JobId::new(AgentId::new("m9".into()), 1),
            vec![Stage::Mixing],
            Batch::default(),
            0,
        )
        .unwrap();
        machine.fail();
        assert!(machine.try_acquire_job(job).is_err());
        assert!(machine.with_pipeline(|_| ()).is_none());
    }

    #[test]
    fn test_incapable_machine_returns_job() {
        let machine = Machine::new(spec("m1", &[Stage::Packaging])).unwrap();
        let job = Job::new(
            JobId::new(AgentId::new("m9".into()), 1),
            vec![Stage::Mixing],
            Batch::default(),
            0,
        )
        .unwrap();
        let returned = machine.try_acquire_job(job.clone()).unwrap_err();
        assert_eq!(returned, job);
        assert!(machine.is_idle());
    }

    #[test]
    fn test_repair_countdown() {
        let machine = Machine::new(spec("m1", &[Stage::Mixing])).unwrap();
        assert!(!machine.begin_repair(2), "healthy machine needs no repair");
        machine.fail();
        assert_eq!(machine.tick_repair(), RepairTick::AwaitingRepair);
        assert!(machine.begin_repair(2));
        assert!(!machine.begin_repair(5), "already counting down");
        assert_eq!(machine.tick_repair(), RepairTick::InRepair { remaining: 1 });
        assert_eq!(machine.tick_repair(), RepairTick::Repaired);
        assert!(!machine.is_failed());
        assert_eq!(machine.tick_repair(), RepairTick::Healthy);
    }
}
