//! Per-machine job pipeline.
//!
//! `queued -> running(stage_i) -> ... -> completed`. Each round an idle
//! machine admits its queue head, and the current job consumes one
//! stage-tick.

use std::collections::VecDeque;

use fab_protocol::{Job, JobId, JobProgress, Stage, Tick};
use fab_state::{Metrics, Schedulable};

use crate::machine::Machine;

/// FIFO queue plus the single running slot.
#[derive(Debug, Default, Clone)]
pub struct JobPipeline {
    queue: VecDeque<Job>,
    current: Option<Job>,
}

impl JobPipeline {
    pub fn enqueue(&mut self, job: Job) {
        self.queue.push_back(job);
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_none()
    }

    pub fn current(&self) -> Option<&Job> {
        self.current.as_ref()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Current job first, then the queue in order.
    pub fn job_ids(&self) -> Vec<JobId> {
        self.current
            .iter()
            .chain(self.queue.iter())
            .map(|job| job.id.clone())
            .collect()
    }

    pub fn holds(&self, id: &JobId) -> bool {
        self.current.as_ref().is_some_and(|job| job.id == *id)
            || self.queue.iter().any(|job| job.id == *id)
    }

    /// Install `job` as the running job. Any queued copy is dropped so the
    /// id is held once.
    pub fn install(&mut self, job: Job) {
        self.remove_queued(&job.id);
        self.current = Some(job);
    }

    /// Clear the running slot and any queued job with the same id.
    pub fn take_current(&mut self) -> Option<Job> {
        let job = self.current.take()?;
        self.remove_queued(&job.id);
        Some(job)
    }

    fn remove_queued(&mut self, id: &JobId) {
        self.queue.retain(|queued| queued.id != *id);
    }

    /// Move the queue head into the running slot when idle, starting its
    /// first stage.
    pub fn admit(&mut self, duration: impl Fn(Stage) -> u32) -> Option<JobId> {
        if self.current.is_some() {
            return None;
        }
        let mut job = self.queue.pop_front()?;
        job.start(duration(job.current_stage()));
        let id = job.id.clone();
        self.current = Some(job);
        Some(id)
    }

    /// One stage-tick for the running job. A completed job leaves the slot.
    pub fn advance(&mut self, duration: impl Fn(Stage) -> u32) -> Option<(JobId, JobProgress)> {
        let job = self.current.as_mut()?;
        let progress = job.advance(&duration);
        let id = job.id.clone();
        if progress == JobProgress::Completed {
            self.current = None;
        }
        Some((id, progress))
    }
}

/// What one pipeline round did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStep {
    pub admitted: Option<JobId>,
    pub progress: Option<(JobId, JobProgress)>,
}

/// Run one pipeline round on a machine. A failed machine does nothing.
pub fn run_round(machine: &Machine, metrics: &Metrics, now: Tick) -> PipelineStep {
    let step = machine.with_pipeline(|pipeline| {
        let admitted = pipeline.admit(|stage| machine.duration(stage));
        let progress = pipeline.advance(|stage| machine.duration(stage));
        PipelineStep { admitted, progress }
    });
    let Some(step) = step else {
        return PipelineStep::default();
    };

    if let Some(id) = &step.admitted {
        tracing::debug!(machine = %machine.id(), job = %id, tick = now, "Job admitted");
    }
    match &step.progress {
        Some((id, JobProgress::StageAdvanced { from, to })) => {
            tracing::debug!(machine = %machine.id(), job = %id, %from, %to, "Stage finished");
        }
        Some((id, JobProgress::Completed)) => {
            metrics.jobs_completed.incr();
            tracing::info!(machine = %machine.id(), job = %id, tick = now, "Job completed");
        }
        _ => {}
    }
    step
}

#[cfg(test)]
mod tests {
    use super::*;
    use fab_protocol::{AgentId, Batch};

    fn job(seq: u64, stages: Vec<Stage>) -> Job {
        Job::new(JobId::new(AgentId::new("m1".into()), seq), stages, Batch::default(), 0).unwrap()
    }

    fn two_ticks(_: Stage) -> u32 {
        2
    }

    #[test]
    fn test_admit_only_when_idle() {
        let mut pipeline = JobPipeline::default();
        pipeline.enqueue(job(1, vec![Stage::Mixing]));
        pipeline.enqueue(job(2, vec![Stage::Mixing]));

        assert_eq!(pipeline.admit(two_ticks).unwrap().seq, 1);
        assert!(pipeline.admit(two_ticks).is_none());
        assert_eq!(pipeline.current().unwrap().remaining_ticks(), 2);
        assert_eq!(pipeline.queue_len(), 1);
    }

    #[test]
    fn test_progress_is_monotonic_and_completion_frees_slot() {
        let mut pipeline = JobPipeline::default();
        pipeline.enqueue(job(1, vec![Stage::Mixing, Stage::Baking]));
        pipeline.admit(two_ticks);

        let mut last_index = 0;
        let mut completed = 0;
        for _ in 0..10 {
            if let Some(current) = pipeline.current() {
                assert!(current.stage_index() >= last_index);
                assert!(current.stage_index() < current.stages().len());
                last_index = current.stage_index();
            }
            if let Some((_, JobProgress::Completed)) = pipeline.advance(two_ticks) {
                completed += 1;
            }
        }
        assert_eq!(completed, 1);
        assert!(pipeline.is_idle());
    }

    #[test]
    fn test_install_dedupes_queue() {
        let mut pipeline = JobPipeline::default();
        let j = job(1, vec![Stage::Baking]);
        pipeline.enqueue(j.clone());
        pipeline.install(j);
        assert_eq!(pipeline.job_ids().len(), 1);
        assert!(pipeline.take_current().is_some());
        assert!(pipeline.job_ids().is_empty());
    }
}
