use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::identity::AgentId;
use crate::types::{Batch, Stage, Tick};

/// Job identifier: the machine that created the job plus that machine's
/// monotonically increasing sequence number.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId {
    pub origin: AgentId,
    pub seq: u64,
}

impl JobId {
    pub fn new(origin: AgentId, seq: u64) -> Self {
        Self { origin, seq }
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.origin, self.seq)
    }
}

/// Outcome of advancing a job by one stage-tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobProgress {
    /// Still in `stage`, `remaining` ticks left.
    Working { stage: Stage, remaining: u32 },
    /// Finished `from`, now in `to`.
    StageAdvanced { from: Stage, to: Stage },
    /// Last stage finished.
    Completed,
}

/// A multi-stage production job.
///
/// `remaining_ticks == 0` on a job that is not completed means the current
/// stage has not started yet (the job is still queued).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    stages: Vec<Stage>,
    stage_index: usize,
    remaining_ticks: u32,
    completed: bool,
    /// Materials consumed to create the job.
    pub batch: Batch,
    pub created_at: Tick,
}

impl Job {
    pub fn new(
        id: JobId,
        stages: Vec<Stage>,
        batch: Batch,
        created_at: Tick,
    ) -> Result<Self, ProtocolError> {
        if stages.is_empty() {
            return Err(ProtocolError::EmptyPipeline);
        }
        Ok(Self {
            id,
            stages,
            stage_index: 0,
            remaining_ticks: 0,
            completed: false,
            batch,
            created_at,
        })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage_index(&self) -> usize {
        self.stage_index
    }

    pub fn current_stage(&self) -> Stage {
        self.stages[self.stage_index]
    }

    pub fn remaining_ticks(&self) -> u32 {
        self.remaining_ticks
    }

    pub fn is_started(&self) -> bool {
        self.remaining_ticks > 0 || self.completed
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Start the current stage with the given duration if it has not
    /// started yet. A zero duration is treated as one tick.
    pub fn start(&mut self, duration: u32) {
        if !self.is_started() {
            self.remaining_ticks = duration.max(1);
        }
    }

    /// Consume one stage-tick. When the current stage runs out the job moves
    /// to the next stage, whose duration is looked up through
    /// `next_duration`. Completion is terminal: further calls change nothing.
    pub fn advance(&mut self, next_duration: impl FnOnce(Stage) -> u32) -> JobProgress {
        if self.completed {
            return JobProgress::Completed;
        }

        self.remaining_ticks = self.remaining_ticks.saturating_sub(1);
        if self.remaining_ticks > 0 {
            return JobProgress::Working {
                stage: self.current_stage(),
                remaining: self.remaining_ticks,
            };
        }

        let from = self.current_stage();
        if self.stage_index + 1 < self.stages.len() {
            self.stage_index += 1;
            let to = self.current_stage();
            self.remaining_ticks = next_duration(to).max(1);
            JobProgress::StageAdvanced { from, to }
        } else {
            self.completed = true;
            JobProgress::Completed
        }
    }

    /// Move the job onto another machine's pipeline template, positioned at
    /// the same stage name. Remaining ticks are carried over unchanged.
    pub fn rebase(&mut self, template: &[Stage]) -> Result<(), ProtocolError> {
        let stage = self.current_stage();
        let index = template
            .iter()
            .position(|s| *s == stage)
            .ok_or(ProtocolError::StageNotInPipeline(stage))?;
        self.stages = template.to_vec();
        self.stage_index = index;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_job(stages: Vec<Stage>) -> Job {
        Job::new(
            JobId::new(AgentId::new("m1".into()), 1),
            stages,
            Batch::new(10, 5, 3),
            0,
        )
        .unwrap()
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        let result = Job::new(JobId::new("m1".into(), 1), vec![], Batch::default(), 0);
        assert_eq!(result.unwrap_err(), ProtocolError::EmptyPipeline);
    }

    #[test]
    fn test_stage_ticks_and_completion() {
        let mut job = make_job(vec![Stage::Mixing, Stage::Baking]);
        assert!(!job.is_started());
        job.start(2);

        assert_eq!(
            job.advance(|_| 3),
            JobProgress::Working { stage: Stage::Mixing, remaining: 1 }
        );
        assert_eq!(
            job.advance(|_| 3),
            JobProgress::StageAdvanced { from: Stage::Mixing, to: Stage::Baking }
        );
        assert_eq!(job.remaining_ticks(), 3);
        job.advance(|_| 3);
        job.advance(|_| 3);
        assert_eq!(job.advance(|_| 3), JobProgress::Completed);
        assert!(job.is_completed());

        // Terminal: nothing moves any more.
        let before = job.clone();
        assert_eq!(job.advance(|_| 3), JobProgress::Completed);
        assert_eq!(job, before);
    }

    #[test]
    fn test_stage_index_never_exceeds_last_stage() {
        let mut job = make_job(vec![Stage::Cutting, Stage::Mixing, Stage::Baking]);
        job.start(1);
        let mut last_index = 0;
        for _ in 0..20 {
            job.advance(|_| 1);
            assert!(job.stage_index() >= last_index);
            assert!(job.stage_index() < job.stages().len());
            last_index = job.stage_index();
        }
        assert!(job.is_completed());
    }

    #[test]
    fn test_rebase_keeps_stage_and_remaining_ticks() {
        let mut job = make_job(vec![Stage::Cutting, Stage::Mixing, Stage::Baking]);
        job.start(1);
        job.advance(|_| 4); // now in mixing, 4 ticks
        job.advance(|_| 4); // 3 left
        job.rebase(&[Stage::Mixing, Stage::Baking, Stage::Packaging]).unwrap();

        assert_eq!(job.current_stage(), Stage::Mixing);
        assert_eq!(job.stage_index(), 0);
        assert_eq!(job.remaining_ticks(), 3);
        assert_eq!(job.stages().last(), Some(&Stage::Packaging));
    }

    #[test]
    fn test_rebase_onto_incompatible_template_fails() {
        let mut job = make_job(vec![Stage::Cutting]);
        let err = job.rebase(&[Stage::Baking]).unwrap_err();
        assert_eq!(err, ProtocolError::StageNotInPipeline(Stage::Cutting));
        assert_eq!(job.stages(), &[Stage::Cutting]);
    }
}
