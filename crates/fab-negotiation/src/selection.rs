//! Winner selection.
//!
//! One policy for every round in the system, nested transport rounds
//! included: shortest `lead_time` wins, then lowest `cost`, then the
//! lexicographically smallest participant id so equal offers resolve the
//! same way on every run.

use serde::{Deserialize, Serialize};

use fab_protocol::AgentId;

/// A PROPOSE received by an initiator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub participant: AgentId,
    /// Ticks until delivery, as quoted. Compared first.
    pub lead_time: u32,
    /// Compared second; the participant id breaks remaining ties.
    pub cost: u32,
}

impl Proposal {
    fn rank(&self) -> (u32, u32, &AgentId) {
        (self.lead_time, self.cost, &self.participant)
    }
}

/// The winner and everyone else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub winner: Proposal,
    pub losers: Vec<Proposal>,
}

pub fn select_winner(proposals: &[Proposal]) -> Option<&Proposal> {
    proposals.iter().min_by(|a, b| a.rank().cmp(&b.rank()))
}

/// Split proposals into the winner and the losers (in arrival order).
pub fn split_winner(proposals: Vec<Proposal>) -> Option<Selection> {
    let index = proposals
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| a.rank().cmp(&b.rank()))
        .map(|(i, _)| i)?;

    let mut losers = proposals;
    let winner = losers.remove(index);
    Some(Selection { winner, losers })
}
