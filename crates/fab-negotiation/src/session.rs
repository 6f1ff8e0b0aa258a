//! Initiator side of a Contract-Net round.
//!
//! Lifecycle:
//! 1. `open()` - broadcast the CFP, start collecting
//! 2. `handle()` - record PROPOSE/REFUSE replies; awards early once every
//!    invited participant has answered
//! 3. `poll()` - on the CFP deadline award (or abandon with no proposals);
//!    on the INFORM deadline abandon
//!
//! A nested round may carry a hard `cutoff` inherited from its own
//! initiator: the INFORM deadline never extends past it, and a round still
//! collecting when it arrives is abandoned.
//! 4. `handle()` - the winner's INFORM completes the round, a REFUSE from
//!    the winner abandons it

use std::collections::BTreeSet;

use fab_protocol::{
    AgentId, Award, Envelope, Payload, RefuseReason, Report, Request, Tick,
    DEFAULT_CFP_TIMEOUT_TICKS, DEFAULT_INFORM_TIMEOUT_TICKS, PROTOCOL_CNP,
};

use crate::selection::{split_winner, Proposal};
use crate::NegotiationError;

// ---------------------------------------------------------------------------
// Round state
// ---------------------------------------------------------------------------

/// Deadlines of a round, in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    /// Ticks after the CFP during which replies are collected.
    pub cfp_timeout: u64,
    /// Ticks after the award during which the winner may INFORM.
    pub inform_timeout: u64,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            cfp_timeout: DEFAULT_CFP_TIMEOUT_TICKS,
            inform_timeout: DEFAULT_INFORM_TIMEOUT_TICKS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Collecting PROPOSE/REFUSE until the CFP deadline.
    Collecting,
    /// ACCEPT sent; waiting for the winner's INFORM.
    AwaitingInform,
    /// INFORM received.
    Completed,
    /// Round failed; nothing was committed by the initiator.
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbandonReason {
    /// Every participant refused or stayed silent.
    NoProposals,
    /// The winner never sent INFORM.
    InformTimeout,
    /// The winner declined after ACCEPT.
    WinnerRefused(RefuseReason),
    /// The inherited cutoff passed before a winner was chosen.
    CutoffReached,
}

impl std::fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoProposals => write!(f, "no proposals"),
            Self::InformTimeout => write!(f, "inform timeout"),
            Self::WinnerRefused(reason) => write!(f, "winner refused ({reason})"),
            Self::CutoffReached => write!(f, "cutoff reached"),
        }
    }
}

/// What applying a message or a deadline did to the round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Reply stored; still collecting.
    Recorded,
    /// Winner chosen. `envelopes` holds one ACCEPT and a REJECT per losing
    /// proposer, all on the round's token.
    Awarded {
        winner: Proposal,
        envelopes: Vec<Envelope>,
    },
    /// The winner confirmed.
    Informed { winner: AgentId, report: Report },
    Abandoned { reason: AbandonReason },
}

/// One negotiation round owned by its initiator.
#[derive(Debug, Clone)]
pub struct CfpSession {
    token: String,
    initiator: AgentId,
    request: Request,
    phase: SessionPhase,
    invited: Vec<AgentId>,
    outstanding: BTreeSet<AgentId>,
    proposals: Vec<Proposal>,
    refusals: Vec<(AgentId, RefuseReason)>,
    opened_at: Tick,
    cfp_deadline: Tick,
    inform_timeout: u64,
    inform_deadline: Option<Tick>,
    cutoff: Option<Tick>,
    winner: Option<Proposal>,
}

// ---------------------------------------------------------------------------
// Initiator state machine
// ---------------------------------------------------------------------------

impl CfpSession {
    /// Open a round and build the CFP broadcast.
    pub fn open(
        initiator: AgentId,
        token: String,
        request: Request,
        participants: &[AgentId],
        now: Tick,
        timeouts: SessionTimeouts,
    ) -> Result<(Self, Vec<Envelope>), NegotiationError> {
        let outstanding: BTreeSet<AgentId> = participants.iter().cloned().collect();
        if outstanding.is_empty() {
            return Err(NegotiationError::NoParticipants(token));
        }

        let envelopes = outstanding
            .iter()
            .map(|to| {
                Envelope::new(
                    initiator.clone(),
                    to.clone(),
                    Some(token.clone()),
                    now,
                    Payload::Cfp(request.clone()),
                )
            })
            .collect();

        tracing::debug!(
            token = %token,
            initiator = %initiator,
            participants = outstanding.len(),
            "CFP round opened"
        );

        let session = Self {
            token,
            initiator,
            request,
            phase: SessionPhase::Collecting,
            invited: outstanding.iter().cloned().collect(),
            outstanding,
            proposals: Vec::new(),
            refusals: Vec::new(),
            opened_at: now,
            cfp_deadline: now + timeouts.cfp_timeout,
            inform_timeout: timeouts.inform_timeout,
            inform_deadline: None,
            cutoff: None,
            winner: None,
        };
        Ok((session, envelopes))
    }

    /// Bound the round by `cutoff`: the winner must INFORM before it.
    pub fn with_cutoff(mut self, cutoff: Tick) -> Self {
        self.cutoff = Some(cutoff);
        self
    }

    /// Apply an incoming reply.
    pub fn handle(&mut self, envelope: &Envelope, now: Tick) -> Result<SessionEvent, NegotiationError> {
        envelope.ensure_protocol(PROTOCOL_CNP)?;
        let token = envelope.token()?;
        if token != self.token {
            return Err(NegotiationError::TokenMismatch {
                expected: self.token.clone(),
                got: token.to_string(),
            });
        }

        match self.phase {
            SessionPhase::Collecting => self.handle_reply(envelope, now),
            SessionPhase::AwaitingInform => self.handle_winner_message(envelope),
            SessionPhase::Completed | SessionPhase::Abandoned => {
                Err(NegotiationError::SessionClosed(self.token.clone()))
            }
        }
    }

    fn handle_reply(&mut self, envelope: &Envelope, now: Tick) -> Result<SessionEvent, NegotiationError> {
        if now > self.cfp_deadline {
            return Err(NegotiationError::DeadlinePassed {
                token: self.token.clone(),
                deadline: self.cfp_deadline,
                now,
            });
        }

        let sender = &envelope.from;
        match &envelope.payload {
            Payload::Propose(_) | Payload::Refuse(_) => {
                if !self.outstanding.remove(sender) {
                    return Err(NegotiationError::NotOutstanding {
                        token: self.token.clone(),
                        participant: sender.to_string(),
                    });
                }
            }
            _ => {
                return Err(NegotiationError::UnexpectedPerformative {
                    context: format!("round {} while collecting", self.token),
                    performative: envelope.performative(),
                })
            }
        }

        match &envelope.payload {
            Payload::Propose(offer) => {
                self.proposals.push(Proposal {
                    participant: sender.clone(),
                    lead_time: offer.lead_time,
                    cost: offer.cost,
                });
                tracing::debug!(
                    token = %self.token,
                    participant = %sender,
                    lead_time = offer.lead_time,
                    cost = offer.cost,
                    "PROPOSE recorded"
                );
            }
            Payload::Refuse(reason) => {
                tracing::debug!(
                    token = %self.token,
                    participant = %sender,
                    reason = %reason,
                    "REFUSE recorded"
                );
                self.refusals.push((sender.clone(), reason.clone()));
            }
            _ => {}
        }

        if self.outstanding.is_empty() {
            return Ok(self.award(now));
        }
        Ok(SessionEvent::Recorded)
    }

    fn handle_winner_message(&mut self, envelope: &Envelope) -> Result<SessionEvent, NegotiationError> {
        let winner = match &self.winner {
            Some(w) if w.participant == envelope.from => w.participant.clone(),
            _ => {
                return Err(NegotiationError::UnexpectedSender {
                    token: self.token.clone(),
                    sender: envelope.from.to_string(),
                })
            }
        };

        match &envelope.payload {
            Payload::Inform(report) => {
                self.phase = SessionPhase::Completed;
                Ok(SessionEvent::Informed {
                    winner,
                    report: report.clone(),
                })
            }
            Payload::Refuse(reason) => {
                self.phase = SessionPhase::Abandoned;
                Ok(SessionEvent::Abandoned {
                    reason: AbandonReason::WinnerRefused(reason.clone()),
                })
            }
            _ => Err(NegotiationError::UnexpectedPerformative {
                context: format!("round {} while awaiting inform", self.token),
                performative: envelope.performative(),
            }),
        }
    }

    /// Apply deadlines. Call once per round after the inbox was handled.
    pub fn poll(&mut self, now: Tick) -> Option<SessionEvent> {
        match self.phase {
            SessionPhase::Collecting if self.cutoff_reached(now) => {
                Some(self.abandon(AbandonReason::CutoffReached))
            }
            SessionPhase::Collecting if now >= self.cfp_deadline => Some(self.award(now)),
            SessionPhase::AwaitingInform
                if self.inform_deadline.is_some_and(|deadline| now >= deadline) =>
            {
                self.phase = SessionPhase::Abandoned;
                Some(SessionEvent::Abandoned {
                    reason: AbandonReason::InformTimeout,
                })
            }
            _ => None,
        }
    }

    fn cutoff_reached(&self, now: Tick) -> bool {
        self.cutoff.is_some_and(|cutoff| now >= cutoff)
    }

    fn abandon(&mut self, reason: AbandonReason) -> SessionEvent {
        self.phase = SessionPhase::Abandoned;
        SessionEvent::Abandoned { reason }
    }

    /// Close collection: pick a winner, ACCEPT it and REJECT the other
    /// proposers. With no proposals, or past the cutoff, the round is
    /// abandoned.
    fn award(&mut self, now: Tick) -> SessionEvent {
        if self.cutoff_reached(now) {
            return self.abandon(AbandonReason::CutoffReached);
        }
        let Some(selection) = split_winner(self.proposals.clone()) else {
            return self.abandon(AbandonReason::NoProposals);
        };
        let reply_by = match self.cutoff {
            Some(cutoff) => cutoff.min(now + self.inform_timeout),
            None => now + self.inform_timeout,
        };

        let mut envelopes: Vec<Envelope> = selection
            .losers
            .iter()
            .map(|loser| {
                Envelope::new(
                    self.initiator.clone(),
                    loser.participant.clone(),
                    Some(self.token.clone()),
                    now,
                    Payload::RejectProposal,
                )
            })
            .collect();
        envelopes.push(Envelope::new(
            self.initiator.clone(),
            selection.winner.participant.clone(),
            Some(self.token.clone()),
            now,
            Payload::AcceptProposal(Award {
                request: self.request.clone(),
                reply_by,
            }),
        ));

        self.phase = SessionPhase::AwaitingInform;
        self.inform_deadline = Some(reply_by);
        self.winner = Some(selection.winner.clone());

        SessionEvent::Awarded {
            winner: selection.winner,
            envelopes,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn initiator(&self) -> &AgentId {
        &self.initiator
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn invited(&self) -> &[AgentId] {
        &self.invited
    }

    pub fn proposals(&self) -> &[Proposal] {
        &self.proposals
    }

    pub fn refusals(&self) -> &[(AgentId, RefuseReason)] {
        &self.refusals
    }

    pub fn winner(&self) -> Option<&Proposal> {
        self.winner.as_ref()
    }

    pub fn opened_at(&self) -> Tick {
        self.opened_at
    }

    pub fn cfp_deadline(&self) -> Tick {
        self.cfp_deadline
    }

    pub fn inform_deadline(&self) -> Option<Tick> {
        self.inform_deadline
    }

    pub fn cutoff(&self) -> Option<Tick> {
        self.cutoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fab_protocol::{Batch, Offer, Performative};

    const TOKEN: &str = "cnp-machine-1-1";

    fn id(s: &str) -> AgentId {
        AgentId::new(s.into())
    }

    fn open_round(participants: &[&str]) -> (CfpSession, Vec<Envelope>) {
        let ids: Vec<AgentId> = participants.iter().map(|p| id(p)).collect();
        CfpSession::open(
            id("machine"),
            TOKEN.into(),
            Request::Materials { batch: Batch::new(10, 5, 3) },
            &ids,
            1,
            SessionTimeouts { cfp_timeout: 3, inform_timeout: 10 },
        )
        .unwrap()
    }

    fn reply(from: &str, token: &str, sent_at: Tick, payload: Payload) -> Envelope {
        Envelope::new(id(from), id("machine"), Some(token.into()), sent_at, payload)
    }

    fn propose(from: &str, lead_time: u32, cost: u32) -> Envelope {
        reply(from, TOKEN, 2, Payload::Propose(Offer { lead_time, cost }))
    }

    #[test]
    fn test_open_broadcasts_cfp_with_token() {
        let (session, cfps) = open_round(&["supplierA", "supplierB"]);
        assert_eq!(session.phase(), SessionPhase::Collecting);
        assert_eq!(session.cfp_deadline(), 4);
        assert_eq!(cfps.len(), 2);
        for cfp in &cfps {
            assert_eq!(cfp.performative(), Performative::Cfp);
            assert_eq!(cfp.thread.as_deref(), Some(TOKEN));
        }
    }

    #[test]
    fn test_open_without_participants_fails() {
        let result = CfpSession::open(
            id("machine"),
            TOKEN.into(),
            Request::Materials { batch: Batch::default() },
            &[],
            1,
            SessionTimeouts::default(),
        );
        assert!(matches!(result, Err(NegotiationError::NoParticipants(_))));
    }

    #[test]
    fn test_exactly_one_accept_rest_rejected_same_token() {
        let (mut session, _) = open_round(&["a", "b", "c"]);
        assert_eq!(session.handle(&propose("a", 3, 18), 3).unwrap(), SessionEvent::Recorded);
        assert_eq!(session.handle(&propose("b", 3, 15), 3).unwrap(), SessionEvent::Recorded);

        let event = session.handle(&propose("c", 4, 10), 3).unwrap();
        let SessionEvent::Awarded { winner, envelopes } = event else {
            panic!("expected award, got {event:?}");
        };
        assert_eq!(winner.participant.as_str(), "b");

        let accepts: Vec<_> = envelopes
            .iter()
            .filter(|e| e.performative() == Performative::AcceptProposal)
            .collect();
        let rejects: Vec<_> = envelopes
            .iter()
            .filter(|e| e.performative() == Performative::RejectProposal)
            .map(|e| e.to.as_str())
            .collect();
        assert_eq!(accepts.len(), 1);
        assert_eq!(accepts[0].to.as_str(), "b");
        assert_eq!(rejects, vec!["a", "c"]);
        assert!(envelopes.iter().all(|e| e.thread.as_deref() == Some(TOKEN)));
        assert_eq!(session.phase(), SessionPhase::AwaitingInform);
    }

    #[test]
    fn test_refusers_are_not_rejected() {
        let (mut session, _) = open_round(&["a", "b"]);
        session
            .handle(&reply("a", TOKEN, 2, Payload::Refuse(RefuseReason::InsufficientStock)), 3)
            .unwrap();
        let SessionEvent::Awarded { envelopes, .. } = session.handle(&propose("b", 3, 15), 3).unwrap()
        else {
            panic!("expected award");
        };
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].to.as_str(), "b");
        assert_eq!(session.refusals().len(), 1);
    }

    #[test]
    fn test_unknown_token_ignored() {
        let (mut session, _) = open_round(&["a"]);
        let stray = reply("a", "cnp-other-9-9", 2, Payload::Propose(Offer { lead_time: 1, cost: 1 }));
        assert!(matches!(
            session.handle(&stray, 3),
            Err(NegotiationError::TokenMismatch { .. })
        ));
        assert!(session.proposals().is_empty());
    }

    #[test]
    fn test_duplicate_and_uninvited_replies_rejected() {
        let (mut session, _) = open_round(&["a", "b"]);
        session.handle(&propose("a", 3, 15), 3).unwrap();
        assert!(matches!(
            session.handle(&propose("a", 1, 1), 3),
            Err(NegotiationError::NotOutstanding { .. })
        ));
        assert!(matches!(
            session.handle(&propose("mallory", 1, 1), 3),
            Err(NegotiationError::NotOutstanding { .. })
        ));
        assert_eq!(session.proposals().len(), 1);
    }

    #[test]
    fn test_late_reply_after_deadline_ignored() {
        let (mut session, _) = open_round(&["a", "b"]);
        session.handle(&propose("a", 3, 15), 2).unwrap();
        let result = session.handle(&propose("b", 1, 1), 5);
        assert!(matches!(result, Err(NegotiationError::DeadlinePassed { .. })));
    }

    #[test]
    fn test_deadline_awards_partial_replies() {
        let (mut session, _) = open_round(&["a", "b"]);
        session.handle(&propose("a", 3, 15), 3).unwrap();
        assert!(session.poll(3).is_none());

        let Some(SessionEvent::Awarded { winner, envelopes }) = session.poll(4) else {
            panic!("expected award on deadline");
        };
        assert_eq!(winner.participant.as_str(), "a");
        assert_eq!(envelopes.len(), 1);
        assert_eq!(session.inform_deadline(), Some(14));
    }

    #[test]
    fn test_no_proposals_abandons_without_commitment() {
        let (mut session, _) = open_round(&["a", "b"]);
        session
            .handle(&reply("a", TOKEN, 2, Payload::Refuse(RefuseReason::InsufficientStock)), 3)
            .unwrap();
        assert_eq!(
            session.poll(4),
            Some(SessionEvent::Abandoned { reason: AbandonReason::NoProposals })
        );
        assert_eq!(session.phase(), SessionPhase::Abandoned);
        assert!(session.winner().is_none());
    }

    #[test]
    fn test_inform_from_winner_completes() {
        let (mut session, _) = open_round(&["a"]);
        session.handle(&propose("a", 3, 15), 3).unwrap();

        let inform = reply(
            "a",
            TOKEN,
            6,
            Payload::Inform(Report::Delivered { batch: Batch::new(10, 5, 3) }),
        );
        let event = session.handle(&inform, 7).unwrap();
        assert_eq!(
            event,
            SessionEvent::Informed {
                winner: id("a"),
                report: Report::Delivered { batch: Batch::new(10, 5, 3) },
            }
        );
        assert_eq!(session.phase(), SessionPhase::Completed);
        assert!(matches!(
            session.handle(&inform, 8),
            Err(NegotiationError::SessionClosed(_))
        ));
    }

    #[test]
    fn test_inform_from_loser_ignored() {
        let (mut session, _) = open_round(&["a", "b"]);
        session.handle(&propose("a", 3, 15), 3).unwrap();
        session.handle(&propose("b", 3, 18), 3).unwrap();
        let inform = reply("b", TOKEN, 6, Payload::Inform(Report::Delivered { batch: Batch::default() }));
        assert!(matches!(
            session.handle(&inform, 7),
            Err(NegotiationError::UnexpectedSender { .. })
        ));
        assert_eq!(session.phase(), SessionPhase::AwaitingInform);
    }

    #[test]
    fn test_inform_timeout_abandons() {
        let (mut session, _) = open_round(&["a"]);
        session.handle(&propose("a", 3, 15), 3).unwrap();
        assert!(session.poll(12).is_none());
        assert_eq!(
            session.poll(13),
            Some(SessionEvent::Abandoned { reason: AbandonReason::InformTimeout })
        );
    }

    #[test]
    fn test_accept_carries_inform_deadline() {
        let (mut session, _) = open_round(&["a"]);
        let SessionEvent::Awarded { envelopes, .. } = session.handle(&propose("a", 3, 15), 3).unwrap() else {
            panic!("expected award");
        };
        let Payload::AcceptProposal(award) = &envelopes[0].payload else {
            panic!("expected accept, got {:?}", envelopes[0].payload);
        };
        assert_eq!(award.reply_by, 13);
        assert_eq!(session.inform_deadline(), Some(13));
    }

    #[test]
    fn test_cutoff_caps_inform_deadline() {
        let (session, _) = open_round(&["a"]);
        let mut session = session.with_cutoff(8);
        let SessionEvent::Awarded { envelopes, .. } = session.handle(&propose("a", 3, 15), 3).unwrap() else {
            panic!("expected award");
        };
        let Payload::AcceptProposal(award) = &envelopes[0].payload else {
            panic!("expected accept");
        };
        assert_eq!(award.reply_by, 8);
        assert!(session.poll(7).is_none());
        assert_eq!(
            session.poll(8),
            Some(SessionEvent::Abandoned { reason: AbandonReason::InformTimeout })
        );
    }

    #[test]
    fn test_cutoff_abandons_while_collecting() {
        let (session, _) = open_round(&["a", "b"]);
        let mut session = session.with_cutoff(3);
        session.handle(&propose("a", 3, 15), 2).unwrap();
        assert!(session.poll(2).is_none());
        assert_eq!(
            session.poll(3),
            Some(SessionEvent::Abandoned { reason: AbandonReason::CutoffReached })
        );
        assert!(session.winner().is_none());
    }

    #[test]
    fn test_winner_refusal_abandons() {
        let (mut session, _) = open_round(&["a"]);
        session.handle(&propose("a", 3, 15), 3).unwrap();
        let refuse = reply("a", TOKEN, 4, Payload::Refuse(RefuseReason::StockExhausted));
        assert_eq!(
            session.handle(&refuse, 5).unwrap(),
            SessionEvent::Abandoned {
                reason: AbandonReason::WinnerRefused(RefuseReason::StockExhausted)
            }
        );
    }
}
