//! Machine agent.
//!
//! One round, in order:
//! 1. a failed machine drops its inbox and does nothing else
//! 2. an injected fault or a failure roll takes the machine down
//!    (running job parked for delegation, maintenance notified), ending
//!    the round
//! 3. the pipeline admits/advances jobs
//! 4. replies are applied to the open procurement round, then its
//!    deadlines are polled
//! 5. a new round opens when none is running, the back-off/cooldown has
//!    passed and the queue has room

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use fab_negotiation::{AbandonReason, CfpSession, NegotiationError, SessionEvent, SessionTimeouts};
use fab_protocol::{
    AgentId, Batch, Envelope, Payload, Report, Request, Tick, DEFAULT_BACKOFF_TICKS_MAX,
    DEFAULT_BACKOFF_TICKS_MIN, DEFAULT_COOLDOWN_TICKS_MAX, DEFAULT_COOLDOWN_TICKS_MIN,
};
use fab_state::{Environment, Schedulable};

use crate::delegation::{handle_failure, DelegationQueue};
use crate::machine::Machine;
use crate::maintenance::MaintenanceHandle;
use crate::pipeline::run_round;
use crate::PlantError;

#[derive(Debug, Clone)]
pub struct ProcurementSettings {
    /// Batch requested in every round.
    pub batch: Batch,
    pub timeouts: SessionTimeouts,
    /// Inclusive wait after a failed round.
    pub backoff: (u64, u64),
    /// Inclusive wait after a delivery.
    pub cooldown: (u64, u64),
    /// No new round while this many jobs are queued.
    pub max_queue: usize,
}

impl Default for ProcurementSettings {
    fn default() -> Self {
        Self {
            batch: Batch::new(10, 5, 3),
            timeouts: SessionTimeouts::default(),
            backoff: (DEFAULT_BACKOFF_TICKS_MIN, DEFAULT_BACKOFF_TICKS_MAX),
            cooldown: (DEFAULT_COOLDOWN_TICKS_MIN, DEFAULT_COOLDOWN_TICKS_MAX),
            max_queue: 2,
        }
    }
}

impl ProcurementSettings {
    pub fn validate(&self) -> Result<(), PlantError> {
        for (name, (min, max)) in [("backoff", self.backoff), ("cooldown", self.cooldown)] {
            if min > max {
                return Err(PlantError::InvalidRange { name, min, max });
            }
        }
        Ok(())
    }
}

pub struct MachineAgent {
    machine: Arc<Machine>,
    suppliers: Vec<AgentId>,
    settings: ProcurementSettings,
    session: Option<CfpSession>,
    resume_at: Tick,
    rounds_opened: u64,
    rng: StdRng,
    maintenance: MaintenanceHandle,
    delegations: DelegationQueue,
    env: Arc<Environment>,
}

impl MachineAgent {
    pub fn new(
        machine: Arc<Machine>,
        suppliers: Vec<AgentId>,
        settings: ProcurementSettings,
        seed: Option<u64>,
        maintenance: MaintenanceHandle,
        delegations: DelegationQueue,
        env: Arc<Environment>,
    ) -> Result<Self, PlantError> {
        settings.validate()?;
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            machine,
            suppliers,
            settings,
            session: None,
            resume_at: 0,
            rounds_opened: 0,
            rng,
            maintenance,
            delegations,
            env,
        })
    }

    pub fn id(&self) -> &AgentId {
        self.machine.id()
    }

    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    pub fn session(&self) -> Option<&CfpSession> {
        self.session.as_ref()
    }

    pub fn resume_at(&self) -> Tick {
        self.resume_at
    }

    pub fn on_round(&mut self, now: Tick, inbox: Vec<Envelope>) -> Vec<Envelope> {
        if self.machine.is_failed() {
            if !inbox.is_empty() {
                tracing::debug!(machine = %self.id(), dropped = inbox.len(), "Failed, dropping inbox");
            }
            return Vec::new();
        }

        if self.machine.take_fault() || self.rolls_failure() {
            self.go_down(now);
            return Vec::new();
        }

        run_round(&self.machine, self.env.metrics(), now);

        let mut outgoing = Vec::new();
        for envelope in inbox {
            match self.handle(&envelope, now) {
                Ok(out) => outgoing.extend(out),
                Err(reason) => tracing::warn!(
                    machine = %self.id(),
                    from = %envelope.from,
                    performative = %envelope.performative(),
                    error = %reason,
                    "Ignoring message"
                ),
            }
        }

        let polled = self.session.as_mut().and_then(|session| session.poll(now));
        if let Some(event) = polled {
            outgoing.extend(self.apply(event, now));
        }

        if let Some(cfps) = self.maybe_open_round(now) {
            outgoing.extend(cfps);
        }
        outgoing
    }

    fn rolls_failure(&mut self) -> bool {
        let rate = self.machine.failure_rate();
        rate > 0.0 && self.rng.gen::<f64>() < rate
    }

    fn go_down(&mut self, now: Tick) {
        if let Some(session) = self.session.take() {
            tracing::info!(
                machine = %self.id(),
                token = %session.token(),
                "Abandoning procurement round on failure"
            );
        }
        handle_failure(&self.machine, &self.env, &self.maintenance, &self.delegations, now);
    }

    fn handle(&mut self, envelope: &Envelope, now: Tick) -> Result<Vec<Envelope>, NegotiationError> {
        let Some(session) = self.session.as_mut() else {
            return Err(NegotiationError::UnknownToken(envelope.thread.clone().unwrap_or_default()));
        };
        let event = session.handle(envelope, now)?;
        if matches!(envelope.payload, Payload::Propose(_)) {
            self.env.metrics().cnp_proposals.incr();
        }
        Ok(self.apply(event, now))
    }

    fn apply(&mut self, event: SessionEvent, now: Tick) -> Vec<Envelope> {
        match event {
            SessionEvent::Recorded => Vec::new(),
            SessionEvent::Awarded { winner, envelopes } => {
                self.env.metrics().cnp_accepts.incr();
                tracing::info!(
                    machine = %self.id(),
                    token = %self.session.as_ref().map(CfpSession::token).unwrap_or_default(),
                    winner = %winner.participant,
                    lead_time = winner.lead_time,
                    cost = winner.cost,
                    rejected = envelopes.len() - 1,
                    "Supplier selected"
                );
                envelopes
            }
            SessionEvent::Informed { winner, report } => {
                self.session = None;
                self.env.metrics().cnp_informs.incr();
                match report {
                    Report::Delivered { batch } => self.on_delivery(winner, batch, now),
                    Report::TransportDone { .. } => {
                        tracing::warn!(machine = %self.id(), supplier = %winner, "Unexpected report kind");
                    }
                }
                self.resume_at = now + self.draw(self.settings.cooldown);
                Vec::new()
            }
            SessionEvent::Abandoned { reason } => {
                let token = self.session.take().map(|s| s.token().to_string()).unwrap_or_default();
                if reason == AbandonReason::InformTimeout {
                    self.env.metrics().cnp_timeouts.incr();
                }
                let wait = self.draw(self.settings.backoff);
                self.resume_at = now + wait;
                tracing::warn!(
                    machine = %self.id(),
                    token = %token,
                    reason = %reason,
                    backoff = wait,
                    "Procurement round abandoned"
                );
                Vec::new()
            }
        }
    }

    fn on_delivery(&mut self, supplier: AgentId, batch: Batch, now: Tick) {
        match self.machine.create_job(batch, now) {
            Ok(job) => {
                self.env.metrics().jobs_created.incr();
                tracing::info!(
                    machine = %self.id(),
                    supplier = %supplier,
                    job = %job,
                    batch = %batch,
                    "Materials delivered, job created"
                );
            }
            Err(e) => tracing::warn!(machine = %self.id(), error = %e, "Could not create job"),
        }
    }

    fn maybe_open_round(&mut self, now: Tick) -> Option<Vec<Envelope>> {
        if self.session.is_some() || now < self.resume_at {
            return None;
        }
        if self.machine.queue_len() >= self.settings.max_queue {
            return None;
        }

        self.rounds_opened += 1;
        let token = format!("cnp-{}-{}-{}", self.id(), now, self.rounds_opened);
        let opened = CfpSession::open(
            self.id().clone(),
            token,
            Request::Materials {
                batch: self.settings.batch,
            },
            &self.suppliers,
            now,
            self.settings.timeouts,
        );
        match opened {
            Ok((session, cfps)) => {
                self.env.metrics().cnp_cfp.incr();
                tracing::info!(
                    machine = %self.id(),
                    token = %session.token(),
                    batch = %self.settings.batch,
                    suppliers = cfps.len(),
                    "CFP sent"
                );
                self.session = Some(session);
                Some(cfps)
            }
            Err(e) => {
                tracing::warn!(machine = %self.id(), error = %e, "Cannot open procurement round");
                self.resume_at = now + self.draw(self.settings.backoff);
                None
            }
        }
    }

    fn draw(&mut self, (min, max): (u64, u64)) -> u64 {
        self.rng.gen_range(min..=max)
    }
}
