//! Supplier participant.
//!
//! Answers material CFPs from stock, and after winning an order becomes an
//! initiator itself: it runs a nested round with the transport units on the
//! same token, and only forwards INFORM to the machine once a transport
//! reports the delivery done. The nested round is cut off one tick before
//! the machine's `reply_by`, so the machine always hears back in time:
//! either the delivery or a `no_transport` refusal with the stock restored.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use fab_protocol::{
    AgentId, Batch, Envelope, Offer, Payload, RefuseReason, Report, Request, Tick,
    DEFAULT_OFFER_TTL_TICKS, PROTOCOL_CNP, TRANSPORT_ROUND_OVERHEAD_TICKS,
};
use fab_state::Environment;

use crate::session::{AbandonReason, CfpSession, SessionEvent, SessionTimeouts};
use crate::stock::StockLedger;
use crate::NegotiationError;

// ---------------------------------------------------------------------------
// Pricing and settings
// ---------------------------------------------------------------------------

/// Deterministic quote function.
///
/// Every order already in transit adds to both lead time and cost, and an
/// order that would push a requested material below `low_stock_threshold`
/// carries a scarcity surcharge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pricing {
    pub base_lead_time: u32,
    pub base_cost: u32,
    /// Added to the lead time per delivery in transit.
    pub lead_time_per_order: u32,
    /// Added to the cost per delivery in transit.
    pub cost_per_order: u32,
    /// Stock level under which an order counts as scarce.
    pub low_stock_threshold: u32,
    pub scarcity_cost: u32,
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            base_lead_time: 3,
            base_cost: 15,
            lead_time_per_order: 1,
            cost_per_order: 2,
            low_stock_threshold: 5,
            scarcity_cost: 3,
        }
    }
}

impl Pricing {
    pub fn quote(&self, stock: &Batch, batch: &Batch, in_flight: usize) -> Offer {
        let in_flight = u32::try_from(in_flight).unwrap_or(u32::MAX);
        let scarce = batch
            .iter()
            .any(|(m, q)| q > 0 && stock.get(m).saturating_sub(q) < self.low_stock_threshold);

        let lead_time = self
            .base_lead_time
            .saturating_add(self.lead_time_per_order.saturating_mul(in_flight));
        let mut cost = self
            .base_cost
            .saturating_add(self.cost_per_order.saturating_mul(in_flight));
        if scarce {
            cost = cost.saturating_add(self.scarcity_cost);
        }
        Offer { lead_time, cost }
    }
}

#[derive(Debug, Clone)]
pub struct SupplierSettings {
    /// Per-order ceiling for each material.
    pub capacity: Batch,
    pub pricing: Pricing,
    /// Distance quoted to transport units for every delivery.
    pub delivery_distance: u32,
    /// Ticks an unanswered PROPOSE is remembered.
    pub offer_ttl: u64,
    /// Timeouts of the nested transport round, before the cutoff applies.
    pub timeouts: SessionTimeouts,
}

impl Default for SupplierSettings {
    fn default() -> Self {
        Self {
            capacity: Batch::new(50, 30, 20),
            pricing: Pricing::default(),
            delivery_distance: 4,
            offer_ttl: DEFAULT_OFFER_TTL_TICKS,
            timeouts: SessionTimeouts::default(),
        }
    }
}

#[derive(Debug, Clone)]
struct OpenOffer {
    requester: AgentId,
    batch: Batch,
    offered_at: Tick,
}

/// Stock already debited, waiting for a transport to finish.
#[derive(Debug, Clone)]
struct PendingDelivery {
    requester: AgentId,
    batch: Batch,
    session: CfpSession,
}

// ---------------------------------------------------------------------------
// Supplier agent
// ---------------------------------------------------------------------------

pub struct SupplierNegotiator {
    id: AgentId,
    settings: SupplierSettings,
    stock: StockLedger,
    transports: Vec<AgentId>,
    offers: BTreeMap<String, OpenOffer>,
    pending: BTreeMap<String, PendingDelivery>,
    env: Arc<Environment>,
}

impl SupplierNegotiator {
    pub fn new(
        id: AgentId,
        settings: SupplierSettings,
        stock: StockLedger,
        transports: Vec<AgentId>,
        env: Arc<Environment>,
    ) -> Self {
        Self {
            id,
            settings,
            stock,
            transports,
            offers: BTreeMap::new(),
            pending: BTreeMap::new(),
            env,
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn stock(&self) -> &StockLedger {
        &self.stock
    }

    pub fn open_offers(&self) -> usize {
        self.offers.len()
    }

    pub fn pending_deliveries(&self) -> usize {
        self.pending.len()
    }

    /// Feasibility check and quote for a material request. The capacity
    /// ceiling is checked before stock.
    pub fn evaluate(&self, batch: &Batch) -> Result<Offer, RefuseReason> {
        if let Some((material, requested, ceiling)) = batch.exceeding(&self.settings.capacity) {
            return Err(RefuseReason::CapExceeded {
                material,
                requested,
                ceiling,
            });
        }
        let stock = self.stock.level();
        if !stock.covers(batch) {
            return Err(RefuseReason::InsufficientStock);
        }
        Ok(self.settings.pricing.quote(&stock, batch, self.pending.len()))
    }

    /// One scheduling round: apply the inbox, then the nested-round
    /// deadlines, then forget stale offers.
    pub fn on_round(&mut self, now: Tick, inbox: Vec<Envelope>) -> Vec<Envelope> {
        let mut outgoing = Vec::new();

        for envelope in inbox {
            match self.handle(&envelope, now) {
                Ok(out) => outgoing.extend(out),
                Err(e) => tracing::warn!(
                    supplier = %self.id,
                    from = %envelope.from,
                    performative = %envelope.performative(),
                    error = %e,
                    "Ignoring message"
                ),
            }
        }

        let tokens: Vec<String> = self.pending.keys().cloned().collect();
        for token in tokens {
            let event = self
                .pending
                .get_mut(&token)
                .and_then(|pending| pending.session.poll(now));
            if let Some(event) = event {
                outgoing.extend(self.apply_transport_event(&token, event, now));
            }
        }

        let ttl = self.settings.offer_ttl;
        self.offers.retain(|token, offer| {
            let keep = now < offer.offered_at + ttl;
            if !keep {
                tracing::debug!(token = %token, requester = %offer.requester, "Offer expired");
            }
            keep
        });

        outgoing
    }

    fn handle(&mut self, envelope: &Envelope, now: Tick) -> Result<Vec<Envelope>, NegotiationError> {
        envelope.ensure_protocol(PROTOCOL_CNP)?;
        let token = envelope.token()?.to_string();

        if self.transports.contains(&envelope.from) {
            return self.handle_transport_reply(envelope, &token, now);
        }

        match &envelope.payload {
            Payload::Cfp(Request::Materials { batch }) => Ok(vec![self.answer_cfp(envelope, &token, batch, now)]),
            Payload::Cfp(Request::Transport { .. }) => {
                self.env.metrics().requests_refused.incr();
                Ok(vec![envelope.reply(now, Payload::Refuse(RefuseReason::WrongRequest))])
            }
            Payload::AcceptProposal(award) => self.on_accept(envelope, &token, award.reply_by, now),
            Payload::RejectProposal => {
                if self.offers.remove(&token).is_some() {
                    tracing::debug!(supplier = %self.id, token = %token, "Proposal rejected");
                }
                Ok(Vec::new())
            }
            _ => Err(NegotiationError::UnexpectedPerformative {
                context: format!("supplier {}", self.id),
                performative: envelope.performative(),
            }),
        }
    }

    fn answer_cfp(&mut self, cfp: &Envelope, token: &str, batch: &Batch, now: Tick) -> Envelope {
        match self.evaluate(batch) {
            Ok(offer) => {
                tracing::debug!(
                    supplier = %self.id,
                    requester = %cfp.from,
                    token = %token,
                    lead_time = offer.lead_time,
                    cost = offer.cost,
                    "PROPOSE"
                );
                self.offers.insert(
                    token.to_string(),
                    OpenOffer {
                        requester: cfp.from.clone(),
                        batch: *batch,
                        offered_at: now,
                    },
                );
                cfp.reply(now, Payload::Propose(offer))
            }
            Err(reason) => {
                self.env.metrics().requests_refused.incr();
                tracing::debug!(
                    supplier = %self.id,
                    requester = %cfp.from,
                    token = %token,
                    reason = %reason,
                    "REFUSE"
                );
                cfp.reply(now, Payload::Refuse(reason))
            }
        }
    }

    /// Whether INFORM can still be sent before `reply_by`. With transports
    /// the shortest trip is one tick plus the nested round's hops.
    fn can_deliver_by(&self, reply_by: Tick, now: Tick) -> bool {
        let earliest = if self.transports.is_empty() {
            now
        } else {
            now + TRANSPORT_ROUND_OVERHEAD_TICKS + 1
        };
        earliest < reply_by
    }

    /// Commit an accepted offer: debit stock, then deliver directly or open
    /// the nested transport round, cut off one tick before `reply_by`.
    fn on_accept(
        &mut self,
        accept: &Envelope,
        token: &str,
        reply_by: Tick,
        now: Tick,
    ) -> Result<Vec<Envelope>, NegotiationError> {
        let offer = match self.offers.remove(token) {
            Some(offer) if offer.requester == accept.from => offer,
            Some(offer) => {
                self.offers.insert(token.to_string(), offer);
                return Err(NegotiationError::UnexpectedSender {
                    token: token.to_string(),
                    sender: accept.from.to_string(),
                });
            }
            None => return Err(NegotiationError::UnknownToken(token.to_string())),
        };

        if !self.can_deliver_by(reply_by, now) {
            self.env.metrics().requests_refused.incr();
            tracing::warn!(
                supplier = %self.id,
                requester = %offer.requester,
                token = %token,
                reply_by,
                "Delivery cannot arrive in time, refusing accepted order"
            );
            return Ok(vec![accept.reply(now, Payload::Refuse(RefuseReason::DeadlineUnreachable))]);
        }

        if self.stock.try_debit(&offer.batch).is_none() {
            self.env.metrics().supplier_overcommits.incr();
            tracing::warn!(
                supplier = %self.id,
                requester = %offer.requester,
                token = %token,
                batch = %offer.batch,
                stock = %self.stock.level(),
                "Stock consumed since PROPOSE, refusing accepted order"
            );
            return Ok(vec![accept.reply(now, Payload::Refuse(RefuseReason::StockExhausted))]);
        }

        if self.transports.is_empty() {
            self.env.metrics().record_delivery(&offer.batch);
            tracing::info!(
                supplier = %self.id,
                requester = %offer.requester,
                token = %token,
                batch = %offer.batch,
                "Delivered without transport"
            );
            return Ok(vec![accept.reply(
                now,
                Payload::Inform(Report::Delivered { batch: offer.batch }),
            )]);
        }

        let request = Request::Transport {
            batch: offer.batch,
            distance: self.settings.delivery_distance,
        };
        let (session, cfps) = CfpSession::open(
            self.id.clone(),
            token.to_string(),
            request,
            &self.transports,
            now,
            self.settings.timeouts,
        )?;
        let session = session.with_cutoff(reply_by - 1);
        self.env.metrics().transport_cfp.incr();
        tracing::info!(
            supplier = %self.id,
            requester = %offer.requester,
            token = %token,
            transports = cfps.len(),
            reply_by,
            "Order accepted, negotiating transport"
        );
        self.pending.insert(
            token.to_string(),
            PendingDelivery {
                requester: offer.requester,
                batch: offer.batch,
                session,
            },
        );
        Ok(cfps)
    }

    fn handle_transport_reply(
        &mut self,
        envelope: &Envelope,
        token: &str,
        now: Tick,
    ) -> Result<Vec<Envelope>, NegotiationError> {
        let pending = self
            .pending
            .get_mut(token)
            .ok_or_else(|| NegotiationError::UnknownToken(token.to_string()))?;
        let event = pending.session.handle(envelope, now)?;
        if matches!(envelope.payload, Payload::Propose(_)) {
            self.env.metrics().transport_proposals.incr();
        }
        Ok(self.apply_transport_event(token, event, now))
    }

    fn apply_transport_event(&mut self, token: &str, event: SessionEvent, now: Tick) -> Vec<Envelope> {
        match event {
            SessionEvent::Recorded => Vec::new(),
            SessionEvent::Awarded { winner, envelopes } => {
                self.env.metrics().transport_accepts.incr();
                tracing::debug!(
                    supplier = %self.id,
                    token = %token,
                    transport = %winner.participant,
                    lead_time = winner.lead_time,
                    cost = winner.cost,
                    "Transport selected"
                );
                envelopes
            }
            SessionEvent::Informed { winner, .. } => {
                let Some(pending) = self.pending.remove(token) else {
                    return Vec::new();
                };
                self.env.metrics().transport_informs.incr();
                self.env.metrics().record_delivery(&pending.batch);
                tracing::info!(
                    supplier = %self.id,
                    requester = %pending.requester,
                    transport = %winner,
                    token = %token,
                    batch = %pending.batch,
                    "Delivered"
                );
                vec![Envelope::new(
                    self.id.clone(),
                    pending.requester,
                    Some(token.to_string()),
                    now,
                    Payload::Inform(Report::Delivered { batch: pending.batch }),
                )]
            }
            SessionEvent::Abandoned { reason } => {
                let Some(pending) = self.pending.remove(token) else {
                    return Vec::new();
                };
                if matches!(reason, AbandonReason::InformTimeout | AbandonReason::CutoffReached) {
                    self.env.metrics().transport_timeouts.incr();
                }
                self.stock.credit(&pending.batch);
                tracing::warn!(
                    supplier = %self.id,
                    requester = %pending.requester,
                    token = %token,
                    reason = %reason,
                    "Transport round failed, stock restored"
                );
                vec![Envelope::new(
                    self.id.clone(),
                    pending.requester,
                    Some(token.to_string()),
                    now,
                    Payload::Refuse(RefuseReason::NoTransport),
                )]
            }
        }
    }
}
