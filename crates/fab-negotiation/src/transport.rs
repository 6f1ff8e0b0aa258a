//! Transport participant: a robot that carries one batch at a time.
//!
//! A trip only starts if its INFORM can be sent before the `reply_by` in
//! the supplier's ACCEPT; otherwise the robot refuses and stays free.

use std::collections::BTreeMap;
use std::sync::Arc;

use fab_protocol::{
    AgentId, Envelope, Offer, Payload, RefuseReason, Report, Request, Tick,
    DEFAULT_OFFER_TTL_TICKS, PROTOCOL_CNP,
};
use fab_state::Environment;

use crate::NegotiationError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportSettings {
    /// Largest batch (total units) carried in one trip.
    pub max_load: u64,
    /// Ticks per unit of distance.
    pub speed: f64,
    /// Quoted cost per unit of distance.
    pub cost_per_distance: u32,
    /// Ticks an unanswered PROPOSE is remembered.
    pub offer_ttl: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_load: 100,
            speed: 0.5,
            cost_per_distance: 4,
            offer_ttl: DEFAULT_OFFER_TTL_TICKS,
        }
    }
}

impl TransportSettings {
    /// `max(1, ceil(distance * speed))`
    pub fn travel_ticks(&self, distance: u32) -> u32 {
        let ticks = (f64::from(distance) * self.speed).ceil();
        if ticks.is_finite() && ticks >= 1.0 {
            ticks.min(f64::from(u32::MAX)) as u32
        } else {
            1
        }
    }

    /// `max(1, distance * cost_per_distance)`
    pub fn cost(&self, distance: u32) -> u32 {
        distance.saturating_mul(self.cost_per_distance).max(1)
    }
}

#[derive(Debug, Clone)]
struct TransportOffer {
    supplier: AgentId,
    distance: u32,
    offered_at: Tick,
}

#[derive(Debug, Clone)]
struct Trip {
    token: String,
    supplier: AgentId,
    distance: u32,
    remaining: u32,
}

// ---------------------------------------------------------------------------
// Transport agent
// ---------------------------------------------------------------------------

pub struct TransportNegotiator {
    id: AgentId,
    settings: TransportSettings,
    offers: BTreeMap<String, TransportOffer>,
    trip: Option<Trip>,
    env: Arc<Environment>,
}

impl TransportNegotiator {
    pub fn new(id: AgentId, settings: TransportSettings, env: Arc<Environment>) -> Self {
        Self {
            id,
            settings,
            offers: BTreeMap::new(),
            trip: None,
            env,
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn is_busy(&self) -> bool {
        self.trip.is_some()
    }

    /// One scheduling round: move the current trip forward, then answer the
    /// inbox.
    pub fn on_round(&mut self, now: Tick, inbox: Vec<Envelope>) -> Vec<Envelope> {
        let mut outgoing = Vec::new();

        if let Some(done) = self.advance_trip(now) {
            outgoing.push(done);
        }

        for envelope in inbox {
            match self.handle(&envelope, now) {
                Ok(Some(reply)) => outgoing.push(reply),
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    transport = %self.id,
                    from = %envelope.from,
                    performative = %envelope.performative(),
                    error = %e,
                    "Ignoring message"
                ),
            }
        }

        let ttl = self.settings.offer_ttl;
        self.offers.retain(|_, offer| now < offer.offered_at + ttl);

        outgoing
    }

    fn advance_trip(&mut self, now: Tick) -> Option<Envelope> {
        let trip = self.trip.as_mut()?;
        trip.remaining = trip.remaining.saturating_sub(1);
        if trip.remaining > 0 {
            return None;
        }

        let trip = self.trip.take()?;
        self.env.metrics().transport_trips.incr();
        tracing::info!(
            transport = %self.id,
            supplier = %trip.supplier,
            token = %trip.token,
            distance = trip.distance,
            "Trip finished"
        );
        Some(Envelope::new(
            self.id.clone(),
            trip.supplier,
            Some(trip.token),
            now,
            Payload::Inform(Report::TransportDone {
                distance: trip.distance,
            }),
        ))
    }

    fn handle(&mut self, envelope: &Envelope, now: Tick) -> Result<Option<Envelope>, NegotiationError> {
        envelope.ensure_protocol(PROTOCOL_CNP)?;
        let token = envelope.token()?.to_string();

        match &envelope.payload {
            Payload::Cfp(request) => Ok(Some(self.answer_cfp(envelope, &token, request, now))),
            Payload::AcceptProposal(award) => self.on_accept(envelope, &token, award.reply_by, now),
            Payload::RejectProposal => {
                self.offers.remove(&token);
                Ok(None)
            }
            _ => Err(NegotiationError::UnexpectedPerformative {
                context: format!("transport {}", self.id),
                performative: envelope.performative(),
            }),
        }
    }

    fn evaluate(&self, request: &Request) -> Result<Offer, RefuseReason> {
        let Request::Transport { batch, distance } = request else {
            return Err(RefuseReason::WrongRequest);
        };
        if self.trip.is_some() {
            return Err(RefuseReason::Busy);
        }
        let load = batch.total();
        if load > self.settings.max_load {
            return Err(RefuseReason::OverLoad {
                load,
                max_load: self.settings.max_load,
            });
        }
        Ok(Offer {
            lead_time: self.settings.travel_ticks(*distance),
            cost: self.settings.cost(*distance),
        })
    }

    fn answer_cfp(&mut self, cfp: &Envelope, token: &str, request: &Request, now: Tick) -> Envelope {
        match self.evaluate(request) {
            Ok(offer) => {
                if let Request::Transport { distance, .. } = request {
                    self.offers.insert(
                        token.to_string(),
                        TransportOffer {
                            supplier: cfp.from.clone(),
                            distance: *distance,
                            offered_at: now,
                        },
                    );
                }
                tracing::debug!(
                    transport = %self.id,
                    supplier = %cfp.from,
                    token = %token,
                    lead_time = offer.lead_time,
                    cost = offer.cost,
                    "PROPOSE"
                );
                cfp.reply(now, Payload::Propose(offer))
            }
            Err(reason) => {
                self.env.metrics().requests_refused.incr();
                tracing::debug!(transport = %self.id, token = %token, reason = %reason, "REFUSE");
                cfp.reply(now, Payload::Refuse(reason))
            }
        }
    }

    /// Start the trip. INFORM follows when it finishes, `travel_ticks` after
    /// `now`, and must be sent before `reply_by`.
    fn on_accept(
        &mut self,
        accept: &Envelope,
        token: &str,
        reply_by: Tick,
        now: Tick,
    ) -> Result<Option<Envelope>, NegotiationError> {
        let offer = match self.offers.remove(token) {
            Some(offer) if offer.supplier == accept.from => offer,
            Some(offer) => {
                self.offers.insert(token.to_string(), offer);
                return Err(NegotiationError::UnexpectedSender {
                    token: token.to_string(),
                    sender: accept.from.to_string(),
                });
            }
            None => return Err(NegotiationError::UnknownToken(token.to_string())),
        };

        if self.trip.is_some() {
            return Ok(Some(accept.reply(now, Payload::Refuse(RefuseReason::Busy))));
        }

        let remaining = self.settings.travel_ticks(offer.distance);
        if now + u64::from(remaining) >= reply_by {
            self.env.metrics().requests_refused.incr();
            tracing::warn!(
                transport = %self.id,
                supplier = %offer.supplier,
                token = %token,
                ticks = remaining,
                reply_by,
                "Trip would finish too late, refusing"
            );
            return Ok(Some(accept.reply(now, Payload::Refuse(RefuseReason::DeadlineUnreachable))));
        }

        tracing::info!(
            transport = %self.id,
            supplier = %offer.supplier,
            token = %token,
            distance = offer.distance,
            ticks = remaining,
            "Trip started"
        );
        self.trip = Some(Trip {
            token: token.to_string(),
            supplier: offer.supplier,
            distance: offer.distance,
            remaining,
        });
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fab_protocol::{Award, Batch};
    use fab_state::EnvironmentConfig;

    fn id(s: &str) -> AgentId {
        AgentId::new(s.into())
    }

    fn robot() -> (TransportNegotiator, Arc<Environment>) {
        let env = Arc::new(Environment::new(EnvironmentConfig::default()));
        (
            TransportNegotiator::new(id("robot1"), TransportSettings::default(), env.clone()),
            env,
        )
    }

    fn from_supplier(token: &str, payload: Payload) -> Envelope {
        Envelope::new(id("supplierA"), id("robot1"), Some(token.into()), 1, payload)
    }

    fn transport_accept(token: &str, distance: u32, reply_by: Tick) -> Envelope {
        from_supplier(
            token,
            Payload::AcceptProposal(Award {
                request: Request::Transport { batch: Batch::new(10, 0, 0), distance },
                reply_by,
            }),
        )
    }

    fn transport_cfp(token: &str, total: u32, distance: u32) -> Envelope {
        from_supplier(
            token,
            Payload::Cfp(Request::Transport {
                batch: Batch::new(total, 0, 0),
                distance,
            }),
        )
    }

    #[test]
    fn test_travel_and_cost_have_floor_of_one() {
        let settings = TransportSettings::default();
        assert_eq!(settings.travel_ticks(0), 1);
        assert_eq!(settings.travel_ticks(4), 2);
        assert_eq!(settings.travel_ticks(5), 3);
        assert_eq!(settings.cost(0), 1);
        assert_eq!(settings.cost(4), 16);
    }

    #[test]
    fn test_refuses_overload_and_material_requests() {
        let (mut robot, env) = robot();
        let out = robot.on_round(2, vec![transport_cfp("t1", 150, 4)]);
        assert_eq!(
            out[0].payload,
            Payload::Refuse(RefuseReason::OverLoad { load: 150, max_load: 100 })
        );

        let materials = from_supplier(
            "t2",
            Payload::Cfp(Request::Materials { batch: Batch::new(1, 0, 0) }),
        );
        let out = robot.on_round(3, vec![materials]);
        assert_eq!(out[0].payload, Payload::Refuse(RefuseReason::WrongRequest));
        assert_eq!(env.metrics().requests_refused.get(), 2);
    }

    #[test]
    fn test_trip_informs_after_travel_time() {
        let (mut robot, env) = robot();
        let out = robot.on_round(2, vec![transport_cfp("t1", 10, 4)]);
        assert_eq!(out[0].payload, Payload::Propose(Offer { lead_time: 2, cost: 16 }));

        assert!(robot.on_round(4, vec![transport_accept("t1", 4, 16)]).is_empty());
        assert!(robot.is_busy());

        let out = robot.on_round(5, vec![transport_cfp("t2", 10, 4)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload, Payload::Refuse(RefuseReason::Busy));

        let out = robot.on_round(6, Vec::new());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to.as_str(), "supplierA");
        assert_eq!(out[0].thread.as_deref(), Some("t1"));
        assert_eq!(out[0].payload, Payload::Inform(Report::TransportDone { distance: 4 }));
        assert!(!robot.is_busy());
        assert_eq!(env.metrics().transport_trips.get(), 1);
    }

    #[test]
    fn test_accept_for_unknown_offer_ignored() {
        let (mut robot, _) = robot();
        assert!(robot.on_round(2, vec![transport_accept("ghost", 1, 16)]).is_empty());
        assert!(!robot.is_busy());
    }

    #[test]
    fn test_trip_that_would_miss_deadline_is_refused() {
        let (mut robot, env) = robot();
        let out = robot.on_round(2, vec![transport_cfp("t1", 10, 16)]);
        assert_eq!(out[0].payload, Payload::Propose(Offer { lead_time: 8, cost: 64 }));

        // INFORM would go out at 12, the supplier stops waiting at 12.
        let out = robot.on_round(4, vec![transport_accept("t1", 16, 12)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload, Payload::Refuse(RefuseReason::DeadlineUnreachable));
        assert!(!robot.is_busy());
        assert_eq!(env.metrics().transport_trips.get(), 0);
    }

    #[test]
    fn test_trip_finishing_just_in_time_is_taken() {
        let (mut robot, _) = robot();
        robot.on_round(2, vec![transport_cfp("t1", 10, 16)]);
        assert!(robot.on_round(4, vec![transport_accept("t1", 16, 13)]).is_empty());
        assert!(robot.is_busy());
        for now in 5..12 {
            assert!(robot.on_round(now, Vec::new()).is_empty());
        }
        let out = robot.on_round(12, Vec::new());
        assert_eq!(out[0].sent_at, 12);
        assert_eq!(out[0].payload, Payload::Inform(Report::TransportDone { distance: 16 }));
    }
}
