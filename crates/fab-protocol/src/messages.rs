use serde::{Deserialize, Serialize};

use crate::constants::PROTOCOL_CNP;
use crate::error::ProtocolError;
use crate::identity::AgentId;
use crate::types::{Batch, Material, Tick};

/// Speech-act tag of a Contract-Net message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Performative {
    Cfp,
    Propose,
    Refuse,
    AcceptProposal,
    RejectProposal,
    Inform,
}

impl std::fmt::Display for Performative {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Cfp => "cfp",
            Self::Propose => "propose",
            Self::Refuse => "refuse",
            Self::AcceptProposal => "accept-proposal",
            Self::RejectProposal => "reject-proposal",
            Self::Inform => "inform",
        };
        write!(f, "{s}")
    }
}

/// What a CFP asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Request {
    /// Procurement of raw materials (machine → supplier).
    Materials { batch: Batch },
    /// Physical delivery of a batch over a distance (supplier → transport).
    Transport { batch: Batch, distance: u32 },
}

impl Request {
    pub fn batch(&self) -> &Batch {
        match self {
            Self::Materials { batch } | Self::Transport { batch, .. } => batch,
        }
    }
}

/// Body of a PROPOSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    /// Ticks until the work is done.
    pub lead_time: u32,
    pub cost: u32,
}

/// Body of an ACCEPT-PROPOSAL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Award {
    /// The awarded request, echoed so the participant can act on it.
    pub request: Request,
    /// First tick at which the initiator no longer waits. INFORM or REFUSE
    /// must be sent strictly before it.
    pub reply_by: Tick,
}

/// Body of a REFUSE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RefuseReason {
    InsufficientStock,
    CapExceeded { material: Material, requested: u32, ceiling: u32 },
    Busy,
    OverLoad { load: u64, max_load: u64 },
    /// Stock was consumed by another order between PROPOSE and ACCEPT.
    StockExhausted,
    NoTransport,
    WrongRequest,
    /// The work cannot finish before the initiator's `reply_by`.
    DeadlineUnreachable,
}

impl std::fmt::Display for RefuseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InsufficientStock => write!(f, "insufficient_stock"),
            Self::CapExceeded { material, requested, ceiling } => {
                write!(f, "cap_exceeded: {material}={requested} > cap={ceiling}")
            }
            Self::Busy => write!(f, "busy"),
            Self::OverLoad { load, max_load } => write!(f, "over_load: {load} > {max_load}"),
            Self::StockExhausted => write!(f, "stock_exhausted"),
            Self::NoTransport => write!(f, "no_transport"),
            Self::WrongRequest => write!(f, "wrong_request"),
            Self::DeadlineUnreachable => write!(f, "deadline_unreachable"),
        }
    }
}

/// Body of an INFORM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Report {
    /// Materials arrived at the requester.
    Delivered { batch: Batch },
    /// A transport unit finished its trip.
    TransportDone { distance: u32 },
}

/// Typed message body, one variant per performative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "performative", content = "body", rename_all = "kebab-case")]
pub enum Payload {
    Cfp(Request),
    Propose(Offer),
    Refuse(RefuseReason),
    AcceptProposal(Award),
    RejectProposal,
    Inform(Report),
}

impl Payload {
    pub fn performative(&self) -> Performative {
        match self {
            Self::Cfp(_) => Performative::Cfp,
            Self::Propose(_) => Performative::Propose,
            Self::Refuse(_) => Performative::Refuse,
            Self::AcceptProposal(_) => Performative::AcceptProposal,
            Self::RejectProposal => Performative::RejectProposal,
            Self::Inform(_) => Performative::Inform,
        }
    }
}

/// A point-to-point message between two agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: AgentId,
    pub to: AgentId,
    pub protocol: String,
    /// Correlation token binding every message of one negotiation round.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
    /// Tick at which the sender produced the message.
    pub sent_at: Tick,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(
        from: AgentId,
        to: AgentId,
        thread: Option<String>,
        sent_at: Tick,
        payload: Payload,
    ) -> Self {
        Self {
            from,
            to,
            protocol: PROTOCOL_CNP.to_string(),
            thread,
            sent_at,
            payload,
        }
    }

    pub fn performative(&self) -> Performative {
        self.payload.performative()
    }

    /// Reply to the sender on the same protocol and thread.
    pub fn reply(&self, sent_at: Tick, payload: Payload) -> Envelope {
        Envelope {
            from: self.to.clone(),
            to: self.from.clone(),
            protocol: self.protocol.clone(),
            thread: self.thread.clone(),
            sent_at,
            payload,
        }
    }

    /// Correlation token, required on every Contract-Net message.
    pub fn token(&self) -> Result<&str, ProtocolError> {
        self.thread
            .as_deref()
            .ok_or_else(|| ProtocolError::MissingThread(self.from.to_string()))
    }

    pub fn ensure_protocol(&self, expected: &str) -> Result<(), ProtocolError> {
        if self.protocol != expected {
            return Err(ProtocolError::UnexpectedProtocol {
                expected: expected.to_string(),
                got: self.protocol.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_keeps_thread_and_swaps_addresses() {
        let cfp = Envelope::new(
            AgentId::new("machine".into()),
            AgentId::new("supplierA".into()),
            Some("cnp-machine-1-1".into()),
            1,
            Payload::Cfp(Request::Materials { batch: Batch::new(10, 5, 3) }),
        );
        let reply = cfp.reply(2, Payload::Propose(Offer { lead_time: 3, cost: 15 }));

        assert_eq!(reply.from.as_str(), "supplierA");
        assert_eq!(reply.to.as_str(), "machine");
        assert_eq!(reply.thread, cfp.thread);
        assert_eq!(reply.performative(), Performative::Propose);
        assert_eq!(reply.sent_at, 2);
    }

    #[test]
    fn test_missing_thread_is_an_error() {
        let env = Envelope::new(
            AgentId::new("robot".into()),
            AgentId::new("supplierA".into()),
            None,
            4,
            Payload::Inform(Report::TransportDone { distance: 2 }),
        );
        assert!(matches!(env.token(), Err(ProtocolError::MissingThread(_))));
    }

    #[test]
    fn test_payload_json_shape_is_tagged_by_performative() {
        let payload = Payload::Refuse(RefuseReason::CapExceeded {
            material: Material::Flour,
            requested: 80,
            ceiling: 50,
        });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["performative"], "refuse");
        assert_eq!(json["body"]["reason"], "cap_exceeded");
        assert_eq!(json["body"]["material"], "flour");

        let back: Payload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_award_carries_reply_deadline() {
        let payload = Payload::AcceptProposal(Award {
            request: Request::Transport { batch: Batch::new(10, 0, 0), distance: 4 },
            reply_by: 17,
        });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["performative"], "accept-proposal");
        assert_eq!(json["body"]["reply_by"], 17);
        assert_eq!(json["body"]["request"]["kind"], "transport");
    }

    #[test]
    fn test_refuse_reason_strings() {
        assert_eq!(RefuseReason::InsufficientStock.to_string(), "insufficient_stock");
        assert_eq!(
            RefuseReason::CapExceeded {
                material: Material::Sugar,
                requested: 40,
                ceiling: 30
            }
            .to_string(),
            "cap_exceeded: sugar=40 > cap=30"
        );
        assert_eq!(RefuseReason::DeadlineUnreachable.to_string(), "deadline_unreachable");
    }
}
