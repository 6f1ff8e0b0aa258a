//! Contract-Net negotiation: initiator sessions, winner selection, and the
//! supplier and transport participant roles.
//!
//! A negotiation round runs CFP → PROPOSE/REFUSE → ACCEPT/REJECT → INFORM.
//! The initiator side is the [`CfpSession`] state machine; participants are
//! [`SupplierNegotiator`] (which becomes an initiator itself toward transport
//! units once it wins an order) and [`TransportNegotiator`].
//!
//! Everything here is synchronous and driven by the caller's tick, so the
//! same code runs under the tokio runtime and in deterministic tests.

pub mod selection;
pub mod session;
pub mod stock;
pub mod supplier;
pub mod transport;

pub use selection::{select_winner, split_winner, Proposal, Selection};
pub use session::{AbandonReason, CfpSession, SessionEvent, SessionPhase, SessionTimeouts};
pub use stock::StockLedger;
pub use supplier::{Pricing, SupplierNegotiator, SupplierSettings};
pub use transport::{TransportNegotiator, TransportSettings};

use fab_protocol::{Performative, ProtocolError, Tick};
use thiserror::Error;

/// Errors raised while applying an incoming message to negotiation state.
///
/// None of these is fatal: agents log the error and drop the message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("No participants to negotiate with for round {0}")]
    NoParticipants(String),

    #[error("Token mismatch: expected {expected}, got {got}")]
    TokenMismatch { expected: String, got: String },

    #[error("Unknown correlation token: {0}")]
    UnknownToken(String),

    #[error("Participant {participant} is not outstanding in round {token}")]
    NotOutstanding { token: String, participant: String },

    #[error("Unexpected sender {sender} in round {token}")]
    UnexpectedSender { token: String, sender: String },

    #[error("Unexpected {performative} for {context}")]
    UnexpectedPerformative {
        context: String,
        performative: Performative,
    },

    #[error("Reply for round {token} after deadline {deadline} (now {now})")]
    DeadlinePassed { token: String, deadline: Tick, now: Tick },

    #[error("Round {0} is already closed")]
    SessionClosed(String),
}
