//! In-process message bus for the bakery simulation.
//!
//! Stands in for the agent platform's message transport: every agent owns a
//! [`Mailbox`] registered under its [`AgentId`](fab_protocol::AgentId);
//! sending is fire-and-forget and receiving is a polling receive with a
//! timeout. Delivery is not guaranteed: envelopes addressed to unknown
//! agents are counted and dropped.

pub mod bus;

pub use bus::{BusStats, Mailbox, MessageBus};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Agent already registered: {0}")]
    DuplicateAgent(String),
}
