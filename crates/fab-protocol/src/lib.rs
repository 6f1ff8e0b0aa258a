//! Fab Protocol - Core types and message definitions
//!
//! Shared vocabulary of the bakery production simulation: agent identities,
//! raw materials and batches, production stages, jobs, and the typed
//! Contract-Net envelope exchanged between machines, suppliers and
//! transport units.

pub mod identity;
pub mod types;
pub mod job;
pub mod messages;
pub mod error;
pub mod constants;

pub use identity::*;
pub use types::*;
pub use job::*;
pub use messages::*;
pub use error::*;
pub use constants::*;
