/// Protocol tag carried by every Contract-Net envelope, nested transport
/// rounds included.
pub const PROTOCOL_CNP: &str = "cnp";

/// Ticks an initiator keeps collecting PROPOSE/REFUSE replies.
pub const DEFAULT_CFP_TIMEOUT_TICKS: u64 = 3;

/// Ticks an initiator waits for the winner's INFORM after ACCEPT.
pub const DEFAULT_INFORM_TIMEOUT_TICKS: u64 = 12;

/// Bus hops a supplier's transport round adds on top of the trip itself:
/// transport CFP, PROPOSE, ACCEPT and the transport's INFORM each cost one
/// tick. A supplier reading ACCEPT at `t` forwards INFORM at
/// `t + TRANSPORT_ROUND_OVERHEAD_TICKS + travel`.
pub const TRANSPORT_ROUND_OVERHEAD_TICKS: u64 = 4;

/// Ticks a participant remembers an unanswered PROPOSE.
pub const DEFAULT_OFFER_TTL_TICKS: u64 = 20;

/// Inclusive bounds of a randomized repair duration.
pub const DEFAULT_REPAIR_TICKS_MIN: u32 = 3;
pub const DEFAULT_REPAIR_TICKS_MAX: u32 = 7;

/// Inclusive bounds of the back-off after a round with no proposals.
pub const DEFAULT_BACKOFF_TICKS_MIN: u64 = 5;
pub const DEFAULT_BACKOFF_TICKS_MAX: u64 = 8;

/// Inclusive bounds of the pause between two successful contracts.
pub const DEFAULT_COOLDOWN_TICKS_MIN: u64 = 3;
pub const DEFAULT_COOLDOWN_TICKS_MAX: u64 = 6;
