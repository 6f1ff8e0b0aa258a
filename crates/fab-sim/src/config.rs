//! Simulation configuration.
//!
//! Loaded from TOML; every section is optional and falls back to the
//! built-in scenario (two suppliers, two transport robots, three machines).

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use fab_negotiation::{Pricing, SessionTimeouts, SupplierSettings, TransportSettings};
use fab_plant::{MachineSpec, ProcurementSettings, RepairPolicy};
use fab_protocol::{
    AgentId, Batch, Stage, DEFAULT_BACKOFF_TICKS_MAX, DEFAULT_BACKOFF_TICKS_MIN,
    DEFAULT_CFP_TIMEOUT_TICKS, DEFAULT_COOLDOWN_TICKS_MAX, DEFAULT_COOLDOWN_TICKS_MIN,
    DEFAULT_INFORM_TIMEOUT_TICKS, DEFAULT_OFFER_TTL_TICKS, DEFAULT_REPAIR_TICKS_MAX,
    DEFAULT_REPAIR_TICKS_MIN, TRANSPORT_ROUND_OVERHEAD_TICKS,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Top-level simulation configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub simulation: SimulationConfig,
    pub negotiation: NegotiationConfig,
    pub maintenance: MaintenanceConfig,
    pub refill: RefillConfig,
    pub machines: Vec<MachineConfig>,
    pub suppliers: Vec<SupplierConfig>,
    pub transports: Vec<TransportConfig>,
}

/// Clock and reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Number of ticks to run.
    pub ticks: u64,
    /// Wall-clock pause between ticks, in milliseconds (0 = as fast as possible).
    pub tick_interval_ms: u64,
    /// Seed for every random source. Unset means entropy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Log a metrics report every this many ticks (0 = never).
    pub report_every: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            ticks: 200,
            tick_interval_ms: 0,
            seed: None,
            report_every: 25,
        }
    }
}

/// Contract-Net timing, shared by machine and supplier rounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// Ticks an initiator collects PROPOSE/REFUSE.
    pub cfp_timeout: u64,
    /// Ticks an initiator waits for INFORM after ACCEPT. A supplier's
    /// transport round has to fit inside the machine's window.
    pub inform_timeout: u64,
    /// Inclusive wait after a round that produced nothing.
    pub backoff_min: u64,
    pub backoff_max: u64,
    /// Inclusive wait after a delivery.
    pub cooldown_min: u64,
    pub cooldown_max: u64,
    /// Ticks a participant keeps an unanswered offer.
    pub offer_ttl: u64,
    /// A machine opens no round while this many jobs are queued.
    pub max_queue: usize,
    /// Batch each machine asks for.
    pub batch: Batch,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            cfp_timeout: DEFAULT_CFP_TIMEOUT_TICKS,
            inform_timeout: DEFAULT_INFORM_TIMEOUT_TICKS,
            backoff_min: DEFAULT_BACKOFF_TICKS_MIN,
            backoff_max: DEFAULT_BACKOFF_TICKS_MAX,
            cooldown_min: DEFAULT_COOLDOWN_TICKS_MIN,
            cooldown_max: DEFAULT_COOLDOWN_TICKS_MAX,
            offer_ttl: DEFAULT_OFFER_TTL_TICKS,
            max_queue: 2,
            batch: Batch::new(10, 5, 3),
        }
    }
}

impl NegotiationConfig {
    pub fn timeouts(&self) -> SessionTimeouts {
        SessionTimeouts {
            cfp_timeout: self.cfp_timeout,
            inform_timeout: self.inform_timeout,
        }
    }

    pub fn procurement(&self) -> ProcurementSettings {
        ProcurementSettings {
            batch: self.batch,
            timeouts: self.timeouts(),
            backoff: (self.backoff_min, self.backoff_max),
            cooldown: (self.cooldown_min, self.cooldown_max),
            max_queue: self.max_queue,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Inclusive bounds of a drawn repair duration, in ticks.
    pub repair_min: u32,
    pub repair_max: u32,
    /// Per-tick probability that the environment breaks a healthy machine.
    pub external_failure_rate: f64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            repair_min: DEFAULT_REPAIR_TICKS_MIN,
            repair_max: DEFAULT_REPAIR_TICKS_MAX,
            external_failure_rate: 0.0,
        }
    }
}

impl MaintenanceConfig {
    pub fn policy(&self) -> RepairPolicy {
        RepairPolicy {
            min_ticks: self.repair_min,
            max_ticks: self.repair_max,
        }
    }
}

/// Periodic stock top-up done by the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefillConfig {
    /// Refill every this many ticks (0 = never).
    pub every: u64,
    pub amount: Batch,
    /// Supplier id receiving the refill.
    pub target: String,
}

impl Default for RefillConfig {
    fn default() -> Self {
        Self {
            every: 30,
            amount: Batch::new(30, 20, 15),
            target: "supplierA".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Unique agent id.
    pub id: String,
    /// Stage names, any order.
    pub capabilities: Vec<String>,
    /// Ticks per stage name.
    #[serde(default)]
    pub durations: BTreeMap<String, u32>,
    /// Per-round probability of a spontaneous failure.
    #[serde(default)]
    pub failure_rate: f64,
}

impl MachineConfig {
    pub fn to_spec(&self) -> Result<MachineSpec, ConfigError> {
        let capabilities = self
            .capabilities
            .iter()
            .map(|name| name.parse::<Stage>())
            .collect::<Result<BTreeSet<_>, _>>()
            .map_err(|e| invalid(format!("machine {}: {e}", self.id)))?;
        let durations = self
            .durations
            .iter()
            .map(|(name, ticks)| name.parse::<Stage>().map(|stage| (stage, *ticks)))
            .collect::<Result<BTreeMap<_, _>, _>>()
            .map_err(|e| invalid(format!("machine {}: {e}", self.id)))?;
        Ok(MachineSpec {
            id: AgentId::new(self.id.clone()),
            capabilities,
            durations,
            failure_rate: self.failure_rate,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupplierConfig {
    /// Unique agent id.
    pub id: String,
    /// Stock on hand at tick 0.
    pub stock: Batch,
    /// Per-order ceiling.
    pub capacity: Batch,
    /// Distance every delivery travels.
    #[serde(default = "default_delivery_distance")]
    pub delivery_distance: u32,
    #[serde(default)]
    pub pricing: Pricing,
}

fn default_delivery_distance() -> u32 {
    4
}

impl SupplierConfig {
    pub fn settings(&self, negotiation: &NegotiationConfig) -> SupplierSettings {
        SupplierSettings {
            capacity: self.capacity,
            pricing: self.pricing,
            delivery_distance: self.delivery_distance,
            offer_ttl: negotiation.offer_ttl,
            timeouts: negotiation.timeouts(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Unique agent id.
    pub id: String,
    /// Largest batch (total units) carried in one trip.
    pub max_load: u64,
    /// Ticks per unit of distance.
    pub speed: f64,
    /// Quoted cost per unit of distance.
    pub cost_per_distance: u32,
}

impl TransportConfig {
    pub fn settings(&self, negotiation: &NegotiationConfig) -> TransportSettings {
        TransportSettings {
            max_load: self.max_load,
            speed: self.speed,
            cost_per_distance: self.cost_per_distance,
            offer_ttl: negotiation.offer_ttl,
        }
    }
}

// ---------------------------------------------------------------------------
// Built-in scenario, loading and validation
// ---------------------------------------------------------------------------

impl Default for SimConfig {
    fn default() -> Self {
        let machine = |id: &str, stages: &[(&str, u32)], failure_rate: f64| MachineConfig {
            id: id.into(),
            capabilities: stages.iter().map(|(s, _)| s.to_string()).collect(),
            durations: stages.iter().map(|(s, t)| (s.to_string(), *t)).collect(),
            failure_rate,
        };
        Self {
            simulation: SimulationConfig::default(),
            negotiation: NegotiationConfig::default(),
            maintenance: MaintenanceConfig::default(),
            refill: RefillConfig::default(),
            machines: vec![
                machine("mixer", &[("cutting", 2), ("mixing", 3), ("baking", 4)], 0.02),
                machine("oven", &[("mixing", 3), ("baking", 4), ("packaging", 2)], 0.02),
                machine("packer", &[("baking", 5), ("packaging", 2)], 0.01),
            ],
            suppliers: vec![
                SupplierConfig {
                    id: "supplierA".into(),
                    stock: Batch::new(60, 40, 30),
                    capacity: Batch::new(50, 30, 20),
                    delivery_distance: 4,
                    pricing: Pricing::default(),
                },
                SupplierConfig {
                    id: "supplierB".into(),
                    stock: Batch::new(45, 50, 25),
                    capacity: Batch::new(50, 30, 20),
                    delivery_distance: 6,
                    pricing: Pricing {
                        base_lead_time: 2,
                        base_cost: 18,
                        ..Pricing::default()
                    },
                },
            ],
            transports: vec![
                TransportConfig {
                    id: "robot1".into(),
                    max_load: 60,
                    speed: 0.5,
                    cost_per_distance: 3,
                },
                TransportConfig {
                    id: "robot2".into(),
                    max_load: 40,
                    speed: 0.75,
                    cost_per_distance: 2,
                },
            ],
        }
    }
}

impl SimConfig {
    /// Default config file location: `<config dir>/fab-sim/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("fab-sim").join("config.toml"))
    }

    pub fn from_toml_str(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&contents, path)?;
        config.validate()?;
        Ok(config)
    }

    /// `explicit` if given, else the default path if it exists, else the
    /// built-in scenario.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.machines.is_empty() {
            return Err(invalid("at least one machine is required"));
        }
        if self.suppliers.is_empty() {
            return Err(invalid("at least one supplier is required"));
        }

        let mut ids = BTreeSet::new();
        let all_ids = self
            .machines
            .iter()
            .map(|m| &m.id)
            .chain(self.suppliers.iter().map(|s| &s.id))
            .chain(self.transports.iter().map(|t| &t.id));
        for id in all_ids {
            if id.is_empty() {
                return Err(invalid("agent ids must not be empty"));
            }
            if id == crate::runtime::MAINTENANCE_ID {
                return Err(invalid(format!("agent id {id} is reserved")));
            }
            if !ids.insert(id.as_str()) {
                return Err(invalid(format!("duplicate agent id {id}")));
            }
        }

        for machine in &self.machines {
            let spec = machine.to_spec()?;
            if spec.capabilities.is_empty() {
                return Err(invalid(format!("machine {} has no capabilities", machine.id)));
            }
            if let Some((stage, _)) = spec.durations.iter().find(|(_, ticks)| **ticks == 0) {
                return Err(invalid(format!(
                    "machine {} has a zero duration for {stage}",
                    machine.id
                )));
            }
            check_probability(&format!("machine {} failure_rate", machine.id), machine.failure_rate)?;
        }
        for transport in &self.transports {
            if !(transport.speed.is_finite() && transport.speed > 0.0) {
                return Err(invalid(format!("transport {} speed must be positive", transport.id)));
            }
        }

        let n = &self.negotiation;
        if n.cfp_timeout == 0 || n.inform_timeout == 0 {
            return Err(invalid("negotiation timeouts must be at least one tick"));
        }
        if n.max_queue == 0 {
            return Err(invalid("negotiation.max_queue must be at least 1"));
        }
        check_range("negotiation.backoff", n.backoff_min, n.backoff_max)?;
        check_range("negotiation.cooldown", n.cooldown_min, n.cooldown_max)?;
        self.check_delivery_windows()?;

        let m = &self.maintenance;
        if m.repair_min == 0 {
            return Err(invalid("maintenance.repair_min must be at least 1"));
        }
        check_range("maintenance.repair", u64::from(m.repair_min), u64::from(m.repair_max))?;
        check_probability("maintenance.external_failure_rate", m.external_failure_rate)?;

        if self.refill.every > 0 && !self.suppliers.iter().any(|s| s.id == self.refill.target) {
            return Err(invalid(format!(
                "refill target {} is not a supplier",
                self.refill.target
            )));
        }
        Ok(())
    }
}

impl SimConfig {
    /// Every supplier needs at least one robot whose trip, plus the
    /// transport round's hops and the two hops to and from the machine,
    /// fits in `inform_timeout`.
    fn check_delivery_windows(&self) -> Result<(), ConfigError> {
        let n = &self.negotiation;
        for supplier in &self.suppliers {
            let fastest = self
                .transports
                .iter()
                .map(|t| t.settings(n).travel_ticks(supplier.delivery_distance))
                .min();
            let Some(travel) = fastest else {
                return Ok(());
            };
            let needed = u64::from(travel) + TRANSPORT_ROUND_OVERHEAD_TICKS + 2;
            if needed > n.inform_timeout {
                return Err(invalid(format!(
                    "supplier {}: fastest trip over distance {} takes {travel} ticks, \
                     negotiation.inform_timeout must be at least {needed}",
                    supplier.id, supplier.delivery_distance
                )));
            }
        }
        Ok(())
    }
}

fn check_range(name: &str, min: u64, max: u64) -> Result<(), ConfigError> {
    if min > max {
        return Err(invalid(format!("{name} range {min}..={max} is inverted")));
    }
    Ok(())
}

fn check_probability(name: &str, p: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&p) {
        return Err(invalid(format!("{name} {p} is outside [0, 1]")));
    }
    Ok(())
}
