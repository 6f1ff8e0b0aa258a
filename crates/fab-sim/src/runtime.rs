//! Tick-driven agent runtime.
//!
//! Every agent runs in its own tokio task. The coordinator advances the
//! clock, publishes the tick on a `watch` channel and waits until every
//! agent has reported its round on an `mpsc` channel before moving on.
//! Envelopes produced in tick `t` are read by their recipients in `t + 1`.
//!
//! After the barrier the coordinator alone touches shared plant state: jobs
//! orphaned by failures during the tick are delegated in roster order, then
//! the supervisor runs. Agent tasks only ever write their own machine, so a
//! seeded run is reproducible on any number of worker threads.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use fab_negotiation::{StockLedger, SupplierNegotiator, TransportNegotiator};
use fab_network::{Mailbox, MessageBus, NetworkError};
use fab_plant::{DelegationQueue, Machine, MachineAgent, MaintenanceScheduler, PlantError};
use fab_protocol::{AgentId, Batch, Envelope, Tick};
use fab_state::{Environment, EnvironmentConfig, Schedulable};

use crate::config::{ConfigError, SimConfig};
use crate::report::RunReport;
use crate::supervisor::{RefillPlan, Supervisor};

/// Mailbox address of the maintenance scheduler.
pub const MAINTENANCE_ID: &str = "maintenance";

/// Upper bound on one tick's rounds.
const ROUND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SimError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Plant error: {0}")]
    Plant(#[from] PlantError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Agent task stopped before tick {0} finished")]
    AgentStopped(Tick),

    #[error("Tick {0} did not finish within {1:?}")]
    RoundTimeout(Tick, Duration),

    #[error("Agent task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

/// Anything that takes part in the per-tick rounds.
pub trait RoundAgent: Send {
    fn id(&self) -> &AgentId;

    fn on_round(&mut self, now: Tick, inbox: Vec<Envelope>) -> Vec<Envelope>;
}

impl RoundAgent for MachineAgent {
    fn id(&self) -> &AgentId {
        MachineAgent::id(self)
    }

    fn on_round(&mut self, now: Tick, inbox: Vec<Envelope>) -> Vec<Envelope> {
        MachineAgent::on_round(self, now, inbox)
    }
}

impl RoundAgent for SupplierNegotiator {
    fn id(&self) -> &AgentId {
        SupplierNegotiator::id(self)
    }

    fn on_round(&mut self, now: Tick, inbox: Vec<Envelope>) -> Vec<Envelope> {
        SupplierNegotiator::on_round(self, now, inbox)
    }
}

impl RoundAgent for TransportNegotiator {
    fn id(&self) -> &AgentId {
        TransportNegotiator::id(self)
    }

    fn on_round(&mut self, now: Tick, inbox: Vec<Envelope>) -> Vec<Envelope> {
        TransportNegotiator::on_round(self, now, inbox)
    }
}

impl RoundAgent for MaintenanceScheduler {
    fn id(&self) -> &AgentId {
        MaintenanceScheduler::id(self)
    }

    /// Failure notices arrive on the scheduler's own channel; nothing is
    /// expected in the mailbox.
    fn on_round(&mut self, now: Tick, inbox: Vec<Envelope>) -> Vec<Envelope> {
        for envelope in inbox {
            tracing::debug!(from = %envelope.from, "Maintenance ignores mailbox traffic");
        }
        MaintenanceScheduler::on_round(self, now);
        Vec::new()
    }
}

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

/// Seed for the `index`-th random source derived from the run seed.
fn derive_seed(seed: Option<u64>, index: u64) -> Option<u64> {
    seed.map(|s| s ^ (index + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

/// A fully wired simulation, ready to run.
pub struct Simulation {
    config: SimConfig,
    env: Arc<Environment>,
    bus: Arc<MessageBus>,
    agents: Vec<(Box<dyn RoundAgent>, Mailbox)>,
    machines: Vec<Arc<Machine>>,
    stocks: BTreeMap<AgentId, StockLedger>,
    delegations: DelegationQueue,
}

impl Simulation {
    pub fn build(config: SimConfig) -> Result<Self, SimError> {
        config.validate()?;
        let seed = config.simulation.seed;
        let env = Arc::new(Environment::new(EnvironmentConfig {
            external_failure_rate: config.maintenance.external_failure_rate,
            seed: derive_seed(seed, 0),
        }));
        let bus = MessageBus::new();
        let mut agents: Vec<(Box<dyn RoundAgent>, Mailbox)> = Vec::new();

        let (maintenance, handle) = MaintenanceScheduler::new(
            AgentId::new(MAINTENANCE_ID.into()),
            config.maintenance.policy(),
            derive_seed(seed, 1),
            env.clone(),
        )?;
        let mailbox = bus.register(maintenance.id().clone())?;
        agents.push((Box::new(maintenance), mailbox));

        let transport_ids: Vec<AgentId> = config
            .transports
            .iter()
            .map(|t| AgentId::new(t.id.clone()))
            .collect();
        for (cfg, id) in config.transports.iter().zip(&transport_ids) {
            let agent = TransportNegotiator::new(id.clone(), cfg.settings(&config.negotiation), env.clone());
            let mailbox = bus.register(id.clone())?;
            agents.push((Box::new(agent), mailbox));
        }

        let mut stocks = BTreeMap::new();
        let mut supplier_ids = Vec::new();
        for cfg in &config.suppliers {
            let id = AgentId::new(cfg.id.clone());
            let ledger = StockLedger::new(cfg.stock);
            stocks.insert(id.clone(), ledger.clone());
            supplier_ids.push(id.clone());
            let agent = SupplierNegotiator::new(
                id.clone(),
                cfg.settings(&config.negotiation),
                ledger,
                transport_ids.clone(),
                env.clone(),
            );
            let mailbox = bus.register(id)?;
            agents.push((Box::new(agent), mailbox));
        }

        let delegations = DelegationQueue::new();
        let mut machines = Vec::new();
        for (index, cfg) in config.machines.iter().enumerate() {
            let machine = Arc::new(Machine::new(cfg.to_spec()?)?);
            env.register(machine.clone());
            machines.push(machine.clone());

            let agent = MachineAgent::new(
                machine.clone(),
                supplier_ids.clone(),
                config.negotiation.procurement(),
                derive_seed(seed, 2 + index as u64),
                handle.clone(),
                delegations.clone(),
                env.clone(),
            )?;
            let mailbox = bus.register(machine.id().clone())?;
            agents.push((Box::new(agent), mailbox));
        }

        tracing::info!(
            machines = machines.len(),
            suppliers = supplier_ids.len(),
            transports = transport_ids.len(),
            seed = ?seed,
            "Simulation wired"
        );

        Ok(Self {
            config,
            env,
            bus,
            agents,
            machines,
            stocks,
            delegations,
        })
    }

    pub fn env(&self) -> &Arc<Environment> {
        &self.env
    }

    pub fn machines(&self) -> &[Arc<Machine>] {
        &self.machines
    }

    pub fn stock(&self, supplier: &AgentId) -> Option<Batch> {
        self.stocks.get(supplier).map(StockLedger::level)
    }

    /// Run `config.simulation.ticks` ticks and report.
    pub async fn run(self) -> Result<RunReport, SimError> {
        let ticks = self.config.simulation.ticks;
        self.run_for(ticks).await
    }

    pub async fn run_for(self, ticks: u64) -> Result<RunReport, SimError> {
        let Self {
            config,
            env,
            bus,
            agents,
            machines,
            stocks,
            delegations,
        } = self;
        let started_at = chrono::Utc::now();

        let supervisor = Supervisor::new(
            refill_plan(&config, &stocks),
            config.simulation.report_every,
            env.clone(),
        );

        let (tick_tx, _) = watch::channel::<Tick>(env.now());
        let (done_tx, mut done_rx) = mpsc::channel::<AgentId>(agents.len().max(1));
        let agent_count = agents.len();
        let handles: Vec<JoinHandle<()>> = agents
            .into_iter()
            .map(|(agent, mailbox)| spawn_agent(agent, mailbox, tick_tx.subscribe(), done_tx.clone()))
            .collect();
        drop(done_tx);

        let interval = Duration::from_millis(config.simulation.tick_interval_ms);
        let mut outcome = Ok(());
        for _ in 0..ticks {
            let now = env.tick().time;
            if tick_tx.send(now).is_err() {
                outcome = Err(SimError::AgentStopped(now));
                break;
            }
            if let Err(e) = await_round(&mut done_rx, agent_count, now).await {
                outcome = Err(e);
                break;
            }
            delegations.dispatch(&env);
            supervisor.after_tick(now);
            if !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
        }

        drop(tick_tx);
        for handle in handles {
            handle.await?;
        }
        outcome?;

        let snapshot = env.snapshot();
        crate::supervisor::report(&snapshot);
        Ok(RunReport::new(
            started_at,
            config.simulation.seed,
            snapshot,
            machines.iter().map(|m| m.status()).collect(),
            stocks.iter().map(|(id, ledger)| (id.clone(), ledger.level())).collect(),
            bus.stats(),
        ))
    }
}

fn refill_plan(config: &SimConfig, stocks: &BTreeMap<AgentId, StockLedger>) -> Option<RefillPlan> {
    let supplier = AgentId::new(config.refill.target.clone());
    let ledger = stocks.get(&supplier)?.clone();
    Some(RefillPlan {
        supplier,
        ledger,
        amount: config.refill.amount,
        every: config.refill.every,
    })
}

// ---------------------------------------------------------------------------
// Tick loop
// ---------------------------------------------------------------------------

fn spawn_agent(
    mut agent: Box<dyn RoundAgent>,
    mut mailbox: Mailbox,
    mut ticks: watch::Receiver<Tick>,
    done: mpsc::Sender<AgentId>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while ticks.changed().await.is_ok() {
            let now = *ticks.borrow_and_update();
            let inbox = mailbox.drain_before(now);
            for envelope in agent.on_round(now, inbox) {
                mailbox.send(envelope);
            }
            if done.send(agent.id().clone()).await.is_err() {
                break;
            }
        }
        tracing::debug!(agent = %agent.id(), "Agent task stopped");
    })
}

/// Wait until `expected` agents finished tick `now`.
async fn await_round(done: &mut mpsc::Receiver<AgentId>, expected: usize, now: Tick) -> Result<(), SimError> {
    for _ in 0..expected {
        match tokio::time::timeout(ROUND_TIMEOUT, done.recv()).await {
            Ok(Some(_)) => {}
            Ok(None) => return Err(SimError::AgentStopped(now)),
            Err(_) => return Err(SimError::RoundTimeout(now, ROUND_TIMEOUT)),
        }
    }
    Ok(())
}
