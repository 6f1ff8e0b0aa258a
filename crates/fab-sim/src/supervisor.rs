//! Supervisor hooks run by the coordinator after every tick's rounds.

use std::sync::Arc;

use fab_negotiation::StockLedger;
use fab_protocol::{AgentId, Batch, Tick};
use fab_state::{Environment, MetricsSnapshot};

/// Periodic stock top-up of one supplier.
#[derive(Debug, Clone)]
pub struct RefillPlan {
    pub supplier: AgentId,
    /// Shared with the supplier agent.
    pub ledger: StockLedger,
    pub amount: Batch,
    /// Refill period in ticks.
    pub every: u64,
}

pub struct Supervisor {
    refill: Option<RefillPlan>,
    report_every: u64,
    env: Arc<Environment>,
}

impl Supervisor {
    pub fn new(refill: Option<RefillPlan>, report_every: u64, env: Arc<Environment>) -> Self {
        let refill = refill.filter(|plan| plan.every > 0 && !plan.amount.is_empty());
        Self {
            refill,
            report_every,
            env,
        }
    }

    /// Refill when due, then log a report when due. Returns the new stock
    /// level if a refill happened.
    pub fn after_tick(&self, now: Tick) -> Option<Batch> {
        let refilled = self.refill_if_due(now);
        if self.report_every > 0 && now % self.report_every == 0 {
            report(&self.env.snapshot());
        }
        refilled
    }

    fn refill_if_due(&self, now: Tick) -> Option<Batch> {
        let plan = self.refill.as_ref()?;
        if now == 0 || now % plan.every != 0 {
            return None;
        }
        let level = plan.ledger.refill(&plan.amount);
        self.env.metrics().stock_refills.incr();
        tracing::info!(
            supplier = %plan.supplier,
            amount = %plan.amount,
            stock = %level,
            tick = now,
            "Supplier stock refilled"
        );
        Some(level)
    }
}

/// Structured metrics report.
pub fn report(m: &MetricsSnapshot) {
    tracing::info!(
        tick = m.time,
        cfp = m.cnp_cfp,
        accepts = m.cnp_accepts,
        informs = m.cnp_informs,
        timeouts = m.cnp_timeouts,
        transport_cfp = m.transport_cfp,
        transport_informs = m.transport_informs,
        transport_timeouts = m.transport_timeouts,
        refused = m.requests_refused,
        overcommits = m.supplier_overcommits,
        trips = m.transport_trips,
        failures = m.machine_failures,
        repairs_started = m.repairs_started,
        repairs_finished = m.repairs_finished,
        downtime = m.machine_downtime_ticks,
        jobs_created = m.jobs_created,
        jobs_completed = m.jobs_completed,
        jobs_delegated = m.jobs_delegated,
        jobs_lost = m.jobs_lost,
        "Metrics"
    );
}
