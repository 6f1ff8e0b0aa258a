use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use fab_protocol::{Batch, Tick};

/// Monotonic counter safe to bump from any agent task.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn incr(&self) {
        self.add(1);
    }

    pub fn add(&self, amount: u64) {
        self.0.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Process-wide counters. Each field only ever grows; no cross-field
/// consistency is promised.
///
/// `cnp_*` count the machine-to-supplier rounds only; the suppliers' nested
/// rounds are counted in `transport_*`, so one procurement is never counted
/// twice.
#[derive(Debug, Default)]
pub struct Metrics {
    // Procurement rounds opened by machines.
    /// Material rounds opened.
    pub cnp_cfp: Counter,
    /// Supplier PROPOSEs received by machines.
    pub cnp_proposals: Counter,
    /// Material rounds awarded to a supplier.
    pub cnp_accepts: Counter,
    /// Deliveries confirmed to a machine.
    pub cnp_informs: Counter,
    /// Material rounds whose winner stayed silent past the INFORM deadline.
    pub cnp_timeouts: Counter,

    // Nested transport rounds opened by suppliers.
    /// Transport rounds opened.
    pub transport_cfp: Counter,
    /// Transport PROPOSEs received by suppliers.
    pub transport_proposals: Counter,
    /// Transport rounds awarded to a robot.
    pub transport_accepts: Counter,
    /// Trips confirmed to a supplier.
    pub transport_informs: Counter,
    /// Transport rounds that ran out of time, cutoff included.
    pub transport_timeouts: Counter,

    // Participants.
    /// REFUSE replies sent by suppliers and transports.
    pub requests_refused: Counter,
    /// Accepted orders a supplier could no longer cover.
    pub supplier_overcommits: Counter,
    pub delivered_flour: Counter,
    pub delivered_sugar: Counter,
    pub delivered_butter: Counter,
    /// Trips finished, whether or not the round still waited.
    pub transport_trips: Counter,
    pub stock_refills: Counter,

    // Plant.
    pub machine_failures: Counter,
    pub repairs_started: Counter,
    pub repairs_finished: Counter,
    /// Sum over ticks of machines down in that tick.
    pub machine_downtime_ticks: Counter,
    pub jobs_created: Counter,
    pub jobs_completed: Counter,
    /// Jobs moved to a peer after their machine failed.
    pub jobs_delegated: Counter,
    /// Orphaned jobs no peer could take.
    pub jobs_lost: Counter,
}

impl Metrics {
    pub fn record_delivery(&self, batch: &Batch) {
        self.delivered_flour.add(batch.flour as u64);
        self.delivered_sugar.add(batch.sugar as u64);
        self.delivered_butter.add(batch.butter as u64);
    }

    pub fn snapshot(&self, time: Tick) -> MetricsSnapshot {
        MetricsSnapshot {
            time,
            cnp_cfp: self.cnp_cfp.get(),
            cnp_proposals: self.cnp_proposals.get(),
            cnp_accepts: self.cnp_accepts.get(),
            cnp_informs: self.cnp_informs.get(),
            cnp_timeouts: self.cnp_timeouts.get(),
            transport_cfp: self.transport_cfp.get(),
            transport_proposals: self.transport_proposals.get(),
            transport_accepts: self.transport_accepts.get(),
            transport_informs: self.transport_informs.get(),
            transport_timeouts: self.transport_timeouts.get(),
            requests_refused: self.requests_refused.get(),
            supplier_overcommits: self.supplier_overcommits.get(),
            delivered_flour: self.delivered_flour.get(),
            delivered_sugar: self.delivered_sugar.get(),
            delivered_butter: self.delivered_butter.get(),
            transport_trips: self.transport_trips.get(),
            stock_refills: self.stock_refills.get(),
            machine_failures: self.machine_failures.get(),
            repairs_started: self.repairs_started.get(),
            repairs_finished: self.repairs_finished.get(),
            machine_downtime_ticks: self.machine_downtime_ticks.get(),
            jobs_created: self.jobs_created.get(),
            jobs_completed: self.jobs_completed.get(),
            jobs_delegated: self.jobs_delegated.get(),
            jobs_lost: self.jobs_lost.get(),
        }
    }
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Tick at which the copy was taken.
    pub time: Tick,
    pub cnp_cfp: u64,
    pub cnp_proposals: u64,
    pub cnp_accepts: u64,
    pub cnp_informs: u64,
    pub cnp_timeouts: u64,
    pub transport_cfp: u64,
    pub transport_proposals: u64,
    pub transport_accepts: u64,
    pub transport_informs: u64,
    pub transport_timeouts: u64,
    pub requests_refused: u64,
    pub supplier_overcommits: u64,
    pub delivered_flour: u64,
    pub delivered_sugar: u64,
    pub delivered_butter: u64,
    pub transport_trips: u64,
    pub stock_refills: u64,
    pub machine_failures: u64,
    pub repairs_started: u64,
    pub repairs_finished: u64,
    pub machine_downtime_ticks: u64,
    pub jobs_created: u64,
    pub jobs_completed: u64,
    pub jobs_delegated: u64,
    pub jobs_lost: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let metrics = Arc::new(Metrics::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        m.jobs_completed.incr();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(metrics.jobs_completed.get(), 8000);
    }

    #[test]
    fn test_delivery_splits_by_material() {
        let metrics = Metrics::default();
        metrics.record_delivery(&Batch::new(10, 5, 3));
        metrics.record_delivery(&Batch::new(10, 5, 3));
        let snap = metrics.snapshot(7);
        assert_eq!(snap.time, 7);
        assert_eq!(
            (snap.delivered_flour, snap.delivered_sugar, snap.delivered_butter),
            (20, 10, 6)
        );
    }
}
