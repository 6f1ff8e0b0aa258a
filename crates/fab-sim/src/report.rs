//! End-of-run report.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fab_network::BusStats;
use fab_plant::MachineStatus;
use fab_protocol::{AgentId, Batch};
use fab_state::MetricsSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusReport {
    pub delivered: u64,
    /// Envelopes with no live recipient.
    pub dropped: u64,
}

impl From<BusStats> for BusReport {
    fn from(stats: BusStats) -> Self {
        Self {
            delivered: stats.delivered,
            dropped: stats.dropped,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub seed: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub metrics: MetricsSnapshot,
    pub machines: Vec<MachineStatus>,
    pub stock: BTreeMap<AgentId, Batch>,
    pub bus: BusReport,
}

impl RunReport {
    pub fn new(
        started_at: DateTime<Utc>,
        seed: Option<u64>,
        metrics: MetricsSnapshot,
        machines: Vec<MachineStatus>,
        stock: BTreeMap<AgentId, Batch>,
        bus: BusStats,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            seed,
            started_at,
            finished_at: Utc::now(),
            metrics,
            machines,
            stock,
            bus: bus.into(),
        }
    }

    pub fn ticks(&self) -> u64 {
        self.metrics.time
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Human-readable summary.
    pub fn render(&self) -> String {
        let m = &self.metrics;
        let mut out = String::new();
        let _ = writeln!(out, "run {} ({} ticks)", self.run_id, m.time);
        if let Some(seed) = self.seed {
            let _ = writeln!(out, "seed {seed}");
        }

        let _ = writeln!(out, "\nnegotiation            machine  transport");
        let rounds = [
            ("cfp", m.cnp_cfp, m.transport_cfp),
            ("proposals", m.cnp_proposals, m.transport_proposals),
            ("accepts", m.cnp_accepts, m.transport_accepts),
            ("informs", m.cnp_informs, m.transport_informs),
            ("timeouts", m.cnp_timeouts, m.transport_timeouts),
        ];
        for (name, machine, transport) in rounds {
            let _ = writeln!(out, "  {name:<16} {machine:>8} {transport:>10}");
        }
        let rows = [
            ("refused", m.requests_refused),
            ("overcommits", m.supplier_overcommits),
            ("transport trips", m.transport_trips),
            ("stock refills", m.stock_refills),
        ];
        for (name, value) in rows {
            let _ = writeln!(out, "  {name:<16} {value:>8}");
        }

        let _ = writeln!(out, "\ndelivered");
        let _ = writeln!(out, "  {:<16} {:>8}", "flour", m.delivered_flour);
        let _ = writeln!(out, "  {:<16} {:>8}", "sugar", m.delivered_sugar);
        let _ = writeln!(out, "  {:<16} {:>8}", "butter", m.delivered_butter);

        let _ = writeln!(out, "\nproduction");
        let rows = [
            ("jobs created", m.jobs_created),
            ("jobs completed", m.jobs_completed),
            ("jobs delegated", m.jobs_delegated),
            ("jobs lost", m.jobs_lost),
            ("failures", m.machine_failures),
            ("repairs started", m.repairs_started),
            ("repairs finished", m.repairs_finished),
            ("downtime ticks", m.machine_downtime_ticks),
        ];
        for (name, value) in rows {
            let _ = writeln!(out, "  {name:<16} {value:>8}");
        }

        let _ = writeln!(out, "\nmachines");
        for status in &self.machines {
            let state = if status.failed {
                format!("FAILED (repair {} left)", status.repair_ticks_remaining)
            } else {
                match (&status.current_job, status.current_stage) {
                    (Some(job), Some(stage)) => {
                        format!("{job} {stage} ({} left)", status.stage_ticks_remaining)
                    }
                    _ => "idle".to_string(),
                }
            };
            let _ = writeln!(out, "  {:<12} {state}, {} queued", status.id, status.queued);
        }

        let _ = writeln!(out, "\nstock");
        for (supplier, level) in &self.stock {
            let _ = writeln!(out, "  {supplier:<12} {level}");
        }

        let _ = writeln!(
            out,
            "\nbus: {} delivered, {} dropped",
            self.bus.delivered, self.bus.dropped
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RunReport {
        let mut stock = BTreeMap::new();
        stock.insert(AgentId::new("supplierA".into()), Batch::new(1, 2, 3));
        RunReport::new(
            Utc::now(),
            Some(7),
            MetricsSnapshot {
                time: 12,
                cnp_informs: 3,
                transport_informs: 2,
                jobs_created: 3,
                ..MetricsSnapshot::default()
            },
            vec![MachineStatus {
                id: AgentId::new("oven".into()),
                failed: true,
                repair_ticks_remaining: 2,
                current_job: None,
                current_stage: None,
                stage_ticks_remaining: 0,
                queued: 1,
            }],
            stock,
            BusStats {
                delivered: 40,
                dropped: 1,
            },
        )
    }

    #[test]
    fn test_json_report_carries_metrics_and_stock() {
        let report = sample();
        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["metrics"]["time"], 12);
        assert_eq!(json["metrics"]["jobs_created"], 3);
        assert_eq!(json["seed"], 7);
        assert_eq!(json["bus"]["dropped"], 1);
        assert!(json["stock"]["supplierA"].is_object());
    }

    #[test]
    fn test_render_lists_failed_machine() {
        let text = sample().render();
        assert!(text.contains("12 ticks"));
        assert!(text.contains("FAILED (repair 2 left)"));
        assert!(text.contains("supplierA"));
        assert!(text.contains("  informs                 3          2"));
    }
}
