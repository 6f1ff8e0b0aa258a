use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use fab_negotiation::{StockLedger, SupplierNegotiator, SupplierSettings};
use fab_plant::{
    DelegationOutcome, DelegationQueue, Machine, MachineAgent, MachineSpec, MaintenanceScheduler,
    ProcurementSettings, RepairPolicy,
};
use fab_protocol::{AgentId, Batch, Envelope, Performative, Stage, Tick};
use fab_state::{Environment, EnvironmentConfig, Schedulable};

fn id(s: &str) -> AgentId {
    AgentId::new(s.into())
}

fn spec(name: &str, failure_rate: f64) -> MachineSpec {
    MachineSpec {
        id: id(name),
        capabilities: [Stage::Mixing, Stage::Baking].into_iter().collect::<BTreeSet<_>>(),
        durations: BTreeMap::new(),
        failure_rate,
    }
}

fn deliver(in_flight: &mut Vec<Envelope>, to: &AgentId, now: Tick) -> Vec<Envelope> {
    let (ready, rest): (Vec<_>, Vec<_>) = std::mem::take(in_flight)
        .into_iter()
        .partition(|e| &e.to == to && e.sent_at < now);
    *in_flight = rest;
    ready
}

#[test]
fn test_procured_batch_becomes_job_with_machine_stages() {
    let env = Arc::new(Environment::new(EnvironmentConfig::default()));
    let machine = Arc::new(Machine::new(spec("m1", 0.0)).unwrap());
    env.register(machine.clone());
    let (_maintenance, handle) =
        MaintenanceScheduler::new(id("maintenance"), RepairPolicy::default(), Some(3), env.clone()).unwrap();

    let mut agent = MachineAgent::new(
        machine.clone(),
        vec![id("supplierA")],
        ProcurementSettings {
            batch: Batch::new(10, 0, 0),
            ..ProcurementSettings::default()
        },
        Some(11),
        handle,
        DelegationQueue::new(),
        env.clone(),
    )
    .unwrap();
    let mut supplier = SupplierNegotiator::new(
        id("supplierA"),
        SupplierSettings {
            capacity: Batch::new(50, 50, 50),
            ..SupplierSettings::default()
        },
        StockLedger::new(Batch::new(60, 0, 0)),
        Vec::new(),
        env.clone(),
    );

    let mut in_flight = Vec::new();
    for now in 1..=6 {
        let inbox = deliver(&mut in_flight, &id("supplierA"), now);
        in_flight.extend(supplier.on_round(now, inbox));
        let inbox = deliver(&mut in_flight, &id("m1"), now);
        in_flight.extend(agent.on_round(now, inbox));
    }

    let metrics = env.metrics();
    assert_eq!(metrics.cnp_cfp.get(), 1);
    assert_eq!(metrics.cnp_proposals.get(), 1);
    assert_eq!(metrics.cnp_accepts.get(), 1);
    assert_eq!(metrics.cnp_informs.get(), 1);
    assert_eq!(metrics.jobs_created.get(), 1);
    assert_eq!(metrics.delivered_flour.get(), 10);
    assert_eq!(supplier.stock().level(), Batch::new(50, 0, 0));

    let job = machine.current_job().unwrap();
    assert_eq!(job.id.to_string(), "m1#1");
    assert_eq!(job.stages(), &[Stage::Mixing, Stage::Baking]);
    assert_eq!(job.batch, Batch::new(10, 0, 0));
    assert!(agent.session().is_none());
    assert!(agent.resume_at() > 5);
}

#[test]
fn test_failed_machine_issues_no_cfp_and_freezes_pipeline() {
    let env = Arc::new(Environment::new(EnvironmentConfig::default()));
    let machine = Arc::new(Machine::new(spec("m1", 1.0)).unwrap());
    env.register(machine.clone());
    let (_maintenance, handle) =
        MaintenanceScheduler::new(id("maintenance"), RepairPolicy::default(), Some(3), env.clone()).unwrap();
    machine.create_job(Batch::default(), 0).unwrap();

    let mut agent = MachineAgent::new(
        machine.clone(),
        vec![id("supplierA")],
        ProcurementSettings::default(),
        Some(5),
        handle,
        DelegationQueue::new(),
        env.clone(),
    )
    .unwrap();

    for now in 1..=5 {
        assert!(agent.on_round(now, Vec::new()).is_empty());
    }
    assert!(machine.is_failed());
    assert_eq!(env.metrics().cnp_cfp.get(), 0);
    assert_eq!(env.metrics().machine_failures.get(), 1);
    let status = machine.status();
    assert_eq!(status.current_job, None);
    assert_eq!(status.queued, 1);
}

#[test]
fn test_injected_fault_abandons_open_round() {
    let env = Arc::new(Environment::new(EnvironmentConfig::default()));
    let machine = Arc::new(Machine::new(spec("m1", 0.0)).unwrap());
    env.register(machine.clone());
    let (_maintenance, handle) =
        MaintenanceScheduler::new(id("maintenance"), RepairPolicy::default(), Some(3), env.clone()).unwrap();
    let mut agent = MachineAgent::new(
        machine.clone(),
        vec![id("supplierA"), id("supplierB")],
        ProcurementSettings::default(),
        Some(5),
        handle,
        DelegationQueue::new(),
        env.clone(),
    )
    .unwrap();

    let cfps = agent.on_round(1, Vec::new());
    assert_eq!(cfps.len(), 2);
    assert!(cfps.iter().all(|e| e.performative() == Performative::Cfp));
    assert!(cfps.iter().all(|e| e.thread.as_deref() == Some("cnp-m1-1-1")));

    assert!(machine.inject_fault());
    assert!(agent.on_round(2, Vec::new()).is_empty());
    assert!(machine.is_failed());
    assert!(agent.session().is_none());
}

#[test]
fn test_no_proposals_backs_off() {
    let env = Arc::new(Environment::new(EnvironmentConfig::default()));
    let machine = Arc::new(Machine::new(spec("m1", 0.0)).unwrap());
    env.register(machine.clone());
    let (_maintenance, handle) =
        MaintenanceScheduler::new(id("maintenance"), RepairPolicy::default(), Some(3), env.clone()).unwrap();
    let mut agent = MachineAgent::new(
        machine.clone(),
        vec![id("silent")],
        ProcurementSettings {
            backoff: (6, 6),
            ..ProcurementSettings::default()
        },
        Some(5),
        handle,
        DelegationQueue::new(),
        env.clone(),
    )
    .unwrap();

    assert_eq!(agent.on_round(1, Vec::new()).len(), 1);
    for now in 2..=3 {
        assert!(agent.on_round(now, Vec::new()).is_empty());
    }
    // Deadline 4: abandoned, nothing accepted, back off 6 ticks.
    assert!(agent.on_round(4, Vec::new()).is_empty());
    assert_eq!(agent.resume_at(), 10);
    assert_eq!(env.metrics().cnp_accepts.get(), 0);
    for now in 5..=9 {
        assert!(agent.on_round(now, Vec::new()).is_empty());
    }
    assert_eq!(agent.on_round(10, Vec::new()).len(), 1);
    assert_eq!(env.metrics().cnp_cfp.get(), 2);
}

#[test]
fn test_failing_agent_parks_job_until_dispatch() {
    let env = Arc::new(Environment::new(EnvironmentConfig::default()));
    let machine = Arc::new(Machine::new(spec("m1", 0.0)).unwrap());
    let peer = Arc::new(Machine::new(spec("m2", 0.0)).unwrap());
    env.register(machine.clone());
    env.register(peer.clone());
    let (_maintenance, handle) =
        MaintenanceScheduler::new(id("maintenance"), RepairPolicy::default(), Some(3), env.clone()).unwrap();
    let delegations = DelegationQueue::new();
    let mut agent = MachineAgent::new(
        machine.clone(),
        Vec::new(),
        ProcurementSettings::default(),
        Some(5),
        handle,
        delegations.clone(),
        env.clone(),
    )
    .unwrap();

    let job_id = machine.create_job(Batch::default(), 0).unwrap();
    agent.on_round(1, Vec::new());
    assert!(machine.holds(&job_id));

    assert!(machine.inject_fault());
    agent.on_round(2, Vec::new());
    assert!(machine.is_failed());
    assert!(!machine.holds(&job_id));
    assert!(peer.is_idle(), "peers are not touched during the tick");
    assert_eq!(delegations.len(), 1);

    let outcomes = delegations.dispatch(&env);
    assert!(matches!(
        outcomes.as_slice(),
        [DelegationOutcome::Delegated { job, to, .. }] if *job == job_id && *to == id("m2")
    ));
    assert!(peer.holds(&job_id));
    assert!(delegations.is_empty());
}
