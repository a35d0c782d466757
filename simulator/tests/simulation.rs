//! End-to-end simulations on the deterministic runtime.

use simbft_consensus::{messages::MessageSizes, replica::ViewIncrement, sampler::Sampler};
use simbft_runtime::{deterministic, Runner};
use simulator::{Arrival, Config, NodePlacement, RegionLink, Report};
use std::time::Duration;

fn sizes() -> MessageSizes {
    MessageSizes {
        status: 0.5,
        tx: 0.25,
        hash: 0.03,
        prepare: 0.1,
        commit: 0.1,
        reply: 0.5,
        block_bodies: 1.0,
        checkpoint: 0.1,
        view_change: 0.5,
        new_view: 0.5,
    }
}

fn full_mesh(regions: &[u32], latency_ms: f64, jitter_ms: f64) -> Vec<RegionLink> {
    let mut links = Vec::new();
    for from in regions {
        for to in regions {
            links.push(RegionLink {
                from_region: *from,
                to_region: *to,
                latency_ms,
                jitter_ms,
                throughput_bps: None,
                success_rate: 1.0,
            });
        }
    }
    links
}

fn base_config(topology: Vec<(u32, u32)>, links: Vec<RegionLink>) -> Config {
    Config {
        blockchain: "pbft".into(),
        block_size_limit: 1,
        transactions_per_block: Sampler::Fixed { value: 100.0 },
        message_size_kb: sizes(),
        checkpoint_interval: 5,
        checkpoint_delay_seconds: 10.0,
        validation_delay: Sampler::Fixed { value: 0.001 },
        timeout_value_seconds: 60.0,
        malicious_drop_probability: 0.0,
        consecutive_empty_rounds_to_stop: 3,
        view_increment: ViewIncrement::ByTimeoutCount,
        time_between_blocks: Sampler::Fixed { value: 5.0 },
        topology: topology
            .into_iter()
            .map(|(node, region)| NodePlacement { node, region })
            .collect(),
        links,
        workload: Vec::new(),
    }
}

fn execute(cfg: Config, seed: u64) -> Report {
    let executor = deterministic::Runner::new(
        deterministic::Config::default()
            .with_seed(seed)
            .with_cycle(Duration::from_micros(100)),
    );
    executor.start(|context| async move { simulator::run(context, cfg).await })
}

#[test]
fn test_round_trip_commit() {
    // Four authorities and one non-authority observer
    let mut cfg = base_config(
        vec![(0, 1), (1, 2), (2, 3), (3, 1), (4, 5)],
        full_mesh(&[1, 2, 3, 5], 20.0, 0.0),
    );
    cfg.workload = vec![Arrival {
        at_seconds: 1.0,
        node: 0,
        count: 10,
    }];
    let report = execute(cfg, 42);

    // One productive round, then the configured empty rounds
    assert_eq!(report.rounds, 4);
    assert_eq!(report.final_view, 0);

    // Every node (the observer included) converged on the same height-1 block
    assert_eq!(report.chains.len(), 5);
    let head = report.chains["replica_0"].head;
    for summary in report.chains.values() {
        assert_eq!(summary.height, 1);
        assert_eq!(summary.head, head);
    }
    assert_eq!(report.chains["replica_0"].transactions, 10);

    // Messages crossed links and the propagation side channel saw them
    assert!(!report.propagation.is_empty());
    assert!(report.end_ms > report.start_ms);
}

#[test]
fn test_empty_round_termination() {
    // No workload: the coordinator stops after exactly K empty rounds
    let cfg = base_config(
        vec![(0, 1), (1, 2), (2, 3), (3, 1)],
        full_mesh(&[1, 2, 3], 10.0, 0.0),
    );
    let report = execute(cfg, 42);
    assert_eq!(report.rounds, 3);
    for summary in report.chains.values() {
        assert_eq!(summary.height, 0);
    }
}

#[test]
fn test_silenced_leader_is_replaced() {
    // Region 1 holds only the initial leader; every link touching it is dead
    let mut links = Vec::new();
    for from in [1u32, 2, 3] {
        for to in [1u32, 2, 3] {
            links.push(RegionLink {
                from_region: from,
                to_region: to,
                latency_ms: 20.0,
                jitter_ms: 0.0,
                throughput_bps: None,
                success_rate: if from == 1 || to == 1 { 0.0 } else { 1.0 },
            });
        }
    }
    let mut cfg = base_config(vec![(0, 1), (1, 2), (2, 2), (3, 3)], links);
    cfg.timeout_value_seconds = 3.0;
    cfg.workload = vec![Arrival {
        at_seconds: 1.0,
        node: 1,
        count: 8,
    }];
    let report = execute(cfg, 42);

    // The stagnant view was abandoned via view-change and the replacement
    // leader's blocks committed on every live authority
    assert!(report.final_view >= 1);
    let replaced = report.chains["replica_1"].height;
    assert!(replaced >= 1);
    for node in [2u32, 3] {
        assert_eq!(report.chains[&format!("replica_{node}")].height, replaced);
    }

    // The silenced leader never heard a thing
    assert_eq!(report.chains["replica_0"].height, 0);
}

#[test]
fn test_passively_faulty_authorities() {
    // Every authority drops all inbound traffic and its own proposals
    let mut cfg = base_config(
        vec![(0, 1), (1, 2), (2, 3), (3, 1)],
        full_mesh(&[1, 2, 3], 10.0, 0.0),
    );
    cfg.malicious_drop_probability = 1.0;
    cfg.workload = vec![Arrival {
        at_seconds: 1.0,
        node: 0,
        count: 5,
    }];
    let report = execute(cfg, 42);

    // The leader built its candidate locally but the broadcast was dropped,
    // so no other chain grows
    assert_eq!(report.chains["replica_0"].height, 1);
    for node in [1u32, 2, 3] {
        assert_eq!(report.chains[&format!("replica_{node}")].height, 0);
    }
}

#[test]
fn test_same_seed_same_run() {
    let make = || {
        let mut cfg = base_config(
            vec![(0, 1), (1, 2), (2, 3), (3, 1), (4, 5)],
            full_mesh(&[1, 2, 3, 5], 20.0, 5.0),
        );
        cfg.workload = vec![
            Arrival {
                at_seconds: 1.0,
                node: 0,
                count: 10,
            },
            Arrival {
                at_seconds: 2.0,
                node: 4,
                count: 7,
            },
        ];
        cfg
    };
    let first = execute(make(), 7);
    let second = execute(make(), 7);
    assert_eq!(
        serde_json::to_string(&first.metrics()).unwrap(),
        serde_json::to_string(&second.metrics()).unwrap(),
    );
}
