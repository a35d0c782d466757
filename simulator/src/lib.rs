//! Simulate PBFT replication under realistic network conditions.
//!
//! Wires the deterministic runtime, the simulated transport, and the PBFT
//! replicas together from a validated [Config]: topology and per-region link
//! measurements become the network, workload arrivals become transaction
//! gossip, and the run ends when the coordinator observes the configured
//! number of consecutive empty rounds. The outcome is a [Report].

mod config;
mod report;

pub use config::{Arrival, Config, ConfigError, NodePlacement, RegionLink, AUTHORITY_REGION_MAX};
pub use report::{LinkReport, Report};

use rand::RngCore;
use simbft_consensus::{
    coordinator::{self, Coordinator, NetworkState},
    faults::{DropPolicy, PassiveFault, Reliable},
    messages::Payload,
    replica::{self, Replica},
    types::Transaction,
};
use simbft_runtime::{Clock, Metrics, Spawner};
use simbft_transport::{
    simulated::{Config as TransportConfig, Link, Network},
    NodeId,
};
use std::{
    cmp::Ordering,
    collections::BTreeMap,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::info;

fn virtual_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Execute a full simulation on the given runtime context.
pub async fn run<E>(context: E, cfg: Config) -> Report
where
    E: Spawner + Clock + Metrics + RngCore,
{
    let participants = cfg.participants();
    let authorities = cfg.authorities();
    let start = context.current();
    info!(
        nodes = participants.len(),
        authorities = authorities.len(),
        "starting simulation"
    );
    let network_state = NetworkState::shared(participants.clone(), authorities.clone());

    // Build the network from the topology and region measurements
    let mut network: Network<E, Payload> =
        Network::new(context.with_label("network"), TransportConfig::default());
    let propagation = network.propagation();
    let mut endpoints = BTreeMap::new();
    for node in &participants {
        let endpoint = network.register(*node).expect("node ids are unique");
        endpoints.insert(*node, endpoint);
    }
    let table = cfg.link_table();
    for a in &participants {
        for b in &participants {
            if a == b {
                continue;
            }
            let link = table[&(cfg.region_of(*a), cfg.region_of(*b))];
            network
                .link(
                    *a,
                    *b,
                    Link {
                        latency: Duration::from_secs_f64(link.latency_ms / 1_000.0),
                        jitter: Duration::from_secs_f64(link.jitter_ms / 1_000.0),
                        throughput: link.throughput_bps,
                        success_rate: link.success_rate,
                    },
                )
                .expect("links are validated");
        }
    }
    network.start();

    // Start one replica per node
    let mut rng = context.clone();
    let mut mailboxes = BTreeMap::new();
    for node in &participants {
        let (sender, receiver) = endpoints.remove(node).expect("registered above");
        let drops: Box<dyn DropPolicy> =
            if authorities.contains(node) && cfg.malicious_drop_probability > 0.0 {
                Box::new(PassiveFault::new(
                    cfg.malicious_drop_probability,
                    rng.next_u64(),
                ))
            } else {
                Box::new(Reliable)
            };
        let (replica, mailbox) = Replica::new(
            context.with_label(&format!("replica_{node}")),
            replica::Config {
                me: *node,
                sizes: cfg.message_size_kb.clone(),
                block_size_limit: cfg.block_size_limit,
                transactions_per_block: cfg.transactions_per_block.clone(),
                validation_delay: cfg.validation_delay.clone(),
                checkpoint_interval: cfg.checkpoint_interval,
                checkpoint_delay: Duration::from_secs_f64(cfg.checkpoint_delay_seconds),
                timeout_value: Duration::from_secs_f64(cfg.timeout_value_seconds),
                view_increment: cfg.view_increment,
            },
            network_state.clone(),
            sender,
            receiver,
            drops,
        );
        replica.start();
        mailboxes.insert(*node, mailbox);
    }

    // Feed the arrival schedule: at each entry's time, the named node
    // fabricates transactions and gossips them to the authorities
    let mut arrivals = cfg.workload.clone();
    arrivals.sort_by(|a, b| {
        a.at_seconds
            .partial_cmp(&b.at_seconds)
            .unwrap_or(Ordering::Equal)
    });
    {
        let mailboxes = mailboxes.clone();
        let participants = participants.clone();
        context.with_label("workload").spawn(move |context| async move {
            let mut signature = 0u64;
            for arrival in arrivals {
                let at = start + Duration::from_secs_f64(arrival.at_seconds);
                context.sleep_until(at).await;
                let node = NodeId(arrival.node);
                let transactions: Vec<Transaction> = (0..arrival.count)
                    .map(|_| {
                        signature += 1;
                        Transaction {
                            from: node,
                            to: participants[signature as usize % participants.len()],
                            value: signature,
                            fee: 1,
                            signature,
                        }
                    })
                    .collect();
                let Some(mut mailbox) = mailboxes.get(&node).cloned() else {
                    continue;
                };
                if mailbox.inject(transactions).await.is_err() {
                    break;
                }
            }
        });
    }

    // Drive rounds until the network runs dry
    let coordinator = Coordinator::new(
        context.with_label("coordinator"),
        network_state.clone(),
        mailboxes
            .iter()
            .filter(|(node, _)| authorities.contains(node))
            .map(|(node, mailbox)| (*node, mailbox.clone()))
            .collect(),
        coordinator::Config {
            time_between_blocks: cfg.time_between_blocks.clone(),
            consecutive_empty_rounds_to_stop: cfg.consecutive_empty_rounds_to_stop,
        },
    );
    let rounds = coordinator.start().await.expect("coordinator completed");

    // Let in-flight messages settle (this is virtual time)
    context.sleep(Duration::from_secs(10)).await;

    // Collect per-replica chain summaries
    let mut chains = BTreeMap::new();
    for (node, mailbox) in &mut mailboxes {
        if let Ok(summary) = mailbox.summary().await {
            chains.insert(format!("replica_{node}"), summary);
        }
    }

    let final_view = network_state.lock().unwrap().view();
    let propagation = propagation
        .snapshot()
        .into_iter()
        .map(|((from, to), stats)| {
            (
                format!("{from}->{to}"),
                LinkReport {
                    delivered: stats.delivered,
                    mean_ms: stats
                        .mean()
                        .map(|mean| mean.as_secs_f64() * 1_000.0)
                        .unwrap_or(0.0),
                },
            )
        })
        .collect();

    Report {
        start_ms: virtual_ms(start),
        end_ms: virtual_ms(context.current()),
        rounds,
        final_view,
        chains,
        propagation,
    }
}
