//! The round heartbeat and the one piece of shared per-run state.

use crate::{replica::Mailbox, sampler::Sampler};
use rand::RngCore;
use simbft_runtime::{Clock, Handle, Spawner};
use simbft_transport::NodeId;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{debug, info};

/// The network's view counter and participant roster.
///
/// Mutated only by the coordinator and by a replica's successful new-view
/// transition; replicas otherwise read it. The acting leader for view `v` is
/// `authorities[v mod |authorities|]`.
#[derive(Debug)]
pub struct NetworkState {
    view: u64,
    authorities: Vec<NodeId>,
    participants: Vec<NodeId>,
}

impl NetworkState {
    pub fn new(participants: Vec<NodeId>, authorities: Vec<NodeId>) -> Self {
        assert!(!authorities.is_empty(), "no authorities configured");
        Self {
            view: 0,
            authorities,
            participants,
        }
    }

    pub fn shared(participants: Vec<NodeId>, authorities: Vec<NodeId>) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::new(participants, authorities)))
    }

    pub fn view(&self) -> u64 {
        self.view
    }

    /// Advance the view (never backwards).
    pub fn advance_to(&mut self, view: u64) {
        if view > self.view {
            self.view = view;
        }
    }

    pub fn authorities(&self) -> &[NodeId] {
        &self.authorities
    }

    pub fn participants(&self) -> &[NodeId] {
        &self.participants
    }

    pub fn non_authorities(&self) -> Vec<NodeId> {
        self.participants
            .iter()
            .filter(|id| !self.authorities.contains(id))
            .copied()
            .collect()
    }

    /// Maximum tolerated faulty replicas.
    pub fn f(&self) -> usize {
        self.authorities.len() / 3
    }

    pub fn primary_for(&self, view: u64) -> NodeId {
        self.authorities[(view as usize) % self.authorities.len()]
    }

    pub fn leader(&self) -> NodeId {
        self.primary_for(self.view)
    }
}

/// Configuration for the [Coordinator].
#[derive(Clone, Debug)]
pub struct Config {
    /// Seconds between rounds, sampled per round.
    pub time_between_blocks: Sampler,
    /// Stop the run after this many consecutive rounds that drained zero
    /// transactions.
    pub consecutive_empty_rounds_to_stop: u32,
}

/// Single long-lived round loop: wait out the sampled inter-block interval,
/// command the current view's leader to propose, and stop once the network
/// runs dry.
///
/// The coordinator never advances the view itself: leader replacement is the
/// replicas' view-change protocol.
pub struct Coordinator<E> {
    context: E,
    network: Arc<Mutex<NetworkState>>,
    replicas: BTreeMap<NodeId, Mailbox>,
    cfg: Config,
}

impl<E> Coordinator<E>
where
    E: Spawner + Clock + RngCore,
{
    pub fn new(
        context: E,
        network: Arc<Mutex<NetworkState>>,
        replicas: BTreeMap<NodeId, Mailbox>,
        cfg: Config,
    ) -> Self {
        Self {
            context,
            network,
            replicas,
            cfg,
        }
    }

    /// Spawn the heartbeat; resolves with the number of rounds driven.
    pub fn start(self) -> Handle<u64> {
        let context = self.context.clone();
        context.spawn(|_| self.run())
    }

    async fn run(mut self) -> u64 {
        let mut empty_rounds = 0;
        let mut rounds = 0;
        loop {
            let interval = self.cfg.time_between_blocks.sample(&mut self.context);
            self.context.sleep(Duration::from_secs_f64(interval)).await;
            rounds += 1;

            let leader = self.network.lock().unwrap().leader();
            info!(round = rounds, %leader, "leader selected to broadcast a candidate block");
            let drained = match self.replicas.get_mut(&leader) {
                Some(mailbox) => mailbox.propose().await.unwrap_or(0),
                None => {
                    debug!(%leader, reason = "no mailbox", "skipping round");
                    0
                }
            };

            if drained == 0 {
                empty_rounds += 1;
                if empty_rounds >= self.cfg.consecutive_empty_rounds_to_stop {
                    info!(rounds, "no transactions left to process; stopping");
                    return rounds;
                }
            } else {
                empty_rounds = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::Command;
    use crate::sampler::Sampler;
    use futures::{channel::mpsc, StreamExt};
    use simbft_runtime::{deterministic, Metrics, Runner, Spawner};

    #[test]
    fn test_leader_rotates_with_view() {
        let authorities: Vec<NodeId> = (0..4).map(NodeId).collect();
        let mut network = NetworkState::new(authorities.clone(), authorities.clone());
        assert_eq!(network.leader(), NodeId(0));
        network.advance_to(2);
        assert_eq!(network.leader(), NodeId(2));
        network.advance_to(5);
        assert_eq!(network.leader(), NodeId(1));

        // Views never rewind
        network.advance_to(3);
        assert_eq!(network.view(), 5);
    }

    #[test]
    fn test_f_floor() {
        let authorities = |n: u32| (0..n).map(NodeId).collect::<Vec<_>>();
        for (count, expected) in [(1, 0), (3, 1), (4, 1), (6, 2), (7, 2), (10, 3)] {
            let network = NetworkState::new(authorities(count), authorities(count));
            assert_eq!(network.f(), expected);
        }
    }

    #[test]
    fn test_stops_after_consecutive_empty_rounds() {
        let executor = deterministic::Runner::default();
        let rounds = executor.start(|context| async move {
            let authorities = vec![NodeId(0)];
            let network = NetworkState::shared(authorities.clone(), authorities);

            // A leader that never has transactions
            let (sender, mut receiver) = mpsc::unbounded();
            context.clone().spawn(|_| async move {
                while let Some(command) = receiver.next().await {
                    if let Command::Propose { response } = command {
                        let _ = response.send(0);
                    }
                }
            });
            let mut replicas = BTreeMap::new();
            replicas.insert(NodeId(0), Mailbox::new(sender));

            let coordinator = Coordinator::new(
                context.with_label("coordinator"),
                network,
                replicas,
                Config {
                    time_between_blocks: Sampler::Fixed { value: 1.0 },
                    consecutive_empty_rounds_to_stop: 3,
                },
            );
            coordinator.start().await.unwrap()
        });
        assert_eq!(rounds, 3);
    }

    #[test]
    fn test_empty_round_counter_resets() {
        let executor = deterministic::Runner::default();
        let rounds = executor.start(|context| async move {
            let authorities = vec![NodeId(0)];
            let network = NetworkState::shared(authorities.clone(), authorities);

            // Produce transactions for the first two rounds, then run dry
            let (sender, mut receiver) = mpsc::unbounded();
            context.clone().spawn(|_| async move {
                let mut produced = 0u32;
                while let Some(command) = receiver.next().await {
                    if let Command::Propose { response } = command {
                        produced += 1;
                        let _ = response.send(if produced <= 2 { 5 } else { 0 });
                    }
                }
            });
            let mut replicas = BTreeMap::new();
            replicas.insert(NodeId(0), Mailbox::new(sender));

            let coordinator = Coordinator::new(
                context.with_label("coordinator"),
                network,
                replicas,
                Config {
                    time_between_blocks: Sampler::Fixed { value: 1.0 },
                    consecutive_empty_rounds_to_stop: 2,
                },
            );
            coordinator.start().await.unwrap()
        });
        assert_eq!(rounds, 4);
    }
}
