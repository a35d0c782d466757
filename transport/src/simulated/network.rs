//! Implementation of a simulated network.

use super::{metrics, Error};
use crate::{Envelope, Measured, NodeId, Recipients};
use futures::{
    channel::{mpsc, oneshot},
    SinkExt, StreamExt,
};
use prometheus_client::metrics::{counter::Counter, family::Family};
use rand::{Rng, RngCore};
use rand_distr::{Distribution, Normal};
use simbft_runtime::{Clock, Handle, Metrics, Spawner};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};
use tracing::{debug, error};

type Task<P> = (NodeId, Recipients, P, oneshot::Sender<Vec<NodeId>>);

/// Describes a connection between two peers.
///
/// Links are unidirectional (and must be set up in both directions for a
/// bidirectional connection).
#[derive(Clone, Debug)]
pub struct Link {
    /// Mean propagation delay for the delivery of a message.
    pub latency: Duration,

    /// Standard deviation of the propagation delay.
    pub jitter: Duration,

    /// Throughput of the link in bytes per second (`None` = unlimited).
    ///
    /// Transmission delay is the payload's measured size divided by this
    /// rate, charged on top of propagation.
    pub throughput: Option<u64>,

    /// Probability of a message being delivered successfully (in range [0,1]).
    pub success_rate: f64,
}

/// Configuration for a simulated network.
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum payload size in bytes accepted by the network.
    pub max_size: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self { max_size: u64::MAX }
    }
}

/// Observed delivery counts and cumulative propagation time per directed link.
#[derive(Clone, Copy, Debug, Default)]
pub struct LinkStats {
    pub delivered: u64,
    pub total: Duration,
}

impl LinkStats {
    /// Mean end-to-end propagation time over all delivered messages.
    pub fn mean(&self) -> Option<Duration> {
        if self.delivered == 0 {
            return None;
        }
        Some(self.total / self.delivered as u32)
    }
}

/// Side channel recording end-to-end delivery times per directed link.
#[derive(Clone, Default)]
pub struct Propagation {
    inner: Arc<Mutex<BTreeMap<(NodeId, NodeId), LinkStats>>>,
}

impl Propagation {
    fn record(&self, origin: NodeId, destination: NodeId, elapsed: Duration) {
        let mut inner = self.inner.lock().unwrap();
        let stats = inner.entry((origin, destination)).or_default();
        stats.delivered += 1;
        stats.total += elapsed;
    }

    /// Snapshot the per-link statistics observed so far.
    pub fn snapshot(&self) -> BTreeMap<(NodeId, NodeId), LinkStats> {
        self.inner.lock().unwrap().clone()
    }
}

struct LinkState {
    latency_ms: f64,
    jitter_ms: f64,
    throughput: Option<u64>,
    success_rate: f64,

    // Deliveries on a link never commute: a message may not arrive before one
    // sent earlier on the same link.
    last_delivery: SystemTime,
}

/// Implementation of a simulated network.
pub struct Network<E, P> {
    context: E,
    max_size: u64,
    sender: mpsc::UnboundedSender<Task<P>>,
    receiver: mpsc::UnboundedReceiver<Task<P>>,
    links: BTreeMap<(NodeId, NodeId), LinkState>,
    agents: BTreeMap<NodeId, mpsc::UnboundedSender<Envelope<P>>>,
    propagation: Propagation,

    sent_messages: Family<metrics::Message, Counter>,
    received_messages: Family<metrics::Message, Counter>,
    dropped_messages: Family<metrics::Message, Counter>,
}

impl<E, P> Network<E, P>
where
    E: Spawner + Clock + Metrics + RngCore,
    P: Measured + Clone + Send + 'static,
{
    /// Create a new simulated network with a given context and configuration.
    pub fn new(context: E, cfg: Config) -> Self {
        let (sender, receiver) = mpsc::unbounded();
        let sent_messages = Family::<metrics::Message, Counter>::default();
        let received_messages = Family::<metrics::Message, Counter>::default();
        let dropped_messages = Family::<metrics::Message, Counter>::default();
        context.register("messages_sent", "messages sent", sent_messages.clone());
        context.register(
            "messages_received",
            "messages received",
            received_messages.clone(),
        );
        context.register(
            "messages_dropped",
            "messages dropped",
            dropped_messages.clone(),
        );

        Self {
            context,
            max_size: cfg.max_size,
            sender,
            receiver,
            links: BTreeMap::new(),
            agents: BTreeMap::new(),
            propagation: Propagation::default(),
            sent_messages,
            received_messages,
            dropped_messages,
        }
    }

    /// Register a new peer with the network.
    ///
    /// By default, the peer will not be linked to any other peers.
    pub fn register(&mut self, peer: NodeId) -> Result<(Sender<P>, Receiver<P>), Error> {
        // Ensure doesn't already exist
        if self.agents.contains_key(&peer) {
            return Err(Error::AlreadyRegistered(peer));
        }

        // Initialize agent inbound queue
        let (sender, receiver) = mpsc::unbounded();
        self.agents.insert(peer, sender);
        Ok((
            Sender {
                me: peer,
                max_size: self.max_size,
                sender: self.sender.clone(),
            },
            Receiver { receiver },
        ))
    }

    /// Create a unidirectional link between two peers.
    ///
    /// Can be called multiple times for the same sender/receiver; the latest
    /// setting wins.
    pub fn link(&mut self, sender: NodeId, receiver: NodeId, config: Link) -> Result<(), Error> {
        if sender == receiver {
            return Err(Error::LinkingSelf);
        }
        if !(0.0..=1.0).contains(&config.success_rate) {
            return Err(Error::InvalidSuccessRate(config.success_rate));
        }
        if config.throughput == Some(0) {
            return Err(Error::InvalidThroughput);
        }
        self.links.insert(
            (sender, receiver),
            LinkState {
                latency_ms: config.latency.as_secs_f64() * 1_000.0,
                jitter_ms: config.jitter.as_secs_f64() * 1_000.0,
                throughput: config.throughput,
                success_rate: config.success_rate,
                last_delivery: SystemTime::UNIX_EPOCH,
            },
        );
        Ok(())
    }

    /// Return the propagation side channel for this network.
    pub fn propagation(&self) -> Propagation {
        self.propagation.clone()
    }

    /// Spawn the routing actor.
    pub fn start(self) -> Handle<()> {
        let context = self.context.clone();
        context.spawn(|_| self.run())
    }

    async fn run(mut self) {
        while let Some((origin, recipients, payload, reply)) = self.receiver.next().await {
            // Collect recipients
            let recipients = match recipients {
                Recipients::All => self.agents.keys().cloned().collect(),
                Recipients::Some(keys) => keys,
                Recipients::One(key) => vec![key],
            };

            // Schedule delivery to each recipient
            let mut sent = Vec::new();
            for recipient in recipients {
                // Skip self
                if recipient == origin {
                    debug!(recipient = %recipient, reason = "self", "dropping message");
                    continue;
                }

                // Determine if recipient exists
                let Some(agent) = self.agents.get(&recipient) else {
                    debug!(recipient = %recipient, reason = "no agent", "dropping message");
                    continue;
                };

                // Determine if there is a link between the sender and recipient
                let Some(link) = self.links.get_mut(&(origin, recipient)) else {
                    debug!(recipient = %recipient, reason = "no link", "dropping message");
                    continue;
                };

                // Apply link settings
                let should_deliver = self.context.gen_bool(link.success_rate);
                let propagation_ms = Normal::new(link.latency_ms, link.jitter_ms)
                    .unwrap()
                    .sample(&mut self.context)
                    .max(0.0);
                let mut delay = Duration::from_secs_f64(propagation_ms / 1_000.0);
                if let Some(throughput) = link.throughput {
                    delay += Duration::from_secs_f64(
                        payload.size_bytes() as f64 / throughput as f64,
                    );
                }
                let now = self.context.current();
                let mut delivery = now + delay;
                if delivery < link.last_delivery {
                    delivery = link.last_delivery;
                }
                link.last_delivery = delivery;
                debug!(origin = %origin, recipient = %recipient, ?delay, "sending message");

                // Record sent message as soon as we determine there is a link
                // with the recipient
                self.sent_messages
                    .get_or_create(&metrics::Message::new(origin, recipient, payload.kind()))
                    .inc();

                // Deliver message
                let envelope = Envelope {
                    payload: payload.clone(),
                    sent: now,
                    origin,
                    destination: recipient,
                };
                let mut agent = agent.clone();
                let received_messages = self.received_messages.clone();
                let dropped_messages = self.dropped_messages.clone();
                let propagation = self.propagation.clone();
                self.context.with_label("messenger").spawn(move |context| async move {
                    // Wait for the computed delivery time
                    context.sleep_until(delivery).await;

                    // Drop message if the link lost it
                    let kind = envelope.payload.kind();
                    if !should_deliver {
                        debug!(
                            recipient = %recipient,
                            reason = "random link failure",
                            "dropping message"
                        );
                        dropped_messages
                            .get_or_create(&metrics::Message::new(origin, recipient, kind))
                            .inc();
                        return;
                    }

                    // Deliver message
                    let elapsed = delivery.duration_since(envelope.sent).unwrap_or_default();
                    if let Err(err) = agent.send(envelope).await {
                        // This can only happen if the receiver exited.
                        error!(origin = %origin, recipient = %recipient, ?err, "failed to send");
                        return;
                    }
                    propagation.record(origin, recipient, elapsed);

                    // Only record received messages that were successfully
                    // delivered
                    received_messages
                        .get_or_create(&metrics::Message::new(origin, recipient, kind))
                        .inc();
                });
                sent.push(recipient);
            }

            // Notify sender of scheduled sends
            if reply.send(sent).is_err() {
                // This can only happen if the sender exited.
                debug!(origin = %origin, "failed to send ack");
            }
        }
    }
}

/// Sending half of a registered peer.
#[derive(Clone, Debug)]
pub struct Sender<P> {
    me: NodeId,
    max_size: u64,
    sender: mpsc::UnboundedSender<Task<P>>,
}

impl<P: Measured + Clone + Send + 'static> Sender<P> {
    /// Send a payload to a set of recipients.
    ///
    /// Returns the recipients the message was scheduled for (a scheduled
    /// message may still be lost on the wire).
    pub async fn send(&mut self, recipients: Recipients, payload: P) -> Result<Vec<NodeId>, Error> {
        // Check message size
        let size = payload.size_bytes();
        if size > self.max_size {
            return Err(Error::MessageTooLarge(size));
        }

        // Send message
        let (sender, receiver) = oneshot::channel();
        self.sender
            .send((self.me, recipients, payload, sender))
            .await
            .map_err(|_| Error::NetworkClosed)?;
        receiver.await.map_err(|_| Error::NetworkClosed)
    }
}

/// Receiving half of a registered peer.
#[derive(Debug)]
pub struct Receiver<P> {
    receiver: mpsc::UnboundedReceiver<Envelope<P>>,
}

impl<P> Receiver<P> {
    /// Receive the next envelope addressed to this peer.
    pub async fn recv(&mut self) -> Result<Envelope<P>, Error> {
        self.receiver.next().await.ok_or(Error::NetworkClosed)
    }
}
