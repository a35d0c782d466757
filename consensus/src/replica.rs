//! The PBFT replica: a per-sequence-number log driven through
//! proposed → prepared → committed by quorum votes, with checkpoint garbage
//! collection and view-change/new-view leader replacement.
//!
//! [State] is the protocol core, separated from all I/O: every handler is a
//! synchronous transition returning the messages to send, so each rule is
//! testable without a network. [Replica] wraps it in an actor that consumes a
//! merged stream of network envelopes and control commands and charges the
//! configured validation delay before each broadcast.

use crate::{
    coordinator::NetworkState,
    faults::DropPolicy,
    messages::{self, Catalog, MessageSizes, Payload, PreparedProof},
    queue::TransactionQueue,
    sampler::Sampler,
    types::{Block, BlockHeader, Chain, ChainSummary, Digest, Transaction},
    Error,
};
use futures::{
    channel::{mpsc, oneshot},
    stream, SinkExt, StreamExt,
};
use prometheus_client::metrics::counter::Counter;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use simbft_runtime::{Clock, Handle, Metrics, Spawner};
use simbft_transport::{simulated, Envelope, Measured, NodeId, Recipients};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex},
    time::{Duration, UNIX_EPOCH},
};
use tracing::{debug, info, warn};

/// Messages a replica emits in response to a single transition.
pub type Outbound = Vec<(Recipients, Payload)>;

/// How far a timeout advances the proposed view: one step at a time, or
/// fast-forwarding by the accumulated timeout count.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewIncrement {
    ByOne,
    ByTimeoutCount,
}

/// Configuration for a [Replica].
#[derive(Clone, Debug)]
pub struct Config {
    pub me: NodeId,
    pub sizes: MessageSizes,
    /// Multiplier on the sampled transactions-per-block draw.
    pub block_size_limit: u64,
    pub transactions_per_block: Sampler,
    /// Seconds of validation work charged before each block/vote broadcast.
    pub validation_delay: Sampler,
    /// Checkpoint votes are cast at sequence numbers that are multiples of
    /// this interval.
    pub checkpoint_interval: u64,
    /// Period of the checkpoint loop.
    pub checkpoint_delay: Duration,
    /// Period of the stagnation check.
    pub timeout_value: Duration,
    pub view_increment: ViewIncrement,
}

/// Control commands consumed by the replica actor alongside network traffic.
pub enum Command {
    /// Build and broadcast a candidate block; responds with the number of
    /// transactions drained.
    Propose { response: oneshot::Sender<usize> },
    /// Enqueue transactions and gossip them to the authorities.
    Inject { transactions: Vec<Transaction> },
    /// Periodic stagnation check.
    CheckTimeout,
    /// Periodic checkpoint vote.
    Checkpoint,
    /// Query the replica's chain summary.
    Summary { response: oneshot::Sender<ChainSummary> },
}

/// Handle for sending [Command]s to a running replica.
#[derive(Clone, Debug)]
pub struct Mailbox {
    sender: mpsc::UnboundedSender<Command>,
}

impl Mailbox {
    pub(crate) fn new(sender: mpsc::UnboundedSender<Command>) -> Self {
        Self { sender }
    }

    pub async fn propose(&mut self) -> Result<usize, Error> {
        let (response, receiver) = oneshot::channel();
        self.sender
            .send(Command::Propose { response })
            .await
            .map_err(|_| Error::Closed)?;
        receiver.await.map_err(|_| Error::Closed)
    }

    pub async fn inject(&mut self, transactions: Vec<Transaction>) -> Result<(), Error> {
        self.sender
            .send(Command::Inject { transactions })
            .await
            .map_err(|_| Error::Closed)
    }

    pub async fn summary(&mut self) -> Result<ChainSummary, Error> {
        let (response, receiver) = oneshot::channel();
        self.sender
            .send(Command::Summary { response })
            .await
            .map_err(|_| Error::Closed)?;
        receiver.await.map_err(|_| Error::Closed)
    }
}

/// Per-sequence-number record, created lazily and deleted by checkpoint
/// garbage collection.
#[derive(Debug, Default)]
struct LogEntry {
    block: Option<Block>,
    prepares: BTreeSet<NodeId>,
    prepared: bool,
    commits: BTreeSet<NodeId>,
    committed: bool,
    replied: bool,
    checkpoints: BTreeSet<NodeId>,
}

/// The protocol core of a replica.
pub struct State {
    me: NodeId,
    authorities: Vec<NodeId>,
    non_authorities: Vec<NodeId>,
    is_authority: bool,
    f: usize,
    network: Arc<Mutex<NetworkState>>,
    catalog: Catalog,
    chain: Chain,
    queue: TransactionQueue,

    /// This replica's own view (the network view may run ahead until a
    /// new-view is adopted).
    view: u64,
    log: BTreeMap<u64, LogEntry>,
    view_changes: BTreeMap<u64, BTreeMap<NodeId, messages::ViewChange>>,
    last_stable: u64,
    stable_votes: BTreeSet<NodeId>,
    checkpoint_interval: u64,
    view_increment: ViewIncrement,
    timeouts: u64,
    timed_out: bool,
    last_progress: (u64, u64),

    // Non-authority bookkeeping: reply quorums and blocks awaiting in-order
    // application.
    replies: BTreeMap<(u64, Digest), BTreeSet<NodeId>>,
    pending: BTreeMap<u64, Block>,

    sessions: BTreeMap<NodeId, messages::Status>,
}

impl State {
    pub fn new(
        me: NodeId,
        network: Arc<Mutex<NetworkState>>,
        catalog: Catalog,
        checkpoint_interval: u64,
        view_increment: ViewIncrement,
    ) -> Self {
        // The quorum denominator is fixed once at network start
        let (authorities, non_authorities) = {
            let network = network.lock().unwrap();
            (
                network.authorities().to_vec(),
                network.non_authorities(),
            )
        };
        let f = authorities.len() / 3;
        let is_authority = authorities.contains(&me);
        Self {
            me,
            authorities,
            non_authorities,
            is_authority,
            f,
            network,
            catalog,
            chain: Chain::genesis(),
            queue: TransactionQueue::new(),
            view: 0,
            log: BTreeMap::new(),
            view_changes: BTreeMap::new(),
            last_stable: 0,
            stable_votes: BTreeSet::new(),
            checkpoint_interval,
            view_increment,
            timeouts: 0,
            timed_out: false,
            last_progress: (0, 0),
            replies: BTreeMap::new(),
            pending: BTreeMap::new(),
            sessions: BTreeMap::new(),
        }
    }

    pub fn is_authority(&self) -> bool {
        self.is_authority
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn view(&self) -> u64 {
        self.view
    }

    pub fn last_stable(&self) -> u64 {
        self.last_stable
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    pub fn logged(&self, sequence: u64) -> bool {
        self.log.contains_key(&sequence)
    }

    pub fn prepared(&self, sequence: u64) -> bool {
        self.log.get(&sequence).map_or(false, |entry| entry.prepared)
    }

    pub fn committed(&self, sequence: u64) -> bool {
        self.log.get(&sequence).map_or(false, |entry| entry.committed)
    }

    pub fn prepare_voters(&self, sequence: u64) -> usize {
        self.log.get(&sequence).map_or(0, |entry| entry.prepares.len())
    }

    pub fn commit_voters(&self, sequence: u64) -> usize {
        self.log.get(&sequence).map_or(0, |entry| entry.commits.len())
    }

    pub fn view_change_records(&self, view: u64) -> usize {
        self.view_changes.get(&view).map_or(0, |records| records.len())
    }

    pub fn status(&self) -> Payload {
        self.catalog.status(&self.chain)
    }

    /// Peers that have introduced themselves via a status handshake.
    pub fn peers(&self) -> usize {
        self.sessions.len()
    }

    fn network_view(&self) -> u64 {
        self.network.lock().unwrap().view()
    }

    fn highest_logged(&self) -> u64 {
        self.log
            .keys()
            .next_back()
            .copied()
            .unwrap_or(self.last_stable)
            .max(self.last_stable)
    }

    fn to_authorities(&self, payload: Payload) -> (Recipients, Payload) {
        (Recipients::Some(self.authorities.clone()), payload)
    }

    /// Dispatch an inbound payload to the matching handler.
    ///
    /// Consensus traffic is only meaningful to authorities; everyone handles
    /// status, transactions, and replies.
    pub fn on_payload(&mut self, origin: NodeId, payload: Payload) -> Outbound {
        match payload {
            Payload::Status(message) => {
                self.on_status(origin, message);
                Vec::new()
            }
            Payload::Transactions(message) => {
                self.on_transactions(message);
                Vec::new()
            }
            Payload::Reply(message) => {
                self.on_reply(message);
                Vec::new()
            }
            payload if !self.is_authority => {
                debug!(
                    replica = %self.me,
                    kind = payload.kind(),
                    reason = "not an authority",
                    "ignoring message"
                );
                Vec::new()
            }
            Payload::PrePrepare(message) => self.on_pre_prepare(message),
            Payload::Prepare(message) => self.on_prepare(message),
            Payload::Commit(message) => self.on_commit(message),
            Payload::Checkpoint(message) => {
                self.on_checkpoint(message);
                Vec::new()
            }
            Payload::ViewChange(message) => self.on_view_change(message),
            Payload::NewView(message) => self.on_new_view(message),
        }
    }

    /// Build a candidate block from the transaction queue (leader only) and
    /// broadcast it as a pre-prepare.
    ///
    /// An empty queue on the first draw is not an error: it yields zero
    /// transactions, which feeds the coordinator's empty-round counter.
    pub fn propose_block(&mut self, limit: usize, timestamp: u64) -> (usize, Outbound) {
        assert!(self.is_authority, "non-authority asked to propose");

        // Drain up to the per-block transaction limit
        let mut pending = Vec::new();
        for _ in 0..limit {
            match self.queue.get() {
                Some(transaction) => pending.push(transaction),
                None => break,
            }
        }
        if pending.is_empty() {
            debug!(replica = %self.me, "no more transactions queued");
            return (0, Vec::new());
        }
        let count = pending.len();

        // Build the candidate on top of the local head
        let parent = self.chain.head().header.clone();
        let header = BlockHeader::new(
            parent.hash,
            parent.number + 1,
            timestamp,
            self.me,
            parent.weight + 1,
        );
        let block = Block::new(header, pending);
        info!(
            replica = %self.me,
            height = block.header.number,
            hash = %block.hash(),
            transactions = count,
            "new candidate block"
        );
        self.chain
            .add_block(block.clone())
            .expect("candidate extends the local head");

        // Log the block under its sequence number and advertise it
        self.catalog.observe(block.header.number - 1);
        let view = self.network_view();
        let payload = self.catalog.pre_prepare(view, block.clone());
        let Payload::PrePrepare(ref message) = payload else {
            unreachable!("catalog built a pre-prepare");
        };
        self.log.entry(message.sequence).or_default().block = Some(block);
        (count, vec![(Recipients::All, payload)])
    }

    fn on_status(&mut self, origin: NodeId, message: messages::Status) {
        debug!(replica = %self.me, peer = %origin, height = message.height, "received status");
        self.sessions.insert(origin, message);
    }

    fn on_transactions(&mut self, message: messages::Transactions) {
        if !self.is_authority {
            return;
        }
        for transaction in message.transactions {
            self.queue.put(transaction);
        }
    }

    /// Enqueue locally-arrived transactions and gossip them to the
    /// authorities.
    pub fn inject(&mut self, transactions: Vec<Transaction>) -> Outbound {
        let payload = self.catalog.transactions(transactions.clone());
        if self.is_authority {
            for transaction in transactions {
                self.queue.put(transaction);
            }
        }
        vec![self.to_authorities(payload)]
    }

    fn on_pre_prepare(&mut self, message: messages::PrePrepare) -> Outbound {
        if !message.valid {
            debug!(
                replica = %self.me,
                sequence = message.sequence,
                reason = "digest validation failed",
                "dropping pre-prepare"
            );
            return Vec::new();
        }
        self.catalog.observe(message.sequence);

        // An empty block-set is a view-change no-op placeholder
        let Some(block) = message.block else {
            self.log.entry(message.sequence).or_default();
            return Vec::new();
        };

        // Log the block and vote prepare to the authorities
        {
            let entry = self.log.entry(message.sequence).or_default();
            entry.block = Some(block);
            entry.prepares.insert(self.me);
        }
        let prepare = self.catalog.prepare(message.view, message.sequence, message.digest);
        let mut outbound = vec![self.to_authorities(prepare)];

        // A commit quorum may have raced ahead of this proposal
        outbound.extend(self.maybe_apply(message.sequence));
        outbound
    }

    fn on_prepare(&mut self, message: messages::Prepare) -> Outbound {
        let became_prepared = {
            let entry = self.log.entry(message.sequence).or_default();
            entry.prepares.insert(message.replica);
            if entry.prepared || entry.prepares.len() < 2 * self.f {
                false
            } else {
                entry.prepared = true;
                entry.commits.insert(self.me);
                true
            }
        };
        if !became_prepared {
            return Vec::new();
        }

        // Multicast commit once prepared becomes true
        let commit = self.catalog.commit(message.view, message.sequence, message.digest);
        let mut outbound = vec![self.to_authorities(commit)];
        outbound.extend(self.try_commit(message.sequence));
        outbound
    }

    fn on_commit(&mut self, message: messages::Commit) -> Outbound {
        {
            let entry = self.log.entry(message.sequence).or_default();
            entry.commits.insert(message.replica);
        }
        self.try_commit(message.sequence)
    }

    /// committed-local is true iff prepared is true and 2f+1 commits (possibly
    /// including our own) have been accepted.
    fn try_commit(&mut self, sequence: u64) -> Outbound {
        {
            let Some(entry) = self.log.get_mut(&sequence) else {
                return Vec::new();
            };
            if entry.committed || !entry.prepared || entry.commits.len() < 2 * self.f + 1 {
                return self.maybe_apply(sequence);
            }
            entry.committed = true;
        }
        self.maybe_apply(sequence)
    }

    /// Apply a committed block once it is actually present in the log, and
    /// inform the non-authorities (at most once per sequence number).
    fn maybe_apply(&mut self, sequence: u64) -> Outbound {
        let block = {
            let Some(entry) = self.log.get_mut(&sequence) else {
                return Vec::new();
            };
            if !entry.committed || entry.replied {
                return Vec::new();
            }
            let Some(block) = entry.block.clone() else {
                // Commit raced ahead of pre-prepare: application is deferred
                // until the block entry exists
                return Vec::new();
            };
            block
        };

        if !self.chain.contains(&block.hash()) {
            if let Err(err) = self.chain.add_block(block.clone()) {
                debug!(replica = %self.me, sequence, ?err, "deferring block application");
                return Vec::new();
            }
            info!(
                replica = %self.me,
                height = block.header.number,
                hash = %block.hash(),
                "block added to the tip of the chain"
            );
        }
        self.log
            .get_mut(&sequence)
            .expect("entry checked above")
            .replied = true;

        let view = self.network_view();
        let reply = self.catalog.reply(view, sequence, block);
        vec![(Recipients::Some(self.non_authorities.clone()), reply)]
    }

    /// Accumulate replies by (sequence, digest); at 2f+1 matching replies the
    /// block is applied in height order.
    fn on_reply(&mut self, message: messages::Reply) {
        assert!(
            !self.is_authority,
            "authority received a reply"
        );
        let voters = self
            .replies
            .entry((message.sequence, message.digest))
            .or_default();
        voters.insert(message.replica);
        if voters.len() == 2 * self.f + 1 {
            self.pending.insert(message.sequence, message.block);
        }

        // Apply whatever is now applicable, oldest first
        while let Some((&sequence, block)) = self.pending.iter().next() {
            if block.header.parent != self.chain.head().hash() {
                break;
            }
            let block = self.pending.remove(&sequence).expect("entry just observed");
            self.chain
                .add_block(block)
                .expect("parent is the local head");
        }
    }

    /// Periodic stagnation check: if neither the network view nor the log has
    /// moved since the previous check, demand a new primary.
    pub fn check_timeout(&mut self) -> Outbound {
        let progress = (self.network_view(), self.highest_logged());
        if progress != self.last_progress {
            self.last_progress = progress;
            self.timeouts = 0;
            return Vec::new();
        }

        self.timed_out = true;
        self.timeouts += 1;
        let increment = match self.view_increment {
            ViewIncrement::ByOne => 1,
            ViewIncrement::ByTimeoutCount => self.timeouts,
        };
        let target = self.view.max(self.network_view()) + increment;
        let prepared: Vec<PreparedProof> = self
            .log
            .range(self.last_stable + 1..)
            .filter(|(_, entry)| entry.prepared && !entry.committed)
            .map(|(sequence, entry)| PreparedProof {
                sequence: *sequence,
                digest: entry
                    .block
                    .as_ref()
                    .map(|block| block.hash())
                    .unwrap_or_default(),
                block: entry.block.clone(),
            })
            .collect();
        warn!(
            replica = %self.me,
            target,
            timeouts = self.timeouts,
            "view stagnated; broadcasting view-change"
        );
        let view_change = self.catalog.view_change(
            target,
            self.last_stable,
            self.stable_votes.clone(),
            prepared,
        );
        let mut outbound = vec![self.to_authorities(view_change.clone())];

        // We may ourselves be the prospective primary for the target view
        let Payload::ViewChange(message) = view_change else {
            unreachable!("catalog built a view-change");
        };
        outbound.extend(self.on_view_change(message));
        outbound
    }

    fn on_view_change(&mut self, message: messages::ViewChange) -> Outbound {
        // View monotonicity: never accept a target at or below our view
        if message.new_view <= self.view {
            debug!(
                replica = %self.me,
                target = message.new_view,
                current = self.view,
                reason = "stale view",
                "dropping view-change"
            );
            return Vec::new();
        }

        // Deduplicate by origin: a newer record replaces the previous one
        let records = self.view_changes.entry(message.new_view).or_default();
        records.insert(message.replica, message.clone());

        // Only the prospective primary assembles the new view
        let primary =
            self.authorities[(message.new_view as usize) % self.authorities.len()];
        if primary != self.me || records.len() < 2 * self.f + 1 {
            return Vec::new();
        }
        let records: Vec<messages::ViewChange> = records.values().cloned().collect();

        // min-s is the highest stable checkpoint among the collectors; max-s
        // the highest prepared sequence referenced
        let min_s = records.iter().map(|record| record.last_stable).max().unwrap_or(0);
        let max_s = records
            .iter()
            .flat_map(|record| record.prepared.iter().map(|proof| proof.sequence))
            .max()
            .unwrap_or(min_s);
        info!(
            replica = %self.me,
            view = message.new_view,
            min_s,
            max_s,
            "assembling new view"
        );

        let mut outbound = Vec::new();

        // Re-broadcast the stable checkpoint to force agreement on the
        // watermark
        if min_s > 0 {
            let digest = self
                .log
                .get(&min_s)
                .and_then(|entry| entry.block.as_ref())
                .map(|block| block.hash())
                .unwrap_or_default();
            outbound.push(self.to_authorities(self.catalog.checkpoint(min_s, digest)));
        }

        // Re-issue pre-prepares for the window, carrying the prepared block
        // where one is known and an explicit no-op placeholder otherwise
        let mut replays = Vec::new();
        for sequence in min_s..=max_s {
            if sequence == 0 {
                continue;
            }
            let block = records
                .iter()
                .flat_map(|record| record.prepared.iter())
                .find(|proof| proof.sequence == sequence)
                .and_then(|proof| proof.block.clone())
                .or_else(|| {
                    self.log
                        .get(&sequence)
                        .and_then(|entry| entry.block.clone())
                });
            let digest = block.as_ref().map(|block| block.hash()).unwrap_or_default();
            let replay =
                self.catalog
                    .pre_prepare_replay(message.new_view, sequence, digest, block);
            let Payload::PrePrepare(replay) = replay else {
                unreachable!("catalog built a pre-prepare");
            };
            outbound.push(self.to_authorities(Payload::PrePrepare(replay.clone())));
            replays.push(replay);
        }

        // Announce the new view with the full evidence
        let new_view = self
            .catalog
            .new_view(message.new_view, records, replays);
        outbound.push(self.to_authorities(new_view));
        self.adopt_view(message.new_view);
        outbound
    }

    fn on_new_view(&mut self, message: messages::NewView) -> Outbound {
        // The current primary has nothing to adopt
        let current_primary = self.authorities
            [(self.network_view() as usize) % self.authorities.len()];
        if current_primary == self.me {
            debug!(replica = %self.me, "current primary ignores new-view");
            return Vec::new();
        }
        if message.view_changes.len() < 2 * self.f + 1 {
            debug!(
                replica = %self.me,
                view = message.view,
                records = message.view_changes.len(),
                reason = "insufficient view-changes",
                "dropping new-view"
            );
            return Vec::new();
        }
        if message.view <= self.view {
            return Vec::new();
        }
        info!(replica = %self.me, view = message.view, "adopting new view");
        self.adopt_view(message.view);
        Vec::new()
    }

    fn adopt_view(&mut self, view: u64) {
        self.view = view;
        self.timed_out = false;
        self.timeouts = 0;
        self.view_changes.retain(|target, _| *target > view);
        self.network.lock().unwrap().advance_to(view);
        self.last_progress = (view, self.highest_logged());
    }

    /// Periodic checkpoint vote: cast when the current sequence number is a
    /// multiple of the checkpoint interval.
    pub fn checkpoint_tick(&mut self) -> Outbound {
        let sequence = self.catalog.sequence();
        if sequence == 0
            || sequence <= self.last_stable
            || sequence % self.checkpoint_interval != 0
        {
            return Vec::new();
        }
        let digest = self
            .log
            .get(&sequence)
            .and_then(|entry| entry.block.as_ref())
            .map(|block| block.hash())
            .unwrap_or_default();
        let vote = self.catalog.checkpoint(sequence, digest);
        let outbound = vec![self.to_authorities(vote.clone())];

        // Count our own vote
        let Payload::Checkpoint(message) = vote else {
            unreachable!("catalog built a checkpoint");
        };
        self.on_checkpoint(message);
        outbound
    }

    /// Advance the stable watermark once 2f matching votes exist and the
    /// prior checkpoint is committed; deleting everything below it. A missing
    /// precondition defers collection, it is never an error.
    fn on_checkpoint(&mut self, message: messages::Checkpoint) {
        // The watermark never decreases
        if message.sequence <= self.last_stable {
            return;
        }
        let votes = {
            let entry = self.log.entry(message.sequence).or_default();
            entry.checkpoints.insert(message.replica);
            entry.checkpoints.len()
        };
        if votes < 2 * self.f {
            return;
        }

        // The predecessor checkpoint must already be committed
        let prior = message.sequence.saturating_sub(self.checkpoint_interval);
        let prior_committed = prior == 0
            || prior <= self.last_stable
            || self
                .log
                .get(&prior)
                .map_or(false, |entry| entry.committed);
        if !prior_committed {
            debug!(
                replica = %self.me,
                sequence = message.sequence,
                prior,
                reason = "prior checkpoint not committed",
                "deferring garbage collection"
            );
            return;
        }

        // Advance the watermark and drop all history strictly below it
        let removable: Vec<u64> = self
            .log
            .range(self.last_stable..message.sequence)
            .map(|(sequence, _)| *sequence)
            .collect();
        for sequence in removable {
            self.log.remove(&sequence);
        }
        self.stable_votes = self
            .log
            .get(&message.sequence)
            .map(|entry| entry.checkpoints.clone())
            .unwrap_or_default();
        self.last_stable = message.sequence;
        info!(
            replica = %self.me,
            watermark = message.sequence,
            "advanced stable checkpoint"
        );
    }
}

struct Telemetry {
    committed_blocks: Counter,
    view_changes: Counter,
    dropped_inbound: Counter,
}

/// Actor wrapping [State]: owns the replica's transport endpoints, its
/// periodic loops, and the injected fault policy.
pub struct Replica<E> {
    context: E,
    state: State,
    sender: simulated::Sender<Payload>,
    receiver: simulated::Receiver<Payload>,
    commands: mpsc::UnboundedReceiver<Command>,
    command_sender: mpsc::UnboundedSender<Command>,
    drops: Box<dyn DropPolicy>,
    block_size_limit: u64,
    transactions_per_block: Sampler,
    validation_delay: Sampler,
    checkpoint_delay: Duration,
    timeout_value: Duration,
    telemetry: Telemetry,
}

impl<E> Replica<E>
where
    E: Spawner + Clock + Metrics + RngCore,
{
    pub fn new(
        context: E,
        cfg: Config,
        network: Arc<Mutex<NetworkState>>,
        sender: simulated::Sender<Payload>,
        receiver: simulated::Receiver<Payload>,
        drops: Box<dyn DropPolicy>,
    ) -> (Self, Mailbox) {
        let telemetry = Telemetry {
            committed_blocks: Counter::default(),
            view_changes: Counter::default(),
            dropped_inbound: Counter::default(),
        };
        context.register(
            "committed_blocks",
            "blocks applied to the local chain",
            telemetry.committed_blocks.clone(),
        );
        context.register(
            "view_changes",
            "view-change messages broadcast",
            telemetry.view_changes.clone(),
        );
        context.register(
            "dropped_inbound",
            "inbound messages dropped by the fault policy",
            telemetry.dropped_inbound.clone(),
        );

        let catalog = Catalog::new(cfg.me, cfg.sizes.clone());
        let state = State::new(
            cfg.me,
            network,
            catalog,
            cfg.checkpoint_interval,
            cfg.view_increment,
        );
        let (command_sender, commands) = mpsc::unbounded();
        let mailbox = Mailbox::new(command_sender.clone());
        (
            Self {
                context,
                state,
                sender,
                receiver,
                commands,
                command_sender,
                drops,
                block_size_limit: cfg.block_size_limit,
                transactions_per_block: cfg.transactions_per_block,
                validation_delay: cfg.validation_delay,
                checkpoint_delay: cfg.checkpoint_delay,
                timeout_value: cfg.timeout_value,
                telemetry,
            },
            mailbox,
        )
    }

    /// Spawn the replica's event loop (and, for authorities, its periodic
    /// timeout and checkpoint loops).
    pub fn start(self) -> Handle<()> {
        let context = self.context.clone();
        context.spawn(|_| self.run())
    }

    async fn run(self) {
        let Self {
            context,
            mut state,
            mut sender,
            receiver,
            commands,
            command_sender,
            mut drops,
            block_size_limit,
            transactions_per_block,
            validation_delay,
            checkpoint_delay,
            timeout_value,
            telemetry,
        } = self;
        let me = {
            let status = state.status();
            // Introduce ourselves to every peer before any protocol traffic
            if let Err(err) = sender.send(Recipients::All, status).await {
                debug!(?err, "failed to send status");
            }
            state.me
        };

        // Periodic loops are an authority concern
        if state.is_authority() {
            let ticks = command_sender.clone();
            context.with_label("timeout").spawn(move |context| async move {
                loop {
                    context.sleep(timeout_value).await;
                    if ticks.unbounded_send(Command::CheckTimeout).is_err() {
                        break;
                    }
                }
            });
            let ticks = command_sender.clone();
            context.with_label("checkpoint").spawn(move |context| async move {
                loop {
                    context.sleep(checkpoint_delay).await;
                    if ticks.unbounded_send(Command::Checkpoint).is_err() {
                        break;
                    }
                }
            });
        }

        // Merge network traffic with control commands
        enum Event {
            Envelope(Envelope<Payload>),
            Command(Command),
        }
        let envelopes = stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.ok().map(|envelope| (envelope, receiver))
        })
        .map(Event::Envelope);
        let mut events = Box::pin(stream::select(envelopes, commands.map(Event::Command)));
        let mut rng = context.clone();

        while let Some(event) = events.next().await {
            let outbound = match event {
                Event::Envelope(envelope) => {
                    let kind = envelope.payload.kind();
                    if drops.should_drop(me, kind) {
                        telemetry.dropped_inbound.inc();
                        debug!(replica = %me, kind, reason = "passive fault", "dropping message");
                        continue;
                    }
                    state.on_payload(envelope.origin, envelope.payload)
                }
                Event::Command(Command::Propose { response }) => {
                    let limit =
                        (transactions_per_block.sample(&mut rng) as u64 * block_size_limit) as usize;
                    let timestamp = context
                        .current()
                        .duration_since(UNIX_EPOCH)
                        .expect("virtual time starts at the epoch")
                        .as_millis() as u64;
                    let (count, mut outbound) = state.propose_block(limit, timestamp);
                    if count > 0 && drops.should_drop(me, "pre-prepare") {
                        warn!(replica = %me, reason = "passive fault", "dropping own proposal");
                        outbound.clear();
                    }
                    let _ = response.send(count);
                    outbound
                }
                Event::Command(Command::Inject { transactions }) => state.inject(transactions),
                Event::Command(Command::CheckTimeout) => state.check_timeout(),
                Event::Command(Command::Checkpoint) => state.checkpoint_tick(),
                Event::Command(Command::Summary { response }) => {
                    let _ = response.send(state.chain().summary());
                    continue;
                }
            };

            for (_, payload) in &outbound {
                match payload.kind() {
                    "reply" => {
                        telemetry.committed_blocks.inc();
                    }
                    "view-change" => {
                        telemetry.view_changes.inc();
                    }
                    _ => {}
                };
            }
            dispatch(&context, &mut rng, &mut sender, &validation_delay, outbound).await;
        }
    }
}

/// Send each outbound message, charging the sampled validation delay to the
/// sender before block/vote-bearing broadcasts.
async fn dispatch<E: Clock, R: RngCore>(
    context: &E,
    rng: &mut R,
    sender: &mut simulated::Sender<Payload>,
    validation_delay: &Sampler,
    outbound: Outbound,
) {
    for (recipients, payload) in outbound {
        match payload.kind() {
            "pre-prepare" | "prepare" | "commit" | "transactions" => {
                let delay = validation_delay.sample(rng);
                if delay > 0.0 {
                    context.sleep(Duration::from_secs_f64(delay)).await;
                }
            }
            _ => {}
        }
        if let Err(err) = sender.send(recipients, payload).await {
            debug!(?err, "failed to send");
            return;
        }
    }
}

#[cfg(test)]
impl State {
    fn entry_mut(&mut self, sequence: u64) -> &mut LogEntry {
        self.log.entry(sequence).or_default()
    }
}
