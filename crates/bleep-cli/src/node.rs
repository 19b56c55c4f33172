//! Wires the ledger, consensus engine, shard manager, recovery and
//! transport into one running node, driven by a round timer and a batch
//! flush timer, mirroring a single event loop even though tokio schedules
//! the tasks independently.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use bleep_consensus::{ConsensusEngine, Recovery, ShardManager, TickOutcome, VoteKind};
use bleep_core::Ledger;
use bleep_crypto::NetworkKey;
use bleep_p2p::{transport, Outbox, PeerBook, StaticDirectory, WireMessage};
use bleep_telemetry::Metrics;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;

use crate::config::NodeConfig;

struct State {
    ledger: Ledger,
    engine: ConsensusEngine,
    shard: ShardManager,
    recovery: Recovery,
    peers: PeerBook,
    nodes: HashSet<u32>,
}

pub struct NodeRuntime {
    config: NodeConfig,
    key: NetworkKey,
    state: Mutex<State>,
    outbox: Outbox,
    metrics: Metrics,
}

impl NodeRuntime {
    pub fn new(config: NodeConfig, key: NetworkKey) -> Arc<Self> {
        let now = Instant::now();
        let mut directory = StaticDirectory::new();
        for &peer in &config.nodes {
            directory.insert(peer, config.address(peer));
        }
        let state = State {
            ledger: Ledger::new(config.initial_balances()),
            engine: ConsensusEngine::new(config.node_id, config.shard_id, config.checkpoint_interval, config.round_deadline()),
            shard: ShardManager::new(config.shard_id, config.shard_adjustment_interval(), now),
            recovery: Recovery::new(),
            peers: PeerBook::new(),
            nodes: config.nodes.iter().copied().collect(),
        };
        let batch_interval = config.batch_interval();
        Arc::new(Self {
            outbox: Outbox::new(key.clone(), Arc::new(directory), batch_interval),
            key,
            config,
            state: Mutex::new(state),
            metrics: Metrics::new(),
        })
    }

    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.config.own_address()).await?;
        tracing::info!(node_id = self.config.node_id, addr = %self.config.own_address(), "listening");

        let accept_task = {
            let this = self.clone();
            tokio::spawn(async move { this.accept_loop(listener).await })
        };
        let flush_task = {
            let this = self.clone();
            tokio::spawn(async move { this.flush_loop().await })
        };
        let round_task = {
            let this = self.clone();
            tokio::spawn(async move { this.round_loop().await })
        };

        let _ = tokio::join!(accept_task, flush_task, round_task);
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((mut stream, _)) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        loop {
                            match transport::read_frame(&mut stream, &this.key).await {
                                Ok(Some(msg)) => this.apply_message(msg).await,
                                Ok(None) => break,
                                Err(err) => {
                                    tracing::warn!(error = %err, "decrypt/read failure, closing connection");
                                    break;
                                }
                            }
                        }
                    });
                }
                Err(err) => tracing::warn!(error = %err, "accept failed"),
            }
        }
    }

    async fn flush_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.batch_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let report = self.outbox.flush().await;
            for (peer, latency) in report.latencies {
                self.metrics.record_latency(peer, latency.as_secs_f64());
            }
            if !report.failed.is_empty() {
                let mut state = self.state.lock().await;
                for peer in report.failed {
                    state.peers.record_violation(peer);
                }
            }
        }
    }

    async fn round_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.round_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.run_round().await;
        }
    }

    async fn run_round(&self) {
        let mut state = self.state.lock().await;
        state.shard.on_round_started();
        let known: Vec<u32> = state.nodes.iter().copied().collect();
        let active = state.peers.active_set(&known);
        let shard_leader = state.shard.leader_of(self.config.shard_id);

        let round_start = match state.engine.start_round(&active, shard_leader, Instant::now()) {
            Ok(rs) => rs,
            Err(err) => {
                tracing::error!(error = %err, "round skipped");
                return;
            }
        };
        tracing::info!(round = round_start.round, leader = round_start.leader, "round started");

        if round_start.is_leader && !self.config.byzantine {
            let timestamp = now_seconds();
            let msg = {
                let State { engine, ledger, .. } = &mut *state;
                engine.propose(&*ledger, timestamp)
            };
            match msg {
                Ok(msg) => self.broadcast(&active, msg).await,
                Err(err) => tracing::warn!(error = %err, "propose rejected by locking rule"),
            }
        }

        self.drive_recovery(&mut state, &active).await;
        self.apply_tick(&mut *state, &active).await;

        if let Some(announcement) = state.shard.maybe_rebalance(&active, self.config.node_id, Instant::now()) {
            self.broadcast(&active, announcement).await;
        }
    }

    async fn drive_recovery(&self, state: &mut State, active: &[u32]) {
        let local_len = state.ledger.chain_len();
        let observed = state.engine.current_round().saturating_sub(1);
        if local_len >= observed {
            return;
        }
        let candidates: Vec<u32> = active.iter().copied().filter(|&p| p != self.config.node_id).collect();
        let requests = state.recovery.request_missing(self.config.node_id, local_len, observed, &candidates);
        for (peer, msg) in requests {
            if let Err(err) = self.outbox.send(peer, &msg).await {
                tracing::warn!(error = %err, peer, "failed to enqueue recovery request");
            }
        }
    }

    async fn apply_tick(&self, state: &mut State, active: &[u32]) {
        let outcome = {
            let State { engine, ledger, .. } = &mut *state;
            engine.tick(active, ledger)
        };
        match outcome {
            Ok(outcome) => self.handle_tick_outcome(active, outcome).await,
            Err(err) => tracing::error!(error = %err, "tick failed"),
        }
    }

    async fn handle_tick_outcome(&self, active: &[u32], outcome: TickOutcome) {
        for msg in outcome.broadcasts {
            self.broadcast(active, msg).await;
        }
        if let Some(block) = outcome.committed {
            tracing::info!(index = block.index, hash = %block.hash, "block committed");
        }
    }

    async fn broadcast(&self, active: &[u32], msg: WireMessage) {
        for &peer in active {
            if peer == self.config.node_id {
                continue;
            }
            if let Err(err) = self.outbox.send(peer, &msg).await {
                tracing::warn!(error = %err, peer, "failed to enqueue message");
            }
            self.metrics.record_messages_sent(self.config.node_id, 1);
        }
    }

    /// Dispatch one decrypted inbound message. `Prepare` serves double duty:
    /// the leader's initial broadcast (no current block yet, so it is
    /// adopted) and a follower's echo of that same proposal back to its
    /// peers (a current block is already set, so it counts as a vote). This
    /// keeps a single message shape for both roles instead of inventing a
    /// fourth "propose" type the wire table does not have.
    async fn apply_message(&self, msg: WireMessage) {
        self.metrics.record_messages_received(self.config.node_id, 1);
        let mut state = self.state.lock().await;
        if state.peers.is_byzantine(msg.sender_id()) {
            return;
        }
        let known: Vec<u32> = state.nodes.iter().copied().collect();
        let active = state.peers.active_set(&known);

        match msg {
            WireMessage::Prepare { block, round, sender_id } => {
                let had_block = state.engine.phase().block().is_some();
                if !had_block {
                    let echo = block.clone();
                    let result = state.engine.adopt_proposal(&mut state.peers, sender_id, round, block);
                    let adopted = result.is_ok();
                    self.note_vote_result(&mut state, sender_id, result);
                    if adopted {
                        // Re-broadcast the adopted proposal under our own id so
                        // every other follower counts it as our prepare vote,
                        // the same way the leader's own self-vote is counted.
                        self.broadcast(&active, WireMessage::Prepare { block: echo, round, sender_id: self.config.node_id }).await;
                    }
                } else {
                    let result = state
                        .engine
                        .receive_vote(&state.peers, VoteKind::Prepare, sender_id, round, &block.hash)
                        .map(|_| ());
                    self.note_vote_result(&mut state, sender_id, result);
                }
                self.apply_tick(&mut state, &active).await;
            }
            WireMessage::PreCommit { block, round, sender_id } => {
                let result = state
                    .engine
                    .receive_vote(&state.peers, VoteKind::PreCommit, sender_id, round, &block.hash)
                    .map(|_| ());
                self.note_vote_result(&mut state, sender_id, result);
                self.apply_tick(&mut state, &active).await;
            }
            WireMessage::Commit { block, round, sender_id } => {
                let result = state
                    .engine
                    .receive_vote(&state.peers, VoteKind::Commit, sender_id, round, &block.hash)
                    .map(|_| ());
                self.note_vote_result(&mut state, sender_id, result);
                self.apply_tick(&mut state, &active).await;
            }
            WireMessage::RecoveryRequest { round, sender_id } => {
                let response = {
                    let State { recovery, ledger, engine, .. } = &mut *state;
                    recovery.serve(sender_id, round, &*ledger, engine.checkpoints(), self.config.node_id)
                };
                if let Some(response) = response {
                    if let Err(err) = self.outbox.send(sender_id, &response).await {
                        tracing::warn!(error = %err, "failed to enqueue recovery response");
                    }
                }
            }
            WireMessage::RecoveryResponse { data, round, .. } => {
                if let Err(err) = state.ledger.append_recovered(data.block) {
                    tracing::debug!(error = %err, round, "recovery block rejected");
                } else {
                    state.recovery.clear_requested(self.config.node_id, round);
                }
            }
            WireMessage::AddNode { node_id, .. } => {
                state.nodes.insert(node_id);
            }
            WireMessage::RemoveNode { node_id, .. } => {
                state.nodes.remove(&node_id);
            }
            WireMessage::ShardLeader { shard_id, leader_id, .. } => {
                state.shard.on_shard_leader(shard_id, leader_id);
            }
            WireMessage::ShardLoad { shard_id, load, .. } => {
                state.shard.on_shard_load(shard_id, load);
            }
        }
    }

    fn note_vote_result(&self, state: &mut State, sender_id: u32, result: Result<(), bleep_consensus::ConsensusError>) {
        if let Err(err) = result {
            tracing::debug!(error = %err, peer = sender_id, "vote rejected");
            if state.peers.record_violation(sender_id) {
                tracing::warn!(peer = sender_id, "peer marked byzantine");
            }
        }
    }
}

fn now_seconds() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
