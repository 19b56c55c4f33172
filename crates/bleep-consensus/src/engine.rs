//! The per-node three-phase consensus state machine.
//!
//! One round moves `Idle -> Prepare -> PreCommit -> Commit -> Decided`.
//! The engine never touches the network itself: callers drive it with
//! `start_round`/`propose`/`receive_vote`/`tick`, and it hands back the
//! messages those calls should cause to be broadcast. This keeps the state
//! machine testable without a socket in the loop.

use std::time::{Duration, Instant};

use bleep_core::{Block, Ledger};
use bleep_p2p::{BlockRef, PeerBook, WireMessage};

use crate::error::ConsensusError;
use crate::phase::Phase;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteKind {
    Prepare,
    PreCommit,
    Commit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoundStart {
    pub round: u64,
    pub leader: u32,
    pub is_leader: bool,
}

/// What happened as a result of a `tick`: zero or more messages to
/// broadcast, and the block that was just committed, if any.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickOutcome {
    pub broadcasts: Vec<WireMessage>,
    pub committed: Option<Block>,
}

pub struct ConsensusEngine {
    node_id: u32,
    shard_id: u32,
    checkpoint_interval: u64,
    round_deadline: Duration,

    current_round: u64,
    current_leader: Option<u32>,
    phase: Phase,
    prepare_votes: HashSet<u32>,
    precommit_votes: HashSet<u32>,
    commit_votes: HashSet<u32>,

    locked_round: Option<u64>,
    locked_block: Option<Block>,
    checkpoints: std::collections::HashMap<u64, Block>,
    round_started_at: Option<Instant>,
}

impl ConsensusEngine {
    pub fn new(node_id: u32, shard_id: u32, checkpoint_interval: u64, round_deadline: Duration) -> Self {
        Self {
            node_id,
            shard_id,
            checkpoint_interval,
            round_deadline,
            current_round: 0,
            current_leader: None,
            phase: Phase::Idle,
            prepare_votes: HashSet::new(),
            precommit_votes: HashSet::new(),
            commit_votes: HashSet::new(),
            locked_round: None,
            locked_block: None,
            checkpoints: std::collections::HashMap::new(),
            round_started_at: None,
        }
    }

    pub fn current_round(&self) -> u64 {
        self.current_round
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn checkpoint(&self, round: u64) -> Option<&Block> {
        self.checkpoints.get(&round)
    }

    pub fn checkpoints(&self) -> &std::collections::HashMap<u64, Block> {
        &self.checkpoints
    }

    pub fn current_leader(&self) -> Option<u32> {
        self.current_leader
    }

    /// Advance to the next round: resets votes and phase (they are only
    /// ever valid for the current block), and picks a leader. The shard
    /// manager's announced leader for `shard_id` wins if it names an
    /// active peer; otherwise round-robin over `active`.
    pub fn start_round(
        &mut self,
        active: &[u32],
        shard_leader: Option<u32>,
        now: Instant,
    ) -> Result<RoundStart, ConsensusError> {
        self.current_round += 1;
        self.phase = Phase::Idle;
        self.prepare_votes.clear();
        self.precommit_votes.clear();
        self.commit_votes.clear();
        self.round_started_at = Some(now);

        if active.is_empty() {
            self.current_leader = None;
            return Err(ConsensusError::NoActivePeers { shard_id: self.shard_id });
        }
        let leader = shard_leader
            .filter(|l| active.contains(l))
            .unwrap_or_else(|| active[(self.current_round as usize) % active.len()]);
        self.current_leader = Some(leader);
        tracing::debug!(round = self.current_round, shard_id = self.shard_id, leader, "round started");
        Ok(RoundStart {
            round: self.current_round,
            leader,
            is_leader: leader == self.node_id,
        })
    }

    /// Leader-only: build the block, self-vote for it, and return the
    /// single `Prepare` message the caller should broadcast to every
    /// active peer other than itself.
    pub fn propose(&mut self, ledger: &Ledger, timestamp: f64) -> Result<WireMessage, ConsensusError> {
        let block = ledger.propose_block(self.node_id, self.current_round, self.shard_id, timestamp);
        if let (Some(locked_round), Some(locked_block)) = (self.locked_round, &self.locked_block) {
            if locked_round < self.current_round && locked_block.hash != block.hash {
                return Err(ConsensusError::LockedOnDifferentBlock {
                    locked: locked_block.hash.clone(),
                    locked_round,
                    proposed: block.hash.clone(),
                });
            }
        }
        self.prepare_votes.insert(self.node_id);
        self.phase = Phase::Prepare { block: block.clone() };
        Ok(WireMessage::Prepare {
            block,
            round: self.current_round,
            sender_id: self.node_id,
        })
    }

    /// Adopt the leader's proposal: followers learn `current_block` only
    /// from the `Prepare` message, since later phases carry a hash alone.
    pub fn adopt_proposal(&mut self, peers: &mut PeerBook, sender: u32, round: u64, block: Block) -> Result<(), ConsensusError> {
        if peers.is_byzantine(sender) {
            tracing::warn!(peer = sender, "proposal rejected: peer is byzantine");
            return Err(ConsensusError::ByzantinePeer { peer: sender });
        }
        if round != self.current_round {
            tracing::debug!(peer = sender, expected = self.current_round, got = round, "proposal rejected: wrong round");
            return Err(ConsensusError::WrongRound {
                peer: sender,
                expected: self.current_round,
                got: round,
            });
        }
        if let (Some(locked_round), Some(locked_block)) = (self.locked_round, &self.locked_block) {
            if locked_round < round && locked_block.hash != block.hash {
                return Err(ConsensusError::LockedOnDifferentBlock {
                    locked: locked_block.hash.clone(),
                    locked_round,
                    proposed: block.hash.clone(),
                });
            }
        }
        self.prepare_votes.insert(sender);
        self.prepare_votes.insert(self.node_id);
        self.phase = Phase::Prepare { block };
        Ok(())
    }

    /// Process one inbound vote. Returns `Ok(true)` if newly counted,
    /// `Ok(false)` if it was a harmless duplicate, `Err` if rejected (the
    /// caller should score `peer` on `Err`).
    pub fn receive_vote(
        &mut self,
        peers: &PeerBook,
        kind: VoteKind,
        peer: u32,
        round: u64,
        block_hash: &str,
    ) -> Result<bool, ConsensusError> {
        if peers.is_byzantine(peer) {
            tracing::warn!(peer, ?kind, "vote rejected: peer is byzantine");
            return Err(ConsensusError::ByzantinePeer { peer });
        }
        if round != self.current_round {
            tracing::debug!(peer, expected = self.current_round, got = round, "vote rejected: wrong round");
            return Err(ConsensusError::WrongRound {
                peer,
                expected: self.current_round,
                got: round,
            });
        }
        let current_hash = self
            .phase
            .block()
            .map(|b| b.hash.as_str())
            .ok_or(ConsensusError::NoCurrentBlock { peer })?;
        if block_hash != current_hash {
            tracing::warn!(peer, expected = current_hash, got = block_hash, "vote rejected: wrong block hash");
            return Err(ConsensusError::WrongBlockHash {
                peer,
                expected: current_hash.to_string(),
                got: block_hash.to_string(),
            });
        }
        let set = match kind {
            VoteKind::Prepare => &mut self.prepare_votes,
            VoteKind::PreCommit => &mut self.precommit_votes,
            VoteKind::Commit => &mut self.commit_votes,
        };
        Ok(set.insert(peer))
    }

    /// Check phase transitions in order and return the broadcasts (and,
    /// on decide, the committed block) this tick produces. `ledger` is
    /// mutated only on decide.
    pub fn tick(&mut self, active: &[u32], ledger: &mut Ledger) -> Result<TickOutcome, ConsensusError> {
        let mut outcome = TickOutcome::default();
        let quorum = quorum_threshold(active.len());

        if self.prepare_votes.len() > quorum && self.phase.rank() < PRECOMMIT_RANK {
            if let Some(block) = self.phase.block().cloned() {
                self.locked_round = Some(self.current_round);
                self.locked_block = Some(block.clone());
                self.precommit_votes.insert(self.node_id);
                outcome.broadcasts.push(WireMessage::PreCommit {
                    block: BlockRef { hash: block.hash.clone() },
                    round: self.current_round,
                    sender_id: self.node_id,
                });
                self.phase = Phase::PreCommit { block };
                tracing::debug!(round = self.current_round, "phase advanced to precommit");
            }
        }

        if self.precommit_votes.len() > quorum && self.phase.rank() < COMMIT_RANK {
            if let Some(block) = self.phase.block().cloned() {
                self.commit_votes.insert(self.node_id);
                outcome.broadcasts.push(WireMessage::Commit {
                    block: BlockRef { hash: block.hash.clone() },
                    round: self.current_round,
                    sender_id: self.node_id,
                });
                self.phase = Phase::Commit { block };
                tracing::debug!(round = self.current_round, "phase advanced to commit");
            }
        }

        if self.commit_votes.len() > quorum {
            if let Some(block) = self.phase.block().cloned() {
                ledger.commit_block(block.clone())?;
                if self.current_round % self.checkpoint_interval == 0 {
                    self.checkpoints.insert(self.current_round, block.clone());
                }
                outcome.committed = Some(block);
                self.phase = Phase::Decided;
                tracing::info!(round = self.current_round, hash = %outcome.committed.as_ref().unwrap().hash, "round decided");
                self.prepare_votes.clear();
                self.precommit_votes.clear();
                self.commit_votes.clear();
            }
        }

        Ok(outcome)
    }

    /// True once the round's deadline has elapsed without reaching
    /// `Decided`. The caller should then abandon the round; votes and
    /// `current_block` are cleared on the next `start_round`.
    pub fn round_expired(&self, now: Instant) -> bool {
        if self.phase == Phase::Decided {
            return false;
        }
        match self.round_started_at {
            Some(started) if now.duration_since(started) >= self.round_deadline => {
                tracing::warn!(round = self.current_round, "round expired without reaching decided");
                true
            }
            _ => false,
        }
    }

    pub fn locked_block(&self) -> Option<&Block> {
        self.locked_block.as_ref()
    }
}

const PRECOMMIT_RANK: u8 = 2;
const COMMIT_RANK: u8 = 3;

fn quorum_threshold(active_len: usize) -> usize {
    (2 * active_len) / 3
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn engine() -> ConsensusEngine {
        ConsensusEngine::new(0, 0, 5, Duration::from_millis(500))
    }

    #[test]
    fn single_active_peer_decides_alone_in_one_tick() {
        let mut e = engine();
        let mut ledger = Ledger::new(HashMap::new());
        let active = vec![0];
        e.start_round(&active, None, Instant::now()).unwrap();
        e.propose(&ledger, 1.0).unwrap();
        let outcome = e.tick(&active, &mut ledger).unwrap();
        assert!(outcome.committed.is_some());
        assert!(matches!(e.phase(), Phase::Decided));
    }

    #[test]
    fn quorum_of_four_needs_three_votes() {
        let mut e = ConsensusEngine::new(1, 0, 5, Duration::from_millis(500));
        let mut ledger = Ledger::new(HashMap::new());
        let peers = PeerBook::new();
        let active = vec![0, 1, 2, 3];
        e.start_round(&active, Some(1), Instant::now()).unwrap();
        let msg = e.propose(&ledger, 1.0).unwrap();
        let hash = match msg {
            WireMessage::Prepare { block, .. } => block.hash,
            _ => unreachable!(),
        };
        assert!(e.receive_vote(&peers, VoteKind::Prepare, 0, e.current_round(), &hash).unwrap());
        assert!(e.receive_vote(&peers, VoteKind::Prepare, 2, e.current_round(), &hash).unwrap());
        let outcome = e.tick(&active, &mut ledger).unwrap();
        assert!(matches!(e.phase(), Phase::PreCommit { .. }));
        assert_eq!(outcome.broadcasts.len(), 1);
    }

    #[test]
    fn rejects_vote_for_wrong_round() {
        let mut e = engine();
        let ledger = Ledger::new(HashMap::new());
        let peers = PeerBook::new();
        let active = vec![0, 1];
        e.start_round(&active, None, Instant::now()).unwrap();
        e.propose(&ledger, 1.0).unwrap();
        let err = e.receive_vote(&peers, VoteKind::Prepare, 1, 999, "whatever").unwrap_err();
        assert!(matches!(err, ConsensusError::WrongRound { .. }));
    }

    #[test]
    fn no_active_peers_fails_round_start() {
        let mut e = engine();
        let err = e.start_round(&[], None, Instant::now()).unwrap_err();
        assert!(matches!(err, ConsensusError::NoActivePeers { .. }));
    }

    #[test]
    fn round_deadline_expires() {
        let mut e = ConsensusEngine::new(0, 0, 5, Duration::from_millis(0));
        e.start_round(&[0, 1], None, Instant::now()).unwrap();
        assert!(e.round_expired(Instant::now() + Duration::from_millis(1)));
    }
}
