//! Shard assignment and the soft rebalance signal.
//!
//! The rebalance policy is advisory only: it announces a new shard and a
//! candidate leader, but nothing migrates transactions between shards.
//! Block placement stays coupled to whichever shard proposed the block.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bleep_p2p::WireMessage;
use rand::seq::SliceRandom;

const MEAN_LOAD_THRESHOLD: f64 = 100.0;

pub struct ShardManager {
    shard_id: u32,
    shard_leaders: HashMap<u32, u32>,
    shard_load: HashMap<u32, u64>,
    last_adjust_time: Instant,
    rebalance_interval: Duration,
}

impl ShardManager {
    pub fn new(shard_id: u32, rebalance_interval: Duration, now: Instant) -> Self {
        Self {
            shard_id,
            shard_leaders: HashMap::new(),
            shard_load: HashMap::new(),
            last_adjust_time: now,
            rebalance_interval,
        }
    }

    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    pub fn leader_of(&self, shard_id: u32) -> Option<u32> {
        self.shard_leaders.get(&shard_id).copied()
    }

    pub fn on_round_started(&mut self) {
        *self.shard_load.entry(self.shard_id).or_insert(0) += 1;
    }

    pub fn on_shard_load(&mut self, shard_id: u32, load: u64) {
        self.shard_load.insert(shard_id, load);
    }

    pub fn on_shard_leader(&mut self, shard_id: u32, leader_id: u32) {
        self.shard_leaders.insert(shard_id, leader_id);
    }

    /// At most every 30s, check whether mean load across known shards
    /// warrants a new shard; if so return the `shard_leader` announcement
    /// to broadcast. Picks a leader uniformly at random from `active`.
    pub fn maybe_rebalance(&mut self, active: &[u32], sender_id: u32, now: Instant) -> Option<WireMessage> {
        if now.duration_since(self.last_adjust_time) < self.rebalance_interval {
            return None;
        }
        self.last_adjust_time = now;
        if self.shard_load.is_empty() || active.is_empty() {
            return None;
        }
        let mean = self.shard_load.values().sum::<u64>() as f64 / self.shard_load.len() as f64;
        if mean <= MEAN_LOAD_THRESHOLD {
            return None;
        }
        let new_shard_id = self.shard_load.keys().max().copied().unwrap_or(0) + 1;
        let leader = *active.choose(&mut rand::thread_rng())?;
        self.shard_leaders.insert(new_shard_id, leader);
        Some(WireMessage::ShardLeader {
            shard_id: new_shard_id,
            leader_id: leader,
            sender_id,
        })
    }
}
