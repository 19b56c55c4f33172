//! Blocks: the unit the consensus engine proposes and votes on.

use crate::transaction::Transaction;
use bleep_crypto::canonical::hash_canonical;
use serde::{Deserialize, Serialize};

/// Hash of the (nonexistent) block preceding genesis.
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// An immutable, hash-linked block of committed transactions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// 1-based, monotonically increasing.
    pub index: u64,
    pub timestamp: f64,
    pub transactions: Vec<Transaction>,
    pub leader_id: u32,
    pub round: u64,
    pub shard_id: u32,
    pub previous_hash: String,
    pub hash: String,
}

#[derive(Serialize)]
struct BlockPayload<'a> {
    index: u64,
    timestamp: f64,
    transactions: &'a [Transaction],
    leader_id: u32,
    round: u64,
    shard_id: u32,
    previous_hash: &'a str,
}

impl Block {
    /// Construct a block and compute its hash. `previous_hash` should be
    /// [`GENESIS_PREVIOUS_HASH`] for the first block in the chain.
    pub fn new(
        index: u64,
        timestamp: f64,
        transactions: Vec<Transaction>,
        leader_id: u32,
        round: u64,
        shard_id: u32,
        previous_hash: String,
    ) -> Self {
        let hash = hash_canonical(&BlockPayload {
            index,
            timestamp,
            transactions: &transactions,
            leader_id,
            round,
            shard_id,
            previous_hash: &previous_hash,
        })
        .expect("block payload always serialises");
        Self {
            index,
            timestamp,
            transactions,
            leader_id,
            round,
            shard_id,
            previous_hash,
            hash,
        }
    }

    /// Recompute the hash this block should have, for verification on
    /// receipt from a peer.
    pub fn expected_hash(&self) -> String {
        hash_canonical(&BlockPayload {
            index: self.index,
            timestamp: self.timestamp,
            transactions: &self.transactions,
            leader_id: self.leader_id,
            round: self.round,
            shard_id: self.shard_id,
            previous_hash: &self.previous_hash,
        })
        .expect("block payload always serialises")
    }

    pub fn is_well_formed(&self) -> bool {
        self.hash == self.expected_hash()
    }
}
