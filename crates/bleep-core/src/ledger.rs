//! The per-node ledger: pending pool, hash-linked chain, balance projection.
//!
//! Owned exclusively by a single node's event loop (see the consensus
//! engine's scheduler) — no internal locking. Cross-node state is shared by
//! message passing, not by sharing this type.

use std::collections::{HashMap, VecDeque};

use thiserror::Error;

use crate::block::{Block, GENESIS_PREVIOUS_HASH};
use crate::transaction::Transaction;

#[derive(Debug, Error, PartialEq)]
pub enum LedgerError {
    #[error("block {given} does not chain from the current tip (expected previous hash {expected})")]
    PreviousHashMismatch { expected: String, given: String },
    #[error("block index {given} is not the next contiguous index (expected {expected})")]
    IndexMismatch { expected: u64, given: u64 },
    #[error("block hash does not match its contents")]
    MalformedBlock,
}

#[derive(Debug, Default)]
pub struct Ledger {
    chain: Vec<Block>,
    pending: VecDeque<Transaction>,
    tx_index: HashMap<String, Transaction>,
    balances: HashMap<String, f64>,
    links: HashMap<String, Vec<String>>,
}

impl Ledger {
    /// Construct an empty ledger seeded with operator-provided opening
    /// balances.
    pub fn new(initial_balances: HashMap<String, f64>) -> Self {
        Self {
            chain: Vec::new(),
            pending: VecDeque::new(),
            tx_index: HashMap::new(),
            balances: initial_balances,
            links: HashMap::new(),
        }
    }

    /// Admit a transaction to the pending pool. No validation here — a
    /// transaction may be admitted before its sender account exists.
    /// A re-admit of an already-known content hash is a no-op.
    pub fn admit(&mut self, tx: Transaction) {
        if self.tx_index.contains_key(&tx.content_hash) {
            return;
        }
        self.tx_index.insert(tx.content_hash.clone(), tx.clone());
        self.pending.push_back(tx);
    }

    /// True iff the sender account exists and can afford the transfer.
    pub fn validate(&self, tx: &Transaction) -> bool {
        match self.balances.get(&tx.sender) {
            Some(balance) => *balance >= tx.amount,
            None => false,
        }
    }

    /// Build (but do not commit) the next block: every pending transaction
    /// that currently validates, in arrival order.
    pub fn propose_block(&self, leader_id: u32, round: u64, shard_id: u32, timestamp: f64) -> Block {
        let transactions: Vec<Transaction> = self
            .pending
            .iter()
            .filter(|tx| self.validate(tx))
            .cloned()
            .collect();
        let previous_hash = self
            .chain
            .last()
            .map(|b| b.hash.clone())
            .unwrap_or_else(|| GENESIS_PREVIOUS_HASH.to_string());
        let index = self.chain.len() as u64 + 1;
        Block::new(index, timestamp, transactions, leader_id, round, shard_id, previous_hash)
    }

    /// Append a block produced locally or by a trusted quorum decision:
    /// applies every transaction to balances and drains those transactions
    /// from `pending`.
    pub fn commit_block(&mut self, block: Block) -> Result<(), LedgerError> {
        self.check_contiguous(&block)?;
        self.apply(&block);
        self.chain.push(block);
        Ok(())
    }

    /// Accept a block delivered out of band by recovery. Unlike
    /// `commit_block`, this may target any round at or before the current
    /// tip; an overwrite of an already-committed, differing block is
    /// rejected rather than applied (see the recovery module for the
    /// no-overwrite-without-certificate policy).
    pub fn append_recovered(&mut self, block: Block) -> Result<(), LedgerError> {
        if !block.is_well_formed() {
            return Err(LedgerError::MalformedBlock);
        }
        let slot = (block.index - 1) as usize;
        if slot == self.chain.len() {
            self.check_contiguous(&block)?;
            self.apply(&block);
            self.chain.push(block);
            Ok(())
        } else if slot < self.chain.len() {
            if self.chain[slot].hash == block.hash {
                Ok(())
            } else {
                Err(LedgerError::IndexMismatch {
                    expected: self.chain.len() as u64 + 1,
                    given: block.index,
                })
            }
        } else {
            Err(LedgerError::IndexMismatch {
                expected: self.chain.len() as u64 + 1,
                given: block.index,
            })
        }
    }

    fn check_contiguous(&self, block: &Block) -> Result<(), LedgerError> {
        let expected_index = self.chain.len() as u64 + 1;
        if block.index != expected_index {
            return Err(LedgerError::IndexMismatch {
                expected: expected_index,
                given: block.index,
            });
        }
        let expected_previous = self
            .chain
            .last()
            .map(|b| b.hash.clone())
            .unwrap_or_else(|| GENESIS_PREVIOUS_HASH.to_string());
        if block.previous_hash != expected_previous {
            return Err(LedgerError::PreviousHashMismatch {
                expected: expected_previous,
                given: block.previous_hash.clone(),
            });
        }
        Ok(())
    }

    fn apply(&mut self, block: &Block) {
        for tx in &block.transactions {
            *self.balances.entry(tx.sender.clone()).or_insert(0.0) -= tx.amount;
            *self.balances.entry(tx.receiver.clone()).or_insert(0.0) += tx.amount;
            self.pending.retain(|p| p.content_hash != tx.content_hash);
        }
    }

    pub fn balance(&self, account: &str) -> f64 {
        *self.balances.get(account).unwrap_or(&0.0)
    }

    pub fn chain_len(&self) -> u64 {
        self.chain.len() as u64
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn tip_hash(&self) -> String {
        self.chain
            .last()
            .map(|b| b.hash.clone())
            .unwrap_or_else(|| GENESIS_PREVIOUS_HASH.to_string())
    }

    pub fn get_transaction(&self, content_hash: &str) -> Option<&Transaction> {
        self.tx_index.get(content_hash)
    }

    pub fn get_block_by_index(&self, index: u64) -> Option<&Block> {
        if index == 0 {
            return None;
        }
        self.chain.get((index - 1) as usize)
    }

    pub fn get_block_by_hash(&self, hash: &str) -> Option<&Block> {
        self.chain.iter().find(|b| b.hash == hash)
    }

    /// Record a bidirectional link between two known transactions, mirroring
    /// the association graph downstream tooling builds over related
    /// transfers (e.g. a refund referencing its original payment).
    pub fn link(&mut self, hash1: &str, hash2: &str) {
        self.links.entry(hash1.to_string()).or_default().push(hash2.to_string());
        self.links.entry(hash2.to_string()).or_default().push(hash1.to_string());
    }

    pub fn linked_transactions(&self, content_hash: &str) -> Vec<&Transaction> {
        self.links
            .get(content_hash)
            .into_iter()
            .flatten()
            .filter_map(|h| self.tx_index.get(h))
            .collect()
    }
}
