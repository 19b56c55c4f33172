//! Checkpoint serving and pull-based recovery of missing rounds.

use std::collections::HashSet;

use bleep_core::{Block, Ledger};
use bleep_p2p::{RecoveryData, WireMessage};
use rand::seq::SliceRandom;

/// Tracks outstanding recovery requests (requester side) and already-served
/// requests (server side) so neither direction repeats itself.
#[derive(Debug, Default)]
pub struct Recovery {
    requested: HashSet<(u32, u64)>,
    served: HashSet<(u32, u64)>,
}

impl Recovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// For every round in `(local_len, observed_len]` not already
    /// requested, pick a random non-Byzantine, non-self peer and return
    /// `(peer, recovery_request)` addressed to it. Rounds here are 1-based,
    /// the same numbering as a committed block's `index` and a checkpoint's
    /// key, so a response can be served from either source without a
    /// translation step.
    pub fn request_missing(
        &mut self,
        self_id: u32,
        local_len: u64,
        observed_len: u64,
        candidates: &[u32],
    ) -> Vec<(u32, WireMessage)> {
        let mut out = Vec::new();
        if candidates.is_empty() {
            return out;
        }
        for round in (local_len + 1)..=observed_len {
            if self.requested.contains(&(self_id, round)) {
                continue;
            }
            self.requested.insert((self_id, round));
            if let Some(&peer) = candidates.choose(&mut rand::thread_rng()) {
                out.push((
                    peer,
                    WireMessage::RecoveryRequest {
                        round,
                        sender_id: self_id,
                    },
                ));
            }
        }
        out
    }

    /// Serve a `recovery_request` from `requester` for `round`, iff it is
    /// in `checkpoints` or `round <= ledger.chain_len()`. Returns `None`
    /// (response omitted) on a miss or on a repeated request already
    /// served.
    pub fn serve(
        &mut self,
        requester: u32,
        round: u64,
        ledger: &Ledger,
        checkpoints: &std::collections::HashMap<u64, Block>,
        self_id: u32,
    ) -> Option<WireMessage> {
        if self.served.contains(&(requester, round)) {
            return None;
        }
        let block = checkpoints
            .get(&round)
            .cloned()
            .or_else(|| (round <= ledger.chain_len()).then(|| ledger.get_block_by_index(round).cloned()).flatten())?;
        self.served.insert((requester, round));
        Some(WireMessage::RecoveryResponse {
            data: RecoveryData { block },
            round,
            sender_id: self_id,
        })
    }

    /// Clear the dedup entry for `round` once it has been applied, so a
    /// later gap at the same round (e.g. after a reorg) can be re-requested.
    pub fn clear_requested(&mut self, self_id: u32, round: u64) {
        self.requested.remove(&(self_id, round));
    }
}
