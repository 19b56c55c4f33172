use thiserror::Error;

/// Errors raised by the consensus engine. None of these escape the event
/// loop — every call site matches and either scores the sender or skips
/// the round; nothing here is retried automatically.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConsensusError {
    #[error("no active peers remain for shard {shard_id}")]
    NoActivePeers { shard_id: u32 },

    #[error("vote from {peer} rejected: round {got} does not match current round {expected}")]
    WrongRound { peer: u32, expected: u64, got: u64 },

    #[error("vote from {peer} rejected: no block is currently proposed")]
    NoCurrentBlock { peer: u32 },

    #[error("vote from {peer} rejected: hash {got} does not match current block {expected}")]
    WrongBlockHash { peer: u32, expected: String, got: String },

    #[error("vote from {peer} rejected: peer is in the byzantine set")]
    ByzantinePeer { peer: u32 },

    #[error("refusing to prepare block {proposed}: node is locked on {locked} from round {locked_round}")]
    LockedOnDifferentBlock {
        locked: String,
        locked_round: u64,
        proposed: String,
    },

    #[error("ledger error during commit: {0}")]
    Ledger(#[from] bleep_core::LedgerError),
}
