//! Wire messages exchanged between nodes.
//!
//! Every message carries its own `sender_id` and is tagged by `type`;
//! encoded as canonical (key-sorted) JSON before encryption, so the `type`
//! field's position in the struct is irrelevant to the bytes on the wire.

use bleep_core::Block;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRef {
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryData {
    pub block: Block,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    /// Carries the full block, not just its hash: followers have no other
    /// path to materialize `current_block` before voting on it. Later
    /// phases only need the hash since every honest node already cached
    /// the candidate from this message.
    #[serde(rename = "prepare")]
    Prepare { block: Block, round: u64, sender_id: u32 },
    #[serde(rename = "precommit")]
    PreCommit { block: BlockRef, round: u64, sender_id: u32 },
    #[serde(rename = "commit")]
    Commit { block: BlockRef, round: u64, sender_id: u32 },
    #[serde(rename = "recovery_request")]
    RecoveryRequest { round: u64, sender_id: u32 },
    #[serde(rename = "recovery_response")]
    RecoveryResponse { data: RecoveryData, round: u64, sender_id: u32 },
    #[serde(rename = "add_node")]
    AddNode { node_id: u32, sender_id: u32 },
    #[serde(rename = "remove_node")]
    RemoveNode { node_id: u32, sender_id: u32 },
    #[serde(rename = "shard_leader")]
    ShardLeader { shard_id: u32, leader_id: u32, sender_id: u32 },
    #[serde(rename = "shard_load")]
    ShardLoad { shard_id: u32, load: u64, sender_id: u32 },
}

impl WireMessage {
    pub fn sender_id(&self) -> u32 {
        match self {
            WireMessage::Prepare { sender_id, .. }
            | WireMessage::PreCommit { sender_id, .. }
            | WireMessage::Commit { sender_id, .. }
            | WireMessage::RecoveryRequest { sender_id, .. }
            | WireMessage::RecoveryResponse { sender_id, .. }
            | WireMessage::AddNode { sender_id, .. }
            | WireMessage::RemoveNode { sender_id, .. }
            | WireMessage::ShardLeader { sender_id, .. }
            | WireMessage::ShardLoad { sender_id, .. } => *sender_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_round_trips_through_canonical_json() {
        let msg = WireMessage::Prepare {
            block: Block::new(1, 0.0, vec![], 0, 4, 0, bleep_core::GENESIS_PREVIOUS_HASH.to_string()),
            round: 4,
            sender_id: 2,
        };
        let encoded = bleep_crypto::canonical_json(&msg).unwrap();
        assert!(encoded.contains(r#""type":"prepare""#));
        let decoded: WireMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn precommit_tag_has_no_underscore() {
        let msg = WireMessage::PreCommit {
            block: BlockRef { hash: "abc".to_string() },
            round: 1,
            sender_id: 0,
        };
        let encoded = serde_json::to_string(&msg).unwrap();
        assert!(encoded.contains(r#""type":"precommit""#));
    }

    #[test]
    fn sender_id_accessor_covers_every_variant() {
        let msg = WireMessage::ShardLoad {
            shard_id: 1,
            load: 10,
            sender_id: 7,
        };
        assert_eq!(msg.sender_id(), 7);
    }
}
