//! Three-phase HotStuff-style consensus: round state machine, shard
//! assignment and pull-based recovery.

pub mod engine;
pub mod error;
pub mod phase;
pub mod recovery;
pub mod shard;

pub use engine::{ConsensusEngine, RoundStart, TickOutcome, VoteKind};
pub use error::ConsensusError;
pub use phase::Phase;
pub use recovery::Recovery;
pub use shard::ShardManager;
