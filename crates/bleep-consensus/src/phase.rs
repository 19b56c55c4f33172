use bleep_core::Block;

/// The current round's phase. Carrying the candidate block inside the
/// variant (rather than a separate `Option<Block>` field plus a phase tag)
/// makes "prepare with no block" unrepresentable.
#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    Idle,
    Prepare { block: Block },
    PreCommit { block: Block },
    Commit { block: Block },
    Decided,
}

impl Phase {
    pub fn block(&self) -> Option<&Block> {
        match self {
            Phase::Prepare { block } | Phase::PreCommit { block } | Phase::Commit { block } => Some(block),
            Phase::Idle | Phase::Decided => None,
        }
    }

    pub fn rank(&self) -> u8 {
        match self {
            Phase::Idle => 0,
            Phase::Prepare { .. } => 1,
            Phase::PreCommit { .. } => 2,
            Phase::Commit { .. } => 3,
            Phase::Decided => 4,
        }
    }
}
