//! Transaction, block and ledger data structures shared by every node.

pub mod block;
pub mod ledger;
pub mod transaction;

pub use block::{Block, GENESIS_PREVIOUS_HASH};
pub use ledger::{Ledger, LedgerError};
pub use transaction::Transaction;
