//! Wire protocol, peer reputation and the batching transport that carries
//! consensus messages between nodes.

pub mod message;
pub mod peer;
pub mod transport;

pub use message::{BlockRef, RecoveryData, WireMessage};
pub use peer::{PeerBook, BEHAVIOR_SCORE_THRESHOLD};
pub use transport::{FlushReport, Outbox, PeerDirectory, StaticDirectory, TransportError};
