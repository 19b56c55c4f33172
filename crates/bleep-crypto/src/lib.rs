//! Cryptographic primitives used by the consensus core: canonical hashing
//! for transactions and blocks, and symmetric envelope encryption for the
//! wire transport.

pub mod canonical;
pub mod envelope;

pub use canonical::{canonical_json, sha256_hex};
pub use envelope::{Envelope, EnvelopeError, NetworkKey};
