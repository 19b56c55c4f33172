//! Value-transfer transactions.
//!
//! A transaction carries an authentication tag and a content hash rather
//! than a real signature: the source hashes the same fields a signer would
//! sign over but never verifies a public key against them. We keep that
//! shape — `auth_tag` is an opaque tag, not a verifiable signature.

use bleep_crypto::canonical::hash_canonical;
use serde::{Deserialize, Serialize};

/// An immutable value-transfer request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub sender: String,
    pub receiver: String,
    pub amount: f64,
    pub timestamp: f64,
    pub auth_tag: String,
    pub content_hash: String,
}

#[derive(Serialize)]
struct AuthPayload<'a> {
    sender: &'a str,
    receiver: &'a str,
    amount: f64,
    timestamp: f64,
}

#[derive(Serialize)]
struct ContentPayload<'a> {
    sender: &'a str,
    receiver: &'a str,
    amount: f64,
    timestamp: f64,
    auth_tag: &'a str,
}

impl Transaction {
    /// Build a new transaction, computing its auth tag and content hash.
    /// `timestamp` is caller-supplied (monotonic seconds) so that tests and
    /// the scheduler can control it without a wall-clock dependency.
    pub fn new(sender: impl Into<String>, receiver: impl Into<String>, amount: f64, timestamp: f64) -> Self {
        let sender = sender.into();
        let receiver = receiver.into();
        let auth_tag = hash_canonical(&AuthPayload {
            sender: &sender,
            receiver: &receiver,
            amount,
            timestamp,
        })
        .expect("transaction auth payload always serialises");
        let content_hash = hash_canonical(&ContentPayload {
            sender: &sender,
            receiver: &receiver,
            amount,
            timestamp,
            auth_tag: &auth_tag,
        })
        .expect("transaction content payload always serialises");
        Self {
            sender,
            receiver,
            amount,
            timestamp,
            auth_tag,
            content_hash,
        }
    }
}
