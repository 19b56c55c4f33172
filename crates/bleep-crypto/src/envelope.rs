//! Symmetric envelope encryption for outbound transport frames.
//!
//! The source generates a fresh Fernet key per node, which means no two
//! nodes can actually decrypt each other's traffic — flagged in DESIGN.md
//! as a bug. This implementation instead keys every node with the same
//! [`NetworkKey`], distributed out of band at deployment time, so the
//! `seal`/`open` pair is actually usable across the cluster. The scheme is
//! kept behind the [`Envelope`] trait so a real key-exchange path can be
//! swapped in without touching callers.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("ciphertext shorter than nonce prefix")]
    Truncated,
    #[error("AEAD seal failed")]
    SealFailed,
    #[error("AEAD open failed (wrong key or corrupted frame)")]
    OpenFailed,
}

/// A capability pair for sealing and opening transport frames.
pub trait Envelope {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, EnvelopeError>;
    fn open(&self, ciphertext: &[u8]) -> Result<Vec<u8>, EnvelopeError>;
}

/// A shared symmetric key distributed to every node in the deployment.
#[derive(Clone)]
pub struct NetworkKey {
    cipher: Aes256Gcm,
}

impl NetworkKey {
    /// Derive a `NetworkKey` from 32 raw bytes (e.g. loaded from an
    /// operator-provisioned secret).
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(&bytes);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Generate a fresh random key, for tests and single-process
    /// simulations where every node is constructed with the same instance.
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }
}

impl Envelope for NetworkKey {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let mut ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| EnvelopeError::SealFailed)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.append(&mut ciphertext);
        Ok(out)
    }

    fn open(&self, ciphertext: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
        if ciphertext.len() < NONCE_LEN {
            return Err(EnvelopeError::Truncated);
        }
        let (nonce_bytes, body) = ciphertext.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, body)
            .map_err(|_| EnvelopeError::OpenFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_open_round_trips() {
        let key = NetworkKey::generate();
        let plaintext = b"hello consensus";
        let sealed = key.seal(plaintext).unwrap();
        assert_ne!(sealed, plaintext);
        let opened = key.open(&sealed).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn open_fails_with_wrong_key() {
        let key_a = NetworkKey::generate();
        let key_b = NetworkKey::generate();
        let sealed = key_a.seal(b"secret").unwrap();
        assert_eq!(key_b.open(&sealed), Err(EnvelopeError::OpenFailed));
    }

    #[test]
    fn open_rejects_truncated_frame() {
        let key = NetworkKey::generate();
        assert_eq!(key.open(&[1, 2, 3]), Err(EnvelopeError::Truncated));
    }

    #[test]
    fn seal_is_nondeterministic() {
        let key = NetworkKey::generate();
        let a = key.seal(b"same").unwrap();
        let b = key.seal(b"same").unwrap();
        assert_ne!(a, b);
    }
}
