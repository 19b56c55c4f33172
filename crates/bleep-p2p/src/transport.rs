//! Length-framed, encrypted transport with per-peer batching.
//!
//! Framing: `[u32 big-endian length][ciphertext]`, repeated back-to-back on
//! one connection per flush. A decryption failure is fatal for the
//! connection — it is closed and logged, never retried on the same socket.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bleep_crypto::{Envelope, NetworkKey};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::message::WireMessage;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error talking to peer {peer}: {source}")]
    Io { peer: u32, source: std::io::Error },
    #[error("failed to seal outbound frame: {0}")]
    Seal(#[from] bleep_crypto::EnvelopeError),
    #[error("failed to encode message as canonical json: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("no address registered for peer {0}")]
    UnknownPeer(u32),
}

/// Resolves a peer id to a connectable address.
pub trait PeerDirectory: Send + Sync {
    fn address(&self, peer: u32) -> Option<String>;
}

#[derive(Debug, Default, Clone)]
pub struct StaticDirectory {
    addresses: HashMap<u32, String>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, peer: u32, addr: impl Into<String>) {
        self.addresses.insert(peer, addr.into());
    }
}

impl PeerDirectory for StaticDirectory {
    fn address(&self, peer: u32) -> Option<String> {
        self.addresses.get(&peer).cloned()
    }
}

/// One buffered, not-yet-flushed frame for a peer.
struct Queued {
    peer: u32,
    ciphertext: Vec<u8>,
    enqueued_at: Instant,
}

/// What `flush` did: peers that failed to deliver, and an enqueue-to-flush
/// latency sample per peer that had at least one frame delivered (the
/// oldest frame in that peer's batch, since that is the one that waited
/// longest).
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FlushReport {
    pub failed: Vec<u32>,
    pub latencies: Vec<(u32, Duration)>,
}

/// Per-peer outbox: accumulates sealed frames and flushes them as a single
/// connection per peer, either on a timer or when explicitly drained.
pub struct Outbox {
    key: NetworkKey,
    directory: Arc<dyn PeerDirectory>,
    queue: Mutex<Vec<Queued>>,
    pub batch_interval: Duration,
}

impl Outbox {
    pub fn new(key: NetworkKey, directory: Arc<dyn PeerDirectory>, batch_interval: Duration) -> Self {
        Self {
            key,
            directory,
            queue: Mutex::new(Vec::new()),
            batch_interval,
        }
    }

    /// Encode, seal and enqueue a message for `peer`. Does not touch the
    /// network until the batch is flushed.
    pub async fn send(&self, peer: u32, msg: &WireMessage) -> Result<(), TransportError> {
        let plaintext = bleep_crypto::canonical_json(msg)?;
        let ciphertext = self.key.seal(plaintext.as_bytes())?;
        self.queue.lock().await.push(Queued { peer, ciphertext, enqueued_at: Instant::now() });
        Ok(())
    }

    /// Drain the queue, opening one connection per distinct peer and
    /// writing its frames back-to-back. A peer that fails to connect or
    /// write is reported back to the caller so it can be scored; its
    /// undelivered frames are dropped (at-most-once, no retry). Peers that
    /// delivered successfully get a latency sample measured from their
    /// oldest queued frame to this flush.
    pub async fn flush(&self) -> FlushReport {
        let queued = {
            let mut guard = self.queue.lock().await;
            std::mem::take(&mut *guard)
        };
        let mut by_peer: HashMap<u32, Vec<Vec<u8>>> = HashMap::new();
        let mut oldest: HashMap<u32, Instant> = HashMap::new();
        for item in queued {
            oldest
                .entry(item.peer)
                .and_modify(|t| *t = (*t).min(item.enqueued_at))
                .or_insert(item.enqueued_at);
            by_peer.entry(item.peer).or_default().push(item.ciphertext);
        }
        let now = Instant::now();
        let mut report = FlushReport::default();
        for (peer, frames) in by_peer {
            if let Err(err) = self.deliver(peer, &frames).await {
                tracing::warn!(peer, error = %err, "flush to peer failed");
                report.failed.push(peer);
            } else if let Some(&enqueued_at) = oldest.get(&peer) {
                report.latencies.push((peer, now.duration_since(enqueued_at)));
            }
        }
        report
    }

    async fn deliver(&self, peer: u32, frames: &[Vec<u8>]) -> Result<(), TransportError> {
        let addr = self
            .directory
            .address(peer)
            .ok_or(TransportError::UnknownPeer(peer))?;
        let mut stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| TransportError::Io { peer, source })?;
        for frame in frames {
            let len = frame.len() as u32;
            stream
                .write_all(&len.to_be_bytes())
                .await
                .map_err(|source| TransportError::Io { peer, source })?;
            stream
                .write_all(frame)
                .await
                .map_err(|source| TransportError::Io { peer, source })?;
        }
        stream
            .shutdown()
            .await
            .map_err(|source| TransportError::Io { peer, source })?;
        Ok(())
    }
}

/// Read one length-framed ciphertext from a connection and open it.
/// Returns `Ok(None)` on clean EOF before any bytes of a new frame arrive.
pub async fn read_frame(
    stream: &mut TcpStream,
    key: &NetworkKey,
) -> Result<Option<WireMessage>, TransportError> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(source) => return Err(TransportError::Io { peer: 0, source }),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|source| TransportError::Io { peer: 0, source })?;
    let plaintext = key.open(&body)?;
    let msg: WireMessage = serde_json::from_slice(&plaintext)?;
    Ok(Some(msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_enqueues_without_touching_the_network() {
        let key = NetworkKey::generate();
        let directory: Arc<dyn PeerDirectory> = Arc::new(StaticDirectory::new());
        let outbox = Outbox::new(key, directory, Duration::from_millis(100));
        let msg = WireMessage::RecoveryRequest { round: 1, sender_id: 0 };
        outbox.send(1, &msg).await.unwrap();
        assert_eq!(outbox.queue.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn flush_reports_unreachable_peers_as_failed() {
        let key = NetworkKey::generate();
        let mut dir = StaticDirectory::new();
        dir.insert(9, "127.0.0.1:1");
        let outbox = Outbox::new(key, Arc::new(dir), Duration::from_millis(10));
        let msg = WireMessage::RecoveryRequest { round: 1, sender_id: 0 };
        outbox.send(9, &msg).await.unwrap();
        let report = outbox.flush().await;
        assert_eq!(report.failed, vec![9]);
        assert!(report.latencies.is_empty());
    }

    #[tokio::test]
    async fn flush_drops_frames_for_unknown_peers_and_reports_failure() {
        let key = NetworkKey::generate();
        let outbox = Outbox::new(key, Arc::new(StaticDirectory::new()), Duration::from_millis(10));
        let msg = WireMessage::RecoveryRequest { round: 1, sender_id: 0 };
        outbox.send(42, &msg).await.unwrap();
        let report = outbox.flush().await;
        assert_eq!(report.failed, vec![42]);
        assert!(report.latencies.is_empty());
    }

    #[tokio::test]
    async fn flush_reports_a_latency_sample_for_each_delivered_peer() {
        let key = NetworkKey::generate();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });
        let mut dir = StaticDirectory::new();
        dir.insert(7, addr.to_string());
        let outbox = Outbox::new(key, Arc::new(dir), Duration::from_millis(10));
        let msg = WireMessage::RecoveryRequest { round: 1, sender_id: 0 };
        outbox.send(7, &msg).await.unwrap();
        let report = outbox.flush().await;
        assert!(report.failed.is_empty());
        assert_eq!(report.latencies.len(), 1);
        assert_eq!(report.latencies[0].0, 7);
    }
}
