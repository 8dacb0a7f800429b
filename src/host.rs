//! # Host Abstraction
//!
//! The DHT never touches sockets directly. It consumes a [`Host`] that can
//! open and accept bidirectional streams to a PeerId, keeps an address
//! book, and reports connectivity changes.
//!
//! | Implementation | Module | Used by |
//! |----------------|--------|---------|
//! | `MemoryHost` | `memnet` | tests, in-process simulations |
//! | `QuicHost` | `quic` | the `kadroute` binary |
//!
//! Both embed an [`AddressBook`], which stores addresses with a TTL and an
//! exponentially weighted round-trip estimate per peer.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::identity::{Keypair, PeerId, PeerInfo};
pub use crate::messages::Connectedness;

/// TTL for addresses learned from query responses.
pub const TEMP_ADDR_TTL: Duration = Duration::from_secs(2 * 60);

/// TTL for addresses attached to provider announcements.
pub const PROVIDER_ADDR_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// TTL for addresses of peers we are connected to or configured with.
pub const PERMANENT_ADDR_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Weight of a new RTT sample in the latency estimate.
const LATENCY_EWMA_SMOOTHING: f64 = 0.1;

pub trait DhtStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> DhtStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxStream = Box<dyn DhtStream>;

/// A stream accepted by the host for a registered protocol.
pub struct InboundStream {
    pub peer: PeerId,
    pub stream: BoxStream,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostEvent {
    Connected(PeerId),
    Disconnected(PeerId),
}

#[async_trait]
pub trait Host: Send + Sync + 'static {
    fn local_peer(&self) -> PeerId;

    fn keypair(&self) -> &Keypair;

    fn listen_addrs(&self) -> Vec<String>;

    /// Open a new bidirectional stream to `peer` speaking `protocol`,
    /// dialing it first if needed.
    async fn new_stream(&self, peer: &PeerId, protocol: &str) -> Result<BoxStream>;

    /// Deliver inbound streams for `protocol` to `handler`.
    fn set_stream_handler(&self, protocol: &str, handler: mpsc::Sender<InboundStream>);

    fn remove_stream_handler(&self, protocol: &str);

    async fn connect(&self, peer: &PeerInfo) -> Result<()>;

    async fn disconnect(&self, peer: &PeerId);

    fn connectedness(&self, peer: &PeerId) -> Connectedness;

    /// Public key learned for `peer` during the connection handshake.
    fn public_key(&self, peer: &PeerId) -> Option<[u8; 32]>;

    fn address_book(&self) -> &AddressBook;

    fn subscribe(&self) -> broadcast::Receiver<HostEvent>;

    fn addresses(&self, peer: &PeerId) -> Vec<String> {
        self.address_book().addresses(peer)
    }

    fn add_addresses(&self, peer: &PeerId, addrs: &[String], ttl: Duration) {
        if *peer != self.local_peer() {
            self.address_book().add(peer, addrs, ttl);
        }
    }

    fn record_latency(&self, peer: &PeerId, rtt: Duration) {
        self.address_book().record_latency(peer, rtt);
    }

    fn peer_info(&self, peer: &PeerId) -> PeerInfo {
        if *peer == self.local_peer() {
            return PeerInfo::new(*peer, self.listen_addrs());
        }
        PeerInfo::new(*peer, self.addresses(peer))
    }
}

// ============================================================================
// Address book
// ============================================================================

#[derive(Debug, Default)]
struct PeerRecord {
    addrs: Vec<(String, Instant)>,
    latency: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct AddressBook {
    peers: RwLock<HashMap<PeerId, PeerRecord>>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add addresses, extending the expiry of ones already known.
    pub fn add(&self, peer: &PeerId, addrs: &[String], ttl: Duration) {
        if addrs.is_empty() {
            return;
        }
        let expires = Instant::now() + ttl;
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let record = peers.entry(*peer).or_default();
        for addr in addrs {
            match record.addrs.iter_mut().find(|(a, _)| a == addr) {
                Some((_, exp)) => *exp = (*exp).max(expires),
                None => record.addrs.push((addr.clone(), expires)),
            }
        }
    }

    pub fn addresses(&self, peer: &PeerId) -> Vec<String> {
        let now = Instant::now();
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers
            .get(peer)
            .map(|r| {
                r.addrs
                    .iter()
                    .filter(|(_, exp)| *exp > now)
                    .map(|(a, _)| a.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn clear_addresses(&self, peer: &PeerId) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = peers.get_mut(peer) {
            record.addrs.clear();
        }
    }

    pub fn record_latency(&self, peer: &PeerId, rtt: Duration) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let record = peers.entry(*peer).or_default();
        record.latency = Some(match record.latency {
            None => rtt,
            Some(prev) => prev.mul_f64(1.0 - LATENCY_EWMA_SMOOTHING)
                + rtt.mul_f64(LATENCY_EWMA_SMOOTHING),
        });
    }

    pub fn latency(&self, peer: &PeerId) -> Option<Duration> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.get(peer).and_then(|r| r.latency)
    }

    /// Drop expired addresses and peers left with nothing to remember.
    /// Returns how many peers were dropped.
    pub fn gc(&self) -> usize {
        let now = Instant::now();
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let before = peers.len();
        peers.retain(|_, record| {
            record.addrs.retain(|(_, exp)| *exp > now);
            !record.addrs.is_empty() || record.latency.is_some()
        });
        before - peers.len()
    }

    /// Number of peers with any remembered state.
    pub fn len(&self) -> usize {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn addresses_expire_after_ttl() {
        let book = AddressBook::new();
        let peer = PeerId::random();
        book.add(&peer, &["/mem/a".to_string()], Duration::from_secs(60));
        book.add(&peer, &["/mem/b".to_string()], Duration::from_secs(600));
        assert_eq!(book.addresses(&peer).len(), 2);

        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(book.addresses(&peer), vec!["/mem/b".to_string()]);

        // Re-adding with a longer TTL extends the expiry.
        book.add(&peer, &["/mem/b".to_string()], Duration::from_secs(3600));
        tokio::time::advance(Duration::from_secs(1200)).await;
        assert_eq!(book.addresses(&peer), vec!["/mem/b".to_string()]);

        book.gc();
        book.clear_addresses(&peer);
        assert!(book.addresses(&peer).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn gc_purges_expired_peers() {
        let book = AddressBook::new();
        let transient = PeerId::random();
        let pinged = PeerId::random();
        let lasting = PeerId::random();
        book.add(&transient, &["/mem/t".to_string()], Duration::from_secs(10));
        book.add(&pinged, &["/mem/p".to_string()], Duration::from_secs(10));
        book.record_latency(&pinged, Duration::from_millis(5));
        book.add(&lasting, &["/mem/l".to_string()], Duration::from_secs(3600));
        assert_eq!(book.len(), 3);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(book.gc(), 1);
        assert_eq!(book.len(), 2);
        assert!(book.addresses(&pinged).is_empty());
        assert!(book.latency(&pinged).is_some());
        assert_eq!(book.addresses(&lasting), vec!["/mem/l".to_string()]);
        assert_eq!(book.gc(), 0);
    }

    #[test]
    fn latency_is_smoothed() {
        let book = AddressBook::new();
        let peer = PeerId::random();
        assert!(book.latency(&peer).is_none());
        book.record_latency(&peer, Duration::from_millis(100));
        assert_eq!(book.latency(&peer), Some(Duration::from_millis(100)));
        book.record_latency(&peer, Duration::from_millis(200));
        let smoothed = book.latency(&peer).unwrap();
        assert!(smoothed > Duration::from_millis(100) && smoothed < Duration::from_millis(200));
    }
}
