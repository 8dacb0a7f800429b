//! # In-Memory Network
//!
//! A [`Host`] implementation whose streams are `tokio::io::duplex` pipes
//! between hosts registered in the same [`MemoryNetwork`]. Used for tests
//! and in-process simulations.
//!
//! Dialing behaves like a real network in the ways the DHT cares about:
//!
//! - a peer can only be dialed on an address it actually listens on
//!   (`/mem/<peer hex>`), so addresses have to be learned first
//! - offline hosts refuse connections and drop the ones they had
//! - both sides see `Connected` / `Disconnected` events
//! - each side learns the other's public key on connect

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

use crate::host::{
    AddressBook, BoxStream, Connectedness, Host, HostEvent, InboundStream, PERMANENT_ADDR_TTL,
};
use crate::identity::{Keypair, PeerId, PeerInfo};

/// Buffer size of each direction of an in-memory stream.
const STREAM_BUFFER_SIZE: usize = 256 * 1024;

const EVENT_CHANNEL_SIZE: usize = 256;

pub fn memory_addr(peer: &PeerId) -> String {
    format!("/mem/{}", peer.to_hex())
}

#[derive(Default)]
pub struct MemoryNetwork {
    hosts: RwLock<HashMap<PeerId, Weak<HostInner>>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_host(self: &Arc<Self>) -> MemoryHost {
        self.add_host_with_keypair(Keypair::generate())
    }

    pub fn add_host_with_keypair(self: &Arc<Self>, keypair: Keypair) -> MemoryHost {
        let peer = keypair.peer_id();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let inner = Arc::new(HostInner {
            peer,
            keypair,
            network: Arc::clone(self),
            book: AddressBook::new(),
            handlers: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashSet::new()),
            public_keys: RwLock::new(HashMap::new()),
            online: RwLock::new(true),
            events,
        });
        self.hosts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer, Arc::downgrade(&inner));
        MemoryHost { inner }
    }

    fn lookup(&self, peer: &PeerId) -> Option<Arc<HostInner>> {
        self.hosts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer)
            .and_then(Weak::upgrade)
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.hosts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, h)| h.strong_count() > 0)
            .map(|(p, _)| *p)
            .collect()
    }

    /// Take a host off the network: every connection it has is torn down
    /// and further dials to or from it fail.
    pub fn set_offline(&self, peer: &PeerId) {
        let Some(host) = self.lookup(peer) else {
            return;
        };
        *host.online.write().unwrap_or_else(|e| e.into_inner()) = false;
        let connected: Vec<PeerId> = host
            .connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect();
        for remote in connected {
            HostInner::sever(&host, self.lookup(&remote).as_ref(), &remote);
        }
    }

    pub fn set_online(&self, peer: &PeerId) {
        if let Some(host) = self.lookup(peer) {
            *host.online.write().unwrap_or_else(|e| e.into_inner()) = true;
        }
    }
}

struct HostInner {
    peer: PeerId,
    keypair: Keypair,
    network: Arc<MemoryNetwork>,
    book: AddressBook,
    handlers: RwLock<HashMap<String, mpsc::Sender<InboundStream>>>,
    connections: RwLock<HashSet<PeerId>>,
    public_keys: RwLock<HashMap<PeerId, [u8; 32]>>,
    online: RwLock<bool>,
    events: broadcast::Sender<HostEvent>,
}

impl HostInner {
    fn is_online(&self) -> bool {
        *self.online.read().unwrap_or_else(|e| e.into_inner())
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(peer)
    }

    /// Record a connection to `remote`; emits an event if it is new.
    fn attach(&self, remote: &HostInner) {
        self.public_keys
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(remote.peer, remote.keypair.public_key_bytes());
        self.book
            .add(&remote.peer, &[memory_addr(&remote.peer)], PERMANENT_ADDR_TTL);
        let fresh = self
            .connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(remote.peer);
        if fresh {
            let _ = self.events.send(HostEvent::Connected(remote.peer));
        }
    }

    fn detach(&self, remote: &PeerId) {
        let removed = self
            .connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(remote);
        if removed {
            let _ = self.events.send(HostEvent::Disconnected(*remote));
        }
    }

    fn sever(local: &HostInner, remote: Option<&Arc<HostInner>>, remote_id: &PeerId) {
        local.detach(remote_id);
        if let Some(remote) = remote {
            remote.detach(&local.peer);
        }
    }

    fn dial(&self, remote_id: &PeerId, addrs: &[String]) -> Result<Arc<HostInner>> {
        if !self.is_online() {
            bail!("local host is offline");
        }
        let remote = self
            .network
            .lookup(remote_id)
            .ok_or_else(|| anyhow!("no route to peer {}", remote_id.short()))?;
        if !remote.is_online() {
            bail!("peer {} is unreachable", remote_id.short());
        }
        if !self.is_connected(remote_id) {
            let expected = memory_addr(remote_id);
            if !addrs.iter().any(|a| *a == expected) {
                bail!("no dialable address for peer {}", remote_id.short());
            }
            trace!(local = %self.peer.short(), remote = %remote_id.short(), "memnet dial");
        }
        self.attach(&remote);
        remote.attach(self);
        Ok(remote)
    }
}

#[derive(Clone)]
pub struct MemoryHost {
    inner: Arc<HostInner>,
}

impl MemoryHost {
    pub fn info(&self) -> PeerInfo {
        PeerInfo::new(self.inner.peer, self.listen_addrs())
    }

    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.inner.network
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.inner
            .connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect()
    }
}

#[async_trait]
impl Host for MemoryHost {
    fn local_peer(&self) -> PeerId {
        self.inner.peer
    }

    fn keypair(&self) -> &Keypair {
        &self.inner.keypair
    }

    fn listen_addrs(&self) -> Vec<String> {
        vec![memory_addr(&self.inner.peer)]
    }

    async fn new_stream(&self, peer: &PeerId, protocol: &str) -> Result<BoxStream> {
        if *peer == self.inner.peer {
            bail!("cannot open a stream to self");
        }
        let remote = self.inner.dial(peer, &self.inner.book.addresses(peer))?;
        let handler = remote
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(protocol)
            .cloned()
            .ok_or_else(|| anyhow!("peer {} does not speak {}", peer.short(), protocol))?;

        let (local_half, remote_half) = tokio::io::duplex(STREAM_BUFFER_SIZE);
        handler
            .send(InboundStream {
                peer: self.inner.peer,
                stream: Box::new(remote_half),
            })
            .await
            .map_err(|_| anyhow!("peer {} stopped accepting streams", peer.short()))?;
        Ok(Box::new(local_half))
    }

    fn set_stream_handler(&self, protocol: &str, handler: mpsc::Sender<InboundStream>) {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(protocol.to_string(), handler);
    }

    fn remove_stream_handler(&self, protocol: &str) {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(protocol);
    }

    async fn connect(&self, peer: &PeerInfo) -> Result<()> {
        if peer.id == self.inner.peer {
            return Ok(());
        }
        let mut addrs = peer.addrs.clone();
        addrs.extend(self.inner.book.addresses(&peer.id));
        self.inner.dial(&peer.id, &addrs)?;
        Ok(())
    }

    async fn disconnect(&self, peer: &PeerId) {
        let remote = self.inner.network.lookup(peer);
        HostInner::sever(&self.inner, remote.as_ref(), peer);
    }

    fn connectedness(&self, peer: &PeerId) -> Connectedness {
        if self.inner.is_connected(peer) {
            Connectedness::Connected
        } else if self.inner.book.addresses(peer).is_empty() {
            Connectedness::NotConnected
        } else {
            Connectedness::CanConnect
        }
    }

    fn public_key(&self, peer: &PeerId) -> Option<[u8; 32]> {
        if *peer == self.inner.peer {
            return Some(self.inner.keypair.public_key_bytes());
        }
        self.inner
            .public_keys
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer)
            .copied()
    }

    fn address_book(&self) -> &AddressBook {
        &self.inner.book
    }

    fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.inner.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn connect_exchanges_keys_and_emits_events() {
        let net = MemoryNetwork::new();
        let a = net.add_host();
        let b = net.add_host();
        let mut a_events = a.subscribe();
        let mut b_events = b.subscribe();

        a.connect(&b.info()).await.unwrap();
        assert_eq!(a_events.recv().await.unwrap(), HostEvent::Connected(b.local_peer()));
        assert_eq!(b_events.recv().await.unwrap(), HostEvent::Connected(a.local_peer()));
        assert_eq!(a.public_key(&b.local_peer()), Some(b.keypair().public_key_bytes()));
        assert_eq!(b.connectedness(&a.local_peer()), Connectedness::Connected);

        a.disconnect(&b.local_peer()).await;
        assert_eq!(b_events.recv().await.unwrap(), HostEvent::Disconnected(a.local_peer()));
        assert_eq!(a.connectedness(&b.local_peer()), Connectedness::CanConnect);
    }

    #[tokio::test]
    async fn dial_requires_a_known_address() {
        let net = MemoryNetwork::new();
        let a = net.add_host();
        let b = net.add_host();
        assert!(a.connect(&PeerInfo::new(b.local_peer(), vec![])).await.is_err());
        assert!(a.new_stream(&b.local_peer(), "/test").await.is_err());
    }

    #[tokio::test]
    async fn streams_reach_the_registered_handler() {
        let net = MemoryNetwork::new();
        let a = net.add_host();
        let b = net.add_host();
        let (tx, mut rx) = mpsc::channel(4);
        b.set_stream_handler("/echo", tx);
        a.connect(&b.info()).await.unwrap();

        tokio::spawn(async move {
            while let Some(mut inbound) = rx.recv().await {
                let mut buf = [0u8; 5];
                inbound.stream.read_exact(&mut buf).await.unwrap();
                inbound.stream.write_all(&buf).await.unwrap();
            }
        });

        let mut stream = a.new_stream(&b.local_peer(), "/echo").await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        assert!(a.new_stream(&b.local_peer(), "/other").await.is_err());
    }

    #[tokio::test]
    async fn offline_hosts_refuse_dials() {
        let net = MemoryNetwork::new();
        let a = net.add_host();
        let b = net.add_host();
        a.connect(&b.info()).await.unwrap();

        net.set_offline(&b.local_peer());
        assert_eq!(a.connectedness(&b.local_peer()), Connectedness::CanConnect);
        assert!(a.connect(&b.info()).await.is_err());

        net.set_online(&b.local_peer());
        assert!(a.connect(&b.info()).await.is_ok());
    }
}
