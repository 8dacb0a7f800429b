//! # QUIC Host
//!
//! [`Host`] implementation over a single `quinn` endpoint with mutual TLS.
//! Both sides present a self-signed Ed25519 certificate; the certificate
//! key determines the PeerId, so a completed handshake authenticates the
//! remote and hands us its public key.
//!
//! Every bidirectional stream starts with the protocol id, written by the
//! opener as an unsigned-varint length followed by the UTF-8 bytes. The
//! accepting side dispatches the stream to the handler registered for that
//! id, or drops it.
//!
//! Addresses are plain `IP:PORT` strings.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use quinn::{Connection, Endpoint, Incoming};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

use crate::crypto::{
    create_client_config, create_server_config, generate_ed25519_cert, peer_id_to_sni,
    verified_public_key,
};
use crate::host::{AddressBook, BoxStream, Connectedness, Host, HostEvent, InboundStream, PERMANENT_ADDR_TTL};
use crate::identity::{Keypair, PeerId, PeerInfo};
use crate::messages::{encode_uvarint, read_uvarint};

/// Longest accepted protocol id.
const MAX_PROTOCOL_ID_LEN: u64 = 256;

/// Time allowed for the opener to send the protocol id.
const PROTOCOL_READ_TIMEOUT: Duration = Duration::from_secs(5);

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

const EVENT_CHANNEL_SIZE: usize = 256;

struct QuicInner {
    keypair: Keypair,
    local: PeerId,
    endpoint: Endpoint,
    book: AddressBook,
    connections: RwLock<HashMap<PeerId, Connection>>,
    public_keys: RwLock<HashMap<PeerId, [u8; 32]>>,
    handlers: RwLock<HashMap<String, mpsc::Sender<InboundStream>>>,
    events: broadcast::Sender<HostEvent>,
}

/// QUIC-backed host. Cheap to clone.
#[derive(Clone)]
pub struct QuicHost {
    inner: Arc<QuicInner>,
}

impl QuicHost {
    /// Bind a QUIC endpoint on `addr` and start accepting connections.
    pub fn bind(keypair: Keypair, addr: SocketAddr) -> Result<Self> {
        let (certs, key) = generate_ed25519_cert(&keypair)?;
        let server_config = create_server_config(certs.clone(), key.clone_key())?;
        let client_config = create_client_config(certs, key)?;

        let mut endpoint = Endpoint::server(server_config, addr)
            .with_context(|| format!("failed to bind QUIC endpoint on {addr}"))?;
        endpoint.set_default_client_config(client_config);

        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let local = keypair.peer_id();
        let inner = Arc::new(QuicInner {
            keypair,
            local,
            endpoint,
            book: AddressBook::new(),
            connections: RwLock::new(HashMap::new()),
            public_keys: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            events,
        });

        tokio::spawn(accept_loop(Arc::downgrade(&inner), inner.endpoint.clone()));
        info!(peer = %local, addr = %inner.endpoint.local_addr()?, "QUIC host listening");
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.endpoint.local_addr()?)
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo::new(self.inner.local, self.listen_addrs())
    }

    /// Close every connection and stop accepting new ones.
    pub fn close(&self) {
        self.inner.endpoint.close(0u32.into(), b"shutdown");
    }
}

fn cached_connection(inner: &QuicInner, peer: &PeerId) -> Option<Connection> {
    let connections = inner.connections.read().unwrap_or_else(|e| e.into_inner());
    connections
        .get(peer)
        .filter(|c| c.close_reason().is_none())
        .cloned()
}

/// Record a handshaken connection and start serving streams on it.
fn register(inner: &Arc<QuicInner>, connection: Connection) -> Result<PeerId> {
    let public_key =
        verified_public_key(&connection).context("connection presented no usable certificate")?;
    let peer = PeerId::from_public_key(&public_key);
    let remote = connection.remote_address();

    inner
        .public_keys
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .insert(peer, public_key);
    inner.book.add(&peer, &[remote.to_string()], PERMANENT_ADDR_TTL);

    let previous = inner
        .connections
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .insert(peer, connection.clone());
    let is_new = previous.is_none_or(|c| c.close_reason().is_some());
    if is_new {
        let _ = inner.events.send(HostEvent::Connected(peer));
    }
    debug!(peer = %peer.short(), addr = %remote, "QUIC connection established");

    tokio::spawn(serve_connection(Arc::downgrade(inner), peer, connection));
    Ok(peer)
}

async fn accept_loop(host: Weak<QuicInner>, endpoint: Endpoint) {
    while let Some(incoming) = endpoint.accept().await {
        let host = host.clone();
        tokio::spawn(async move {
            if let Err(e) = accept_connection(host, incoming).await {
                debug!(error = %e, "inbound connection rejected");
            }
        });
    }
    trace!("QUIC accept loop stopped");
}

async fn accept_connection(host: Weak<QuicInner>, incoming: Incoming) -> Result<()> {
    let connection = incoming.await.context("failed to accept connection")?;
    let inner = host.upgrade().context("host shut down")?;
    register(&inner, connection)?;
    Ok(())
}

async fn serve_connection(host: Weak<QuicInner>, peer: PeerId, connection: Connection) {
    loop {
        let (send, mut recv) = match connection.accept_bi().await {
            Ok(stream) => stream,
            Err(e) => {
                trace!(peer = %peer.short(), error = %e, "connection closed");
                break;
            }
        };
        let Some(inner) = host.upgrade() else {
            return;
        };

        let protocol = match tokio::time::timeout(PROTOCOL_READ_TIMEOUT, read_protocol_id(&mut recv)).await {
            Ok(Ok(protocol)) => protocol,
            Ok(Err(e)) => {
                debug!(peer = %peer.short(), error = %e, "bad protocol header");
                continue;
            }
            Err(_) => {
                debug!(peer = %peer.short(), "protocol header timed out");
                continue;
            }
        };
        let handler = inner
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&protocol)
            .cloned();
        let Some(handler) = handler else {
            debug!(peer = %peer.short(), protocol = %protocol, "no handler for protocol");
            continue;
        };
        let stream: BoxStream = Box::new(tokio::io::join(recv, send));
        if handler.send(InboundStream { peer, stream }).await.is_err() {
            trace!(protocol = %protocol, "stream handler gone");
        }
    }

    let Some(inner) = host.upgrade() else {
        return;
    };
    let removed = {
        let mut connections = inner.connections.write().unwrap_or_else(|e| e.into_inner());
        match connections.get(&peer) {
            Some(current) if current.stable_id() == connection.stable_id() => {
                connections.remove(&peer);
                true
            }
            _ => false,
        }
    };
    if removed {
        let _ = inner.events.send(HostEvent::Disconnected(peer));
    }
}

async fn read_protocol_id(recv: &mut quinn::RecvStream) -> Result<String> {
    let len = read_uvarint(recv)
        .await?
        .ok_or_else(|| anyhow!("stream closed before protocol id"))?;
    if len > MAX_PROTOCOL_ID_LEN {
        bail!("protocol id too long: {len} bytes");
    }
    let mut buf = vec![0u8; len as usize];
    recv.read_exact(&mut buf).await?;
    String::from_utf8(buf).context("protocol id is not UTF-8")
}

impl QuicInner {
    async fn dial(self: &Arc<Self>, peer: &PeerId, addrs: &[String]) -> Result<Connection> {
        if let Some(connection) = cached_connection(self, peer) {
            return Ok(connection);
        }
        if addrs.is_empty() {
            bail!("no addresses for peer {}", peer.short());
        }
        let sni = peer_id_to_sni(peer);
        let mut last_error = anyhow!("no usable address for peer {}", peer.short());
        for addr in addrs {
            let socket: SocketAddr = match addr.parse() {
                Ok(socket) => socket,
                Err(e) => {
                    last_error = anyhow!("invalid socket address {addr}: {e}");
                    continue;
                }
            };
            let connecting = match self.endpoint.connect(socket, &sni) {
                Ok(connecting) => connecting,
                Err(e) => {
                    last_error = anyhow!("failed to initiate connection to {socket}: {e}");
                    continue;
                }
            };
            match tokio::time::timeout(DIAL_TIMEOUT, connecting).await {
                Ok(Ok(connection)) => {
                    let remote = register(self, connection.clone())?;
                    if remote != *peer {
                        connection.close(0u32.into(), b"unexpected peer");
                        bail!("dialed {} but reached {}", peer.short(), remote.short());
                    }
                    return Ok(connection);
                }
                Ok(Err(e)) => last_error = anyhow!("failed to connect to {socket}: {e}"),
                Err(_) => last_error = anyhow!("connection to {socket} timed out"),
            }
        }
        warn!(peer = %peer.short(), error = %last_error, "dial failed");
        Err(last_error)
    }
}

#[async_trait]
impl Host for QuicHost {
    fn local_peer(&self) -> PeerId {
        self.inner.local
    }

    fn keypair(&self) -> &Keypair {
        &self.inner.keypair
    }

    fn listen_addrs(&self) -> Vec<String> {
        match self.inner.endpoint.local_addr() {
            Ok(addr) => vec![addr.to_string()],
            Err(_) => Vec::new(),
        }
    }

    async fn new_stream(&self, peer: &PeerId, protocol: &str) -> Result<BoxStream> {
        let addrs = self.inner.book.addresses(peer);
        let connection = self.inner.dial(peer, &addrs).await?;
        let (mut send, recv) = connection
            .open_bi()
            .await
            .with_context(|| format!("failed to open stream to {}", peer.short()))?;
        let mut header = Vec::with_capacity(protocol.len() + 2);
        encode_uvarint(protocol.len() as u64, &mut header);
        header.extend_from_slice(protocol.as_bytes());
        send.write_all(&header).await.context("failed to write protocol id")?;
        Ok(Box::new(tokio::io::join(recv, send)))
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
        if peer.id == self.inner.local {
            bail!("refusing to dial self");
        }
        self.inner.book.add(&peer.id, &peer.addrs, PERMANENT_ADDR_TTL);
        let mut addrs = peer.addrs.clone();
        for known in self.inner.book.addresses(&peer.id) {
            if !addrs.contains(&known) {
                addrs.push(known);
            }
        }
        self.inner.dial(&peer.id, &addrs).await?;
        Ok(())
    }

    async fn disconnect(&self, peer: &PeerId) {
        let removed = self
            .inner
            .connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(peer);
        if let Some(connection) = removed {
            connection.close(0u32.into(), b"disconnect");
            let _ = self.inner.events.send(HostEvent::Disconnected(*peer));
        }
    }

    fn connectedness(&self, peer: &PeerId) -> Connectedness {
        if cached_connection(&self.inner, peer).is_some() {
            Connectedness::Connected
        } else if self.inner.book.addresses(peer).is_empty() {
            Connectedness::NotConnected
        } else {
            Connectedness::CanConnect
        }
    }

    fn public_key(&self, peer: &PeerId) -> Option<[u8; 32]> {
        if *peer == self.inner.local {
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
