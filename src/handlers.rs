//! # Inbound RPC Handling
//!
//! The host delivers one [`InboundStream`] per remote-opened stream. Each
//! stream is served on its own task: read a framed request, dispatch it,
//! write the reply (if the message type has one), repeat until the remote
//! closes the stream or it sits idle.
//!
//! | Request | Reply |
//! |---------|-------|
//! | `PUT_VALUE` | stored record echoed, or an error |
//! | `GET_VALUE` | local record (if valid), closer peers, providers |
//! | `ADD_PROVIDER` | none |
//! | `GET_PROVIDERS` | providers, closer peers |
//! | `FIND_NODE` | closer peers |
//! | `PING` | echo |

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::dht::DhtInner;
use crate::error::DhtError;
use crate::host::{BoxStream, Host, InboundStream, PROVIDER_ADDR_TTL};
use crate::identity::PeerId;
use crate::keyspace::{closer, distance_id, DistanceId};
use crate::messages::{read_message, write_message, Message, MessageType, WireError, WirePeer};

/// A stream with no request for this long is closed.
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

pub(crate) async fn accept_loop<H: Host>(dht: Weak<DhtInner<H>>, mut inbound: mpsc::Receiver<InboundStream>) {
    let mut streams = JoinSet::new();
    loop {
        tokio::select! {
            next = inbound.recv() => {
                let Some(InboundStream { peer, stream }) = next else {
                    break;
                };
                let Some(inner) = dht.upgrade() else {
                    break;
                };
                if inner.is_closed() {
                    break;
                }
                drop(inner);
                streams.spawn(serve_stream(dht.clone(), peer, stream));
            }
            Some(_) = streams.join_next(), if !streams.is_empty() => {}
        }
    }
    streams.shutdown().await;
    trace!("inbound accept loop stopped");
}

async fn serve_stream<H: Host>(dht: Weak<DhtInner<H>>, peer: PeerId, mut stream: BoxStream) {
    let max_size = match dht.upgrade() {
        Some(inner) => inner.config.max_message_size,
        None => return,
    };
    loop {
        let request = match timeout(STREAM_IDLE_TIMEOUT, read_message(&mut stream, max_size)).await {
            Ok(Ok(Some(request))) => request,
            Ok(Ok(None)) => break,
            Ok(Err(e)) => {
                debug!(peer = %peer.short(), error = %e, "dropping stream after bad frame");
                break;
            }
            Err(_) => {
                trace!(peer = %peer.short(), "inbound stream idle");
                break;
            }
        };

        let Some(inner) = dht.upgrade() else {
            break;
        };
        if inner.is_closed() {
            break;
        }
        let reply = handle_message(&inner, peer, request).await;
        drop(inner);

        if let Some(reply) = reply
            && let Err(e) = write_message(&mut stream, &reply, max_size).await
        {
            debug!(peer = %peer.short(), error = %e, "failed to write reply");
            break;
        }
    }
}

/// Dispatch one request from `from`. `None` means no reply is sent.
pub(crate) async fn handle_message<H: Host>(
    inner: &Arc<DhtInner<H>>,
    from: PeerId,
    request: Message,
) -> Option<Message> {
    inner.observe(from).await;
    trace!(peer = %from.short(), kind = request.msg_type.as_str(), "handling request");
    match request.msg_type {
        MessageType::PutValue => Some(handle_put_value(inner, from, &request).await),
        MessageType::GetValue => Some(handle_get_value(inner, from, &request).await),
        MessageType::AddProvider => {
            handle_add_provider(inner, from, &request).await;
            None
        }
        MessageType::GetProviders => Some(handle_get_providers(inner, from, &request).await),
        MessageType::FindNode => Some(handle_find_node(inner, from, &request).await),
        MessageType::Ping => Some(Message::reply_to(&request)),
    }
}

// ============================================================================
// Closer peers
// ============================================================================

/// Routing-table peers nearest `target` that have known addresses and are
/// not the requester. With `closer_than_self`, only peers nearer the target
/// than the local node are kept.
async fn closer_peers<H: Host>(
    inner: &DhtInner<H>,
    target: &DistanceId,
    requester: &PeerId,
    closer_than_self: bool,
) -> Vec<WirePeer> {
    let wanted = inner.config.closer_peer_count;
    // Over-fetch; some candidates are filtered below.
    let candidates = inner.routing.nearest_peers(*target, wanted + 1).await;
    let mut peers = Vec::with_capacity(wanted);
    for peer in candidates {
        if peer == *requester {
            continue;
        }
        if closer_than_self && !closer(&peer, &inner.local, target) {
            continue;
        }
        let info = inner.host.peer_info(&peer);
        if info.addrs.is_empty() {
            trace!(peer = %peer.short(), "omitting closer peer without addresses");
            continue;
        }
        let connection = inner.host.connectedness(&peer);
        peers.push(WirePeer::new(info, connection));
        if peers.len() >= wanted {
            break;
        }
    }
    peers
}

async fn provider_peers<H: Host>(inner: &DhtInner<H>, key: &[u8]) -> Vec<WirePeer> {
    let mut providers = Vec::new();
    for provider in inner.providers.get_providers(key).await {
        let info = inner.host.peer_info(&provider);
        if info.addrs.is_empty() {
            continue;
        }
        let connection = inner.host.connectedness(&provider);
        providers.push(WirePeer::new(info, connection));
    }
    providers
}

// ============================================================================
// Handlers
// ============================================================================

async fn handle_get_value<H: Host>(inner: &DhtInner<H>, from: PeerId, request: &Message) -> Message {
    let mut reply = Message::reply_to(request);
    let target = distance_id(&request.key);

    reply.record = inner.get_checked_local_record(&request.key).await;
    reply.closer_peers = closer_peers(inner, &target, &from, true).await;
    reply.provider_peers = provider_peers(inner, &request.key).await;

    debug!(
        peer = %from.short(),
        found = reply.record.is_some(),
        closer = reply.closer_peers.len(),
        "GET_VALUE"
    );
    reply
}

async fn handle_put_value<H: Host>(inner: &DhtInner<H>, from: PeerId, request: &Message) -> Message {
    let mut reply = Message::reply_to(request);
    match store_record(inner, request).await {
        Ok(stored) => {
            reply.record = Some(stored);
        }
        Err(e) => {
            debug!(peer = %from.short(), error = %e, "rejected PUT_VALUE");
            reply.error = Some(WireError::from_dht_error(&e));
        }
    }
    reply
}

/// Validate and store the record in a PUT_VALUE request. Returns the record
/// now held for the key, which is the incoming one unless the existing one
/// was selected over it.
async fn store_record<H: Host>(
    inner: &DhtInner<H>,
    request: &Message,
) -> Result<crate::records::Record, DhtError> {
    let Some(record) = request.record.clone() else {
        return Err(DhtError::Validation("PUT_VALUE without a record".into()));
    };
    if record.key != request.key {
        return Err(DhtError::Validation("record key does not match request key".into()));
    }
    inner.verify_record(&record, false).await?;

    if let Some(existing) = inner.get_checked_local_record(&record.key).await {
        let values = vec![record.value.clone(), existing.value.clone()];
        if inner.verifier.select(&record.key, &values)? != 0 {
            trace!("keeping existing record over incoming one");
            return Ok(existing);
        }
    }
    inner.put_local_record(record).await
}

async fn handle_add_provider<H: Host>(inner: &DhtInner<H>, from: PeerId, request: &Message) {
    if request.provider_peers.is_empty() {
        warn!(peer = %from.short(), "ADD_PROVIDER with no provider entries");
        return;
    }
    for provider in &request.provider_peers {
        if provider.id != from {
            debug!(
                peer = %from.short(),
                claimed = %provider.id.short(),
                "ignoring third-party provider announcement"
            );
            continue;
        }
        if provider.addrs.is_empty() {
            debug!(peer = %from.short(), "ignoring provider announcement without addresses");
            continue;
        }
        inner.host.add_addresses(&from, &provider.addrs, PROVIDER_ADDR_TTL);
        inner.providers.add_provider(&request.key, from).await;
        trace!(peer = %from.short(), "provider added");
    }
}

async fn handle_get_providers<H: Host>(inner: &DhtInner<H>, from: PeerId, request: &Message) -> Message {
    let mut reply = Message::reply_to(request);
    let target = distance_id(&request.key);

    let mut providers = provider_peers(inner, &request.key).await;
    match inner.datastore.has(&request.key).await {
        Ok(true) if !providers.iter().any(|p| p.id == inner.local) => {
            let info = inner.host.peer_info(&inner.local);
            if !info.addrs.is_empty() {
                providers.push(WirePeer::new(info, crate::messages::Connectedness::Connected));
            }
        }
        Ok(_) => {}
        Err(e) => debug!(error = %e, "datastore lookup failed"),
    }
    reply.provider_peers = providers;
    reply.closer_peers = closer_peers(inner, &target, &from, true).await;

    debug!(
        peer = %from.short(),
        providers = reply.provider_peers.len(),
        closer = reply.closer_peers.len(),
        "GET_PROVIDERS"
    );
    reply
}

async fn handle_find_node<H: Host>(inner: &DhtInner<H>, from: PeerId, request: &Message) -> Message {
    let mut reply = Message::reply_to(request);
    if request.key.as_slice() == inner.local.as_bytes() {
        let info = inner.host.peer_info(&inner.local);
        reply.closer_peers = vec![WirePeer::new(info, crate::messages::Connectedness::Connected)];
        return reply;
    }
    let target = distance_id(&request.key);
    reply.closer_peers = closer_peers(inner, &target, &from, false).await;
    trace!(peer = %from.short(), returned = reply.closer_peers.len(), "FIND_NODE");
    reply
}
