//! # Network Notifications
//!
//! Keeps the routing table in step with the host's connections, and feeds
//! it the peers that answered our queries.

use std::sync::Weak;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

use crate::dht::DhtInner;
use crate::host::{Host, HostEvent};
use crate::identity::PeerId;

pub(crate) async fn run<H: Host>(dht: Weak<DhtInner<H>>, mut events: broadcast::Receiver<HostEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "connectivity notifications lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(inner) = dht.upgrade() else {
            break;
        };
        if inner.is_closed() {
            break;
        }
        match event {
            HostEvent::Connected(peer) => {
                trace!(peer = %peer.short(), "peer connected");
                inner.observe(peer).await;
            }
            HostEvent::Disconnected(peer) => {
                trace!(peer = %peer.short(), "peer disconnected");
                inner.routing.remove(peer).await;
                inner.senders.remove(&peer);
            }
        }
    }
    trace!("notification loop stopped");
}

/// Peers that answered a query, reported by the query engine.
pub(crate) async fn observe_loop<H: Host>(dht: Weak<DhtInner<H>>, mut observed: mpsc::Receiver<PeerId>) {
    while let Some(peer) = observed.recv().await {
        let Some(inner) = dht.upgrade() else {
            break;
        };
        if inner.is_closed() {
            break;
        }
        inner.observe(peer).await;
    }
    trace!("observe loop stopped");
}
