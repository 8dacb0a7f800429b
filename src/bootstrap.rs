//! # Bootstrap & Refresh
//!
//! A cycle runs `bootstrap_queries` lookups of random PeerIds. The targets
//! almost never exist, so each lookup walks toward an empty point of the
//! keyspace and, on the way, fills and refreshes the buckets it passes.
//!
//! Cycles never overlap: a cycle that finds another one in progress returns
//! immediately, and the periodic ticker drops missed ticks.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::dht::DhtInner;
use crate::error::DhtError;
use crate::host::{Host, PERMANENT_ADDR_TTL};
use crate::identity::PeerId;
use crate::keyspace::DistanceId;
use crate::messages::{Message, MessageType};
use crate::query::{ClosestPeers, Query};

/// Dial every configured seed peer in parallel and add the reachable ones
/// to the routing table. Returns how many connected.
pub(crate) async fn connect_seeds<H: Host>(inner: &Arc<DhtInner<H>>) -> usize {
    let mut dials = JoinSet::new();
    for seed in inner.config.seed_peers.iter().filter(|s| s.id != inner.local) {
        inner.host.add_addresses(&seed.id, &seed.addrs, PERMANENT_ADDR_TTL);
        let host = Arc::clone(&inner.host);
        let seed = seed.clone();
        let dial_timeout = inner.config.rpc_timeout;
        dials.spawn(async move {
            let result = tokio::time::timeout(dial_timeout, host.connect(&seed)).await;
            (seed.id, result)
        });
    }

    let mut connected = 0usize;
    while let Some(joined) = dials.join_next().await {
        match joined {
            Ok((peer, Ok(Ok(())))) => {
                inner.observe(peer).await;
                connected += 1;
            }
            Ok((peer, Ok(Err(e)))) => {
                warn!(peer = %peer.short(), error = %e, "failed to connect to seed peer");
            }
            Ok((peer, Err(_))) => warn!(peer = %peer.short(), "seed peer dial timed out"),
            Err(e) => debug!(error = %e, "seed dial task failed"),
        }
    }
    connected
}

/// Run one bootstrap cycle. Returns `Ok` without doing anything when a
/// cycle is already running.
pub(crate) async fn run_cycle<H: Host>(inner: &Arc<DhtInner<H>>) -> Result<(), DhtError> {
    let Ok(_guard) = inner.bootstrap_lock.try_lock() else {
        trace!("bootstrap cycle already running");
        return Ok(());
    };
    let started = Instant::now();

    if inner.routing.size().await == 0 && !inner.config.seed_peers.is_empty() {
        debug!("routing table empty, reconnecting seed peers");
        connect_seeds(inner).await;
    }
    if inner.routing.size().await == 0 {
        return Err(DhtError::NotFound);
    }

    let mut refreshed = 0usize;
    let mut last_error = None;
    for _ in 0..inner.config.bootstrap_queries {
        match random_walk(inner).await {
            Ok(found) => refreshed += found,
            Err(e) => last_error = Some(e),
        }
    }

    let size = inner.routing.size().await;
    debug!(
        queries = inner.config.bootstrap_queries,
        responders = refreshed,
        routing_size = size,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "bootstrap cycle finished"
    );
    match last_error {
        Some(e) if refreshed == 0 => Err(e),
        _ => Ok(()),
    }
}

/// One lookup toward a random PeerId. Returns the number of peers that answered.
async fn random_walk<H: Host>(inner: &DhtInner<H>) -> Result<usize, DhtError> {
    let target = PeerId::random();
    let request = Message::new(MessageType::FindNode, target.as_bytes().to_vec());
    let deadline = Instant::now() + inner.config.bootstrap_timeout;
    let outcome = Query::new(&inner.queries, DistanceId::of_peer(&target), request, deadline)
        .stop_at(target)
        .run(&mut ClosestPeers)
        .await?;
    if outcome.target_found {
        warn!(target = %target.short(), "bootstrap lookup found its random target");
    }
    trace!(
        target = %target.short(),
        responders = outcome.succeeded.len(),
        timed_out = outcome.timed_out,
        "bootstrap lookup done"
    );
    Ok(outcome.succeeded.len())
}

/// Drive bootstrap cycles every `period` until the DHT goes away.
pub(crate) async fn run_periodic<H: Host>(dht: Weak<DhtInner<H>>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately; startup already ran a cycle.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = dht.upgrade() else {
            break;
        };
        if inner.is_closed() {
            break;
        }
        if let Err(e) = run_cycle(&inner).await {
            debug!(error = %e, "periodic bootstrap cycle failed");
        }
    }
    info!("bootstrap ticker stopped");
}

/// Purge expired entries from the host's address book every `period`.
/// Lookups add addresses for every peer they hear about.
pub(crate) async fn run_address_gc<H: Host>(dht: Weak<DhtInner<H>>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = dht.upgrade() else {
            break;
        };
        if inner.is_closed() {
            break;
        }
        let purged = inner.host.address_book().gc();
        if purged > 0 {
            trace!(purged, remaining = inner.host.address_book().len(), "address book gc");
        }
    }
}
