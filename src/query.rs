//! # Iterative Query Engine
//!
//! Converges on the k peers closest to a target with at most α requests in
//! flight.
//!
//! ## Per-Query State
//!
//! | Field | Role |
//! |-------|------|
//! | `states` | PeerId → Queued / Active / Succeeded / Failed / Unreachable |
//! | `frontier` | min-heap on (XOR distance, insertion order) of queued peers |
//! | `closest` | ordered set of at most k peers that answered |
//! | `inflight` | `JoinSet` of outstanding requests, never more than α |
//!
//! ## Termination
//!
//! - the [`QueryHandler`] returns [`QueryFlow::Stop`] (enough values or
//!   providers gathered)
//! - the `stop_at` peer answered, so it is in `closest`
//! - nothing is in flight and no queued peer is closer than the farthest
//!   member of a full `closest` set (or the frontier is empty)
//! - the deadline passes; outstanding requests are aborted and whatever
//!   was gathered is returned with `timed_out` set
//!
//! The engine reads the routing table through [`RoutingHandle`] and feeds
//! responsive peers back through a one-way channel, so the table never
//! holds a reference to a running query.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::DhtError;
use crate::host::{Host, TEMP_ADDR_TTL};
use crate::identity::PeerId;
use crate::keyspace::DistanceId;
use crate::messages::Message;
use crate::routing::RoutingHandle;
use crate::sender::SenderPool;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    Queued,
    Active,
    Succeeded,
    /// Answered, but with an unusable reply.
    Failed,
    Unreachable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryFlow {
    Continue,
    Stop,
}

/// Per-query reply processing: value aggregation, provider collection.
#[async_trait]
pub trait QueryHandler: Send {
    async fn on_reply(&mut self, from: PeerId, reply: &Message) -> QueryFlow;
}

/// Handler for plain closest-peer lookups.
pub struct ClosestPeers;

#[async_trait]
impl QueryHandler for ClosestPeers {
    async fn on_reply(&mut self, _from: PeerId, _reply: &Message) -> QueryFlow {
        QueryFlow::Continue
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryOutcome {
    /// Responsive peers closest to the target, nearest first, at most k.
    pub closest: Vec<PeerId>,
    /// Every peer that answered, in reply order.
    pub succeeded: Vec<PeerId>,
    pub timed_out: bool,
    /// The handler asked to stop.
    pub stopped: bool,
    /// The `stop_at` peer answered.
    pub target_found: bool,
}

/// Shared collaborators of every query run by one DHT.
pub struct QueryContext<H: Host> {
    pub local: PeerId,
    pub host: Arc<H>,
    pub senders: Arc<SenderPool<H>>,
    pub routing: RoutingHandle,
    pub observed: mpsc::Sender<PeerId>,
    pub alpha: usize,
    pub k: usize,
}

type RpcResult = (PeerId, Duration, Result<Message, DhtError>);

pub struct Query<'a, H: Host> {
    ctx: &'a QueryContext<H>,
    target: DistanceId,
    request: Arc<Message>,
    stop_at: Option<PeerId>,
    deadline: Instant,
    states: HashMap<PeerId, PeerState>,
    frontier: BinaryHeap<Reverse<(DistanceId, u64, PeerId)>>,
    closest: BTreeSet<(DistanceId, PeerId)>,
    next_seq: u64,
}

impl<'a, H: Host> Query<'a, H> {
    pub fn new(ctx: &'a QueryContext<H>, target: DistanceId, request: Message, deadline: Instant) -> Self {
        Self {
            ctx,
            target,
            request: Arc::new(request),
            stop_at: None,
            deadline,
            states: HashMap::new(),
            frontier: BinaryHeap::new(),
            closest: BTreeSet::new(),
            next_seq: 0,
        }
    }

    /// Stop as soon as `peer` answers.
    pub fn stop_at(mut self, peer: PeerId) -> Self {
        self.stop_at = Some(peer);
        self
    }

    fn enqueue(&mut self, peer: PeerId) {
        if peer == self.ctx.local || self.states.contains_key(&peer) {
            return;
        }
        self.states.insert(peer, PeerState::Queued);
        let distance = DistanceId::of_peer(&peer).xor(&self.target);
        self.frontier.push(Reverse((distance, self.next_seq, peer)));
        self.next_seq += 1;
    }

    fn is_saturated(&self) -> bool {
        self.closest.len() >= self.ctx.k
    }

    /// Next queued peer worth asking, if any.
    fn next_candidate(&mut self) -> Option<PeerId> {
        while let Some(Reverse((distance, seq, peer))) = self.frontier.pop() {
            if self.states.get(&peer) != Some(&PeerState::Queued) {
                continue;
            }
            if self.is_saturated()
                && let Some((farthest, _)) = self.closest.last()
                && distance >= *farthest
            {
                // The heap is ordered, so nothing left can improve the set.
                self.frontier.push(Reverse((distance, seq, peer)));
                return None;
            }
            return Some(peer);
        }
        None
    }

    fn dispatch(&mut self, inflight: &mut JoinSet<RpcResult>, peer: PeerId) {
        self.states.insert(peer, PeerState::Active);
        let senders = Arc::clone(&self.ctx.senders);
        let request = Arc::clone(&self.request);
        trace!(peer = %peer.short(), kind = request.msg_type.as_str(), "query dispatch");
        inflight.spawn(async move {
            let start = Instant::now();
            let result = senders.send_request(&peer, &request).await;
            (peer, start.elapsed(), result)
        });
    }

    fn record_success(&mut self, peer: PeerId, rtt: Duration, reply: &Message) {
        self.states.insert(peer, PeerState::Succeeded);
        self.closest.insert((DistanceId::of_peer(&peer).xor(&self.target), peer));
        while self.closest.len() > self.ctx.k {
            self.closest.pop_last();
        }
        self.ctx.host.record_latency(&peer, rtt);
        let _ = self.ctx.observed.try_send(peer);

        for info in reply.closer_peer_infos() {
            if info.id == self.ctx.local {
                continue;
            }
            self.ctx.host.add_addresses(&info.id, &info.addrs, TEMP_ADDR_TTL);
            self.enqueue(info.id);
        }
    }

    /// Drive the query to completion.
    ///
    /// Fails with `NotFound` when the routing table has no peers, and with
    /// the last request error when every contacted peer failed.
    pub async fn run<Q: QueryHandler>(mut self, handler: &mut Q) -> Result<QueryOutcome, DhtError> {
        let seeds = self
            .ctx
            .routing
            .nearest_peers(self.target, self.ctx.alpha)
            .await;
        if seeds.is_empty() {
            debug!("query has no peers to start from");
            return Err(DhtError::NotFound);
        }
        for peer in seeds {
            self.enqueue(peer);
        }

        let mut outcome = QueryOutcome::default();
        let mut inflight: JoinSet<RpcResult> = JoinSet::new();
        let mut last_error: Option<DhtError> = None;
        let deadline = tokio::time::sleep_until(self.deadline);
        tokio::pin!(deadline);

        loop {
            while inflight.len() < self.ctx.alpha {
                match self.next_candidate() {
                    Some(peer) => self.dispatch(&mut inflight, peer),
                    None => break,
                }
            }
            if inflight.is_empty() {
                break;
            }

            let joined = tokio::select! {
                _ = &mut deadline => {
                    outcome.timed_out = true;
                    inflight.abort_all();
                    break;
                }
                joined = inflight.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };
            let (peer, rtt, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    debug!(error = %e, "query task failed");
                    continue;
                }
            };

            match result {
                Ok(reply) if reply.error.is_none() => {
                    self.record_success(peer, rtt, &reply);
                    outcome.succeeded.push(peer);
                    if handler.on_reply(peer, &reply).await == QueryFlow::Stop {
                        outcome.stopped = true;
                        inflight.abort_all();
                        break;
                    }
                    if self.stop_at == Some(peer) {
                        outcome.target_found = true;
                        inflight.abort_all();
                        break;
                    }
                }
                Ok(reply) => {
                    self.states.insert(peer, PeerState::Failed);
                    let err = reply
                        .error
                        .map(|e| e.into_dht_error())
                        .unwrap_or(DhtError::NotFound);
                    trace!(peer = %peer.short(), error = %err, "query peer replied with error");
                    last_error = Some(err);
                }
                Err(err) => {
                    self.states.insert(peer, PeerState::Unreachable);
                    trace!(peer = %peer.short(), error = %err, "query peer unreachable");
                    last_error = Some(err);
                }
            }
        }

        outcome.closest = self.closest.iter().map(|(_, p)| *p).collect();
        if outcome.succeeded.is_empty() && !outcome.timed_out {
            return Err(last_error.unwrap_or(DhtError::NotFound));
        }
        debug!(
            kind = self.request.msg_type.as_str(),
            succeeded = outcome.succeeded.len(),
            contacted = self.states.len(),
            timed_out = outcome.timed_out,
            "query finished"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DhtConfig;
    use crate::host::InboundStream;
    use crate::memnet::{MemoryHost, MemoryNetwork};
    use crate::messages::{read_message, write_message, Connectedness, MessageType, WirePeer};
    use crate::routing::RoutingTable;
    use crate::sender::SenderSettings;
    use std::sync::Mutex as StdMutex;

    const PROTO: &str = "/kadroute/kad/1.0.0";
    const MAX: usize = 1 << 20;

    /// A fake overlay: each host answers FIND_NODE with a fixed list of
    /// neighbours.
    fn serve_neighbours(host: &MemoryHost, neighbours: Vec<MemoryHost>, hits: Arc<StdMutex<Vec<PeerId>>>) {
        let (tx, mut rx) = mpsc::channel::<InboundStream>(16);
        host.set_stream_handler(PROTO, tx);
        let me = host.local_peer();
        let closer: Vec<WirePeer> = neighbours
            .iter()
            .map(|h| WirePeer::new(h.info(), Connectedness::CanConnect))
            .collect();
        tokio::spawn(async move {
            while let Some(mut inbound) = rx.recv().await {
                let closer = closer.clone();
                let hits = Arc::clone(&hits);
                tokio::spawn(async move {
                    while let Ok(Some(req)) = read_message(&mut inbound.stream, MAX).await {
                        hits.lock().unwrap().push(me);
                        let mut reply = Message::reply_to(&req);
                        reply.closer_peers = closer.clone();
                        if write_message(&mut inbound.stream, &reply, MAX).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
    }

    fn context(host: &MemoryHost, alpha: usize, k: usize) -> (QueryContext<MemoryHost>, mpsc::Receiver<PeerId>) {
        let host = Arc::new(host.clone());
        let settings = SenderSettings::from_config(&DhtConfig::default());
        let (observed, rx) = mpsc::channel(1024);
        let ctx = QueryContext {
            local: host.local_peer(),
            senders: Arc::new(SenderPool::new(Arc::clone(&host), settings)),
            routing: RoutingHandle::spawn(RoutingTable::new(host.local_peer(), k)),
            host,
            observed,
            alpha,
            k,
        };
        (ctx, rx)
    }

    #[tokio::test]
    async fn empty_table_fails_fast() {
        let net = MemoryNetwork::new();
        let a = net.add_host();
        let (ctx, _rx) = context(&a, 3, 20);
        let query = Query::new(
            &ctx,
            DistanceId::of_peer(&PeerId::random()),
            Message::new(MessageType::FindNode, vec![]),
            Instant::now() + Duration::from_secs(5),
        );
        assert_eq!(query.run(&mut ClosestPeers).await.unwrap_err(), DhtError::NotFound);
    }

    #[tokio::test]
    async fn walks_a_chain_to_the_end() {
        // a knows b, b knows c, c knows d.
        let net = MemoryNetwork::new();
        let hosts: Vec<MemoryHost> = (0..4).map(|_| net.add_host()).collect();
        let hits = Arc::new(StdMutex::new(Vec::new()));
        for i in 1..4 {
            let next = hosts.get(i + 1).cloned().into_iter().collect();
            serve_neighbours(&hosts[i], next, Arc::clone(&hits));
        }
        hosts[0].connect(&hosts[1].info()).await.unwrap();

        let (ctx, mut observed) = context(&hosts[0], 3, 20);
        ctx.routing.update(hosts[1].local_peer()).await;

        let target = hosts[3].local_peer();
        let outcome = Query::new(
            &ctx,
            DistanceId::of_peer(&target),
            Message::new(MessageType::FindNode, target.as_bytes().to_vec()),
            Instant::now() + Duration::from_secs(5),
        )
        .stop_at(target)
        .run(&mut ClosestPeers)
        .await
        .unwrap();

        assert!(outcome.target_found);
        assert_eq!(outcome.closest.first(), Some(&target));
        assert_eq!(outcome.succeeded.len(), 3);
        assert_eq!(hits.lock().unwrap().len(), 3);

        let mut seen = Vec::new();
        while let Ok(peer) = observed.try_recv() {
            seen.push(peer);
        }
        assert_eq!(seen.len(), 3);
    }

    #[tokio::test]
    async fn unreachable_peers_are_not_retried() {
        let net = MemoryNetwork::new();
        let a = net.add_host();
        let b = net.add_host();
        let ghost = net.add_host();
        let hits = Arc::new(StdMutex::new(Vec::new()));
        serve_neighbours(&b, vec![ghost.clone()], Arc::clone(&hits));
        a.connect(&b.info()).await.unwrap();
        net.set_offline(&ghost.local_peer());

        let (ctx, _rx) = context(&a, 3, 20);
        ctx.routing.update(b.local_peer()).await;
        let query = Query::new(
            &ctx,
            DistanceId::of_peer(&ghost.local_peer()),
            Message::new(MessageType::FindNode, vec![]),
            Instant::now() + Duration::from_secs(5),
        );
        let outcome = query.run(&mut ClosestPeers).await.unwrap();
        assert_eq!(outcome.succeeded, vec![b.local_peer()]);
        assert_eq!(outcome.closest, vec![b.local_peer()]);
    }

    struct StopAfter(usize);

    #[async_trait]
    impl QueryHandler for StopAfter {
        async fn on_reply(&mut self, _from: PeerId, _reply: &Message) -> QueryFlow {
            self.0 = self.0.saturating_sub(1);
            if self.0 == 0 {
                QueryFlow::Stop
            } else {
                QueryFlow::Continue
            }
        }
    }

    #[tokio::test]
    async fn handler_can_stop_early() {
        let net = MemoryNetwork::new();
        let hosts: Vec<MemoryHost> = (0..6).map(|_| net.add_host()).collect();
        let hits = Arc::new(StdMutex::new(Vec::new()));
        for i in 1..6 {
            serve_neighbours(&hosts[i], hosts[1..].to_vec(), Arc::clone(&hits));
        }
        let (ctx, _rx) = context(&hosts[0], 1, 20);
        for h in &hosts[1..] {
            hosts[0].connect(&h.info()).await.unwrap();
            ctx.routing.update(h.local_peer()).await;
        }

        let outcome = Query::new(
            &ctx,
            DistanceId::of_peer(&PeerId::random()),
            Message::new(MessageType::GetValue, b"/v/x".to_vec()),
            Instant::now() + Duration::from_secs(5),
        )
        .run(&mut StopAfter(2))
        .await
        .unwrap();
        assert!(outcome.stopped);
        assert_eq!(outcome.succeeded.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_returns_partial_results() {
        let net = MemoryNetwork::new();
        let a = net.add_host();
        let b = net.add_host();
        // b accepts streams but never answers.
        let (tx, mut rx) = mpsc::channel::<InboundStream>(4);
        b.set_stream_handler(PROTO, tx);
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Some(s) = rx.recv().await {
                held.push(s);
            }
        });
        a.connect(&b.info()).await.unwrap();

        let (ctx, _rx) = context(&a, 3, 20);
        ctx.routing.update(b.local_peer()).await;
        let outcome = Query::new(
            &ctx,
            DistanceId::of_peer(&PeerId::random()),
            Message::new(MessageType::FindNode, vec![]),
            Instant::now() + Duration::from_millis(200),
        )
        .run(&mut ClosestPeers)
        .await
        .unwrap();
        assert!(outcome.timed_out);
        assert!(outcome.succeeded.is_empty());
    }
}
