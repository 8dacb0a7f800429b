//! # Kademlia-style Distributed Hash Table
//!
//! [`Dht`] is the public routing interface. It owns a routing table, a
//! provider store, a pool of per-peer message senders and the background
//! tasks that keep them fresh, all on top of a caller-supplied [`Host`]
//! and [`Datastore`].
//!
//! ## Key Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `put_value(key, value)` | Sign, store locally, PUT_VALUE to the k closest peers |
//! | `get_value(key)` | Value query, selector-chosen best record, read-repair |
//! | `get_values(key, n)` | Up to n distinct validated records |
//! | `provide(key, announce)` | Record self as provider, optionally ADD_PROVIDER to the k closest |
//! | `find_providers(key, max)` | Provider query, streamed or collected |
//! | `find_peer(peer)` | Lookup that stops once the peer itself answers |
//! | `ping(peer)` | Single PING round-trip |
//! | `bootstrap()` | Run a refresh cycle now |
//!
//! ## Task Layout
//!
//! - inbound accept loop (`handlers`)
//! - connectivity notifications (`notify`)
//! - observed-peer loop feeding the routing table from query replies
//! - periodic bootstrap (`bootstrap`)
//!
//! Background tasks hold a `Weak` reference and exit once every [`Dht`]
//! handle is dropped or [`Dht::close`] is called.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};

use async_trait::async_trait;

use crate::config::DhtConfig;
use crate::datastore::Datastore;
use crate::error::DhtError;
use crate::host::{Host, TEMP_ADDR_TTL};
use crate::identity::{PeerId, PeerInfo};
use crate::keyspace::{distance_id, DistanceId};
use crate::messages::{Message, MessageType, WirePeer};
use crate::pk::KeyBook;
use crate::providers::ProviderStore;
use crate::query::{ClosestPeers, Query, QueryContext, QueryFlow, QueryHandler, QueryOutcome};
use crate::records::{Record, RecordVerifier};
use crate::routing::{RoutingHandle, RoutingTable};
use crate::sender::{SenderPool, SenderSettings};
use crate::{bootstrap, handlers, notify};

/// Capacity of the channel carrying peers seen in query replies.
const OBSERVED_CHANNEL_SIZE: usize = 1024;

/// Capacity of the inbound stream queue handed to the host.
const INBOUND_CHANNEL_SIZE: usize = 128;

/// Capacity of the streaming provider result channel.
const PROVIDER_RESULT_CHANNEL_SIZE: usize = 64;

pub(crate) struct DhtInner<H: Host> {
    pub(crate) local: PeerId,
    pub(crate) config: DhtConfig,
    pub(crate) host: Arc<H>,
    pub(crate) datastore: Arc<dyn Datastore>,
    pub(crate) routing: RoutingHandle,
    pub(crate) senders: Arc<SenderPool<H>>,
    pub(crate) providers: ProviderStore,
    pub(crate) verifier: RecordVerifier,
    pub(crate) keys: KeyBook,
    pub(crate) queries: QueryContext<H>,
    pub(crate) bootstrap_lock: tokio::sync::Mutex<()>,
    challenges: Mutex<HashSet<PeerId>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Handle to a running DHT. Cheap to clone.
pub struct Dht<H: Host> {
    inner: Arc<DhtInner<H>>,
}

impl<H: Host> Clone for Dht<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Records gathered by a value lookup, plus what is needed for read-repair.
pub(crate) struct ValueLookup {
    /// Valid records with the peer that sent them (`None` for the local store).
    pub(crate) records: Vec<(Option<PeerId>, Record)>,
    /// Peers that answered without a usable record.
    pub(crate) missing: Vec<PeerId>,
    pub(crate) invalid: usize,
    pub(crate) closest: Vec<PeerId>,
    pub(crate) timed_out: bool,
}

struct ValueCollector<'a, H: Host> {
    inner: &'a DhtInner<H>,
    key: &'a [u8],
    fetch_keys: bool,
    quorum: usize,
    lookup: ValueLookup,
}

#[async_trait]
impl<'a, H: Host> QueryHandler for ValueCollector<'a, H> {
    async fn on_reply(&mut self, from: PeerId, reply: &Message) -> QueryFlow {
        let Some(record) = reply.record.as_ref() else {
            self.lookup.missing.push(from);
            return QueryFlow::Continue;
        };
        if record.key != self.key {
            debug!(peer = %from.short(), "peer returned a record for another key");
            self.lookup.invalid += 1;
            self.lookup.missing.push(from);
            return QueryFlow::Continue;
        }
        match self.inner.verify_record(record, self.fetch_keys).await {
            Ok(()) => self.lookup.records.push((Some(from), record.clone())),
            Err(e) => {
                debug!(peer = %from.short(), error = %e, "discarding invalid record");
                self.lookup.invalid += 1;
                self.lookup.missing.push(from);
            }
        }
        if self.lookup.records.len() >= self.quorum {
            QueryFlow::Stop
        } else {
            QueryFlow::Continue
        }
    }
}

struct ProviderCollector<'a, H: Host> {
    inner: &'a DhtInner<H>,
    max: usize,
    seen: HashSet<PeerId>,
    results: mpsc::Sender<Result<PeerInfo, DhtError>>,
}

impl<H: Host> ProviderCollector<'_, H> {
    fn is_full(&self) -> bool {
        self.max != 0 && self.seen.len() >= self.max
    }

    /// Emit a provider; returns false once the consumer has gone away.
    async fn emit(&mut self, info: PeerInfo) -> bool {
        if self.is_full() || !self.seen.insert(info.id) {
            return true;
        }
        self.results.send(Ok(info)).await.is_ok()
    }
}

#[async_trait]
impl<'a, H: Host> QueryHandler for ProviderCollector<'a, H> {
    async fn on_reply(&mut self, _from: PeerId, reply: &Message) -> QueryFlow {
        for provider in reply.provider_peer_infos() {
            if provider.id != self.inner.local {
                self.inner
                    .host
                    .add_addresses(&provider.id, &provider.addrs, TEMP_ADDR_TTL);
            }
            let info = self.inner.host.peer_info(&provider.id);
            if !self.emit(info).await {
                return QueryFlow::Stop;
            }
        }
        if self.is_full() {
            QueryFlow::Stop
        } else {
            QueryFlow::Continue
        }
    }
}

impl<H: Host> DhtInner<H> {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), DhtError> {
        if self.is_closed() {
            return Err(DhtError::Cancelled);
        }
        Ok(())
    }

    fn query_deadline(&self) -> Instant {
        Instant::now() + self.config.query_timeout
    }

    pub(crate) fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    // ------------------------------------------------------------------------
    // Routing table feed
    // ------------------------------------------------------------------------

    /// Feed a peer we heard from into the routing table. A full bucket
    /// yields an eviction candidate, which is pinged off-task.
    pub(crate) async fn observe(self: &Arc<Self>, peer: PeerId) {
        if peer == self.local || self.is_closed() {
            return;
        }
        let Some(incumbent) = self.routing.update(peer).await else {
            return;
        };
        {
            let mut pending = self.challenges.lock().unwrap_or_else(|e| e.into_inner());
            if !pending.insert(incumbent) {
                return;
            }
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.challenge(incumbent, peer).await;
            inner
                .challenges
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&incumbent);
        });
    }

    async fn challenge(&self, incumbent: PeerId, challenger: PeerId) {
        let alive = matches!(
            timeout(
                self.config.rpc_timeout,
                self.senders.send_request(&incumbent, &Message::ping()),
            )
            .await,
            Ok(Ok(_))
        );
        if alive {
            trace!(peer = %incumbent.short(), "eviction candidate answered ping");
            self.routing.refresh(incumbent).await;
        } else {
            debug!(
                stale = %incumbent.short(),
                challenger = %challenger.short(),
                "replacing unresponsive peer"
            );
            self.senders.remove(&incumbent);
            self.routing.replace(incumbent, challenger).await;
        }
    }

    // ------------------------------------------------------------------------
    // Local records
    // ------------------------------------------------------------------------

    pub(crate) async fn get_local_record(&self, key: &[u8]) -> Result<Option<Record>, DhtError> {
        let Some(bytes) = self.datastore.get(key).await? else {
            return Ok(None);
        };
        let record = match Record::from_bytes(&bytes) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "dropping corrupt local record");
                self.datastore.delete(key).await?;
                return Ok(None);
            }
        };
        if record.key != key {
            return Ok(None);
        }
        if record.is_expired(self.config.max_record_age.as_millis() as u64) {
            trace!("local record expired");
            self.datastore.delete(key).await?;
            return Ok(None);
        }
        Ok(Some(record))
    }

    pub(crate) async fn put_local_record(&self, mut record: Record) -> Result<Record, DhtError> {
        record.stamp_received();
        self.datastore.put(&record.key, record.to_bytes()?).await?;
        Ok(record)
    }

    /// Local record that still validates against locally known keys.
    pub(crate) async fn get_checked_local_record(&self, key: &[u8]) -> Option<Record> {
        let record = match self.get_local_record(key).await {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "failed to read local record");
                return None;
            }
        };
        match self.verify_record(&record, false).await {
            Ok(()) => Some(record),
            Err(e) => {
                debug!(error = %e, "local record no longer validates");
                None
            }
        }
    }

    // ------------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------------

    /// The k closest responsive peers to `key`.
    pub(crate) async fn get_closest_peers(&self, key: &[u8]) -> Result<Vec<PeerId>, DhtError> {
        let request = Message::new(MessageType::FindNode, key.to_vec());
        let outcome = Query::new(&self.queries, distance_id(key), request, self.query_deadline())
            .run(&mut ClosestPeers)
            .await?;
        if outcome.closest.is_empty() {
            return Err(if outcome.timed_out {
                DhtError::Timeout
            } else {
                DhtError::NotFound
            });
        }
        Ok(outcome.closest)
    }

    /// Gather up to `quorum` valid records for `key`, the local one included.
    pub(crate) async fn lookup_values(
        &self,
        key: &[u8],
        quorum: usize,
        fetch_keys: bool,
    ) -> Result<ValueLookup, DhtError> {
        let mut lookup = ValueLookup {
            records: Vec::new(),
            missing: Vec::new(),
            invalid: 0,
            closest: Vec::new(),
            timed_out: false,
        };
        if let Some(record) = self.get_checked_local_record(key).await {
            lookup.records.push((None, record));
            if lookup.records.len() >= quorum {
                return Ok(lookup);
            }
        }

        let mut collector = ValueCollector {
            inner: self,
            key,
            fetch_keys,
            quorum,
            lookup,
        };
        let request = Message::new(MessageType::GetValue, key.to_vec());
        let result = Query::new(&self.queries, distance_id(key), request, self.query_deadline())
            .run(&mut collector)
            .await;
        let mut lookup = collector.lookup;
        match result {
            Ok(QueryOutcome {
                closest, timed_out, ..
            }) => {
                lookup.closest = closest;
                lookup.timed_out = timed_out;
            }
            Err(e) if lookup.records.is_empty() => return Err(e),
            Err(e) => debug!(error = %e, "value query failed, using local record"),
        }
        Ok(lookup)
    }

    pub(crate) async fn put_value_to_peer(&self, peer: &PeerId, record: &Record) -> Result<(), DhtError> {
        let request = Message::new(MessageType::PutValue, record.key.clone()).with_record(record.clone());
        let reply = self.senders.send_request(peer, &request).await?;
        if let Some(err) = reply.error {
            return Err(err.into_dht_error());
        }
        match reply.record {
            Some(stored) if stored.value == record.value => Ok(()),
            _ => Err(DhtError::Validation("value not put correctly".into())),
        }
    }

    /// Store locally, then PUT_VALUE to the closest peers one at a time.
    pub(crate) async fn put_record(&self, record: Record) -> Result<(), DhtError> {
        if let Some(existing) = self.get_checked_local_record(&record.key).await {
            let values = vec![record.value.clone(), existing.value.clone()];
            if self.verifier.select(&record.key, &values)? != 0 {
                return Err(DhtError::Validation(
                    "can't replace a newer value with an older value".into(),
                ));
            }
        }
        self.put_local_record(record.clone()).await?;

        let peers = self.get_closest_peers(&record.key).await?;
        let mut stored = 0usize;
        let mut last_error = None;
        for peer in &peers {
            match timeout(self.config.rpc_timeout, self.put_value_to_peer(peer, &record)).await {
                Ok(Ok(())) => stored += 1,
                Ok(Err(e)) => {
                    debug!(peer = %peer.short(), error = %e, "PUT_VALUE failed");
                    last_error = Some(e);
                }
                Err(_) => {
                    debug!(peer = %peer.short(), "PUT_VALUE timed out");
                    last_error = Some(DhtError::Timeout);
                }
            }
        }
        if stored == 0 {
            return Err(last_error.unwrap_or(DhtError::NotFound));
        }
        debug!(stored, candidates = peers.len(), "record replicated");
        Ok(())
    }
}

/// Peers to write the winning record back to: closest first, then any
/// other responder, capped at `limit`.
fn read_repair_targets(lookup: &ValueLookup, best: &[u8], limit: usize) -> Vec<PeerId> {
    let mut stale: HashSet<PeerId> = lookup.missing.iter().copied().collect();
    for (source, record) in &lookup.records {
        if let Some(peer) = source
            && record.value != best
        {
            stale.insert(*peer);
        }
    }
    let mut ordered: Vec<PeerId> = lookup
        .closest
        .iter()
        .filter(|p| stale.remove(*p))
        .copied()
        .collect();
    ordered.extend(stale);
    ordered.truncate(limit);
    ordered
}

impl<H: Host> Dht<H> {
    /// Start a DHT on `host`: register the stream handler, start the
    /// background tasks, connect the seed peers and run one bootstrap
    /// cycle before returning.
    pub async fn new(host: H, datastore: Arc<dyn Datastore>, config: DhtConfig) -> Result<Self, DhtError> {
        config.validate()?;
        let host = Arc::new(host);
        let local = host.local_peer();
        let routing = RoutingHandle::spawn(RoutingTable::new(local, config.bucket_size));
        let senders = Arc::new(SenderPool::new(
            Arc::clone(&host),
            SenderSettings::from_config(&config),
        ));
        let providers = ProviderStore::spawn(
            Arc::clone(&datastore),
            config.provider_ttl,
            config.provider_gc_interval,
            config.provider_cache_size,
        );
        let (observed_tx, observed_rx) = mpsc::channel(OBSERVED_CHANNEL_SIZE);
        let queries = QueryContext {
            local,
            host: Arc::clone(&host),
            senders: Arc::clone(&senders),
            routing: routing.clone(),
            observed: observed_tx,
            alpha: config.alpha,
            k: config.bucket_size,
        };
        let verifier = RecordVerifier::new(config.validators.clone(), config.selectors.clone());
        let events = host.subscribe();

        let inner = Arc::new(DhtInner {
            local,
            config,
            host,
            datastore,
            routing,
            senders,
            providers,
            verifier,
            keys: KeyBook::new(),
            queries,
            bootstrap_lock: tokio::sync::Mutex::new(()),
            challenges: Mutex::new(HashSet::new()),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        inner.put_local_record(inner.own_public_key_record()).await?;

        let (stream_tx, stream_rx) = mpsc::channel(INBOUND_CHANNEL_SIZE);
        inner.host.set_stream_handler(&inner.config.protocol_id, stream_tx);

        let weak = Arc::downgrade(&inner);
        inner.track(tokio::spawn(handlers::accept_loop(weak.clone(), stream_rx)));
        inner.track(tokio::spawn(notify::run(weak.clone(), events)));
        inner.track(tokio::spawn(notify::observe_loop(weak.clone(), observed_rx)));

        if !inner.config.seed_peers.is_empty() {
            let connected = bootstrap::connect_seeds(&inner).await;
            if connected == 0 {
                warn!("could not reach any seed peer");
            } else if let Err(e) = bootstrap::run_cycle(&inner).await {
                debug!(error = %e, "initial bootstrap cycle failed");
            }
        }
        inner.track(tokio::spawn(bootstrap::run_periodic(
            weak.clone(),
            inner.config.bootstrap_interval,
        )));
        inner.track(tokio::spawn(bootstrap::run_address_gc(
            weak,
            inner.config.address_gc_interval,
        )));

        info!(peer = %local, protocol = %inner.config.protocol_id, "DHT started");
        Ok(Self { inner })
    }

    pub fn local_peer(&self) -> PeerId {
        self.inner.local
    }

    pub fn host(&self) -> &Arc<H> {
        &self.inner.host
    }

    pub fn config(&self) -> &DhtConfig {
        &self.inner.config
    }

    /// Stop background tasks and unregister the stream handler.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.host.remove_stream_handler(&self.inner.config.protocol_id);
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }
        self.inner.providers.quit().await;
        self.inner.routing.quit().await;
        info!(peer = %self.inner.local, "DHT closed");
    }

    /// Sign `value` under `key` with the local identity and replicate it.
    pub async fn put_value(&self, key: &[u8], value: Vec<u8>) -> Result<(), DhtError> {
        self.inner.ensure_open()?;
        let record = Record::new_signed(self.inner.host.keypair(), key.to_vec(), value);
        self.inner.verify_record(&record, false).await?;
        self.inner.put_record(record).await
    }

    /// Best value for `key` according to its namespace selector.
    pub async fn get_value(&self, key: &[u8]) -> Result<Vec<u8>, DhtError> {
        self.inner.ensure_open()?;
        let lookup = self
            .inner
            .lookup_values(key, self.inner.config.value_quorum, true)
            .await?;
        if lookup.records.is_empty() {
            return Err(if lookup.invalid > 0 {
                DhtError::Validation("every returned record failed validation".into())
            } else if lookup.timed_out {
                DhtError::Timeout
            } else {
                DhtError::NotFound
            });
        }

        let values: Vec<Vec<u8>> = lookup.records.iter().map(|(_, r)| r.value.clone()).collect();
        let best_idx = self.inner.verifier.select(key, &values)?;
        let best = lookup.records[best_idx].1.clone();

        let targets = read_repair_targets(&lookup, &best.value, self.inner.config.repair_limit());
        if !targets.is_empty() {
            let inner = Arc::clone(&self.inner);
            let record = best.clone();
            tokio::spawn(async move {
                for peer in targets {
                    match timeout(inner.config.rpc_timeout, inner.put_value_to_peer(&peer, &record)).await {
                        Ok(Ok(())) => trace!(peer = %peer.short(), "read-repair stored record"),
                        Ok(Err(e)) => trace!(peer = %peer.short(), error = %e, "read-repair rejected"),
                        Err(_) => trace!(peer = %peer.short(), "read-repair timed out"),
                    }
                }
            });
        }
        Ok(best.value)
    }

    /// Up to `n` distinct validated records for `key`, for callers doing
    /// their own selection.
    pub async fn get_values(&self, key: &[u8], n: usize) -> Result<Vec<Record>, DhtError> {
        self.inner.ensure_open()?;
        if n == 0 {
            return Ok(Vec::new());
        }
        let lookup = self
            .inner
            .lookup_values(key, n.max(self.inner.config.value_quorum), true)
            .await?;
        let mut seen: HashSet<Vec<u8>> = HashSet::new();
        let mut records = Vec::new();
        for (_, record) in lookup.records {
            if records.len() >= n {
                break;
            }
            if seen.insert(record.value.clone()) {
                records.push(record);
            }
        }
        if records.is_empty() {
            return Err(if lookup.invalid > 0 {
                DhtError::Validation("every returned record failed validation".into())
            } else if lookup.timed_out {
                DhtError::Timeout
            } else {
                DhtError::NotFound
            });
        }
        Ok(records)
    }

    /// Add the local node as a provider for `key`; with `announce`, also
    /// tell the k closest peers.
    pub async fn provide(&self, key: &[u8], announce: bool) -> Result<(), DhtError> {
        self.inner.ensure_open()?;
        let self_info = self.inner.host.peer_info(&self.inner.local);
        if announce && self_info.addrs.is_empty() {
            return Err(DhtError::Invariant("no known addresses for self".into()));
        }
        self.inner.providers.add_provider(key, self.inner.local).await;
        if !announce {
            return Ok(());
        }

        let peers = self.inner.get_closest_peers(key).await?;
        let announcement = Arc::new(
            Message::new(MessageType::AddProvider, key.to_vec()).with_provider_peers(vec![WirePeer::new(
                self_info,
                crate::messages::Connectedness::Connected,
            )]),
        );

        let mut sends = JoinSet::new();
        for peer in peers {
            let senders = Arc::clone(&self.inner.senders);
            let msg = Arc::clone(&announcement);
            let rpc_timeout = self.inner.config.rpc_timeout;
            sends.spawn(async move {
                let result = match timeout(rpc_timeout, senders.send_message(&peer, &msg)).await {
                    Ok(r) => r,
                    Err(_) => Err(DhtError::Timeout),
                };
                (peer, result)
            });
        }

        let mut announced = 0usize;
        let mut last_error = None;
        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok((_, Ok(()))) => announced += 1,
                Ok((peer, Err(e))) => {
                    debug!(peer = %peer.short(), error = %e, "ADD_PROVIDER failed");
                    last_error = Some(e);
                }
                Err(e) => debug!(error = %e, "ADD_PROVIDER task failed"),
            }
        }
        if announced == 0 {
            return Err(last_error.unwrap_or(DhtError::NotFound));
        }
        debug!(announced, "provider record announced");
        Ok(())
    }

    /// Stream providers for `key` as they are discovered. `max == 0` means
    /// no limit. The stream ends with an `Err` when the lookup timed out or
    /// found nothing.
    pub fn find_providers_async(&self, key: &[u8], max: usize) -> mpsc::Receiver<Result<PeerInfo, DhtError>> {
        let (tx, rx) = mpsc::channel(PROVIDER_RESULT_CHANNEL_SIZE);
        let inner = Arc::clone(&self.inner);
        let key = key.to_vec();
        tokio::spawn(async move {
            if let Err(e) = inner.ensure_open() {
                let _ = tx.send(Err(e)).await;
                return;
            }
            let mut collector = ProviderCollector {
                inner: &inner,
                max,
                seen: HashSet::new(),
                results: tx.clone(),
            };
            for provider in inner.providers.get_providers(&key).await {
                let info = inner.host.peer_info(&provider);
                if !collector.emit(info).await {
                    return;
                }
            }
            if collector.is_full() {
                return;
            }

            let request = Message::new(MessageType::GetProviders, key.clone());
            let result = Query::new(&inner.queries, distance_id(&key), request, inner.query_deadline())
                .run(&mut collector)
                .await;
            let found = collector.seen.len();
            let terminal = match result {
                Ok(outcome) if outcome.timed_out => Some(DhtError::Timeout),
                Ok(_) if found == 0 => Some(DhtError::NotFound),
                Ok(_) => None,
                Err(_) if found > 0 => None,
                Err(e) => Some(e),
            };
            if let Some(err) = terminal {
                let _ = tx.send(Err(err)).await;
            }
        });
        rx
    }

    /// Collect up to `max` providers for `key`.
    pub async fn find_providers(&self, key: &[u8], max: usize) -> Result<Vec<PeerInfo>, DhtError> {
        let mut stream = self.find_providers_async(key, max);
        let mut providers = Vec::new();
        while let Some(item) = stream.recv().await {
            match item {
                Ok(info) => providers.push(info),
                Err(e) if providers.is_empty() => return Err(e),
                Err(e) => {
                    debug!(error = %e, found = providers.len(), "provider lookup ended early");
                    break;
                }
            }
        }
        Ok(providers)
    }

    /// Addresses of `peer`, found by a lookup that stops once it answers.
    pub async fn find_peer(&self, peer: &PeerId) -> Result<PeerInfo, DhtError> {
        self.inner.ensure_open()?;
        if *peer == self.inner.local {
            return Ok(self.inner.host.peer_info(peer));
        }
        if self.inner.host.connectedness(peer) == crate::messages::Connectedness::Connected {
            let info = self.inner.host.peer_info(peer);
            if !info.addrs.is_empty() {
                return Ok(info);
            }
        }
        let request = Message::new(MessageType::FindNode, peer.as_bytes().to_vec());
        let outcome = Query::new(
            &self.inner.queries,
            DistanceId::of_peer(peer),
            request,
            self.inner.query_deadline(),
        )
        .stop_at(*peer)
        .run(&mut ClosestPeers)
        .await?;
        if outcome.target_found {
            return Ok(self.inner.host.peer_info(peer));
        }
        Err(if outcome.timed_out {
            DhtError::Timeout
        } else {
            DhtError::NotFound
        })
    }

    /// One PING round-trip; the RTT also lands in the host's address book.
    pub async fn ping(&self, peer: &PeerId) -> Result<Duration, DhtError> {
        self.inner.ensure_open()?;
        let start = Instant::now();
        timeout(
            self.inner.config.rpc_timeout,
            self.inner.senders.send_request(peer, &Message::ping()),
        )
        .await??;
        let rtt = start.elapsed();
        self.inner.host.record_latency(peer, rtt);
        Ok(rtt)
    }

    /// Run a bootstrap cycle now. Skipped if one is already running.
    pub async fn bootstrap(&self) -> Result<(), DhtError> {
        self.inner.ensure_open()?;
        bootstrap::run_cycle(&self.inner).await
    }

    /// Replicate the local `/pk/` record to the closest peers.
    pub async fn publish_public_key(&self) -> Result<(), DhtError> {
        self.inner.ensure_open()?;
        let record = self.inner.own_public_key_record();
        self.inner.put_record(record).await
    }

    pub async fn get_public_key(&self, peer: &PeerId) -> Result<[u8; 32], DhtError> {
        self.inner.ensure_open()?;
        self.inner.resolve_public_key(peer, true).await
    }

    pub async fn routing_table_size(&self) -> usize {
        self.inner.routing.size().await
    }

    pub async fn routing_peers(&self) -> Vec<PeerId> {
        self.inner.routing.list_peers().await
    }

    pub async fn routing_stats(&self) -> crate::routing::RoutingStats {
        self.inner.routing.stats().await
    }

    /// Closest peers to `key` reachable right now, via a full lookup.
    pub async fn get_closest_peers(&self, key: &[u8]) -> Result<Vec<PeerId>, DhtError> {
        self.inner.ensure_open()?;
        self.inner.get_closest_peers(key).await
    }
}
