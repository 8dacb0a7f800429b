//! # Provider Store
//!
//! Tracks which peers announced they can serve content for a key.
//!
//! ## Layout
//!
//! | Layer | Contents |
//! |-------|----------|
//! | LRU cache | key → {provider PeerId → announced-at ms}, loaded lazily |
//! | Datastore | `/providers/<hex(blake3(key))>/<hex(peer)>` → uvarint(announced-at ms) |
//!
//! Entries older than the provider TTL are never returned. They are
//! dropped lazily when a key is read and in bulk by a periodic sweep.
//!
//! All operations go through one actor task, so reads and writes on the
//! same key are linearizable.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::datastore::Datastore;
use crate::identity::{now_ms, PeerId};
use crate::messages::{decode_uvarint, encode_uvarint};

const PROVIDERS_PREFIX: &str = "/providers/";

const PROVIDER_COMMAND_CHANNEL_SIZE: usize = 256;

fn key_prefix(key: &[u8]) -> String {
    format!("{}{}/", PROVIDERS_PREFIX, blake3::hash(key).to_hex())
}

fn entry_key(key: &[u8], peer: &PeerId) -> Vec<u8> {
    format!("{}{}", key_prefix(key), peer.to_hex()).into_bytes()
}

/// Peer encoded in the last path segment of a datastore key.
fn peer_from_entry_key(ds_key: &[u8]) -> Option<PeerId> {
    let text = std::str::from_utf8(ds_key).ok()?;
    let (_, peer_hex) = text.rsplit_once('/')?;
    PeerId::from_hex(peer_hex).ok()
}

fn decode_timestamp(value: &[u8]) -> Option<u64> {
    decode_uvarint(value).map(|(ts, _)| ts)
}

type ProviderSet = HashMap<PeerId, u64>;

enum ProviderCommand {
    Add {
        key: Vec<u8>,
        provider: PeerId,
        announced_at: u64,
        reply: oneshot::Sender<()>,
    },
    Get {
        key: Vec<u8>,
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    Gc(oneshot::Sender<usize>),
    Quit,
}

/// Cloneable handle to the provider store actor.
#[derive(Clone)]
pub struct ProviderStore {
    cmd_tx: mpsc::Sender<ProviderCommand>,
}

impl ProviderStore {
    pub fn spawn(
        datastore: Arc<dyn Datastore>,
        ttl: Duration,
        gc_interval: Duration,
        cache_size: usize,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(PROVIDER_COMMAND_CHANNEL_SIZE);
        let capacity = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        let actor = ProviderActor {
            datastore,
            cache: LruCache::new(capacity),
            ttl_ms: ttl.as_millis() as u64,
            cmd_rx,
        };
        tokio::spawn(actor.run(gc_interval));
        Self { cmd_tx }
    }

    /// Record `provider` for `key` as of now; re-adding refreshes the
    /// timestamp.
    pub async fn add_provider(&self, key: &[u8], provider: PeerId) {
        self.add_provider_at(key, provider, now_ms()).await;
    }

    pub(crate) async fn add_provider_at(&self, key: &[u8], provider: PeerId, announced_at: u64) {
        let (tx, rx) = oneshot::channel();
        let cmd = ProviderCommand::Add {
            key: key.to_vec(),
            provider,
            announced_at,
            reply: tx,
        };
        if self.cmd_tx.send(cmd).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Providers for `key` whose announcement is within the TTL.
    pub async fn get_providers(&self, key: &[u8]) -> Vec<PeerId> {
        let (tx, rx) = oneshot::channel();
        let cmd = ProviderCommand::Get {
            key: key.to_vec(),
            reply: tx,
        };
        if self.cmd_tx.send(cmd).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Run a sweep now; returns the number of entries removed.
    pub async fn collect_garbage(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(ProviderCommand::Gc(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(ProviderCommand::Quit).await;
    }
}

struct ProviderActor {
    datastore: Arc<dyn Datastore>,
    cache: LruCache<Vec<u8>, ProviderSet>,
    ttl_ms: u64,
    cmd_rx: mpsc::Receiver<ProviderCommand>,
}

impl ProviderActor {
    async fn run(mut self, gc_interval: Duration) {
        let mut gc_tick = tokio::time::interval(gc_interval);
        gc_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        gc_tick.tick().await;

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(ProviderCommand::Add { key, provider, announced_at, reply }) => {
                            self.add(key, provider, announced_at).await;
                            let _ = reply.send(());
                        }
                        Some(ProviderCommand::Get { key, reply }) => {
                            let providers = self.get(&key).await;
                            let _ = reply.send(providers);
                        }
                        Some(ProviderCommand::Gc(reply)) => {
                            let removed = self.collect_garbage().await;
                            let _ = reply.send(removed);
                        }
                        Some(ProviderCommand::Quit) | None => break,
                    }
                }
                _ = gc_tick.tick() => {
                    let removed = self.collect_garbage().await;
                    if removed > 0 {
                        debug!(removed, "provider GC sweep");
                    }
                }
            }
        }
    }

    fn is_expired(&self, announced_at: u64, now: u64) -> bool {
        now.saturating_sub(announced_at) > self.ttl_ms
    }

    async fn load(&mut self, key: &[u8]) -> &mut ProviderSet {
        if !self.cache.contains(key) {
            let mut set = ProviderSet::new();
            match self.datastore.query_prefix(key_prefix(key).as_bytes()).await {
                Ok(entries) => {
                    for (ds_key, value) in entries {
                        if let (Some(peer), Some(ts)) =
                            (peer_from_entry_key(&ds_key), decode_timestamp(&value))
                        {
                            set.insert(peer, ts);
                        }
                    }
                }
                Err(e) => warn!(error = %e, "failed to load providers from datastore"),
            }
            self.cache.put(key.to_vec(), set);
        }
        self.cache.get_or_insert_mut(key.to_vec(), ProviderSet::new)
    }

    async fn add(&mut self, key: Vec<u8>, provider: PeerId, announced_at: u64) {
        self.load(&key).await.insert(provider, announced_at);
        let mut value = Vec::with_capacity(10);
        encode_uvarint(announced_at, &mut value);
        if let Err(e) = self.datastore.put(&entry_key(&key, &provider), value).await {
            warn!(provider = %provider.short(), error = %e, "failed to persist provider");
        }
    }

    async fn get(&mut self, key: &[u8]) -> Vec<PeerId> {
        let now = now_ms();
        let ttl_ms = self.ttl_ms;
        let set = self.load(key).await;
        let expired: Vec<PeerId> = set
            .iter()
            .filter(|(_, ts)| now.saturating_sub(**ts) > ttl_ms)
            .map(|(p, _)| *p)
            .collect();
        for peer in &expired {
            set.remove(peer);
        }
        let mut live: Vec<(u64, PeerId)> = set.iter().map(|(p, ts)| (*ts, *p)).collect();
        // Most recent announcements first.
        live.sort_by(|a, b| b.cmp(a));

        for peer in expired {
            if let Err(e) = self.datastore.delete(&entry_key(key, &peer)).await {
                warn!(provider = %peer.short(), error = %e, "failed to delete expired provider");
            }
        }
        live.into_iter().map(|(_, p)| p).collect()
    }

    async fn collect_garbage(&mut self) -> usize {
        let now = now_ms();
        let entries = match self.datastore.query_prefix(PROVIDERS_PREFIX.as_bytes()).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "provider GC could not enumerate datastore");
                return 0;
            }
        };
        let mut removed = 0;
        for (ds_key, value) in entries {
            let expired = decode_timestamp(&value).is_none_or(|ts| self.is_expired(ts, now));
            if !expired {
                continue;
            }
            match self.datastore.delete(&ds_key).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(error = %e, "provider GC failed to delete entry"),
            }
        }

        let ttl_ms = self.ttl_ms;
        let mut empty = Vec::new();
        for (key, set) in self.cache.iter_mut() {
            set.retain(|_, ts| now.saturating_sub(*ts) <= ttl_ms);
            if set.is_empty() {
                empty.push(key.clone());
            }
        }
        for key in empty {
            self.cache.pop(&key);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::MemoryDatastore;

    const TTL: Duration = Duration::from_secs(24 * 60 * 60);

    fn store(datastore: Arc<MemoryDatastore>, cache_size: usize) -> ProviderStore {
        ProviderStore::spawn(datastore, TTL, Duration::from_secs(3600), cache_size)
    }

    #[tokio::test]
    async fn add_is_idempotent_and_refreshes() {
        let ds = Arc::new(MemoryDatastore::new());
        let providers = store(Arc::clone(&ds), 16);
        let peer = PeerId::random();

        let stale = now_ms() - TTL.as_millis() as u64 + 1_000;
        providers.add_provider_at(b"hello", peer, stale).await;
        providers.add_provider(b"hello", peer).await;
        assert_eq!(providers.get_providers(b"hello").await, vec![peer]);
        assert_eq!(ds.len().await, 1);

        let stored = ds.get(&entry_key(b"hello", &peer)).await.unwrap().unwrap();
        assert!(decode_timestamp(&stored).unwrap() > stale);
    }

    #[tokio::test]
    async fn expired_entries_are_never_returned() {
        let ds = Arc::new(MemoryDatastore::new());
        let providers = store(Arc::clone(&ds), 16);
        let fresh = PeerId::random();
        let old = PeerId::random();

        providers.add_provider(b"k", fresh).await;
        providers
            .add_provider_at(b"k", old, now_ms() - TTL.as_millis() as u64 - 1)
            .await;

        assert_eq!(providers.get_providers(b"k").await, vec![fresh]);
        // Lazy removal on read also cleans the datastore.
        assert!(!ds.has(&entry_key(b"k", &old)).await.unwrap());
    }

    #[tokio::test]
    async fn survives_cache_eviction() {
        let ds = Arc::new(MemoryDatastore::new());
        let providers = store(Arc::clone(&ds), 1);
        let a = PeerId::random();
        let b = PeerId::random();
        providers.add_provider(b"first", a).await;
        providers.add_provider(b"second", b).await;

        assert_eq!(providers.get_providers(b"first").await, vec![a]);
        assert_eq!(providers.get_providers(b"second").await, vec![b]);
        assert!(providers.get_providers(b"third").await.is_empty());
    }

    #[tokio::test]
    async fn gc_sweeps_both_layers() {
        let ds = Arc::new(MemoryDatastore::new());
        let providers = store(Arc::clone(&ds), 16);
        let live = PeerId::random();
        let dead = PeerId::random();
        providers.add_provider(b"x", live).await;
        providers
            .add_provider_at(b"y", dead, now_ms() - TTL.as_millis() as u64 - 10)
            .await;

        assert_eq!(providers.collect_garbage().await, 1);
        assert_eq!(ds.len().await, 1);
        assert!(providers.get_providers(b"y").await.is_empty());
        assert_eq!(providers.get_providers(b"x").await, vec![live]);
    }

    #[test]
    fn datastore_key_layout() {
        let peer = PeerId::random();
        let key = entry_key(b"hello", &peer);
        let text = String::from_utf8(key.clone()).unwrap();
        assert!(text.starts_with("/providers/"));
        assert!(text.ends_with(&peer.to_hex()));
        assert_eq!(peer_from_entry_key(&key), Some(peer));
    }
}
