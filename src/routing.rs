//! # Routing Table (k-bucket tree)
//!
//! Peers are filed by the common prefix length (CPL) of their DistanceId
//! with the local node's DistanceId. The table starts with a single bucket
//! and grows by splitting its last bucket:
//!
//! ```text
//!   depth 1:  [ bucket 0: every CPL ]
//!   depth 2:  [ bucket 0: CPL 0 ] [ bucket 1: CPL >= 1 ]
//!   depth 3:  [ bucket 0: CPL 0 ] [ bucket 1: CPL 1 ] [ bucket 2: CPL >= 2 ]
//! ```
//!
//! Within a bucket, peers are ordered by last useful contact, most recent
//! at the front. When a bucket is full and cannot split, `update` hands
//! back the least-recently seen peer; confirming it is stale (and calling
//! [`RoutingTable::replace`]) is the caller's job.
//!
//! [`RoutingHandle`] owns a table inside an actor so that connection
//! notifications, inbound handlers and queries can share it.

use std::collections::VecDeque;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::identity::PeerId;
use crate::keyspace::{common_prefix_len, DistanceId, KEYSPACE_BITS};

/// Default maximum number of buckets; the deepest bucket never splits further.
pub const MAX_DEPTH: usize = KEYSPACE_BITS;

/// Command channel capacity for the routing actor.
const ROUTING_COMMAND_CHANNEL_SIZE: usize = 256;

#[derive(Debug, Clone)]
struct BucketEntry {
    peer: PeerId,
    did: DistanceId,
    last_useful: Instant,
}

#[derive(Debug, Clone, Default)]
struct Bucket {
    entries: VecDeque<BucketEntry>,
}

impl Bucket {
    fn position(&self, peer: &PeerId) -> Option<usize> {
        self.entries.iter().position(|e| &e.peer == peer)
    }

    fn move_to_front(&mut self, pos: usize) {
        if let Some(mut entry) = self.entries.remove(pos) {
            entry.last_useful = Instant::now();
            self.entries.push_front(entry);
        }
    }

    fn least_recent(&self) -> Option<PeerId> {
        self.entries.back().map(|e| e.peer)
    }
}

#[derive(Debug)]
pub struct RoutingTable {
    local: PeerId,
    local_did: DistanceId,
    bucket_size: usize,
    max_depth: usize,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(local: PeerId, bucket_size: usize) -> Self {
        Self {
            local,
            local_did: DistanceId::of_peer(&local),
            bucket_size: bucket_size.max(1),
            max_depth: MAX_DEPTH,
            buckets: vec![Bucket::default()],
        }
    }

    /// Cap the number of buckets. Values below 1 are treated as 1.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth.clamp(1, MAX_DEPTH);
        self
    }

    pub fn local_peer(&self) -> PeerId {
        self.local
    }

    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    /// Number of buckets.
    pub fn depth(&self) -> usize {
        self.buckets.len()
    }

    pub fn bucket_len(&self, idx: usize) -> Option<usize> {
        self.buckets.get(idx).map(|b| b.entries.len())
    }

    fn bucket_index(&self, did: &DistanceId) -> usize {
        common_prefix_len(did, &self.local_did).min(self.buckets.len() - 1)
    }

    /// Insert or refresh `peer`.
    ///
    /// Returns the eviction candidate when the peer's bucket is full and
    /// cannot split; the table is left unchanged in that case.
    pub fn update(&mut self, peer: PeerId) -> Option<PeerId> {
        if peer == self.local {
            return None;
        }
        let did = DistanceId::of_peer(&peer);
        let idx = self.bucket_index(&did);

        if let Some(pos) = self.buckets[idx].position(&peer) {
            self.buckets[idx].move_to_front(pos);
            return None;
        }

        if self.try_insert(idx, peer, did) {
            return None;
        }

        if idx == self.buckets.len() - 1 && self.buckets.len() < self.max_depth {
            self.split_last();
            let idx = self.bucket_index(&did);
            if self.try_insert(idx, peer, did) {
                return None;
            }
            return self.buckets[idx].least_recent();
        }

        self.buckets[idx].least_recent()
    }

    fn try_insert(&mut self, idx: usize, peer: PeerId, did: DistanceId) -> bool {
        let bucket = &mut self.buckets[idx];
        if bucket.entries.len() >= self.bucket_size {
            return false;
        }
        bucket.entries.push_front(BucketEntry {
            peer,
            did,
            last_useful: Instant::now(),
        });
        true
    }

    fn split_last(&mut self) {
        let idx = self.buckets.len() - 1;
        let old = std::mem::take(&mut self.buckets[idx].entries);
        let mut keep = VecDeque::with_capacity(old.len());
        let mut moved = VecDeque::new();
        for entry in old {
            if common_prefix_len(&entry.did, &self.local_did) > idx {
                moved.push_back(entry);
            } else {
                keep.push_back(entry);
            }
        }
        self.buckets[idx].entries = keep;
        self.buckets.push(Bucket { entries: moved });
        debug!(depth = self.buckets.len(), "routing table split last bucket");
    }

    /// Remove `peer`; returns whether it was present.
    pub fn remove(&mut self, peer: &PeerId) -> bool {
        let idx = self.bucket_index(&DistanceId::of_peer(peer));
        match self.buckets[idx].position(peer) {
            Some(pos) => {
                self.buckets[idx].entries.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Mark `peer` as recently useful. Returns false if it is not present.
    pub fn refresh(&mut self, peer: &PeerId) -> bool {
        let idx = self.bucket_index(&DistanceId::of_peer(peer));
        match self.buckets[idx].position(peer) {
            Some(pos) => {
                self.buckets[idx].move_to_front(pos);
                true
            }
            None => false,
        }
    }

    /// Drop a confirmed-stale peer and insert its challenger in its place.
    pub fn replace(&mut self, stale: &PeerId, challenger: PeerId) -> bool {
        self.remove(stale);
        self.update(challenger).is_none() && self.find(&challenger)
    }

    pub fn find(&self, peer: &PeerId) -> bool {
        let idx = self.bucket_index(&DistanceId::of_peer(peer));
        self.buckets[idx].position(peer).is_some()
    }

    /// Up to `n` peers ordered by ascending XOR distance to `target`.
    pub fn nearest_peers(&self, target: &DistanceId, n: usize) -> Vec<PeerId> {
        if n == 0 {
            return Vec::new();
        }
        let start = self.bucket_index(target);
        let mut candidates: Vec<(DistanceId, PeerId)> = Vec::new();
        let collect = |out: &mut Vec<(DistanceId, PeerId)>, bucket: &Bucket| {
            out.extend(bucket.entries.iter().map(|e| (e.did.xor(target), e.peer)));
        };

        collect(&mut candidates, &self.buckets[start]);
        let mut below = start;
        let mut above = start + 1;
        while candidates.len() < n && (below > 0 || above < self.buckets.len()) {
            if below > 0 {
                below -= 1;
                collect(&mut candidates, &self.buckets[below]);
            }
            if above < self.buckets.len() {
                collect(&mut candidates, &self.buckets[above]);
                above += 1;
            }
        }

        candidates.sort();
        candidates.truncate(n);
        candidates.into_iter().map(|(_, p)| p).collect()
    }

    pub fn list_peers(&self) -> impl Iterator<Item = &PeerId> + '_ {
        self.buckets.iter().flat_map(|b| b.entries.iter().map(|e| &e.peer))
    }

    pub fn size(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }
}

// ============================================================================
// Routing actor
// ============================================================================

enum RoutingCommand {
    Update(PeerId, oneshot::Sender<Option<PeerId>>),
    Remove(PeerId),
    Refresh(PeerId),
    Replace { stale: PeerId, challenger: PeerId },
    Nearest(DistanceId, usize, oneshot::Sender<Vec<PeerId>>),
    Find(PeerId, oneshot::Sender<bool>),
    List(oneshot::Sender<Vec<PeerId>>),
    Stats(oneshot::Sender<RoutingStats>),
    Quit,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingStats {
    pub size: usize,
    pub depth: usize,
    pub bucket_sizes: Vec<usize>,
}

/// Cloneable handle to a routing table owned by an actor task.
#[derive(Clone)]
pub struct RoutingHandle {
    cmd_tx: mpsc::Sender<RoutingCommand>,
}

impl RoutingHandle {
    pub fn spawn(table: RoutingTable) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(ROUTING_COMMAND_CHANNEL_SIZE);
        tokio::spawn(RoutingActor { table, cmd_rx }.run());
        Self { cmd_tx }
    }

    /// Insert or refresh a peer; see [`RoutingTable::update`].
    pub async fn update(&self, peer: PeerId) -> Option<PeerId> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(RoutingCommand::Update(peer, tx)).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    pub async fn remove(&self, peer: PeerId) {
        let _ = self.cmd_tx.send(RoutingCommand::Remove(peer)).await;
    }

    pub async fn refresh(&self, peer: PeerId) {
        let _ = self.cmd_tx.send(RoutingCommand::Refresh(peer)).await;
    }

    pub async fn replace(&self, stale: PeerId, challenger: PeerId) {
        let _ = self
            .cmd_tx
            .send(RoutingCommand::Replace { stale, challenger })
            .await;
    }

    pub async fn nearest_peers(&self, target: DistanceId, n: usize) -> Vec<PeerId> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(RoutingCommand::Nearest(target, n, tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn find(&self, peer: PeerId) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(RoutingCommand::Find(peer, tx)).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn list_peers(&self) -> Vec<PeerId> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(RoutingCommand::List(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn stats(&self) -> RoutingStats {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(RoutingCommand::Stats(tx)).await.is_err() {
            return RoutingStats::default();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn size(&self) -> usize {
        self.stats().await.size
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(RoutingCommand::Quit).await;
    }
}

struct RoutingActor {
    table: RoutingTable,
    cmd_rx: mpsc::Receiver<RoutingCommand>,
}

impl RoutingActor {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                RoutingCommand::Update(peer, reply) => {
                    let evict = self.table.update(peer);
                    if let Some(candidate) = evict {
                        trace!(
                            peer = %peer.short(),
                            candidate = %candidate.short(),
                            "bucket full, returning eviction candidate"
                        );
                    }
                    let _ = reply.send(evict);
                }
                RoutingCommand::Remove(peer) => {
                    if self.table.remove(&peer) {
                        trace!(peer = %peer.short(), "removed peer from routing table");
                    }
                }
                RoutingCommand::Refresh(peer) => {
                    self.table.refresh(&peer);
                }
                RoutingCommand::Replace { stale, challenger } => {
                    if self.table.replace(&stale, challenger) {
                        debug!(
                            stale = %stale.short(),
                            challenger = %challenger.short(),
                            "evicted unresponsive peer"
                        );
                    }
                }
                RoutingCommand::Nearest(target, n, reply) => {
                    let _ = reply.send(self.table.nearest_peers(&target, n));
                }
                RoutingCommand::Find(peer, reply) => {
                    let _ = reply.send(self.table.find(&peer));
                }
                RoutingCommand::List(reply) => {
                    let _ = reply.send(self.table.list_peers().copied().collect());
                }
                RoutingCommand::Stats(reply) => {
                    let stats = RoutingStats {
                        size: self.table.size(),
                        depth: self.table.depth(),
                        bucket_sizes: (0..self.table.depth())
                            .filter_map(|i| self.table.bucket_len(i))
                            .collect(),
                    };
                    let _ = reply.send(stats);
                }
                RoutingCommand::Quit => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyspace::distance_id;

    /// Random PeerIds whose DistanceId has the requested first bit.
    fn peer_with_first_bit(bit: u8) -> PeerId {
        loop {
            let peer = PeerId::random();
            if DistanceId::of_peer(&peer).as_bytes()[0] >> 7 == bit {
                return peer;
            }
        }
    }

    #[test]
    fn bucket_split_at_capacity() {
        let local = peer_with_first_bit(0);
        let mut table = RoutingTable::new(local, 20);

        let mut evictions = Vec::new();
        for _ in 0..21 {
            if let Some(candidate) = table.update(peer_with_first_bit(1)) {
                evictions.push(candidate);
            }
        }

        assert_eq!(table.depth(), 2);
        assert_eq!(table.bucket_len(0), Some(20));
        assert_eq!(table.bucket_len(1), Some(0));
        assert_eq!(evictions.len(), 1);
        assert_eq!(table.size(), 20);
    }

    #[test]
    fn eviction_candidate_is_least_recently_seen() {
        let local = peer_with_first_bit(0);
        let mut table = RoutingTable::new(local, 2);
        let first = peer_with_first_bit(1);
        let second = peer_with_first_bit(1);
        table.update(first);
        table.update(second);

        // Touching `first` makes `second` the oldest.
        assert_eq!(table.update(first), None);
        assert_eq!(table.update(peer_with_first_bit(1)), Some(second));
    }

    #[test]
    fn last_bucket_at_max_depth_never_splits() {
        let local = peer_with_first_bit(0);
        let mut table = RoutingTable::new(local, 2).with_max_depth(1);
        let oldest = PeerId::random();
        let newer = PeerId::random();
        assert_eq!(table.update(oldest), None);
        assert_eq!(table.update(newer), None);

        for _ in 0..5 {
            assert_eq!(table.update(PeerId::random()), Some(oldest));
        }
        assert_eq!(table.depth(), 1);
        assert_eq!(table.size(), 2);
        assert!(table.find(&oldest) && table.find(&newer));
    }

    #[test]
    fn split_stops_at_configured_depth() {
        let local = peer_with_first_bit(0);
        let mut table = RoutingTable::new(local, 1).with_max_depth(2);
        let mut candidates = 0;
        for _ in 0..40 {
            if table.update(PeerId::random()).is_some() {
                candidates += 1;
            }
        }
        assert_eq!(table.depth(), 2);
        assert_eq!(table.size(), 2);
        assert_eq!(candidates, 38);
    }

    #[test]
    fn update_is_idempotent() {
        let mut table = RoutingTable::new(PeerId::random(), 20);
        let peer = PeerId::random();
        assert_eq!(table.update(peer), None);
        assert_eq!(table.update(peer), None);
        assert_eq!(table.size(), 1);
        assert!(table.find(&peer));
    }

    #[test]
    fn never_contains_self() {
        let local = PeerId::random();
        let mut table = RoutingTable::new(local, 20);
        assert_eq!(table.update(local), None);
        assert!(!table.find(&local));
        assert_eq!(table.size(), 0);
    }

    #[test]
    fn nearest_peers_contains_inserted_peer() {
        let mut table = RoutingTable::new(PeerId::random(), 4);
        let mut present = Vec::new();
        for _ in 0..200 {
            let peer = PeerId::random();
            if table.update(peer).is_none() && table.find(&peer) {
                present.push(peer);
            }
        }
        for peer in &present {
            if table.find(peer) {
                let nearest = table.nearest_peers(&DistanceId::of_peer(peer), 1);
                assert_eq!(nearest, vec![*peer]);
            }
        }
        assert!(table.size() <= table.depth() * table.bucket_size());
    }

    #[test]
    fn nearest_peers_sorted_and_spills_across_buckets() {
        let mut table = RoutingTable::new(PeerId::random(), 3);
        for _ in 0..64 {
            table.update(PeerId::random());
        }
        let target = distance_id(b"/v/some-key");
        let nearest = table.nearest_peers(&target, 8);
        assert_eq!(nearest.len(), 8.min(table.size()));
        for pair in nearest.windows(2) {
            let da = DistanceId::of_peer(&pair[0]).xor(&target);
            let db = DistanceId::of_peer(&pair[1]).xor(&target);
            assert!(da < db);
        }
    }

    #[test]
    fn remove_and_replace() {
        let local = peer_with_first_bit(0);
        let mut table = RoutingTable::new(local, 1);
        let incumbent = peer_with_first_bit(1);
        let challenger = peer_with_first_bit(1);
        table.update(incumbent);
        assert_eq!(table.update(challenger), Some(incumbent));

        assert!(table.replace(&incumbent, challenger));
        assert!(!table.find(&incumbent));
        assert!(table.find(&challenger));

        assert!(table.remove(&challenger));
        assert!(!table.remove(&challenger));
        assert_eq!(table.size(), 0);
    }

    #[tokio::test]
    async fn handle_serializes_access() {
        let handle = RoutingHandle::spawn(RoutingTable::new(PeerId::random(), 20));
        let peers: Vec<PeerId> = (0..10).map(|_| PeerId::random()).collect();
        for peer in &peers {
            assert_eq!(handle.update(*peer).await, None);
        }
        assert_eq!(handle.size().await, 10);
        assert!(handle.find(peers[3]).await);

        handle.remove(peers[3]).await;
        assert!(!handle.find(peers[3]).await);
        assert_eq!(handle.list_peers().await.len(), 9);

        let nearest = handle.nearest_peers(DistanceId::of_peer(&peers[0]), 1).await;
        assert_eq!(nearest, vec![peers[0]]);
        handle.quit().await;
    }
}
