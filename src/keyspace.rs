//! # XOR Keyspace
//!
//! All routing decisions happen in a 256-bit space. Keys and PeerIds are
//! mapped into it with BLAKE3 ([`distance_id`], [`DistanceId::of_peer`])
//! and compared under the XOR metric:
//!
//! - `d(x, x) = 0`
//! - `d(x, y) = d(y, x)`
//! - `d(x, z) = d(x, y) XOR d(y, z) <= d(x, y) + d(y, z)`
//!
//! Distances are compared as 256-bit big-endian integers.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

/// Width of the keyspace in bits.
pub const KEYSPACE_BITS: usize = 256;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DistanceId([u8; 32]);

/// Map arbitrary bytes into the keyspace.
pub fn distance_id(bytes: &[u8]) -> DistanceId {
    DistanceId(*blake3::hash(bytes).as_bytes())
}

impl DistanceId {
    pub const ZERO: DistanceId = DistanceId([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn of_peer(peer: &PeerId) -> Self {
        distance_id(peer.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[inline]
    pub fn xor(&self, other: &DistanceId) -> DistanceId {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        DistanceId(out)
    }

    /// Number of leading zero bits.
    pub fn leading_zeros(&self) -> usize {
        for (idx, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return idx * 8 + byte.leading_zeros() as usize;
            }
        }
        KEYSPACE_BITS
    }
}

impl std::fmt::Debug for DistanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DistanceId({})", hex::encode(&self.0[..8]))
    }
}

/// Number of leading bits `a` and `b` share; 256 when equal.
#[inline]
pub fn common_prefix_len(a: &DistanceId, b: &DistanceId) -> usize {
    a.xor(b).leading_zeros()
}

/// Compare the distances of `a` and `b` to `target`.
#[inline]
pub fn distance_cmp(a: &DistanceId, b: &DistanceId, target: &DistanceId) -> Ordering {
    a.xor(target).cmp(&b.xor(target))
}

/// Whether peer `a` is strictly closer to `target` than peer `b`.
///
/// Equal distances (only possible when both map to the same DistanceId)
/// fall back to the lower PeerId, so exactly one of `closer(a, b, t)` and
/// `closer(b, a, t)` holds for `a != b`.
pub fn closer(a: &PeerId, b: &PeerId, target: &DistanceId) -> bool {
    if a == b {
        return false;
    }
    match distance_cmp(&DistanceId::of_peer(a), &DistanceId::of_peer(b), target) {
        Ordering::Less => true,
        Ordering::Greater => false,
        Ordering::Equal => a < b,
    }
}

/// Sort peers by ascending distance to `target`, ties broken by PeerId.
pub fn sort_by_distance(target: &DistanceId, peers: Vec<PeerId>) -> Vec<PeerId> {
    let mut keyed: Vec<(DistanceId, PeerId)> = peers
        .into_iter()
        .map(|p| (DistanceId::of_peer(&p).xor(target), p))
        .collect();
    keyed.sort();
    keyed.into_iter().map(|(_, p)| p).collect()
}

/// A uniformly random point in the keyspace.
pub fn random_distance_id() -> DistanceId {
    DistanceId::of_peer(&PeerId::random())
}
