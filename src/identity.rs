//! # Identities
//!
//! - [`Keypair`]: Ed25519 signing keypair owned by the local node
//! - [`PeerId`]: 32-byte BLAKE3 hash of a peer's Ed25519 public key
//! - [`PeerInfo`]: a PeerId together with the addresses it can be dialed on
//!
//! A PeerId is not itself a public key. Verifying something a peer signed
//! requires resolving its public key first (see the `pk` module), and any
//! key claimed for a peer is checked with [`PeerId::matches_public_key`].

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public_key_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key.verifying_key().verify(message, signature).is_ok()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive the PeerId owned by an Ed25519 public key.
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self(*blake3::hash(public_key).as_bytes())
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// A random PeerId. Nobody owns the matching key; used as a lookup target.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        if getrandom::getrandom(&mut bytes).is_err() {
            bytes = *blake3::hash(&now_ms().to_be_bytes()).as_bytes();
        }
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn matches_public_key(&self, public_key: &[u8; 32]) -> bool {
        Self::from_public_key(public_key) == *self
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// First 8 bytes in hex, for log fields.
    pub(crate) fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::str::FromStr for PeerId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; 32]> for PeerId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A peer and the addresses it was last seen on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addrs: Vec<String>,
}

impl PeerInfo {
    pub fn new(id: PeerId, addrs: Vec<String>) -> Self {
        Self { id, addrs }
    }

    pub fn primary_addr(&self) -> Option<&str> {
        self.addrs.first().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_is_hash_of_public_key() {
        let keypair = Keypair::generate();
        let id = keypair.peer_id();
        assert!(id.matches_public_key(&keypair.public_key_bytes()));
        assert_ne!(id.as_bytes(), &keypair.public_key_bytes());

        let other = Keypair::generate();
        assert!(!id.matches_public_key(&other.public_key_bytes()));
    }

    #[test]
    fn keypair_round_trips_through_secret_bytes() {
        let keypair = Keypair::generate();
        let restored = Keypair::from_secret_key_bytes(&keypair.secret_key_bytes());
        assert_eq!(keypair.peer_id(), restored.peer_id());

        let sig = keypair.sign(b"payload");
        assert!(restored.verify(b"payload", &sig));
        assert!(!restored.verify(b"tampered", &sig));
    }

    #[test]
    fn hex_round_trip_and_rejects_wrong_length() {
        let id = Keypair::generate().peer_id();
        assert_eq!(PeerId::from_hex(&id.to_hex()).unwrap(), id);
        assert!(PeerId::from_hex("abcd").is_err());
        assert_eq!(format!("{:?}", id), format!("PeerId({})", &id.to_hex()[..16]));
    }

    #[test]
    fn random_ids_differ() {
        assert_ne!(PeerId::random(), PeerId::random());
    }
}
