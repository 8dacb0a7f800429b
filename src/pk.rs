//! # Public-Key Resolution
//!
//! PeerIds are hashes, so verifying a signed record needs the author's
//! public key from somewhere. Sources are tried in order:
//!
//! 1. the local keypair
//! 2. the in-memory [`KeyBook`] of keys resolved earlier
//! 3. the host (keys learned during the connection handshake)
//! 4. the local datastore's `/pk/<peer>` record
//! 5. a DHT lookup of `/pk/<peer>`, only when fetching is allowed
//!
//! The lookup in step 5 validates the records it receives with fetching
//! disabled. `/pk/` records are self-validating, so resolution never
//! recurses more than one level.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::RwLock;

use tracing::{debug, trace};

use crate::dht::DhtInner;
use crate::error::DhtError;
use crate::host::Host;
use crate::identity::PeerId;
use crate::records::{pk_key, Record};

/// Cache of public keys already checked against their PeerId.
#[derive(Debug, Default)]
pub struct KeyBook {
    keys: RwLock<HashMap<PeerId, [u8; 32]>>,
}

impl KeyBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer: &PeerId) -> Option<[u8; 32]> {
        self.keys
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer)
            .copied()
    }

    /// Insert `public_key` if it hashes to `peer`.
    pub fn insert(&self, peer: PeerId, public_key: [u8; 32]) -> bool {
        if !peer.matches_public_key(&public_key) {
            return false;
        }
        self.keys
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer, public_key);
        true
    }

    pub fn len(&self) -> usize {
        self.keys.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn key_from_value(peer: &PeerId, value: &[u8]) -> Option<[u8; 32]> {
    let key: [u8; 32] = value.try_into().ok()?;
    peer.matches_public_key(&key).then_some(key)
}

type KeyFuture<'a> = Pin<Box<dyn Future<Output = Result<[u8; 32], DhtError>> + Send + 'a>>;

impl<H: Host> DhtInner<H> {
    /// Resolve from local sources only.
    pub(crate) async fn local_public_key(&self, peer: &PeerId) -> Option<[u8; 32]> {
        if *peer == self.local {
            return Some(self.host.keypair().public_key_bytes());
        }
        if let Some(key) = self.keys.get(peer) {
            return Some(key);
        }
        if let Some(key) = self.host.public_key(peer)
            && self.keys.insert(*peer, key)
        {
            return Some(key);
        }
        match self.get_local_record(&pk_key(peer)).await {
            Ok(Some(record)) => {
                let key = key_from_value(peer, &record.value)?;
                self.keys.insert(*peer, key);
                Some(key)
            }
            Ok(None) => None,
            Err(e) => {
                debug!(peer = %peer.short(), error = %e, "failed to read stored public key");
                None
            }
        }
    }

    /// Resolve a public key, falling back to a DHT lookup when `fetch` is set.
    pub(crate) fn resolve_public_key<'a>(&'a self, peer: &'a PeerId, fetch: bool) -> KeyFuture<'a> {
        Box::pin(async move {
            if let Some(key) = self.local_public_key(peer).await {
                return Ok(key);
            }
            if !fetch {
                return Err(DhtError::NotFound);
            }
            trace!(peer = %peer.short(), "fetching public key from the network");
            let lookup = self.lookup_values(&pk_key(peer), 1, false).await?;
            for (_, record) in lookup.records {
                if let Some(key) = key_from_value(peer, &record.value) {
                    self.keys.insert(*peer, key);
                    return Ok(key);
                }
            }
            Err(DhtError::NotFound)
        })
    }

    /// Full record verification, resolving the author's key as needed.
    pub(crate) async fn verify_record(&self, record: &Record, fetch: bool) -> Result<(), DhtError> {
        if !self.verifier.sign_required(&record.key)? {
            return self.verifier.verify(record, None);
        }
        let author_key = match self.resolve_public_key(&record.author, fetch).await {
            Ok(key) => Some(key),
            Err(DhtError::NotFound) => None,
            Err(e) => return Err(e),
        };
        self.verifier.verify(record, author_key.as_ref())
    }

    /// The unsigned `/pk/` record for the local node.
    pub(crate) fn own_public_key_record(&self) -> Record {
        Record::new_unsigned(
            self.local,
            pk_key(&self.local),
            self.host.keypair().public_key_bytes().to_vec(),
        )
    }
}
