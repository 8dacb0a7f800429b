//! # Records, Validators and Selectors
//!
//! A [`Record`] binds a value to a key and to the PeerId of its author.
//! Whether a record is admissible is decided per namespace, where the
//! namespace is the first path token of the key (`/pk/...` → `pk`).
//!
//! | Namespace | Validator | Signed | Selector |
//! |-----------|-----------|--------|----------|
//! | `pk` | [`PublicKeyValidator`]: `BLAKE3(value) == suffix` | no | first valid |
//! | user-registered | [`Validator`] impl | per validator | [`Selector`] impl or first valid |
//!
//! Signed records carry an Ed25519 signature over
//! `RECORD_SIGNATURE_DOMAIN || value || key || author`, verified under the
//! author's public key. The public key is resolved separately (see `pk`);
//! [`RecordVerifier::verify`] only consumes it.

use std::collections::HashMap;
use std::sync::Arc;

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::crypto::{sign_with_domain, verify_with_domain, SignatureError, RECORD_SIGNATURE_DOMAIN};
use crate::error::DhtError;
use crate::identity::{now_ms, Keypair, PeerId};

/// Key prefix of public-key records.
pub const PK_PREFIX: &[u8] = b"/pk/";

/// Size cap for records persisted in the datastore.
const MAX_STORED_RECORD_SIZE: u64 = 4 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub author: PeerId,
    pub signature: Vec<u8>,
    /// Unix milliseconds at which the storing node accepted the record.
    /// Not covered by the signature.
    pub time_received: Option<u64>,
}

impl Record {
    pub fn new_unsigned(author: PeerId, key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            key,
            value,
            author,
            signature: Vec::new(),
            time_received: None,
        }
    }

    pub fn new_signed(keypair: &Keypair, key: Vec<u8>, value: Vec<u8>) -> Self {
        let mut record = Self::new_unsigned(keypair.peer_id(), key, value);
        record.signature =
            sign_with_domain(keypair, RECORD_SIGNATURE_DOMAIN, &record.signing_payload());
        record
    }

    fn signing_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.value.len() + self.key.len() + 32);
        payload.extend_from_slice(&self.value);
        payload.extend_from_slice(&self.key);
        payload.extend_from_slice(self.author.as_bytes());
        payload
    }

    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty()
    }

    pub fn verify_signature(&self, public_key: &[u8; 32]) -> Result<(), SignatureError> {
        if !self.author.matches_public_key(public_key) {
            return Err(SignatureError::KeyMismatch);
        }
        verify_with_domain(
            public_key,
            RECORD_SIGNATURE_DOMAIN,
            &self.signing_payload(),
            &self.signature,
        )
    }

    pub fn stamp_received(&mut self) {
        self.time_received = Some(now_ms());
    }

    /// Whether the record was received longer than `max_age_ms` ago.
    /// Records without a reception time are never considered expired.
    pub fn is_expired(&self, max_age_ms: u64) -> bool {
        match self.time_received {
            Some(received) => now_ms().saturating_sub(received) > max_age_ms,
            None => false,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, DhtError> {
        storage_options()
            .serialize(self)
            .map_err(|e| DhtError::Invariant(format!("record encoding failed: {}", e)))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        storage_options()
            .deserialize(bytes)
            .map_err(|e| DhtError::Validation(format!("corrupt stored record: {}", e)))
    }
}

fn storage_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_STORED_RECORD_SIZE)
        .with_fixint_encoding()
}

/// The namespace token of `key`: the text between the leading `/` and the
/// next `/`.
pub fn namespace(key: &[u8]) -> Option<&str> {
    let rest = key.strip_prefix(b"/")?;
    let end = rest.iter().position(|b| *b == b'/')?;
    if end == 0 {
        return None;
    }
    std::str::from_utf8(&rest[..end]).ok()
}

/// The `/pk/` key holding the public key of `peer`.
pub fn pk_key(peer: &PeerId) -> Vec<u8> {
    let mut key = PK_PREFIX.to_vec();
    key.extend_from_slice(peer.as_bytes());
    key
}

// ============================================================================
// Validators
// ============================================================================

pub trait Validator: Send + Sync + 'static {
    /// Accept or reject `(key, value)` on namespace grounds alone.
    fn validate(&self, key: &[u8], value: &[u8]) -> Result<(), DhtError>;

    /// Whether records in this namespace must carry an author signature.
    fn sign_required(&self) -> bool {
        true
    }
}

/// `/pk/<peer id>` → Ed25519 public key whose BLAKE3 hash is the peer id.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublicKeyValidator;

impl Validator for PublicKeyValidator {
    fn validate(&self, key: &[u8], value: &[u8]) -> Result<(), DhtError> {
        let suffix = key
            .strip_prefix(PK_PREFIX)
            .ok_or_else(|| DhtError::Validation("not a /pk/ key".into()))?;
        let peer = PeerId::from_slice(suffix)
            .ok_or_else(|| DhtError::Validation("malformed peer id in /pk/ key".into()))?;
        let public_key: [u8; 32] = value
            .try_into()
            .map_err(|_| DhtError::Validation("public key must be 32 bytes".into()))?;
        if !peer.matches_public_key(&public_key) {
            return Err(DhtError::Validation(
                "public key does not hash to key suffix".into(),
            ));
        }
        Ok(())
    }

    fn sign_required(&self) -> bool {
        false
    }
}

/// Accepts any value; optionally demands a signature.
#[derive(Debug, Clone, Copy)]
pub struct AcceptAllValidator {
    pub signed: bool,
}

impl AcceptAllValidator {
    pub fn signed() -> Self {
        Self { signed: true }
    }

    pub fn unsigned() -> Self {
        Self { signed: false }
    }
}

impl Validator for AcceptAllValidator {
    fn validate(&self, _key: &[u8], _value: &[u8]) -> Result<(), DhtError> {
        Ok(())
    }

    fn sign_required(&self) -> bool {
        self.signed
    }
}

/// Values prefixed with a big-endian u64 sequence number.
#[derive(Debug, Clone, Copy)]
pub struct SequenceValidator {
    pub signed: bool,
}

impl Validator for SequenceValidator {
    fn validate(&self, _key: &[u8], value: &[u8]) -> Result<(), DhtError> {
        decode_sequence(value)
            .map(|_| ())
            .ok_or_else(|| DhtError::Validation("value lacks a sequence number".into()))
    }

    fn sign_required(&self) -> bool {
        self.signed
    }
}

pub fn encode_sequenced(seq: u64, payload: &[u8]) -> Vec<u8> {
    let mut value = Vec::with_capacity(8 + payload.len());
    value.extend_from_slice(&seq.to_be_bytes());
    value.extend_from_slice(payload);
    value
}

pub fn decode_sequence(value: &[u8]) -> Option<u64> {
    let head: [u8; 8] = value.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(head))
}

// ============================================================================
// Selectors
// ============================================================================

pub trait Selector: Send + Sync + 'static {
    /// Index of the best value among `values`, all already validated.
    fn select(&self, key: &[u8], values: &[Vec<u8>]) -> Result<usize, DhtError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FirstValidSelector;

impl Selector for FirstValidSelector {
    fn select(&self, _key: &[u8], values: &[Vec<u8>]) -> Result<usize, DhtError> {
        if values.is_empty() {
            return Err(DhtError::NotFound);
        }
        Ok(0)
    }
}

/// Highest sequence number wins; the earliest candidate wins ties.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceSelector;

impl Selector for SequenceSelector {
    fn select(&self, _key: &[u8], values: &[Vec<u8>]) -> Result<usize, DhtError> {
        let mut best: Option<(usize, u64)> = None;
        for (idx, value) in values.iter().enumerate() {
            let Some(seq) = decode_sequence(value) else {
                continue;
            };
            if best.is_none_or(|(_, top)| seq > top) {
                best = Some((idx, seq));
            }
        }
        best.map(|(idx, _)| idx).ok_or(DhtError::NotFound)
    }
}

// ============================================================================
// Registry
// ============================================================================

pub type ValidatorMap = HashMap<String, Arc<dyn Validator>>;
pub type SelectorMap = HashMap<String, Arc<dyn Selector>>;

/// Namespace → validator / selector lookup used by every record path.
#[derive(Clone)]
pub struct RecordVerifier {
    validators: ValidatorMap,
    selectors: SelectorMap,
}

impl RecordVerifier {
    pub fn new(mut validators: ValidatorMap, selectors: SelectorMap) -> Self {
        validators
            .entry("pk".to_string())
            .or_insert_with(|| Arc::new(PublicKeyValidator));
        Self {
            validators,
            selectors,
        }
    }

    fn validator_for(&self, key: &[u8]) -> Result<&Arc<dyn Validator>, DhtError> {
        let ns = namespace(key)
            .ok_or_else(|| DhtError::Unsupported(String::from_utf8_lossy(key).into_owned()))?;
        self.validators
            .get(ns)
            .ok_or_else(|| DhtError::Unsupported(ns.to_string()))
    }

    pub fn sign_required(&self, key: &[u8]) -> Result<bool, DhtError> {
        Ok(self.validator_for(key)?.sign_required())
    }

    /// Namespace check on a bare value.
    pub fn validate_value(&self, key: &[u8], value: &[u8]) -> Result<(), DhtError> {
        self.validator_for(key)?.validate(key, value)
    }

    /// Full record check. `author_key` must be supplied whenever the
    /// namespace requires a signature.
    pub fn verify(&self, record: &Record, author_key: Option<&[u8; 32]>) -> Result<(), DhtError> {
        let validator = self.validator_for(&record.key)?;
        validator.validate(&record.key, &record.value)?;
        if !validator.sign_required() {
            return Ok(());
        }
        let public_key = author_key.ok_or_else(|| {
            DhtError::Validation(format!(
                "public key for author {} unknown",
                record.author.short()
            ))
        })?;
        record.verify_signature(public_key)?;
        Ok(())
    }

    /// Pick the best of `values` with the namespace selector, defaulting to
    /// first valid.
    pub fn select(&self, key: &[u8], values: &[Vec<u8>]) -> Result<usize, DhtError> {
        let selector = namespace(key).and_then(|ns| self.selectors.get(ns));
        let idx = match selector {
            Some(selector) => selector.select(key, values)?,
            None => FirstValidSelector.select(key, values)?,
        };
        if idx >= values.len() {
            return Err(DhtError::Invariant(format!(
                "selector returned index {} of {}",
                idx,
                values.len()
            )));
        }
        Ok(idx)
    }
}

impl std::fmt::Debug for RecordVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut validators: Vec<&String> = self.validators.keys().collect();
        validators.sort();
        let mut selectors: Vec<&String> = self.selectors.keys().collect();
        selectors.sort();
        f.debug_struct("RecordVerifier")
            .field("validators", &validators)
            .field("selectors", &selectors)
            .finish()
    }
}
