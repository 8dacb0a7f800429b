//! # DHT Configuration
//!
//! Everything tunable about a [`Dht`](crate::Dht) lives in [`DhtConfig`],
//! passed to the constructor. There are no process-wide registries: the
//! record validators and selectors are part of the config too.
//!
//! | Field | Default |
//! |-------|---------|
//! | `bucket_size` (k) | 20 |
//! | `alpha` | 3 |
//! | `provider_ttl` | 24 h |
//! | `bootstrap_interval` | 10 s |
//! | `bootstrap_queries` | 1 |
//! | `bootstrap_timeout` | 10 s |
//! | `max_message_size` | 2 MiB |
//! | `protocol_id` | `/kadroute/kad/1.0.0` |
//! | `stream_reuse_tries` | 3 |
//! | `rpc_timeout` | 1 min |
//! | `query_timeout` | 1 min |
//! | `closer_peer_count` | 6 |
//! | `value_quorum` | 16 |
//! | `provider_gc_interval` | 1 h |
//! | `provider_cache_size` | 256 keys |
//! | `address_gc_interval` | 10 min |
//! | `read_repair_limit` | unset: `bucket_size` |
//! | `max_record_age` | 36 h |

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::DhtError;
use crate::identity::PeerInfo;
use crate::messages::DEFAULT_MAX_MESSAGE_SIZE;
use crate::records::{PublicKeyValidator, Selector, SelectorMap, Validator, ValidatorMap};

pub const DEFAULT_PROTOCOL_ID: &str = "/kadroute/kad/1.0.0";
pub const DEFAULT_BUCKET_SIZE: usize = 20;
pub const DEFAULT_ALPHA: usize = 3;

#[derive(Clone)]
pub struct DhtConfig {
    pub bucket_size: usize,
    pub alpha: usize,
    pub provider_ttl: Duration,
    pub bootstrap_interval: Duration,
    pub bootstrap_queries: usize,
    pub bootstrap_timeout: Duration,
    pub max_message_size: usize,
    pub validators: ValidatorMap,
    pub selectors: SelectorMap,
    pub seed_peers: Vec<PeerInfo>,
    pub protocol_id: String,
    pub stream_reuse_tries: u32,
    pub rpc_timeout: Duration,
    pub query_timeout: Duration,
    pub closer_peer_count: usize,
    pub value_quorum: usize,
    pub provider_gc_interval: Duration,
    pub provider_cache_size: usize,
    pub address_gc_interval: Duration,
    /// Peers repaired after a value lookup; `None` follows `bucket_size`.
    pub read_repair_limit: Option<usize>,
    pub max_record_age: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        let mut validators: ValidatorMap = HashMap::new();
        validators.insert("pk".to_string(), Arc::new(PublicKeyValidator));
        Self {
            bucket_size: DEFAULT_BUCKET_SIZE,
            alpha: DEFAULT_ALPHA,
            provider_ttl: Duration::from_secs(24 * 60 * 60),
            bootstrap_interval: Duration::from_secs(10),
            bootstrap_queries: 1,
            bootstrap_timeout: Duration::from_secs(10),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            validators,
            selectors: HashMap::new(),
            seed_peers: Vec::new(),
            protocol_id: DEFAULT_PROTOCOL_ID.to_string(),
            stream_reuse_tries: 3,
            rpc_timeout: Duration::from_secs(60),
            query_timeout: Duration::from_secs(60),
            closer_peer_count: 6,
            value_quorum: 16,
            provider_gc_interval: Duration::from_secs(60 * 60),
            provider_cache_size: 256,
            address_gc_interval: Duration::from_secs(10 * 60),
            read_repair_limit: None,
            max_record_age: Duration::from_secs(36 * 60 * 60),
        }
    }
}

impl DhtConfig {
    /// Register a validator (and optionally a selector) for `namespace`.
    pub fn with_namespace(
        mut self,
        namespace: &str,
        validator: Arc<dyn Validator>,
        selector: Option<Arc<dyn Selector>>,
    ) -> Self {
        self.validators.insert(namespace.to_string(), validator);
        if let Some(selector) = selector {
            self.selectors.insert(namespace.to_string(), selector);
        }
        self
    }

    pub fn with_seed_peers(mut self, peers: Vec<PeerInfo>) -> Self {
        self.seed_peers = peers;
        self
    }

    pub fn repair_limit(&self) -> usize {
        self.read_repair_limit.unwrap_or(self.bucket_size)
    }

    pub fn validate(&self) -> Result<(), DhtError> {
        fn invalid(msg: &str) -> Result<(), DhtError> {
            Err(DhtError::Invariant(format!("invalid config: {}", msg)))
        }
        if self.bucket_size == 0 {
            return invalid("bucket_size must be at least 1");
        }
        if self.alpha == 0 {
            return invalid("alpha must be at least 1");
        }
        if self.closer_peer_count == 0 {
            return invalid("closer_peer_count must be at least 1");
        }
        if self.value_quorum == 0 {
            return invalid("value_quorum must be at least 1");
        }
        if self.max_message_size < 1024 {
            return invalid("max_message_size must be at least 1 KiB");
        }
        if self.protocol_id.is_empty() || !self.protocol_id.starts_with('/') {
            return invalid("protocol_id must be a non-empty path");
        }
        if self.rpc_timeout.is_zero() || self.query_timeout.is_zero() {
            return invalid("timeouts must be positive");
        }
        if self.bootstrap_interval.is_zero()
            || self.provider_gc_interval.is_zero()
            || self.address_gc_interval.is_zero()
        {
            return invalid("intervals must be positive");
        }
        if self.provider_cache_size == 0 {
            return invalid("provider_cache_size must be at least 1");
        }
        Ok(())
    }
}

impl std::fmt::Debug for DhtConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut namespaces: Vec<&String> = self.validators.keys().collect();
        namespaces.sort();
        f.debug_struct("DhtConfig")
            .field("bucket_size", &self.bucket_size)
            .field("alpha", &self.alpha)
            .field("protocol_id", &self.protocol_id)
            .field("namespaces", &namespaces)
            .field("seed_peers", &self.seed_peers.len())
            .finish_non_exhaustive()
    }
}
