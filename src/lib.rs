//! # kadroute - Kademlia-style DHT core
//!
//! kadroute implements the routing layer of a peer-to-peer network:
//!
//! - **Keyspace**: 256-bit XOR metric over BLAKE3 hashes of keys and PeerIds
//! - **Routing table**: split-on-demand k-buckets with ping-before-evict
//! - **Queries**: iterative α-parallel lookups with per-query deadlines
//! - **Records**: signed key/value records checked by per-namespace validators,
//!   with selectors choosing between conflicting values
//! - **Providers**: TTL-bound "who has this key" announcements
//!
//! The DHT runs on any [`Host`], which supplies authenticated peer
//! connections and multiplexed streams. [`MemoryNetwork`] provides an
//! in-process host for tests and simulations; [`QuicHost`] runs over QUIC
//! with mutual TLS.
//!
//! ## Architecture
//!
//! Shared mutable state is owned by actors:
//! - The routing table and provider store each have a cloneable handle and a
//!   private actor task processing commands in order
//! - Background loops (inbound streams, notifications, bootstrap) hold weak
//!   references and stop when the last [`Dht`] handle goes away
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `dht` | Public [`Dht`] handle: put/get values, providers, peer lookup |
//! | `identity` | Keypairs, PeerIds, peer address info |
//! | `crypto` | Domain-separated signatures, TLS certificates |
//! | `keyspace` | XOR distance and DistanceIds |
//! | `routing` | k-bucket routing table and its actor |
//! | `query` | Iterative lookup engine |
//! | `messages` | Wire messages and varint-framed codec |
//! | `sender` | Per-peer request/reply over reusable streams |
//! | `handlers` | Server-side RPC dispatch |
//! | `records` | Records, validators, selectors |
//! | `pk` | Public-key resolution for signature checks |
//! | `providers` | Provider store |
//! | `bootstrap` | Seed connection and periodic refresh |
//! | `notify` | Host connectivity events |
//! | `host` | Host abstraction and address book |
//! | `memnet` | In-process host |
//! | `quic` | QUIC host |
//! | `datastore` | Key-value persistence abstraction |
//! | `config` | DHT configuration |
//! | `error` | Error taxonomy |

mod bootstrap;
mod config;
mod crypto;
mod datastore;
mod dht;
mod error;
mod handlers;
mod host;
mod identity;
mod keyspace;
mod memnet;
mod messages;
mod notify;
mod pk;
mod providers;
mod query;
mod quic;
mod records;
mod routing;
mod sender;

pub use config::{DhtConfig, DEFAULT_ALPHA, DEFAULT_BUCKET_SIZE, DEFAULT_PROTOCOL_ID};
pub use crypto::SignatureError;
pub use datastore::{Datastore, MemoryDatastore};
pub use dht::Dht;
pub use error::DhtError;
pub use host::{
    AddressBook, BoxStream, Connectedness, DhtStream, Host, HostEvent, InboundStream,
    PERMANENT_ADDR_TTL, PROVIDER_ADDR_TTL, TEMP_ADDR_TTL,
};
pub use identity::{Keypair, PeerId, PeerInfo};
pub use keyspace::{closer, common_prefix_len, distance_id, sort_by_distance, DistanceId, KEYSPACE_BITS};
pub use memnet::{memory_addr, MemoryHost, MemoryNetwork};
pub use messages::{
    read_message, write_message, Message, MessageType, WireError, WireErrorKind, WirePeer,
    DEFAULT_MAX_MESSAGE_SIZE,
};
pub use providers::ProviderStore;
pub use quic::QuicHost;
pub use records::{
    decode_sequence, encode_sequenced, namespace, pk_key, AcceptAllValidator, FirstValidSelector,
    PublicKeyValidator, Record, RecordVerifier, Selector, SelectorMap, SequenceSelector,
    SequenceValidator, Validator, ValidatorMap, PK_PREFIX,
};
pub use routing::{RoutingStats, RoutingTable};
