//! # DHT Error Taxonomy
//!
//! Every public DHT operation reports failures through [`DhtError`]. The
//! variants are kinds, not call sites: callers match on them to decide
//! whether to retry, surface partial results or give up.
//!
//! | Variant | Meaning |
//! |---------|---------|
//! | `NotFound` | A lookup completed without a matching value or peer |
//! | `Timeout` | A deadline expired |
//! | `Transport` | Opening, reading or writing a stream failed |
//! | `Validation` | A record failed signature or namespace checks |
//! | `Invariant` | Internal consistency violation or unusable configuration |
//! | `Cancelled` | The operation was cancelled by its caller or by shutdown |
//! | `Unsupported` | No validator is registered for the key's namespace |

use crate::crypto::SignatureError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhtError {
    NotFound,
    Timeout,
    Transport(String),
    Validation(String),
    Invariant(String),
    Cancelled,
    Unsupported(String),
}

impl DhtError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DhtError::NotFound)
    }

    pub(crate) fn transport(err: impl std::fmt::Display) -> Self {
        DhtError::Transport(err.to_string())
    }
}

impl std::fmt::Display for DhtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DhtError::NotFound => write!(f, "routing: not found"),
            DhtError::Timeout => write!(f, "deadline exceeded"),
            DhtError::Transport(msg) => write!(f, "transport error: {}", msg),
            DhtError::Validation(msg) => write!(f, "invalid record: {}", msg),
            DhtError::Invariant(msg) => write!(f, "invariant violated: {}", msg),
            DhtError::Cancelled => write!(f, "operation cancelled"),
            DhtError::Unsupported(ns) => write!(f, "unsupported namespace: {}", ns),
        }
    }
}

impl std::error::Error for DhtError {}

impl From<SignatureError> for DhtError {
    fn from(err: SignatureError) -> Self {
        DhtError::Validation(err.to_string())
    }
}

impl From<std::io::Error> for DhtError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => DhtError::Timeout,
            _ => DhtError::Transport(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for DhtError {
    fn from(err: anyhow::Error) -> Self {
        // Keep typed errors intact when they were wrapped on the way up.
        match err.downcast::<DhtError>() {
            Ok(dht) => dht,
            Err(other) => DhtError::Transport(format!("{:#}", other)),
        }
    }
}

impl From<tokio::time::error::Elapsed> for DhtError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        DhtError::Timeout
    }
}
