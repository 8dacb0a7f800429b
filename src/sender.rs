//! # Message Sender
//!
//! One [`MessageSender`] per remote peer owns at most one open stream and
//! serializes every request to that peer through a mutex, so replies pair
//! with requests in send order.
//!
//! ## Stream Lifecycle
//!
//! ```text
//!  Idle --open--> Open --write/read ok--> Open (reused)
//!                   |
//!                   +--error--> Failed --reopen once--> Open | error
//!                   |
//!                   +--single-use mode--> Closed after each round-trip
//! ```
//!
//! A remote that keeps closing streams after one round-trip forces a retry
//! on every reuse. Each successful retry bumps a counter; once it reaches
//! `stream_reuse_tries` the sender stops reusing and closes the stream after
//! every message.
//!
//! A request cancelled between its write and its read leaves the stream
//! in flight; the next call drops that stream rather than read a reply
//! meant for someone else. Replies must also echo the request's type and
//! key.
//!
//! [`SenderPool`] maps PeerIds to senders, creating them lazily.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::config::DhtConfig;
use crate::error::DhtError;
use crate::host::{BoxStream, Host};
use crate::identity::PeerId;
use crate::messages::{read_message, write_message, Message};

#[derive(Debug, Clone)]
pub struct SenderSettings {
    pub protocol_id: String,
    pub max_message_size: usize,
    pub stream_reuse_tries: u32,
    pub rpc_timeout: Duration,
}

impl SenderSettings {
    pub fn from_config(config: &DhtConfig) -> Self {
        Self {
            protocol_id: config.protocol_id.clone(),
            max_message_size: config.max_message_size,
            stream_reuse_tries: config.stream_reuse_tries,
            rpc_timeout: config.rpc_timeout,
        }
    }
}

#[derive(Default)]
struct StreamState {
    stream: Option<BoxStream>,
    /// Whether the current stream already carried a round-trip.
    reused: bool,
    /// Set from the write until the matching reply is read.
    in_flight: bool,
    single_use: u32,
}

pub struct MessageSender<H: Host> {
    peer: PeerId,
    host: Arc<H>,
    settings: Arc<SenderSettings>,
    state: Mutex<StreamState>,
}

impl<H: Host> MessageSender<H> {
    pub fn new(peer: PeerId, host: Arc<H>, settings: Arc<SenderSettings>) -> Self {
        Self {
            peer,
            host,
            settings,
            state: Mutex::new(StreamState::default()),
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    async fn prep(&self, state: &mut StreamState) -> Result<(), DhtError> {
        if state.in_flight {
            state.in_flight = false;
            if state.stream.take().is_some() {
                trace!(peer = %self.peer.short(), "dropping stream left by a cancelled request");
            }
        }
        if state.stream.is_some() {
            return Ok(());
        }
        let stream = timeout(
            self.settings.rpc_timeout,
            self.host.new_stream(&self.peer, &self.settings.protocol_id),
        )
        .await??;
        state.stream = Some(stream);
        state.reused = false;
        Ok(())
    }

    async fn write(&self, state: &mut StreamState, msg: &Message) -> Result<(), DhtError> {
        let stream = state
            .stream
            .as_mut()
            .ok_or_else(|| DhtError::Invariant("write without an open stream".into()))?;
        timeout(
            self.settings.rpc_timeout,
            write_message(stream, msg, self.settings.max_message_size),
        )
        .await??;
        Ok(())
    }

    async fn read(&self, state: &mut StreamState) -> Result<Message, DhtError> {
        let stream = state
            .stream
            .as_mut()
            .ok_or_else(|| DhtError::Invariant("read without an open stream".into()))?;
        match timeout(
            self.settings.rpc_timeout,
            read_message(stream, self.settings.max_message_size),
        )
        .await?
        {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(DhtError::Transport("stream closed by remote".into())),
            Err(e) => Err(e.into()),
        }
    }

    /// Bookkeeping after a completed exchange.
    async fn finish(&self, state: &mut StreamState, retried: bool) {
        if retried {
            state.single_use += 1;
        } else if state.reused {
            state.single_use = 0;
        }
        if state.single_use >= self.settings.stream_reuse_tries {
            if let Some(mut stream) = state.stream.take() {
                let _ = stream.shutdown().await;
            }
        } else {
            state.reused = true;
        }
    }

    /// Write one message without waiting for a reply.
    pub async fn send_message(&self, msg: &Message) -> Result<(), DhtError> {
        let mut state = self.state.lock().await;
        let mut retried = false;
        loop {
            self.prep(&mut state).await?;
            state.in_flight = true;
            let written = self.write(&mut state, msg).await;
            state.in_flight = false;
            if let Err(e) = written {
                state.stream = None;
                if retried || matches!(e, DhtError::Timeout) {
                    debug!(peer = %self.peer.short(), error = %e, "send failed");
                    return Err(e);
                }
                trace!(peer = %self.peer.short(), error = %e, "write failed, reopening stream");
                retried = true;
                continue;
            }
            self.finish(&mut state, retried).await;
            return Ok(());
        }
    }

    /// Write `msg` and wait for the single reply.
    pub async fn send_request(&self, msg: &Message) -> Result<Message, DhtError> {
        let mut state = self.state.lock().await;
        let mut retried = false;
        loop {
            self.prep(&mut state).await?;
            state.in_flight = true;
            if let Err(e) = self.write(&mut state, msg).await {
                state.stream = None;
                state.in_flight = false;
                if retried || matches!(e, DhtError::Timeout) {
                    debug!(peer = %self.peer.short(), error = %e, "request write failed");
                    return Err(e);
                }
                trace!(peer = %self.peer.short(), error = %e, "write failed, reopening stream");
                retried = true;
                continue;
            }
            let read = self.read(&mut state).await;
            state.in_flight = false;
            let reply = match read {
                Ok(reply) => reply,
                Err(e) => {
                    state.stream = None;
                    if retried || matches!(e, DhtError::Timeout) {
                        debug!(peer = %self.peer.short(), error = %e, "request read failed");
                        return Err(e);
                    }
                    trace!(peer = %self.peer.short(), error = %e, "read failed, reopening stream");
                    retried = true;
                    continue;
                }
            };
            if reply.msg_type != msg.msg_type || reply.key != msg.key {
                state.stream = None;
                debug!(peer = %self.peer.short(), "reply does not match request, dropping stream");
                return Err(DhtError::Transport(format!(
                    "expected {} reply for the request key, got {}",
                    msg.msg_type.as_str(),
                    reply.msg_type.as_str()
                )));
            }
            self.finish(&mut state, retried).await;
            return Ok(reply);
        }
    }

    /// Drop the open stream, if any.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if let Some(mut stream) = state.stream.take() {
            let _ = stream.shutdown().await;
        }
    }

    #[cfg(test)]
    pub(crate) async fn single_use_count(&self) -> u32 {
        self.state.lock().await.single_use
    }

    #[cfg(test)]
    pub(crate) async fn has_open_stream(&self) -> bool {
        self.state.lock().await.stream.is_some()
    }
}

// ============================================================================
// Sender pool
// ============================================================================

pub struct SenderPool<H: Host> {
    host: Arc<H>,
    settings: Arc<SenderSettings>,
    senders: RwLock<HashMap<PeerId, Arc<MessageSender<H>>>>,
}

impl<H: Host> SenderPool<H> {
    pub fn new(host: Arc<H>, settings: SenderSettings) -> Self {
        Self {
            host,
            settings: Arc::new(settings),
            senders: RwLock::new(HashMap::new()),
        }
    }

    pub fn sender(&self, peer: &PeerId) -> Arc<MessageSender<H>> {
        if let Some(sender) = self
            .senders
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer)
        {
            return Arc::clone(sender);
        }
        let mut senders = self.senders.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(senders.entry(*peer).or_insert_with(|| {
            Arc::new(MessageSender::new(
                *peer,
                Arc::clone(&self.host),
                Arc::clone(&self.settings),
            ))
        }))
    }

    pub fn remove(&self, peer: &PeerId) -> bool {
        self.senders
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(peer)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.senders.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn send_request(&self, peer: &PeerId, msg: &Message) -> Result<Message, DhtError> {
        self.sender(peer).send_request(msg).await
    }

    pub async fn send_message(&self, peer: &PeerId, msg: &Message) -> Result<(), DhtError> {
        self.sender(peer).send_message(msg).await
    }
}
