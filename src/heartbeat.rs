//! Connection liveness.
//!
//! A heartbeat is an ordinary [`ProtocolRequest`] with subject
//! [`HEARTBEAT_SUBJECT`] and an empty payload, answered by an `Ok`
//! [`ProtocolReply`] with the same id.
//!
//! The client side sends a heartbeat whenever it has not written for
//! `interval` and closes the connection when it has not read anything for
//! `timeout` while heartbeats are outstanding. The server side only watches
//! reads: it closes an idle connection once the peer has proven it speaks
//! heartbeats. Peers that never send heartbeats are never closed by either
//! side.
//!
//! The handlers here are pure state machines. The connection task owns one
//! handler and one [`IdleTimer`] and performs the returned actions.
use crate::config::HeartbeatConfig;
use crate::network::{ProtocolReply, ProtocolRequest};
use crate::types::MemberId;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Reserved subject of heartbeat requests. Changing it breaks compatibility
/// with running peers.
pub const HEARTBEAT_SUBJECT: &str = "internal-heartbeat-v1";

/// Source of message ids for one node, shared by every connection.
#[derive(Debug, Default)]
pub struct MessageIdGenerator {
    next: AtomicU64,
}

impl MessageIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh id, greater than every id returned before.
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Which side of the connection has been idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleState {
    /// Nothing was read for the read timeout.
    ReaderIdle,
    /// Nothing was written for the write timeout.
    WriterIdle,
}

/// Tracks read and write activity and reports idleness.
///
/// Each idle event fires once per quiet period: reporting it restarts the
/// period, just like activity does.
#[derive(Debug, Clone)]
pub struct IdleTimer {
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    last_read: Instant,
    last_write: Instant,
}

impl IdleTimer {
    pub fn new(read_timeout: Option<Duration>, write_timeout: Option<Duration>) -> Self {
        let now = Instant::now();
        Self {
            read_timeout,
            write_timeout,
            last_read: now,
            last_write: now,
        }
    }

    pub fn record_read(&mut self) {
        self.last_read = Instant::now();
    }

    pub fn record_write(&mut self) {
        self.last_write = Instant::now();
    }

    /// The earliest instant at which an idle event can fire.
    pub fn next_deadline(&self) -> Option<Instant> {
        let read = self.read_timeout.map(|timeout| self.last_read + timeout);
        let write = self.write_timeout.map(|timeout| self.last_write + timeout);
        match (read, write) {
            (Some(read), Some(write)) => Some(read.min(write)),
            (read, write) => read.or(write),
        }
    }

    /// Idle events due at `now`, writer first.
    pub fn poll_idle(&mut self, now: Instant) -> Vec<IdleState> {
        let mut events = Vec::with_capacity(2);
        if let Some(timeout) = self.write_timeout {
            if now >= self.last_write + timeout {
                self.last_write = now;
                events.push(IdleState::WriterIdle);
            }
        }
        if let Some(timeout) = self.read_timeout {
            if now >= self.last_read + timeout {
                self.last_read = now;
                events.push(IdleState::ReaderIdle);
            }
        }
        events
    }
}

/// What the connection must do after an idle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdleAction {
    /// Keep going.
    Nothing,
    /// Write this heartbeat request.
    SendHeartbeat(ProtocolRequest),
    /// The peer is presumed dead.
    Close,
}

/// What the connection must do with an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundAction {
    /// Write this reply immediately.
    pub reply: Option<ProtocolReply>,
    /// Deliver the message to the upper protocol layer.
    pub forward: bool,
}

impl InboundAction {
    fn deliver() -> Self {
        Self {
            reply: None,
            forward: true,
        }
    }
}

/// Heartbeat state of the connecting side.
#[derive(Debug)]
pub struct ClientHeartbeat {
    sender: MemberId,
    ids: std::sync::Arc<MessageIdGenerator>,
    outstanding: BTreeSet<u64>,
    forward_heartbeats: bool,
}

impl ClientHeartbeat {
    /// Ids of heartbeats that have not been answered yet.
    pub fn outstanding(&self) -> &BTreeSet<u64> {
        &self.outstanding
    }

    fn on_idle(&mut self, state: IdleState) -> IdleAction {
        match state {
            IdleState::WriterIdle => {
                let id = self.ids.next_id();
                self.outstanding.insert(id);
                trace!(id, outstanding = self.outstanding.len(), "Sending heartbeat");
                IdleAction::SendHeartbeat(ProtocolRequest {
                    id,
                    sender: self.sender.clone(),
                    subject: HEARTBEAT_SUBJECT.to_string(),
                    payload: Vec::new(),
                })
            }
            IdleState::ReaderIdle if self.outstanding.is_empty() => IdleAction::Nothing,
            IdleState::ReaderIdle => {
                debug!(
                    outstanding = self.outstanding.len(),
                    "No reply to heartbeats within timeout"
                );
                IdleAction::Close
            }
        }
    }

    fn on_reply(&mut self, reply: &ProtocolReply) -> InboundAction {
        let is_heartbeat = self.outstanding.contains(&reply.id);
        // Any reply proves the channel is alive, so older heartbeats are settled too.
        self.outstanding = self.outstanding.split_off(&(reply.id.saturating_add(1)));

        if !is_heartbeat {
            return InboundAction::deliver();
        }
        if !reply.payload.is_empty() {
            warn!(
                id = reply.id,
                len = reply.payload.len(),
                "Heartbeat reply carries an unexpected payload"
            );
        }
        InboundAction {
            reply: None,
            forward: self.forward_heartbeats,
        }
    }
}

/// Heartbeat state of the accepting side.
#[derive(Debug)]
pub struct ServerHeartbeat {
    heartbeat_seen: bool,
    forward_heartbeats: bool,
}

impl ServerHeartbeat {
    /// Whether the peer has sent at least one heartbeat.
    pub fn heartbeat_seen(&self) -> bool {
        self.heartbeat_seen
    }

    fn on_idle(&mut self, state: IdleState) -> IdleAction {
        match state {
            IdleState::ReaderIdle if self.heartbeat_seen => {
                debug!("No heartbeat from peer within timeout");
                IdleAction::Close
            }
            _ => IdleAction::Nothing,
        }
    }

    fn on_request(&mut self, request: &ProtocolRequest) -> InboundAction {
        if request.subject != HEARTBEAT_SUBJECT {
            return InboundAction::deliver();
        }
        self.heartbeat_seen = true;
        if !request.payload.is_empty() {
            warn!(
                id = request.id,
                sender = %request.sender,
                len = request.payload.len(),
                "Heartbeat request carries an unexpected payload"
            );
        }
        trace!(id = request.id, sender = %request.sender, "Answering heartbeat");
        InboundAction {
            reply: Some(ProtocolReply::ok(request.id, Vec::new())),
            forward: self.forward_heartbeats,
        }
    }
}

/// Heartbeat role of one connection.
#[derive(Debug)]
pub enum HeartbeatHandler {
    Client(ClientHeartbeat),
    Server(ServerHeartbeat),
}

impl HeartbeatHandler {
    /// Handler for an outbound connection.
    pub fn client(
        config: &HeartbeatConfig,
        sender: MemberId,
        ids: std::sync::Arc<MessageIdGenerator>,
    ) -> Self {
        Self::Client(ClientHeartbeat {
            sender,
            ids,
            outstanding: BTreeSet::new(),
            forward_heartbeats: config.forward_heartbeats,
        })
    }

    /// Handler for an inbound connection.
    pub fn server(config: &HeartbeatConfig) -> Self {
        Self::Server(ServerHeartbeat {
            heartbeat_seen: false,
            forward_heartbeats: config.forward_heartbeats,
        })
    }

    /// The idle timer matching this role.
    pub fn idle_timer(&self, config: &HeartbeatConfig) -> IdleTimer {
        match self {
            Self::Client(_) => IdleTimer::new(Some(config.timeout), Some(config.interval)),
            Self::Server(_) => IdleTimer::new(Some(config.timeout), None),
        }
    }

    pub fn on_idle(&mut self, state: IdleState) -> IdleAction {
        match self {
            Self::Client(client) => client.on_idle(state),
            Self::Server(server) => server.on_idle(state),
        }
    }

    pub fn on_request(&mut self, request: &ProtocolRequest) -> InboundAction {
        match self {
            Self::Client(_) => InboundAction::deliver(),
            Self::Server(server) => server.on_request(request),
        }
    }

    pub fn on_reply(&mut self, reply: &ProtocolReply) -> InboundAction {
        match self {
            Self::Client(client) => client.on_reply(reply),
            Self::Server(_) => InboundAction::deliver(),
        }
    }
}
