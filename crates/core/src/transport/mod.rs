//! Transport facade
//!
//! The engine never touches sockets. It talks to a [`Transport`], which
//! joins rooms, sends unicast and broadcast messages, and reports peer
//! arrivals, departures and inbound messages on a per-session channel.
//!
//! Implementations are expected to bound every operation with their own
//! timeout and to preserve per-peer send ordering.

use std::future::Future;

use tokio::sync::mpsc;

use crate::error::Result;
use crate::models::{PeerId, Room};

mod memory;

pub use memory::{MemoryNetwork, MemoryTransport, WireRecord};

/// Event delivered by the transport for one joined session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A peer became reachable
    NodeAvailable(PeerId),
    /// A peer is no longer reachable
    NodeUnavailable(PeerId),
    /// A message arrived from a peer
    Message {
        from: PeerId,
        kind: String,
        payload: Vec<u8>,
    },
}

/// Handle identifying one joined session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    room_id: String,
    local_peer_id: PeerId,
    key: u64,
}

impl SessionHandle {
    pub fn new(room_id: impl Into<String>, local_peer_id: PeerId, key: u64) -> Self {
        Self {
            room_id: room_id.into(),
            local_peer_id,
            key,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// The ID the transport assigned to this side of the session
    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    /// Transport-private session key
    pub fn key(&self) -> u64 {
        self.key
    }
}

/// A joined session and its event stream
#[derive(Debug)]
pub struct TransportSession {
    pub handle: SessionHandle,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Room transport capability
pub trait Transport: Send + Sync + 'static {
    /// Join a room, authenticating with its secret token
    fn join(&self, room: &Room) -> impl Future<Output = Result<TransportSession>> + Send;

    /// Release a session
    fn leave(&self, session: &SessionHandle) -> impl Future<Output = Result<()>> + Send;

    /// Send to every other peer in the room
    fn broadcast(
        &self,
        session: &SessionHandle,
        kind: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Send to one peer
    fn send(
        &self,
        session: &SessionHandle,
        peer: &PeerId,
        kind: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<()>> + Send;
}
