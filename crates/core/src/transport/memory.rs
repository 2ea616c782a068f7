//! In-process transport
//!
//! A [`MemoryNetwork`] is a shared hub; each simulated peer gets its own
//! [`MemoryTransport`] endpoint with a fixed peer ID. Delivery is
//! immediate and ordered. The hub keeps a log of every message it routed
//! so tests can assert on wire order.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::debug;

use super::{SessionHandle, Transport, TransportEvent, TransportSession};
use crate::error::{Error, Result};
use crate::models::{PeerId, Room};

/// A message routed by the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRecord {
    pub room_id: String,
    pub from: PeerId,
    /// `None` for broadcasts
    pub to: Option<PeerId>,
    pub kind: String,
    pub payload: Vec<u8>,
}

struct Member {
    key: u64,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

struct HubRoom {
    token: String,
    members: BTreeMap<PeerId, Member>,
}

#[derive(Default)]
struct Hub {
    rooms: HashMap<String, HubRoom>,
    log: Vec<WireRecord>,
    next_key: u64,
    fail_sends: bool,
}

impl Hub {
    fn member(&self, session: &SessionHandle) -> Result<&HubRoom> {
        let room = self
            .rooms
            .get(session.room_id())
            .ok_or_else(|| Error::Transport("Session not active".into()))?;
        match room.members.get(session.local_peer_id()) {
            Some(m) if m.key == session.key() => Ok(room),
            _ => Err(Error::Transport("Session not active".into())),
        }
    }

    fn remove(&mut self, room_id: &str, peer: &PeerId) -> bool {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return false;
        };
        if room.members.remove(peer).is_none() {
            return false;
        }
        for member in room.members.values() {
            let _ = member.tx.send(TransportEvent::NodeUnavailable(peer.clone()));
        }
        if room.members.is_empty() {
            self.rooms.remove(room_id);
        }
        true
    }
}

/// Shared in-memory hub
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an endpoint that joins rooms as `peer_id`
    pub fn endpoint(&self, peer_id: impl Into<PeerId>) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            peer_id: peer_id.into(),
        }
    }

    /// Every message routed so far, in send order
    pub fn wire_log(&self) -> Vec<WireRecord> {
        self.hub().log.clone()
    }

    /// Make every subsequent send fail with a transport error
    pub fn fail_sends(&self, fail: bool) {
        self.hub().fail_sends = fail;
    }

    /// Drop a peer from a room without it leaving (simulated crash)
    pub fn disconnect(&self, room_id: &str, peer: &PeerId) -> bool {
        self.hub().remove(room_id, peer)
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One peer's view of a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    peer_id: PeerId,
}

impl MemoryTransport {
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    fn route(
        &self,
        session: &SessionHandle,
        to: Option<&PeerId>,
        kind: &str,
        payload: Vec<u8>,
    ) -> Result<()> {
        let mut hub = self.network.hub();
        if hub.fail_sends {
            return Err(Error::Transport("Send rejected".into()));
        }

        let room = hub.member(session)?;
        let from = session.local_peer_id().clone();
        let event = TransportEvent::Message {
            from: from.clone(),
            kind: kind.to_string(),
            payload: payload.clone(),
        };

        match to {
            Some(peer) => {
                let member = room
                    .members
                    .get(peer)
                    .ok_or_else(|| Error::Transport(format!("Unknown peer {}", peer)))?;
                let _ = member.tx.send(event);
            }
            None => {
                for (id, member) in &room.members {
                    if *id != from {
                        let _ = member.tx.send(event.clone());
                    }
                }
            }
        }

        hub.log.push(WireRecord {
            room_id: session.room_id().to_string(),
            from,
            to: to.cloned(),
            kind: kind.to_string(),
            payload,
        });
        Ok(())
    }
}

impl Transport for MemoryTransport {
    async fn join(&self, room: &Room) -> Result<TransportSession> {
        let mut hub = self.network.hub();
        hub.next_key += 1;
        let key = hub.next_key;

        let entry = hub.rooms.entry(room.id.clone()).or_insert_with(|| HubRoom {
            token: room.secret_token.clone(),
            members: BTreeMap::new(),
        });

        if entry.token != room.secret_token {
            return Err(Error::Transport("Invalid room token".into()));
        }
        if entry.members.contains_key(&self.peer_id) {
            return Err(Error::Transport(format!(
                "Peer {} already in room",
                self.peer_id
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for (id, member) in &entry.members {
            let _ = member
                .tx
                .send(TransportEvent::NodeAvailable(self.peer_id.clone()));
            let _ = tx.send(TransportEvent::NodeAvailable(id.clone()));
        }
        entry.members.insert(self.peer_id.clone(), Member { key, tx });

        debug!(room = %room.id, peer = %self.peer_id, "Joined memory room");

        Ok(TransportSession {
            handle: SessionHandle::new(room.id.clone(), self.peer_id.clone(), key),
            events: rx,
        })
    }

    async fn leave(&self, session: &SessionHandle) -> Result<()> {
        let mut hub = self.network.hub();
        hub.member(session)?;
        hub.remove(session.room_id(), session.local_peer_id());
        Ok(())
    }

    async fn broadcast(&self, session: &SessionHandle, kind: &str, payload: Vec<u8>) -> Result<()> {
        self.route(session, None, kind, payload)
    }

    async fn send(
        &self,
        session: &SessionHandle,
        peer: &PeerId,
        kind: &str,
        payload: Vec<u8>,
    ) -> Result<()> {
        self.route(session, Some(peer), kind, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> Room {
        Room::new("r1", "Room", "tok")
    }

    #[tokio::test]
    async fn test_arrivals_are_announced_both_ways() {
        let net = MemoryNetwork::new();
        let mut a = net.endpoint("A").join(&room()).await.unwrap();
        let mut b = net.endpoint("B").join(&room()).await.unwrap();

        assert_eq!(
            a.events.recv().await,
            Some(TransportEvent::NodeAvailable(PeerId::from("B")))
        );
        assert_eq!(
            b.events.recv().await,
            Some(TransportEvent::NodeAvailable(PeerId::from("A")))
        );
    }

    #[tokio::test]
    async fn test_wrong_token_rejected() {
        let net = MemoryNetwork::new();
        let _a = net.endpoint("A").join(&room()).await.unwrap();

        let intruder = Room::new("r1", "Room", "guess");
        assert!(matches!(
            net.endpoint("B").join(&intruder).await,
            Err(Error::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_unicast_and_broadcast_routing() {
        let net = MemoryNetwork::new();
        let ta = net.endpoint("A");
        let a = ta.join(&room()).await.unwrap();
        let mut b = net.endpoint("B").join(&room()).await.unwrap();
        let mut c = net.endpoint("C").join(&room()).await.unwrap();

        ta.send(&a.handle, &PeerId::from("B"), "PING", b"1".to_vec())
            .await
            .unwrap();
        ta.broadcast(&a.handle, "ALL", b"2".to_vec()).await.unwrap();

        // B: A available, C available, PING, ALL
        let mut b_kinds = Vec::new();
        for _ in 0..4 {
            if let Some(TransportEvent::Message { kind, .. }) = b.events.recv().await {
                b_kinds.push(kind);
            }
        }
        assert_eq!(b_kinds, vec!["PING".to_string(), "ALL".to_string()]);

        // C: A available, B available, ALL
        let mut c_kinds = Vec::new();
        for _ in 0..3 {
            if let Some(TransportEvent::Message { kind, .. }) = c.events.recv().await {
                c_kinds.push(kind);
            }
        }
        assert_eq!(c_kinds, vec!["ALL".to_string()]);

        let log = net.wire_log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].to, Some(PeerId::from("B")));
        assert_eq!(log[1].to, None);
    }

    #[tokio::test]
    async fn test_leave_notifies_remaining_peers() {
        let net = MemoryNetwork::new();
        let ta = net.endpoint("A");
        let a = ta.join(&room()).await.unwrap();
        let mut b = net.endpoint("B").join(&room()).await.unwrap();
        let _ = b.events.recv().await;

        ta.leave(&a.handle).await.unwrap();
        assert_eq!(
            b.events.recv().await,
            Some(TransportEvent::NodeUnavailable(PeerId::from("A")))
        );

        // The old handle is dead
        assert!(ta.broadcast(&a.handle, "X", Vec::new()).await.is_err());
    }
}
