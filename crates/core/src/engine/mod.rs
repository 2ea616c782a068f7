//! Coordination engine
//!
//! One [`Coordinator`] serves the application. Each joined room gets its
//! own task (see `room.rs`) that exclusively owns membership, scores,
//! election state and signaling sessions. The application only sees
//! read-only [`RoomSnapshot`]s and [`EngineEvent`]s.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::hosting::{ElectionPhase, ElectionState};
use crate::models::{PeerId, Room};
use crate::protocol::is_control_type;
use crate::scoring::CapabilityProbe;
use crate::signaling::{MediaStack, RemoteStream};
use crate::transport::Transport;

mod room;

use room::{RoomCommand, RoomExit, RoomLoop};

/// Conditions worth surfacing that do not stop the engine
#[derive(Debug, Clone, PartialEq)]
pub enum Warning {
    /// The host left with an empty score table; the room is hostless
    HostlessRoom,
    /// A peer's signaling session failed
    SignalingFailed {
        peer: PeerId,
        reason: String,
        retried: bool,
    },
    /// A fire-and-forget send was rejected by the transport
    TransportFailed { reason: String },
    /// The transport ended the session. The room is dropped and may be
    /// joined again.
    SessionLost,
}

/// Notifications delivered to the application
#[derive(Debug, Clone)]
pub enum EngineEvent {
    ActiveNodesChanged {
        room_id: String,
        peers: Vec<PeerId>,
    },
    HostChanged {
        room_id: String,
        host: Option<PeerId>,
        is_local: bool,
    },
    /// Application message from a peer
    Message {
        room_id: String,
        from: PeerId,
        kind: String,
        data: Vec<u8>,
        received_at: DateTime<Utc>,
    },
    RemoteStream {
        room_id: String,
        peer: PeerId,
        stream: RemoteStream,
    },
    RemoteStreamEnded {
        room_id: String,
        peer: PeerId,
    },
    Warning {
        room_id: String,
        warning: Warning,
    },
}

/// Read-only view of one room's coordination state
#[derive(Debug, Clone)]
pub struct RoomSnapshot {
    pub room: Room,
    pub local_peer_id: PeerId,
    pub phase: ElectionPhase,
    pub election: ElectionState,
    pub peers: Vec<PeerId>,
    pub local_score: Option<f64>,
    pub scores: BTreeMap<PeerId, f64>,
    pub remote_streams: BTreeMap<PeerId, RemoteStream>,
}

impl RoomSnapshot {
    pub fn is_host(&self) -> bool {
        self.phase == ElectionPhase::Host
    }
}

struct RoomHandle {
    cmd_tx: mpsc::Sender<RoomCommand>,
    snapshot_rx: watch::Receiver<RoomSnapshot>,
    task: JoinHandle<()>,
    session_key: u64,
}

type RoomMap = RwLock<HashMap<String, RoomHandle>>;

/// Engine entry point for the application
pub struct Coordinator<T: Transport> {
    transport: Arc<T>,
    media: Arc<dyn MediaStack>,
    probe: Arc<dyn CapabilityProbe>,
    config: EngineConfig,
    rooms: Arc<RoomMap>,
    events: broadcast::Sender<EngineEvent>,
}

impl<T: Transport> Coordinator<T> {
    pub fn new(
        transport: Arc<T>,
        media: Arc<dyn MediaStack>,
        probe: Arc<dyn CapabilityProbe>,
        config: EngineConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            transport,
            media,
            probe,
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Subscribe to engine events for every room
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Join a room and start its coordination loop
    pub async fn join(&self, room: Room) -> Result<RoomSnapshot> {
        if self.rooms.read().await.contains_key(&room.id) {
            return Err(Error::AlreadyJoined(room.id));
        }

        let session = self.transport.join(&room).await?;
        info!(
            room = %room.id,
            peer = %session.handle.local_peer_id(),
            "Joined room"
        );

        let session_key = session.handle.key();
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (room_loop, snapshot_rx) = RoomLoop::new(
            room.clone(),
            self.transport.clone(),
            session.handle,
            self.media.clone(),
            self.probe.clone(),
            self.config.clone(),
            self.events.clone(),
        );
        let snapshot = snapshot_rx.borrow().clone();

        // Held until the handle is in place, so a session lost right away
        // still finds it to remove
        let mut rooms = self.rooms.write().await;
        if rooms.contains_key(&room.id) {
            // Lost a race with a concurrent join of the same room
            drop(rooms);
            tokio::spawn(room_loop.run(session.events, cmd_rx));
            let (reply, _) = oneshot::channel();
            let _ = cmd_tx.send(RoomCommand::Leave { reply }).await;
            return Err(Error::AlreadyJoined(room.id));
        }

        let room_map = self.rooms.clone();
        let events = self.events.clone();
        let room_id = room.id.clone();
        let task = tokio::spawn(async move {
            if room_loop.run(session.events, cmd_rx).await == RoomExit::SessionLost {
                forget_lost_room(&room_map, &events, &room_id, session_key).await;
            }
        });
        rooms.insert(
            room.id.clone(),
            RoomHandle {
                cmd_tx,
                snapshot_rx,
                task,
                session_key,
            },
        );

        Ok(snapshot)
    }

    /// Leave a room, handing off the host role first if held
    ///
    /// The hand-off runs inside the room task, so it completes even if
    /// this future is dropped.
    pub async fn leave(&self, room_id: &str) -> Result<()> {
        let handle = self
            .rooms
            .write()
            .await
            .remove(room_id)
            .ok_or_else(|| Error::NotFound(format!("room {}", room_id)))?;

        let (reply, reply_rx) = oneshot::channel();
        if handle
            .cmd_tx
            .send(RoomCommand::Leave { reply })
            .await
            .is_err()
        {
            warn!(room = %room_id, "Room loop already stopped");
            return Err(Error::EngineStopped);
        }

        let result = reply_rx.await.map_err(|_| Error::EngineStopped)?;
        let _ = handle.task.await;
        info!(room = %room_id, "Left room");
        result
    }

    /// Broadcast an application message to the room
    pub async fn send_app_message(&self, room_id: &str, kind: &str, data: Vec<u8>) -> Result<()> {
        if is_control_type(kind) {
            return Err(Error::InvalidOperation(format!(
                "{} is reserved for the engine",
                kind
            )));
        }

        let cmd_tx = self.command_sender(room_id).await?;
        let (reply, reply_rx) = oneshot::channel();
        cmd_tx
            .send(RoomCommand::SendAppMessage {
                kind: kind.to_string(),
                data,
                reply,
            })
            .await
            .map_err(|_| Error::EngineStopped)?;
        reply_rx.await.map_err(|_| Error::EngineStopped)?
    }

    /// Current state of a joined room
    pub async fn snapshot(&self, room_id: &str) -> Option<RoomSnapshot> {
        let rooms = self.rooms.read().await;
        rooms.get(room_id).map(|h| h.snapshot_rx.borrow().clone())
    }

    /// Watch a joined room's state
    pub async fn watch(&self, room_id: &str) -> Option<watch::Receiver<RoomSnapshot>> {
        let rooms = self.rooms.read().await;
        rooms.get(room_id).map(|h| h.snapshot_rx.clone())
    }

    /// IDs of joined rooms
    pub async fn rooms(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn command_sender(&self, room_id: &str) -> Result<mpsc::Sender<RoomCommand>> {
        self.rooms
            .read()
            .await
            .get(room_id)
            .map(|h| h.cmd_tx.clone())
            .ok_or_else(|| Error::NotFound(format!("room {}", room_id)))
    }
}

/// Drop the handle of a room whose session the transport ended
///
/// The handle is only removed if it still belongs to that session; a
/// concurrent `leave` may already have taken it.
async fn forget_lost_room(
    rooms: &RoomMap,
    events: &broadcast::Sender<EngineEvent>,
    room_id: &str,
    session_key: u64,
) {
    let removed = {
        let mut rooms = rooms.write().await;
        match rooms.get(room_id) {
            Some(handle) if handle.session_key == session_key => rooms.remove(room_id).is_some(),
            _ => false,
        }
    };
    if !removed {
        return;
    }

    warn!(room = %room_id, "Session lost; room dropped");
    let _ = events.send(EngineEvent::Warning {
        room_id: room_id.to_string(),
        warning: Warning::SessionLost,
    });
}
