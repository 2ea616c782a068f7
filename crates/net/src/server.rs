//! TCP relay for peer coordination rooms
//!
//! Clients connect, join one room per connection and exchange opaque
//! messages with the other members. The relay announces arrivals and
//! departures and never inspects payloads.
//!
//! Nothing waits on a client's queue while the room state is locked. A
//! client whose queue is full is disconnected.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use peercoord_core::PeerId;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, Notify, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::protocol::RelayMessage;

/// Maximum number of peers per room
pub const MAX_PEERS: usize = 32;

/// Outbound queue depth per connection
const PEER_QUEUE: usize = 256;

/// Bound on writing one frame to a client
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

struct Peer {
    tx: mpsc::Sender<RelayMessage>,
    /// Signalled when the client falls too far behind
    kick: Arc<Notify>,
}

/// A registered client connection
struct Membership {
    room_id: String,
    peer_id: PeerId,
    rx: mpsc::Receiver<RelayMessage>,
    kick: Arc<Notify>,
}

struct RelayRoom {
    token: String,
    peers: HashMap<PeerId, Peer>,
}

/// Relay state shared across tasks
#[derive(Default)]
struct RelayState {
    rooms: HashMap<String, RelayRoom>,
}

/// Relay server handle
pub struct RelayServer {
    addr: SocketAddr,
    state: Arc<RwLock<RelayState>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer {
    /// Start a relay on all interfaces
    pub async fn start(port: u16) -> Result<Self> {
        Self::bind(SocketAddr::from(([0, 0, 0, 0], port))).await
    }

    /// Start a relay on a specific address
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let bound_addr = listener.local_addr()?;

        info!(addr = %bound_addr, "Relay started");

        let (shutdown_tx, _) = broadcast::channel(1);
        let state = Arc::new(RwLock::new(RelayState::default()));

        tokio::spawn(accept_loop(listener, state.clone(), shutdown_tx.clone()));

        Ok(RelayServer {
            addr: bound_addr,
            state,
            shutdown_tx,
        })
    }

    /// Get the relay's bound address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of rooms with at least one peer
    pub async fn room_count(&self) -> usize {
        self.state.read().await.rooms.len()
    }

    /// Peers currently in a room
    pub async fn peers(&self, room_id: &str) -> Vec<PeerId> {
        let state = self.state.read().await;
        let mut peers: Vec<PeerId> = state
            .rooms
            .get(room_id)
            .map(|room| room.peers.keys().cloned().collect())
            .unwrap_or_default();
        peers.sort();
        peers
    }

    /// Stop accepting and close every connection
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        info!("Relay shutdown initiated");
    }
}

/// Accept incoming connections
async fn accept_loop(
    listener: TcpListener,
    state: Arc<RwLock<RelayState>>,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!(addr = %addr, "New connection");
                        tokio::spawn(handle_connection(
                            stream,
                            addr,
                            state.clone(),
                            shutdown_tx.subscribe(),
                        ));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Accept loop shutting down");
                break;
            }
        }
    }
}

/// Serve one client connection for the lifetime of its room session
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<RwLock<RelayState>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let (mut reader, mut writer) = tokio::io::split(stream);

    let Membership {
        room_id,
        peer_id,
        rx: msg_rx,
        kick,
    } = match handle_join(&mut reader, &state).await {
        Ok(joined) => joined,
        Err(e) => {
            warn!(addr = %addr, error = %e, "Join failed");
            let reason = match e {
                Error::Rejected(reason) => reason,
                other => other.to_string(),
            };
            let _ = write_frame(&mut writer, &RelayMessage::JoinRejected { reason }).await;
            return;
        }
    };

    info!(addr = %addr, room = %room_id, peer = %peer_id, "Peer joined");

    let writer_handle = tokio::spawn(writer_task(writer, msg_rx));

    loop {
        tokio::select! {
            result = read_frame(&mut reader) => match result {
                Ok(RelayMessage::Leave) => {
                    debug!(peer = %peer_id, "Leave requested");
                    break;
                }
                Ok(msg) => handle_message(msg, &room_id, &peer_id, &state).await,
                Err(Error::ConnectionClosed) => {
                    debug!(peer = %peer_id, "Connection closed");
                    break;
                }
                Err(e) => {
                    warn!(peer = %peer_id, error = %e, "Read error");
                    break;
                }
            },
            _ = kick.notified() => {
                warn!(room = %room_id, peer = %peer_id, "Peer queue full; disconnecting");
                break;
            }
            _ = shutdown_rx.recv() => {
                debug!(peer = %peer_id, "Closing connection for shutdown");
                break;
            }
        }
    }

    // Dropping the room entry closes the writer queue once it drains
    remove_peer(&state, &room_id, &peer_id).await;
    let _ = writer_handle.await;

    info!(room = %room_id, peer = %peer_id, "Peer disconnected");
}

/// Validate the join request and register the peer
///
/// The newcomer's queue receives `Joined` before anything else, and the
/// existing members learn about it while the room is still locked.
async fn handle_join(
    reader: &mut ReadHalf<TcpStream>,
    state: &Arc<RwLock<RelayState>>,
) -> Result<Membership> {
    let (room_id, token) = match read_frame(reader).await? {
        RelayMessage::Join { room_id, token } => (room_id, token),
        _ => return Err(Error::Protocol("Expected Join".into())),
    };

    let mut s = state.write().await;
    let room = s
        .rooms
        .entry(room_id.clone())
        .or_insert_with(|| RelayRoom {
            token: token.clone(),
            peers: HashMap::new(),
        });

    if room.token != token {
        return Err(Error::Rejected("Invalid token".into()));
    }
    if room.peers.len() >= MAX_PEERS {
        return Err(Error::RoomFull);
    }

    let peer_id = PeerId::new(Uuid::new_v4().to_string());
    let mut existing: Vec<PeerId> = room.peers.keys().cloned().collect();
    existing.sort();

    let (tx, rx) = mpsc::channel(PEER_QUEUE);
    tx.try_send(RelayMessage::Joined {
        peer_id: peer_id.clone(),
        peers: existing,
    })
    .map_err(|_| Error::ConnectionClosed)?;

    for (id, peer) in &room.peers {
        enqueue(
            id,
            peer,
            RelayMessage::NodeAvailable {
                peer_id: peer_id.clone(),
            },
        );
    }
    let kick = Arc::new(Notify::new());
    room.peers.insert(
        peer_id.clone(),
        Peer {
            tx,
            kick: kick.clone(),
        },
    );

    Ok(Membership {
        room_id,
        peer_id,
        rx,
        kick,
    })
}

/// Queue a message for a client without waiting
///
/// A full queue means the client stopped keeping up; it is told to
/// disconnect and the message is dropped.
fn enqueue(id: &PeerId, peer: &Peer, msg: RelayMessage) {
    match peer.tx.try_send(msg) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => peer.kick.notify_one(),
        Err(TrySendError::Closed(_)) => debug!(peer = %id, "Peer queue closed"),
    }
}

/// Writer task - sends queued messages to the client
async fn writer_task(mut writer: WriteHalf<TcpStream>, mut rx: mpsc::Receiver<RelayMessage>) {
    while let Some(msg) = rx.recv().await {
        match timeout(WRITE_TIMEOUT, write_frame(&mut writer, &msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "Write failed");
                break;
            }
            Err(_) => {
                debug!("Client stopped reading");
                break;
            }
        }
    }
}

/// Forward a client message to the rest of its room
async fn handle_message(
    msg: RelayMessage,
    room_id: &str,
    sender: &PeerId,
    state: &Arc<RwLock<RelayState>>,
) {
    let s = state.read().await;
    let Some(room) = s.rooms.get(room_id) else {
        return;
    };

    match msg {
        RelayMessage::Broadcast { kind, payload } => {
            debug!(room = %room_id, from = %sender, kind = %kind, "Broadcast");
            let deliver = RelayMessage::Deliver {
                from: sender.clone(),
                kind,
                payload,
            };
            for (id, peer) in &room.peers {
                if id != sender {
                    enqueue(id, peer, deliver.clone());
                }
            }
        }
        RelayMessage::Unicast { to, kind, payload } => {
            debug!(room = %room_id, from = %sender, to = %to, kind = %kind, "Unicast");
            match room.peers.get(&to) {
                Some(peer) => {
                    let deliver = RelayMessage::Deliver {
                        from: sender.clone(),
                        kind,
                        payload,
                    };
                    enqueue(&to, peer, deliver);
                }
                None => debug!(room = %room_id, to = %to, "Unicast to unknown peer dropped"),
            }
        }
        _ => {
            debug!(peer = %sender, "Ignoring unexpected message type");
        }
    }
}

/// Remove a peer and announce the departure
async fn remove_peer(state: &Arc<RwLock<RelayState>>, room_id: &str, peer_id: &PeerId) {
    let mut s = state.write().await;
    let Some(room) = s.rooms.get_mut(room_id) else {
        return;
    };
    room.peers.remove(peer_id);

    for (id, peer) in &room.peers {
        enqueue(
            id,
            peer,
            RelayMessage::NodeUnavailable {
                peer_id: peer_id.clone(),
            },
        );
    }

    if room.peers.is_empty() {
        s.rooms.remove(room_id);
        debug!(room = %room_id, "Room closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn raw_join(addr: SocketAddr, room_id: &str, token: &str) -> (TcpStream, RelayMessage) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_frame(
            &mut stream,
            &RelayMessage::Join {
                room_id: room_id.into(),
                token: token.into(),
            },
        )
        .await
        .unwrap();
        let reply = read_frame(&mut stream).await.unwrap();
        (stream, reply)
    }

    #[tokio::test]
    async fn test_relay_start() {
        let relay = RelayServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert!(relay.addr().port() > 0);
        assert_eq!(relay.room_count().await, 0);
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_join_lists_existing_peers() {
        let relay = RelayServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let (mut first, reply) = raw_join(relay.addr(), "r1", "tok").await;
        let RelayMessage::Joined { peer_id: a, peers } = reply else {
            panic!("expected Joined, got {:?}", reply);
        };
        assert!(peers.is_empty());

        let (_second, reply) = raw_join(relay.addr(), "r1", "tok").await;
        let RelayMessage::Joined { peer_id: b, peers } = reply else {
            panic!("expected Joined, got {:?}", reply);
        };
        assert_eq!(peers, vec![a.clone()]);

        assert_eq!(
            read_frame(&mut first).await.unwrap(),
            RelayMessage::NodeAvailable { peer_id: b }
        );
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_wrong_token_rejected() {
        let relay = RelayServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let (_first, _) = raw_join(relay.addr(), "r1", "tok").await;

        let (_intruder, reply) = raw_join(relay.addr(), "r1", "guess").await;
        assert!(matches!(reply, RelayMessage::JoinRejected { .. }));
        assert_eq!(relay.peers("r1").await.len(), 1);
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_room_closes_when_last_peer_leaves() {
        let relay = RelayServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let (mut stream, _) = raw_join(relay.addr(), "r1", "tok").await;
        assert_eq!(relay.room_count().await, 1);

        write_frame(&mut stream, &RelayMessage::Leave).await.unwrap();
        assert!(matches!(
            read_frame(&mut stream).await,
            Err(Error::ConnectionClosed)
        ));
        assert_eq!(relay.room_count().await, 0);

        // A fresh room accepts a new token
        let (_stream, reply) = raw_join(relay.addr(), "r1", "other").await;
        assert!(matches!(reply, RelayMessage::Joined { .. }));
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_stalled_peer_is_dropped_without_blocking_others() {
        let relay = RelayServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        // Never read from again
        let (_stalled, _) = raw_join(relay.addr(), "r1", "tok").await;
        let (mut sender, _) = raw_join(relay.addr(), "r1", "tok").await;
        assert_eq!(relay.peers("r1").await.len(), 2);

        let flood = RelayMessage::Broadcast {
            kind: "CHAT".into(),
            payload: vec![1u8; 64 * 1024],
        };
        timeout(Duration::from_secs(30), async {
            while relay.peers("r1").await.len() == 2 {
                for _ in 0..32 {
                    write_frame(&mut sender, &flood).await.unwrap();
                }
            }
        })
        .await
        .expect("stalled peer was never dropped");

        let (_late, reply) = timeout(Duration::from_secs(5), raw_join(relay.addr(), "r1", "tok"))
            .await
            .expect("join blocked behind the stalled peer");
        let RelayMessage::Joined { peers, .. } = reply else {
            panic!("expected Joined, got {:?}", reply);
        };
        assert_eq!(peers.len(), 1);
        relay.shutdown();
    }
}
