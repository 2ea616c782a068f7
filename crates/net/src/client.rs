//! Relay-backed transport
//!
//! Each joined room is its own TCP connection to the relay. A reader task
//! turns relay frames into [`TransportEvent`]s; a writer task drains the
//! outbound queue so sends never block the room loop on the socket. A send
//! that cannot be queued within the I/O timeout fails with
//! [`Error::Timeout`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use peercoord_core::{PeerId, Room, SessionHandle, Transport, TransportEvent, TransportSession};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::protocol::RelayMessage;

/// Default bound on connecting, the handshake and queueing a send
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Default outbound queue depth per room connection
pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;

struct Connection {
    tx: mpsc::Sender<RelayMessage>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

/// [`Transport`] that talks to a [`RelayServer`](crate::RelayServer)
pub struct TcpTransport {
    relay_addr: SocketAddr,
    io_timeout: Duration,
    queue_depth: usize,
    next_key: AtomicU64,
    connections: RwLock<HashMap<u64, Connection>>,
}

impl TcpTransport {
    pub fn new(relay_addr: SocketAddr) -> Self {
        Self::with_timeout(relay_addr, DEFAULT_IO_TIMEOUT)
    }

    pub fn with_timeout(relay_addr: SocketAddr, io_timeout: Duration) -> Self {
        Self {
            relay_addr,
            io_timeout,
            queue_depth: DEFAULT_OUTBOUND_QUEUE,
            next_key: AtomicU64::new(1),
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Outbound messages buffered per room before sends start waiting
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    pub fn relay_addr(&self) -> SocketAddr {
        self.relay_addr
    }

    /// Number of room connections still held
    pub async fn open_sessions(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Run `fut` under the I/O timeout
    async fn bounded<F, T>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        timeout(self.io_timeout, fut)
            .await
            .map_err(|_| Error::Timeout(self.io_timeout))?
    }

    async fn connect(&self, room: &Room) -> Result<TransportSession> {
        info!(addr = %self.relay_addr, room = %room.id, "Connecting to relay");

        let stream = self
            .bounded(async { TcpStream::connect(self.relay_addr).await.map_err(Error::from) })
            .await?;
        let (mut reader, mut writer) = tokio::io::split(stream);

        let join = RelayMessage::Join {
            room_id: room.id.clone(),
            token: room.secret_token.clone(),
        };
        self.bounded(write_frame(&mut writer, &join)).await?;
        let reply = self.bounded(read_frame(&mut reader)).await?;
        let (peer_id, peers) = match reply {
            RelayMessage::Joined { peer_id, peers } => (peer_id, peers),
            RelayMessage::JoinRejected { reason } => {
                warn!(room = %room.id, reason = %reason, "Join rejected");
                return Err(Error::Rejected(reason));
            }
            other => {
                return Err(Error::Protocol(format!(
                    "Expected Joined, got {:?}",
                    other
                )))
            }
        };

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        for peer in peers {
            let _ = event_tx.send(TransportEvent::NodeAvailable(peer));
        }

        let (tx, rx) = mpsc::channel(self.queue_depth);
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let connection = Connection {
            tx,
            writer: tokio::spawn(writer_task(writer, rx, self.io_timeout)),
            reader: tokio::spawn(reader_task(reader, event_tx, peer_id.clone())),
        };
        self.connections.write().await.insert(key, connection);

        info!(room = %room.id, peer = %peer_id, "Joined relay room");

        Ok(TransportSession {
            handle: SessionHandle::new(room.id.clone(), peer_id, key),
            events: event_rx,
        })
    }

    async fn enqueue(&self, session: &SessionHandle, msg: RelayMessage) -> Result<()> {
        let tx = self
            .connections
            .read()
            .await
            .get(&session.key())
            .map(|c| c.tx.clone())
            .ok_or(Error::NotConnected)?;
        self.bounded(async { tx.send(msg).await.map_err(|_| Error::NotConnected) })
            .await
    }

    async fn disconnect(&self, session: &SessionHandle) -> Result<()> {
        let connection = self
            .connections
            .write()
            .await
            .remove(&session.key())
            .ok_or(Error::NotConnected)?;

        let Connection {
            tx,
            mut writer,
            reader,
        } = connection;
        let queued = self
            .bounded(async { tx.send(RelayMessage::Leave).await.map_err(|_| Error::NotConnected) })
            .await;
        drop(tx);

        // The writer exits after flushing Leave
        let flushed = timeout(self.io_timeout, &mut writer).await;
        reader.abort();
        if flushed.is_err() {
            writer.abort();
        }

        queued?;
        if flushed.is_err() {
            return Err(Error::Timeout(self.io_timeout));
        }
        debug!(room = %session.room_id(), "Relay connection closed");
        Ok(())
    }
}

impl Transport for TcpTransport {
    async fn join(&self, room: &Room) -> peercoord_core::Result<TransportSession> {
        Ok(self.connect(room).await?)
    }

    async fn leave(&self, session: &SessionHandle) -> peercoord_core::Result<()> {
        Ok(self.disconnect(session).await?)
    }

    async fn broadcast(
        &self,
        session: &SessionHandle,
        kind: &str,
        payload: Vec<u8>,
    ) -> peercoord_core::Result<()> {
        let msg = RelayMessage::Broadcast {
            kind: kind.to_string(),
            payload,
        };
        Ok(self.enqueue(session, msg).await?)
    }

    async fn send(
        &self,
        session: &SessionHandle,
        peer: &PeerId,
        kind: &str,
        payload: Vec<u8>,
    ) -> peercoord_core::Result<()> {
        let msg = RelayMessage::Unicast {
            to: peer.clone(),
            kind: kind.to_string(),
            payload,
        };
        Ok(self.enqueue(session, msg).await?)
    }
}

/// Writer task - sends queued messages to the relay, stopping after `Leave`
///
/// A frame the relay does not take within `io_timeout` ends the task, after
/// which sends fail with [`Error::NotConnected`].
async fn writer_task(
    mut writer: WriteHalf<TcpStream>,
    mut rx: mpsc::Receiver<RelayMessage>,
    io_timeout: Duration,
) {
    while let Some(msg) = rx.recv().await {
        let leaving = matches!(msg, RelayMessage::Leave);
        match timeout(io_timeout, write_frame(&mut writer, &msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "Write error");
                break;
            }
            Err(_) => {
                warn!(timeout = ?io_timeout, "Relay stopped reading; closing writer");
                break;
            }
        }
        if leaving {
            break;
        }
    }
}

/// Reader task - turns relay frames into transport events
///
/// Dropping `event_tx` on exit tells the room loop the session is gone.
async fn reader_task(
    mut reader: ReadHalf<TcpStream>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    local: PeerId,
) {
    loop {
        let event = match read_frame(&mut reader).await {
            Ok(RelayMessage::Deliver {
                from,
                kind,
                payload,
            }) => TransportEvent::Message {
                from,
                kind,
                payload,
            },
            Ok(RelayMessage::NodeAvailable { peer_id }) => TransportEvent::NodeAvailable(peer_id),
            Ok(RelayMessage::NodeUnavailable { peer_id }) => {
                TransportEvent::NodeUnavailable(peer_id)
            }
            Ok(other) => {
                debug!(peer = %local, msg = ?other, "Ignoring unexpected relay message");
                continue;
            }
            Err(Error::ConnectionClosed) => {
                debug!(peer = %local, "Relay closed connection");
                break;
            }
            Err(e) => {
                warn!(peer = %local, error = %e, "Read error");
                break;
            }
        };

        if event_tx.send(event).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::RelayServer;
    use tokio::net::TcpListener;

    async fn relay() -> RelayServer {
        RelayServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap()
    }

    fn room() -> Room {
        Room::new("r1", "Standup", "tok")
    }

    /// Accepts one join, answers it, then never reads again
    async fn stalled_relay() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _join = read_frame(&mut stream).await.unwrap();
            let joined = RelayMessage::Joined {
                peer_id: PeerId::from("a"),
                peers: Vec::new(),
            };
            write_frame(&mut stream, &joined).await.unwrap();
            std::future::pending::<()>().await;
        });
        addr
    }

    async fn next_event(session: &mut TransportSession) -> TransportEvent {
        timeout(Duration::from_secs(5), session.events.recv())
            .await
            .expect("timed out")
            .expect("session closed")
    }

    #[tokio::test]
    async fn test_two_peers_exchange_messages() {
        let relay = relay().await;
        let transport = TcpTransport::new(relay.addr());

        let mut a = transport.join(&room()).await.unwrap();
        let mut b = transport.join(&room()).await.unwrap();
        let a_id = a.handle.local_peer_id().clone();
        let b_id = b.handle.local_peer_id().clone();
        assert_ne!(a_id, b_id);

        assert_eq!(next_event(&mut a).await, TransportEvent::NodeAvailable(b_id.clone()));
        assert_eq!(next_event(&mut b).await, TransportEvent::NodeAvailable(a_id.clone()));

        transport
            .broadcast(&a.handle, "CHAT", b"hello".to_vec())
            .await
            .unwrap();
        transport
            .send(&b.handle, &a_id, "WEBRTC_SIGNAL", vec![0, 255])
            .await
            .unwrap();

        assert_eq!(
            next_event(&mut b).await,
            TransportEvent::Message {
                from: a_id.clone(),
                kind: "CHAT".into(),
                payload: b"hello".to_vec(),
            }
        );
        assert_eq!(
            next_event(&mut a).await,
            TransportEvent::Message {
                from: b_id.clone(),
                kind: "WEBRTC_SIGNAL".into(),
                payload: vec![0, 255],
            }
        );

        relay.shutdown();
    }

    #[tokio::test]
    async fn test_messages_before_leave_arrive_before_departure() {
        let relay = relay().await;
        let transport = TcpTransport::new(relay.addr());

        let a = transport.join(&room()).await.unwrap();
        let mut b = transport.join(&room()).await.unwrap();
        let a_id = a.handle.local_peer_id().clone();
        assert_eq!(next_event(&mut b).await, TransportEvent::NodeAvailable(a_id.clone()));

        transport
            .broadcast(&a.handle, "NEXT_HOST_UPDATE", b"\"x\"".to_vec())
            .await
            .unwrap();
        transport
            .broadcast(&a.handle, "HOST_GOODBYE", Vec::new())
            .await
            .unwrap();
        transport.leave(&a.handle).await.unwrap();

        let kinds: Vec<String> = [next_event(&mut b).await, next_event(&mut b).await]
            .into_iter()
            .filter_map(|e| match e {
                TransportEvent::Message { kind, .. } => Some(kind),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec!["NEXT_HOST_UPDATE", "HOST_GOODBYE"]);
        assert_eq!(next_event(&mut b).await, TransportEvent::NodeUnavailable(a_id));

        // The old handle is dead
        assert!(transport
            .broadcast(&a.handle, "CHAT", Vec::new())
            .await
            .is_err());
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_wrong_token_is_transport_error() {
        let relay = relay().await;
        let transport = TcpTransport::new(relay.addr());
        let _a = transport.join(&room()).await.unwrap();

        let intruder = Room::new("r1", "Standup", "guess");
        let result = transport.join(&intruder).await;
        assert!(matches!(result, Err(peercoord_core::Error::Transport(_))));
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_relay_shutdown_closes_session() {
        let relay = relay().await;
        let transport = TcpTransport::new(relay.addr());
        let mut a = transport.join(&room()).await.unwrap();

        relay.shutdown();
        let closed = timeout(Duration::from_secs(5), a.events.recv())
            .await
            .expect("timed out");
        assert!(closed.is_none());

        // Releasing the dead session still drops the connection
        let _ = transport.leave(&a.handle).await;
        assert_eq!(transport.open_sessions().await, 0);
    }

    #[tokio::test]
    async fn test_sends_to_stalled_relay_fail_in_time() {
        let addr = stalled_relay().await;
        let transport =
            TcpTransport::with_timeout(addr, Duration::from_millis(200)).with_queue_depth(1);
        let a = transport.join(&room()).await.unwrap();

        let payload = vec![7u8; 512 * 1024];
        let failure = timeout(Duration::from_secs(30), async {
            for _ in 0..200 {
                if let Err(e) = transport.broadcast(&a.handle, "CHAT", payload.clone()).await {
                    return Some(e);
                }
            }
            None
        })
        .await
        .expect("send blocked past the I/O timeout");
        assert!(matches!(failure, Some(peercoord_core::Error::Transport(_))));

        timeout(Duration::from_secs(5), transport.leave(&a.handle))
            .await
            .expect("leave blocked past the I/O timeout")
            .ok();
        assert_eq!(transport.open_sessions().await, 0);
    }
}
