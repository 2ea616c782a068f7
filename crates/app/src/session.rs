//! Command implementations
//!
//! `relay` runs a room relay until Ctrl-C. `join` runs one coordinator in
//! one room, echoing engine events to stdout and sending stdin lines to
//! the room as `CHAT` messages.

use std::net::SocketAddr;
use std::sync::Arc;

use peercoord_core::{Coordinator, EngineEvent, Error, Result, Room, RoomSnapshot, Warning};
use peercoord_net::{RelayServer, TcpTransport};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::media::HandshakeMedia;
use crate::probe::SystemProbe;

/// Application message type for chat lines
pub const CHAT: &str = "CHAT";

pub struct JoinOptions {
    pub relay: String,
    pub room: Room,
}

pub async fn run_relay(port: u16) -> Result<()> {
    let relay = RelayServer::start(port).await?;
    println!("Relay listening on {}", relay.addr());

    tokio::signal::ctrl_c().await?;
    relay.shutdown();
    Ok(())
}

pub async fn run_join(config: &AppConfig, opts: JoinOptions) -> Result<()> {
    let addr = resolve(&opts.relay).await?;
    let transport = Arc::new(TcpTransport::with_timeout(addr, config.relay.io_timeout()));
    let coordinator = Coordinator::new(
        transport,
        Arc::new(HandshakeMedia),
        Arc::new(SystemProbe),
        config.engine.clone(),
    );

    let mut events = coordinator.subscribe();
    let room_id = opts.room.id.clone();
    let snapshot = coordinator.join(opts.room).await?;
    println!("{}", describe_join(&snapshot));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    if let Err(e) = coordinator
                        .send_app_message(&room_id, CHAT, line.into_bytes())
                        .await
                    {
                        warn!(error = %e, "Message not sent");
                    }
                }
                None => {
                    info!("Stdin closed");
                    break;
                }
            },
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(text) = describe_event(&event) {
                        println!("{}", text);
                    }
                    if is_session_lost(&event, &room_id) {
                        return Err(Error::Transport("Relay session lost".into()));
                    }
                }
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "Event stream lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    coordinator.leave(&room_id).await?;
    println!("Left room {}", room_id);
    Ok(())
}

async fn resolve(relay: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(relay)
        .await?
        .next()
        .ok_or_else(|| Error::Transport(format!("Could not resolve relay {}", relay)))
}

fn describe_join(snapshot: &RoomSnapshot) -> String {
    format!(
        "Joined {} ({}) as {}",
        snapshot.room.name, snapshot.room.id, snapshot.local_peer_id
    )
}

fn is_session_lost(event: &EngineEvent, room: &str) -> bool {
    matches!(
        event,
        EngineEvent::Warning {
            room_id,
            warning: Warning::SessionLost,
        } if room_id == room
    )
}

/// One line of terminal output for an engine event
pub fn describe_event(event: &EngineEvent) -> Option<String> {
    let text = match event {
        EngineEvent::ActiveNodesChanged { peers, .. } => {
            format!("* {} other peer(s) in the room", peers.len())
        }
        EngineEvent::HostChanged {
            host: Some(_),
            is_local: true,
            ..
        } => "* You are now the host".to_string(),
        EngineEvent::HostChanged {
            host: Some(host), ..
        } => format!("* Host is {}", host),
        EngineEvent::HostChanged { host: None, .. } => "* Host unknown".to_string(),
        EngineEvent::Message {
            from, kind, data, ..
        } if kind == CHAT => format!("<{}> {}", from, String::from_utf8_lossy(data)),
        EngineEvent::Message { from, kind, data, .. } => {
            format!("* {} sent {} ({} bytes)", from, kind, data.len())
        }
        EngineEvent::RemoteStream { peer, stream, .. } => {
            format!("* Stream {} from {}", stream.id, peer)
        }
        EngineEvent::RemoteStreamEnded { .. } => return None,
        EngineEvent::Warning { warning, .. } => match warning {
            Warning::HostlessRoom => "! Room left without a host".to_string(),
            Warning::SignalingFailed { peer, reason, .. } => {
                format!("! Signaling with {} failed: {}", peer, reason)
            }
            Warning::TransportFailed { reason } => format!("! Send failed: {}", reason),
            Warning::SessionLost => "! Connection to the relay lost".to_string(),
        },
    };
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use peercoord_core::{CapabilitySample, ElectionPhase, EngineConfig, FixedProbe, PeerId};
    use std::time::Duration;
    use tokio::sync::watch;
    use tokio::time::timeout;

    #[test]
    fn test_describe_chat() {
        let event = EngineEvent::Message {
            room_id: "r1".into(),
            from: PeerId::from("a"),
            kind: CHAT.into(),
            data: b"hi there".to_vec(),
            received_at: Utc::now(),
        };
        assert_eq!(describe_event(&event).unwrap(), "<a> hi there");
    }

    #[test]
    fn test_describe_host_change() {
        let local = EngineEvent::HostChanged {
            room_id: "r1".into(),
            host: Some(PeerId::from("me")),
            is_local: true,
        };
        assert_eq!(describe_event(&local).unwrap(), "* You are now the host");

        let unknown = EngineEvent::HostChanged {
            room_id: "r1".into(),
            host: None,
            is_local: false,
        };
        assert_eq!(describe_event(&unknown).unwrap(), "* Host unknown");
    }

    #[test]
    fn test_session_lost_matches_own_room() {
        let lost = EngineEvent::Warning {
            room_id: "r1".into(),
            warning: Warning::SessionLost,
        };
        assert!(is_session_lost(&lost, "r1"));
        assert!(!is_session_lost(&lost, "r2"));
        assert_eq!(describe_event(&lost).unwrap(), "! Connection to the relay lost");

        let hostless = EngineEvent::Warning {
            room_id: "r1".into(),
            warning: Warning::HostlessRoom,
        };
        assert!(!is_session_lost(&hostless, "r1"));
    }

    #[tokio::test]
    async fn test_relay_shutdown_drops_room() {
        let relay = RelayServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let peer = coordinator(relay.addr(), CapabilitySample::new(0.5, 0.5, 0.0, 0.0));
        let mut events = peer.subscribe();
        peer.join(Room::new("r1", "Standup", "tok")).await.unwrap();

        relay.shutdown();

        timeout(Duration::from_secs(10), async {
            loop {
                match events.recv().await {
                    Ok(event) if is_session_lost(&event, "r1") => break,
                    Ok(_) => {}
                    Err(e) => panic!("event stream failed: {}", e),
                }
            }
        })
        .await
        .expect("session loss not reported");
        assert!(peer.rooms().await.is_empty());
    }

    fn coordinator(relay: SocketAddr, sample: CapabilitySample) -> Coordinator<TcpTransport> {
        Coordinator::new(
            Arc::new(TcpTransport::new(relay)),
            Arc::new(HandshakeMedia),
            Arc::new(FixedProbe(sample)),
            EngineConfig {
                host_claim_grace_ms: 50,
                ..EngineConfig::default()
            },
        )
    }

    async fn wait_until<F>(rx: &mut watch::Receiver<RoomSnapshot>, predicate: F) -> RoomSnapshot
    where
        F: FnMut(&RoomSnapshot) -> bool,
    {
        timeout(Duration::from_secs(10), rx.wait_for(predicate))
            .await
            .expect("timed out waiting for room state")
            .expect("room loop stopped")
            .clone()
    }

    #[tokio::test]
    async fn test_peers_coordinate_over_relay() {
        let relay = RelayServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let room = Room::new("r1", "Standup", "tok");

        let first = coordinator(relay.addr(), CapabilitySample::new(0.1, 0.1, 0.0, 0.0));
        first.join(room.clone()).await.unwrap();
        let mut watch_first = first.watch("r1").await.unwrap();
        let host = wait_until(&mut watch_first, |s| s.is_host()).await;

        let second = coordinator(relay.addr(), CapabilitySample::new(1.0, 1.0, 0.0, 0.0));
        second.join(room).await.unwrap();
        let mut watch_second = second.watch("r1").await.unwrap();

        let follower = wait_until(&mut watch_second, |s| {
            s.phase == ElectionPhase::Follower && s.remote_streams.len() == 1
        })
        .await;
        assert_eq!(follower.election.current_host_id, Some(host.local_peer_id.clone()));

        wait_until(&mut watch_first, |s| {
            s.remote_streams.len() == 1 && s.scores.contains_key(&follower.local_peer_id)
        })
        .await;

        first.leave("r1").await.unwrap();
        let promoted =
            wait_until(&mut watch_second, |s| s.is_host() && s.peers.is_empty()).await;
        assert_eq!(promoted.election.next_host_id, None);

        second.leave("r1").await.unwrap();
        relay.shutdown();
    }
}
