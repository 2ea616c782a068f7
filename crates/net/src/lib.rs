//! Peer Coordination Network Library
//!
//! TCP relay and the [`Transport`](peercoord_core::Transport)
//! implementation that talks to it.
//!
//! # Architecture
//!
//! - **Relay**: routes opaque messages between the peers of each room
//! - **TcpTransport**: one relay connection per joined room
//! - **Protocol**: Length-prefixed JSON messages
//!
//! # Usage
//!
//! ```ignore
//! let relay = RelayServer::start(DEFAULT_PORT).await?;
//!
//! let transport = Arc::new(TcpTransport::new(relay.addr()));
//! let coordinator = Coordinator::new(transport, media, probe, EngineConfig::default());
//! coordinator.join(Room::new("r1", "Standup", "secret")).await?;
//! ```

pub mod client;
pub mod error;
mod frame;
pub mod protocol;
pub mod server;

pub use client::TcpTransport;
pub use error::{Error, Result};
pub use protocol::RelayMessage;
pub use server::RelayServer;

/// Default port for the relay
pub const DEFAULT_PORT: u16 = 7331;
