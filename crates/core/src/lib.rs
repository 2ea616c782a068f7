//! Peer Coordination Core
//!
//! Membership tracking, capability scoring, host election and signaling
//! relay for peers sharing a room, on top of an abstract transport.

pub mod config;
pub mod engine;
pub mod error;
pub mod hosting;
pub mod invariants;
pub mod membership;
pub mod models;
pub mod protocol;
pub mod scoring;
pub mod signaling;
pub mod transport;

pub use config::EngineConfig;
pub use engine::{Coordinator, EngineEvent, RoomSnapshot, Warning};
pub use error::{Error, Result};
pub use hosting::*;
pub use membership::MembershipTracker;
pub use models::*;
pub use protocol::{ControlMessage, RoomInfo};
pub use scoring::{CapabilityProbe, CapabilityScorer, FixedProbe, PeerScoreTable};
pub use signaling::{MediaSink, MediaStack, Negotiation, RemoteStream, SignalingRelay};
pub use transport::{
    MemoryNetwork, MemoryTransport, SessionHandle, Transport, TransportEvent, TransportSession,
};
