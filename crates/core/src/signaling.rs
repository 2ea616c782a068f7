//! Signaling relay
//!
//! Owns one negotiation instance per remote peer and shuttles opaque
//! signaling blobs between it and the control channel. The media stack
//! reports back through a [`MediaSink`]; those reports are funnelled into
//! the room loop and turned into [`RelayEffect`]s here.
//!
//! Each instance carries a generation number. Reports from an instance that
//! has since been torn down are dropped.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::PeerId;

/// Handle to a negotiated remote media stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub id: String,
    pub label: String,
}

/// Local media negotiation factory
pub trait MediaStack: Send + Sync {
    /// Start negotiating with `peer`
    ///
    /// The initiator sends the first signaling payload through `sink`.
    fn negotiate(
        &self,
        peer: &PeerId,
        initiator: bool,
        sink: MediaSink,
    ) -> Result<Box<dyn Negotiation>>;
}

/// One active negotiation with a remote peer
pub trait Negotiation: Send + Sync {
    /// Feed a signaling payload received from the remote peer
    fn apply_signal(&mut self, payload: &[u8]) -> Result<()>;

    /// Stop negotiating and release any stream
    fn stop(&mut self);
}

/// Report emitted by a negotiation instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEventKind {
    /// Signaling payload to deliver to the remote peer
    Signal(Vec<u8>),
    /// Negotiation produced a stream
    Stream(RemoteStream),
    /// Negotiation failed
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaEvent {
    pub peer: PeerId,
    generation: u64,
    pub kind: MediaEventKind,
}

/// Channel a negotiation instance reports through
#[derive(Debug, Clone)]
pub struct MediaSink {
    peer: PeerId,
    generation: u64,
    tx: mpsc::UnboundedSender<MediaEvent>,
}

impl MediaSink {
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn signal(&self, payload: Vec<u8>) {
        self.emit(MediaEventKind::Signal(payload));
    }

    pub fn stream(&self, stream: RemoteStream) {
        self.emit(MediaEventKind::Stream(stream));
    }

    pub fn fail(&self, reason: impl Into<String>) {
        self.emit(MediaEventKind::Failed(reason.into()));
    }

    fn emit(&self, kind: MediaEventKind) {
        let _ = self.tx.send(MediaEvent {
            peer: self.peer.clone(),
            generation: self.generation,
            kind,
        });
    }
}

/// What the room loop must do after a relay call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEffect {
    /// Unicast a `WEBRTC_SIGNAL` to the peer
    Signal { peer: PeerId, payload: Vec<u8> },
    /// A stream became available
    StreamReady { peer: PeerId, stream: RemoteStream },
    /// A stream was stopped and discarded
    StreamEnded { peer: PeerId },
    /// Negotiation failed; `retried` tells whether a new session was started
    Failed {
        peer: PeerId,
        reason: String,
        retried: bool,
    },
}

struct SignalingSession {
    generation: u64,
    negotiation: Box<dyn Negotiation>,
    retries_left: u32,
}

/// Per-peer signaling session multiplexer
pub struct SignalingRelay {
    local_id: PeerId,
    media: Arc<dyn MediaStack>,
    retries: u32,
    sessions: HashMap<PeerId, SignalingSession>,
    streams: BTreeMap<PeerId, RemoteStream>,
    /// Peers whose retry budget is spent; cleared on arrival or departure
    exhausted: HashSet<PeerId>,
    next_generation: u64,
    tx: mpsc::UnboundedSender<MediaEvent>,
}

impl SignalingRelay {
    pub fn new(
        local_id: PeerId,
        media: Arc<dyn MediaStack>,
        retries: u32,
    ) -> (Self, mpsc::UnboundedReceiver<MediaEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let relay = Self {
            local_id,
            media,
            retries,
            sessions: HashMap::new(),
            streams: BTreeMap::new(),
            exhausted: HashSet::new(),
            next_generation: 0,
            tx,
        };
        (relay, rx)
    }

    /// Open a fresh session for an arriving peer, replacing any stale one
    pub fn open(&mut self, peer: &PeerId) -> Vec<RelayEffect> {
        let mut effects = self.teardown(peer);
        self.exhausted.remove(peer);
        effects.extend(self.start(peer, self.retries));
        effects
    }

    /// Stop and discard the peer's session and stream
    pub fn close(&mut self, peer: &PeerId) -> Vec<RelayEffect> {
        self.exhausted.remove(peer);
        self.teardown(peer)
    }

    /// Stop every session (engine shutdown)
    pub fn close_all(&mut self) -> Vec<RelayEffect> {
        let peers: Vec<PeerId> = self.sessions.keys().cloned().collect();
        let mut effects = Vec::new();
        for peer in peers {
            effects.extend(self.teardown(&peer));
        }
        self.exhausted.clear();
        effects
    }

    /// Feed an inbound `WEBRTC_SIGNAL` into the peer's session
    pub fn deliver(&mut self, peer: &PeerId, payload: &[u8]) -> Vec<RelayEffect> {
        if self.exhausted.contains(peer) {
            debug!(peer = %peer, "Dropping signal for peer with exhausted retries");
            return Vec::new();
        }

        // The signal can beat the arrival event
        let mut effects = Vec::new();
        if !self.sessions.contains_key(peer) {
            effects.extend(self.start(peer, self.retries));
        }

        let result = match self.sessions.get_mut(peer) {
            Some(session) => session.negotiation.apply_signal(payload),
            None => return effects,
        };

        if let Err(e) = result {
            effects.extend(self.fail(peer, e.to_string()));
        }
        effects
    }

    /// Turn a media report into effects
    pub fn on_media_event(&mut self, event: MediaEvent) -> Vec<RelayEffect> {
        let current = self.sessions.get(&event.peer).map(|s| s.generation);
        if current != Some(event.generation) {
            debug!(peer = %event.peer, "Dropping report from stale negotiation");
            return Vec::new();
        }

        match event.kind {
            MediaEventKind::Signal(payload) => vec![RelayEffect::Signal {
                peer: event.peer,
                payload,
            }],
            MediaEventKind::Stream(stream) => {
                self.streams.insert(event.peer.clone(), stream.clone());
                vec![RelayEffect::StreamReady {
                    peer: event.peer,
                    stream,
                }]
            }
            MediaEventKind::Failed(reason) => self.fail(&event.peer, reason),
        }
    }

    /// Peer-keyed map of negotiated streams
    pub fn remote_streams(&self) -> &BTreeMap<PeerId, RemoteStream> {
        &self.streams
    }

    pub fn has_session(&self, peer: &PeerId) -> bool {
        self.sessions.contains_key(peer)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Tear down a failed session and re-create it while budget remains
    fn fail(&mut self, peer: &PeerId, reason: String) -> Vec<RelayEffect> {
        let retries_left = self
            .sessions
            .get(peer)
            .map(|s| s.retries_left)
            .unwrap_or(0);
        warn!(peer = %peer, reason = %reason, retries_left, "Signaling failed");

        let mut effects = self.teardown(peer);
        let retried = retries_left > 0;
        effects.push(RelayEffect::Failed {
            peer: peer.clone(),
            reason,
            retried,
        });

        if retried {
            effects.extend(self.start(peer, retries_left - 1));
        } else {
            self.exhausted.insert(peer.clone());
        }
        effects
    }

    fn start(&mut self, peer: &PeerId, retries_left: u32) -> Vec<RelayEffect> {
        self.next_generation += 1;
        let generation = self.next_generation;
        let sink = MediaSink {
            peer: peer.clone(),
            generation,
            tx: self.tx.clone(),
        };
        let initiator = self.local_id < *peer;

        match self.media.negotiate(peer, initiator, sink) {
            Ok(negotiation) => {
                debug!(peer = %peer, initiator, generation, "Signaling session opened");
                self.sessions.insert(
                    peer.clone(),
                    SignalingSession {
                        generation,
                        negotiation,
                        retries_left,
                    },
                );
                Vec::new()
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "Could not start negotiation");
                let retried = retries_left > 0;
                let mut effects = vec![RelayEffect::Failed {
                    peer: peer.clone(),
                    reason: e.to_string(),
                    retried,
                }];
                if retried {
                    effects.extend(self.start(peer, retries_left - 1));
                } else {
                    self.exhausted.insert(peer.clone());
                }
                effects
            }
        }
    }

    fn teardown(&mut self, peer: &PeerId) -> Vec<RelayEffect> {
        let mut effects = Vec::new();
        if let Some(mut session) = self.sessions.remove(peer) {
            session.negotiation.stop();
        }
        if self.streams.remove(peer).is_some() {
            effects.push(RelayEffect::StreamEnded { peer: peer.clone() });
        }
        effects
    }
}
