//! Per-room coordination loop
//!
//! Single writer for everything the room owns. Driven by transport events,
//! media reports, application commands, the sampling timer and the host
//! claim timer. Handlers return `Result`; a failing handler is logged and
//! the loop moves on.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{EngineEvent, RoomSnapshot, Warning};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::hosting::{ElectionPhase, HostElection};
use crate::invariants::assert_election_invariants;
use crate::membership::MembershipTracker;
use crate::models::{PeerId, Room};
use crate::protocol::{ControlMessage, RoomInfo};
use crate::scoring::{best_candidate, CapabilityProbe, CapabilityScorer};
use crate::signaling::{MediaEvent, MediaStack, RelayEffect, SignalingRelay};
use crate::transport::{SessionHandle, Transport, TransportEvent};

pub(super) enum RoomCommand {
    SendAppMessage {
        kind: String,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    Leave {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Why a room loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum RoomExit {
    /// Left on request, or the coordinator went away
    Left,
    /// The transport ended the session
    SessionLost,
}

pub(super) struct RoomLoop<T: Transport> {
    room: Room,
    transport: Arc<T>,
    session: SessionHandle,
    local_id: PeerId,
    probe: Arc<dyn CapabilityProbe>,
    config: EngineConfig,
    membership: MembershipTracker,
    scorer: CapabilityScorer,
    election: HostElection,
    relay: SignalingRelay,
    media_rx: mpsc::UnboundedReceiver<MediaEvent>,
    claim_deadline: Option<Instant>,
    events: broadcast::Sender<EngineEvent>,
    snapshot_tx: watch::Sender<RoomSnapshot>,
}

impl<T: Transport> RoomLoop<T> {
    pub(super) fn new(
        room: Room,
        transport: Arc<T>,
        session: SessionHandle,
        media: Arc<dyn MediaStack>,
        probe: Arc<dyn CapabilityProbe>,
        config: EngineConfig,
        events: broadcast::Sender<EngineEvent>,
    ) -> (Self, watch::Receiver<RoomSnapshot>) {
        let local_id = session.local_peer_id().clone();
        let (relay, media_rx) =
            SignalingRelay::new(local_id.clone(), media, config.signaling_retries);
        let election = HostElection::new(local_id.clone());

        let initial = RoomSnapshot {
            room: room.clone(),
            local_peer_id: local_id.clone(),
            phase: election.phase(),
            election: election.state().clone(),
            peers: Vec::new(),
            local_score: None,
            scores: Default::default(),
            remote_streams: Default::default(),
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);

        let room_loop = Self {
            room,
            transport,
            session,
            local_id,
            probe,
            config,
            membership: MembershipTracker::new(),
            scorer: CapabilityScorer::new(),
            election,
            relay,
            media_rx,
            claim_deadline: None,
            events,
            snapshot_tx,
        };
        (room_loop, snapshot_rx)
    }

    pub(super) async fn run(
        mut self,
        mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
        mut cmd_rx: mpsc::Receiver<RoomCommand>,
    ) -> RoomExit {
        let period = self.config.sampling_interval();
        let mut sampling = interval_at(Instant::now() + period, period);
        sampling.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.sample_and_broadcast().await;
        self.refresh_claim_timer();
        self.publish();

        loop {
            let claim_at = self.claim_deadline;

            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(RoomCommand::SendAppMessage { kind, data, reply }) => {
                        let result = self.send_app_message(&kind, data).await;
                        let _ = reply.send(result);
                    }
                    Some(RoomCommand::Leave { reply }) => {
                        let result = self.leave().await;
                        let _ = reply.send(result);
                        return RoomExit::Left;
                    }
                    None => {
                        debug!(room = %self.room.id, "Coordinator dropped; leaving room");
                        if let Err(e) = self.leave().await {
                            warn!(room = %self.room.id, error = %e, "Leave failed");
                        }
                        return RoomExit::Left;
                    }
                },
                event = transport_rx.recv() => match event {
                    Some(event) => self.handle_transport_event(event).await,
                    None => {
                        warn!(room = %self.room.id, "Transport session lost");
                        self.release_lost_session().await;
                        return RoomExit::SessionLost;
                    }
                },
                Some(event) = self.media_rx.recv() => {
                    let effects = self.relay.on_media_event(event);
                    self.apply_relay_effects(effects).await;
                }
                _ = sampling.tick() => self.sample_and_broadcast().await,
                _ = sleep_until(claim_at.unwrap_or_else(Instant::now)), if claim_at.is_some() => {
                    self.claim_deadline = None;
                    self.try_claim_host().await;
                }
            }

            self.refresh_claim_timer();
            self.publish();
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::NodeAvailable(peer) => self.on_node_available(peer).await,
            TransportEvent::NodeUnavailable(peer) => self.on_node_unavailable(peer).await,
            TransportEvent::Message {
                from,
                kind,
                payload,
            } => {
                if let Err(e) = self.on_message(&from, &kind, payload).await {
                    warn!(
                        room = %self.room.id,
                        peer = %from,
                        kind = %kind,
                        error = %e,
                        "Dropping message"
                    );
                }
            }
        }
    }

    async fn on_node_available(&mut self, peer: PeerId) {
        if peer == self.local_id {
            return;
        }

        if self.membership.arrive(peer.clone()) {
            info!(room = %self.room.id, peer = %peer, "Peer arrived");
            self.emit_active_nodes();
        } else {
            debug!(room = %self.room.id, peer = %peer, "Repeated arrival");
        }

        let info = RoomInfo {
            room: self.room.clone(),
            host_id: self.election.state().current_host_id.clone(),
        };
        self.send_to(&peer, &ControlMessage::RoomInfo(info)).await;

        if let Some(sample) = self.scorer.local_sample() {
            self.send_to(&peer, &ControlMessage::SpecData(sample)).await;
        }

        let effects = self.relay.open(&peer);
        self.apply_relay_effects(effects).await;
    }

    async fn on_node_unavailable(&mut self, peer: PeerId) {
        if self.membership.depart(&peer) {
            info!(room = %self.room.id, peer = %peer, "Peer departed");
            self.emit_active_nodes();
        } else {
            debug!(room = %self.room.id, peer = %peer, "Departure of untracked peer");
        }

        let effects = self.relay.close(&peer);
        self.apply_relay_effects(effects).await;
        self.scorer.forget(&peer);

        let before = self.election.clone();
        self.election.on_peer_departed(&peer);
        self.after_election_change(&before).await;
    }

    async fn on_message(&mut self, from: &PeerId, kind: &str, payload: Vec<u8>) -> Result<()> {
        let Some(msg) = ControlMessage::parse(kind, &payload)? else {
            debug!(room = %self.room.id, peer = %from, kind = %kind, "Application message");
            self.emit(EngineEvent::Message {
                room_id: self.room.id.clone(),
                from: from.clone(),
                kind: kind.to_string(),
                data: payload,
                received_at: Utc::now(),
            });
            return Ok(());
        };

        let before = self.election.clone();
        match msg {
            ControlMessage::RoomInfo(info) => {
                if info.room.id != self.room.id {
                    return Err(Error::MalformedMessage {
                        kind: kind.to_string(),
                        reason: format!("room id {} does not match", info.room.id),
                    });
                }
                if self.election.on_room_info(info.host_id.as_ref()) {
                    info!(
                        room = %self.room.id,
                        claimant = ?info.host_id,
                        "Rejecting competing host claim"
                    );
                    self.announce_host().await;
                }
            }
            ControlMessage::SpecData(sample) => {
                let score = self.scorer.on_spec_data(from.clone(), sample);
                debug!(room = %self.room.id, peer = %from, score, "Score updated");
            }
            ControlMessage::NextHostUpdate(candidate) => {
                info!(
                    room = %self.room.id,
                    from = %from,
                    candidate = %candidate,
                    "Successor announced"
                );
                self.election.on_next_host_update(from, candidate);
            }
            ControlMessage::HostGoodbye => {
                if !self.election.on_host_goodbye(from) {
                    debug!(room = %self.room.id, peer = %from, "Ignoring goodbye from non-host");
                }
            }
            ControlMessage::WebrtcSignal(blob) => {
                let effects = self.relay.deliver(from, &blob);
                self.apply_relay_effects(effects).await;
            }
        }
        self.after_election_change(&before).await;
        Ok(())
    }

    async fn send_app_message(&mut self, kind: &str, data: Vec<u8>) -> Result<()> {
        self.transport.broadcast(&self.session, kind, data).await
    }

    /// Hand off the host role if held, then release the session
    ///
    /// `NEXT_HOST_UPDATE` is always sent before `HOST_GOODBYE`. A failed
    /// send does not abort the sequence; the first error is returned after
    /// the session is released.
    async fn leave(&mut self) -> Result<()> {
        info!(room = %self.room.id, phase = ?self.election.phase(), "Leaving room");
        let mut first_error = None;

        if let Some(handoff) = self.election.begin_handoff(self.scorer.table()) {
            self.publish();
            match handoff.successor {
                Some(successor) => {
                    info!(room = %self.room.id, successor = %successor, "Handing off host role");
                    if let Err(e) = self
                        .broadcast(&ControlMessage::NextHostUpdate(successor))
                        .await
                    {
                        first_error.get_or_insert(e);
                    }
                }
                None => {
                    warn!(
                        room = %self.room.id,
                        "No scored peers to hand off to; room will be hostless"
                    );
                    self.emit_warning(Warning::HostlessRoom);
                }
            }
            if let Err(e) = self.broadcast(&ControlMessage::HostGoodbye).await {
                first_error.get_or_insert(e);
            }
        }

        if let Err(e) = self.transport.leave(&self.session).await {
            first_error.get_or_insert(e);
        }
        self.shutdown();

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Release whatever the transport still holds for a session it ended
    async fn release_lost_session(&mut self) {
        if let Err(e) = self.transport.leave(&self.session).await {
            debug!(room = %self.room.id, error = %e, "Session already released");
        }
        self.shutdown();
    }

    /// Drop all room state and enter the terminal phase
    fn shutdown(&mut self) {
        let effects = self.relay.close_all();
        for effect in effects {
            if let RelayEffect::StreamEnded { peer } = effect {
                self.emit(EngineEvent::RemoteStreamEnded {
                    room_id: self.room.id.clone(),
                    peer,
                });
            }
        }

        let was_host_known = self.election.state().current_host_id.is_some();
        self.election.finish_leave();
        if was_host_known {
            self.emit_host_changed();
        }

        self.membership.clear();
        self.claim_deadline = None;
        self.publish();
    }

    async fn sample_and_broadcast(&mut self) {
        let sample = self.probe.sample();
        let sample = match sample.validated() {
            Ok(sample) => sample,
            Err(e) => {
                error!(room = %self.room.id, error = %e, "Probe produced an invalid sample");
                return;
            }
        };
        let score = self.scorer.record_local(sample);
        debug!(room = %self.room.id, score, "Local capability sampled");

        if let Err(e) = self.broadcast(&ControlMessage::SpecData(sample)).await {
            self.report_send_failure(e);
        }
    }

    /// Run the tie-break for a room that has been hostless for the grace period
    async fn try_claim_host(&mut self) {
        if !self.election.needs_claim() {
            return;
        }

        let local_score = self.scorer.local_score().unwrap_or(0.0);
        let table = self.scorer.table();
        let candidates: Vec<(&PeerId, f64)> = std::iter::once((&self.local_id, local_score))
            .chain(
                self.membership
                    .iter()
                    .map(|peer| (peer, table.get(peer).unwrap_or(0.0))),
            )
            .collect();

        let Some(best) = best_candidate(candidates.into_iter()) else {
            return;
        };

        let before = self.election.clone();
        if self.election.claim(&best) {
            info!(room = %self.room.id, "No host known; claiming host role");
        } else {
            debug!(room = %self.room.id, expected = %best, "Waiting for better candidate to claim");
        }
        self.after_election_change(&before).await;
    }

    /// Emit notifications for an election transition and announce a new local host
    async fn after_election_change(&mut self, before: &HostElection) {
        assert_election_invariants(&self.election, &self.membership);

        let host_changed = before.state().current_host_id != self.election.state().current_host_id;
        if host_changed {
            info!(
                room = %self.room.id,
                host = ?self.election.state().current_host_id,
                phase = ?self.election.phase(),
                "Host changed"
            );
            self.emit_host_changed();
        }

        if self.election.phase() == ElectionPhase::Host && before.phase() != ElectionPhase::Host {
            self.announce_host().await;
        }
    }

    async fn announce_host(&self) {
        let info = RoomInfo {
            room: self.room.clone(),
            host_id: Some(self.local_id.clone()),
        };
        if let Err(e) = self.broadcast(&ControlMessage::RoomInfo(info)).await {
            self.report_send_failure(e);
        }
    }

    async fn apply_relay_effects(&mut self, effects: Vec<RelayEffect>) {
        for effect in effects {
            match effect {
                RelayEffect::Signal { peer, payload } => {
                    self.send_to(&peer, &ControlMessage::WebrtcSignal(payload))
                        .await;
                }
                RelayEffect::StreamReady { peer, stream } => {
                    info!(
                        room = %self.room.id,
                        peer = %peer,
                        stream = %stream.id,
                        "Remote stream ready"
                    );
                    self.emit(EngineEvent::RemoteStream {
                        room_id: self.room.id.clone(),
                        peer,
                        stream,
                    });
                }
                RelayEffect::StreamEnded { peer } => {
                    self.emit(EngineEvent::RemoteStreamEnded {
                        room_id: self.room.id.clone(),
                        peer,
                    });
                }
                RelayEffect::Failed {
                    peer,
                    reason,
                    retried,
                } => {
                    self.emit_warning(Warning::SignalingFailed {
                        peer,
                        reason,
                        retried,
                    });
                }
            }
        }
    }

    fn refresh_claim_timer(&mut self) {
        if self.election.needs_claim() {
            if self.claim_deadline.is_none() {
                self.claim_deadline = Some(Instant::now() + self.config.host_claim_grace());
            }
        } else {
            self.claim_deadline = None;
        }
    }

    async fn broadcast(&self, msg: &ControlMessage) -> Result<()> {
        let payload = msg.to_payload()?;
        debug!(room = %self.room.id, kind = msg.kind(), "Broadcast");
        self.transport
            .broadcast(&self.session, msg.kind(), payload)
            .await
    }

    /// Unicast a control message; failures are reported, not returned
    async fn send_to(&self, peer: &PeerId, msg: &ControlMessage) {
        let result = match msg.to_payload() {
            Ok(payload) => {
                debug!(room = %self.room.id, peer = %peer, kind = msg.kind(), "Unicast");
                self.transport
                    .send(&self.session, peer, msg.kind(), payload)
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.report_send_failure(e);
        }
    }

    fn report_send_failure(&self, e: Error) {
        warn!(room = %self.room.id, error = %e, "Send failed");
        self.emit_warning(Warning::TransportFailed {
            reason: e.to_string(),
        });
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn emit_warning(&self, warning: Warning) {
        self.emit(EngineEvent::Warning {
            room_id: self.room.id.clone(),
            warning,
        });
    }

    fn emit_active_nodes(&self) {
        self.emit(EngineEvent::ActiveNodesChanged {
            room_id: self.room.id.clone(),
            peers: self.membership.peers(),
        });
    }

    fn emit_host_changed(&self) {
        let host = self.election.state().current_host_id.clone();
        let is_local = host.as_ref() == Some(&self.local_id);
        self.emit(EngineEvent::HostChanged {
            room_id: self.room.id.clone(),
            host,
            is_local,
        });
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(RoomSnapshot {
            room: self.room.clone(),
            local_peer_id: self.local_id.clone(),
            phase: self.election.phase(),
            election: self.election.state().clone(),
            peers: self.membership.peers(),
            local_score: self.scorer.local_score(),
            scores: self
                .scorer
                .table()
                .iter()
                .map(|(peer, score)| (peer.clone(), score))
                .collect(),
            remote_streams: self.relay.remote_streams().clone(),
        });
    }
}
