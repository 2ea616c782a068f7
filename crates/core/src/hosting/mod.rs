//! Host election state machine
//!
//! The departing host decides: when the local host leaves it picks the best
//! scored peer from its own table, announces it with `NEXT_HOST_UPDATE` and
//! then says `HOST_GOODBYE`. Receivers only become host when the goodbye
//! arrives and they are the recorded successor.
//!
//! This module is pure state. The room loop feeds it events and performs
//! the resulting sends.

use serde::Serialize;

use crate::models::PeerId;
use crate::scoring::PeerScoreTable;

/// Election phase of the local peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ElectionPhase {
    /// No host has ever been established
    Unelected,
    /// Another peer is host, or the host became unknown after a hand-off
    Follower,
    /// A hand-off is in progress: either the local host is leaving, or the
    /// local peer was named successor and waits for the goodbye
    Electing,
    /// The local peer is host
    Host,
    /// The local peer left the room
    Left,
}

/// Host bookkeeping shared with the rest of the engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ElectionState {
    /// `None` while the host is unknown
    pub current_host_id: Option<PeerId>,
    /// Successor announced by the departing host, if any
    pub next_host_id: Option<PeerId>,
}

/// Outcome of starting a hand-off
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandOff {
    /// `None` when the score table was empty
    pub successor: Option<PeerId>,
}

/// Election state machine for one room
#[derive(Debug, Clone)]
pub struct HostElection {
    local_id: PeerId,
    phase: ElectionPhase,
    state: ElectionState,
}

impl HostElection {
    pub fn new(local_id: PeerId) -> Self {
        Self {
            local_id,
            phase: ElectionPhase::Unelected,
            state: ElectionState::default(),
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn phase(&self) -> ElectionPhase {
        self.phase
    }

    pub fn state(&self) -> &ElectionState {
        &self.state
    }

    pub fn is_host(&self) -> bool {
        self.phase == ElectionPhase::Host
    }

    /// The local peer was named successor and waits for the goodbye
    pub fn is_armed(&self) -> bool {
        self.phase == ElectionPhase::Electing
            && self.state.next_host_id.as_ref() == Some(&self.local_id)
    }

    /// True when nobody is known to be host and no hand-off to us is pending
    pub fn needs_claim(&self) -> bool {
        !matches!(self.phase, ElectionPhase::Host | ElectionPhase::Left)
            && self.state.current_host_id.is_none()
            && !self.is_armed()
    }

    /// `ROOM_INFO` received, carrying the sender's view of the host
    ///
    /// A message without a host changes nothing. A follower takes the most
    /// recent evidence. A local host facing a competing claim keeps the role
    /// only if its ID sorts first; the other claimant applies the same rule,
    /// so both converge on one host.
    ///
    /// Returns true when the local host rejected a competing claim and
    /// should announce itself again.
    pub fn on_room_info(&mut self, host_id: Option<&PeerId>) -> bool {
        let Some(host) = host_id else {
            return false;
        };
        if self.phase == ElectionPhase::Left {
            return false;
        }

        if *host == self.local_id {
            self.become_host();
            return false;
        }

        if self.phase == ElectionPhase::Host && self.local_id < *host {
            return true;
        }

        // The outgoing host may still send ROOM_INFO before its goodbye
        if self.is_armed() && self.state.current_host_id.as_ref() == Some(host) {
            return false;
        }

        if self.state.next_host_id.as_ref() == Some(host) || self.is_armed() {
            self.state.next_host_id = None;
        }
        self.state.current_host_id = Some(host.clone());
        self.phase = ElectionPhase::Follower;
        false
    }

    /// `NEXT_HOST_UPDATE(candidate)` received from `sender`
    pub fn on_next_host_update(&mut self, sender: &PeerId, candidate: PeerId) {
        if matches!(self.phase, ElectionPhase::Left | ElectionPhase::Host) {
            return;
        }

        // Only a host announces a successor
        if self.state.current_host_id.is_none() {
            self.state.current_host_id = Some(sender.clone());
        }

        let armed = candidate == self.local_id;
        self.state.next_host_id = Some(candidate);
        self.phase = if armed {
            ElectionPhase::Electing
        } else {
            ElectionPhase::Follower
        };
    }

    /// `HOST_GOODBYE` received from `sender`
    ///
    /// Returns false when the goodbye was ignored because a different host
    /// is known locally.
    pub fn on_host_goodbye(&mut self, sender: &PeerId) -> bool {
        if matches!(self.phase, ElectionPhase::Left | ElectionPhase::Host) {
            return false;
        }
        if let Some(host) = &self.state.current_host_id {
            if host != sender {
                return false;
            }
        }

        if self.state.next_host_id.as_ref() == Some(&self.local_id) {
            self.become_host();
        } else {
            self.state.current_host_id = None;
            self.phase = ElectionPhase::Follower;
        }
        true
    }

    /// A peer became unavailable
    pub fn on_peer_departed(&mut self, peer: &PeerId) {
        if self.phase == ElectionPhase::Left {
            return;
        }

        if self.state.next_host_id.as_ref() == Some(peer) {
            self.state.next_host_id = None;
        }

        if self.state.current_host_id.as_ref() == Some(peer) {
            if self.is_armed() {
                // The host left without its goodbye; the hand-off still stands
                self.become_host();
            } else {
                self.state.current_host_id = None;
                if self.phase != ElectionPhase::Unelected {
                    self.phase = ElectionPhase::Follower;
                }
            }
        }
    }

    /// Claim the host role if `best` is the local peer
    ///
    /// Used when the room has been hostless for the grace period. Returns
    /// true if the local peer became host.
    pub fn claim(&mut self, best: &PeerId) -> bool {
        if !self.needs_claim() || *best != self.local_id {
            return false;
        }
        self.become_host();
        true
    }

    /// Start a hand-off if the local peer is host
    ///
    /// Chooses the successor from `table` and records it as the next host.
    /// The caller must announce it before calling [`finish_leave`].
    ///
    /// [`finish_leave`]: HostElection::finish_leave
    pub fn begin_handoff(&mut self, table: &PeerScoreTable) -> Option<HandOff> {
        if self.phase != ElectionPhase::Host {
            return None;
        }

        let successor = select_successor(table, &self.local_id);
        self.state.next_host_id = successor.clone();
        self.phase = ElectionPhase::Electing;

        Some(HandOff { successor })
    }

    /// Vacate the host slot and enter the terminal state
    pub fn finish_leave(&mut self) {
        self.state.current_host_id = None;
        self.phase = ElectionPhase::Left;
    }

    fn become_host(&mut self) {
        self.state.current_host_id = Some(self.local_id.clone());
        self.state.next_host_id = None;
        self.phase = ElectionPhase::Host;
    }
}

/// Successor for a departing host: best score in the table, never the host
pub fn select_successor(table: &PeerScoreTable, local_id: &PeerId) -> Option<PeerId> {
    crate::scoring::best_candidate(table.iter().filter(|(peer, _)| *peer != local_id))
}
