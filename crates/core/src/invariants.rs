//! Developer guardrails and invariants
//!
//! Debug assertions for detecting impossible states during development.
//! These checks are compiled out in release builds.

use crate::hosting::{ElectionPhase, HostElection};
use crate::membership::MembershipTracker;

/// Validate that the election state agrees with its phase
pub fn assert_election_invariants(election: &HostElection, membership: &MembershipTracker) {
    let local = election.local_id();
    let state = election.state();

    match election.phase() {
        ElectionPhase::Host => debug_assert!(
            state.current_host_id.as_ref() == Some(local),
            "Peer {} is Host but current host is {:?}",
            local,
            state.current_host_id
        ),
        ElectionPhase::Left => debug_assert!(
            state.current_host_id.is_none(),
            "Peer {} left but still records host {:?}",
            local,
            state.current_host_id
        ),
        ElectionPhase::Electing => {
            let leaving_host = state.current_host_id.as_ref() == Some(local);
            let armed = state.next_host_id.as_ref() == Some(local);
            debug_assert!(
                leaving_host || armed,
                "Peer {} is Electing without being host or successor",
                local
            );
        }
        ElectionPhase::Unelected | ElectionPhase::Follower => debug_assert!(
            state.current_host_id.as_ref() != Some(local),
            "Peer {} records itself as host while in {:?}",
            local,
            election.phase()
        ),
    }

    debug_assert!(
        !membership.contains(local),
        "Peer {} is tracked as its own remote member",
        local
    );
}
