//! Capability scoring
//!
//! The local sample comes from a [`CapabilityProbe`]; remote samples arrive
//! as `SPEC_DATA`. Both are reduced to the same weighted score. The score
//! table accepts senders that membership has not seen yet.

use std::collections::HashMap;

use crate::models::{CapabilitySample, PeerId};

/// Source of local capability samples
pub trait CapabilityProbe: Send + Sync {
    fn sample(&self) -> CapabilitySample;
}

/// Probe that always reports the same sample
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub CapabilitySample);

impl CapabilityProbe for FixedProbe {
    fn sample(&self) -> CapabilitySample {
        self.0
    }
}

/// Last known score per remote peer
#[derive(Debug, Default, Clone)]
pub struct PeerScoreTable {
    scores: HashMap<PeerId, f64>,
}

impl PeerScoreTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, peer: PeerId, score: f64) {
        self.scores.insert(peer, score);
    }

    pub fn remove(&mut self, peer: &PeerId) -> Option<f64> {
        self.scores.remove(peer)
    }

    pub fn get(&self, peer: &PeerId) -> Option<f64> {
        self.scores.get(peer).copied()
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, f64)> {
        self.scores.iter().map(|(peer, score)| (peer, *score))
    }

    /// Highest-scoring peer, ties going to the smallest PeerId
    pub fn best(&self) -> Option<PeerId> {
        best_candidate(self.iter())
    }

    pub fn clear(&mut self) {
        self.scores.clear();
    }
}

/// Pick the candidate with the strictly greatest score
///
/// Equal scores resolve to the lexicographically smallest PeerId, so the
/// result does not depend on iteration order.
pub fn best_candidate<'a>(candidates: impl Iterator<Item = (&'a PeerId, f64)>) -> Option<PeerId> {
    let mut best: Option<(&PeerId, f64)> = None;
    for (peer, score) in candidates {
        best = match best {
            None => Some((peer, score)),
            Some((best_peer, best_score)) => {
                if score > best_score || (score == best_score && peer < best_peer) {
                    Some((peer, score))
                } else {
                    Some((best_peer, best_score))
                }
            }
        };
    }
    best.map(|(peer, _)| peer.clone())
}

/// Local sample plus the remote score table
#[derive(Debug, Default)]
pub struct CapabilityScorer {
    local: Option<CapabilitySample>,
    table: PeerScoreTable,
}

impl CapabilityScorer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a fresh local sample and return its score
    pub fn record_local(&mut self, sample: CapabilitySample) -> f64 {
        self.local = Some(sample);
        sample.score()
    }

    pub fn local_sample(&self) -> Option<CapabilitySample> {
        self.local
    }

    pub fn local_score(&self) -> Option<f64> {
        self.local.map(|s| s.score())
    }

    /// Apply a peer's `SPEC_DATA` sample and return the resulting score
    pub fn on_spec_data(&mut self, peer: PeerId, sample: CapabilitySample) -> f64 {
        let score = sample.score();
        self.table.upsert(peer, score);
        score
    }

    pub fn forget(&mut self, peer: &PeerId) {
        self.table.remove(peer);
    }

    pub fn table(&self) -> &PeerScoreTable {
        &self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tie_goes_to_smallest_id() {
        let mut table = PeerScoreTable::new();
        table.upsert(PeerId::from("A"), 0.5);
        table.upsert(PeerId::from("C"), 0.9);
        table.upsert(PeerId::from("B"), 0.9);

        assert_eq!(table.best(), Some(PeerId::from("B")));
    }

    #[test]
    fn test_empty_table_has_no_best() {
        assert_eq!(PeerScoreTable::new().best(), None);
    }

    #[test]
    fn test_best_is_order_independent() {
        let ids = ["d", "b", "a", "c"];
        let forward: Vec<(PeerId, f64)> = ids.iter().map(|id| (PeerId::from(*id), 0.3)).collect();
        let mut reverse = forward.clone();
        reverse.reverse();

        let a = best_candidate(forward.iter().map(|(p, s)| (p, *s)));
        let b = best_candidate(reverse.iter().map(|(p, s)| (p, *s)));
        assert_eq!(a, Some(PeerId::from("a")));
        assert_eq!(a, b);
    }

    #[test]
    fn test_unknown_sender_accepted() {
        let mut scorer = CapabilityScorer::new();
        let score = scorer.on_spec_data(
            PeerId::from("stranger"),
            CapabilitySample::new(1.0, 1.0, 0.0, 0.0),
        );

        assert!((score - 0.7).abs() < 1e-9);
        assert_eq!(scorer.table().get(&PeerId::from("stranger")), Some(score));
    }

    #[test]
    fn test_latest_sample_wins_and_forget_removes() {
        let mut scorer = CapabilityScorer::new();
        let peer = PeerId::from("A");
        scorer.on_spec_data(peer.clone(), CapabilitySample::new(1.0, 1.0, 1.0, 1.0));
        scorer.on_spec_data(peer.clone(), CapabilitySample::new(0.0, 0.0, 0.0, 0.0));
        assert_eq!(scorer.table().get(&peer), Some(0.0));

        scorer.forget(&peer);
        assert!(scorer.table().is_empty());
    }

    #[test]
    fn test_local_entry_kept_separately() {
        let mut scorer = CapabilityScorer::new();
        assert!(scorer.local_score().is_none());

        let probe = FixedProbe(CapabilitySample::new(0.0, 0.0, 1.0, 1.0));
        let score = scorer.record_local(probe.sample());

        assert!((score - 0.3).abs() < 1e-9);
        assert_eq!(scorer.local_score(), Some(score));
        assert!(scorer.table().is_empty());
    }
}
