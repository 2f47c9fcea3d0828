//! Sans-IO voting state machine for one height at a time.
//!
//! The engine never touches the network or the clock directly: the caller
//! feeds it candidates, peer votes and elapsed time, and collects outbound
//! votes through the `VoteOutbox` seam. Per height it moves
//! `Idle -> Voting -> Decided` and emits exactly one decision.

use super::messages::{Decision, Vote};
use super::quorum_threshold;
use crate::crypto::{PublicKey, SignatureVerifier};
use crate::types::{commit_sign_bytes, Hash32, Height, Peer};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("vote from unknown peer")]
    UnknownVoter,
    #[error("invalid vote signature")]
    BadSignature,
}

#[derive(Clone, Debug)]
pub struct YacConfig {
    /// First-round voting timeout. Doubled every fruitless round.
    pub round_timeout_ms: u64,
    /// Backoff ceiling.
    pub max_round_timeout_ms: u64,
}

impl Default for YacConfig {
    fn default() -> Self {
        Self { round_timeout_ms: 1_000, max_round_timeout_ms: 32_000 }
    }
}

/// Where the engine's own votes go.
pub trait VoteOutbox {
    fn broadcast_vote(&mut self, vote: Vote);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Voting,
    Decided,
}

/// What `on_vote` observed.
#[derive(Debug, PartialEq, Eq)]
pub enum VoteOutcome {
    /// Dropped: stale height, duplicate, or equivocation.
    Ignored,
    Recorded,
    Decided(Decision),
    /// The voter is voting at a height above ours; we are behind.
    Ahead(Height),
}

pub struct YacEngine<V: SignatureVerifier> {
    cfg: YacConfig,
    height: Height,
    peers: Vec<Peer>,
    phase: Phase,
    round: u32,
    elapsed_ms: u64,
    own_vote: Option<Vote>,
    votes: BTreeMap<PublicKey, Vote>,
    decided: Option<Decision>,
    _v: PhantomData<V>,
}

impl<V: SignatureVerifier> YacEngine<V> {
    pub fn new(cfg: YacConfig, height: Height, peers: Vec<Peer>) -> Self {
        Self {
            cfg,
            height,
            peers,
            phase: Phase::Idle,
            round: 0,
            elapsed_ms: 0,
            own_vote: None,
            votes: BTreeMap::new(),
            decided: None,
            _v: PhantomData,
        }
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn round_timeout(&self) -> u64 {
        self.cfg
            .round_timeout_ms
            .saturating_mul(1u64 << self.round.min(16))
            .min(self.cfg.max_round_timeout_ms)
    }

    /// A candidate block hash arrived from the simulator for the current
    /// height: vote for it. Later candidates at the same height are ignored
    /// (the gate emits one per height; a second one would mean we already
    /// voted).
    pub fn on_candidate<S: crate::crypto::NodeSigner, O: VoteOutbox>(
        &mut self,
        signer: &S,
        out: &mut O,
        height: Height,
        block_hash: Hash32,
    ) -> Option<Decision> {
        if height != self.height || self.decided.is_some() || self.own_vote.is_some() {
            return None;
        }
        let vote = Vote::sign(signer, height, block_hash);
        self.own_vote = Some(vote.clone());
        self.phase = Phase::Voting;
        self.elapsed_ms = 0;
        debug!(height, hash = %vote.block_hash.short_hex(), "voting for candidate");
        out.broadcast_vote(vote.clone());
        // Our own vote may complete a quorum the peers already built.
        self.record(vote)
    }

    /// A peer vote arrived. Signature and membership are verified here;
    /// duplicates and equivocations are dropped.
    pub fn on_vote(&mut self, vote: Vote) -> Result<VoteOutcome, ConsensusError> {
        if vote.height > self.height {
            return Ok(VoteOutcome::Ahead(vote.height));
        }
        if vote.height < self.height || self.decided.is_some() {
            return Ok(VoteOutcome::Ignored);
        }
        if !self.peers.iter().any(|p| p.pubkey == vote.voter) {
            return Err(ConsensusError::UnknownVoter);
        }
        let msg = commit_sign_bytes(vote.height, &vote.block_hash);
        V::verify(&vote.voter, &msg, &vote.signature).map_err(|_| ConsensusError::BadSignature)?;

        if let Some(prev) = self.votes.get(&vote.voter) {
            if prev.block_hash != vote.block_hash {
                warn!(
                    height = vote.height,
                    voter = %vote.voter.short_hex(),
                    "equivocating vote dropped"
                );
            }
            return Ok(VoteOutcome::Ignored);
        }
        if self.phase == Phase::Idle {
            self.phase = Phase::Voting;
            self.elapsed_ms = 0;
        }
        match self.record(vote) {
            Some(d) => Ok(VoteOutcome::Decided(d)),
            None => Ok(VoteOutcome::Recorded),
        }
    }

    fn record(&mut self, vote: Vote) -> Option<Decision> {
        self.votes.insert(vote.voter.clone(), vote);
        self.try_decide()
    }

    /// Tally the current height. Ties (more than one hash at quorum in the
    /// same delivery burst) break towards the smallest hash.
    fn try_decide(&mut self) -> Option<Decision> {
        let need = quorum_threshold(self.peers.len());
        let mut per_hash: BTreeMap<&Hash32, usize> = BTreeMap::new();
        for v in self.votes.values() {
            *per_hash.entry(&v.block_hash).or_insert(0) += 1;
        }
        let winner = per_hash.into_iter().find(|(_, n)| *n >= need).map(|(h, _)| h.clone())?;

        let votes: Vec<Vote> = self.votes.values().filter(|v| v.block_hash == winner).cloned().collect();
        let decision = Decision { height: self.height, block_hash: winner, votes };
        self.phase = Phase::Decided;
        self.decided = Some(decision.clone());
        info!(height = self.height, hash = %decision.block_hash.short_hex(), "height decided");
        Some(decision)
    }

    /// Advance the round clock. On timeout the round restarts with doubled
    /// backoff and our last vote is rebroadcast so stragglers can still
    /// assemble a quorum.
    pub fn tick<O: VoteOutbox>(&mut self, out: &mut O, dt_ms: u64) {
        if self.phase != Phase::Voting {
            return;
        }
        self.elapsed_ms = self.elapsed_ms.saturating_add(dt_ms);
        if self.elapsed_ms < self.round_timeout() {
            return;
        }
        self.round += 1;
        self.elapsed_ms = 0;
        info!(height = self.height, round = self.round, "voting round timed out; rebroadcasting");
        if let Some(v) = self.own_vote.clone() {
            out.broadcast_vote(v);
        }
    }

    /// Move to the next height with the peer set effective there. Clears
    /// all per-height state.
    pub fn advance(&mut self, height: Height, peers: Vec<Peer>) {
        if height <= self.height {
            return;
        }
        self.height = height;
        self.peers = peers;
        self.phase = Phase::Idle;
        self.round = 0;
        self.elapsed_ms = 0;
        self.own_vote = None;
        self.votes.clear();
        self.decided = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ed25519::{NodeKeypair, Ed25519Oracle};
    use crate::crypto::NodeSigner;

    #[derive(Default)]
    struct RecordingOutbox {
        votes: Vec<Vote>,
    }

    impl VoteOutbox for RecordingOutbox {
        fn broadcast_vote(&mut self, vote: Vote) {
            self.votes.push(vote);
        }
    }

    fn keys(n: usize) -> Vec<NodeKeypair> {
        (1..=n as u8).map(|i| NodeKeypair::from_seed([i; 32])).collect()
    }

    fn peers_of(keys: &[NodeKeypair]) -> Vec<Peer> {
        keys.iter()
            .enumerate()
            .map(|(i, k)| Peer { address: format!("/node/{i}"), pubkey: k.public_key() })
            .collect()
    }

    #[test]
    fn quorum_of_same_hash_decides() {
        let ks = keys(4);
        let peers = peers_of(&ks);
        let mut engine = YacEngine::<Ed25519Oracle>::new(YacConfig::default(), 1, peers);
        let hash = Hash32([1; 32]);
        let mut out = RecordingOutbox::default();

        assert!(engine.on_candidate(&ks[0], &mut out, 1, hash.clone()).is_none());
        assert_eq!(out.votes.len(), 1);

        assert_eq!(engine.on_vote(Vote::sign(&ks[1], 1, hash.clone())).unwrap(), VoteOutcome::Recorded);
        // Third vote reaches 2*4/3+1 = 3.
        match engine.on_vote(Vote::sign(&ks[2], 1, hash.clone())).unwrap() {
            VoteOutcome::Decided(d) => {
                assert_eq!(d.height, 1);
                assert_eq!(d.block_hash, hash);
                assert_eq!(d.votes.len(), 3);
            }
            other => panic!("expected decision, got {other:?}"),
        }
        // At most one decision per height.
        assert_eq!(engine.on_vote(Vote::sign(&ks[3], 1, hash)).unwrap(), VoteOutcome::Ignored);
    }

    #[test]
    fn dissenting_quorum_decides_without_our_candidate() {
        let ks = keys(4);
        let peers = peers_of(&ks);
        let mut engine = YacEngine::<Ed25519Oracle>::new(YacConfig::default(), 1, peers);
        let mut out = RecordingOutbox::default();

        let ours = Hash32([1; 32]);
        let theirs = Hash32([2; 32]);
        engine.on_candidate(&ks[0], &mut out, 1, ours);

        engine.on_vote(Vote::sign(&ks[1], 1, theirs.clone())).unwrap();
        engine.on_vote(Vote::sign(&ks[2], 1, theirs.clone())).unwrap();
        match engine.on_vote(Vote::sign(&ks[3], 1, theirs.clone())).unwrap() {
            VoteOutcome::Decided(d) => assert_eq!(d.block_hash, theirs),
            other => panic!("expected decision, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_and_equivocating_votes_ignored() {
        let ks = keys(4);
        let peers = peers_of(&ks);
        let mut engine = YacEngine::<Ed25519Oracle>::new(YacConfig::default(), 1, peers);
        let hash = Hash32([1; 32]);

        assert_eq!(engine.on_vote(Vote::sign(&ks[1], 1, hash.clone())).unwrap(), VoteOutcome::Recorded);
        assert_eq!(engine.on_vote(Vote::sign(&ks[1], 1, hash.clone())).unwrap(), VoteOutcome::Ignored);
        assert_eq!(
            engine.on_vote(Vote::sign(&ks[1], 1, Hash32([9; 32]))).unwrap(),
            VoteOutcome::Ignored
        );
    }

    #[test]
    fn malformed_votes_rejected() {
        let ks = keys(4);
        let peers = peers_of(&ks);
        let mut engine = YacEngine::<Ed25519Oracle>::new(YacConfig::default(), 1, peers);

        let outsider = NodeKeypair::from_seed([99; 32]);
        assert_eq!(
            engine.on_vote(Vote::sign(&outsider, 1, Hash32([1; 32]))),
            Err(ConsensusError::UnknownVoter)
        );

        let mut forged = Vote::sign(&ks[1], 1, Hash32([1; 32]));
        forged.block_hash = Hash32([2; 32]);
        assert_eq!(engine.on_vote(forged), Err(ConsensusError::BadSignature));
    }

    #[test]
    fn vote_ahead_reports_lag() {
        let ks = keys(4);
        let peers = peers_of(&ks);
        let mut engine = YacEngine::<Ed25519Oracle>::new(YacConfig::default(), 1, peers);
        assert_eq!(
            engine.on_vote(Vote::sign(&ks[1], 5, Hash32([1; 32]))).unwrap(),
            VoteOutcome::Ahead(5)
        );
    }

    #[test]
    fn timeout_rebroadcasts_with_backoff() {
        let ks = keys(4);
        let peers = peers_of(&ks);
        let mut engine = YacEngine::<Ed25519Oracle>::new(
            YacConfig { round_timeout_ms: 100, max_round_timeout_ms: 1_000 },
            1,
            peers,
        );
        let mut out = RecordingOutbox::default();
        engine.on_candidate(&ks[0], &mut out, 1, Hash32([1; 32]));
        assert_eq!(out.votes.len(), 1);

        engine.tick(&mut out, 100);
        assert_eq!(out.votes.len(), 2);
        // Second round waits twice as long.
        engine.tick(&mut out, 100);
        assert_eq!(out.votes.len(), 2);
        engine.tick(&mut out, 100);
        assert_eq!(out.votes.len(), 3);
    }

    #[test]
    fn advance_resets_for_next_height() {
        let ks = keys(4);
        let peers = peers_of(&ks);
        let mut engine = YacEngine::<Ed25519Oracle>::new(YacConfig::default(), 1, peers.clone());
        let hash = Hash32([1; 32]);
        let mut out = RecordingOutbox::default();
        engine.on_candidate(&ks[0], &mut out, 1, hash.clone());
        engine.on_vote(Vote::sign(&ks[1], 1, hash.clone())).unwrap();
        engine.on_vote(Vote::sign(&ks[2], 1, hash)).unwrap();
        assert_eq!(engine.phase(), Phase::Decided);

        engine.advance(2, peers);
        assert_eq!(engine.phase(), Phase::Idle);
        assert_eq!(engine.height(), 2);
    }
}
