//! The mutable protocol state of one height, and the cache of superseded heights.

#[cfg(test)]
#[path = "state_test.rs"]
mod state_test;

use std::num::NonZeroUsize;

use lru::LruCache;
use prost::Message;
use tbft_protobuf::consensus::{BlockHash, GossipState, Proposal, Step};
use tbft_protobuf::converters::consensus::round_to_i32;
use tbft_protobuf::protobuf;
use tracing::trace;

use crate::types::{ConsensusStatus, Height, Round, ValidatorId};
use crate::votes::HeightRoundVoteSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusState {
    pub id: ValidatorId,
    pub height: Height,
    pub round: Round,
    pub step: Step,
    /// The accepted proposal of the current round.
    pub proposal: Option<Proposal>,
    /// A proposal handed to the verifier and not yet accepted.
    pub verifying_proposal: Option<Proposal>,
    pub locked_round: Option<Round>,
    pub locked_proposal: Option<Proposal>,
    pub valid_round: Option<Round>,
    pub valid_proposal: Option<Proposal>,
    pub height_round_vote_set: HeightRoundVoteSet,
    /// Set once the prevote timeout of the current round was armed.
    pub triggered_timeout_prevote: bool,
    /// Set once the precommit timeout of the current round was armed.
    pub triggered_timeout_precommit: bool,
    /// Set once the decided block of this height was handed to the ledger.
    pub committed: bool,
}

impl ConsensusState {
    pub fn new(id: ValidatorId, height: Height) -> Self {
        Self {
            id,
            height,
            round: 0,
            step: Step::NewHeight,
            proposal: None,
            verifying_proposal: None,
            locked_round: None,
            locked_proposal: None,
            valid_round: None,
            valid_proposal: None,
            height_round_vote_set: HeightRoundVoteSet::new(height),
            triggered_timeout_prevote: false,
            triggered_timeout_precommit: false,
            committed: false,
        }
    }

    pub fn proposal_hash(&self) -> Option<&BlockHash> {
        self.proposal.as_ref().and_then(Proposal::block_hash)
    }

    pub fn verifying_proposal_hash(&self) -> Option<&BlockHash> {
        self.verifying_proposal.as_ref().and_then(Proposal::block_hash)
    }

    pub fn status(&self) -> ConsensusStatus {
        ConsensusStatus { height: self.height, round: self.round, step: self.step }
    }

    /// The digest of this node's round shipped to peers.
    pub fn gossip_state(&self) -> GossipState {
        GossipState {
            id: self.id.clone(),
            height: self.height,
            round: self.round,
            step: self.step,
            proposal: self.proposal_hash().cloned(),
            verifying_proposal: self.verifying_proposal_hash().cloned(),
            round_vote_set: self
                .height_round_vote_set
                .round_vote_set(self.round)
                .map(|round_vote_set| round_vote_set.to_proto()),
        }
    }

    pub fn to_proto(&self) -> protobuf::ConsensusState {
        protobuf::ConsensusState {
            id: self.id.clone(),
            height: self.height,
            round: self.round,
            step: i32::from(protobuf::Step::from(self.step)),
            proposal: self.proposal.clone().map(Into::into),
            verifying_proposal: self.verifying_proposal.clone().map(Into::into),
            locked_round: round_to_i32(self.locked_round),
            locked_proposal: self.locked_proposal.clone().map(Into::into),
            valid_round: round_to_i32(self.valid_round),
            valid_proposal: self.valid_proposal.clone().map(Into::into),
            height_round_vote_set: Some(self.height_round_vote_set.to_proto(self.round)),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_proto().encode_to_vec()
    }
}

/// Superseded heights, kept so that lagging peers can still be served. The oldest height is
/// evicted once the capacity is reached.
#[derive(Debug)]
pub struct ConsensusStateCache {
    states: LruCache<Height, ConsensusState>,
}

impl ConsensusStateCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self { states: LruCache::new(capacity) }
    }

    pub fn add(&mut self, state: ConsensusState) {
        if let Some((evicted, _)) = self.states.push(state.height, state) {
            trace!(height = evicted, "Evicted cached consensus state.");
        }
    }

    /// Lookups do not refresh an entry's position.
    pub fn get(&self, height: Height) -> Option<&ConsensusState> {
        self.states.peek(&height)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
