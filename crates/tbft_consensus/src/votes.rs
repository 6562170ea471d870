//! Quorum accounting for the votes of a height.
//!
//! A [`VoteSet`] holds the votes of one type for one (height, round). It enforces one vote per
//! validator and latches the first hash that gathers a quorum. [`RoundVoteSet`] pairs the prevote
//! and precommit sets of a round and [`HeightRoundVoteSet`] maps rounds to them, creating rounds
//! the first time they are touched.
//!
//! Quorum sizes are computed from the validator set passed to each call rather than cached, so a
//! validator set change never rewrites the outcome of earlier rounds.

#[cfg(test)]
#[path = "votes_test.rs"]
mod votes_test;

use std::collections::{BTreeMap, HashMap};

use prost::Message;
use tbft_protobuf::consensus::{display_hash, BlockHash, Vote, VoteType};
use tbft_protobuf::converters::consensus::vote_type_from_i32;
use tbft_protobuf::converters::ProtobufConversionError;
use tbft_protobuf::protobuf;
use tracing::{debug, trace};

use crate::types::{Height, Round, ValidatorId};
use crate::validator_set::ValidatorSet;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum VoteError {
    #[error("Vote {vote} does not belong to the {vote_type} set of {height}/{round}.")]
    UnexpectedVote { vote: String, vote_type: VoteType, height: Height, round: Round },
    #[error("Voter {0} is not a validator.")]
    UnknownVoter(ValidatorId),
    #[error("Conflicting votes from {voter}: {existing} and {conflicting}.")]
    ConflictingVote { voter: ValidatorId, existing: String, conflicting: String },
    #[error(transparent)]
    ProtobufConversion(#[from] ProtobufConversionError),
}

/// Votes for a single hash.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockVotes {
    votes: BTreeMap<ValidatorId, Vote>,
    sum: u64,
}

impl BlockVotes {
    fn add(&mut self, vote: Vote) {
        self.votes.insert(vote.voter.clone(), vote);
        self.sum += 1;
    }

    pub fn votes(&self) -> impl Iterator<Item = &Vote> {
        self.votes.values()
    }

    pub fn sum(&self) -> u64 {
        self.sum
    }

    fn to_proto(&self) -> protobuf::BlockVotes {
        protobuf::BlockVotes {
            votes: self
                .votes
                .iter()
                .map(|(voter, vote)| (voter.clone(), protobuf::Vote::from(vote.clone())))
                .collect(),
            sum: self.sum,
        }
    }
}

/// Votes of one type for one (height, round).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteSet {
    vote_type: VoteType,
    height: Height,
    round: Round,
    sum: u64,
    /// The first hash to reach a quorum; `Some(None)` is a NIL quorum. Never replaced once set.
    maj23: Option<Option<BlockHash>>,
    votes: BTreeMap<ValidatorId, Vote>,
    votes_by_block: HashMap<Option<BlockHash>, BlockVotes>,
}

impl VoteSet {
    pub fn new(vote_type: VoteType, height: Height, round: Round) -> Self {
        Self {
            vote_type,
            height,
            round,
            sum: 0,
            maj23: None,
            votes: BTreeMap::new(),
            votes_by_block: HashMap::new(),
        }
    }

    pub fn vote_type(&self) -> VoteType {
        self.vote_type
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn sum(&self) -> u64 {
        self.sum
    }

    /// Adds `vote` to the set.
    ///
    /// Returns `Ok(false)` if the exact same vote is already counted. A second vote from the same
    /// voter for a different hash is an equivocation and is rejected.
    pub fn add_vote(&mut self, vote: Vote, validators: &ValidatorSet) -> Result<bool, VoteError> {
        if vote.vote_type != self.vote_type || vote.height != self.height || vote.round != self.round
        {
            return Err(VoteError::UnexpectedVote {
                vote: vote.to_string(),
                vote_type: self.vote_type,
                height: self.height,
                round: self.round,
            });
        }
        if !validators.has_validator(&vote.voter) {
            return Err(VoteError::UnknownVoter(vote.voter));
        }
        if let Some(existing) = self.votes.get(&vote.voter) {
            if existing.block_hash == vote.block_hash {
                trace!("Duplicate vote {vote}.");
                return Ok(false);
            }
            return Err(VoteError::ConflictingVote {
                voter: vote.voter.clone(),
                existing: existing.to_string(),
                conflicting: vote.to_string(),
            });
        }

        let hash = vote.block_hash.clone();
        self.votes.insert(vote.voter.clone(), vote.clone());
        self.sum += 1;
        let block_votes = self.votes_by_block.entry(hash.clone()).or_default();
        block_votes.add(vote);

        if self.maj23.is_none() && block_votes.sum >= validators.quorum() {
            debug!(
                vote_type = %self.vote_type,
                height = self.height,
                round = self.round,
                "Quorum reached for {}.",
                display_hash(hash.as_ref())
            );
            self.maj23 = Some(hash);
        }
        Ok(true)
    }

    /// The hash that reached a quorum, if any. `Some(None)` is a NIL quorum.
    pub fn two_thirds_majority(&self) -> Option<Option<&BlockHash>> {
        self.maj23.as_ref().map(Option::as_ref)
    }

    /// Returns true when no hash can still reach a quorum: for every hash voted so far, its votes
    /// plus all the votes not yet cast fall short of the quorum. Holds trivially for an empty set.
    pub fn has_two_thirds_any(&self, validators: &ValidatorSet) -> bool {
        let quorum = validators.quorum();
        let left = validators.size().saturating_sub(self.sum);
        !self.votes_by_block.values().any(|block_votes| block_votes.sum + left >= quorum)
    }

    /// Returns true when a quorum of validators voted, whatever they voted for.
    pub fn has_two_thirds_no_majority(&self, validators: &ValidatorSet) -> bool {
        self.sum >= validators.quorum()
    }

    pub fn vote_of(&self, voter: &str) -> Option<&Vote> {
        self.votes.get(voter)
    }

    pub fn has_voted(&self, voter: &str) -> bool {
        self.votes.contains_key(voter)
    }

    pub fn votes(&self) -> impl Iterator<Item = &Vote> {
        self.votes.values()
    }

    pub fn block_votes(&self, hash: Option<&BlockHash>) -> Option<&BlockVotes> {
        self.votes_by_block.get(&hash.cloned())
    }

    /// A set holding only the votes of the latched quorum, if there is one.
    pub fn quorum_certificate(&self) -> Option<VoteSet> {
        let maj23 = self.maj23.clone()?;
        let block_votes = self.votes_by_block.get(&maj23)?.clone();
        Some(VoteSet {
            vote_type: self.vote_type,
            height: self.height,
            round: self.round,
            sum: block_votes.sum,
            votes: block_votes.votes.clone(),
            votes_by_block: HashMap::from([(maj23.clone(), block_votes)]),
            maj23: Some(maj23),
        })
    }

    pub fn to_proto(&self) -> protobuf::VoteSet {
        protobuf::VoteSet {
            vote_type: i32::from(protobuf::VoteType::from(self.vote_type)),
            height: self.height,
            round: self.round,
            sum: self.sum,
            maj23: self.maj23.as_ref().map(|hash| BlockHash::to_wire(hash.as_ref())),
            votes: self
                .votes
                .iter()
                .map(|(voter, vote)| (voter.clone(), protobuf::Vote::from(vote.clone())))
                .collect(),
            votes_by_block: self
                .votes_by_block
                .iter()
                .map(|(hash, block_votes)| (hash_key(hash.as_ref()), block_votes.to_proto()))
                .collect(),
        }
    }

    /// Rebuilds a vote set by re-adding every vote of `proto`. Counters and the quorum are
    /// recomputed, not taken from the message.
    pub fn from_proto(
        proto: protobuf::VoteSet,
        validators: &ValidatorSet,
    ) -> Result<Self, VoteError> {
        let mut vote_set =
            VoteSet::new(vote_type_from_i32(proto.vote_type)?, proto.height, proto.round);
        for vote in proto.votes.into_values() {
            vote_set.add_vote(Vote::try_from(vote)?, validators)?;
        }
        Ok(vote_set)
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_proto().encode_to_vec()
    }
}

fn hash_key(hash: Option<&BlockHash>) -> String {
    hash.map(|hash| hex::encode(hash.as_bytes())).unwrap_or_default()
}

/// The prevotes and precommits of one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundVoteSet {
    height: Height,
    round: Round,
    prevotes: VoteSet,
    precommits: VoteSet,
}

impl RoundVoteSet {
    pub fn new(height: Height, round: Round) -> Self {
        Self {
            height,
            round,
            prevotes: VoteSet::new(VoteType::Prevote, height, round),
            precommits: VoteSet::new(VoteType::Precommit, height, round),
        }
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn prevotes(&self) -> &VoteSet {
        &self.prevotes
    }

    pub fn precommits(&self) -> &VoteSet {
        &self.precommits
    }

    pub fn votes(&self, vote_type: VoteType) -> &VoteSet {
        match vote_type {
            VoteType::Prevote => &self.prevotes,
            VoteType::Precommit => &self.precommits,
        }
    }

    pub fn add_vote(&mut self, vote: Vote, validators: &ValidatorSet) -> Result<bool, VoteError> {
        match vote.vote_type {
            VoteType::Prevote => self.prevotes.add_vote(vote, validators),
            VoteType::Precommit => self.precommits.add_vote(vote, validators),
        }
    }

    pub fn to_proto(&self) -> protobuf::RoundVoteSet {
        protobuf::RoundVoteSet {
            height: self.height,
            round: self.round,
            prevotes: Some(self.prevotes.to_proto()),
            precommits: Some(self.precommits.to_proto()),
        }
    }

    pub fn from_proto(
        proto: protobuf::RoundVoteSet,
        validators: &ValidatorSet,
    ) -> Result<Self, VoteError> {
        let mut round_vote_set = RoundVoteSet::new(proto.height, proto.round);
        if let Some(prevotes) = proto.prevotes {
            round_vote_set.prevotes = VoteSet::from_proto(prevotes, validators)?;
        }
        if let Some(precommits) = proto.precommits {
            round_vote_set.precommits = VoteSet::from_proto(precommits, validators)?;
        }
        if round_vote_set.prevotes.height != proto.height
            || round_vote_set.prevotes.round != proto.round
            || round_vote_set.prevotes.vote_type != VoteType::Prevote
            || round_vote_set.precommits.height != proto.height
            || round_vote_set.precommits.round != proto.round
            || round_vote_set.precommits.vote_type != VoteType::Precommit
        {
            return Err(VoteError::ProtobufConversion(ProtobufConversionError::OutOfRangeValue {
                type_description: "RoundVoteSet",
                value_as_str: format!("{}/{}", proto.height, proto.round),
            }));
        }
        Ok(round_vote_set)
    }
}

/// All the votes of a height, by round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeightRoundVoteSet {
    height: Height,
    round_vote_sets: BTreeMap<Round, RoundVoteSet>,
}

impl HeightRoundVoteSet {
    pub fn new(height: Height) -> Self {
        Self { height, round_vote_sets: BTreeMap::new() }
    }

    pub fn height(&self) -> Height {
        self.height
    }

    /// Adds a vote, creating its round on first use.
    pub fn add_vote(&mut self, vote: Vote, validators: &ValidatorSet) -> Result<bool, VoteError> {
        if vote.height != self.height {
            return Err(VoteError::UnexpectedVote {
                vote: vote.to_string(),
                vote_type: vote.vote_type,
                height: self.height,
                round: vote.round,
            });
        }
        let height = self.height;
        self.round_vote_sets
            .entry(vote.round)
            .or_insert_with(|| RoundVoteSet::new(height, vote.round))
            .add_vote(vote, validators)
    }

    pub fn round_vote_set(&self, round: Round) -> Option<&RoundVoteSet> {
        self.round_vote_sets.get(&round)
    }

    pub fn prevotes(&self, round: Round) -> Option<&VoteSet> {
        self.round_vote_set(round).map(RoundVoteSet::prevotes)
    }

    pub fn precommits(&self, round: Round) -> Option<&VoteSet> {
        self.round_vote_set(round).map(RoundVoteSet::precommits)
    }

    pub fn to_proto(&self, current_round: Round) -> protobuf::HeightRoundVoteSet {
        protobuf::HeightRoundVoteSet {
            height: self.height,
            round: current_round,
            round_vote_sets: self
                .round_vote_sets
                .iter()
                .map(|(round, round_vote_set)| (*round, round_vote_set.to_proto()))
                .collect(),
        }
    }
}
