use std::num::NonZeroUsize;

use tbft_protobuf::consensus::{Block, BlockHash, Proposal, Step, Vote, VoteType};

use crate::state::{ConsensusState, ConsensusStateCache};
use crate::validator_set::ValidatorSet;

fn proposal(height: u64, round: u32, hash: u8) -> Proposal {
    let mut block = Block::default();
    block.header.height = height;
    block.header.block_hash = Some(BlockHash(vec![hash; 4]));
    Proposal::new("node_a".to_string(), height, round, None, block)
}

#[test]
fn fresh_state_starts_at_new_height() {
    let state = ConsensusState::new("node_a".to_string(), 4);

    assert_eq!((state.height, state.round, state.step), (4, 0, Step::NewHeight));
    assert!(state.proposal.is_none());
    assert!(state.height_round_vote_set.round_vote_set(0).is_none());
}

#[test]
fn gossip_state_carries_current_round() {
    let validators =
        ValidatorSet::new(["node_a".to_string(), "node_b".to_string()], 1).unwrap();
    let mut state = ConsensusState::new("node_a".to_string(), 2);
    state.round = 1;
    state.step = Step::Prevote;
    state.proposal = Some(proposal(2, 1, 7));
    for round in [0, 1] {
        state
            .height_round_vote_set
            .add_vote(
                Vote::new(VoteType::Prevote, "node_b".to_string(), 2, round, None),
                &validators,
            )
            .unwrap();
    }

    let gossip = state.gossip_state();

    assert_eq!((gossip.height, gossip.round, gossip.step), (2, 1, Step::Prevote));
    assert_eq!(gossip.proposal, Some(BlockHash(vec![7; 4])));
    assert_eq!(gossip.verifying_proposal, None);
    assert_eq!(gossip.round_vote_set.unwrap().round, 1);
}

#[test]
fn proto_encodes_missing_rounds_as_negative() {
    let mut state = ConsensusState::new("node_a".to_string(), 9);
    state.valid_round = Some(2);
    state.valid_proposal = Some(proposal(9, 2, 1));

    let proto = state.to_proto();

    assert_eq!(proto.locked_round, -1);
    assert_eq!(proto.valid_round, 2);
    assert!(proto.locked_proposal.is_none());
    assert_eq!(proto.height_round_vote_set.unwrap().height, 9);
}

#[test]
fn cache_evicts_oldest_height() {
    let mut cache = ConsensusStateCache::new(NonZeroUsize::new(2).unwrap());
    cache.add(ConsensusState::new("node_a".to_string(), 1));
    cache.add(ConsensusState::new("node_a".to_string(), 2));
    // Reading must not keep a height alive.
    assert_eq!(cache.get(1).unwrap().height, 1);
    cache.add(ConsensusState::new("node_a".to_string(), 3));

    assert_eq!(cache.len(), 2);
    assert!(cache.get(1).is_none());
    assert_eq!(cache.get(3).unwrap().height, 3);
}
