use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock};

use pretty_assertions::assert_eq;
use tbft_protobuf::consensus::{GossipState, Step, TbftMessage, Vote, VoteType};
use tokio::sync::mpsc;

use crate::consensus::CoreState;
use crate::peer_state::{PeerEvent, PeerState};
use crate::state::{ConsensusState, ConsensusStateCache};
use crate::test_utils::{
    signed_proposal,
    signed_vote,
    test_block,
    validator_set,
    BusEvent,
    ChannelBus,
};
use crate::votes::RoundVoteSet;

const LOCAL: &str = "validator_0";
const PEER: &str = "validator_1";
const HEIGHT: u64 = 7;

fn core_state(state: ConsensusState) -> CoreState {
    CoreState {
        state,
        validator_set: validator_set(),
        state_cache: ConsensusStateCache::new(NonZeroUsize::new(4).unwrap()),
    }
}

/// `validator_0` in the prevote step of round 0, holding its own proposal and prevote.
fn proposing_state(height: u64) -> ConsensusState {
    let mut state = ConsensusState::new(LOCAL.to_string(), height);
    state.step = Step::Prevote;
    let block = test_block(height, "tx");
    let hash = block.header.block_hash.clone();
    state.proposal = Some(signed_proposal(LOCAL, height, 0, block));
    state
        .height_round_vote_set
        .add_vote(signed_vote(VoteType::Prevote, LOCAL, height, 0, hash), &validator_set())
        .unwrap();
    state
}

fn own_vote(state: &ConsensusState, vote_type: VoteType) -> Vote {
    let round_vote_set = state.height_round_vote_set.round_vote_set(0).unwrap();
    round_vote_set.votes(vote_type).vote_of(LOCAL).unwrap().clone()
}

fn peer_state(height: u64, step: Step, votes: &[Vote]) -> GossipState {
    let mut round_vote_set = RoundVoteSet::new(height, 0);
    for vote in votes {
        round_vote_set.add_vote(vote.clone(), &validator_set()).unwrap();
    }
    GossipState {
        id: PEER.to_string(),
        height,
        round: 0,
        step,
        proposal: None,
        verifying_proposal: None,
        round_vote_set: Some(round_vote_set.to_proto()),
    }
}

/// A tracker of `validator_1` that last reported `remote`. Its shared state is never read by the
/// pure reconciliation functions.
fn tracker(remote: GossipState) -> PeerState {
    let (bus, _) = ChannelBus::new();
    let (internal, _) = mpsc::channel(1);
    let mut peer = PeerState::new(
        PEER.to_string(),
        LOCAL.to_string(),
        Arc::new(RwLock::new(core_state(ConsensusState::new(LOCAL.to_string(), 0)))),
        Arc::new(bus),
        internal,
    );
    peer.remote = Some(remote);
    peer
}

#[test]
fn repairs_proposal_and_votes_the_peer_misses() {
    let state = proposing_state(HEIGHT);
    let proposal = state.proposal.clone().unwrap();
    let prevote = own_vote(&state, VoteType::Prevote);
    let core = core_state(state);
    let peer = tracker(peer_state(HEIGHT, Step::Propose, &[]));

    assert_eq!(
        peer.repairs(&core),
        vec![TbftMessage::Propose(proposal), TbftMessage::Prevote(prevote)]
    );
}

#[test]
fn nothing_to_repair_for_a_peer_holding_everything() {
    let state = proposing_state(HEIGHT);
    let prevote = own_vote(&state, VoteType::Prevote);
    let mut remote = peer_state(HEIGHT, Step::Prevote, &[prevote]);
    remote.verifying_proposal = state.proposal_hash().cloned();
    let core = core_state(state);
    let peer = tracker(remote);

    assert!(peer.repairs(&core).is_empty());
}

#[test]
fn proposal_is_not_repaired_before_the_peer_reaches_propose() {
    let core = core_state(proposing_state(HEIGHT));
    let peer = tracker(peer_state(HEIGHT, Step::NewRound, &[]));

    let repairs = peer.repairs(&core);

    assert_eq!(repairs.len(), 1);
    assert!(matches!(repairs[0], TbftMessage::Prevote(_)));
}

#[test]
fn lagging_peer_is_served_from_the_state_cache() {
    let mut previous = proposing_state(HEIGHT);
    previous.step = Step::Commit;
    let hash = previous.proposal_hash().cloned();
    previous
        .height_round_vote_set
        .add_vote(signed_vote(VoteType::Precommit, LOCAL, HEIGHT, 0, hash), &validator_set())
        .unwrap();
    let prevote = own_vote(&previous, VoteType::Prevote);
    let precommit = own_vote(&previous, VoteType::Precommit);

    let mut core = core_state(ConsensusState::new(LOCAL.to_string(), HEIGHT + 1));
    core.state_cache.add(previous);
    let mut remote = peer_state(HEIGHT, Step::Precommit, &[prevote]);
    remote.proposal = core.state_cache.get(HEIGHT).unwrap().proposal_hash().cloned();
    let peer = tracker(remote);

    assert_eq!(peer.repairs(&core), vec![TbftMessage::Precommit(precommit)]);
}

#[test]
fn peer_ahead_gets_no_repairs() {
    let core = core_state(proposing_state(HEIGHT));
    let peer = tracker(peer_state(HEIGHT + 1, Step::Propose, &[]));

    assert!(peer.repairs(&core).is_empty());
}

#[test]
fn missing_votes_are_taken_from_the_peer_digest() {
    let mut state = proposing_state(HEIGHT);
    let hash = state.proposal_hash().cloned();
    let known = signed_vote(VoteType::Prevote, "validator_2", HEIGHT, 0, hash.clone());
    state.height_round_vote_set.add_vote(known.clone(), &validator_set()).unwrap();
    let own = own_vote(&state, VoteType::Prevote);
    let prevote = signed_vote(VoteType::Prevote, PEER, HEIGHT, 0, hash.clone());
    let precommit = signed_vote(VoteType::Precommit, PEER, HEIGHT, 0, hash);
    let core = core_state(state);
    let digest = [own, known, prevote.clone(), precommit.clone()];
    let peer = tracker(peer_state(HEIGHT, Step::Precommit, &digest));

    assert_eq!(
        peer.missing_votes(&core),
        vec![TbftMessage::Prevote(prevote), TbftMessage::Precommit(precommit)]
    );
}

#[test]
fn prevotes_are_not_ingested_past_the_prevote_step() {
    let mut state = proposing_state(HEIGHT);
    state.step = Step::Precommit;
    let hash = state.proposal_hash().cloned();
    let prevote = signed_vote(VoteType::Prevote, PEER, HEIGHT, 0, hash);
    let core = core_state(state);
    let peer = tracker(peer_state(HEIGHT, Step::Precommit, &[prevote]));

    assert!(peer.missing_votes(&core).is_empty());
}

#[test]
fn votes_of_another_round_are_not_ingested() {
    let mut state = proposing_state(HEIGHT);
    state.round = 1;
    let prevote = signed_vote(VoteType::Prevote, PEER, HEIGHT, 0, None);
    let core = core_state(state);
    let peer = tracker(peer_state(HEIGHT, Step::Prevote, &[prevote]));

    assert!(peer.missing_votes(&core).is_empty());
}

#[tokio::test]
async fn remote_state_feeds_votes_to_the_engine_and_repairs_the_peer() {
    let state = proposing_state(HEIGHT);
    let proposal = state.proposal.clone().unwrap();
    let prevote = signed_vote(VoteType::Prevote, PEER, HEIGHT, 0, state.proposal_hash().cloned());
    let (bus, mut bus_events) = ChannelBus::new();
    let (internal, mut internal_receiver) = mpsc::channel(16);
    let peer = PeerState::new(
        PEER.to_string(),
        LOCAL.to_string(),
        Arc::new(RwLock::new(core_state(state))),
        Arc::new(bus),
        internal,
    );
    let (events, receiver) = mpsc::channel(4);
    tokio::spawn(peer.run(receiver));

    let mut remote = peer_state(HEIGHT, Step::Prevote, &[prevote.clone()]);
    remote.verifying_proposal = proposal.block_hash().cloned();
    events.send(PeerEvent::RemoteState(remote)).await.unwrap();

    assert_eq!(internal_receiver.recv().await.unwrap(), TbftMessage::Prevote(prevote));
    let BusEvent::Send { to, payload } = bus_events.recv().await.unwrap() else {
        panic!("expected an outbound message");
    };
    assert_eq!(to, PEER);
    assert!(matches!(
        TbftMessage::try_from(payload).unwrap(),
        TbftMessage::Prevote(vote) if vote.voter == LOCAL
    ));
}

#[tokio::test]
async fn local_state_is_shipped_to_the_peer() {
    let (bus, mut bus_events) = ChannelBus::new();
    let (internal, _internal_receiver) = mpsc::channel(16);
    let peer = PeerState::new(
        PEER.to_string(),
        LOCAL.to_string(),
        Arc::new(RwLock::new(core_state(proposing_state(HEIGHT)))),
        Arc::new(bus),
        internal,
    );
    let (events, receiver) = mpsc::channel(4);
    tokio::spawn(peer.run(receiver));

    events.send(PeerEvent::LocalState).await.unwrap();

    let BusEvent::Send { to, payload } = bus_events.recv().await.unwrap() else {
        panic!("expected an outbound message");
    };
    assert_eq!(to, PEER);
    let TbftMessage::State(state) = TbftMessage::try_from(payload).unwrap() else {
        panic!("expected the local gossip state first");
    };
    assert_eq!((state.id.as_str(), state.height, state.step), (LOCAL, HEIGHT, Step::Prevote));
}
