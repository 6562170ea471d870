//! Reconciliation with a single peer.

#[cfg(test)]
#[path = "peer_state_test.rs"]
mod peer_state_test;

use std::cmp::Ordering;
use std::sync::Arc;

use tbft_protobuf::consensus::{GossipState, Step, TbftMessage, Vote, VoteType};
use tbft_protobuf::protobuf;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::consensus::{CoreState, SharedState};
use crate::state::ConsensusState;
use crate::types::{MessageBus, ValidatorId};

const LOCK_POISONED: &str = "consensus state lock poisoned";

#[derive(Debug)]
pub(crate) enum PeerEvent {
    /// The local state may have changed.
    LocalState,
    /// The peer reported its state.
    RemoteState(GossipState),
}

/// Tracks the last state a peer reported and sends it what it is missing.
pub(crate) struct PeerState {
    id: ValidatorId,
    local_id: ValidatorId,
    shared: SharedState,
    message_bus: Arc<dyn MessageBus>,
    internal: mpsc::Sender<TbftMessage>,
    remote: Option<GossipState>,
}

impl PeerState {
    pub(crate) fn new(
        id: ValidatorId,
        local_id: ValidatorId,
        shared: SharedState,
        message_bus: Arc<dyn MessageBus>,
        internal: mpsc::Sender<TbftMessage>,
    ) -> Self {
        Self { id, local_id, shared, message_bus, internal, remote: None }
    }

    pub(crate) async fn run(mut self, mut events: mpsc::Receiver<PeerEvent>) {
        while let Some(event) = events.recv().await {
            let outbound = match event {
                PeerEvent::LocalState => self.on_local_state(),
                PeerEvent::RemoteState(state) => self.on_remote_state(state),
            };
            for message in outbound {
                self.message_bus.send_consensus_msg(&self.id, message.into());
            }
        }
    }

    fn on_local_state(&self) -> Vec<TbftMessage> {
        let core = self.shared.read().expect(LOCK_POISONED);
        let mut outbound = vec![TbftMessage::State(core.state.gossip_state())];
        outbound.extend(self.repairs(&core));
        outbound
    }

    fn on_remote_state(&mut self, state: GossipState) -> Vec<TbftMessage> {
        trace!(
            peer = %self.id,
            height = state.height,
            round = state.round,
            step = %state.step,
            "Peer state update."
        );
        self.remote = Some(state);
        let core = self.shared.read().expect(LOCK_POISONED);
        for message in self.missing_votes(&core) {
            if let Err(err) = self.internal.try_send(message) {
                debug!(peer = %self.id, %err, "Dropped a vote learned from a peer.");
            }
        }
        self.repairs(&core)
    }

    /// Votes in the peer's digest of the local round that this node has not counted yet, while
    /// they can still move the local step.
    pub(crate) fn missing_votes(&self, core: &CoreState) -> Vec<TbftMessage> {
        let Some(peer) = &self.remote else {
            return Vec::new();
        };
        let state = &core.state;
        if peer.height != state.height || peer.round != state.round {
            return Vec::new();
        }
        let Some(digest) = &peer.round_vote_set else {
            return Vec::new();
        };
        let local = state.height_round_vote_set.round_vote_set(state.round);
        let mut votes = Vec::new();
        for (vote_type, set, useful) in [
            (VoteType::Prevote, &digest.prevotes, state.step < Step::Precommit),
            (VoteType::Precommit, &digest.precommits, state.step < Step::Commit),
        ] {
            let Some(set) = set.as_ref().filter(|_| useful) else {
                continue;
            };
            for (voter, vote) in &set.votes {
                let counted =
                    local.is_some_and(|local| local.votes(vote_type).has_voted(voter));
                if *voter == self.local_id || counted {
                    continue;
                }
                match Vote::try_from(vote.clone()) {
                    Ok(vote) if vote.vote_type == vote_type => votes.push(vote_message(vote)),
                    Ok(vote) => debug!(peer = %self.id, %vote, "Misfiled vote in peer digest."),
                    Err(err) => debug!(peer = %self.id, %err, "Malformed vote in peer digest."),
                }
            }
        }
        votes
    }

    /// The proposal and the votes of this node that the peer is known to miss in its round.
    pub(crate) fn repairs(&self, core: &CoreState) -> Vec<TbftMessage> {
        let Some(peer) = &self.remote else {
            return Vec::new();
        };
        let state = match peer.height.cmp(&core.state.height) {
            Ordering::Equal => &core.state,
            Ordering::Less => match core.state_cache.get(peer.height) {
                Some(state) => state,
                None => {
                    trace!(peer = %self.id, height = peer.height, "No cached state for lagging peer.");
                    return Vec::new();
                }
            },
            Ordering::Greater => return Vec::new(),
        };

        let mut repairs = Vec::new();
        if let Some(proposal) = self.missing_proposal(state, peer) {
            repairs.push(proposal);
        }
        let Some(round_vote_set) = state.height_round_vote_set.round_vote_set(peer.round) else {
            return repairs;
        };
        for (vote_type, digest) in [
            (VoteType::Prevote, peer.round_vote_set.as_ref().and_then(|set| set.prevotes.as_ref())),
            (
                VoteType::Precommit,
                peer.round_vote_set.as_ref().and_then(|set| set.precommits.as_ref()),
            ),
        ] {
            let Some(vote) = round_vote_set.votes(vote_type).vote_of(&self.local_id) else {
                continue;
            };
            if !holds_vote(digest, &self.local_id) {
                repairs.push(vote_message(vote.clone()));
            }
        }
        repairs
    }

    fn missing_proposal(&self, state: &ConsensusState, peer: &GossipState) -> Option<TbftMessage> {
        let proposal = state.proposal.as_ref()?;
        let eligible = proposal.voter == self.local_id
            && proposal.round == peer.round
            && peer.step >= Step::Propose
            && peer.proposal.is_none()
            && peer.verifying_proposal.is_none();
        eligible.then(|| TbftMessage::Propose(proposal.clone()))
    }
}

fn holds_vote(digest: Option<&protobuf::VoteSet>, voter: &str) -> bool {
    digest.is_some_and(|set| set.votes.contains_key(voter))
}

fn vote_message(vote: Vote) -> TbftMessage {
    match vote.vote_type {
        VoteType::Prevote => TbftMessage::Prevote(vote),
        VoteType::Precommit => TbftMessage::Precommit(vote),
    }
}
