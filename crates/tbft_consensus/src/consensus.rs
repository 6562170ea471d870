//! The consensus engine.
//!
//! [`ConsensusCore`] is a single task that owns the protocol state of the node and drives it from
//! a fixed set of bounded input queues: blocks built by the local producer, verification results,
//! ledger heights, wire messages from peers, votes ingested from peer digests and fired timeouts.
//! Every input is processed to completion under the write lock of the shared state, so no two
//! transitions interleave. Gossip tasks only ever take the read lock.
//!
//! Transitions are guarded by the exact (height, round, step) they start from, which makes stale
//! and duplicated inputs harmless. Accepted proposals, accepted votes and fired timeouts are
//! appended to the WAL before they take effect, and replayed through the same transitions after a
//! restart.

#[cfg(test)]
#[path = "consensus_test.rs"]
mod consensus_test;

use std::collections::VecDeque;
use std::mem;
use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock};

use tbft_consensus_config::chain::{verify_chain_config, TbftChainParams};
use tbft_consensus_config::config::ConsensusConfig;
use tbft_consensus_config::ConfigError;
use tbft_protobuf::consensus::{
    display_hash,
    Block,
    BlockHash,
    Endorsement,
    Proposal,
    Step,
    TbftMessage,
    TimeoutInfo,
    Vote,
    VoteType,
    WalEntry,
    WalEntryType,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, trace, warn};
use validator::Validate;

use crate::certificate::attach_quorum_certificate;
use crate::gossip::GossipService;
use crate::metrics::{
    register_metrics,
    HeightMetrics,
    CONSENSUS_BLOCKS_COMMITTED,
    CONSENSUS_CONFLICTING_VOTES,
    CONSENSUS_HEIGHT,
    CONSENSUS_PROPOSALS_INVALID,
    CONSENSUS_PROPOSALS_RECEIVED,
    CONSENSUS_ROUND,
    CONSENSUS_TIMEOUTS,
    CONSENSUS_VOTES_REJECTED,
    LABEL_NAME_TIMEOUT_STEP,
};
use crate::state::{ConsensusState, ConsensusStateCache};
use crate::time_scheduler::TimeScheduler;
use crate::types::{
    ConsensusContext,
    ConsensusError,
    ConsensusResult,
    ConsensusStatus,
    Height,
    Round,
    ValidatorId,
    VerifyResult,
};
use crate::validator_set::ValidatorSet;
use crate::votes::{VoteError, VoteSet};
use crate::wal::{Wal, WalError};

const LOCK_POISONED: &str = "consensus state lock poisoned";

/// The state read by gossip tasks and mutated only by the engine.
#[derive(Debug)]
pub(crate) struct CoreState {
    pub(crate) state: ConsensusState,
    pub(crate) validator_set: ValidatorSet,
    /// Superseded heights, served to lagging peers.
    pub(crate) state_cache: ConsensusStateCache,
}

pub(crate) type SharedState = Arc<RwLock<CoreState>>;

/// Entry points of a running engine. The engine stops once every handle is dropped.
#[derive(Clone, Debug)]
pub struct ConsensusHandle {
    proposed_block: mpsc::Sender<Block>,
    verify_result: mpsc::Sender<VerifyResult>,
    block_info: mpsc::Sender<Height>,
    consensus_msg: mpsc::Sender<Vec<u8>>,
    shared: SharedState,
}

impl ConsensusHandle {
    /// A block built by the local producer after the engine signaled it may propose.
    pub async fn proposed_block(&self, block: Block) -> ConsensusResult<()> {
        self.proposed_block.send(block).await.map_err(|_| ConsensusError::Stopped)
    }

    pub async fn verify_result(&self, result: VerifyResult) -> ConsensusResult<()> {
        self.verify_result.send(result).await.map_err(|_| ConsensusError::Stopped)
    }

    /// Notifies the engine that the ledger committed the block at `height`.
    pub async fn block_info(&self, height: Height) -> ConsensusResult<()> {
        self.block_info.send(height).await.map_err(|_| ConsensusError::Stopped)
    }

    /// A wire-encoded message received from a peer.
    pub async fn consensus_msg(&self, payload: Vec<u8>) -> ConsensusResult<()> {
        self.consensus_msg.send(payload).await.map_err(|_| ConsensusError::Stopped)
    }

    pub fn status(&self) -> ConsensusStatus {
        self.shared.read().expect(LOCK_POISONED).state.status()
    }
}

#[derive(Debug)]
enum Event {
    ProposedBlock(Block),
    VerifyResult(VerifyResult),
    BlockInfo(Height),
    ConsensusMsg(Vec<u8>),
    Internal(TbftMessage),
    Timeout(TimeoutInfo),
}

/// Where a consensus message came from. Only messages this node produced itself skip
/// signature checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Local,
    Remote,
}

pub struct ConsensusCore {
    config: ConsensusConfig,
    context: ConsensusContext,
    shared: SharedState,
    chain_params: TbftChainParams,
    wal: Wal,
    /// WAL index of the first entry of the current height.
    height_first_index: u64,
    scheduler: TimeScheduler,
    gossip: GossipService,
    height_metrics: HeightMetrics,
    replaying: bool,
    /// Votes cast by this node, processed right after the event that produced them.
    self_messages: VecDeque<TbftMessage>,
    proposed_block_receiver: mpsc::Receiver<Block>,
    verify_result_receiver: mpsc::Receiver<VerifyResult>,
    block_info_receiver: mpsc::Receiver<Height>,
    consensus_msg_receiver: mpsc::Receiver<Vec<u8>>,
    internal_receiver: mpsc::Receiver<TbftMessage>,
    timeout_receiver: mpsc::Receiver<TimeoutInfo>,
}

impl ConsensusCore {
    /// Builds an engine from the node configuration and the chain's current consensus
    /// parameters. Must be called from within a tokio runtime.
    pub fn new(
        config: ConsensusConfig,
        context: ConsensusContext,
    ) -> ConsensusResult<(Self, ConsensusHandle)> {
        config.validate().map_err(ConfigError::from)?;
        let chain_config = context.chain_config.chain_consensus_config()?;
        verify_chain_config(&chain_config)?;
        let chain_params = TbftChainParams::extract(&chain_config)?;
        let validator_set = ValidatorSet::new(
            chain_params.validators.iter().cloned(),
            chain_params.blocks_per_proposer,
        )?;

        let id = config.validator_id.clone();
        if !validator_set.has_validator(&id) {
            warn!(%id, "This node is not in the validator set.");
        }
        let wal = Wal::open(&config.wal_dir, config.wal_max_entry_size, config.wal_sync_on_write)?;
        let height_first_index = wal.last_index() + 1;

        let peers = validator_set.validators().to_vec();
        let shared = Arc::new(RwLock::new(CoreState {
            state: ConsensusState::new(id.clone(), 0),
            validator_set,
            state_cache: ConsensusStateCache::new(
                NonZeroUsize::new(config.state_cache_size).unwrap_or(NonZeroUsize::MIN),
            ),
        }));

        let capacity = config.channel_capacity;
        let (scheduler, timeout_receiver) = TimeScheduler::start(id.clone(), capacity);
        let (internal_sender, internal_receiver) = mpsc::channel(capacity);
        let gossip = GossipService::new(
            id,
            Arc::clone(&shared),
            Arc::clone(&context.message_bus),
            internal_sender,
            capacity,
            config.gossip_interval,
        );
        for peer in &peers {
            gossip.add_peer(peer);
        }

        let (proposed_block, proposed_block_receiver) = mpsc::channel(capacity);
        let (verify_result, verify_result_receiver) = mpsc::channel(capacity);
        let (block_info, block_info_receiver) = mpsc::channel(capacity);
        let (consensus_msg, consensus_msg_receiver) = mpsc::channel(capacity);
        let handle = ConsensusHandle {
            proposed_block,
            verify_result,
            block_info,
            consensus_msg,
            shared: Arc::clone(&shared),
        };

        let core = Self {
            config,
            context,
            shared,
            chain_params,
            wal,
            height_first_index,
            scheduler,
            gossip,
            height_metrics: HeightMetrics::new(0),
            replaying: false,
            self_messages: VecDeque::new(),
            proposed_block_receiver,
            verify_result_receiver,
            block_info_receiver,
            consensus_msg_receiver,
            internal_receiver,
            timeout_receiver,
        };
        Ok((core, handle))
    }

    /// Replays the WAL, then processes inputs until every [`ConsensusHandle`] is dropped or a
    /// fatal error occurs.
    #[instrument(skip_all, fields(id = %self.config.validator_id))]
    pub async fn run(mut self) -> ConsensusResult<()> {
        register_metrics();
        self.replay_wal()?;
        self.gossip.start();

        loop {
            let event = tokio::select! {
                Some(block) = self.proposed_block_receiver.recv() => Event::ProposedBlock(block),
                Some(result) = self.verify_result_receiver.recv() => Event::VerifyResult(result),
                Some(height) = self.block_info_receiver.recv() => Event::BlockInfo(height),
                message = self.consensus_msg_receiver.recv() => match message {
                    Some(payload) => Event::ConsensusMsg(payload),
                    None => {
                        info!("All consensus handles dropped, stopping.");
                        return Ok(());
                    }
                },
                Some(message) = self.internal_receiver.recv() => Event::Internal(message),
                Some(timeout) = self.timeout_receiver.recv() => Event::Timeout(timeout),
            };
            self.handle_event(event)?;
        }
    }

    fn handle_event(&mut self, event: Event) -> ConsensusResult<()> {
        trace!(?event, "Handling event.");
        let shared = Arc::clone(&self.shared);
        let mut core = shared.write().expect(LOCK_POISONED);
        let handled = match event {
            Event::ProposedBlock(block) => self.handle_proposed_block(&mut core, block),
            Event::VerifyResult(result) => self.handle_verify_result(&mut core, result),
            Event::BlockInfo(height) => self.handle_block_height(&mut core, height),
            Event::ConsensusMsg(payload) => TbftMessage::try_from(payload)
                .map_err(ConsensusError::from)
                .and_then(|message| self.handle_message(&mut core, message, Origin::Remote)),
            Event::Internal(message) => self.handle_message(&mut core, message, Origin::Remote),
            Event::Timeout(timeout) => self.handle_timeout(&mut core, timeout),
        };
        escalate_fatal(handled)?;
        self.process_self_messages(&mut core)
    }

    fn process_self_messages(&mut self, core: &mut CoreState) -> ConsensusResult<()> {
        while let Some(message) = self.self_messages.pop_front() {
            escalate_fatal(self.handle_message(core, message, Origin::Local))?;
        }
        Ok(())
    }

    fn handle_message(
        &mut self,
        core: &mut CoreState,
        message: TbftMessage,
        origin: Origin,
    ) -> ConsensusResult<()> {
        match message {
            TbftMessage::Propose(proposal) => self.proc_propose(core, proposal),
            TbftMessage::Prevote(vote) | TbftMessage::Precommit(vote) => {
                self.proc_vote(core, vote, origin)
            }
            TbftMessage::State(state) => {
                self.gossip.on_remote_state(state);
                Ok(())
            }
        }
    }

    fn handle_proposed_block(&mut self, core: &mut CoreState, mut block: Block) -> ConsensusResult<()> {
        let state = &core.state;
        if block.height() != state.height {
            warn!(
                height = state.height,
                block_height = block.height(),
                "Proposed block is for another height, ignoring."
            );
            return Ok(());
        }
        if !core.validator_set.is_proposer(&state.id, state.height, state.round) {
            warn!(height = state.height, round = state.round, "Not the proposer, ignoring block.");
            return Ok(());
        }
        if state.step != Step::Propose || state.proposal.is_some() {
            warn!(
                height = state.height,
                round = state.round,
                step = %state.step,
                "Proposed block arrived outside the propose step, ignoring."
            );
            return Ok(());
        }

        let signer = &self.context.signer;
        let hash = signer.hash_block(&block)?;
        block.header.signature = signer.sign(hash.as_bytes())?;
        block.header.proposer = signer.member()?;
        block.header.block_hash = Some(hash);
        self.propose(core, block, None)
    }

    /// Signs and adopts a proposal of `block` for the current round, then prevotes for it.
    fn propose(
        &mut self,
        core: &mut CoreState,
        block: Block,
        pol_round: Option<Round>,
    ) -> ConsensusResult<()> {
        let state = &core.state;
        let (height, round) = (state.height, state.round);
        let mut proposal = Proposal::new(state.id.clone(), height, round, pol_round, block);
        proposal.endorsement = Some(self.endorse(&proposal.signing_bytes())?);
        info!(
            height,
            round,
            ?pol_round,
            hash = %display_hash(proposal.block_hash()),
            "Proposing block."
        );
        self.accept_proposal(core, proposal)?;
        self.enter_prevote(core, height, round)
    }

    fn handle_verify_result(
        &mut self,
        core: &mut CoreState,
        result: VerifyResult,
    ) -> ConsensusResult<()> {
        let state = &core.state;
        let (height, round) = (state.height, state.round);
        let Some(verifying) = state.verifying_proposal.clone() else {
            error!(
                height,
                round,
                block_height = result.block.height(),
                "Verify result without a proposal being verified."
            );
            return Ok(());
        };
        if result.block.height() != height || verifying.round != round {
            debug!(height, round, "Stale verify result, ignoring.");
            return Ok(());
        }
        if !result.success {
            warn!(height, round, voter = %verifying.voter, "Proposal failed verification.");
            CONSENSUS_PROPOSALS_INVALID.increment(1);
            core.state.verifying_proposal = None;
            self.gossip.trigger();
            return Ok(());
        }
        if result.block.hash() != verifying.block_hash() {
            warn!(
                height,
                round,
                verified = %display_hash(result.block.hash()),
                verifying = %display_hash(verifying.block_hash()),
                "Verify result is for another block."
            );
            core.state.verifying_proposal = None;
            self.gossip.trigger();
            return Ok(());
        }

        let precommit_quorum =
            state.height_round_vote_set.precommits(round).and_then(VoteSet::two_thirds_majority);
        if let Some(Some(hash)) = precommit_quorum {
            if Some(hash) == verifying.block_hash() {
                info!(height, round, %hash, "Verified the block precommitted by a quorum.");
                self.accept_proposal(core, verifying)?;
                if core.state.step != Step::Commit {
                    core.state.step = Step::Commit;
                    self.height_metrics.set_enter_time(round, Step::Commit);
                }
                return self.commit(core);
            }
        }
        if state.step != Step::Propose {
            debug!(height, round, step = %state.step, "Verified proposal arrived too late.");
            core.state.verifying_proposal = None;
            self.gossip.trigger();
            return Ok(());
        }
        self.accept_proposal(core, verifying)?;
        self.enter_prevote(core, height, round)
    }

    fn accept_proposal(&mut self, core: &mut CoreState, proposal: Proposal) -> ConsensusResult<()> {
        self.write_wal(proposal.height, WalEntryType::Proposal, proposal.clone().into())?;
        core.state.verifying_proposal = None;
        core.state.proposal = Some(proposal);
        self.gossip.trigger();
        Ok(())
    }

    fn handle_block_height(&mut self, core: &mut CoreState, height: Height) -> ConsensusResult<()> {
        if core.state.height > height {
            debug!(height, current = core.state.height, "Stale ledger height, ignoring.");
            return Ok(());
        }
        self.enter_new_height(core, height.saturating_add(1))
    }

    fn handle_timeout(&mut self, core: &mut CoreState, timeout: TimeoutInfo) -> ConsensusResult<()> {
        let state = &core.state;
        if timeout.height != state.height || timeout.round != state.round {
            debug!(height = state.height, round = state.round, %timeout, "Stale timeout, ignoring.");
            return Ok(());
        }
        info!(step = %state.step, %timeout, "Timeout fired.");
        self.write_wal(timeout.height, WalEntryType::Timeout, timeout.clone().into())?;
        CONSENSUS_TIMEOUTS
            .increment(1, &[(LABEL_NAME_TIMEOUT_STEP, <&'static str>::from(timeout.step))]);

        match timeout.step {
            Step::Prevote => self.enter_prevote(core, timeout.height, timeout.round),
            Step::Precommit => self.enter_precommit(core, timeout.height, timeout.round),
            Step::Commit => self.enter_commit(core, timeout.height, timeout.round),
            step => {
                warn!(%timeout, "No transition is driven by a {step} timeout.");
                Ok(())
            }
        }
    }

    fn proc_propose(&mut self, core: &mut CoreState, proposal: Proposal) -> ConsensusResult<()> {
        CONSENSUS_PROPOSALS_RECEIVED.increment(1);
        if !self.verify_principal(
            &proposal.voter,
            proposal.endorsement.as_ref(),
            &proposal.signing_bytes(),
        )? {
            warn!(voter = %proposal.voter, "Proposal failed authentication, ignoring.");
            CONSENSUS_PROPOSALS_INVALID.increment(1);
            return Ok(());
        }

        let state = &core.state;
        let (height, round) = (state.height, state.round);
        // A precommit quorum for a block this node never received keeps the round open for it.
        let waiting_for_block = state.proposal.is_none()
            && matches!(
                state.height_round_vote_set.precommits(round).and_then(VoteSet::two_thirds_majority),
                Some(Some(_))
            );
        if proposal.height != height
            || proposal.round != round
            || !(state.step == Step::Propose || waiting_for_block)
        {
            debug!(
                height,
                round,
                step = %state.step,
                proposal_height = proposal.height,
                proposal_round = proposal.round,
                "Proposal at an unexpected position, ignoring."
            );
            return Ok(());
        }
        if !core.validator_set.is_proposer(&proposal.voter, height, round) {
            warn!(height, round, voter = %proposal.voter, "Proposal from a non-proposer, ignoring.");
            CONSENSUS_PROPOSALS_INVALID.increment(1);
            return Ok(());
        }
        if proposal.block.height() != height || proposal.block_hash().is_none() {
            warn!(height, round, voter = %proposal.voter, "Malformed proposed block, ignoring.");
            CONSENSUS_PROPOSALS_INVALID.increment(1);
            return Ok(());
        }
        if let Some(existing) = state.proposal.as_ref().or(state.verifying_proposal.as_ref()) {
            if existing.block_hash() == proposal.block_hash() {
                trace!(height, round, "Duplicate proposal.");
            } else {
                warn!(
                    height,
                    round,
                    existing = %display_hash(existing.block_hash()),
                    conflicting = %display_hash(proposal.block_hash()),
                    "Conflicting proposal, ignoring."
                );
            }
            return Ok(());
        }

        info!(
            height,
            round,
            voter = %proposal.voter,
            hash = %display_hash(proposal.block_hash()),
            "Received proposal, verifying block."
        );
        let block = proposal.block.clone();
        core.state.verifying_proposal = Some(proposal);
        self.gossip.trigger();
        self.context.message_bus.verify_block(block);
        Ok(())
    }

    fn proc_vote(&mut self, core: &mut CoreState, vote: Vote, origin: Origin) -> ConsensusResult<()> {
        let state = &core.state;
        let last_step = match vote.vote_type {
            VoteType::Prevote => Step::Prevote,
            VoteType::Precommit => Step::Precommit,
        };
        if vote.height != state.height
            || vote.round < state.round
            || (vote.round == state.round && state.step > last_step)
        {
            trace!(height = state.height, round = state.round, step = %state.step, %vote, "Stale vote.");
            return Ok(());
        }
        // Remote votes are authenticated even when they carry this node's id.
        if origin == Origin::Remote
            && !self.verify_principal(&vote.voter, vote.endorsement.as_ref(), &vote.signing_bytes())?
        {
            warn!(%vote, "Vote failed authentication, ignoring.");
            CONSENSUS_VOTES_REJECTED.increment(1);
            return Ok(());
        }
        self.add_vote(core, vote)
    }

    /// Whether `endorsement` is a valid signature over `message` by the validator `voter`.
    fn verify_principal(
        &self,
        voter: &str,
        endorsement: Option<&Endorsement>,
        message: &[u8],
    ) -> ConsensusResult<bool> {
        let Some(endorsement) = endorsement else {
            return Ok(false);
        };
        let access_control = &self.context.access_control;
        if !access_control.verify_endorsement(endorsement, message)? {
            return Ok(false);
        }
        Ok(access_control.node_id(&endorsement.signer)? == voter)
    }

    fn add_vote(&mut self, core: &mut CoreState, vote: Vote) -> ConsensusResult<()> {
        let (vote_type, height, round) = (vote.vote_type, vote.height, vote.round);
        let own = vote.voter == core.state.id;
        match core.state.height_round_vote_set.add_vote(vote.clone(), &core.validator_set) {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(err) => {
                if matches!(err, VoteError::ConflictingVote { .. }) {
                    CONSENSUS_CONFLICTING_VOTES.increment(1);
                } else {
                    CONSENSUS_VOTES_REJECTED.increment(1);
                }
                warn!(%err, "Rejected vote.");
                return Ok(());
            }
        }
        debug!(%vote, "Added vote.");
        self.write_wal(height, WalEntryType::Vote, vote.into())?;
        if own {
            self.gossip.trigger();
        }
        match vote_type {
            VoteType::Prevote => self.add_prevote_vote(core, round),
            VoteType::Precommit => self.add_precommit_vote(core, round),
        }
    }

    fn add_prevote_vote(&mut self, core: &mut CoreState, round: Round) -> ConsensusResult<()> {
        let state = &core.state;
        if state.step != Step::Prevote || round != state.round {
            return Ok(());
        }
        let height = state.height;
        let Some(prevotes) = state.height_round_vote_set.prevotes(round) else {
            return Ok(());
        };
        match prevotes.two_thirds_majority() {
            None => {
                if prevotes.has_two_thirds_any(&core.validator_set) {
                    debug!(height, round, "No prevote quorum is possible anymore.");
                    return self.enter_precommit(core, height, round);
                }
                if prevotes.has_two_thirds_no_majority(&core.validator_set)
                    && !state.triggered_timeout_prevote
                {
                    let duration = self.config.timeouts.prevote.get_timeout(round);
                    debug!(height, round, ?duration, "Prevotes of a quorum without a majority.");
                    self.scheduler.add_timeout_info(TimeoutInfo::new(
                        duration,
                        height,
                        round,
                        Step::Precommit,
                    ));
                    core.state.triggered_timeout_prevote = true;
                }
                Ok(())
            }
            Some(maj23) => {
                match (maj23, state.proposal_hash()) {
                    (Some(hash), Some(proposal)) if hash != proposal => {
                        warn!(
                            height,
                            round,
                            %hash,
                            %proposal,
                            "Prevote quorum does not match the proposal."
                        );
                    }
                    (Some(hash), None) => {
                        warn!(height, round, %hash, "Prevote quorum for a block never received.");
                        return Ok(());
                    }
                    _ => {}
                }
                self.enter_precommit(core, height, round)
            }
        }
    }

    fn add_precommit_vote(&mut self, core: &mut CoreState, round: Round) -> ConsensusResult<()> {
        let state = &core.state;
        if state.step != Step::Precommit || round != state.round {
            return Ok(());
        }
        let height = state.height;
        let Some(precommits) = state.height_round_vote_set.precommits(round) else {
            return Ok(());
        };
        match precommits.two_thirds_majority() {
            None => {
                if precommits.has_two_thirds_any(&core.validator_set) {
                    debug!(height, round, "No precommit quorum is possible anymore.");
                    return self.enter_commit(core, height, round);
                }
                if precommits.has_two_thirds_no_majority(&core.validator_set)
                    && !state.triggered_timeout_precommit
                {
                    let duration = self.config.timeouts.precommit.get_timeout(round);
                    debug!(height, round, ?duration, "Precommits of a quorum without a majority.");
                    self.scheduler.add_timeout_info(TimeoutInfo::new(
                        duration,
                        height,
                        round,
                        Step::Commit,
                    ));
                    core.state.triggered_timeout_precommit = true;
                }
                Ok(())
            }
            Some(Some(hash)) => match state.proposal_hash() {
                Some(proposal) if proposal != hash => {
                    error!(height, round, %hash, %proposal, "Precommit quorum conflicts with the proposal.");
                    Ok(())
                }
                _ => self.enter_commit(core, height, round),
            },
            Some(None) => self.enter_commit(core, height, round),
        }
    }

    fn enter_new_height(&mut self, core: &mut CoreState, height: Height) -> ConsensusResult<()> {
        if height <= core.state.height {
            debug!(height, current = core.state.height, "Not a new height, ignoring.");
            return Ok(());
        }
        let (added, removed) = self.update_chain_config(core);
        for peer in &added {
            self.gossip.add_peer(peer);
        }
        for peer in &removed {
            self.gossip.remove_peer(peer);
        }

        if !self.replaying {
            let last_index = self.wal.last_index();
            self.height_first_index = last_index + 1;
            if height.checked_rem(self.config.wal_truncate_interval) == Some(0) && last_index > 0 {
                if let Err(err) = self.wal.truncate_front(last_index) {
                    warn!(height, %err, "Failed to truncate the WAL.");
                }
            }
        }

        let fresh = ConsensusState::new(core.state.id.clone(), height);
        let previous = mem::replace(&mut core.state, fresh);
        if previous.height > 0 {
            self.save_snapshot(&previous);
            core.state_cache.add(previous);
        }

        info!(height, "Entering new height.");
        self.height_metrics = HeightMetrics::new(height);
        CONSENSUS_HEIGHT.absolute(height);
        self.enter_new_round(core, height, 0)
    }

    /// Re-reads the chain parameters, returning the validators (added, removed). The current
    /// parameters stay in force if the chain configuration cannot be read.
    fn update_chain_config(&mut self, core: &mut CoreState) -> (Vec<ValidatorId>, Vec<ValidatorId>) {
        let params = self.context.chain_config.chain_consensus_config().and_then(|config| {
            verify_chain_config(&config)?;
            Ok(TbftChainParams::extract(&config)?)
        });
        let params = match params {
            Ok(params) => params,
            Err(err) => {
                warn!(%err, "Keeping the current chain parameters.");
                return (Vec::new(), Vec::new());
            }
        };
        if let Err(err) = core.validator_set.update_blocks_per_proposer(params.blocks_per_proposer)
        {
            warn!(%err, "Keeping the current blocks per proposer.");
        }
        let diff = core.validator_set.update_validators(params.validators.iter().cloned());
        self.chain_params = params;
        diff
    }

    fn save_snapshot(&self, state: &ConsensusState) {
        let Some(store) = &self.context.snapshot_store else {
            return;
        };
        if state.height.checked_rem(self.config.snapshot_interval) != Some(0) {
            return;
        }
        if let Err(err) = store.save_consensus_state(state.height, state.encode()) {
            warn!(height = state.height, %err, "Failed to save the consensus state snapshot.");
        }
    }

    fn enter_new_round(
        &mut self,
        core: &mut CoreState,
        height: Height,
        round: Round,
    ) -> ConsensusResult<()> {
        let state = &mut core.state;
        if state.height != height
            || round < state.round
            || (round == state.round && state.step != Step::NewHeight)
        {
            debug!(
                height = state.height,
                round = state.round,
                step = %state.step,
                "Ignoring transition to round {round}."
            );
            return Ok(());
        }
        debug!(height, round, "Entering new round.");
        state.round = round;
        state.step = Step::NewRound;
        state.proposal = None;
        state.verifying_proposal = None;
        state.triggered_timeout_prevote = false;
        state.triggered_timeout_precommit = false;
        self.height_metrics.set_enter_time(round, Step::NewRound);
        CONSENSUS_ROUND.set(round);
        self.enter_propose(core, height, round)
    }

    fn enter_propose(&mut self, core: &mut CoreState, height: Height, round: Round) -> ConsensusResult<()> {
        if !can_transition(&core.state, height, round, Step::NewRound, Step::Propose) {
            return Ok(());
        }
        let state = &mut core.state;
        state.step = Step::Propose;
        self.height_metrics.set_enter_time(round, Step::Propose);
        self.scheduler.add_timeout_info(TimeoutInfo::new(
            self.chain_params.propose_timeout(round),
            height,
            round,
            Step::Prevote,
        ));
        self.gossip.trigger();

        if !core.validator_set.is_proposer(&state.id, height, round) {
            return Ok(());
        }
        if let (Some(valid_round), Some(valid_proposal)) =
            (state.valid_round, state.valid_proposal.clone())
        {
            info!(height, round, valid_round, "Re-proposing the valid block.");
            return self.propose(core, valid_proposal.block, Some(valid_round));
        }
        info!(height, round, "This node is the proposer.");
        if !self.replaying {
            self.context.message_bus.propose_state(true);
        }
        Ok(())
    }

    fn enter_prevote(&mut self, core: &mut CoreState, height: Height, round: Round) -> ConsensusResult<()> {
        if !can_transition(&core.state, height, round, Step::Propose, Step::Prevote) {
            return Ok(());
        }
        core.state.step = Step::Prevote;
        self.height_metrics.set_enter_time(round, Step::Prevote);
        if !self.replaying {
            self.context.message_bus.propose_state(false);
        }

        let hash = prevote_hash(&core.state);
        debug!(height, round, hash = %display_hash(hash.as_ref()), "Prevoting.");
        let vote = self.sign_vote(&core.state, VoteType::Prevote, hash)?;
        self.self_messages.push_back(TbftMessage::Prevote(vote));
        Ok(())
    }

    fn enter_precommit(
        &mut self,
        core: &mut CoreState,
        height: Height,
        round: Round,
    ) -> ConsensusResult<()> {
        if !can_transition(&core.state, height, round, Step::Prevote, Step::Precommit) {
            return Ok(());
        }
        let state = &mut core.state;
        state.step = Step::Precommit;
        self.height_metrics.set_enter_time(round, Step::Precommit);

        let prevote_quorum = state
            .height_round_vote_set
            .prevotes(round)
            .and_then(VoteSet::two_thirds_majority)
            .map(|hash| hash.cloned());
        let hash = match prevote_quorum {
            Some(Some(hash)) if state.proposal_hash() == Some(&hash) => {
                debug!(height, round, %hash, "Locking on the proposal.");
                state.locked_round = Some(round);
                state.locked_proposal = state.proposal.clone();
                state.valid_round = Some(round);
                state.valid_proposal = state.proposal.clone();
                Some(hash)
            }
            Some(Some(hash)) => {
                warn!(
                    height,
                    round,
                    %hash,
                    proposal = %display_hash(state.proposal_hash()),
                    "Prevote quorum for a block not held, precommitting nil."
                );
                None
            }
            Some(None) => {
                if state.locked_round.take().is_some() {
                    debug!(height, round, "Prevote quorum for nil, unlocking.");
                    state.locked_proposal = None;
                }
                None
            }
            None => None,
        };
        debug!(height, round, hash = %display_hash(hash.as_ref()), "Precommitting.");
        let vote = self.sign_vote(&core.state, VoteType::Precommit, hash)?;
        self.self_messages.push_back(TbftMessage::Precommit(vote));
        Ok(())
    }

    fn enter_commit(&mut self, core: &mut CoreState, height: Height, round: Round) -> ConsensusResult<()> {
        if !can_transition(&core.state, height, round, Step::Precommit, Step::Commit) {
            return Ok(());
        }
        core.state.step = Step::Commit;
        self.height_metrics.set_enter_time(round, Step::Commit);

        let state = &core.state;
        let precommit_quorum = state
            .height_round_vote_set
            .precommits(round)
            .and_then(VoteSet::two_thirds_majority)
            .flatten()
            .cloned();
        let Some(hash) = precommit_quorum else {
            info!(height, round, "No block was decided in this round.");
            return self.enter_new_round(core, height, round.saturating_add(1));
        };
        match state.proposal_hash() {
            Some(proposal) if *proposal == hash => self.commit(core),
            Some(proposal) => Err(ConsensusError::Fatal(format!(
                "Precommit quorum for {hash} at {height}/{round} but the proposal is {proposal}."
            ))),
            None => {
                error!(height, round, %hash, "Precommit quorum for a block never received, waiting for it.");
                Ok(())
            }
        }
    }

    /// Hands the proposal, with the precommit quorum of the round attached, to the ledger.
    fn commit(&mut self, core: &mut CoreState) -> ConsensusResult<()> {
        let state = &core.state;
        let (height, round) = (state.height, state.round);
        if state.committed {
            warn!(height, round, "Height already committed, ignoring.");
            return Ok(());
        }
        let quorum_certificate = state
            .height_round_vote_set
            .precommits(round)
            .and_then(VoteSet::quorum_certificate)
            .ok_or_else(|| {
                ConsensusError::Fatal(format!("No precommit quorum to commit {height}/{round}."))
            })?;
        let mut block = state
            .proposal
            .as_ref()
            .ok_or_else(|| ConsensusError::Fatal(format!("No proposal to commit {height}/{round}.")))?
            .block
            .clone();
        attach_quorum_certificate(&mut block, &quorum_certificate);

        info!(
            height,
            round,
            hash = %display_hash(block.hash()),
            votes = quorum_certificate.sum(),
            "Committing block."
        );
        info!(height, "Consensus cost: {}", self.height_metrics.round_summary(round));
        CONSENSUS_BLOCKS_COMMITTED.increment(1);
        core.state.committed = true;
        self.context.message_bus.commit_block(block);
        Ok(())
    }

    fn sign_vote(
        &self,
        state: &ConsensusState,
        vote_type: VoteType,
        hash: Option<BlockHash>,
    ) -> ConsensusResult<Vote> {
        let mut vote = Vote::new(vote_type, state.id.clone(), state.height, state.round, hash);
        vote.endorsement = Some(self.endorse(&vote.signing_bytes())?);
        Ok(vote)
    }

    fn endorse(&self, message: &[u8]) -> ConsensusResult<Endorsement> {
        let signer = &self.context.signer;
        Ok(Endorsement { signer: signer.member()?, signature: signer.sign(message)? })
    }

    fn write_wal(
        &mut self,
        height: Height,
        entry_type: WalEntryType,
        data: Vec<u8>,
    ) -> ConsensusResult<()> {
        if self.replaying {
            return Ok(());
        }
        let entry = WalEntry {
            height,
            height_first_index: self.height_first_index,
            entry_type,
            data,
        };
        let index = self.wal.write_entry(entry)?;
        trace!(index, %entry_type, "Wrote WAL entry.");
        Ok(())
    }

    /// Restores the in-flight height from the WAL, or starts right after the ledger.
    fn replay_wal(&mut self) -> ConsensusResult<()> {
        let shared = Arc::clone(&self.shared);
        let mut core = shared.write().expect(LOCK_POISONED);
        let ledger_height = self.context.ledger.current_height()?;
        if self.wal.is_empty() {
            info!(ledger_height, "Empty WAL, starting after the ledger.");
            return self.enter_new_height(&mut core, ledger_height.saturating_add(1));
        }

        let last_entry = self.wal.read_entry(self.wal.last_index())?;
        let wal_height = last_entry.height;
        if ledger_height < wal_height.saturating_sub(1) {
            return Err(ConsensusError::Fatal(format!(
                "Ledger height {ledger_height} is behind the WAL height {wal_height}."
            )));
        }
        if ledger_height >= wal_height {
            info!(ledger_height, wal_height, "The ledger already holds the WAL height.");
            return self.enter_new_height(&mut core, ledger_height.saturating_add(1));
        }

        info!(wal_height, first_index = last_entry.height_first_index, "Replaying the WAL.");
        self.height_first_index = last_entry.height_first_index;
        self.replaying = true;
        let replayed = self.replay_height(&mut core, wal_height);
        self.replaying = false;
        self.self_messages.clear();
        replayed?;
        self.resume_after_replay(&mut core)
    }

    /// Re-issues what the node may have lost when it stopped: the block request of a proposer, or
    /// its own vote of the step it stopped in.
    fn resume_after_replay(&mut self, core: &mut CoreState) -> ConsensusResult<()> {
        let state = &core.state;
        let has_voted = |vote_type: VoteType| {
            state
                .height_round_vote_set
                .round_vote_set(state.round)
                .is_some_and(|set| set.votes(vote_type).has_voted(&state.id))
        };
        let vote = match state.step {
            Step::Propose => {
                if state.proposal.is_none()
                    && core.validator_set.is_proposer(&state.id, state.height, state.round)
                {
                    self.context.message_bus.propose_state(true);
                }
                return Ok(());
            }
            Step::Prevote if !has_voted(VoteType::Prevote) => {
                TbftMessage::Prevote(self.sign_vote(state, VoteType::Prevote, prevote_hash(state))?)
            }
            Step::Precommit if !has_voted(VoteType::Precommit) => {
                // A non-nil precommit of this round always comes with a lock in this round.
                let hash = state
                    .locked_proposal
                    .as_ref()
                    .filter(|_| state.locked_round == Some(state.round))
                    .and_then(|proposal| proposal.block_hash().cloned());
                TbftMessage::Precommit(self.sign_vote(state, VoteType::Precommit, hash)?)
            }
            _ => return Ok(()),
        };
        info!(height = state.height, round = state.round, step = %state.step, "Re-casting own vote.");
        self.self_messages.push_back(vote);
        self.process_self_messages(core)
    }

    fn replay_height(&mut self, core: &mut CoreState, height: Height) -> ConsensusResult<()> {
        self.enter_new_height(core, height)?;
        self.self_messages.clear();

        let first_index = self.height_first_index.max(self.wal.first_index());
        for index in first_index..=self.wal.last_index() {
            let entry = self.wal.read_entry(index)?;
            if entry.height != height {
                warn!(index, height = entry.height, "Skipping WAL entry of another height.");
                continue;
            }
            match entry.entry_type {
                WalEntryType::Timeout => {
                    let timeout = TimeoutInfo::try_from(entry.data).map_err(WalError::from)?;
                    escalate_fatal(self.handle_timeout(core, timeout))?;
                }
                WalEntryType::Proposal => {
                    let proposal = Proposal::try_from(entry.data).map_err(WalError::from)?;
                    escalate_fatal(self.replay_proposal(core, proposal))?;
                }
                WalEntryType::Vote => {
                    let vote = Vote::try_from(entry.data).map_err(WalError::from)?;
                    escalate_fatal(self.add_vote(core, vote))?;
                }
            }
            self.self_messages.clear();
        }
        let status = core.state.status();
        info!(height, round = status.round, step = %status.step, "Replayed the WAL.");
        Ok(())
    }

    fn replay_proposal(&mut self, core: &mut CoreState, proposal: Proposal) -> ConsensusResult<()> {
        let state = &core.state;
        if proposal.height != state.height || proposal.round != state.round {
            debug!(height = state.height, round = state.round, "Skipping replayed proposal of another round.");
            return Ok(());
        }
        if proposal.voter == state.id {
            let (height, round) = (proposal.height, proposal.round);
            self.accept_proposal(core, proposal)?;
            return self.enter_prevote(core, height, round);
        }
        let block = proposal.block.clone();
        core.state.verifying_proposal = Some(proposal);
        self.handle_verify_result(core, VerifyResult { block, success: true, rw_set: None })
    }
}

/// The hash to prevote in the current round. A node locked on a block prevotes nil for any other
/// block unless the proposal carries a newer proof of lock backed by a prevote quorum.
fn prevote_hash(state: &ConsensusState) -> Option<BlockHash> {
    let proposal = state.proposal.as_ref()?;
    let hash = proposal.block_hash()?;
    let Some(locked) = state.locked_proposal.as_ref() else {
        return Some(hash.clone());
    };
    if locked.block_hash() == Some(hash) {
        return Some(hash.clone());
    }
    let unlocked = proposal.pol_round.is_some_and(|pol_round| {
        pol_round < proposal.round
            && state.locked_round.map_or(true, |locked_round| pol_round >= locked_round)
            && state
                .height_round_vote_set
                .prevotes(pol_round)
                .and_then(VoteSet::two_thirds_majority)
                == Some(Some(hash))
    });
    if !unlocked {
        debug!(
            locked = %display_hash(locked.block_hash()),
            proposed = %hash,
            "Locked on another block, prevoting nil."
        );
    }
    unlocked.then(|| hash.clone())
}

fn can_transition(state: &ConsensusState, height: Height, round: Round, from: Step, to: Step) -> bool {
    if state.height == height && state.round == round && state.step == from {
        return true;
    }
    debug!(
        height = state.height,
        round = state.round,
        step = %state.step,
        "Ignoring transition to {height}/{round}/{to}."
    );
    false
}

/// Logs and swallows non-fatal errors.
fn escalate_fatal(result: ConsensusResult<()>) -> ConsensusResult<()> {
    match result {
        Err(err) if err.is_fatal() => {
            error!(%err, "Stopping consensus.");
            Err(err)
        }
        Err(err) => {
            warn!(%err, "Dropped consensus event.");
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}
