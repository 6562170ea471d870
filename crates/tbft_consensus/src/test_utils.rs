use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;
use sha2::{Digest, Sha256};
use tbft_consensus_config::chain::{
    ChainConsensusConfig,
    TBFT_PROPOSE_DELTA_TIMEOUT_KEY,
    TBFT_PROPOSE_TIMEOUT_KEY,
};
use tbft_consensus_config::config::ConsensusConfig;
use tbft_protobuf::consensus::{Block, BlockHash, Endorsement, Proposal, Round, Vote, VoteType};
use tempfile::TempDir;
use tokio::sync::mpsc;

use crate::consensus::{ConsensusCore, ConsensusHandle};
use crate::types::{
    AccessControl,
    ConsensusContext,
    ConsensusError,
    ConsensusResult,
    Height,
    MessageBus,
    MockChainConfigProvider,
    MockLedger,
    Signer,
    ValidatorId,
    VerifyResult,
};
use crate::validator_set::ValidatorSet;

pub(crate) const TEST_TIMEOUT: Duration = Duration::from_secs(600);

lazy_static! {
    pub(crate) static ref VALIDATOR_IDS: Vec<ValidatorId> =
        (0..4).map(|i| format!("validator_{i}")).collect();
}

pub(crate) fn validator_set() -> ValidatorSet {
    ValidatorSet::new(VALIDATOR_IDS.iter().cloned(), 1).unwrap()
}

fn signature(member: &[u8], message: &[u8]) -> Vec<u8> {
    Sha256::new().chain_update(member).chain_update(message).finalize().to_vec()
}

/// Signs with a hash keyed by the validator id, which doubles as the serialized member.
#[derive(Debug, Clone)]
pub(crate) struct TestSigner {
    pub(crate) id: ValidatorId,
}

impl Signer for TestSigner {
    fn member(&self) -> ConsensusResult<Vec<u8>> {
        Ok(self.id.as_bytes().to_vec())
    }

    fn sign(&self, message: &[u8]) -> ConsensusResult<Vec<u8>> {
        Ok(signature(self.id.as_bytes(), message))
    }

    fn hash_block(&self, block: &Block) -> ConsensusResult<BlockHash> {
        let mut block = block.clone();
        block.header.block_hash = None;
        block.header.signature.clear();
        block.header.proposer.clear();
        block.additional_data.clear();
        Ok(BlockHash(Sha256::digest(Vec::<u8>::from(block)).to_vec()))
    }
}

#[derive(Debug, Default)]
pub(crate) struct TestAccessControl;

impl AccessControl for TestAccessControl {
    fn verify_endorsement(&self, endorsement: &Endorsement, message: &[u8]) -> ConsensusResult<bool> {
        Ok(endorsement.signature == signature(&endorsement.signer, message))
    }

    fn node_id(&self, member: &[u8]) -> ConsensusResult<ValidatorId> {
        String::from_utf8(member.to_vec())
            .map_err(|err| ConsensusError::AccessControl(err.to_string()))
    }
}

fn endorse(id: &str, message: &[u8]) -> Endorsement {
    Endorsement { signer: id.as_bytes().to_vec(), signature: signature(id.as_bytes(), message) }
}

pub(crate) fn signed_vote(
    vote_type: VoteType,
    voter: &str,
    height: Height,
    round: Round,
    hash: Option<BlockHash>,
) -> Vote {
    let mut vote = Vote::new(vote_type, voter.to_string(), height, round, hash);
    vote.endorsement = Some(endorse(voter, &vote.signing_bytes()));
    vote
}

/// A hashed block carrying a single transaction.
pub(crate) fn test_block(height: Height, tx: &str) -> Block {
    let mut block = Block::default();
    block.header.height = height;
    block.header.timestamp = 1_700_000_000;
    block.txs = vec![tx.as_bytes().to_vec()];
    let hash = TestSigner { id: String::new() }.hash_block(&block).unwrap();
    block.header.block_hash = Some(hash);
    block
}

pub(crate) fn signed_proposal(voter: &str, height: Height, round: Round, block: Block) -> Proposal {
    let mut proposal = Proposal::new(voter.to_string(), height, round, None, block);
    proposal.endorsement = Some(endorse(voter, &proposal.signing_bytes()));
    proposal
}

pub(crate) fn chain_config() -> ChainConsensusConfig {
    ChainConsensusConfig {
        validators: VALIDATOR_IDS.clone(),
        ext_config: [
            (TBFT_PROPOSE_TIMEOUT_KEY.to_string(), "3s".to_string()),
            (TBFT_PROPOSE_DELTA_TIMEOUT_KEY.to_string(), "1s".to_string()),
        ]
        .into(),
    }
}

pub(crate) fn chain_config_provider() -> MockChainConfigProvider {
    let mut provider = MockChainConfigProvider::new();
    provider.expect_chain_consensus_config().returning(|| Ok(chain_config()));
    provider
}

pub(crate) fn ledger_at(height: Height) -> MockLedger {
    let mut ledger = MockLedger::new();
    ledger.expect_current_height().returning(move || Ok(height));
    ledger
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum BusEvent {
    ProposeState(bool),
    VerifyBlock(Block),
    CommitBlock(Block),
    Send { to: ValidatorId, payload: Vec<u8> },
}

/// Forwards every outbound event of an engine to a channel.
#[derive(Debug)]
pub(crate) struct ChannelBus {
    events: mpsc::UnboundedSender<BusEvent>,
}

impl ChannelBus {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<BusEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (Self { events }, receiver)
    }

    fn emit(&self, event: BusEvent) {
        let _ = self.events.send(event);
    }
}

impl MessageBus for ChannelBus {
    fn propose_state(&self, is_proposer: bool) {
        self.emit(BusEvent::ProposeState(is_proposer));
    }

    fn verify_block(&self, block: Block) {
        self.emit(BusEvent::VerifyBlock(block));
    }

    fn commit_block(&self, block: Block) {
        self.emit(BusEvent::CommitBlock(block));
    }

    fn send_consensus_msg(&self, to: &ValidatorId, payload: Vec<u8>) {
        self.emit(BusEvent::Send { to: to.clone(), payload });
    }
}

pub(crate) fn test_config(id: &str, wal_dir: &Path) -> ConsensusConfig {
    ConsensusConfig {
        validator_id: id.to_string(),
        wal_dir: wal_dir.to_path_buf(),
        wal_sync_on_write: false,
        gossip_interval: Duration::from_millis(200),
        ..Default::default()
    }
}

pub(crate) fn context(id: &str, ledger_height: Height, message_bus: Arc<dyn MessageBus>) -> ConsensusContext {
    ConsensusContext {
        signer: Arc::new(TestSigner { id: id.to_string() }),
        access_control: Arc::new(TestAccessControl),
        ledger: Arc::new(ledger_at(ledger_height)),
        chain_config: Arc::new(chain_config_provider()),
        message_bus,
        snapshot_store: None,
    }
}

/// Validators wired to each other in memory. Every node proposes a block carrying its own id and
/// accepts every block it is asked to verify. Messages to validators that were not started are
/// dropped.
pub(crate) struct TestNetwork {
    commits: mpsc::UnboundedReceiver<(ValidatorId, Block)>,
    _wal_dirs: Vec<TempDir>,
}

impl TestNetwork {
    pub(crate) fn start(live: &[&str], ledger_height: Height) -> Self {
        let mut wal_dirs = Vec::new();
        let mut handles = HashMap::new();
        let mut buses = Vec::new();
        for id in live {
            let wal_dir = tempfile::tempdir().unwrap();
            let (bus, bus_events) = ChannelBus::new();
            let (core, handle) = ConsensusCore::new(
                test_config(id, wal_dir.path()),
                context(id, ledger_height, Arc::new(bus)),
            )
            .unwrap();
            tokio::spawn(core.run());
            handles.insert(id.to_string(), handle);
            buses.push((id.to_string(), bus_events));
            wal_dirs.push(wal_dir);
        }

        let handles = Arc::new(handles);
        let (commits_sender, commits) = mpsc::unbounded_channel();
        for (id, bus_events) in buses {
            tokio::spawn(drive(id, bus_events, Arc::clone(&handles), commits_sender.clone()));
        }
        Self { commits, _wal_dirs: wal_dirs }
    }

    pub(crate) async fn next_commit(&mut self) -> (ValidatorId, Block) {
        tokio::time::timeout(TEST_TIMEOUT, self.commits.recv())
            .await
            .expect("no block was committed in time")
            .expect("all nodes stopped")
    }
}

async fn drive(
    id: ValidatorId,
    mut bus_events: mpsc::UnboundedReceiver<BusEvent>,
    handles: Arc<HashMap<ValidatorId, ConsensusHandle>>,
    commits: mpsc::UnboundedSender<(ValidatorId, Block)>,
) {
    let handle = &handles[&id];
    while let Some(event) = bus_events.recv().await {
        let delivered = match event {
            BusEvent::ProposeState(true) => {
                let height = handle.status().height;
                handle.proposed_block(test_block(height, &format!("{id}/{height}"))).await
            }
            BusEvent::ProposeState(false) => Ok(()),
            BusEvent::VerifyBlock(block) => {
                handle.verify_result(VerifyResult { block, success: true, rw_set: None }).await
            }
            BusEvent::CommitBlock(block) => {
                let _ = commits.send((id.clone(), block));
                Ok(())
            }
            BusEvent::Send { to, payload } => match handles.get(&to) {
                Some(peer) => peer.consensus_msg(payload).await,
                None => Ok(()),
            },
        };
        if delivered.is_err() {
            return;
        }
    }
}
