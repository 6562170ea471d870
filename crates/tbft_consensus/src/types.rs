//! Types for interfacing between consensus and the node.
//!
//! All collaborators are reached through [`ConsensusContext`], which is handed to the engine at
//! construction time.

use std::fmt::Debug;
use std::sync::Arc;

use tbft_consensus_config::chain::ChainConsensusConfig;
use tbft_consensus_config::ConfigError;
pub use tbft_protobuf::consensus::{Height, Round, ValidatorId};
use tbft_protobuf::consensus::{Block, BlockHash, Endorsement, Step};
use tbft_protobuf::converters::ProtobufConversionError;

use crate::validator_set::ValidatorSetError;
use crate::votes::VoteError;
use crate::wal::WalError;

/// Signs on behalf of the local node.
#[cfg_attr(test, mockall::automock)]
pub trait Signer: Send + Sync {
    /// Serialized member identity placed in endorsements.
    fn member(&self) -> Result<Vec<u8>, ConsensusError>;
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, ConsensusError>;
    /// Computes the hash identifying `block`. Additional data is not covered.
    fn hash_block(&self, block: &Block) -> Result<BlockHash, ConsensusError>;
}

/// Verifies principals of remote messages.
#[cfg_attr(test, mockall::automock)]
pub trait AccessControl: Send + Sync {
    /// Returns whether `endorsement` is a valid signature of its signer over `message`.
    fn verify_endorsement(
        &self,
        endorsement: &Endorsement,
        message: &[u8],
    ) -> Result<bool, ConsensusError>;
    /// Resolves the validator identity behind a serialized member.
    fn node_id(&self, member: &[u8]) -> Result<ValidatorId, ConsensusError>;
}

/// The committed chain.
#[cfg_attr(test, mockall::automock)]
pub trait Ledger: Send + Sync {
    /// Height of the last committed block.
    fn current_height(&self) -> Result<Height, ConsensusError>;
}

#[cfg_attr(test, mockall::automock)]
pub trait ChainConfigProvider: Send + Sync {
    fn chain_consensus_config(&self) -> Result<ChainConsensusConfig, ConsensusError>;
}

/// Outbound events of the engine. Implementations must not block.
#[cfg_attr(test, mockall::automock)]
pub trait MessageBus: Send + Sync {
    /// Signals the block producer whether this node may propose now.
    fn propose_state(&self, is_proposer: bool);
    /// Requests asynchronous verification of a proposed block.
    fn verify_block(&self, block: Block);
    /// Delivers a decided block, carrying its quorum certificate, to the ledger.
    fn commit_block(&self, block: Block);
    /// Sends a wire-encoded consensus message to a single peer.
    fn send_consensus_msg(&self, to: &ValidatorId, payload: Vec<u8>);
}

/// Key-value store for diagnostic state snapshots.
#[cfg_attr(test, mockall::automock)]
pub trait SnapshotStore: Send + Sync {
    fn save_consensus_state(&self, height: Height, state: Vec<u8>) -> Result<(), ConsensusError>;
}

/// Everything the engine needs from the outside world.
#[derive(Clone)]
pub struct ConsensusContext {
    pub signer: Arc<dyn Signer>,
    pub access_control: Arc<dyn AccessControl>,
    pub ledger: Arc<dyn Ledger>,
    pub chain_config: Arc<dyn ChainConfigProvider>,
    pub message_bus: Arc<dyn MessageBus>,
    pub snapshot_store: Option<Arc<dyn SnapshotStore>>,
}

impl Debug for ConsensusContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusContext")
            .field("snapshot_store", &self.snapshot_store.is_some())
            .finish_non_exhaustive()
    }
}

/// The block verifier's verdict on a proposed block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyResult {
    pub block: Block,
    pub success: bool,
    /// Read/write set produced while executing the block, if the verifier exposes it.
    pub rw_set: Option<Vec<u8>>,
}

/// Position of the engine, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsensusStatus {
    pub height: Height,
    pub round: Round,
    pub step: Step,
}

#[derive(thiserror::Error, Debug)]
pub enum ConsensusError {
    #[error(transparent)]
    ProtobufConversionError(#[from] ProtobufConversionError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Wal(#[from] WalError),
    #[error(transparent)]
    Vote(#[from] VoteError),
    #[error(transparent)]
    ValidatorSet(#[from] ValidatorSetError),
    #[error("Signer failure: {0}")]
    Signer(String),
    #[error("Access control failure: {0}")]
    AccessControl(String),
    #[error("Ledger failure: {0}")]
    Ledger(String),
    #[error("Chain config failure: {0}")]
    ChainConfig(String),
    #[error("Snapshot store failure: {0}")]
    SnapshotStore(String),
    #[error("Invalid quorum certificate for block at height {height}: {reason}")]
    InvalidQuorumCertificate { height: Height, reason: String },
    #[error("The consensus engine has stopped.")]
    Stopped,
    /// A local invariant no longer holds; the node must stop.
    #[error("Invariant violation: {0}")]
    Fatal(String),
}

impl ConsensusError {
    /// Fatal errors terminate the event loop. Durability failures are always fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConsensusError::Wal(_) | ConsensusError::Fatal(_))
    }
}

pub type ConsensusResult<T> = Result<T, ConsensusError>;
