use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, IntoStaticStr};

use crate::protobuf;

/// Identity of a validator as it appears in the chain configuration.
pub type ValidatorId = String;
pub type Height = u64;
pub type Round = u32;

/// Legacy marker some peers still put on the wire instead of an empty hash for NIL votes.
pub const NIL_HASH: &[u8] = b"NilHash";

/// Key under which the quorum certificate is stored in a committed block's additional data.
pub const TBFT_ADDITIONAL_DATA_KEY: &str = "TBFTAddtionalDataKey";

/// Returns true if the raw hash denotes a NIL vote.
pub fn is_nil_hash(hash: &[u8]) -> bool {
    hash.is_empty() || hash == NIL_HASH
}

#[derive(Clone, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct BlockHash(pub Vec<u8>);

impl BlockHash {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Parses a raw wire hash, mapping the NIL encodings to `None`.
    pub fn from_wire(bytes: Vec<u8>) -> Option<Self> {
        if is_nil_hash(&bytes) { None } else { Some(Self(bytes)) }
    }

    pub fn to_wire(hash: Option<&Self>) -> Vec<u8> {
        hash.map(|hash| hash.0.clone()).unwrap_or_default()
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Formats an optional vote hash, printing `nil` for NIL votes.
pub fn display_hash(hash: Option<&BlockHash>) -> String {
    hash.map_or_else(|| "nil".to_string(), ToString::to_string)
}

#[derive(
    Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize, Display, IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum VoteType {
    Prevote,
    Precommit,
}

/// Phase within a round. The derived ordering follows the protocol progression.
#[derive(
    Debug,
    Clone,
    Copy,
    Hash,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
    IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum Step {
    NewHeight,
    NewRound,
    Propose,
    Prevote,
    Precommit,
    Commit,
}

#[derive(Debug, Default, Clone, Hash, Eq, PartialEq)]
pub struct Endorsement {
    /// Serialized member identity of the signer.
    pub signer: Vec<u8>,
    pub signature: Vec<u8>,
}

#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct BlockHeader {
    pub height: Height,
    pub pre_block_hash: Option<BlockHash>,
    /// Set once the proposer hashed the block.
    pub block_hash: Option<BlockHash>,
    pub proposer: Vec<u8>,
    pub signature: Vec<u8>,
    pub timestamp: i64,
}

#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub txs: Vec<Vec<u8>>,
    pub additional_data: BTreeMap<String, Vec<u8>>,
}

impl Block {
    pub fn height(&self) -> Height {
        self.header.height
    }

    pub fn hash(&self) -> Option<&BlockHash> {
        self.header.block_hash.as_ref()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Vote {
    pub vote_type: VoteType,
    pub voter: ValidatorId,
    pub height: Height,
    pub round: Round,
    /// `None` is a NIL vote.
    pub block_hash: Option<BlockHash>,
    pub endorsement: Option<Endorsement>,
}

impl Vote {
    pub fn new(
        vote_type: VoteType,
        voter: ValidatorId,
        height: Height,
        round: Round,
        block_hash: Option<BlockHash>,
    ) -> Self {
        Self { vote_type, voter, height, round, block_hash, endorsement: None }
    }

    pub fn is_nil(&self) -> bool {
        self.block_hash.is_none()
    }

    /// The bytes covered by the vote's endorsement.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let unsigned = Vote { endorsement: None, ..self.clone() };
        unsigned.into()
    }
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}/{}/{}/{})",
            self.vote_type,
            self.voter,
            self.height,
            self.round,
            display_hash(self.block_hash.as_ref())
        )
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Proposal {
    pub voter: ValidatorId,
    pub height: Height,
    pub round: Round,
    /// Proof-of-lock round.
    pub pol_round: Option<Round>,
    pub block: Block,
    pub endorsement: Option<Endorsement>,
}

impl Proposal {
    pub fn new(
        voter: ValidatorId,
        height: Height,
        round: Round,
        pol_round: Option<Round>,
        block: Block,
    ) -> Self {
        Self { voter, height, round, pol_round, block, endorsement: None }
    }

    pub fn block_hash(&self) -> Option<&BlockHash> {
        self.block.hash()
    }

    /// The bytes covered by the proposal's endorsement. The block's additional data is excluded
    /// since the quorum certificate is attached to it after signing.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut unsigned = Proposal { endorsement: None, ..self.clone() };
        unsigned.block.additional_data.clear();
        unsigned.into()
    }
}

/// A timer request. Requests are ordered by (height, round, step); the duration does not take
/// part in staleness comparisons.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TimeoutInfo {
    pub duration: Duration,
    pub height: Height,
    pub round: Round,
    pub step: Step,
}

impl TimeoutInfo {
    pub fn new(duration: Duration, height: Height, round: Round, step: Step) -> Self {
        Self { duration, height, round, step }
    }

    pub fn position(&self) -> (Height, Round, Step) {
        (self.height, self.round, self.step)
    }
}

impl fmt::Display for TimeoutInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}/{}/{}", self.duration, self.height, self.round, self.step)
    }
}

/// The lightweight view of a node's round that is shipped to its peers.
#[derive(Debug, Clone, PartialEq)]
pub struct GossipState {
    pub id: ValidatorId,
    pub height: Height,
    pub round: Round,
    pub step: Step,
    pub proposal: Option<BlockHash>,
    pub verifying_proposal: Option<BlockHash>,
    pub round_vote_set: Option<protobuf::RoundVoteSet>,
}

/// The envelope of every message exchanged between consensus nodes.
#[derive(Debug, Clone, PartialEq)]
pub enum TbftMessage {
    Propose(Proposal),
    Prevote(Vote),
    Precommit(Vote),
    State(GossipState),
}

impl TbftMessage {
    pub fn height(&self) -> Height {
        match self {
            TbftMessage::Propose(proposal) => proposal.height,
            TbftMessage::Prevote(vote) | TbftMessage::Precommit(vote) => vote.height,
            TbftMessage::State(state) => state.height,
        }
    }
}

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum WalEntryType {
    Proposal,
    Vote,
    Timeout,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct WalEntry {
    pub height: Height,
    /// WAL index of the first entry written for `height`.
    pub height_first_index: u64,
    pub entry_type: WalEntryType,
    pub data: Vec<u8>,
}
