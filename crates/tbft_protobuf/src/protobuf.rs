//! Prost definitions of the TBFT wire format.
//!
//! Block hashes are carried as raw bytes; an empty value (or the legacy `NilHash` marker) stands
//! for a NIL vote.

use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum VoteType {
    Prevote = 0,
    Precommit = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Step {
    NewHeight = 0,
    NewRound = 1,
    Propose = 2,
    Prevote = 3,
    Precommit = 4,
    Commit = 5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum TbftMsgType {
    Propose = 0,
    Prevote = 1,
    Precommit = 2,
    State = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum WalEntryType {
    Proposal = 0,
    Vote = 1,
    Timeout = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Endorsement {
    #[prost(bytes = "vec", tag = "1")]
    pub signer: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub signature: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BlockHeader {
    #[prost(uint64, tag = "1")]
    pub height: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub pre_block_hash: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub block_hash: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub proposer: Vec<u8>,
    #[prost(bytes = "vec", tag = "5")]
    pub signature: Vec<u8>,
    #[prost(int64, tag = "6")]
    pub timestamp: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Block {
    #[prost(message, optional, tag = "1")]
    pub header: Option<BlockHeader>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub txs: Vec<Vec<u8>>,
    #[prost(btree_map = "string, bytes", tag = "3")]
    pub additional_data: BTreeMap<String, Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Proposal {
    #[prost(string, tag = "1")]
    pub voter: String,
    #[prost(uint64, tag = "2")]
    pub height: u64,
    #[prost(uint32, tag = "3")]
    pub round: u32,
    /// Proof-of-lock round, `-1` when the proposal carries no lock.
    #[prost(int32, tag = "4")]
    pub pol_round: i32,
    #[prost(message, optional, tag = "5")]
    pub block: Option<Block>,
    #[prost(message, optional, tag = "6")]
    pub endorsement: Option<Endorsement>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Vote {
    #[prost(enumeration = "VoteType", tag = "1")]
    pub vote_type: i32,
    #[prost(string, tag = "2")]
    pub voter: String,
    #[prost(uint64, tag = "3")]
    pub height: u64,
    #[prost(uint32, tag = "4")]
    pub round: u32,
    #[prost(bytes = "vec", tag = "5")]
    pub hash: Vec<u8>,
    #[prost(message, optional, tag = "6")]
    pub endorsement: Option<Endorsement>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BlockVotes {
    #[prost(btree_map = "string, message", tag = "1")]
    pub votes: BTreeMap<String, Vote>,
    #[prost(uint64, tag = "2")]
    pub sum: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VoteSet {
    #[prost(enumeration = "VoteType", tag = "1")]
    pub vote_type: i32,
    #[prost(uint64, tag = "2")]
    pub height: u64,
    #[prost(uint32, tag = "3")]
    pub round: u32,
    #[prost(uint64, tag = "4")]
    pub sum: u64,
    /// Present once a quorum is latched; empty bytes for a NIL quorum.
    #[prost(bytes = "vec", optional, tag = "5")]
    pub maj23: Option<Vec<u8>>,
    #[prost(btree_map = "string, message", tag = "6")]
    pub votes: BTreeMap<String, Vote>,
    /// Keyed by the hex encoding of the hash; the empty key holds NIL votes.
    #[prost(btree_map = "string, message", tag = "7")]
    pub votes_by_block: BTreeMap<String, BlockVotes>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RoundVoteSet {
    #[prost(uint64, tag = "1")]
    pub height: u64,
    #[prost(uint32, tag = "2")]
    pub round: u32,
    #[prost(message, optional, tag = "3")]
    pub prevotes: Option<VoteSet>,
    #[prost(message, optional, tag = "4")]
    pub precommits: Option<VoteSet>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeightRoundVoteSet {
    #[prost(uint64, tag = "1")]
    pub height: u64,
    #[prost(uint32, tag = "2")]
    pub round: u32,
    #[prost(btree_map = "uint32, message", tag = "3")]
    pub round_vote_sets: BTreeMap<u32, RoundVoteSet>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConsensusState {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(uint64, tag = "2")]
    pub height: u64,
    #[prost(uint32, tag = "3")]
    pub round: u32,
    #[prost(enumeration = "Step", tag = "4")]
    pub step: i32,
    #[prost(message, optional, tag = "5")]
    pub proposal: Option<Proposal>,
    #[prost(message, optional, tag = "6")]
    pub verifying_proposal: Option<Proposal>,
    #[prost(int32, tag = "7")]
    pub locked_round: i32,
    #[prost(message, optional, tag = "8")]
    pub locked_proposal: Option<Proposal>,
    #[prost(int32, tag = "9")]
    pub valid_round: i32,
    #[prost(message, optional, tag = "10")]
    pub valid_proposal: Option<Proposal>,
    #[prost(message, optional, tag = "11")]
    pub height_round_vote_set: Option<HeightRoundVoteSet>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GossipState {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(uint64, tag = "2")]
    pub height: u64,
    #[prost(uint32, tag = "3")]
    pub round: u32,
    #[prost(enumeration = "Step", tag = "4")]
    pub step: i32,
    #[prost(bytes = "vec", optional, tag = "5")]
    pub proposal: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "6")]
    pub verifying_proposal: Option<Vec<u8>>,
    #[prost(message, optional, tag = "7")]
    pub round_vote_set: Option<RoundVoteSet>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TimeoutInfo {
    #[prost(uint64, tag = "1")]
    pub duration_nanos: u64,
    #[prost(uint64, tag = "2")]
    pub height: u64,
    #[prost(uint32, tag = "3")]
    pub round: u32,
    #[prost(enumeration = "Step", tag = "4")]
    pub step: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TbftMsg {
    #[prost(enumeration = "TbftMsgType", tag = "1")]
    pub msg_type: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub msg: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WalEntry {
    #[prost(uint64, tag = "1")]
    pub height: u64,
    #[prost(uint64, tag = "2")]
    pub height_first_index: u64,
    #[prost(enumeration = "WalEntryType", tag = "3")]
    pub entry_type: i32,
    #[prost(bytes = "vec", tag = "4")]
    pub data: Vec<u8>,
}
