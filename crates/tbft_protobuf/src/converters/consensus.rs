use std::time::Duration;

use prost::Message;

use crate::consensus::{
    Block,
    BlockHash,
    BlockHeader,
    Endorsement,
    GossipState,
    Proposal,
    Step,
    TbftMessage,
    TimeoutInfo,
    Vote,
    VoteType,
    WalEntry,
    WalEntryType,
};
use crate::converters::{missing, ProtobufConversionError};
use crate::{auto_impl_into_and_try_from_vec_u8, protobuf};

fn out_of_range(type_description: &'static str, value: impl ToString) -> ProtobufConversionError {
    ProtobufConversionError::OutOfRangeValue { type_description, value_as_str: value.to_string() }
}

impl From<protobuf::VoteType> for VoteType {
    fn from(value: protobuf::VoteType) -> Self {
        match value {
            protobuf::VoteType::Prevote => VoteType::Prevote,
            protobuf::VoteType::Precommit => VoteType::Precommit,
        }
    }
}

impl From<VoteType> for protobuf::VoteType {
    fn from(value: VoteType) -> Self {
        match value {
            VoteType::Prevote => protobuf::VoteType::Prevote,
            VoteType::Precommit => protobuf::VoteType::Precommit,
        }
    }
}

pub fn vote_type_from_i32(value: i32) -> Result<VoteType, ProtobufConversionError> {
    Ok(protobuf::VoteType::try_from(value).map_err(|_| out_of_range("VoteType", value))?.into())
}

impl From<protobuf::Step> for Step {
    fn from(value: protobuf::Step) -> Self {
        match value {
            protobuf::Step::NewHeight => Step::NewHeight,
            protobuf::Step::NewRound => Step::NewRound,
            protobuf::Step::Propose => Step::Propose,
            protobuf::Step::Prevote => Step::Prevote,
            protobuf::Step::Precommit => Step::Precommit,
            protobuf::Step::Commit => Step::Commit,
        }
    }
}

impl From<Step> for protobuf::Step {
    fn from(value: Step) -> Self {
        match value {
            Step::NewHeight => protobuf::Step::NewHeight,
            Step::NewRound => protobuf::Step::NewRound,
            Step::Propose => protobuf::Step::Propose,
            Step::Prevote => protobuf::Step::Prevote,
            Step::Precommit => protobuf::Step::Precommit,
            Step::Commit => protobuf::Step::Commit,
        }
    }
}

pub fn step_from_i32(value: i32) -> Result<Step, ProtobufConversionError> {
    Ok(protobuf::Step::try_from(value).map_err(|_| out_of_range("Step", value))?.into())
}

/// Encodes an optional round as the wire's `-1`-for-absent convention.
pub fn round_to_i32(round: Option<u32>) -> i32 {
    round.and_then(|round| i32::try_from(round).ok()).unwrap_or(-1)
}

pub fn round_from_i32(value: i32) -> Option<u32> {
    u32::try_from(value).ok()
}

impl From<protobuf::Endorsement> for Endorsement {
    fn from(value: protobuf::Endorsement) -> Self {
        Endorsement { signer: value.signer, signature: value.signature }
    }
}

impl From<Endorsement> for protobuf::Endorsement {
    fn from(value: Endorsement) -> Self {
        protobuf::Endorsement { signer: value.signer, signature: value.signature }
    }
}

impl From<protobuf::BlockHeader> for BlockHeader {
    fn from(value: protobuf::BlockHeader) -> Self {
        BlockHeader {
            height: value.height,
            pre_block_hash: BlockHash::from_wire(value.pre_block_hash),
            block_hash: BlockHash::from_wire(value.block_hash),
            proposer: value.proposer,
            signature: value.signature,
            timestamp: value.timestamp,
        }
    }
}

impl From<BlockHeader> for protobuf::BlockHeader {
    fn from(value: BlockHeader) -> Self {
        protobuf::BlockHeader {
            height: value.height,
            pre_block_hash: BlockHash::to_wire(value.pre_block_hash.as_ref()),
            block_hash: BlockHash::to_wire(value.block_hash.as_ref()),
            proposer: value.proposer,
            signature: value.signature,
            timestamp: value.timestamp,
        }
    }
}

impl TryFrom<protobuf::Block> for Block {
    type Error = ProtobufConversionError;

    fn try_from(value: protobuf::Block) -> Result<Self, Self::Error> {
        let header = value.header.ok_or(missing("Block::header"))?.into();
        Ok(Block { header, txs: value.txs, additional_data: value.additional_data })
    }
}

impl From<Block> for protobuf::Block {
    fn from(value: Block) -> Self {
        protobuf::Block {
            header: Some(value.header.into()),
            txs: value.txs,
            additional_data: value.additional_data,
        }
    }
}

auto_impl_into_and_try_from_vec_u8!(Block, protobuf::Block);

impl TryFrom<protobuf::Vote> for Vote {
    type Error = ProtobufConversionError;

    fn try_from(value: protobuf::Vote) -> Result<Self, Self::Error> {
        Ok(Vote {
            vote_type: vote_type_from_i32(value.vote_type)?,
            voter: value.voter,
            height: value.height,
            round: value.round,
            block_hash: BlockHash::from_wire(value.hash),
            endorsement: value.endorsement.map(Endorsement::from),
        })
    }
}

impl From<Vote> for protobuf::Vote {
    fn from(value: Vote) -> Self {
        protobuf::Vote {
            vote_type: i32::from(protobuf::VoteType::from(value.vote_type)),
            voter: value.voter,
            height: value.height,
            round: value.round,
            hash: BlockHash::to_wire(value.block_hash.as_ref()),
            endorsement: value.endorsement.map(protobuf::Endorsement::from),
        }
    }
}

auto_impl_into_and_try_from_vec_u8!(Vote, protobuf::Vote);

impl TryFrom<protobuf::Proposal> for Proposal {
    type Error = ProtobufConversionError;

    fn try_from(value: protobuf::Proposal) -> Result<Self, Self::Error> {
        if value.pol_round < -1 {
            return Err(out_of_range("Proposal::pol_round", value.pol_round));
        }
        let block = value.block.ok_or(missing("Proposal::block"))?.try_into()?;
        Ok(Proposal {
            voter: value.voter,
            height: value.height,
            round: value.round,
            pol_round: round_from_i32(value.pol_round),
            block,
            endorsement: value.endorsement.map(Endorsement::from),
        })
    }
}

impl From<Proposal> for protobuf::Proposal {
    fn from(value: Proposal) -> Self {
        protobuf::Proposal {
            voter: value.voter,
            height: value.height,
            round: value.round,
            pol_round: round_to_i32(value.pol_round),
            block: Some(value.block.into()),
            endorsement: value.endorsement.map(protobuf::Endorsement::from),
        }
    }
}

auto_impl_into_and_try_from_vec_u8!(Proposal, protobuf::Proposal);

impl TryFrom<protobuf::TimeoutInfo> for TimeoutInfo {
    type Error = ProtobufConversionError;

    fn try_from(value: protobuf::TimeoutInfo) -> Result<Self, Self::Error> {
        Ok(TimeoutInfo {
            duration: Duration::from_nanos(value.duration_nanos),
            height: value.height,
            round: value.round,
            step: step_from_i32(value.step)?,
        })
    }
}

impl From<TimeoutInfo> for protobuf::TimeoutInfo {
    fn from(value: TimeoutInfo) -> Self {
        protobuf::TimeoutInfo {
            duration_nanos: u64::try_from(value.duration.as_nanos()).unwrap_or(u64::MAX),
            height: value.height,
            round: value.round,
            step: i32::from(protobuf::Step::from(value.step)),
        }
    }
}

auto_impl_into_and_try_from_vec_u8!(TimeoutInfo, protobuf::TimeoutInfo);

impl TryFrom<protobuf::GossipState> for GossipState {
    type Error = ProtobufConversionError;

    fn try_from(value: protobuf::GossipState) -> Result<Self, Self::Error> {
        Ok(GossipState {
            id: value.id,
            height: value.height,
            round: value.round,
            step: step_from_i32(value.step)?,
            proposal: value.proposal.and_then(BlockHash::from_wire),
            verifying_proposal: value.verifying_proposal.and_then(BlockHash::from_wire),
            round_vote_set: value.round_vote_set,
        })
    }
}

impl From<GossipState> for protobuf::GossipState {
    fn from(value: GossipState) -> Self {
        protobuf::GossipState {
            id: value.id,
            height: value.height,
            round: value.round,
            step: i32::from(protobuf::Step::from(value.step)),
            proposal: value.proposal.map(|hash| hash.0),
            verifying_proposal: value.verifying_proposal.map(|hash| hash.0),
            round_vote_set: value.round_vote_set,
        }
    }
}

auto_impl_into_and_try_from_vec_u8!(GossipState, protobuf::GossipState);

impl TryFrom<protobuf::TbftMsg> for TbftMessage {
    type Error = ProtobufConversionError;

    fn try_from(value: protobuf::TbftMsg) -> Result<Self, Self::Error> {
        let msg_type = protobuf::TbftMsgType::try_from(value.msg_type)
            .map_err(|_| out_of_range("TbftMsgType", value.msg_type))?;
        Ok(match msg_type {
            protobuf::TbftMsgType::Propose => TbftMessage::Propose(value.msg.try_into()?),
            protobuf::TbftMsgType::Prevote => TbftMessage::Prevote(value.msg.try_into()?),
            protobuf::TbftMsgType::Precommit => TbftMessage::Precommit(value.msg.try_into()?),
            protobuf::TbftMsgType::State => TbftMessage::State(value.msg.try_into()?),
        })
    }
}

impl From<TbftMessage> for protobuf::TbftMsg {
    fn from(value: TbftMessage) -> Self {
        let (msg_type, msg) = match value {
            TbftMessage::Propose(proposal) => (protobuf::TbftMsgType::Propose, proposal.into()),
            TbftMessage::Prevote(vote) => (protobuf::TbftMsgType::Prevote, vote.into()),
            TbftMessage::Precommit(vote) => (protobuf::TbftMsgType::Precommit, vote.into()),
            TbftMessage::State(state) => (protobuf::TbftMsgType::State, state.into()),
        };
        protobuf::TbftMsg { msg_type: i32::from(msg_type), msg }
    }
}

auto_impl_into_and_try_from_vec_u8!(TbftMessage, protobuf::TbftMsg);

impl TryFrom<protobuf::WalEntry> for WalEntry {
    type Error = ProtobufConversionError;

    fn try_from(value: protobuf::WalEntry) -> Result<Self, Self::Error> {
        let entry_type = match protobuf::WalEntryType::try_from(value.entry_type)
            .map_err(|_| out_of_range("WalEntryType", value.entry_type))?
        {
            protobuf::WalEntryType::Proposal => WalEntryType::Proposal,
            protobuf::WalEntryType::Vote => WalEntryType::Vote,
            protobuf::WalEntryType::Timeout => WalEntryType::Timeout,
        };
        Ok(WalEntry {
            height: value.height,
            height_first_index: value.height_first_index,
            entry_type,
            data: value.data,
        })
    }
}

impl From<WalEntry> for protobuf::WalEntry {
    fn from(value: WalEntry) -> Self {
        let entry_type = match value.entry_type {
            WalEntryType::Proposal => protobuf::WalEntryType::Proposal,
            WalEntryType::Vote => protobuf::WalEntryType::Vote,
            WalEntryType::Timeout => protobuf::WalEntryType::Timeout,
        };
        protobuf::WalEntry {
            height: value.height,
            height_first_index: value.height_first_index,
            entry_type: i32::from(entry_type),
            data: value.data,
        }
    }
}

auto_impl_into_and_try_from_vec_u8!(WalEntry, protobuf::WalEntry);
