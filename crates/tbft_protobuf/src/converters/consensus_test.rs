use std::collections::BTreeMap;
use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use prost::Message;
use rstest::rstest;
use test_case::test_case;

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
    NIL_HASH,
};
use crate::converters::ProtobufConversionError;
use crate::protobuf;

fn endorsement(signer: &str) -> Endorsement {
    Endorsement { signer: signer.as_bytes().to_vec(), signature: vec![0xab; 64] }
}

fn block(height: u64) -> Block {
    Block {
        header: BlockHeader {
            height,
            pre_block_hash: Some(BlockHash(vec![1; 32])),
            block_hash: Some(BlockHash(vec![2; 32])),
            proposer: b"validator_1".to_vec(),
            signature: vec![3; 64],
            timestamp: 1_700_000_000,
        },
        txs: vec![b"tx_1".to_vec(), b"tx_2".to_vec()],
        additional_data: BTreeMap::from([("extra".to_string(), vec![4, 5, 6])]),
    }
}

#[rstest]
#[case::prevote_for_block(VoteType::Prevote, Some(BlockHash(vec![9; 32])))]
#[case::precommit_for_block(VoteType::Precommit, Some(BlockHash(vec![9; 32])))]
#[case::nil_prevote(VoteType::Prevote, None)]
fn vote_survives_wire(#[case] vote_type: VoteType, #[case] block_hash: Option<BlockHash>) {
    let vote = Vote {
        endorsement: Some(endorsement("validator_2")),
        ..Vote::new(vote_type, "validator_2".to_string(), 7, 3, block_hash)
    };

    let bytes: Vec<u8> = vote.clone().into();
    assert_eq!(Vote::try_from(bytes.clone()).unwrap(), vote);
    // Re-encoding the parsed vote reproduces the exact bytes.
    let reparsed: Vec<u8> = Vote::try_from(bytes.clone()).unwrap().into();
    assert_eq!(reparsed, bytes);
}

#[test_case(None; "without_lock")]
#[test_case(Some(2); "with_lock")]
fn proposal_survives_wire(pol_round: Option<u32>) {
    let proposal = Proposal {
        endorsement: Some(endorsement("validator_1")),
        ..Proposal::new("validator_1".to_string(), 10, 4, pol_round, block(10))
    };

    let bytes: Vec<u8> = proposal.clone().into();
    assert_eq!(Proposal::try_from(bytes.clone()).unwrap(), proposal);
    let reparsed: Vec<u8> = Proposal::try_from(bytes.clone()).unwrap().into();
    assert_eq!(reparsed, bytes);
}

#[test]
fn legacy_nil_marker_parses_as_nil() {
    let raw = protobuf::Vote {
        vote_type: i32::from(protobuf::VoteType::Precommit),
        voter: "validator_3".to_string(),
        height: 1,
        round: 0,
        hash: NIL_HASH.to_vec(),
        endorsement: None,
    };

    let vote = Vote::try_from(raw.encode_to_vec()).unwrap();
    assert!(vote.is_nil());
}

#[test]
fn proposal_without_block_is_rejected() {
    let raw = protobuf::Proposal { voter: "validator_1".to_string(), ..Default::default() };

    assert_matches!(
        Proposal::try_from(raw.encode_to_vec()),
        Err(ProtobufConversionError::MissingField { field_description: "Proposal::block" })
    );
}

#[test]
fn unknown_step_is_out_of_range() {
    let raw = protobuf::TimeoutInfo { duration_nanos: 1, height: 1, round: 0, step: 42 };

    assert_matches!(
        TimeoutInfo::try_from(raw.encode_to_vec()),
        Err(ProtobufConversionError::OutOfRangeValue { type_description: "Step", .. })
    );
}

#[test]
fn signing_bytes_ignore_endorsement_and_additional_data() {
    let unsigned = Proposal::new("validator_1".to_string(), 10, 0, None, block(10));
    let mut signed = unsigned.clone();
    signed.endorsement = Some(endorsement("validator_1"));
    signed.block.additional_data.insert("qc".to_string(), vec![1, 2, 3]);

    assert_eq!(signed.signing_bytes(), unsigned.signing_bytes());
}

#[test]
fn envelope_keeps_message_kind() {
    let vote = Vote::new(VoteType::Precommit, "validator_0".to_string(), 5, 1, None);
    let state = GossipState {
        id: "validator_0".to_string(),
        height: 5,
        round: 1,
        step: Step::Precommit,
        proposal: Some(BlockHash(vec![8; 32])),
        verifying_proposal: None,
        round_vote_set: Some(protobuf::RoundVoteSet { height: 5, round: 1, ..Default::default() }),
    };

    for message in [TbftMessage::Precommit(vote), TbftMessage::State(state)] {
        let bytes: Vec<u8> = message.clone().into();
        assert_eq!(TbftMessage::try_from(bytes).unwrap(), message);
    }
}

#[test]
fn wal_entry_wraps_timeout() {
    let timeout = TimeoutInfo::new(Duration::from_millis(1500), 7, 2, Step::Precommit);
    let entry = WalEntry {
        height: 7,
        height_first_index: 31,
        entry_type: WalEntryType::Timeout,
        data: timeout.clone().into(),
    };

    let bytes: Vec<u8> = entry.clone().into();
    let parsed = WalEntry::try_from(bytes).unwrap();
    assert_eq!(parsed, entry);
    assert_eq!(TimeoutInfo::try_from(parsed.data).unwrap(), timeout);
}
