//! Quorum certificates: the precommit quorum a block was committed with, carried in the block's
//! additional data under [`TBFT_ADDITIONAL_DATA_KEY`].

#[cfg(test)]
#[path = "certificate_test.rs"]
mod certificate_test;

use prost::Message;
use tbft_protobuf::consensus::{display_hash, Block, VoteType, TBFT_ADDITIONAL_DATA_KEY};
use tbft_protobuf::converters::ProtobufConversionError;
use tbft_protobuf::protobuf;

use crate::types::{AccessControl, ConsensusError, ConsensusResult};
use crate::validator_set::ValidatorSet;
use crate::votes::VoteSet;

pub fn attach_quorum_certificate(block: &mut Block, quorum_certificate: &VoteSet) {
    block.additional_data.insert(TBFT_ADDITIONAL_DATA_KEY.to_string(), quorum_certificate.encode());
}

/// Checks that `block` carries a precommit quorum of `validators` for its own hash, and that
/// every vote in it is endorsed by its voter.
pub fn verify_block_quorum_certificate(
    block: &Block,
    validators: &ValidatorSet,
    access_control: &dyn AccessControl,
) -> ConsensusResult<()> {
    let height = block.height();
    let invalid =
        |reason: String| ConsensusError::InvalidQuorumCertificate { height, reason };

    let hash = block.hash().ok_or_else(|| invalid("the block has no hash".to_string()))?;
    let bytes = block
        .additional_data
        .get(TBFT_ADDITIONAL_DATA_KEY)
        .ok_or_else(|| invalid("no quorum certificate attached".to_string()))?;
    let proto =
        protobuf::VoteSet::decode(bytes.as_slice()).map_err(ProtobufConversionError::from)?;
    if proto.height != height {
        return Err(invalid(format!("certificate is for height {}", proto.height)));
    }

    let quorum_certificate = VoteSet::from_proto(proto, validators)?;
    if quorum_certificate.vote_type() != VoteType::Precommit {
        return Err(invalid(format!("certificate holds {} votes", quorum_certificate.vote_type())));
    }
    match quorum_certificate.two_thirds_majority() {
        Some(Some(maj23)) if maj23 == hash => {}
        Some(maj23) => {
            return Err(invalid(format!(
                "quorum for {} does not match block hash {hash}",
                display_hash(maj23)
            )));
        }
        None => {
            return Err(invalid(format!(
                "{} votes do not form a quorum of {} validators",
                quorum_certificate.sum(),
                validators.size()
            )));
        }
    }

    for vote in quorum_certificate.votes() {
        let endorsement = vote
            .endorsement
            .as_ref()
            .ok_or_else(|| invalid(format!("vote {vote} is not endorsed")))?;
        if !access_control.verify_endorsement(endorsement, &vote.signing_bytes())? {
            return Err(invalid(format!("bad endorsement on vote {vote}")));
        }
        let signer = access_control.node_id(&endorsement.signer)?;
        if signer != vote.voter {
            return Err(invalid(format!("vote {vote} was endorsed by {signer}")));
        }
    }
    Ok(())
}
