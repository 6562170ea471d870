//! A Tendermint-family BFT consensus engine.
//!
//! Validators agree on one block per height through rounds of propose, prevote and precommit.
//! A block is committed once two thirds plus one of the validators precommit it, and the
//! precommits travel with the block as its quorum certificate. [`ConsensusCore`] runs the protocol
//! and is driven through a [`ConsensusHandle`]; everything else the engine needs from the node is
//! reached through [`types::ConsensusContext`].

pub mod certificate;
pub mod consensus;
mod gossip;
pub mod metrics;
mod peer_state;
pub mod state;
pub mod time_scheduler;
pub mod types;
pub mod validator_set;
pub mod votes;
pub mod votes_threshold;
pub mod wal;

#[cfg(test)]
pub(crate) mod test_utils;

pub use certificate::{attach_quorum_certificate, verify_block_quorum_certificate};
pub use consensus::{ConsensusCore, ConsensusHandle};
pub use types::{ConsensusContext, ConsensusError, ConsensusResult, ConsensusStatus, VerifyResult};
pub use validator_set::ValidatorSet;
