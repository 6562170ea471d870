//! The validators of a height and the proposer rotation over them.

#[cfg(test)]
#[path = "validator_set_test.rs"]
mod validator_set_test;

use std::collections::BTreeSet;

use tracing::debug;

use crate::types::{Height, Round, ValidatorId};
use crate::votes_threshold::QUORUM;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ValidatorSetError {
    #[error("The validator set is empty.")]
    Empty,
    #[error("Blocks per proposer must be positive.")]
    InvalidBlocksPerProposer,
}

/// A sorted, deduplicated list of validators.
///
/// Every node sorts identities the same way, so the proposer of any (height, round) can be
/// computed locally and agrees across the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorSet {
    validators: Vec<ValidatorId>,
    blocks_per_proposer: u64,
}

impl ValidatorSet {
    pub fn new(
        validators: impl IntoIterator<Item = ValidatorId>,
        blocks_per_proposer: u64,
    ) -> Result<Self, ValidatorSetError> {
        if blocks_per_proposer == 0 {
            return Err(ValidatorSetError::InvalidBlocksPerProposer);
        }
        let validators: BTreeSet<ValidatorId> = validators.into_iter().collect();
        Ok(Self { validators: validators.into_iter().collect(), blocks_per_proposer })
    }

    pub fn validators(&self) -> &[ValidatorId] {
        &self.validators
    }

    pub fn size(&self) -> u64 {
        u64::try_from(self.validators.len()).unwrap_or(u64::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn has_validator(&self, id: &str) -> bool {
        self.validators.binary_search_by(|validator| validator.as_str().cmp(id)).is_ok()
    }

    pub fn blocks_per_proposer(&self) -> u64 {
        self.blocks_per_proposer
    }

    /// The number of matching votes that forms a quorum: `⌊2n/3⌋ + 1`.
    pub fn quorum(&self) -> u64 {
        QUORUM.min_votes(self.size())
    }

    /// The proposer of (height, round): the validator at sorted index
    /// `((height + 1) / blocks_per_proposer + round) mod n`.
    pub fn proposer(&self, height: Height, round: Round) -> Result<&ValidatorId, ValidatorSetError> {
        if self.validators.is_empty() {
            return Err(ValidatorSetError::Empty);
        }
        let offset = height.saturating_add(1) / self.blocks_per_proposer + u64::from(round);
        let index = usize::try_from(offset % self.size()).unwrap_or_default();
        Ok(&self.validators[index])
    }

    pub fn is_proposer(&self, id: &str, height: Height, round: Round) -> bool {
        self.proposer(height, round).is_ok_and(|proposer| proposer == id)
    }

    /// Replaces the validators, returning the (added, removed) validators, both sorted.
    pub fn update_validators(
        &mut self,
        validators: impl IntoIterator<Item = ValidatorId>,
    ) -> (Vec<ValidatorId>, Vec<ValidatorId>) {
        let new: BTreeSet<ValidatorId> = validators.into_iter().collect();
        let old: BTreeSet<ValidatorId> = self.validators.drain(..).collect();
        let added: Vec<ValidatorId> = new.difference(&old).cloned().collect();
        let removed: Vec<ValidatorId> = old.difference(&new).cloned().collect();
        if !added.is_empty() || !removed.is_empty() {
            debug!(?added, ?removed, "Validator set changed.");
        }
        self.validators = new.into_iter().collect();
        (added, removed)
    }

    pub fn update_blocks_per_proposer(
        &mut self,
        blocks_per_proposer: u64,
    ) -> Result<(), ValidatorSetError> {
        if blocks_per_proposer == 0 {
            return Err(ValidatorSetError::InvalidBlocksPerProposer);
        }
        self.blocks_per_proposer = blocks_per_proposer;
        Ok(())
    }
}
