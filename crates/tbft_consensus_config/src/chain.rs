//! Consensus parameters carried by the chain configuration.
//!
//! The chain configuration is owned by the chain, not by the node: validators and the propose
//! timeout parameters are re-read on every height so that configuration blocks take effect at the
//! next height boundary.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::converters::parse_duration;
use crate::{ConfigError, ValidatorId};

pub const TBFT_PROPOSE_TIMEOUT_KEY: &str = "TBFT_propose_timeout";
pub const TBFT_PROPOSE_DELTA_TIMEOUT_KEY: &str = "TBFT_propose_delta_timeout";
pub const TBFT_BLOCKS_PER_PROPOSER_KEY: &str = "TBFT_blocks_per_proposer";

pub const DEFAULT_PROPOSE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_PROPOSE_TIMEOUT_DELTA: Duration = Duration::from_secs(1);
pub const DEFAULT_BLOCKS_PER_PROPOSER: u64 = 1;

/// The consensus section of a chain configuration, as published by the chain.
#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ChainConsensusConfig {
    pub validators: Vec<ValidatorId>,
    /// Free-form key/value extensions. The TBFT keys are listed above.
    pub ext_config: BTreeMap<String, String>,
}

/// Parameters of the consensus engine extracted from [`ChainConsensusConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TbftChainParams {
    pub validators: Vec<ValidatorId>,
    pub propose_timeout: Duration,
    pub propose_timeout_delta: Duration,
    pub blocks_per_proposer: u64,
}

impl TbftChainParams {
    pub fn extract(config: &ChainConsensusConfig) -> Result<Self, ConfigError> {
        let mut params = Self {
            validators: config.validators.clone(),
            propose_timeout: DEFAULT_PROPOSE_TIMEOUT,
            propose_timeout_delta: DEFAULT_PROPOSE_TIMEOUT_DELTA,
            blocks_per_proposer: DEFAULT_BLOCKS_PER_PROPOSER,
        };
        for (key, value) in &config.ext_config {
            let invalid = |reason: String| ConfigError::InvalidChainParam {
                key: key.clone(),
                value: value.clone(),
                reason,
            };
            match key.as_str() {
                TBFT_PROPOSE_TIMEOUT_KEY => {
                    params.propose_timeout = parse_duration(value).map_err(invalid)?;
                }
                TBFT_PROPOSE_DELTA_TIMEOUT_KEY => {
                    params.propose_timeout_delta = parse_duration(value).map_err(invalid)?;
                }
                TBFT_BLOCKS_PER_PROPOSER_KEY => {
                    let blocks: u64 =
                        value.trim().parse().map_err(|err| invalid(format!("{err}")))?;
                    if blocks == 0 {
                        return Err(invalid("must be positive".to_string()));
                    }
                    params.blocks_per_proposer = blocks;
                }
                _ => {}
            }
        }
        Ok(params)
    }

    /// Propose timeout of `round`: `propose_timeout + round * propose_timeout_delta`.
    pub fn propose_timeout(&self, round: u32) -> Duration {
        self.propose_timeout.saturating_add(self.propose_timeout_delta.saturating_mul(round))
    }
}

/// Checks whether a chain configuration is acceptable to the consensus engine.
pub fn verify_chain_config(config: &ChainConsensusConfig) -> Result<(), ConfigError> {
    let params = TbftChainParams::extract(config)?;
    if params.validators.is_empty() {
        return Err(ConfigError::EmptyValidatorSet);
    }
    Ok(())
}
