//! This module contains the node-local configuration for consensus, the `ConsensusConfig` struct,
//! and its implementation of the `SerializeConfig` trait. The configuration includes parameters
//! such as the validator ID, the WAL location, gossip pacing and the vote timeouts.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::converters::{
    deserialize_float_seconds_to_duration,
    serialize_duration_to_float_seconds,
};
use crate::dumping::{prepend_sub_config_name, ser_param, SerializeConfig};
use crate::{ParamPath, ParamPrivacyInput, SerializedParam, ValidatorId};

pub const DEFAULT_VALIDATOR_ID: &str = "validator_0";

/// Configuration for consensus.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Validate)]
pub struct ConsensusConfig {
    /// The validator ID of the node.
    #[validate(length(min = 1))]
    pub validator_id: ValidatorId,
    /// Directory holding the write-ahead log.
    pub wal_dir: PathBuf,
    /// Whether every WAL append is flushed to disk before returning.
    pub wal_sync_on_write: bool,
    /// Maximum size (bytes) of a single WAL entry.
    #[validate(range(min = 1))]
    pub wal_max_entry_size: usize,
    /// The WAL is truncated whenever the new height is a multiple of this value.
    #[validate(range(min = 1))]
    pub wal_truncate_interval: u64,
    /// The interval (seconds) between periodic gossip rounds.
    #[serde(
        deserialize_with = "deserialize_float_seconds_to_duration",
        serialize_with = "serialize_duration_to_float_seconds"
    )]
    #[validate(custom(function = "validate_non_zero_duration"))]
    pub gossip_interval: Duration,
    /// Capacity of each of the consensus input queues.
    #[validate(range(min = 1))]
    pub channel_capacity: usize,
    /// How many superseded heights are kept for gossip with lagging peers.
    #[validate(range(min = 1))]
    pub state_cache_size: usize,
    /// A diagnostic snapshot is stored every this many heights.
    #[validate(range(min = 1))]
    pub snapshot_interval: u64,
    /// Timeouts configuration for consensus.
    #[validate(nested)]
    pub timeouts: TimeoutsConfig,
}

impl SerializeConfig for ConsensusConfig {
    fn dump(&self) -> BTreeMap<ParamPath, SerializedParam> {
        let mut config = BTreeMap::from_iter([
            ser_param(
                "validator_id",
                &self.validator_id,
                "The validator id of the node.",
                ParamPrivacyInput::Public,
            ),
            ser_param(
                "wal_dir",
                &self.wal_dir,
                "Directory holding the write-ahead log.",
                ParamPrivacyInput::Public,
            ),
            ser_param(
                "wal_sync_on_write",
                &self.wal_sync_on_write,
                "Whether every WAL append is flushed to disk before returning.",
                ParamPrivacyInput::Public,
            ),
            ser_param(
                "wal_max_entry_size",
                &self.wal_max_entry_size,
                "Maximum size (bytes) of a single WAL entry.",
                ParamPrivacyInput::Public,
            ),
            ser_param(
                "wal_truncate_interval",
                &self.wal_truncate_interval,
                "The WAL is truncated whenever the new height is a multiple of this value.",
                ParamPrivacyInput::Public,
            ),
            ser_param(
                "gossip_interval",
                &self.gossip_interval.as_secs_f64(),
                "The interval (seconds) between periodic gossip rounds.",
                ParamPrivacyInput::Public,
            ),
            ser_param(
                "channel_capacity",
                &self.channel_capacity,
                "Capacity of each of the consensus input queues.",
                ParamPrivacyInput::Public,
            ),
            ser_param(
                "state_cache_size",
                &self.state_cache_size,
                "How many superseded heights are kept for gossip with lagging peers.",
                ParamPrivacyInput::Public,
            ),
            ser_param(
                "snapshot_interval",
                &self.snapshot_interval,
                "A diagnostic snapshot is stored every this many heights.",
                ParamPrivacyInput::Public,
            ),
        ]);
        config.extend(prepend_sub_config_name(self.timeouts.dump(), "timeouts"));
        config
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            validator_id: ValidatorId::from(DEFAULT_VALIDATOR_ID),
            wal_dir: PathBuf::from("./data/tbft/wal"),
            wal_sync_on_write: true,
            wal_max_entry_size: 64 * 1024 * 1024,
            wal_truncate_interval: 10,
            gossip_interval: Duration::from_millis(500),
            channel_capacity: 1024,
            state_cache_size: 10,
            snapshot_interval: 1,
            timeouts: TimeoutsConfig::default(),
        }
    }
}

fn validate_non_zero_duration(duration: &Duration) -> Result<(), ValidationError> {
    if duration.is_zero() {
        return Err(ValidationError::new("zero_duration"));
    }
    Ok(())
}

/// A single timeout definition with base, per-round delta, and a maximum duration.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Timeout {
    /// The base timeout (seconds).
    #[serde(
        deserialize_with = "deserialize_float_seconds_to_duration",
        serialize_with = "serialize_duration_to_float_seconds"
    )]
    base: Duration,
    /// The per-round delta added to the timeout (seconds).
    #[serde(
        deserialize_with = "deserialize_float_seconds_to_duration",
        serialize_with = "serialize_duration_to_float_seconds"
    )]
    delta: Duration,
    /// The maximum timeout duration (seconds).
    #[serde(
        deserialize_with = "deserialize_float_seconds_to_duration",
        serialize_with = "serialize_duration_to_float_seconds"
    )]
    max: Duration,
}

impl Timeout {
    pub fn new(base: Duration, delta: Duration, max: Duration) -> Self {
        Self { base, delta, max }
    }

    /// Compute the timeout for the given round: min(base + round * delta, max).
    pub fn get_timeout(&self, round: u32) -> Duration {
        self.delta
            .checked_mul(round)
            .and_then(|growth| self.base.checked_add(growth))
            .map_or(self.max, |timeout| timeout.min(self.max))
    }

    fn is_consistent(&self) -> bool {
        self.base <= self.max
    }
}

impl SerializeConfig for Timeout {
    fn dump(&self) -> BTreeMap<ParamPath, SerializedParam> {
        BTreeMap::from_iter([
            ser_param(
                "base",
                &self.base.as_secs_f64(),
                "The base timeout (seconds).",
                ParamPrivacyInput::Public,
            ),
            ser_param(
                "delta",
                &self.delta.as_secs_f64(),
                "The per-round timeout delta (seconds).",
                ParamPrivacyInput::Public,
            ),
            ser_param(
                "max",
                &self.max.as_secs_f64(),
                "The maximum timeout (seconds).",
                ParamPrivacyInput::Public,
            ),
        ])
    }
}

/// Configuration for the vote-step timeouts. The propose timeout comes from the chain
/// configuration instead.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Validate)]
#[validate(schema(function = "validate_timeouts"))]
pub struct TimeoutsConfig {
    /// Armed once 2/3 of the prevotes are in without a majority.
    pub prevote: Timeout,
    /// Armed once 2/3 of the precommits are in without a majority.
    pub precommit: Timeout,
}

impl SerializeConfig for TimeoutsConfig {
    fn dump(&self) -> BTreeMap<ParamPath, SerializedParam> {
        let mut config = BTreeMap::new();
        config.extend(prepend_sub_config_name(self.prevote.dump(), "prevote"));
        config.extend(prepend_sub_config_name(self.precommit.dump(), "precommit"));
        config
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        let vote_timeout =
            Timeout::new(Duration::from_secs(30), Duration::from_secs(1), Duration::from_secs(120));
        Self { prevote: vote_timeout.clone(), precommit: vote_timeout }
    }
}

fn validate_timeouts(timeouts: &TimeoutsConfig) -> Result<(), ValidationError> {
    if !timeouts.prevote.is_consistent() || !timeouts.precommit.is_consistent() {
        return Err(ValidationError::new("timeout_base_above_max"));
    }
    Ok(())
}
