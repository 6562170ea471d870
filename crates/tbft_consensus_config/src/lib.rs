//! Configuration of the TBFT consensus engine.
//!
//! [`config::ConsensusConfig`] is node-local and loaded once at startup. [`chain::TbftChainParams`]
//! is derived from the chain configuration and re-read on every height.

use serde::{Deserialize, Serialize};

pub mod chain;
pub mod config;
pub mod converters;
pub mod dumping;
pub mod loading;


pub use tbft_protobuf::consensus::ValidatorId;

/// Separator between the names of nested config fields in a flattened parameter path.
pub const FIELD_SEPARATOR: &str = ".";

/// A nested path of a configuration parameter, e.g. `timeouts.prevote.base`.
pub type ParamPath = String;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamPrivacyInput {
    /// The parameter may be logged and exposed.
    Public,
    /// The parameter must not be logged or exposed.
    Private,
}

/// A serialized configuration parameter with its description.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SerializedParam {
    pub description: String,
    pub value: serde_json::Value,
    pub privacy: ParamPrivacyInput,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    Validation(#[from] validator::ValidationErrors),
    #[error("Parameter path {param_path} collides with a parent parameter.")]
    ConflictingParamPath { param_path: ParamPath },
    #[error("Chain config key {key} has an invalid value {value}: {reason}")]
    InvalidChainParam { key: String, value: String, reason: String },
    #[error("Chain config has no validators.")]
    EmptyValidatorSet,
}
