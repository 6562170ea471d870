//! Utils for serializing config objects into a flattened map.
//! The elements structure is:
//!
//! ```json
//! "conf1.conf2.param_name": {
//!     "description": "Param description.",
//!     "value": json_value,
//!     "privacy": "Public"
//! }
//! ```

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::json;

use crate::{ParamPath, ParamPrivacyInput, SerializedParam, FIELD_SEPARATOR};

/// Serialization for configs.
pub trait SerializeConfig {
    /// Conversion of a configuration to a mapping of flattened parameters to their descriptions and
    /// values.
    fn dump(&self) -> BTreeMap<ParamPath, SerializedParam>;

    /// The flattened parameters without their descriptions, as consumed by
    /// [`load`](crate::loading::load).
    fn dump_values(&self) -> BTreeMap<ParamPath, serde_json::Value> {
        self.dump().into_iter().map(|(path, param)| (path, param.value)).collect()
    }
}

/// Prepends `sub_config_name` to the ParamPath for each entry in `sub_config_dump`.
/// In order to load from a dump properly, `sub_config_name` must match the field's name for the
/// struct this function is called from.
pub fn prepend_sub_config_name(
    sub_config_dump: BTreeMap<ParamPath, SerializedParam>,
    sub_config_name: &str,
) -> BTreeMap<ParamPath, SerializedParam> {
    BTreeMap::from_iter(
        sub_config_dump.into_iter().map(|(field_name, val)| {
            (format!("{sub_config_name}{FIELD_SEPARATOR}{field_name}"), val)
        }),
    )
}

/// Serializes a single param of a config.
pub fn ser_param<T: Serialize>(
    name: &str,
    value: &T,
    description: &str,
    privacy: ParamPrivacyInput,
) -> (String, SerializedParam) {
    (
        name.to_owned(),
        SerializedParam { description: description.to_owned(), value: json!(value), privacy },
    )
}
