//! Loads a config object from its flattened representation.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::{ConfigError, ParamPath, SerializedParam, FIELD_SEPARATOR};

/// Deserializes a config from a map of flattened parameter paths to values.
pub fn load<T: DeserializeOwned>(
    config_dump: &BTreeMap<ParamPath, Value>,
) -> Result<T, ConfigError> {
    let mut nested = Map::new();
    for (param_path, value) in config_dump {
        insert_nested(&mut nested, param_path, value.clone())?;
    }
    Ok(serde_json::from_value(Value::Object(nested))?)
}

/// Reads a dumped config file (see [`crate::dumping`]) and deserializes it.
pub fn load_from_file<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let dumped: BTreeMap<ParamPath, SerializedParam> = serde_json::from_reader(File::open(path)?)?;
    let values = dumped.into_iter().map(|(param_path, param)| (param_path, param.value)).collect();
    load(&values)
}

fn insert_nested(
    root: &mut Map<String, Value>,
    param_path: &str,
    value: Value,
) -> Result<(), ConfigError> {
    let mut fields = param_path.split(FIELD_SEPARATOR).peekable();
    let mut current = root;
    while let Some(field) = fields.next() {
        if fields.peek().is_none() {
            current.insert(field.to_owned(), value);
            return Ok(());
        }
        let child =
            current.entry(field.to_owned()).or_insert_with(|| Value::Object(Map::new()));
        current = child.as_object_mut().ok_or_else(|| ConfigError::ConflictingParamPath {
            param_path: param_path.to_owned(),
        })?;
    }
    Ok(())
}
