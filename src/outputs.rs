use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Placeholder the engine prints for secret outputs when secrets are not shown.
pub const SECRET_PLACEHOLDER: &str = "[secret]";

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Parsing error: {0}")]
    ParsingError(String),

    #[error("Expected a JSON object of outputs, got: {0}")]
    NotAnObject(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputValue {
    pub value: Value,
    pub secret: bool,
}

impl OutputValue {
    pub fn plain(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            secret: false,
        }
    }

    pub fn secret(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            secret: true,
        }
    }
}

impl fmt::Display for OutputValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.secret {
            return write!(f, "{}", SECRET_PLACEHOLDER);
        }
        match &self.value {
            Value::String(value) => write!(f, "{}", value),
            value => write!(f, "{}", value),
        }
    }
}

pub type OutputMap = BTreeMap<String, OutputValue>;

/// Combines the masked and the revealed `stack output --json` documents. A key is
/// secret when its masked value is the placeholder and revealing changes it, so a
/// plain output that happens to read `[secret]` stays plain.
pub fn from_engine_json(masked: &str, revealed: &str) -> Result<OutputMap, Error> {
    let masked = parse_object(masked)?;
    let revealed = parse_object(revealed)?;

    let outputs = revealed
        .into_iter()
        .map(|(key, value)| {
            let placeholder = Value::String(SECRET_PLACEHOLDER.to_string());
            let secret = masked.get(&key) == Some(&placeholder) && value != placeholder;
            (key, OutputValue { value, secret })
        })
        .collect();

    return Ok(outputs);
}

fn parse_object(contents: &str) -> Result<Map<String, Value>, Error> {
    // an empty document means the stack has no outputs yet
    if contents.trim().is_empty() {
        return Ok(Map::new());
    }

    let value: Value = match serde_json::from_str(contents) {
        Ok(value) => value,
        Err(error) => return Err(Error::ParsingError(error.to_string())),
    };

    match value {
        Value::Object(map) => Ok(map),
        other => Err(Error::NotAnObject(other.to_string())),
    }
}

/// One `key = value` line per output, secrets redacted.
pub fn summary(outputs: &OutputMap) -> String {
    outputs.iter().fold(String::new(), |mut acc, (key, value)| {
        acc.push_str(&format!("  {} = {}\n", key, value));
        acc
    })
}
