use super::error::RelayError;
use crate::decision::DecisionError;
use serde::de::Error as _;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;

/// One sensor sample as sent by the kiln controller
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorReading {
    pub current_temp: f64,
}

impl SensorReading {
    /// Only a JSON object carrying a numeric `currentTemp` is a reading.
    pub fn decode(payload: &[u8]) -> Result<Self, RelayError> {
        match serde_json::from_slice::<Value>(payload)? {
            object @ Value::Object(_) => Ok(serde_json::from_value(object)?),
            other => Err(RelayError::Decode(serde_json::Error::custom(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            )))),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Decision outcome forwarded verbatim to the actuator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification(String);

impl Classification {
    /// Accepts only non-empty strings; anything else is an evaluation error.
    pub fn from_output(name: &str, value: Option<&Value>) -> Result<Self, DecisionError> {
        match value {
            None | Some(Value::Null) => Err(DecisionError::MissingOutput(name.to_string())),
            Some(Value::String(label)) if label.is_empty() => Err(DecisionError::InvalidOutput {
                name: name.to_string(),
                reason: "empty string".to_string(),
            }),
            Some(Value::String(label)) => Ok(Self(label.clone())),
            Some(other) => Err(DecisionError::InvalidOutput {
                name: name.to_string(),
                reason: format!("expected a string, got {}", other),
            }),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.0.into_bytes()
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
