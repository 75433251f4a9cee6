//! Request envelopes of the v1 and v2 inference protocols.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// v1 body: `{"instances": [...]}`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct LegacyRequest {
    pub instances: Vec<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InferInput {
    pub name: String,
    pub shape: Vec<i64>,
    pub datatype: String,
    #[serde(default)]
    pub data: Value,
}

/// v2 body: `{"id": ..., "inputs": [{"name", "shape", "datatype", "data"}]}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InferRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub inputs: Vec<InferInput>,
    #[serde(default)]
    pub parameters: Option<Map<String, Value>>,
}

/// A request body, classified once at the boundary.
#[derive(Clone, Debug, PartialEq)]
pub enum Envelope {
    Legacy(LegacyRequest),
    Structured(InferRequest),
    Malformed(String),
}

impl Envelope {
    pub fn from_json(value: Value) -> Self {
        let (has_instances, has_inputs) = match &value {
            Value::Object(map) => (map.contains_key("instances"), map.contains_key("inputs")),
            _ => return Self::Malformed("expected a JSON object".to_string()),
        };
        if has_instances {
            serde_json::from_value(value)
                .map_or_else(|e| Self::Malformed(e.to_string()), Self::Legacy)
        } else if has_inputs {
            serde_json::from_value(value)
                .map_or_else(|e| Self::Malformed(e.to_string()), Self::Structured)
        } else {
            Self::Malformed("missing \"instances\"".to_string())
        }
    }

    pub fn from_slice(body: &[u8]) -> Self {
        match serde_json::from_slice(body) {
            Ok(value) => Self::from_json(value),
            Err(e) => Self::Malformed(format!("body is not valid JSON: {e}")),
        }
    }
}
