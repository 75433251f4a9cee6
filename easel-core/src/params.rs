//! Request parameters as handed to the pipeline's argument binding.
//!
//! JSON requests carry variable-length arrays, while the pipeline binds some
//! arguments (image sizes, crop offsets) as fixed-arity tuples. [`normalize`]
//! rewrites a JSON tree into a [`ParamValue`] tree where every array has become
//! a [`ParamValue::Tuple`], leaving keys and nesting untouched.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

pub type ParamMap = BTreeMap<String, ParamValue>;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<ParamValue>),
    Map(ParamMap),
}

impl ParamValue {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Tuple(_) => "tuple",
            Self::Map(_) => "map",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Self::Int(i) => Some(i as f64),
            Self::Float(f) => Some(f),
            _ => None,
        }
    }

    /// Non-negative integers, including floats with no fractional part.
    pub fn as_usize(&self) -> Option<usize> {
        match *self {
            Self::Int(i) => usize::try_from(i).ok(),
            Self::Float(f) if f >= 0.0 && f.fract() == 0.0 && f <= usize::MAX as f64 => {
                Some(f as usize)
            }
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_usize().map(|v| v as u64)
    }

    pub fn as_tuple(&self) -> Option<&[ParamValue]> {
        match self {
            Self::Tuple(items) => Some(items),
            _ => None,
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

/// Depth-first conversion of a JSON tree; arrays become tuples at any depth.
pub fn normalize(value: Value) -> ParamValue {
    match value {
        Value::Null => ParamValue::Null,
        Value::Bool(b) => ParamValue::Bool(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => ParamValue::Int(i),
            None => ParamValue::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => ParamValue::Str(s),
        Value::Array(items) => ParamValue::Tuple(items.into_iter().map(normalize).collect()),
        Value::Object(map) => ParamValue::Map(normalize_map(map)),
    }
}

pub fn normalize_map(map: serde_json::Map<String, Value>) -> ParamMap {
    map.into_iter().map(|(k, v)| (k, normalize(v))).collect()
}
