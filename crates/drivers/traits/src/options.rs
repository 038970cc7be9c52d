//! Loosely-typed device options
//!
//! Options arrive as a JSON object. Each driver decodes the fields it knows
//! into its own `Deserialize` struct; unknown fields are ignored and a
//! missing required field surfaces as [`DevError::InvalidArgument`].

use alloc::string::String;

use log::error;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::{DevError, DevResult};

/// A parsed options object
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DevOptions {
    value: Map<String, Value>,
}

impl DevOptions {
    /// Options with no fields
    pub fn empty() -> Self {
        DevOptions::default()
    }

    /// Parse a JSON object; an empty or blank string is the empty object
    pub fn parse(text: &str) -> DevResult<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(DevOptions::empty());
        }
        match serde_json::from_str::<Value>(text) {
            Ok(v) => DevOptions::from_value(v),
            Err(e) => {
                error!("invalid options '{}': {}", text, e);
                Err(DevError::InvalidArgument)
            }
        }
    }

    /// Wrap an already-parsed value; only objects (or null) are accepted
    pub fn from_value(value: Value) -> DevResult<Self> {
        match value {
            Value::Object(value) => Ok(DevOptions { value }),
            Value::Null => Ok(DevOptions::empty()),
            _ => Err(DevError::InvalidArgument),
        }
    }

    /// Decode into a driver's option struct
    pub fn decode<T: DeserializeOwned>(&self) -> DevResult<T> {
        serde_json::from_value(Value::Object(self.value.clone())).map_err(|e| {
            error!("bad options: {}", e);
            DevError::InvalidArgument
        })
    }

    /// Raw access to a single field
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.value.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Serialize back to compact JSON
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.value).unwrap_or_default()
    }
}
