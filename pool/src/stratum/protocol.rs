/// Stratum protocol message types
///
/// Requests are newline-delimited JSON objects `{id, method, params}`.
/// Replies always carry `id`, `result` and `error`; server pushes use a
/// null id.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const METHOD_SUBSCRIBE: &str = "mining.subscribe";
pub const METHOD_AUTHORIZE: &str = "mining.authorize";
pub const METHOD_EXTRANONCE_SUBSCRIBE: &str = "mining.extranonce.subscribe";
pub const METHOD_SUBMIT: &str = "mining.submit";
pub const METHOD_VALIDATE_ADDRESS: &str = "web.validate.address";
pub const METHOD_PAYOUT: &str = "web.payout";
pub const METHOD_STATUS: &str = "web.status";

pub const METHOD_NOTIFY: &str = "mining.notify";
pub const METHOD_SET_DIFFICULTY: &str = "mining.set_difficulty";
pub const METHOD_SET_TARGET: &str = "mining.set_target";

/// Error code for a failed manual payout transaction
pub const PAYOUT_FAILURE: i64 = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumRequest {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Value,
}

impl StratumRequest {
    pub fn parse(line: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(line)
    }

    /// Positional params, empty when absent or not an array.
    pub fn params(&self) -> &[Value] {
        self.params.as_array().map(Vec::as_slice).unwrap_or(&[])
    }

    /// The string param at `index`.
    pub fn str_param(&self, index: usize) -> Option<&str> {
        self.params().get(index).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StratumResponse {
    pub id: Value,
    pub result: Value,
    pub error: Value,
}

impl StratumResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self { id, result, error: Value::Null }
    }

    pub fn error(id: Value, result: Value, error: Value) -> Self {
        Self { id, result, error }
    }

    /// `[code, message, null]`
    pub fn error_array(code: i64, message: &str) -> Value {
        json!([code, message, null])
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_null()
    }

    pub fn to_value(&self) -> Value {
        json!({ "id": self.id, "result": self.result, "error": self.error })
    }
}

/// Server push with a null id.
pub fn notification(method: &str, params: Value) -> Value {
    json!({ "id": null, "method": method, "params": params })
}
