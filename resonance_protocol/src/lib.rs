use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const SETTINGS_KEY: &str = "settings";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ClientInput,
    UpstreamFetch,
    LlmFormat,
    LlmProvider,
    Internal,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorBody {
    pub error: String,
    pub code: ErrorCode,
    /// Raw LLM output, attached only to `llm_format` errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

/// "Apply description to preset". Exactly one of `preset_id` / `preset_data` must be set.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct GenerateRequest {
    pub description: String,
    #[serde(default)]
    pub preset_id: Option<String>,
    #[serde(default)]
    pub preset_data: Option<Value>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub skip_render: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GenerateResponse {
    pub modified_preset: PresetDocument,
    pub changes: ParamPatch,
    pub explanation: String,
    /// Base64-encoded WAV; `None` when rendering was skipped, unavailable or failed.
    pub audio: Option<String>,
    #[serde(default)]
    pub diff: Vec<DiffItem>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum StreamEvent {
    Chunk { text: String },
    Complete(GenerateResponse),
    Error(ErrorBody),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DiffItem {
    pub key: String,
    pub old_value: Option<f64>,
    pub new_value: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProviderHealth {
    pub healthy: bool,
    pub provider: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_response: Option<String>,
}

/// A full synth preset. Only `settings` is interpreted; every other key is carried as-is.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct PresetDocument(Map<String, Value>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresetShapeError(pub &'static str);

impl std::fmt::Display for PresetShapeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "preset document must be a JSON object, got {}", self.0)
    }
}

impl std::error::Error for PresetShapeError {}

impl PresetDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// `null` is read as an empty preset; anything other than an object is rejected.
    pub fn from_value(value: Value) -> Result<Self, PresetShapeError> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::Object(map) => Ok(Self(map)),
            other => Err(PresetShapeError(json_type_name(&other))),
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn as_map_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn settings(&self) -> Option<&Map<String, Value>> {
        self.0.get(SETTINGS_KEY).and_then(Value::as_object)
    }

    pub fn setting(&self, key: &str) -> Option<f64> {
        self.settings()?.get(key)?.as_f64()
    }
}

/// Validated patch: parameter name to a finite float.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct ParamPatch(BTreeMap<String, f64>);

impl ParamPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false (and stores nothing) for non-finite values.
    pub fn insert(&mut self, key: impl Into<String>, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        self.0.insert(key.into(), value);
        true
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&str, f64) -> bool) {
        self.0.retain(|k, v| keep(k, *v));
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for ParamPatch {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        let mut out = Self::new();
        for (k, v) in iter {
            out.insert(k, v);
        }
        out
    }
}

pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
