use crate::modules::param_registry::ParamRegistry;
use crate::modules::protocol::{json_type_name, ParamPatch};
use serde_json::{Map, Value};

/// Why a single patch entry was dropped. Never fatal on its own.
#[derive(Debug, Clone, PartialEq)]
pub enum CoercionDiagnostic {
    UnparsableString { key: String, value: String },
    NonFinite { key: String, value: String },
    UnsupportedType { key: String, type_name: &'static str },
    UnknownParameter { key: String },
}

impl CoercionDiagnostic {
    pub fn key(&self) -> &str {
        match self {
            CoercionDiagnostic::UnparsableString { key, .. }
            | CoercionDiagnostic::NonFinite { key, .. }
            | CoercionDiagnostic::UnsupportedType { key, .. }
            | CoercionDiagnostic::UnknownParameter { key } => key,
        }
    }
}

impl std::fmt::Display for CoercionDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoercionDiagnostic::UnparsableString { key, value } => {
                write!(f, "skipping '{key}': cannot coerce string {value:?} to float")
            }
            CoercionDiagnostic::NonFinite { key, value } => {
                write!(f, "skipping '{key}': value {value:?} is not finite")
            }
            CoercionDiagnostic::UnsupportedType { key, type_name } => {
                write!(f, "skipping '{key}': unexpected type {type_name}")
            }
            CoercionDiagnostic::UnknownParameter { key } => {
                write!(f, "skipping '{key}': not a known preset parameter")
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoercionOutcome {
    pub patch: ParamPatch,
    pub diagnostics: Vec<CoercionDiagnostic>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnknownParamPolicy {
    /// Keep keys that are not in the registry (forward-compatible settings).
    #[default]
    Accept,
    Drop,
}

impl std::str::FromStr for UnknownParamPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "accept" | "keep" | "allow" => Ok(Self::Accept),
            "drop" | "filter" | "strict" => Ok(Self::Drop),
            other => Err(format!("unknown parameter policy {other:?} (expected accept|drop)")),
        }
    }
}

/// Best-effort conversion of an untrusted patch. Bad entries are dropped with a
/// diagnostic; the rest survive.
pub fn coerce_patch(raw: &Map<String, Value>) -> CoercionOutcome {
    let outcome = raw
        .iter()
        .fold(CoercionOutcome::default(), |mut acc, (key, value)| {
            match coerce_value(key, value) {
                Ok(v) => {
                    acc.patch.insert(key.clone(), v);
                }
                Err(diag) => acc.diagnostics.push(diag),
            }
            acc
        });

    for d in &outcome.diagnostics {
        tracing::warn!(key = d.key(), "{d}");
    }
    outcome
}

fn coerce_value(key: &str, value: &Value) -> Result<f64, CoercionDiagnostic> {
    match value {
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()).ok_or_else(|| {
            CoercionDiagnostic::NonFinite {
                key: key.to_string(),
                value: n.to_string(),
            }
        }),
        Value::String(s) => match s.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(v),
            Ok(_) => Err(CoercionDiagnostic::NonFinite {
                key: key.to_string(),
                value: s.clone(),
            }),
            Err(_) => Err(CoercionDiagnostic::UnparsableString {
                key: key.to_string(),
                value: s.clone(),
            }),
        },
        other => Err(CoercionDiagnostic::UnsupportedType {
            key: key.to_string(),
            type_name: json_type_name(other),
        }),
    }
}

/// Applies the registry policy to an already coerced patch.
pub fn filter_unknown(
    mut patch: ParamPatch,
    registry: &ParamRegistry,
    policy: UnknownParamPolicy,
) -> (ParamPatch, Vec<CoercionDiagnostic>) {
    let mut diagnostics = Vec::new();
    match policy {
        UnknownParamPolicy::Accept => {
            let unknown = patch.iter().filter(|(k, _)| !registry.contains(k)).count();
            if unknown > 0 {
                tracing::debug!(unknown, "patch contains parameters outside the registry");
            }
        }
        UnknownParamPolicy::Drop => {
            patch.retain(|k, _| {
                if registry.contains(k) {
                    return true;
                }
                diagnostics.push(CoercionDiagnostic::UnknownParameter { key: k.to_string() });
                false
            });
            for d in &diagnostics {
                tracing::warn!(key = d.key(), "{d}");
            }
        }
    }
    (patch, diagnostics)
}
