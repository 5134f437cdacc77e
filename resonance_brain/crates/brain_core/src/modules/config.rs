use crate::modules::coercion::UnknownParamPolicy;
use crate::modules::render::NoteSpec;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONTEXT_MAX_CHARS: usize = 12_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}={value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Trimmed, non-empty value of `key`.
pub fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Unset is `Ok(None)`; set but unparsable is an error.
pub fn env_parse<T>(key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = env_string(key) else {
        return Ok(None);
    };
    raw.parse::<T>()
        .map(Some)
        .map_err(|e| ConfigError::Invalid {
            key,
            value: raw,
            reason: e.to_string(),
        })
}

pub fn env_timeout(key: &'static str, default_secs: u64, min: u64, max: u64) -> Duration {
    let secs = std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(default_secs)
        .clamp(min, max);
    Duration::from_secs(secs)
}

/// Per-process knobs for the generation pipeline.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub unknown_params: UnknownParamPolicy,
    pub context_max_chars: usize,
    pub preview: NoteSpec,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            unknown_params: UnknownParamPolicy::Accept,
            context_max_chars: DEFAULT_CONTEXT_MAX_CHARS,
            preview: NoteSpec::default(),
        }
    }
}

impl PipelineOptions {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut out = Self::default();
        if let Some(policy) = env_parse::<UnknownParamPolicy>("RESONANCE_UNKNOWN_PARAMS")? {
            out.unknown_params = policy;
        }
        if let Some(max) = env_parse::<usize>("RESONANCE_CONTEXT_MAX_CHARS")? {
            out.context_max_chars = max;
        }
        if let Some(pitch) = env_parse::<u8>("RESONANCE_PREVIEW_PITCH")? {
            out.preview.pitch = pitch.min(127);
        }
        Ok(out)
    }
}

pub fn parameters_path_from_env() -> Option<PathBuf> {
    env_string("RESONANCE_PARAMETERS_PATH").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unparsable_env_value_is_reported() {
        std::env::set_var("RESONANCE_TEST_BAD_USIZE", "lots");
        let err = env_parse::<usize>("RESONANCE_TEST_BAD_USIZE").unwrap_err();
        assert!(err.to_string().contains("RESONANCE_TEST_BAD_USIZE"));
        std::env::remove_var("RESONANCE_TEST_BAD_USIZE");
    }

    #[test]
    fn unset_env_is_none() {
        assert!(env_parse::<usize>("RESONANCE_TEST_NEVER_SET").unwrap().is_none());
        assert!(env_string("RESONANCE_TEST_NEVER_SET").is_none());
    }

    #[test]
    fn timeout_is_clamped() {
        std::env::set_var("RESONANCE_TEST_TIMEOUT", "9999");
        assert_eq!(env_timeout("RESONANCE_TEST_TIMEOUT", 60, 5, 300), Duration::from_secs(300));
        std::env::remove_var("RESONANCE_TEST_TIMEOUT");
        assert_eq!(env_timeout("RESONANCE_TEST_TIMEOUT", 60, 5, 300), Duration::from_secs(60));
    }
}
