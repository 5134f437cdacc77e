//! The set of preset parameter names the LLM is allowed to touch.
//!
//! Built once by the composition root and shared read-only (`Arc<ParamRegistry>`)
//! by every request.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

const BUILTIN_PARAMETERS: &str = include_str!("../../parameters.txt");

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read parameter list {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parameter list {0} contains no parameter names")]
    Empty(String),
}

#[derive(Debug, Clone)]
pub struct ParamRegistry {
    names: Vec<String>,
    lookup: HashSet<String>,
    prompt_block: String,
}

impl ParamRegistry {
    pub fn builtin() -> Self {
        Self::from_names(names_in(BUILTIN_PARAMETERS))
    }

    /// Loads from `path` when given, otherwise the compiled-in list.
    pub fn load(path: Option<&Path>) -> Result<Self, RegistryError> {
        let Some(path) = path else {
            return Self::parse(BUILTIN_PARAMETERS, "<builtin>");
        };
        let text = std::fs::read_to_string(path).map_err(|source| RegistryError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, &path.display().to_string())
    }

    pub fn parse(text: &str, origin: &str) -> Result<Self, RegistryError> {
        let names = names_in(text);
        if names.is_empty() {
            return Err(RegistryError::Empty(origin.to_string()));
        }
        Ok(Self::from_names(names))
    }

    /// Order is preserved; duplicates keep their first position.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut lookup = HashSet::new();
        let mut ordered = Vec::new();
        for name in names {
            let name = name.into();
            if lookup.insert(name.clone()) {
                ordered.push(name);
            }
        }
        let prompt_block = ordered.join("\n");
        Self {
            names: ordered,
            lookup,
            prompt_block,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup.contains(name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// One name per line, embedded verbatim into the system prompt.
    pub fn prompt_block(&self) -> &str {
        &self.prompt_block
    }
}

fn names_in(text: &str) -> Vec<&str> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn builtin_list_loads_core_vital_params() {
        let reg = ParamRegistry::builtin();
        assert!(reg.len() > 400);
        for name in ["filter_1_cutoff", "env_1_attack", "osc_1_level", "reverb_dry_wet", "volume"] {
            assert!(reg.contains(name), "missing {name}");
        }
        assert!(!reg.contains("# Vital preset parameters accepted in the \"settings\" block."));
    }

    #[test]
    fn parse_skips_comments_and_dedups_in_order() {
        let reg = ParamRegistry::parse("# header\nb\n\n a \nb\n", "test").unwrap();
        assert_eq!(reg.names(), &["b".to_string(), "a".to_string()]);
        assert_eq!(reg.prompt_block(), "b\na");
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = ParamRegistry::load(Some(Path::new("/definitely/not/here.txt"))).unwrap_err();
        assert!(matches!(err, RegistryError::Read { .. }));
    }

    #[test]
    fn empty_file_is_an_error() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "# only comments").unwrap();
        let err = ParamRegistry::load(Some(f.path())).unwrap_err();
        assert!(matches!(err, RegistryError::Empty(_)));
    }

    #[test]
    fn override_file_replaces_builtin() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "filter_cutoff\nresonance").unwrap();
        let reg = ParamRegistry::load(Some(f.path())).unwrap();
        assert_eq!(reg.len(), 2);
        assert!(reg.contains("filter_cutoff"));
        assert!(!reg.contains("filter_1_cutoff"));
    }
}
