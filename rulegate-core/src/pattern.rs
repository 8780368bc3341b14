//! Case-insensitive regex pattern sets.
//!
//! A [`Pattern`] is an ordered list of regex sources with "matches any"
//! semantics: an input matches when any pattern finds any occurrence in
//! it. Anchoring is left to the configuration author via `^…$`.
//!
//! In YAML a pattern may be written as a single scalar or as a sequence;
//! both decode to the same structure.

use regex::Regex;
use serde::{Deserialize, Deserializer};

use crate::error::{ConfigError, ConfigResult};

/// An ordered set of case-insensitive regular expressions.
///
/// Deserialization only captures the sources; [`Pattern::compile`] must
/// run (the validator does this) before [`Pattern::matches`] is useful.
#[derive(Debug, Clone, Default)]
pub struct Pattern {
    sources: Vec<String>,
    compiled: Vec<Regex>,
}

impl Pattern {
    /// Builds a pattern from raw sources without compiling.
    pub fn new<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sources: sources.into_iter().map(Into::into).collect(),
            compiled: Vec::new(),
        }
    }

    /// Builds and compiles a pattern in one step. Test and internal use.
    pub fn compiled<I, S>(sources: I) -> ConfigResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut pattern = Self::new(sources);
        pattern.compile()?;
        Ok(pattern)
    }

    /// Compiles every source with the case-insensitive flag.
    ///
    /// After a successful compile the compiled list has the same length
    /// as the source list.
    pub fn compile(&mut self) -> ConfigResult<()> {
        let mut compiled = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            let regex = Regex::new(&format!("(?i){source}")).map_err(|err| {
                ConfigError::Pattern {
                    pattern: source.clone(),
                    source: err,
                }
            })?;
            compiled.push(regex);
        }
        self.compiled = compiled;
        Ok(())
    }

    /// Returns `true` if any compiled pattern matches any substring of
    /// `input`.
    pub fn matches(&self, input: &str) -> bool {
        self.compiled.iter().any(|re| re.is_match(input))
    }

    /// Number of pattern sources.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Returns `true` when no sources were configured.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// The raw pattern sources, for diagnostics.
    pub fn sources(&self) -> &[String] {
        &self.sources
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            One(String),
            Many(Vec<String>),
        }

        let sources = match Raw::deserialize(deserializer)? {
            Raw::One(single) => vec![single],
            Raw::Many(multiple) => multiple,
        };
        Ok(Pattern {
            sources,
            compiled: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_pattern_matches_substring() {
        let pattern = Pattern::compiled(["/v1/chat"]).unwrap();
        assert!(pattern.matches("/v1/chat/completions"));
        assert!(pattern.matches("/api/v1/chat"));
        assert!(!pattern.matches("/v2/embeddings"));
    }

    #[test]
    fn test_matching_is_case_insensitive() {
        let pattern = Pattern::compiled(["post"]).unwrap();
        assert!(pattern.matches("POST"));
        assert!(pattern.matches("Post"));
        assert!(pattern.matches("post"));
    }

    #[test]
    fn test_any_match_semantics() {
        let pattern = Pattern::compiled(["^GET$", "^POST$"]).unwrap();
        assert!(pattern.matches("GET"));
        assert!(pattern.matches("POST"));
        assert!(!pattern.matches("DELETE"));
    }

    #[test]
    fn test_anchoring_is_callers_responsibility() {
        let unanchored = Pattern::compiled(["GET"]).unwrap();
        assert!(unanchored.matches("FORGET"));

        let anchored = Pattern::compiled(["^GET$"]).unwrap();
        assert!(!anchored.matches("FORGET"));
    }

    #[test]
    fn test_compile_failure_reports_pattern() {
        let mut pattern = Pattern::new(["[invalid"]);
        let err = pattern.compile().unwrap_err();
        assert!(err.to_string().contains("[invalid"));
    }

    #[test]
    fn test_compiled_len_equals_source_len() {
        let pattern = Pattern::compiled(["a", "b", "c"]).unwrap();
        assert_eq!(pattern.len(), 3);
        assert_eq!(pattern.compiled.len(), pattern.sources.len());
    }

    #[test]
    fn test_uncompiled_pattern_matches_nothing() {
        let pattern = Pattern::new(["anything"]);
        assert!(!pattern.matches("anything"));
    }

    #[test]
    fn test_deserialize_scalar_and_sequence_are_equivalent() {
        let scalar: Pattern = serde_yaml::from_str("POST").unwrap();
        let sequence: Pattern = serde_yaml::from_str("- POST").unwrap();
        assert_eq!(scalar.sources(), sequence.sources());
        assert_eq!(scalar.len(), 1);
    }

    #[test]
    fn test_deserialize_sequence_preserves_order() {
        let pattern: Pattern = serde_yaml::from_str("[GET, POST, DELETE]").unwrap();
        assert_eq!(pattern.sources(), &["GET", "POST", "DELETE"]);
    }
}
