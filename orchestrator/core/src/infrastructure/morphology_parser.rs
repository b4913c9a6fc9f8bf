// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Morphology Text Parser
//!
//! Turns morphology text into [`Morphology`] values and back.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Parse external YAML → Domain objects
//! - **Anti-Corruption:** Text syntax stays here; the domain only sees
//!   mappings
//!
//! JSON documents are accepted as input since JSON is a subset of YAML.
//! Output is always YAML in canonical key order, with default values
//! removed, so saving the same content twice gives identical bytes.

use std::path::Path;

use serde_yaml::Value;
use tracing::debug;

use crate::domain::morphology::{Morphology, MorphologyError};
use crate::domain::normalization::{set_defaults, to_canonical_yaml, unset_defaults};
use crate::domain::validation::MorphologyValidator;

// ============================================================================
// Parser API
// ============================================================================

pub struct MorphologyParser;

impl MorphologyParser {
    /// Parse text into an unvalidated morphology
    pub fn parse(text: &str, origin: &str) -> Result<Morphology, MorphologyError> {
        let value: Value = serde_yaml::from_str(text).map_err(|e| MorphologyError::Syntax {
            origin: origin.to_string(),
            message: e.to_string(),
        })?;

        match value {
            Value::Mapping(data) => Ok(Morphology::new(data, origin)),
            _ => Err(MorphologyError::NotAMapping {
                origin: origin.to_string(),
            }),
        }
    }

    /// Parse, validate and fill in defaults
    pub fn load_from_string(text: &str, origin: &str) -> Result<Morphology, MorphologyError> {
        let mut morph = Self::parse(text, origin)?;
        MorphologyValidator::validate(&mut morph)?;
        set_defaults(&mut morph)?;
        debug!(origin = %origin, kind = ?morph.kind(), "Loaded morphology");
        Ok(morph)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Morphology, MorphologyError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| MorphologyError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::load_from_string(&text, &path.display().to_string())
    }

    /// Canonical text of `morph`, with default values left out
    pub fn save_to_string(morph: &Morphology) -> Result<String, MorphologyError> {
        let mut copy = morph.clone();
        unset_defaults(&mut copy)?;
        to_canonical_yaml(&copy)
    }

    /// Write canonical text to `path`, replacing the file atomically
    pub fn save_to_file<P: AsRef<Path>>(morph: &Morphology, path: P) -> Result<(), MorphologyError> {
        let path = path.as_ref();
        let text = Self::save_to_string(morph)?;
        let io_error = |e: std::io::Error| MorphologyError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        };

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut staged = tempfile::NamedTempFile::new_in(dir).map_err(io_error)?;
        std::io::Write::write_all(&mut staged, text.as_bytes()).map_err(io_error)?;
        staged.persist(path).map_err(|e| io_error(e.error))?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const CHUNK: &str = r#"
name: foo
kind: chunk
build-system: autotools
configure-commands:
  - ./configure --prefix=/usr
"#;

    #[test]
    fn test_syntax_error() {
        let err = MorphologyParser::parse("name: [unclosed", "bad.morph").unwrap_err();
        assert!(matches!(err, MorphologyError::Syntax { ref origin, .. } if origin == "bad.morph"));
    }

    #[test]
    fn test_not_a_mapping() {
        let err = MorphologyParser::parse("- a\n- b\n", "list.morph").unwrap_err();
        assert!(matches!(err, MorphologyError::NotAMapping { .. }));
    }

    #[test]
    fn test_json_accepted() {
        let morph =
            MorphologyParser::load_from_string(r#"{"name": "foo", "kind": "chunk"}"#, "foo.morph")
                .unwrap();
        assert_eq!(morph.name(), Some("foo"));
        assert_eq!(morph.get_str("build-system"), Some("manual"));
    }

    #[test]
    fn test_save_omits_defaults_and_is_stable() {
        let morph = MorphologyParser::load_from_string(CHUNK, "foo.morph").unwrap();
        let text = MorphologyParser::save_to_string(&morph).unwrap();
        assert!(text.starts_with("name: foo\nkind: chunk\n"));
        assert!(!text.contains("description"));

        let reloaded = MorphologyParser::load_from_string(&text, "foo.morph").unwrap();
        assert_eq!(MorphologyParser::save_to_string(&reloaded).unwrap(), text);
    }

    #[test]
    fn test_save_to_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foo.morph");
        let morph = MorphologyParser::load_from_string(CHUNK, "foo.morph").unwrap();

        MorphologyParser::save_to_file(&morph, &path).unwrap();
        let loaded = MorphologyParser::load_from_file(&path).unwrap();
        assert_eq!(loaded.get_str("build-system"), Some("autotools"));
        assert_eq!(loaded.origin(), path.display().to_string());
    }

    #[test]
    fn test_missing_file() {
        let err = MorphologyParser::load_from_file("/nonexistent/foo.morph").unwrap_err();
        assert!(matches!(err, MorphologyError::Io { .. }));
    }
}
