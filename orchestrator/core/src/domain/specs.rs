// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Typed Views
//!
//! Strongly typed projections of validated morphologies. These are what the
//! graph builder and deployment planner consume; the untyped document stays
//! the source of truth.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::domain::morphology::{
    Morphology, MorphologyError, BUILD_PHASE_FIELDS, TEST_PHASE_FIELDS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    #[default]
    Staging,
    Bootstrap,
    Test,
}

impl BuildMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildMode::Staging => "staging",
            BuildMode::Bootstrap => "bootstrap",
            BuildMode::Test => "test",
        }
    }
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chunk entry in a stratum's `chunks` list
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChunkSpec {
    pub name: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub morph: Option<String>,
    #[serde(default, rename = "ref")]
    pub git_ref: Option<String>,
    #[serde(default)]
    pub build_depends: Vec<String>,
    #[serde(default)]
    pub build_mode: BuildMode,
}

impl ChunkSpec {
    /// Name other chunks use to refer to this one
    pub fn reference_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    pub fn repo(&self) -> &str {
        self.repo.as_deref().unwrap_or(&self.name)
    }

    pub fn morph(&self) -> &str {
        self.morph.as_deref().unwrap_or(&self.name)
    }
}

/// A reference to a stratum from a system or another stratum
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StratumSpec {
    pub morph: String,
    #[serde(default)]
    pub alias: Option<String>,
}

/// A system entry in a cluster, possibly with nested subsystems
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterSystemSpec {
    pub morph: String,
    #[serde(default)]
    pub deploy_defaults: Option<Mapping>,
    #[serde(default)]
    pub deploy: Option<BTreeMap<String, Option<Mapping>>>,
    #[serde(default)]
    pub subsystems: Vec<ClusterSystemSpec>,
}

/// Build instructions extracted from a chunk morphology
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecipe {
    pub name: String,
    pub build_system: String,
    pub max_jobs: Option<u32>,
    /// `(phase, commands)` in execution order, empty phases omitted
    pub phases: Vec<(String, Vec<String>)>,
}

impl ChunkRecipe {
    pub fn commands(&self) -> Vec<String> {
        self.phases
            .iter()
            .flat_map(|(_, commands)| commands.iter().cloned())
            .collect()
    }
}

// ============================================================================
// Extraction
// ============================================================================

impl Morphology {
    pub fn chunk_specs(&self) -> Result<Vec<ChunkSpec>, MorphologyError> {
        self.typed_list("chunks")
    }

    pub fn stratum_build_depends(&self) -> Result<Vec<StratumSpec>, MorphologyError> {
        self.typed_list("build-depends")
    }

    pub fn system_strata(&self) -> Result<Vec<StratumSpec>, MorphologyError> {
        self.typed_list("strata")
    }

    pub fn cluster_systems(&self) -> Result<Vec<ClusterSystemSpec>, MorphologyError> {
        self.typed_list("systems")
    }

    /// Build recipe of a chunk; test phases run only in `test` build mode
    pub fn chunk_recipe(&self, mode: BuildMode) -> Result<ChunkRecipe, MorphologyError> {
        let mut fields: Vec<&str> = BUILD_PHASE_FIELDS.to_vec();
        if mode == BuildMode::Test {
            // Tests run after the build phases and before install.
            let install_at = fields
                .iter()
                .position(|f| *f == "pre-install-commands")
                .unwrap_or(fields.len());
            for (offset, field) in TEST_PHASE_FIELDS.iter().enumerate() {
                fields.insert(install_at + offset, *field);
            }
        }

        let mut phases = Vec::new();
        for field in fields {
            let commands: Vec<String> = self.typed_list(field)?;
            if !commands.is_empty() {
                phases.push((field.trim_end_matches("-commands").to_string(), commands));
            }
        }

        let max_jobs = match self.get("max-jobs") {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            Some(Value::String(s)) => s.trim().parse().ok(),
            Some(_) => None,
        };

        Ok(ChunkRecipe {
            name: self.display_name().to_string(),
            build_system: self.get_str("build-system").unwrap_or("manual").to_string(),
            max_jobs,
            phases,
        })
    }

    fn typed_list<T: serde::de::DeserializeOwned>(
        &self,
        field: &str,
    ) -> Result<Vec<T>, MorphologyError> {
        match self.get(field) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(value) => serde_yaml::from_value(value.clone()).map_err(|e| {
                MorphologyError::Malformed {
                    field: field.to_string(),
                    message: e.to_string(),
                    origin: self.origin().to_string(),
                }
            }),
        }
    }
}
