// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Morphology Domain Model
//!
//! A morphology is a declarative document describing one of four kinds of
//! entity: a `chunk` (one buildable component), a `stratum` (a collection of
//! chunks), a `system` (strata assembled into an image) or a `cluster`
//! (systems plus their deployments).
//!
//! # Representation
//!
//! The document is kept as an ordered YAML mapping rather than a typed struct
//! so that unknown and obsolete fields can be reported instead of silently
//! dropped, and so that default-setting/unsetting round trips exactly. Typed
//! views over the validated document live in [`crate::domain::specs`].
//!
//! # Kind Rules
//!
//! | Kind | Required | Obsolete |
//! |------|----------|----------|
//! | chunk | `name` | |
//! | stratum | `name` | |
//! | system | `name`, `arch`, `strata` | `system-kind`, `disk-size` |
//! | cluster | `name`, `systems` | |
//!
//! Every other permitted field is listed in the kind's default table.

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::fmt;

// ============================================================================
// Value Objects: Kind
// ============================================================================

/// The closed set of morphology kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MorphologyKind {
    Chunk,
    Stratum,
    System,
    Cluster,
}

impl MorphologyKind {
    pub const ALL: [MorphologyKind; 4] = [
        MorphologyKind::Chunk,
        MorphologyKind::Stratum,
        MorphologyKind::System,
        MorphologyKind::Cluster,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MorphologyKind::Chunk => "chunk",
            MorphologyKind::Stratum => "stratum",
            MorphologyKind::System => "system",
            MorphologyKind::Cluster => "cluster",
        }
    }

    pub fn parse(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == kind)
    }

    /// Field table for this kind
    pub fn rules(&self) -> &'static KindRules {
        match self {
            MorphologyKind::Chunk => &CHUNK_RULES,
            MorphologyKind::Stratum => &STRATUM_RULES,
            MorphologyKind::System => &SYSTEM_RULES,
            MorphologyKind::Cluster => &CLUSTER_RULES,
        }
    }
}

impl fmt::Display for MorphologyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Field Tables
// ============================================================================

/// Static default for an omitted field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultValue {
    EmptyString,
    EmptyList,
    Null,
    Text(&'static str),
}

impl DefaultValue {
    pub fn to_value(self) -> Value {
        match self {
            DefaultValue::EmptyString => Value::String(String::new()),
            DefaultValue::EmptyList => Value::Sequence(Vec::new()),
            DefaultValue::Null => Value::Null,
            DefaultValue::Text(text) => Value::String(text.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FieldDefault {
    pub field: &'static str,
    pub value: DefaultValue,
}

const fn default(field: &'static str, value: DefaultValue) -> FieldDefault {
    FieldDefault { field, value }
}

/// Required, obsolete and defaulted fields of one kind
#[derive(Debug)]
pub struct KindRules {
    pub required: &'static [&'static str],
    pub obsolete: &'static [&'static str],
    pub defaults: &'static [FieldDefault],
}

impl KindRules {
    /// Whether `field` may appear in a document of this kind
    pub fn allows(&self, field: &str) -> bool {
        field == "kind"
            || self.required.contains(&field)
            || self.defaults.iter().any(|d| d.field == field)
    }

    pub fn default_for(&self, field: &str) -> Option<Value> {
        self.defaults
            .iter()
            .find(|d| d.field == field)
            .map(|d| d.value.to_value())
    }
}

/// Build phases of a chunk, in execution order
pub const BUILD_PHASE_FIELDS: [&str; 9] = [
    "pre-configure-commands",
    "configure-commands",
    "post-configure-commands",
    "pre-build-commands",
    "build-commands",
    "post-build-commands",
    "pre-install-commands",
    "install-commands",
    "post-install-commands",
];

pub const TEST_PHASE_FIELDS: [&str; 3] = [
    "pre-test-commands",
    "test-commands",
    "post-test-commands",
];

static CHUNK_RULES: KindRules = KindRules {
    required: &["name"],
    obsolete: &[],
    defaults: &[
        default("description", DefaultValue::EmptyString),
        default("pre-configure-commands", DefaultValue::EmptyList),
        default("configure-commands", DefaultValue::EmptyList),
        default("post-configure-commands", DefaultValue::EmptyList),
        default("pre-build-commands", DefaultValue::EmptyList),
        default("build-commands", DefaultValue::EmptyList),
        default("post-build-commands", DefaultValue::EmptyList),
        default("pre-test-commands", DefaultValue::EmptyList),
        default("test-commands", DefaultValue::EmptyList),
        default("post-test-commands", DefaultValue::EmptyList),
        default("pre-install-commands", DefaultValue::EmptyList),
        default("install-commands", DefaultValue::EmptyList),
        default("post-install-commands", DefaultValue::EmptyList),
        default("devices", DefaultValue::EmptyList),
        default("products", DefaultValue::EmptyList),
        default("max-jobs", DefaultValue::Null),
        default("build-system", DefaultValue::Text("manual")),
    ],
};

static STRATUM_RULES: KindRules = KindRules {
    required: &["name"],
    obsolete: &[],
    defaults: &[
        default("chunks", DefaultValue::EmptyList),
        default("description", DefaultValue::EmptyString),
        default("build-depends", DefaultValue::EmptyList),
        default("products", DefaultValue::EmptyList),
    ],
};

static SYSTEM_RULES: KindRules = KindRules {
    required: &["name", "arch", "strata"],
    obsolete: &["system-kind", "disk-size"],
    defaults: &[
        default("description", DefaultValue::EmptyString),
        default("arch", DefaultValue::Null),
        default("configuration-extensions", DefaultValue::EmptyList),
    ],
};

static CLUSTER_RULES: KindRules = KindRules {
    required: &["name", "systems"],
    obsolete: &[],
    defaults: &[default("description", DefaultValue::EmptyString)],
};

/// Architectures a system may target
pub const VALID_ARCHITECTURES: [&str; 13] = [
    "armv7b",
    "armv7l",
    "armv7lhf",
    "armv8b64",
    "armv8l64",
    "mips32b",
    "mips32l",
    "mips64b",
    "mips64l",
    "ppc64",
    "testarch",
    "x86_32",
    "x86_64",
];

// ============================================================================
// Aggregate: Morphology
// ============================================================================

/// A parsed morphology document
///
/// `origin` identifies where the text came from (a file name, or
/// `repo:ref:path`) and is carried into every error raised about it.
#[derive(Debug, Clone, PartialEq)]
pub struct Morphology {
    data: Mapping,
    origin: String,
}

impl Morphology {
    pub fn new(data: Mapping, origin: impl Into<String>) -> Self {
        Self {
            data,
            origin: origin.into(),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn set_origin(&mut self, origin: impl Into<String>) {
        self.origin = origin.into();
    }

    /// Raw `kind` value, if it is a string
    pub fn kind_str(&self) -> Option<&str> {
        self.get_str("kind")
    }

    pub fn kind(&self) -> Option<MorphologyKind> {
        self.kind_str().and_then(MorphologyKind::parse)
    }

    pub fn name(&self) -> Option<&str> {
        self.get_str("name")
    }

    /// Name for messages: the `name` field or `<unknown>`
    pub fn display_name(&self) -> &str {
        self.name().unwrap_or("<unknown>")
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(Value::as_str)
    }

    pub fn get_mut(&mut self, field: &str) -> Option<&mut Value> {
        self.data.get_mut(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.data.contains_key(field)
    }

    /// Set a field. The `kind` tag cannot be changed once present.
    pub fn set(
        &mut self,
        field: impl Into<String>,
        value: Value,
    ) -> Result<Option<Value>, MorphologyError> {
        let field = field.into();
        if field == "kind" {
            if let Some(existing) = self.data.get("kind") {
                if existing != &value {
                    return Err(MorphologyError::KindChanged {
                        origin: self.origin.clone(),
                        from: describe_value(existing),
                        to: describe_value(&value),
                    });
                }
            }
        }
        Ok(self.data.insert(Value::String(field), value))
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.data.shift_remove(field)
    }

    /// Field names in document order; non-string keys are rendered as YAML
    pub fn fields(&self) -> Vec<String> {
        self.data.keys().map(key_to_string).collect()
    }

    pub fn data(&self) -> &Mapping {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut Mapping {
        &mut self.data
    }

    pub fn into_data(self) -> Mapping {
        self.data
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub(crate) fn key_to_string(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => describe_value(other),
    }
}

/// Short rendering of a value for error messages
pub(crate) fn describe_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_else(|_| type_name(other).to_string()),
    }
}

/// YAML type name used in invalid-type errors
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "list",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged",
    }
}

// ============================================================================
// Domain Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MorphologyError {
    #[error("Syntax error in morphology {origin}:\n{message}")]
    Syntax { origin: String, message: String },

    #[error("Not a dictionary: morphology {origin}")]
    NotAMapping { origin: String },

    #[error("Unknown kind {kind} in morphology {origin}")]
    UnknownKind { kind: String, origin: String },

    #[error("Cannot change kind of morphology {origin} from {from} to {to}")]
    KindChanged {
        origin: String,
        from: String,
        to: String,
    },

    #[error("Missing field {field} from morphology {origin}")]
    MissingField { field: String, origin: String },

    #[error("Field {field} not allowed in morphology {origin}")]
    InvalidField { field: String, origin: String },

    #[error("Field {field} expected type {expected}, got {actual} in morphology {origin}")]
    InvalidType {
        field: String,
        expected: String,
        actual: String,
        origin: String,
    },

    #[error("Morphology {origin} uses obsolete fields: {}", fields.join(" "))]
    ObsoleteFields { fields: Vec<String>, origin: String },

    #[error("Unknown architecture {arch} in morphology {origin}")]
    UnknownArchitecture { arch: String, origin: String },

    #[error("Unknown build-mode {mode} for chunk {chunk} in morphology {origin}")]
    InvalidBuildMode {
        mode: String,
        chunk: String,
        origin: String,
    },

    #[error("Stratum {stratum} has no build dependencies for chunk {chunk} in {origin}")]
    NoBuildDependencies {
        stratum: String,
        chunk: String,
        origin: String,
    },

    #[error("Stratum {stratum} has no build dependencies in {origin}")]
    NoStratumBuildDependencies { stratum: String, origin: String },

    #[error("Stratum {stratum} has no chunks in {origin}")]
    EmptyStratum { stratum: String, origin: String },

    #[error("Duplicate chunk {chunk} in stratum {stratum}")]
    DuplicateChunk { stratum: String, chunk: String },

    #[error("Empty ref found for {location} in {origin}")]
    EmptyRef { location: String, origin: String },

    #[error("Ref {ref_value} for {location} in {origin} is not a string")]
    RefNotString {
        ref_value: String,
        location: String,
        origin: String,
    },

    #[error("System {system} has the wrong type for its strata: {actual}, expected list")]
    SystemStrataNotList { system: String, actual: String },

    #[error("System {system} has stratum specs that are not mappings.")]
    SystemStratumSpecsNotMapping { system: String },

    #[error("Duplicate stratum {stratum} in system {system}")]
    DuplicateStratum { system: String, stratum: String },

    #[error("System {system} has no strata.")]
    EmptySystem { system: String },

    #[error(
        "Cluster {origin} contains the following duplicate deployment names:\n    {}",
        duplicates.join("\n    ")
    )]
    DuplicateDeploymentName {
        origin: String,
        duplicates: Vec<String>,
    },

    #[error("Multiple errors when validating {name}:{}", render_errors(errors))]
    MultipleValidationErrors {
        name: String,
        errors: Vec<MorphologyError>,
    },

    #[error("Malformed {field} in morphology {origin}: {message}")]
    Malformed {
        field: String,
        message: String,
        origin: String,
    },

    #[error("Failed to serialize morphology {origin}: {message}")]
    Serialization { origin: String, message: String },

    #[error("I/O error on {path}: {message}")]
    Io { path: String, message: String },
}

fn render_errors(errors: &[MorphologyError]) -> String {
    errors.iter().map(|e| format!("\t{}", e)).collect()
}
