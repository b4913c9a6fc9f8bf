// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Morphology Validation
//!
//! Checks a parsed [`Morphology`] against the rules of its kind.
//!
//! # Order of Checks
//!
//! 1. `kind` must be present and one of the four kinds
//! 2. required fields must be present
//! 3. obsolete fields must be absent
//! 4. every field must be permitted for the kind
//! 5. kind-specific checks
//!
//! Validation stops at the first failure, except for chunk checks, which
//! collect every problem and report them together.
//!
//! Validation may normalise a document in place: the `armv7` architecture is
//! rewritten to `armv7l`, and the obsolete `repo`/`ref` fields on stratum
//! specs are stripped with a warning.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Enforces per-kind morphology invariants

use std::collections::{BTreeSet, HashMap, HashSet};

use serde_yaml::{Mapping, Value};
use tracing::warn;

use crate::domain::morphology::{
    describe_value, key_to_string, type_name, Morphology, MorphologyError, MorphologyKind,
    BUILD_PHASE_FIELDS, TEST_PHASE_FIELDS, VALID_ARCHITECTURES,
};

/// Build modes exempting a stratum from build-dependency requirements
const SELF_CONTAINED_MODES: [&str; 2] = ["bootstrap", "test"];
const BUILD_MODES: [&str; 3] = ["staging", "bootstrap", "test"];

/// Validates morphology documents
pub struct MorphologyValidator;

impl MorphologyValidator {
    pub fn validate(morph: &mut Morphology) -> Result<(), MorphologyError> {
        let kind = Self::check_kind(morph)?;
        let rules = kind.rules();

        for field in rules.required {
            if !morph.contains(field) {
                return Err(MorphologyError::MissingField {
                    field: field.to_string(),
                    origin: morph.origin().to_string(),
                });
            }
        }

        let obsolete: Vec<String> = rules
            .obsolete
            .iter()
            .filter(|f| morph.contains(f))
            .map(|f| f.to_string())
            .collect();
        if !obsolete.is_empty() {
            return Err(MorphologyError::ObsoleteFields {
                fields: obsolete,
                origin: morph.origin().to_string(),
            });
        }

        if let Some(field) = morph.fields().into_iter().find(|f| !rules.allows(f)) {
            return Err(MorphologyError::InvalidField {
                field,
                origin: morph.origin().to_string(),
            });
        }

        if let Some(name) = morph.get("name") {
            if !name.is_string() {
                return Err(invalid_type("name", "string", name, morph.origin()));
            }
        }

        match kind {
            MorphologyKind::Chunk => validate_chunk(morph),
            MorphologyKind::Stratum => validate_stratum(morph),
            MorphologyKind::System => validate_system(morph),
            MorphologyKind::Cluster => validate_cluster(morph),
        }
    }

    fn check_kind(morph: &Morphology) -> Result<MorphologyKind, MorphologyError> {
        let value = morph.get("kind").ok_or_else(|| MorphologyError::MissingField {
            field: "kind".to_string(),
            origin: morph.origin().to_string(),
        })?;
        value
            .as_str()
            .and_then(MorphologyKind::parse)
            .ok_or_else(|| MorphologyError::UnknownKind {
                kind: describe_value(value),
                origin: morph.origin().to_string(),
            })
    }
}

// ============================================================================
// Chunk
// ============================================================================

fn validate_chunk(morph: &Morphology) -> Result<(), MorphologyError> {
    let origin = morph.origin();
    let mut errors = Vec::new();

    for field in BUILD_PHASE_FIELDS.iter().chain(TEST_PHASE_FIELDS.iter()) {
        if let Some(value) = morph.get(field) {
            check_string_list(field, value, origin, &mut errors);
        }
    }

    if let Some(value) = morph.get("max-jobs") {
        let ok = match value {
            Value::Null => true,
            Value::Number(n) => n.as_u64().is_some(),
            Value::String(s) => s.trim().parse::<u64>().is_ok(),
            _ => false,
        };
        if !ok {
            errors.push(invalid_type("max-jobs", "integer", value, origin));
        }
    }

    if let Some(products) = morph.get("products") {
        validate_products(products, origin, &mut errors);
    }

    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(MorphologyError::MultipleValidationErrors {
            name: morph.display_name().to_string(),
            errors,
        }),
    }
}

fn validate_products(products: &Value, origin: &str, errors: &mut Vec<MorphologyError>) {
    let Some(specs) = products.as_sequence() else {
        errors.push(invalid_type("products", "list", products, origin));
        return;
    };

    for (i, spec) in specs.iter().enumerate() {
        let location = format!("products[{}]", i);
        let Some(spec) = spec.as_mapping() else {
            errors.push(invalid_type(&location, "mapping", spec, origin));
            continue;
        };

        for field in ["artifact", "include"] {
            if !spec.contains_key(field) {
                errors.push(MorphologyError::MissingField {
                    field: format!("{}.{}", location, field),
                    origin: origin.to_string(),
                });
            }
        }

        for key in spec.keys() {
            let key = key_to_string(key);
            if key != "artifact" && key != "include" {
                errors.push(MorphologyError::InvalidField {
                    field: format!("{}.{}", location, key),
                    origin: origin.to_string(),
                });
            }
        }

        if let Some(artifact) = spec.get("artifact") {
            if !artifact.is_string() {
                errors.push(invalid_type(
                    &format!("{}.artifact", location),
                    "string",
                    artifact,
                    origin,
                ));
            }
        }

        if let Some(include) = spec.get("include") {
            let field = format!("{}.include", location);
            match include.as_sequence() {
                None => errors.push(invalid_type(&field, "list", include, origin)),
                Some(patterns) => {
                    for (j, pattern) in patterns.iter().enumerate() {
                        if !pattern.is_string() {
                            errors.push(invalid_type(
                                &format!("{}[{}]", field, j),
                                "string",
                                pattern,
                                origin,
                            ));
                        }
                    }
                }
            }
        }
    }
}

// ============================================================================
// Stratum
// ============================================================================

fn validate_stratum(morph: &mut Morphology) -> Result<(), MorphologyError> {
    let origin = morph.origin().to_string();
    let stratum = morph.display_name().to_string();

    let chunks = match morph.get("chunks") {
        None => None,
        Some(Value::Sequence(chunks)) => Some(chunks.clone()),
        Some(other) => return Err(invalid_type("chunks", "list", other, &origin)),
    };
    let chunks = chunks.unwrap_or_default();
    if chunks.is_empty() {
        return Err(MorphologyError::EmptyStratum { stratum, origin });
    }

    let mut specs: Vec<&Mapping> = Vec::with_capacity(chunks.len());
    for (i, spec) in chunks.iter().enumerate() {
        let location = format!("chunks[{}]", i);
        let spec = spec
            .as_mapping()
            .ok_or_else(|| invalid_type(&location, "mapping", spec, &origin))?;
        match spec.get("name") {
            Some(Value::String(_)) => {}
            Some(other) => {
                return Err(invalid_type(&format!("{}.name", location), "string", other, &origin))
            }
            None => {
                return Err(MorphologyError::MissingField {
                    field: format!("{}.name", location),
                    origin,
                })
            }
        }
        specs.push(spec);
    }

    // Duplicates are judged by the name a chunk is referred to by.
    let mut seen = HashSet::new();
    for spec in &specs {
        let reference = spec_str(spec, "alias")
            .or_else(|| spec_str(spec, "name"))
            .unwrap_or_default();
        if !seen.insert(reference) {
            return Err(MorphologyError::DuplicateChunk {
                stratum,
                chunk: reference.to_string(),
            });
        }
    }

    for spec in &specs {
        let chunk = spec_str(spec, "name").unwrap_or_default();
        check_spec_ref(spec, &format!("chunk {}", chunk), &origin)?;

        if let Some(mode) = spec.get("build-mode") {
            let mode_str = mode.as_str().unwrap_or_default();
            if !BUILD_MODES.contains(&mode_str) {
                return Err(MorphologyError::InvalidBuildMode {
                    mode: describe_value(mode),
                    chunk: chunk.to_string(),
                    origin,
                });
            }
        }
    }

    let self_contained = specs.iter().any(|spec| {
        spec_str(spec, "build-mode").is_some_and(|mode| SELF_CONTAINED_MODES.contains(&mode))
    });

    if !morph.contains("build-depends") && !self_contained {
        return Err(MorphologyError::NoStratumBuildDependencies { stratum, origin });
    }

    for spec in &specs {
        let chunk = spec_str(spec, "name").unwrap_or_default();
        match spec.get("build-depends") {
            None if !self_contained => {
                return Err(MorphologyError::NoBuildDependencies {
                    stratum,
                    chunk: chunk.to_string(),
                    origin,
                })
            }
            None => {}
            Some(deps) => {
                let field = format!("chunks.{}.build-depends", chunk);
                let mut errors = Vec::new();
                check_string_list(&field, deps, &origin, &mut errors);
                if let Some(err) = errors.into_iter().next() {
                    return Err(err);
                }
            }
        }
    }

    validate_stratum_specs(morph, "build-depends")
}

// ============================================================================
// System
// ============================================================================

fn validate_system(morph: &mut Morphology) -> Result<(), MorphologyError> {
    let origin = morph.origin().to_string();
    let system = morph.display_name().to_string();

    let strata = match morph.get("strata") {
        Some(Value::Sequence(strata)) => strata,
        Some(other) => {
            return Err(MorphologyError::SystemStrataNotList {
                system,
                actual: type_name(other).to_string(),
            })
        }
        None => {
            return Err(MorphologyError::MissingField {
                field: "strata".to_string(),
                origin,
            })
        }
    };

    if strata.is_empty() {
        return Err(MorphologyError::EmptySystem { system });
    }

    if !strata.iter().all(Value::is_mapping) {
        return Err(MorphologyError::SystemStratumSpecsNotMapping { system });
    }

    let mut seen = HashSet::new();
    for (i, spec) in strata.iter().filter_map(Value::as_mapping).enumerate() {
        let reference = match spec_str(spec, "alias").or_else(|| spec_str(spec, "morph")) {
            Some(reference) => reference,
            None => {
                return Err(MorphologyError::MissingField {
                    field: format!("strata[{}].morph", i),
                    origin,
                })
            }
        };
        if !seen.insert(reference.to_string()) {
            return Err(MorphologyError::DuplicateStratum {
                system,
                stratum: reference.to_string(),
            });
        }
    }

    validate_stratum_specs(morph, "strata")?;

    match morph.get("arch").cloned() {
        Some(Value::String(arch)) => {
            if arch == "armv7" {
                morph.set("arch", Value::String("armv7l".to_string()))?;
            } else if !VALID_ARCHITECTURES.contains(&arch.as_str()) {
                return Err(MorphologyError::UnknownArchitecture { arch, origin });
            }
        }
        Some(other) => return Err(invalid_type("arch", "string", &other, &origin)),
        None => {}
    }

    Ok(())
}

// ============================================================================
// Cluster
// ============================================================================

fn validate_cluster(morph: &Morphology) -> Result<(), MorphologyError> {
    let origin = morph.origin();
    let systems = match morph.get("systems") {
        Some(Value::Sequence(systems)) => systems,
        Some(other) => return Err(invalid_type("systems", "list", other, origin)),
        None => {
            return Err(MorphologyError::MissingField {
                field: "systems".to_string(),
                origin: origin.to_string(),
            })
        }
    };

    // Worklist over systems and their nested subsystems.
    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut pending: Vec<(String, &Value)> = systems
        .iter()
        .enumerate()
        .map(|(i, s)| (format!("systems[{}]", i), s))
        .collect();

    while let Some((location, system)) = pending.pop() {
        let spec = system
            .as_mapping()
            .ok_or_else(|| invalid_type(&location, "mapping", system, origin))?;

        match spec.get("morph") {
            Some(Value::String(_)) => {}
            Some(other) => {
                return Err(invalid_type(&format!("{}.morph", location), "string", other, origin))
            }
            None => {
                return Err(MorphologyError::MissingField {
                    field: format!("{}.morph", location),
                    origin: origin.to_string(),
                })
            }
        }

        for field in ["deploy-defaults", "deploy"] {
            if let Some(value) = spec.get(field) {
                if !value.is_mapping() && !value.is_null() {
                    return Err(invalid_type(
                        &format!("{}.{}", location, field),
                        "mapping",
                        value,
                        origin,
                    ));
                }
            }
        }

        if let Some(Value::Mapping(deploy)) = spec.get("deploy") {
            for name in deploy.keys() {
                *counts.entry(key_to_string(name)).or_default() += 1;
            }
        }

        match spec.get("subsystems") {
            None => {}
            Some(Value::Sequence(subsystems)) => {
                pending.extend(
                    subsystems
                        .iter()
                        .enumerate()
                        .map(|(i, s)| (format!("{}.subsystems[{}]", location, i), s)),
                );
            }
            Some(other) => {
                return Err(invalid_type(
                    &format!("{}.subsystems", location),
                    "list",
                    other,
                    origin,
                ))
            }
        }
    }

    let duplicates: BTreeSet<String> = counts
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(name, _)| name)
        .collect();
    if !duplicates.is_empty() {
        return Err(MorphologyError::DuplicateDeploymentName {
            origin: origin.to_string(),
            duplicates: duplicates.into_iter().collect(),
        });
    }

    Ok(())
}

// ============================================================================
// Shared Helpers
// ============================================================================

/// Checks stratum specs under `field` and strips their legacy source fields
fn validate_stratum_specs(morph: &mut Morphology, field: &str) -> Result<(), MorphologyError> {
    let origin = morph.origin().to_string();
    let name = morph.display_name().to_string();

    let Some(value) = morph.get_mut(field) else {
        return Ok(());
    };
    let specs = match value {
        Value::Sequence(specs) => specs,
        Value::Null => return Ok(()),
        other => return Err(invalid_type(field, "list", other, &origin)),
    };

    for (i, spec) in specs.iter_mut().enumerate() {
        let location = format!("{}[{}]", field, i);
        let spec = match spec {
            Value::Mapping(spec) => spec,
            other => return Err(invalid_type(&location, "mapping", other, &origin)),
        };
        match spec.get("morph") {
            Some(Value::String(_)) => {}
            Some(other) => {
                return Err(invalid_type(&format!("{}.morph", location), "string", other, &origin))
            }
            None => {
                return Err(MorphologyError::MissingField {
                    field: format!("{}.morph", location),
                    origin,
                })
            }
        }
        check_spec_ref(spec, &location, &origin)?;
        strip_legacy_fields(spec, &name, field);
    }
    Ok(())
}

pub(crate) fn strip_legacy_fields(spec: &mut Mapping, morphology: &str, field: &str) {
    for legacy in ["repo", "ref"] {
        if spec.shift_remove(legacy).is_some() {
            warn!(
                morphology = %morphology,
                stratum = spec_str(spec, "morph").unwrap_or_default(),
                field = legacy,
                "{} entry has obsolete field; stratum references always use the definitions repository",
                field
            );
        }
    }
}

fn check_spec_ref(spec: &Mapping, location: &str, origin: &str) -> Result<(), MorphologyError> {
    match spec.get("ref") {
        None => Ok(()),
        Some(Value::Null) => Err(MorphologyError::EmptyRef {
            location: location.to_string(),
            origin: origin.to_string(),
        }),
        Some(Value::String(r)) if r.is_empty() => Err(MorphologyError::EmptyRef {
            location: location.to_string(),
            origin: origin.to_string(),
        }),
        Some(Value::String(_)) => Ok(()),
        Some(other) => Err(MorphologyError::RefNotString {
            ref_value: describe_value(other),
            location: location.to_string(),
            origin: origin.to_string(),
        }),
    }
}

fn check_string_list(field: &str, value: &Value, origin: &str, errors: &mut Vec<MorphologyError>) {
    match value {
        Value::Sequence(items) => {
            for (i, item) in items.iter().enumerate() {
                if !item.is_string() {
                    errors.push(invalid_type(&format!("{}[{}]", field, i), "string", item, origin));
                }
            }
        }
        Value::Null => {}
        other => errors.push(invalid_type(field, "list", other, origin)),
    }
}

pub(crate) fn spec_str<'a>(spec: &'a Mapping, field: &str) -> Option<&'a str> {
    spec.get(field).and_then(Value::as_str)
}

fn invalid_type(field: &str, expected: &str, actual: &Value, origin: &str) -> MorphologyError {
    MorphologyError::InvalidType {
        field: field.to_string(),
        expected: expected.to_string(),
        actual: type_name(actual).to_string(),
        origin: origin.to_string(),
    }
}
