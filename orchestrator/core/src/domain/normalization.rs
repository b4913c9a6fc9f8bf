// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Default Setting and Canonical Form
//!
//! [`set_defaults`] fills every omitted field from the kind's default table
//! plus a few kind-specific derived defaults; [`unset_defaults`] is its
//! inverse. Both are idempotent, and `unset_defaults(set_defaults(m))` gives
//! back `m` for every field covered by a default.
//!
//! [`canonical_mapping`] orders keys for output: a fixed list of well-known
//! keys first, everything else alphabetically, applied at every nesting level.

use serde_yaml::{Mapping, Value};

use crate::domain::morphology::{key_to_string, type_name, Morphology, MorphologyError, MorphologyKind};
use crate::domain::validation::{spec_str, strip_legacy_fields};

/// Well-known keys, in output order
const KEY_ORDER: [&str; 32] = [
    "name",
    "kind",
    "description",
    "arch",
    "strata",
    "configuration-extensions",
    "morph",
    "repo",
    "ref",
    "unpetrify-ref",
    "build-depends",
    "build-mode",
    "artifacts",
    "max-jobs",
    "products",
    "chunks",
    "build-system",
    "pre-configure-commands",
    "configure-commands",
    "post-configure-commands",
    "pre-build-commands",
    "build-commands",
    "post-build-commands",
    "pre-install-commands",
    "install-commands",
    "post-install-commands",
    "artifact",
    "include",
    "systems",
    "deploy",
    "type",
    "location",
];

fn known_kind(morph: &Morphology) -> Result<MorphologyKind, MorphologyError> {
    match morph.get("kind") {
        None => Err(MorphologyError::MissingField {
            field: "kind".to_string(),
            origin: morph.origin().to_string(),
        }),
        Some(value) => value
            .as_str()
            .and_then(MorphologyKind::parse)
            .ok_or_else(|| MorphologyError::UnknownKind {
                kind: key_to_string(value),
                origin: morph.origin().to_string(),
            }),
    }
}

// ============================================================================
// Set Defaults
// ============================================================================

pub fn set_defaults(morph: &mut Morphology) -> Result<(), MorphologyError> {
    let kind = known_kind(morph)?;

    for default in kind.rules().defaults {
        if !morph.contains(default.field) {
            morph.set(default.field, default.value.to_value())?;
        }
    }

    match kind {
        MorphologyKind::Chunk => set_chunk_defaults(morph),
        MorphologyKind::Stratum => {
            set_stratum_defaults(morph);
            Ok(())
        }
        MorphologyKind::System => {
            strip_stratum_specs(morph, "strata");
            Ok(())
        }
        MorphologyKind::Cluster => {
            for_each_cluster_system(morph, |system| {
                for field in ["deploy-defaults", "deploy"] {
                    if !matches!(system.get(field), Some(Value::Mapping(_))) {
                        system.insert(Value::String(field.to_string()), Value::Mapping(Mapping::new()));
                    }
                }
            });
            Ok(())
        }
    }
}

fn set_chunk_defaults(morph: &mut Morphology) -> Result<(), MorphologyError> {
    if let Some(Value::String(text)) = morph.get("max-jobs").cloned() {
        let jobs: u64 = text.trim().parse().map_err(|_| MorphologyError::InvalidType {
            field: "max-jobs".to_string(),
            expected: "integer".to_string(),
            actual: type_name(&Value::String(text.clone())).to_string(),
            origin: morph.origin().to_string(),
        })?;
        morph.set("max-jobs", Value::Number(jobs.into()))?;
    }
    Ok(())
}

fn set_stratum_defaults(morph: &mut Morphology) {
    if let Some(Value::Sequence(chunks)) = morph.get_mut("chunks") {
        for spec in chunks.iter_mut().filter_map(Value::as_mapping_mut) {
            let Some(name) = spec_str(spec, "name").map(str::to_string) else {
                continue;
            };
            for field in ["repo", "morph"] {
                if !spec.contains_key(field) {
                    spec.insert(Value::String(field.to_string()), Value::String(name.clone()));
                }
            }
        }
    }
    strip_stratum_specs(morph, "build-depends");
}

fn strip_stratum_specs(morph: &mut Morphology, field: &str) {
    let name = morph.display_name().to_string();
    if let Some(Value::Sequence(specs)) = morph.get_mut(field) {
        for spec in specs.iter_mut().filter_map(Value::as_mapping_mut) {
            strip_legacy_fields(spec, &name, field);
        }
    }
}

// ============================================================================
// Unset Defaults
// ============================================================================

pub fn unset_defaults(morph: &mut Morphology) -> Result<(), MorphologyError> {
    let kind = known_kind(morph)?;

    for default in kind.rules().defaults {
        if morph.get(default.field) == Some(&default.value.to_value()) {
            morph.remove(default.field);
        }
    }

    match kind {
        MorphologyKind::Stratum => {
            if let Some(Value::Sequence(chunks)) = morph.get_mut("chunks") {
                for spec in chunks.iter_mut().filter_map(Value::as_mapping_mut) {
                    let Some(name) = spec_str(spec, "name").map(str::to_string) else {
                        continue;
                    };
                    for field in ["repo", "morph"] {
                        if spec_str(spec, field) == Some(name.as_str()) {
                            spec.shift_remove(field);
                        }
                    }
                }
            }
            strip_stratum_specs(morph, "build-depends");
        }
        MorphologyKind::System => strip_stratum_specs(morph, "strata"),
        MorphologyKind::Cluster => {
            for_each_cluster_system(morph, |system| {
                for field in ["deploy-defaults", "deploy"] {
                    if matches!(system.get(field), Some(Value::Mapping(m)) if m.is_empty()) {
                        system.shift_remove(field);
                    }
                }
            });
        }
        MorphologyKind::Chunk => {}
    }
    Ok(())
}

/// Applies `f` to every system spec of a cluster, subsystems included
fn for_each_cluster_system(morph: &mut Morphology, mut f: impl FnMut(&mut Mapping)) {
    let Some(Value::Sequence(systems)) = morph.get_mut("systems") else {
        return;
    };
    let mut pending: Vec<&mut Value> = systems.iter_mut().collect();
    while let Some(system) = pending.pop() {
        let Value::Mapping(spec) = system else {
            continue;
        };
        f(spec);
        if let Some(Value::Sequence(subsystems)) = spec.get_mut("subsystems") {
            pending.extend(subsystems.iter_mut());
        }
    }
}

// ============================================================================
// Canonical Form
// ============================================================================

/// Reorders keys of `mapping`, recursively, into canonical output order
pub fn canonical_mapping(mapping: &Mapping) -> Mapping {
    let mut entries: Vec<(&Value, &Value)> = mapping.iter().collect();
    entries.sort_by(|(a, _), (b, _)| sort_key(a).cmp(&sort_key(b)));
    entries
        .into_iter()
        .map(|(k, v)| (k.clone(), canonical_value(v)))
        .collect()
}

fn canonical_value(value: &Value) -> Value {
    match value {
        Value::Mapping(m) => Value::Mapping(canonical_mapping(m)),
        Value::Sequence(items) => Value::Sequence(items.iter().map(canonical_value).collect()),
        other => other.clone(),
    }
}

fn sort_key(key: &Value) -> (usize, String) {
    let key = key_to_string(key);
    let rank = KEY_ORDER
        .iter()
        .position(|k| *k == key)
        .unwrap_or(KEY_ORDER.len());
    (rank, key)
}

/// Serializes a morphology in canonical key order
pub fn to_canonical_yaml(morph: &Morphology) -> Result<String, MorphologyError> {
    serde_yaml::to_string(&canonical_mapping(morph.data())).map_err(|e| {
        MorphologyError::Serialization {
            origin: morph.origin().to_string(),
            message: e.to_string(),
        }
    })
}
