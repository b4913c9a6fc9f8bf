// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Deployment Planning
//!
//! Expands a cluster morphology into concrete deployments. Parameters for a
//! deployment are merged from, lowest precedence first:
//!
//! 1. the system's `deploy-defaults`
//! 2. the deployment's own entry under `deploy`
//! 3. `NAME.KEY=VALUE` overrides given by the user
//!
//! `type` and `location` are mandatory and taken out of the merged set;
//! everything else becomes the deployment's environment.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use thiserror::Error;

use crate::domain::graph::flatten_systems;
use crate::domain::morphology::{key_to_string, Morphology, MorphologyError, MorphologyKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    /// Deployment name (key under `deploy`)
    pub name: String,
    /// System morphology being deployed
    pub system: String,
    pub deployment_type: String,
    pub location: String,
    pub env: BTreeMap<String, String>,
}

pub fn plan_deployments(cluster: &Morphology, overrides: &[String]) -> Result<Vec<Deployment>, DeploymentError> {
    if cluster.kind() != Some(MorphologyKind::Cluster) {
        return Err(DeploymentError::NotACluster(cluster.origin().to_string()));
    }

    let overrides = parse_overrides(overrides)?;
    let systems = cluster.cluster_systems()?;
    let mut plan = Vec::new();

    for system in flatten_systems(&systems) {
        let defaults = system.deploy_defaults.clone().unwrap_or_default();
        let Some(deploy) = &system.deploy else {
            continue;
        };

        for (name, params) in deploy {
            let mut merged: BTreeMap<String, String> = BTreeMap::new();
            merge(&mut merged, &defaults, name)?;
            merge(&mut merged, &params.clone().unwrap_or_default(), name)?;
            if let Some(user) = overrides.get(name.as_str()) {
                merged.extend(user.iter().map(|(k, v)| (k.clone(), v.clone())));
            }

            let deployment_type = take_required(&mut merged, "type", name)?;
            let location = take_required(&mut merged, "location", name)?;

            plan.push(Deployment {
                name: name.clone(),
                system: system.morph.clone(),
                deployment_type,
                location,
                env: merged,
            });
        }
    }

    Ok(plan)
}

fn merge(into: &mut BTreeMap<String, String>, params: &Mapping, deployment: &str) -> Result<(), DeploymentError> {
    for (key, value) in params {
        let key = key_to_string(key);
        let value = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Null => String::new(),
            _ => {
                return Err(DeploymentError::InvalidValue {
                    deployment: deployment.to_string(),
                    key,
                })
            }
        };
        into.insert(key, value);
    }
    Ok(())
}

fn take_required(env: &mut BTreeMap<String, String>, key: &str, deployment: &str) -> Result<String, DeploymentError> {
    match env.remove(key) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(DeploymentError::MissingParameter {
            deployment: deployment.to_string(),
            key: key.to_string(),
        }),
    }
}

fn parse_overrides(pairs: &[String]) -> Result<BTreeMap<&str, BTreeMap<String, String>>, DeploymentError> {
    let mut parsed: BTreeMap<&str, BTreeMap<String, String>> = BTreeMap::new();
    for pair in pairs {
        let (target, value) = pair
            .split_once('=')
            .ok_or_else(|| DeploymentError::InvalidOverride(pair.clone()))?;
        let (deployment, key) = target
            .split_once('.')
            .filter(|(d, k)| !d.is_empty() && !k.is_empty())
            .ok_or_else(|| DeploymentError::InvalidOverride(pair.clone()))?;
        parsed
            .entry(deployment)
            .or_default()
            .insert(key.to_string(), value.to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeploymentError {
    #[error("Morphology {0} is not a cluster")]
    NotACluster(String),

    #[error("\"{key}\" is undefined for deployment \"{deployment}\"")]
    MissingParameter { deployment: String, key: String },

    #[error("Parameter {key} of deployment {deployment} must be a scalar")]
    InvalidValue { deployment: String, key: String },

    #[error("Invalid deployment override {0}: expected NAME.KEY=VALUE")]
    InvalidOverride(String),

    #[error(transparent)]
    Morphology(#[from] MorphologyError),
}
