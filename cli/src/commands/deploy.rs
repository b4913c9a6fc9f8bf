// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Cluster deployment planning
//!
//! Deployment itself is carried out by external extension scripts; this
//! command resolves what they would be given.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use morph_core::domain::deployment::plan_deployments;
use morph_core::infrastructure::MorphologyParser;

#[derive(Subcommand)]
pub enum DeployCommand {
    /// Show the merged parameters of every deployment in a cluster
    Plan {
        /// Cluster morphology file
        #[arg(value_name = "CLUSTER")]
        cluster: PathBuf,

        /// Parameter overrides, `DEPLOYMENT.KEY=VALUE`
        #[arg(value_name = "OVERRIDE")]
        overrides: Vec<String>,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
}

pub async fn handle_command(command: DeployCommand) -> Result<()> {
    match command {
        DeployCommand::Plan {
            cluster,
            overrides,
            json,
        } => plan(cluster, &overrides, json),
    }
}

fn plan(cluster: PathBuf, overrides: &[String], json: bool) -> Result<()> {
    let morph = MorphologyParser::load_from_file(&cluster)?;
    let deployments = plan_deployments(&morph, overrides)
        .with_context(|| format!("Failed to plan deployments for {}", cluster.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&deployments)?);
        return Ok(());
    }

    for deployment in &deployments {
        println!(
            "{} {} → {}",
            deployment.name.bold(),
            format!("[{}]", deployment.deployment_type).cyan(),
            deployment.location
        );
        println!("  System: {}", deployment.system);
        for (key, value) in &deployment.env {
            println!("  {}={}", key, value);
        }
    }
    Ok(())
}
