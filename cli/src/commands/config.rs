// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use morph_core::domain::node_config::NodeConfigManifest;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Write the default configuration
    Generate {
        /// Output path
        #[arg(short, long, default_value = "./morph-config.yaml")]
        output: PathBuf,
    },
}

pub async fn handle_command(
    command: ConfigCommand,
    config_override: Option<PathBuf>,
) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths),
        ConfigCommand::Validate { file } => validate(file.or(config_override)),
        ConfigCommand::Generate { output } => generate(output),
    }
}

fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = NodeConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. MORPH_CONFIG_PATH: {}",
            std::env::var("MORPH_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./morph-config.yaml");
        println!("  4. ~/.morph/config.yaml");
        println!("  5. /etc/morph/config.yaml");
        println!();
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!();
    println!("{}", "Node:".bold());
    println!("  Name: {}", config.metadata.name);
    println!();

    println!("{}", "Artifact cache:".bold());
    println!("  Directory: {}", spec.cache.dir.display());
    println!(
        "  Remote: {}",
        spec.cache.remote_url.as_deref().unwrap_or("(none)")
    );
    println!();

    println!("{}", "Workers:".bold());
    println!(
        "  {} × {} slot(s), named {}-N",
        spec.workers.count, spec.workers.slots, spec.workers.name_prefix
    );
    println!();

    println!("{}", "Build:".bold());
    println!("  Max jobs: {}", spec.build.max_jobs);
    println!("  Temp dir: {}", spec.build.tempdir.display());
    println!("  Keep going: {}", spec.build.keep_going);
    println!();

    println!("{}", "Repositories:".bold());
    println!("  Clones: {}", spec.repositories.base_dir.display());
    for (alias, pattern) in &spec.repositories.aliases {
        println!("  {}: → {}", alias, pattern);
    }
    println!();

    Ok(())
}

fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = NodeConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

fn generate(output: PathBuf) -> Result<()> {
    NodeConfigManifest::default()
        .to_yaml_file(&output)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}
