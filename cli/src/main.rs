// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # morph
//!
//! Resolves morphologies into build graphs and builds them, either with a
//! local worker pool or through a build controller.
//!
//! ## Commands
//!
//! - `morph morphology validate|normalize` - Check and canonicalize morphology files
//! - `morph graph` - Show the resolved build graph of a morphology
//! - `morph build` - Build a morphology locally or via `--controller`
//! - `morph serve` - Run a build controller speaking the wire protocol
//! - `morph deploy plan` - Show the deployments of a cluster
//! - `morph config show|validate|generate` - Configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use morph_orchestrator::commands::{
    self, BuildArgs, ConfigCommand, DeployCommand, GraphArgs, MorphologyCommand, ServeArgs,
};

/// morph - build software systems from morphologies
#[derive(Parser)]
#[command(name = "morph")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "MORPH_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "MORPH_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Morphology file operations
    #[command(name = "morphology")]
    Morphology {
        #[command(subcommand)]
        command: MorphologyCommand,
    },

    /// Show the build graph of a morphology
    #[command(name = "graph")]
    Graph(GraphArgs),

    /// Build a morphology
    #[command(name = "build")]
    Build(BuildArgs),

    /// Run a build controller
    #[command(name = "serve")]
    Serve(ServeArgs),

    /// Cluster deployment
    #[command(name = "deploy")]
    Deploy {
        #[command(subcommand)]
        command: DeployCommand,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(&cli.log_level)?;

    match cli.command {
        Some(Commands::Morphology { command }) => commands::morphology::handle_command(command).await,
        Some(Commands::Graph(args)) => commands::graph::execute(args, cli.config).await,
        Some(Commands::Build(args)) => commands::build::execute(args, cli.config).await,
        Some(Commands::Serve(args)) => commands::serve::execute(args, cli.config).await,
        Some(Commands::Deploy { command }) => commands::deploy::handle_command(command).await,
        Some(Commands::Config { command }) => {
            commands::config::handle_command(command, cli.config).await
        }
        None => {
            // No command provided - show help
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    Ok(())
}
