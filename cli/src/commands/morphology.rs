// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Morphology file commands
//!
//! Commands: validate, normalize

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use morph_core::infrastructure::MorphologyParser;

#[derive(Subcommand)]
pub enum MorphologyCommand {
    /// Check morphology files against the document rules
    Validate {
        #[arg(value_name = "FILE", required = true)]
        files: Vec<PathBuf>,
    },

    /// Print a morphology in canonical form, without default values
    Normalize {
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Rewrite the file instead of printing
        #[arg(long)]
        in_place: bool,
    },
}

pub async fn handle_command(command: MorphologyCommand) -> Result<()> {
    match command {
        MorphologyCommand::Validate { files } => validate(&files),
        MorphologyCommand::Normalize { file, in_place } => normalize(file, in_place),
    }
}

fn validate(files: &[PathBuf]) -> Result<()> {
    let mut failed = 0usize;
    for file in files {
        match MorphologyParser::load_from_file(file) {
            Ok(morph) => println!(
                "{} {} ({} {})",
                "✓".green(),
                file.display(),
                morph.kind_str().unwrap_or("?"),
                morph.name().unwrap_or("?")
            ),
            Err(e) => {
                failed += 1;
                println!("{} {}", "✗".red(), e);
            }
        }
    }
    if failed > 0 {
        bail!("{} of {} morphologies are invalid", failed, files.len());
    }
    Ok(())
}

fn normalize(file: PathBuf, in_place: bool) -> Result<()> {
    let morph = MorphologyParser::load_from_file(&file)?;
    if in_place {
        MorphologyParser::save_to_file(&morph, &file)
            .with_context(|| format!("Failed to write {:?}", file))?;
        println!("{}", format!("✓ Normalized {}", file.display()).green());
    } else {
        print!("{}", MorphologyParser::save_to_string(&morph)?);
    }
    Ok(())
}
