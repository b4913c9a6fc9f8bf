// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Build graph inspection

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;

use morph_core::domain::node_config::NodeConfigManifest;

use super::MorphologyTarget;
use crate::services::BuildServices;

#[derive(Args)]
pub struct GraphArgs {
    #[command(flatten)]
    pub target: MorphologyTarget,

    /// Print the graph as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: GraphArgs, config_override: Option<PathBuf>) -> Result<()> {
    let config = NodeConfigManifest::load_or_default(config_override)?;
    let services = BuildServices::from_config(config)?;
    let graph = services.loader.resolve(&args.target.reference()).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&graph)?);
        return Ok(());
    }

    println!(
        "{}",
        format!("{} steps for {}", graph.len(), args.target.reference()).bold()
    );
    for fp in graph.topological_order() {
        let Some(node) = graph.node(fp) else {
            continue;
        };
        let cached = if services.cache.has_local(fp) {
            "cached".green()
        } else {
            "".normal()
        };
        println!(
            "  {} {:<8} {} {} {}",
            fp.short().dimmed(),
            node.kind.as_str(),
            node.name.bold(),
            format!("({})", node.build_mode.as_str()).dimmed(),
            cached
        );
        for dep in &node.dependencies {
            if let Some(dep) = graph.node(dep) {
                println!("      ← {}", dep.name);
            }
        }
    }
    Ok(())
}
