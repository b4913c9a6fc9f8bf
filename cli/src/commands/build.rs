// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Build command
//!
//! Builds a morphology with the local worker pool, or hands the request to
//! a running controller with `--controller`. Ctrl+C cancels the build.

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::info;

use morph_core::domain::node_config::NodeConfigManifest;
use morph_core::domain::protocol::{Message, MessageType};
use morph_core::domain::session::{BuildState, SessionId};

use super::serve::shutdown_signal;
use super::MorphologyTarget;
use crate::controller::ControllerClient;
use crate::services::BuildServices;

#[derive(Args)]
pub struct BuildArgs {
    #[command(flatten)]
    pub target: MorphologyTarget,

    /// Send the build to a controller at this address instead of building locally
    #[arg(long, env = "MORPH_CONTROLLER")]
    pub controller: Option<String>,

    /// Stop scheduling new steps after the first failure
    #[arg(long)]
    pub no_keep_going: bool,

    /// Show the output of build commands
    #[arg(short, long)]
    pub verbose: bool,
}

pub async fn execute(args: BuildArgs, config_override: Option<PathBuf>) -> Result<()> {
    match args.controller.clone() {
        Some(addr) => build_remote(args, &addr).await,
        None => build_local(args, config_override).await,
    }
}

async fn build_local(args: BuildArgs, config_override: Option<PathBuf>) -> Result<()> {
    let mut config = NodeConfigManifest::load_or_default(config_override)?;
    if args.no_keep_going {
        config.spec.build.keep_going = false;
    }
    let services = BuildServices::from_config(config)?;
    let coordinator = services.coordinator.clone();

    let handle = coordinator.submit(args.target.request());
    let id = handle.id();
    info!(session_id = %id, "Submitted build");
    let (mut events, mut outcome) = handle.into_parts();
    let mut printer = ProgressPrinter::new(args.verbose);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut cancelling = false;

    let outcome = loop {
        tokio::select! {
            biased;
            event = events.recv() => {
                let event = event.context("Lost build events")?;
                printer.print(&event.message);
            }
            result = &mut outcome => break result.context("Build session ended unexpectedly")?,
            _ = &mut shutdown, if !cancelling => {
                cancelling = true;
                println!("{}", "Cancelling build...".yellow());
                coordinator.cancel(id).await?;
            }
        }
    };

    match outcome.state() {
        BuildState::Finished => Ok(()),
        BuildState::Cancelled => bail!("Build cancelled"),
        _ => bail!(
            "Build failed: {}",
            outcome.session.failure().unwrap_or("unknown error")
        ),
    }
}

async fn build_remote(args: BuildArgs, addr: &str) -> Result<()> {
    let mut client = ControllerClient::connect(addr).await?;
    let id = SessionId::new().to_string();
    client.send(args.target.request().to_message(&id)).await?;
    info!(session_id = %id, controller = %addr, "Submitted build");

    let mut printer = ProgressPrinter::new(args.verbose);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut cancelling = false;

    loop {
        tokio::select! {
            message = client.next() => {
                let message = message?;
                printer.print(&message);
                match message.message_type() {
                    MessageType::BuildFinished => return Ok(()),
                    MessageType::BuildFailed => bail!(
                        "Build failed: {}",
                        message.get_str("reason").unwrap_or("unknown error")
                    ),
                    MessageType::BuildProgress if cancelling => bail!("Build cancelled"),
                    _ => {}
                }
            }
            _ = &mut shutdown, if !cancelling => {
                cancelling = true;
                println!("{}", "Cancelling build...".yellow());
                client.send(Message::exec_cancel(&id)).await?;
            }
        }
    }
}

/// Renders build messages for a terminal
pub struct ProgressPrinter {
    verbose: bool,
    names: HashMap<String, String>,
}

impl ProgressPrinter {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            names: HashMap::new(),
        }
    }

    fn step_name<'a>(&'a self, message: &'a Message) -> &'a str {
        let fingerprint = message.get_str("step_name").unwrap_or("?");
        self.names
            .get(fingerprint)
            .map(String::as_str)
            .unwrap_or(fingerprint)
    }

    pub fn print(&mut self, message: &Message) {
        match message.message_type() {
            MessageType::BuildProgress => {
                println!("{}", message.get_str("message").unwrap_or_default().dimmed());
            }
            MessageType::BuildSteps => {
                let steps = message
                    .get("steps")
                    .and_then(|s| s.as_array())
                    .cloned()
                    .unwrap_or_default();
                for step in &steps {
                    if let (Some(fp), Some(name)) = (
                        step.get("fingerprint").and_then(|v| v.as_str()),
                        step.get("name").and_then(|v| v.as_str()),
                    ) {
                        self.names.insert(fp.to_string(), name.to_string());
                    }
                }
                println!("{}", format!("{} steps to build", steps.len()).bold());
            }
            MessageType::StepStarted => {
                println!("{} {}", "▶".cyan(), self.step_name(message));
            }
            MessageType::StepOutput if self.verbose => {
                let name = self.step_name(message);
                let text = [
                    message.get_str("stdout").unwrap_or_default(),
                    message.get_str("stderr").unwrap_or_default(),
                ]
                .concat();
                for line in text.lines() {
                    println!("  {} {}", format!("[{}]", name).dimmed(), line);
                }
            }
            MessageType::StepFinished => {
                println!("{} {}", "✓".green(), self.step_name(message));
            }
            MessageType::StepFailed => {
                println!("{} {}", "✗".red(), self.step_name(message));
            }
            MessageType::BuildFinished => {
                println!("{}", "✓ Build finished".green().bold());
                if let Some(urls) = message.get("urls").and_then(|u| u.as_object()) {
                    for (name, url) in urls {
                        println!("  {} {}", name.bold(), url.as_str().unwrap_or_default());
                    }
                }
            }
            MessageType::BuildFailed => {
                println!(
                    "{} {}",
                    "✗ Build failed:".red().bold(),
                    message.get_str("reason").unwrap_or_default()
                );
            }
            _ => {}
        }
    }
}
