// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Run the build controller

use anyhow::{Context, Result};
use clap::Args;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

use morph_core::domain::node_config::NodeConfigManifest;

use crate::controller;
use crate::services::BuildServices;

#[derive(Args)]
pub struct ServeArgs {
    /// Address to accept client connections on
    #[arg(long, env = "MORPH_LISTEN", default_value = "127.0.0.1:7878")]
    pub listen: String,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "MORPH_METRICS_LISTEN")]
    pub metrics_listen: Option<SocketAddr>,
}

pub async fn execute(args: ServeArgs, config_override: Option<PathBuf>) -> Result<()> {
    let config = NodeConfigManifest::load_or_default(config_override)?;
    let services = BuildServices::from_config(config)?;

    if let Some(addr) = args.metrics_listen {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to start metrics exporter")?;
        info!("Metrics available on http://{}/metrics", addr);
    }

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", args.listen))?;
    info!("Controller listening on {}", args.listen);

    controller::serve(services.coordinator.clone(), listener, shutdown_signal()).await
}

pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
