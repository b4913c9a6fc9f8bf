// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Build controller
//!
//! Serves the build protocol over TCP: each connection sends
//! `build-request` or `exec-cancel` messages and receives the events of
//! the sessions it started, one JSON message per line.

use std::future::Future;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use morph_core::application::{BuildCoordinator, BuildHandle};
use morph_core::domain::protocol::Message;
use morph_core::infrastructure::wire::{framed, MessageCodec};

/// Accepts connections until `shutdown` resolves
pub async fn serve(
    coordinator: Arc<BuildCoordinator>,
    listener: TcpListener,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("Failed to accept connection")?;
                debug!(peer = %peer, "Client connected");
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(coordinator, stream).await {
                        warn!(peer = %peer, error = %e, "Client connection failed");
                    }
                });
            }
            _ = &mut shutdown => {
                info!("Controller shutting down");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(coordinator: Arc<BuildCoordinator>, stream: TcpStream) -> Result<()> {
    let (mut sink, mut source) = framed(stream).split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if let Err(e) = sink.send(message).await {
                warn!(error = %e, "Failed to write to client");
                break;
            }
        }
    });

    while let Some(frame) = source.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Rejected client message, closing connection");
                break;
            }
        };
        match coordinator.handle_client_message(&message).await {
            Ok(Some(handle)) => {
                info!(session_id = %handle.id(), build_id = %handle.build_id(), "Accepted build request");
                tokio::spawn(forward_events(handle, out_tx.clone()));
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Client request failed");
                if let Some(id) = message.id() {
                    let _ = out_tx.send(Message::build_failed(id, &format!("{:#}", e))).await;
                }
            }
        }
    }

    // Sessions keep running when their client goes away
    drop(out_tx);
    writer.await.context("Client writer task failed")?;
    Ok(())
}

async fn forward_events(handle: BuildHandle, out: mpsc::Sender<Message>) {
    let (mut events, mut outcome) = handle.into_parts();
    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Ok(event) => {
                    let terminal = event.is_terminal();
                    if out.send(event.message).await.is_err() || terminal {
                        return;
                    }
                }
                Err(e) => {
                    warn!(session_id = %events.session_id(), error = %e, "Stopped forwarding events");
                    return;
                }
            },
            // Every event was published before the outcome was sent
            _ = &mut outcome => return,
        }
    }
}

/// Client side of the controller protocol
pub struct ControllerClient {
    framed: Framed<TcpStream, MessageCodec>,
}

impl ControllerClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .context("Failed to connect to build controller")?;
        Ok(Self {
            framed: framed(stream),
        })
    }

    pub async fn send(&mut self, message: Message) -> Result<()> {
        self.framed
            .send(message)
            .await
            .context("Failed to send message to controller")
    }

    /// Next message from the controller; errors if the connection closed
    pub async fn next(&mut self) -> Result<Message> {
        match self.framed.next().await {
            Some(message) => message.context("Invalid message from controller"),
            None => bail!("Build controller closed the connection"),
        }
    }
}
