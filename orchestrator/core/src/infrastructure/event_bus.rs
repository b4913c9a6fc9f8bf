// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
// Event Bus Implementation - Pub/Sub for Build Events
//
// Provides in-memory event streaming using tokio broadcast channels.
// Every protocol message the coordinator emits for a session is published
// here; clients watch one session through a filtered receiver.
//
// In-memory only: events published before a receiver subscribes are not
// replayed to it.

use crate::domain::events::BuildEvent;
use crate::domain::session::SessionId;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Event bus for publishing and subscribing to build events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<BuildEvent>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity
    /// Capacity determines how many events can be buffered before slow
    /// receivers start dropping old ones
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    /// Publish a build event to all subscribers
    pub fn publish(&self, event: BuildEvent) {
        debug!(
            session_id = %event.session_id,
            message_type = %event.message_type(),
            "Publishing build event"
        );

        // send() fails only when nobody is listening
        if self.sender.send(event).is_err() {
            debug!("No subscribers listening to event");
        }
    }

    /// Subscribe to the events of every session
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe and filter for one session
    pub fn subscribe_session(&self, session_id: SessionId) -> SessionEventReceiver {
        SessionEventReceiver {
            receiver: self.sender.subscribe(),
            session_id,
        }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

/// Receiver for all build events
pub struct EventReceiver {
    receiver: broadcast::Receiver<BuildEvent>,
}

impl EventReceiver {
    /// Receive the next event (waits until one is available)
    pub async fn recv(&mut self) -> Result<BuildEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<BuildEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver for one session's events (filtered)
pub struct SessionEventReceiver {
    receiver: broadcast::Receiver<BuildEvent>,
    session_id: SessionId,
}

impl SessionEventReceiver {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Receive the next event of this session, skipping other sessions
    pub async fn recv(&mut self) -> Result<BuildEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if event.session_id == self.session_id {
                return Ok(event);
            }
        }
    }

    /// Receive events until the session's terminal message, inclusive
    pub async fn collect_until_terminal(&mut self) -> Result<Vec<BuildEvent>, EventBusError> {
        let mut events = Vec::new();
        loop {
            let event = self.recv().await?;
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                return Ok(events);
            }
        }
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}
