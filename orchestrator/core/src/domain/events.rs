// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::protocol::{Message, MessageType};
use crate::domain::session::SessionId;

/// A protocol message published to clients watching a build session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildEvent {
    pub session_id: SessionId,
    pub message: Message,
    pub emitted_at: DateTime<Utc>,
}

impl BuildEvent {
    pub fn new(session_id: SessionId, message: Message) -> Self {
        Self {
            session_id,
            message,
            emitted_at: Utc::now(),
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message.message_type()
    }

    /// `build-finished` or `build-failed`
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.message.message_type(),
            MessageType::BuildFinished | MessageType::BuildFailed
        )
    }
}
