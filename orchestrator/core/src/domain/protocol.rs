// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Build Protocol
//!
//! Typed messages exchanged between build clients, the coordinator and
//! workers. A [`Message`] is a message type plus a set of named fields; the
//! set of fields is fixed per type and checked when the message is built.
//!
//! # Message Types
//!
//! | Type | Required | Optional |
//! |------|----------|----------|
//! | `build-request` | id, repo, ref, morphology | original_ref |
//! | `build-progress` | id, message | |
//! | `build-steps` | id, steps | |
//! | `step-started` | id, step_name, worker_name | |
//! | `step-already-started` | id, step_name, worker_name | |
//! | `step-output` | id, step_name, stdout, stderr | |
//! | `step-finished` | id, step_name | |
//! | `step-failed` | id, step_name | |
//! | `build-finished` | id, urls | |
//! | `build-failed` | id, reason | |
//! | `exec-request` | id, argv, stdin_contents | |
//! | `exec-cancel` | id | |
//! | `http-request` | id, url, method, headers, body | |
//!
//! On the wire a message is a JSON object holding its fields plus a `type`
//! field naming the message type. `build-finished.urls` maps the name of each
//! requested artifact to its retrieval location.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

// ============================================================================
// Message Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    BuildRequest,
    BuildProgress,
    BuildSteps,
    StepStarted,
    StepAlreadyStarted,
    StepOutput,
    StepFinished,
    StepFailed,
    BuildFinished,
    BuildFailed,
    ExecRequest,
    ExecCancel,
    HttpRequest,
}

impl MessageType {
    pub const ALL: [MessageType; 13] = [
        MessageType::BuildRequest,
        MessageType::BuildProgress,
        MessageType::BuildSteps,
        MessageType::StepStarted,
        MessageType::StepAlreadyStarted,
        MessageType::StepOutput,
        MessageType::StepFinished,
        MessageType::StepFailed,
        MessageType::BuildFinished,
        MessageType::BuildFailed,
        MessageType::ExecRequest,
        MessageType::ExecCancel,
        MessageType::HttpRequest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::BuildRequest => "build-request",
            MessageType::BuildProgress => "build-progress",
            MessageType::BuildSteps => "build-steps",
            MessageType::StepStarted => "step-started",
            MessageType::StepAlreadyStarted => "step-already-started",
            MessageType::StepOutput => "step-output",
            MessageType::StepFinished => "step-finished",
            MessageType::StepFailed => "step-failed",
            MessageType::BuildFinished => "build-finished",
            MessageType::BuildFailed => "build-failed",
            MessageType::ExecRequest => "exec-request",
            MessageType::ExecCancel => "exec-cancel",
            MessageType::HttpRequest => "http-request",
        }
    }

    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            MessageType::BuildRequest => &["id", "repo", "ref", "morphology"],
            MessageType::BuildProgress => &["id", "message"],
            MessageType::BuildSteps => &["id", "steps"],
            MessageType::StepStarted | MessageType::StepAlreadyStarted => &["id", "step_name", "worker_name"],
            MessageType::StepFinished | MessageType::StepFailed => &["id", "step_name"],
            MessageType::StepOutput => &["id", "step_name", "stdout", "stderr"],
            MessageType::BuildFinished => &["id", "urls"],
            MessageType::BuildFailed => &["id", "reason"],
            MessageType::ExecRequest => &["id", "argv", "stdin_contents"],
            MessageType::ExecCancel => &["id"],
            MessageType::HttpRequest => &["id", "url", "method", "headers", "body"],
        }
    }

    pub fn optional_fields(&self) -> &'static [&'static str] {
        match self {
            MessageType::BuildRequest => &["original_ref"],
            _ => &[],
        }
    }

    pub fn allows(&self, field: &str) -> bool {
        self.required_fields().contains(&field) || self.optional_fields().contains(&field)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownType(s.to_string()))
    }
}

// ============================================================================
// Message
// ============================================================================

/// An immutable, validated protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct Message {
    message_type: MessageType,
    fields: BTreeMap<String, Value>,
}

impl Message {
    /// Builds a message, checking that every required field is present and
    /// no field outside the type's required/optional sets is given
    pub fn new<I, K>(message_type: MessageType, fields: I) -> Result<Self, ProtocolError>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let fields: BTreeMap<String, Value> =
            fields.into_iter().map(|(k, v)| (k.into(), v)).collect();

        if let Some(field) = fields.keys().find(|f| !message_type.allows(f)) {
            return Err(ProtocolError::FieldNotAllowed {
                message_type,
                field: field.clone(),
            });
        }
        if let Some(field) = message_type
            .required_fields()
            .iter()
            .find(|f| !fields.contains_key(**f))
        {
            return Err(ProtocolError::MissingField {
                message_type,
                field: field.to_string(),
            });
        }

        Ok(Self {
            message_type,
            fields,
        })
    }

    /// Assembles a message whose field set is fixed by the caller
    fn assemble<const N: usize>(message_type: MessageType, fields: [(&str, Value); N]) -> Self {
        let fields: BTreeMap<String, Value> = fields
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        debug_assert!(fields.keys().all(|f| message_type.allows(f)));
        debug_assert!(message_type
            .required_fields()
            .iter()
            .all(|f| fields.contains_key(*f)));
        Self {
            message_type,
            fields,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    /// Required string field; a non-string value is a protocol error
    pub fn require_str(&self, field: &str) -> Result<&str, ProtocolError> {
        match self.fields.get(field) {
            Some(Value::String(s)) => Ok(s),
            Some(other) => Err(ProtocolError::InvalidFieldType {
                message_type: self.message_type,
                field: field.to_string(),
                expected: "string",
                actual: json_type_name(other),
            }),
            None => Err(ProtocolError::MissingField {
                message_type: self.message_type,
                field: field.to_string(),
            }),
        }
    }

    /// The `id` field, which every message type carries
    pub fn id(&self) -> Option<&str> {
        self.get_str("id")
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.clone().into())
    }

    pub fn from_json(value: Value) -> Result<Self, ProtocolError> {
        match value {
            Value::Object(map) => Self::try_from(map),
            _ => Err(ProtocolError::NotAnObject),
        }
    }

    // ------------------------------------------------------------------------
    // Constructors for coordinator and worker traffic
    // ------------------------------------------------------------------------

    pub fn build_request(
        id: &str,
        repo: &str,
        git_ref: &str,
        morphology: &str,
        original_ref: Option<&str>,
    ) -> Self {
        let mut message = Self::assemble(
            MessageType::BuildRequest,
            [
                ("id", Value::from(id)),
                ("repo", Value::from(repo)),
                ("ref", Value::from(git_ref)),
                ("morphology", Value::from(morphology)),
            ],
        );
        if let Some(original) = original_ref {
            message
                .fields
                .insert("original_ref".to_string(), Value::from(original));
        }
        message
    }

    pub fn build_progress(id: &str, text: &str) -> Self {
        Self::assemble(
            MessageType::BuildProgress,
            [("id", Value::from(id)), ("message", Value::from(text))],
        )
    }

    pub fn build_steps(id: &str, steps: Value) -> Self {
        Self::assemble(MessageType::BuildSteps, [("id", Value::from(id)), ("steps", steps)])
    }

    pub fn step_started(id: &str, step_name: &str, worker_name: &str) -> Self {
        Self::step_announcement(MessageType::StepStarted, id, step_name, worker_name)
    }

    /// Sent instead of `step-started` when the step was already running
    pub fn step_already_started(id: &str, step_name: &str, worker_name: &str) -> Self {
        Self::step_announcement(MessageType::StepAlreadyStarted, id, step_name, worker_name)
    }

    fn step_announcement(message_type: MessageType, id: &str, step_name: &str, worker_name: &str) -> Self {
        Self::assemble(
            message_type,
            [
                ("id", Value::from(id)),
                ("step_name", Value::from(step_name)),
                ("worker_name", Value::from(worker_name)),
            ],
        )
    }

    pub fn step_output(id: &str, step_name: &str, stdout: &str, stderr: &str) -> Self {
        Self::assemble(
            MessageType::StepOutput,
            [
                ("id", Value::from(id)),
                ("step_name", Value::from(step_name)),
                ("stdout", Value::from(stdout)),
                ("stderr", Value::from(stderr)),
            ],
        )
    }

    pub fn step_finished(id: &str, step_name: &str) -> Self {
        Self::assemble(
            MessageType::StepFinished,
            [("id", Value::from(id)), ("step_name", Value::from(step_name))],
        )
    }

    pub fn step_failed(id: &str, step_name: &str) -> Self {
        Self::assemble(
            MessageType::StepFailed,
            [("id", Value::from(id)), ("step_name", Value::from(step_name))],
        )
    }

    /// `urls` maps each requested artifact name to its retrieval location
    pub fn build_finished(id: &str, urls: BTreeMap<String, String>) -> Self {
        let urls: Map<String, Value> = urls.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
        Self::assemble(
            MessageType::BuildFinished,
            [("id", Value::from(id)), ("urls", Value::Object(urls))],
        )
    }

    pub fn build_failed(id: &str, reason: &str) -> Self {
        Self::assemble(
            MessageType::BuildFailed,
            [("id", Value::from(id)), ("reason", Value::from(reason))],
        )
    }

    pub fn exec_request(id: &str, argv: &[String], stdin_contents: &str) -> Self {
        Self::assemble(
            MessageType::ExecRequest,
            [
                ("id", Value::from(id)),
                ("argv", Value::from(argv.to_vec())),
                ("stdin_contents", Value::from(stdin_contents)),
            ],
        )
    }

    pub fn exec_cancel(id: &str) -> Self {
        Self::assemble(MessageType::ExecCancel, [("id", Value::from(id))])
    }
}

impl TryFrom<Map<String, Value>> for Message {
    type Error = ProtocolError;

    fn try_from(mut map: Map<String, Value>) -> Result<Self, Self::Error> {
        let message_type = match map.remove("type") {
            Some(Value::String(t)) => t.parse::<MessageType>()?,
            Some(other) => return Err(ProtocolError::UnknownType(other.to_string())),
            None => return Err(ProtocolError::MissingType),
        };
        Self::new(message_type, map)
    }
}

impl From<Message> for Map<String, Value> {
    fn from(message: Message) -> Self {
        let mut map: Map<String, Value> = message.fields.into_iter().collect();
        map.insert(
            "type".to_string(),
            Value::String(message.message_type.as_str().to_string()),
        );
        map
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Message has no type field")]
    MissingType,

    #[error("Message is not a JSON object")]
    NotAnObject,

    #[error("{message_type} message is missing required field {field}")]
    MissingField {
        message_type: MessageType,
        field: String,
    },

    #[error("Field {field} is not allowed in {message_type} message")]
    FieldNotAllowed {
        message_type: MessageType,
        field: String,
    },

    #[error("Field {field} of {message_type} message should be {expected}, got {actual}")]
    InvalidFieldType {
        message_type: MessageType,
        field: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Connection error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        ProtocolError::Io(err.to_string())
    }
}
