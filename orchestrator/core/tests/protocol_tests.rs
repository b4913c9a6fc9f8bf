// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use futures::StreamExt;
use serde_json::json;
use tokio::io::AsyncWriteExt;

use morph_core::domain::protocol::{Message, MessageType, ProtocolError};
use morph_core::domain::session::{BuildRequest, SessionId};
use morph_core::infrastructure::wire::framed;

/// Writes raw lines from a peer and returns the decoded stream of the other end
async fn decode_lines(lines: &[&str]) -> Vec<Result<Message, ProtocolError>> {
    let (mut peer, local) = tokio::io::duplex(64 * 1024);
    for line in lines {
        peer.write_all(line.as_bytes()).await.unwrap();
        peer.write_all(b"\n").await.unwrap();
    }
    drop(peer);
    framed(local).collect().await
}

#[tokio::test]
async fn test_peer_lines_decode_in_order() {
    let decoded = decode_lines(&[
        r#"{"type":"build-request","id":"a1","repo":"defs","ref":"master","morphology":"systems/base"}"#,
        "",
        r#"{"type":"build-progress","id":"a1","message":"Resolving build graph"}"#,
        r#"{"type":"step-output","id":"a1","step_name":"f00d","stdout":"ok\n","stderr":""}"#,
    ])
    .await;

    let types: Vec<MessageType> = decoded
        .iter()
        .map(|m| m.as_ref().unwrap().message_type())
        .collect();
    assert_eq!(
        types,
        vec![
            MessageType::BuildRequest,
            MessageType::BuildProgress,
            MessageType::StepOutput
        ]
    );
    assert_eq!(decoded[2].as_ref().unwrap().get("worker_name"), None);
}

#[tokio::test]
async fn test_fields_outside_the_table_are_rejected() {
    let decoded = decode_lines(&[
        r#"{"type":"build-request","id":"a1","repo":"defs","ref":"master","morphology":"systems/base","protocol_version":1}"#,
        r#"{"type":"step-finished","id":"a1","step_name":"f00d","worker_name":"w1"}"#,
        r#"{"type":"step-failed","id":"a1","step_name":"f00d"}"#,
    ])
    .await;
    assert!(matches!(
        &decoded[0],
        Err(ProtocolError::FieldNotAllowed { field, .. }) if field == "protocol_version"
    ));
    assert!(matches!(
        &decoded[1],
        Err(ProtocolError::FieldNotAllowed { field, .. }) if field == "worker_name"
    ));
    assert_eq!(decoded[2].as_ref().unwrap().message_type(), MessageType::StepFailed);
}

#[tokio::test]
async fn test_missing_field_is_rejected() {
    let decoded = decode_lines(&[r#"{"type":"build-failed","id":"a1"}"#]).await;
    assert!(matches!(
        &decoded[0],
        Err(ProtocolError::MissingField { field, .. }) if field == "reason"
    ));
}

#[test]
fn test_build_request_survives_json() {
    let id = SessionId::new().to_string();
    let request = BuildRequest::new("defs", "master", "systems/base");
    let message = request.to_message(&id);

    let value = message.to_json();
    assert_eq!(value["type"], json!("build-request"));
    assert_eq!(value["id"], json!(id));

    let parsed = Message::from_json(value).unwrap();
    assert_eq!(BuildRequest::from_message(&parsed).unwrap(), request);
}
