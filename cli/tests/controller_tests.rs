// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use morph_core::domain::node_config::NodeConfigManifest;
use morph_core::domain::protocol::{Message, MessageType};
use morph_core::domain::session::{BuildRequest, SessionId};
use morph_core::infrastructure::InMemoryRepositoryService;
use morph_orchestrator::controller::{serve, ControllerClient};
use morph_orchestrator::services::BuildServices;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

fn definitions() -> Arc<InMemoryRepositoryService> {
    let repos = InMemoryRepositoryService::new();
    repos.add_file("defs", "master", "strata/hello.morph",
        "name: hello\nkind: stratum\nchunks:\n  - name: greeting\n    morph: strata/hello/greeting\n    repo: upstream:hello\n    ref: master\n    build-mode: bootstrap\n");
    repos.add_file("defs", "master", "strata/hello/greeting.morph",
        "name: greeting\nkind: chunk\ninstall-commands:\n  - mkdir -p \"$DESTDIR/etc\" && echo hello > \"$DESTDIR/etc/greeting\"\n");
    repos.add_file("defs", "master", "strata/hello/broken.morph",
        "name: broken\nkind: chunk\nbuild-commands: ['echo no compiler >&2; exit 1']\n");
    repos.add_file("defs", "master", "strata/broken.morph",
        "name: broken\nkind: stratum\nchunks:\n  - name: broken\n    morph: strata/hello/broken\n    repo: upstream:hello\n    ref: master\n    build-mode: bootstrap\n");
    // Chunk sources are exported into each build directory
    repos.add_file("upstream:hello", "master", "README", "hello\n");
    Arc::new(repos)
}

struct Controller {
    _dir: tempfile::TempDir,
    addr: String,
    stop: Option<oneshot::Sender<()>>,
}

impl Drop for Controller {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

async fn start_controller() -> Controller {
    let dir = tempfile::tempdir().unwrap();
    let mut config = NodeConfigManifest::default();
    config.spec.cache.dir = dir.path().join("cache");
    config.spec.build.tempdir = dir.path().join("tmp");
    config.spec.workers.slots = 2;
    let services = BuildServices::with_repositories(config, definitions()).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(serve(services.coordinator.clone(), listener, async {
        let _ = stopped.await;
    }));

    Controller {
        _dir: dir,
        addr,
        stop: Some(stop),
    }
}

async fn until_terminal(client: &mut ControllerClient) -> Vec<Message> {
    let mut messages = Vec::new();
    loop {
        let message = tokio::time::timeout(Duration::from_secs(30), client.next())
            .await
            .unwrap()
            .unwrap();
        let terminal = matches!(
            message.message_type(),
            MessageType::BuildFinished | MessageType::BuildFailed
        );
        messages.push(message);
        if terminal {
            return messages;
        }
    }
}

#[tokio::test]
async fn test_remote_build_streams_events() {
    let controller = start_controller().await;
    let mut client = ControllerClient::connect(&controller.addr).await.unwrap();

    // Clients pick their own ids; they need not be session ids
    client
        .send(BuildRequest::new("defs", "master", "strata/hello").to_message("hello-1"))
        .await
        .unwrap();
    let messages = until_terminal(&mut client).await;

    assert!(messages.iter().all(|m| m.id() == Some("hello-1")));
    assert_eq!(messages[0].message_type(), MessageType::BuildProgress);
    assert!(messages.iter().any(|m| m.message_type() == MessageType::BuildSteps));
    let step_finished = messages
        .iter()
        .find(|m| m.message_type() == MessageType::StepFinished)
        .unwrap();
    assert_eq!(step_finished.get("worker_name"), None);
    let finished = messages.last().unwrap();
    assert_eq!(finished.message_type(), MessageType::BuildFinished);
    let urls = finished.get("urls").unwrap().as_object().unwrap();
    assert_eq!(urls.len(), 1);
    assert!(urls["hello"].as_str().unwrap().starts_with("file://"));
}

#[tokio::test]
async fn test_remote_build_failure_carries_reason() {
    let controller = start_controller().await;
    let mut client = ControllerClient::connect(&controller.addr).await.unwrap();

    let id = SessionId::new().to_string();
    client
        .send(BuildRequest::new("defs", "master", "strata/broken").to_message(&id))
        .await
        .unwrap();
    let messages = until_terminal(&mut client).await;

    let failed = messages.last().unwrap();
    assert_eq!(failed.message_type(), MessageType::BuildFailed);
    assert!(failed.get_str("reason").unwrap().contains("exited with status 1"));
}

#[tokio::test]
async fn test_rejected_request_is_answered() {
    let controller = start_controller().await;
    let mut client = ControllerClient::connect(&controller.addr).await.unwrap();

    // Valid on the wire, but names a session that does not exist
    let id = SessionId::new().to_string();
    client.send(Message::exec_cancel(&id)).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(10), client.next())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(reply.message_type(), MessageType::BuildFailed);
    assert!(reply.get_str("reason").unwrap().contains("Unknown session"));
}
